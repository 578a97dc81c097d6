//! Local method: operating on the device itself.
//!
//! When the tool runs on the tablet, there is no wire protocol: flashing
//! writes partitions directly and configuration fields come from the
//! config-area block store. Host identification and the block store sit
//! behind small traits so the rest of the crate never touches the
//! platform-specific paths (and tests can fake a device).

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

use tracing::{debug, info, warn};

use crate::config::FlashConfig;
use crate::events::{FlashEvent, FlashObserver, FlashPhase};
use crate::image::Image;
use crate::protocol::constants::FLASH_CHUNK_SIZE;
use crate::protocol::ProtocolError;
use crate::types::{ConfigField, DeviceModel, ImageType};

/// Host identification source.
pub trait HostInfo {
    /// The component identification string, e.g. `RX-51`, when running on a
    /// known device.
    fn component_version(&self) -> Option<String>;
}

/// File-backed host identification (`/proc/component_version` style).
pub struct FileHostInfo {
    path: PathBuf,
}

impl FileHostInfo {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Default for FileHostInfo {
    fn default() -> Self {
        Self::new("/proc/component_version")
    }
}

impl HostInfo for FileHostInfo {
    fn component_version(&self) -> Option<String> {
        let text = std::fs::read_to_string(&self.path).ok()?;
        // The product line carries the device string.
        text.lines()
            .find_map(|line| line.strip_prefix("product"))
            .map(|v| v.trim().to_string())
            .or_else(|| Some(text.trim().to_string()).filter(|t| !t.is_empty()))
    }
}

/// Fixed host info for tests and for forcing local mode.
pub struct StaticHostInfo(pub Option<String>);

impl HostInfo for StaticHostInfo {
    fn component_version(&self) -> Option<String> {
        self.0.clone()
    }
}

/// Read/write access to configuration fields on the device.
///
/// The real store is the config-area partition; its parser is an external
/// collaborator, so this trait only models the field access the operations
/// layer needs.
pub trait FieldStore {
    fn get(&self, field: ConfigField) -> Option<String>;
    fn set(&mut self, field: ConfigField, value: &str) -> io::Result<()>;
}

/// Field store backed by one file per field under a directory.
pub struct DirFieldStore {
    root: PathBuf,
}

impl DirFieldStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl FieldStore for DirFieldStore {
    fn get(&self, field: ConfigField) -> Option<String> {
        let text = std::fs::read_to_string(self.root.join(field.as_str())).ok()?;
        Some(text.trim_end().to_string())
    }

    fn set(&mut self, field: ConfigField, value: &str) -> io::Result<()> {
        std::fs::create_dir_all(&self.root)?;
        std::fs::write(self.root.join(field.as_str()), value)
    }
}

/// In-memory field store for tests.
#[derive(Default)]
pub struct MemFieldStore(pub HashMap<ConfigField, String>);

impl FieldStore for MemFieldStore {
    fn get(&self, field: ConfigField) -> Option<String> {
        self.0.get(&field).cloned()
    }

    fn set(&mut self, field: ConfigField, value: &str) -> io::Result<()> {
        self.0.insert(field, value.to_string());
        Ok(())
    }
}

/// A connection to the device we are running on.
pub struct LocalDevice {
    model: DeviceModel,
    store: Box<dyn FieldStore>,
    /// Directory holding the writable partition nodes, named by piece type.
    root: PathBuf,
    config: FlashConfig,
}

impl LocalDevice {
    /// Detect local mode by matching the host identification string against
    /// the device registry. Returns `None` on foreign hosts (the USB path
    /// takes over).
    pub fn detect(host: &dyn HostInfo, config: &FlashConfig) -> Option<Self> {
        let component = host.component_version()?;
        let model: DeviceModel = component.trim().parse().ok()?;

        let root = config
            .local_root
            .as_deref()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/dev/disk/by-partlabel"));
        let store: Box<dyn FieldStore> = Box::new(DirFieldStore::new(root.join("config")));

        debug!(%model, root = %root.display(), "Local device detected");
        Some(Self {
            model,
            store,
            root,
            config: config.clone(),
        })
    }

    /// Build a local device from explicit parts (tests, custom layouts).
    pub fn with_parts(
        model: DeviceModel,
        store: Box<dyn FieldStore>,
        root: impl Into<PathBuf>,
        config: FlashConfig,
    ) -> Self {
        Self {
            model,
            store,
            root: root.into(),
            config,
        }
    }

    pub fn model(&self) -> DeviceModel {
        self.model
    }

    fn partition_path(&self, image_type: ImageType) -> PathBuf {
        self.root.join(image_type.as_str())
    }

    pub fn flash_image(
        &mut self,
        image: &mut Image,
        observer: &dyn FlashObserver,
    ) -> Result<(), ProtocolError> {
        let path = self.partition_path(image.image_type);
        let total = image.size();
        info!(target = %path.display(), total, "Writing image to local storage");

        if self.config.simulate {
            info!("Simulation: skipping local write");
            return Ok(());
        }

        let mut target = OpenOptions::new().write(true).create(true).open(&path)?;
        target.seek(SeekFrom::Start(0))?;

        image.seek(0)?;
        let mut written = 0u64;
        let mut buf = vec![0u8; FLASH_CHUNK_SIZE];
        loop {
            let n = image.read(&mut buf)?;
            if n == 0 {
                break;
            }
            target.write_all(&buf[..n])?;
            written += n as u64;
            observer.on_event(&FlashEvent::Progress {
                phase: FlashPhase::Flashing,
                operation: image.image_type.to_string(),
                current: written,
                total,
            });
        }
        target.flush()?;
        Ok(())
    }

    pub fn dump_image(
        &mut self,
        image_type: ImageType,
        out: &mut dyn io::Write,
        observer: &dyn FlashObserver,
    ) -> Result<u64, ProtocolError> {
        let path = self.partition_path(image_type);
        info!(source = %path.display(), "Dumping local partition");

        let mut source = File::open(&path)?;
        let total = source.metadata()?.len();

        let mut copied = 0u64;
        let mut buf = vec![0u8; FLASH_CHUNK_SIZE];
        loop {
            let n = source.read(&mut buf)?;
            if n == 0 {
                break;
            }
            out.write_all(&buf[..n])?;
            copied += n as u64;
            observer.on_event(&FlashEvent::Progress {
                phase: FlashPhase::Dumping,
                operation: image_type.to_string(),
                current: copied,
                total,
            });
        }
        Ok(copied)
    }

    pub fn get_field(&self, field: ConfigField) -> Result<String, ProtocolError> {
        self.store.get(field).ok_or_else(|| missing_field(field))
    }

    pub fn set_field(&mut self, field: ConfigField, value: &str) -> Result<(), ProtocolError> {
        if self.config.simulate {
            info!(%field, value, "Simulation: skipping local field write");
            return Ok(());
        }
        self.store.set(field, value)?;
        Ok(())
    }

    pub fn reboot(&mut self) -> Result<(), ProtocolError> {
        if self.config.simulate {
            info!("Simulation: skipping local reboot");
            return Ok(());
        }
        // Delegated to the init system; the flasher itself must not yank
        // power under a live root filesystem.
        warn!("Local reboot requested; handing off to the system");
        let status = std::process::Command::new("reboot").status()?;
        if !status.success() {
            return Err(ProtocolError::Io(io::Error::other("reboot command failed")));
        }
        Ok(())
    }
}

fn missing_field(field: ConfigField) -> ProtocolError {
    ProtocolError::Io(io::Error::new(
        io::ErrorKind::NotFound,
        format!("config field {field} not present"),
    ))
}

impl std::fmt::Debug for LocalDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalDevice")
            .field("model", &self.model)
            .field("root", &self.root)
            .finish()
    }
}
