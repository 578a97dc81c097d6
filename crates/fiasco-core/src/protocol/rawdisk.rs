//! RAW disk protocol.
//!
//! The device exports its storage as a USB mass-storage disk; flashing and
//! dumping are plain block copies against the exported device node. There
//! is no control channel in this mode.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

use tracing::info;

use super::constants::FLASH_CHUNK_SIZE;
use super::{FlashProtocol, Operation, ProtocolError, ProtocolKind};
use crate::config::FlashConfig;
use crate::events::{FlashEvent, FlashObserver, FlashPhase};
use crate::image::Image;
use crate::types::ImageType;

pub struct RawDiskProtocol {
    device_path: PathBuf,
    config: FlashConfig,
}

impl RawDiskProtocol {
    pub fn new(device_path: PathBuf, config: FlashConfig) -> Self {
        Self {
            device_path,
            config,
        }
    }
}

impl FlashProtocol for RawDiskProtocol {
    fn kind(&self) -> ProtocolKind {
        ProtocolKind::RawDisk
    }

    fn supports(&self, operation: Operation) -> bool {
        matches!(operation, Operation::FlashImage | Operation::DumpImage)
    }

    fn flash_image(
        &mut self,
        image: &mut Image,
        observer: &dyn FlashObserver,
    ) -> Result<(), ProtocolError> {
        let total = image.size();
        info!(
            piece = %image.image_type,
            total,
            disk = %self.device_path.display(),
            "Writing image to raw disk"
        );

        if self.config.simulate {
            info!("Simulation: skipping raw disk write");
            return Ok(());
        }

        let mut disk = OpenOptions::new().write(true).open(&self.device_path)?;
        disk.seek(SeekFrom::Start(0))?;

        image.seek(0)?;
        let mut written = 0u64;
        let mut buf = vec![0u8; FLASH_CHUNK_SIZE];
        loop {
            let n = image.read(&mut buf)?;
            if n == 0 {
                break;
            }
            disk.write_all(&buf[..n])?;
            written += n as u64;
            observer.on_event(&FlashEvent::Progress {
                phase: FlashPhase::Flashing,
                operation: image.image_type.to_string(),
                current: written,
                total,
            });
        }
        disk.flush()?;

        info!(written, "Raw disk write complete");
        Ok(())
    }

    fn dump_image(
        &mut self,
        image_type: ImageType,
        out: &mut dyn io::Write,
        observer: &dyn FlashObserver,
    ) -> Result<u64, ProtocolError> {
        info!(
            piece = %image_type,
            disk = %self.device_path.display(),
            "Dumping raw disk"
        );

        let mut disk = File::open(&self.device_path)?;
        let total = disk.metadata()?.len();

        let mut copied = 0u64;
        let mut buf = vec![0u8; FLASH_CHUNK_SIZE];
        loop {
            let n = disk.read(&mut buf)?;
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

        info!(copied, "Raw disk dump complete");
        Ok(copied)
    }

    fn switch_mode(&mut self, _target: ProtocolKind) -> Result<(), ProtocolError> {
        // Mass-storage mode has no control channel; the user power-cycles.
        Err(ProtocolError::Unsupported {
            kind: ProtocolKind::RawDisk,
            operation: Operation::Reboot,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NullObserver;
    use crate::image::ImageMeta;
    use std::io::Write as _;

    fn mmc_image(dir: &tempfile::TempDir, data: &[u8]) -> Image {
        let path = dir.path().join("piece");
        std::fs::File::create(&path).unwrap().write_all(data).unwrap();
        let meta = ImageMeta {
            image_type: Some(ImageType::Mmc),
            ..Default::default()
        };
        Image::from_file(&path, meta, &FlashConfig::default()).unwrap()
    }

    #[test]
    fn test_flash_then_dump_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let disk_path = dir.path().join("disk.img");
        std::fs::write(&disk_path, vec![0u8; 512]).unwrap();

        let mut image = mmc_image(&dir, &[0x33; 200]);
        let mut raw = RawDiskProtocol::new(disk_path.clone(), FlashConfig::default());
        raw.flash_image(&mut image, &NullObserver).unwrap();

        let mut dumped = Vec::new();
        let n = raw
            .dump_image(ImageType::Mmc, &mut dumped, &NullObserver)
            .unwrap();
        assert_eq!(n, 512);
        assert!(dumped[..200].iter().all(|&b| b == 0x33));
        // MMC alignment pads to 256 before the untouched tail.
        assert!(dumped[200..256].iter().all(|&b| b == 0xFF));
        assert!(dumped[256..].iter().all(|&b| b == 0x00));
    }

    #[test]
    fn test_simulate_leaves_disk_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let disk_path = dir.path().join("disk.img");
        std::fs::write(&disk_path, vec![0xEE; 256]).unwrap();

        let mut image = mmc_image(&dir, &[0x33; 100]);
        let config = FlashConfig {
            simulate: true,
            ..Default::default()
        };
        let mut raw = RawDiskProtocol::new(disk_path.clone(), config);
        raw.flash_image(&mut image, &NullObserver).unwrap();

        assert!(std::fs::read(&disk_path).unwrap().iter().all(|&b| b == 0xEE));
    }

    #[test]
    fn test_no_mode_switch() {
        let mut raw = RawDiskProtocol::new(PathBuf::from("/dev/null"), FlashConfig::default());
        assert!(raw.switch_mode(ProtocolKind::Nolo).is_err());
        assert!(raw.supports(Operation::DumpImage));
        assert!(!raw.supports(Operation::Identify));
    }
}
