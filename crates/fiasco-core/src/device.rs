//! Device table and connection detection.
//!
//! Detection tries the local path first (running on the device itself),
//! then polls the USB bus against the static device table. A matched table
//! row pins the wire protocol and the interface/altsetting/configuration
//! the transport must claim, plus the device models the ID is legitimate
//! for.

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::FlashConfig;
use crate::events::{FlashEvent, FlashObserver};
use crate::local::{HostInfo, LocalDevice};
use crate::protocol::coldflash::ColdFlashProtocol;
use crate::protocol::mkii::MkiiProtocol;
use crate::protocol::nolo::NoloProtocol;
use crate::protocol::rawdisk::RawDiskProtocol;
use crate::protocol::{DeviceIdent, FlashProtocol, ProtocolKind};
use crate::transport::{NusbTransport, TransportError, UsbTransport};
use crate::types::DeviceModel;

/// One row of the static USB device table.
pub struct UsbDeviceEntry {
    pub vid: u16,
    pub pid: u16,
    pub label: &'static str,
    /// `None` marks an ID that is not a flashable mode (e.g. RNDIS); the
    /// scan must skip it.
    pub protocol: Option<ProtocolKind>,
    pub interface: u8,
    pub alt_setting: Option<u8>,
    pub configuration: Option<u8>,
    /// Device models this ID is legitimate for.
    pub models: &'static [DeviceModel],
}

/// The static device table. Frozen for hardware compatibility.
pub const USB_DEVICES: &[UsbDeviceEntry] = &[
    UsbDeviceEntry {
        vid: 0x0421,
        pid: 0x0105,
        label: "NOLO update mode",
        protocol: Some(ProtocolKind::Nolo),
        interface: 2,
        alt_setting: Some(1),
        configuration: None,
        models: &[
            DeviceModel::Su18,
            DeviceModel::Rx34,
            DeviceModel::Rx44,
            DeviceModel::Rx48,
        ],
    },
    UsbDeviceEntry {
        vid: 0x0421,
        pid: 0x0106,
        label: "OMAP boot ROM (cold flash)",
        protocol: Some(ProtocolKind::ColdFlash),
        interface: 1,
        alt_setting: None,
        configuration: Some(1),
        models: &[
            DeviceModel::Rx34,
            DeviceModel::Rx44,
            DeviceModel::Rx48,
            DeviceModel::Rx51,
        ],
    },
    UsbDeviceEntry {
        vid: 0x0421,
        pid: 0x01C7,
        label: "Update mode (Mk II)",
        protocol: Some(ProtocolKind::MkII),
        interface: 1,
        alt_setting: None,
        configuration: Some(1),
        models: &[DeviceModel::Rx51],
    },
    UsbDeviceEntry {
        vid: 0x0421,
        pid: 0x01C8,
        label: "Mass storage (raw disk)",
        protocol: Some(ProtocolKind::RawDisk),
        interface: 0,
        alt_setting: None,
        configuration: Some(1),
        models: &[DeviceModel::Rx51],
    },
    UsbDeviceEntry {
        vid: 0x0421,
        pid: 0x01C9,
        label: "PC suite (RNDIS)",
        protocol: None,
        interface: 0,
        alt_setting: None,
        configuration: None,
        models: &[DeviceModel::Rx51],
    },
];

#[derive(Error, Debug)]
pub enum DetectError {
    #[error("No device found")]
    NotFound,

    #[error("Device wait interrupted")]
    Interrupted,

    #[error("Timeout waiting for device after {0}s")]
    WaitTimeout(u64),

    #[error("Raw disk mode bound but no disk node configured")]
    RawDiskUnconfigured,

    #[error(
        "Device mismatch: {label} is not legitimate for identified model {identified}"
    )]
    DeviceMismatch {
        label: &'static str,
        identified: DeviceModel,
    },

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// A detected connection: either local storage on the device itself or a
/// USB link bound to one wire protocol.
pub enum Connection {
    Local(LocalDevice),
    Usb(UsbConnection),
}

pub struct UsbConnection {
    pub entry: &'static UsbDeviceEntry,
    pub protocol: Box<dyn FlashProtocol>,
    pub ident: Option<DeviceIdent>,
}

/// Match a (VID, PID) pair against the table, skipping non-flashable rows.
pub fn match_entry(vid: u16, pid: u16) -> Option<&'static UsbDeviceEntry> {
    USB_DEVICES
        .iter()
        .find(|e| e.vid == vid && e.pid == pid)
        .filter(|e| {
            if e.protocol.is_none() {
                debug!(label = e.label, "Skipping non-flashable mode");
            }
            e.protocol.is_some()
        })
}

/// Bind the protocol handler a table row demands.
pub fn bind_protocol(
    kind: ProtocolKind,
    transport: Box<dyn UsbTransport>,
    config: &FlashConfig,
) -> Result<Box<dyn FlashProtocol>, DetectError> {
    Ok(match kind {
        ProtocolKind::Nolo => Box::new(NoloProtocol::new(transport, config.clone())),
        ProtocolKind::ColdFlash => Box::new(ColdFlashProtocol::new(transport, config.clone())),
        ProtocolKind::MkII => Box::new(MkiiProtocol::new(transport, config.clone())),
        ProtocolKind::RawDisk => {
            let path = config
                .raw_disk
                .as_ref()
                .ok_or(DetectError::RawDiskUnconfigured)?;
            Box::new(RawDiskProtocol::new(path.into(), config.clone()))
        }
    })
}

/// Check the identification result against the table row's legitimate
/// models. A mismatch is a hard error unless verification is disabled.
pub fn check_legitimacy(
    entry: &'static UsbDeviceEntry,
    ident: &DeviceIdent,
    config: &FlashConfig,
) -> Result<(), DetectError> {
    if ident.model == DeviceModel::Unknown || entry.models.contains(&ident.model) {
        return Ok(());
    }
    if config.no_verify {
        warn!(
            label = entry.label,
            identified = %ident.model,
            "Device mismatch ignored"
        );
        return Ok(());
    }
    Err(DetectError::DeviceMismatch {
        label: entry.label,
        identified: ident.model,
    })
}

/// Detect a connection: local first, then USB with an interruptible poll
/// loop. `stop` is checked once per poll iteration.
pub fn detect(
    config: &FlashConfig,
    host: &dyn HostInfo,
    observer: &dyn FlashObserver,
    stop: &AtomicBool,
) -> Result<Connection, DetectError> {
    if let Some(local) = LocalDevice::detect(host, config) {
        info!(model = %local.model(), "Running on the device itself");
        return Ok(Connection::Local(local));
    }

    info!("Scanning USB for known devices");
    let deadline = if config.wait_timeout_secs > 0 {
        Some(Instant::now() + Duration::from_secs(config.wait_timeout_secs))
    } else {
        None
    };

    loop {
        if stop.load(Ordering::Relaxed) {
            return Err(DetectError::Interrupted);
        }
        if let Some(deadline) = deadline {
            if Instant::now() > deadline {
                return Err(DetectError::WaitTimeout(config.wait_timeout_secs));
            }
        }

        for (vid, pid) in NusbTransport::enumerate()? {
            let Some(entry) = match_entry(vid, pid) else {
                continue;
            };
            observer.on_event(&FlashEvent::DeviceFound {
                vid,
                pid,
                label: entry.label.to_string(),
            });

            let Some(kind) = entry.protocol else {
                continue;
            };
            let transport = NusbTransport::open(
                entry.vid,
                entry.pid,
                entry.interface,
                entry.alt_setting,
                entry.configuration,
            )?;
            let protocol = bind_protocol(kind, Box::new(transport), config)?;
            info!(label = entry.label, protocol = %kind, "Connection bound");
            return Ok(Connection::Usb(UsbConnection {
                entry,
                protocol,
                ident: None,
            }));
        }

        thread::sleep(Duration::from_millis(250));
    }
}
