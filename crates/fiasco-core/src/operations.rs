//! Operations dispatch layer.
//!
//! A [`DeviceHandle`] binds a detected connection to the abstract operation
//! set. Local connections call the local implementation directly; USB
//! connections dispatch through the bound [`FlashProtocol`]. When the bound
//! protocol cannot perform an operation, the handle triggers one mode switch
//! and reports [`Outcome::RetryAfterSwitch`] — the caller re-detects the
//! connection (the device re-enumerates under another protocol) and
//! re-issues the same operation. That retry signal is a result, not an
//! error: everything that is actually wrong propagates as
//! [`OperationError`].

use std::io;
use std::sync::Arc;

use thiserror::Error;
use tracing::{info, warn};

use crate::config::FlashConfig;
use crate::device::{check_legitimacy, Connection, DetectError};
use crate::events::{FlashEvent, FlashObserver, FlashPhase, TracingObserver};
use crate::image::{Image, ImageError};
use crate::protocol::{DeviceIdent, Operation, ProtocolError, ProtocolKind};
use crate::types::{ConfigField, ImageType};

#[derive(Error, Debug)]
pub enum OperationError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Image(#[from] ImageError),

    #[error(transparent)]
    Detect(#[from] DetectError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Dispatch result: either the operation ran, or the device was switched
/// into a capable mode and the caller must re-detect and retry.
#[derive(Debug)]
pub enum Outcome<T> {
    Completed(T),
    RetryAfterSwitch,
}

impl<T> Outcome<T> {
    pub fn is_retry(&self) -> bool {
        matches!(self, Outcome::RetryAfterSwitch)
    }
}

/// Which protocol to reboot into when the current one cannot perform an
/// operation. Dumping needs the exported disk; everything else lands in
/// NOLO.
fn switch_target(operation: Operation) -> ProtocolKind {
    match operation {
        Operation::DumpImage => ProtocolKind::RawDisk,
        _ => ProtocolKind::Nolo,
    }
}

/// Switch the device toward a protocol that supports `operation` and signal
/// the caller to retry. This is the single place the retry contract is
/// implemented.
fn switch_for<T>(
    usb: &mut crate::device::UsbConnection,
    observer: &dyn FlashObserver,
    operation: Operation,
) -> Result<Outcome<T>, OperationError> {
    let target = switch_target(operation);
    warn!(
        protocol = %usb.protocol.kind(),
        %operation,
        %target,
        "Bound protocol cannot perform operation, switching mode"
    );
    observer.on_event(&FlashEvent::PhaseChanged {
        from: FlashPhase::Identifying,
        to: FlashPhase::Switching,
    });
    usb.protocol.switch_mode(target)?;
    Ok(Outcome::RetryAfterSwitch)
}

pub struct DeviceHandle {
    connection: Connection,
    config: FlashConfig,
    observer: Arc<dyn FlashObserver>,
}

impl DeviceHandle {
    pub fn new(connection: Connection, config: FlashConfig) -> Self {
        Self::with_observer(connection, config, Arc::new(TracingObserver))
    }

    pub fn with_observer(
        connection: Connection,
        config: FlashConfig,
        observer: Arc<dyn FlashObserver>,
    ) -> Self {
        Self {
            connection,
            config,
            observer,
        }
    }

    /// The protocol currently bound, if this is a USB connection.
    pub fn protocol(&self) -> Option<ProtocolKind> {
        match &self.connection {
            Connection::Local(_) => None,
            Connection::Usb(usb) => Some(usb.protocol.kind()),
        }
    }

    pub fn identify(&mut self) -> Result<Outcome<DeviceIdent>, OperationError> {
        let observer = self.observer.clone();
        match &mut self.connection {
            Connection::Local(local) => {
                let hwrev = local
                    .get_field(ConfigField::HwRev)
                    .ok()
                    .and_then(|v| v.trim().parse().ok());
                let version = local.get_field(ConfigField::SwVersion).ok();
                Ok(Outcome::Completed(DeviceIdent {
                    model: local.model(),
                    hwrev,
                    version,
                }))
            }
            Connection::Usb(usb) => {
                if !usb.protocol.supports(Operation::Identify) {
                    return switch_for(usb, observer.as_ref(), Operation::Identify);
                }
                let ident = usb.protocol.identify()?;
                check_legitimacy(usb.entry, &ident, &self.config)?;
                usb.ident = Some(ident.clone());
                Ok(Outcome::Completed(ident))
            }
        }
    }

    pub fn flash_image(&mut self, image: &mut Image) -> Result<Outcome<()>, OperationError> {
        let observer = self.observer.clone();
        match &mut self.connection {
            Connection::Local(local) => {
                local.flash_image(image, observer.as_ref())?;
                Ok(Outcome::Completed(()))
            }
            Connection::Usb(usb) => {
                if !usb.protocol.supports(Operation::FlashImage) {
                    return switch_for(usb, observer.as_ref(), Operation::FlashImage);
                }
                usb.protocol.flash_image(image, observer.as_ref())?;
                Ok(Outcome::Completed(()))
            }
        }
    }

    pub fn dump_image(
        &mut self,
        image_type: ImageType,
        out: &mut dyn io::Write,
    ) -> Result<Outcome<u64>, OperationError> {
        let observer = self.observer.clone();
        match &mut self.connection {
            Connection::Local(local) => {
                let n = local.dump_image(image_type, out, observer.as_ref())?;
                Ok(Outcome::Completed(n))
            }
            Connection::Usb(usb) => {
                if !usb.protocol.supports(Operation::DumpImage) {
                    return switch_for(usb, observer.as_ref(), Operation::DumpImage);
                }
                let n = usb.protocol.dump_image(image_type, out, observer.as_ref())?;
                Ok(Outcome::Completed(n))
            }
        }
    }

    pub fn get_field(&mut self, field: ConfigField) -> Result<Outcome<String>, OperationError> {
        let observer = self.observer.clone();
        match &mut self.connection {
            Connection::Local(local) => Ok(Outcome::Completed(local.get_field(field)?)),
            Connection::Usb(usb) => {
                if !usb.protocol.supports(Operation::GetField) {
                    return switch_for(usb, observer.as_ref(), Operation::GetField);
                }
                Ok(Outcome::Completed(usb.protocol.get_field(field)?))
            }
        }
    }

    pub fn set_field(
        &mut self,
        field: ConfigField,
        value: &str,
    ) -> Result<Outcome<()>, OperationError> {
        let observer = self.observer.clone();
        match &mut self.connection {
            Connection::Local(local) => {
                local.set_field(field, value)?;
                Ok(Outcome::Completed(()))
            }
            Connection::Usb(usb) => {
                if !usb.protocol.supports(Operation::SetField) {
                    return switch_for(usb, observer.as_ref(), Operation::SetField);
                }
                usb.protocol.set_field(field, value)?;
                Ok(Outcome::Completed(()))
            }
        }
    }

    pub fn reboot(&mut self, update_mode: bool) -> Result<Outcome<()>, OperationError> {
        let observer = self.observer.clone();
        match &mut self.connection {
            Connection::Local(local) => {
                local.reboot()?;
                Ok(Outcome::Completed(()))
            }
            Connection::Usb(usb) => {
                if !usb.protocol.supports(Operation::Reboot) {
                    return switch_for(usb, observer.as_ref(), Operation::Reboot);
                }
                usb.protocol.reboot(update_mode)?;
                Ok(Outcome::Completed(()))
            }
        }
    }

    pub fn boot(&mut self, cmdline: Option<&str>) -> Result<Outcome<()>, OperationError> {
        let observer = self.observer.clone();
        match &mut self.connection {
            Connection::Local(_) => {
                // Booting a specific kernel from a live system is not a
                // local operation; the kernel is already running.
                info!("Boot requested locally; nothing to do");
                Ok(Outcome::Completed(()))
            }
            Connection::Usb(usb) => {
                if !usb.protocol.supports(Operation::Boot) {
                    return switch_for(usb, observer.as_ref(), Operation::Boot);
                }
                usb.protocol.boot(cmdline)?;
                Ok(Outcome::Completed(()))
            }
        }
    }
}
