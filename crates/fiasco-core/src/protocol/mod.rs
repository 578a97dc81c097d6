//! Protocol abstraction over the historically incompatible wire protocols.
//!
//! Each USB protocol variant implements [`FlashProtocol`]; the operations
//! layer dispatches abstract operations through the trait and consults
//! [`FlashProtocol::supports`] to decide when a mode switch is needed
//! instead. An unsupported operation is never an error at this level — the
//! dispatch layer turns it into a retry-after-switch signal.

pub mod coldflash;
pub mod constants;
pub mod mkii;
pub mod nolo;
pub mod rawdisk;

use std::fmt;
use std::io;

use thiserror::Error;

use crate::events::FlashObserver;
use crate::image::{Image, ImageError};
use crate::transport::TransportError;
use crate::types::{ConfigField, DeviceModel, ImageType};

/// USB wire protocol variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolKind {
    Nolo,
    ColdFlash,
    MkII,
    RawDisk,
}

impl fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolKind::Nolo => write!(f, "NOLO"),
            ProtocolKind::ColdFlash => write!(f, "Cold-flash"),
            ProtocolKind::MkII => write!(f, "Mk II"),
            ProtocolKind::RawDisk => write!(f, "RAW disk"),
        }
    }
}

/// Abstract operations routed by the dispatch layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    FlashImage,
    DumpImage,
    GetField,
    SetField,
    Reboot,
    Boot,
    Identify,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::FlashImage => write!(f, "flash-image"),
            Operation::DumpImage => write!(f, "dump-image"),
            Operation::GetField => write!(f, "get-field"),
            Operation::SetField => write!(f, "set-field"),
            Operation::Reboot => write!(f, "reboot"),
            Operation::Boot => write!(f, "boot"),
            Operation::Identify => write!(f, "identify"),
        }
    }
}

/// Result of protocol-level identification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdent {
    pub model: DeviceModel,
    pub hwrev: Option<i16>,
    pub version: Option<String>,
}

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Unexpected response: expected {expected}, got {got}")]
    Unexpected { expected: String, got: String },

    #[error("Transfer length mismatch: expected {expected}, actual {actual}")]
    LengthMismatch { expected: usize, actual: usize },

    #[error("{kind} protocol does not implement {operation}")]
    Unsupported {
        kind: ProtocolKind,
        operation: Operation,
    },

    #[error("Missing staged piece: {0}")]
    MissingPiece(&'static str),

    #[error(transparent)]
    Image(#[from] ImageError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Common operation set over one bound wire protocol.
///
/// Default method bodies report the operation as unimplemented; each
/// protocol overrides exactly the set its `supports` advertises.
pub trait FlashProtocol {
    fn kind(&self) -> ProtocolKind;

    /// Whether this protocol can perform `operation` at all. The dispatch
    /// layer turns a `false` into a mode switch plus retry signal.
    fn supports(&self, operation: Operation) -> bool;

    /// Reboot the device into a mode where `target` is the active protocol.
    fn switch_mode(&mut self, target: ProtocolKind) -> Result<(), ProtocolError>;

    fn identify(&mut self) -> Result<DeviceIdent, ProtocolError> {
        Err(ProtocolError::Unsupported {
            kind: self.kind(),
            operation: Operation::Identify,
        })
    }

    fn flash_image(
        &mut self,
        _image: &mut Image,
        _observer: &dyn FlashObserver,
    ) -> Result<(), ProtocolError> {
        Err(ProtocolError::Unsupported {
            kind: self.kind(),
            operation: Operation::FlashImage,
        })
    }

    fn dump_image(
        &mut self,
        _image_type: ImageType,
        _out: &mut dyn io::Write,
        _observer: &dyn FlashObserver,
    ) -> Result<u64, ProtocolError> {
        Err(ProtocolError::Unsupported {
            kind: self.kind(),
            operation: Operation::DumpImage,
        })
    }

    fn get_field(&mut self, _field: ConfigField) -> Result<String, ProtocolError> {
        Err(ProtocolError::Unsupported {
            kind: self.kind(),
            operation: Operation::GetField,
        })
    }

    fn set_field(&mut self, _field: ConfigField, _value: &str) -> Result<(), ProtocolError> {
        Err(ProtocolError::Unsupported {
            kind: self.kind(),
            operation: Operation::SetField,
        })
    }

    fn reboot(&mut self, _update_mode: bool) -> Result<(), ProtocolError> {
        Err(ProtocolError::Unsupported {
            kind: self.kind(),
            operation: Operation::Reboot,
        })
    }

    fn boot(&mut self, _cmdline: Option<&str>) -> Result<(), ProtocolError> {
        Err(ProtocolError::Unsupported {
            kind: self.kind(),
            operation: Operation::Boot,
        })
    }
}
