//! fiasco-core: firmware flashing for Nokia Internet Tablet / Maemo devices.
//!
//! Implements the fiasco firmware container model and the multi-protocol
//! device operations behind the `fiasco` CLI.
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **Checksum**: the 16-bit word fold and the reflected CRC32
//! - **Types**: image type / device model registries, hardware revisions
//! - **Image**: virtual seekable stream over owned or shared segments
//! - **Fiasco**: the multi-image container format (parse, write, unpack)
//! - **Transport**: USB communication abstraction (nusb, mock)
//! - **Protocol**: NOLO, Cold-flash, Mk II and RAW disk handlers
//! - **Device**: static USB device table and connection detection
//! - **Operations**: dispatch layer with the retry-after-mode-switch
//!   contract
//!
//! # Example
//!
//! ```no_run
//! use std::path::Path;
//! use fiasco_core::config::FlashConfig;
//! use fiasco_core::fiasco::Fiasco;
//!
//! let config = FlashConfig::default();
//! let mut container = Fiasco::parse(Path::new("firmware.fiasco"), &config)
//!     .expect("parse failed");
//! container.unpack(None).expect("unpack failed");
//! ```

pub mod checksum;
pub mod config;
pub mod device;
pub mod events;
pub mod fiasco;
pub mod image;
pub mod local;
pub mod operations;
pub mod protocol;
pub mod transport;
pub mod types;

// Re-exports for convenience
pub use config::FlashConfig;
pub use device::{Connection, DetectError, USB_DEVICES, UsbConnection, detect};
pub use events::{FlashEvent, FlashObserver, FlashPhase, NullObserver, TracingObserver};
pub use fiasco::{Fiasco, FiascoError};
pub use image::{Image, ImageError, ImageMeta, aligned_size};
pub use operations::{DeviceHandle, OperationError, Outcome};
pub use protocol::{DeviceIdent, FlashProtocol, Operation, ProtocolError, ProtocolKind};
pub use transport::{MockTransport, NusbTransport, TransportError, UsbTransport};
pub use types::{ConfigField, DeviceModel, DeviceSpec, HwRevList, ImageType};
