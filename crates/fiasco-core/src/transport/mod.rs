//! USB transport layer.

pub mod mock;
mod nusb;
mod traits;

pub use mock::MockTransport;
pub use nusb::NusbTransport;
pub use traits::{TransportError, UsbTransport};
