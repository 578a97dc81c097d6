//! USB transport layer abstraction.
//!
//! Defines the `UsbTransport` trait the protocol handlers speak, allowing
//! different implementations (nusb, mock, etc.). Every call carries a
//! bounded timeout: a timeout is recoverable inside polling loops and a hard
//! error mid-transfer, so it gets its own variant.

use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Device not found: VID={vid:04X} PID={pid:04X}")]
    DeviceNotFound { vid: u16, pid: u16 },

    #[error("Failed to open device: {0}")]
    OpenFailed(String),

    #[error("Failed to claim interface {interface}: {message}")]
    ClaimInterfaceFailed { interface: u8, message: String },

    #[error("Endpoint not found: type={ep_type}, direction={direction}")]
    EndpointNotFound { ep_type: String, direction: String },

    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Read failed: {0}")]
    ReadFailed(String),

    #[error("Device disconnected")]
    Disconnected,

    #[error("Timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, TransportError::Timeout { .. })
    }
}

/// Abstract USB transport interface.
///
/// The vendor protocols need both control transfers (NOLO request/response)
/// and bulk transfers (cold-flash and Mk II streams).
pub trait UsbTransport: Send + Sync {
    /// Vendor control transfer, host to device.
    fn control_out(
        &self,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize, TransportError>;

    /// Vendor control transfer, device to host.
    fn control_in(
        &self,
        request: u8,
        value: u16,
        index: u16,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, TransportError>;

    /// Bulk transfer to the OUT endpoint.
    fn bulk_out(&self, data: &[u8], timeout: Duration) -> Result<usize, TransportError>;

    /// Bulk transfer from the IN endpoint.
    fn bulk_in(&self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError>;

    /// Get the current VID.
    fn vendor_id(&self) -> u16;

    /// Get the current PID.
    fn product_id(&self) -> u16;
}
