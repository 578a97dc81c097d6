//! nusb-based USB transport implementation.

use std::io::{Read, Write};
use std::time::Duration;

use nusb::transfer::{Bulk, ControlIn, ControlOut, ControlType, In, Out, Recipient};
use nusb::{Interface, MaybeFuture, list_devices};
use tracing::{debug, info, instrument};

use super::traits::{TransportError, UsbTransport};

/// nusb-based USB transport bound to one claimed interface.
pub struct NusbTransport {
    interface: Interface,
    in_endpoint: u8,
    out_endpoint: u8,
    vid: u16,
    pid: u16,
}

impl NusbTransport {
    /// Enumerate (VID, PID) pairs currently on the bus.
    pub fn enumerate() -> Result<Vec<(u16, u16)>, TransportError> {
        let devices = list_devices()
            .wait()
            .map_err(|e| TransportError::OpenFailed(e.to_string()))?;
        Ok(devices.map(|d| (d.vendor_id(), d.product_id())).collect())
    }

    /// Open a device and claim the interface/altsetting/configuration the
    /// device table demands for its protocol.
    #[instrument(level = "info", fields(vid = format!("{:04X}", vid), pid = format!("{:04X}", pid)))]
    pub fn open(
        vid: u16,
        pid: u16,
        interface_number: u8,
        alt_setting: Option<u8>,
        configuration: Option<u8>,
    ) -> Result<Self, TransportError> {
        let device_info = list_devices()
            .wait()
            .map_err(|e| TransportError::OpenFailed(e.to_string()))?
            .find(|d| d.vendor_id() == vid && d.product_id() == pid)
            .ok_or(TransportError::DeviceNotFound { vid, pid })?;

        let device = device_info
            .open()
            .wait()
            .map_err(|e| TransportError::OpenFailed(e.to_string()))?;

        if let Some(config) = configuration {
            device
                .set_configuration(config)
                .wait()
                .map_err(|e| TransportError::OpenFailed(e.to_string()))?;
        }

        let interface = device.claim_interface(interface_number).wait().map_err(|e| {
            TransportError::ClaimInterfaceFailed {
                interface: interface_number,
                message: e.to_string(),
            }
        })?;

        if let Some(alt) = alt_setting {
            interface
                .set_alt_setting(alt)
                .wait()
                .map_err(|e| TransportError::ClaimInterfaceFailed {
                    interface: interface_number,
                    message: e.to_string(),
                })?;
        }

        // Find BULK endpoints on the claimed interface.
        let mut in_endpoint: u8 = 0;
        let mut out_endpoint: u8 = 0;
        for config in device.configurations() {
            for iface in config.interfaces() {
                if iface.interface_number() == interface_number {
                    for alt in iface.alt_settings() {
                        for ep in alt.endpoints() {
                            if ep.transfer_type() == nusb::descriptors::TransferType::Bulk {
                                if ep.direction() == nusb::transfer::Direction::In {
                                    in_endpoint = ep.address();
                                } else {
                                    out_endpoint = ep.address();
                                }
                            }
                        }
                    }
                }
            }
        }

        info!(
            in_ep = %format!("0x{in_endpoint:02X}"),
            out_ep = %format!("0x{out_endpoint:02X}"),
            "Device opened"
        );

        Ok(Self {
            interface,
            in_endpoint,
            out_endpoint,
            vid,
            pid,
        })
    }
}

impl UsbTransport for NusbTransport {
    fn control_out(
        &self,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize, TransportError> {
        self.interface
            .control_out(
                ControlOut {
                    control_type: ControlType::Vendor,
                    recipient: Recipient::Device,
                    request,
                    value,
                    index,
                    data,
                },
                timeout,
            )
            .wait()
            .map_err(|e| TransportError::WriteFailed(e.to_string()))?;
        debug!(request, len = data.len(), "Control OUT complete");
        Ok(data.len())
    }

    fn control_in(
        &self,
        request: u8,
        value: u16,
        index: u16,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, TransportError> {
        let data = self
            .interface
            .control_in(
                ControlIn {
                    control_type: ControlType::Vendor,
                    recipient: Recipient::Device,
                    request,
                    value,
                    index,
                    length: buf.len() as u16,
                },
                timeout,
            )
            .wait()
            .map_err(|e| TransportError::ReadFailed(e.to_string()))?;
        let n = data.len().min(buf.len());
        buf[..n].copy_from_slice(&data[..n]);
        debug!(request, bytes_read = n, "Control IN complete");
        Ok(n)
    }

    fn bulk_out(&self, data: &[u8], _timeout: Duration) -> Result<usize, TransportError> {
        if self.out_endpoint == 0 {
            return Err(TransportError::EndpointNotFound {
                ep_type: "Bulk".into(),
                direction: "Out".into(),
            });
        }
        let ep = self
            .interface
            .endpoint::<Bulk, Out>(self.out_endpoint)
            .map_err(|e| TransportError::WriteFailed(e.to_string()))?;

        let mut writer = ep.writer(4096);
        writer
            .write_all(data)
            .map_err(|e| TransportError::WriteFailed(e.to_string()))?;
        writer
            .flush()
            .map_err(|e| TransportError::WriteFailed(e.to_string()))?;

        debug!(bytes_written = data.len(), "Bulk OUT complete");
        Ok(data.len())
    }

    fn bulk_in(&self, buf: &mut [u8], _timeout: Duration) -> Result<usize, TransportError> {
        if self.in_endpoint == 0 {
            return Err(TransportError::EndpointNotFound {
                ep_type: "Bulk".into(),
                direction: "In".into(),
            });
        }
        let ep = self
            .interface
            .endpoint::<Bulk, In>(self.in_endpoint)
            .map_err(|e| TransportError::ReadFailed(e.to_string()))?;

        let mut reader = ep.reader(4096);
        let n = reader
            .read(buf)
            .map_err(|e| TransportError::ReadFailed(e.to_string()))?;

        debug!(bytes_read = n, "Bulk IN complete");
        Ok(n)
    }

    fn vendor_id(&self) -> u16 {
        self.vid
    }

    fn product_id(&self) -> u16 {
        self.pid
    }
}
