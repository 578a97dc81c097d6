//! NOLO protocol.
//!
//! NOLO is the vendor bootloader's update mode: configuration and
//! identification go over vendor control requests, piece payloads stream
//! over the bulk OUT endpoint.

use std::time::Duration;

use tracing::{debug, info, warn};

use super::constants::*;
use super::{DeviceIdent, FlashProtocol, Operation, ProtocolError, ProtocolKind};
use crate::config::FlashConfig;
use crate::events::{FlashEvent, FlashObserver, FlashPhase};
use crate::image::Image;
use crate::transport::UsbTransport;
use crate::types::{ConfigField, DeviceModel};

pub struct NoloProtocol {
    transport: Box<dyn UsbTransport>,
    config: FlashConfig,
}

impl NoloProtocol {
    pub fn new(transport: Box<dyn UsbTransport>, config: FlashConfig) -> Self {
        Self { transport, config }
    }

    fn control_timeout(&self) -> Duration {
        Duration::from_millis(CONTROL_TIMEOUT_MS)
    }

    fn query_string(&self, request: u8, value: u16) -> Result<String, ProtocolError> {
        let mut buf = [0u8; 256];
        let n = self
            .transport
            .control_in(request, value, 0, &mut buf, self.control_timeout())?;
        let end = buf[..n].iter().position(|&b| b == 0).unwrap_or(n);
        Ok(String::from_utf8_lossy(&buf[..end]).into_owned())
    }

    /// Read the sticky status register; nonzero means the last operation
    /// failed on the device side.
    fn check_status(&self) -> Result<(), ProtocolError> {
        let mut buf = [0u8; 4];
        let n = self
            .transport
            .control_in(NOLO_STATUS, 0, 0, &mut buf, self.control_timeout())?;
        let status = buf[..n].iter().fold(0u32, |acc, &b| (acc << 8) | u32::from(b));
        if status != 0 {
            self.transport.control_out(
                NOLO_CLEAR_STATUS,
                0,
                0,
                &[],
                self.control_timeout(),
            )?;
            return Err(ProtocolError::Unexpected {
                expected: "status 0".to_string(),
                got: format!("status 0x{status:08X}"),
            });
        }
        Ok(())
    }
}

impl FlashProtocol for NoloProtocol {
    fn kind(&self) -> ProtocolKind {
        ProtocolKind::Nolo
    }

    fn supports(&self, operation: Operation) -> bool {
        !matches!(operation, Operation::DumpImage)
    }

    fn identify(&mut self) -> Result<DeviceIdent, ProtocolError> {
        let mut buf = [0u8; 512];
        let n = self.transport.control_in(
            NOLO_IDENTIFY,
            0,
            0,
            &mut buf,
            self.control_timeout(),
        )?;

        // NUL-separated fields: model, hardware revision, NOLO version.
        let mut fields = buf[..n]
            .split(|&b| b == 0)
            .map(|f| String::from_utf8_lossy(f).into_owned());
        let model_text = fields.next().unwrap_or_default();
        let hwrev_text = fields.next().unwrap_or_default();
        let version = fields.next().filter(|v| !v.is_empty());

        let model = model_text.parse().unwrap_or_else(|_| {
            warn!(model = %model_text, "Device reported unknown model");
            DeviceModel::Unknown
        });
        let hwrev = hwrev_text.trim().parse::<i16>().ok();

        info!(%model, ?hwrev, ?version, "NOLO identification");
        Ok(DeviceIdent {
            model,
            hwrev,
            version,
        })
    }

    fn flash_image(
        &mut self,
        image: &mut Image,
        observer: &dyn FlashObserver,
    ) -> Result<(), ProtocolError> {
        let piece = image.image_type.as_str();
        let total = image.size();
        info!(piece, total, "Flashing over NOLO");

        if self.config.simulate {
            info!(piece, "Simulation: skipping NOLO piece upload");
            return Ok(());
        }

        self.transport.control_out(
            NOLO_SELECT_PIECE,
            0,
            0,
            piece.as_bytes(),
            self.control_timeout(),
        )?;
        self.transport.control_out(
            NOLO_SET_LENGTH,
            (total >> 16) as u16,
            total as u16,
            &[],
            self.control_timeout(),
        )?;

        if let Some(spec) = image.devices.first() {
            if !spec.hwrevs.is_empty() {
                self.transport.control_out(
                    NOLO_SEND_HWREVS,
                    0,
                    0,
                    &spec.hwrevs.to_wire(),
                    self.control_timeout(),
                )?;
            }
        }

        image.seek(0)?;
        let mut sent = 0u64;
        let mut buf = vec![0u8; FLASH_CHUNK_SIZE];
        let bulk_timeout = Duration::from_millis(BULK_TIMEOUT_MS);
        loop {
            let n = image.read(&mut buf)?;
            if n == 0 {
                break;
            }
            let written = self.transport.bulk_out(&buf[..n], bulk_timeout)?;
            if written != n {
                return Err(ProtocolError::LengthMismatch {
                    expected: n,
                    actual: written,
                });
            }
            sent += n as u64;
            observer.on_event(&FlashEvent::Progress {
                phase: FlashPhase::Flashing,
                operation: piece.to_string(),
                current: sent,
                total,
            });
        }

        self.transport
            .control_out(NOLO_FLASH_PIECE, 0, 0, &[], self.control_timeout())?;
        self.check_status()?;

        info!(piece, sent, "Piece flashed");
        Ok(())
    }

    fn get_field(&mut self, field: ConfigField) -> Result<String, ProtocolError> {
        let request = match field {
            ConfigField::NoloVersion => NOLO_GET_VERSION,
            _ => NOLO_GET,
        };
        let value = self.query_string(request, field.wire_index())?;
        debug!(%field, %value, "NOLO get");
        Ok(value)
    }

    fn set_field(&mut self, field: ConfigField, value: &str) -> Result<(), ProtocolError> {
        if self.config.simulate {
            info!(%field, value, "Simulation: skipping NOLO set");
            return Ok(());
        }
        self.transport.control_out(
            NOLO_SET,
            field.wire_index(),
            0,
            value.as_bytes(),
            self.control_timeout(),
        )?;
        self.check_status()
    }

    fn reboot(&mut self, update_mode: bool) -> Result<(), ProtocolError> {
        if self.config.simulate {
            info!(update_mode, "Simulation: skipping NOLO reboot");
            return Ok(());
        }
        let mode = if update_mode {
            NOLO_REBOOT_UPDATE
        } else {
            NOLO_REBOOT_NORMAL
        };
        self.transport
            .control_out(NOLO_REBOOT, mode, 0, &[], self.control_timeout())?;
        Ok(())
    }

    fn boot(&mut self, cmdline: Option<&str>) -> Result<(), ProtocolError> {
        if self.config.simulate {
            info!(?cmdline, "Simulation: skipping NOLO boot");
            return Ok(());
        }
        let data = cmdline.map(|c| c.as_bytes().to_vec()).unwrap_or_default();
        self.transport
            .control_out(NOLO_BOOT, 0, 0, &data, self.control_timeout())?;
        Ok(())
    }

    fn switch_mode(&mut self, target: ProtocolKind) -> Result<(), ProtocolError> {
        info!(%target, "NOLO mode switch");
        if self.config.simulate {
            return Ok(());
        }
        let mode = match target {
            ProtocolKind::RawDisk => NOLO_REBOOT_RAW_DISK,
            _ => NOLO_REBOOT_UPDATE,
        };
        self.transport
            .control_out(NOLO_REBOOT, mode, 0, &[], self.control_timeout())?;
        Ok(())
    }
}
