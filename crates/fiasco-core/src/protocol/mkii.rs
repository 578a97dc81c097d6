//! Mk II protocol.
//!
//! The later update mode speaks framed request/response messages over the
//! bulk endpoints: a big-endian length, a sequence number echoed by the
//! device, a command byte, then the payload. Piece payloads stream raw
//! between the announce and commit messages.

use std::io::Cursor;
use std::time::Duration;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use tracing::{debug, info, warn};

use super::constants::*;
use super::{DeviceIdent, FlashProtocol, Operation, ProtocolError, ProtocolKind};
use crate::config::FlashConfig;
use crate::events::{FlashEvent, FlashObserver, FlashPhase};
use crate::image::Image;
use crate::transport::UsbTransport;
use crate::types::DeviceModel;

pub struct MkiiProtocol {
    transport: Box<dyn UsbTransport>,
    config: FlashConfig,
    sequence: u16,
}

impl MkiiProtocol {
    pub fn new(transport: Box<dyn UsbTransport>, config: FlashConfig) -> Self {
        Self {
            transport,
            config,
            sequence: 0,
        }
    }

    /// Send one framed message and read back its response frame.
    fn exchange(&mut self, command: u8, payload: &[u8]) -> Result<Vec<u8>, ProtocolError> {
        self.sequence = self.sequence.wrapping_add(1);
        let id = self.sequence;

        let mut frame = Vec::with_capacity(5 + payload.len());
        frame.write_u16::<BigEndian>(3 + payload.len() as u16).unwrap();
        frame.write_u16::<BigEndian>(id).unwrap();
        frame.push(command);
        frame.extend_from_slice(payload);

        let timeout = Duration::from_millis(BULK_TIMEOUT_MS);
        let written = self.transport.bulk_out(&frame, timeout)?;
        if written != frame.len() {
            return Err(ProtocolError::LengthMismatch {
                expected: frame.len(),
                actual: written,
            });
        }

        let mut buf = vec![0u8; 2048];
        let n = self.transport.bulk_in(&mut buf, timeout)?;
        if n < 5 {
            return Err(ProtocolError::Unexpected {
                expected: "Mk II response frame".to_string(),
                got: format!("{n} bytes"),
            });
        }

        let mut cursor = Cursor::new(&buf[..n]);
        let length = cursor.read_u16::<BigEndian>()? as usize;
        let response_id = cursor.read_u16::<BigEndian>()?;
        let response_command = cursor.read_u8()?;

        if response_id != id {
            return Err(ProtocolError::Unexpected {
                expected: format!("sequence {id}"),
                got: format!("sequence {response_id}"),
            });
        }
        if response_command != command | MKII_RESPONSE {
            return Err(ProtocolError::Unexpected {
                expected: format!("command 0x{:02X}", command | MKII_RESPONSE),
                got: format!("command 0x{response_command:02X}"),
            });
        }

        let payload_len = length.saturating_sub(3);
        let start = 5;
        let end = (start + payload_len).min(n);
        debug!(command, payload_len, "Mk II exchange complete");
        Ok(buf[start..end].to_vec())
    }
}

impl FlashProtocol for MkiiProtocol {
    fn kind(&self) -> ProtocolKind {
        ProtocolKind::MkII
    }

    fn supports(&self, operation: Operation) -> bool {
        matches!(
            operation,
            Operation::FlashImage | Operation::Identify | Operation::Reboot
        )
    }

    fn identify(&mut self) -> Result<DeviceIdent, ProtocolError> {
        let payload = self.exchange(MKII_INFO, &[])?;
        let text = String::from_utf8_lossy(&payload);
        let mut fields = text.trim_end_matches('\0').split(':');

        let model_text = fields.next().unwrap_or_default();
        let model = model_text.parse().unwrap_or_else(|_| {
            warn!(model = %model_text, "Device reported unknown model");
            DeviceModel::Unknown
        });
        let hwrev = fields.next().and_then(|f| f.trim().parse::<i16>().ok());
        let version = fields.next().map(|f| f.to_string()).filter(|v| !v.is_empty());

        info!(%model, ?hwrev, ?version, "Mk II identification");
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
        info!(piece, total, "Flashing over Mk II");

        if self.config.simulate {
            info!(piece, "Simulation: skipping Mk II piece upload");
            return Ok(());
        }

        // Announce: 12-byte NUL-padded type name plus the payload length.
        let mut announce = vec![0u8; 12];
        announce[..piece.len()].copy_from_slice(piece.as_bytes());
        announce.write_u32::<BigEndian>(total as u32).unwrap();
        self.exchange(MKII_SEND, &announce)?;

        image.seek(0)?;
        let mut sent = 0u64;
        let mut buf = vec![0u8; FLASH_CHUNK_SIZE];
        let timeout = Duration::from_millis(BULK_TIMEOUT_MS);
        loop {
            let n = image.read(&mut buf)?;
            if n == 0 {
                break;
            }
            let written = self.transport.bulk_out(&buf[..n], timeout)?;
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

        self.exchange(MKII_FLASH, piece.as_bytes())?;
        info!(piece, sent, "Piece flashed");
        Ok(())
    }

    fn reboot(&mut self, update_mode: bool) -> Result<(), ProtocolError> {
        if self.config.simulate {
            info!(update_mode, "Simulation: skipping Mk II reboot");
            return Ok(());
        }
        self.exchange(MKII_REBOOT, &[u8::from(update_mode)])?;
        Ok(())
    }

    fn switch_mode(&mut self, target: ProtocolKind) -> Result<(), ProtocolError> {
        info!(%target, "Mk II mode switch");
        if self.config.simulate {
            return Ok(());
        }
        // Rebooting into update mode lands in NOLO; anything else requires
        // the bootloader menu, so update mode is the best reachable state.
        self.exchange(MKII_REBOOT, &[1])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NullObserver;
    use crate::image::{Image, ImageMeta};
    use crate::transport::MockTransport;
    use crate::types::ImageType;
    use std::io::Write as _;

    /// Build a well-formed response frame for sequence `id`.
    fn response(id: u16, command: u8, payload: &[u8]) -> Vec<u8> {
        let mut frame = Vec::new();
        frame
            .write_u16::<BigEndian>(3 + payload.len() as u16)
            .unwrap();
        frame.write_u16::<BigEndian>(id).unwrap();
        frame.push(command | MKII_RESPONSE);
        frame.extend_from_slice(payload);
        frame
    }

    #[test]
    fn test_identify_parses_payload() {
        let mock = MockTransport::new();
        mock.queue_response(&response(1, MKII_INFO, b"RX-51:2204:1.4.14"));
        let mut mkii = MkiiProtocol::new(Box::new(mock.clone()), FlashConfig::default());

        let ident = mkii.identify().unwrap();
        assert_eq!(ident.model, DeviceModel::Rx51);
        assert_eq!(ident.hwrev, Some(2204));
        assert_eq!(ident.version.as_deref(), Some("1.4.14"));
    }

    #[test]
    fn test_sequence_mismatch_rejected() {
        let mock = MockTransport::new();
        mock.queue_response(&response(7, MKII_INFO, b"RX-51"));
        let mut mkii = MkiiProtocol::new(Box::new(mock), FlashConfig::default());

        assert!(matches!(
            mkii.identify(),
            Err(ProtocolError::Unexpected { .. })
        ));
    }

    #[test]
    fn test_flash_announce_and_commit() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("piece");
        std::fs::File::create(&path)
            .unwrap()
            .write_all(&[0x77u8; 64])
            .unwrap();
        let meta = ImageMeta {
            image_type: Some(ImageType::Kernel),
            ..Default::default()
        };
        let mut image = Image::from_file(&path, meta, &FlashConfig::default()).unwrap();

        let mock = MockTransport::new();
        mock.queue_response(&response(1, MKII_SEND, &[]));
        mock.queue_response(&response(2, MKII_FLASH, &[]));
        let mut mkii = MkiiProtocol::new(Box::new(mock.clone()), FlashConfig::default());

        mkii.flash_image(&mut image, &NullObserver).unwrap();

        let bulk = mock.bulk_bytes();
        // Announce frame: length 19, id 1, MKII_SEND, 12-byte name, u32 size.
        assert_eq!(&bulk[..2], &[0x00, 0x13]);
        assert_eq!(bulk[4], MKII_SEND);
        assert_eq!(&bulk[5..11], b"kernel");
        assert_eq!(&bulk[17..21], &128u32.to_be_bytes());
        // 128 payload bytes follow before the commit frame.
        let payload = &bulk[21..21 + 128];
        assert!(payload[..64].iter().all(|&b| b == 0x77));
        assert!(payload[64..].iter().all(|&b| b == 0xFF));
    }

    #[test]
    fn test_support_matrix() {
        let mkii = MkiiProtocol::new(Box::new(MockTransport::new()), FlashConfig::default());
        assert!(mkii.supports(Operation::FlashImage));
        assert!(mkii.supports(Operation::Identify));
        assert!(mkii.supports(Operation::Reboot));
        assert!(!mkii.supports(Operation::DumpImage));
        assert!(!mkii.supports(Operation::GetField));
        assert!(!mkii.supports(Operation::Boot));
    }
}
