//! Cold-flash protocol.
//!
//! Talks to the bare OMAP boot ROM: upload a second-stage bootloader via the
//! peripheral boot command, ping it until it answers, then hand it the
//! secondary bootloader framed with CRC32-stamped messages. Any transfer
//! length mismatch aborts the whole attempt; the caller restarts the
//! sequence from device detection.

use std::fmt;
use std::time::Duration;

use byteorder::{LittleEndian, WriteBytesExt};
use tracing::{debug, info, warn};

use super::constants::*;
use super::{FlashProtocol, Operation, ProtocolError, ProtocolKind};
use crate::checksum::crc32;
use crate::config::FlashConfig;
use crate::events::{FlashEvent, FlashObserver, FlashPhase};
use crate::image::Image;
use crate::transport::UsbTransport;
use crate::types::ImageType;

/// Steps of the cold-flash sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColdFlashState {
    WaitDevice,
    ReadAsicId,
    SendSecondBootloader,
    PingUntilPong,
    SendSecondary,
    Done,
}

impl fmt::Display for ColdFlashState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColdFlashState::WaitDevice => write!(f, "WAIT_DEVICE"),
            ColdFlashState::ReadAsicId => write!(f, "READ_ASIC_ID"),
            ColdFlashState::SendSecondBootloader => write!(f, "SEND_2ND"),
            ColdFlashState::PingUntilPong => write!(f, "PING"),
            ColdFlashState::SendSecondary => write!(f, "SEND_SECONDARY"),
            ColdFlashState::Done => write!(f, "DONE"),
        }
    }
}

/// Second-stage message header: type, payload size, payload CRC, then a CRC
/// over the first three words. 16 bytes on the wire, little-endian.
struct BootMsg {
    msg_type: u32,
    size: u32,
    data_crc: u32,
}

impl BootMsg {
    fn new(msg_type: u32, data: &[u8]) -> Self {
        Self {
            msg_type,
            size: data.len() as u32,
            data_crc: if data.is_empty() { 0 } else { crc32(data) },
        }
    }

    fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(16);
        buf.write_u32::<LittleEndian>(self.msg_type).unwrap();
        buf.write_u32::<LittleEndian>(self.size).unwrap();
        buf.write_u32::<LittleEndian>(self.data_crc).unwrap();
        let header_crc = crc32(&buf);
        buf.write_u32::<LittleEndian>(header_crc).unwrap();
        buf
    }
}

pub struct ColdFlashProtocol {
    transport: Box<dyn UsbTransport>,
    config: FlashConfig,
    state: ColdFlashState,
    staged_xloader: Option<Vec<u8>>,
}

impl ColdFlashProtocol {
    pub fn new(transport: Box<dyn UsbTransport>, config: FlashConfig) -> Self {
        Self {
            transport,
            config,
            state: ColdFlashState::WaitDevice,
            staged_xloader: None,
        }
    }

    fn goto_state(&mut self, new_state: ColdFlashState) {
        info!(from = %self.state, to = %new_state, "Cold-flash state transition");
        self.state = new_state;
    }

    fn write_all(&self, data: &[u8]) -> Result<(), ProtocolError> {
        let written = self
            .transport
            .bulk_out(data, Duration::from_millis(BULK_TIMEOUT_MS))?;
        if written != data.len() {
            return Err(ProtocolError::LengthMismatch {
                expected: data.len(),
                actual: written,
            });
        }
        Ok(())
    }

    fn run_sequence(
        &mut self,
        xloader: &[u8],
        secondary: &[u8],
        observer: &dyn FlashObserver,
    ) -> Result<(), ProtocolError> {
        self.goto_state(ColdFlashState::ReadAsicId);
        let mut asic_id = [0u8; ASIC_ID_LEN];
        let n = self
            .transport
            .bulk_in(&mut asic_id, Duration::from_millis(500))?;
        if n == 0 {
            return Err(ProtocolError::Unexpected {
                expected: "ASIC ID block".to_string(),
                got: "empty read".to_string(),
            });
        }
        debug!(len = n, "Read ASIC ID");

        self.goto_state(ColdFlashState::SendSecondBootloader);
        let mut boot_cmd = Vec::with_capacity(8);
        boot_cmd
            .write_u32::<LittleEndian>(OMAP_PERIPHERAL_BOOT)
            .unwrap();
        boot_cmd
            .write_u32::<LittleEndian>(xloader.len() as u32)
            .unwrap();
        self.write_all(&boot_cmd)?;
        self.write_all(xloader)?;
        observer.on_event(&FlashEvent::Progress {
            phase: FlashPhase::Flashing,
            operation: "2nd bootloader".to_string(),
            current: xloader.len() as u64,
            total: xloader.len() as u64,
        });

        self.goto_state(ColdFlashState::PingUntilPong);
        let ping = BootMsg::new(XLOADER_MSG_PING, &[]).to_bytes();
        let mut got_pong = false;
        'attempts: for attempt in 1..=COLD_FLASH_PING_ATTEMPTS {
            debug!(attempt, "Sending ping");
            self.write_all(&ping)?;
            for _ in 0..COLD_FLASH_PONG_POLLS {
                let mut pong = [0u8; 4];
                match self
                    .transport
                    .bulk_in(&mut pong, Duration::from_millis(COLD_FLASH_PONG_WAIT_MS))
                {
                    Ok(4) => {
                        got_pong = true;
                        break 'attempts;
                    }
                    Ok(n) => {
                        return Err(ProtocolError::LengthMismatch {
                            expected: 4,
                            actual: n,
                        });
                    }
                    Err(e) if e.is_timeout() => continue,
                    Err(e) => return Err(e.into()),
                }
            }
        }
        if !got_pong {
            warn!("Second-stage bootloader never answered the ping");
            return Err(ProtocolError::Unexpected {
                expected: "4-byte pong".to_string(),
                got: "silence".to_string(),
            });
        }

        self.goto_state(ColdFlashState::SendSecondary);
        let init = BootMsg::new(XLOADER_MSG_SEND, secondary).to_bytes();
        self.write_all(&init)?;
        self.write_all(secondary)?;
        observer.on_event(&FlashEvent::Progress {
            phase: FlashPhase::Flashing,
            operation: "secondary".to_string(),
            current: secondary.len() as u64,
            total: secondary.len() as u64,
        });

        let mut ack = [0u8; 4];
        let n = self
            .transport
            .bulk_in(&mut ack, Duration::from_millis(BULK_TIMEOUT_MS))?;
        if n != 4 {
            return Err(ProtocolError::LengthMismatch {
                expected: 4,
                actual: n,
            });
        }

        self.goto_state(ColdFlashState::Done);
        info!("Cold-flash sequence complete, device will boot the secondary");
        Ok(())
    }
}

impl FlashProtocol for ColdFlashProtocol {
    fn kind(&self) -> ProtocolKind {
        ProtocolKind::ColdFlash
    }

    fn supports(&self, operation: Operation) -> bool {
        matches!(operation, Operation::FlashImage)
    }

    /// The boot ROM only loads bootloaders: the x-loader piece is staged,
    /// and the secondary piece triggers the full handshake with the staged
    /// loader. Anything else cannot be cold-flashed.
    fn flash_image(
        &mut self,
        image: &mut Image,
        observer: &dyn FlashObserver,
    ) -> Result<(), ProtocolError> {
        match image.image_type {
            ImageType::Xloader => {
                let data = image.read_all()?;
                info!(len = data.len(), "Staged x-loader for cold flash");
                self.staged_xloader = Some(data);
                Ok(())
            }
            ImageType::Secondary => {
                let xloader = self
                    .staged_xloader
                    .take()
                    .ok_or(ProtocolError::MissingPiece("xloader"))?;
                let secondary = image.read_all()?;
                if self.config.simulate {
                    info!("Simulation: skipping cold-flash sequence");
                    self.state = ColdFlashState::Done;
                    return Ok(());
                }
                let result = self.run_sequence(&xloader, &secondary, observer);
                if result.is_err() {
                    // No partial retry inside the sequence; the next attempt
                    // starts over from device wait.
                    self.state = ColdFlashState::WaitDevice;
                }
                result
            }
            other => Err(ProtocolError::Unexpected {
                expected: "xloader or secondary piece".to_string(),
                got: other.to_string(),
            }),
        }
    }

    fn switch_mode(&mut self, target: ProtocolKind) -> Result<(), ProtocolError> {
        // The only way out of cold-flash mode is booting a loader; once the
        // sequence has run, the device re-enumerates under NOLO.
        if self.state == ColdFlashState::Done {
            info!(%target, "Cold-flash done, device is re-enumerating");
            Ok(())
        } else {
            Err(ProtocolError::MissingPiece(
                "bootloader must be loaded before leaving cold-flash mode",
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NullObserver;
    use crate::image::ImageMeta;
    use crate::transport::MockTransport;
    use std::io::Write as _;

    fn piece(data: &[u8], ty: ImageType) -> Image {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("piece");
        std::fs::File::create(&path).unwrap().write_all(data).unwrap();
        let meta = ImageMeta {
            image_type: Some(ty),
            ..Default::default()
        };
        Image::from_file(&path, meta, &FlashConfig::default()).unwrap()
    }

    fn xloader_piece() -> Image {
        let mut data = vec![0u8; 256];
        data[12..20].copy_from_slice(b"NOLOXldr");
        piece(&data, ImageType::Xloader)
    }

    fn secondary_piece() -> Image {
        let mut data = vec![0u8; 256];
        data[4..12].copy_from_slice(b"NOLOScnd");
        piece(&data, ImageType::Secondary)
    }

    #[test]
    fn test_happy_path_sequence() {
        let mock = MockTransport::new();
        mock.queue_response(&[0xAA; ASIC_ID_LEN]); // ASIC ID
        mock.queue_response(&[0x01, 0x63, 0x00, 0x00]); // pong
        mock.queue_response(&[0x02, 0x63, 0x00, 0x00]); // secondary ack

        let mut cold = ColdFlashProtocol::new(Box::new(mock.clone()), FlashConfig::default());
        cold.flash_image(&mut xloader_piece(), &NullObserver)
            .unwrap();
        cold.flash_image(&mut secondary_piece(), &NullObserver)
            .unwrap();
        assert_eq!(cold.state, ColdFlashState::Done);

        let bulk = mock.bulk_bytes();
        // Peripheral boot command word leads the stream.
        assert_eq!(&bulk[..4], &OMAP_PERIPHERAL_BOOT.to_le_bytes());
        assert_eq!(&bulk[4..8], &256u32.to_le_bytes());
        // Mode switch is now a no-op success.
        cold.switch_mode(ProtocolKind::Nolo).unwrap();
    }

    #[test]
    fn test_ping_timeouts_fail_attempt() {
        let mock = MockTransport::new();
        mock.queue_response(&[0xAA; ASIC_ID_LEN]);
        // No pong ever arrives: every poll times out.

        let mut cold = ColdFlashProtocol::new(Box::new(mock.clone()), FlashConfig::default());
        cold.flash_image(&mut xloader_piece(), &NullObserver)
            .unwrap();
        let err = cold
            .flash_image(&mut secondary_piece(), &NullObserver)
            .unwrap_err();
        assert!(matches!(err, ProtocolError::Unexpected { .. }));
        assert_eq!(cold.state, ColdFlashState::WaitDevice);
    }

    #[test]
    fn test_secondary_without_staged_xloader() {
        let mock = MockTransport::new();
        let mut cold = ColdFlashProtocol::new(Box::new(mock), FlashConfig::default());
        assert!(matches!(
            cold.flash_image(&mut secondary_piece(), &NullObserver),
            Err(ProtocolError::MissingPiece("xloader"))
        ));
    }

    #[test]
    fn test_boot_msg_framing() {
        let msg = BootMsg::new(XLOADER_MSG_PING, &[]).to_bytes();
        assert_eq!(msg.len(), 16);
        assert_eq!(&msg[..4], &XLOADER_MSG_PING.to_le_bytes());
        assert_eq!(&msg[4..8], &0u32.to_le_bytes());
        // Header CRC covers the first three words.
        assert_eq!(&msg[12..], &crc32(&msg[..12]).to_le_bytes());
    }

    #[test]
    fn test_switch_before_load_fails() {
        let mock = MockTransport::new();
        let mut cold = ColdFlashProtocol::new(Box::new(mock), FlashConfig::default());
        assert!(cold.switch_mode(ProtocolKind::Nolo).is_err());
        assert!(cold.supports(Operation::FlashImage));
        assert!(!cold.supports(Operation::Identify));
    }
}
