//! Wire protocol constants.
//!
//! Request codes and framing words for the three USB protocols. These are
//! frozen for compatibility with deployed bootloaders.

// ============================================================================
// Shared transfer parameters
// ============================================================================

/// Bulk streaming chunk size for piece upload/download.
pub const FLASH_CHUNK_SIZE: usize = 128 * 1024;

/// Default control transfer timeout.
pub const CONTROL_TIMEOUT_MS: u64 = 2000;

/// Default bulk transfer timeout while streaming.
pub const BULK_TIMEOUT_MS: u64 = 10_000;

// ============================================================================
// NOLO vendor control requests
// ============================================================================

/// Query last operation status.
pub const NOLO_STATUS: u8 = 0x01;
/// Clear sticky error status.
pub const NOLO_CLEAR_STATUS: u8 = 0x02;
/// Query bootloader version string.
pub const NOLO_GET_VERSION: u8 = 0x03;
/// Query identification string (`model NUL hwrev NUL version NUL`).
pub const NOLO_IDENTIFY: u8 = 0x04;
/// Set a configuration field (wValue selects the field).
pub const NOLO_SET: u8 = 0x10;
/// Get a configuration field (wValue selects the field).
pub const NOLO_GET: u8 = 0x11;
/// Announce the piece type about to be transferred.
pub const NOLO_SELECT_PIECE: u8 = 0x40;
/// Announce the upcoming transfer length (wValue:wIndex = high:low).
pub const NOLO_SET_LENGTH: u8 = 0x41;
/// Send the `-1`-terminated hardware revision list for the piece.
pub const NOLO_SEND_HWREVS: u8 = 0x42;
/// Commit the uploaded piece to flash.
pub const NOLO_FLASH_PIECE: u8 = 0x43;
/// Boot the kernel, optional cmdline in the data stage.
pub const NOLO_BOOT: u8 = 0x82;
/// Reboot; wValue selects the target mode.
pub const NOLO_REBOOT: u8 = 0x83;

/// NOLO_REBOOT wValue: normal boot.
pub const NOLO_REBOOT_NORMAL: u16 = 0;
/// NOLO_REBOOT wValue: stay in update mode.
pub const NOLO_REBOOT_UPDATE: u16 = 1;
/// NOLO_REBOOT wValue: export storage as a raw disk.
pub const NOLO_REBOOT_RAW_DISK: u16 = 2;

// ============================================================================
// Cold-flash handshake
// ============================================================================

/// OMAP boot ROM peripheral boot command word.
pub const OMAP_PERIPHERAL_BOOT: u32 = 0xF003_0002;

/// ASIC ID block length read from the boot ROM.
pub const ASIC_ID_LEN: usize = 69;

/// Second-stage message type: ping.
pub const XLOADER_MSG_PING: u32 = 0x6301;
/// Second-stage message type: secondary payload follows.
pub const XLOADER_MSG_SEND: u32 = 0x6302;

/// Ping attempts before the sequence is declared dead.
pub const COLD_FLASH_PING_ATTEMPTS: usize = 10;
/// Pong polls per ping attempt.
pub const COLD_FLASH_PONG_POLLS: usize = 10;
/// Per-poll pong wait in milliseconds.
pub const COLD_FLASH_PONG_WAIT_MS: u64 = 5;

// ============================================================================
// Mk II framed messages
// ============================================================================

/// No-op liveness probe.
pub const MKII_PING: u8 = 0x00;
/// Query identification payload (`model:hwrev:version`).
pub const MKII_INFO: u8 = 0x01;
/// Announce a piece upload (type name + length follow).
pub const MKII_SEND: u8 = 0x02;
/// Commit the uploaded piece.
pub const MKII_FLASH: u8 = 0x03;
/// Reboot; payload byte selects the target mode.
pub const MKII_REBOOT: u8 = 0x0C;
/// Response bit set by the device on every reply.
pub const MKII_RESPONSE: u8 = 0x80;
