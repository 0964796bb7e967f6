//! Protocol constants for the OTA characteristic pair.

// ============================================================================
// GATT layout (informational, the wireless stack owns registration)
// ============================================================================

/// OTA service UUID.
pub const OTA_SERVICE_UUID: &str = "4fafc201-1fb5-459e-8fcc-c5c9c331914b";
/// Inbound (write-only) characteristic.
pub const OTA_RX_CHAR_UUID: &str = "beb5483e-36e1-4688-b7f5-ea07361b26a8";
/// Outbound (notify-only) status characteristic.
pub const OTA_TX_CHAR_UUID: &str = "e32d6400-0a1c-43af-a591-8634cc4b7af4";

// ============================================================================
// Size Constants
// ============================================================================

/// Largest attribute value a single write may carry.
pub const MAX_ATTR_VALUE_LEN: usize = 512;

/// Sequence header prepended to every chunk in sequenced framing (u32 LE).
pub const SEQ_HEADER_LEN: usize = 4;

/// Longest accepted handshake message.
pub const MAX_HANDSHAKE_LEN: usize = 64;

/// Field separator of the sequenced handshake (`<size>:<chunks>:<crc32>`).
pub const HANDSHAKE_SEPARATOR: char = ':';

// ============================================================================
// Staging / flash
// ============================================================================

/// Default staged image file name.
pub const STAGING_FILE_NAME: &str = "firmware.bin";

/// First byte of an ESP application image.
pub const ESP_IMAGE_MAGIC: u8 = 0xE9;

/// Default block size when streaming the staged image into flash.
pub const FLASH_WRITE_BLOCK: usize = 4096;
