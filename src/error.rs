//! Failures callers are expected to tell apart.
use std::time::Duration;

use thiserror::Error;

/// Setup and transport failures of a flash operation.
#[derive(Error, Debug)]
pub enum FlashError {
    #[error("Invalid file size")]
    InvalidSize,
    #[error("Failed to open firmware file")]
    Open(#[source] std::io::Error),
    #[error("Another flash or sync operation is already running")]
    Busy,
    #[error("Failed to write block at {address:#010x}")]
    WriteBlock { address: u32 },
    #[error("Verification failed at {address:#010x}")]
    VerifyFailed { address: u32 },
    #[error("Chunk at offset {offset} rejected with code {code:#04x}")]
    ChunkRejected { offset: u32, code: u8 },
    #[error("Firmware starts at {found:#010x}, expected application base {expected:#010x}")]
    BaseMismatch { expected: u32, found: u32 },
}

/// Failures talking to the companion device.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("No response to command {command:#04x} within {timeout:?}")]
    Timeout { command: u8, timeout: Duration },
    #[error("Command {command:#04x} refused with code {code:#04x}")]
    Nack { command: u8, code: u8 },
    #[error("Response channel disconnected")]
    Disconnected,
    #[error("Response payload too short: expected {expected}, got {got}")]
    ShortPayload { expected: usize, got: usize },
}

/// Failures decoding or transcoding a PNG asset.
#[derive(Error, Debug)]
pub enum ImageError {
    #[error("Not a PNG file")]
    BadSignature,
    #[error("Provided buffer too small. Required: {required}, Given: {capacity}")]
    BufferTooSmall { required: usize, capacity: usize },
    #[error("Interlaced PNG images are not supported")]
    Interlaced,
    #[error("Unsupported decoded layout {color:?}/{depth:?}")]
    UnsupportedLayout {
        color: png::ColorType,
        depth: png::BitDepth,
    },
    #[error("PNG data ended after {decoded} of {height} rows")]
    Truncated { decoded: u32, height: u32 },
    #[error("PNG error during decoding")]
    Decoding(#[from] png::DecodingError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Asset {name} not found in local storage")]
    MissingAsset { name: String },
}
