//! Firmware delivery and background-image sync for a dashboard display companion.

pub mod boot;
pub mod bootloader;
pub mod chunked;
pub mod config;
pub mod constants;
pub mod error;
pub mod flashing;
pub mod format;
pub mod image;
pub mod progress;
pub mod protocol;
pub mod sync;
pub mod transport;

pub use self::boot::{BootControl, BootModeController};
pub use self::chunked::ChunkedFlasher;
pub use self::config::Config;
pub use self::flashing::BlockFlasher;
pub use self::progress::{FlashProgress, ProgressHandle};
pub use self::protocol::{Command, Response};
pub use self::sync::{synchronize_assets, SyncReport};
pub use self::transport::SerialTransport;
