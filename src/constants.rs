/// Unit written to one address by the system-bootloader block protocol.
pub const PAGE_SIZE: usize = 256;
/// Fill byte for the unused tail of the final page.
pub const PAGE_FILL: u8 = 0xff;

/// Largest payload staged per packet-protocol chunk.
pub const CHUNK_SIZE: usize = 32768;

/// Half of the 16-bit DMA descriptor limit.
pub const MAX_DMA_TRANSFER: usize = u16::MAX as usize / 2;

/// Application-mode RX ring size, sized for one full chunk response burst.
pub const RX_BUFFER_SIZE: usize = 4 * 1024;
/// Depth of the driver event queue.
pub const EVENT_QUEUE_DEPTH: usize = 32;

pub const DEFAULT_BASE_ADDRESS: u32 = 0x0800_0000;

/// STM32 USART system-bootloader wire constants.
pub mod bootloader {
    pub const SYNC: u8 = 0x7f;
    pub const ACK: u8 = 0x79;
    pub const NACK: u8 = 0x1f;

    pub const READ_MEMORY: u8 = 0x11;
    pub const WRITE_MEMORY: u8 = 0x31;
    pub const EXTENDED_ERASE: u8 = 0x44;

    /// Extended-erase special code selecting a global mass erase.
    pub const MASS_ERASE: u16 = 0xffff;
}

/// Companion packet-protocol framing.
pub mod frame {
    pub const SYNC: [u8; 2] = [0xa5, 0x5a];
    /// sync + cmd + len
    pub const REQUEST_HEADER_LEN: usize = 5;
    /// sync + cmd + status + len
    pub const RESPONSE_HEADER_LEN: usize = 6;
    pub const STATUS_OK: u8 = 0x00;
}

pub mod commands {
    pub const ENTER_BOOTLOADER: u8 = 0x10;
    pub const BINARY_SEND_CHUNK: u8 = 0x11;
    pub const IMAGE_CHECKSUM: u8 = 0x20;
    pub const IMAGE_SEND_CHUNK: u8 = 0x21;
}
