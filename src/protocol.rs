//! Packet protocol spoken with the companion's application firmware.
//!
//! Request:  `A5 5A | cmd | len u16 | payload | sum8`
//! Response: `A5 5A | cmd | status | len u16 | payload | sum8`
//!
//! `sum8` is the wrapping byte sum of everything after the sync word.

use std::{
    fmt,
    time::{Duration, Instant},
};

use anyhow::Result;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use scroll::{Pread, Pwrite, LE};

use crate::{
    constants::{commands, frame, CHUNK_SIZE},
    error::ProtocolError,
    transport::{ByteSink, LinkMode, SharedTransport},
};

/// Largest response payload accepted before the parser resynchronises.
const MAX_RESPONSE_PAYLOAD: usize = 1024;
/// A frame left incomplete for this long is abandoned on the next tick.
const STALL_TIMEOUT: Duration = Duration::from_millis(200);
const RESPONSE_QUEUE_DEPTH: usize = 8;

/// Supplies the bytes of a staged chunk when a frame is serialised.
pub trait ChunkSource {
    fn len(&self) -> usize;

    /// Copies the staged bytes into `buffer`, returning the count written.
    /// Returns 0 without writing when `buffer` cannot hold the whole chunk.
    fn pull_chunk_data(&self, buffer: &mut [u8]) -> usize;
}

pub enum Command<'a> {
    /// Ask the application to reboot into its own update loader.
    EnterBootloader,
    /// Program one firmware chunk at a byte offset from the image start.
    SendChunk {
        offset: u32,
        chunk: &'a dyn ChunkSource,
    },
    /// Ask for the CRC-32 of the pixels stored in a background slot.
    QueryChecksum { slot: u8 },
    /// Store one chunk of transcoded pixels into a background slot.
    SendImageChunk {
        slot: u8,
        offset: u32,
        chunk: &'a dyn ChunkSource,
    },
}

impl fmt::Debug for Command<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::EnterBootloader => write!(f, "EnterBootloader"),
            Command::SendChunk { offset, chunk } => {
                write!(f, "SendChunk(@{}, {} bytes)", offset, chunk.len())
            }
            Command::QueryChecksum { slot } => write!(f, "QueryChecksum(slot {})", slot),
            Command::SendImageChunk {
                slot,
                offset,
                chunk,
            } => write!(
                f,
                "SendImageChunk(slot {}, @{}, {} bytes)",
                slot,
                offset,
                chunk.len()
            ),
        }
    }
}

impl Command<'_> {
    pub fn id(&self) -> u8 {
        match self {
            Command::EnterBootloader => commands::ENTER_BOOTLOADER,
            Command::SendChunk { .. } => commands::BINARY_SEND_CHUNK,
            Command::QueryChecksum { .. } => commands::IMAGE_CHECKSUM,
            Command::SendImageChunk { .. } => commands::IMAGE_SEND_CHUNK,
        }
    }

    /// Serialises the request frame into `out`, pulling chunk data as needed.
    pub fn encode(&self, out: &mut Vec<u8>) -> Result<()> {
        out.clear();
        out.extend_from_slice(&frame::SYNC);
        out.push(self.id());
        out.extend_from_slice(&[0, 0]);

        match self {
            Command::EnterBootloader => {}
            Command::SendChunk { offset, chunk } => {
                out.extend_from_slice(&offset.to_le_bytes());
                pull_into(out, *chunk)?;
            }
            Command::QueryChecksum { slot } => out.push(*slot),
            Command::SendImageChunk {
                slot,
                offset,
                chunk,
            } => {
                out.push(*slot);
                out.extend_from_slice(&offset.to_le_bytes());
                pull_into(out, *chunk)?;
            }
        }

        let len = out.len() - frame::REQUEST_HEADER_LEN;
        let len = u16::try_from(len)
            .map_err(|_| anyhow::format_err!("payload of {} bytes does not fit a frame", len))?;
        out.pwrite_with(len, 3, LE)?;
        out.push(sum8(&out[2..]));
        Ok(())
    }
}

fn pull_into(out: &mut Vec<u8>, chunk: &dyn ChunkSource) -> Result<()> {
    let start = out.len();
    out.resize(start + chunk.len(), 0);
    let n = chunk.pull_chunk_data(&mut out[start..]);
    anyhow::ensure!(
        n == chunk.len(),
        "chunk source produced {} of {} bytes",
        n,
        chunk.len()
    );
    Ok(())
}

fn sum8(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, &val| acc.wrapping_add(val))
}

/// Response to a Command. The request cmd type is carried alongside.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Response {
    /// Status = 0x00
    Ok(Vec<u8>),
    /// Otherwise
    Err(u8, Vec<u8>),
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Response::Ok(data) => write!(f, "OK[{}]", hex::encode(data)),
            Response::Err(code, data) => write!(f, "ERROR({:x})[{}]", code, hex::encode(data)),
        }
    }
}

impl Response {
    pub fn is_ok(&self) -> bool {
        matches!(self, Response::Ok(_))
    }

    pub fn payload(&self) -> &[u8] {
        match self {
            Response::Ok(payload) => payload,
            Response::Err(_, payload) => payload,
        }
    }

    /// Payload of an OK response; a refusal becomes [`ProtocolError::Nack`].
    pub fn into_payload(self, command: u8) -> Result<Vec<u8>> {
        match self {
            Response::Ok(payload) => Ok(payload),
            Response::Err(code, _) => Err(ProtocolError::Nack { command, code }.into()),
        }
    }

    /// Reads the CRC-32 carried by an `IMAGE_CHECKSUM` reply.
    pub fn checksum(&self) -> Result<u32> {
        let payload = self.payload();
        if payload.len() < 4 {
            return Err(ProtocolError::ShortPayload {
                expected: 4,
                got: payload.len(),
            }
            .into());
        }
        Ok(payload.pread_with::<u32>(0, LE)?)
    }
}

/// Builds a response frame, as the companion would send it.
pub fn encode_response(command: u8, status: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(frame::RESPONSE_HEADER_LEN + payload.len() + 1);
    out.extend_from_slice(&frame::SYNC);
    out.push(command);
    out.push(status);
    out.extend_from_slice(&(payload.len() as u16).to_le_bytes());
    out.extend_from_slice(payload);
    out.push(sum8(&out[2..]));
    out
}

/// Byte-at-a-time response frame decoder.
#[derive(Debug, Default)]
pub struct FrameParser {
    buf: Vec<u8>,
    last_byte: Option<Instant>,
}

impl FrameParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, byte: u8) -> Option<(u8, Response)> {
        self.last_byte = Some(Instant::now());
        match self.buf.len() {
            0 => {
                if byte == frame::SYNC[0] {
                    self.buf.push(byte);
                }
                return None;
            }
            1 => {
                self.buf.clear();
                if byte == frame::SYNC[1] {
                    self.buf.extend_from_slice(&frame::SYNC);
                } else if byte == frame::SYNC[0] {
                    self.buf.push(byte);
                }
                return None;
            }
            _ => self.buf.push(byte),
        }

        if self.buf.len() < frame::RESPONSE_HEADER_LEN {
            return None;
        }
        let len = u16::from_le_bytes([self.buf[4], self.buf[5]]) as usize;
        if len > MAX_RESPONSE_PAYLOAD {
            log::warn!("Oversized response ({} bytes), resynchronising", len);
            self.buf.clear();
            return None;
        }
        let total = frame::RESPONSE_HEADER_LEN + len + 1;
        if self.buf.len() < total {
            return None;
        }

        let raw = std::mem::take(&mut self.buf);
        if sum8(&raw[2..total - 1]) != raw[total - 1] {
            log::warn!("Response checksum mismatch, dropping frame");
            return None;
        }
        log::debug!("<= {}", hex::encode(&raw));
        let payload = raw[frame::RESPONSE_HEADER_LEN..total - 1].to_vec();
        let response = match raw[3] {
            frame::STATUS_OK => Response::Ok(payload),
            code => Response::Err(code, payload),
        };
        Some((raw[2], response))
    }

    /// Drops a partial frame that has seen no bytes for `idle`.
    pub fn reset_if_stalled(&mut self, idle: Duration) -> bool {
        match self.last_byte {
            Some(at) if !self.buf.is_empty() && at.elapsed() >= idle => {
                log::warn!("Discarding stalled partial frame ({} bytes)", self.buf.len());
                self.buf.clear();
                true
            }
            _ => false,
        }
    }
}

/// Consumer-side half of a [`Link`]: parses bytes, forwards complete replies.
pub struct ResponseSink {
    parser: FrameParser,
    replies: Sender<(u8, Response)>,
}

impl ResponseSink {
    pub fn new(replies: Sender<(u8, Response)>) -> Self {
        ResponseSink {
            parser: FrameParser::new(),
            replies,
        }
    }
}

impl ByteSink for ResponseSink {
    fn feed_byte(&mut self, byte: u8) {
        if let Some(reply) = self.parser.push(byte) {
            if let Err(TrySendError::Full(_)) = self.replies.try_send(reply) {
                log::warn!("Response queue full, dropping reply");
            }
        }
    }

    fn service(&mut self) {
        self.parser.reset_if_stalled(STALL_TIMEOUT);
    }
}

/// Contract of the companion packet-protocol library.
pub trait PacketProtocol: Send {
    fn send_command(&mut self, command: Command<'_>) -> Result<()>;
    /// Blocks for the reply to the last command sent. A timeout is final.
    fn wait_for_response(&mut self, timeout: Duration) -> Result<Response>;
    fn service(&mut self) {}
}

/// Framed protocol over the serial transport in application mode.
pub struct Link {
    transport: SharedTransport,
    replies: Receiver<(u8, Response)>,
    frame: Vec<u8>,
    pending: Option<u8>,
}

impl Link {
    /// Switches the transport to application mode with this link's parser.
    pub fn attach(transport: &SharedTransport) -> Result<Self> {
        let (tx, rx) = bounded(RESPONSE_QUEUE_DEPTH);
        transport
            .lock()
            .start(LinkMode::Application, Some(Box::new(ResponseSink::new(tx))))?;
        Ok(Link {
            transport: transport.clone(),
            replies: rx,
            frame: Vec::with_capacity(frame::REQUEST_HEADER_LEN + 5 + CHUNK_SIZE + 1),
            pending: None,
        })
    }
}

impl PacketProtocol for Link {
    fn send_command(&mut self, command: Command<'_>) -> Result<()> {
        while self.replies.try_recv().is_ok() {}

        command.encode(&mut self.frame)?;
        log::debug!("=> {:?} ({} byte frame)", command, self.frame.len());
        let sent = self.transport.lock().transmit(&self.frame)?;
        anyhow::ensure!(sent == self.frame.len(), "short write: {} of {}", sent, self.frame.len());
        self.pending = Some(command.id());
        Ok(())
    }

    fn wait_for_response(&mut self, timeout: Duration) -> Result<Response> {
        let command = self
            .pending
            .take()
            .ok_or_else(|| anyhow::format_err!("no command awaiting a response"))?;
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.replies.recv_timeout(remaining) {
                Ok((id, response)) if id == command => return Ok(response),
                Ok((id, _)) => {
                    log::warn!(
                        "Discarding reply to {:#04x} while waiting for {:#04x}",
                        id,
                        command
                    );
                }
                Err(RecvTimeoutError::Timeout) => {
                    return Err(ProtocolError::Timeout { command, timeout }.into())
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(ProtocolError::Disconnected.into())
                }
            }
        }
    }
}
