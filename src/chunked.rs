//! Firmware and pixel transfers in large chunks over the packet protocol.
use std::{
    io::{Read, Seek, SeekFrom},
    path::Path,
    sync::Arc,
    thread::{self, JoinHandle},
    time::Duration,
};

use anyhow::Result;
use parking_lot::Mutex;

use crate::{
    boot::BootControl,
    config::Timeouts,
    constants::{commands, CHUNK_SIZE},
    error::{FlashError, ProtocolError},
    format,
    progress::{FlashSession, ProgressHandle},
    protocol::{ChunkSource, Command, PacketProtocol, Response},
};

const GENERIC_FAILURE: &str = "Firmware update failed";
/// Leading bytes of each chunk included in trace dumps.
const TRACE_DUMP_LEN: usize = 64;

/// Bytes staged for the packet layer to pull when it serialises a frame.
pub struct StagedChunk<'a> {
    offset: u32,
    data: &'a [u8],
}

impl StagedChunk<'_> {
    pub fn offset(&self) -> u32 {
        self.offset
    }
}

impl ChunkSource for StagedChunk<'_> {
    fn len(&self) -> usize {
        self.data.len()
    }

    fn pull_chunk_data(&self, buffer: &mut [u8]) -> usize {
        if buffer.len() < self.data.len() {
            log::error!(
                "Chunk at offset {} needs {} bytes, caller offered {}",
                self.offset,
                self.data.len(),
                buffer.len()
            );
            return 0;
        }
        buffer[..self.data.len()].copy_from_slice(self.data);
        self.data.len()
    }
}

/// Position within one transfer. Moves forward only, by acknowledged chunks.
#[derive(Debug)]
pub struct ChunkCursor {
    offset: u32,
    total: u64,
}

impl ChunkCursor {
    pub fn new(total: u64) -> Self {
        ChunkCursor { offset: 0, total }
    }

    pub fn offset(&self) -> u32 {
        self.offset
    }

    pub fn is_finished(&self) -> bool {
        self.offset as u64 >= self.total
    }

    /// Reads the next chunk into `buffer`; `None` once the image is exhausted.
    pub fn stage<'b, R: Read>(
        &self,
        image: &mut R,
        buffer: &'b mut [u8],
    ) -> Result<Option<StagedChunk<'b>>> {
        let mut filled = 0;
        while filled < buffer.len() {
            match image.read(&mut buffer[filled..])? {
                0 => break,
                n => filled += n,
            }
        }
        if filled == 0 {
            return Ok(None);
        }
        Ok(Some(StagedChunk {
            offset: self.offset,
            data: &buffer[..filled],
        }))
    }

    fn advance(&mut self, len: usize) -> Result<()> {
        self.offset = u32::try_from(len)
            .ok()
            .and_then(|len| self.offset.checked_add(len))
            .ok_or_else(|| anyhow::format_err!("transfer offset overflow"))?;
        Ok(())
    }

    fn percentage(&self) -> u8 {
        if self.total == 0 {
            return 100;
        }
        ((self.offset as u64).min(self.total) * 100 / self.total) as u8
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkReport {
    pub chunks: usize,
    pub bytes: u64,
}

pub struct ChunkedFlasher<P: PacketProtocol, B: BootControl> {
    protocol: P,
    boot: B,
    progress: ProgressHandle,
    timeouts: Timeouts,
    buffer: Option<Vec<u8>>,
}

impl<P: PacketProtocol, B: BootControl> ChunkedFlasher<P, B> {
    pub fn new(protocol: P, boot: B, progress: ProgressHandle, timeouts: Timeouts) -> Self {
        ChunkedFlasher {
            protocol,
            boot,
            progress,
            timeouts,
            buffer: None,
        }
    }

    pub fn progress(&self) -> &ProgressHandle {
        &self.progress
    }

    pub fn flash_firmware<R: Read + Seek>(&mut self, image: R) -> Result<ChunkReport> {
        let session = self.progress.begin()?;
        self.execute(&session, image)
    }

    fn execute<R: Read + Seek>(
        &mut self,
        session: &FlashSession,
        mut image: R,
    ) -> Result<ChunkReport> {
        let result = self.run(session, &mut image);
        drop(image);
        match &result {
            Ok(report) => log::info!(
                "Companion updated successfully ({} chunks, {} bytes)",
                report.chunks,
                report.bytes
            ),
            Err(e) => {
                log::error!("Update failed: {:#}", e);
                session.fail_if_unset(GENERIC_FAILURE);
            }
        }
        result
    }

    fn run<R: Read + Seek>(
        &mut self,
        session: &FlashSession,
        image: &mut R,
    ) -> Result<ChunkReport> {
        let total = image.seek(SeekFrom::End(0))?;
        image.seek(SeekFrom::Start(0))?;
        if total == 0 {
            session.fail("Invalid file size");
            return Err(FlashError::InvalidSize.into());
        }
        log::info!("Firmware size: {} bytes", total);

        self.command(Command::EnterBootloader, self.timeouts.command())
            .inspect_err(|_| session.fail("Failed to enter bootloader"))?;
        log::info!("Companion entered its update loader");

        let mut buffer = self.buffer.take().unwrap_or_else(|| {
            log::debug!("Allocating {} byte chunk buffer", CHUNK_SIZE);
            vec![0u8; CHUNK_SIZE]
        });
        let outcome = self.send_chunks(session, image, total, &mut buffer);
        self.buffer = Some(buffer);

        let report = outcome?;
        session.complete();
        self.boot.enter_application_mode();
        Ok(report)
    }

    fn send_chunks<R: Read>(
        &mut self,
        session: &FlashSession,
        image: &mut R,
        total: u64,
        buffer: &mut [u8],
    ) -> Result<ChunkReport> {
        let mut cursor = ChunkCursor::new(total);
        let mut chunks = 0usize;
        let mut last_reported = None;
        session.update(0, "Sending firmware chunks...");

        while let Some(chunk) = cursor.stage(image, buffer)? {
            let offset = chunk.offset();
            let len = chunk.len();
            trace_chunk(offset, chunk.data);

            if let Err(e) = self.command(
                Command::SendChunk {
                    offset,
                    chunk: &chunk,
                },
                self.timeouts.transfer(),
            ) {
                session.fail("Failed to send chunk");
                let refused = match e.downcast_ref::<ProtocolError>() {
                    Some(ProtocolError::Nack { code, .. }) => Some(*code),
                    _ => None,
                };
                return Err(match refused {
                    Some(code) => FlashError::ChunkRejected { offset, code }.into(),
                    None => e,
                });
            }
            chunks += 1;
            cursor.advance(len)?;

            let percentage = cursor.percentage();
            if last_reported != Some(percentage) {
                log::info!("Chunk progress: {}%", percentage);
                session.update(percentage, "Sending firmware chunks...");
                last_reported = Some(percentage);
            }
        }

        Ok(ChunkReport {
            chunks,
            bytes: cursor.offset() as u64,
        })
    }

    /// Stores transcoded pixels in a background slot.
    pub fn transmit_image(&mut self, slot: u8, pixels: &[u8]) -> Result<()> {
        let mut cursor = ChunkCursor::new(pixels.len() as u64);
        for piece in pixels.chunks(CHUNK_SIZE) {
            let chunk = StagedChunk {
                offset: cursor.offset(),
                data: piece,
            };
            trace_chunk(chunk.offset, piece);
            self.command(
                Command::SendImageChunk {
                    slot,
                    offset: chunk.offset,
                    chunk: &chunk,
                },
                self.timeouts.transfer(),
            )?;
            cursor.advance(piece.len())?;
        }
        log::info!("Sent {} bytes to slot {}", cursor.offset(), slot);
        Ok(())
    }

    /// CRC-32 of the pixels the companion holds in `slot`.
    pub fn query_checksum(&mut self, slot: u8) -> Result<u32> {
        self.protocol.send_command(Command::QueryChecksum { slot })?;
        match self.protocol.wait_for_response(self.timeouts.command())? {
            Response::Err(code, _) => Err(ProtocolError::Nack {
                command: commands::IMAGE_CHECKSUM,
                code,
            }
            .into()),
            reply => reply.checksum(),
        }
    }

    fn command(&mut self, command: Command<'_>, timeout: Duration) -> Result<()> {
        let id = command.id();
        self.protocol.send_command(command)?;
        let response = self.protocol.wait_for_response(timeout)?;
        response.into_payload(id)?;
        self.protocol.service();
        Ok(())
    }
}

impl<P, B> ChunkedFlasher<P, B>
where
    P: PacketProtocol + 'static,
    B: BootControl + 'static,
{
    /// Runs the update on a worker thread. The operation slot is claimed
    /// before the worker starts, so a busy system is reported to the caller.
    pub fn flash_firmware_async<R>(
        this: Arc<Mutex<Self>>,
        image: R,
    ) -> Result<JoinHandle<Result<ChunkReport>>>
    where
        R: Read + Seek + Send + 'static,
    {
        let session = this.lock().progress.begin()?;
        let handle = thread::Builder::new()
            .name("chunked-flash".into())
            .spawn(move || this.lock().execute(&session, image))?;
        Ok(handle)
    }

    /// Opens `path` (any supported firmware format) and updates in the background.
    pub fn flash_file_async<Q: AsRef<Path>>(
        this: Arc<Mutex<Self>>,
        path: Q,
        base_address: u32,
    ) -> Result<JoinHandle<Result<ChunkReport>>> {
        let image = format::open_firmware(path, base_address)?;
        Self::flash_firmware_async(this, image)
    }
}

fn trace_chunk(offset: u32, data: &[u8]) {
    if !log::log_enabled!(log::Level::Trace) {
        return;
    }
    let mut dump = Vec::new();
    if hxdmp::hexdump(&data[..data.len().min(TRACE_DUMP_LEN)], &mut dump).is_ok() {
        log::trace!(
            "chunk @{} ({} bytes):\n{}",
            offset,
            data.len(),
            String::from_utf8_lossy(&dump)
        );
    }
}
