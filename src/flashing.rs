//! Page-by-page firmware flashing through the companion's system bootloader.

use std::{
    io::{self, Read, Seek, SeekFrom},
    path::Path,
};

use anyhow::Result;

use crate::{
    boot::BootControl,
    bootloader::PageProgrammer,
    constants::{PAGE_FILL, PAGE_SIZE},
    error::FlashError,
    format,
    progress::{FlashSession, ProgressHandle},
};

const GENERIC_FAILURE: &str = "Firmware flash operation failed";

/// Destination flash address of the next page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadAddress(u32);

impl LoadAddress {
    pub fn new(base: u32) -> Self {
        LoadAddress(base)
    }

    pub fn get(self) -> u32 {
        self.0
    }

    pub fn advance(&mut self, step: usize) -> Result<()> {
        self.0 = u32::try_from(step)
            .ok()
            .and_then(|step| self.0.checked_add(step))
            .ok_or_else(|| anyhow::format_err!("load address overflow past {:#010x}", self.0))?;
        Ok(())
    }
}

/// Range of the overall percentage one pass reports into.
#[derive(Debug, Clone, Copy)]
struct Span {
    start: u8,
    end: u8,
}

impl Span {
    fn at(self, done: u64, total: u64) -> u8 {
        let width = (self.end - self.start) as u64;
        self.start + (done.min(total) * width / total) as u8
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlashReport {
    pub pages: usize,
    pub bytes: u64,
    /// Load address after the last page.
    pub end_address: u32,
    pub verified: bool,
}

pub struct BlockFlasher<P: PageProgrammer, B: BootControl> {
    programmer: P,
    boot: B,
    progress: ProgressHandle,
    base_address: u32,
    verify: bool,
}

impl<P: PageProgrammer, B: BootControl> BlockFlasher<P, B> {
    pub fn new(programmer: P, boot: B, progress: ProgressHandle, base_address: u32) -> Self {
        BlockFlasher {
            programmer,
            boot,
            progress,
            base_address,
            verify: false,
        }
    }

    /// Enables the read-back pass. Off trades post-write verification for
    /// roughly half the flashing time.
    pub fn with_verify(mut self, verify: bool) -> Self {
        self.verify = verify;
        self
    }

    pub fn verify_enabled(&self) -> bool {
        self.verify
    }

    pub fn flash_file<Q: AsRef<Path>>(&mut self, path: Q) -> Result<FlashReport> {
        let session = self.progress.begin()?;
        let image = match format::open_firmware(path, self.base_address) {
            Ok(image) => image,
            Err(e) => {
                match e.downcast_ref::<FlashError>() {
                    Some(FlashError::Open(_)) => session.fail("Failed to open firmware file"),
                    Some(other) => session.fail(&other.to_string()),
                    None => session.fail("Failed to read firmware file"),
                }
                return Err(e);
            }
        };
        self.execute(&session, image)
    }

    /// Writes `image` at the application base and, if enabled, verifies it.
    /// The image is dropped before returning, on every path.
    pub fn flash_firmware<R: Read + Seek>(&mut self, image: R) -> Result<FlashReport> {
        let session = self.progress.begin()?;
        self.execute(&session, image)
    }

    fn execute<R: Read + Seek>(
        &mut self,
        session: &FlashSession,
        mut image: R,
    ) -> Result<FlashReport> {
        let result = self.run(session, &mut image);
        log::info!("Closing firmware image");
        drop(image);

        match &result {
            Ok(report) => {
                log::info!(
                    "Companion flashed successfully ({} pages, {} bytes)",
                    report.pages,
                    report.bytes
                );
            }
            Err(e) => {
                log::error!("Flash failed: {:#}", e);
                session.fail_if_unset(GENERIC_FAILURE);
            }
        }
        result
    }

    fn run<R: Read + Seek>(
        &mut self,
        session: &FlashSession,
        image: &mut R,
    ) -> Result<FlashReport> {
        let total = image.seek(SeekFrom::End(0))?;
        image.seek(SeekFrom::Start(0))?;
        if total == 0 {
            log::error!("Invalid file size");
            session.fail("Invalid file size");
            return Err(FlashError::InvalidSize.into());
        }
        log::info!("Firmware size: {} bytes", total);

        let outcome = self
            .programmer
            .start_link()
            .inspect_err(|_| session.fail("Failed to open serial link"))
            .and_then(|()| self.program(session, image, total));

        // Boot lines are modem lines of the open link.
        if outcome.is_ok() {
            self.boot.enter_application_mode();
        }
        log::info!("Ending Connection");
        self.programmer.end_connection();

        let report = outcome?;
        session.complete();
        Ok(report)
    }

    fn program<R: Read + Seek>(
        &mut self,
        session: &FlashSession,
        image: &mut R,
        total: u64,
    ) -> Result<FlashReport> {
        self.boot.enter_bootloader_mode();
        log::info!("Companion set to bootloader mode");

        self.programmer
            .handshake()
            .inspect_err(|_| session.fail("Bootloader setup failed"))?;

        let (write_span, verify_span) = if self.verify {
            (Span { start: 0, end: 50 }, Span { start: 50, end: 100 })
        } else {
            (Span { start: 0, end: 100 }, Span { start: 100, end: 100 })
        };

        session.update(0, "Starting firmware write");
        let mut report = self.write_pass(session, image, total, write_span)?;

        if self.verify {
            image.seek(SeekFrom::Start(0))?;
            self.verify_pass(session, image, total, verify_span)?;
            report.verified = true;
        }
        Ok(report)
    }

    fn write_pass<R: Read>(
        &mut self,
        session: &FlashSession,
        image: &mut R,
        total: u64,
        span: Span,
    ) -> Result<FlashReport> {
        log::info!("Writing companion flash");
        let mut address = LoadAddress::new(self.base_address);
        let mut page = [PAGE_FILL; PAGE_SIZE];
        let mut pages = 0usize;
        let mut last_reported = None;

        while read_page(image, &mut page)? > 0 {
            if let Err(e) = self.programmer.write_page(address.get(), &page) {
                log::error!("Page write at {:#010x} failed: {:#}", address.get(), e);
                session.fail("Failed to write block");
                return Err(FlashError::WriteBlock {
                    address: address.get(),
                }
                .into());
            }
            pages += 1;

            let written = (pages * PAGE_SIZE) as u64;
            let percentage = span.at(written, total);
            if last_reported != Some(percentage) {
                log::info!("Write progress: {}%", percentage);
                session.update(percentage, "Writing to flash...");
                last_reported = Some(percentage);
            }
            address.advance(PAGE_SIZE)?;
        }

        Ok(FlashReport {
            pages,
            bytes: total,
            end_address: address.get(),
            verified: false,
        })
    }

    fn verify_pass<R: Read>(
        &mut self,
        session: &FlashSession,
        image: &mut R,
        total: u64,
        span: Span,
    ) -> Result<()> {
        log::info!("Reading back companion flash");
        let mut address = LoadAddress::new(self.base_address);
        let mut page = [PAGE_FILL; PAGE_SIZE];
        let mut pages = 0usize;
        let mut last_reported = None;

        while read_page(image, &mut page)? > 0 {
            match self.programmer.verify_page(address.get(), &page) {
                Ok(true) => {}
                Ok(false) => {
                    log::error!("Readback mismatch at {:#010x}", address.get());
                    session.fail("Verification failed");
                    return Err(FlashError::VerifyFailed {
                        address: address.get(),
                    }
                    .into());
                }
                Err(e) => {
                    session.fail("Failed to read block");
                    return Err(e);
                }
            }
            pages += 1;

            let percentage = span.at((pages * PAGE_SIZE) as u64, total);
            if last_reported != Some(percentage) {
                session.update(percentage, "Verifying flash...");
                last_reported = Some(percentage);
            }
            address.advance(PAGE_SIZE)?;
        }
        Ok(())
    }
}

/// Fills `page` from `image`; the unread tail is set to the fill byte.
/// Returns the number of image bytes it holds.
fn read_page<R: Read>(image: &mut R, page: &mut [u8; PAGE_SIZE]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < PAGE_SIZE {
        match image.read(&mut page[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    page[filled..].fill(PAGE_FILL);
    Ok(filled)
}
