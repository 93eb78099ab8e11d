//! Firmware file formats
use std::{
    borrow::Cow,
    fs::File,
    io::{self, Cursor, Read, Seek, SeekFrom},
    path::Path,
    str,
};

use anyhow::Result;
use object::{
    elf::FileHeader32, elf::PT_LOAD, read::elf::FileHeader, read::elf::ProgramHeader, Endianness,
};

use crate::{constants::PAGE_FILL, error::FlashError};

/// Bytes inspected when guessing the format.
const SNIFF_LEN: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FirmwareFormat {
    PlainHex,
    IntelHex,
    ELF,
    Binary,
}

/// A firmware byte stream ready for the flash engines.
///
/// Raw binaries are streamed from disk; other formats are converted in memory.
pub enum FirmwareSource {
    File(File),
    Memory(Cursor<Vec<u8>>),
}

impl Read for FirmwareSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            FirmwareSource::File(f) => f.read(buf),
            FirmwareSource::Memory(c) => c.read(buf),
        }
    }
}

impl Seek for FirmwareSource {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        match self {
            FirmwareSource::File(f) => f.seek(pos),
            FirmwareSource::Memory(c) => c.seek(pos),
        }
    }
}

/// Opens `path` as firmware destined for `base_address`.
///
/// Formats that carry load addresses must start exactly at `base_address`.
pub fn open_firmware<P: AsRef<Path>>(path: P, base_address: u32) -> Result<FirmwareSource> {
    let p = path.as_ref();
    let mut file = File::open(p).map_err(FlashError::Open)?;

    let mut head = Vec::with_capacity(SNIFF_LEN);
    (&mut file).take(SNIFF_LEN as u64).read_to_end(&mut head)?;
    let format = guess_format(p, &head);
    log::info!("Read {} as {:?} format", p.display(), format);

    if format == FirmwareFormat::Binary {
        file.seek(SeekFrom::Start(0))?;
        return Ok(FirmwareSource::File(file));
    }

    file.seek(SeekFrom::Start(0))?;
    let mut raw = Vec::new();
    file.read_to_end(&mut raw)?;
    let (start, binary) = match format {
        FirmwareFormat::PlainHex => (None, read_hex(&raw)?),
        FirmwareFormat::IntelHex => {
            let (start, binary) = read_ihex(str::from_utf8(&raw)?)?;
            (Some(start), binary)
        }
        FirmwareFormat::ELF => {
            let (start, binary) = objcopy_binary(&raw)?;
            (Some(start), binary)
        }
        FirmwareFormat::Binary => (None, raw),
    };
    if let Some(found) = start {
        if found != base_address {
            return Err(FlashError::BaseMismatch {
                expected: base_address,
                found,
            }
            .into());
        }
    }
    log::info!("Converted firmware: {} bytes", binary.len());
    Ok(FirmwareSource::Memory(Cursor::new(binary)))
}

pub fn guess_format(path: &Path, head: &[u8]) -> FirmwareFormat {
    let ext = path
        .extension()
        .map(|s| s.to_string_lossy())
        .unwrap_or_default()
        .to_lowercase();
    if ["ihex", "ihe", "h86", "hex", "a43", "a90"].contains(&&*ext) {
        return FirmwareFormat::IntelHex;
    }
    if ext == "bin" || head.is_empty() {
        return FirmwareFormat::Binary;
    }

    let is_text = |extra: &[u8]| {
        head.iter()
            .all(|&c| c.is_ascii_hexdigit() || c == b'\n' || c == b'\r' || extra.contains(&c))
    };
    if head.starts_with(&[0x7f, b'E', b'L', b'F']) {
        FirmwareFormat::ELF
    } else if head[0] == b':' && is_text(b":") {
        FirmwareFormat::IntelHex
    } else if is_text(b"") {
        FirmwareFormat::PlainHex
    } else {
        FirmwareFormat::Binary
    }
}

pub fn read_hex(raw: &[u8]) -> Result<Vec<u8>> {
    let digits: Vec<u8> = raw
        .iter()
        .copied()
        .filter(|&c| c != b'\r' && c != b'\n')
        .collect();
    Ok(hex::decode(digits)?)
}

/// Returns the lowest data address and the flattened image.
pub fn read_ihex(data: &str) -> Result<(u32, Vec<u8>)> {
    use ihex::Record;

    let mut base_address = 0;

    let mut records = vec![];
    for record in ihex::Reader::new(data) {
        match record? {
            Record::Data { offset, value } => {
                records.push((base_address + offset as u32, value.into()));
            }
            Record::ExtendedSegmentAddress(address) => {
                base_address = (address as u32) * 16;
            }
            Record::ExtendedLinearAddress(address) => {
                base_address = (address as u32) << 16;
            }
            Record::EndOfFile
            | Record::StartSegmentAddress { .. }
            | Record::StartLinearAddress(_) => (),
        };
    }
    merge_sections(records)
}

/// Simulates `objcopy -O binary`, keyed by physical load address.
pub fn objcopy_binary(elf_data: &[u8]) -> Result<(u32, Vec<u8>)> {
    match object::FileKind::parse(elf_data)? {
        object::FileKind::Elf32 => (),
        _ => anyhow::bail!("cannot read file as ELF32 format"),
    }
    let elf_header = FileHeader32::<Endianness>::parse(elf_data)?;
    let endian = elf_header.endian()?;

    let mut segments = vec![];
    for segment in elf_header.program_headers(endian, elf_data)? {
        if segment.p_type(endian) != PT_LOAD {
            continue;
        }
        let segment_data = segment
            .data(endian, elf_data)
            .map_err(|_| anyhow::format_err!("Failed to access data for an ELF segment."))?;
        if segment_data.is_empty() {
            continue;
        }
        let p_paddr = segment.p_paddr(endian);
        log::debug!(
            "Loadable segment at {:#010x}, {} bytes",
            p_paddr,
            segment_data.len()
        );
        segments.push((p_paddr, Cow::Borrowed(segment_data)));
    }
    merge_sections(segments)
}

/// Lays sections out contiguously, filling gaps with erased-flash bytes.
fn merge_sections(mut sections: Vec<(u32, Cow<[u8]>)>) -> Result<(u32, Vec<u8>)> {
    sections.sort_by_key(|(addr, _)| *addr);

    let (Some(first), Some(last)) = (sections.first(), sections.last()) else {
        anyhow::bail!("firmware contains no data");
    };
    let start_address = first.0;
    let end_address = sections
        .iter()
        .map(|(addr, data)| *addr as u64 + data.len() as u64)
        .max()
        .unwrap_or(last.0 as u64);

    let mut binary = vec![PAGE_FILL; (end_address - start_address as u64) as usize];
    let mut high_water = start_address as u64;
    for (addr, sect) in sections {
        anyhow::ensure!(
            addr as u64 >= high_water,
            "overlapping sections at {:#010x}",
            addr
        );
        let sect_start = (addr - start_address) as usize;
        binary[sect_start..sect_start + sect.len()].copy_from_slice(&sect);
        high_water = addr as u64 + sect.len() as u64;
    }
    Ok((start_address, binary))
}
