//! PNG to display-pixel transcoding.
//!
//! Every input representation is normalised to 4 bytes per pixel, opaque
//! where the source has no alpha, then stored blue-green-red-alpha.
use std::io::{self, Cursor, Read};

use crc::{Crc, CRC_32_ISO_HDLC};
use png::{BitDepth, ColorType, Transformations};

use crate::error::ImageError;

pub const PNG_SIGNATURE: [u8; 8] = [0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a];
pub const BYTES_PER_PIXEL: usize = 4;

/// Reflected CRC-32, polynomial 0xEDB88320.
pub static CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

pub fn crc32(bytes: &[u8]) -> u32 {
    CRC32.checksum(bytes)
}

/// Geometry of a decode written into a caller-owned buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedImage {
    pub width: u32,
    pub height: u32,
    /// Bytes written at the start of the buffer.
    pub len: usize,
}

impl DecodedImage {
    pub fn pixels<'a>(&self, buffer: &'a [u8]) -> &'a [u8] {
        &buffer[..self.len]
    }
}

type Source<R> = io::Chain<Cursor<[u8; 8]>, R>;

/// Row-at-a-time decoder producing transcoded rows.
struct Transcoder<R: Read> {
    reader: png::Reader<Source<R>>,
    color: ColorType,
    width: u32,
    height: u32,
    rows: u32,
}

impl<R: Read> Transcoder<R> {
    fn open(mut input: R) -> Result<Self, ImageError> {
        let mut signature = [0u8; 8];
        match input.read_exact(&mut signature) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                return Err(ImageError::BadSignature)
            }
            Err(e) => return Err(e.into()),
        }
        if signature != PNG_SIGNATURE {
            return Err(ImageError::BadSignature);
        }

        let mut decoder = png::Decoder::new(Cursor::new(signature).chain(input));
        decoder.set_transformations(Transformations::EXPAND | Transformations::STRIP_16);
        let reader = decoder.read_info()?;

        let info = reader.info();
        if info.interlaced {
            return Err(ImageError::Interlaced);
        }
        let (width, height) = (info.width, info.height);
        let (color, depth) = reader.output_color_type();
        log::debug!(
            "PNG {}x{} {:?}/{:?}, output {:?}/{:?}",
            width,
            height,
            info.color_type,
            info.bit_depth,
            color,
            depth
        );
        if depth != BitDepth::Eight || color == ColorType::Indexed {
            return Err(ImageError::UnsupportedLayout { color, depth });
        }

        Ok(Transcoder {
            reader,
            color,
            width,
            height,
            rows: 0,
        })
    }

    fn row_bytes(&self) -> usize {
        self.width as usize * BYTES_PER_PIXEL
    }

    fn required(&self) -> usize {
        self.row_bytes() * self.height as usize
    }

    /// Writes the next transcoded row into `dst` (exactly one row long).
    fn next_row_into(&mut self, dst: &mut [u8]) -> Result<bool, ImageError> {
        if self.rows == self.height {
            return Ok(false);
        }
        let color = self.color;
        let Some(row) = self.reader.next_row()? else {
            return Err(ImageError::Truncated {
                decoded: self.rows,
                height: self.height,
            });
        };
        transcode_row(color, row.data(), dst);
        self.rows += 1;
        Ok(true)
    }
}

fn transcode_row(color: ColorType, src: &[u8], dst: &mut [u8]) {
    let pixels = dst.chunks_exact_mut(BYTES_PER_PIXEL);
    match color {
        ColorType::Rgba => {
            for (d, s) in pixels.zip(src.chunks_exact(4)) {
                d.copy_from_slice(s);
            }
        }
        ColorType::Rgb => {
            for (d, s) in pixels.zip(src.chunks_exact(3)) {
                d[..3].copy_from_slice(s);
                d[3] = 0xff;
            }
        }
        ColorType::GrayscaleAlpha => {
            for (d, s) in pixels.zip(src.chunks_exact(2)) {
                d.copy_from_slice(&[s[0], s[0], s[0], s[1]]);
            }
        }
        ColorType::Grayscale => {
            for (d, &g) in pixels.zip(src) {
                d.copy_from_slice(&[g, g, g, 0xff]);
            }
        }
        ColorType::Indexed => {}
    }
    // RGBA -> BGRA
    for px in dst.chunks_exact_mut(BYTES_PER_PIXEL) {
        px.swap(0, 2);
    }
}

/// Decodes `input` into `buffer` as transcoded pixels.
///
/// Nothing is written unless the whole image fits.
pub fn decode_to_transcoded_pixels<R: Read>(
    input: R,
    buffer: &mut [u8],
) -> Result<DecodedImage, ImageError> {
    let mut transcoder = Transcoder::open(input)?;
    let required = transcoder.required();
    if required > buffer.len() {
        return Err(ImageError::BufferTooSmall {
            required,
            capacity: buffer.len(),
        });
    }

    let row_bytes = transcoder.row_bytes();
    if row_bytes > 0 {
        for row in buffer[..required].chunks_exact_mut(row_bytes) {
            transcoder.next_row_into(row)?;
        }
    }
    Ok(DecodedImage {
        width: transcoder.width,
        height: transcoder.height,
        len: required,
    })
}

/// CRC-32 of the bytes [`decode_to_transcoded_pixels`] would produce,
/// computed one row at a time.
pub fn checksum_transcoded<R: Read>(input: R) -> Result<u32, ImageError> {
    let mut transcoder = Transcoder::open(input)?;
    let mut row = vec![0u8; transcoder.row_bytes()];
    let mut digest = CRC32.digest();
    while transcoder.next_row_into(&mut row)? {
        digest.update(&row);
    }
    Ok(digest.finalize())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn encode_png(
        width: u32,
        height: u32,
        color: ColorType,
        depth: BitDepth,
        palette: Option<&[u8]>,
        trns: Option<&[u8]>,
        data: &[u8],
    ) -> Vec<u8> {
        let mut out = Vec::new();
        {
            let mut encoder = png::Encoder::new(&mut out, width, height);
            encoder.set_color(color);
            encoder.set_depth(depth);
            if let Some(palette) = palette {
                encoder.set_palette(palette.to_vec());
            }
            if let Some(trns) = trns {
                encoder.set_trns(trns.to_vec());
            }
            let mut writer = encoder.write_header().unwrap();
            writer.write_image_data(data).unwrap();
        }
        out
    }

    pub(crate) fn rgb_2x2() -> Vec<u8> {
        encode_png(
            2,
            2,
            ColorType::Rgb,
            BitDepth::Eight,
            None,
            None,
            &[10, 20, 30, 40, 50, 60, 70, 80, 90, 100, 110, 120],
        )
    }

    fn decode(png: &[u8]) -> Vec<u8> {
        let mut buffer = vec![0u8; 4096];
        let image = decode_to_transcoded_pixels(png, &mut buffer).unwrap();
        image.pixels(&buffer).to_vec()
    }

    #[test]
    fn opaque_rgb_is_swapped_with_full_alpha() {
        let mut buffer = [0u8; 16];
        let image = decode_to_transcoded_pixels(&rgb_2x2()[..], &mut buffer).unwrap();
        assert_eq!((image.width, image.height, image.len), (2, 2, 16));
        assert_eq!(
            buffer,
            [30, 20, 10, 0xff, 60, 50, 40, 0xff, 90, 80, 70, 0xff, 120, 110, 100, 0xff]
        );
    }

    #[test]
    fn palette_with_transparency_expands() {
        let png = encode_png(
            2,
            1,
            ColorType::Indexed,
            BitDepth::Eight,
            Some(&[255, 0, 0, 0, 0, 255]),
            Some(&[0x80]),
            &[0, 1],
        );
        assert_eq!(decode(&png), vec![0, 0, 255, 0x80, 255, 0, 0, 0xff]);
    }

    #[test]
    fn grayscale_is_replicated() {
        let png = encode_png(2, 1, ColorType::Grayscale, BitDepth::Eight, None, None, &[7, 200]);
        assert_eq!(decode(&png), vec![7, 7, 7, 0xff, 200, 200, 200, 0xff]);
    }

    #[test]
    fn sixteen_bit_is_stripped() {
        let png = encode_png(
            1,
            1,
            ColorType::Rgba,
            BitDepth::Sixteen,
            None,
            None,
            &[0x12, 0x34, 0x56, 0x78, 0x9a, 0xbc, 0xde, 0xf0],
        );
        assert_eq!(decode(&png), vec![0x9a, 0x56, 0x12, 0xde]);
    }

    #[test]
    fn adam7_images_are_rejected() {
        // IHDR data sits at 16..29 with the interlace method last; its CRC follows.
        let mut png = rgb_2x2();
        png[28] = 1;
        let crc = crc32(&png[12..29]);
        png[29..33].copy_from_slice(&crc.to_be_bytes());

        let mut buffer = [0u8; 16];
        assert!(matches!(
            decode_to_transcoded_pixels(&png[..], &mut buffer),
            Err(ImageError::Interlaced)
        ));
        assert!(matches!(
            checksum_transcoded(&png[..]),
            Err(ImageError::Interlaced)
        ));
        assert_eq!(buffer, [0u8; 16]);
    }

    #[test]
    fn checksum_matches_decoded_buffer() {
        let gradient: Vec<u8> = (0..=255u8).collect();
        let fixtures = [
            rgb_2x2(),
            encode_png(16, 16, ColorType::Grayscale, BitDepth::Eight, None, None, &gradient),
            encode_png(
                4,
                2,
                ColorType::Grayscale,
                BitDepth::Four,
                None,
                None,
                &[0x1f, 0x2e, 0x3d, 0x4c],
            ),
            encode_png(
                8,
                8,
                ColorType::GrayscaleAlpha,
                BitDepth::Eight,
                None,
                None,
                &gradient[..128],
            ),
            encode_png(
                4,
                1,
                ColorType::Indexed,
                BitDepth::Eight,
                Some(&[1, 2, 3, 4, 5, 6, 7, 8, 9]),
                Some(&[0, 0x40]),
                &[0, 1, 2, 1],
            ),
            encode_png(2, 2, ColorType::Rgb, BitDepth::Sixteen, None, None, &gradient[..24]),
            encode_png(8, 8, ColorType::Rgba, BitDepth::Eight, None, None, &gradient),
        ];

        for png in &fixtures {
            let mut buffer = vec![0u8; 1024];
            let image = decode_to_transcoded_pixels(&png[..], &mut buffer).unwrap();
            assert_eq!(
                checksum_transcoded(&png[..]).unwrap(),
                crc32(image.pixels(&buffer))
            );
        }
    }

    #[test]
    fn crc_is_ieee() {
        assert_eq!(crc32(b"123456789"), 0xcbf4_3926);
    }

    #[test]
    fn non_png_is_rejected() {
        let mut buffer = [0u8; 64];
        for input in [&b"GIF89a\x01\x00\x01\x00"[..], &b"\x89PN"[..], &[][..]] {
            assert!(matches!(
                decode_to_transcoded_pixels(input, &mut buffer),
                Err(ImageError::BadSignature)
            ));
            assert!(matches!(
                checksum_transcoded(input),
                Err(ImageError::BadSignature)
            ));
        }
    }

    #[test]
    fn small_buffer_is_left_untouched() {
        let mut buffer = [0xaau8; 15];
        let err = decode_to_transcoded_pixels(&rgb_2x2()[..], &mut buffer).unwrap_err();
        assert!(matches!(
            err,
            ImageError::BufferTooSmall {
                required: 16,
                capacity: 15
            }
        ));
        assert_eq!(buffer, [0xaa; 15]);
    }

    #[test]
    fn truncated_data_fails() {
        let png = encode_png(16, 16, ColorType::Rgb, BitDepth::Eight, None, None, &[0x55; 768]);
        let cut = &png[..png.len() / 2];
        let mut buffer = vec![0u8; 1024];
        assert!(decode_to_transcoded_pixels(cut, &mut buffer).is_err());
        assert!(checksum_transcoded(cut).is_err());
    }
}
