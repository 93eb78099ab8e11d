//! Checksum-gated background image synchronisation.
use std::{
    fs::File,
    io::BufReader,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use serde::Serialize;

use crate::{
    boot::BootControl,
    chunked::ChunkedFlasher,
    config::AssetSpec,
    error::SyncError,
    image,
    progress::ProgressHandle,
    protocol::PacketProtocol,
};

/// Remote side of the sync: checksum queries and pixel uploads.
pub trait AssetLink {
    fn remote_checksum(&mut self, slot: u8) -> Result<u32>;
    fn transmit_asset(&mut self, slot: u8, pixels: &[u8]) -> Result<()>;
}

impl<P: PacketProtocol, B: BootControl> AssetLink for ChunkedFlasher<P, B> {
    fn remote_checksum(&mut self, slot: u8) -> Result<u32> {
        self.query_checksum(slot)
    }

    fn transmit_asset(&mut self, slot: u8, pixels: &[u8]) -> Result<()> {
        self.transmit_image(slot, pixels)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AssetDescriptor {
    pub name: String,
    pub slot: u8,
    pub local_checksum: u32,
    pub remote_checksum: u32,
}

impl AssetDescriptor {
    pub fn in_sync(&self) -> bool {
        self.local_checksum == self.remote_checksum
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncedAsset {
    #[serde(flatten)]
    pub asset: AssetDescriptor,
    pub transmitted: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub assets: Vec<SyncedAsset>,
}

impl SyncReport {
    pub fn transmitted(&self) -> usize {
        self.assets.iter().filter(|a| a.transmitted).count()
    }

    pub fn skipped(&self) -> usize {
        self.assets.len() - self.transmitted()
    }
}

/// `name` inside `directory`, with a `.png` extension when it has none.
pub fn asset_path(directory: &Path, name: &str) -> PathBuf {
    let path = directory.join(name);
    if path.extension().is_some() {
        path
    } else {
        path.with_extension("png")
    }
}

fn open_asset(path: &Path) -> Result<BufReader<File>> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    Ok(BufReader::new(file))
}

/// Uploads every asset whose transcoded checksum differs from the one the
/// companion reports for its slot. `buffer` must hold the largest asset.
pub fn synchronize_assets<L: AssetLink>(
    link: &mut L,
    progress: &ProgressHandle,
    assets: &[AssetSpec],
    directory: &Path,
    buffer: &mut [u8],
) -> Result<SyncReport> {
    let session = progress.begin()?;
    let mut report = SyncReport::default();

    for (index, spec) in assets.iter().enumerate() {
        session.update(
            (index * 100 / assets.len()) as u8,
            &format!("Checking {}", spec.name),
        );
        let synced = sync_one(link, spec, directory, buffer).inspect_err(|e| {
            log::error!("Sync of {} failed: {:#}", spec.name, e);
            session.fail(&format!("Failed to sync {}", spec.name));
        })?;
        report.assets.push(synced);
    }

    log::info!(
        "Assets synchronised: {} sent, {} unchanged",
        report.transmitted(),
        report.skipped()
    );
    session.complete_with("Assets synchronized");
    Ok(report)
}

fn sync_one<L: AssetLink>(
    link: &mut L,
    spec: &AssetSpec,
    directory: &Path,
    buffer: &mut [u8],
) -> Result<SyncedAsset> {
    let path = asset_path(directory, &spec.name);
    if !path.is_file() {
        return Err(SyncError::MissingAsset {
            name: spec.name.clone(),
        }
        .into());
    }

    let local_checksum = image::checksum_transcoded(open_asset(&path)?)
        .with_context(|| format!("checksumming {}", path.display()))?;
    let remote_checksum = link.remote_checksum(spec.slot)?;
    let asset = AssetDescriptor {
        name: spec.name.clone(),
        slot: spec.slot,
        local_checksum,
        remote_checksum,
    };
    log::debug!(
        "{}: local {:08x}, remote {:08x}",
        asset.name,
        local_checksum,
        remote_checksum
    );

    if asset.in_sync() {
        log::info!("{} is up to date in slot {}", asset.name, asset.slot);
        return Ok(SyncedAsset {
            asset,
            transmitted: false,
        });
    }

    let decoded = image::decode_to_transcoded_pixels(open_asset(&path)?, buffer)
        .with_context(|| format!("decoding {}", path.display()))?;
    log::info!(
        "Sending {} ({}x{}, {} bytes) to slot {}",
        asset.name,
        decoded.width,
        decoded.height,
        decoded.len,
        asset.slot
    );
    link.transmit_asset(asset.slot, decoded.pixels(buffer))?;
    Ok(SyncedAsset {
        asset,
        transmitted: true,
    })
}

#[cfg(test)]
mod tests {
    use std::{collections::HashMap, fs};

    use png::{BitDepth, ColorType};

    use super::*;
    use crate::{
        error::{FlashError, ImageError},
        image::tests::{encode_png, rgb_2x2},
    };

    #[derive(Default)]
    struct MockLink {
        remote: HashMap<u8, u32>,
        queried: Vec<u8>,
        sent: Vec<(u8, Vec<u8>)>,
    }

    impl AssetLink for MockLink {
        fn remote_checksum(&mut self, slot: u8) -> Result<u32> {
            self.queried.push(slot);
            Ok(self.remote.get(&slot).copied().unwrap_or(0))
        }

        fn transmit_asset(&mut self, slot: u8, pixels: &[u8]) -> Result<()> {
            self.sent.push((slot, pixels.to_vec()));
            Ok(())
        }
    }

    fn spec(name: &str, slot: u8) -> AssetSpec {
        AssetSpec {
            name: name.to_string(),
            slot,
        }
    }

    fn assets_dir() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("day.png"), rgb_2x2()).unwrap();
        fs::write(
            dir.path().join("night.png"),
            encode_png(2, 1, ColorType::Grayscale, BitDepth::Eight, None, None, &[3, 4]),
        )
        .unwrap();
        dir
    }

    #[test]
    fn matching_checksum_skips_transmit() {
        let dir = assets_dir();
        let local = image::checksum_transcoded(&rgb_2x2()[..]).unwrap();
        let mut link = MockLink::default();
        link.remote.insert(1, local);

        let mut buffer = vec![0u8; 64];
        let report = synchronize_assets(
            &mut link,
            &ProgressHandle::new(),
            &[spec("day", 1)],
            dir.path(),
            &mut buffer,
        )
        .unwrap();

        assert!(link.sent.is_empty());
        assert_eq!(link.queried, vec![1]);
        assert_eq!(report.skipped(), 1);
        assert!(report.assets[0].asset.in_sync());
    }

    #[test]
    fn changed_asset_is_sent_once() {
        let dir = assets_dir();
        let mut link = MockLink::default();
        link.remote.insert(1, 0xdead_beef);

        let progress = ProgressHandle::new();
        let mut buffer = vec![0u8; 64];
        let report = synchronize_assets(
            &mut link,
            &progress,
            &[spec("day.png", 1)],
            dir.path(),
            &mut buffer,
        )
        .unwrap();

        assert_eq!(link.sent.len(), 1);
        let (slot, pixels) = &link.sent[0];
        assert_eq!(*slot, 1);
        assert_eq!(pixels.len(), 16);
        assert_eq!(image::crc32(pixels), report.assets[0].asset.local_checksum);
        assert_eq!(report.transmitted(), 1);
        assert!(progress.snapshot().complete);
    }

    #[test]
    fn each_asset_is_gated_separately() {
        let dir = assets_dir();
        let day = image::checksum_transcoded(&rgb_2x2()[..]).unwrap();
        let mut link = MockLink::default();
        link.remote.insert(0, day);

        let mut buffer = vec![0u8; 64];
        let report = synchronize_assets(
            &mut link,
            &ProgressHandle::new(),
            &[spec("day", 0), spec("night", 5)],
            dir.path(),
            &mut buffer,
        )
        .unwrap();

        assert_eq!(link.sent.len(), 1);
        assert_eq!(link.sent[0].0, 5);
        assert_eq!(link.sent[0].1, vec![3, 3, 3, 0xff, 4, 4, 4, 0xff]);
        assert_eq!((report.transmitted(), report.skipped()), (1, 1));
    }

    #[test]
    fn missing_asset_stops_sync() {
        let dir = assets_dir();
        let mut link = MockLink::default();
        let progress = ProgressHandle::new();
        let mut buffer = vec![0u8; 64];

        let err = synchronize_assets(
            &mut link,
            &progress,
            &[spec("sunset", 2), spec("day", 1)],
            dir.path(),
            &mut buffer,
        )
        .unwrap_err();

        assert!(matches!(
            err.downcast_ref::<SyncError>(),
            Some(SyncError::MissingAsset { name }) if name == "sunset"
        ));
        assert!(link.queried.is_empty());
        assert!(progress.snapshot().error);
    }

    #[test]
    fn undersized_buffer_is_reported() {
        let dir = assets_dir();
        let mut link = MockLink::default();
        let mut buffer = vec![0u8; 8];

        let err = synchronize_assets(
            &mut link,
            &ProgressHandle::new(),
            &[spec("day", 1)],
            dir.path(),
            &mut buffer,
        )
        .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ImageError>(),
            Some(ImageError::BufferTooSmall { required: 16, .. })
        ));
        assert!(link.sent.is_empty());
    }

    #[test]
    fn concurrent_operation_is_refused() {
        let dir = assets_dir();
        let progress = ProgressHandle::new();
        let _flash = progress.begin().unwrap();

        let err = synchronize_assets(
            &mut MockLink::default(),
            &progress,
            &[spec("day", 1)],
            dir.path(),
            &mut [0u8; 64],
        )
        .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<FlashError>(),
            Some(FlashError::Busy)
        ));
    }

    #[test]
    fn asset_names_get_png_extension() {
        let dir = Path::new("/data/assets");
        assert_eq!(asset_path(dir, "day"), dir.join("day.png"));
        assert_eq!(asset_path(dir, "day.png"), dir.join("day.png"));
    }
}
