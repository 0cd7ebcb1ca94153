use std::io;
use std::path::{Path, PathBuf};

use log::info;

use rexi_core::exi::DeviceKind;
use rexi_core::storage::{BackingStore, StorageError, StorageProvider};

use crate::{FolderStore, RawImage};

/// Opens card storage on the host filesystem.
///
/// Each slot has an optional path; without one the card falls back to
/// `MemoryCardA.raw` / `MemoryCardB.raw` (raw images) or `CardA/` /
/// `CardB/` (folders) under the base directory.
pub struct FileStoreProvider {
    base_dir: PathBuf,
    paths: [Option<PathBuf>; 2],
}

impl FileStoreProvider {
    pub fn new(base_dir: impl AsRef<Path>) -> Self {
        Self {
            base_dir: base_dir.as_ref().to_path_buf(),
            paths: [None, None],
        }
    }

    /// Uses `path` for the card in slot `card_index` (0 = A)
    pub fn with_card(mut self, card_index: usize, path: impl AsRef<Path>) -> Self {
        if let Some(slot) = self.paths.get_mut(card_index) {
            *slot = Some(path.as_ref().to_path_buf());
        }
        self
    }

    pub fn path_for(&self, card_index: usize, kind: DeviceKind) -> PathBuf {
        if let Some(Some(path)) = self.paths.get(card_index) {
            return path.clone();
        }
        let letter = (b'A' + card_index as u8) as char;
        match kind {
            DeviceKind::MemoryCardFolder => self.base_dir.join(format!("Card{}", letter)),
            _ => self.base_dir.join(format!("MemoryCard{}.raw", letter)),
        }
    }
}

impl StorageProvider for FileStoreProvider {
    fn open(
        &self,
        card_index: usize,
        kind: DeviceKind,
        size: usize,
    ) -> Result<Box<dyn BackingStore>, StorageError> {
        let path = self.path_for(card_index, kind);
        info!("Opening {:?} storage at {}", kind, path.display());
        match kind {
            DeviceKind::MemoryCard => Ok(Box::new(RawImage::open(path, size)?)),
            DeviceKind::MemoryCardFolder => Ok(Box::new(FolderStore::open(path, size)?)),
            DeviceKind::None => Err(StorageError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                "empty slot has no storage",
            ))),
        }
    }
}

#[cfg(test)]
mod provider_tests {
    use super::*;

    #[test]
    fn test_default_paths() {
        let provider = FileStoreProvider::new("/cards");
        assert_eq!(
            provider.path_for(0, DeviceKind::MemoryCard),
            PathBuf::from("/cards/MemoryCardA.raw")
        );
        assert_eq!(
            provider.path_for(1, DeviceKind::MemoryCardFolder),
            PathBuf::from("/cards/CardB")
        );

        let provider = provider.with_card(1, "/elsewhere/b.raw");
        assert_eq!(
            provider.path_for(1, DeviceKind::MemoryCard),
            PathBuf::from("/elsewhere/b.raw")
        );
    }

    #[test]
    fn test_open_matches_kind() {
        let dir = std::env::temp_dir().join(format!("rexi-provider-{}", std::process::id()));
        let provider = FileStoreProvider::new(&dir);
        let store = provider.open(0, DeviceKind::MemoryCardFolder, 0x2000 * 2).unwrap();
        assert_eq!(store.size(), 0x2000 * 2);
        assert!(provider.open(0, DeviceKind::None, 0x2000).is_err());
    }
}
