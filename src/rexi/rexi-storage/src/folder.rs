use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};

use memcard_protocol::card::{BLOCK_SIZE, PAGE_SIZE};
use rexi_core::storage::{check_page, BackingStore, StorageError};

/// Card stored as a directory of 8 KiB block files (`block_0000.raw`, ...).
/// Blocks that were never written have no file and read as erased.
pub struct FolderStore {
    dir: PathBuf,
    data: Vec<u8>,
    touched: Vec<bool>, // blocks written since the last flush
}

fn block_file(dir: &Path, block: usize) -> PathBuf {
    dir.join(format!("block_{:04}.raw", block))
}

impl FolderStore {
    pub fn open(dir: impl AsRef<Path>, size: usize) -> Result<Self, StorageError> {
        let dir = dir.as_ref().to_path_buf();
        let blocks = size / BLOCK_SIZE;
        let mut data = vec![0xFF; size];
        let mut loaded = 0;

        for block in 0..blocks {
            let path = block_file(&dir, block);
            let contents = match fs::read(&path) {
                Ok(contents) => contents,
                Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
                Err(err) => return Err(err.into()),
            };
            if contents.len() != BLOCK_SIZE {
                warn!(
                    "{} is {} bytes, expected {}",
                    path.display(),
                    contents.len(),
                    BLOCK_SIZE
                );
            }
            let n = contents.len().min(BLOCK_SIZE);
            let start = block * BLOCK_SIZE;
            data[start..start + n].copy_from_slice(&contents[..n]);
            loaded += 1;
        }
        info!("Loaded {} blocks from {}", loaded, dir.display());

        Ok(Self {
            dir,
            data,
            touched: vec![false; blocks],
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl BackingStore for FolderStore {
    fn size(&self) -> usize {
        self.data.len()
    }

    fn read_page(&mut self, page: usize, out: &mut [u8]) -> Result<(), StorageError> {
        check_page(page, out.len(), self.pages())?;
        let start = page * PAGE_SIZE;
        out.copy_from_slice(&self.data[start..start + PAGE_SIZE]);
        Ok(())
    }

    fn write_page(&mut self, page: usize, data: &[u8]) -> Result<(), StorageError> {
        check_page(page, data.len(), self.pages())?;
        let start = page * PAGE_SIZE;
        self.data[start..start + PAGE_SIZE].copy_from_slice(data);
        self.touched[start / BLOCK_SIZE] = true;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), StorageError> {
        fs::create_dir_all(&self.dir)?;
        for block in 0..self.touched.len() {
            if !self.touched[block] {
                continue;
            }
            let start = block * BLOCK_SIZE;
            fs::write(
                block_file(&self.dir, block),
                &self.data[start..start + BLOCK_SIZE],
            )?;
            self.touched[block] = false;
            debug!("Wrote block {} to {}", block, self.dir.display());
        }
        Ok(())
    }
}
