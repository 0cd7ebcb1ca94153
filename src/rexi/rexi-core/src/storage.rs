//! Persistent medium behind a memory card.
//!
//! The card keeps its working image in memory and only talks to the store
//! when it loads at construction and when a flush fires. Stores work in
//! 512-byte pages.

use std::cell::RefCell;
use std::rc::Rc;

use memcard_protocol::card::PAGE_SIZE;

use crate::exi::device::DeviceKind;

#[derive(Debug)]
pub enum StorageError {
    Io(std::io::Error),
    PageOutOfRange { page: usize, pages: usize },
    BadPageLength { len: usize },
    WorkerGone, // background writer died
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            StorageError::Io(err) => write!(f, "memory card I/O error: {}", err),
            StorageError::PageOutOfRange { page, pages } => {
                write!(f, "page {} out of range (card has {} pages)", page, pages)
            }
            StorageError::BadPageLength { len } => {
                write!(f, "page buffer is {} bytes, expected {}", len, PAGE_SIZE)
            }
            StorageError::WorkerGone => write!(f, "memory card writer thread stopped"),
        }
    }
}

impl std::error::Error for StorageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StorageError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        StorageError::Io(err)
    }
}

/// Page-addressed persistent storage owned by exactly one card
pub trait BackingStore {
    /// Capacity in bytes
    fn size(&self) -> usize;
    fn read_page(&mut self, page: usize, out: &mut [u8]) -> Result<(), StorageError>;
    fn write_page(&mut self, page: usize, data: &[u8]) -> Result<(), StorageError>;
    /// Commits written pages; may complete in the background
    fn flush(&mut self) -> Result<(), StorageError>;
    /// Blocks until every earlier flush is on the medium
    fn wait_idle(&mut self) -> Result<(), StorageError> {
        Ok(())
    }

    fn pages(&self) -> usize {
        self.size() / PAGE_SIZE
    }
}

/// Opens the store for a card slot when a card device is constructed
pub trait StorageProvider {
    fn open(
        &self,
        card_index: usize,
        kind: DeviceKind,
        size: usize,
    ) -> Result<Box<dyn BackingStore>, StorageError>;
}

pub fn check_page(page: usize, len: usize, pages: usize) -> Result<(), StorageError> {
    if len != PAGE_SIZE {
        return Err(StorageError::BadPageLength { len });
    }
    if page >= pages {
        return Err(StorageError::PageOutOfRange { page, pages });
    }
    Ok(())
}

/// Committed bytes of an in-memory medium, shared so tests can inspect it
pub type SharedMedium = Rc<RefCell<Vec<u8>>>;

/// RAM-only store: written pages are staged and only land on the medium
/// when flushed
pub struct MemoryStore {
    medium: SharedMedium,
    staged: Vec<(usize, Vec<u8>)>,
    fail_flush: bool,
}

impl MemoryStore {
    pub fn erased(size: usize) -> Self {
        Self::on_medium(Rc::new(RefCell::new(vec![0xFF; size])))
    }

    pub fn on_medium(medium: SharedMedium) -> Self {
        Self {
            medium,
            staged: Vec::new(),
            fail_flush: false,
        }
    }

    pub fn medium(&self) -> SharedMedium {
        self.medium.clone()
    }

    /// Makes every following flush fail, for exercising retry paths
    pub fn set_fail_flush(&mut self, fail: bool) {
        self.fail_flush = fail;
    }
}

impl BackingStore for MemoryStore {
    fn size(&self) -> usize {
        self.medium.borrow().len()
    }

    fn read_page(&mut self, page: usize, out: &mut [u8]) -> Result<(), StorageError> {
        check_page(page, out.len(), self.pages())?;
        let start = page * PAGE_SIZE;
        out.copy_from_slice(&self.medium.borrow()[start..start + PAGE_SIZE]);
        Ok(())
    }

    fn write_page(&mut self, page: usize, data: &[u8]) -> Result<(), StorageError> {
        check_page(page, data.len(), self.pages())?;
        self.staged.retain(|(p, _)| *p != page);
        self.staged.push((page, data.to_vec()));
        Ok(())
    }

    fn flush(&mut self) -> Result<(), StorageError> {
        if self.fail_flush {
            return Err(StorageError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "simulated flush failure",
            )));
        }
        let mut medium = self.medium.borrow_mut();
        for (page, data) in self.staged.drain(..) {
            let start = page * PAGE_SIZE;
            medium[start..start + PAGE_SIZE].copy_from_slice(&data);
        }
        Ok(())
    }
}

/// Hands out `MemoryStore`s, one medium per card slot, kept across reopen
pub struct MemoryStoreProvider {
    media: RefCell<Vec<(usize, SharedMedium)>>,
}

impl MemoryStoreProvider {
    pub fn new() -> Self {
        Self {
            media: RefCell::new(Vec::new()),
        }
    }

    pub fn medium(&self, card_index: usize) -> Option<SharedMedium> {
        let media = self.media.borrow();
        media
            .iter()
            .find(|(idx, _)| *idx == card_index)
            .map(|(_, m)| m.clone())
    }
}

impl Default for MemoryStoreProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageProvider for MemoryStoreProvider {
    fn open(
        &self,
        card_index: usize,
        _kind: DeviceKind,
        size: usize,
    ) -> Result<Box<dyn BackingStore>, StorageError> {
        if let Some(medium) = self.medium(card_index) {
            return Ok(Box::new(MemoryStore::on_medium(medium)));
        }
        let medium: SharedMedium = Rc::new(RefCell::new(vec![0xFF; size]));
        self.media.borrow_mut().push((card_index, medium.clone()));
        Ok(Box::new(MemoryStore::on_medium(medium)))
    }
}
