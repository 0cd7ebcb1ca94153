//! Host filesystem backends for emulated memory cards.

mod folder;
mod provider;
mod raw;

pub use folder::FolderStore;
pub use provider::FileStoreProvider;
pub use raw::RawImage;
