pub mod config;
pub mod constants;
pub mod exi;
pub mod interrupts;
pub mod memory;
pub mod state;
pub mod storage;
pub mod timing;

pub use config::ExiConfig;
pub use exi::ExpansionInterface;
pub use memory::MemoryMap;
