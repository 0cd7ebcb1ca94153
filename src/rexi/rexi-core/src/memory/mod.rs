mod ram;

pub use ram::{HostMemory, MainRam};

use crate::constants::address_space::{EXI_BASE, EXI_SIZE, PHYSICAL_MASK};
use crate::exi::ExpansionInterface;
use crate::timing::Event;
use log::error;

/// Physical address decoder in front of main RAM and the EXI registers
pub struct MemoryMap {
    ram: MainRam,             // main memory, DMA target
    exi: ExpansionInterface, // EXI register block
}

impl MemoryMap {
    pub fn new(ram: MainRam, exi: ExpansionInterface) -> Self {
        Self { ram, exi }
    }

    pub fn ram(&self) -> &MainRam {
        &self.ram
    }

    pub fn ram_mut(&mut self) -> &mut MainRam {
        &mut self.ram
    }

    pub fn exi(&self) -> &ExpansionInterface {
        &self.exi
    }

    pub fn exi_mut(&mut self) -> &mut ExpansionInterface {
        &mut self.exi
    }

    fn exi_offset(physical: u32) -> Option<u32> {
        if (EXI_BASE..EXI_BASE + EXI_SIZE).contains(&physical) {
            Some(physical - EXI_BASE)
        } else {
            None
        }
    }

    /// 32-bit write; cached and uncached mirrors decode to the same target
    pub fn write_u32(&mut self, address: u32, value: u32) {
        let physical = address & PHYSICAL_MASK;
        if let Some(offset) = Self::exi_offset(physical) {
            self.exi.write_register(offset, value, &mut self.ram);
        } else if self.ram.contains(physical) {
            self.ram.write_u32(physical, value);
        } else {
            error!("Unimplemented Memory Map Write (Addr: 0x{:08x})", address);
        }
    }

    pub fn read_u32(&mut self, address: u32) -> u32 {
        let physical = address & PHYSICAL_MASK;
        if let Some(offset) = Self::exi_offset(physical) {
            self.exi.read_register(offset)
        } else if self.ram.contains(physical) {
            self.ram.read_u32(physical)
        } else {
            error!("Unimplemented Memory Map Read (Addr: 0x{:08x})", address);
            0
        }
    }

    /// Forwards a fired scheduler event to the bus
    pub fn handle_event(&mut self, event: &Event) -> bool {
        self.exi.handle_event(event)
    }
}

#[cfg(test)]
mod memory_map_tests {
    use super::*;
    use crate::config::ExiConfig;
    use crate::constants::registers::EXI_IMMDATA;
    use crate::interrupts::InterruptLine;
    use crate::storage::MemoryStoreProvider;
    use crate::timing::EventQueue;
    use std::rc::Rc;

    fn map() -> MemoryMap {
        let config = ExiConfig::default();
        let queue = Rc::new(EventQueue::new(config.ticks_per_second));
        let exi = ExpansionInterface::new(
            &config,
            queue,
            Rc::new(MemoryStoreProvider::new()),
            Rc::new(InterruptLine::new()),
        );
        MemoryMap::new(MainRam::new(0x1000), exi)
    }

    #[test]
    fn test_mirrors_reach_exi() {
        let mut map = map();
        map.write_u32(0xCC00_6800 + 0x14 + EXI_IMMDATA, 0x1234_5678);
        assert_eq!(map.read_u32(0x0C00_6800 + 0x14 + EXI_IMMDATA), 0x1234_5678);
        assert_eq!(map.read_u32(0x8C00_6824), 0x1234_5678);
    }

    #[test]
    fn test_ram_and_unmapped() {
        let mut map = map();
        map.write_u32(0x8000_0100, 0xCAFE_F00D);
        assert_eq!(map.ram().read_u32(0x100), 0xCAFE_F00D);
        assert_eq!(map.read_u32(0xC000_0100), 0xCAFE_F00D);
        assert_eq!(map.read_u32(0x0800_0000), 0);
    }
}
