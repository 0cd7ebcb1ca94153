use std::cell::Cell;
use std::rc::Rc;

use log::{error, warn};
use memcard_protocol::CardSize;

use super::memcard::MemoryCard;
use crate::memory::HostMemory;
use crate::state::StateWrap;
use crate::storage::StorageProvider;
use crate::timing::{Event, Scheduler};

/// Device type tag, as stored in savestates
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceKind {
    MemoryCard = 1,
    MemoryCardFolder = 8,
    None = 0xFF,
}

impl DeviceKind {
    pub fn tag(self) -> u32 {
        self as u32
    }

    pub fn from_tag(tag: u32) -> Option<DeviceKind> {
        match tag {
            1 => Some(DeviceKind::MemoryCard),
            8 => Some(DeviceKind::MemoryCardFolder),
            0xFF => Some(DeviceKind::None),
            _ => None,
        }
    }

    pub fn is_memory_card(self) -> bool {
        matches!(self, DeviceKind::MemoryCard | DeviceKind::MemoryCardFolder)
    }
}

/// Collaborators every device may need, handed in at construction
pub struct DeviceContext {
    pub scheduler: Rc<dyn Scheduler>,
    pub storage: Rc<dyn StorageProvider>,
    pub card_size: CardSize,
    pub store_card_contents: bool,
    generation: Cell<u32>,
}

impl DeviceContext {
    pub fn new(
        scheduler: Rc<dyn Scheduler>,
        storage: Rc<dyn StorageProvider>,
        card_size: CardSize,
        store_card_contents: bool,
    ) -> Self {
        Self {
            scheduler,
            storage,
            card_size,
            store_card_contents,
            generation: Cell::new(0),
        }
    }

    /// Fresh identity for a device instance, used to tag its events
    pub fn next_generation(&self) -> u32 {
        let generation = self.generation.get().wrapping_add(1) & 0x00FF_FFFF;
        self.generation.set(generation);
        generation
    }
}

/// Peripheral plugged into an EXI channel slot.
///
/// Transfers are byte-serial, most significant byte first. A device only
/// has to implement `transfer_byte` to get working immediate and DMA
/// transfers; the channel models the timing.
pub trait Device {
    fn kind(&self) -> DeviceKind;

    /// Chip select asserted (`true`) or released (`false`)
    fn set_chip_select(&mut self, _active: bool) {}

    fn is_interrupt_pending(&self) -> bool {
        false
    }

    fn is_present(&self) -> bool {
        false
    }

    /// Shifts one byte out to the device and returns the byte shifted in
    fn transfer_byte(&mut self, byte: u8) -> u8 {
        byte
    }

    fn immediate_write(&mut self, data: u32, size: u32) {
        let mut data = data;
        for _ in 0..size.min(4) {
            self.transfer_byte((data >> 24) as u8);
            data <<= 8;
        }
    }

    fn immediate_read(&mut self, size: u32) -> u32 {
        let mut result = 0;
        for position in 0..size.min(4) {
            let byte = self.transfer_byte(0);
            result |= (byte as u32) << (24 - position * 8);
        }
        result
    }

    fn immediate_read_write(&mut self, data: u32, size: u32) -> u32 {
        let mut data = data;
        let mut result = 0;
        for position in 0..size.min(4) {
            let byte = self.transfer_byte((data >> 24) as u8);
            result |= (byte as u32) << (24 - position * 8);
            data <<= 8;
        }
        result
    }

    /// Host memory -> device
    fn dma_write(&mut self, memory: &mut dyn HostMemory, address: u32, size: u32) {
        for i in 0..size {
            let byte = memory.read_u8(address.wrapping_add(i));
            self.transfer_byte(byte);
        }
    }

    /// Device -> host memory
    fn dma_read(&mut self, memory: &mut dyn HostMemory, address: u32, size: u32) {
        for i in 0..size {
            let byte = self.transfer_byte(0);
            memory.write_u8(address.wrapping_add(i), byte);
        }
    }

    fn do_state(&mut self, _p: &mut StateWrap) {}

    /// While locked the device must not start or finish background work
    fn pause_and_lock(&mut self, _lock: bool, _unpause_on_unlock: bool) {}

    /// `index` of `None` matches any instance of `kind`
    fn find_device(&mut self, kind: DeviceKind, index: Option<usize>) -> Option<&mut dyn Device>;

    /// Scheduler event addressed to this device; returns false if it is not ours
    fn handle_event(&mut self, _event: &Event) -> bool {
        false
    }
}

/// Empty slot. Selecting it still clocks transfers; nothing answers.
pub struct NullDevice;

impl Device for NullDevice {
    fn kind(&self) -> DeviceKind {
        DeviceKind::None
    }

    fn find_device(&mut self, kind: DeviceKind, _index: Option<usize>) -> Option<&mut dyn Device> {
        if kind == DeviceKind::None {
            Some(self)
        } else {
            None
        }
    }
}

type Constructor = fn(&DeviceContext, u32) -> Box<dyn Device>;

fn create_null(_ctx: &DeviceContext, _channel: u32) -> Box<dyn Device> {
    Box::new(NullDevice)
}

fn create_memory_card(ctx: &DeviceContext, channel: u32) -> Box<dyn Device> {
    create_card(ctx, channel, DeviceKind::MemoryCard)
}

fn create_memory_card_folder(ctx: &DeviceContext, channel: u32) -> Box<dyn Device> {
    create_card(ctx, channel, DeviceKind::MemoryCardFolder)
}

fn create_card(ctx: &DeviceContext, channel: u32, kind: DeviceKind) -> Box<dyn Device> {
    // Memory cards are numbered by the channel they sit on: A = 0, B = 1
    if channel > 1 {
        error!("No memory card slot on EXI channel {}", channel);
        return Box::new(NullDevice);
    }
    Box::new(MemoryCard::new(ctx, channel as usize, kind))
}

const DEVICE_TABLE: [(DeviceKind, Constructor); 3] = [
    (DeviceKind::None, create_null),
    (DeviceKind::MemoryCard, create_memory_card),
    (DeviceKind::MemoryCardFolder, create_memory_card_folder),
];

/// Builds a device of `kind` for a slot on `channel`
pub fn create_device(kind: DeviceKind, channel: u32, ctx: &DeviceContext) -> Box<dyn Device> {
    match DEVICE_TABLE.iter().find(|(k, _)| *k == kind) {
        Some((_, constructor)) => constructor(ctx, channel),
        None => {
            warn!("No constructor for device type {:?}", kind);
            Box::new(NullDevice)
        }
    }
}
