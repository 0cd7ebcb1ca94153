//! Expansion Interface: three serial channels with up to three devices each.
//!
//! Register accesses arrive through `read_register`/`write_register` with an
//! offset relative to the EXI block. Anything time-based (DMA completion,
//! card command completion, flushes, hot-swaps) comes back through
//! `handle_event`.

pub mod channel;
pub mod device;
pub mod memcard;
pub mod regs;

use std::rc::Rc;

use log::{debug, info, warn};

pub use self::channel::Channel;
pub use self::device::{create_device, Device, DeviceContext, DeviceKind, NullDevice};
pub use self::memcard::MemoryCard;

use crate::config::ExiConfig;
use crate::constants::address_space::EXI_CHANNEL_STRIDE;
use crate::constants::events::{CHANGE_DEVICE, UPDATE_INTERRUPTS};
use crate::constants::slots::{AD16_SLOT, MEMCARD_SLOT};
use crate::constants::timing::DEVICE_CHANGE_DELAY;
use crate::constants::NUM_CHANNELS;
use crate::interrupts::InterruptSink;
use crate::memory::HostMemory;
use crate::state::StateWrap;
use crate::storage::StorageProvider;
use crate::timing::{Event, EventType, Scheduler};

// ChangeEXIDevice userdata: channel << 32 | type tag << 16 | slot
fn pack_change(channel: usize, kind: DeviceKind, slot: usize) -> u64 {
    ((channel as u64) << 32) | ((kind.tag() as u64) << 16) | (slot as u64 & 0xFFFF)
}

fn unpack_change(userdata: u64) -> (usize, u32, usize) {
    (
        (userdata >> 32) as usize,
        ((userdata >> 16) & 0xFFFF) as u32,
        (userdata & 0xFFFF) as usize,
    )
}

pub struct ExpansionInterface {
    channels: [Channel; NUM_CHANNELS],
    ctx: Rc<DeviceContext>,
    irq: Rc<dyn InterruptSink>,
    update_interrupts_event: EventType,
    change_device_event: EventType,
}

impl ExpansionInterface {
    pub fn new(
        config: &ExiConfig,
        scheduler: Rc<dyn Scheduler>,
        storage: Rc<dyn StorageProvider>,
        irq: Rc<dyn InterruptSink>,
    ) -> Self {
        let ctx = Rc::new(DeviceContext::new(
            scheduler.clone(),
            storage,
            config.card_size,
            config.store_card_contents,
        ));
        let channels = core::array::from_fn(|id| Channel::new(id as u32, ctx.clone()));
        let update_interrupts_event = scheduler.register_event(UPDATE_INTERRUPTS);
        let change_device_event = scheduler.register_event(CHANGE_DEVICE);

        let mut exi = Self {
            channels,
            ctx,
            irq,
            update_interrupts_event,
            change_device_event,
        };
        for card_index in 0..2 {
            let kind = config.card_slot(card_index);
            if kind != DeviceKind::None {
                exi.channels[card_index].add_device(kind, MEMCARD_SLOT);
            }
        }
        exi
    }

    pub fn channel(&self, idx: usize) -> Option<&Channel> {
        self.channels.get(idx)
    }

    pub fn channel_mut(&mut self, idx: usize) -> Option<&mut Channel> {
        self.channels.get_mut(idx)
    }

    fn decode(offset: u32) -> Option<(usize, u32)> {
        let channel = (offset / EXI_CHANNEL_STRIDE) as usize;
        if channel >= NUM_CHANNELS {
            return None;
        }
        Some((channel, offset % EXI_CHANNEL_STRIDE))
    }

    /// `offset` is relative to the start of the EXI register block
    pub fn read_register(&mut self, offset: u32) -> u32 {
        match Self::decode(offset) {
            Some((channel, reg)) => self.channels[channel].read_register(reg),
            None => {
                warn!("EXI read outside the register block (offset 0x{:x})", offset);
                0
            }
        }
    }

    pub fn write_register(&mut self, offset: u32, value: u32, memory: &mut dyn HostMemory) {
        match Self::decode(offset) {
            Some((channel, reg)) => self.channels[channel].write_register(reg, value, memory),
            None => warn!(
                "EXI write outside the register block (offset 0x{:x})",
                offset
            ),
        }
    }

    /// Recomputes the EXI interrupt and hands it to the processor
    pub fn update_interrupts(&mut self) {
        // The AD16 slot on channel 0 signals through channel 2
        let ad16 = self.channels[0]
            .device(AD16_SLOT)
            .map_or(false, |d| d.is_interrupt_pending());
        self.channels[2].set_exi_interrupt(ad16);

        let mut causing = false;
        for channel in self.channels.iter_mut() {
            causing |= channel.is_causing_interrupt();
        }
        debug!("EXI interrupt {}", causing);
        self.irq.set_interrupt(causing);
    }

    /// Hot-swaps the device in `slot`: the slot goes empty now and the new
    /// device shows up after `DEVICE_CHANGE_DELAY`
    pub fn change_device(&mut self, channel: usize, kind: DeviceKind, slot: usize) {
        info!(
            "EXIChannel[{}] slot {}: changing device to {:?}",
            channel, slot, kind
        );
        let scheduler = &self.ctx.scheduler;
        scheduler.schedule_immediate_threadsafe(
            self.change_device_event,
            pack_change(channel, DeviceKind::None, slot),
        );
        scheduler.schedule(
            self.change_device_event,
            DEVICE_CHANGE_DELAY,
            pack_change(channel, kind, slot),
        );
    }

    fn apply_device_change(&mut self, userdata: u64) {
        let (channel, tag, slot) = unpack_change(userdata);
        let kind = match DeviceKind::from_tag(tag) {
            Some(kind) => kind,
            None => {
                warn!("Device change to unknown type {}", tag);
                return;
            }
        };
        match self.channels.get_mut(channel) {
            Some(ch) => ch.add_device(kind, slot),
            None => warn!("Device change on missing channel {}", channel),
        }
    }

    /// Single entry point for scheduler events; returns false if nothing
    /// here owns the event
    pub fn handle_event(&mut self, event: &Event) -> bool {
        let event_type = event.event_type;
        if event_type == self.update_interrupts_event {
            self.update_interrupts();
            return true;
        }
        if event_type == self.change_device_event {
            self.apply_device_change(event.userdata);
            return true;
        }
        if self
            .channels
            .iter()
            .any(|ch| ch.transfer_complete_event() == event_type)
        {
            let channel = event.userdata as usize;
            match self.channels.get_mut(channel) {
                Some(ch) => {
                    if ch.transfer_complete() {
                        self.update_interrupts();
                    }
                }
                None => warn!("Transfer complete for missing channel {}", channel),
            }
            return true;
        }

        let mut handled = false;
        for channel in self.channels.iter_mut() {
            if channel.dispatch_device_event(event) {
                handled = true;
                break;
            }
        }
        if handled {
            self.update_interrupts();
        } else {
            debug!(
                "Event {} (userdata 0x{:x}) has no live target",
                event_type.id(),
                event.userdata
            );
        }
        handled
    }

    /// `index` of `None` matches any instance
    pub fn find_device(&mut self, kind: DeviceKind, index: Option<usize>) -> Option<&mut dyn Device> {
        for channel in self.channels.iter_mut() {
            if let Some(device) = channel.find_device(kind, index) {
                return Some(device);
            }
        }
        None
    }

    pub fn pause_and_lock(&mut self, lock: bool, unpause_on_unlock: bool) {
        for channel in self.channels.iter_mut() {
            channel.pause_and_lock(lock, unpause_on_unlock);
        }
    }

    pub fn do_state(&mut self, p: &mut StateWrap) {
        p.do_marker("ExpansionInterface");
        for channel in self.channels.iter_mut() {
            channel.do_state(p);
        }
    }

    /// Removes every device; cards flush synchronously on the way out
    pub fn shutdown(&mut self) {
        for channel in self.channels.iter_mut() {
            channel.remove_devices();
        }
    }
}

#[cfg(test)]
mod exi_tests {
    use super::*;
    use crate::constants::events::MEMCARD_FLUSH;
    use crate::constants::registers::{EXI_DMACONTROL, EXI_DMALENGTH, EXI_IMMDATA, EXI_STATUS};
    use crate::constants::timing::CARD_FLUSH_DELAY;
    use crate::interrupts::InterruptLine;
    use crate::memory::MainRam;
    use crate::storage::MemoryStoreProvider;
    use crate::timing::EventQueue;
    use memcard_protocol::card::{self, status, Command};

    struct Bus {
        queue: Rc<EventQueue>,
        storage: Rc<MemoryStoreProvider>,
        irq: Rc<InterruptLine>,
        exi: ExpansionInterface,
        ram: MainRam,
    }

    impl Bus {
        fn new(config: ExiConfig) -> Self {
            let queue = Rc::new(EventQueue::new(config.ticks_per_second));
            let storage = Rc::new(MemoryStoreProvider::new());
            let irq = Rc::new(InterruptLine::new());
            let exi = ExpansionInterface::new(&config, queue.clone(), storage.clone(), irq.clone());
            Self {
                queue,
                storage,
                irq,
                exi,
                ram: MainRam::new(0x10000),
            }
        }

        fn write(&mut self, channel: u32, reg: u32, value: u32) {
            self.exi
                .write_register(channel * EXI_CHANNEL_STRIDE + reg, value, &mut self.ram);
        }

        fn read(&mut self, channel: u32, reg: u32) -> u32 {
            self.exi.read_register(channel * EXI_CHANNEL_STRIDE + reg)
        }

        fn run_until(&mut self, until: u64) {
            let exi = &mut self.exi;
            self.queue.run_until(until, |event| {
                exi.handle_event(&event);
            });
        }

        fn run_pending(&mut self) {
            let now = self.queue.ticks();
            self.run_until(now);
        }

        // Selects slot 0 of `channel`, sends `bytes` one at a time, deselects
        fn card_transaction(&mut self, channel: u32, bytes: &[u8]) -> Vec<u8> {
            self.write(channel, EXI_STATUS, 1 << 7);
            let mut replies = Vec::new();
            for byte in bytes {
                self.write(channel, EXI_IMMDATA, (*byte as u32) << 24);
                self.write(channel, EXI_DMACONTROL, (2 << 2) | 1);
                replies.push((self.read(channel, EXI_IMMDATA) >> 24) as u8);
            }
            self.write(channel, EXI_STATUS, 0);
            self.run_pending();
            replies
        }
    }

    fn config() -> ExiConfig {
        ExiConfig {
            ticks_per_second: 162_000_000,
            card_size: memcard_protocol::CardSize::Mb4,
            ..ExiConfig::default()
        }
    }

    #[test]
    fn test_default_wiring() {
        let mut bus = Bus::new(config());
        let status = regs::Status(bus.read(0, EXI_STATUS));
        assert_eq!(status.ext(), 1);
        assert_eq!(status.ext_int(), 1);
        assert_eq!(regs::Status(bus.read(1, EXI_STATUS)).ext(), 0);
        assert!(bus.exi.find_device(DeviceKind::MemoryCard, Some(0)).is_some());
        assert!(bus.exi.find_device(DeviceKind::MemoryCard, Some(1)).is_none());
    }

    #[test]
    fn test_card_protocol_through_registers() {
        let mut bus = Bus::new(config());
        let replies = bus.card_transaction(0, &[0x85, 0, 0]);
        assert_eq!(&replies[1..], &[0xC2, 0xC2]);
        let replies = bus.card_transaction(0, &[0x83, 0]);
        assert_eq!(replies[1], status::BUSY | status::UNLOCKED | status::READY);
    }

    #[test]
    fn test_dma_completion_raises_interrupt() {
        let mut bus = Bus::new(config());
        bus.run_pending();
        // TCINTMASK on, chip select slot 0
        bus.write(0, EXI_STATUS, (1 << 2) | (1 << 7));
        bus.run_pending();
        assert!(!bus.irq.is_asserted());

        bus.write(0, EXI_DMALENGTH, 512);
        bus.write(0, EXI_DMACONTROL, 0b11);
        let control = regs::Control(bus.read(0, EXI_DMACONTROL));
        assert_eq!(control.transfer_start(), 1);

        bus.run_until(663_551);
        assert_eq!(regs::Status(bus.read(0, EXI_STATUS)).tc_int(), 0);
        bus.run_until(663_552);
        assert_eq!(regs::Control(bus.read(0, EXI_DMACONTROL)).transfer_start(), 0);
        assert_eq!(bus.read(0, 0x08), 0);
        assert_eq!(regs::Status(bus.read(0, EXI_STATUS)).tc_int(), 1);
        assert!(bus.irq.is_asserted());

        // Acknowledge
        bus.write(0, EXI_STATUS, (1 << 2) | (1 << 3) | (1 << 7));
        bus.run_pending();
        assert!(!bus.irq.is_asserted());
    }

    #[test]
    fn test_immediate_then_dma_same_tick() {
        let mut bus = Bus::new(config());
        bus.write(0, EXI_STATUS, 1 << 7);
        bus.run_pending();
        let updates = bus.irq.updates();

        // Immediate transfer: done synchronously, nothing scheduled
        bus.write(0, EXI_IMMDATA, 0x8300_0000);
        bus.write(0, EXI_DMACONTROL, (1 << 4) | (2 << 2) | 1);
        assert_eq!(bus.queue.pending(), 0);

        // Zero-length DMA completes at the same tick
        bus.write(0, EXI_DMALENGTH, 0);
        bus.write(0, EXI_DMACONTROL, 0b11);
        bus.run_pending();

        // Exactly one re-aggregation, from the DMA completion
        assert_eq!(bus.irq.updates(), updates + 1);
        assert_eq!(regs::Control(bus.read(0, EXI_DMACONTROL)).transfer_start(), 0);
    }

    #[test]
    fn test_card_completion_interrupt() {
        let mut bus = Bus::new(config());
        // EXIINTMASK on channel 0
        bus.write(0, EXI_STATUS, 1);
        bus.card_transaction(0, &[0x81, 0x01]);
        let mut erase = card::command_header(Command::SectorErase, 0x2000).to_vec();
        erase.truncate(3);
        bus.card_transaction(0, &erase);
        bus.write(0, EXI_STATUS, 1);
        bus.run_pending();
        assert!(!bus.irq.is_asserted());

        let now = bus.queue.ticks();
        bus.run_until(now + 5_000);
        assert!(bus.irq.is_asserted());
        assert_eq!(regs::Status(bus.read(0, EXI_STATUS)).exi_int(), 1);
    }

    #[test]
    fn test_change_device_hot_swap() {
        let mut bus = Bus::new(config());
        bus.run_pending();
        bus.write(0, EXI_STATUS, 1 << 11);
        bus.exi.change_device(1, DeviceKind::MemoryCard, MEMCARD_SLOT);

        bus.run_pending();
        assert!(bus.exi.find_device(DeviceKind::MemoryCard, Some(1)).is_none());
        assert_eq!(regs::Status(bus.read(1, EXI_STATUS)).ext_int(), 1);

        bus.run_until(DEVICE_CHANGE_DELAY);
        assert!(bus.exi.find_device(DeviceKind::MemoryCard, Some(1)).is_some());
        assert_eq!(regs::Status(bus.read(1, EXI_STATUS)).ext(), 1);
    }

    #[test]
    fn test_stale_card_event_after_swap() {
        let mut bus = Bus::new(config());
        bus.card_transaction(0, &[0x81, 0x01]);
        let mut erase = card::command_header(Command::SectorErase, 0).to_vec();
        erase.truncate(3);
        bus.card_transaction(0, &erase);

        // Swap the card while its erase is still running
        bus.exi.channel_mut(0).unwrap().add_device(DeviceKind::MemoryCard, MEMCARD_SLOT);
        bus.run_until(10_000);

        // The replacement never saw the old card's completion
        let replies = bus.card_transaction(0, &[0x83, 0]);
        assert_eq!(replies[1], status::BUSY | status::UNLOCKED | status::READY);
    }

    #[test]
    fn test_save_state_round_trip() {
        let mut bus = Bus::new(config());
        bus.write(1, EXI_STATUS, (1 << 2) | (3 << 4));
        bus.write(2, EXI_IMMDATA, 0xDEAD_BEEF);
        let mut p = StateWrap::writer();
        bus.exi.do_state(&mut p);
        let saved = p.into_bytes();

        let mut other = Bus::new(ExiConfig {
            slot_a: DeviceKind::None,
            ..config()
        });
        let mut p = StateWrap::reader(saved);
        other.exi.do_state(&mut p);
        assert!(!p.failed());
        assert_eq!(other.read(2, EXI_IMMDATA), 0xDEAD_BEEF);
        assert_eq!(regs::Status(other.read(1, EXI_STATUS)).clk(), 3);
        assert!(other.exi.find_device(DeviceKind::MemoryCard, Some(0)).is_some());
    }

    fn program_0x400(bus: &mut Bus) {
        let mut program = card::command_header(Command::PageProgram, 0x400).to_vec();
        program.push(0x77);
        bus.card_transaction(0, &program);
    }

    #[test]
    fn test_load_after_swap_still_flushes() {
        let mut bus = Bus::new(config());
        let mut p = StateWrap::writer();
        bus.exi.do_state(&mut p);
        let saved = p.into_bytes();

        bus.exi.channel_mut(0).unwrap().add_device(DeviceKind::MemoryCard, MEMCARD_SLOT);
        program_0x400(&mut bus);

        let mut p = StateWrap::reader(saved);
        bus.exi.do_state(&mut p);
        assert!(!p.failed());

        let now = bus.queue.ticks();
        bus.run_until(now + 2 * CARD_FLUSH_DELAY);
        assert_eq!(bus.storage.medium(0).unwrap().borrow()[0x400], 0x77);
    }

    #[test]
    fn test_mismatched_load_keeps_flush() {
        let mut source = Bus::new(ExiConfig {
            slot_a: DeviceKind::MemoryCardFolder,
            store_card_contents: true,
            ..config()
        });
        program_0x400(&mut source);
        let mut p = StateWrap::writer();
        source.exi.do_state(&mut p);
        let saved = p.into_bytes();

        let mut target = Bus::new(ExiConfig {
            store_card_contents: true,
            ..config()
        });
        let mut p = StateWrap::reader(saved);
        target.exi.do_state(&mut p);
        assert!(!p.failed());
        assert!(target
            .exi
            .find_device(DeviceKind::MemoryCardFolder, Some(0))
            .is_some());
        let flush = target.queue.register_event(MEMCARD_FLUSH[0]);
        assert!(target.queue.is_scheduled(flush));

        let now = target.queue.ticks();
        target.run_until(now + CARD_FLUSH_DELAY);
        assert_eq!(target.storage.medium(0).unwrap().borrow()[0x400], 0x77);
    }

    #[test]
    fn test_shutdown_flushes_cards() {
        let mut bus = Bus::new(config());
        let mut program = card::command_header(Command::PageProgram, 0x400).to_vec();
        program.push(0x77);
        bus.card_transaction(0, &program);
        assert_eq!(bus.storage.medium(0).unwrap().borrow()[0x400], 0xFF);

        bus.exi.shutdown();
        assert_eq!(bus.storage.medium(0).unwrap().borrow()[0x400], 0x77);
        assert!(bus.exi.find_device(DeviceKind::MemoryCard, None).is_none());
    }

    #[test]
    fn test_out_of_block_access() {
        let mut bus = Bus::new(config());
        assert_eq!(bus.exi.read_register(EXI_CHANNEL_STRIDE * 3), 0);
    }
}
