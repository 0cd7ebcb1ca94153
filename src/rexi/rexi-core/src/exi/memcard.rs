//! Flash memory card on channel 0 or 1, slot 0.
//!
//! The card keeps its whole image in memory. Erase and program commands
//! commit on chip-select release, mark the touched pages dirty and push a
//! coalescing flush event out by `CARD_FLUSH_DELAY`; only the flush talks to
//! the backing store. Completion of erase/program is reported through the
//! `memcardDone` event, which raises READY and the card interrupt.

use std::rc::Rc;

use log::{debug, error, info, warn};
use memcard_protocol::card::{
    self, status, Command, BLOCK_SIZE, IDLE_BYTE, MBIT_SIZE, NINTENDO_CARD_ID, PAGE_SIZE,
    PROGRAMMING_BUFFER_SIZE,
};

use super::device::{Device, DeviceContext, DeviceKind};
use crate::constants::events::{MEMCARD_DONE, MEMCARD_FLUSH};
use crate::constants::timing::{CARD_COMMAND_DELAY, CARD_FLUSH_DELAY};
use crate::memory::HostMemory;
use crate::state::StateWrap;
use crate::storage::{BackingStore, MemoryStore, StorageError};
use crate::timing::{Event, EventType, Scheduler};

pub struct MemoryCard {
    kind: DeviceKind,
    card_index: usize, // 0 = slot A, 1 = slot B
    generation: u32,   // tags our events; per instance, never saved
    scheduler: Rc<dyn Scheduler>,
    cmd_done_event: EventType,
    flush_event: EventType,

    // Wire protocol
    interrupt_switch: u8,
    interrupt_set: bool,
    command: u8,
    accepted: bool, // false while a rejected command is still clocking
    status: u8,
    position: u32,
    address: u32,
    programming_buffer: [u8; PROGRAMMING_BUFFER_SIZE],
    error_buffer: [u8; 4],
    card_id: u16,

    // Image and persistence
    image: Vec<u8>,
    dirty_pages: Vec<bool>,
    dirty: bool,
    flush_pending: bool,
    locked: bool,
    flush_deferred: bool, // a flush fired while locked
    store_contents: bool,
    store: Box<dyn BackingStore>,
}

fn slot_name(card_index: usize) -> char {
    (b'A' + card_index as u8) as char
}

impl MemoryCard {
    pub fn new(ctx: &DeviceContext, card_index: usize, kind: DeviceKind) -> Self {
        let size = ctx.card_size.bytes();
        let mut store: Box<dyn BackingStore> = match ctx.storage.open(card_index, kind, size) {
            Ok(store) => store,
            Err(err) => {
                error!(
                    "Memory card {}: cannot open storage ({}), inserting a blank card",
                    slot_name(card_index),
                    err
                );
                Box::new(MemoryStore::erased(size))
            }
        };
        if store.size() != size {
            warn!(
                "Memory card {}: store holds {} bytes, card is {}",
                slot_name(card_index),
                store.size(),
                size
            );
        }

        let mut image = vec![0xFF; size];
        let pages = store.pages().min(size / PAGE_SIZE);
        for page in 0..pages {
            let start = page * PAGE_SIZE;
            if let Err(err) = store.read_page(page, &mut image[start..start + PAGE_SIZE]) {
                error!(
                    "Memory card {}: failed to load page {} ({})",
                    slot_name(card_index),
                    page,
                    err
                );
                break;
            }
        }

        let scheduler = ctx.scheduler.clone();
        let cmd_done_event = scheduler.register_event(MEMCARD_DONE[card_index]);
        let flush_event = scheduler.register_event(MEMCARD_FLUSH[card_index]);
        info!(
            "Memory card {}: {} Mbit card inserted",
            slot_name(card_index),
            size / MBIT_SIZE
        );

        Self {
            kind,
            card_index,
            generation: ctx.next_generation(),
            scheduler,
            cmd_done_event,
            flush_event,
            interrupt_switch: 0,
            interrupt_set: false,
            command: 0,
            accepted: true,
            status: status::BUSY | status::UNLOCKED | status::READY,
            position: 0,
            address: 0,
            programming_buffer: [0; PROGRAMMING_BUFFER_SIZE],
            error_buffer: [0; 4],
            card_id: NINTENDO_CARD_ID,
            dirty_pages: vec![false; size / PAGE_SIZE],
            image,
            dirty: false,
            flush_pending: false,
            locked: false,
            flush_deferred: false,
            store_contents: ctx.store_card_contents,
            store,
        }
    }

    pub fn card_index(&self) -> usize {
        self.card_index
    }

    pub fn status(&self) -> u8 {
        self.status
    }

    pub fn position(&self) -> u32 {
        self.position
    }

    pub fn card_id(&self) -> u16 {
        self.card_id
    }

    pub fn programming_buffer(&self) -> &[u8] {
        &self.programming_buffer
    }

    pub fn image(&self) -> &[u8] {
        &self.image
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn is_flush_pending(&self) -> bool {
        self.flush_pending
    }

    fn megabits(&self) -> u16 {
        (self.image.len() / MBIT_SIZE) as u16
    }

    fn event_tag(&self) -> u64 {
        ((self.generation as u64) << 8) | self.card_index as u64
    }

    fn card_offset(&self, address: u32) -> usize {
        (address as usize) & (self.image.len() - 1)
    }

    fn is_asleep(&self) -> bool {
        self.status & status::SLEEP != 0
    }

    fn record_error(&mut self, cmd: Command) {
        match cmd {
            Command::SectorErase | Command::ChipErase => self.status |= status::ERASE_ERROR,
            _ => self.status |= status::PROGRAM_ERROR,
        }
        let [ad1, ad2, ad3, _] = card::encode_address(self.address);
        self.error_buffer = [cmd.opcode(), ad1, ad2, ad3];
    }

    fn start_command(&mut self, opcode: u8) -> u8 {
        self.command = opcode;
        self.accepted = true;
        let cmd = match Command::decode(opcode) {
            Some(cmd) => cmd,
            None => {
                warn!(
                    "Memory card {}: unknown command {:02x}",
                    slot_name(self.card_index),
                    opcode
                );
                return IDLE_BYTE;
            }
        };

        if self.is_asleep() && !cmd.allowed_while_asleep() {
            warn!(
                "Memory card {}: {:?} rejected while asleep",
                slot_name(self.card_index),
                cmd
            );
            self.accepted = false;
            self.record_error(cmd);
            return IDLE_BYTE;
        }

        match cmd {
            Command::ClearStatus => {
                self.status &= !(status::PROGRAM_ERROR | status::ERASE_ERROR);
                self.status |= status::READY;
                self.interrupt_set = false;
                self.error_buffer = [0; 4];
            }
            Command::WakeUp => self.status &= !status::SLEEP,
            Command::Sleep => self.status |= status::SLEEP,
            _ => {}
        }
        IDLE_BYTE
    }

    fn command_byte(&mut self, byte: u8) -> u8 {
        let cmd = match Command::decode(self.command) {
            Some(cmd) if self.accepted => cmd,
            _ => return IDLE_BYTE,
        };
        let position = self.position;

        match cmd {
            Command::NintendoId => card::nintendo_id_byte(self.megabits(), position),
            Command::ReadArray => {
                if position <= 4 {
                    self.address = card::decode_address_byte(self.address, position, byte);
                }
                if position == 1 {
                    return IDLE_BYTE;
                }
                let value = self.image[self.card_offset(self.address)];
                // Four dummy cycles follow the address; data streams after them
                if position >= 9 {
                    self.address = card::next_in_page(self.address);
                }
                value
            }
            Command::ArrayToBuffer => {
                if position <= 4 {
                    self.address = card::decode_address_byte(self.address, position, byte);
                }
                if position == 4 {
                    let start = self.card_offset(self.address) & !(PROGRAMMING_BUFFER_SIZE - 1);
                    self.programming_buffer
                        .copy_from_slice(&self.image[start..start + PROGRAMMING_BUFFER_SIZE]);
                }
                IDLE_BYTE
            }
            Command::SetInterrupt => {
                if position == 1 {
                    self.interrupt_switch = byte;
                }
                IDLE_BYTE
            }
            Command::WriteBuffer => {
                if position <= 4 {
                    self.address = card::decode_address_byte(self.address, position, byte);
                } else {
                    let idx = (self.address + position - 5) as usize & (PROGRAMMING_BUFFER_SIZE - 1);
                    self.programming_buffer[idx] = byte;
                }
                IDLE_BYTE
            }
            Command::ReadStatus => self.status,
            Command::ReadId => card::card_id_byte(self.card_id, position),
            Command::ReadErrorBuffer => {
                if position == 1 {
                    IDLE_BYTE
                } else {
                    self.error_buffer[((position - 2) & 3) as usize]
                }
            }
            Command::SectorErase => {
                if position <= 2 {
                    self.address = card::decode_address_byte(self.address, position, byte);
                }
                IDLE_BYTE
            }
            Command::PageProgram | Command::ExtraByteProgram => {
                if position <= 4 {
                    self.address = card::decode_address_byte(self.address, position, byte);
                } else {
                    let idx = (position - 5) as usize & (PROGRAMMING_BUFFER_SIZE - 1);
                    self.programming_buffer[idx] = byte;
                }
                IDLE_BYTE
            }
            Command::ChipErase | Command::WakeUp | Command::Sleep | Command::ClearStatus => {
                debug!(
                    "Memory card {}: ignored byte {:02x} after {:?}",
                    slot_name(self.card_index),
                    byte,
                    cmd
                );
                IDLE_BYTE
            }
        }
    }

    /// Applies a finished erase/program transaction when chip select drops
    fn commit(&mut self) {
        let cmd = match Command::decode(self.command) {
            Some(cmd) if self.accepted && cmd.mutates_card() => cmd,
            _ => return,
        };
        match cmd {
            Command::SectorErase if self.position > 2 => self.erase_sector(),
            Command::ChipErase if self.position > 2 => self.erase_chip(),
            Command::PageProgram | Command::ExtraByteProgram if self.position >= 5 => {
                self.program_page()
            }
            _ => {}
        }
    }

    fn erase_sector(&mut self) {
        let offset = self.card_offset(self.address);
        if offset % BLOCK_SIZE != 0 {
            warn!(
                "Memory card {}: sector erase at unaligned address {:x}",
                slot_name(self.card_index),
                self.address
            );
            self.record_error(Command::SectorErase);
            return;
        }
        debug!(
            "Memory card {}: erasing block {:x}",
            slot_name(self.card_index),
            offset / BLOCK_SIZE
        );
        self.image[offset..offset + BLOCK_SIZE].fill(0xFF);
        self.mark_dirty(offset, BLOCK_SIZE);
        self.schedule_flush();
        self.begin_busy(CARD_COMMAND_DELAY);
    }

    fn erase_chip(&mut self) {
        info!("Memory card {}: chip erase", slot_name(self.card_index));
        self.image.fill(0xFF);
        self.mark_dirty(0, self.image.len());
        self.schedule_flush();
        let blocks = (self.image.len() / BLOCK_SIZE) as u64;
        self.begin_busy(CARD_COMMAND_DELAY * blocks);
    }

    fn program_page(&mut self) {
        let count = self.position - 5;
        let mut idx = 0;
        for _ in 0..count {
            let offset = self.card_offset(self.address);
            self.image[offset] = self.programming_buffer[idx];
            self.mark_dirty(offset, 1);
            idx = (idx + 1) & (PROGRAMMING_BUFFER_SIZE - 1);
            self.address = card::next_in_page(self.address);
        }
        self.schedule_flush();
        self.begin_busy(CARD_COMMAND_DELAY);
    }

    fn begin_busy(&mut self, ticks: u64) {
        self.status |= status::BUSY;
        self.status &= !status::READY;
        self.scheduler.remove_event(self.cmd_done_event);
        self.scheduler
            .schedule(self.cmd_done_event, ticks, self.event_tag());
    }

    fn cmd_done(&mut self) {
        self.status |= status::READY;
        self.status &= !status::BUSY;
        self.interrupt_set = true;
    }

    fn mark_dirty(&mut self, offset: usize, len: usize) {
        if len == 0 {
            return;
        }
        let first = offset / PAGE_SIZE;
        let last = (offset + len - 1) / PAGE_SIZE;
        for page in first..=last.min(self.dirty_pages.len() - 1) {
            self.dirty_pages[page] = true;
        }
        self.dirty = true;
    }

    /// (Re)starts the flush countdown; repeated writes push it out
    fn schedule_flush(&mut self) {
        self.scheduler.remove_event(self.flush_event);
        self.scheduler
            .schedule(self.flush_event, CARD_FLUSH_DELAY, self.event_tag());
        self.flush_pending = true;
    }

    fn write_back(&mut self, exiting: bool) -> Result<(), StorageError> {
        for page in 0..self.dirty_pages.len() {
            if self.dirty_pages[page] {
                let start = page * PAGE_SIZE;
                self.store
                    .write_page(page, &self.image[start..start + PAGE_SIZE])?;
            }
        }
        self.store.flush()?;
        if exiting {
            self.store.wait_idle()?;
        }
        Ok(())
    }

    /// Writes dirty pages to the store; `exiting` also waits for them to land
    pub fn flush(&mut self, exiting: bool) {
        if !self.dirty {
            if exiting {
                if let Err(err) = self.store.wait_idle() {
                    error!("Memory card {}: {}", slot_name(self.card_index), err);
                }
            }
            return;
        }

        match self.write_back(exiting) {
            Ok(()) => {
                self.dirty = false;
                self.dirty_pages.iter_mut().for_each(|d| *d = false);
                info!("Memory card {}: flushed", slot_name(self.card_index));
            }
            Err(err) => {
                error!(
                    "Memory card {}: flush failed ({}), keeping changes",
                    slot_name(self.card_index),
                    err
                );
                if !exiting {
                    self.schedule_flush();
                }
            }
        }
    }

    fn flush_fired(&mut self) {
        self.flush_pending = false;
        if self.locked {
            debug!(
                "Memory card {}: flush deferred while locked",
                slot_name(self.card_index)
            );
            self.flush_deferred = true;
            return;
        }
        self.flush(false);
    }
}

impl Device for MemoryCard {
    fn kind(&self) -> DeviceKind {
        self.kind
    }

    fn set_chip_select(&mut self, active: bool) {
        if !active {
            self.commit();
        }
        self.position = 0;
    }

    fn is_interrupt_pending(&self) -> bool {
        self.interrupt_switch != 0 && self.interrupt_set
    }

    fn is_present(&self) -> bool {
        true
    }

    fn transfer_byte(&mut self, byte: u8) -> u8 {
        let reply = if self.position == 0 {
            self.start_command(byte)
        } else {
            self.command_byte(byte)
        };
        debug!(
            "EXI MEMCARD {}: > {:02x} < {:02x} (position {})",
            slot_name(self.card_index),
            byte,
            reply,
            self.position
        );
        self.position += 1;
        reply
    }

    fn dma_read(&mut self, memory: &mut dyn HostMemory, address: u32, size: u32) {
        let offset = self.card_offset(self.address);
        let len = (size as usize).min(self.image.len() - offset);
        if len < size as usize {
            warn!(
                "Memory card {}: DMA read past end of card",
                slot_name(self.card_index)
            );
        }
        memory.write_block(address, &self.image[offset..offset + len]);
        if (offset + len) % BLOCK_SIZE == 0 {
            info!(
                "Memory card {}: read from block {:x}",
                slot_name(self.card_index),
                offset / BLOCK_SIZE
            );
        }
    }

    fn dma_write(&mut self, memory: &mut dyn HostMemory, address: u32, size: u32) {
        let offset = self.card_offset(self.address);
        let len = (size as usize).min(self.image.len() - offset);
        if len < size as usize {
            warn!(
                "Memory card {}: DMA write past end of card",
                slot_name(self.card_index)
            );
        }
        memory.read_block(address, &mut self.image[offset..offset + len]);
        self.mark_dirty(offset, len);
        self.schedule_flush();
        if (offset + len) % BLOCK_SIZE == 0 {
            info!(
                "Memory card {}: wrote to block {:x}",
                slot_name(self.card_index),
                offset / BLOCK_SIZE
            );
        }
    }

    fn do_state(&mut self, p: &mut StateWrap) {
        p.do_marker("MemoryCard");
        p.do_value(&mut self.interrupt_switch);
        p.do_value(&mut self.interrupt_set);
        p.do_value(&mut self.command);
        p.do_value(&mut self.accepted);
        p.do_value(&mut self.status);
        p.do_value(&mut self.position);
        p.do_bytes(&mut self.programming_buffer);
        p.do_value(&mut self.address);
        p.do_value(&mut self.card_id);
        p.do_bytes(&mut self.error_buffer);

        let mut card_index = self.card_index as u32;
        p.do_value(&mut card_index);
        if p.is_reading() && card_index as usize != self.card_index {
            warn!(
                "Memory card {}: state was saved for slot {}",
                slot_name(self.card_index),
                card_index
            );
        }

        let mut store_contents = self.store_contents;
        p.do_value(&mut store_contents);
        if !store_contents {
            return;
        }

        let mut len = self.image.len() as u32;
        p.do_value(&mut len);
        if !p.is_reading() {
            p.do_bytes(&mut self.image);
            return;
        }

        if len as usize != self.image.len() {
            error!(
                "Memory card {}: saved image is {} bytes, card is {}",
                slot_name(self.card_index),
                len,
                self.image.len()
            );
            p.set_failed("card image size");
            return;
        }
        let mut contents = vec![0u8; self.image.len()];
        p.do_bytes(&mut contents);
        if p.failed() {
            return;
        }
        self.image.copy_from_slice(&contents);
        let size = self.image.len();
        self.mark_dirty(0, size);
        self.schedule_flush();
    }

    fn pause_and_lock(&mut self, lock: bool, _unpause_on_unlock: bool) {
        if lock {
            self.locked = true;
            if let Err(err) = self.store.wait_idle() {
                error!("Memory card {}: {}", slot_name(self.card_index), err);
            }
            return;
        }
        self.locked = false;
        if self.flush_deferred {
            self.flush_deferred = false;
            self.scheduler.schedule(self.flush_event, 0, self.event_tag());
            self.flush_pending = true;
        }
    }

    fn find_device(&mut self, kind: DeviceKind, index: Option<usize>) -> Option<&mut dyn Device> {
        if kind != self.kind {
            return None;
        }
        match index {
            Some(idx) if idx != self.card_index => None,
            _ => Some(self),
        }
    }

    fn handle_event(&mut self, event: &Event) -> bool {
        if event.userdata != self.event_tag() {
            return false;
        }
        if event.event_type == self.cmd_done_event {
            self.cmd_done();
            true
        } else if event.event_type == self.flush_event {
            self.flush_fired();
            true
        } else {
            false
        }
    }
}

impl Drop for MemoryCard {
    fn drop(&mut self) {
        self.scheduler.remove_event(self.cmd_done_event);
        self.scheduler.remove_event(self.flush_event);
        self.flush(true);
    }
}

#[cfg(test)]
mod memcard_tests {
    use super::*;
    use crate::memory::MainRam;
    use crate::storage::MemoryStoreProvider;
    use crate::timing::EventQueue;
    use memcard_protocol::CardSize;

    struct Rig {
        queue: Rc<EventQueue>,
        storage: Rc<MemoryStoreProvider>,
        ctx: DeviceContext,
    }

    fn rig() -> Rig {
        let queue = Rc::new(EventQueue::new(1_000_000));
        let storage = Rc::new(MemoryStoreProvider::new());
        let ctx = DeviceContext::new(queue.clone(), storage.clone(), CardSize::Mb4, false);
        Rig {
            queue,
            storage,
            ctx,
        }
    }

    fn transaction(card: &mut MemoryCard, bytes: &[u8]) -> Vec<u8> {
        card.set_chip_select(true);
        let replies = bytes.iter().map(|b| card.transfer_byte(*b)).collect();
        card.set_chip_select(false);
        replies
    }

    fn run_events(rig: &Rig, card: &mut MemoryCard, until: u64) {
        rig.queue.run_until(until, |event| {
            card.handle_event(&event);
        });
    }

    #[test]
    fn test_power_on_state() {
        let rig = rig();
        let mut card = MemoryCard::new(&rig.ctx, 0, DeviceKind::MemoryCard);
        assert_eq!(card.status(), 0xC1);
        assert_eq!(card.card_id(), 0xC221);
        assert!(card.is_present());
        assert!(!card.is_interrupt_pending());

        let replies = transaction(&mut card, &[0x00, 0, 0, 0, 0, 0]);
        assert_eq!(replies, vec![0xFF, 0x80, 0x00, 0x00, 0x00, 0x04]);
    }

    #[test]
    fn test_read_status_and_id() {
        let rig = rig();
        let mut card = MemoryCard::new(&rig.ctx, 1, DeviceKind::MemoryCard);
        assert_eq!(transaction(&mut card, &[0x83, 0])[1], 0xC1);
        assert_eq!(transaction(&mut card, &[0x85, 0, 0]), vec![0xFF, 0xC2, 0xC2]);
    }

    #[test]
    fn test_program_then_read_back() {
        let rig = rig();
        let mut card = MemoryCard::new(&rig.ctx, 0, DeviceKind::MemoryCard);
        let address = 0x4000;

        let mut bytes = card::command_header(Command::PageProgram, address).to_vec();
        bytes.extend_from_slice(&[0x11, 0x22, 0x33]);
        transaction(&mut card, &bytes);

        assert_eq!(&card.image()[address as usize..address as usize + 4], &[0x11, 0x22, 0x33, 0xFF]);
        assert!(card.is_dirty());
        assert_eq!(card.status() & status::BUSY, status::BUSY);

        let mut bytes = card::command_header(Command::ReadArray, address).to_vec();
        bytes.extend_from_slice(&[0; 4 + 3]);
        let replies = transaction(&mut card, &bytes);
        assert_eq!(&replies[9..12], &[0x11, 0x22, 0x33]);
    }

    #[test]
    fn test_flush_waits_for_event() {
        let rig = rig();
        let mut card = MemoryCard::new(&rig.ctx, 0, DeviceKind::MemoryCard);
        let mut bytes = card::command_header(Command::PageProgram, 0x200).to_vec();
        bytes.push(0x42);
        transaction(&mut card, &bytes);

        let medium = rig.storage.medium(0).unwrap();
        assert_eq!(medium.borrow()[0x200], 0xFF);
        assert!(card.is_dirty());

        // Command completes long before the flush window closes
        run_events(&rig, &mut card, CARD_COMMAND_DELAY);
        assert_eq!(card.status() & (status::BUSY | status::READY), status::READY);
        assert!(card.is_dirty());

        run_events(&rig, &mut card, CARD_COMMAND_DELAY + CARD_FLUSH_DELAY);
        assert!(!card.is_dirty());
        assert_eq!(medium.borrow()[0x200], 0x42);
    }

    #[test]
    fn test_writes_push_flush_out() {
        let rig = rig();
        let mut card = MemoryCard::new(&rig.ctx, 0, DeviceKind::MemoryCard);
        let program = |card: &mut MemoryCard, byte: u8| {
            let mut bytes = card::command_header(Command::PageProgram, 0).to_vec();
            bytes.push(byte);
            transaction(card, &bytes);
        };

        program(&mut card, 1);
        rig.queue.advance_to(CARD_FLUSH_DELAY - 10);
        program(&mut card, 2);
        run_events(&rig, &mut card, CARD_FLUSH_DELAY + 10);
        assert!(card.is_dirty());

        run_events(&rig, &mut card, 2 * CARD_FLUSH_DELAY);
        assert!(!card.is_dirty());
        assert_eq!(rig.storage.medium(0).unwrap().borrow()[0], 2);
    }

    #[test]
    fn test_interrupt_after_command_done() {
        let rig = rig();
        let mut card = MemoryCard::new(&rig.ctx, 0, DeviceKind::MemoryCard);
        transaction(&mut card, &[0x81, 0x01]);
        transaction(&mut card, &card::command_header(Command::SectorErase, 0x2000)[..3]);
        assert!(!card.is_interrupt_pending());

        run_events(&rig, &mut card, CARD_COMMAND_DELAY);
        assert!(card.is_interrupt_pending());

        transaction(&mut card, &[0x89]);
        assert!(!card.is_interrupt_pending());
    }

    #[test]
    fn test_unaligned_erase_sets_error() {
        let rig = rig();
        let mut card = MemoryCard::new(&rig.ctx, 0, DeviceKind::MemoryCard);
        // AD1/AD2 only reach down to bit 9, so 0x2200 is the nearest miss
        transaction(&mut card, &card::command_header(Command::SectorErase, 0x2200)[..3]);
        assert_eq!(card.status() & status::ERASE_ERROR, status::ERASE_ERROR);
        assert!(!card.is_dirty());

        let replies = transaction(&mut card, &[0x86, 0, 0]);
        assert_eq!(replies[2], 0xF1);

        transaction(&mut card, &[0x89]);
        assert_eq!(card.status() & status::ERASE_ERROR, 0);
    }

    #[test]
    fn test_sleeping_card_rejects_program() {
        let rig = rig();
        let mut card = MemoryCard::new(&rig.ctx, 0, DeviceKind::MemoryCard);
        transaction(&mut card, &[0x88]);
        assert_eq!(card.status() & status::SLEEP, status::SLEEP);

        let mut bytes = card::command_header(Command::PageProgram, 0).to_vec();
        bytes.push(0x00);
        transaction(&mut card, &bytes);
        assert_eq!(card.image()[0], 0xFF);
        assert_eq!(card.status() & status::PROGRAM_ERROR, status::PROGRAM_ERROR);

        transaction(&mut card, &[0x87]);
        assert_eq!(card.status() & status::SLEEP, 0);
    }

    #[test]
    fn test_buffer_commands() {
        let rig = rig();
        let mut card = MemoryCard::new(&rig.ctx, 0, DeviceKind::MemoryCard);
        let mut bytes = card::command_header(Command::PageProgram, 0x80).to_vec();
        bytes.extend_from_slice(&[7, 8]);
        transaction(&mut card, &bytes);

        transaction(&mut card, &card::command_header(Command::ArrayToBuffer, 0x80));
        assert_eq!(&card.programming_buffer()[..3], &[7, 8, 0xFF]);

        let mut bytes = card::command_header(Command::WriteBuffer, 0x7F).to_vec();
        bytes.extend_from_slice(&[1, 2]);
        transaction(&mut card, &bytes);
        assert_eq!(card.programming_buffer()[0x7F], 1);
        assert_eq!(card.programming_buffer()[0], 2);
    }

    #[test]
    fn test_dma_moves_image() {
        let rig = rig();
        let mut card = MemoryCard::new(&rig.ctx, 0, DeviceKind::MemoryCard);
        let mut ram = MainRam::new(0x1000);
        ram.write_block(0x100, &[0xAB; 0x200]);

        card.set_chip_select(true);
        for b in card::command_header(Command::PageProgram, 0x2000) {
            card.transfer_byte(b);
        }
        card.dma_write(&mut ram, 0x100, 0x200);
        assert_eq!(card.image()[0x21FF], 0xAB);
        assert!(card.is_dirty());

        card.dma_read(&mut ram, 0x800, 0x20);
        assert_eq!(ram.read_u8(0x81F), 0xAB);
    }

    #[test]
    fn test_state_round_trip() {
        let rig = rig();
        let mut card = MemoryCard::new(&rig.ctx, 0, DeviceKind::MemoryCard);
        transaction(&mut card, &[0x81, 0x01]);
        let mut bytes = card::command_header(Command::WriteBuffer, 0).to_vec();
        bytes.extend_from_slice(&[9, 9, 9]);
        transaction(&mut card, &bytes);
        card.set_chip_select(true);
        card.transfer_byte(0x83);

        let mut p = StateWrap::writer();
        card.do_state(&mut p);
        let saved = p.into_bytes();

        let mut fresh = MemoryCard::new(&rig.ctx, 0, DeviceKind::MemoryCard);
        let mut p = StateWrap::reader(saved);
        fresh.do_state(&mut p);
        assert!(!p.failed());
        assert_eq!(fresh.status(), card.status());
        assert_eq!(fresh.position(), 1);
        assert_eq!(fresh.programming_buffer(), card.programming_buffer());
        assert_eq!(fresh.card_id(), card.card_id());
        assert_eq!(fresh.transfer_byte(0), card.transfer_byte(0));
    }

    #[test]
    fn test_state_with_contents_marks_dirty() {
        let queue = Rc::new(EventQueue::new(1_000_000));
        let storage = Rc::new(MemoryStoreProvider::new());
        let ctx = DeviceContext::new(queue.clone(), storage, CardSize::Mb4, true);
        let mut card = MemoryCard::new(&ctx, 0, DeviceKind::MemoryCard);
        card.image[0x10] = 0x5A;

        let mut p = StateWrap::writer();
        card.do_state(&mut p);
        let saved = p.into_bytes();
        assert!(saved.len() > CardSize::Mb4.bytes());

        card.image[0x10] = 0xFF;
        let mut p = StateWrap::reader(saved);
        card.do_state(&mut p);
        assert_eq!(card.image()[0x10], 0x5A);
        assert!(card.is_dirty());
        assert!(card.is_flush_pending());
    }

    #[test]
    fn test_stale_events_ignored() {
        let rig = rig();
        let mut old = MemoryCard::new(&rig.ctx, 0, DeviceKind::MemoryCard);
        let event = Event {
            event_type: old.cmd_done_event,
            userdata: old.event_tag(),
            due: 0,
        };
        let mut new = MemoryCard::new(&rig.ctx, 0, DeviceKind::MemoryCard);
        assert!(!new.handle_event(&event));
        assert!(old.handle_event(&event));
    }

    #[test]
    fn test_lock_defers_flush() {
        let rig = rig();
        let mut card = MemoryCard::new(&rig.ctx, 0, DeviceKind::MemoryCard);
        let mut bytes = card::command_header(Command::PageProgram, 0).to_vec();
        bytes.push(0x00);
        transaction(&mut card, &bytes);

        card.pause_and_lock(true, false);
        run_events(&rig, &mut card, CARD_FLUSH_DELAY);
        assert!(card.is_dirty());

        card.pause_and_lock(false, true);
        assert!(card.is_flush_pending());
        run_events(&rig, &mut card, CARD_FLUSH_DELAY);
        assert!(!card.is_dirty());
    }

    #[test]
    fn test_drop_flushes() {
        let rig = rig();
        let mut card = MemoryCard::new(&rig.ctx, 1, DeviceKind::MemoryCardFolder);
        let mut bytes = card::command_header(Command::PageProgram, 0x10).to_vec();
        bytes.push(0x33);
        transaction(&mut card, &bytes);
        drop(card);
        assert_eq!(rig.storage.medium(1).unwrap().borrow()[0x10], 0x33);
        assert_eq!(rig.queue.pending(), 0);
    }

    #[test]
    fn test_load_keeps_pending_flush() {
        let rig = rig();
        let mut card = MemoryCard::new(&rig.ctx, 0, DeviceKind::MemoryCard);
        let mut p = StateWrap::writer();
        card.do_state(&mut p);
        let saved = p.into_bytes();

        let mut bytes = card::command_header(Command::PageProgram, 0x400).to_vec();
        bytes.push(0x77);
        transaction(&mut card, &bytes);

        let mut p = StateWrap::reader(saved);
        card.do_state(&mut p);
        assert!(!p.failed());

        run_events(&rig, &mut card, 2 * CARD_FLUSH_DELAY);
        assert!(!card.is_dirty());
        assert_eq!(rig.storage.medium(0).unwrap().borrow()[0x400], 0x77);
    }

    #[test]
    fn test_contents_of_other_size_are_rejected() {
        let storage = Rc::new(MemoryStoreProvider::new());
        let queue = Rc::new(EventQueue::new(1_000_000));
        let small = DeviceContext::new(queue.clone(), storage.clone(), CardSize::Mb4, true);
        let mut card = MemoryCard::new(&small, 0, DeviceKind::MemoryCard);
        let mut p = StateWrap::writer();
        card.do_state(&mut p);
        let saved = p.into_bytes();

        let large = DeviceContext::new(queue, storage, CardSize::Mb8, true);
        let mut other = MemoryCard::new(&large, 1, DeviceKind::MemoryCard);
        other.image[0] = 0x12;
        let mut p = StateWrap::reader(saved);
        other.do_state(&mut p);
        assert!(p.failed());
        assert_eq!(other.image()[0], 0x12);
        assert!(!other.is_dirty());
    }

    #[test]
    fn test_find_device() {
        let rig = rig();
        let mut card = MemoryCard::new(&rig.ctx, 1, DeviceKind::MemoryCard);
        assert!(card.find_device(DeviceKind::MemoryCard, None).is_some());
        assert!(card.find_device(DeviceKind::MemoryCard, Some(1)).is_some());
        assert!(card.find_device(DeviceKind::MemoryCard, Some(0)).is_none());
        assert!(card.find_device(DeviceKind::MemoryCardFolder, None).is_none());
    }
}
