use std::rc::Rc;

use anyhow::{bail, Result};
use log::debug;

use memcard_protocol::card::{self, status, Command, PAGE_SIZE, PROGRAMMING_BUFFER_SIZE};
use rexi_core::constants::address_space::{EXI_BASE, EXI_CHANNEL_STRIDE, RAM_SIZE};
use rexi_core::constants::registers::{
    EXI_DMAADDR, EXI_DMACONTROL, EXI_DMALENGTH, EXI_IMMDATA, EXI_READ, EXI_READWRITE, EXI_STATUS,
    EXI_WRITE,
};
use rexi_core::exi::regs::{Control, Status};
use rexi_core::interrupts::InterruptLine;
use rexi_core::memory::{HostMemory, MainRam};
use rexi_core::state::StateWrap;
use rexi_core::storage::StorageProvider;
use rexi_core::timing::{EventQueue, Scheduler};
use rexi_core::{ExiConfig, ExpansionInterface, MemoryMap};

// Where DMA buffers live in main memory
const SCRATCH: u32 = 0x0010_0000;

// Serial clock exponent used by the driver (32 MHz)
const CARD_CLOCK: u32 = 5;

/// Event queue, main memory and the expansion bus, wired together
pub struct Machine {
    queue: Rc<EventQueue>,
    irq: Rc<InterruptLine>,
    map: MemoryMap,
}

impl Machine {
    pub fn new(config: &ExiConfig, storage: Rc<dyn StorageProvider>) -> Self {
        let queue = Rc::new(EventQueue::new(config.ticks_per_second));
        let irq = Rc::new(InterruptLine::new());
        let exi = ExpansionInterface::new(config, queue.clone(), storage, irq.clone());
        let map = MemoryMap::new(MainRam::new(RAM_SIZE), exi);
        Self { queue, irq, map }
    }

    pub fn ticks(&self) -> u64 {
        self.queue.ticks()
    }

    pub fn irq(&self) -> &InterruptLine {
        &self.irq
    }

    fn register(channel: u32, reg: u32) -> u32 {
        // Uncached mirror, as software would address it
        0xC000_0000 | (EXI_BASE + channel * EXI_CHANNEL_STRIDE + reg)
    }

    pub fn read_reg(&mut self, channel: u32, reg: u32) -> u32 {
        self.map.read_u32(Self::register(channel, reg))
    }

    pub fn write_reg(&mut self, channel: u32, reg: u32, value: u32) {
        self.map.write_u32(Self::register(channel, reg), value);
    }

    /// Fires everything due within the next `ticks`
    pub fn run_for(&mut self, ticks: u64) -> usize {
        let until = self.ticks() + ticks;
        let map = &mut self.map;
        self.queue.run_until(until, |event| {
            map.handle_event(&event);
        })
    }

    /// Jumps to the next pending event and fires it; false if none is pending
    pub fn run_next(&mut self) -> bool {
        match self.queue.next_due() {
            Some(due) => {
                let now = self.ticks();
                self.run_for(due.saturating_sub(now));
                true
            }
            None => false,
        }
    }

    pub fn ram(&mut self) -> &mut MainRam {
        self.map.ram_mut()
    }

    pub fn save_state(&mut self) -> Vec<u8> {
        let mut p = StateWrap::writer();
        self.map.exi_mut().do_state(&mut p);
        p.into_bytes()
    }

    /// Removes all devices, which writes every card back synchronously
    pub fn shutdown(&mut self) {
        self.map.exi_mut().shutdown();
        self.run_for(0);
    }
}

/// Talks to the memory card in slot 0 of `channel` through the EXI
/// registers, the way a game's card library would
pub struct CardDriver<'a> {
    machine: &'a mut Machine,
    channel: u32,
}

impl<'a> CardDriver<'a> {
    pub fn new(machine: &'a mut Machine, channel: u32) -> Self {
        Self { machine, channel }
    }

    fn write_status(&mut self, chip_select: u32) {
        let mut value = Status(0);
        value.set_clk(CARD_CLOCK);
        value.set_chip_select(chip_select);
        value.set_exi_int_mask(1);
        value.set_tc_int_mask(1);
        self.machine.write_reg(self.channel, EXI_STATUS, value.0);
        self.machine.run_for(0);
    }

    fn select(&mut self) {
        self.write_status(1);
    }

    fn deselect(&mut self) {
        self.write_status(0);
    }

    /// Full-duplex exchange, four bytes per immediate transfer
    fn exchange(&mut self, out: &[u8]) -> Vec<u8> {
        let mut replies = Vec::with_capacity(out.len());
        for chunk in out.chunks(4) {
            let mut word = [0u8; 4];
            word[..chunk.len()].copy_from_slice(chunk);
            self.machine
                .write_reg(self.channel, EXI_IMMDATA, u32::from_be_bytes(word));

            let mut control = Control(0);
            control.set_tlen(chunk.len() as u32 - 1);
            control.set_rw(EXI_READWRITE);
            control.set_transfer_start(1);
            self.machine.write_reg(self.channel, EXI_DMACONTROL, control.0);

            let reply = self.machine.read_reg(self.channel, EXI_IMMDATA).to_be_bytes();
            replies.extend_from_slice(&reply[..chunk.len()]);
        }
        replies
    }

    /// One chip-select cycle
    pub fn transaction(&mut self, out: &[u8]) -> Vec<u8> {
        self.select();
        let replies = self.exchange(out);
        self.deselect();
        replies
    }

    fn dma(&mut self, rw: u32, len: usize) -> Result<()> {
        self.machine.write_reg(self.channel, EXI_DMAADDR, SCRATCH);
        self.machine
            .write_reg(self.channel, EXI_DMALENGTH, len as u32);
        let mut control = Control(0);
        control.set_dma(1);
        control.set_rw(rw);
        control.set_transfer_start(1);
        self.machine.write_reg(self.channel, EXI_DMACONTROL, control.0);

        while Control(self.machine.read_reg(self.channel, EXI_DMACONTROL)).transfer_start() != 0 {
            if !self.machine.run_next() {
                bail!("DMA on channel {} never completed", self.channel);
            }
        }
        // Acknowledge the transfer-complete latch
        let mut ack = Status(self.machine.read_reg(self.channel, EXI_STATUS));
        ack.set_tc_int(1);
        ack.set_exi_int(0);
        ack.set_ext_int(0);
        self.machine.write_reg(self.channel, EXI_STATUS, ack.0);
        Ok(())
    }

    pub fn nintendo_id(&mut self) -> u32 {
        let r = self.transaction(&[Command::NintendoId.opcode(), 0, 0, 0, 0, 0]);
        u32::from_be_bytes([r[2], r[3], r[4], r[5]])
    }

    pub fn card_id(&mut self) -> u16 {
        let r = self.transaction(&[Command::ReadId.opcode(), 0, 0, 0]);
        u16::from_be_bytes([r[2], r[3]])
    }

    pub fn status(&mut self) -> u8 {
        self.transaction(&[Command::ReadStatus.opcode(), 0])[1]
    }

    pub fn clear_status(&mut self) {
        self.transaction(&[Command::ClearStatus.opcode()]);
    }

    /// Runs the scheduler until the card drops BUSY
    pub fn wait_ready(&mut self) -> Result<u8> {
        loop {
            let value = self.status();
            if value & status::BUSY == 0 {
                if value & (status::ERASE_ERROR | status::PROGRAM_ERROR) != 0 {
                    self.clear_status();
                    bail!("card reported error, status {:02x}", value);
                }
                return Ok(value);
            }
            if !self.machine.run_next() {
                bail!("card stays busy, status {:02x}", value);
            }
        }
    }

    pub fn read_page(&mut self, address: u32, out: &mut [u8]) -> Result<()> {
        debug!("Reading page at {:x}", address);
        self.select();
        self.exchange(&card::command_header(Command::ReadArray, address));
        // Dummy cycles before data
        self.exchange(&[0; 4]);
        let result = self.dma(EXI_READ, PAGE_SIZE);
        self.deselect();
        result?;
        self.machine.ram().read_block(SCRATCH, &mut out[..PAGE_SIZE]);
        Ok(())
    }

    pub fn erase_sector(&mut self, address: u32) -> Result<()> {
        let header = card::command_header(Command::SectorErase, address);
        self.transaction(&header[..3]);
        self.wait_ready().map(|_| ())
    }

    pub fn program(&mut self, address: u32, data: &[u8]) -> Result<()> {
        if data.len() != PROGRAMMING_BUFFER_SIZE {
            bail!("program chunks are {} bytes", PROGRAMMING_BUFFER_SIZE);
        }
        self.machine.ram().write_block(SCRATCH, data);
        self.select();
        self.exchange(&card::command_header(Command::PageProgram, address));
        let result = self.dma(EXI_WRITE, data.len());
        self.deselect();
        result?;
        self.wait_ready().map(|_| ())
    }

    pub fn chip_erase(&mut self) -> Result<()> {
        self.transaction(&[Command::ChipErase.opcode(), 0, 0]);
        self.wait_ready().map(|_| ())
    }
}

#[cfg(test)]
mod host_tests {
    use super::*;
    use memcard_protocol::card::{BLOCK_SIZE, NINTENDO_CARD_ID};
    use memcard_protocol::CardSize;
    use rexi_core::storage::MemoryStoreProvider;

    fn machine() -> (Machine, Rc<MemoryStoreProvider>) {
        let config = ExiConfig {
            card_size: CardSize::Mb4,
            ..ExiConfig::default()
        };
        let storage = Rc::new(MemoryStoreProvider::new());
        (Machine::new(&config, storage.clone()), storage)
    }

    #[test]
    fn test_identify_card() {
        let (mut machine, _) = machine();
        let mut card = CardDriver::new(&mut machine, 0);
        assert_eq!(card.nintendo_id(), 4);
        assert_eq!(card.card_id(), NINTENDO_CARD_ID);
        assert_eq!(card.status() & status::READY, status::READY);
    }

    #[test]
    fn test_program_read_back_and_flush() {
        let (mut machine, storage) = machine();
        let data: Vec<u8> = (0..128u32).map(|i| i as u8).collect();
        {
            let mut card = CardDriver::new(&mut machine, 0);
            card.erase_sector(0x2000).unwrap();
            card.program(0x2080, &data).unwrap();

            let mut page = [0u8; PAGE_SIZE];
            card.read_page(0x2000, &mut page).unwrap();
            assert_eq!(page[0x7F], 0xFF);
            assert_eq!(&page[0x80..0x100], &data[..]);
        }
        assert_eq!(storage.medium(0).unwrap().borrow()[0x2081], 0xFF);

        machine.shutdown();
        let medium = storage.medium(0).unwrap();
        assert_eq!(medium.borrow()[0x2081], 1);
        assert_eq!(medium.borrow()[BLOCK_SIZE * 2], 0xFF);
    }

    #[test]
    fn test_chip_erase_completes() {
        let (mut machine, _) = machine();
        let start = machine.ticks();
        let mut card = CardDriver::new(&mut machine, 0);
        card.chip_erase().unwrap();
        let blocks = (CardSize::Mb4.bytes() / BLOCK_SIZE) as u64;
        assert!(machine.ticks() - start >= 5_000 * blocks);
    }

    #[test]
    fn test_save_state_is_not_empty() {
        let (mut machine, _) = machine();
        assert!(!machine.save_state().is_empty());
    }
}
