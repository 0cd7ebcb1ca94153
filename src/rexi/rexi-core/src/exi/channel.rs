use std::rc::Rc;

use log::{debug, error, warn};

use super::device::{create_device, Device, DeviceContext, DeviceKind};
use super::regs::{Control, Status};
use crate::constants::events::{TRANSFER_COMPLETE, UPDATE_INTERRUPTS};
use crate::constants::registers::{
    DMA_ALIGN_MASK, EXI_DMAADDR, EXI_DMACONTROL, EXI_DMALENGTH, EXI_IMMDATA, EXI_READ,
    EXI_READWRITE, EXI_STATUS, EXI_WRITE,
};
use crate::constants::slots::{MEMCARD_SLOT, NO_MEMCARD_CHANNEL};
use crate::constants::{chip_select, NUM_DEVICES};
use crate::memory::HostMemory;
use crate::state::StateWrap;
use crate::timing::{Event, EventType};

/// Slot addressed by a chip select value; anything but one-hot is nobody
fn slot_for_chip_select(chip_select: u32) -> Option<usize> {
    match chip_select {
        chip_select::DEVICE_0 => Some(0),
        chip_select::DEVICE_1 => Some(1),
        chip_select::DEVICE_2 => Some(2),
        _ => None,
    }
}

/// One EXI channel: five registers and three device slots
pub struct Channel {
    channel_id: u32,
    status: Status,
    dma_memory_address: u32,
    dma_length: u32,
    control: Control,
    imm_data: u32,

    // In-flight DMA, for progress reads while the transfer is "running"
    dma_time_start: u64,
    dma_time_length: u64,
    dma_data_start: u32,
    dma_data_length: u32,

    devices: [Box<dyn Device>; NUM_DEVICES],
    ctx: Rc<DeviceContext>,
    update_interrupts_event: EventType,
    transfer_complete_event: EventType,
}

impl Channel {
    pub fn new(channel_id: u32, ctx: Rc<DeviceContext>) -> Self {
        let mut status = Status(0);
        // Channels with a memory card slot report presence changes from the start
        if channel_id != NO_MEMCARD_CHANNEL {
            status.set_ext_int(1);
        }
        if channel_id == 1 {
            status.set_chip_select(chip_select::DEVICE_0);
        }

        let update_interrupts_event = ctx.scheduler.register_event(UPDATE_INTERRUPTS);
        let transfer_complete_event = ctx
            .scheduler
            .register_event(TRANSFER_COMPLETE[channel_id as usize]);
        let devices =
            core::array::from_fn(|_| create_device(DeviceKind::None, channel_id, &ctx));

        Self {
            channel_id,
            status,
            dma_memory_address: 0,
            dma_length: 0,
            control: Control(0),
            imm_data: 0,
            dma_time_start: 0,
            dma_time_length: 0,
            dma_data_start: 0,
            dma_data_length: 0,
            devices,
            ctx,
            update_interrupts_event,
            transfer_complete_event,
        }
    }

    pub fn channel_id(&self) -> u32 {
        self.channel_id
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn control(&self) -> Control {
        self.control
    }

    pub fn imm_data(&self) -> u32 {
        self.imm_data
    }

    pub fn transfer_complete_event(&self) -> EventType {
        self.transfer_complete_event
    }

    /// Serial clock in Hz, from the CLK exponent
    pub fn clock_rate(&self) -> u32 {
        (1u32 << self.status.clk()) * 1_000_000
    }

    pub fn device(&self, slot: usize) -> Option<&dyn Device> {
        self.devices.get(slot).map(|d| d.as_ref())
    }

    pub fn device_mut(&mut self, slot: usize) -> Option<&mut dyn Device> {
        match self.devices.get_mut(slot) {
            Some(device) => Some(device.as_mut()),
            None => None,
        }
    }

    fn selected_device(&mut self, chip_select: u32) -> Option<&mut dyn Device> {
        let slot = slot_for_chip_select(chip_select)?;
        Some(self.devices[slot].as_mut())
    }

    /// Plugs a new device of `kind` into `slot`, replacing what was there
    pub fn add_device(&mut self, kind: DeviceKind, slot: usize) {
        self.vacate(slot);
        let device = create_device(kind, self.channel_id, &self.ctx);
        self.install_device(device, slot, true);
    }

    /// Drops the device in `slot` so its final flush lands before a
    /// replacement opens the same storage or registers the same events
    fn vacate(&mut self, slot: usize) {
        if slot < NUM_DEVICES && self.devices[slot].kind() != DeviceKind::None {
            self.devices[slot] = create_device(DeviceKind::None, self.channel_id, &self.ctx);
        }
    }

    pub fn install_device(&mut self, device: Box<dyn Device>, slot: usize, notify_presence: bool) {
        if slot >= NUM_DEVICES {
            error!("EXIChannel[{}] has no slot {}", self.channel_id, slot);
            return;
        }
        debug!(
            "EXIChannel[{}] slot {}: {:?} -> {:?}",
            self.channel_id,
            slot,
            self.devices[slot].kind(),
            device.kind()
        );
        // Old device goes away (and flushes) here
        self.devices[slot] = device;

        if notify_presence && self.channel_id != NO_MEMCARD_CHANNEL {
            self.status.set_ext_int(1);
            self.ctx
                .scheduler
                .schedule_immediate_threadsafe(self.update_interrupts_event, 0);
        }
    }

    /// Empties every slot
    pub fn remove_devices(&mut self) {
        for slot in 0..NUM_DEVICES {
            self.devices[slot] = create_device(DeviceKind::None, self.channel_id, &self.ctx);
        }
    }

    pub fn read_register(&mut self, offset: u32) -> u32 {
        match offset {
            EXI_STATUS => self.read_status(),
            EXI_DMAADDR => self.dma_address(),
            EXI_DMALENGTH => self.dma_length(),
            EXI_DMACONTROL => self.control.0,
            EXI_IMMDATA => self.imm_data,
            _ => {
                error!(
                    "EXIChannel[{}] read from unknown register 0x{:x}",
                    self.channel_id, offset
                );
                0
            }
        }
    }

    pub fn write_register(&mut self, offset: u32, value: u32, memory: &mut dyn HostMemory) {
        debug!(
            "EXIChannel[{}] write 0x{:08x} to register 0x{:x}",
            self.channel_id, value, offset
        );
        match offset {
            EXI_STATUS => self.write_status(value),
            EXI_DMAADDR => self.dma_memory_address = value,
            EXI_DMALENGTH => self.dma_length = value,
            EXI_DMACONTROL => self.write_control(value, memory),
            EXI_IMMDATA => self.imm_data = value,
            _ => error!(
                "EXIChannel[{}] write to unknown register 0x{:x}",
                self.channel_id, offset
            ),
        }
    }

    /// Status with EXT refreshed from the memory card slot
    pub fn read_status(&mut self) -> u32 {
        let present = self.channel_id != NO_MEMCARD_CHANNEL
            && self.devices[MEMCARD_SLOT].is_present();
        self.status.set_ext(present as u32);
        self.status.0
    }

    fn dma_in_flight(&self) -> bool {
        self.control.transfer_start() != 0 && self.control.dma() != 0
    }

    /// Bytes moved so far, linear in elapsed ticks
    fn dma_progress(&self) -> u32 {
        let elapsed = self
            .ctx
            .scheduler
            .ticks()
            .saturating_sub(self.dma_time_start);
        if elapsed >= self.dma_time_length {
            return self.dma_data_length;
        }
        (self.dma_data_length as u64 * elapsed / self.dma_time_length) as u32
    }

    /// DMA address register; tracks progress while a transfer is in flight
    pub fn dma_address(&self) -> u32 {
        if !self.dma_in_flight() {
            return self.dma_memory_address;
        }
        let address = self.dma_data_start.wrapping_add(self.dma_progress()) & DMA_ALIGN_MASK;
        debug!(
            "EXIChannel[{}] DMA in flight, address 0x{:08x}",
            self.channel_id, address
        );
        address
    }

    /// DMA length register; counts down while a transfer is in flight
    pub fn dma_length(&self) -> u32 {
        if !self.dma_in_flight() {
            return self.dma_length;
        }
        let length = (self.dma_data_length - self.dma_progress()) & DMA_ALIGN_MASK;
        debug!(
            "EXIChannel[{}] DMA in flight, length 0x{:x}",
            self.channel_id, length
        );
        length
    }

    fn write_status(&mut self, value: u32) {
        let new = Status(value);
        let id = self.channel_id;

        self.status.set_exi_int_mask(new.exi_int_mask());
        if new.exi_int() != 0 {
            self.status.set_exi_int(0);
        }
        self.status.set_tc_int_mask(new.tc_int_mask());
        if new.tc_int() != 0 {
            self.status.set_tc_int(0);
        }
        if new.clk() != self.status.clk() {
            self.status.set_clk(new.clk());
            debug!("EXIChannel[{}] clock set to {} Hz", id, self.clock_rate());
        }
        self.status.set_ext_int_mask(new.ext_int_mask());
        if new.ext_int() != 0 {
            self.status.set_ext_int(0);
        }
        // Sticky until reset
        if new.rom_disable() != 0 && self.status.rom_disable() == 0 {
            debug!("EXIChannel[{}] ROM descrambler disabled", id);
            self.status.set_rom_disable(1);
        }

        let old_cs = self.status.chip_select();
        let new_cs = new.chip_select();
        if new_cs != old_cs {
            debug!("EXIChannel[{}] chip select {} -> {}", id, old_cs, new_cs);
            if let Some(device) = self.selected_device(old_cs) {
                device.set_chip_select(false);
            }
            self.status.set_chip_select(new_cs);
            if let Some(device) = self.selected_device(new_cs) {
                device.set_chip_select(true);
            }
        }

        self.ctx
            .scheduler
            .schedule_immediate_threadsafe(self.update_interrupts_event, 0);
    }

    fn write_control(&mut self, value: u32, memory: &mut dyn HostMemory) {
        let id = self.channel_id;
        if self.control.transfer_start() != 0 {
            warn!(
                "EXIChannel[{}] control written while a transfer is running, ignored",
                id
            );
            return;
        }

        self.control = Control(value);
        if self.control.transfer_start() == 0 {
            return;
        }

        let slot = match slot_for_chip_select(self.status.chip_select()) {
            Some(slot) => slot,
            None => {
                debug!("EXIChannel[{}] transfer started with nothing selected", id);
                self.control.set_transfer_start(0);
                return;
            }
        };

        if self.control.dma() == 0 {
            self.immediate_transfer(slot);
        } else {
            self.start_dma(slot, memory);
        }
    }

    fn immediate_transfer(&mut self, slot: usize) {
        let size = self.control.tlen() + 1;
        let device = self.devices[slot].as_mut();
        match self.control.rw() {
            EXI_READ => self.imm_data = device.immediate_read(size),
            EXI_WRITE => device.immediate_write(self.imm_data, size),
            EXI_READWRITE => self.imm_data = device.immediate_read_write(self.imm_data, size),
            mode => warn!(
                "EXIChannel[{}] unknown immediate transfer mode {}",
                self.channel_id, mode
            ),
        }
        debug!(
            "EXIChannel[{}] immediate {} bytes, data 0x{:08x}",
            self.channel_id, size, self.imm_data
        );
        self.control.set_transfer_start(0);
    }

    fn start_dma(&mut self, slot: usize, memory: &mut dyn HostMemory) {
        let address = self.dma_memory_address;
        let length = self.dma_length;
        let device = self.devices[slot].as_mut();
        match self.control.rw() {
            EXI_READ => device.dma_read(memory, address, length),
            EXI_WRITE => device.dma_write(memory, address, length),
            mode => warn!(
                "EXIChannel[{}] DMA mode {} is not supported, no data moved",
                self.channel_id, mode
            ),
        }

        let scheduler = &self.ctx.scheduler;
        let ticks = 8 * length as u64 * scheduler.ticks_per_second() / self.clock_rate() as u64;
        self.dma_time_start = scheduler.ticks();
        self.dma_time_length = ticks;
        self.dma_data_start = address;
        self.dma_data_length = length;
        debug!(
            "EXIChannel[{}] DMA of 0x{:x} bytes at 0x{:08x}, done in {} ticks",
            self.channel_id, length, address, ticks
        );
        scheduler.schedule(self.transfer_complete_event, ticks, self.channel_id as u64);
    }

    /// Finishes the running transfer; returns true if the TC latch was raised
    pub fn transfer_complete(&mut self) -> bool {
        debug!("EXIChannel[{}] transfer complete", self.channel_id);
        let was_dma = self.control.dma() != 0;
        if was_dma {
            self.dma_length = 0;
            self.dma_memory_address = self.dma_data_start.wrapping_add(self.dma_data_length);
            self.dma_time_start = 0;
            self.dma_time_length = 0;
            self.dma_data_start = 0;
            self.dma_data_length = 0;
            self.status.set_tc_int(1);
        }
        self.control.set_transfer_start(0);
        was_dma
    }

    pub fn set_exi_interrupt(&mut self, asserted: bool) {
        self.status.set_exi_int(asserted as u32);
    }

    /// Samples device interrupt lines into EXIINT, then reports whether any
    /// latch is set with its mask open
    pub fn is_causing_interrupt(&mut self) -> bool {
        if self.channel_id != NO_MEMCARD_CHANNEL
            && self.devices[MEMCARD_SLOT].is_interrupt_pending()
        {
            self.status.set_exi_int(1);
        } else if let Some(slot) = slot_for_chip_select(self.status.chip_select()) {
            if self.devices[slot].is_interrupt_pending() {
                self.status.set_exi_int(1);
            }
        }

        let s = self.status;
        (s.exi_int() & s.exi_int_mask()) != 0
            || (s.tc_int() & s.tc_int_mask()) != 0
            || (s.ext_int() & s.ext_int_mask()) != 0
    }

    /// Offers a scheduler event to each device in turn
    pub fn dispatch_device_event(&mut self, event: &Event) -> bool {
        self.devices.iter_mut().any(|d| d.handle_event(event))
    }

    pub fn find_device(&mut self, kind: DeviceKind, index: Option<usize>) -> Option<&mut dyn Device> {
        for device in self.devices.iter_mut() {
            if let Some(found) = device.find_device(kind, index) {
                return Some(found);
            }
        }
        None
    }

    pub fn pause_and_lock(&mut self, lock: bool, unpause_on_unlock: bool) {
        for device in self.devices.iter_mut() {
            device.pause_and_lock(lock, unpause_on_unlock);
        }
    }

    pub fn do_state(&mut self, p: &mut StateWrap) {
        p.do_marker("EXIChannel");
        p.do_value(&mut self.status.0);
        p.do_value(&mut self.dma_memory_address);
        p.do_value(&mut self.dma_length);
        p.do_value(&mut self.control.0);
        p.do_value(&mut self.imm_data);
        p.do_value(&mut self.dma_time_start);
        p.do_value(&mut self.dma_time_length);
        p.do_value(&mut self.dma_data_start);
        p.do_value(&mut self.dma_data_length);

        for slot in 0..NUM_DEVICES {
            let current = self.devices[slot].kind();
            let mut tag = current.tag();
            p.do_value(&mut tag);
            if p.failed() {
                return;
            }
            let kind = match DeviceKind::from_tag(tag) {
                Some(kind) => kind,
                None => {
                    error!(
                        "EXIChannel[{}] slot {}: unknown device type {} in state",
                        self.channel_id, slot, tag
                    );
                    p.set_failed("device type");
                    return;
                }
            };

            if kind == current {
                self.devices[slot].do_state(p);
                continue;
            }

            // Slot held something else when the state was taken
            if p.is_reading() {
                self.vacate(slot);
            }
            let mut saved = create_device(kind, self.channel_id, &self.ctx);
            saved.do_state(p);
            if p.is_reading() {
                self.install_device(saved, slot, false);
            }
        }
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.ctx.scheduler.remove_event(self.transfer_complete_event);
        self.ctx.scheduler.remove_event(self.update_interrupts_event);
    }
}
