// Channels and device slots on the expansion bus
pub const NUM_CHANNELS: usize = 3;
pub const NUM_DEVICES: usize = 3;

// Clock the scheduler counts in (CPU core clock)
pub const TICKS_PER_SECOND: u64 = 486_000_000;

pub mod address_space {
    // Physical base of the EXI register block, one 0x14 byte window per channel
    pub const EXI_BASE: u32 = 0x0C00_6800;
    pub const EXI_CHANNEL_STRIDE: u32 = 0x14;
    pub const EXI_SIZE: u32 = EXI_CHANNEL_STRIDE * super::NUM_CHANNELS as u32;

    // Main memory
    pub const RAM_SIZE: usize = 0x0180_0000;
    pub const PHYSICAL_MASK: u32 = 0x1FFF_FFFF; // strips the cached/uncached mirrors
}

pub mod registers {
    // Register offsets inside one channel window
    pub const EXI_STATUS: u32 = 0x00;
    pub const EXI_DMAADDR: u32 = 0x04;
    pub const EXI_DMALENGTH: u32 = 0x08;
    pub const EXI_DMACONTROL: u32 = 0x0C;
    pub const EXI_IMMDATA: u32 = 0x10;

    // Transfer modes in the control register RW field
    pub const EXI_READ: u32 = 0;
    pub const EXI_WRITE: u32 = 1;
    pub const EXI_READWRITE: u32 = 2;

    // DMA progress is reported on 32-byte granularity
    pub const DMA_ALIGN_MASK: u32 = 0xFFFF_FFE0;
}

pub mod chip_select {
    // One-hot chip select values
    pub const NONE: u32 = 0;
    pub const DEVICE_0: u32 = 1;
    pub const DEVICE_1: u32 = 2;
    pub const DEVICE_2: u32 = 4;
}

pub mod slots {
    // Slot indices with fixed roles
    pub const MEMCARD_SLOT: usize = 0; // memory card on channels 0 and 1
    pub const AD16_SLOT: usize = 2; // channel 0 only, interrupts on channel 2
    pub const NO_MEMCARD_CHANNEL: u32 = 2;
}

pub mod events {
    // Scheduler event names
    pub const UPDATE_INTERRUPTS: &str = "EXIInterrupt";
    pub const CHANGE_DEVICE: &str = "ChangeEXIDevice";
    pub const TRANSFER_COMPLETE: [&str; super::NUM_CHANNELS] = [
        "EXIChannel0_xfer",
        "EXIChannel1_xfer",
        "EXIChannel2_xfer",
    ];
    pub const MEMCARD_DONE: [&str; 2] = ["memcardDoneA", "memcardDoneB"];
    pub const MEMCARD_FLUSH: [&str; 2] = ["memcardFlushA", "memcardFlushB"];
}

pub mod timing {
    // Hot-swapped devices stay absent this long before the new one appears
    pub const DEVICE_CHANGE_DELAY: u64 = 500_000_000;

    // Memory card latencies
    pub const CARD_COMMAND_DELAY: u64 = 5_000; // page program / sector erase
    pub const CARD_FLUSH_DELAY: u64 = 500_000_000; // coalescing window for writes
}
