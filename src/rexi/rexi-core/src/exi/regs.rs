// Bit layout of the channel status and DMA control registers

macro_rules! field {
    ($get:ident, $set:ident, $shift:expr, $bits:expr) => {
        pub fn $get(&self) -> u32 {
            (self.0 >> $shift) & ((1 << $bits) - 1)
        }

        pub fn $set(&mut self, value: u32) {
            let mask = ((1u32 << $bits) - 1) << $shift;
            self.0 = (self.0 & !mask) | ((value << $shift) & mask);
        }
    };
}

/// EXI channel status
///
/// | bits | field |
/// |------|-------|
/// | 0    | EXIINTMASK |
/// | 1    | EXIINT (device interrupt latch) |
/// | 2    | TCINTMASK |
/// | 3    | TCINT (transfer complete latch) |
/// | 4-6  | CLK (clock exponent) |
/// | 7-9  | CHIP_SELECT (one-hot) |
/// | 10   | EXTINTMASK |
/// | 11   | EXTINT (presence change latch) |
/// | 12   | EXT (device present) |
/// | 13   | ROMDIS |
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Status(pub u32);

impl Status {
    field!(exi_int_mask, set_exi_int_mask, 0, 1);
    field!(exi_int, set_exi_int, 1, 1);
    field!(tc_int_mask, set_tc_int_mask, 2, 1);
    field!(tc_int, set_tc_int, 3, 1);
    field!(clk, set_clk, 4, 3);
    field!(chip_select, set_chip_select, 7, 3);
    field!(ext_int_mask, set_ext_int_mask, 10, 1);
    field!(ext_int, set_ext_int, 11, 1);
    field!(ext, set_ext, 12, 1);
    field!(rom_disable, set_rom_disable, 13, 1);
}

/// EXI DMA control
///
/// | bits | field |
/// |------|-------|
/// | 0    | TSTART |
/// | 1    | DMA |
/// | 2-3  | RW (read / write / read-write) |
/// | 4-5  | TLEN (immediate length - 1) |
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Control(pub u32);

impl Control {
    field!(transfer_start, set_transfer_start, 0, 1);
    field!(dma, set_dma, 1, 1);
    field!(rw, set_rw, 2, 2);
    field!(tlen, set_tlen, 4, 2);
}
