use log::warn;

/// Host memory as seen by DMA. Addresses are physical.
pub trait HostMemory {
    fn read_u8(&self, address: u32) -> u8;
    fn write_u8(&mut self, address: u32, value: u8);

    fn read_block(&self, address: u32, out: &mut [u8]) {
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.read_u8(address.wrapping_add(i as u32));
        }
    }

    fn write_block(&mut self, address: u32, data: &[u8]) {
        for (i, byte) in data.iter().enumerate() {
            self.write_u8(address.wrapping_add(i as u32), *byte);
        }
    }
}

/// Main memory, flat and big-endian
pub struct MainRam {
    data: Vec<u8>,
}

impl MainRam {
    pub fn new(size: usize) -> Self {
        Self {
            data: vec![0; size],
        }
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn contains(&self, address: u32) -> bool {
        (address as usize) < self.data.len()
    }

    pub fn reset(&mut self) {
        self.data.fill(0);
    }

    fn range(&self, address: u32, len: usize) -> Option<core::ops::Range<usize>> {
        let start = address as usize;
        let end = start.checked_add(len)?;
        if end > self.data.len() {
            warn!(
                "RAM access out of range (Addr: 0x{:x}, len: 0x{:x})",
                address, len
            );
            return None;
        }
        Some(start..end)
    }

    pub fn read_u32(&self, address: u32) -> u32 {
        match self.range(address, 4) {
            Some(r) => u32::from_be_bytes([
                self.data[r.start],
                self.data[r.start + 1],
                self.data[r.start + 2],
                self.data[r.start + 3],
            ]),
            None => 0,
        }
    }

    pub fn write_u32(&mut self, address: u32, value: u32) {
        if let Some(r) = self.range(address, 4) {
            self.data[r].copy_from_slice(&value.to_be_bytes());
        }
    }
}

impl HostMemory for MainRam {
    fn read_u8(&self, address: u32) -> u8 {
        match self.range(address, 1) {
            Some(r) => self.data[r.start],
            None => 0,
        }
    }

    fn write_u8(&mut self, address: u32, value: u8) {
        if let Some(r) = self.range(address, 1) {
            self.data[r.start] = value;
        }
    }

    fn read_block(&self, address: u32, out: &mut [u8]) {
        match self.range(address, out.len()) {
            Some(r) => out.copy_from_slice(&self.data[r]),
            None => out.fill(0),
        }
    }

    fn write_block(&mut self, address: u32, data: &[u8]) {
        if let Some(r) = self.range(address, data.len()) {
            self.data[r].copy_from_slice(data);
        }
    }
}

#[cfg(test)]
mod ram_tests {
    use super::*;

    #[test]
    fn test_words_are_big_endian() {
        let mut ram = MainRam::new(0x40);
        ram.write_u32(0x10, 0x1234_5678);
        assert_eq!(ram.read_u8(0x10), 0x12);
        assert_eq!(ram.read_u8(0x13), 0x78);
        assert_eq!(ram.read_u32(0x10), 0x1234_5678);
    }

    #[test]
    fn test_out_of_range_is_ignored() {
        let mut ram = MainRam::new(0x10);
        ram.write_u32(0x0E, 0xFFFF_FFFF);
        assert_eq!(ram.read_u8(0x0E), 0);
        assert_eq!(ram.read_u32(0x20), 0);

        let mut out = [0xAA; 4];
        ram.read_block(0x0E, &mut out);
        assert_eq!(out, [0; 4]);
    }
}
