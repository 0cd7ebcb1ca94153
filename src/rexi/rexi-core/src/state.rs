//! Savestate cursor.
//!
//! One `do_*` call per field, the same code path for saving, loading and
//! measuring. Values are stored big-endian. A load that runs off the end of
//! the buffer or trips a marker latches `failed()` and stops touching the
//! caller's values; nothing panics.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use log::error;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StateMode {
    Read,    // load: values are overwritten from the buffer
    Write,   // save: values are appended to the buffer
    Measure, // dry run: only the size is counted
}

/// Scalar types the cursor can carry
pub trait StateValue: Sized {
    const SIZE: usize;
    fn save(&self, out: &mut Vec<u8>);
    fn load(input: &mut &[u8]) -> std::io::Result<Self>;
}

macro_rules! state_value {
    ($ty:ty, $size:expr, $write:ident, $read:ident) => {
        impl StateValue for $ty {
            const SIZE: usize = $size;
            fn save(&self, out: &mut Vec<u8>) {
                // Writes into a Vec cannot fail
                let _ = out.$write::<BigEndian>(*self);
            }
            fn load(input: &mut &[u8]) -> std::io::Result<Self> {
                input.$read::<BigEndian>()
            }
        }
    };
}

state_value!(u16, 2, write_u16, read_u16);
state_value!(u32, 4, write_u32, read_u32);
state_value!(u64, 8, write_u64, read_u64);
state_value!(i32, 4, write_i32, read_i32);

impl StateValue for u8 {
    const SIZE: usize = 1;
    fn save(&self, out: &mut Vec<u8>) {
        out.push(*self);
    }
    fn load(input: &mut &[u8]) -> std::io::Result<Self> {
        input.read_u8()
    }
}

impl StateValue for bool {
    const SIZE: usize = 1;
    fn save(&self, out: &mut Vec<u8>) {
        out.push(*self as u8);
    }
    fn load(input: &mut &[u8]) -> std::io::Result<Self> {
        Ok(input.read_u8()? != 0)
    }
}

pub struct StateWrap {
    mode: StateMode,
    data: Vec<u8>,
    position: usize,
    failed: bool,
}

impl StateWrap {
    pub fn writer() -> Self {
        Self::with_mode(StateMode::Write, Vec::new())
    }

    pub fn reader(data: Vec<u8>) -> Self {
        Self::with_mode(StateMode::Read, data)
    }

    pub fn measurer() -> Self {
        Self::with_mode(StateMode::Measure, Vec::new())
    }

    fn with_mode(mode: StateMode, data: Vec<u8>) -> Self {
        Self {
            mode,
            data,
            position: 0,
            failed: false,
        }
    }

    pub fn mode(&self) -> StateMode {
        self.mode
    }

    pub fn is_reading(&self) -> bool {
        self.mode == StateMode::Read
    }

    /// Bytes consumed (read), produced (write) or counted (measure)
    pub fn position(&self) -> usize {
        self.position
    }

    pub fn failed(&self) -> bool {
        self.failed
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    fn fail(&mut self, what: &str) {
        if !self.failed {
            error!(
                "Savestate load failed at offset {} ({})",
                self.position, what
            );
        }
        self.failed = true;
    }

    /// Marks the load as failed, e.g. when a value read back is nonsense
    pub fn set_failed(&mut self, what: &str) {
        self.fail(what);
    }

    /// Typed value
    pub fn do_value<T: StateValue>(&mut self, value: &mut T) {
        match self.mode {
            StateMode::Write => value.save(&mut self.data),
            StateMode::Measure => {}
            StateMode::Read => {
                if self.failed {
                    return;
                }
                let mut input = match self.data.get(self.position..) {
                    Some(rest) => rest,
                    None => &[][..],
                };
                match T::load(&mut input) {
                    Ok(loaded) => *value = loaded,
                    Err(_) => {
                        self.fail("truncated value");
                        return;
                    }
                }
            }
        }
        self.position += T::SIZE;
    }

    /// Plain block of bytes, length fixed by the caller
    pub fn do_bytes(&mut self, bytes: &mut [u8]) {
        match self.mode {
            StateMode::Write => self.data.extend_from_slice(bytes),
            StateMode::Measure => {}
            StateMode::Read => {
                if self.failed {
                    return;
                }
                let end = self.position + bytes.len();
                match self.data.get(self.position..end) {
                    Some(src) => bytes.copy_from_slice(src),
                    None => {
                        self.fail("truncated block");
                        return;
                    }
                }
            }
        }
        self.position += bytes.len();
    }

    /// Section cookie; a mismatch on load means the layout drifted
    pub fn do_marker(&mut self, name: &str) {
        let expected = name
            .bytes()
            .fold(0x811C_9DC5u32, |h, b| (h ^ b as u32).wrapping_mul(0x0100_0193));
        let mut cookie = expected;
        self.do_value(&mut cookie);
        if self.is_reading() && !self.failed && cookie != expected {
            self.fail(name);
        }
    }
}

#[cfg(test)]
mod state_tests {
    use super::*;

    fn walk(p: &mut StateWrap, a: &mut u32, b: &mut bool, c: &mut [u8; 3]) {
        p.do_marker("walk");
        p.do_value(a);
        p.do_value(b);
        p.do_bytes(c);
    }

    #[test]
    fn test_save_then_load() {
        let (mut a, mut b, mut c) = (0xDEAD_BEEFu32, true, [1u8, 2, 3]);
        let mut p = StateWrap::writer();
        walk(&mut p, &mut a, &mut b, &mut c);
        let bytes = p.into_bytes();
        assert_eq!(&bytes[4..8], &[0xDE, 0xAD, 0xBE, 0xEF]);

        let (mut a2, mut b2, mut c2) = (0u32, false, [0u8; 3]);
        let mut p = StateWrap::reader(bytes);
        walk(&mut p, &mut a2, &mut b2, &mut c2);
        assert!(!p.failed());
        assert_eq!((a2, b2, c2), (a, b, c));
    }

    #[test]
    fn test_measure_counts_without_writing() {
        let mut p = StateWrap::measurer();
        walk(&mut p, &mut 0, &mut false, &mut [0; 3]);
        assert_eq!(p.position(), 4 + 4 + 1 + 3);
        assert!(p.into_bytes().is_empty());
    }

    #[test]
    fn test_truncated_load_latches_failure() {
        let mut p = StateWrap::writer();
        walk(&mut p, &mut 7, &mut true, &mut [9; 3]);
        let mut bytes = p.into_bytes();
        bytes.truncate(6);

        let mut a = 1u32;
        let mut p = StateWrap::reader(bytes);
        walk(&mut p, &mut a, &mut false, &mut [0; 3]);
        assert!(p.failed());
        assert_eq!(a, 1);
    }

    #[test]
    fn test_marker_mismatch_fails() {
        let mut p = StateWrap::writer();
        p.do_marker("one");
        let mut p = StateWrap::reader(p.into_bytes());
        p.do_marker("two");
        assert!(p.failed());
    }
}
