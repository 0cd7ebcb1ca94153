use memcard_protocol::CardSize;

use crate::constants::TICKS_PER_SECOND;
use crate::exi::device::DeviceKind;

/// Machine-level settings for the expansion bus
#[derive(Clone, Debug)]
pub struct ExiConfig {
    pub slot_a: DeviceKind,   // channel 0, device 0
    pub slot_b: DeviceKind,   // channel 1, device 0
    pub card_size: CardSize,  // capacity of newly opened cards
    pub store_card_contents: bool, // savestates carry the full card image
    pub ticks_per_second: u64,
}

impl Default for ExiConfig {
    fn default() -> Self {
        Self {
            slot_a: DeviceKind::MemoryCard,
            slot_b: DeviceKind::None,
            card_size: CardSize::Mb128,
            store_card_contents: false,
            ticks_per_second: TICKS_PER_SECOND,
        }
    }
}

impl ExiConfig {
    /// Device kind configured for memory card slot `card_index` (0 = A)
    pub fn card_slot(&self, card_index: usize) -> DeviceKind {
        match card_index {
            0 => self.slot_a,
            1 => self.slot_b,
            _ => DeviceKind::None,
        }
    }
}
