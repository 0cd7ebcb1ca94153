use core::cell::Cell;

/// Processor-side interrupt input the bus drives
pub trait InterruptSink {
    fn set_interrupt(&self, asserted: bool);
}

/// Recording interrupt line: current level plus how often it was driven
pub struct InterruptLine {
    asserted: Cell<bool>,
    updates: Cell<u32>,     // every set_interrupt call
    rising_edges: Cell<u32>, // low -> high transitions
}

impl InterruptLine {
    pub fn new() -> Self {
        Self {
            asserted: Cell::new(false),
            updates: Cell::new(0),
            rising_edges: Cell::new(0),
        }
    }

    pub fn is_asserted(&self) -> bool {
        self.asserted.get()
    }

    pub fn updates(&self) -> u32 {
        self.updates.get()
    }

    pub fn rising_edges(&self) -> u32 {
        self.rising_edges.get()
    }
}

impl Default for InterruptLine {
    fn default() -> Self {
        Self::new()
    }
}

impl InterruptSink for InterruptLine {
    fn set_interrupt(&self, asserted: bool) {
        if asserted && !self.asserted.get() {
            self.rising_edges.set(self.rising_edges.get() + 1);
        }
        self.asserted.set(asserted);
        self.updates.set(self.updates.get() + 1);
    }
}
