//! Discrete-event timeline shared by the bus and its devices.
//!
//! Nothing in the core owns a clock. Channels and devices only register
//! event types, schedule `(type, userdata)` records against future ticks and
//! read the current tick. Whoever drives the emulation pops due events from
//! the queue and hands them to `ExpansionInterface::handle_event`, which looks
//! the target up by identity. A record that outlives its target is ignored.

use core::cell::RefCell;

use crossbeam_channel::{unbounded, Receiver, Sender};
use heapless::String;
use log::{debug, error};

pub const MAX_EVENT_NAME: usize = 32;

/// Handle returned by `register_event`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct EventType(u32);

impl EventType {
    pub fn id(self) -> u32 {
        self.0
    }
}

/// A fired event, handed out by the queue when its tick is reached
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Event {
    pub event_type: EventType,
    pub userdata: u64,
    pub due: u64,
}

/// Scheduler operations consumed by channels and devices
pub trait Scheduler {
    fn register_event(&self, name: &str) -> EventType;
    fn schedule(&self, event_type: EventType, ticks_into_future: u64, userdata: u64);
    /// Fires at the current tick, but only after the caller has returned
    fn schedule_immediate_threadsafe(&self, event_type: EventType, userdata: u64);
    /// Drops every pending occurrence of `event_type`
    fn remove_event(&self, event_type: EventType);
    fn ticks(&self) -> u64;
    fn ticks_per_second(&self) -> u64;
}

struct Scheduled {
    due: u64,
    order: u64, // insertion order breaks ties between equal due ticks
    event_type: EventType,
    userdata: u64,
}

struct Timeline {
    now: u64,
    next_order: u64,
    names: Vec<String<MAX_EVENT_NAME>>,
    pending: Vec<Scheduled>, // sorted by (due, order)
}

impl Timeline {
    fn insert(&mut self, due: u64, event_type: EventType, userdata: u64) {
        let order = self.next_order;
        self.next_order += 1;
        let idx = self
            .pending
            .partition_point(|s| (s.due, s.order) <= (due, order));
        self.pending.insert(
            idx,
            Scheduled {
                due,
                order,
                event_type,
                userdata,
            },
        );
    }
}

/// Single-threaded event queue with a thread-safe side door for
/// "run this as soon as possible" requests
pub struct EventQueue {
    timeline: RefCell<Timeline>,
    ticks_per_second: u64,
    remote_tx: Sender<(EventType, u64)>,
    remote_rx: Receiver<(EventType, u64)>,
}

/// `Send` handle for scheduling immediate events from another thread
#[derive(Clone)]
pub struct RemoteScheduler {
    tx: Sender<(EventType, u64)>,
}

impl RemoteScheduler {
    pub fn schedule_immediate(&self, event_type: EventType, userdata: u64) {
        if self.tx.send((event_type, userdata)).is_err() {
            error!("Event queue is gone, dropping event {}", event_type.id());
        }
    }
}

impl EventQueue {
    pub fn new(ticks_per_second: u64) -> Self {
        let (remote_tx, remote_rx) = unbounded();
        Self {
            timeline: RefCell::new(Timeline {
                now: 0,
                next_order: 0,
                names: Vec::new(),
                pending: Vec::new(),
            }),
            ticks_per_second,
            remote_tx,
            remote_rx,
        }
    }

    pub fn remote(&self) -> RemoteScheduler {
        RemoteScheduler {
            tx: self.remote_tx.clone(),
        }
    }

    pub fn name(&self, event_type: EventType) -> Option<String<MAX_EVENT_NAME>> {
        let timeline = self.timeline.borrow();
        timeline.names.get(event_type.0 as usize).cloned()
    }

    /// Number of events waiting, including unpolled immediate requests
    pub fn pending(&self) -> usize {
        self.timeline.borrow().pending.len() + self.remote_rx.len()
    }

    pub fn is_scheduled(&self, event_type: EventType) -> bool {
        self.drain_remote();
        let timeline = self.timeline.borrow();
        timeline.pending.iter().any(|s| s.event_type == event_type)
    }

    pub fn next_due(&self) -> Option<u64> {
        self.drain_remote();
        self.timeline.borrow().pending.first().map(|s| s.due)
    }

    fn drain_remote(&self) {
        let mut timeline = self.timeline.borrow_mut();
        while let Ok((event_type, userdata)) = self.remote_rx.try_recv() {
            let now = timeline.now;
            timeline.insert(now, event_type, userdata);
        }
    }

    /// Hands out the earliest event due at or before `until`, moving the
    /// clock forward to its tick
    pub fn pop_due(&self, until: u64) -> Option<Event> {
        self.drain_remote();
        let mut timeline = self.timeline.borrow_mut();
        match timeline.pending.first() {
            Some(first) if first.due <= until => {}
            _ => return None,
        }
        let next = timeline.pending.remove(0);
        if next.due > timeline.now {
            timeline.now = next.due;
        }
        Some(Event {
            event_type: next.event_type,
            userdata: next.userdata,
            due: next.due,
        })
    }

    /// Moves the clock without firing anything
    pub fn advance_to(&self, until: u64) {
        let mut timeline = self.timeline.borrow_mut();
        if until > timeline.now {
            timeline.now = until;
        }
    }

    /// Fires everything due up to `until` in order, then parks the clock there
    pub fn run_until<F: FnMut(Event)>(&self, until: u64, mut dispatch: F) -> usize {
        let mut fired = 0;
        while let Some(event) = self.pop_due(until) {
            // The borrow is released here, so handlers may schedule freely
            dispatch(event);
            fired += 1;
        }
        self.advance_to(until);
        fired
    }
}

impl Scheduler for EventQueue {
    fn register_event(&self, name: &str) -> EventType {
        let mut timeline = self.timeline.borrow_mut();
        if let Some(idx) = timeline.names.iter().position(|n| n.as_str() == name) {
            return EventType(idx as u32);
        }

        let mut stored: String<MAX_EVENT_NAME> = String::new();
        if stored.push_str(name).is_err() {
            error!("Event name too long, truncating: {}", name);
            for c in name.chars() {
                if stored.push(c).is_err() {
                    break;
                }
            }
        }
        timeline.names.push(stored);
        let event_type = EventType((timeline.names.len() - 1) as u32);
        debug!("Registered event {} as {}", name, event_type.0);
        event_type
    }

    fn schedule(&self, event_type: EventType, ticks_into_future: u64, userdata: u64) {
        let mut timeline = self.timeline.borrow_mut();
        let due = timeline.now + ticks_into_future;
        timeline.insert(due, event_type, userdata);
    }

    fn schedule_immediate_threadsafe(&self, event_type: EventType, userdata: u64) {
        // Never fails: the queue owns the receiving end
        let _ = self.remote_tx.send((event_type, userdata));
    }

    fn remove_event(&self, event_type: EventType) {
        self.drain_remote();
        let mut timeline = self.timeline.borrow_mut();
        timeline.pending.retain(|s| s.event_type != event_type);
    }

    fn ticks(&self) -> u64 {
        self.timeline.borrow().now
    }

    fn ticks_per_second(&self) -> u64 {
        self.ticks_per_second
    }
}
