//! Process slots.
//!
//! Each slot owns one process range. Slots move between a free pool and a
//! used pool, each behind its own lock; no code path holds both at once.
//!
//! ```text
//! UNUSED --handshake--> LISTENING --channel connect--> CONNECTED
//!    ^                      |                              |
//!    +------ zombie --------+----- disconnect -------------+
//! ```

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use itc_core::range_for;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Unused,
    Listening,
    Connected,
}

/// Identifies one occupancy of a slot. A range is reused once released, so
/// stale handlers compare the generation before touching the slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotTicket {
    pub range: u32,
    pub generation: u64,
}

#[derive(Debug, Clone)]
pub struct ProcessSlot {
    pub range: u32,
    /// OS process id of the occupant.
    pub pid: u32,
    pub state: SlotState,
    /// Service-loop iterations spent listening since the last probe.
    pub listening_ticks: u32,
    pub generation: u64,
}

impl ProcessSlot {
    fn new(range: u32) -> Self {
        Self {
            range,
            pid: 0,
            state: SlotState::Unused,
            listening_ticks: 0,
            generation: 0,
        }
    }

    fn ticket(&self) -> SlotTicket {
        SlotTicket {
            range: self.range,
            generation: self.generation,
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug)]
pub struct SlotPools {
    free: Mutex<VecDeque<ProcessSlot>>,
    used: Mutex<BTreeMap<u32, ProcessSlot>>,
}

impl SlotPools {
    /// Slots for process-id values `1..=max_processes`.
    pub fn new(max_processes: u32) -> Self {
        Self {
            free: Mutex::new((1..=max_processes).map(|p| ProcessSlot::new(range_for(p))).collect()),
            used: Mutex::new(BTreeMap::new()),
        }
    }

    /// Take a free slot for `pid` and mark it listening.
    pub fn acquire(&self, pid: u32) -> Option<SlotTicket> {
        let mut slot = lock(&self.free).pop_front()?;
        slot.pid = pid;
        slot.state = SlotState::Listening;
        slot.listening_ticks = 0;
        slot.generation += 1;
        let ticket = slot.ticket();
        lock(&self.used).insert(slot.range, slot);
        Some(ticket)
    }

    /// Move a listening slot to connected. False if the ticket is stale.
    pub fn mark_connected(&self, ticket: SlotTicket) -> bool {
        let mut used = lock(&self.used);
        match used.get_mut(&ticket.range) {
            Some(slot) if slot.generation == ticket.generation => {
                slot.state = SlotState::Connected;
                true
            }
            _ => false,
        }
    }

    /// Return a slot to the free pool. `None` if the ticket is stale.
    pub fn release(&self, ticket: SlotTicket) -> Option<ProcessSlot> {
        let released = {
            let mut used = lock(&self.used);
            match used.get(&ticket.range) {
                Some(slot) if slot.generation == ticket.generation => used.remove(&ticket.range),
                _ => None,
            }
        }?;

        let mut slot = released.clone();
        slot.pid = 0;
        slot.state = SlotState::Unused;
        slot.listening_ticks = 0;
        lock(&self.free).push_back(slot);
        Some(released)
    }

    /// Whether `ticket` still names the slot's current occupancy.
    pub fn is_current(&self, ticket: SlotTicket) -> bool {
        lock(&self.used)
            .get(&ticket.range)
            .is_some_and(|slot| slot.generation == ticket.generation)
    }

    pub fn is_connected(&self, range: u32) -> bool {
        self.state_of(range) == SlotState::Connected
    }

    pub fn state_of(&self, range: u32) -> SlotState {
        lock(&self.used)
            .get(&range)
            .map_or(SlotState::Unused, |slot| slot.state)
    }

    pub fn pid_of(&self, range: u32) -> Option<u32> {
        lock(&self.used).get(&range).map(|slot| slot.pid)
    }

    pub fn free_count(&self) -> usize {
        lock(&self.free).len()
    }

    pub fn used_count(&self) -> usize {
        lock(&self.used).len()
    }

    pub fn used_ranges(&self) -> Vec<u32> {
        lock(&self.used).keys().copied().collect()
    }

    /// Advance every listening slot by one iteration and return the slots
    /// whose process should be probed: those that reached `zombie_ticks`,
    /// or all of them while fewer than `low_water` slots are free. Probed
    /// slots start counting again.
    pub fn tick_listening(&self, zombie_ticks: u32, low_water: usize) -> Vec<(SlotTicket, u32)> {
        let starved = self.free_count() < low_water;
        let mut due = Vec::new();
        for slot in lock(&self.used).values_mut() {
            if slot.state != SlotState::Listening {
                continue;
            }
            slot.listening_ticks += 1;
            if starved || slot.listening_ticks >= zombie_ticks {
                slot.listening_ticks = 0;
                due.push((slot.ticket(), slot.pid));
            }
        }
        due
    }
}
