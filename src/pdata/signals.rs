//! Change notifications for collaborators that cache particle-derived state.
//!
//! Subscribers hold no references into the store; they are closures that
//! receive a small event value and are invoked synchronously, in
//! registration order, when the store emits.

use crate::model::boxdim::BoxDim;
use crate::model::types::Tag;

/// Handle returned by [`Signal::connect`], used to disconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotId(u64);

/// A list of subscribers to one kind of event.
pub struct Signal<T> {
    slots: Vec<(SlotId, Box<dyn FnMut(&T)>)>,
    next_id: u64,
}

impl<T> Signal<T> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            next_id: 0,
        }
    }

    pub fn connect(&mut self, slot: impl FnMut(&T) + 'static) -> SlotId {
        let id = SlotId(self.next_id);
        self.next_id += 1;
        self.slots.push((id, Box::new(slot)));
        id
    }

    /// Removes a subscriber. Returns `false` if it was not connected.
    pub fn disconnect(&mut self, id: SlotId) -> bool {
        let before = self.slots.len();
        self.slots.retain(|(slot_id, _)| *slot_id != id);
        self.slots.len() != before
    }

    pub fn emit(&mut self, event: &T) {
        for (_, slot) in &mut self.slots {
            slot(event);
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

impl<T> Default for Signal<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for Signal<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signal")
            .field("subscribers", &self.slots.len())
            .finish()
    }
}

/// A particle changed owner rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParticleMove {
    pub tag: Tag,
    pub from: u32,
    pub to: u32,
}

/// Every notification the particle store emits.
#[derive(Debug, Default)]
pub struct ParticleSignals {
    /// Array capacity changed; carries the new capacity.
    pub capacity_changed: Signal<usize>,
    /// Local slot order or membership changed.
    pub particle_sort: Signal<()>,
    /// The type table changed; carries the new number of types.
    pub num_types_changed: Signal<usize>,
    /// The global particle count changed; carries the new count.
    pub global_count_changed: Signal<usize>,
    /// Ghosts are about to be discarded; carries how many there were.
    pub ghosts_removed: Signal<usize>,
    pub particle_moved: Signal<ParticleMove>,
    pub box_changed: Signal<BoxDim>,
}
