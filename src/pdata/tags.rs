use crate::model::types::{NOT_LOCAL, Tag};
use std::collections::BTreeSet;

/// Bookkeeping for stable particle tags.
///
/// Holds the reverse lookup from tag to local slot, the ordered set of
/// active tags, a stack of retired tags awaiting reuse, and a lazily rebuilt
/// ascending list of the active tags.
///
/// Every tag below `rtag_len()` has been issued at some point. An issued tag
/// is either active (in the set) or retired (on the recycle stack), never
/// both.
#[derive(Debug, Clone, Default)]
pub struct TagIndex {
    rtag: Vec<u32>,
    active: BTreeSet<Tag>,
    recycled: Vec<Tag>,
    cached: Vec<Tag>,
    cache_valid: bool,
}

impl TagIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `0..n_global` the active tags, none of them local.
    pub fn reset(&mut self, n_global: usize) {
        self.rtag = vec![NOT_LOCAL; n_global];
        self.active = (0..n_global as Tag).collect();
        self.recycled.clear();
        self.cache_valid = false;
    }

    /// Issues a tag for a new particle: the most recently retired tag if
    /// any, otherwise the next unused one. The new tag starts out not local.
    pub fn allocate_tag(&mut self) -> Tag {
        let tag = self.recycled.pop().unwrap_or_else(|| {
            debug_assert_eq!(self.rtag.len(), self.active.len());
            self.active.len() as Tag
        });
        self.active.insert(tag);
        self.cache_valid = false;
        if self.rtag.len() <= tag as usize {
            self.rtag.resize(tag as usize + 1, NOT_LOCAL);
        }
        self.rtag[tag as usize] = NOT_LOCAL;
        tag
    }

    /// Retires an active tag so a later [`allocate_tag`](Self::allocate_tag)
    /// can reuse it.
    pub fn release_tag(&mut self, tag: Tag) {
        if let Some(slot) = self.rtag.get_mut(tag as usize) {
            *slot = NOT_LOCAL;
        }
        if self.active.remove(&tag) {
            self.recycled.push(tag);
            self.cache_valid = false;
        }
    }

    /// Local slot of `tag`, if it is resident on this rank.
    pub fn slot_of(&self, tag: Tag) -> Option<usize> {
        self.rtag
            .get(tag as usize)
            .filter(|&&slot| slot != NOT_LOCAL)
            .map(|&slot| slot as usize)
    }

    pub fn set_slot(&mut self, tag: Tag, slot: usize) {
        self.rtag[tag as usize] = slot as u32;
    }

    pub fn clear_slot(&mut self, tag: Tag) {
        if let Some(slot) = self.rtag.get_mut(tag as usize) {
            *slot = NOT_LOCAL;
        }
    }

    /// Points each listed tag at its position in `tags`, starting at slot
    /// `first_slot`.
    pub fn assign_slots(&mut self, tags: &[Tag], first_slot: usize) {
        for (offset, &tag) in tags.iter().enumerate() {
            self.rtag[tag as usize] = (first_slot + offset) as u32;
        }
    }

    /// True if `tag` has ever been issued.
    pub fn is_issued(&self, tag: Tag) -> bool {
        (tag as usize) < self.rtag.len()
    }

    pub fn is_active(&self, tag: Tag) -> bool {
        self.active.contains(&tag)
    }

    /// Raw reverse-lookup table; unset entries hold [`NOT_LOCAL`].
    pub fn rtags(&self) -> &[u32] {
        &self.rtag
    }

    pub fn rtag_len(&self) -> usize {
        self.rtag.len()
    }

    /// Largest tag ever issued.
    pub fn maximum_tag(&self) -> Option<Tag> {
        self.rtag.len().checked_sub(1).map(|max| max as Tag)
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn recycled_count(&self) -> usize {
        self.recycled.len()
    }

    /// Active tags in ascending order.
    pub fn active_tags(&mut self) -> &[Tag] {
        if !self.cache_valid {
            self.cached.clear();
            self.cached.extend(self.active.iter().copied());
            self.cache_valid = true;
        }
        &self.cached
    }

    /// The `n`-th smallest active tag.
    pub fn nth_tag(&mut self, n: usize) -> Option<Tag> {
        self.active_tags().get(n).copied()
    }
}
