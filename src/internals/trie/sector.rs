//! Sectors are the nodes of a shard's trie.
//!
//! A pointer sector holds 256 child links, a value sector holds 256 key/value
//! slots. Both carry a 256 bit occupancy set, a reference count of occupied
//! slots, and a back link to the parent sector with their own index inside it.
//!
//! Sectors live in an index addressed pool (`SectorArena`). Parent links are
//! plain indices that are only ever used to walk upwards (pruning and cursor
//! ascent), never for ownership.

use std::fmt;
use std::mem;

/// Slots per sector, one per value of a hash byte.
pub(crate) const SECTOR_SIZE: usize = 256;

/// Index of a sector inside its arena.
pub(crate) type SectorId = u32;

/// The root is always the first sector allocated, and is never pruned.
pub(crate) const ROOT: SectorId = 0;

const NIL: SectorId = SectorId::MAX;

/// Byte `level` of `hash`, where byte 0 is the least significant. Levels past
/// the width of the hash read as zero.
#[inline]
pub(crate) fn hash_byte(hash: u64, level: u8) -> u8 {
    hash.checked_shr(u32::from(level) * 8).unwrap_or(0) as u8
}

/// A 256 bit occupancy set.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Occupancy([u64; 4]);

impl Occupancy {
    #[inline]
    pub(crate) fn contains(&self, i: u8) -> bool {
        self.0[usize::from(i >> 6)] & (1 << (i & 63)) != 0
    }

    /// Returns true if the bit was not already set.
    #[inline]
    pub(crate) fn insert(&mut self, i: u8) -> bool {
        let was = self.contains(i);
        self.0[usize::from(i >> 6)] |= 1 << (i & 63);
        !was
    }

    /// Returns true if the bit was set.
    #[inline]
    pub(crate) fn remove(&mut self, i: u8) -> bool {
        let was = self.contains(i);
        self.0[usize::from(i >> 6)] &= !(1 << (i & 63));
        was
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.0.iter().all(|w| *w == 0)
    }

    /// The first set bit at or after `from`.
    pub(crate) fn next_set(&self, from: usize) -> Option<u8> {
        let mut word = from / 64;
        if word >= self.0.len() {
            return None;
        }
        let mut bits = self.0[word] & (u64::MAX << (from % 64));
        loop {
            if bits != 0 {
                return Some((word * 64 + bits.trailing_zeros() as usize) as u8);
            }
            word += 1;
            if word == self.0.len() {
                return None;
            }
            bits = self.0[word];
        }
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = u8> + '_ {
        std::iter::successors(self.next_set(0), move |i| self.next_set(usize::from(*i) + 1))
    }

    pub(crate) fn count(&self) -> u32 {
        self.0.iter().map(|w| w.count_ones()).sum()
    }
}

impl fmt::Debug for Occupancy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

pub(crate) enum Slots<K, V> {
    Pointers(Box<[SectorId; SECTOR_SIZE]>),
    Values(Box<[Option<(K, V)>]>),
    // A pruned sector. It keeps its parent link so a cursor parked inside it
    // can still ascend.
    Vacant,
}

pub(crate) struct Sector<K, V> {
    pub(crate) occupancy: Occupancy,
    refs: u16,
    pub(crate) parent: Option<SectorId>,
    pub(crate) parent_slot: u8,
    pub(crate) slots: Slots<K, V>,
}

impl<K, V> Sector<K, V> {
    fn new_pointers(parent: Option<SectorId>, parent_slot: u8) -> Self {
        Sector {
            occupancy: Occupancy::default(),
            refs: 0,
            parent,
            parent_slot,
            slots: Slots::Pointers(Box::new([NIL; SECTOR_SIZE])),
        }
    }

    fn new_values(parent: Option<SectorId>, parent_slot: u8) -> Self {
        Sector {
            occupancy: Occupancy::default(),
            refs: 0,
            parent,
            parent_slot,
            slots: Slots::Values((0..SECTOR_SIZE).map(|_| None).collect()),
        }
    }

    pub(crate) fn is_values(&self) -> bool {
        matches!(self.slots, Slots::Values(_))
    }

    /// The occupied entries of a value sector, in slot order.
    pub(crate) fn entries(&self) -> impl Iterator<Item = (&K, &V)> + '_ {
        let values = match &self.slots {
            Slots::Values(values) => Some(values),
            _ => None,
        };
        self.occupancy.iter().filter_map(move |i| {
            values
                .and_then(|values| values[usize::from(i)].as_ref())
                .map(|(k, v)| (k, v))
        })
    }
}

impl<K, V> fmt::Debug for Sector<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.slots {
            Slots::Pointers(_) => "pointers",
            Slots::Values(_) => "values",
            Slots::Vacant => "vacant",
        };
        f.debug_struct("Sector")
            .field("kind", &kind)
            .field("refs", &self.refs)
            .field("occupied", &self.occupancy.count())
            .field("parent", &self.parent)
            .field("parent_slot", &self.parent_slot)
            .finish()
    }
}

/// A position of a depth first walk over the arena.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct SectorCursor {
    // None until the first step, which starts at the root.
    sector: Option<SectorId>,
    // The slot to resume scanning from, one past the last visited slot.
    from: usize,
}

/// The trie of a single shard.
pub(crate) struct SectorArena<K, V> {
    sectors: Vec<Sector<K, V>>,
    free: Vec<SectorId>,
    depth: u8,
    // While a cursor may be parked in the arena, pruned ids are not handed
    // out again, so a parked cursor never wakes up inside a stranger's sector.
    pinned: bool,
}

impl<K, V> SectorArena<K, V> {
    /// An empty trie with `depth` pointer levels above the value sectors.
    pub(crate) fn new(depth: u8) -> Self {
        let mut arena = SectorArena {
            sectors: Vec::with_capacity(1),
            free: Vec::new(),
            depth,
            pinned: false,
        };
        let root = arena.new_root();
        arena.sectors.push(root);
        arena
    }

    fn new_root(&self) -> Sector<K, V> {
        if self.depth == 0 {
            Sector::new_values(None, 0)
        } else {
            Sector::new_pointers(None, 0)
        }
    }

    #[inline]
    pub(crate) fn sector(&self, id: SectorId) -> &Sector<K, V> {
        &self.sectors[id as usize]
    }

    /// Number of sectors currently linked into the trie, root included.
    pub(crate) fn live_sectors(&self) -> usize {
        self.sectors.len() - self.free.len()
    }

    /// Stop (or resume) reusing pruned sector ids.
    pub(crate) fn set_pinned(&mut self, pinned: bool) {
        self.pinned = pinned;
    }

    /// Drop every entry.
    ///
    /// An unpinned arena is swapped for a fresh one, and the old arena is
    /// handed back so the caller can drop the entries wherever it likes. A
    /// pinned arena is emptied in place: every sector but the root turns
    /// vacant and keeps its parent link.
    pub(crate) fn clear(&mut self) -> Option<Self> {
        if !self.pinned {
            let fresh = SectorArena::new(self.depth);
            return Some(mem::replace(self, fresh));
        }
        let root = self.new_root();
        self.sectors[ROOT as usize] = root;
        for (id, sector) in self.sectors.iter_mut().enumerate().skip(1) {
            if matches!(sector.slots, Slots::Vacant) {
                continue;
            }
            sector.occupancy = Occupancy::default();
            sector.refs = 0;
            sector.slots = Slots::Vacant;
            self.free.push(id as SectorId);
        }
        None
    }

    fn alloc(&mut self, parent: SectorId, parent_slot: u8, values: bool) -> SectorId {
        let sector = if values {
            Sector::new_values(Some(parent), parent_slot)
        } else {
            Sector::new_pointers(Some(parent), parent_slot)
        };
        let reused = if self.pinned { None } else { self.free.pop() };
        match reused {
            Some(id) => {
                self.sectors[id as usize] = sector;
                id
            }
            None => {
                let id = self.sectors.len() as SectorId;
                self.sectors.push(sector);
                id
            }
        }
    }

    fn release(&mut self, id: SectorId) {
        let sector = &mut self.sectors[id as usize];
        debug_assert!(sector.refs == 0 && sector.occupancy.is_empty());
        sector.occupancy = Occupancy::default();
        sector.slots = Slots::Vacant;
        self.free.push(id);
    }

    pub(crate) fn get_sector(&self, id: SectorId, i: u8) -> Option<SectorId> {
        let sector = self.sector(id);
        match &sector.slots {
            Slots::Pointers(children) if sector.occupancy.contains(i) => {
                Some(children[usize::from(i)])
            }
            Slots::Pointers(_) => None,
            _ => unreachable!("get_sector on a value sector"),
        }
    }

    pub(crate) fn set_sector(&mut self, id: SectorId, i: u8, child: SectorId) {
        let sector = &mut self.sectors[id as usize];
        let Slots::Pointers(children) = &mut sector.slots else {
            unreachable!("set_sector on a value sector");
        };
        children[usize::from(i)] = child;
        if sector.occupancy.insert(i) {
            sector.refs += 1;
        }
    }

    /// Unlink the child at `i`, then keep pruning upwards while ancestors are
    /// left without children.
    pub(crate) fn remove_sector(&mut self, mut id: SectorId, mut i: u8) {
        loop {
            let (child, next) = {
                let sector = &mut self.sectors[id as usize];
                if !sector.occupancy.remove(i) {
                    return;
                }
                let Slots::Pointers(children) = &mut sector.slots else {
                    unreachable!("remove_sector on a value sector");
                };
                let child = mem::replace(&mut children[usize::from(i)], NIL);
                sector.refs -= 1;
                let next = if sector.refs == 0 {
                    sector.parent.map(|p| (p, sector.parent_slot))
                } else {
                    None
                };
                (child, next)
            };
            self.release(child);
            match next {
                Some((parent, slot)) => {
                    id = parent;
                    i = slot;
                }
                None => return,
            }
        }
    }

    /// The key stored at slot `i`: the key of the last write to this
    /// address, which need not equal the key a caller looked up with.
    pub(crate) fn get_key(&self, id: SectorId, i: u8) -> Option<&K> {
        self.get_entry(id, i).map(|(k, _)| k)
    }

    pub(crate) fn get_value(&self, id: SectorId, i: u8) -> Option<&V> {
        self.get_entry(id, i).map(|(_, v)| v)
    }

    fn get_entry(&self, id: SectorId, i: u8) -> Option<&(K, V)> {
        match &self.sector(id).slots {
            Slots::Values(values) => values[usize::from(i)].as_ref(),
            _ => unreachable!("get_entry on a pointer sector"),
        }
    }

    pub(crate) fn contains_key(&self, id: SectorId, i: u8) -> bool {
        let sector = self.sector(id);
        debug_assert!(sector.is_values());
        sector.occupancy.contains(i)
    }

    /// Store `k`/`v` at slot `i`, returning the value it replaced. `None`
    /// means the slot was empty and this was a genuine insert.
    pub(crate) fn set_entry(&mut self, id: SectorId, i: u8, k: K, v: V) -> Option<V> {
        let sector = &mut self.sectors[id as usize];
        let Slots::Values(values) = &mut sector.slots else {
            unreachable!("set_entry on a pointer sector");
        };
        let prev = values[usize::from(i)].replace((k, v)).map(|(_, v)| v);
        if sector.occupancy.insert(i) {
            sector.refs += 1;
        }
        prev
    }

    /// Take the entry at slot `i`, pruning the sector if it becomes empty.
    pub(crate) fn remove_entry(&mut self, id: SectorId, i: u8) -> Option<(K, V)> {
        let sector = &mut self.sectors[id as usize];
        if !sector.occupancy.remove(i) {
            return None;
        }
        let Slots::Values(values) = &mut sector.slots else {
            unreachable!("remove_entry on a pointer sector");
        };
        let entry = values[usize::from(i)].take();
        sector.refs -= 1;
        if sector.refs == 0 {
            if let Some(parent) = sector.parent {
                let slot = sector.parent_slot;
                self.remove_sector(parent, slot);
            }
        }
        entry
    }

    /// The value sector addressing `hash`, if every sector on its path exists.
    pub(crate) fn locate(&self, hash: u64) -> Option<SectorId> {
        let mut curr = ROOT;
        for level in 1..=self.depth {
            curr = self.get_sector(curr, hash_byte(hash, level))?;
        }
        Some(curr)
    }

    /// The value sector addressing `hash`, creating missing sectors on the way.
    pub(crate) fn locate_or_create(&mut self, hash: u64) -> SectorId {
        let mut curr = ROOT;
        for level in 1..=self.depth {
            let slot = hash_byte(hash, level);
            curr = match self.get_sector(curr, slot) {
                Some(next) => next,
                None => {
                    let next = self.alloc(curr, slot, level == self.depth);
                    self.set_sector(curr, slot, next);
                    next
                }
            };
        }
        curr
    }

    /// Visit every value sector below `id`, depth first in slot order.
    pub(crate) fn for_each_sector<F>(&self, id: SectorId, f: &mut F)
    where
        F: FnMut(&Sector<K, V>),
    {
        let sector = self.sector(id);
        match &sector.slots {
            Slots::Pointers(children) => {
                for i in sector.occupancy.iter() {
                    self.for_each_sector(children[usize::from(i)], f);
                }
            }
            Slots::Values(_) => f(sector),
            Slots::Vacant => {}
        }
    }

    /// Step `cursor` to the next occupied value slot and return its entry.
    /// Returns `None` once the walk has exhausted the root.
    pub(crate) fn advance(&self, cursor: &mut SectorCursor) -> Option<&(K, V)> {
        let mut id = *cursor.sector.get_or_insert(ROOT);
        loop {
            let sector = self.sector(id);
            if let Some(i) = sector.occupancy.next_set(cursor.from) {
                match &sector.slots {
                    Slots::Values(values) => {
                        cursor.sector = Some(id);
                        cursor.from = usize::from(i) + 1;
                        return values[usize::from(i)].as_ref();
                    }
                    Slots::Pointers(children) => {
                        // Enter the child at its beginning.
                        id = children[usize::from(i)];
                        cursor.from = 0;
                        continue;
                    }
                    Slots::Vacant => unreachable!("occupied slot in a vacant sector"),
                }
            }
            match sector.parent {
                Some(parent) => {
                    cursor.from = usize::from(sector.parent_slot) + 1;
                    id = parent;
                }
                None => {
                    cursor.sector = Some(id);
                    cursor.from = SECTOR_SIZE;
                    return None;
                }
            }
        }
    }

    /// Check the refcount, parent link and occupancy invariants of every
    /// linked sector.
    #[cfg(test)]
    pub(crate) fn verify(&self) -> bool {
        let mut ok = true;
        let mut stack = vec![ROOT];
        while let Some(id) = stack.pop() {
            let sector = self.sector(id);
            ok &= u32::from(sector.refs) == sector.occupancy.count();
            if id != ROOT {
                ok &= sector.refs != 0;
            }
            match &sector.slots {
                Slots::Pointers(children) => {
                    for i in sector.occupancy.iter() {
                        let child = children[usize::from(i)];
                        let c = self.sector(child);
                        ok &= c.parent == Some(id) && c.parent_slot == i;
                        stack.push(child);
                    }
                }
                Slots::Values(values) => {
                    for (i, v) in values.iter().enumerate() {
                        ok &= v.is_some() == sector.occupancy.contains(i as u8);
                    }
                }
                Slots::Vacant => ok = false,
            }
        }
        ok
    }
}

impl<K, V> fmt::Debug for SectorArena<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SectorArena")
            .field("depth", &self.depth)
            .field("sectors", &self.sectors.len())
            .field("free", &self.free.len())
            .field("pinned", &self.pinned)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sector_occupancy_next_set() {
        let mut o = Occupancy::default();
        assert!(o.is_empty());
        assert_eq!(o.next_set(0), None);
        assert!(o.insert(3));
        assert!(!o.insert(3));
        assert!(o.insert(64));
        assert!(o.insert(255));
        assert_eq!(o.next_set(0), Some(3));
        assert_eq!(o.next_set(4), Some(64));
        assert_eq!(o.next_set(65), Some(255));
        assert_eq!(o.next_set(256), None);
        assert_eq!(o.iter().collect::<Vec<_>>(), vec![3, 64, 255]);
        assert!(o.remove(64));
        assert!(!o.remove(64));
        assert_eq!(o.count(), 2);
    }

    #[test]
    fn test_sector_hash_byte() {
        let h = 0x0807_0605_0403_0201u64;
        assert_eq!(hash_byte(h, 0), 0x01);
        assert_eq!(hash_byte(h, 7), 0x08);
        assert_eq!(hash_byte(h, 8), 0);
    }

    #[test]
    fn test_sector_set_and_overwrite() {
        let mut a: SectorArena<u64, u64> = SectorArena::new(2);
        let id = a.locate_or_create(0x0302_01);
        assert_eq!(a.set_entry(id, 0x01, 7, 70), None);
        assert_eq!(a.set_entry(id, 0x01, 7, 71), Some(70));
        assert_eq!(a.get_value(id, 0x01), Some(&71));
        assert_eq!(a.get_entry(id, 0x01), Some(&(7, 71)));
        assert!(a.contains_key(id, 0x01));
        assert!(!a.contains_key(id, 0x02));
        // root + one pointer + one value sector
        assert_eq!(a.live_sectors(), 3);
        assert!(a.verify());
    }

    #[test]
    fn test_sector_prune_to_root() {
        let mut a: SectorArena<u64, u64> = SectorArena::new(3);
        let h1 = 0x0403_0201u64;
        let h2 = 0x0503_0201u64;
        let id1 = a.locate_or_create(h1);
        a.set_entry(id1, hash_byte(h1, 0), 1, 1);
        let id2 = a.locate_or_create(h2);
        a.set_entry(id2, hash_byte(h2, 0), 2, 2);
        // Both paths share every pointer sector and split at the values.
        assert_eq!(a.live_sectors(), 5);
        assert!(a.verify());

        assert_eq!(a.remove_entry(id1, hash_byte(h1, 0)), Some((1, 1)));
        assert_eq!(a.live_sectors(), 4);
        assert!(a.locate(h1).is_none());
        assert!(a.verify());

        assert_eq!(a.remove_entry(id2, hash_byte(h2, 0)), Some((2, 2)));
        assert_eq!(a.live_sectors(), 1);
        assert!(a.sector(ROOT).occupancy.is_empty());
        assert!(a.verify());

        // A missing entry is not an error.
        assert_eq!(a.remove_entry(ROOT, 0), None);
    }

    #[test]
    fn test_sector_reuse_after_prune() {
        let mut a: SectorArena<u64, u64> = SectorArena::new(1);
        let id = a.locate_or_create(0x0100);
        a.set_entry(id, 0, 1, 1);
        a.remove_entry(id, 0);
        let again = a.locate_or_create(0x0200);
        assert_eq!(again, id);
        assert!(a.verify());
    }

    #[test]
    fn test_sector_pinned_arena_keeps_pruned_ids() {
        let mut a: SectorArena<u64, u64> = SectorArena::new(1);
        let id = a.locate_or_create(0x0100);
        a.set_entry(id, 0, 1, 1);
        a.set_pinned(true);
        a.remove_entry(id, 0);
        let fresh = a.locate_or_create(0x0200);
        assert_ne!(fresh, id);
        assert!(a.verify());

        a.set_pinned(false);
        a.remove_entry(fresh, 0);
        assert_eq!(a.locate_or_create(0x0300), fresh);
    }

    #[test]
    fn test_sector_clear_pinned_strands_cursor_safely() {
        let mut a: SectorArena<u64, u64> = SectorArena::new(2);
        for h in [0x00_01_05u64, 0x00_01_06, 0x00_02_01] {
            let id = a.locate_or_create(h);
            a.set_entry(id, hash_byte(h, 0), h, h);
        }
        let mut cursor = SectorCursor::default();
        assert_eq!(a.advance(&mut cursor).map(|e| e.0), Some(0x00_01_05));

        a.set_pinned(true);
        assert!(a.clear().is_none());
        assert_eq!(a.live_sectors(), 1);
        assert!(a.verify());
        // The cursor climbs out of its vacant sector and finds nothing left.
        assert!(a.advance(&mut cursor).is_none());

        a.set_pinned(false);
        let old = a.clear();
        assert!(old.is_some_and(|old| old.live_sectors() == 1));
        assert_eq!(a.sectors.len(), 1);
    }

    #[test]
    fn test_sector_depth_zero_root_is_values() {
        let mut a: SectorArena<u8, u8> = SectorArena::new(0);
        assert_eq!(a.locate(0xFF), Some(ROOT));
        a.set_entry(ROOT, 0xFF, 0xFF, 1);
        assert_eq!(a.remove_entry(ROOT, 0xFF), Some((0xFF, 1)));
        // The root survives even when empty.
        assert!(a.sector(ROOT).is_values());
        assert!(a.verify());
    }

    #[test]
    fn test_sector_cursor_walk_and_ascend_from_pruned() {
        let mut a: SectorArena<u64, u64> = SectorArena::new(2);
        for h in [0x00_01_05u64, 0x00_01_06, 0x00_02_01, 0x01_00_00] {
            let id = a.locate_or_create(h);
            a.set_entry(id, hash_byte(h, 0), h, h);
        }

        let mut cursor = SectorCursor::default();
        assert_eq!(a.advance(&mut cursor).map(|e| e.0), Some(0x01_00_00));
        assert_eq!(a.advance(&mut cursor).map(|e| e.0), Some(0x00_01_05));
        let id = a.locate(0x00_01_05).unwrap();
        a.remove_entry(id, 0x05);
        assert_eq!(a.advance(&mut cursor).map(|e| e.0), Some(0x00_01_06));

        // Remove the entry the cursor sits on, pruning its sector and the
        // pointer sector above it, then check the walk resumes at the root.
        a.remove_entry(id, 0x06);
        assert!(a.verify());
        assert_eq!(a.live_sectors(), 5);
        assert_eq!(a.advance(&mut cursor).map(|e| e.0), Some(0x00_02_01));
        assert!(a.advance(&mut cursor).is_none());
        assert!(a.advance(&mut cursor).is_none());
    }

    #[test]
    fn test_sector_for_each_sector() {
        let mut a: SectorArena<u64, u64> = SectorArena::new(1);
        for h in [0x0001u64, 0x0002, 0x0301] {
            let id = a.locate_or_create(h);
            a.set_entry(id, hash_byte(h, 0), h, h * 10);
        }
        let mut seen = Vec::new();
        a.for_each_sector(ROOT, &mut |s: &Sector<u64, u64>| seen.extend(s.entries().map(|(k, v)| (*k, *v))));
        assert_eq!(seen, vec![(1, 10), (2, 20), (0x0301, 0x0301 * 10)]);
    }
}
