//! Slot table behind service and channel handles
//!
//! Each slot remembers the full handle it was last issued under, so a stale
//! handle (old generation) or one of the wrong kind never resolves.
//! Lookups take the shared lock; insert takes the write lock; remove goes
//! through the upgradable lock so the id check does not block readers.

use std::sync::Arc;

use svcio_core::error::{SvcError, SvcResult};
use svcio_core::handle::{next_sequence, Handle, MAX_SLOTS};
use svcio_core::RwSpinLock;

struct Slot<T> {
    id: u32,
    value: Option<Arc<T>>,
}

struct TableInner<T> {
    slots: Vec<Slot<T>>,
    /// Free indices, lowest on top
    free: Vec<usize>,
    sequence: u32,
    len: usize,
}

impl<T> TableInner<T> {
    fn grow(&mut self, max_slots: usize) -> bool {
        let old = self.slots.len();
        if old >= max_slots {
            return false;
        }
        let new = (old.max(1) * 2).min(max_slots);
        self.slots.reserve_exact(new - old);
        for _ in old..new {
            self.slots.push(Slot { id: 0, value: None });
        }
        self.free.extend((old..new).rev());
        true
    }
}

pub struct SlotTable<T> {
    channel: bool,
    max_slots: usize,
    inner: RwSpinLock<TableInner<T>>,
}

impl<T: Send + Sync> SlotTable<T> {
    /// `channel` selects which handle space (bit 31) this table issues.
    pub fn new(channel: bool, initial_capacity: usize, max_slots: usize) -> Self {
        let max_slots = max_slots.clamp(1, MAX_SLOTS);
        let initial = initial_capacity.clamp(1, max_slots);
        let mut slots = Vec::with_capacity(initial);
        for _ in 0..initial {
            slots.push(Slot { id: 0, value: None });
        }
        Self {
            channel,
            max_slots,
            inner: RwSpinLock::new(TableInner {
                slots,
                free: (0..initial).rev().collect(),
                sequence: 1,
                len: 0,
            }),
        }
    }

    pub fn insert(&self, value: Arc<T>) -> SvcResult<u32> {
        let mut inner = self.inner.write();
        if inner.free.is_empty() && !inner.grow(self.max_slots) {
            return Err(SvcError::RegistryFull);
        }
        let index = inner.free.pop().ok_or(SvcError::RegistryFull)?;
        let sequence = inner.sequence;
        inner.sequence = next_sequence(sequence);

        let id = Handle::compose(index, sequence, self.channel).as_u32();
        inner.slots[index] = Slot {
            id,
            value: Some(value),
        };
        inner.len += 1;
        Ok(id)
    }

    fn index_of(&self, id: u32) -> Option<usize> {
        let handle = Handle::new(id);
        if handle.is_channel() != self.channel {
            return None;
        }
        handle.index()
    }

    pub fn get(&self, id: u32) -> Option<Arc<T>> {
        let index = self.index_of(id)?;
        let inner = self.inner.read();
        let slot = inner.slots.get(index)?;
        if slot.id == id {
            slot.value.clone()
        } else {
            None
        }
    }

    pub fn remove(&self, id: u32) -> Option<Arc<T>> {
        let index = self.index_of(id)?;
        let inner = self.inner.upgradable_read();
        match inner.slots.get(index) {
            Some(slot) if slot.id == id && slot.value.is_some() => {}
            _ => return None,
        }
        let mut inner = inner.upgrade();
        let slot = &mut inner.slots[index];
        slot.id = 0;
        let value = slot.value.take();
        inner.free.push(index);
        inner.len -= 1;
        value
    }

    pub fn contains(&self, id: u32) -> bool {
        self.get(id).is_some()
    }

    /// Live handles in slot order
    pub fn ids(&self) -> Vec<u32> {
        let inner = self.inner.read();
        inner
            .slots
            .iter()
            .filter(|s| s.value.is_some())
            .map(|s| s.id)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.inner.read().slots.len()
    }

    /// Empty the table and hand back everything that was in it
    pub fn clear(&self) -> Vec<Arc<T>> {
        let mut inner = self.inner.write();
        let mut taken = Vec::with_capacity(inner.len);
        for slot in inner.slots.iter_mut() {
            slot.id = 0;
            if let Some(v) = slot.value.take() {
                taken.push(v);
            }
        }
        let n = inner.slots.len();
        inner.free = (0..n).rev().collect();
        inner.len = 0;
        taken
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_insert_get_remove() {
        let table = SlotTable::new(false, 4, 16);
        let a = table.insert(Arc::new("a")).unwrap();
        let b = table.insert(Arc::new("b")).unwrap();
        assert_ne!(a, 0);
        assert_ne!(a, b);
        assert_eq!(Handle::new(a).index(), Some(0));
        assert_eq!(Handle::new(b).index(), Some(1));
        assert!(!Handle::new(a).is_channel());

        assert_eq!(*table.get(a).unwrap(), "a");
        assert_eq!(table.len(), 2);

        assert_eq!(*table.remove(a).unwrap(), "a");
        assert!(table.get(a).is_none());
        assert!(table.remove(a).is_none());
        assert_eq!(table.len(), 1);
        assert!(table.get(0).is_none());
    }

    #[test]
    fn test_reused_slot_gets_new_generation() {
        let table = SlotTable::new(false, 1, 4);
        let first = table.insert(Arc::new(1u32)).unwrap();
        table.remove(first);
        let second = table.insert(Arc::new(2u32)).unwrap();

        assert_eq!(Handle::new(first).index(), Handle::new(second).index());
        assert_ne!(first, second);
        assert!(table.get(first).is_none());
        assert_eq!(*table.get(second).unwrap(), 2);
    }

    #[test]
    fn test_channel_space_is_separate() {
        let table = SlotTable::new(true, 2, 4);
        let id = table.insert(Arc::new(())).unwrap();
        assert!(Handle::new(id).is_channel());
        assert!(table.get(id).is_some());
        // same index and sequence without the channel bit does not resolve
        assert!(table.get(id & !svcio_core::handle::CHANNEL_BIT).is_none());
    }

    #[test]
    fn test_growth_and_exhaustion() {
        let table = SlotTable::new(false, 2, 5);
        let ids: Vec<u32> = (0..5).map(|i| table.insert(Arc::new(i)).unwrap()).collect();
        assert_eq!(table.capacity(), 5);
        for (i, id) in ids.iter().enumerate() {
            assert_eq!(Handle::new(*id).index(), Some(i));
            assert_eq!(*table.get(*id).unwrap(), i);
        }
        assert_eq!(table.insert(Arc::new(99)), Err(SvcError::RegistryFull));

        table.remove(ids[3]);
        let again = table.insert(Arc::new(42)).unwrap();
        assert_eq!(Handle::new(again).index(), Some(3));
    }

    #[test]
    fn test_sequence_wraps_to_one() {
        let table = SlotTable::new(false, 1, 1);
        let mut last = 0;
        for _ in 0..(svcio_core::handle::SEQUENCE_LIMIT as usize + 2) {
            let id = table.insert(Arc::new(())).unwrap();
            assert_ne!(Handle::new(id).sequence(), 0);
            assert_ne!(id, last);
            last = id;
            table.remove(id);
        }
    }

    #[test]
    fn test_ids_and_clear() {
        let table = SlotTable::new(false, 4, 8);
        let a = table.insert(Arc::new('a')).unwrap();
        let b = table.insert(Arc::new('b')).unwrap();
        let c = table.insert(Arc::new('c')).unwrap();
        table.remove(b);
        assert_eq!(table.ids(), vec![a, c]);

        let taken = table.clear();
        assert_eq!(taken.len(), 2);
        assert!(table.is_empty());
        assert!(table.get(a).is_none());
    }

    #[test]
    fn test_concurrent_register_lookup() {
        let table = Arc::new(SlotTable::new(false, 2, 4096));
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let table = Arc::clone(&table);
                thread::spawn(move || {
                    for i in 0..500u32 {
                        let v = t * 1000 + i;
                        let id = table.insert(Arc::new(v)).unwrap();
                        assert_eq!(*table.get(id).unwrap(), v);
                        if i % 2 == 0 {
                            assert_eq!(*table.remove(id).unwrap(), v);
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(table.len(), 4 * 250);
    }
}
