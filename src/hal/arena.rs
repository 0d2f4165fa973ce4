//! Generational arena backing every GPU object a backend hands out.
//!
//! A slot is reused after removal but its generation is bumped, so a stale
//! handle to a destroyed resource never aliases the new occupant.

/// Index + generation pair identifying one arena slot
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RawHandle {
    pub index: u32,
    pub generation: u32,
}

enum Slot<T> {
    Occupied { generation: u32, value: T },
    Vacant { generation: u32 },
}

pub struct Arena<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    len: usize,
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Arena<T> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            len: 0,
        }
    }

    pub fn insert(&mut self, value: T) -> RawHandle {
        self.len += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            let generation = match slot {
                Slot::Vacant { generation } => *generation,
                Slot::Occupied { .. } => unreachable!("free list points at an occupied slot"),
            };
            *slot = Slot::Occupied { generation, value };
            return RawHandle { index, generation };
        }

        let index = self.slots.len() as u32;
        self.slots.push(Slot::Occupied { generation: 0, value });
        RawHandle { index, generation: 0 }
    }

    pub fn remove(&mut self, handle: RawHandle) -> Option<T> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        match slot {
            Slot::Occupied { generation, .. } if *generation == handle.generation => {
                let next = Slot::Vacant {
                    generation: generation.wrapping_add(1),
                };
                let old = std::mem::replace(slot, next);
                self.free.push(handle.index);
                self.len -= 1;
                match old {
                    Slot::Occupied { value, .. } => Some(value),
                    Slot::Vacant { .. } => None,
                }
            }
            _ => None,
        }
    }

    pub fn get(&self, handle: RawHandle) -> Option<&T> {
        match self.slots.get(handle.index as usize)? {
            Slot::Occupied { generation, value } if *generation == handle.generation => Some(value),
            _ => None,
        }
    }

    pub fn get_mut(&mut self, handle: RawHandle) -> Option<&mut T> {
        match self.slots.get_mut(handle.index as usize)? {
            Slot::Occupied { generation, value } if *generation == handle.generation => Some(value),
            _ => None,
        }
    }

    pub fn contains(&self, handle: RawHandle) -> bool {
        self.get(handle).is_some()
    }

    /// Number of live entries
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = (RawHandle, &T)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| match slot {
            Slot::Occupied { generation, value } => Some((
                RawHandle {
                    index: index as u32,
                    generation: *generation,
                },
                value,
            )),
            Slot::Vacant { .. } => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stale_handle_rejected_after_reuse() {
        let mut arena = Arena::new();
        let first = arena.insert("a");
        assert_eq!(arena.remove(first), Some("a"));

        let second = arena.insert("b");
        assert_eq!(second.index, first.index);
        assert_ne!(second.generation, first.generation);
        assert!(arena.get(first).is_none());
        assert_eq!(arena.get(second), Some(&"b"));
    }

    #[test]
    fn test_len_tracks_live_entries() {
        let mut arena = Arena::new();
        let a = arena.insert(1);
        let _b = arena.insert(2);
        assert_eq!(arena.len(), 2);
        arena.remove(a);
        assert_eq!(arena.len(), 1);
        assert_eq!(arena.remove(a), None);
        assert_eq!(arena.len(), 1);
        assert_eq!(arena.iter().count(), 1);
    }
}
