//! Bounded slot table mapping small 1-based integer IDs to live host
//! resources. Raw host pointers and descriptors never appear on the wire;
//! the target only ever sees these IDs, with 0 reserved to mean "none".

/// Capacity of the file/directory handle table.
pub const HANDLE_LIMIT: usize = 100;

/// Capacity of the socket table.
pub const SOCKET_LIMIT: usize = 64;

pub struct SlotTable<R> {
    slots: Vec<Option<R>>,
}

impl<R> SlotTable<R> {
    pub fn new(capacity: usize) -> SlotTable<R> {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);

        SlotTable { slots }
    }

    /// Stores `resource` in the first free slot and returns its 1-based ID,
    /// or `None` when every slot is in use.
    pub fn insert(&mut self, resource: R) -> Option<u32> {
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(resource);
                return Some(index as u32 + 1);
            }
        }

        None
    }

    /// Looks up a live resource. IDs outside `1..=capacity` and vacant
    /// slots both come back as `None`.
    #[inline]
    pub fn get(&self, id: u32) -> Option<&R> {
        self.slot_index(id)
            .and_then(|index| self.slots[index].as_ref())
    }

    #[inline]
    pub fn get_mut(&mut self, id: u32) -> Option<&mut R> {
        match self.slot_index(id) {
            Some(index) => self.slots[index].as_mut(),
            None => None,
        }
    }

    /// Clears the slot and hands the resource back to the caller for
    /// teardown. Releasing a vacant slot returns `None` so double-close
    /// stays deterministic and surfaceable.
    #[inline]
    pub fn remove(&mut self, id: u32) -> Option<R> {
        match self.slot_index(id) {
            Some(index) => self.slots[index].take(),
            None => None,
        }
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    #[inline]
    fn slot_index(&self, id: u32) -> Option<usize> {
        match id {
            0 => None,
            id if id as usize > self.slots.len() => None,
            id => Some(id as usize - 1),
        }
    }
}
