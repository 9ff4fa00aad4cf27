use blade_accel_hal as hal;
use std::{cmp::Reverse, collections::BinaryHeap};

type Generation = u32;

/// Placement of a bottom-level structure in the scene.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Instance {
    pub transform: hal::Transform,
    /// Index of the bottom-level structure, in build order.
    pub blas_index: u32,
    /// Opaque value forwarded to the shaders.
    pub custom_index: u32,
    pub mask: u8,
    pub flags: u8,
}

impl Instance {
    pub fn new(blas_index: u32, transform: hal::Transform) -> Self {
        Self {
            transform,
            blas_index,
            custom_index: 0,
            mask: 0xFF,
            flags: 0,
        }
    }
}

/// Reference to an instance slot, valid until the slot is vacated.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct InstanceHandle {
    index: u32,
    generation: Generation,
}

impl InstanceHandle {
    pub fn index(&self) -> u32 {
        self.index
    }
}

#[derive(Debug, Default)]
struct Slot {
    generation: Generation,
    value: Option<Instance>,
}

/// Dense table of instances with per-slot generations.
///
/// Slot order is the order of instances in the top-level structure.
/// Vacated slots are reused, but with a bumped generation, so handles
/// to the previous occupant no longer resolve.
#[derive(Debug, Default)]
pub struct InstanceArena {
    slots: Vec<Slot>,
    /// Vacated slots, lowest index on top.
    free_list: BinaryHeap<Reverse<u32>>,
    len: usize,
}

impl InstanceArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn insert(&mut self, instance: Instance) -> InstanceHandle {
        self.len += 1;
        // Reuse the lowest vacated slot to keep the table dense.
        match self.free_list.pop() {
            Some(Reverse(index)) => {
                let slot = &mut self.slots[index as usize];
                slot.value = Some(instance);
                InstanceHandle {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(Slot {
                    generation: 0,
                    value: Some(instance),
                });
                InstanceHandle {
                    index,
                    generation: 0,
                }
            }
        }
    }

    fn slot(&self, handle: InstanceHandle) -> Option<&Slot> {
        self.slots
            .get(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation && slot.value.is_some())
    }

    pub fn contains(&self, handle: InstanceHandle) -> bool {
        self.slot(handle).is_some()
    }

    pub fn get(&self, handle: InstanceHandle) -> Result<&Instance, crate::Error> {
        self.slot(handle)
            .and_then(|slot| slot.value.as_ref())
            .ok_or(crate::Error::StaleInstance(handle))
    }

    pub fn get_mut(&mut self, handle: InstanceHandle) -> Result<&mut Instance, crate::Error> {
        match self.slots.get_mut(handle.index as usize) {
            Some(&mut Slot {
                generation,
                value: Some(ref mut instance),
            }) if generation == handle.generation => Ok(instance),
            _ => Err(crate::Error::StaleInstance(handle)),
        }
    }

    pub fn remove(&mut self, handle: InstanceHandle) -> Result<Instance, crate::Error> {
        let instance = match self.slots.get_mut(handle.index as usize) {
            Some(slot) if slot.generation == handle.generation => slot.value.take(),
            _ => None,
        }
        .ok_or(crate::Error::StaleInstance(handle))?;
        self.slots[handle.index as usize].generation += 1;
        self.free_list.push(Reverse(handle.index));
        self.len -= 1;
        Ok(instance)
    }

    /// Vacate every slot, invalidating all outstanding handles.
    pub fn clear(&mut self) {
        for slot in self.slots.iter_mut() {
            if slot.value.take().is_some() {
                slot.generation += 1;
            }
        }
        self.free_list = (0..self.slots.len() as u32).map(Reverse).collect();
        self.len = 0;
    }

    /// Iterate over live instances in slot order.
    pub fn iter(&self) -> impl Iterator<Item = (InstanceHandle, &Instance)> + '_ {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.value.as_ref().map(|instance| {
                (
                    InstanceHandle {
                        index: index as u32,
                        generation: slot.generation,
                    },
                    instance,
                )
            })
        })
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Instance> + '_ {
        self.slots.iter_mut().filter_map(|slot| slot.value.as_mut())
    }

    pub fn to_vec(&self) -> Vec<Instance> {
        self.iter().map(|(_, instance)| *instance).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::{Instance, InstanceArena};
    use blade_accel_hal::IDENTITY_TRANSFORM;

    #[test]
    fn stale_after_remove() {
        let mut arena = InstanceArena::new();
        let a = arena.insert(Instance::new(0, IDENTITY_TRANSFORM));
        let b = arena.insert(Instance::new(1, IDENTITY_TRANSFORM));
        assert_eq!(arena.remove(a).unwrap().blas_index, 0);
        assert!(arena.get(a).is_err());
        assert_eq!(arena.get(b).unwrap().blas_index, 1);

        // The vacated slot is reused with a new generation.
        let c = arena.insert(Instance::new(2, IDENTITY_TRANSFORM));
        assert_eq!(c.index(), a.index());
        assert_ne!(c, a);
        assert!(arena.get(a).is_err());
        assert_eq!(arena.get(c).unwrap().blas_index, 2);
        let order = arena.iter().map(|(_, i)| i.blas_index).collect::<Vec<_>>();
        assert_eq!(order, [2, 1]);
    }

    #[test]
    fn clear_invalidates() {
        let mut arena = InstanceArena::new();
        let handles = (0..3)
            .map(|i| arena.insert(Instance::new(i, IDENTITY_TRANSFORM)))
            .collect::<Vec<_>>();
        arena.clear();
        assert!(arena.is_empty());
        for handle in handles {
            assert!(!arena.contains(handle));
        }
        let fresh = arena.insert(Instance::new(5, IDENTITY_TRANSFORM));
        assert_eq!(fresh.index(), 0);
        assert_eq!(arena.len(), 1);
    }

    #[test]
    fn refill_after_clear_is_dense() {
        let mut arena = InstanceArena::new();
        for i in 0..1000 {
            arena.insert(Instance::new(i, IDENTITY_TRANSFORM));
        }
        arena.clear();
        let indices = (0..1000)
            .map(|i| arena.insert(Instance::new(i, IDENTITY_TRANSFORM)).index())
            .collect::<Vec<_>>();
        assert_eq!(indices, (0..1000).collect::<Vec<u32>>());
        assert_eq!(arena.len(), 1000);

        // Vacated slots are refilled lowest first, in any removal order.
        let handles = arena.iter().map(|(h, _)| h).collect::<Vec<_>>();
        for &index in [700usize, 3, 42].iter() {
            arena.remove(handles[index]).unwrap();
        }
        let refilled = (0..4)
            .map(|i| arena.insert(Instance::new(i, IDENTITY_TRANSFORM)).index())
            .collect::<Vec<_>>();
        assert_eq!(refilled, [3, 42, 700, 1000]);
    }
}
