//! Generation-checked slot storage behind typed handles.
//!
//! A removed slot bumps its generation, so a stale handle to a reused slot
//! is rejected instead of silently addressing the new occupant.

use std::fmt;
use std::marker::PhantomData;

/// Raw slot address shared by every handle type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotIndex {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

/// Implemented by the typed handles stored in an [`Arena`].
pub trait ArenaKey: Copy {
    fn from_slot(slot: SlotIndex) -> Self;
    fn slot(self) -> SlotIndex;
}

macro_rules! arena_key {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub struct $name(SlotIndex);

        impl ArenaKey for $name {
            fn from_slot(slot: SlotIndex) -> Self {
                Self(slot)
            }

            fn slot(self) -> SlotIndex {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({}v{})", stringify!($name), self.0.index, self.0.generation)
            }
        }
    };
}

arena_key!(
    /// Handle to a voice owned by a [`PetalSonicContext`](crate::context::PetalSonicContext).
    VoiceId
);
arena_key!(
    /// Handle to audio data owned by a [`BufferRegistry`](crate::audio_data::BufferRegistry).
    BufferId
);
arena_key!(
    /// Handle to a converter inside one voice's [`ConverterRegistry`](crate::converter::ConverterRegistry).
    ConverterToken
);

enum Slot<T> {
    Occupied { generation: u32, value: T },
    Vacant { generation: u32, next_free: Option<u32> },
}

pub struct Arena<K: ArenaKey, T> {
    slots: Vec<Slot<T>>,
    free_head: Option<u32>,
    len: usize,
    _key: PhantomData<K>,
}

impl<K: ArenaKey, T> Default for Arena<K, T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: ArenaKey, T> Arena<K, T> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free_head: None,
            len: 0,
            _key: PhantomData,
        }
    }

    pub fn insert(&mut self, value: T) -> K {
        self.len += 1;
        if let Some(index) = self.free_head {
            let slot = &mut self.slots[index as usize];
            let generation = match *slot {
                Slot::Vacant {
                    generation,
                    next_free,
                } => {
                    self.free_head = next_free;
                    generation
                }
                Slot::Occupied { .. } => unreachable!("free list points at an occupied slot"),
            };
            *slot = Slot::Occupied { generation, value };
            return K::from_slot(SlotIndex { index, generation });
        }

        let index = self.slots.len() as u32;
        self.slots.push(Slot::Occupied {
            generation: 0,
            value,
        });
        K::from_slot(SlotIndex {
            index,
            generation: 0,
        })
    }

    pub fn get(&self, key: K) -> Option<&T> {
        let slot = key.slot();
        match self.slots.get(slot.index as usize)? {
            Slot::Occupied { generation, value } if *generation == slot.generation => Some(value),
            _ => None,
        }
    }

    pub fn get_mut(&mut self, key: K) -> Option<&mut T> {
        let slot = key.slot();
        match self.slots.get_mut(slot.index as usize)? {
            Slot::Occupied { generation, value } if *generation == slot.generation => Some(value),
            _ => None,
        }
    }

    pub fn contains(&self, key: K) -> bool {
        self.get(key).is_some()
    }

    pub fn remove(&mut self, key: K) -> Option<T> {
        let slot = key.slot();
        let entry = self.slots.get_mut(slot.index as usize)?;
        match entry {
            Slot::Occupied { generation, .. } if *generation == slot.generation => {}
            _ => return None,
        }

        let vacant = Slot::Vacant {
            generation: slot.generation.wrapping_add(1),
            next_free: self.free_head,
        };
        let Slot::Occupied { value, .. } = std::mem::replace(entry, vacant) else {
            unreachable!("slot checked as occupied above");
        };
        self.free_head = Some(slot.index);
        self.len -= 1;
        Some(value)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = (K, &T)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| match slot {
                Slot::Occupied { generation, value } => Some((
                    K::from_slot(SlotIndex {
                        index: index as u32,
                        generation: *generation,
                    }),
                    value,
                )),
                Slot::Vacant { .. } => None,
            })
    }

    pub fn values(&self) -> impl Iterator<Item = &T> {
        self.iter().map(|(_, value)| value)
    }

    /// Drops every value. Generations survive so outstanding handles stay stale.
    pub fn clear(&mut self) {
        let keys: Vec<K> = self.iter().map(|(key, _)| key).collect();
        for key in keys {
            self.remove(key);
        }
    }
}
