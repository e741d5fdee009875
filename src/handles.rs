//! Generation-checked arena that hands out the `u32` handles the host runtime
//! holds instead of raw pointers.
//!
//! A handle packs `slot + 1` into the low 16 bits and the slot generation into
//! the high 16 bits, so `0` is never valid and a freed slot's old handles stop
//! resolving as soon as the slot is reused. A slot whose generation is
//! exhausted is retired rather than wrapped back to an old generation.

use crate::error::{BridgeError, HandleKind, Result};
use parking_lot::RwLock;
use std::sync::Arc;

const INDEX_BITS: u32 = 16;
const INDEX_MASK: u32 = (1 << INDEX_BITS) - 1;
const MAX_SLOTS: usize = INDEX_MASK as usize;

struct Slot<T> {
    generation: u16,
    value: Option<Arc<T>>,
}

struct Arena<T> {
    slots: Vec<Slot<T>>,
    free: Vec<usize>,
    live: usize,
}

pub struct HandleRegistry<T> {
    kind: HandleKind,
    arena: RwLock<Arena<T>>,
}

impl<T> HandleRegistry<T> {
    pub fn new(kind: HandleKind) -> Self {
        Self {
            kind,
            arena: RwLock::new(Arena {
                slots: Vec::new(),
                free: Vec::new(),
                live: 0,
            }),
        }
    }

    pub fn insert(&self, value: T) -> Result<u32> {
        self.insert_with(|_| value)
    }

    /// Allocates a handle and builds the object with it, so objects can carry
    /// their own handle.
    pub fn insert_with(&self, build: impl FnOnce(u32) -> T) -> Result<u32> {
        let mut arena = self.arena.write();
        let index = match arena.free.pop() {
            Some(index) => index,
            None => {
                if arena.slots.len() >= MAX_SLOTS {
                    return Err(BridgeError::validation(format!(
                        "too many live {} handles",
                        self.kind.as_str()
                    )));
                }
                arena.slots.push(Slot {
                    generation: 0,
                    value: None,
                });
                arena.slots.len() - 1
            }
        };
        let slot = &mut arena.slots[index];
        let handle = encode(index, slot.generation);
        slot.value = Some(Arc::new(build(handle)));
        arena.live += 1;
        Ok(handle)
    }

    pub fn get(&self, handle: u32) -> Result<Arc<T>> {
        let arena = self.arena.read();
        decode(handle)
            .and_then(|(index, generation)| {
                arena
                    .slots
                    .get(index)
                    .filter(|slot| slot.generation == generation)
                    .and_then(|slot| slot.value.clone())
            })
            .ok_or(BridgeError::InvalidHandle {
                kind: self.kind,
                handle,
            })
    }

    /// Releases the slot and returns the object so the caller controls when
    /// it is torn down.
    pub fn remove(&self, handle: u32) -> Result<Arc<T>> {
        let mut arena = self.arena.write();
        let invalid = BridgeError::InvalidHandle {
            kind: self.kind,
            handle,
        };
        let Some((index, generation)) = decode(handle) else {
            return Err(invalid);
        };
        let released = match arena.slots.get_mut(index) {
            Some(slot) if slot.generation == generation && slot.value.is_some() => {
                let next = slot.generation.checked_add(1);
                slot.generation = next.unwrap_or(u16::MAX);
                slot.value.take().map(|value| (value, next.is_some()))
            }
            _ => None,
        };
        let Some((value, reusable)) = released else {
            return Err(invalid);
        };
        if reusable {
            arena.free.push(index);
        }
        arena.live -= 1;
        Ok(value)
    }

    pub fn len(&self) -> usize {
        self.arena.read().live
    }

    #[allow(dead_code)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn encode(index: usize, generation: u16) -> u32 {
    (u32::from(generation) << INDEX_BITS) | (index as u32 + 1)
}

fn decode(handle: u32) -> Option<(usize, u16)> {
    let low = handle & INDEX_MASK;
    if low == 0 {
        return None;
    }
    Some(((low - 1) as usize, (handle >> INDEX_BITS) as u16))
}
