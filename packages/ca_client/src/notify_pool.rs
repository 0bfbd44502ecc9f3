use std::mem;
use std::num::NonZero;

use parking_lot::Mutex;

use crate::{Error, NotifyObject, Result};

/// Default number of notify objects a pool can hold at the same time.
pub const DEFAULT_NOTIFY_POOL_CAPACITY: NonZero<usize> = NonZero::new(128).unwrap();

/// Magic number given to a fresh slot. Every release advances the slot's magic so that
/// callbacks carrying the key of a recycled object are detected.
const MAGIC_SEED: u32 = 0xFAB4_CAFE;

/// A fixed-capacity recycling pool for the notify objects of outstanding requests.
///
/// A pool may be shared by any number of sync groups (wrap it in an [`Arc`][std::sync::Arc]
/// and pass it to [`SyncGroupBuilder::pool()`][crate::SyncGroupBuilder::pool]). Acquiring and
/// releasing a slot are O(1) operations on an intrusive free list, performed under a short
/// critical section that never blocks on anything else.
///
/// Slots are identified by a key combining the slot index with a magic number that changes
/// every time the slot is recycled, so a stale key can never reach the object that now occupies
/// the slot.
///
/// # Example
///
/// ```rust
/// use std::num::NonZero;
/// use std::sync::Arc;
///
/// use ca_client::{NotifyPool, SyncGroup};
///
/// let pool = Arc::new(
///     NotifyPool::builder()
///         .capacity(NonZero::new(1024).unwrap())
///         .build(),
/// );
///
/// let first = SyncGroup::builder().pool(Arc::clone(&pool)).build();
/// let second = SyncGroup::builder().pool(Arc::clone(&pool)).build();
///
/// assert_eq!(pool.capacity(), 1024);
/// assert!(pool.is_empty());
/// # drop((first, second));
/// ```
#[derive(Debug)]
pub struct NotifyPool {
    capacity: usize,
    slots: Mutex<Slots>,
}

/// Identifies one occupied slot of a [`NotifyPool`] for the lifetime of its current occupant.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub(crate) struct NotifyKey {
    index: usize,
    magic: u32,
}

#[derive(Debug)]
struct Slots {
    /// Grows on demand up to the pool capacity and never shrinks.
    entries: Vec<Entry>,

    /// Head of the intrusive free list. Equal to `entries.len()` if no vacated slot exists,
    /// in which case the next acquire appends a new slot.
    next_free_index: usize,

    count: usize,
}

#[derive(Debug)]
enum Entry {
    Occupied(NotifyObject),

    Vacant {
        next_free_index: usize,
        next_magic: u32,
    },
}

impl NotifyPool {
    /// Creates a pool with [`DEFAULT_NOTIFY_POOL_CAPACITY`].
    #[must_use]
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Creates a builder for configuring the pool.
    pub fn builder() -> NotifyPoolBuilder {
        NotifyPoolBuilder::new()
    }

    /// The maximum number of notify objects the pool can hold at once.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// The number of notify objects currently held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.lock().count
    }

    /// Whether the pool holds no notify objects.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Moves the object into a free slot, stamping it with the slot's magic number.
    pub(crate) fn acquire(&self, mut object: NotifyObject) -> Result<NotifyKey> {
        let mut slots = self.slots.lock();

        let index = slots.next_free_index;

        if index == slots.entries.len() {
            if index == self.capacity {
                return Err(Error::PoolExhausted {
                    capacity: self.capacity,
                });
            }

            slots.entries.push(Entry::Vacant {
                next_free_index: index
                    .checked_add(1)
                    .expect("guarded by capacity check above"),
                next_magic: MAGIC_SEED,
            });
        }

        let entry = slots
            .entries
            .get_mut(index)
            .expect("free list only points at existing entries");

        let Entry::Vacant {
            next_free_index,
            next_magic,
        } = *entry
        else {
            panic!("free list pointed at occupied notify pool slot {index}");
        };

        object.magic = next_magic;
        *entry = Entry::Occupied(object);

        slots.next_free_index = next_free_index;
        slots.count = slots.count.checked_add(1).expect("bounded by capacity");

        Ok(NotifyKey {
            index,
            magic: next_magic,
        })
    }

    /// Runs `f` on the object identified by `key`. Returns `None` if the key is stale.
    pub(crate) fn with<R>(&self, key: NotifyKey, f: impl FnOnce(&NotifyObject) -> R) -> Option<R> {
        let slots = self.slots.lock();

        match slots.entries.get(key.index) {
            Some(Entry::Occupied(object)) if object.magic == key.magic => Some(f(object)),
            _ => None,
        }
    }

    /// Runs `f` on the object identified by `key`. Returns `None` if the key is stale.
    pub(crate) fn with_mut<R>(
        &self,
        key: NotifyKey,
        f: impl FnOnce(&mut NotifyObject) -> R,
    ) -> Option<R> {
        let mut slots = self.slots.lock();

        match slots.entries.get_mut(key.index) {
            Some(Entry::Occupied(object)) if object.magic == key.magic => Some(f(object)),
            _ => None,
        }
    }

    /// Removes the object identified by `key` and recycles its slot.
    ///
    /// The caller is responsible for running the object's destruction logic. Returns `None`
    /// if the key is stale.
    pub(crate) fn release(&self, key: NotifyKey) -> Option<NotifyObject> {
        let mut slots = self.slots.lock();
        let next_free_index = slots.next_free_index;

        let entry = slots.entries.get_mut(key.index)?;

        match entry {
            Entry::Occupied(object) if object.magic == key.magic => {}
            _ => return None,
        }

        let vacated = mem::replace(
            entry,
            Entry::Vacant {
                next_free_index,
                next_magic: key.magic.wrapping_add(1),
            },
        );

        slots.next_free_index = key.index;
        slots.count = slots
            .count
            .checked_sub(1)
            .expect("released slot was occupied");

        match vacated {
            Entry::Occupied(object) => Some(object),
            Entry::Vacant { .. } => unreachable!("checked above that the entry was occupied"),
        }
    }
}

impl Default for NotifyPool {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for configuring a [`NotifyPool`].
#[derive(Debug)]
#[must_use]
pub struct NotifyPoolBuilder {
    capacity: NonZero<usize>,
}

impl NotifyPoolBuilder {
    fn new() -> Self {
        Self {
            capacity: DEFAULT_NOTIFY_POOL_CAPACITY,
        }
    }

    /// Sets the maximum number of notify objects the pool can hold at once.
    ///
    /// Default is [`DEFAULT_NOTIFY_POOL_CAPACITY`].
    pub fn capacity(mut self, capacity: NonZero<usize>) -> Self {
        self.capacity = capacity;
        self
    }

    /// Builds the pool with the configured settings.
    #[must_use]
    pub fn build(self) -> NotifyPool {
        NotifyPool {
            capacity: self.capacity.get(),
            slots: Mutex::new(Slots {
                entries: Vec::new(),
                next_free_index: 0,
                count: 0,
            }),
        }
    }
}
