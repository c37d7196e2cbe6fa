//! Slot-reusing storage addressed by integer handles.

use std::marker::PhantomData;
use std::ops::{Index, IndexMut};

use crate::handles::PoolHandle;

#[derive(Debug, Clone)]
enum Entry<T> {
    Live(T),
    /// Link to the next free entry; `entries.len()` terminates the chain.
    Free { next: usize },
}

/// Vector of records with an intrusive free list.
///
/// `add` reuses the most recently removed slot first, otherwise it grows the
/// vector. The pool does no reference counting: a removed handle must not be
/// used again by the caller until `add` hands it back out.
#[derive(Debug, Clone)]
pub struct Pool<H, T> {
    entries: Vec<Entry<T>>,
    count: usize,
    next: usize,
    _handle: PhantomData<fn(H) -> H>,
}

impl<H: PoolHandle, T> Default for Pool<H, T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H: PoolHandle, T> Pool<H, T> {
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            count: 0,
            next: 0,
            _handle: PhantomData,
        }
    }

    pub fn add(&mut self, value: T) -> H {
        let index = self.next;
        if index == self.entries.len() {
            self.entries.push(Entry::Live(value));
            self.next += 1;
        } else {
            match std::mem::replace(&mut self.entries[index], Entry::Live(value)) {
                Entry::Free { next } => self.next = next,
                Entry::Live(_) => unreachable!("free list head points at a live entry"),
            }
        }
        self.count += 1;
        H::from_index(index)
    }

    /// Frees the slot and returns its record.
    ///
    /// # Panics
    /// If `handle` is out of range or already free.
    pub fn remove(&mut self, handle: H) -> T {
        let index = handle.index();
        assert!(
            matches!(self.entries.get(index), Some(Entry::Live(_))),
            "removing invalid pool handle {index}"
        );
        let previous = std::mem::replace(&mut self.entries[index], Entry::Free { next: self.next });
        self.next = index;
        self.count -= 1;
        match previous {
            Entry::Live(value) => value,
            Entry::Free { .. } => unreachable!(),
        }
    }

    pub fn get(&self, handle: H) -> Option<&T> {
        match self.entries.get(handle.index()) {
            Some(Entry::Live(value)) => Some(value),
            _ => None,
        }
    }

    pub fn get_mut(&mut self, handle: H) -> Option<&mut T> {
        match self.entries.get_mut(handle.index()) {
            Some(Entry::Live(value)) => Some(value),
            _ => None,
        }
    }

    #[inline]
    pub fn contains(&self, handle: H) -> bool {
        self.get(handle).is_some()
    }

    /// Number of live entries.
    #[inline]
    pub fn count(&self) -> usize {
        self.count
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = (H, &T)> {
        self.entries.iter().enumerate().filter_map(|(i, entry)| match entry {
            Entry::Live(value) => Some((H::from_index(i), value)),
            Entry::Free { .. } => None,
        })
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (H, &mut T)> {
        self.entries
            .iter_mut()
            .enumerate()
            .filter_map(|(i, entry)| match entry {
                Entry::Live(value) => Some((H::from_index(i), value)),
                Entry::Free { .. } => None,
            })
    }
}

impl<H: PoolHandle, T> Index<H> for Pool<H, T> {
    type Output = T;

    fn index(&self, handle: H) -> &T {
        match self.entries.get(handle.index()) {
            Some(Entry::Live(value)) => value,
            _ => panic!("invalid pool handle {}", handle.index()),
        }
    }
}

impl<H: PoolHandle, T> IndexMut<H> for Pool<H, T> {
    fn index_mut(&mut self, handle: H) -> &mut T {
        match self.entries.get_mut(handle.index()) {
            Some(Entry::Live(value)) => value,
            _ => panic!("invalid pool handle {}", handle.index()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handles::MeshHandle;

    #[test]
    fn add_returns_sequential_handles() {
        let mut pool = Pool::<MeshHandle, &str>::new();
        assert_eq!(pool.add("a"), MeshHandle(0));
        assert_eq!(pool.add("b"), MeshHandle(1));
        assert_eq!(pool.add("c"), MeshHandle(2));
        assert_eq!(pool.count(), 3);
        assert_eq!(pool[MeshHandle(1)], "b");
    }

    #[test]
    fn removed_slot_is_reused_first() {
        let mut pool = Pool::<MeshHandle, i32>::new();
        let h = pool.add(1);
        assert_eq!(pool.remove(h), 1);
        assert!(pool.is_empty());

        let again = pool.add(7);
        assert_eq!(again, h);
        assert_eq!(pool[again], 7);
        assert_eq!(pool.count(), 1);
    }

    #[test]
    fn free_list_is_lifo() {
        let mut pool = Pool::<MeshHandle, i32>::new();
        let handles: Vec<_> = (0..5).map(|i| pool.add(i)).collect();
        pool.remove(handles[1]);
        pool.remove(handles[3]);
        pool.remove(handles[0]);
        assert_eq!(pool.count(), 2);

        assert_eq!(pool.add(10), handles[0]);
        assert_eq!(pool.add(11), handles[3]);
        assert_eq!(pool.add(12), handles[1]);
        // Chain exhausted, the pool grows again.
        assert_eq!(pool.add(13), MeshHandle(5));
        assert_eq!(pool.count(), 6);
    }

    #[test]
    fn count_tracks_live_entries() {
        let mut pool = Pool::<MeshHandle, usize>::new();
        let mut live = Vec::new();
        for step in 0..64usize {
            if step % 3 == 2 {
                let h = live.remove(step % live.len());
                pool.remove(h);
            } else {
                live.push(pool.add(step));
            }
            assert_eq!(pool.count(), live.len());
        }

        let mut seen: Vec<_> = pool.iter().map(|(h, _)| h).collect();
        seen.sort();
        live.sort();
        assert_eq!(seen, live);
    }

    #[test]
    fn freed_handle_is_not_accessible() {
        let mut pool = Pool::<MeshHandle, i32>::new();
        let h = pool.add(3);
        pool.remove(h);
        assert!(pool.get(h).is_none());
        assert!(!pool.contains(h));
    }

    #[test]
    #[should_panic(expected = "invalid pool handle")]
    fn indexing_freed_handle_panics() {
        let mut pool = Pool::<MeshHandle, i32>::new();
        let h = pool.add(3);
        pool.remove(h);
        let _ = pool[h];
    }

    #[test]
    #[should_panic(expected = "removing invalid pool handle")]
    fn double_remove_panics() {
        let mut pool = Pool::<MeshHandle, i32>::new();
        let h = pool.add(3);
        pool.remove(h);
        pool.remove(h);
    }
}
