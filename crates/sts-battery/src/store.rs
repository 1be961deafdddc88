//! Growable, append-only result storage.
//!
//! A [`ResultStore`] is pre-sized for the number of values a test expects to
//! produce and grows in fixed-size chunks when that estimate is exceeded.
//! Values are addressed by the index at which they were appended; an index
//! handed out once stays valid for the lifetime of the store.

use std::collections::TryReserveError;

/// Default number of elements added when a store runs out of room.
pub const DEFAULT_CHUNK: usize = 1024;

/// Append-only, randomly indexable sequence of `T`.
#[derive(Debug, Clone)]
pub struct ResultStore<T> {
    values: Vec<T>,
    chunk: usize,
}

impl<T> ResultStore<T> {
    /// Create a store with room for `expected` values that grows by `chunk` values at a time.
    ///
    /// A `chunk` of zero is treated as 1.
    pub fn new(chunk: usize, expected: usize) -> Result<Self, TryReserveError> {
        let mut values = Vec::new();
        values.try_reserve_exact(expected)?;
        Ok(Self {
            values,
            chunk: chunk.max(1),
        })
    }

    /// Append a value, growing by one chunk when full. Returns the value's index.
    pub fn append(&mut self, value: T) -> Result<usize, TryReserveError> {
        if self.values.len() == self.values.capacity() {
            self.values.try_reserve_exact(self.chunk)?;
        }
        let index = self.values.len();
        self.values.push(value);
        Ok(index)
    }

    /// Value at `index`, or `None` past the end.
    pub fn get(&self, index: usize) -> Option<&T> {
        self.values.get(index)
    }

    /// Number of appended values.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Number of values the store can hold before it grows again.
    pub fn capacity(&self) -> usize {
        self.values.capacity()
    }

    pub fn chunk(&self) -> usize {
        self.chunk
    }

    /// Values in append order.
    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.values.iter()
    }

    pub fn as_slice(&self) -> &[T] {
        &self.values
    }
}

impl<T> std::ops::Index<usize> for ResultStore<T> {
    type Output = T;

    fn index(&self, index: usize) -> &T {
        &self.values[index]
    }
}

impl<'a, T> IntoIterator for &'a ResultStore<T> {
    type Item = &'a T;
    type IntoIter = std::slice::Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.values.iter()
    }
}
