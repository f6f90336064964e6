//! Per-simulator circular history buffer
//!
//! A fixed-capacity ring of events with O(1) push, pop and window views.
//! Unlike a deque, peeking a contiguous region in the middle and sampling a
//! random window are both O(1) index arithmetic, which is what the batch
//! extractor and the offline replay path need.
//!
//! Views returned by [`HistoryRing::peek`] and [`HistoryRing::window`] borrow
//! the ring; they are invalidated by any subsequent push or pop, so callers
//! must not hold a view across mutations.

use rand::Rng;

use crate::error::{ ConvoyError, Result };

/// Fixed-capacity circular buffer.
///
/// Data is pushed at the tail and popped from the head; `head` is the oldest
/// buffered element.
#[derive(Debug)]
pub struct HistoryRing<T> {
    slots: Box<[Option<T>]>,
    head: usize,
    len: usize,
}

/// A contiguous view of ring contents anchored at an offset from the head
#[derive(Debug)]
pub struct Window<'a, T> {
    ring: &'a HistoryRing<T>,
    start: usize,
    len: usize,
}

impl<'a, T> Window<'a, T> {
    /// Element `j` of the view (0 is the oldest)
    pub fn get(&self, j: usize) -> &'a T {
        debug_assert!(j < self.len);
        self.ring.at(self.start + j)
    }

    /// Length of the view
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the view is empty
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Iterate the view oldest-first
    pub fn iter(&self) -> impl Iterator<Item = &'a T> + '_ {
        (0..self.len).map(move |j| self.get(j))
    }
}

impl<T> HistoryRing<T> {
    /// Pre-allocate a ring with the given capacity
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "history ring capacity must be > 0");
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Self { slots: slots.into_boxed_slice(), head: 0, len: 0 }
    }

    /// Ring capacity
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Buffered element count
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the ring holds no elements
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether the ring is at capacity
    pub fn is_full(&self) -> bool {
        self.len == self.capacity()
    }

    fn wrap(&self, i: usize) -> usize {
        // capacity is small and i < 2 * capacity for all call sites
        let cap = self.capacity();
        if i >= cap { i - cap } else { i }
    }

    fn at(&self, offset: usize) -> &T {
        let i = self.wrap(self.head + offset);
        self.slots[i].as_ref().expect("ring slot within len must be populated")
    }

    /// Push an element at the tail. Returns `false` when the ring is full.
    pub fn push(&mut self, value: T) -> bool {
        if self.is_full() {
            return false;
        }
        let tail = self.wrap(self.head + self.len);
        self.slots[tail] = Some(value);
        self.len += 1;
        true
    }

    /// Pop the oldest element
    pub fn pop(&mut self) -> Option<T> {
        if self.len == 0 {
            return None;
        }
        let value = self.slots[self.head].take();
        self.head = self.wrap(self.head + 1);
        self.len -= 1;
        value
    }

    /// Advance the head past `k` elements. Returns `false` when fewer than
    /// `k` are buffered.
    pub fn popn(&mut self, k: usize) -> bool {
        if self.len < k {
            return false;
        }
        for _ in 0..k {
            let _ = self.slots[self.head].take();
            self.head = self.wrap(self.head + 1);
        }
        self.len -= k;
        true
    }

    /// A `k`-long view starting at the head
    pub fn peek(&self, k: usize) -> Result<Window<'_, T>> {
        self.window(0, k)
    }

    /// A view of `len` elements starting `start` past the head
    pub fn window(&self, start: usize, len: usize) -> Result<Window<'_, T>> {
        if start + len > self.len {
            return Err(ConvoyError::OutOfRange { start, len, available: self.len });
        }
        Ok(Window { ring: self, start, len })
    }

    /// A uniformly random `len`-long view. Used by offline replay sampling.
    pub fn sample<R: Rng>(&self, len: usize, rng: &mut R) -> Result<Window<'_, T>> {
        if len > self.len {
            return Err(ConvoyError::OutOfRange { start: 0, len, available: self.len });
        }
        let start = rng.random_range(0..=self.len - len);
        self.window(start, len)
    }
}
