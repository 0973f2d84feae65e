// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Pointer-sized atomic slot holding either a pointer or a small integer.
//!
//! Tag convention: bit 0 clear means pointer (every pointee stored here is at
//! least 2-byte aligned), bit 0 set means integer, encoded as `(i << 1) | 1`.
//! Integers therefore carry one bit less than the native word.
//!
//! The cell stores values without managing their lifetime. All operations
//! are sequentially consistent: the queue and resource protocols depend on
//! store-then-load ordering across different cells.

use std::fmt;
use std::marker::PhantomData;
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};

const INT_TAG: usize = 1;

/// Decoded content of an [`AtomicCell`].
pub enum Word<T> {
    Ptr(*const T),
    Int(isize),
}

impl<T> Word<T> {
    pub const fn null() -> Self {
        Word::Ptr(ptr::null())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Word::Ptr(p) if p.is_null())
    }

    /// The pointer, if this is a non-null pointer.
    pub fn as_ptr(&self) -> Option<*const T> {
        match *self {
            Word::Ptr(p) if !p.is_null() => Some(p),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<isize> {
        match *self {
            Word::Int(i) => Some(i),
            Word::Ptr(_) => None,
        }
    }

    fn encode(self) -> usize {
        match self {
            Word::Ptr(p) => {
                let raw = p as usize;
                debug_assert_eq!(raw & INT_TAG, 0, "unaligned pointer stored in AtomicCell");
                raw
            }
            Word::Int(i) => ((i << 1) as usize) | INT_TAG,
        }
    }

    fn decode(raw: usize) -> Self {
        if raw & INT_TAG != 0 {
            Word::Int((raw as isize) >> 1)
        } else {
            Word::Ptr(raw as *const T)
        }
    }
}

impl<T> Clone for Word<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Word<T> {}

impl<T> PartialEq for Word<T> {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Word::Ptr(a), Word::Ptr(b)) => ptr::eq(*a, *b),
            (Word::Int(a), Word::Int(b)) => a == b,
            _ => false,
        }
    }
}

impl<T> Eq for Word<T> {}

impl<T> fmt::Debug for Word<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Word::Ptr(p) if p.is_null() => f.write_str("Null"),
            Word::Ptr(p) => write!(f, "Ptr({:p})", *p),
            Word::Int(i) => write!(f, "Int({})", i),
        }
    }
}

/// Atomic pointer-or-integer slot.
pub struct AtomicCell<T> {
    raw: AtomicUsize,
    _marker: PhantomData<*const T>,
}

// The cell is a plain machine word; it never dereferences what it holds.
unsafe impl<T> Send for AtomicCell<T> {}
unsafe impl<T> Sync for AtomicCell<T> {}

impl<T> AtomicCell<T> {
    pub const fn null() -> Self {
        Self {
            raw: AtomicUsize::new(0),
            _marker: PhantomData,
        }
    }

    pub fn new(word: Word<T>) -> Self {
        Self {
            raw: AtomicUsize::new(word.encode()),
            _marker: PhantomData,
        }
    }

    pub fn int(value: isize) -> Self {
        Self::new(Word::Int(value))
    }

    pub fn load(&self) -> Word<T> {
        Word::decode(self.raw.load(Ordering::SeqCst))
    }

    pub fn store(&self, word: Word<T>) {
        self.raw.store(word.encode(), Ordering::SeqCst);
    }

    /// Install `new` if the cell holds `expected`. Returns the value observed
    /// before the operation; equal to `expected` exactly when it succeeded.
    pub fn compare_and_swap(&self, expected: Word<T>, new: Word<T>) -> Word<T> {
        match self.raw.compare_exchange(
            expected.encode(),
            new.encode(),
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(prev) | Err(prev) => Word::decode(prev),
        }
    }

    pub fn swap(&self, new: Word<T>) -> Word<T> {
        Word::decode(self.raw.swap(new.encode(), Ordering::SeqCst))
    }

    /// Add `delta` to an integer cell, returning the previous integer.
    ///
    /// The shifted delta is even, so the tag bit is preserved. Using this on a
    /// cell that holds a pointer corrupts it and is a fatal error.
    pub fn fetch_add(&self, delta: isize) -> isize {
        let prev = Word::<T>::decode(self.raw.fetch_add((delta << 1) as usize, Ordering::SeqCst));
        match prev {
            Word::Int(i) => i,
            Word::Ptr(_) => crate::error::invariant_violation("fetch_add on a pointer cell"),
        }
    }
}

impl<T> Default for AtomicCell<T> {
    fn default() -> Self {
        Self::null()
    }
}

impl<T> fmt::Debug for AtomicCell<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("AtomicCell").field(&self.load()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn null_and_int_are_distinct() {
        let cell: AtomicCell<u64> = AtomicCell::null();
        assert!(cell.load().is_null());
        cell.store(Word::Int(0));
        assert!(!cell.load().is_null());
        assert_eq!(cell.load(), Word::Int(0));
    }

    #[test]
    fn negative_integers_keep_sign() {
        let cell: AtomicCell<u64> = AtomicCell::int(-7);
        assert_eq!(cell.load().as_int(), Some(-7));
        assert_eq!(cell.fetch_add(3), -7);
        assert_eq!(cell.load().as_int(), Some(-4));
    }

    #[test]
    fn pointer_round_trip() {
        let value = Box::new(42u64);
        let p: *const u64 = &*value;
        let cell = AtomicCell::new(Word::Ptr(p));
        assert_eq!(cell.load().as_ptr(), Some(p));
        assert_eq!(cell.load().as_int(), None);
    }

    #[test]
    fn cas_reports_actual_value() {
        let cell: AtomicCell<u64> = AtomicCell::null();
        let prev = cell.compare_and_swap(Word::null(), Word::Int(5));
        assert!(prev.is_null());
        let prev = cell.compare_and_swap(Word::null(), Word::Int(9));
        assert_eq!(prev, Word::Int(5));
        assert_eq!(cell.load(), Word::Int(5));
    }

    #[test]
    fn swap_returns_old() {
        let cell: AtomicCell<u64> = AtomicCell::int(1);
        assert_eq!(cell.swap(Word::Int(2)), Word::Int(1));
        assert_eq!(cell.load(), Word::Int(2));
    }

    #[test]
    #[should_panic(expected = "fetch_add on a pointer cell")]
    fn fetch_add_on_pointer_is_fatal() {
        let value = Box::new(1u64);
        let cell = AtomicCell::new(Word::Ptr(&*value as *const u64));
        cell.fetch_add(1);
    }

    #[test]
    fn concurrent_fetch_add() {
        let cell: Arc<AtomicCell<()>> = Arc::new(AtomicCell::int(0));
        let mut handles = vec![];
        for _ in 0..8 {
            let cell = cell.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..1000 {
                    cell.fetch_add(1);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(cell.load().as_int(), Some(8000));
    }
}
