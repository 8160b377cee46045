// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::runtime;
use core::fmt;
use core::marker::PhantomData;
use lcomm::Rank;
use serde::{Deserialize, Serialize};

/// An unmanaged remote pointer: the numeric address of a `T` on some rank.
///
/// `Rptr` carries no ownership and no lifetime information; it is a plain
/// `(process, address)` pair with a total order, usable as a wire-safe key.
/// Turning it back into a real pointer is only meaningful on the owning rank
/// and is inherently unsafe.
#[derive(Serialize, Deserialize)]
#[serde(bound(serialize = "", deserialize = ""))]
pub struct Rptr<T> {
    proc: i64,
    addr: u64,
    #[serde(skip)]
    _marker: PhantomData<fn() -> T>,
}

// === impl Rptr ===

impl<T> Rptr<T> {
    /// The null remote pointer.
    #[must_use]
    pub fn null() -> Self {
        Self {
            proc: -1,
            addr: 0,
            _marker: PhantomData,
        }
    }

    /// A remote pointer to `ptr` on the current rank.
    pub fn from_raw(ptr: *mut T) -> Self {
        if ptr.is_null() {
            return Self::null();
        }
        Self {
            proc: i64::try_from(runtime::rank()).unwrap(),
            addr: ptr as usize as u64,
            _marker: PhantomData,
        }
    }

    pub fn is_null(&self) -> bool {
        self.addr == 0
    }

    /// The rank the pointee lives on.
    ///
    /// # Panics
    ///
    /// Panics on a null pointer.
    pub fn proc(&self) -> Rank {
        assert!(!self.is_null(), "null remote pointer has no rank");
        usize::try_from(self.proc).expect("corrupt remote pointer rank")
    }

    pub fn addr(&self) -> u64 {
        self.addr
    }

    /// Whether the pointee lives on the calling rank.
    pub fn local(&self) -> bool {
        !self.is_null() && self.proc() == runtime::rank()
    }

    /// Recover the raw pointer.
    ///
    /// The result is only dereferenceable under whatever liveness protocol
    /// put the address on the wire in the first place.
    ///
    /// # Panics
    ///
    /// Panics if the pointee lives on a different rank.
    pub fn as_ptr(&self) -> *mut T {
        assert!(self.local(), "dereferencing a non-local remote pointer");
        let addr = usize::try_from(self.addr).expect("address wider than this platform");
        addr as *mut T
    }
}

impl<T> Clone for Rptr<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Rptr<T> {}

impl<T> Default for Rptr<T> {
    fn default() -> Self {
        Self::null()
    }
}

impl<T> PartialEq for Rptr<T> {
    fn eq(&self, other: &Self) -> bool {
        self.proc == other.proc && self.addr == other.addr
    }
}

impl<T> Eq for Rptr<T> {}

impl<T> PartialOrd for Rptr<T> {
    fn partial_cmp(&self, other: &Self) -> Option<core::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Rptr<T> {
    fn cmp(&self, other: &Self) -> core::cmp::Ordering {
        // Lexicographic by rank, then address: a total, rank-stable order.
        (self.proc, self.addr).cmp(&(other.proc, other.addr))
    }
}

impl<T> fmt::Debug for Rptr<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            f.write_str("Rptr(null)")
        } else {
            write!(f, "Rptr({}:{:#x})", self.proc, self.addr)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_is_default() {
        let ptr = Rptr::<i32>::default();
        assert!(ptr.is_null());
        assert_eq!(ptr, Rptr::null());
    }

    #[test]
    fn ordering_is_lexicographic() {
        let a = Rptr::<i32> {
            proc: 0,
            addr: 100,
            _marker: PhantomData,
        };
        let b = Rptr::<i32> {
            proc: 1,
            addr: 1,
            _marker: PhantomData,
        };
        let c = Rptr::<i32> {
            proc: 1,
            addr: 2,
            _marker: PhantomData,
        };
        assert!(a < b);
        assert!(b < c);
        assert!(a < c);
    }

    #[test]
    fn serde_round_trip() {
        let ptr = Rptr::<i32> {
            proc: 3,
            addr: 0xdead_beef,
            _marker: PhantomData,
        };
        let bytes = bincode::serialize(&ptr).unwrap();
        let back: Rptr<i32> = bincode::deserialize(&bytes).unwrap();
        assert_eq!(ptr, back);
    }
}
