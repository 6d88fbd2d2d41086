//! Entries of the marking work queues.

use std::fmt;
use std::num::NonZeroUsize;

/// Size of a heap word in bytes.
pub const WORD_SIZE: usize = std::mem::size_of::<usize>();

/// An object reference: the non-null address of an object's first word.
///
/// The engine never looks inside objects; it only compares references by
/// address (for finger checks) and hands them back to the heap for scanning.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct ObjRef(NonZeroUsize);

impl ObjRef {
    /// Create a reference from an address. Returns `None` for address zero.
    #[inline]
    #[must_use]
    pub const fn new(addr: usize) -> Option<Self> {
        match NonZeroUsize::new(addr) {
            Some(a) => Some(Self(a)),
            None => None,
        }
    }

    /// The object's address.
    #[inline]
    #[must_use]
    pub const fn addr(self) -> usize {
        self.0.get()
    }
}

impl fmt::Debug for ObjRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjRef({:#x})", self.addr())
    }
}

/// One unit of marking work.
///
/// Either a grey object still to be scanned, or the address of the next
/// unscanned element of a large reference array that is being scanned
/// piecewise. `Null` terminates partially filled chunks.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Debug)]
pub enum TaskEntry {
    /// Sentinel; never pushed as work.
    #[default]
    Null,
    /// A marked object whose fields still have to be visited.
    Obj(ObjRef),
    /// Continuation into the interior of a reference array.
    ArraySlice(NonZeroUsize),
}

impl TaskEntry {
    /// Entry for a grey object.
    #[inline]
    #[must_use]
    pub const fn from_obj(obj: ObjRef) -> Self {
        Self::Obj(obj)
    }

    /// Entry for an array continuation at `addr`.
    ///
    /// # Panics
    ///
    /// Panics in debug builds if `addr` is zero or not word aligned.
    #[inline]
    #[must_use]
    pub fn from_slice(addr: usize) -> Self {
        debug_assert!(addr % WORD_SIZE == 0, "array slice {addr:#x} is not word aligned");
        NonZeroUsize::new(addr).map_or(Self::Null, Self::ArraySlice)
    }

    /// Whether this is the empty sentinel.
    #[inline]
    #[must_use]
    pub const fn is_null(self) -> bool {
        matches!(self, Self::Null)
    }

    /// Whether this continues a partially scanned array.
    #[inline]
    #[must_use]
    pub const fn is_array_slice(self) -> bool {
        matches!(self, Self::ArraySlice(_))
    }

    /// The object of an `Obj` entry.
    #[inline]
    #[must_use]
    pub const fn obj(self) -> Option<ObjRef> {
        match self {
            Self::Obj(o) => Some(o),
            _ => None,
        }
    }

    /// The address of an `ArraySlice` entry.
    #[inline]
    #[must_use]
    pub const fn slice(self) -> Option<usize> {
        match self {
            Self::ArraySlice(a) => Some(a.get()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_null() {
        let e = TaskEntry::default();
        assert!(e.is_null());
        assert!(!e.is_array_slice());
        assert_eq!(e.obj(), None);
        assert_eq!(e.slice(), None);
    }

    #[test]
    fn test_obj_and_slice_are_distinct() {
        let obj = ObjRef::new(0x1000).unwrap();
        let a = TaskEntry::from_obj(obj);
        let b = TaskEntry::from_slice(0x1000);
        assert_ne!(a, b);
        assert_eq!(a.obj(), Some(obj));
        assert_eq!(a.slice(), None);
        assert!(b.is_array_slice());
        assert_eq!(b.slice(), Some(0x1000));
        assert_eq!(b.obj(), None);
    }

    #[test]
    fn test_null_address_has_no_ref() {
        assert!(ObjRef::new(0).is_none());
        assert!(TaskEntry::from_slice(0).is_null());
    }

    #[test]
    fn test_entry_fits_two_words() {
        assert_eq!(std::mem::size_of::<TaskEntry>(), 2 * WORD_SIZE);
    }
}
