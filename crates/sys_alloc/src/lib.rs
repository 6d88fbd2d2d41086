//! Anonymous virtual memory reservations.
//!
//! A [`Reservation`] is a page-aligned, zero-filled, read/write mapping that
//! never moves for its whole lifetime and is unmapped on drop. `conmark` uses
//! one reservation per chunk bucket so that growing the mark stack never
//! relocates chunks that are already handed out.

use std::io;

#[cfg(unix)]
mod unix;
#[cfg(unix)]
use unix as os;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
use windows as os;

pub use os::page_size;

/// Round `len` up to a whole number of pages.
///
/// Returns `None` if the rounded length overflows `usize`.
#[must_use]
pub fn round_up_to_page(len: usize) -> Option<usize> {
    let page = page_size();
    len.checked_add(page - 1).map(|n| n & !(page - 1))
}

/// An owned anonymous memory mapping.
///
/// The memory stays at the same address until the reservation is dropped.
pub struct Reservation {
    inner: os::Mapping,
}

impl Reservation {
    /// Reserve and commit `len` bytes of zero-filled memory.
    ///
    /// `len` is rounded up to the page size.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` for a zero or overflowing length, otherwise the
    /// OS error reported by the mapping call.
    pub fn new(len: usize) -> io::Result<Self> {
        if len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "reservation length must be greater than 0",
            ));
        }
        let len = round_up_to_page(len).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "reservation length overflows")
        })?;
        // SAFETY: the mapping is anonymous and private, so it cannot alias
        // any memory already owned by the process.
        let inner = unsafe { os::Mapping::map(len)? };
        Ok(Self { inner })
    }

    /// Start of the reserved memory.
    #[must_use]
    pub fn as_ptr(&self) -> *mut u8 {
        self.inner.ptr()
    }

    /// Length of the reservation in bytes (a multiple of the page size).
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Reservations are never empty; kept for API symmetry with `len`.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.len() == 0
    }
}

impl std::fmt::Debug for Reservation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reservation")
            .field("ptr", &self.as_ptr())
            .field("len", &self.len())
            .finish()
    }
}

// SAFETY: a reservation is plain memory with no thread affinity; callers
// synchronise access to its contents themselves.
unsafe impl Send for Reservation {}
// SAFETY: see `Send`.
unsafe impl Sync for Reservation {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ptr;

    #[test]
    fn test_page_size_is_power_of_two() {
        let ps = page_size();
        assert!(ps > 0);
        assert_eq!(ps & (ps - 1), 0, "page size should be a power of 2");
    }

    #[test]
    fn test_round_up_to_page() {
        let ps = page_size();
        assert_eq!(round_up_to_page(1), Some(ps));
        assert_eq!(round_up_to_page(ps), Some(ps));
        assert_eq!(round_up_to_page(ps + 1), Some(2 * ps));
        assert_eq!(round_up_to_page(usize::MAX), None);
    }

    #[test]
    fn test_reservation_is_zeroed_and_writable() {
        let res = Reservation::new(3 * page_size() - 7).expect("failed to reserve");
        assert_eq!(res.len(), 3 * page_size());
        let p = res.as_ptr();
        assert_eq!(p as usize % page_size(), 0);
        unsafe {
            assert_eq!(ptr::read_volatile(p.add(res.len() - 1)), 0);
            ptr::write_volatile(p, 42);
            assert_eq!(ptr::read_volatile(p), 42);
        }
    }

    #[test]
    fn test_zero_length_rejected() {
        let err = Reservation::new(0).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidInput);
    }
}
