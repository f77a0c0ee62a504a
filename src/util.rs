use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;
use std::hint;
use std::sync::atomic::{AtomicU64, Ordering};
use std::slice;

use time;

static GLOBAL_THREAD_ID: AtomicU64 = AtomicU64::new(1);

/// Hand out a fresh thread identity. Identities start at 1 and are never reused, so 0 can mark
/// an empty slot.
#[inline]
pub fn next_thread_id() -> u64 {
    GLOBAL_THREAD_ID.fetch_add(1, Ordering::Relaxed)
}

#[repr(align(64))]
pub struct WrappedAlign64Type<T>(pub T);

impl<T> Default for WrappedAlign64Type<T>
where
    T: Default,
{
    fn default() -> Self {
        WrappedAlign64Type(T::default())
    }
}

impl<T> Deref for WrappedAlign64Type<T> {
    type Target = T;

    fn deref(&self) -> &<Self as Deref>::Target {
        &self.0
    }
}

impl<T> DerefMut for WrappedAlign64Type<T> {
    fn deref_mut(&mut self) -> &mut <Self as Deref>::Target {
        &mut self.0
    }
}

/// 64-bit MurmurHash3 finalizer.
#[inline]
pub fn murmur3_64(mut h: u64) -> u64 {
    h ^= h >> 33;
    h = h.wrapping_mul(0xff51afd7ed558ccd);
    h ^= h >> 33;
    h = h.wrapping_mul(0xc4ceb9fe1a85ec53);
    h ^= h >> 33;
    h
}

#[inline]
pub fn is_power_of_two(n: u64) -> bool {
    n != 0 && (n & (n - 1)) == 0
}

#[inline]
pub fn cache_line_of(addr: usize) -> usize {
    addr & !(::CACHE_LINE_SIZE - 1)
}

pub fn get_cur_microseconds_time() -> i64 {
    let timespec = time::get_time();
    timespec.sec * 1_000_000 + timespec.nsec as i64 / 1_000
}

#[inline]
pub fn pause() {
    hint::spin_loop();
}

/// Zeroed, cache-line-aligned heap region. Stands in for a persistent arena mapping when the log
/// and its target words are hosted in DRAM.
pub struct AlignedRegion {
    ptr: NonNull<u8>,
    layout: Layout,
}

unsafe impl Send for AlignedRegion {}
unsafe impl Sync for AlignedRegion {}

impl AlignedRegion {
    /// Return `None` when `len` is zero or the layout can't be allocated.
    pub fn zeroed(len: usize) -> Option<AlignedRegion> {
        if len == 0 {
            return None;
        }
        let layout = Layout::from_size_align(len, ::CACHE_LINE_SIZE).ok()?;
        let ptr = NonNull::new(unsafe { alloc_zeroed(layout) })?;
        Some(AlignedRegion { ptr, layout })
    }

    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.layout.size()
    }

    /// View the region as a slice of 64-bit words, the unit `persistent_cas` operates on.
    pub fn words(&self) -> &[AtomicU64] {
        unsafe {
            slice::from_raw_parts(
                self.ptr.as_ptr() as *const AtomicU64,
                self.layout.size() / 8,
            )
        }
    }
}

impl Drop for AlignedRegion {
    fn drop(&mut self) {
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_thread_id_unique_and_non_zero() {
        let a = next_thread_id();
        let b = next_thread_id();
        assert_ne!(a, 0);
        assert!(b > a);
    }

    #[test]
    fn test_power_of_two() {
        assert!(!is_power_of_two(0));
        assert!(is_power_of_two(1));
        assert!(!is_power_of_two(3));
        assert!(is_power_of_two(1024));
    }

    #[test]
    fn test_aligned_region() {
        assert!(AlignedRegion::zeroed(0).is_none());
        let r = AlignedRegion::zeroed(200).unwrap();
        assert_eq!(r.as_ptr() as usize % 64, 0);
        assert_eq!(r.words().len(), 25);
        assert!(r.words().iter().all(|w| w.load(Ordering::Relaxed) == 0));
        assert_eq!(cache_line_of(r.as_ptr() as usize + 70), r.as_ptr() as usize + 64);
    }
}
