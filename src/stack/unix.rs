use std::io::{Error, Result};
use std::ptr;

use super::{Stack, StackPointer, DEFAULT_STACK_SIZE, MIN_STACK_SIZE};

fn page_size() -> usize {
    let pagesize = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
    assert!(pagesize.is_power_of_two());
    pagesize
}

/// An mmap-backed gstack with a guard page.
///
/// The mapping is reserved in one piece; everything above the guard page is
/// mapped read-write and committed lazily by the OS as the stack grows into
/// it.
pub struct Gstack {
    base: StackPointer,
    mmap_len: usize,
}

impl Gstack {
    /// Maps a new gstack with at least the given usable capacity.
    pub fn new(size: usize) -> Result<Self> {
        let size = size.max(MIN_STACK_SIZE);

        // One guard page below the usable region, everything rounded up to
        // a page boundary.
        let page_size = page_size();
        let mmap_len = size
            .checked_add(page_size + page_size - 1)
            .expect("integer overflow while calculating stack size")
            & !(page_size - 1);

        // OpenBSD requires MAP_STACK on anything used as a stack.
        cfg_if::cfg_if! {
            if #[cfg(target_os = "openbsd")] {
                let map_flags = libc::MAP_ANONYMOUS | libc::MAP_PRIVATE | libc::MAP_STACK;
            } else {
                let map_flags = libc::MAP_ANONYMOUS | libc::MAP_PRIVATE;
            }
        }

        unsafe {
            // Reserve the address space with no access rights; the guard
            // page keeps this protection.
            let mmap = libc::mmap(ptr::null_mut(), mmap_len, libc::PROT_NONE, map_flags, -1, 0);
            if mmap == libc::MAP_FAILED {
                return Err(Error::last_os_error());
            }

            // Construct the result first so the mapping is released if the
            // mprotect below fails.
            let out = Self {
                base: StackPointer::new(mmap as usize + mmap_len).unwrap(),
                mmap_len,
            };

            // Everything except the guard page becomes usable.
            if libc::mprotect(
                mmap.cast::<u8>().add(page_size).cast(),
                mmap_len - page_size,
                libc::PROT_READ | libc::PROT_WRITE,
            ) != 0
            {
                return Err(Error::last_os_error());
            }

            Ok(out)
        }
    }

    /// Whether this stack was mapped with [`DEFAULT_STACK_SIZE`].
    pub(crate) fn is_default_size(&self) -> bool {
        self.mmap_len >= DEFAULT_STACK_SIZE
            && self.mmap_len <= DEFAULT_STACK_SIZE + 2 * page_size()
    }
}

impl Default for Gstack {
    fn default() -> Self {
        Self::new(DEFAULT_STACK_SIZE).expect("failed to allocate a gstack")
    }
}

impl Drop for Gstack {
    fn drop(&mut self) {
        unsafe {
            let mmap = self.base.get() - self.mmap_len;
            let ret = libc::munmap(mmap as _, self.mmap_len);
            debug_assert_eq!(ret, 0);
        }
    }
}

unsafe impl Stack for Gstack {
    #[inline]
    fn base(&self) -> StackPointer {
        self.base
    }

    #[inline]
    fn limit(&self) -> StackPointer {
        StackPointer::new(self.base.get() - self.mmap_len).unwrap()
    }
}
