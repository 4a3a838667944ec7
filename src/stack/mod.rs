//! Gstacks: the growable stacks that host prompts.
//!
//! A gstack is a virtually-reserved region with a no-access guard page at
//! its low end. Pages are committed lazily by the OS as the stack grows
//! toward its limit; running into the guard page is a fatal overflow.
//!
//! Freed gstacks are kept in a small per-thread cache so that entering a
//! prompt does not usually pay for an mmap.

use std::cell::RefCell;
use std::io;
use std::num::NonZeroUsize;

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        mod unix;
        pub use self::unix::Gstack;
    } else {
        compile_error!("Unsupported platform");
    }
}

/// A stack address.
pub type StackPointer = NonZeroUsize;

/// Required stack alignment at function call boundaries.
pub const STACK_ALIGNMENT: usize = crate::arch::STACK_ALIGNMENT;

/// Minimum usable size of a gstack, excluding the guard page.
pub const MIN_STACK_SIZE: usize = 4096;

/// Usable size of the gstacks handed out to prompts.
pub const DEFAULT_STACK_SIZE: usize = 1024 * 1024;

/// A region of memory that can be used as a stack.
///
/// # Safety
///
/// The region must have a guard page below its limit which catches stack
/// overflows, and must contain at least [`MIN_STACK_SIZE`] bytes of usable
/// memory. Both bounds must be aligned to [`STACK_ALIGNMENT`].
pub unsafe trait Stack {
    /// Base address of the stack. This is the highest address: stacks grow
    /// downwards.
    fn base(&self) -> StackPointer;

    /// Limit address of the stack, including the guard page. This is the
    /// lowest address.
    fn limit(&self) -> StackPointer;
}

unsafe impl<'a, S: Stack> Stack for &'a S {
    #[inline]
    fn base(&self) -> StackPointer {
        (**self).base()
    }

    #[inline]
    fn limit(&self) -> StackPointer {
        (**self).limit()
    }
}

const CACHE_LIMIT: usize = 8;

thread_local! {
    static CACHE: RefCell<Vec<Gstack>> = RefCell::new(Vec::new());
}

/// Takes a gstack from the thread's cache, or maps a fresh one.
pub(crate) fn acquire() -> io::Result<Gstack> {
    match CACHE.with(|cache| cache.borrow_mut().pop()) {
        Some(stack) => Ok(stack),
        None => Gstack::new(DEFAULT_STACK_SIZE),
    }
}

/// Returns a gstack to the thread's cache, or unmaps it if the cache is
/// full. Only default-sized stacks are worth keeping.
pub(crate) fn release(stack: Gstack) {
    let _ = CACHE.try_with(|cache| {
        let mut cache = cache.borrow_mut();
        if cache.len() < CACHE_LIMIT && stack.is_default_size() {
            cache.push(stack);
        }
    });
}

#[test]
fn assert_send_sync() {
    fn send<T: Send>() {}
    fn sync<T: Sync>() {}
    send::<Gstack>();
    sync::<Gstack>();
}
