//! Panic-based unwinding support.
//!
//! Rust panics are the destructor-safe non-local exit this runtime builds
//! its unwind protocol on. Three payload types travel through the panic
//! machinery:
//!
//! - Ordinary panics raised in a prompt body. These are caught at the root
//!   of the prompt stack, ferried across the context switch as a `Result`,
//!   and rethrown on the parent stack.
//! - [`ForcedUnwind`], thrown into a suspended stack chain to tear it down
//!   when a resumption is dropped. It ferries outwards through every
//!   intermediate prompt root and is caught again at the drop site, which
//!   recognizes it by the stack pointer it carries.
//! - [`UnwindSentinel`], the handler-targeted unwind of the effect layer.
//!   The catch sits exactly at the target's prompt handler; any other frame
//!   that sees it rethrows.

#![allow(unused_macros)]

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};

use crate::stack::StackPointer;

/// A panic payload caught at the root of a prompt stack, waiting to be
/// rethrown on the parent stack.
pub type CaughtPanic = Box<dyn Any + Send>;

/// Runs a prompt body, catching any panic so it can be returned across the
/// stack boundary instead of unwinding into the switch trampoline.
#[inline]
pub fn catch_unwind_at_root<T, F: FnOnce() -> T>(f: F) -> Result<T, CaughtPanic> {
    panic::catch_unwind(AssertUnwindSafe(f))
}

/// Rethrows a panic that was ferried across a context switch.
#[inline]
pub fn maybe_resume_unwind<T>(val: Result<T, CaughtPanic>) -> T {
    match val {
        Ok(val) => val,
        Err(e) => panic::resume_unwind(e),
    }
}

/// Payload thrown into a suspended stack chain to unwind it back to its
/// root. Carries the stack pointer of the suspension it was aimed at so the
/// initiator can recognize its own payload coming back out.
#[repr(transparent)]
pub struct ForcedUnwind(pub StackPointer);

/// Turns a resume value received at a suspension point into either the value
/// or the start of a forced unwind.
#[inline]
pub fn maybe_force_unwind<T>(val: Result<T, ForcedUnwind>) -> T {
    match val {
        Ok(val) => val,
        Err(e) => panic::resume_unwind(Box::new(e)),
    }
}

/// Catches panics around a forced unwind so the initiator can check whether
/// the payload that came back is its own [`ForcedUnwind`].
#[inline]
pub fn catch_forced_unwind<T>(f: impl FnOnce() -> T) -> Result<T, CaughtPanic> {
    panic::catch_unwind(AssertUnwindSafe(f))
}

/// Unwind aimed at a specific handler frame. Caught at the target frame's
/// prompt handler while the handler-local data is still live; rethrown by
/// every other frame.
pub(crate) struct UnwindSentinel {
    /// Address of the target handler frame.
    pub target: *const (),
    pub op: UnwindOp,
}

pub(crate) enum UnwindOp {
    /// Abandon the prompt: its handler frame exits without producing a
    /// value. Used when a suspension is resumed with the unwind flag set.
    Abort,
    /// Run a function against the target's handler-local data; its result
    /// becomes the prompt's value.
    Deliver(Box<dyn FnOnce(*mut u8) -> Box<dyn Any>>),
}

// The runtime is single-threaded by construction; the payload never actually
// crosses a thread, it only has to satisfy the panic machinery's bound.
unsafe impl Send for UnwindSentinel {}

pub(crate) fn throw_unwind(target: *const (), op: UnwindOp) -> ! {
    panic::resume_unwind(Box::new(UnwindSentinel { target, op }))
}

// The ABI of the initial function of a prompt stack. The SysV ABI is forced
// on x86_64 so the trampoline can use the same registers everywhere.
cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        pub type InitialFunc<T> = unsafe extern "sysv64" fn(
            arg: crate::util::EncodedValue,
            parent_link: &mut StackPointer,
            obj: *mut T,
        ) -> !;
        macro_rules! initial_func_abi {
            (unsafe fn $($tt:tt)*) => {
                unsafe extern "sysv64" fn $($tt)*
            }
        }
    } else {
        pub type InitialFunc<T> = unsafe extern "C" fn(
            arg: crate::util::EncodedValue,
            parent_link: &mut StackPointer,
            obj: *mut T,
        ) -> !;
        macro_rules! initial_func_abi {
            (unsafe fn $($tt:tt)*) => {
                unsafe extern "C" fn $($tt)*
            }
        }
    }
}

pub(crate) use initial_func_abi;
