//! Encoding of arbitrary values into a `usize` so they can cross a context
//! switch in a single register.
//!
//! A value that fits in a `usize` is packed directly; anything larger is
//! passed as a pointer to the value, which remains dereferenceable while the
//! originating context is suspended.

use core::mem::{self, ManuallyDrop};
use core::ptr;

/// A value that has been encoded in a `usize`.
pub type EncodedValue = usize;

/// Encodes the given value either directly or as a pointer to it. Logically
/// takes ownership of the value: it must not be dropped afterwards.
pub unsafe fn encode_val<T>(val: &mut ManuallyDrop<T>) -> EncodedValue {
    if mem::size_of::<T>() <= mem::size_of::<EncodedValue>() {
        let mut out = 0;
        ptr::write_unaligned(
            &mut out as *mut EncodedValue as *mut T,
            ManuallyDrop::take(val),
        );
        out
    } else {
        val as *const ManuallyDrop<T> as EncodedValue
    }
}

/// Decodes a value produced by `encode_val`, taking ownership of it.
pub unsafe fn decode_val<T>(val: EncodedValue) -> T {
    if mem::size_of::<T>() <= mem::size_of::<EncodedValue>() {
        ptr::read_unaligned(&val as *const EncodedValue as *const T)
    } else {
        ptr::read(val as *const T)
    }
}

/// A heap allocation whose contents are moved out by `decode_val` on the
/// receiving side. Dropping this frees the allocation without dropping the
/// (moved-out) value.
pub struct ErasedBox {
    ptr: *mut u8,
    free: unsafe fn(*mut u8),
}

impl Drop for ErasedBox {
    fn drop(&mut self) {
        unsafe { (self.free)(self.ptr) }
    }
}

/// Variant of `encode_val` for transfers whose originating stack frame does
/// not survive until the receiver reads the value. Large values are moved to
/// the heap; the returned `ErasedBox` must be kept alive until the receiving
/// context has observed the value.
pub unsafe fn encode_boxed<T>(val: T) -> (EncodedValue, Option<ErasedBox>) {
    if mem::size_of::<T>() <= mem::size_of::<EncodedValue>() {
        let mut val = ManuallyDrop::new(val);
        (encode_val(&mut val), None)
    } else {
        unsafe fn free<T>(ptr: *mut u8) {
            drop(Box::from_raw(ptr as *mut ManuallyDrop<T>));
        }
        let ptr = Box::into_raw(Box::new(ManuallyDrop::new(val)));
        (
            ptr as EncodedValue,
            Some(ErasedBox {
                ptr: ptr as *mut u8,
                free: free::<T>,
            }),
        )
    }
}
