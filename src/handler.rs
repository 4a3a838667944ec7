//! The handler shadow stack: typed effect handlers layered over prompts.
//!
//! Every thread carries a singly-linked stack of *handler frames*, pushed on
//! entry to a handler's scope and popped on every exit path. [`find`] walks
//! it to locate the innermost visible handler of a [`Kind`], honoring the
//! two scoping frames that alter visibility: [`under`] hides a handler from
//! the code it tail-calls into, and [`mask`] hides the *n* innermost
//! handlers of a kind so an outer one becomes reachable.
//!
//! A [`prompt_handler`] owns a prompt and can be suspended to with
//! [`yield_to`]; a [`linear_handler`] is a cheap frame on the current stack
//! that can only be found and read. The handler layer never touches stacks
//! directly; everything below the frame walk is delegated to the prompt
//! runtime in [`crate::prompt`].

use std::any::Any;
use std::cell::Cell;
use std::marker::PhantomData;
use std::mem::{self, ManuallyDrop};
use std::panic::{self, AssertUnwindSafe};
use std::ptr;

use crate::prompt;
use crate::unwind::{self, UnwindOp, UnwindSentinel};

/// Identity of a handler family. Two kinds are the same family exactly when
/// they are the same `KindId` in memory.
pub struct KindId {
    name: &'static str,
}

impl KindId {
    /// Short name used for diagnostics; carries no identity.
    pub fn name(&self) -> &'static str {
        self.name
    }
}

/// Reserved kind tagging [`finally`] frames.
pub static FINALLY: KindId = KindId { name: "finally" };
/// Reserved kind tagging [`under`] frames.
pub static UNDER: KindId = KindId { name: "under" };
/// Reserved kind tagging [`mask`] frames.
pub static MASK: KindId = KindId { name: "mask" };

/// An effect: fixes the handler-local state and the answer type of the
/// handlers of one [`Kind`].
pub trait Effect: 'static {
    /// Handler-local state, stored on the prompt stack for prompt handlers
    /// and borrowed from the installer for linear handlers.
    type Data: 'static;
    /// Answer type of the handler's prompt: what [`prompt_handler`] returns
    /// and every yield function must produce.
    type Answer: 'static;
}

/// A typed kind: a [`KindId`] plus the [`Effect`] installed under it.
///
/// Declared as a `static` so the identity is a stable address:
///
/// ```
/// use multiprompt::{Effect, Kind};
///
/// struct State;
/// impl Effect for State {
///     type Data = i32;
///     type Answer = i32;
/// }
/// static STATE: Kind<State> = Kind::new("state");
/// ```
pub struct Kind<E: Effect> {
    id: KindId,
    _marker: PhantomData<fn(E) -> E>,
}

impl<E: Effect> Kind<E> {
    /// Creates a new kind. The value's address is its identity, so two
    /// `Kind` statics are always distinct families.
    pub const fn new(name: &'static str) -> Self {
        Kind {
            id: KindId { name },
            _marker: PhantomData,
        }
    }

    /// Short name used for diagnostics.
    pub fn name(&self) -> &'static str {
        self.id.name
    }

    fn id(&'static self) -> *const KindId {
        &self.id
    }
}

/// A node of the shadow stack, allocated on the stack of whoever installed
/// it (the prompt stack for prompt handlers).
struct Frame {
    parent: *mut Frame,
    kind: *const KindId,
    body: FrameBody,
}

enum FrameBody {
    Linear {
        hdata: *mut u8,
    },
    Prompt {
        /// The `&Prompt<Answer<E::Answer>>` of the owning prompt, erased.
        prompt: *const (),
        hdata: *mut u8,
    },
    Under {
        /// Handlers are skipped until one of this kind, which is then also
        /// hidden.
        under: *const KindId,
    },
    Mask {
        mask: *const KindId,
        from: usize,
    },
}

thread_local! {
    static TOP: Cell<*mut Frame> = Cell::new(ptr::null_mut());
}

fn top_frame() -> *mut Frame {
    TOP.with(|top| top.get())
}

fn set_top(frame: *mut Frame) {
    TOP.with(|top| top.set(frame));
}

/// Pushes a frame for the extent of a scope; the pop runs on both normal
/// return and unwind.
struct FrameGuard {
    frame: *mut Frame,
}

impl FrameGuard {
    fn push(frame: *mut Frame) -> FrameGuard {
        unsafe {
            (*frame).parent = top_frame();
        }
        set_top(frame);
        FrameGuard { frame }
    }
}

impl Drop for FrameGuard {
    fn drop(&mut self) {
        debug_assert_eq!(top_frame(), self.frame);
        set_top(unsafe { (*self.frame).parent });
    }
}

/// A reference to an installed handler of a known effect.
///
/// Valid while the handler's scope is alive, which includes the time its
/// prompt is suspended; using it after the scope exited is undefined, as
/// with any reference into a dead stack frame.
pub struct Handler<E: Effect> {
    frame: *mut Frame,
    _marker: PhantomData<fn(E) -> E>,
}

impl<E: Effect> Clone for Handler<E> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<E: Effect> Copy for Handler<E> {}

impl<E: Effect> core::fmt::Debug for Handler<E> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Handler").field("frame", &self.frame).finish()
    }
}

impl<E: Effect> PartialEq for Handler<E> {
    fn eq(&self, other: &Self) -> bool {
        self.frame == other.frame
    }
}
impl<E: Effect> Eq for Handler<E> {}

impl<E: Effect> Handler<E> {
    /// Pointer to the handler-local state.
    ///
    /// The pointee is shared with the running handler scope; dereference
    /// only while no other reference to it is live.
    pub fn data_ptr(&self) -> *mut E::Data {
        match unsafe { &(*self.frame).body } {
            FrameBody::Linear { hdata } | FrameBody::Prompt { hdata, .. } => {
                *hdata as *mut E::Data
            }
            _ => unreachable!(),
        }
    }

    /// Whether this handler owns a prompt and can be yielded to.
    pub fn is_prompt(&self) -> bool {
        matches!(unsafe { &(*self.frame).body }, FrameBody::Prompt { .. })
    }

    /// This handler without its effect type.
    pub fn erase(&self) -> AnyHandler {
        AnyHandler { frame: self.frame }
    }
}

/// An untyped reference to a handler frame, as returned by [`top`].
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct AnyHandler {
    frame: *mut Frame,
}

impl AnyHandler {
    /// Name of the frame's kind (a user kind, or one of the reserved
    /// `finally`/`under`/`mask` tags).
    pub fn kind_name(&self) -> &'static str {
        unsafe { (*(*self.frame).kind).name }
    }

    /// Whether this frame belongs to the given kind.
    pub fn is<E: Effect>(&self, kind: &'static Kind<E>) -> bool {
        unsafe { (*self.frame).kind == kind.id() }
    }

    /// Recovers the typed handler if this frame belongs to the given kind.
    pub fn downcast<E: Effect>(&self, kind: &'static Kind<E>) -> Option<Handler<E>> {
        self.is(kind).then(|| Handler {
            frame: self.frame,
            _marker: PhantomData,
        })
    }

    /// The frame installed just below this one.
    pub fn parent(&self) -> Option<AnyHandler> {
        let parent = unsafe { (*self.frame).parent };
        (!parent.is_null()).then(|| AnyHandler { frame: parent })
    }
}

/// The innermost installed handler frame, if any.
pub fn top() -> Option<AnyHandler> {
    let frame = top_frame();
    (!frame.is_null()).then(|| AnyHandler { frame })
}

/// Finds the innermost visible handler of the given kind.
///
/// The walk honors scoping frames: an [`under`] frame hides everything up to
/// and including the next handler of its kind, and a [`mask`] frame makes
/// the walk skip one extra matching handler.
pub fn find<E: Effect>(kind: &'static Kind<E>) -> Option<Handler<E>> {
    let id = kind.id();
    let mut frame = top_frame();
    let mut mask_level = 0usize;
    while !frame.is_null() {
        unsafe {
            if (*frame).kind == id {
                if mask_level == 0 {
                    return Some(Handler {
                        frame,
                        _marker: PhantomData,
                    });
                }
                mask_level -= 1;
            } else {
                match (*frame).body {
                    FrameBody::Under { under } => {
                        // Skip to the handler this frame jumps past, then
                        // past it.
                        loop {
                            frame = (*frame).parent;
                            if frame.is_null() {
                                return None;
                            }
                            if (*frame).kind == under {
                                break;
                            }
                        }
                    }
                    FrameBody::Mask { mask, from } if mask == id && from <= mask_level => {
                        mask_level += 1;
                    }
                    _ => {}
                }
            }
            frame = (*frame).parent;
        }
    }
    None
}

/// Runs `body` with a linear handler of the given kind installed.
///
/// A linear handler has no prompt: it cannot be yielded to, only found and
/// read through [`Handler::data_ptr`]. Its state is borrowed from the
/// caller's stack.
pub fn linear_handler<E: Effect, T>(
    kind: &'static Kind<E>,
    data: &mut E::Data,
    body: impl FnOnce() -> T,
) -> T {
    let mut frame = Frame {
        parent: ptr::null_mut(),
        kind: kind.id(),
        body: FrameBody::Linear {
            hdata: data as *mut E::Data as *mut u8,
        },
    };
    let _guard = FrameGuard::push(&mut frame);
    body()
}

/// Runs `body` with an [`under`] frame installed: searches for `kind` skip
/// the innermost `kind` handler for the extent of `body`.
///
/// This is how a handler tail-calls into user code without seeing itself:
/// any `find` the callee performs resolves to the next handler out.
pub fn under<E: Effect, T>(kind: &'static Kind<E>, body: impl FnOnce() -> T) -> T {
    let mut frame = Frame {
        parent: ptr::null_mut(),
        kind: &UNDER,
        body: FrameBody::Under { under: kind.id() },
    };
    let _guard = FrameGuard::push(&mut frame);
    body()
}

/// Runs `body` with a [`mask`] frame installed: searches for `kind` at mask
/// level `from` or deeper skip one matching handler, so the `from + 1`-th
/// innermost handler of `kind` becomes the one found.
pub fn mask<E: Effect, T>(kind: &'static Kind<E>, from: usize, body: impl FnOnce() -> T) -> T {
    let mut frame = Frame {
        parent: ptr::null_mut(),
        kind: &MASK,
        body: FrameBody::Mask {
            mask: kind.id(),
            from,
        },
    };
    let _guard = FrameGuard::push(&mut frame);
    body()
}

/// Runs `body` with a `FINALLY` frame installed; `on_exit` runs when the
/// scope exits, on normal return and unwind alike.
pub fn finally<T>(on_exit: impl FnOnce(), body: impl FnOnce() -> T) -> T {
    let mut frame = Frame {
        parent: ptr::null_mut(),
        kind: &FINALLY,
        body: FrameBody::Linear {
            hdata: ptr::null_mut(),
        },
    };
    let _guard = FrameGuard::push(&mut frame);
    let _exit = scopeguard::guard(on_exit, |f| f());
    body()
}

/// Answer channel of a handler's prompt: a normal value, or the marker that
/// the prompt was abandoned by an unwinding resumption.
enum Answer<A> {
    Value(A),
    Unwound,
}

/// Value delivered to a suspended [`yield_to`]: the resume value, or the
/// instruction to unwind to the handler it yielded to.
enum Sent<R> {
    Value(R),
    Unwind,
}

/// Runs `body` delimited by a prompt handler of the given kind.
///
/// A fresh prompt is created; `data` is moved onto its gstack and stays
/// addressable until the handler returns or a handling unwind completes.
/// `body` runs on the prompt stack with the handler installed; inside it,
/// [`find`] + [`yield_to`] suspend to this handler.
pub fn prompt_handler<E, F>(kind: &'static Kind<E>, data: E::Data, body: F) -> E::Answer
where
    E: Effect,
    F: FnOnce() -> E::Answer + 'static,
{
    let answer = prompt::prompt(move |p: prompt::Prompt<Answer<E::Answer>>| {
        let mut data = data;
        let mut frame = Frame {
            parent: ptr::null_mut(),
            kind: kind.id(),
            body: FrameBody::Prompt {
                prompt: p.as_opaque(),
                hdata: &mut data as *mut E::Data as *mut u8,
            },
        };
        let frame_ptr: *mut Frame = &mut frame;

        // Catch unwinds aimed at exactly this frame; everything else is
        // rethrown and ferried further out by the prompt runtime.
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            let _guard = FrameGuard::push(frame_ptr);
            body()
        }));
        match result {
            Ok(value) => Answer::Value(value),
            Err(payload) => match payload.downcast::<UnwindSentinel>() {
                Ok(sentinel) if sentinel.target == frame_ptr as *const () => match sentinel.op {
                    UnwindOp::Abort => Answer::Unwound,
                    UnwindOp::Deliver(fun) => {
                        let value = fun(&mut data as *mut E::Data as *mut u8);
                        match value.downcast::<E::Answer>() {
                            Ok(value) => Answer::Value(*value),
                            Err(_) => panic!("unwind function produced a value of the wrong type"),
                        }
                    }
                },
                Ok(sentinel) => panic::resume_unwind(sentinel),
                Err(payload) => panic::resume_unwind(payload),
            },
        }
    });
    match answer {
        Answer::Value(value) => value,
        Answer::Unwound => panic!("prompt handler unwound with no resumer to receive it"),
    }
}

/// Suspends the computation up to the handler `h`, which must be a prompt
/// handler.
///
/// `f` runs on the stack of `h`'s prompt's parent, with a one-shot
/// [`Resumption`] and the handler-local data; its return value becomes the
/// prompt's value unless it resumes first. For the extent of the suspension
/// the handler observes itself popped: `find` from inside `f` (or from
/// anything it tail-calls) does not see `h`.
///
/// When the suspension is resumed, the shadow-stack top observed by the
/// yielder is restored, and `h` is spliced onto whatever handlers were live
/// at the resume site.
///
/// # Panics
///
/// Panics if `h` is a linear handler.
pub fn yield_to<E, R, F>(h: Handler<E>, f: F) -> R
where
    E: Effect,
    F: FnOnce(Resumption<R, E::Answer>, *mut E::Data) -> E::Answer,
{
    let frame = h.frame;
    let (prompt_ptr, hdata) = match unsafe { &(*frame).body } {
        FrameBody::Prompt { prompt, hdata } => (*prompt, *hdata as *mut E::Data),
        _ => panic!("yield to a handler without a prompt"),
    };
    let p = unsafe { &*(prompt_ptr as *const prompt::Prompt<Answer<E::Answer>>) };

    // Unlink the handler for the duration of the suspension.
    let yield_top = top_frame();
    set_top(unsafe { (*frame).parent });

    let sent: Sent<R> = p.yield_with(move |resumption| {
        Answer::Value(f(
            Resumption {
                inner: ManuallyDrop::new(resumption),
                _marker: PhantomData,
            },
            hdata,
        ))
    });

    // Relink: splice the handler onto the handlers live at the resume site,
    // then restore the yielder's own top.
    unsafe {
        (*frame).parent = top_frame();
    }
    set_top(yield_top);

    match sent {
        Sent::Value(value) => value,
        Sent::Unwind => unwind::throw_unwind(frame as *const (), UnwindOp::Abort),
    }
}

/// Multi-shot variant of [`yield_to`]: `f` receives a [`MultiResumption`]
/// that may be invoked any number of times, each invocation starting from
/// the identical captured stack state.
///
/// The capture is a bitwise copy: locals and handler data alive across the
/// suspension must be plain data, since every invocation replays their
/// teardown (see [`crate::prompt::Prompt::yield_multi`]).
pub fn myield_to<E, R, F>(h: Handler<E>, f: F) -> R
where
    E: Effect,
    F: FnOnce(MultiResumption<R, E::Answer>, *mut E::Data) -> E::Answer,
{
    let frame = h.frame;
    let (prompt_ptr, hdata) = match unsafe { &(*frame).body } {
        FrameBody::Prompt { prompt, hdata } => (*prompt, *hdata as *mut E::Data),
        _ => panic!("yield to a handler without a prompt"),
    };
    let p = unsafe { &*(prompt_ptr as *const prompt::Prompt<Answer<E::Answer>>) };

    let yield_top = top_frame();
    set_top(unsafe { (*frame).parent });

    let sent: Sent<R> = p.yield_multi(move |resumption| {
        Answer::Value(f(
            MultiResumption {
                inner: ManuallyDrop::new(resumption),
                _marker: PhantomData,
            },
            hdata,
        ))
    });

    unsafe {
        (*frame).parent = top_frame();
    }
    set_top(yield_top);

    match sent {
        Sent::Value(value) => value,
        Sent::Unwind => unwind::throw_unwind(frame as *const (), UnwindOp::Abort),
    }
}

/// Unwinds to the handler `h`: every scope between the current point and
/// `h`'s prompt is torn down in LIFO order, then `fun` runs with the
/// handler-local data still live, and its result becomes the value of `h`'s
/// [`prompt_handler`] call.
pub fn unwind_to<E: Effect>(
    h: Handler<E>,
    fun: impl FnOnce(*mut E::Data) -> E::Answer + 'static,
) -> ! {
    match unsafe { &(*h.frame).body } {
        FrameBody::Prompt { .. } => {}
        _ => panic!("unwind to a handler without a prompt"),
    }
    let deliver: Box<dyn FnOnce(*mut u8) -> Box<dyn Any>> =
        Box::new(move |hdata| Box::new(fun(hdata as *mut E::Data)));
    unwind::throw_unwind(h.frame as *const (), UnwindOp::Deliver(deliver))
}

/// A one-shot handler resumption, handed to the yield function of
/// [`yield_to`].
///
/// Resuming is consuming; dropping a live resumption unwinds the suspended
/// computation back to its handler, running every scope exit in between.
pub struct Resumption<R, A: 'static> {
    inner: ManuallyDrop<prompt::Resumption<Sent<R>, Answer<A>>>,
    _marker: PhantomData<*mut (R, A)>,
}

impl<R, A: 'static> Resumption<R, A> {
    fn into_inner(self) -> prompt::Resumption<Sent<R>, Answer<A>> {
        let mut this = ManuallyDrop::new(self);
        unsafe { ManuallyDrop::take(&mut this.inner) }
    }

    /// Resumes the suspended computation; the suspended [`yield_to`] call
    /// returns `val`. Returns the prompt's next answer.
    pub fn resume(self, val: R) -> A {
        match self.into_inner().resume(Sent::Value(val)) {
            Answer::Value(value) => value,
            Answer::Unwound => panic!("resumed computation unwound past its handler"),
        }
    }

    /// Tail-position variant of [`resume`](Resumption::resume); see
    /// [`prompt::Resumption::resume_tail`].
    pub fn resume_tail(self, val: R) -> A {
        match self.into_inner().resume_tail(Sent::Value(val)) {
            Answer::Value(value) => value,
            Answer::Unwound => unreachable!(),
        }
    }

    /// Resumes the suspended computation with the unwind flag set: the
    /// yielder immediately unwinds to the handler it yielded to, running
    /// every scope exit in between, and the handler's prompt is abandoned.
    pub fn resume_unwind(self) {
        match self.into_inner().resume(Sent::Unwind) {
            Answer::Unwound => {}
            Answer::Value(_) => panic!("unwinding resume produced a value"),
        }
    }

    /// Whether dropping this resumption has to unwind the suspended
    /// computation to run pending scope exits.
    pub fn should_unwind(&self) -> bool {
        self.inner.should_unwind()
    }

    /// Releases the resumption, unwinding the suspended computation if
    /// scope exits are pending. Equivalent to dropping it.
    pub fn resume_drop(self) {
        drop(self);
    }
}

impl<R, A: 'static> Drop for Resumption<R, A> {
    fn drop(&mut self) {
        let inner = unsafe { ManuallyDrop::take(&mut self.inner) };
        if inner.should_unwind() {
            let guard = scopeguard::guard((), |()| {
                panic!("panic escaped while unwinding a dropped resumption");
            });
            match inner.resume(Sent::Unwind) {
                Answer::Unwound => {}
                Answer::Value(_) => panic!("unwinding resume produced a value"),
            }
            mem::forget(guard);
        }
    }
}

/// A multi-shot handler resumption, handed to the yield function of
/// [`myield_to`]. May be invoked any number of times; every invocation
/// starts from the identical captured stack state.
pub struct MultiResumption<R, A: 'static> {
    inner: ManuallyDrop<prompt::MultiResumption<Sent<R>, Answer<A>>>,
    _marker: PhantomData<*mut (R, A)>,
}

impl<R, A: 'static> MultiResumption<R, A> {
    /// Restores the captured state and resumes it; the suspended
    /// [`myield_to`] call returns `val`. Returns the prompt's next answer.
    pub fn resume(&self, val: R) -> A {
        match self.inner.resume(Sent::Value(val)) {
            Answer::Value(value) => value,
            Answer::Unwound => panic!("resumed computation unwound past its handler"),
        }
    }

    /// Tail-position variant of [`resume`](MultiResumption::resume).
    pub fn resume_tail(&self, val: R) -> A {
        match self.inner.resume_tail(Sent::Value(val)) {
            Answer::Value(value) => value,
            Answer::Unwound => unreachable!(),
        }
    }

    /// Restores the captured state and immediately unwinds it back to its
    /// handler, running every scope exit in between.
    pub fn resume_unwind(&self) {
        match self.inner.resume(Sent::Unwind) {
            Answer::Unwound => {}
            Answer::Value(_) => panic!("unwinding resume produced a value"),
        }
    }

    /// Whether dropping this resumption has to unwind the original
    /// suspension to run pending scope exits.
    pub fn should_unwind(&self) -> bool {
        self.inner.should_unwind()
    }

    /// Releases the resumption. Equivalent to dropping it.
    pub fn resume_drop(self) {
        drop(self);
    }
}

impl<R, A: 'static> Drop for MultiResumption<R, A> {
    fn drop(&mut self) {
        let inner = unsafe { ManuallyDrop::take(&mut self.inner) };
        if inner.should_unwind() {
            let guard = scopeguard::guard((), |()| {
                panic!("panic escaped while unwinding a dropped resumption");
            });
            match inner.resume(Sent::Unwind) {
                Answer::Unwound => {}
                Answer::Value(_) => panic!("unwinding resume produced a value"),
            }
            mem::forget(guard);
        }
    }
}
