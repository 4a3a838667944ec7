//! The prompt runtime: gstack-backed delimited control.
//!
//! A prompt anchors a delimited computation on its own gstack. The body runs
//! there until it either returns, making [`prompt`] return its value, or
//! suspends through [`Prompt::yield_with`]. A suspension reifies everything
//! between the prompt and the suspension point as a [`Resumption`] and runs
//! a caller-supplied function on the parent stack; that function's return
//! value is delivered as the prompt's value, unless it chooses to resume the
//! suspension first.
//!
//! Yields are addressed to a specific prompt, which does not have to be the
//! innermost one: yielding to an outer prompt suspends the whole chain of
//! prompts in between, and resuming re-enters the chain at the original
//! suspension point.
//!
//! Everything here is single-threaded: prompts and resumptions are `!Send`
//! and all bookkeeping lives in thread-local state.

use std::cell::{Cell, RefCell};
use std::marker::PhantomData;
use std::mem::{self, ManuallyDrop};
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;

use crate::arch;
use crate::stack::{self, Gstack, Stack, StackPointer};
use crate::unwind::{self, initial_func_abi, CaughtPanic, ForcedUnwind};
use crate::util::{self, EncodedValue, ErasedBox};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum State {
    Running,
    Suspended,
    Done,
}

/// Runtime bookkeeping for one prompt, shared between the prompt-entry
/// frames on the parent side and any resumptions that outlive them.
struct PromptInner {
    stack: ManuallyDrop<Gstack>,
    state: Cell<State>,
    /// Bumped on every capture and every snapshot restore. A resumption
    /// whose epoch no longer matches refers to a suspension that has been
    /// replaced and is dead.
    epoch: Cell<u64>,
}

impl PromptInner {
    fn base(&self) -> StackPointer {
        self.stack.base()
    }

    fn bump_epoch(&self) -> u64 {
        let epoch = self.epoch.get() + 1;
        self.epoch.set(epoch);
        epoch
    }
}

impl Drop for PromptInner {
    fn drop(&mut self) {
        stack::release(unsafe { ManuallyDrop::take(&mut self.stack) });
    }
}

thread_local! {
    /// Prompts currently entered on this thread, outermost first.
    static CHAIN: RefCell<Vec<Rc<PromptInner>>> = RefCell::new(Vec::new());
}

/// Header of the envelope a suspending context hands to its parent. The
/// envelope lives on the suspending stack, which stays addressable for as
/// long as the suspension does; `invoke` is a monomorphized shim that knows
/// the concrete closure type stored behind the header.
#[repr(C)]
struct YieldRequest<A> {
    invoke: unsafe fn(*mut YieldRequest<A>, RawResumption) -> A,
    target: *const PromptInner,
    multi: bool,
}

#[repr(C)]
struct YieldEnvelope<F, A> {
    header: YieldRequest<A>,
    f: ManuallyDrop<F>,
}

/// The used slice of every gstack captured by a multi-shot suspension.
/// Restored to the original addresses before each invocation, so interior
/// pointers stay valid and every invocation starts from the identical state.
struct ChainSnapshot {
    parts: Vec<SnapshotPart>,
}

struct SnapshotPart {
    prompt: Rc<PromptInner>,
    lo: usize,
    bytes: Box<[u8]>,
}

impl ChainSnapshot {
    /// Copies the used slice of every captured gstack. For all but the
    /// deepest prompt the live region is bounded by the parent link of the
    /// next prompt in the chain; the deepest is bounded by the suspension
    /// point itself.
    unsafe fn capture(prompts: &[Rc<PromptInner>], sp: StackPointer) -> Self {
        let mut parts = Vec::with_capacity(prompts.len());
        for (i, prompt) in prompts.iter().enumerate() {
            let hi = prompt.base().get();
            let lo = match prompts.get(i + 1) {
                Some(next) => (*arch::parent_link(next.base())).get(),
                None => sp.get(),
            };
            debug_assert!(lo > prompt.stack.limit().get() && lo <= hi);
            let bytes = std::slice::from_raw_parts(lo as *const u8, hi - lo)
                .to_vec()
                .into_boxed_slice();
            parts.push(SnapshotPart {
                prompt: prompt.clone(),
                lo,
                bytes,
            });
        }
        ChainSnapshot { parts }
    }

    /// Writes every captured slice back to its original address. Anything
    /// that happened on these gstacks since the capture is discarded, so any
    /// resumption taken in the meantime goes dead.
    unsafe fn restore(&self) {
        for part in &self.parts {
            assert!(
                part.prompt.state.get() != State::Running,
                "invoking a multi-shot resumption while a previous invocation is still running"
            );
            std::ptr::copy_nonoverlapping(part.bytes.as_ptr(), part.lo as *mut u8, part.bytes.len());
            part.prompt.state.set(State::Suspended);
            part.prompt.bump_epoch();
        }
    }
}

/// Untyped innards shared by one-shot and multi-shot resumptions.
struct RawResumption {
    prompts: Vec<Rc<PromptInner>>,
    sp: StackPointer,
    snapshot: Option<Rc<ChainSnapshot>>,
    epoch: u64,
}

impl RawResumption {
    /// Whether the suspension this resumption refers to is still the live
    /// state of its prompts.
    fn live(&self) -> bool {
        let outer = &self.prompts[0];
        outer.state.get() == State::Suspended && outer.epoch.get() == self.epoch
    }
}

/// One pending transfer into a suspended chain.
struct PendingSwitch {
    prompts: Vec<Rc<PromptInner>>,
    sp: StackPointer,
    arg: EncodedValue,
    /// Keeps a heap-allocated transfer value alive until the other side has
    /// read it.
    keepalive: Option<ErasedBox>,
    restore: Option<Rc<ChainSnapshot>>,
}

/// Panic payload used by `resume_tail` to hand the pending switch to the
/// innermost enclosing prompt-entry loop, which re-enters the child without
/// growing the parent stack.
struct TailResume {
    pending: PendingSwitch,
}

// Single-threaded by construction; only needs to satisfy the panic
// machinery's bound.
unsafe impl Send for TailResume {}

thread_local! {
    /// Boxed transfer values waiting for their receiving context to read
    /// them. A box parked here is consumed by the very next switch into a
    /// child, so it can be freed at any later point on this thread.
    static KEEPALIVE: RefCell<Vec<ErasedBox>> = RefCell::new(Vec::new());
}

fn park_keepalive(keepalive: ErasedBox) {
    KEEPALIVE.with(|parked| parked.borrow_mut().push(keepalive));
}

fn free_keepalives() {
    KEEPALIVE.with(|parked| parked.borrow_mut().clear());
}

/// Splits the current prompt chain at `target` and reifies the suspended
/// tail.
unsafe fn capture(target: *const PromptInner, multi: bool, sp: StackPointer) -> RawResumption {
    let prompts = CHAIN.with(|chain| {
        let mut chain = chain.borrow_mut();
        let at = chain
            .iter()
            .rposition(|p| Rc::as_ptr(p) == target)
            .expect("yield through a prompt that is not entered on this thread");
        chain.split_off(at)
    });
    for prompt in &prompts {
        prompt.state.set(State::Suspended);
    }
    let epoch = prompts[0].bump_epoch();
    let snapshot = if multi {
        Some(Rc::new(ChainSnapshot::capture(&prompts, sp)))
    } else {
        None
    };
    RawResumption {
        prompts,
        sp,
        snapshot,
        epoch,
    }
}

/// Enters (or re-enters) a suspended chain and dispatches whatever comes
/// back through the outermost prompt's parent link: yield requests, which
/// run here on the entering stack, or the prompt's final result.
///
/// `A` is the answer type of the chain's outermost prompt; every transfer
/// arriving through its parent link carries that type.
///
/// This frame sits in the captured region whenever the chain it entered is
/// itself captured by a yield to some outer prompt, so a multi-shot restore
/// can replay it from the switch below. It therefore must not own heap
/// across the switch: chain ownership moves into `CHAIN` and boxed transfer
/// values into `KEEPALIVE` beforehand.
fn enter<A>(mut pending: PendingSwitch) -> A {
    loop {
        let target: *const PromptInner = Rc::as_ptr(&pending.prompts[0]);
        let base = pending.prompts[0].base();

        if let Some(snapshot) = pending.restore.take() {
            unsafe { snapshot.restore() };
        }
        let prompts = mem::take(&mut pending.prompts);
        CHAIN.with(|chain| {
            let mut chain = chain.borrow_mut();
            for prompt in prompts {
                debug_assert_eq!(prompt.state.get(), State::Suspended);
                prompt.state.set(State::Running);
                chain.push(prompt);
            }
        });
        if let Some(keepalive) = pending.keepalive.take() {
            park_keepalive(keepalive);
        }

        let (val, child_sp) = unsafe { arch::switch_and_link(pending.arg, pending.sp, base) };
        free_keepalives();

        match child_sp {
            // The prompt's body returned, or ferried a panic out.
            None => {
                let popped = CHAIN
                    .with(|chain| chain.borrow_mut().pop())
                    .expect("prompt chain underflow");
                assert_eq!(Rc::as_ptr(&popped), target);
                popped.state.set(State::Done);
                popped.bump_epoch();
                drop(popped);
                let result: Result<A, CaughtPanic> = unsafe { util::decode_val(val) };
                return unwind::maybe_resume_unwind(result);
            }

            // A yield arrived through `target`'s parent link.
            Some(sp) => {
                let req = val as *mut YieldRequest<A>;
                debug_assert_eq!(unsafe { (*req).target }, target);
                let raw = unsafe { capture(target, (*req).multi, sp) };
                let outcome =
                    panic::catch_unwind(AssertUnwindSafe(|| unsafe { ((*req).invoke)(req, raw) }));
                match outcome {
                    Ok(answer) => return answer,
                    Err(payload) => match payload.downcast::<TailResume>() {
                        Ok(tail) => {
                            let tail = *tail;
                            assert_eq!(
                                Rc::as_ptr(&tail.pending.prompts[0]),
                                target,
                                "resume_tail must target the prompt whose yield is being handled"
                            );
                            pending = tail.pending;
                        }
                        Err(other) => panic::resume_unwind(other),
                    },
                }
            }
        }
    }
}

/// Tears down a suspended chain by resuming it with a [`ForcedUnwind`]
/// payload and catching that payload once it has ferried back out. Any other
/// panic escaping the teardown is rethrown.
fn force_unwind_raw<R, A>(raw: RawResumption) {
    if !raw.live() {
        return;
    }
    let sp = raw.sp;
    let result = unwind::catch_forced_unwind(|| {
        let mut input = ManuallyDrop::new(Err::<R, ForcedUnwind>(ForcedUnwind(sp)));
        enter::<A>(PendingSwitch {
            prompts: raw.prompts,
            sp,
            arg: unsafe { util::encode_val(&mut input) },
            keepalive: None,
            restore: None,
        })
    });
    match result {
        Ok(_) => panic!("the ForcedUnwind payload was caught and not rethrown"),
        Err(payload) => {
            if let Some(forced) = payload.downcast_ref::<ForcedUnwind>() {
                if forced.0 == sp {
                    return;
                }
            }
            panic::resume_unwind(payload);
        }
    }
}

/// Handle to the current prompt, passed to the body running on its gstack.
///
/// `A` is the prompt's answer type: the type [`prompt`] returns, that every
/// yield function must produce, and that resuming hands back once the next
/// suspension or the final return happens.
///
/// The handle is a plain copyable value, so a nested prompt's body can
/// capture an outer one and yield across the prompts in between. It is only
/// meaningful while its prompt is entered on the current thread; suspending
/// through a handle whose prompt is gone panics.
pub struct Prompt<A> {
    link: *mut StackPointer,
    inner: *const PromptInner,
    _marker: PhantomData<*mut A>,
}

impl<A> Clone for Prompt<A> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<A> Copy for Prompt<A> {}

impl<A> Prompt<A> {
    /// Suspends the computation up to this prompt.
    ///
    /// The suspended slice, from this prompt's delimiter down to this call,
    /// is reified as a one-shot [`Resumption`] and handed to `f`, which runs
    /// on the parent stack. `f`'s return value becomes the value of the
    /// enclosing [`prompt`] (or of the `resume` call that re-entered it).
    /// This call returns once the resumption is resumed, with the value
    /// passed to [`Resumption::resume`].
    ///
    /// # Panics
    ///
    /// Panics if this prompt is not entered on the current thread, i.e. if
    /// the handle leaked into a computation not running below it.
    pub fn yield_with<R, F>(&self, f: F) -> R
    where
        F: FnOnce(Resumption<R, A>) -> A,
    {
        unsafe fn invoke<F, R, A>(req: *mut YieldRequest<A>, raw: RawResumption) -> A
        where
            F: FnOnce(Resumption<R, A>) -> A,
        {
            let env = req as *mut YieldEnvelope<F, A>;
            let f = ManuallyDrop::take(&mut (*env).f);
            f(Resumption {
                raw: ManuallyDrop::new(raw),
                _marker: PhantomData,
            })
        }

        let mut env = YieldEnvelope {
            header: YieldRequest {
                invoke: invoke::<F, R, A>,
                target: self.inner,
                multi: false,
            },
            f: ManuallyDrop::new(f),
        };
        unsafe { self.suspend(&mut env.header) }
    }

    /// Multi-shot variant of [`Prompt::yield_with`].
    ///
    /// The suspended slice is additionally copied on capture, and every
    /// [`MultiResumption::resume`] restores the copy first, so invocations
    /// are independent of each other.
    ///
    /// The copy is a bitwise one: a captured frame that *owns* a heap
    /// resource would release it once per invocation. Locals alive across a
    /// multi-shot suspension must be plain data or only borrow what they
    /// reference.
    pub fn yield_multi<R, F>(&self, f: F) -> R
    where
        F: FnOnce(MultiResumption<R, A>) -> A,
    {
        unsafe fn invoke<F, R, A>(req: *mut YieldRequest<A>, raw: RawResumption) -> A
        where
            F: FnOnce(MultiResumption<R, A>) -> A,
        {
            let env = req as *mut YieldEnvelope<F, A>;
            let f = ManuallyDrop::take(&mut (*env).f);
            debug_assert!(raw.snapshot.is_some());
            f(MultiResumption {
                raw: ManuallyDrop::new(raw),
                _marker: PhantomData,
            })
        }

        let mut env = YieldEnvelope {
            header: YieldRequest {
                invoke: invoke::<F, R, A>,
                target: self.inner,
                multi: true,
            },
            f: ManuallyDrop::new(f),
        };
        unsafe { self.suspend(&mut env.header) }
    }

    unsafe fn suspend<R>(&self, req: *mut YieldRequest<A>) -> R {
        assert!(
            CHAIN.with(|chain| chain
                .borrow()
                .iter()
                .any(|p| Rc::as_ptr(p) == self.inner)),
            "yield through a prompt that is not entered on this thread"
        );
        let val = arch::switch_yield(req as EncodedValue, self.link);
        let sent: Result<R, ForcedUnwind> = util::decode_val(val);
        unwind::maybe_force_unwind(sent)
    }

    pub(crate) fn as_opaque(&self) -> *const () {
        self as *const Prompt<A> as *const ()
    }
}

/// Object written to a fresh gstack for the initial entry.
struct RootObj<F> {
    inner: *const PromptInner,
    body: F,
}

/// Runs `body` on a fresh gstack, delimited by a new prompt.
///
/// Returns the body's result, or, if the body suspended itself with
/// [`Prompt::yield_with`], whatever value the suspension's handler produced
/// in its place.
///
/// # Panics
///
/// Panics raised by the body propagate out of this call after unwinding the
/// prompt's gstack.
pub fn prompt<A, F>(body: F) -> A
where
    F: FnOnce(Prompt<A>) -> A + 'static,
{
    initial_func_abi! {
        unsafe fn prompt_root<A, F>(
            input: EncodedValue,
            parent_link: &mut StackPointer,
            obj: *mut RootObj<F>,
        ) -> !
        where
            F: FnOnce(Prompt<A>) -> A,
        {
            let RootObj { inner, body } = obj.read();

            // A resumption cannot exist before the first suspension, so a
            // forced unwind cannot arrive at the initial entry.
            let input: Result<(), ForcedUnwind> = util::decode_val(input);
            if input.is_err() {
                core::hint::unreachable_unchecked();
            }

            let prompt = Prompt {
                link: parent_link as *mut StackPointer,
                inner,
                _marker: PhantomData,
            };

            // Catch panics so they can be ferried to the parent stack.
            let result = unwind::catch_unwind_at_root(|| body(prompt));

            let mut result = ManuallyDrop::new(result);
            arch::switch_and_reset(util::encode_val(&mut result), prompt.link);
        }
    }

    let stack = stack::acquire().expect("failed to allocate a gstack");
    let inner = Rc::new(PromptInner {
        stack: ManuallyDrop::new(stack),
        state: Cell::new(State::Suspended),
        epoch: Cell::new(0),
    });

    let sp = unsafe {
        arch::init_stack(
            &*inner.stack,
            prompt_root::<A, F>,
            RootObj {
                inner: Rc::as_ptr(&inner),
                body,
            },
        )
    };

    let mut input = ManuallyDrop::new(Ok::<(), ForcedUnwind>(()));
    let arg = unsafe { util::encode_val(&mut input) };
    enter(PendingSwitch {
        prompts: vec![inner],
        sp,
        arg,
        keepalive: None,
        restore: None,
    })
}

/// A one-shot resumption: the suspended slice between a prompt and a
/// [`Prompt::yield_with`] call.
///
/// Consumed by [`resume`](Resumption::resume) or
/// [`resume_tail`](Resumption::resume_tail); move semantics make resuming
/// twice unrepresentable. Dropping a live resumption unwinds the suspended
/// chain, running destructors on every captured gstack, and frees the
/// intermediate prompts.
pub struct Resumption<R, A> {
    raw: ManuallyDrop<RawResumption>,
    _marker: PhantomData<*mut (R, A)>,
}

impl<R, A> Resumption<R, A> {
    fn into_raw(self) -> RawResumption {
        let mut this = ManuallyDrop::new(self);
        unsafe { ManuallyDrop::take(&mut this.raw) }
    }

    /// Re-enters the suspended chain; the suspended `yield_with` call
    /// returns `val`. This call returns the prompt's next answer: the value
    /// of the following suspension's handler, or the body's final result.
    pub fn resume(self, val: R) -> A {
        let raw = self.into_raw();
        assert!(raw.live(), "attempt to resume a dead resumption");
        let mut input = ManuallyDrop::new(Ok::<R, ForcedUnwind>(val));
        let arg = unsafe { util::encode_val(&mut input) };
        enter(PendingSwitch {
            prompts: raw.prompts,
            sp: raw.sp,
            arg,
            keepalive: None,
            restore: None,
        })
    }

    /// Tail-position variant of [`resume`](Resumption::resume): transfers
    /// the pending resume to the enclosing prompt-entry loop, reusing its
    /// frame instead of stacking a new one, so chains of handler-resume
    /// cycles run in constant parent-stack space.
    ///
    /// Must be the last action of the yield function handling this
    /// resumption's prompt; anything after it is unreachable, and local
    /// state of the yield function is dropped before the child continues.
    pub fn resume_tail(self, val: R) -> A {
        let raw = self.into_raw();
        assert!(raw.live(), "attempt to resume a dead resumption");
        let (arg, keepalive) = unsafe { util::encode_boxed(Ok::<R, ForcedUnwind>(val)) };
        panic::resume_unwind(Box::new(TailResume {
            pending: PendingSwitch {
                prompts: raw.prompts,
                sp: raw.sp,
                arg,
                keepalive,
                restore: None,
            },
        }))
    }

    /// Whether dropping this resumption has to unwind the suspended chain to
    /// run pending scope exits.
    pub fn should_unwind(&self) -> bool {
        self.raw.live()
    }

    /// Unwinds the suspended chain without resuming it, running destructors
    /// on every captured gstack. Equivalent to dropping the resumption.
    pub fn force_unwind(self) {
        force_unwind_raw::<R, A>(self.into_raw());
    }
}

impl<R, A> Drop for Resumption<R, A> {
    fn drop(&mut self) {
        let raw = unsafe { ManuallyDrop::take(&mut self.raw) };
        // A panic escaping the teardown cannot be propagated out of a drop
        // that may itself run during unwinding; abort via double panic.
        let guard = scopeguard::guard((), |()| {
            panic!("panic escaped while unwinding a dropped resumption");
        });
        force_unwind_raw::<R, A>(raw);
        mem::forget(guard);
    }
}

/// A multi-shot resumption: like [`Resumption`], but the captured slice was
/// copied at the suspension and is restored before every invocation, so the
/// resumption can be invoked any number of times and each invocation starts
/// from the identical captured state.
///
/// Invocations may not overlap: one must reach its next suspension or the
/// prompt's return before the next begins.
pub struct MultiResumption<R, A> {
    raw: ManuallyDrop<RawResumption>,
    _marker: PhantomData<*mut (R, A)>,
}

impl<R, A> MultiResumption<R, A> {
    fn pending(&self, val: R) -> PendingSwitch {
        let raw = &*self.raw;
        let (arg, keepalive) = unsafe { util::encode_boxed(Ok::<R, ForcedUnwind>(val)) };
        PendingSwitch {
            prompts: raw.prompts.clone(),
            sp: raw.sp,
            arg,
            keepalive,
            restore: Some(raw.snapshot.clone().unwrap()),
        }
    }

    /// Restores the captured state and re-enters it; the suspended
    /// `yield_multi` call returns `val`. See [`Resumption::resume`].
    pub fn resume(&self, val: R) -> A {
        enter(self.pending(val))
    }

    /// Tail-position variant of [`resume`](MultiResumption::resume). See
    /// [`Resumption::resume_tail`].
    pub fn resume_tail(&self, val: R) -> A {
        panic::resume_unwind(Box::new(TailResume {
            pending: self.pending(val),
        }))
    }

    /// Whether the original suspension is still the live state of its
    /// prompts, so that dropping this resumption has to unwind it.
    pub fn should_unwind(&self) -> bool {
        self.raw.live()
    }
}

impl<R, A> Drop for MultiResumption<R, A> {
    fn drop(&mut self) {
        let raw = unsafe { ManuallyDrop::take(&mut self.raw) };
        let guard = scopeguard::guard((), |()| {
            panic!("panic escaped while unwinding a dropped resumption");
        });
        // If an invocation has run since the capture, the live state belongs
        // to whatever that invocation produced; only the snapshot is freed.
        force_unwind_raw::<R, A>(raw);
        mem::forget(guard);
    }
}
