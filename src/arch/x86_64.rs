//! Context switching for amd64 SysV.
//!
//! The runtime needs three transfers between a parent stack and a gstack:
//! `switch_and_link` to enter a suspended context, `switch_yield` to leave
//! the current context through a parent link, and `switch_and_reset` to
//! leave for the last time. `init_stack` seeds a fresh gstack so that the
//! first `switch_and_link` lands in the initial function.
//!
//! ## Parent link
//!
//! Every gstack reserves two words at its base: the address of the initial
//! function, and the *parent link*. Each time a context is entered through
//! `switch_and_link`, the stack pointer of the entering side is stored in
//! the parent link of the gstack named by `stack_base`. A later
//! `switch_yield` through that link returns to exactly that point. Because
//! the link is addressed by the gstack *base* while the suspension point is
//! an arbitrary stack pointer, the two may live on different gstacks; this
//! is what lets a yield travel across a whole chain of nested prompts.
//!
//! ## Stack layout
//!
//! A suspended context looks like this (the suspension point may be on a
//! deeper gstack than the base words):
//!
//! ```text
//! +--------------+  <- Stack base
//! | Initial func |  <- Used once, on the first entry.
//! +--------------+
//! | Parent link  |  <- Stack pointer of whoever entered us last.
//! +--------------+
//! |     ...      |
//! +--------------+
//! | Saved RBP    |
//! +--------------+
//! | Saved RBX    |
//! +--------------+
//! | Saved RIP    |  <- Suspension point handed to switch_and_link.
//! +--------------+
//! ```
//!
//! The parent stack at the moment a child is running holds `RBX`, `RIP`,
//! `RBP` in that order, with the parent link pointing at the saved `RBP` so
//! that the frame-pointer chain stays walkable across the boundary.

use core::arch::{asm, global_asm};

use super::{allocate_obj_on_stack, push};
use crate::stack::{Stack, StackPointer};
use crate::unwind::InitialFunc;
use crate::util::EncodedValue;

pub const STACK_ALIGNMENT: usize = 16;
pub type StackWord = u64;

// Entry point of every gstack. Called by switch_and_link the first time a
// context is entered, from the state set up by init_stack.
//
// The DWARF escapes teach the unwinder how to continue into the parent
// stack: the virtual RBP points at the parent link, which is dereferenced
// and adjusted past the three words saved on the parent stack.
global_asm!(
    ".balign 16",
    asm_function_begin!("gstack_init_trampoline"),
    ".cfi_startproc",
    cfi_signal_frame!(),
    // Register state on entry:
    // - RSP points to the top of the parent stack.
    // - RBP holds its value from the parent context.
    // - RDX points to the top of our stack.
    // - RSI points to the base of our stack.
    // - RDI contains the argument from switch_and_link.
    //
    // Save the parent's RBP next to the return address pushed by the CALL in
    // switch_and_link; together they form a frame record.
    "push rbp",
    // Fill in the parent link.
    "mov [rsi - 16], rsp",
    // The second argument of the initial function is the parent link
    // address.
    "sub rsi, 16",
    // Switch to the gstack, skipping the trampoline address at its top.
    "lea rsp, [rdx + 8]",
    // Point the frame pointer at the parent link for the CFI below.
    "mov rbp, rsi",
    // 0x0f: DW_CFA_def_cfa_expression
    // 5: length of the expression
    // 0x76 0x00: DW_OP_breg6 (rbp + 0)
    // 0x06: DW_OP_deref
    // 0x23, 0x18: DW_OP_plus_uconst 24
    ".cfi_escape 0x0f, 5, 0x76, 0x00, 0x06, 0x23, 0x18",
    ".cfi_offset rbx, -8",
    ".cfi_offset rip, -16",
    ".cfi_offset rbp, -24",
    // Third argument: the initial object placed on the stack by init_stack.
    "mov rdx, rsp",
    // Hand-rolled call: set up a return address and JMP, so that the RET
    // later executed by switch_yield or switch_and_reset does not unbalance
    // the CPU's return predictor.
    "lea rcx, [rip + 2f]",
    "push rcx",
    // init_stack placed the initial function just above the parent link.
    "jmp [rsi + 8]",
    "2:",
    // The initial function never returns; the INT3 only keeps the return
    // address within the bounds of this (signal) frame for the unwinder.
    "int3",
    ".cfi_endproc",
    asm_function_end!("gstack_init_trampoline"),
);

extern "C" {
    fn gstack_init_trampoline(arg: EncodedValue, stack_base: StackPointer, stack_ptr: StackPointer);
}

/// Location of the parent link on a gstack with the given base.
#[inline]
pub unsafe fn parent_link(stack_base: StackPointer) -> *mut StackPointer {
    (stack_base.get() - 16) as *mut StackPointer
}

/// Sets up a fresh gstack so that the first `switch_and_link` runs `func`
/// with a pointer to `obj`, which is written to the stack.
#[inline]
pub unsafe fn init_stack<T>(stack: &impl Stack, func: InitialFunc<T>, obj: T) -> StackPointer {
    let mut sp = stack.base().get();

    // Initial function, read by gstack_init_trampoline.
    push(&mut sp, Some(func as StackWord));

    // Parent link; filled in on every switch_and_link.
    push(&mut sp, None);

    // Initial object, rounded up to STACK_ALIGNMENT.
    allocate_obj_on_stack(&mut sp, 16, obj);

    // Address called by switch_and_link on the first entry.
    push(&mut sp, Some(gstack_init_trampoline as *const () as StackWord));

    StackPointer::new_unchecked(sp)
}

/// Transfers control to the suspended context at `sp`, recording our own
/// context in the parent link of the gstack at `stack_base`.
///
/// Returns the argument passed by the next transfer back to us, along with
/// the stack pointer of the suspension point, or `None` if the other side
/// left with `switch_and_reset`.
#[inline]
pub unsafe fn switch_and_link(
    arg: EncodedValue,
    sp: StackPointer,
    stack_base: StackPointer,
) -> (EncodedValue, Option<StackPointer>) {
    let (ret_val, ret_sp);

    asm!(
        // RBX is an LLVM reserved register, save it manually. RBP is pushed
        // later, by the code at the entry address, so that it sits next to
        // the return address as a frame record.
        "push rbx",

        // Push a return address onto our stack and jump to the address at
        // the top of the target stack: gstack_init_trampoline on the first
        // entry, the label in switch_yield afterwards.
        "call [rdx]",

        // Register state on return:
        // - RSP: our stack, with the return address and RBP popped.
        // - RSI: the suspension point of the other side, or 0 from
        //        switch_and_reset.
        // - RDI: the argument passed back to us.
        "pop rbx",

        // RDI doubles as the first-argument register of the ABI, so the
        // value passes straight through to the initial function.
        inlateout("rdi") arg => ret_val,

        // Must match the register used in switch_yield and
        // switch_and_reset.
        lateout("rsi") ret_sp,

        // Stack base of the target; the entry code stores the parent link
        // through it.
        in("rsi") stack_base.get() as u64,

        // Suspension point to enter; must match switch_yield.
        in("rdx") sp.get() as u64,

        // Everything else is clobbered. RBX and RBP are reserved registers
        // and handled manually above.
        lateout("r12") _, lateout("r13") _, lateout("r14") _, lateout("r15") _,
        clobber_abi("sysv64"),
    );

    (ret_val, StackPointer::new(ret_sp))
}

/// Suspends the current context and returns through the given parent link.
///
/// The stack pointer of the suspension point is handed to the parent as the
/// second return value of its `switch_and_link`.
// Must be inlined: the RET below pairs with the CALL in switch_and_link for
// the return predictor, see gstack_init_trampoline.
#[inline(always)]
pub unsafe fn switch_yield(arg: EncodedValue, parent_link: *mut StackPointer) -> EncodedValue {
    let ret_val;

    asm!(
        // RBP and RBX are LLVM reserved registers, save them manually.
        "push rbp",
        "push rbx",

        // The address switch_and_link will call to resume us.
        "lea rax, [rip + 2f]",
        "push rax",

        // Hand our suspension point to the parent.
        "mov rsi, rsp",

        // Load the parent's stack pointer from the link,
        "mov rsp, [rdx]",

        // restore the parent's RBP from the top of its stack,
        "pop rbp",

        // and return into the parent's switch_and_link.
        "ret",

        // Resume path, called by switch_and_link. Register state:
        // - RSP points to the top of the entering side's stack.
        // - RBP holds the entering side's value.
        // - RDX points to our suspension point.
        // - RSI points to the base of the gstack being entered.
        // - RDI carries the argument.
        "2:",

        // Frame record for the entering side, see gstack_init_trampoline.
        "push rbp",

        // Refresh the parent link.
        "mov [rsi - 16], rsp",

        // Back onto our stack, skipping the resume address.
        "lea rsp, [rdx + 8]",

        "pop rbx",
        "pop rbp",

        inlateout("rdi") arg => ret_val,

        // The parent link; register choice must match nothing else, RDX is
        // arbitrary.
        in("rdx") parent_link as u64,

        lateout("r12") _, lateout("r13") _, lateout("r14") _, lateout("r15") _,
        clobber_abi("sysv64"),
    );

    ret_val
}

/// Leaves the current context for the last time, returning through the given
/// parent link.
///
/// The parent observes a suspension pointer of 0, marking the context as
/// finished. The departing stack stays addressable until the parent releases
/// it, so `arg` may point into it.
// Must be inlined, see switch_yield.
#[inline(always)]
pub unsafe fn switch_and_reset(arg: EncodedValue, parent_link: *mut StackPointer) -> ! {
    asm!(
        "mov rsp, [{parent_link}]",
        "pop rbp",
        "ret",

        parent_link = in(reg) parent_link as u64,

        in("rdi") arg,

        // 0 tells the parent this context cannot be entered again.
        in("rsi") 0,

        options(noreturn),
    );
}
