//! Multi-prompt delimited control with algebraic effect handlers, running on
//! growable stacks.
//!
//! ## Overview
//!
//! This crate provides two layers. The lower layer, [`prompt`], implements
//! *delimited control*: [`prompt::prompt`] runs a computation on its own
//! growable stack (a *gstack*), and the computation can suspend itself to
//! any dynamically enclosing prompt, reifying everything in between as a
//! resumption that can be invoked once ([`prompt::Resumption`]) or any
//! number of times ([`prompt::MultiResumption`]).
//!
//! The upper layer implements *effect handlers* on top of those prompts: a
//! per-thread shadow stack of handler frames, searched by [`find`], with
//! scoping combinators [`under`] and [`mask`] that alter which handler a
//! search sees. [`prompt_handler`] installs a handler that can be suspended
//! to with [`yield_to`]; [`linear_handler`] installs a cheap read-only
//! handler on the current stack.
//!
//! ## Example
//!
//! A state effect: the handler owns an `i32` on its prompt stack, and the
//! body reads and writes it through yields.
//!
//! ```
//! use multiprompt::{find, prompt_handler, yield_to, Effect, Kind};
//!
//! struct State;
//! impl Effect for State {
//!     type Data = i32;
//!     type Answer = i32;
//! }
//! static STATE: Kind<State> = Kind::new("state");
//!
//! fn get() -> i32 {
//!     yield_to(find(&STATE).unwrap(), |k, data| k.resume(unsafe { *data }))
//! }
//!
//! fn put(val: i32) -> i32 {
//!     yield_to(find(&STATE).unwrap(), |k, data| unsafe {
//!         let prev = *data;
//!         *data = val;
//!         k.resume(prev)
//!     })
//! }
//!
//! let out = prompt_handler(&STATE, 0, || {
//!     put(7);
//!     let x = get();
//!     put(x + 1);
//!     get()
//! });
//! assert_eq!(out, 8);
//! ```
//!
//! ## Threading
//!
//! Everything is per-thread: the shadow stack and the prompt bookkeeping
//! live in thread-local state, and prompts and resumptions are `!Send`.
//! Control transfers are explicit; ordinary function calls never suspend,
//! and there is no preemption.
//!
//! ## Failure modes
//!
//! User-level effects are ordinary control flow, not errors; an "exception"
//! effect is simply a handler that does not resume. Programming errors
//! (yielding to a linear handler, invoking a dead resumption, overlapping
//! multi-shot invocations) panic. Running a gstack into its guard page is a
//! fatal overflow; growth below the limit is absorbed by the OS committing
//! pages on demand.
//!
//! ## Supported targets
//!
//! x86_64 and AArch64, on ELF and Mach-O platforms. The platform seams are
//! the [`stack`] provider and one context-switch trampoline per ABI.

#![warn(missing_docs)]

mod arch;
mod handler;
mod unwind;
mod util;

pub mod prompt;
pub mod stack;

pub use handler::*;

#[cfg(test)]
mod tests;
