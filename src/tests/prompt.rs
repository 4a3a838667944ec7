use std::cell::Cell;
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::rc::Rc;

use crate::prompt::{prompt, Prompt, Resumption};

struct SetOnDrop(Rc<Cell<bool>>);

impl Drop for SetOnDrop {
    fn drop(&mut self) {
        self.0.set(true);
    }
}

#[test]
fn smoke() {
    let hit = Rc::new(Cell::new(false));
    let hit2 = hit.clone();
    let out: i32 = prompt(move |_| {
        hit2.set(true);
        42
    });
    assert_eq!(out, 42);
    assert!(hit.get());
}

#[test]
fn yield_then_resume_is_identity() {
    let out: i32 = prompt(|p| p.yield_with(|k| k.resume(1)) + 1);
    assert_eq!(out, 2);
}

#[test]
fn values_cross_both_ways() {
    let out: i32 = prompt(|p| {
        let a: i32 = p.yield_with(|k| k.resume(10));
        let b: i32 = p.yield_with(|k| k.resume(20));
        a + b
    });
    assert_eq!(out, 30);
}

#[test]
fn abandoning_the_resumption_unwinds_the_stack() {
    let hit = Rc::new(Cell::new(false));
    let hit2 = hit.clone();
    let out: i32 = prompt(move |p| {
        let guard = SetOnDrop(hit2);
        let v: i32 = p.yield_with(|k| {
            drop(k);
            -1
        });
        drop(guard);
        v
    });
    assert_eq!(out, -1);
    assert!(hit.get());
}

#[test]
fn resumption_outlives_the_prompt_call() {
    let dropped = Rc::new(Cell::new(false));
    let dropped2 = dropped.clone();
    let slot: Rc<Cell<Option<Resumption<i32, i32>>>> = Rc::new(Cell::new(None));
    let slot2 = slot.clone();

    let out: i32 = prompt(move |p| {
        let guard = SetOnDrop(dropped2);
        let v: i32 = p.yield_with(move |k| {
            slot2.set(Some(k));
            -7
        });
        drop(guard);
        v
    });
    assert_eq!(out, -7);

    // The suspended stack is still alive behind the stored resumption.
    assert!(!dropped.get());
    drop(slot.take());
    assert!(dropped.get());
}

#[test]
fn yield_across_a_nested_prompt() {
    let out: i32 = prompt(|outer| {
        let inner: i32 = prompt(move |_: Prompt<i32>| {
            let x: i32 = outer.yield_with(|k| k.resume(5));
            x + 1
        });
        inner + 100
    });
    assert_eq!(out, 106);
}

#[test]
#[should_panic(expected = "foobar")]
fn panics_propagated() {
    let hit = Rc::new(Cell::new(false));
    let guard = SetOnDrop(hit.clone());
    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        prompt::<(), _>(move |_| {
            drop(guard);
            panic!("foobar");
        })
    }));
    assert!(result.is_err());
    assert!(hit.get());
    panic::resume_unwind(result.unwrap_err());
}

#[test]
fn multishot_invocations_are_independent() {
    let out: i32 = prompt(|p| {
        let mut local = 0;
        let b: bool = p.yield_multi(|k| {
            let first = k.resume(true);
            let second = k.resume(false);
            first + second
        });
        local += 1;
        // Every invocation starts from the snapshot taken at the yield.
        assert_eq!(local, 1);
        if b {
            1
        } else {
            2
        }
    });
    assert_eq!(out, 3);
}

#[test]
fn multishot_drop_without_invoking_unwinds() {
    let hit = Rc::new(Cell::new(false));
    let hit2 = hit.clone();
    let out: i32 = prompt(move |p| {
        let guard = SetOnDrop(hit2);
        let v: i32 = p.yield_multi(|k| {
            drop(k);
            -3
        });
        drop(guard);
        v
    });
    assert_eq!(out, -3);
    assert!(hit.get());
}

#[test]
fn resume_tail_reuses_the_entry_frame() {
    let out: i32 = prompt(|p| {
        let mut acc = 0;
        for i in 0..100 {
            acc += p.yield_with(|k| k.resume_tail(i));
        }
        acc
    });
    assert_eq!(out, (0..100).sum());
}

#[test]
fn resume_tail_with_large_values() {
    let out: String = prompt(|p| {
        let s: String = p.yield_with(|k| k.resume_tail("tail".to_string()));
        s + "!"
    });
    assert_eq!(out, "tail!");
}

#[test]
fn prompts_reuse_cached_stacks() {
    for i in 0..64 {
        let out: i32 = prompt(move |_| i);
        assert_eq!(out, i);
    }
}

#[test]
fn stack_growth() {
    let out: i32 = prompt(|_| {
        fn recurse(i: u32, p: &mut [u8; 10000]) {
            unsafe {
                // Ensure the stack allocation isn't optimized away.
                ptr::read_volatile(&p);
            }
            if i > 0 {
                recurse(i - 1, &mut [0; 10000]);
            }
        }

        // Use ~500KB of the gstack.
        recurse(50, &mut [0; 10000]);
        1
    });
    assert_eq!(out, 1);
}
