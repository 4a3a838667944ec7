use std::cell::{Cell, RefCell};
use std::rc::Rc;

use crate::{
    find, finally, linear_handler, mask, myield_to, prompt_handler, top, under, unwind_to,
    yield_to, Effect, Kind,
};

struct State;
impl Effect for State {
    type Data = i32;
    type Answer = i32;
}
static STATE: Kind<State> = Kind::new("state");

struct Exn;
impl Effect for Exn {
    type Data = ();
    type Answer = i32;
}
static EXN: Kind<Exn> = Kind::new("exn");

struct Choice;
impl Effect for Choice {
    type Data = ();
    type Answer = Vec<i32>;
}
static CHOICE: Kind<Choice> = Kind::new("choice");

struct Ask;
impl Effect for Ask {
    type Data = i32;
    type Answer = i32;
}
static ASK: Kind<Ask> = Kind::new("ask");

struct Fmt;
impl Effect for Fmt {
    type Data = ();
    type Answer = String;
}
static FMT: Kind<Fmt> = Kind::new("fmt");

fn get() -> i32 {
    yield_to(find(&STATE).unwrap(), |k, data| k.resume(unsafe { *data }))
}

fn put(val: i32) -> i32 {
    yield_to(find(&STATE).unwrap(), move |k, data| unsafe {
        let prev = *data;
        *data = val;
        k.resume(prev)
    })
}

#[test]
fn trivial_handler_is_identity() {
    let out = prompt_handler(&STATE, 0, || 42);
    assert_eq!(out, 42);
}

#[test]
fn yield_then_resume_is_identity() {
    let out = prompt_handler(&STATE, 0, || {
        yield_to(find(&STATE).unwrap(), |k, _| k.resume(9))
    });
    assert_eq!(out, 9);
}

#[test]
fn state_effect() {
    let out = prompt_handler(&STATE, 0, || {
        put(7);
        let x = get();
        put(x + 1);
        get()
    });
    assert_eq!(out, 8);
}

#[test]
fn shadowing_finds_the_innermost() {
    let out = prompt_handler(&STATE, 1, || {
        prompt_handler(&STATE, 2, || {
            let h = find(&STATE).unwrap();
            unsafe { *h.data_ptr() }
        })
    });
    assert_eq!(out, 2);
}

#[test]
fn exception_effect_unwinds_the_inner_stack() {
    let cleaned = Rc::new(Cell::new(false));
    let cleaned2 = cleaned.clone();
    let out = prompt_handler(&EXN, (), move || {
        finally(
            move || cleaned2.set(true),
            || {
                let _: i32 = yield_to(find(&EXN).unwrap(), |k, _| {
                    k.resume_drop();
                    -1
                });
                unreachable!()
            },
        )
    });
    assert_eq!(out, -1);
    assert!(cleaned.get());
}

#[test]
fn choice_effect_resumes_twice() {
    let out = prompt_handler(&CHOICE, (), || {
        let b = myield_to(find(&CHOICE).unwrap(), |k, _| {
            let mut all = k.resume(true);
            all.extend(k.resume(false));
            all
        });
        vec![if b { 1 } else { 2 }]
    });
    assert_eq!(out, vec![1, 2]);
}

#[test]
fn choice_effect_across_a_nested_prompt() {
    let out = prompt_handler(&CHOICE, (), || {
        let x = prompt_handler(&EXN, (), || {
            let b = myield_to(find(&CHOICE).unwrap(), |k, _| {
                let mut all = k.resume(true);
                all.extend(k.resume(false));
                all
            });
            if b {
                10
            } else {
                20
            }
        });
        vec![x]
    });
    assert_eq!(out, vec![10, 20]);
}

#[test]
fn multishot_drop_without_invoking_unwinds() {
    let cleaned = Rc::new(Cell::new(false));
    let cleaned2 = cleaned.clone();
    let out = prompt_handler(&CHOICE, (), move || {
        finally(
            move || cleaned2.set(true),
            || {
                let b = myield_to(find(&CHOICE).unwrap(), |k, _| {
                    k.resume_drop();
                    vec![9]
                });
                vec![if b { 1 } else { 2 }]
            },
        )
    });
    assert_eq!(out, vec![9]);
    assert!(cleaned.get());
}

#[test]
fn mask_reaches_the_outer_handler() {
    // The law: with two handlers of one kind installed, a find under
    // mask(_, 0) resolves to the second-innermost.
    let out = prompt_handler(&STATE, 1, || {
        prompt_handler(&STATE, 2, || {
            let h = mask(&STATE, 0, || find(&STATE).unwrap());
            unsafe { *h.data_ptr() }
        })
    });
    assert_eq!(out, 1);
}

#[test]
fn mask_from_level_guards_the_increment() {
    let out = prompt_handler(&STATE, 1, || {
        prompt_handler(&STATE, 2, || {
            mask(&STATE, 1, || {
                let h = find(&STATE).unwrap();
                unsafe { *h.data_ptr() }
            })
        })
    });
    assert_eq!(out, 2);
}

#[test]
fn nested_masks_accumulate() {
    let out = prompt_handler(&STATE, 1, || {
        prompt_handler(&STATE, 2, || {
            let absent = mask(&STATE, 0, || mask(&STATE, 0, || find(&STATE).is_none()));
            assert!(absent);
            0
        })
    });
    assert_eq!(out, 0);
}

#[test]
fn masked_yield_reaches_the_outer_handler() {
    let out = prompt_handler(&STATE, 10, || {
        prompt_handler(&STATE, 20, || {
            mask(&STATE, 0, || {
                yield_to(find(&STATE).unwrap(), |k, data| k.resume(unsafe { *data }))
            })
        })
    });
    assert_eq!(out, 10);
}

#[test]
fn under_skips_the_handler_it_belongs_to() {
    let out = prompt_handler(&STATE, 1, || {
        prompt_handler(&STATE, 2, || {
            let inner = find(&STATE).unwrap();
            let outer = under(&STATE, || find(&STATE).unwrap());
            assert_ne!(inner, outer);
            unsafe { *outer.data_ptr() }
        })
    });
    assert_eq!(out, 1);
}

#[test]
fn under_with_no_outer_handler_finds_nothing() {
    let out = prompt_handler(&STATE, 1, || {
        assert!(under(&STATE, || find(&STATE)).is_none());
        0
    });
    assert_eq!(out, 0);
}

#[test]
fn linear_handler_is_found_and_read() {
    let mut data = 7;
    let got = linear_handler(&ASK, &mut data, || {
        let h = find(&ASK).unwrap();
        assert!(!h.is_prompt());
        unsafe { *h.data_ptr() }
    });
    assert_eq!(got, 7);
    assert!(find(&ASK).is_none());
}

#[test]
#[should_panic(expected = "without a prompt")]
fn yielding_to_a_linear_handler_panics() {
    let mut data = 0;
    linear_handler(&ASK, &mut data, || {
        let h = find(&ASK).unwrap();
        yield_to(h, |k, _| k.resume(0))
    });
}

#[test]
fn handler_is_invisible_during_its_own_yield() {
    let out = prompt_handler(&STATE, 5, || {
        yield_to(find(&STATE).unwrap(), |_k, _| {
            // The handler observes itself popped while handling.
            assert!(find(&STATE).is_none());
            11
        })
    });
    assert_eq!(out, 11);
}

#[test]
fn shadow_top_is_restored_after_a_yield() {
    let out = prompt_handler(&STATE, 0, || {
        let before = top();
        let x: i32 = yield_to(find(&STATE).unwrap(), |k, _| k.resume(1));
        assert!(top() == before);
        x
    });
    assert_eq!(out, 1);
}

#[test]
fn resume_site_handlers_are_spliced_below_the_yielder() {
    let out = prompt_handler(&STATE, 0, || {
        let x: i32 = yield_to(find(&STATE).unwrap(), |k, _| {
            let mut ambient = 123;
            linear_handler(&ASK, &mut ambient, || k.resume(1))
        });
        // The chain now continues into the handlers live at the resume
        // site.
        let seen = find(&ASK).map(|h| unsafe { *h.data_ptr() });
        assert_eq!(seen, Some(123));
        x
    });
    assert_eq!(out, 1);
}

#[test]
fn handler_chain_stays_acyclic() {
    fn chain_len() -> usize {
        let mut len = 0;
        let mut frame = top();
        while let Some(current) = frame {
            len += 1;
            assert!(len < 1000, "handler chain does not terminate");
            frame = current.parent();
        }
        len
    }

    let out = prompt_handler(&STATE, 0, || {
        let baseline = chain_len();
        let _: i32 = yield_to(find(&STATE).unwrap(), |k, _| k.resume(1));
        assert_eq!(chain_len(), baseline);
        let _: i32 = yield_to(find(&STATE).unwrap(), |k, _| k.resume(1));
        assert_eq!(chain_len(), baseline);
        0
    });
    assert_eq!(out, 0);
}

#[test]
fn unwind_across_three_prompts_runs_finalizers_in_order() {
    struct Outer;
    impl Effect for Outer {
        type Data = ();
        type Answer = i32;
    }
    static OUTER: Kind<Outer> = Kind::new("outer");
    struct Mid;
    impl Effect for Mid {
        type Data = ();
        type Answer = i32;
    }
    static MID: Kind<Mid> = Kind::new("mid");
    struct Inner;
    impl Effect for Inner {
        type Data = ();
        type Answer = i32;
    }
    static INNER: Kind<Inner> = Kind::new("inner");

    let order = Rc::new(RefCell::new(Vec::new()));
    let o1 = order.clone();
    let o2 = order.clone();
    let o3 = order.clone();

    let out = prompt_handler(&OUTER, (), move || {
        finally(
            move || o1.borrow_mut().push("outer"),
            move || {
                prompt_handler(&MID, (), move || {
                    finally(
                        move || o2.borrow_mut().push("mid"),
                        move || {
                            prompt_handler(&INNER, (), move || {
                                finally(
                                    move || o3.borrow_mut().push("inner"),
                                    || {
                                        let _: i32 =
                                            yield_to(find(&OUTER).unwrap(), |k, _| {
                                                k.resume_unwind();
                                                -1
                                            });
                                        unreachable!()
                                    },
                                )
                            })
                        },
                    )
                })
            },
        )
    });
    assert_eq!(out, -1);
    assert_eq!(*order.borrow(), ["inner", "mid", "outer"]);
}

#[test]
fn unwind_to_runs_with_handler_data_live() {
    let out = prompt_handler(&STATE, 41, || {
        let h = find(&STATE).unwrap();
        unwind_to(h, |data| unsafe { *data } + 1)
    });
    assert_eq!(out, 42);
}

#[test]
fn unwind_to_crosses_inner_prompts() {
    let cleaned = Rc::new(Cell::new(false));
    let cleaned2 = cleaned.clone();
    let out = prompt_handler(&STATE, 1, move || {
        let inner: i32 = prompt_handler(&EXN, (), move || {
            finally(
                move || cleaned2.set(true),
                || {
                    let h = find(&STATE).unwrap();
                    unwind_to(h, |data| unsafe { *data } + 9)
                },
            )
        });
        inner + 100
    });
    assert_eq!(out, 10);
    assert!(cleaned.get());
}

#[test]
fn tail_resumptive_state_handler() {
    let count = 50;
    let out = prompt_handler(&STATE, 0, move || {
        let mut total = 0;
        for i in 1..=count {
            total += yield_to(find(&STATE).unwrap(), move |k, data| unsafe {
                *data += i;
                k.resume_tail(*data)
            });
        }
        let final_state = get();
        assert_eq!(final_state, (1..=count).sum::<i32>());
        total
    });
    let expected: i32 = (1..=count).map(|i| (1..=i).sum::<i32>()).sum();
    assert_eq!(out, expected);
}

#[test]
fn large_answers_cross_the_boundary() {
    let out = prompt_handler(&FMT, (), || {
        let greeting: String =
            yield_to(find(&FMT).unwrap(), |k, _| k.resume("hello".to_string()));
        format!("{} world", greeting)
    });
    assert_eq!(out, "hello world");
}

#[test]
fn kinds_are_distinct_identities() {
    static OTHER_STATE: Kind<State> = Kind::new("state");
    let out = prompt_handler(&STATE, 1, || {
        assert!(find(&OTHER_STATE).is_none());
        let h = top().unwrap();
        assert_eq!(h.kind_name(), "state");
        assert!(h.downcast(&STATE).is_some());
        assert!(h.downcast(&OTHER_STATE).is_none());
        0
    });
    assert_eq!(out, 0);
}

#[test]
fn finally_runs_on_normal_exit_too() {
    let hit = Rc::new(Cell::new(false));
    let hit2 = hit.clone();
    let out = finally(move || hit2.set(true), || 3);
    assert_eq!(out, 3);
    assert!(hit.get());
}
