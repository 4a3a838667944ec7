use criterion::{black_box, criterion_group, criterion_main, Criterion};
use multiprompt::prompt::prompt;
use multiprompt::{find, prompt_handler, yield_to, Effect, Kind};

struct State;
impl Effect for State {
    type Data = i32;
    type Answer = i32;
}
static STATE: Kind<State> = Kind::new("state");

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

fn prompt_call(c: &mut Criterion) {
    c.bench_function("prompt_call", |b| {
        b.iter(|| prompt::<i32, _>(|_| black_box(1)))
    });
}

fn yield_resume(c: &mut Criterion) {
    c.bench_function("yield_resume", |b| {
        b.iter(|| prompt::<i32, _>(|p| p.yield_with(|k| k.resume(black_box(1)))))
    });
}

fn state_roundtrip(c: &mut Criterion) {
    c.bench_function("state_roundtrip", |b| {
        b.iter(|| {
            prompt_handler(&STATE, 0, || {
                put(black_box(7));
                get()
            })
        })
    });
}

criterion_group!(benches, prompt_call, yield_resume, state_roundtrip);
criterion_main!(benches);
