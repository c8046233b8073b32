use criterion::{black_box, criterion_group, criterion_main, Criterion};

use bytecode::BytecodeBuilder;
use heap::MemoryConfig;
use object::Value;
use vm::{alloc, dispatch, primitives, special, Runtime};

fn runtime_with_plus() -> Runtime {
    let mut rt = special::bootstrap(MemoryConfig::default());
    let mut b = BytecodeBuilder::new();
    b.push_argument(0);
    b.push_argument(1);
    b.do_primitive(2, primitives::numbers::ADD);
    b.stack_return();
    let small_int_class = rt.globals.small_int_class;
    special::install_method(&mut rt, small_int_class, "+", &[], b.as_bytes(), 0, 4)
        .expect("install +");
    rt
}

fn bench_send(c: &mut Criterion) {
    let mut rt = runtime_with_plus();
    let selector = rt.globals.binary_selectors[2];
    let nil = rt.globals.nil;

    c.bench_function("send smallint +", |b| {
        b.iter(|| {
            let arguments = alloc::new_array_of(
                &mut rt,
                &[Value::from_int(black_box(1)), Value::from_int(black_box(2))],
            )
            .expect("args");
            dispatch::send_message(&mut rt, nil, selector, arguments, None)
                .expect("send")
        })
    });
}

fn bench_lookup(c: &mut Criterion) {
    let rt = runtime_with_plus();
    let selector = rt.globals.binary_selectors[2];

    c.bench_function("lookup smallint +", |b| {
        b.iter(|| {
            dispatch::lookup_method(
                &rt.globals,
                black_box(selector),
                rt.globals.small_int_class,
            )
        })
    });
}

criterion_group!(benches, bench_send, bench_lookup);
criterion_main!(benches);
