use std::sync::Arc;
use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use serde_json::json;

use featurekit::{
    config::SandboxConfig,
    model::{Script, ScriptLanguage},
    script::{DenyHttp, ScriptSandbox},
};

const USER_CHECK: &str = r#"
function isActive(context, enabled, disabled, http) {
    if (context.user.email.endsWith("@acme.test") && context.user.age >= 18) {
        enabled();
    } else {
        disabled();
    }
}
"#;

const LOOP: &str = r#"
let total = 0
let i = 0
while (i < context.n) {
    total = total + i % 7
    i = i + 1
}
if (total > 100) { enabled() } else { disabled() }
"#;

fn script(id: &str, source: &str) -> Script {
    Script {
        id: id.to_owned(),
        language: ScriptLanguage::Js,
        source: source.to_owned(),
    }
}

fn criterion_benchmark(c: &mut Criterion) {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap();
    let sandbox = ScriptSandbox::with_http(SandboxConfig::default(), Arc::new(DenyHttp));
    let timeout = Duration::from_secs(1);

    {
        let mut group = c.benchmark_group("user-check");
        group.throughput(Throughput::Elements(1));
        let user_check = script("user-check", USER_CHECK);
        let compiled = sandbox.compile(&user_check).unwrap();
        let context = json!({"user": {"email": "ann@acme.test", "age": 31}});
        group.bench_function("compile_cached", |b| {
            b.iter(|| sandbox.compile(black_box(&user_check)).unwrap())
        });
        group.bench_function("evaluate", |b| {
            b.to_async(&runtime).iter(|| {
                sandbox.evaluate(black_box(&compiled), black_box(&context), timeout)
            })
        });
        group.finish();
    }

    {
        let mut group = c.benchmark_group("loop");
        group.throughput(Throughput::Elements(1));
        let compiled = sandbox.compile(&script("loop", LOOP)).unwrap();
        let context = json!({"n": 1000});
        group.bench_function("evaluate", |b| {
            b.to_async(&runtime).iter(|| {
                sandbox.evaluate(black_box(&compiled), black_box(&context), timeout)
            })
        });
        group.finish();
    }
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
