use criterion::{black_box, criterion_group, criterion_main, Criterion};
use regex::Regex;
use rendergun::{
    BlockEvaluator, BlockedHostSet, HostsSource, RenderRequest, RenderResult, RequestDescriptor,
    ResourceKind, ResultCache,
};
use std::time::Duration;
use tokio::runtime::Runtime;

#[cfg(feature = "integration_benchmarks")]
use rendergun::{Config, WorkerPool};

// Fast settings for all benchmarks
fn configure_fast_group(group: &mut criterion::BenchmarkGroup<criterion::measurement::WallTime>) {
    group.warm_up_time(Duration::from_millis(500));
    group.measurement_time(Duration::from_millis(500));
    group.sample_size(20);
}

// === UNIT BENCHMARKS ===

fn benchmark_url_validation(c: &mut Criterion) {
    let mut group = c.benchmark_group("url_validation");
    configure_fast_group(&mut group);

    let test_urls = vec![
        "https://example.com",
        "http://example.com/path?query=1#fragment",
        "http://localhost:3000/render",
        "ftp://example.com",
        "invalid-url",
    ];

    group.bench_function("validate", |b| {
        b.iter(|| {
            for url in &test_urls {
                black_box(rendergun::is_valid_url(*url));
            }
        });
    });

    group.finish();
}

fn benchmark_hosts_parsing(c: &mut Criterion) {
    let mut group = c.benchmark_group("hosts_parsing");
    configure_fast_group(&mut group);

    let hosts: String = (0..10_000)
        .map(|i| format!("0.0.0.0 ads{i}.example.net\n"))
        .collect();

    group.bench_function("parse_10k", |b| {
        b.iter(|| black_box(BlockedHostSet::parse(&hosts)));
    });

    group.finish();
}

fn benchmark_policy_decisions(c: &mut Criterion) {
    let mut group = c.benchmark_group("request_policy");
    configure_fast_group(&mut group);

    let hosts: String = (0..10_000)
        .map(|i| format!("0.0.0.0 ads{i}.example.net\n"))
        .collect();
    let evaluator = BlockEvaluator::new(
        BlockedHostSet::new(HostsSource::Inline(hosts)),
        Some(Regex::new(r"\.woff2?$").unwrap()),
    );
    let mut request = RenderRequest::new("https://example.com/");
    request.abort_request_pattern = Some("analytics|tracker".to_string());
    request.block_ads = true;
    let policy = Runtime::new()
        .unwrap()
        .block_on(evaluator.policy_for(&request))
        .unwrap();

    let requests = [
        RequestDescriptor {
            url: "https://example.com/",
            resource: ResourceKind::Document,
            is_main_document: true,
        },
        RequestDescriptor {
            url: "https://example.com/logo.png",
            resource: ResourceKind::Image,
            is_main_document: false,
        },
        RequestDescriptor {
            url: "https://cdn.example.com/analytics.js",
            resource: ResourceKind::Script,
            is_main_document: false,
        },
        RequestDescriptor {
            url: "https://ads42.example.net/banner.js",
            resource: ResourceKind::Script,
            is_main_document: false,
        },
    ];

    group.bench_function("decide", |b| {
        b.iter(|| {
            for request in &requests {
                black_box(policy.decide(request));
            }
        });
    });

    group.finish();
}

fn benchmark_cache_operations(c: &mut Criterion) {
    let mut group = c.benchmark_group("result_cache");
    configure_fast_group(&mut group);

    let body = "<html><body>".to_string() + &"x".repeat(16 * 1024) + "</body></html>";
    let cache = ResultCache::new(1024 * 1024, Duration::from_secs(1800));
    for i in 0..32 {
        cache.set(format!("https://example.com/{i}"), RenderResult::new(200, body.clone()));
    }

    group.bench_function("get_hit", |b| {
        b.iter(|| black_box(cache.get("https://example.com/7")));
    });

    group.bench_function("get_miss", |b| {
        b.iter(|| black_box(cache.get("https://example.com/missing")));
    });

    let mut n = 0usize;
    group.bench_function("set_with_eviction", |b| {
        b.iter(|| {
            n += 1;
            cache.set(format!("https://example.com/new/{n}"), RenderResult::new(200, body.clone()));
        });
    });

    group.finish();
}

fn benchmark_format_utilities(c: &mut Criterion) {
    let mut group = c.benchmark_group("format_utilities");
    configure_fast_group(&mut group);

    group.bench_function("format_duration", |b| {
        b.iter(|| black_box(rendergun::format_duration(Duration::from_millis(12_345))));
    });

    group.bench_function("format_bytes", |b| {
        b.iter(|| black_box(rendergun::format_bytes(104_857_600)));
    });

    group.finish();
}

// === INTEGRATION BENCHMARKS (require Chrome) ===

#[cfg(feature = "integration_benchmarks")]
fn benchmark_override_render(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("override_render");
    configure_fast_group(&mut group);

    let pool = rt
        .block_on(WorkerPool::launch(Config {
            pool_size: 1,
            ..Default::default()
        }))
        .unwrap();

    let mut n = 0usize;
    group.bench_function("single_page", |b| {
        b.iter(|| {
            n += 1;
            rt.block_on(async {
                // Distinct URLs keep the cache out of the measurement.
                let mut request = RenderRequest::new(format!("https://example.com/bench/{n}"));
                request.content =
                    Some("<html><body><h1>Bench</h1><script>1</script></body></html>".to_string());
                black_box(pool.render(request).await.is_ok());
            })
        });
    });

    rt.block_on(pool.close());
    group.finish();
}

// === BENCHMARK GROUPS ===

criterion_group!(
    unit_benches,
    benchmark_url_validation,
    benchmark_hosts_parsing,
    benchmark_policy_decisions,
    benchmark_cache_operations,
    benchmark_format_utilities,
);

#[cfg(feature = "integration_benchmarks")]
criterion_group!(integration_benches, benchmark_override_render);

#[cfg(feature = "integration_benchmarks")]
criterion_main!(unit_benches, integration_benches);

#[cfg(not(feature = "integration_benchmarks"))]
criterion_main!(unit_benches);
