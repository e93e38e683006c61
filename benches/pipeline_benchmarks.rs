/// Mediation overhead benchmarks
///
/// - Empty pipeline: cost of the transaction wrapper alone
/// - Pass-through chains of increasing length
/// - Wire framing of a request call
use async_trait::async_trait;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use http_mediator::config::HostConfig;
use http_mediator::error::Result;
use http_mediator::plugin::{
    Capabilities, HttpRequest, HttpResponse, Metadata, Plugin, PluginManager, Upstream,
};
use http_mediator::plugins::PassthroughPlugin;
use http_mediator::server::wire::{self, Call, Frame};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

struct OkUpstream;

#[async_trait]
impl Upstream for OkUpstream {
    async fn forward(&self, request: HttpRequest) -> Result<HttpResponse> {
        Ok(HttpResponse::new(200).with_body(request.body))
    }
}

fn sample_request() -> HttpRequest {
    HttpRequest::new("POST", "https://api.example.com/v1/orders?page=2")
        .with_header("Content-Type", "application/json")
        .with_header("Authorization", "Bearer abc")
        .with_body(vec![b'x'; 1024])
}

fn bench_pipeline(c: &mut Criterion) {
    let mut group = c.benchmark_group("Pipeline");
    let rt = tokio::runtime::Runtime::new().unwrap();

    for stages in [0usize, 1, 4, 8] {
        let pipeline = rt.block_on(async {
            let manager = PluginManager::new(HostConfig::default());
            for i in 0..stages {
                manager.register(Arc::new(NamedStage(i))).await.unwrap();
            }
            manager.configure_all().await;
            manager.pipeline().await
        });
        let cancel = CancellationToken::new();

        group.bench_with_input(BenchmarkId::new("execute", stages), &stages, |b, _| {
            b.to_async(&rt).iter(|| async {
                let response = pipeline
                    .execute(black_box(sample_request()), &OkUpstream, &cancel)
                    .await;
                black_box(response)
            });
        });
    }

    group.finish();
}

/// Pass-through stage; the index keeps names unique
struct NamedStage(usize);

#[async_trait]
impl Plugin for NamedStage {
    async fn get_metadata(&self) -> Result<Metadata> {
        Ok(Metadata::new(format!("stage-{}", self.0), "0.0.0"))
    }

    async fn get_capabilities(&self) -> Result<Capabilities> {
        PassthroughPlugin.get_capabilities().await
    }
}

fn bench_wire(c: &mut Criterion) {
    let mut group = c.benchmark_group("Wire");
    let frame = Frame::Call {
        id: 42,
        call: Call::HandleRequest(sample_request()),
    };
    let line = wire::encode(&frame).unwrap();

    group.bench_function("encode_request_call", |b| {
        b.iter(|| black_box(wire::encode(black_box(&frame)).unwrap()));
    });

    group.bench_function("decode_request_call", |b| {
        b.iter(|| black_box(wire::decode::<Frame>(black_box(&line)).unwrap()));
    });

    group.finish();
}

criterion_group!(benches, bench_pipeline, bench_wire);
criterion_main!(benches);
