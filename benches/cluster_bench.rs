use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::net::{IpAddr, Ipv4Addr};
use tokio::runtime::Runtime;

use swarmkeeper::bootstrap::{first_success, CandidateQueue};
use swarmkeeper::error::ClusterError;
use swarmkeeper::monitor::{classify_resources, Thresholds};
use swarmkeeper::types::ResourceSample;

fn peers(count: u8) -> Vec<IpAddr> {
    (1..=count).map(|i| IpAddr::V4(Ipv4Addr::new(10, 0, 0, i))).collect()
}

pub fn candidate_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("candidates");
    let rt = Runtime::new().unwrap();
    let candidates = peers(200);
    let winner = *candidates.last().unwrap();

    group.bench_function("first_success_last_of_200", |b| {
        b.iter(|| {
            rt.block_on(async {
                let selection = first_success(CandidateQueue::new(candidates.clone()), |peer| async move {
                    if peer == winner {
                        Ok(peer)
                    } else {
                        Err(ClusterError::transient("unreachable"))
                    }
                })
                .await;
                black_box(selection.winner)
            })
        })
    });

    group.finish();
}

fn classify_benchmark(c: &mut Criterion) {
    let thresholds = Thresholds::default();
    let sample = ResourceSample::new(Some(93.0), Some(97.0), Some(40.0));

    c.bench_function("classify_resources", |b| {
        b.iter(|| black_box(classify_resources(black_box(&sample), &thresholds)))
    });
}

criterion_group!(benches, candidate_benchmark, classify_benchmark);
criterion_main!(benches);
