use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use grinder_core::dedup::HostDeduplicator;
use grinder_core::resolve::{merge_group, resolve_claims};
use grinder_core::store::HostRecordStore;
use grinder_core::types::{
    Attribution, Confidence, CustomScripts, Engine, HostAttributes, HostKey, Query, RawHit,
};
use std::hint::black_box;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

fn queries(count: usize) -> Vec<Arc<Query>> {
    (0..count)
        .map(|i| {
            Arc::new(Query {
                vendor: format!("Vendor{}", i % 7),
                product: format!("Product{}", i),
                engine: if i % 2 == 0 { Engine::Shodan } else { Engine::Censys },
                query: format!("product:p{}", i),
                query_confidence: Confidence::ALL[i % 3],
                vendor_confidence: Confidence::ALL[(i / 3) % 3],
                scripts: CustomScripts::default(),
            })
        })
        .collect()
}

/// `hits` raw hits spread over `hosts` distinct addresses
fn synthetic_hits(hits: usize, hosts: usize) -> Vec<RawHit> {
    let queries = queries(12);
    (0..hits)
        .map(|i| {
            let host = (i % hosts) as u32;
            let query = &queries[i % queries.len()];
            RawHit {
                key: HostKey::new(IpAddr::V4(Ipv4Addr::from(0xC633_6400 + host)), 443),
                engine: query.engine,
                attributes: HostAttributes {
                    banner: Some(format!("banner {}", i % 5)),
                    ..Default::default()
                },
                query: Arc::clone(query),
            }
        })
        .collect()
}

fn benchmark_resolve_claims(c: &mut Criterion) {
    let claims: Vec<Attribution> = queries(12).iter().map(|q| Attribution::from_query(q)).collect();

    c.bench_function("resolve_claims_12", |b| {
        b.iter(|| resolve_claims(black_box(&claims)))
    });
}

fn benchmark_dedup_and_merge(c: &mut Criterion) {
    let mut group = c.benchmark_group("dedup_and_merge");

    for hits in [100, 1_000, 10_000].iter() {
        let raw = synthetic_hits(*hits, hits / 4);
        group.bench_with_input(BenchmarkId::from_parameter(hits), hits, |b, _| {
            b.iter(|| {
                let mut dedup = HostDeduplicator::new();
                dedup.extend(black_box(raw.clone()));
                let store = HostRecordStore::new();
                for host in dedup.finish() {
                    store.update(host.key, |existing| merge_group(existing, &host));
                }
                store.len()
            })
        });
    }

    group.finish();
}

fn benchmark_remerge_existing(c: &mut Criterion) {
    let mut dedup = HostDeduplicator::new();
    dedup.extend(synthetic_hits(2_000, 500));
    let groups = dedup.finish();
    let merged: Vec<_> = groups.iter().map(|g| merge_group(None, g)).collect();

    c.bench_function("remerge_500_hosts", |b| {
        b.iter(|| {
            groups
                .iter()
                .zip(&merged)
                .map(|(group, record)| merge_group(Some(black_box(record)), group))
                .filter(|r| r.ambiguous)
                .count()
        })
    });
}

criterion_group!(
    benches,
    benchmark_resolve_claims,
    benchmark_dedup_and_merge,
    benchmark_remerge_existing
);
criterion_main!(benches);
