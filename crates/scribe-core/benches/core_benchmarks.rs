//! Core performance benchmarks
//!
//! Benchmarks for the per-record work done on every append and every
//! in-memory observation update:
//! - Search text folding
//! - Metadata flattening and encoding
//! - Query evaluation against records
//!
//! Run with: cargo bench -p scribe-core

use chrono::Utc;
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use scribe_core::metadata;
use scribe_core::search::fold;
use scribe_core::{Level, Metadata, MetadataValue, NewRecord, Query, RecordId};

fn sample_metadata() -> Metadata {
    let mut nested = Metadata::new();
    nested.insert("host".into(), "edge-01.example".into());
    nested.insert("region".into(), "eu-west".into());

    let mut metadata = Metadata::new();
    metadata.insert("user".into(), "Zoë Ångström".into());
    metadata.insert("ids".into(), vec!["1", "2", "3"].into());
    metadata.insert("request".into(), MetadataValue::Map(nested));
    metadata.insert("attempt".into(), MetadataValue::stringable(3));
    metadata
}

// ============================================================================
// Search Text Benchmarks
// ============================================================================

fn bench_fold(c: &mut Criterion) {
    let mut group = c.benchmark_group("fold");

    let ascii = "Connection reset by peer while reading response headers";
    group.throughput(Throughput::Bytes(ascii.len() as u64));
    group.bench_function("ascii", |b| b.iter(|| fold(black_box(ascii))));

    let accented = "Échec de la résolution DNS pour l'hôte «café.example»";
    group.throughput(Throughput::Bytes(accented.len() as u64));
    group.bench_function("accented", |b| b.iter(|| fold(black_box(accented))));

    group.finish();
}

// ============================================================================
// Metadata Benchmarks
// ============================================================================

fn bench_metadata(c: &mut Criterion) {
    let mut group = c.benchmark_group("metadata");
    let sample = sample_metadata();
    let encoded = metadata::encode(&sample).unwrap();

    group.bench_function("flatten", |b| b.iter(|| metadata::flatten(black_box(&sample))));
    group.bench_function("encode", |b| b.iter(|| metadata::encode(black_box(&sample))));
    group.bench_function("decode", |b| b.iter(|| metadata::decode(black_box(&encoded))));

    group.finish();
}

// ============================================================================
// Query Benchmarks
// ============================================================================

fn bench_query_matches(c: &mut Criterion) {
    let mut group = c.benchmark_group("query_matches");
    let record = NewRecord::new("network", Level::Error, "connection reset by peer")
        .with_metadata(sample_metadata())
        .into_record(RecordId(1), Utc::now());

    let unfiltered = Query::all();
    let by_level = Query::all().with_minimum_level(Level::Error);
    let label_hit = Query::all().with_search_term("NETWORK");
    let metadata_hit = Query::all().with_search_term("angstrom");
    let miss = Query::all().with_search_term("timeout");

    group.bench_function("unfiltered", |b| b.iter(|| unfiltered.matches(black_box(&record))));
    group.bench_function("by_level", |b| b.iter(|| by_level.matches(black_box(&record))));
    group.bench_function("label_hit", |b| b.iter(|| label_hit.matches(black_box(&record))));
    group.bench_function("metadata_hit", |b| {
        b.iter(|| metadata_hit.matches(black_box(&record)))
    });
    group.bench_function("miss", |b| b.iter(|| miss.matches(black_box(&record))));

    group.finish();
}

criterion_group!(benches, bench_fold, bench_metadata, bench_query_matches);
criterion_main!(benches);
