//! Criterion benchmark for the document codec hot path: the encode/decode
//! pair every published event and RPC envelope goes through.

use std::collections::BTreeMap;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use serde::{Deserialize, Serialize};

use omnibus::Document;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Part {
    label: String,
    magnitude: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Composite {
    attributes: BTreeMap<String, String>,
    parts: Vec<Part>,
    flags: Vec<u32>,
}

fn sample() -> Composite {
    Composite {
        attributes: (0..8)
            .map(|n| (format!("key-{n}"), format!("value-{n}")))
            .collect(),
        parts: (0..16)
            .map(|n| Part {
                label: format!("part-{n}"),
                magnitude: n,
            })
            .collect(),
        flags: (0..32).collect(),
    }
}

fn bench_codec(c: &mut Criterion) {
    let value = sample();
    let doc = Document::encode(&value).unwrap();

    c.bench_function("encode_composite", |b| {
        b.iter(|| Document::encode(black_box(&value)).unwrap())
    });

    c.bench_function("decode_composite", |b| {
        b.iter(|| black_box(&doc).decode::<Composite>().unwrap())
    });

    c.bench_function("round_trip_composite", |b| {
        b.iter(|| {
            Document::encode(black_box(&value))
                .unwrap()
                .decode::<Composite>()
                .unwrap()
        })
    });
}

criterion_group!(benches, bench_codec);
criterion_main!(benches);
