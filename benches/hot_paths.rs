use criterion::{black_box, criterion_group, criterion_main, Criterion};

use logship::aggregate::Aggregator;
use logship::geo::GeoDb;
use logship::record::{Record, Value};
use logship::schema::Schema;
use logship::transform::{tokenize, Transformer};

const ACCESS_LINE: &str =
    "1.2.3.4 frontend [10/Oct/2020:13:55:36 +0000] \"GET https://example.com/index.html\" 200 512";

const ACCESS_SCHEMA: &str = "nginx(6, 3, 0) {
    src: [ip, 1];
    host: [string, 1];
    ts: [time_local, 1];
    req: [request, 1];
    code: [status, 1];
    body_bytes_sent: [int64, 1];
}";

const AGG_SCHEMA: &str = "agg(3, 0, 0) {
    time: [int64, 1];
    bytes: [int64, 1];
    host: [string, 1];
} (bytes, time, 60) [host]";

/// One-entry geo database covering all of IPv4.
fn bench_geo_db() -> GeoDb {
    let tuple = b"CN\tZJ\tHZ\t-\tUN";

    let mut records = Vec::new();
    records.extend_from_slice(&u32::MAX.to_be_bytes());
    records.extend_from_slice(&1028u32.to_le_bytes()[..3]);
    records.push(tuple.len() as u8);

    let mut index = vec![0u8; 256 * 4];
    index.extend_from_slice(&records);
    index.extend_from_slice(&vec![0u8; 1028]);

    let mut db = Vec::new();
    db.extend_from_slice(&(index.len() as u32).to_be_bytes());
    db.extend_from_slice(&index);
    db.extend_from_slice(tuple);

    GeoDb::from_bytes(db).expect("bench geo db")
}

fn bench_tokenize(c: &mut Criterion) {
    c.bench_function("tokenize_access_line", |b| {
        b.iter(|| tokenize(black_box(ACCESS_LINE), 6, 3));
    });
}

fn bench_transform(c: &mut Criterion) {
    let schema = Schema::parse(ACCESS_SCHEMA).expect("schema");
    let tokens = tokenize(ACCESS_LINE, schema.field_number, schema.time_index).expect("tokens");
    let mut geo = bench_geo_db();
    let mut transformer = Transformer::new();

    c.bench_function("transform_access_line", |b| {
        b.iter(|| transformer.transform(black_box(&tokens), &schema, &mut geo));
    });
}

fn bench_serialize(c: &mut Criterion) {
    let schema = Schema::parse(ACCESS_SCHEMA).expect("schema");
    let tokens = tokenize(ACCESS_LINE, schema.field_number, schema.time_index).expect("tokens");
    let mut geo = bench_geo_db();
    let record = Transformer::new()
        .transform(&tokens, &schema, &mut geo)
        .expect("record");

    c.bench_function("serialize_record", |b| {
        b.iter(|| black_box(&record).to_ndjson());
    });
}

fn bench_aggregate_insert(c: &mut Criterion) {
    let mut schema = Schema::parse(AGG_SCHEMA).expect("schema");
    schema.normalize();
    let agg = schema.aggregation.clone().expect("aggregation");

    c.bench_function("aggregate_insert_merge", |b| {
        let mut aggregator = Aggregator::new(&schema, &agg, "bench.log");
        let mut ts = 0i64;
        b.iter(|| {
            ts += 1;
            let mut rec = Record::new();
            rec.set("time", Value::Int64(ts));
            rec.set("bytes", Value::Int64(512));
            rec.set("host", Value::Str("example.com".to_string()));
            aggregator.insert(black_box(rec));
        });
    });
}

criterion_group!(
    benches,
    bench_tokenize,
    bench_transform,
    bench_serialize,
    bench_aggregate_insert
);
criterion_main!(benches);
