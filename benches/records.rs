use criterion::{black_box, criterion_group, criterion_main, Criterion};

use deferlog::sinks::{Sink, SinkError};
use deferlog::{Priority, Record};

/// Discards everything; isolates the pipeline cost from sink I/O.
struct NullSink;

impl Sink for NullSink {
    fn is_enabled(&self, _priority: Priority) -> bool {
        true
    }

    fn write(&mut self, record: &Record) -> Result<(), SinkError> {
        black_box(record.message());
        Ok(())
    }
}

fn encode_small_record(c: &mut Criterion) {
    c.bench_function("encode_small_record", |b| {
        b.iter(|| {
            let mut record = Record::new(Priority::Debug, "bench.rs", 1, "bench", Some("{} {} {}"));
            record
                .append(black_box(42i32))
                .append(black_box("some text"))
                .append(black_box(2.5f64));
            black_box(record);
        });
    });
}

fn render_small_record(c: &mut Criterion) {
    let mut record = Record::new(Priority::Debug, "bench.rs", 1, "bench", Some("{} {} {}"));
    record.append(42i32).append("some text").append(2.5f64);
    c.bench_function("render_small_record", |b| {
        b.iter(|| black_box(record.message()));
    });
}

fn log_through_the_pipeline(c: &mut Criterion) {
    deferlog::initialize(vec![Box::new(NullSink)]);
    c.bench_function("log_through_the_pipeline", |b| {
        b.iter(|| {
            deferlog::log(Priority::Info, "bench.rs", 1, "bench", "value {}", |record| {
                record.append(black_box(7u64));
            });
        });
        deferlog::flush();
    });
    deferlog::shutdown();
}

criterion_group!(
    benches,
    encode_small_record,
    render_small_record,
    log_through_the_pipeline
);
criterion_main!(benches);
