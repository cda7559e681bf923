// Benchmark for the line parser.
// Run with: cargo bench

use criterion::{Criterion, criterion_group, criterion_main};
use gantry::gcode::parser::parse_line;

fn bench_parse_moves(c: &mut Criterion) {
    let mut lines = Vec::new();
    for i in 0..10_000 {
        lines.push(format!("G1 X{}.25 Y{} E0.0314 F1500", i, i * 2));
    }
    c.bench_function("parse 10k G1 lines", |b| {
        b.iter(|| {
            let mut count = 0;
            for line in &lines {
                if parse_line(line).unwrap().is_some() {
                    count += 1;
                }
            }
            assert_eq!(count, 10_000);
        });
    });
}

fn bench_parse_checksummed(c: &mut Criterion) {
    let mut lines = Vec::new();
    for i in 0..10_000 {
        let body = format!("N{} G1 X{} Y{}", i, i, i);
        let checksum = body.bytes().fold(0u8, |a, b| a ^ b);
        lines.push(format!("{body}*{checksum}"));
    }
    c.bench_function("parse 10k checksummed lines", |b| {
        b.iter(|| {
            for line in &lines {
                parse_line(line).unwrap();
            }
        });
    });
}

criterion_group!(benches, bench_parse_moves, bench_parse_checksummed);
criterion_main!(benches);
