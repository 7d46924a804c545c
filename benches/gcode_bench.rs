// Benchmark for G-code parsing, encoding and preprocessing
// Run with: cargo bench

use criterion::{criterion_group, criterion_main, Criterion};
use microprint_rs::connection::{encode, WireEncoding};
use microprint_rs::gcode::Program;
use microprint_rs::parameters::PrintParameters;
use microprint_rs::preprocess::Preprocessor;

fn sample_program() -> String {
    let mut gcode = String::from("G90\nM104 S215\n;LAYER:0\n");
    for i in 0..10_000 {
        let layer = i / 1000;
        if i % 1000 == 0 && i > 0 {
            gcode.push_str(&format!(";LAYER:{}\nG1 Z{:.1}\n", layer, 0.3 + layer as f64 * 0.2));
        }
        let (x, y, e) = ((i % 50) + 10, (i % 30) + 10, i as f64 * 0.05);
        gcode.push_str(&format!("G1 X{} Y{} E{:.3} F1500 ; perimeter\n", x, y, e));
    }
    gcode
}

fn bench_parse(c: &mut Criterion) {
    let gcode = sample_program();
    c.bench_function("parse 10k G1 lines", |b| {
        b.iter(|| {
            let program = Program::parse(&gcode).unwrap();
            assert!(program.len() > 10_000);
        });
    });
}

fn bench_encode(c: &mut Criterion) {
    let program = Program::parse(&sample_program()).unwrap();
    c.bench_function("binary encode 10k lines", |b| {
        b.iter(|| {
            let bytes: usize = program.lines().iter().map(|code| encode(code, WireEncoding::Binary).len()).sum();
            assert!(bytes > 0);
        });
    });
}

fn bench_preprocess(c: &mut Criterion) {
    let program = Program::parse(&sample_program()).unwrap();
    let params = PrintParameters { use_wave_bonding: true, ..PrintParameters::default() };
    let preprocessor = Preprocessor::new(params);
    c.bench_function("preprocess 10k lines with wave bonding", |b| {
        b.iter(|| {
            let processed = preprocessor.process(&program).unwrap();
            assert!(processed.len() >= program.len());
        });
    });
}

criterion_group!(benches, bench_parse, bench_encode, bench_preprocess);
criterion_main!(benches);
