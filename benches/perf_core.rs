use cosmos_apply::diagnostics::root_names;
use cosmos_apply::overlay::{FileSystem, Overlay};
use cosmos_apply::parse_response;
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::path::PathBuf;

fn synthetic_response(directive_count: usize) -> String {
    let mut out = String::from("Sure, here are the changes you asked for.\n\n");
    for i in 0..directive_count {
        match i % 4 {
            0 | 1 => out.push_str(&format!(
                "<write path=\"src/feature_{:03}/file_{:05}.ts\" description=\"Update {i}\">\n```ts\nexport const v{i} = {i};\n```\n</write>\n",
                i % 40,
                i
            )),
            2 => out.push_str(&format!(
                "Then move one file.\n<rename from=\"src/old_{i}.ts\" to=\"src/new_{i}.ts\"></rename>\n"
            )),
            _ => out.push_str(&format!("<delete path=\"src/unused_{i}.ts\" />\n")),
        }
    }
    out.push_str("<add-dependency packages=\"react zod\"></add-dependency>\n");
    out.push_str("<chat-summary>Synthetic change set</chat-summary>\n");
    out
}

fn bench_parse_response(c: &mut Criterion) {
    let response = synthetic_response(2_000);
    c.bench_function("parse_response_2000", |b| {
        b.iter(|| {
            let parsed = parse_response(black_box(&response));
            black_box(parsed.directives.len());
        });
    });

    // Unclosed tags must not make the scan quadratic.
    let hostile = "<write path=\"a.ts\">".repeat(5_000);
    c.bench_function("parse_response_unclosed", |b| {
        b.iter(|| black_box(parse_response(black_box(&hostile)).warnings.len()));
    });
}

fn bench_overlay_lookup(c: &mut Criterion) {
    let root = std::env::temp_dir().join("cosmos-perf-synthetic");
    let parsed = parse_response(&synthetic_response(4_000));
    let overlay = Overlay::from_directives(&root, &parsed.directives);
    let probes: Vec<PathBuf> = (0..4_000)
        .map(|i| root.join(format!("src/feature_{:03}/file_{:05}.ts", i % 40, i)))
        .collect();

    c.bench_function("overlay_file_exists", |b| {
        b.iter(|| {
            let hits = probes.iter().filter(|p| overlay.file_exists(p)).count();
            black_box(hits);
        });
    });

    c.bench_function("overlay_root_names", |b| {
        b.iter(|| black_box(root_names(probes.clone(), &overlay).len()));
    });
}

criterion_group!(perf_core, bench_parse_response, bench_overlay_lookup);
criterion_main!(perf_core);
