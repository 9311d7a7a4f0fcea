//! Criterion benchmarks for the template expression engine.
//!
//! The DSL sits on the hot path of every HTTP tool call (URL, headers and
//! body render per invocation), so parse and eval costs matter.

use std::hint::black_box;

use criterion::{Criterion, criterion_group, criterion_main};
use mcp_gateway::dsl::{Value, eval, parse};

const URL_TEMPLATE: &str = "config.baseUrl + \"/pets/\" + toString(args.petId)";
const PROJECTION: &str = "response.body.items | filter(item.active) | map(item.name) | join(\",\")";

fn bench_parse(c: &mut Criterion) {
    c.bench_function("parse_url_template", |b| {
        b.iter(|| parse(black_box(URL_TEMPLATE)).unwrap());
    });
    c.bench_function("parse_projection", |b| {
        b.iter(|| parse(black_box(PROJECTION)).unwrap());
    });
}

fn bench_eval(c: &mut Criterion) {
    let root = Value::from_json(&serde_json::json!({
        "args": {"petId": 7},
        "config": {"baseUrl": "https://petstore.example"},
        "response": {
            "body": {
                "items": [
                    {"name": "a", "active": true},
                    {"name": "b", "active": false},
                    {"name": "c", "active": true}
                ]
            }
        }
    }));

    let url = parse(URL_TEMPLATE).unwrap();
    c.bench_function("eval_url_template", |b| {
        b.iter(|| eval(black_box(&url), black_box(&root)).unwrap());
    });

    let projection = parse(PROJECTION).unwrap();
    c.bench_function("eval_projection", |b| {
        b.iter(|| eval(black_box(&projection), black_box(&root)).unwrap());
    });
}

criterion_group!(benches, bench_parse, bench_eval);
criterion_main!(benches);
