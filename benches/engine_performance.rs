//! Engine Performance Benchmarks
//!
//! The control plane runs on the UI thread next to rendering, so a scheduling
//! pass has to stay well under the scheduler interval (25 ms by default) and
//! planning a patch merge has to feel instant while the user hovers a preview.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use patchbay::prelude::*;

const CHAIN_LENGTHS: [usize; 4] = [2, 8, 32, 128];
const SEQUENCER_COUNTS: [usize; 4] = [1, 4, 16, 64];

// ============================================================================
// Helper Functions
// ============================================================================

/// A live voice: osc -> vcf -> vca -> master
fn voice_rack() -> Rack {
    let mut rack = Rack::new(RackConfig::default(), ManualClock::new(0.0));
    rack.add_module("osc", ModuleKind::Oscillator, (0.0, 0.0)).unwrap();
    rack.add_module("vcf", ModuleKind::Filter, (0.0, 0.0)).unwrap();
    rack.add_module("vca", ModuleKind::Gain, (0.0, 0.0)).unwrap();
    rack.connect(Connection::audio("osc", "vcf")).unwrap();
    rack.connect(Connection::audio("vcf", "vca")).unwrap();
    rack.connect(Connection::audio("vca", MASTER_ID)).unwrap();
    rack
}

/// A serial effect chain whose ids collide with the live voice
fn effect_chain(length: usize) -> PatchDocument {
    let kinds = [ModuleKind::Distortion, ModuleKind::Delay, ModuleKind::Filter, ModuleKind::Gain];
    let mut doc = PatchDocument::new();
    for i in 0..length {
        let id = if i == 0 { "vcf".to_string() } else { format!("fx{i}") };
        doc = doc.with_module(ModuleDef::new(id, kinds[i % kinds.len()]));
    }
    let ids: Vec<String> = doc.modules.iter().map(|m| m.id.clone()).collect();
    for pair in ids.windows(2) {
        doc = doc.with_connection(Connection::audio(pair[0].clone(), pair[1].clone()));
    }
    if let Some(last) = ids.last() {
        doc = doc.with_connection(Connection::audio(last.clone(), MASTER_ID));
    }
    doc
}

fn sequencer_rack(count: usize) -> (Rack, ManualClock) {
    let clock = ManualClock::new(0.0);
    let mut rack = Rack::new(RackConfig::default(), clock.clone());
    for i in 0..count {
        let seq = format!("seq{i}");
        let env = format!("env{i}");
        rack.add_module(&seq, ModuleKind::Sequencer, (0.0, 0.0)).unwrap();
        rack.add_module(&env, ModuleKind::Adsr, (0.0, 0.0)).unwrap();
        rack.set_state(
            &seq,
            &serde_json::json!({
                "steps": (0..16).map(|n| serde_json::json!({ "note": 60 + n, "gate": true })).collect::<Vec<_>>()
            }),
        )
        .unwrap();
        rack.connect(Connection::new(seq.as_str(), "gate", env.as_str(), "gate"))
            .unwrap();
    }
    (rack, clock)
}

// ============================================================================
// Apply Engine
// ============================================================================

fn bench_apply_planning(c: &mut Criterion) {
    let mut group = c.benchmark_group("apply_preview");
    let rack = voice_rack();

    for length in CHAIN_LENGTHS {
        let doc = effect_chain(length);
        let options = ApplyOptions::new(ApplyMode::AddChain)
            .targeting(TargetType::AfterModule, "osc");
        group.bench_with_input(BenchmarkId::new("after_module", length), &doc, |b, doc| {
            b.iter(|| black_box(rack.preview(doc, &options)))
        });
    }
    group.finish();
}

fn bench_apply_commit(c: &mut Criterion) {
    let mut group = c.benchmark_group("apply_commit");

    for length in CHAIN_LENGTHS {
        let doc = effect_chain(length);
        let options = ApplyOptions::new(ApplyMode::AddChain)
            .targeting(TargetType::AfterModule, "osc");
        group.bench_with_input(BenchmarkId::new("after_module", length), &doc, |b, doc| {
            b.iter_with_setup(voice_rack, |mut rack| black_box(rack.apply(doc, &options)))
        });
    }
    group.finish();
}

// ============================================================================
// Transport
// ============================================================================

fn bench_scheduling_pass(c: &mut Criterion) {
    let mut group = c.benchmark_group("scheduling_pass");

    for count in SEQUENCER_COUNTS {
        group.bench_function(BenchmarkId::new("sequencers", count), |b| {
            let (mut rack, clock) = sequencer_rack(count);
            rack.play();
            b.iter(|| {
                clock.advance(0.025);
                black_box(rack.pump());
                rack.drain_events();
            })
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_apply_planning,
    bench_apply_commit,
    bench_scheduling_pass
);
criterion_main!(benches);
