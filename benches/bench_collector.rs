//! Collector-path benchmarks: history ring churn and replay batch assembly.

use std::hint::black_box;
use std::sync::Arc;

use criterion::{ criterion_group, criterion_main, Criterion };

use convoy::{
    BatchDesc,
    ElemType,
    Event,
    EventMeta,
    HistoryRing,
    KeySpec,
    KeyTable,
    Mailbox,
    OfflineSampler,
    Value,
};

fn table() -> KeyTable {
    KeyTable::new()
        .with_key("s", KeySpec::tensor(ElemType::F32, &[84]))
        .unwrap()
        .with_key("r", KeySpec::scalar(ElemType::F32))
        .unwrap()
}

fn event(agent: &Arc<str>, sender: &Arc<Mailbox>, seq: u32) -> Event {
    Event {
        meta: EventMeta {
            agent: agent.clone(),
            game_counter: 0,
            seq,
            sender: sender.clone(),
        },
        values: vec![
            Some(Value::F32(vec![seq as f32; 84])),
            Some(Value::scalar_f32(seq as f32))
        ].into(),
    }
}

fn bench_history_ring(c: &mut Criterion) {
    let agent: Arc<str> = Arc::from("bench");
    let sender = Arc::new(Mailbox::new());

    c.bench_function("history_ring_push_popn", |b| {
        let mut ring = HistoryRing::new(16);
        let mut seq = 0u32;
        b.iter(|| {
            while ring.push(event(&agent, &sender, seq)) {
                seq = seq.wrapping_add(1);
            }
            black_box(ring.peek(8).unwrap().len());
            ring.popn(8);
        });
    });
}

fn bench_replay_assembly(c: &mut Criterion) {
    let desc = BatchDesc::new(32, 4).with_input(&["s", "r", "last_r"]);
    let mut sampler = OfflineSampler::new("bench", &desc, &table(), 256, 0).unwrap();

    let sender = Arc::new(Mailbox::new());
    for i in 0..8 {
        let agent: Arc<str> = Arc::from(format!("g{i}"));
        for seq in 0..128 {
            sampler.feed(event(&agent, &sender, seq));
        }
    }

    c.bench_function("replay_batch_32x4", |b| {
        b.iter(|| {
            let batch = sampler.sample_batch().unwrap();
            black_box(batch.column("s").unwrap().as_f32s()[0]);
        });
    });
}

criterion_group!(benches, bench_history_ring, bench_replay_assembly);
criterion_main!(benches);
