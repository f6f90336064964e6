//! Randomized producer workloads checking the quantified invariants:
//! per-simulator seq monotonicity, batch row uniqueness, reply identity,
//! `last_` consistency, and slot boundedness.

use std::collections::HashMap;
use std::time::{ Duration, Instant };

use proptest::prelude::*;

use convoy::{
    BatchDesc,
    Context,
    ContextConfig,
    ConvoyError,
    ElemType,
    GameSim,
    KeySpec,
    KeyTable,
    ReplyBatch,
    Result,
    Value,
};

const DEADLINE: Duration = Duration::from_secs(5);

/// Emits `s = seq` and `r = seq`; terminal every `episode_len` steps.
/// Records every action it is handed, tagged with the seq it answered.
struct ProbeGame {
    step: u32,
    episode_len: u32,
}

impl ProbeGame {
    fn new(episode_len: u32) -> Self {
        Self { step: 0, episode_len }
    }
}

impl GameSim for ProbeGame {
    fn restart(&mut self) {
        self.step = 0;
    }

    fn terminal(&self) -> bool {
        self.episode_len > 0 && self.step >= self.episode_len
    }

    fn get_key(&mut self, key: &str) -> Result<Value> {
        match key {
            "s" | "r" => Ok(Value::scalar_f32(self.step as f32)),
            _ => Err(ConvoyError::simulator(format!("unknown key '{key}'"))),
        }
    }

    fn set_key(&mut self, _key: &str, _value: &Value) -> Result<()> {
        Ok(())
    }

    fn on_step(&mut self) {
        self.step += 1;
    }
}

fn table() -> KeyTable {
    KeyTable::new()
        .with_key("s", KeySpec::scalar(ElemType::F32))
        .unwrap()
        .with_key("r", KeySpec::scalar(ElemType::F32))
        .unwrap()
        .with_key("a", KeySpec::scalar(ElemType::I64))
        .unwrap()
}

/// Reply-gated workload: every event becomes exactly one batch row, so the
/// row stream per agent is the full event stream.
fn run_actor_workload(num_sims: usize, episode_len: u32, batchsize: usize) {
    let mut ctx = Context::new(table(), ContextConfig::default());
    ctx.register(
        "actor",
        &BatchDesc::new(batchsize, 1).with_input(&["s"]).with_reply(&["a"]).with_timeout(2_000)
    ).unwrap();
    for i in 0..num_sims {
        ctx.add_simulator(&format!("g{i}"), Box::new(ProbeGame::new(episode_len))).unwrap();
    }
    ctx.start().unwrap();

    let pool_size = ContextConfig::default().slot_pool_size;
    let target_rows = (30 * num_sims) as u64;
    let mut seen_rows = 0u64;
    let mut per_agent: HashMap<String, Vec<(u32, u32)>> = HashMap::new();

    let start = Instant::now();
    while seen_rows < target_rows && start.elapsed() < DEADLINE {
        let Some(batch) = ctx.wait(100_000) else {
            continue;
        };

        // P6: never more slots in flight than the pool holds.
        let in_flight = ctx.collector("actor", 0).unwrap().in_flight();
        assert!(in_flight <= pool_size, "{in_flight} slots in flight, pool is {pool_size}");

        {
            let routes = batch.routes();
            let mut in_batch = std::collections::HashSet::new();
            for route in routes.iter() {
                // P2: all (agent, game, seq) triples distinct within a batch.
                assert!(in_batch.insert(route.key.clone()), "duplicate row {}", route.key_str);
                per_agent
                    .entry(route.key.agent.to_string())
                    .or_default()
                    .push((route.key.game_counter, route.key.seq));
            }
            seen_rows += routes.len() as u64;
        }

        let rows = batch.rows();
        ctx.step(batch, Some(&ReplyBatch::new(1).with("a", Value::I64(vec![1; rows])))).unwrap();
    }
    ctx.stop();

    assert!(seen_rows >= target_rows, "workload too slow: {seen_rows}/{target_rows} rows");

    // P1: per agent the dispatched stream is seq 0, 1, 2, … with a reset to
    // (game+1, 0) exactly at each episode end.
    for (agent, stream) in per_agent {
        assert_eq!(stream.first(), Some(&(0, 0)), "agent {agent} does not start at (0, 0)");
        for pair in stream.windows(2) {
            let (game, seq) = pair[0];
            let expected = if episode_len > 0 && seq + 1 >= episode_len {
                (game + 1, 0)
            } else {
                (game, seq + 1)
            };
            assert_eq!(pair[1], expected, "agent {agent} broke monotonicity after {pair:?}");
        }
    }
}

/// Free-running workload with T > 1: checks the `last_` relation purely from
/// the dispatched tensors.
fn run_window_workload(t: usize, episode_len: u32) {
    let mut ctx = Context::new(table(), ContextConfig::default());
    ctx.register(
        "train",
        &BatchDesc::new(2, t).with_input(&["r", "last_r", "last_terminal"])
    ).unwrap();
    ctx.add_simulator("g0", Box::new(ProbeGame::new(episode_len))).unwrap();
    ctx.add_simulator("g1", Box::new(ProbeGame::new(episode_len))).unwrap();
    ctx.start().unwrap();

    let mut batches = 0;
    let start = Instant::now();
    while batches < 10 && start.elapsed() < DEADLINE {
        let Some(batch) = ctx.wait(100_000) else {
            continue;
        };
        batches += 1;

        let rows = batch.rows();
        let b = 2;
        let r = batch.column("r").unwrap().as_f32s();
        let last_r = batch.column("last_r").unwrap().as_f32s();
        let last_terminal = batch.column("last_terminal").unwrap().as_u8s();

        for row in 0..rows {
            for tt in 0..t {
                let i = tt * b + row;
                // P4: last_r equals the successor's r on contiguous steps and
                // zero exactly when the sentinel is raised.
                if last_terminal[i] == 0 {
                    assert_eq!(
                        last_r[i],
                        r[i] + 1.0,
                        "contiguous step at (t={tt}, row={row}) lost the successor value"
                    );
                } else {
                    assert_eq!(last_r[i], 0.0, "sentinel row must zero last_r");
                }
                // Inside a window, contiguity also shows in r itself.
                if tt + 1 < t && last_terminal[i] == 0 {
                    assert_eq!(r[tt * b + b + row], r[i] + 1.0);
                }
            }
        }
        ctx.step(batch, None).unwrap();
    }
    ctx.stop();
    assert!(batches >= 10, "only {batches} batches within the deadline");
}

proptest! {
    #![proptest_config(ProptestConfig { cases: 6, .. ProptestConfig::default() })]

    #[test]
    fn prop_rows_unique_and_seq_monotonic(
        num_sims in 1usize..5,
        episode_len in 1u32..6,
        batch in 1usize..5
    ) {
        // One agent can hold at most three T-windows, so bound the batch by
        // the population.
        run_actor_workload(num_sims, episode_len, batch.min(num_sims));
    }

    #[test]
    fn prop_last_consistency_under_breaks(t in 2usize..5, episode_len in 2u32..7) {
        run_window_workload(t, episode_len);
    }
}

/// P5: a reply for a sender that is not waiting lands in the cache and is
/// delivered at most once.
#[test]
fn test_unmatched_reply_is_cached_once() {
    use convoy::{ Mailbox, ReplyCache, ReplyRecord, RouteKey };
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::sync::atomic::AtomicBool;

    let mailbox = Mailbox::new();
    let cache = Mutex::new(ReplyCache::new(4));
    let key = RouteKey { agent: Arc::from("g0"), game_counter: 1, seq: 2 };
    let rec = ReplyRecord { key: key.clone(), values: vec![(Arc::from("a"), Value::scalar_i64(5))] };

    mailbox.deliver(&cache, rec.clone());
    mailbox.deliver(&cache, rec);
    assert_eq!(cache.lock().len(), 1, "duplicate replies must not double-park");

    let done = AtomicBool::new(false);
    let got = mailbox.wait_reply(&cache, key.clone(), &done).unwrap();
    assert_eq!(got.key, key);
    assert!(cache.lock().is_empty());

    // A second wait for the same identity finds nothing cached.
    let done = AtomicBool::new(true);
    assert!(mailbox.wait_reply(&cache, key, &done).is_err());
}
