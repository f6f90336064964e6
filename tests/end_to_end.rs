//! End-to-end scenarios: simulators, collectors, dispatcher and reply
//! routing wired through a full context.

use std::sync::Arc;
use std::time::{ Duration, Instant };

use convoy::{
    BatchDesc,
    Context,
    ContextConfig,
    ConvoyError,
    ElemType,
    Filter,
    GameSim,
    KeySpec,
    KeyTable,
    ReplyBatch,
    Result,
    Value,
};

const WAIT_US: u64 = 2_000_000;
const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Emits `s = position`, `r = seq`; applying an action moves the position.
/// Episodes end after `episode_len` steps; 0 disables terminals.
struct StepGame {
    position: f32,
    step: u32,
    episode_len: u32,
    seen_actions: Vec<i64>,
}

impl StepGame {
    fn new(episode_len: u32) -> Self {
        Self { position: 0.0, step: 0, episode_len, seen_actions: Vec::new() }
    }
}

impl GameSim for StepGame {
    fn restart(&mut self) {
        self.position = 0.0;
        self.step = 0;
    }

    fn terminal(&self) -> bool {
        self.episode_len > 0 && self.step >= self.episode_len
    }

    fn get_key(&mut self, key: &str) -> Result<Value> {
        match key {
            "s" => Ok(Value::scalar_f32(self.position)),
            "r" => Ok(Value::scalar_f32(self.step as f32)),
            _ => Err(ConvoyError::simulator(format!("unknown key '{key}'"))),
        }
    }

    fn set_key(&mut self, key: &str, value: &Value) -> Result<()> {
        match key {
            "a" => {
                let a = value.as_i64().unwrap_or(0);
                self.seen_actions.push(a);
                self.position = a as f32;
                Ok(())
            }
            _ => Err(ConvoyError::simulator(format!("unknown reply key '{key}'"))),
        }
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

/// E1: single simulator, single consumer, T=1, B=1. The reply round-trips
/// into the simulator before its next event.
#[test]
fn test_e1_single_round_trip() {
    let mut ctx = Context::new(table(), ContextConfig::default());
    ctx.register("actor", &BatchDesc::new(1, 1).with_input(&["s"]).with_reply(&["a"])).unwrap();
    ctx.add_simulator("g0", Box::new(StepGame::new(0))).unwrap();
    ctx.start().unwrap();

    let batch = ctx.wait(WAIT_US).expect("1x1 batch");
    assert_eq!(batch.rows(), 1);
    assert_eq!(batch.column("s").unwrap().as_f32s()[0], 0.0);
    {
        let routes = batch.routes();
        assert_eq!(&*routes[0].key.agent, "g0");
        assert_eq!((routes[0].key.game_counter, routes[0].key.seq), (0, 0));
        assert_eq!(routes[0].key_str, "g0-0-0");
    }
    ctx.step(batch, Some(&ReplyBatch::new(1).with("a", Value::scalar_i64(7)))).unwrap();

    // The next event proves the simulator observed a=7 and advanced.
    let batch = ctx.wait(WAIT_US).expect("second event");
    assert_eq!(batch.column("s").unwrap().as_f32s()[0], 7.0);
    assert_eq!(batch.routes()[0].key.seq, 1);
    ctx.step(batch, Some(&ReplyBatch::new(1).with("a", Value::scalar_i64(7)))).unwrap();

    ctx.stop();
}

/// E2: T=2 with `last_r`. Row t carries r of step t and last_r of step t+1.
#[test]
fn test_e2_last_r_window() {
    let mut ctx = Context::new(table(), ContextConfig::default());
    ctx.register(
        "train",
        &BatchDesc::new(1, 2).with_input(&["s", "r", "last_r", "last_terminal"])
    ).unwrap();
    ctx.add_simulator("g0", Box::new(StepGame::new(0))).unwrap();
    ctx.start().unwrap();

    let batch = ctx.wait(WAIT_US).expect("first T=2 window");
    assert_eq!(batch.rows(), 1);
    assert_eq!(batch.t(), 2);

    // First window covers seq 0 and 1, future event is seq 2.
    let r = batch.column("r").unwrap().as_f32s();
    let last_r = batch.column("last_r").unwrap().as_f32s();
    let last_terminal = batch.column("last_terminal").unwrap().as_u8s();
    assert_eq!((r[0], last_r[0], last_terminal[0]), (0.0, 1.0, 0));
    assert_eq!((r[1], last_r[1], last_terminal[1]), (1.0, 2.0, 0));

    ctx.step(batch, None).unwrap();
    ctx.stop();
}

/// E3: terminal break. The row pairing the episode's last step with the next
/// episode's first step is zeroed and sentinel-marked; seq resets and
/// game_counter increments.
#[test]
fn test_e3_terminal_break() {
    let mut ctx = Context::new(table(), ContextConfig::default());
    ctx.register("train", &BatchDesc::new(1, 1).with_input(&["r", "last_r", "last_terminal"]))
        .unwrap();
    // Episodes of 4 steps: seq runs 0..=3, then resets.
    ctx.add_simulator("g0", Box::new(StepGame::new(4))).unwrap();
    ctx.start().unwrap();

    let start = Instant::now();
    let mut saw_break = false;
    let mut saw_next_episode = false;
    while start.elapsed() < TEST_TIMEOUT && !(saw_break && saw_next_episode) {
        let Some(batch) = ctx.wait(200_000) else {
            continue;
        };
        let (game, seq) = {
            let routes = batch.routes();
            (routes[0].key.game_counter, routes[0].key.seq)
        };
        let last_r = batch.column("last_r").unwrap().as_f32s()[0];
        let last_terminal = batch.column("last_terminal").unwrap().as_u8s()[0];

        if seq == 3 {
            // Successor is seq 0 of the next episode: gap row.
            assert_eq!(last_r, 0.0, "episode break must zero last_r");
            assert_eq!(last_terminal, 1, "episode break must raise the sentinel");
            saw_break = true;
        } else {
            assert_eq!(last_terminal, 0);
            assert_eq!(last_r, (seq + 1) as f32);
        }
        if game >= 1 {
            assert!(seq <= 3);
            saw_next_episode = true;
        }
        ctx.step(batch, None).unwrap();
    }
    assert!(saw_break, "no terminal row observed");
    assert!(saw_next_episode, "seq never reset into the next episode");
    ctx.stop();
}

/// E4: actor (B=4, T=1, replies) and trainer (B=4, T=4, no reply) over four
/// simulators. The actor dispatches every step, the trainer once every four.
#[test]
fn test_e4_two_consumers() {
    let mut ctx = Context::new(table(), ContextConfig::default());
    ctx.register("actor", &BatchDesc::new(4, 1).with_input(&["s"]).with_reply(&["a"])).unwrap();
    ctx.register("train", &BatchDesc::new(4, 4).with_input(&["s", "r"])).unwrap();
    for i in 0..4 {
        ctx.add_simulator(&format!("g{i}"), Box::new(StepGame::new(0))).unwrap();
    }
    ctx.start().unwrap();

    let mut actor_batches = 0u32;
    let mut trainer_batches = 0u32;
    let start = Instant::now();
    while trainer_batches < 2 && start.elapsed() < TEST_TIMEOUT {
        let Some(batch) = ctx.wait(200_000) else {
            continue;
        };
        match &**batch.name() {
            "actor" => {
                actor_batches += 1;
                let rows = batch.rows();
                let reply = ReplyBatch::new(1).with("a", Value::I64(vec![1; rows]));
                ctx.step(batch, Some(&reply)).unwrap();
            }
            "train" => {
                trainer_batches += 1;
                assert_eq!(batch.rows(), 4);
                assert_eq!(batch.t(), 4);
                ctx.step(batch, None).unwrap();
            }
            other => panic!("unexpected consumer {other}"),
        }
    }

    assert_eq!(trainer_batches, 2);
    // Two trainer rounds need eight events per simulator, i.e. eight full
    // actor batches (give or take the one in flight).
    assert!(actor_batches >= 7, "actor dispatched {actor_batches} times");
    ctx.stop();
}

/// E5: self-play filter. The unfiltered actor serves both players; the
/// filtered trainer only ever sees the train-side player.
#[test]
fn test_e5_selfplay_filter() {
    let mut ctx = Context::new(table(), ContextConfig::default());
    ctx.register("actor", &BatchDesc::new(2, 1).with_input(&["s"]).with_reply(&["a"])).unwrap();
    ctx.register(
        "train",
        &BatchDesc::new(2, 1)
            .with_input(&["s", "r"])
            .with_filter(Filter::AgentPrefix("train".into()))
    ).unwrap();
    ctx.add_simulator("train-0", Box::new(StepGame::new(0))).unwrap();
    ctx.add_simulator("ref-0", Box::new(StepGame::new(0))).unwrap();
    ctx.start().unwrap();

    let mut actor_agents = std::collections::HashSet::new();
    let mut trainer_batches = 0u32;
    let start = Instant::now();
    while (trainer_batches < 2 || actor_agents.len() < 2) && start.elapsed() < TEST_TIMEOUT {
        let Some(batch) = ctx.wait(200_000) else {
            continue;
        };
        match &**batch.name() {
            "actor" => {
                let rows = batch.rows();
                {
                    let routes = batch.routes();
                    let mut keys = std::collections::HashSet::new();
                    for route in routes.iter() {
                        actor_agents.insert(route.key.agent.to_string());
                        // Row uniqueness inside every dispatched batch.
                        assert!(keys.insert(route.key.clone()));
                    }
                }
                let reply = ReplyBatch::new(1).with("a", Value::I64(vec![1; rows]));
                ctx.step(batch, Some(&reply)).unwrap();
            }
            "train" => {
                trainer_batches += 1;
                for route in batch.routes().iter() {
                    assert!(
                        route.key.agent.starts_with("train"),
                        "filtered trainer saw {}",
                        route.key.agent
                    );
                }
                ctx.step(batch, None).unwrap();
            }
            other => panic!("unexpected consumer {other}"),
        }
    }

    assert!(actor_agents.contains("train-0"));
    assert!(actor_agents.contains("ref-0"));
    assert!(trainer_batches >= 2);
    ctx.stop();
}

/// E6: timeout. Three producers cannot fill B=4; the partial batch goes out
/// once the timeout elapses.
#[test]
fn test_e6_timeout_partial_batch() {
    let mut ctx = Context::new(table(), ContextConfig::default());
    ctx.register(
        "actor",
        &BatchDesc::new(4, 1).with_input(&["s"]).with_reply(&["a"]).with_timeout(5_000)
    ).unwrap();
    for i in 0..3 {
        ctx.add_simulator(&format!("g{i}"), Box::new(StepGame::new(0))).unwrap();
    }
    ctx.start().unwrap();

    let batch = ctx.wait(WAIT_US).expect("timeout batch");
    assert_eq!(batch.rows(), 3, "B_effective is the accumulated sample count");
    let rows = batch.rows();
    ctx.step(batch, Some(&ReplyBatch::new(1).with("a", Value::I64(vec![0; rows])))).unwrap();

    let stats = ctx.collector("actor", 0).unwrap().stats();
    assert!(stats.incomplete_batches.load(std::sync::atomic::Ordering::Relaxed) >= 1);
    ctx.stop();
}

/// A reply that omits a declared key is a contract violation and aborts.
#[test]
#[should_panic(expected = "contract violation")]
fn test_reply_missing_key_aborts() {
    let mut ctx = Context::new(table(), ContextConfig::default());
    ctx.register("actor", &BatchDesc::new(1, 1).with_input(&["s"]).with_reply(&["a"])).unwrap();
    ctx.add_simulator("g0", Box::new(StepGame::new(0))).unwrap();
    ctx.start().unwrap();

    let batch = ctx.wait(WAIT_US).expect("batch");
    // "a" is declared but missing from the reply.
    let _ = ctx.step(batch, Some(&ReplyBatch::new(1)));
}

/// Callback mode: batches are served through registered callbacks.
#[test]
fn test_callback_mode_round_trip() {
    let mut ctx = Context::new(table(), ContextConfig::default());
    ctx.register("actor", &BatchDesc::new(2, 1).with_input(&["s"]).with_reply(&["a"])).unwrap();
    for i in 0..2 {
        ctx.add_simulator(&format!("g{i}"), Box::new(StepGame::new(0))).unwrap();
    }

    let served = Arc::new(std::sync::atomic::AtomicU64::new(0));
    let served_cb = served.clone();
    ctx.on_batch(
        "actor",
        Box::new(move |batch| {
            served_cb.fetch_add(batch.rows() as u64, std::sync::atomic::Ordering::Relaxed);
            Some(ReplyBatch::new(1).with("a", Value::I64(vec![2; batch.rows()])))
        })
    ).unwrap();
    ctx.start().unwrap();

    let ctx = Arc::new(ctx);
    let runner = {
        let ctx = ctx.clone();
        std::thread::spawn(move || ctx.run_until_stopped())
    };

    let start = Instant::now();
    while served.load(std::sync::atomic::Ordering::Relaxed) < 10 {
        assert!(start.elapsed() < TEST_TIMEOUT, "callbacks never served 10 rows");
        std::thread::sleep(Duration::from_millis(5));
    }
    ctx.stop();
    runner.join().unwrap();
    assert!(served.load(std::sync::atomic::Ordering::Relaxed) >= 10);
}
