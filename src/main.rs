//! Convoy demonstration: a population of toy simulators feeding an actor and
//! a trainer
//!
//! Each simulator plays "walk to the target": the state counts up by the
//! actor's action until the episode ends. The actor consumer answers every
//! step with a random step size; the trainer consumer accumulates T=4
//! windows without replying, the way a learner would. Ctrl-C stops the run
//! and prints the collector summary.

use std::time::{ Duration, Instant };

use anyhow::Result;
use rand::rngs::SmallRng;
use rand::{ Rng, SeedableRng };
use tracing_subscriber::EnvFilter;

use convoy::{
    BatchDesc,
    Context,
    ContextConfig,
    ElemType,
    GameSim,
    KeySpec,
    KeyTable,
    ReplyBatch,
    Value,
};

const EPISODE_LEN: i64 = 20;

/// Walk toward a target; the action is the step size. The game reports each
/// transition one step late through `last_r` / `last_terminal`, the shape a
/// replying actor needs.
struct WalkGame {
    position: i64,
    steps: i64,
    last_reward: f32,
    last_terminal: bool,
}

impl WalkGame {
    fn new() -> Self {
        Self { position: 0, steps: 0, last_reward: 0.0, last_terminal: false }
    }
}

impl GameSim for WalkGame {
    fn restart(&mut self) {
        // The first event of a fresh episode reports the previous episode's
        // terminal transition.
        self.last_terminal = self.steps > 0;
        self.position = 0;
        self.steps = 0;
    }

    fn terminal(&self) -> bool {
        self.steps >= EPISODE_LEN
    }

    fn get_key(&mut self, key: &str) -> convoy::Result<Value> {
        match key {
            "s" => Ok(Value::scalar_f32(self.position as f32)),
            "last_r" => Ok(Value::scalar_f32(self.last_reward)),
            "last_terminal" => Ok(Value::scalar_u8(self.last_terminal as u8)),
            _ => Err(convoy::ConvoyError::simulator(format!("unknown key '{key}'"))),
        }
    }

    fn set_key(&mut self, key: &str, value: &Value) -> convoy::Result<()> {
        match key {
            "a" => {
                let step = value.as_i64().unwrap_or(0);
                self.position += step;
                self.steps += 1;
                self.last_reward = if step > 0 { 1.0 } else { -1.0 };
                self.last_terminal = false;
                Ok(())
            }
            _ => Err(convoy::ConvoyError::simulator(format!("unknown reply key '{key}'"))),
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let num_games = (num_cpus::get() * 4).max(8);
    let actor_batch = num_games.min(16);

    println!("Convoy - batched experience collection demo");
    println!("  simulators: {num_games}");
    println!("  actor batch: {actor_batch} x T=1, trainer batch: 8 x T=4");
    println!("  press ctrl-c to stop");

    let table = KeyTable::new()
        .with_key("s", KeySpec::scalar(ElemType::F32).pinned())?
        .with_key("last_r", KeySpec::scalar(ElemType::F32))?
        .with_key("last_terminal", KeySpec::scalar(ElemType::U8))?
        .with_key("a", KeySpec::scalar(ElemType::I64))?;

    let mut ctx = Context::new(table, ContextConfig::default());

    // The actor answers every step, so its inputs are game-supplied only.
    ctx.register(
        "actor",
        &BatchDesc::new(actor_batch, 1)
            .with_input(&["s", "last_r", "last_terminal"])
            .with_reply(&["a"])
            .with_timeout(5_000)
    )?;

    // The trainer reads the reward through the game's `last_r` one step
    // ahead, and never replies.
    ctx.register("train", &BatchDesc::new(8, 4).with_input(&["s", "r", "last_terminal"]))?;

    for i in 0..num_games {
        ctx.add_simulator(&format!("game-{i}"), Box::new(WalkGame::new()))?;
    }

    ctx.install_sigint()?;
    ctx.start()?;

    let mut rng = SmallRng::seed_from_u64(0x5eed);
    let mut actor_rows = 0u64;
    let mut train_rows = 0u64;
    let started = Instant::now();
    let mut last_report = Instant::now();

    while !ctx.is_stopping() {
        let Some(batch) = ctx.wait(200_000) else {
            continue;
        };

        match &**batch.name() {
            "actor" => {
                let rows = batch.rows();
                actor_rows += rows as u64;
                let actions: Vec<i64> = (0..rows).map(|_| rng.random_range(-1..=2)).collect();
                let reply = ReplyBatch::new(1).with("a", Value::I64(actions));
                ctx.step(batch, Some(&reply))?;
            }
            "train" => {
                train_rows += batch.rows() as u64;
                ctx.step(batch, None)?;
            }
            other => {
                println!("unexpected consumer '{other}'");
                ctx.step(batch, None)?;
            }
        }

        if last_report.elapsed() >= Duration::from_secs(2) {
            let secs = started.elapsed().as_secs_f64();
            println!(
                "  {:.1}s: actor rows {} ({:.0}/s), trainer rows {} ({:.0}/s)",
                secs,
                actor_rows,
                (actor_rows as f64) / secs,
                train_rows,
                (train_rows as f64) / secs
            );
            last_report = Instant::now();
        }
    }

    ctx.stop();
    ctx.print_summary();
    Ok(())
}
