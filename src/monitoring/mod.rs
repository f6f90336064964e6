//! Per-collector counters and the run summary
//!
//! Collector threads bump lock-free counters on the hot path and update the
//! per-agent tracking map once per event (the map lock is only ever contended
//! by the summary printer). Batch assembly latency, measured from the first
//! buffered sample to dispatch, feeds an HDR histogram rendered in the
//! summary.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{ AtomicU64, Ordering };

use hdrhistogram::Histogram;
use parking_lot::Mutex;

use crate::constants::{ LATENCY_SIGFIG, MAX_TRACKED_LATENCY_US };

/// Per-agent bookkeeping for the summary
#[derive(Debug, Clone, Default)]
pub struct AgentStats {
    /// Events accepted from this agent
    pub events: u64,
    /// Batch rows this agent contributed
    pub rows: u64,
    /// Last seq observed
    pub last_seq: u32,
    /// Last game counter observed
    pub last_game: u32,
    /// Current history ring depth
    pub depth: usize,
}

/// Counters for one collector
#[derive(Debug)]
pub struct CollectorStats {
    /// Events accepted into a history ring
    pub events_in: AtomicU64,
    /// Events rejected by the filter
    pub events_rejected: AtomicU64,
    /// Events dropped because a history ring was full
    pub events_dropped: AtomicU64,
    /// Batches dispatched
    pub batches: AtomicU64,
    /// Batches dispatched below full batch size
    pub incomplete_batches: AtomicU64,
    /// Rows dispatched in total
    pub rows: AtomicU64,
    agents: Mutex<HashMap<Arc<str>, AgentStats>>,
    latency_us: Mutex<Histogram<u64>>,
}

impl Default for CollectorStats {
    fn default() -> Self {
        Self::new()
    }
}

impl CollectorStats {
    /// Fresh, zeroed counters
    pub fn new() -> Self {
        Self {
            events_in: AtomicU64::new(0),
            events_rejected: AtomicU64::new(0),
            events_dropped: AtomicU64::new(0),
            batches: AtomicU64::new(0),
            incomplete_batches: AtomicU64::new(0),
            rows: AtomicU64::new(0),
            agents: Mutex::new(HashMap::new()),
            latency_us: Mutex::new(
                Histogram::new_with_bounds(1, MAX_TRACKED_LATENCY_US, LATENCY_SIGFIG)
                    .expect("latency histogram bounds are static")
            ),
        }
    }

    /// Record one accepted event
    pub fn record_event(&self, agent: &Arc<str>, seq: u32, game: u32, depth: usize) {
        self.events_in.fetch_add(1, Ordering::Relaxed);
        let mut agents = self.agents.lock();
        let entry = agents.entry(agent.clone()).or_default();
        entry.events += 1;
        entry.last_seq = seq;
        entry.last_game = game;
        entry.depth = depth;
    }

    /// Record rows an agent contributed to a dispatched batch
    pub fn record_agent_rows(&self, agent: &Arc<str>, rows: u64, depth: usize) {
        let mut agents = self.agents.lock();
        let entry = agents.entry(agent.clone()).or_default();
        entry.rows += rows;
        entry.depth = depth;
    }

    /// Record one dispatched batch
    pub fn record_batch(&self, rows: usize, incomplete: bool, latency_us: u64) {
        self.batches.fetch_add(1, Ordering::Relaxed);
        self.rows.fetch_add(rows as u64, Ordering::Relaxed);
        if incomplete {
            self.incomplete_batches.fetch_add(1, Ordering::Relaxed);
        }
        let _ = self.latency_us.lock().record(latency_us.clamp(1, MAX_TRACKED_LATENCY_US));
    }

    /// Snapshot of the per-agent map
    pub fn agents(&self) -> HashMap<Arc<str>, AgentStats> {
        self.agents.lock().clone()
    }

    /// Render the multi-line summary block for this collector
    pub fn render(&self, header: &str, queue_depth: usize, free_slots: usize) -> String {
        let mut out = String::new();
        out.push_str(
            &format!(
                "{header}: events={} rejected={} dropped={} batches={} (incomplete={}) rows={} queue={} free_slots={}\n",
                self.events_in.load(Ordering::Relaxed),
                self.events_rejected.load(Ordering::Relaxed),
                self.events_dropped.load(Ordering::Relaxed),
                self.batches.load(Ordering::Relaxed),
                self.incomplete_batches.load(Ordering::Relaxed),
                self.rows.load(Ordering::Relaxed),
                queue_depth,
                free_slots
            )
        );

        let agents = self.agents.lock();
        if !agents.is_empty() {
            let mut min: (usize, &str) = (usize::MAX, "");
            let mut max: (usize, &str) = (0, "");
            let mut sum = 0usize;
            for (name, stats) in agents.iter() {
                if stats.depth < min.0 {
                    min = (stats.depth, name.as_ref());
                }
                if stats.depth >= max.0 {
                    max = (stats.depth, name.as_ref());
                }
                sum += stats.depth;
            }
            let furthest = agents
                .values()
                .map(|s| (s.last_game, s.last_seq))
                .max()
                .unwrap_or((0, 0));
            out.push_str(
                &format!(
                    "  history depth: min={} [{}], max={} [{}], avg={:.2} over {} agents; furthest (game, seq)=({}, {})\n",
                    min.0,
                    min.1,
                    max.0,
                    max.1,
                    (sum as f64) / (agents.len() as f64),
                    agents.len(),
                    furthest.0,
                    furthest.1
                )
            );
        }

        let hist = self.latency_us.lock();
        if hist.len() > 0 {
            out.push_str(
                &format!(
                    "  assembly latency: p50={}us p99={}us max={}us ({} batches)\n",
                    hist.value_at_quantile(0.5),
                    hist.value_at_quantile(0.99),
                    hist.max(),
                    hist.len()
                )
            );
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let stats = CollectorStats::new();
        let agent: Arc<str> = Arc::from("game-0");

        stats.record_event(&agent, 0, 0, 1);
        stats.record_event(&agent, 1, 0, 2);
        stats.record_batch(4, false, 120);
        stats.record_batch(3, true, 80);
        stats.record_agent_rows(&agent, 2, 0);

        assert_eq!(stats.events_in.load(Ordering::Relaxed), 2);
        assert_eq!(stats.batches.load(Ordering::Relaxed), 2);
        assert_eq!(stats.incomplete_batches.load(Ordering::Relaxed), 1);
        assert_eq!(stats.rows.load(Ordering::Relaxed), 7);

        let agents = stats.agents();
        let entry = &agents[&agent];
        assert_eq!(entry.events, 2);
        assert_eq!(entry.rows, 2);
        assert_eq!(entry.last_seq, 1);
    }

    #[test]
    fn test_render_contains_key_figures() {
        let stats = CollectorStats::new();
        let agent: Arc<str> = Arc::from("game-1");
        stats.record_event(&agent, 5, 2, 3);
        stats.record_batch(1, false, 40);

        let text = stats.render("actor/0", 1, 2);
        assert!(text.contains("actor/0"));
        assert!(text.contains("events=1"));
        assert!(text.contains("game-1"));
        assert!(text.contains("assembly latency"));
    }

    #[test]
    fn test_latency_clamped_to_bounds() {
        let stats = CollectorStats::new();
        stats.record_batch(1, false, 0);
        stats.record_batch(1, false, u64::MAX);
        // Neither sample may panic or be silently lost.
        let text = stats.render("x", 0, 0);
        assert!(text.contains("(2 batches)"));
    }
}
