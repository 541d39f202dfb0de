//! Deferred two-phase execution for Async-flagged nodes.
//!
//! Phase 1 (CPU parameter gathering) runs on a worker thread against a
//! snapshot of the parameter table; phase 2 (the GPU dispatch) runs when the
//! owning graph drains completions on the GPU-context thread, so within one
//! task phase 2 always observes phase 1's results. Re-scheduling a node bumps
//! its revision: results carrying a stale revision are dropped, which
//! coalesces rapid edits into exactly one dispatch with the latest gathered
//! parameters. No ordering is defined between different nodes' completions.

use std::collections::HashMap;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, unbounded};

use crate::function::VarScope;
use crate::param::ParameterStore;
use crate::value::{Value, ValueKind};

/// Phase-1 work order: everything the worker needs, snapshotted.
pub struct GatherJob {
    pub node: String,
    pub revision: u64,
    pub props: Vec<(String, ValueKind)>,
    pub params: ParameterStore,
    pub scope: VarScope,
}

/// Phase-1 result, handed to phase 2 untouched.
pub struct GatherDone {
    pub node: String,
    pub revision: u64,
    pub values: HashMap<String, Value>,
}

struct Pending {
    revision: u64,
    deadline: Instant,
    dispatched: bool,
}

pub struct Scheduler {
    pending: HashMap<String, Pending>,
    revisions: u64,
    debounce: Duration,
    jobs_tx: Sender<GatherJob>,
    done_rx: Receiver<GatherDone>,
}

impl Scheduler {
    pub fn new() -> Self {
        // Rapid edits coalesce over a 25 ms window.
        Self::with_debounce(Duration::from_millis(25))
    }

    pub fn with_debounce(debounce: Duration) -> Self {
        let (jobs_tx, jobs_rx) = unbounded::<GatherJob>();
        let (done_tx, done_rx) = unbounded::<GatherDone>();

        thread::Builder::new()
            .name("forge-gather".to_string())
            .spawn(move || worker_loop(jobs_rx, done_tx))
            .ok();

        Self {
            pending: HashMap::new(),
            revisions: 0,
            debounce,
            jobs_tx,
            done_rx,
        }
    }

    /// Queue `node` for deferred execution. A node already pending keeps a
    /// single slot; its revision advances and any earlier in-flight gather
    /// becomes stale. Returns whether this created a new pending slot.
    pub fn schedule(&mut self, node: &str) -> bool {
        self.revisions += 1;
        let revision = self.revisions;
        let deadline = Instant::now() + self.debounce;
        match self.pending.get_mut(node) {
            Some(p) => {
                p.revision = revision;
                p.deadline = deadline;
                p.dispatched = false;
                false
            }
            None => {
                self.pending.insert(
                    node.to_string(),
                    Pending {
                        revision,
                        deadline,
                        dispatched: false,
                    },
                );
                true
            }
        }
    }

    pub fn is_scheduled(&self, node: &str) -> bool {
        self.pending.contains_key(node)
    }

    pub fn is_idle(&self) -> bool {
        self.pending.is_empty()
    }

    /// Nodes whose debounce window has elapsed and that have no gather in
    /// flight for their current revision.
    pub fn take_due(&mut self, now: Instant) -> Vec<(String, u64)> {
        let mut due = Vec::new();
        for (node, p) in &mut self.pending {
            if !p.dispatched && now >= p.deadline {
                p.dispatched = true;
                due.push((node.clone(), p.revision));
            }
        }
        due
    }

    pub fn submit(&self, job: GatherJob) {
        if self.jobs_tx.send(job).is_err() {
            log::error!("[schedule] gather worker is gone; job dropped");
        }
    }

    /// Completed gathers whose revision is still current. Stale results are
    /// discarded here; their nodes stay pending for the newer revision.
    pub fn drain_completed(&mut self) -> Vec<GatherDone> {
        let mut ready = Vec::new();
        while let Ok(done) = self.done_rx.try_recv() {
            match self.pending.get(&done.node) {
                Some(p) if p.revision == done.revision => {
                    self.pending.remove(&done.node);
                    ready.push(done);
                }
                Some(_) => {
                    log::debug!(
                        "[schedule] dropping stale gather for '{}' (rev {})",
                        done.node,
                        done.revision
                    );
                }
                None => {}
            }
        }
        ready
    }

    /// Forget a pending node (it was removed from the graph).
    pub fn cancel(&mut self, node: &str) {
        self.pending.remove(node);
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

fn worker_loop(jobs_rx: Receiver<GatherJob>, done_tx: Sender<GatherDone>) {
    while let Ok(job) = jobs_rx.recv() {
        let done = run_gather(job);
        if done_tx.send(done).is_err() {
            return;
        }
    }
}

/// Phase 1 proper: resolve every promotable property that has an override.
/// Properties without overrides are left to the node's own field in phase 2.
fn run_gather(job: GatherJob) -> GatherDone {
    let mut values = HashMap::new();
    for (prop, kind) in &job.props {
        if !job.params.has_value(&job.node, prop) {
            continue;
        }
        if let Some(v) = job.params.resolve(&job.node, prop, &job.scope) {
            values.insert(prop.clone(), v.convert_to(*kind));
        }
    }
    GatherDone {
        node: job.node,
        revision: job.revision,
        values,
    }
}
