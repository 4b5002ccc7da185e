//! The signal-graph scheduler for the distributed runtime.
//!
//! A *signal* is a one-shot token meaning "a particular read or write has
//! completed". Actions are closures scheduled against signals: `exec`
//! registers an action whose precondition count reaches zero when its input
//! signal fires, at which point the action moves to a worker thread; its
//! completion triggers the action's output signal back on the scheduler.
//!
//! The scheduler itself is cooperative: nothing advances unless the owner
//! pumps it ([`Scheduler::pump`] / [`Scheduler::wait`]), and waits yield to
//! the pump every couple of microseconds. There is no cancellation; a
//! panicked action leaks its signals and is treated as fatal by the
//! embedding node.
//!
//! Per-field ordering uses exactly two tracked signals, `last_read` and
//! `last_write`:
//!
//! - read-only access forks `last_write` (one branch is the input, the
//!   other replaces `last_write`) and merges its completion into
//!   `last_read`;
//! - read-write access takes `merge(last_read, last_write)` as input and
//!   forks its completion into both;
//! - reduce access forks `last_write` for its input and merges its
//!   completion back into `last_write`, so reductions order against writes
//!   but commute with reads.
//!
//! This yields per-field serializability with no global lock, and maximal
//! overlap between disjoint accesses.

use crate::layout::Privilege;
use crossbeam_channel::{Receiver, Sender, unbounded};
use std::sync::Mutex;
use std::thread::JoinHandle;
use std::time::Duration;

/// Identifier of one signal in the scheduler's arena.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct SignalId(usize);

/// A unit of work dispatched to a worker thread.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
struct ActionId(usize);

struct SignalData {
    triggered: bool,
    /// Untriggered inputs still pending (merges wait for several).
    pending: usize,
    /// Downstream signals to notify on trigger.
    children: Vec<SignalId>,
    /// Actions waiting on this signal.
    waiting: Vec<ActionId>,
}

struct ActionData {
    pending: usize,
    job: Option<(usize, Task)>,
    out: SignalId,
}

struct SchedInner {
    signals: Vec<SignalData>,
    actions: Vec<ActionData>,
}

struct WorkerJob {
    action: ActionId,
    f: Task,
}

/// The per-node cooperative scheduler plus its worker pool.
pub struct Scheduler {
    inner: Mutex<SchedInner>,
    worker_txs: Vec<Sender<WorkerJob>>,
    done_rx: Receiver<ActionId>,
    handles: Vec<JoinHandle<()>>,
}

impl Scheduler {
    /// Build a scheduler with `workers` worker threads (at least one; the
    /// core needs only one, the design permits N).
    pub fn new(workers: usize) -> Self {
        let (done_tx, done_rx) = unbounded::<ActionId>();
        let mut worker_txs = Vec::new();
        let mut handles = Vec::new();
        for i in 0..workers.max(1) {
            let (tx, rx) = unbounded::<WorkerJob>();
            let done_tx = done_tx.clone();
            let handle = std::thread::Builder::new()
                .name(format!("meshflow-worker-{i}"))
                .spawn(move || {
                    for job in rx {
                        (job.f)();
                        if done_tx.send(job.action).is_err() {
                            break;
                        }
                    }
                })
                .expect("worker thread spawn");
            worker_txs.push(tx);
            handles.push(handle);
        }
        Self {
            inner: Mutex::new(SchedInner { signals: Vec::new(), actions: Vec::new() }),
            worker_txs,
            done_rx,
            handles,
        }
    }

    pub fn worker_count(&self) -> usize {
        self.worker_txs.len()
    }

    fn new_signal(inner: &mut SchedInner, triggered: bool, pending: usize) -> SignalId {
        let id = SignalId(inner.signals.len());
        inner.signals.push(SignalData {
            triggered,
            pending,
            children: Vec::new(),
            waiting: Vec::new(),
        });
        id
    }

    /// A source signal: born already triggered.
    pub fn source(&self) -> SignalId {
        let mut inner = self.inner.lock().unwrap();
        Self::new_signal(&mut inner, true, 0)
    }

    pub fn is_triggered(&self, s: SignalId) -> bool {
        self.inner.lock().unwrap().signals[s.0].triggered
    }

    /// Trigger a signal by hand (sources of external completion).
    pub fn trigger(&self, s: SignalId) {
        let jobs = {
            let mut inner = self.inner.lock().unwrap();
            let mut jobs = Vec::new();
            Self::fire(&mut inner, s, &mut jobs);
            jobs
        };
        self.dispatch(jobs);
    }

    fn fire(inner: &mut SchedInner, s: SignalId, jobs: &mut Vec<(usize, WorkerJob)>) {
        if inner.signals[s.0].triggered {
            return;
        }
        inner.signals[s.0].triggered = true;
        let children = std::mem::take(&mut inner.signals[s.0].children);
        let waiting = std::mem::take(&mut inner.signals[s.0].waiting);
        for c in children {
            let sig = &mut inner.signals[c.0];
            sig.pending = sig.pending.saturating_sub(1);
            if sig.pending == 0 {
                Self::fire(inner, c, jobs);
            }
        }
        for a in waiting {
            let act = &mut inner.actions[a.0];
            act.pending = act.pending.saturating_sub(1);
            if act.pending == 0
                && let Some((worker, f)) = act.job.take()
            {
                jobs.push((worker, WorkerJob { action: a, f }));
            }
        }
    }

    fn dispatch(&self, jobs: Vec<(usize, WorkerJob)>) {
        for (worker, job) in jobs {
            let w = worker % self.worker_txs.len();
            self.worker_txs[w].send(job).expect("worker alive");
        }
    }

    /// Duplicate a signal: each copy triggers iff the original does.
    pub fn fork(&self, s: SignalId, n: usize) -> Vec<SignalId> {
        let mut inner = self.inner.lock().unwrap();
        let triggered = inner.signals[s.0].triggered;
        let mut out = Vec::with_capacity(n);
        for _ in 0..n {
            let c = Self::new_signal(&mut inner, triggered, usize::from(!triggered));
            if !triggered {
                inner.signals[s.0].children.push(c);
            }
            out.push(c);
        }
        out
    }

    /// A signal that triggers once every input has.
    pub fn merge(&self, inputs: &[SignalId]) -> SignalId {
        let mut inner = self.inner.lock().unwrap();
        let pending = inputs
            .iter()
            .filter(|s| !inner.signals[s.0].triggered)
            .count();
        let m = Self::new_signal(&mut inner, pending == 0, pending);
        if pending > 0 {
            for s in inputs {
                if !inner.signals[s.0].triggered {
                    inner.signals[s.0].children.push(m);
                }
            }
        }
        m
    }

    /// Drop a reference to a signal without consuming it.
    pub fn sink(&self, _s: SignalId) {}

    /// Schedule `f` on `worker` once `s` triggers; the returned signal
    /// triggers when the action completes.
    pub fn exec(&self, s: SignalId, worker: usize, f: Task) -> SignalId {
        let (out, job) = {
            let mut inner = self.inner.lock().unwrap();
            let out = Self::new_signal(&mut inner, false, 1);
            let a = ActionId(inner.actions.len());
            let ready = inner.signals[s.0].triggered;
            inner.actions.push(ActionData {
                pending: usize::from(!ready),
                job: Some((worker, f)),
                out,
            });
            if ready {
                let job = inner.actions[a.0].job.take().unwrap();
                (out, Some((job.0, WorkerJob { action: a, f: job.1 })))
            } else {
                inner.signals[s.0].waiting.push(a);
                (out, None)
            }
        };
        if let Some(j) = job {
            self.dispatch(vec![j]);
        }
        out
    }

    /// Drain worker completions and trigger their output signals. Returns
    /// how many actions completed this pump.
    pub fn pump(&self) -> usize {
        let mut n = 0;
        while let Ok(a) = self.done_rx.try_recv() {
            let out = self.inner.lock().unwrap().actions[a.0].out;
            self.trigger(out);
            n += 1;
        }
        n
    }

    /// Cooperatively spin until `s` triggers, yielding to the pump every
    /// couple of microseconds.
    pub fn wait(&self, s: SignalId) {
        loop {
            if self.is_triggered(s) {
                return;
            }
            if self.pump() == 0 {
                std::thread::sleep(Duration::from_micros(2));
            }
        }
    }

    /// Cooperatively spin until `ready()` holds.
    pub fn spin_until(&self, ready: impl Fn() -> bool) {
        loop {
            if ready() {
                return;
            }
            if self.pump() == 0 {
                std::thread::sleep(Duration::from_micros(2));
            }
        }
    }

    // --- per-field discipline ----------------------------------------------

    /// Fresh signal pair for a newly created field (both born triggered).
    pub fn field_signals(&self) -> FieldSignals {
        FieldSignals { last_read: self.source(), last_write: self.source() }
    }

    /// Collect the input signal for one access, updating the field's
    /// tracked signals per the discipline.
    pub fn acquire(&self, fs: &mut FieldSignals, privilege: Privilege) -> SignalId {
        match privilege {
            Privilege::ReadOnly => {
                let forks = self.fork(fs.last_write, 2);
                fs.last_write = forks[1];
                forks[0]
            }
            Privilege::ReadWrite => self.merge(&[fs.last_read, fs.last_write]),
            Privilege::Reduce(_) => {
                let forks = self.fork(fs.last_write, 2);
                fs.last_write = forks[1];
                forks[0]
            }
        }
    }

    /// Fold an access's completion signal back into the field's tracked
    /// signals.
    pub fn complete(&self, fs: &mut FieldSignals, privilege: Privilege, done: SignalId) {
        match privilege {
            Privilege::ReadOnly => {
                fs.last_read = self.merge(&[fs.last_read, done]);
            }
            Privilege::ReadWrite => {
                let forks = self.fork(done, 2);
                fs.last_read = forks[0];
                fs.last_write = forks[1];
            }
            Privilege::Reduce(_) => {
                fs.last_write = self.merge(&[fs.last_write, done]);
            }
        }
    }

    /// Launch a task against an ordered list of field accesses: collect the
    /// inputs per the discipline, run `f` on `worker` once they all fire,
    /// and fold the completion back into every field.
    pub fn launch_task(
        &self,
        accesses: &mut [(&mut FieldSignals, Privilege)],
        worker: usize,
        f: Task,
    ) -> SignalId {
        let inputs: Vec<SignalId> = accesses
            .iter_mut()
            .map(|(fs, p)| self.acquire(fs, *p))
            .collect();
        let input = self.merge(&inputs);
        let done = self.exec(input, worker, f);
        for (fs, p) in accesses.iter_mut() {
            self.complete(fs, *p, done);
        }
        done
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.worker_txs.clear();
        for h in self.handles.drain(..) {
            let _ = h.join();
        }
    }
}

/// The two signals every field tracks.
#[derive(Clone, Copy, Debug)]
pub struct FieldSignals {
    pub last_read: SignalId,
    pub last_write: SignalId,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reduce::ReduceOp;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn source_is_triggered_and_merge_waits() {
        let s = Scheduler::new(1);
        let a = s.source();
        let b = s.fork(a, 2);
        assert!(s.is_triggered(b[0]) && s.is_triggered(b[1]));

        let done = s.exec(b[0], 0, Box::new(|| {}));
        let m = s.merge(&[b[1], done]);
        assert!(!s.is_triggered(m));
        s.wait(m);
        assert!(s.is_triggered(m));
    }

    #[test]
    fn exec_ordering_through_field_discipline() {
        let s = Scheduler::new(1);
        let mut fs = s.field_signals();
        let log = Arc::new(AtomicUsize::new(0));

        // writer sets 1, reader must observe it
        let l1 = Arc::clone(&log);
        let done_w = {
            let input = s.acquire(&mut fs, Privilege::ReadWrite);
            let d = s.exec(input, 0, Box::new(move || {
                l1.store(1, Ordering::SeqCst);
            }));
            s.complete(&mut fs, Privilege::ReadWrite, d);
            d
        };
        let l2 = Arc::clone(&log);
        let observed = Arc::new(AtomicUsize::new(0));
        let o2 = Arc::clone(&observed);
        let done_r = {
            let input = s.acquire(&mut fs, Privilege::ReadOnly);
            let d = s.exec(input, 0, Box::new(move || {
                o2.store(l2.load(Ordering::SeqCst), Ordering::SeqCst);
            }));
            s.complete(&mut fs, Privilege::ReadOnly, d);
            d
        };
        s.wait(done_w);
        s.wait(done_r);
        assert_eq!(observed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn reduces_order_against_writes() {
        let s = Scheduler::new(1);
        let mut fs = s.field_signals();
        let v = Arc::new(AtomicUsize::new(0));

        let v1 = Arc::clone(&v);
        let input = s.acquire(&mut fs, Privilege::ReadWrite);
        let d = s.exec(input, 0, Box::new(move || v1.store(10, Ordering::SeqCst)));
        s.complete(&mut fs, Privilege::ReadWrite, d);

        let v2 = Arc::clone(&v);
        let input = s.acquire(&mut fs, Privilege::Reduce(ReduceOp::Add));
        let d = s.exec(input, 0, Box::new(move || {
            v2.fetch_add(5, Ordering::SeqCst);
        }));
        s.complete(&mut fs, Privilege::Reduce(ReduceOp::Add), d);

        let probe = s.merge(&[fs.last_write]);
        s.wait(probe);
        assert_eq!(v.load(Ordering::SeqCst), 15);
    }
}
