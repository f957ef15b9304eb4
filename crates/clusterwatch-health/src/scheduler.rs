//! Periodic scheduler — a single actor driving every timer of one engine.
//!
//! Timers live in a min-heap keyed by next fire time. Callers talk to the
//! actor through messages (`add`, `cancel`, `shutdown`); each is
//! acknowledged, so once `cancel` returns the actor will not start another
//! firing for that job.
//!
//! A firing runs on its own task and is never awaited by the actor: a slow
//! check for one cluster cannot delay any other timer. A job whose previous
//! firing is still running skips its turn instead of stacking up.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tracing::{debug, error, info};

use clusterwatch_bus::BoxFuture;
use clusterwatch_state::ClusterId;

use crate::error::{HealthError, HealthResult};

/// Something the scheduler fires periodically.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Job {
    /// The engine's own liveness tick.
    Heartbeat,
    /// A health check for one cluster.
    Check(ClusterId),
}

/// Callback run for every firing.
pub type FireFn = Arc<dyn Fn(Job) -> BoxFuture<'static, ()> + Send + Sync>;

/// What `shutdown` found when it drained in-flight firings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Firings that finished within the grace period.
    pub completed: usize,
    /// Firings still running at the deadline, aborted.
    pub aborted: usize,
}

enum Command {
    Add {
        job: Job,
        period: Duration,
        ack: oneshot::Sender<bool>,
    },
    Cancel {
        job: Job,
        ack: oneshot::Sender<bool>,
    },
    List {
        reply: oneshot::Sender<Vec<Job>>,
    },
    Shutdown {
        grace: Duration,
        ack: oneshot::Sender<ShutdownReport>,
    },
}

/// Handle to a running scheduler actor.
pub struct Scheduler {
    tx: mpsc::Sender<Command>,
    handle: JoinHandle<()>,
}

impl Scheduler {
    /// Spawn the actor. `fire` is invoked once per due firing.
    pub fn spawn(fire: FireFn) -> Self {
        let (tx, rx) = mpsc::channel(256);
        let actor = Actor {
            fire,
            heap: BinaryHeap::new(),
            timers: HashMap::new(),
            next_seq: 0,
            inflight: JoinSet::new(),
        };
        let handle = tokio::spawn(actor.run(rx));
        Self { tx, handle }
    }

    /// Install (or replace) a timer. First firing is one `period` from now.
    pub async fn add(&self, job: Job, period: Duration) -> HealthResult<()> {
        if period.is_zero() {
            return Err(HealthError::InvalidRequest(format!(
                "{job:?}: period must be positive"
            )));
        }
        let (ack, rx) = oneshot::channel();
        self.send(Command::Add {
            job: job.clone(),
            period,
            ack,
        })
        .await?;
        match rx.await {
            Ok(true) => Ok(()),
            Ok(false) => Err(HealthError::InvalidRequest(format!(
                "{job:?}: period {period:?} is out of range"
            ))),
            Err(_) => Err(HealthError::NotRunning),
        }
    }

    /// Remove a timer. Returns true if one was installed.
    pub async fn cancel(&self, job: Job) -> HealthResult<bool> {
        let (ack, rx) = oneshot::channel();
        self.send(Command::Cancel { job, ack }).await?;
        rx.await.map_err(|_| HealthError::NotRunning)
    }

    /// Jobs with an installed timer, sorted.
    pub async fn scheduled(&self) -> HealthResult<Vec<Job>> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::List { reply }).await?;
        rx.await.map_err(|_| HealthError::NotRunning)
    }

    /// Stop all timers and wait up to `grace` for in-flight firings.
    ///
    /// Firings still running at the deadline are aborted. Once this
    /// returns, no callback is running and none will start.
    pub async fn shutdown(self, grace: Duration) -> ShutdownReport {
        let (ack, rx) = oneshot::channel();
        let report = if self.tx.send(Command::Shutdown { grace, ack }).await.is_ok() {
            rx.await.unwrap_or_default()
        } else {
            ShutdownReport::default()
        };
        if let Err(e) = self.handle.await {
            error!(error = %e, "scheduler task ended abnormally");
        }
        report
    }

    async fn send(&self, cmd: Command) -> HealthResult<()> {
        self.tx.send(cmd).await.map_err(|_| HealthError::NotRunning)
    }
}

struct Timer {
    period: Duration,
    /// Matches the heap entry that is currently live for this job.
    seq: u64,
    /// Set while a firing of this job is running.
    busy: Arc<AtomicBool>,
}

/// Clears a job's busy flag when its firing ends, including on abort.
struct BusyGuard(Arc<AtomicBool>);

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

struct Actor {
    fire: FireFn,
    /// (due, seq, job). Entries whose seq no longer matches `timers` are stale.
    heap: BinaryHeap<Reverse<(Instant, u64, Job)>>,
    timers: HashMap<Job, Timer>,
    next_seq: u64,
    inflight: JoinSet<()>,
}

impl Actor {
    async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        debug!("scheduler started");
        let mut shutdown = None;

        loop {
            let next_due = self.heap.peek().map(|Reverse((due, _, _))| *due);
            // Disabled branches are still constructed, so give sleep_until a value.
            let wake_at = next_due.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));

            tokio::select! {
                cmd = rx.recv() => {
                    // `None` means every handle was dropped.
                    let Some(cmd) = cmd else { break };
                    if let Some(stop) = self.apply(cmd) {
                        shutdown = Some(stop);
                        break;
                    }
                }
                _ = tokio::time::sleep_until(wake_at), if next_due.is_some() => {
                    self.fire_due();
                }
                Some(joined) = self.inflight.join_next(), if !self.inflight.is_empty() => {
                    if let Err(e) = joined {
                        error!(error = %e, "scheduled firing panicked");
                    }
                }
            }
        }

        self.heap.clear();
        self.timers.clear();
        let grace = shutdown.as_ref().map(|(g, _)| *g).unwrap_or(Duration::ZERO);
        let report = self.drain(grace).await;
        info!(completed = report.completed, aborted = report.aborted, "scheduler stopped");
        if let Some((_, ack)) = shutdown {
            let _ = ack.send(report);
        }
    }

    /// Apply one command. Returns the shutdown request, if that is what it was.
    fn apply(&mut self, cmd: Command) -> Option<(Duration, oneshot::Sender<ShutdownReport>)> {
        match cmd {
            Command::Add { job, period, ack } => {
                let Some(due) = Instant::now().checked_add(period) else {
                    let _ = ack.send(false);
                    return None;
                };
                let seq = self.next_seq;
                self.next_seq += 1;
                let busy = self
                    .timers
                    .remove(&job)
                    .map(|old| old.busy)
                    .unwrap_or_default();
                self.heap.push(Reverse((due, seq, job.clone())));
                debug!(?job, ?period, "timer installed");
                self.timers.insert(job, Timer { period, seq, busy });
                let _ = ack.send(true);
            }
            Command::Cancel { job, ack } => {
                // The heap entry goes stale and is skipped when it surfaces.
                let existed = self.timers.remove(&job).is_some();
                if existed {
                    debug!(?job, "timer cancelled");
                }
                let _ = ack.send(existed);
            }
            Command::List { reply } => {
                let mut jobs: Vec<Job> = self.timers.keys().cloned().collect();
                jobs.sort();
                let _ = reply.send(jobs);
            }
            Command::Shutdown { grace, ack } => return Some((grace, ack)),
        }
        None
    }

    fn fire_due(&mut self) {
        let now = Instant::now();
        while let Some(Reverse((due, _, _))) = self.heap.peek() {
            if *due > now {
                break;
            }
            let Some(Reverse((due, seq, job))) = self.heap.pop() else {
                break;
            };
            let Some(timer) = self.timers.get(&job) else {
                continue;
            };
            if timer.seq != seq {
                continue;
            }

            // Next slot on the original cadence; missed slots are skipped.
            let next = due
                .checked_add(timer.period)
                .filter(|next| *next > now)
                .or_else(|| now.checked_add(timer.period));
            let Some(next) = next else {
                error!(?job, period = ?timer.period, "period out of range, dropping timer");
                self.timers.remove(&job);
                continue;
            };
            self.heap.push(Reverse((next, seq, job.clone())));

            if timer.busy.swap(true, Ordering::AcqRel) {
                debug!(?job, "previous firing still running, skipping");
                continue;
            }
            let guard = BusyGuard(Arc::clone(&timer.busy));
            let fut = (self.fire)(job);
            self.inflight.spawn(async move {
                let _guard = guard;
                fut.await;
            });
        }
    }

    async fn drain(&mut self, grace: Duration) -> ShutdownReport {
        let mut report = ShutdownReport::default();
        let finished = tokio::time::timeout(grace, async {
            while let Some(joined) = self.inflight.join_next().await {
                if let Err(e) = joined {
                    error!(error = %e, "scheduled firing panicked");
                }
                report.completed += 1;
            }
        })
        .await;

        if finished.is_err() {
            report.aborted = self.inflight.len();
            self.inflight.abort_all();
            while self.inflight.join_next().await.is_some() {}
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Log {
        fired: Mutex<Vec<(Job, Instant)>>,
    }

    impl Log {
        fn count(&self, job: &Job) -> usize {
            self.fired.lock().unwrap().iter().filter(|(j, _)| j == job).count()
        }
    }

    fn recording(log: Arc<Log>, hold: Duration) -> FireFn {
        Arc::new(move |job| {
            log.fired.lock().unwrap().push((job, Instant::now()));
            Box::pin(async move {
                tokio::time::sleep(hold).await;
            })
        })
    }

    fn check(id: &str) -> Job {
        Job::Check(id.to_string())
    }

    #[tokio::test(start_paused = true)]
    async fn first_firing_waits_one_period() {
        let log = Arc::new(Log::default());
        let sched = Scheduler::spawn(recording(log.clone(), Duration::ZERO));
        sched.add(check("c1"), Duration::from_secs(10)).await.unwrap();

        tokio::time::sleep(Duration::from_secs(9)).await;
        assert_eq!(log.count(&check("c1")), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(log.count(&check("c1")), 1);

        tokio::time::sleep(Duration::from_secs(24)).await;
        assert_eq!(log.count(&check("c1")), 3);

        sched.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn firings_keep_cadence() {
        let log = Arc::new(Log::default());
        let start = Instant::now();
        let sched = Scheduler::spawn(recording(log.clone(), Duration::ZERO));
        sched.add(check("c1"), Duration::from_secs(10)).await.unwrap();

        tokio::time::sleep(Duration::from_secs(45)).await;
        let offsets: Vec<u64> = log
            .fired
            .lock()
            .unwrap()
            .iter()
            .map(|(_, at)| at.duration_since(start).as_secs())
            .collect();
        assert_eq!(offsets, vec![10, 20, 30, 40]);

        sched.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_stops_future_firings() {
        let log = Arc::new(Log::default());
        let sched = Scheduler::spawn(recording(log.clone(), Duration::ZERO));
        sched.add(check("c1"), Duration::from_secs(10)).await.unwrap();
        sched.add(check("c2"), Duration::from_secs(10)).await.unwrap();

        tokio::time::sleep(Duration::from_secs(15)).await;
        assert!(sched.cancel(check("c1")).await.unwrap());
        assert!(!sched.cancel(check("c1")).await.unwrap());

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(log.count(&check("c1")), 1);
        assert_eq!(log.count(&check("c2")), 4);
        assert_eq!(sched.scheduled().await.unwrap(), vec![check("c2")]);

        sched.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn re_adding_replaces_period() {
        let log = Arc::new(Log::default());
        let sched = Scheduler::spawn(recording(log.clone(), Duration::ZERO));
        sched.add(check("c1"), Duration::from_secs(10)).await.unwrap();
        sched.add(check("c1"), Duration::from_secs(60)).await.unwrap();

        tokio::time::sleep(Duration::from_secs(59)).await;
        assert_eq!(log.count(&check("c1")), 0);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(log.count(&check("c1")), 1);

        sched.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn slow_firing_does_not_block_other_timers() {
        let log = Arc::new(Log::default());
        let slow_log = log.clone();
        let fire: FireFn = Arc::new(move |job: Job| {
            slow_log.fired.lock().unwrap().push((job.clone(), Instant::now()));
            Box::pin(async move {
                if job == Job::Check("slow".to_string()) {
                    tokio::time::sleep(Duration::from_secs(1000)).await;
                }
            })
        });
        let sched = Scheduler::spawn(fire);
        sched.add(check("slow"), Duration::from_secs(5)).await.unwrap();
        sched.add(check("fast"), Duration::from_secs(10)).await.unwrap();

        tokio::time::sleep(Duration::from_secs(52)).await;
        assert_eq!(log.count(&check("fast")), 5);
        // Still running from its first firing, so later turns were skipped.
        assert_eq!(log.count(&check("slow")), 1);

        let report = sched.shutdown(Duration::from_secs(1)).await;
        assert_eq!(report.aborted, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_waits_for_inflight_then_stops_firing() {
        let log = Arc::new(Log::default());
        let sched = Scheduler::spawn(recording(log.clone(), Duration::from_secs(3)));
        sched.add(check("c1"), Duration::from_secs(10)).await.unwrap();

        // Firing at t=10 holds until t=13.
        tokio::time::sleep(Duration::from_secs(11)).await;
        let report = sched.shutdown(Duration::from_secs(5)).await;
        assert_eq!(report, ShutdownReport { completed: 1, aborted: 0 });

        tokio::time::sleep(Duration::from_secs(100)).await;
        assert_eq!(log.count(&check("c1")), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_period_rejected() {
        let sched = Scheduler::spawn(recording(Arc::new(Log::default()), Duration::ZERO));
        let err = sched.add(check("c1"), Duration::ZERO).await.unwrap_err();
        assert!(matches!(err, HealthError::InvalidRequest(_)));
        sched.shutdown(Duration::ZERO).await;
    }

    #[tokio::test(start_paused = true)]
    async fn out_of_range_period_rejected_and_actor_survives() {
        let log = Arc::new(Log::default());
        let sched = Scheduler::spawn(recording(log.clone(), Duration::ZERO));
        let err = sched
            .add(check("huge"), Duration::from_secs(u64::MAX))
            .await
            .unwrap_err();
        assert!(matches!(err, HealthError::InvalidRequest(_)));

        sched.add(check("c1"), Duration::from_secs(10)).await.unwrap();
        assert_eq!(sched.scheduled().await.unwrap(), vec![check("c1")]);
        sched.shutdown(Duration::ZERO).await;
    }
}
