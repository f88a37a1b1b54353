//! Round-robin driver for a fixed pool of browser sessions.
//!
//! One controller loop owns every session and the record sink. Each tick it
//! walks the sessions in order and advances each one's state machine as far
//! as it can go without blocking:
//!
//! ```text
//! Idle -> Assigned -> AwaitingReady -> Extracting -> Idle
//! ```
//!
//! Page loads on one session overlap with probes and extraction on the
//! others. Only the controller writes to the sink.

use std::collections::VecDeque;

use indicatif::ProgressBar;
use tokio::time::Instant;
use tracing::{debug, info, info_span, warn, Instrument, Span};

use crate::browser::Page;
use crate::config::{PoolSettings, RetrySettings};
use crate::error::{ErrorKind, HarvestError, Result};
use crate::ledger::{Record, RecordSink};
use crate::retry::RetryPolicy;
use crate::ui::Ui;
use crate::workflow::Workflow;

/// One unit of work: the key to harvest and, in update mode, the stored row.
#[derive(Debug, Clone)]
pub struct Task {
    pub id: String,
    pub prior: Option<Record>,
}

impl Task {
    pub fn new(id: impl Into<String>) -> Self {
        Task {
            id: id.into(),
            prior: None,
        }
    }
}

#[derive(Debug)]
enum Phase {
    Idle,
    Assigned { task: Task, attempt: u32 },
    AwaitingReady { task: Task, since: Instant, attempt: u32 },
    Extracting(Task),
}

impl Phase {
    fn is_idle(&self) -> bool {
        matches!(self, Phase::Idle)
    }
}

struct Session<P: Page> {
    ui: Ui<P>,
    phase: Phase,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub completed: usize,
    pub failed: usize,
    /// Most sessions busy at the end of any tick.
    pub peak_busy: usize,
}

/// Retry policy for issuing navigation. Page loads can fail at the driver
/// level without the session being gone, so those count as transient too.
pub fn navigation_retry(settings: &RetrySettings) -> RetryPolicy {
    let mut kinds = ErrorKind::TRANSIENT.to_vec();
    kinds.extend([ErrorKind::Navigation, ErrorKind::Driver]);
    RetryPolicy::from_settings(settings).with_transient(&kinds)
}

pub struct Scheduler<'w, P: Page> {
    sessions: Vec<Session<P>>,
    workflow: &'w dyn Workflow<P>,
    pool: PoolSettings,
    nav_retry: RetryPolicy,
    progress: ProgressBar,
}

impl<'w, P: Page> Scheduler<'w, P> {
    pub fn new(
        sessions: Vec<Ui<P>>,
        workflow: &'w dyn Workflow<P>,
        pool: PoolSettings,
        nav_retry: RetryPolicy,
    ) -> Self {
        Scheduler {
            sessions: sessions
                .into_iter()
                .map(|ui| Session {
                    ui,
                    phase: Phase::Idle,
                })
                .collect(),
            workflow,
            pool,
            nav_retry,
            progress: ProgressBar::hidden(),
        }
    }

    pub fn with_progress(mut self, progress: ProgressBar) -> Self {
        self.progress = progress;
        self
    }

    /// Drain `tasks` through the pool. Per-task failures go to the sink and
    /// the run continues; a fatal error stops it. The sink is flushed either
    /// way.
    pub async fn run(&mut self, tasks: Vec<Task>, sink: &mut dyn RecordSink) -> Result<RunSummary> {
        if self.sessions.is_empty() {
            return Err(HarvestError::SessionLost("no browser sessions".into()));
        }
        let mut queue: VecDeque<Task> = tasks.into();
        info!(
            "Harvesting {} tasks with {} sessions",
            queue.len(),
            self.sessions.len()
        );
        self.progress.set_length(queue.len() as u64);

        let result = self.drive(&mut queue, sink).await;
        let flushed = sink.flush();
        self.progress.finish_and_clear();

        let summary = match result {
            Ok(s) => s,
            Err(e) => {
                warn!("Run aborted with {} tasks still queued: {}", queue.len(), e);
                return Err(e);
            }
        };
        flushed?;
        info!(
            "{} tasks completed, {} failed",
            summary.completed, summary.failed
        );
        Ok(summary)
    }

    async fn drive(
        &mut self,
        queue: &mut VecDeque<Task>,
        sink: &mut dyn RecordSink,
    ) -> Result<RunSummary> {
        let mut summary = RunSummary::default();
        loop {
            for i in 0..self.sessions.len() {
                let phase = std::mem::replace(&mut self.sessions[i].phase, Phase::Idle);
                let next = self.advance(i, phase, queue, sink, &mut summary).await?;
                self.sessions[i].phase = next;
            }

            let busy = self.sessions.iter().filter(|s| !s.phase.is_idle()).count();
            summary.peak_busy = summary.peak_busy.max(busy);
            if busy == 0 && queue.is_empty() {
                return Ok(summary);
            }
            tokio::time::sleep(self.pool.tick()).await;
        }
    }

    /// Move one session forward until it has to wait on the page.
    async fn advance(
        &self,
        i: usize,
        mut phase: Phase,
        queue: &mut VecDeque<Task>,
        sink: &mut dyn RecordSink,
        summary: &mut RunSummary,
    ) -> Result<Phase> {
        let ui = &self.sessions[i].ui;
        loop {
            phase = match phase {
                Phase::Idle => match queue.pop_front() {
                    Some(task) => {
                        debug!(parent: ui.span(), "Assigned {}", task.id);
                        Phase::Assigned { task, attempt: 1 }
                    }
                    None => return Ok(Phase::Idle),
                },

                Phase::Assigned { task, attempt } => {
                    let label = format!("navigate to {}", task.id);
                    let started = self
                        .nav_retry
                        .run(&label, |_| self.workflow.start(ui, &task))
                        .instrument(task_span(ui, &task))
                        .await;
                    return match started {
                        Ok(()) => Ok(Phase::AwaitingReady {
                            task,
                            since: Instant::now(),
                            attempt,
                        }),
                        Err(e) if e.is_fatal() => Err(e),
                        Err(e) => {
                            self.fail(&task, &e, sink, summary)?;
                            Ok(Phase::Idle)
                        }
                    };
                }

                Phase::AwaitingReady {
                    task,
                    since,
                    attempt,
                } => {
                    let ready = match self
                        .workflow
                        .probe_ready(ui, &task)
                        .instrument(task_span(ui, &task))
                        .await
                    {
                        Ok(r) => r,
                        Err(e) if e.is_fatal() => return Err(e),
                        Err(e) => {
                            debug!(parent: ui.span(), "Probe for {} failed: {}", task.id, e);
                            false
                        }
                    };
                    if ready {
                        Phase::Extracting(task)
                    } else if since.elapsed() < self.pool.ready_timeout() {
                        return Ok(Phase::AwaitingReady {
                            task,
                            since,
                            attempt,
                        });
                    } else if attempt < self.pool.task_tries {
                        warn!(
                            parent: ui.span(),
                            "{} not ready after {:.0}s, navigating again ({}/{})",
                            task.id,
                            self.pool.ready_timeout().as_secs_f64(),
                            attempt + 1,
                            self.pool.task_tries
                        );
                        Phase::Assigned {
                            task,
                            attempt: attempt + 1,
                        }
                    } else {
                        let e = HarvestError::timeout(
                            format!("{} to load", task.id),
                            self.pool.ready_timeout(),
                        );
                        self.fail(&task, &e, sink, summary)?;
                        return Ok(Phase::Idle);
                    }
                }

                Phase::Extracting(task) => {
                    let extracted = self
                        .workflow
                        .extract(ui, &task)
                        .instrument(task_span(ui, &task))
                        .await;
                    match extracted {
                        Ok(record) => {
                            info!(parent: ui.span(), "Harvested {}", task.id);
                            sink.record(record)?;
                            summary.completed += 1;
                            self.progress.inc(1);
                        }
                        Err(e) if e.is_fatal() => return Err(e),
                        Err(e) => self.fail(&task, &e, sink, summary)?,
                    }
                    return Ok(Phase::Idle);
                }
            };
        }
    }

    fn fail(
        &self,
        task: &Task,
        error: &HarvestError,
        sink: &mut dyn RecordSink,
        summary: &mut RunSummary,
    ) -> Result<()> {
        warn!("Task {} failed: {}", task.id, error);
        sink.failed(&task.id, &format!("Error: {}", error))?;
        summary.failed += 1;
        self.progress.inc(1);
        Ok(())
    }
}

fn task_span<P: Page>(ui: &Ui<P>, task: &Task) -> Span {
    info_span!(parent: ui.span(), "task", task = %task.id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakePage;
    use async_trait::async_trait;
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct Script {
        /// Probes answered "not yet" before a task is ready.
        slow: HashMap<String, u32>,
        never_ready: HashSet<String>,
        flaky_start: HashSet<String>,
        broken_extract: HashSet<String>,
        lose_session_on: Option<String>,
    }

    #[derive(Default)]
    struct Log {
        starts: Vec<String>,
        probes: HashMap<String, u32>,
        open: HashSet<String>,
        peak_open: usize,
    }

    #[derive(Default)]
    struct Recorder {
        script: Script,
        log: Mutex<Log>,
    }

    #[async_trait]
    impl Workflow<FakePage> for Recorder {
        async fn start(&self, _ui: &Ui<FakePage>, task: &Task) -> Result<()> {
            let mut log = self.log.lock().unwrap();
            let first = !log.starts.contains(&task.id);
            log.starts.push(task.id.clone());
            if self.script.lose_session_on.as_deref() == Some(task.id.as_str()) {
                return Err(HarvestError::SessionLost("window closed".into()));
            }
            if first && self.script.flaky_start.contains(&task.id) {
                return Err(HarvestError::Navigation {
                    url: task.id.clone(),
                    reason: "net::ERR_CONNECTION_RESET".into(),
                });
            }
            log.open.insert(task.id.clone());
            log.peak_open = log.peak_open.max(log.open.len());
            Ok(())
        }

        async fn probe_ready(&self, _ui: &Ui<FakePage>, task: &Task) -> Result<bool> {
            let mut log = self.log.lock().unwrap();
            let n = log.probes.entry(task.id.clone()).or_default();
            *n += 1;
            if self.script.never_ready.contains(&task.id) {
                return Ok(false);
            }
            Ok(*n > self.script.slow.get(&task.id).copied().unwrap_or(0))
        }

        async fn extract(&self, _ui: &Ui<FakePage>, task: &Task) -> Result<Record> {
            self.log.lock().unwrap().open.remove(&task.id);
            if self.script.broken_extract.contains(&task.id) {
                return Err(HarvestError::NotFound("billing".into()));
            }
            Ok(Record::new(task.id.as_str()).with("ResStatus", "Confirmed"))
        }
    }

    #[derive(Default)]
    struct VecSink {
        records: Vec<Record>,
        failures: Vec<(String, String)>,
        flushes: u32,
    }

    impl RecordSink for VecSink {
        fn record(&mut self, record: Record) -> Result<()> {
            self.records.push(record);
            Ok(())
        }

        fn failed(&mut self, key: &str, error: &str) -> Result<()> {
            self.failures.push((key.to_string(), error.to_string()));
            Ok(())
        }

        fn flush(&mut self) -> Result<()> {
            self.flushes += 1;
            Ok(())
        }
    }

    fn sessions(n: usize) -> Vec<Ui<FakePage>> {
        (0..n)
            .map(|_| {
                Ui::new(
                    FakePage::new(),
                    RetryPolicy::default(),
                    Default::default(),
                    Span::none(),
                )
            })
            .collect()
    }

    fn pool(size: usize) -> PoolSettings {
        PoolSettings {
            size,
            batch_size: 20,
            tick_ms: 500,
            task_tries: 2,
            ready_timeout_secs: 2,
        }
    }

    fn nav_retry() -> RetryPolicy {
        navigation_retry(&RetrySettings {
            tries: 2,
            delay_ms: 10,
            backoff: 2.0,
        })
    }

    fn tasks(ids: &[&str]) -> Vec<Task> {
        ids.iter().map(|id| Task::new(*id)).collect()
    }

    fn keys(sink: &VecSink) -> Vec<String> {
        let mut k: Vec<String> = sink.records.iter().map(|r| r.key().to_string()).collect();
        k.sort();
        k
    }

    #[tokio::test(start_paused = true)]
    async fn pool_bounds_in_flight_and_starts_each_task_once() {
        let mut wf = Recorder::default();
        // probes come every 500ms; three misses still land inside the 2s timeout
        wf.script.slow.insert("t3".into(), 3);
        wf.script.slow.insert("t5".into(), 2);
        let ids = ["t1", "t2", "t3", "t4", "t5", "t6", "t7"];

        let mut sink = VecSink::default();
        let summary = Scheduler::new(sessions(3), &wf, pool(3), nav_retry())
            .run(tasks(&ids), &mut sink)
            .await
            .unwrap();

        assert_eq!(summary.completed, 7);
        assert_eq!(summary.failed, 0);
        assert!(summary.peak_busy <= 3);

        let log = wf.log.lock().unwrap();
        assert_eq!(log.peak_open, 3);
        let mut starts = log.starts.clone();
        starts.sort();
        assert_eq!(starts, ids);
        assert_eq!(keys(&sink), ids);
        assert_eq!(sink.flushes, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_page_is_renavigated_then_failed() {
        let mut wf = Recorder::default();
        wf.script.never_ready.insert("x".into());

        let mut sink = VecSink::default();
        let summary = Scheduler::new(sessions(1), &wf, pool(1), nav_retry())
            .run(tasks(&["x", "y"]), &mut sink)
            .await
            .unwrap();

        assert_eq!(summary.completed, 1);
        assert_eq!(summary.failed, 1);
        let log = wf.log.lock().unwrap();
        assert_eq!(log.starts, vec!["x", "x", "y"]);
        assert_eq!(
            sink.failures,
            vec![(
                "x".to_string(),
                "Error: timed out after 2.0s waiting for x to load".to_string()
            )]
        );
        assert_eq!(keys(&sink), vec!["y"]);
    }

    #[tokio::test(start_paused = true)]
    async fn extraction_error_is_recorded_and_run_continues() {
        let mut wf = Recorder::default();
        wf.script.broken_extract.insert("b".into());

        let mut sink = VecSink::default();
        let summary = Scheduler::new(sessions(2), &wf, pool(2), nav_retry())
            .run(tasks(&["a", "b", "c"]), &mut sink)
            .await
            .unwrap();

        assert_eq!(summary.failed, 1);
        assert_eq!(
            sink.failures,
            vec![("b".to_string(), "Error: element not found: billing".to_string())]
        );
        assert_eq!(keys(&sink), vec!["a", "c"]);
    }

    #[tokio::test(start_paused = true)]
    async fn navigation_failure_is_retried() {
        let mut wf = Recorder::default();
        wf.script.flaky_start.insert("n".into());

        let mut sink = VecSink::default();
        let summary = Scheduler::new(sessions(1), &wf, pool(1), nav_retry())
            .run(tasks(&["n"]), &mut sink)
            .await
            .unwrap();

        assert_eq!(summary.completed, 1);
        assert_eq!(wf.log.lock().unwrap().starts, vec!["n", "n"]);
    }

    #[tokio::test(start_paused = true)]
    async fn lost_session_flushes_and_aborts() {
        let mut wf = Recorder::default();
        wf.script.lose_session_on = Some("b".into());

        let mut sink = VecSink::default();
        let err = Scheduler::new(sessions(1), &wf, pool(1), nav_retry())
            .run(tasks(&["a", "b", "c"]), &mut sink)
            .await
            .unwrap_err();

        assert!(err.is_fatal());
        assert_eq!(sink.flushes, 1);
        assert_eq!(keys(&sink), vec!["a"]);
        assert!(!wf.log.lock().unwrap().starts.contains(&"c".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn empty_queue_finishes_without_ticking() {
        let wf = Recorder::default();
        let mut sink = VecSink::default();
        let start = Instant::now();
        let summary = Scheduler::new(sessions(2), &wf, pool(2), nav_retry())
            .run(Vec::new(), &mut sink)
            .await
            .unwrap();
        assert_eq!(summary, RunSummary::default());
        assert_eq!(start.elapsed(), Duration::ZERO);
    }
}
