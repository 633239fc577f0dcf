use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use gearcheck_broker::{AssignedJob, BrokerError, Completion, JobSource, TaskPoster};
use gearcheck_common::{decode, TransportMode};
use gearcheck_sandbox::Sandbox;
use tokio::sync::Notify;
use tracing::{debug, error, info, trace, warn};

use crate::config::{queue_names, Mode, WorkerConfig, DUMMY_QUEUE};
use crate::error::WorkerError;
use crate::lifecycle::LifecycleState;
use crate::pool::{JobState, PoolLink};
use crate::reporter::{ReportStatus, Reporter};

/// Why [`WorkerLoop::run`] returned. Every variant is a clean exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    /// Per-process job cap reached.
    JobCapReached,
    /// SIGINT or SIGTERM received.
    Shutdown,
    /// Pooled mode: no job arrived within the idle window.
    IdleTimeout,
    /// Pooled mode: a check ran into its timeout.
    CheckTimedOut,
}

impl LoopExit {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoopExit::JobCapReached => "job cap reached",
            LoopExit::Shutdown => "shutdown requested",
            LoopExit::IdleTimeout => "idle timeout",
            LoopExit::CheckTimedOut => "check timed out",
        }
    }
}

/// Shutdown request shared between signal handlers and the loop.
#[derive(Debug, Clone, Default)]
pub struct Shutdown {
    requested: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        if !self.requested.swap(true, Ordering::SeqCst) {
            self.notify.notify_waiters();
        }
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    /// Resolves once [`Shutdown::request`] has been called.
    pub async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_requested() {
                return;
            }
            notified.await;
        }
    }
}

enum Fetched {
    Job(AssignedJob),
    Idle,
    Failed(BrokerError),
}

enum Flow {
    Continue,
    Exit(LoopExit),
}

/// Sequential fetch, run, report loop. One job in flight at a time.
pub struct WorkerLoop<S: JobSource, P: TaskPoster> {
    source: S,
    reporter: Reporter<P>,
    sandbox: Sandbox,
    transport: TransportMode,
    queues: Vec<String>,
    pool: PoolLink,
    state: LifecycleState,
    idle_timeout: Option<Duration>,
    shutdown: Shutdown,
}

impl<S: JobSource, P: TaskPoster> WorkerLoop<S, P> {
    pub fn new(
        config: &WorkerConfig,
        source: S,
        reporter: Reporter<P>,
        pool: PoolLink,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            source,
            reporter,
            sandbox: Sandbox::new(config.sandbox_settings()),
            transport: config.transport,
            queues: queue_names(config),
            pool,
            state: LifecycleState::new(config.mode, config.max_jobs),
            idle_timeout: config.idle_timeout(),
            shutdown,
        }
    }

    pub fn state(&self) -> &LifecycleState {
        &self.state
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn reporter(&self) -> &Reporter<P> {
        &self.reporter
    }

    pub fn sandbox(&self) -> &Sandbox {
        &self.sandbox
    }

    /// Register every job queue, then the placeholder queue last. A failed
    /// registration does not stop the rest, so a reconnect replays them all.
    async fn register(&mut self) -> Result<(), BrokerError> {
        let mut failure = None;
        for queue in self.queues.iter().map(String::as_str).chain([DUMMY_QUEUE]) {
            match self.source.register(queue).await {
                Ok(()) => debug!(queue, "registered queue"),
                Err(err) => {
                    warn!(queue, "failed to register queue: {}", err);
                    failure = failure.or(Some(err));
                }
            }
        }
        failure.map_or(Ok(()), Err)
    }

    pub async fn run(&mut self) -> Result<LoopExit, WorkerError> {
        info!(
            queues = ?self.queues,
            mode = self.state.mode.as_str(),
            "worker loop started"
        );
        if let Err(err) = self.register().await {
            error!("queue registration failed: {}", err);
            if let Some(exit) = self.recover().await {
                return Ok(exit);
            }
        }

        loop {
            if self.shutdown.is_requested() {
                return Ok(LoopExit::Shutdown);
            }

            let shutdown = self.shutdown.clone();
            let fetched = tokio::select! {
                biased;
                _ = shutdown.wait() => return Ok(LoopExit::Shutdown),
                fetched = fetch(&mut self.source, self.idle_timeout) => fetched,
            };

            match fetched {
                Fetched::Job(assigned) => {
                    self.state.backoff.reset();
                    if let Flow::Exit(exit) = self.handle(assigned).await? {
                        return Ok(exit);
                    }
                }
                Fetched::Idle => {
                    info!(
                        idle_secs = self.idle_timeout.map(|d| d.as_secs()).unwrap_or(0),
                        "no job within idle window, exiting"
                    );
                    return Ok(LoopExit::IdleTimeout);
                }
                Fetched::Failed(err) => {
                    error!("worker error: {}", err);
                    if let Some(exit) = self.recover().await {
                        return Ok(exit);
                    }
                }
            }
        }
    }

    /// Recreate both broker sides, then sleep the current backoff.
    async fn recover(&mut self) -> Option<LoopExit> {
        if let Err(err) = self.source.reconnect().await {
            warn!("failed to reconnect worker: {}", err);
        }
        if let Err(err) = self.reporter.client_mut().reconnect().await {
            warn!("failed to reconnect client: {}", err);
        }

        let delay = self.state.backoff.next_delay();
        info!(delay_secs = delay.as_secs(), "backing off after broker error");
        let shutdown = self.shutdown.clone();
        tokio::select! {
            _ = shutdown.wait() => Some(LoopExit::Shutdown),
            _ = tokio::time::sleep(delay) => None,
        }
    }

    async fn handle(&mut self, assigned: AssignedJob) -> Result<Flow, WorkerError> {
        if assigned.function == DUMMY_QUEUE {
            debug!(handle = %assigned.handle, "placeholder job acknowledged");
            self.acknowledge(&assigned, Completion::Complete(Vec::new()))
                .await;
            return Ok(Flow::Continue);
        }

        self.pool.notify(JobState::Start)?;
        let flow = self.process(&assigned).await;
        self.pool.notify(JobState::End)?;
        Ok(flow)
    }

    async fn process(&mut self, assigned: &AssignedJob) -> Flow {
        trace!(
            handle = %assigned.handle,
            queue = %assigned.function,
            bytes = assigned.payload.len(),
            "got new job"
        );

        let plaintext = match self.transport.decode(&assigned.payload) {
            Ok(plaintext) => plaintext,
            Err(err) => {
                warn!(handle = %assigned.handle, "failed to decode job payload: {}", err);
                self.acknowledge(assigned, Completion::Fail).await;
                return Flow::Continue;
            }
        };
        trace!(payload = %String::from_utf8_lossy(&plaintext), "decoded job");

        let job = match decode(&plaintext) {
            Ok(job) => job,
            Err(err) => {
                warn!(handle = %assigned.handle, "failed to parse job: {}", err);
                self.acknowledge(assigned, Completion::Fail).await;
                return Flow::Continue;
            }
        };

        let mut timed_out = false;
        if let Some(execution) = self.sandbox.run(&job).await {
            timed_out = execution.outcome.early_timeout;
            if execution.reportable {
                let status = self.reporter.report(&job, &execution.outcome).await;
                if status == ReportStatus::DeliveryFailed {
                    warn!(
                        host = job.host_name.as_deref().unwrap_or(""),
                        "check result lost"
                    );
                }
            }
        }
        self.acknowledge(assigned, Completion::Complete(Vec::new()))
            .await;

        let cap_reached = self.state.record_job();
        if timed_out && self.state.mode == Mode::Pooled {
            info!("check timed out in pooled mode, exiting");
            return Flow::Exit(LoopExit::CheckTimedOut);
        }
        if cap_reached {
            info!(jobs = self.state.jobs_done(), "job cap reached, exiting");
            return Flow::Exit(LoopExit::JobCapReached);
        }
        Flow::Continue
    }

    /// Tell the server the job is done. A broken connection surfaces on
    /// the next fetch.
    async fn acknowledge(&mut self, assigned: &AssignedJob, completion: Completion) {
        if let Err(err) = self.source.finish(assigned, completion).await {
            warn!(handle = %assigned.handle, "failed to acknowledge job: {}", err);
        }
    }
}

async fn fetch<S: JobSource>(source: &mut S, idle_timeout: Option<Duration>) -> Fetched {
    let result = match idle_timeout {
        Some(window) => match tokio::time::timeout(window, source.fetch()).await {
            Ok(result) => result,
            Err(_) => return Fetched::Idle,
        },
        None => source.fetch().await,
    };
    match result {
        Ok(job) => Fetched::Job(job),
        Err(err) => Fetched::Failed(err),
    }
}
