use std::collections::VecDeque;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use gearcheck_broker::{
    AssignedJob, BrokerClient, BrokerError, Completion, JobSource, Priority, TaskPoster,
};
use gearcheck_common::{Timeval, TransportMode};
use gearcheck_worker::lifecycle::BACKOFF_FLOOR;
use gearcheck_worker::pool::read_counter;
use gearcheck_worker::{LoopExit, Mode, PoolLink, Reporter, Shutdown, WorkerConfig, WorkerLoop};

#[derive(Default)]
struct FakeSource {
    jobs: VecDeque<Result<AssignedJob, BrokerError>>,
    registered: Vec<String>,
    /// Number of upcoming `register` calls that fail after recording.
    failing_registrations: usize,
    finished: Vec<(String, Completion)>,
    reconnects: usize,
}

impl FakeSource {
    fn with_jobs(jobs: Vec<Result<AssignedJob, BrokerError>>) -> Self {
        Self {
            jobs: jobs.into(),
            ..Self::default()
        }
    }
}

#[async_trait]
impl JobSource for FakeSource {
    async fn register(&mut self, queue: &str) -> Result<(), BrokerError> {
        self.registered.push(queue.to_string());
        if self.failing_registrations > 0 {
            self.failing_registrations -= 1;
            return Err(BrokerError::Disconnected("localhost:4730".into()));
        }
        Ok(())
    }

    async fn fetch(&mut self) -> Result<AssignedJob, BrokerError> {
        match self.jobs.pop_front() {
            Some(next) => next,
            // Behaves like a server with an empty queue.
            None => std::future::pending().await,
        }
    }

    async fn finish(&mut self, job: &AssignedJob, completion: Completion) -> Result<(), BrokerError> {
        self.finished.push((job.handle.clone(), completion));
        Ok(())
    }

    async fn reconnect(&mut self) -> Result<(), BrokerError> {
        self.reconnects += 1;
        Ok(())
    }
}

#[derive(Default)]
struct FakePoster {
    posts: Vec<(String, String)>,
    reconnects: usize,
}

#[async_trait]
impl TaskPoster for FakePoster {
    async fn post_background(
        &mut self,
        queue: &str,
        _unique: &str,
        payload: &[u8],
        priority: Priority,
    ) -> Result<String, BrokerError> {
        assert_eq!(priority, Priority::Normal);
        self.posts
            .push((queue.to_string(), String::from_utf8_lossy(payload).into_owned()));
        Ok(format!("H:{}", self.posts.len()))
    }

    fn last_error(&self) -> Option<&str> {
        None
    }

    async fn reconnect(&mut self) -> Result<(), BrokerError> {
        self.reconnects += 1;
        Ok(())
    }
}

fn config() -> WorkerConfig {
    WorkerConfig {
        servers: vec!["localhost".into()],
        hosts: true,
        services: true,
        transport: TransportMode::Plain,
        max_jobs: 0,
        ..WorkerConfig::default()
    }
}

fn job(handle: &str, queue: &str, payload: &str) -> Result<AssignedJob, BrokerError> {
    Ok(AssignedJob::new(handle, queue, payload.as_bytes().to_vec()))
}

fn worker(
    config: &WorkerConfig,
    source: FakeSource,
    pool: PoolLink,
    shutdown: Shutdown,
) -> WorkerLoop<FakeSource, FakePoster> {
    let client = BrokerClient::with_poster(FakePoster::default()).with_retry_delay(Duration::ZERO);
    let reporter = Reporter::new(client, config.transport, config.result_retries, None);
    WorkerLoop::new(config, source, reporter, pool, shutdown)
}

fn posts(worker: &WorkerLoop<FakeSource, FakePoster>) -> &[(String, String)] {
    &worker.reporter().client().poster().posts
}

#[tokio::test]
async fn runs_jobs_until_cap_and_reports_results() {
    let config = WorkerConfig {
        max_jobs: 2,
        hostgroups: vec!["web".into()],
        ..config()
    };
    let source = FakeSource::with_jobs(vec![
        job(
            "H:1",
            "service",
            "type=service\nhost_name=web1\nservice_description=HTTP\nresult_queue=check_results\ncommand_line=echo OK\n",
        ),
        job(
            "H:2",
            "hostgroup_web",
            "type=host\nhost_name=web2\nresult_queue=check_results\ncommand_line=echo DOWN; exit 2\n",
        ),
        job("H:3", "host", "type=host\nhost_name=never\ncommand_line=true\n"),
    ]);
    let mut worker = worker(&config, source, PoolLink::standalone(), Shutdown::new());

    assert_eq!(worker.run().await.unwrap(), LoopExit::JobCapReached);
    assert_eq!(worker.state().jobs_done(), 2);

    let source = worker.source();
    assert_eq!(
        source.registered,
        vec!["host", "service", "hostgroup_web", "dummy"]
    );
    assert_eq!(
        source.finished,
        vec![
            ("H:1".to_string(), Completion::Complete(Vec::new())),
            ("H:2".to_string(), Completion::Complete(Vec::new())),
        ]
    );
    assert_eq!(source.jobs.len(), 1);

    let posts = posts(&worker);
    assert_eq!(posts.len(), 2);
    assert_eq!(posts[0].0, "check_results");
    assert!(posts[0].1.contains("service_description=HTTP\n"));
    assert!(posts[0].1.contains("return_code=0\n"));
    assert!(posts[0].1.ends_with("output=OK\n\n"));
    assert!(posts[1].1.contains("return_code=2\n"));
    assert!(posts[1].1.contains("output=DOWN\n"));
}

#[tokio::test]
async fn undecodable_payload_fails_job_without_result() {
    let config = WorkerConfig {
        transport: TransportMode::Base64,
        max_jobs: 1,
        ..config()
    };
    let source = FakeSource::with_jobs(vec![
        job("H:bad", "host", "%%% not base64 %%%"),
        // "type=host\nhost_name=h\nresult_queue=r\ncommand_line=true\n"
        job(
            "H:good",
            "host",
            "dHlwZT1ob3N0Cmhvc3RfbmFtZT1oCnJlc3VsdF9xdWV1ZT1yCmNvbW1hbmRfbGluZT10cnVlCg==",
        ),
    ]);
    let mut worker = worker(&config, source, PoolLink::standalone(), Shutdown::new());

    assert_eq!(worker.run().await.unwrap(), LoopExit::JobCapReached);

    let finished = &worker.source().finished;
    assert_eq!(finished[0], ("H:bad".to_string(), Completion::Fail));
    assert_eq!(finished[1].0, "H:good");

    let posts = posts(&worker);
    assert_eq!(posts.len(), 1);
    let decoded = TransportMode::Base64.decode(posts[0].1.as_bytes()).unwrap();
    assert!(String::from_utf8(decoded).unwrap().starts_with("host_name=h\n"));
}

#[tokio::test]
async fn placeholder_jobs_are_acknowledged_but_not_counted() {
    let config = WorkerConfig {
        max_jobs: 1,
        ..config()
    };
    let source = FakeSource::with_jobs(vec![
        job("H:d", "dummy", ""),
        job("H:1", "host", "type=host\nhost_name=h\ncommand_line=true\n"),
    ]);
    let mut worker = worker(&config, source, PoolLink::standalone(), Shutdown::new());

    assert_eq!(worker.run().await.unwrap(), LoopExit::JobCapReached);
    assert_eq!(worker.source().finished.len(), 2);
    assert_eq!(worker.state().jobs_done(), 1);
    assert!(posts(&worker).is_empty());
}

#[tokio::test]
async fn fetch_error_reconnects_both_sides_and_backs_off() {
    let config = WorkerConfig {
        max_jobs: 1,
        ..config()
    };
    let source = FakeSource::with_jobs(vec![
        Err(BrokerError::Disconnected("gm1:4730".into())),
        job("H:1", "host", "type=host\nhost_name=h\ncommand_line=true\n"),
    ]);
    let mut worker = worker(&config, source, PoolLink::standalone(), Shutdown::new());

    let started = Instant::now();
    assert_eq!(worker.run().await.unwrap(), LoopExit::JobCapReached);

    assert!(started.elapsed() >= BACKOFF_FLOOR);
    assert_eq!(worker.source().reconnects, 1);
    assert_eq!(worker.reporter().client().poster().reconnects, 1);
    assert_eq!(worker.state().backoff.current(), BACKOFF_FLOOR);
}

#[tokio::test]
async fn shutdown_interrupts_an_idle_fetch() {
    let config = config();
    let shutdown = Shutdown::new();
    let mut worker = worker(
        &config,
        FakeSource::default(),
        PoolLink::standalone(),
        shutdown.clone(),
    );

    let (exit, _) = tokio::join!(worker.run(), async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.request();
    });
    assert_eq!(exit.unwrap(), LoopExit::Shutdown);
}

#[tokio::test]
async fn shutdown_waits_for_the_running_job() {
    let config = config();
    let shutdown = Shutdown::new();
    let source = FakeSource::with_jobs(vec![job(
        "H:1",
        "host",
        "type=host\nhost_name=h\nresult_queue=r\ncommand_line=sleep 1; echo done\n",
    )]);
    let mut worker = worker(&config, source, PoolLink::standalone(), shutdown.clone());

    let (exit, _) = tokio::join!(worker.run(), async {
        tokio::time::sleep(Duration::from_millis(200)).await;
        shutdown.request();
    });
    assert_eq!(exit.unwrap(), LoopExit::Shutdown);
    assert_eq!(worker.state().jobs_done(), 1);
    assert!(posts(&worker)[0].1.ends_with("output=done\n\n"));
}

#[tokio::test]
async fn pooled_worker_exits_when_idle() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = WorkerConfig {
        mode: Mode::Pooled,
        ..config()
    };
    config.pool.counter_path = Some(dir.path().join("active"));
    config.pool.idle_timeout_secs = 1;

    let pool = PoolLink::counter_only(dir.path().join("active"));
    let mut worker = worker(&config, FakeSource::default(), pool, Shutdown::new());

    let started = Instant::now();
    assert_eq!(worker.run().await.unwrap(), LoopExit::IdleTimeout);
    assert!(started.elapsed() >= Duration::from_secs(1));
}

#[tokio::test]
async fn pooled_worker_reports_then_exits_after_check_timeout() {
    let dir = tempfile::tempdir().unwrap();
    let counter = dir.path().join("active");
    let mut config = WorkerConfig {
        mode: Mode::Pooled,
        ..config()
    };
    config.pool.counter_path = Some(counter.clone());

    let source = FakeSource::with_jobs(vec![
        job(
            "H:1",
            "service",
            "type=service\nhost_name=h\nservice_description=slow\nresult_queue=r\ncommand_line=sleep 10\ntimeout=1\n",
        ),
        job("H:2", "host", "type=host\nhost_name=h\ncommand_line=true\n"),
    ]);
    let mut worker = worker(
        &config,
        source,
        PoolLink::counter_only(counter.clone()),
        Shutdown::new(),
    );

    assert_eq!(worker.run().await.unwrap(), LoopExit::CheckTimedOut);

    let posts = posts(&worker);
    assert_eq!(posts.len(), 1);
    assert!(posts[0].1.contains("return_code=2\n"));
    assert!(posts[0].1.contains("output=(Service Check Timed Out)\n"));
    assert_eq!(worker.source().jobs.len(), 1);
    assert_eq!(read_counter(&counter).unwrap(), 0);
}

#[tokio::test]
async fn stale_jobs_report_only_for_checks() {
    let config = WorkerConfig {
        max_age: 60,
        events: true,
        max_jobs: 2,
        ..config()
    };
    let old = Timeval::new(Timeval::now().sec - 600, 0);
    let source = FakeSource::with_jobs(vec![
        job(
            "H:1",
            "eventhandler",
            &format!("type=event\nresult_queue=r\ncommand_line=true\nstart_time={}\n", old),
        ),
        job(
            "H:2",
            "service",
            &format!(
                "type=service\nhost_name=h\nservice_description=s\nresult_queue=r\ncommand_line=true\nstart_time={}\n",
                old
            ),
        ),
    ]);
    let mut worker = worker(&config, source, PoolLink::standalone(), Shutdown::new());

    assert_eq!(worker.run().await.unwrap(), LoopExit::JobCapReached);

    let posts = posts(&worker);
    assert_eq!(posts.len(), 1);
    assert!(posts[0].1.contains("return_code=3\n"));
    assert!(posts[0].1.contains("output=(Could Not Start Check In Time)\n"));
}

#[tokio::test]
async fn failed_registration_still_registers_every_queue() {
    let config = WorkerConfig {
        events: true,
        max_jobs: 1,
        ..config()
    };
    let source = FakeSource {
        failing_registrations: 1,
        ..FakeSource::with_jobs(vec![job("H:1", "host", "type=host\nhost_name=h\ncommand_line=true\n")])
    };
    let mut worker = worker(&config, source, PoolLink::standalone(), Shutdown::new());

    let started = Instant::now();
    assert_eq!(worker.run().await.unwrap(), LoopExit::JobCapReached);
    assert!(started.elapsed() >= BACKOFF_FLOOR);

    let source = worker.source();
    assert_eq!(
        source.registered,
        vec!["host", "service", "eventhandler", "dummy"]
    );
    assert_eq!(source.reconnects, 1);
    assert_eq!(worker.reporter().client().poster().reconnects, 1);
}
