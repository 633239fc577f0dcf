// # -----------------------------
// # broker-client/src/lib.rs
// # -----------------------------
//! Gearman job-server client.
//!
//! Two halves share the same wire code: [`GearmanWorker`] claims jobs from
//! the queues a worker registered for, and [`BrokerClient`] posts background
//! tasks (check results) with a bounded retry budget. Both sit behind small
//! traits so the worker loop can be driven by in-memory fakes.

mod client;
mod connection;
pub mod endpoint;
pub mod protocol;
mod worker;

use async_trait::async_trait;

pub use client::{BrokerClient, GearmanPoster, DEFAULT_REPLY_TIMEOUT, DEFAULT_RETRY_DELAY};
pub use endpoint::{Endpoint, DEFAULT_PORT};
pub use worker::{GearmanWorker, RECONNECT_INTERVAL};

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("no job servers configured")]
    NoServers,
    #[error("invalid job server address '{0}'")]
    InvalidEndpoint(String),
    #[error("connect to {endpoint} failed: {source}")]
    Connect {
        endpoint: String,
        #[source]
        source: std::io::Error,
    },
    #[error("i/o error on {endpoint}: {source}")]
    Io {
        endpoint: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{0} closed the connection")]
    Disconnected(String),
    #[error("no job server reachable")]
    Unavailable,
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("job server error {code}: {message}")]
    Server { code: String, message: String },
    #[error("submitting to '{queue}' failed after {attempts} attempt(s): {reason}")]
    SubmitExhausted {
        queue: String,
        attempts: u32,
        reason: String,
    },
}

/// Queue lane a background task is posted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
        }
    }
}

/// A job claimed from a server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssignedJob {
    /// Server-side handle used to acknowledge the job.
    pub handle: String,
    /// Queue (Gearman function) the job was posted to.
    pub function: String,
    pub payload: Vec<u8>,
    origin: usize,
}

impl AssignedJob {
    pub fn new(handle: impl Into<String>, function: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            handle: handle.into(),
            function: function.into(),
            payload,
            origin: 0,
        }
    }

    pub(crate) fn from_server(origin: usize, handle: String, function: String, payload: Vec<u8>) -> Self {
        Self {
            handle,
            function,
            payload,
            origin,
        }
    }

    /// Index of the server that handed the job out.
    pub fn origin(&self) -> usize {
        self.origin
    }
}

/// How a claimed job ended, as told to the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    Complete(Vec<u8>),
    Fail,
}

/// Fetch side: claims jobs from the registered queues.
#[async_trait]
pub trait JobSource: Send {
    /// Announce that this worker can handle `queue`.
    async fn register(&mut self, queue: &str) -> Result<(), BrokerError>;

    /// Block until some server hands out a job.
    async fn fetch(&mut self) -> Result<AssignedJob, BrokerError>;

    /// Acknowledge a job previously returned by [`JobSource::fetch`].
    async fn finish(&mut self, job: &AssignedJob, completion: Completion) -> Result<(), BrokerError>;

    /// Drop every connection and open fresh ones, keeping registrations.
    async fn reconnect(&mut self) -> Result<(), BrokerError>;
}

/// Submit side: posts background tasks.
#[async_trait]
pub trait TaskPoster: Send {
    /// Post one background task and wait until a server accepted it.
    /// Returns the server's job handle.
    async fn post_background(
        &mut self,
        queue: &str,
        unique: &str,
        payload: &[u8],
        priority: Priority,
    ) -> Result<String, BrokerError>;

    /// Error text of the most recent attempt, if the broker reported one.
    fn last_error(&self) -> Option<&str>;

    async fn reconnect(&mut self) -> Result<(), BrokerError>;
}
