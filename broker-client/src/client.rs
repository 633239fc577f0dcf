use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::connection::{server_error, Connection};
use crate::endpoint::Endpoint;
use crate::protocol::{Packet, PacketType};
use crate::{BrokerError, Priority, TaskPoster};

/// Pause between submission attempts.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(5);

/// How long a server may take to answer a submission.
pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(10);

/// Posts background tasks to the first server that accepts them.
pub struct GearmanPoster {
    endpoints: Vec<Endpoint>,
    connections: Vec<Option<Connection>>,
    last_error: Option<String>,
    reply_timeout: Duration,
}

impl GearmanPoster {
    /// Register endpoints. Connections open on first use.
    pub fn new(endpoints: Vec<Endpoint>) -> Result<Self, BrokerError> {
        if endpoints.is_empty() {
            return Err(BrokerError::NoServers);
        }
        Ok(Self {
            connections: endpoints.iter().map(|_| None).collect(),
            endpoints,
            last_error: None,
            reply_timeout: DEFAULT_REPLY_TIMEOUT,
        })
    }

    pub fn with_reply_timeout(mut self, timeout: Duration) -> Self {
        self.reply_timeout = timeout;
        self
    }

    async fn post_to(
        &mut self,
        index: usize,
        packet: &Packet,
    ) -> Result<String, BrokerError> {
        let slot = &mut self.connections[index];
        if slot.is_none() {
            *slot = Some(Connection::open(&self.endpoints[index]).await?);
        }
        let Some(connection) = slot.as_mut() else {
            return Err(BrokerError::Unavailable);
        };

        connection.send(packet).await?;
        match tokio::time::timeout(self.reply_timeout, await_created(connection)).await {
            Ok(result) => result,
            Err(_) => Err(BrokerError::Io {
                endpoint: self.endpoints[index].to_string(),
                source: std::io::ErrorKind::TimedOut.into(),
            }),
        }
    }
}

/// Handle of the created task, or the server's refusal.
async fn await_created(connection: &mut Connection) -> Result<String, BrokerError> {
    loop {
        let reply = connection.recv().await?;
        match reply.kind {
            PacketType::JobCreated => return Ok(reply.arg_str(0)),
            PacketType::Error => return Err(server_error(&reply)),
            other => debug!(kind = ?other, "ignored while submitting"),
        }
    }
}

#[async_trait]
impl TaskPoster for GearmanPoster {
    async fn post_background(
        &mut self,
        queue: &str,
        unique: &str,
        payload: &[u8],
        priority: Priority,
    ) -> Result<String, BrokerError> {
        let kind = match priority {
            Priority::Low => PacketType::SubmitJobLowBg,
            Priority::Normal => PacketType::SubmitJobBg,
            Priority::High => PacketType::SubmitJobHighBg,
        };
        let packet = Packet::request(
            kind,
            vec![
                queue.as_bytes().to_vec(),
                unique.as_bytes().to_vec(),
                payload.to_vec(),
            ],
        );

        self.last_error = None;
        let mut failure = BrokerError::Unavailable;
        for index in 0..self.endpoints.len() {
            match self.post_to(index, &packet).await {
                Ok(handle) => {
                    // Failover errors from earlier servers do not taint this post.
                    self.last_error = None;
                    return Ok(handle);
                }
                Err(err) => {
                    debug!(endpoint = %self.endpoints[index], queue, "post failed: {}", err);
                    if !matches!(err, BrokerError::Server { .. }) {
                        self.connections[index] = None;
                    }
                    self.last_error = Some(err.to_string());
                    failure = err;
                }
            }
        }
        Err(failure)
    }

    fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    async fn reconnect(&mut self) -> Result<(), BrokerError> {
        for slot in self.connections.iter_mut() {
            slot.take();
        }
        self.last_error = None;
        Ok(())
    }
}

/// Result submission with a bounded retry budget.
pub struct BrokerClient<T: TaskPoster = GearmanPoster> {
    poster: T,
    retry_delay: Duration,
}

impl BrokerClient<GearmanPoster> {
    /// Register every `host[:port]`; any malformed entry aborts creation.
    pub fn connect<S: AsRef<str>>(servers: &[S]) -> Result<Self, BrokerError> {
        let endpoints = Endpoint::parse_all(servers)?;
        info!(servers = endpoints.len(), "submission client ready");
        Ok(Self::with_poster(GearmanPoster::new(endpoints)?))
    }
}

impl<T: TaskPoster> BrokerClient<T> {
    pub fn with_poster(poster: T) -> Self {
        Self {
            poster,
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn poster(&self) -> &T {
        &self.poster
    }

    /// Drop and recreate the underlying connections.
    pub async fn reconnect(&mut self) -> Result<(), BrokerError> {
        self.poster.reconnect().await
    }

    /// Post a background task, retrying up to `retries` more times.
    ///
    /// An attempt counts as failed when the post errors *or* the broker left
    /// a non-empty error string behind, even if the post itself succeeded.
    /// Without an `id` a random unique id is generated once and reused for
    /// every attempt.
    pub async fn submit(
        &mut self,
        queue: &str,
        id: Option<&str>,
        payload: &[u8],
        priority: Priority,
        retries: u32,
    ) -> Result<String, BrokerError> {
        let unique = match id {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => Uuid::new_v4().to_string(),
        };

        let mut remaining = retries;
        let mut attempts = 0;
        loop {
            attempts += 1;
            let posted = self
                .poster
                .post_background(queue, &unique, payload, priority)
                .await;

            let reason = match (&posted, self.poster.last_error()) {
                (Err(err), _) => Some(err.to_string()),
                (Ok(_), Some(stale)) if !stale.is_empty() => Some(stale.to_string()),
                (Ok(_), _) => None,
            };

            let Some(reason) = reason else {
                debug!(queue, priority = priority.as_str(), attempts, "task submitted");
                return posted;
            };

            if remaining == 0 {
                error!(queue, attempts, "submission finished with errors: {}", reason);
                return Err(BrokerError::SubmitExhausted {
                    queue: queue.to_string(),
                    attempts,
                    reason,
                });
            }
            remaining -= 1;
            warn!(
                queue,
                remaining,
                delay_secs = self.retry_delay.as_secs(),
                "submission failed, retrying: {}",
                reason
            );
            tokio::time::sleep(self.retry_delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Replays scripted attempt results.
    struct ScriptedPoster {
        script: VecDeque<(Result<String, BrokerError>, Option<String>)>,
        last_error: Option<String>,
        calls: Vec<(String, String, Vec<u8>, Priority)>,
    }

    impl ScriptedPoster {
        fn new(script: Vec<(Result<String, BrokerError>, Option<String>)>) -> Self {
            Self {
                script: script.into(),
                last_error: None,
                calls: Vec::new(),
            }
        }
    }

    #[async_trait]
    impl TaskPoster for ScriptedPoster {
        async fn post_background(
            &mut self,
            queue: &str,
            unique: &str,
            payload: &[u8],
            priority: Priority,
        ) -> Result<String, BrokerError> {
            self.calls
                .push((queue.into(), unique.into(), payload.to_vec(), priority));
            let (result, error) = self
                .script
                .pop_front()
                .unwrap_or((Err(BrokerError::Unavailable), None));
            self.last_error = error;
            result
        }

        fn last_error(&self) -> Option<&str> {
            self.last_error.as_deref()
        }

        async fn reconnect(&mut self) -> Result<(), BrokerError> {
            Ok(())
        }
    }

    fn client(script: Vec<(Result<String, BrokerError>, Option<String>)>) -> BrokerClient<ScriptedPoster> {
        BrokerClient::with_poster(ScriptedPoster::new(script)).with_retry_delay(Duration::ZERO)
    }

    #[tokio::test]
    async fn first_success_is_returned() {
        let mut client = client(vec![(Ok("H:1".into()), None)]);
        let handle = client
            .submit("check_results", Some("web1"), b"x", Priority::Normal, 1)
            .await
            .unwrap();

        assert_eq!(handle, "H:1");
        let calls = &client.poster().calls;
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "check_results");
        assert_eq!(calls[0].1, "web1");
        assert_eq!(calls[0].3, Priority::Normal);
    }

    #[tokio::test]
    async fn success_with_error_text_is_retried() {
        let mut client = client(vec![
            (Ok("H:1".into()), Some("lost connection".into())),
            (Ok("H:2".into()), Some(String::new())),
        ]);
        let handle = client
            .submit("q", None, b"x", Priority::High, 1)
            .await
            .unwrap();

        assert_eq!(handle, "H:2");
        assert_eq!(client.poster().calls.len(), 2);
    }

    #[tokio::test]
    async fn retries_are_bounded() {
        let mut client = client(vec![
            (Err(BrokerError::Unavailable), None),
            (Err(BrokerError::Unavailable), None),
            (Ok("late".into()), None),
        ]);
        let err = client
            .submit("q", Some("id"), b"x", Priority::Low, 1)
            .await
            .unwrap_err();

        assert!(matches!(err, BrokerError::SubmitExhausted { attempts: 2, .. }));
        assert_eq!(client.poster().calls.len(), 2);
    }

    #[tokio::test]
    async fn zero_retries_means_one_attempt() {
        let mut client = client(vec![(Err(BrokerError::Unavailable), None)]);
        assert!(client.submit("q", None, b"x", Priority::Normal, 0).await.is_err());
        assert_eq!(client.poster().calls.len(), 1);
    }

    #[tokio::test]
    async fn generated_unique_id_is_stable_across_attempts() {
        let mut client = client(vec![
            (Err(BrokerError::Unavailable), None),
            (Ok("H:1".into()), None),
        ]);
        client
            .submit("q", None, b"x", Priority::Normal, 3)
            .await
            .unwrap();

        let calls = &client.poster().calls;
        assert_eq!(calls[0].1, calls[1].1);
        assert!(Uuid::parse_str(&calls[0].1).is_ok());
    }

    #[test]
    fn connect_rejects_bad_server_lists() {
        assert!(BrokerClient::connect(&["localhost", "10.0.0.1:4730"]).is_ok());
        assert!(matches!(
            BrokerClient::connect(&["localhost:nope"]),
            Err(BrokerError::InvalidEndpoint(_))
        ));
        assert!(matches!(
            BrokerClient::connect::<&str>(&[]),
            Err(BrokerError::NoServers)
        ));
    }
}
