use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::select_all;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::connection::{server_error, Connection};
use crate::endpoint::Endpoint;
use crate::protocol::{Packet, PacketType};
use crate::{AssignedJob, BrokerError, Completion, JobSource};

/// Minimum pause before a fetch retries a server whose connect failed.
pub const RECONNECT_INTERVAL: Duration = Duration::from_secs(30);

/// Worker-side connection set. Connections open lazily; a server that is
/// down is retried by fetch at most once per [`RECONNECT_INTERVAL`], and
/// immediately by [`JobSource::reconnect`].
pub struct GearmanWorker {
    endpoints: Vec<Endpoint>,
    connections: Vec<Option<Connection>>,
    /// Per server: earliest time fetch may try to connect again.
    retry_at: Vec<Option<Instant>>,
    abilities: Vec<String>,
    /// Server polled first on the next fetch.
    next: usize,
}

impl GearmanWorker {
    /// Register every endpoint and try to connect to each. Only a malformed
    /// or empty server list fails here.
    pub async fn connect<S: AsRef<str>>(servers: &[S]) -> Result<Self, BrokerError> {
        let endpoints = Endpoint::parse_all(servers)?;
        let mut worker = Self {
            connections: endpoints.iter().map(|_| None).collect(),
            retry_at: endpoints.iter().map(|_| None).collect(),
            endpoints,
            abilities: Vec::new(),
            next: 0,
        };
        if let Err(err) = worker.ensure_connected().await {
            warn!("no job server reachable yet: {}", err);
        }
        Ok(worker)
    }

    pub fn endpoints(&self) -> &[Endpoint] {
        &self.endpoints
    }

    pub fn abilities(&self) -> &[String] {
        &self.abilities
    }

    /// Open missing connections and replay registrations on them.
    async fn ensure_connected(&mut self) -> Result<(), BrokerError> {
        let now = Instant::now();
        for (index, slot) in self.connections.iter_mut().enumerate() {
            if slot.is_some() || self.retry_at[index].is_some_and(|at| now < at) {
                continue;
            }
            let endpoint = &self.endpoints[index];
            match open_with_abilities(endpoint, &self.abilities).await {
                Ok(connection) => {
                    info!(endpoint = %endpoint, "worker connected");
                    *slot = Some(connection);
                    self.retry_at[index] = None;
                }
                Err(err) => {
                    warn!(
                        endpoint = %endpoint,
                        retry_secs = RECONNECT_INTERVAL.as_secs(),
                        "worker connect failed: {}",
                        err
                    );
                    self.retry_at[index] = Some(Instant::now() + RECONNECT_INTERVAL);
                }
            }
        }

        if self.connections.iter().any(Option::is_some) {
            Ok(())
        } else {
            Err(BrokerError::Unavailable)
        }
    }

    /// Ask one server for a job. `Ok(None)` when it has nothing queued.
    async fn grab(&mut self, index: usize) -> Result<Option<AssignedJob>, BrokerError> {
        let Some(connection) = self.connections[index].as_mut() else {
            return Ok(None);
        };
        connection
            .send(&Packet::request(PacketType::GrabJob, Vec::new()))
            .await?;

        loop {
            let packet = connection.recv().await?;
            match packet.kind {
                PacketType::NoJob => return Ok(None),
                PacketType::JobAssign => {
                    let handle = packet.arg_str(0);
                    let function = packet.arg_str(1);
                    let payload = packet.arg(2).map(<[u8]>::to_vec).unwrap_or_default();
                    debug!(
                        endpoint = %connection.endpoint(),
                        handle = %handle,
                        queue = %function,
                        bytes = payload.len(),
                        "job assigned"
                    );
                    return Ok(Some(AssignedJob::from_server(
                        index, handle, function, payload,
                    )));
                }
                PacketType::Error => return Err(server_error(&packet)),
                // Wake-ups from an earlier sleep.
                PacketType::Noop => continue,
                other => trace!(kind = ?other, "ignored while grabbing"),
            }
        }
    }

    /// Announce sleep on every connection and wait for the first wake-up.
    async fn sleep_until_woken(&mut self) -> Result<(), BrokerError> {
        let sleep = Packet::request(PacketType::PreSleep, Vec::new());
        for connection in self.connections.iter_mut().flatten() {
            connection.send(&sleep).await?;
        }

        let waits: Vec<_> = self
            .connections
            .iter_mut()
            .flatten()
            .map(|connection| Box::pin(connection.wait_for_noop()))
            .collect();
        if waits.is_empty() {
            return Err(BrokerError::Unavailable);
        }
        let (woken, _, _) = select_all(waits).await;
        woken
    }

    /// Drop a broken connection so the next call reopens it.
    fn forget(&mut self, index: usize) {
        if let Some(connection) = self.connections[index].take() {
            debug!(endpoint = %connection.endpoint(), "dropped worker connection");
        }
    }
}

async fn open_with_abilities(
    endpoint: &Endpoint,
    abilities: &[String],
) -> Result<Connection, BrokerError> {
    let mut connection = Connection::open(endpoint).await?;
    for ability in abilities {
        connection.send(&can_do(ability)).await?;
    }
    Ok(connection)
}

fn can_do(queue: &str) -> Packet {
    Packet::request(PacketType::CanDo, vec![queue.as_bytes().to_vec()])
}

#[async_trait]
impl JobSource for GearmanWorker {
    async fn register(&mut self, queue: &str) -> Result<(), BrokerError> {
        if self.abilities.iter().any(|known| known == queue) {
            return Ok(());
        }
        self.abilities.push(queue.to_string());
        let packet = can_do(queue);
        let mut failure = None;
        for slot in self.connections.iter_mut() {
            let Some(connection) = slot.as_mut() else {
                continue;
            };
            if let Err(err) = connection.send(&packet).await {
                // Reopened connections replay every ability.
                warn!(endpoint = %connection.endpoint(), queue, "registration failed: {}", err);
                *slot = None;
                failure = failure.or(Some(err));
            }
        }
        match failure {
            Some(err) => Err(err),
            None => {
                debug!(queue, "registered queue");
                Ok(())
            }
        }
    }

    async fn fetch(&mut self) -> Result<AssignedJob, BrokerError> {
        loop {
            self.ensure_connected().await?;

            let servers = self.connections.len();
            for offset in 0..servers {
                let index = (self.next + offset) % servers;
                match self.grab(index).await {
                    Ok(Some(job)) => {
                        self.next = (index + 1) % servers;
                        return Ok(job);
                    }
                    Ok(None) => {}
                    Err(err) => {
                        self.forget(index);
                        return Err(err);
                    }
                }
            }

            trace!("no jobs queued, sleeping");
            self.sleep_until_woken().await?;
        }
    }

    async fn finish(&mut self, job: &AssignedJob, completion: Completion) -> Result<(), BrokerError> {
        let Some(connection) = self
            .connections
            .get_mut(job.origin())
            .and_then(Option::as_mut)
        else {
            return Err(BrokerError::Unavailable);
        };

        let handle = job.handle.as_bytes().to_vec();
        let packet = match completion {
            Completion::Complete(data) => {
                Packet::request(PacketType::WorkComplete, vec![handle, data])
            }
            Completion::Fail => Packet::request(PacketType::WorkFail, vec![handle]),
        };
        connection.send(&packet).await
    }

    async fn reconnect(&mut self) -> Result<(), BrokerError> {
        for slot in self.connections.iter_mut() {
            slot.take();
        }
        self.retry_at.iter_mut().for_each(|at| *at = None);
        self.ensure_connected().await
    }
}
