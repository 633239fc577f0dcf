use gearcheck_broker::{BrokerClient, Priority, TaskPoster};
use gearcheck_common::{CheckOutcome, Job, ResultRecord, TransportMode};
use tracing::{debug, error, trace};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReportStatus {
    /// A server accepted the result task.
    Delivered,
    /// Nothing to send: no result queue or no output.
    Dropped,
    /// Every attempt failed; the result is lost.
    DeliveryFailed,
}

/// Serializes outcomes and posts them to the job's result queue.
pub struct Reporter<T: TaskPoster> {
    client: BrokerClient<T>,
    transport: TransportMode,
    retries: u32,
    /// Set when verbose results are enabled.
    identity: Option<String>,
}

impl<T: TaskPoster> Reporter<T> {
    pub fn new(
        client: BrokerClient<T>,
        transport: TransportMode,
        retries: u32,
        identity: Option<String>,
    ) -> Self {
        Self {
            client,
            transport,
            retries,
            identity,
        }
    }

    pub fn client(&self) -> &BrokerClient<T> {
        &self.client
    }

    pub fn client_mut(&mut self) -> &mut BrokerClient<T> {
        &mut self.client
    }

    pub async fn report(&mut self, job: &Job, outcome: &CheckOutcome) -> ReportStatus {
        let Some(queue) = job.result_queue.as_deref().filter(|q| !q.is_empty()) else {
            debug!(host = job.host_name.as_deref().unwrap_or(""), "no result queue, result dropped");
            return ReportStatus::Dropped;
        };
        let Some(record) = ResultRecord::from_job(job, outcome, self.identity.as_deref()) else {
            debug!(queue, "no output, result dropped");
            return ReportStatus::Dropped;
        };

        let text = record.render();
        trace!(queue, data = %text, "sending result");
        let payload = self.transport.encode(text.as_bytes());

        match self
            .client
            .submit(queue, None, &payload, Priority::Normal, self.retries)
            .await
        {
            Ok(handle) => {
                debug!(
                    queue,
                    handle = %handle,
                    host = %record.host_name,
                    return_code = record.return_code,
                    "result delivered"
                );
                ReportStatus::Delivered
            }
            Err(err) => {
                error!(queue, host = %record.host_name, "result delivery failed: {}", err);
                ReportStatus::DeliveryFailed
            }
        }
    }
}
