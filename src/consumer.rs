use crate::broker::{BrokerClient, QueueSpec};
use crate::config::LoadJob;
use crate::error::LoadError;
use crate::report::{RunResult, ThroughputReporter};
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Drains one subscription sequentially, acknowledging as it goes.
pub struct ConsumerEngine {
    job: LoadJob,
    progress_bar: bool,
}

impl ConsumerEngine {
    pub fn new(job: LoadJob) -> Self {
        Self {
            job,
            progress_bar: false,
        }
    }

    pub fn with_progress_bar(mut self, enabled: bool) -> Self {
        self.progress_bar = enabled;
        self
    }

    /// Consumes until `count` messages were received (`count > 0`), the
    /// broker ends the stream, or `cancel` fires. Stopping early through
    /// `cancel` is not an error: the result carries what was received.
    ///
    /// The subscription is dropped, not cancelled, once the target is hit.
    pub async fn run<B>(
        &self,
        broker: &B,
        cancel: CancellationToken,
    ) -> Result<RunResult, LoadError>
    where
        B: BrokerClient + ?Sized,
    {
        let job = &self.job;
        if job.prefetch > 0 {
            broker.set_qos(job.prefetch).await.map_err(LoadError::Setup)?;
        }
        broker
            .declare_queue(&QueueSpec::transient(&job.queue))
            .await
            .map_err(LoadError::Setup)?;

        let manual_ack = job.ack_mode.is_manual();
        let mut deliveries = broker
            .subscribe(&job.queue, !manual_ack)
            .await
            .map_err(LoadError::Setup)?;
        info!(
            "consuming queue={} target={} ack={} prefetch={}",
            job.queue, job.count, job.ack_mode, job.prefetch
        );

        let mut reporter = ThroughputReporter::new("consumed", job.count, job.progress_interval);
        if self.progress_bar {
            reporter = reporter.with_progress_bar();
        }

        let mut received = 0u64;
        while job.count == 0 || received < job.count {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("consumer cancelled after {} messages", received);
                    break;
                }
                next = deliveries.next() => next,
            };
            let Some(delivery) = next else {
                info!("subscription closed by broker after {} messages", received);
                break;
            };
            let delivery = delivery.map_err(|source| LoadError::Consume { received, source })?;

            received += 1;
            if manual_ack {
                broker
                    .ack(delivery.ack)
                    .await
                    .map_err(|source| LoadError::Ack { received, source })?;
            }
            reporter.observe(received, None);
        }

        Ok(reporter.finish(received))
    }
}
