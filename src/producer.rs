use crate::broker::{BrokerClient, Message, QueueSpec};
use crate::config::LoadJob;
use crate::error::LoadError;
use crate::payload::{draw, worker_rng, PayloadGenerator};
use crate::report::{RunResult, ThroughputReporter};
use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Contiguous slice `[start, start + count)` of global message indices owned
/// by one producer worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkAssignment {
    pub worker: usize,
    pub start: u64,
    pub count: u64,
}

impl WorkAssignment {
    pub fn range(&self) -> Range<u64> {
        self.start..self.start + self.count
    }
}

/// Splits `total` messages over `concurrency` workers (at least one). The
/// last worker takes the remainder, so the ranges tile `[0, total)` exactly.
/// Nothing to publish means no workers at all.
pub fn plan_assignments(total: u64, concurrency: usize) -> Vec<WorkAssignment> {
    if total == 0 {
        return Vec::new();
    }
    let workers = concurrency.max(1);
    let per_worker = total / workers as u64;
    let remainder = total % workers as u64;

    let mut next = 0;
    (0..workers)
        .map(|worker| {
            let mut count = per_worker;
            if worker == workers - 1 {
                count += remainder;
            }
            let assignment = WorkAssignment {
                worker,
                start: next,
                count,
            };
            next += count;
            assignment
        })
        .collect()
}

#[derive(Debug)]
enum WorkerSignal {
    Done { worker: usize, published: u64 },
    Failed(LoadError),
}

/// Read-only state every worker of one run shares.
struct WorkerContext {
    exchange: String,
    routing_key: String,
    seed: u64,
    generator: PayloadGenerator,
    reporter: ThroughputReporter,
    published: AtomicU64,
}

/// Publishes a fixed message budget through a pool of concurrent workers.
pub struct ProducerEngine {
    job: LoadJob,
    progress_bar: bool,
}

impl ProducerEngine {
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

    /// Runs until every worker has finished its range or the first worker
    /// fails. On failure the remaining workers are told to stop and the error
    /// is returned without waiting for them. Cancelling `cancel` stops the run
    /// with [`LoadError::Cancelled`].
    pub async fn run<B>(
        &self,
        broker: Arc<B>,
        cancel: CancellationToken,
    ) -> Result<RunResult, LoadError>
    where
        B: BrokerClient + ?Sized + 'static,
    {
        let job = &self.job;
        broker
            .declare_queue(&QueueSpec::transient(&job.queue))
            .await
            .map_err(LoadError::Setup)?;

        let assignments = plan_assignments(job.count, job.concurrency());
        info!(
            "producing {} messages (concurrency={}) queue={} exchange={:?} routing={} seed={}",
            job.count,
            job.concurrency(),
            job.queue,
            job.exchange,
            job.routing_key(),
            job.seed
        );

        let mut reporter = ThroughputReporter::new("published", job.count, job.progress_interval);
        if self.progress_bar {
            reporter = reporter.with_progress_bar();
        }
        if assignments.is_empty() {
            return Ok(reporter.finish(0));
        }

        let ctx = Arc::new(WorkerContext {
            exchange: job.exchange.clone(),
            routing_key: job.routing_key().to_string(),
            seed: job.seed,
            generator: PayloadGenerator::new(job.payload_size),
            reporter,
            published: AtomicU64::new(0),
        });

        // One signal per worker, so sends never wait on the engine.
        let (signal_tx, mut signal_rx) = mpsc::channel(assignments.len());
        let workers = cancel.child_token();
        for assignment in assignments.iter().copied() {
            tokio::spawn(publish_range(
                assignment,
                ctx.clone(),
                broker.clone(),
                workers.clone(),
                signal_tx.clone(),
            ));
        }
        drop(signal_tx);

        let mut published = 0;
        let mut reported = 0;
        while reported < assignments.len() {
            let signal = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    workers.cancel();
                    ctx.reporter.abandon();
                    return Err(LoadError::Cancelled {
                        processed: ctx.published.load(Ordering::Relaxed),
                    });
                }
                signal = signal_rx.recv() => signal,
            };
            match signal {
                Some(WorkerSignal::Done {
                    worker,
                    published: count,
                }) => {
                    debug!("worker {} finished {} messages", worker, count);
                    published += count;
                    reported += 1;
                }
                Some(WorkerSignal::Failed(err)) => {
                    workers.cancel();
                    ctx.reporter.abandon();
                    error!("{}", err);
                    return Err(err);
                }
                None => {
                    workers.cancel();
                    ctx.reporter.abandon();
                    return Err(LoadError::WorkerLost {
                        missing: assignments.len() - reported,
                    });
                }
            }
        }

        Ok(ctx.reporter.finish(published))
    }
}

async fn publish_range<B>(
    assignment: WorkAssignment,
    ctx: Arc<WorkerContext>,
    broker: Arc<B>,
    cancel: CancellationToken,
    signals: mpsc::Sender<WorkerSignal>,
) where
    B: BrokerClient + ?Sized,
{
    let signal = match publish_assignment(assignment, &ctx, broker.as_ref(), &cancel).await {
        Ok(published) => WorkerSignal::Done {
            worker: assignment.worker,
            published,
        },
        Err(err) => WorkerSignal::Failed(err),
    };
    // The engine stops listening after the first failure.
    let _ = signals.send(signal).await;
}

async fn publish_assignment<B>(
    assignment: WorkAssignment,
    ctx: &WorkerContext,
    broker: &B,
    cancel: &CancellationToken,
) -> Result<u64, LoadError>
where
    B: BrokerClient + ?Sized,
{
    let mut rng = worker_rng(ctx.seed, assignment.worker);
    let mut published = 0;
    for index in assignment.range() {
        if cancel.is_cancelled() {
            return Err(LoadError::Cancelled {
                processed: published,
            });
        }
        let message = Message::now(ctx.generator.generate(index, draw(&mut rng)));
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(LoadError::Cancelled { processed: published });
            }
            outcome = broker.publish(&ctx.exchange, &ctx.routing_key, &message) => outcome,
        };
        outcome.map_err(|source| LoadError::Publish {
            worker: assignment.worker,
            index,
            source,
        })?;

        published += 1;
        ctx.published.fetch_add(1, Ordering::Relaxed);
        ctx.reporter.observe(index + 1, Some(assignment.worker));
    }
    Ok(published)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sizes(plan: &[WorkAssignment]) -> Vec<u64> {
        plan.iter().map(|a| a.count).collect()
    }

    #[test]
    fn divisible_budget_splits_evenly() {
        let plan = plan_assignments(5000, 4);
        assert_eq!(sizes(&plan), vec![1250, 1250, 1250, 1250]);
        assert_eq!(plan[0].range(), 0..1250);
        assert_eq!(plan[3].range(), 3750..5000);
    }

    #[test]
    fn last_worker_absorbs_remainder() {
        let plan = plan_assignments(10, 3);
        assert_eq!(sizes(&plan), vec![3, 3, 4]);
        assert_eq!(plan[2].range(), 6..10);
    }

    #[test]
    fn zero_budget_has_no_workers() {
        assert!(plan_assignments(0, 4).is_empty());
    }

    #[test]
    fn more_workers_than_messages() {
        let plan = plan_assignments(2, 5);
        assert_eq!(sizes(&plan), vec![0, 0, 0, 0, 2]);
        assert!(plan[..4].iter().all(|a| a.range().is_empty()));
    }

    #[test]
    fn zero_concurrency_means_one_worker() {
        let plan = plan_assignments(7, 0);
        assert_eq!(
            plan,
            vec![WorkAssignment {
                worker: 0,
                start: 0,
                count: 7
            }]
        );
    }

    proptest! {
        #[test]
        fn assignments_tile_the_budget(total in 0u64..100_000, concurrency in 1usize..64) {
            let plan = plan_assignments(total, concurrency);
            let mut next = 0;
            for (i, a) in plan.iter().enumerate() {
                prop_assert_eq!(a.worker, i);
                prop_assert_eq!(a.start, next);
                next = a.range().end;
            }
            prop_assert_eq!(next, total);

            if total > 0 {
                let n = concurrency as u64;
                prop_assert_eq!(plan.len(), concurrency);
                prop_assert_eq!(plan[concurrency - 1].count, total / n + total % n);
            }
        }
    }
}
