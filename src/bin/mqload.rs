use anyhow::{Context, Result};
use clap::{ArgAction, Parser, ValueEnum};
use mqload::broker::{AmqpBroker, MemoryBroker};
use mqload::config::{DEFAULT_COUNT, DEFAULT_PROGRESS_INTERVAL, DEFAULT_QUEUE, DEFAULT_URL};
use mqload::{
    AckMode, BrokerClient, ConsumerEngine, EnvOverrides, LoadJob, Mode, ProducerEngine, RunResult,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const USAGE: &str = "\
Examples:
  mqload --mode produce --queue test_queue --count 10000
  mqload --mode produce --queue test_queue --count 100000 --concurrency 8 --size 512
  mqload --mode consume --queue test_queue --count 10000 --prefetch 100
  mqload --mode consume --queue test_queue --count 0        (until the broker closes the stream)
  mqload --broker memory --mode produce --count 50000       (in-process dry run)

Environment:
  RABBITMQ_URL   overrides --url
  RANDOM_SEED    fixes the payload seed (non-zero integer) so a run can be replayed
  RUST_LOG       log filter, e.g. mqload=debug

Ctrl-C stops a run; an unbounded consume then reports what it received.";

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ModeArg {
    #[value(alias = "pub", alias = "publisher")]
    Produce,
    #[value(alias = "sub", alias = "consumer")]
    Consume,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum BrokerArg {
    /// AMQP 0-9-1 broker at --url
    Amqp,
    /// In-process broker, no network
    Memory,
}

/// Throughput load generator for AMQP queues.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None, after_long_help = USAGE)]
struct Cli {
    /// produce or consume
    #[arg(long, value_enum, ignore_case = true, default_value = "produce")]
    mode: ModeArg,

    /// Queue name
    #[arg(long, default_value = DEFAULT_QUEUE)]
    queue: String,

    /// Exchange name (blank = default exchange)
    #[arg(long, default_value = "")]
    exchange: String,

    /// Routing key (blank = queue name)
    #[arg(long, default_value = "")]
    routing: String,

    /// AMQP connection URL
    #[arg(long, default_value = DEFAULT_URL)]
    url: String,

    /// Messages to publish, or to consume (0 = until the stream ends)
    #[arg(long, default_value_t = DEFAULT_COUNT)]
    count: u64,

    /// (consume) manual acks; bare --ack means true
    #[arg(
        long,
        default_value_t = true,
        action = ArgAction::Set,
        num_args = 0..=1,
        default_missing_value = "true"
    )]
    ack: bool,

    /// (consume) prefetch count, 0 = unset
    #[arg(long, default_value_t = 0)]
    prefetch: u16,

    /// Progress log interval in messages, 0 = off
    #[arg(long, default_value_t = DEFAULT_PROGRESS_INTERVAL)]
    batch: u64,

    /// (produce) payload size in bytes, 0 = natural size
    #[arg(long, default_value_t = 0)]
    size: usize,

    /// (produce) concurrent publishers
    #[arg(long, default_value_t = 1)]
    concurrency: usize,

    /// Broker backend
    #[arg(long, value_enum, default_value = "amqp")]
    broker: BrokerArg,

    /// Draw a progress bar on stderr
    #[arg(long)]
    progress_bar: bool,
}

impl Cli {
    fn into_job(self, env: &EnvOverrides) -> LoadJob {
        let mode = match self.mode {
            ModeArg::Produce => Mode::Produce,
            ModeArg::Consume => Mode::Consume,
        };
        let ack_mode = if self.ack { AckMode::Manual } else { AckMode::Auto };
        LoadJob::new(mode, self.queue)
            .with_exchange(self.exchange)
            .with_routing_key(self.routing)
            .with_count(self.count)
            .with_concurrency(self.concurrency)
            .with_payload_size(self.size)
            .with_progress_interval(self.batch)
            .with_ack_mode(ack_mode)
            .with_prefetch(self.prefetch)
            .with_seed(env.seed_or_clock())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cfg!(debug_assertions) {
            EnvFilter::new("mqload=debug")
        } else {
            EnvFilter::new("mqload=info")
        }
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    let env = EnvOverrides::from_env();
    let url = env.url_or(cli.url.clone());
    let backend = cli.broker;
    let progress_bar = cli.progress_bar;
    let job = cli.into_job(&env);
    info!("seed={} (replay with RANDOM_SEED={})", job.seed, job.seed);

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupted, stopping");
                cancel.cancel();
            }
        });
    }

    let result = match backend {
        BrokerArg::Amqp => {
            let broker = Arc::new(AmqpBroker::connect(&url).await.context("connect")?);
            let result = run(job, broker.clone(), progress_bar, cancel).await;
            if let Err(e) = broker.close().await {
                warn!("close: {}", e);
            }
            result?
        }
        BrokerArg::Memory => {
            let broker = Arc::new(MemoryBroker::new());
            if job.mode == Mode::Consume {
                // Nothing else feeds an in-process queue: fill it first.
                let fill = LoadJob::produce(job.queue.clone())
                    .with_count(job.count)
                    .with_seed(job.seed)
                    .with_progress_interval(0);
                ProducerEngine::new(fill)
                    .run(broker.clone(), cancel.clone())
                    .await
                    .context("fill in-memory queue")?;
                broker.close_queue(&job.queue);
            }
            run(job, broker, progress_bar, cancel).await?
        }
    };

    println!("Done: {}", result);
    Ok(())
}

async fn run<B>(
    job: LoadJob,
    broker: Arc<B>,
    progress_bar: bool,
    cancel: CancellationToken,
) -> Result<RunResult>
where
    B: BrokerClient + 'static,
{
    match job.mode {
        Mode::Produce => ProducerEngine::new(job)
            .with_progress_bar(progress_bar)
            .run(broker, cancel)
            .await
            .context("produce"),
        Mode::Consume => ConsumerEngine::new(job)
            .with_progress_bar(progress_bar)
            .run(broker.as_ref(), cancel)
            .await
            .context("consume"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::parse_from(std::iter::once("mqload").chain(args.iter().copied()))
    }

    #[test]
    fn defaults_match_the_classic_tool() {
        let job = parse(&[]).into_job(&EnvOverrides::default());
        assert_eq!(job.mode, Mode::Produce);
        assert_eq!(job.queue, DEFAULT_QUEUE);
        assert_eq!(job.routing_key(), DEFAULT_QUEUE);
        assert_eq!(job.count, DEFAULT_COUNT);
        assert_eq!(job.ack_mode, AckMode::Manual);
        assert_eq!(job.concurrency(), 1);
    }

    #[test]
    fn mode_aliases_and_flags() {
        let env = EnvOverrides {
            url: None,
            seed: Some(5),
        };
        let job = parse(&["--mode", "sub", "--ack", "false", "--prefetch", "10", "--count", "0"])
            .into_job(&env);
        assert_eq!(job.mode, Mode::Consume);
        assert_eq!(job.ack_mode, AckMode::Auto);
        assert_eq!(job.prefetch, 10);
        assert_eq!(job.count, 0);
        assert_eq!(job.seed, 5);

        assert_eq!(parse(&["--mode", "publisher"]).into_job(&env).mode, Mode::Produce);
    }

    #[test]
    fn bare_ack_flag_means_manual() {
        let env = EnvOverrides::default();
        let job = parse(&["--mode", "consume", "--ack"]).into_job(&env);
        assert_eq!(job.ack_mode, AckMode::Manual);

        let job = parse(&["--mode", "consume", "--ack", "--count", "3"]).into_job(&env);
        assert_eq!(job.ack_mode, AckMode::Manual);
        assert_eq!(job.count, 3);
    }
}
