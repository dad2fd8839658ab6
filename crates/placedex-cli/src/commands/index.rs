//! Index command implementation

use placedex_core::{FailurePolicy, Indexer, IndexerConfig};
use tracing::warn;

pub struct IndexArgs {
    pub dsn: String,
    pub threads: Option<usize>,
    pub boundaries_only: bool,
    pub no_boundaries: bool,
    pub minrank: i64,
    pub maxrank: i64,
    pub batch_size: usize,
    pub max_retries: u32,
    pub skip_failed: bool,
}

pub async fn run(args: IndexArgs) -> anyhow::Result<()> {
    let config = IndexerConfig {
        dsn: args.dsn,
        threads: args.threads,
        batch_size: args.batch_size,
        max_retries: args.max_retries,
        failure_policy: if args.skip_failed {
            FailurePolicy::SkipAndLog
        } else {
            FailurePolicy::AbortBatch
        },
        ..Default::default()
    };

    let indexer = Indexer::new(config)?;
    println!("Using {} workers\n", indexer.worker_count());

    // Finish in-flight batches on Ctrl-C, then stop.
    let cancel = indexer.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, finishing current batches");
            cancel.cancel();
        }
    });

    let stats = if args.boundaries_only {
        indexer.index_boundaries(args.minrank, args.maxrank).await?
    } else if args.no_boundaries {
        indexer.index_by_rank(args.minrank, args.maxrank).await?
    } else {
        let stats = indexer.index_full(args.minrank, args.maxrank).await?;
        indexer.update_status_table().await?;
        stats
    };

    println!("\n{}", stats);
    Ok(())
}
