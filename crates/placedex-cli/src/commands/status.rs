//! Status command implementation

use placedex_core::index::StatusReport;
use placedex_core::{Indexer, IndexerConfig};

pub async fn run(dsn: &str, format: &str) -> anyhow::Result<()> {
    let config = IndexerConfig {
        dsn: dsn.to_string(),
        threads: Some(1),
        ..Default::default()
    };
    let report = Indexer::new(config)?.status().await?;

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&report)?),
        _ => print_table(&report),
    }

    Ok(())
}

fn print_table(report: &StatusReport) {
    println!("Indexing Status");
    println!("================================\n");

    if report.markers.is_empty() {
        println!("No indexing pass recorded.");
    }
    for marker in &report.markers {
        let progress = match marker.last_rank {
            Some(rank) if marker.is_finished() => format!("finished at rank {}", rank),
            Some(rank) => format!("complete up to rank {}", rank),
            None => "not started".to_string(),
        };
        println!(
            "  {:<10} ranks {:>2}..={:<2}  {}  (updated {})",
            marker.phase.to_string(),
            marker.rank_min,
            marker.rank_max,
            progress,
            marker.updated_at.format("%Y-%m-%d %H:%M:%S UTC")
        );
    }

    println!("\n--- Pending Places ---\n");

    if report.backlog.is_empty() {
        println!("Nothing left to index.");
        return;
    }

    println!("{:<6} {:>12} {:>12}", "RANK", "BOUNDARIES", "PLACES");
    println!("{}", "-".repeat(32));
    let mut total = 0;
    for row in &report.backlog {
        println!("{:<6} {:>12} {:>12}", row.rank, row.boundary, row.regular);
        total += row.boundary + row.regular;
    }
    println!("\nTotal: {} places", total);
}
