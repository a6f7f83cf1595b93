//! Command-line entrypoint for the major-compaction driver.
//!
//! `simulate` stands up an in-memory cluster, loads random rows across several
//! flushes so every region accumulates fragments, and then drives a full major
//! compaction against it. The process exits with the report's exit code.

use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use clap::{Args, Parser};
use major_compactor::{
    mem::{ClusterOptions, InMemoryCluster},
    CompactionReport, CompactorConfig, MajorCompactor, PairStatus, ServerName,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Major-compaction driver")]
enum Command {
    /// Build an in-memory cluster, fill it with fragments and compact it.
    Simulate(SimulateArgs),
}

#[derive(Args, Debug)]
struct SimulateArgs {
    /// Table to create and compact.
    #[arg(long, default_value = "MajorCompactorTest")]
    table: String,
    /// Column families to create and compact; repeat for several.
    #[arg(long = "family", default_value = "a")]
    families: Vec<String>,
    /// Number of storage servers.
    #[arg(long, default_value_t = 3)]
    servers: usize,
    /// Number of regions the table is split into.
    #[arg(long, default_value_t = 5)]
    regions: usize,
    /// Number of load-then-flush rounds; each adds one fragment per region.
    #[arg(long, default_value_t = 5)]
    flushes: usize,
    /// Rows written per family per round.
    #[arg(long, default_value_t = 1000)]
    rows: usize,
    /// Index of a server to take offline once the run is planned.
    #[arg(long)]
    unreachable_server: Option<usize>,
    /// Discharger interval of the simulated servers, in milliseconds.
    #[arg(long, default_value_t = 100)]
    discharger_ms: u64,
    #[command(flatten)]
    driver: DriverArgs,
}

#[derive(Args, Debug)]
struct DriverArgs {
    /// JSON file with driver options; flags below override it.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Maximum in-flight requests per server.
    #[arg(long)]
    concurrency: Option<usize>,
    /// Fragment count at or below which a pair is compacted.
    #[arg(long)]
    threshold: Option<usize>,
    /// Skip pairs major-compacted at or after this unix timestamp (ms).
    #[arg(long)]
    cutoff_ms: Option<u64>,
    /// Poll interval in milliseconds.
    #[arg(long)]
    poll_ms: Option<u64>,
    /// Wall-clock budget in milliseconds.
    #[arg(long)]
    timeout_ms: Option<u64>,
    /// Plan without dispatching any request.
    #[arg(long)]
    dry_run: bool,
    /// Print the report as JSON.
    #[arg(long)]
    json: bool,
}

impl DriverArgs {
    fn load(&self, table: &str, families: &[String]) -> anyhow::Result<CompactorConfig> {
        let base = match &self.config {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("reading config {}", path.display()))?;
                serde_json::from_str::<CompactorConfig>(&raw)
                    .with_context(|| format!("parsing config {}", path.display()))?
            }
            None => CompactorConfig::default(),
        };
        let mut config = base.with_target(table, families.iter().cloned());
        if let Some(concurrency) = self.concurrency {
            config = config.concurrency(concurrency);
        }
        if let Some(threshold) = self.threshold {
            config = config.fragment_threshold(threshold);
        }
        if let Some(cutoff_ms) = self.cutoff_ms {
            config = config.cutoff_ms(cutoff_ms);
        }
        if let Some(poll_ms) = self.poll_ms {
            config = config.poll_interval(Duration::from_millis(poll_ms));
        }
        if let Some(timeout_ms) = self.timeout_ms {
            config = config.run_timeout(Duration::from_millis(timeout_ms));
        }
        if self.dry_run {
            config = config.dry_run(true);
        }
        Ok(config)
    }
}

fn load_cluster(args: &SimulateArgs) -> anyhow::Result<Arc<InMemoryCluster>> {
    let cluster = Arc::new(InMemoryCluster::new(
        ClusterOptions::with_servers(args.servers)
            .discharger_interval(Duration::from_millis(args.discharger_ms)),
    ));
    cluster.create_table(&args.table, args.families.iter().cloned(), args.regions);
    for _ in 0..args.flushes {
        for family in &args.families {
            let rows = (0..args.rows).map(|_| {
                let mut key = vec![0u8; 16];
                fastrand::fill(&mut key);
                key
            });
            cluster
                .put_rows(&args.table, family, rows)
                .with_context(|| format!("loading {}:{family}", args.table))?;
        }
        cluster.flush(&args.table)?;
    }
    Ok(cluster)
}

fn print_report(report: &CompactionReport, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }
    println!(
        "{}: {:?} in {}ms (converged {}, failed {}, timed out {}, skipped {}, excluded {})",
        report.table,
        report.status,
        report.elapsed_ms,
        report.count(PairStatus::Converged),
        report.count(PairStatus::Failed),
        report.count(PairStatus::TimedOut),
        report.count(PairStatus::Skipped),
        report.excluded.len(),
    );
    for pair in report.unconverged() {
        println!(
            "  {}/{} on {}: {:?} after {} attempt(s){}",
            pair.region,
            pair.family,
            pair.server,
            pair.status,
            pair.attempts,
            pair.error
                .as_deref()
                .map(|e| format!(": {e}"))
                .unwrap_or_default(),
        );
    }
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let code = match Command::parse() {
        Command::Simulate(args) => {
            let config = args.driver.load(&args.table, &args.families)?;
            let cluster = load_cluster(&args)?;
            let mut compactor = MajorCompactor::new(cluster.clone(), config);
            compactor.initialize_work_queues().await?;
            if let Some(idx) = args.unreachable_server {
                cluster.set_server_reachable(&ServerName::new(format!("server-{idx}")), false);
            }
            let result = compactor.compact_all_regions().await;
            compactor.shutdown().await;
            let report = result?;
            print_report(&report, args.driver.json)?;
            for family in &args.families {
                tracing::info!(
                    table = %args.table,
                    family = %family,
                    regions = cluster.region_count(&args.table),
                    fragments = cluster.fragment_total(&args.table, family),
                    "fragments after run"
                );
            }
            report.exit_code()
        }
    };
    std::process::exit(code);
}
