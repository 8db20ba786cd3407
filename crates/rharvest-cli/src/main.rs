use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "rharvest")]
#[command(about = "Reddit harvest pipeline: harvest, queue and index")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    json_logs: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Harvest every enabled topic once and enqueue the results.
    Harvest,
    /// Drain one topic, or all of them.
    Drain {
        #[arg(long)]
        topic: Option<String>,
    },
    /// Drop dedup entries older than the retention window.
    Compact,
    Migrate,
    /// Run the HTTP trigger surface.
    Serve,
    /// Run harvest, drain and compaction on their cron schedules.
    Schedule,
}

fn init_tracing(json: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("info"))?;
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs)?;

    match cli.command.unwrap_or(Commands::Harvest) {
        Commands::Harvest => {
            let summary = rharvest_sync::run_harvest_once_from_env().await?;
            println!(
                "harvest complete: run_id={} topics={} posts={} comments={} failed_topics={}",
                summary.run_id,
                summary.topics,
                summary.posts_enqueued,
                summary.comments_enqueued,
                summary.failures.len()
            );
            for failure in &summary.failures {
                eprintln!("  {}: {}", failure.topic, failure.error);
            }
        }
        Commands::Drain { topic } => {
            for summary in rharvest_sync::run_drain_from_env(topic.as_deref()).await? {
                println!(
                    "drain {}: batches={} records={} quarantined={} last={}",
                    summary.topic,
                    summary.batches_completed,
                    summary.records_indexed,
                    summary.batches_quarantined,
                    summary.last.label()
                );
            }
        }
        Commands::Compact => {
            let removed = rharvest_sync::run_compact_from_env().await?;
            println!("dedup compaction removed {removed} entries");
        }
        Commands::Migrate => {
            rharvest_sync::run_migrations_from_env().await?;
            println!("migrations applied");
        }
        Commands::Serve => {
            info!("starting web server");
            rharvest_web::serve_from_env().await?;
        }
        Commands::Schedule => {
            rharvest_sync::run_scheduler_from_env().await?;
        }
    }

    Ok(())
}
