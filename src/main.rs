use anyhow::Context;
use clap::{Parser, Subcommand};
use rowsync::{Backends, BatchObservers, Config, Replicator, SyncNode};
use std::path::PathBuf;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

#[derive(Parser, Debug)]
#[command(name = "rowsync")]
#[command(about = "Channel-scoped batch replication between database nodes", long_about = None)]
struct Args {
    #[arg(short, long, value_name = "FILE", default_value = "config.toml")]
    config: PathBuf,

    #[arg(short, long, help = "Enable JSON output for logs")]
    json_logs: bool,

    #[arg(short, long, help = "Verbose logging")]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Route, send and load batches until interrupted (default)
    Run,
    /// List outgoing and incoming batches in error
    Errors {
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },
    /// Show one outgoing batch
    Batch { batch_id: i64 },
    /// Mark an outgoing batch as ignored so it is never sent again
    Ignore { batch_id: i64 },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(args.json_logs, args.verbose);

    info!("Loading configuration from {:?}", args.config);
    let config = Config::from_file(&args.config)
        .with_context(|| format!("failed to load configuration from {:?}", args.config))?;

    info!(
        node_id = %config.node.node_id,
        postgres_host = %config.postgres.host,
        postgres_database = %config.postgres.database,
        peers = config.peers.len(),
        channels = config.channels.len(),
        "Configuration summary"
    );

    let backends = Backends::postgres(&config, Some(args.config.as_path()))
        .await
        .context("failed to open PostgreSQL backends")?;
    let node = SyncNode::new(config, backends, BatchObservers::new());

    match args.command.unwrap_or(Command::Run) {
        Command::Run => run(node).await?,
        Command::Errors { limit } => {
            let (outgoing, incoming) = node.errors(limit).await?;
            println!("{}", serde_json::to_string_pretty(&serde_json::json!({
                "outgoing": outgoing,
                "incoming": incoming,
            }))?);
        }
        Command::Batch { batch_id } => match node.batch(batch_id).await? {
            Some(batch) => println!("{}", serde_json::to_string_pretty(&batch)?),
            None => anyhow::bail!("no outgoing batch {}", batch_id),
        },
        Command::Ignore { batch_id } => match node.ignore(batch_id).await? {
            Some(batch) => println!("batch {} is now {}", batch.batch_id, batch.status),
            None => anyhow::bail!("no outgoing batch {}", batch_id),
        },
    }
    Ok(())
}

async fn run(node: SyncNode) -> anyhow::Result<()> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Interrupt received, shutting down"),
            Err(e) => error!("Failed to listen for interrupt: {}", e),
        }
        let _ = shutdown_tx.send(true);
    });

    let replicator = Replicator::new(node);
    replicator.run(shutdown_rx).await?;
    Ok(())
}

fn init_logging(json: bool, verbose: bool) {
    let env_filter = if verbose {
        EnvFilter::new("rowsync=debug,info")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("rowsync=info,warn"))
    };

    let fmt_layer = if json {
        tracing_subscriber::fmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(false)
            .with_span_list(false)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_thread_ids(false)
            .with_thread_names(false)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}
