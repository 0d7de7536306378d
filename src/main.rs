use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use centralog::app::App;
use centralog::config::{Config, LogFormat};
use centralog::core::{Clock, SystemClock};
use centralog::stats::HealthReport;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "centralog")]
#[command(about = "Centralized log ingestion with a TTL-bounded structured cache and query API")]
#[command(version)]
struct Cli {
    /// Path to config file (default: <config dir>/centralog/config.toml when present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log root directory; repeat for several roots
    #[arg(long = "root", global = true)]
    roots: Vec<PathBuf>,

    /// HTTP bind address
    #[arg(long, global = true)]
    bind: Option<String>,

    /// Ingestion worker threads (0 = one per CPU)
    #[arg(long, global = true)]
    workers: Option<usize>,

    /// Offset checkpoint file
    #[arg(long, global = true)]
    state_file: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run ingestion and the HTTP query API (default)
    Serve,

    /// Resolve a time phrase against the current clock and print the window
    Resolve {
        phrase: String,
    },

    /// Run one ingestion pass and print store statistics
    Scan,
}

fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    let mut config = match &cli.config {
        Some(p) => Config::load(p).with_context(|| format!("loading {}", p.display()))?,
        None => Config::load_default().context("loading default config")?,
    };
    if !cli.roots.is_empty() {
        config.ingest.roots = cli.roots.clone();
    }
    if let Some(bind) = &cli.bind {
        config.server.bind = bind.clone();
    }
    if let Some(w) = cli.workers {
        config.ingest.workers = w;
    }
    if let Some(s) = &cli.state_file {
        config.ingest.state_file = Some(s.clone());
    }
    if cli.json_logs {
        config.log.format = LogFormat::Json;
    }
    config.validate()?;
    Ok(config)
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("centralog={}", config.log.level)));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match config.log.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;
    init_tracing(&config);

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(config, clock).await,
        Commands::Resolve { phrase } => {
            let app = App::build(config, clock.clone())?;
            let window = app.engine.resolver().resolve(&phrase, clock.now())?;
            println!("{}", serde_json::to_string_pretty(&window)?);
            Ok(())
        }
        Commands::Scan => {
            let app = App::build(config, clock.clone())?;
            app.pool.restore_checkpoint();
            let pool = app.pool.clone();
            let report = tokio::task::spawn_blocking(move || pool.run_pass()).await?;
            info!(
                "Scan complete: {} files, {} records ({} duplicates)",
                report.files, report.records, report.duplicates
            );
            let health = HealthReport::build(
                clock.now(),
                app.stats
                    .snapshot(clock.now(), app.tracker.tracked_count(), app.stale_after_secs()),
                app.store.stats(),
            );
            println!("{}", health);
            for s in app.store.sources() {
                println!(
                    "{}/{}/{}: {} entries",
                    s.host,
                    s.application,
                    s.component.as_deref().unwrap_or("-"),
                    s.entries
                );
            }
            Ok(())
        }
    }
}

async fn serve(config: Config, clock: Arc<dyn Clock>) -> anyhow::Result<()> {
    info!("Starting centralog: centralized log ingestion and query");

    let missing: Vec<PathBuf> = config
        .ingest
        .roots
        .iter()
        .filter(|r| !r.is_dir())
        .cloned()
        .collect();
    if !missing.is_empty() {
        anyhow::bail!("log roots do not exist: {:?}", missing);
    }

    let listener = tokio::net::TcpListener::bind(&config.server.bind)
        .await
        .with_context(|| format!("binding {}", config.server.bind))?;
    let app = App::build(config, clock)?;
    info!(
        "centralog ready. Query via: http://{}/api/logs?level=ERROR&time=last+1+hour",
        listener.local_addr()?
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(forward_shutdown(tokio::signal::ctrl_c(), shutdown_tx));

    app.run(listener, shutdown_rx).await
}

/// 优雅退出处理：信号到达时广播关闭。
///
/// 监听失败时继续持有 sender：sender 被丢弃会让订阅方误以为收到关闭。
async fn forward_shutdown<F>(signal: F, tx: watch::Sender<bool>)
where
    F: std::future::Future<Output = std::io::Result<()>>,
{
    if let Err(e) = signal.await {
        tracing::error!("Failed to listen for ctrl-c, shutdown only by kill: {}", e);
        std::future::pending::<()>().await;
    }
    let _ = tx.send(true);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn signal_broadcasts_shutdown() {
        let (tx, mut rx) = watch::channel(false);
        tokio::spawn(forward_shutdown(async { Ok(()) }, tx));
        rx.changed().await.unwrap();
        assert!(*rx.borrow());
    }

    #[tokio::test]
    async fn failed_listener_keeps_service_running() {
        let (tx, mut rx) = watch::channel(false);
        tokio::spawn(forward_shutdown(
            async { Err(std::io::Error::new(std::io::ErrorKind::Other, "no signal handler")) },
            tx,
        ));
        // sender 仍然存活：changed() 既不报错也不返回
        let waited = tokio::time::timeout(Duration::from_millis(100), rx.changed()).await;
        assert!(waited.is_err());
        assert!(!*rx.borrow());
    }
}
