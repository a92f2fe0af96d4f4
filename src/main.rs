use carbon_offline::config::Config;
use carbon_offline::engine::Engine;
use carbon_offline::event::{self, EventHandler};
use clap::Parser;
use color_eyre::{eyre::eyre, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use url::Url;

#[derive(Parser, Debug)]
#[command(name = "carbon-offline")]
#[command(about = "Offline engine for the CarbonOS dashboard, driven by JSON events on stdin")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/carbon-offline/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Cache generation token, e.g. v3
  #[arg(short, long)]
  generation: Option<String>,

  /// Origin that relative URLs resolve against
  #[arg(short, long)]
  origin: Option<Url>,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;

  // Command line wins over the file
  let config = Config {
    generation: args.generation.unwrap_or(config.generation),
    origin: args.origin.unwrap_or(config.origin),
    ..config
  };
  config.validate()?;

  let data_dir = config.data_dir()?;
  let _log_guard = init_logging(&data_dir)?;

  let engine = Arc::new(Engine::open(&config)?);
  run(engine).await
}

/// Log to a file in the data directory; stdout carries the event protocol.
fn init_logging(data_dir: &Path) -> Result<tracing_appender::non_blocking::WorkerGuard> {
  std::fs::create_dir_all(data_dir)
    .map_err(|e| eyre!("Failed to create data directory: {}", e))?;

  let appender = tracing_appender::rolling::never(data_dir, "carbon-offline.log");
  let (writer, guard) = tracing_appender::non_blocking(appender);

  let filter = EnvFilter::try_from_env("CARBON_OFFLINE_LOG").unwrap_or_else(|_| EnvFilter::new("info"));

  tracing_subscriber::registry()
    .with(filter)
    .with(fmt::layer().with_writer(writer).with_ansi(false))
    .try_init()
    .map_err(|e| eyre!("Failed to init logging: {}", e))?;

  Ok(guard)
}

async fn run(engine: Arc<Engine>) -> Result<()> {
  let mut events = EventHandler::new(tokio::io::stdin(), engine.origin().clone());
  let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();

  let writer = tokio::spawn(async move {
    let mut stdout = tokio::io::stdout();
    while let Some(line) = out_rx.recv().await {
      stdout.write_all(line.as_bytes()).await?;
      stdout.write_all(b"\n").await?;
      stdout.flush().await?;
    }
    Ok::<_, std::io::Error>(())
  });

  while let Some(inbound) = events.next().await {
    let event = match inbound.event {
      Ok(event) => event,
      Err(message) => {
        let _ = out_tx.send(event::render_rejected(inbound.id.as_ref(), &message));
        continue;
      }
    };

    if event.is_ordered() {
      let outcome = engine.dispatch(event).await;
      let _ = out_tx.send(event::render(inbound.id.as_ref(), &outcome));
    } else {
      let engine = Arc::clone(&engine);
      let out_tx = out_tx.clone();
      tokio::spawn(async move {
        let outcome = engine.dispatch(event).await;
        let _ = out_tx.send(event::render(inbound.id.as_ref(), &outcome));
      });
    }
  }

  info!("input closed, draining in-flight events");
  drop(out_tx);
  match writer.await {
    Ok(Ok(())) => Ok(()),
    Ok(Err(e)) => {
      warn!("stdout closed: {}", e);
      Ok(())
    }
    Err(e) => Err(eyre!("Output task failed: {}", e)),
  }
}
