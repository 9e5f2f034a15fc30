//! QuickHub LAN file transfer server (quickhub)

use anyhow::Context;
use clap::Parser;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod api;
mod config;
mod pad;
mod storage;

use config::Config;
use storage::{FileReceivedListener, Root, UploadIntake};

#[derive(Parser)]
#[command(name = "quickhub")]
#[command(about = "Share files and text with devices on the local network", long_about = None)]
struct Cli {
    /// Directory to share (created if missing)
    #[arg(long, short = 'd')]
    root: Option<PathBuf>,
    /// Address to bind
    #[arg(long)]
    host: Option<String>,
    /// HTTP port
    #[arg(long, short = 'p')]
    port: Option<u16>,
    /// Let uploads replace existing files
    #[arg(long)]
    overwrite: bool,
    /// Largest byte window returned for one range request
    #[arg(long)]
    max_chunk: Option<u64>,
    /// strftime pattern for listing timestamps
    #[arg(long)]
    date_format: Option<String>,
    /// Serve the web client from this directory
    #[arg(long)]
    static_dir: Option<PathBuf>,
    /// Command run with each received file's path as its only argument
    #[arg(long)]
    on_receive: Option<String>,
}

impl Cli {
    fn apply(self, config: &mut Config) {
        if let Some(root) = self.root {
            config.root = root;
        }
        if let Some(host) = self.host {
            config.host = host;
        }
        if let Some(port) = self.port {
            config.http_port = port;
        }
        if self.overwrite {
            config.overwrite = true;
        }
        if let Some(max_chunk) = self.max_chunk {
            config.max_chunk_size = max_chunk;
        }
        if let Some(date_format) = self.date_format {
            config.date_format = date_format;
        }
        if let Some(static_dir) = self.static_dir {
            config.static_dir = Some(static_dir);
        }
        if let Some(on_receive) = self.on_receive {
            config.on_receive = Some(on_receive);
        }
    }
}

/// Runs an external command for every received file. Failures are logged
/// and never reach the uploader.
struct CommandHook {
    program: String,
}

impl FileReceivedListener for CommandHook {
    fn on_file_received(&self, file: &Path) {
        let spawned = tokio::process::Command::new(&self.program)
            .arg(file)
            .stdin(Stdio::null())
            .spawn();
        match spawned {
            Ok(child) => {
                tracing::info!(command = %self.program, pid = ?child.id(), file = %file.display(), "on-receive hook started")
            }
            Err(e) => {
                tracing::warn!(command = %self.program, error = %e, "on-receive hook failed to start")
            }
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "quickhub=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = Config::from_env()?;
    cli.apply(&mut config);
    config.validate()?;

    run_server(config).await
}

fn open_root(config: &Config) -> anyhow::Result<Root> {
    Root::open(&config.root)
        .with_context(|| format!("cannot open shared directory {}", config.root.display()))
}

async fn run_server(mut config: Config) -> anyhow::Result<()> {
    let root = open_root(&config)?;
    config.root = root.path().to_path_buf();

    let mut intake = UploadIntake::new(root.clone(), config.overwrite);
    if let Some(program) = &config.on_receive {
        tracing::info!("running `{}` for each received file", program);
        intake = intake.with_listener(Arc::new(CommandHook {
            program: program.clone(),
        }));
    }

    tracing::info!(
        root = %root.path().display(),
        overwrite = config.overwrite,
        max_chunk = config.max_chunk_size,
        "sharing directory"
    );

    let addr = config.bind_addr();
    let state = api::AppState::new(root, intake, config);
    api::rest::serve(&addr, state).await
}
