//! Standalone AgentDeck server binary. Run with --port and --dist, or use defaults.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use common::{config, db, notify};
use server::{run_web_server, AppState, SqliteSink};

const DEFAULT_PORT: u16 = 5190;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,common=debug")),
        )
        .init();

    let cfg = config::ensure_loaded();
    let mut port = DEFAULT_PORT;
    let mut dist: Option<PathBuf> = None;

    let args: Vec<String> = std::env::args().collect();
    let mut i = 1;
    while i < args.len() {
        if args[i] == "--port" && i + 1 < args.len() {
            port = args[i + 1].parse().unwrap_or(DEFAULT_PORT);
            i += 2;
            continue;
        }
        if args[i] == "--dist" && i + 1 < args.len() {
            dist = Some(PathBuf::from(&args[i + 1]));
            i += 2;
            continue;
        }
        i += 1;
    }

    std::fs::create_dir_all(&cfg.working_dir)?;
    let conn = db::open_db(&cfg.working_dir)?;
    let db = Arc::new(Mutex::new(conn));

    let notifier = notify::notifier_from_config(cfg);
    let registry = common::pty::PtyRegistry::new(
        Arc::new(SqliteSink { db: db.clone() }),
        notifier,
    );

    let state = AppState {
        registry,
        db,
        working_dir: cfg.working_dir.clone(),
        dist,
    };

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run_web_server(port, state))
}
