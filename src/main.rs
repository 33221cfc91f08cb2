use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::info;

use slotwise::auth::RoleGate;
use slotwise::config::Config;
use slotwise::engine::{Engine, WalStore};
use slotwise::notify::NotifyHub;
use slotwise::{compactor, driver};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Replies own stdout; logs go to stderr.
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();

    let config = Config::from_env();
    slotwise::observability::init(config.metrics_port)?;

    std::fs::create_dir_all(&config.data_dir)?;
    let store = WalStore::open(&config.wal_path())?;
    let compactor_store = store.clone();
    let threshold = config.compact_threshold;
    tokio::spawn(async move {
        compactor::run_compactor(compactor_store, threshold).await;
    });

    let engine = Engine::new(
        Arc::new(store),
        Arc::new(NotifyHub::new()),
        Arc::new(RoleGate),
        config.lock_timeout,
    );

    info!("slotwise ready");
    info!("  data_dir: {}", config.data_dir.display());
    info!("  lock_timeout: {:?}", config.lock_timeout);
    info!(
        "  metrics: {}",
        config
            .metrics_port
            .map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"))
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                if line.trim().is_empty() {
                    continue;
                }
                let reply = driver::handle_line(&engine, &line).await;
                stdout.write_all(format!("{reply}\n").as_bytes()).await?;
                stdout.flush().await?;
            }
            _ = &mut shutdown => {
                info!("shutdown signal received");
                break;
            }
        }
    }

    info!("slotwise stopped");
    Ok(())
}
