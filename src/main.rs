use std::sync::Arc;

use facturador::config::Config;
use facturador::llm::ChatClient;
use facturador::pipeline::Pipeline;
use facturador::store::ProcessedStore;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    // init tracing
    tracing_subscriber::fmt()
        .with_target(true)
        .with_level(true)
        .with_env_filter("info")
        .init();

    let config = Config::from_env()?;
    let chat = Arc::new(ChatClient::new(&config.llm)?);
    let store = ProcessedStore::open(&config.store_path)?;

    let cancel = CancellationToken::new();
    let signal_token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            signal_token.cancel();
        }
    });

    info!(
        mailbox = %config.mail.user,
        interval_secs = config.poll_interval.as_secs(),
        "watching inbox for order emails"
    );

    let pipeline = Pipeline::new(config.clone(), chat, store);
    loop {
        match pipeline.run_cycle().await {
            Ok(stats) => info!(
                fetched = stats.fetched,
                already_done = stats.already_done,
                sent = stats.sent,
                skipped = stats.skipped,
                notices = stats.notices,
                failed = stats.failed,
                "cycle finished"
            ),
            Err(e) => error!(error = %e, "cycle failed"),
        }

        tokio::select! {
            _ = tokio::time::sleep(config.poll_interval) => {}
            _ = cancel.cancelled() => {
                info!("shutting down");
                break;
            }
        }
    }

    Ok(())
}
