use std::process;

use pacs_retriever::cli::Cli;
use pacs_retriever::orchestrator::StopReason;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

#[tokio::main]
async fn main() {
    // A missing .env is fine
    dotenv::dotenv().ok();

    let cli = Cli::parse_args();
    let config = match cli.into_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {}", e);
            process::exit(2);
        }
    };

    if let Err(e) = config.logging.init() {
        eprintln!("Error: {}", e);
        process::exit(2);
    }

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, finishing the current study");
            on_signal.cancel();
        }
    });

    match pacs_retriever::run(config, cancel).await {
        Ok(result) if result.stop_reason == StopReason::Cancelled => {
            warn!(
                "Interrupted after {} studies and {} images",
                result.studies_processed, result.images_stored
            );
            process::exit(130);
        }
        Ok(_) => {}
        Err(e) => {
            error!("{:#}", e);
            process::exit(1);
        }
    }
}
