pub mod cli;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod planner;
pub mod records;
pub mod retrieval;
pub mod storage;

use std::sync::Arc;

use anyhow::Context;
use dimse::dcmtk::DcmtkProtocol;
use dimse::DimseProtocol;
use tokio_util::sync::CancellationToken;

use crate::config::{Config, StrategyKind};
use crate::error::RetrievalError;
use crate::orchestrator::{Orchestrator, RunResult};
use crate::planner::{resolve_date_range, QueryPlanner};
use crate::retrieval::external::tool_available;
use crate::retrieval::{ListenerRetrieval, RetrievalStrategy, ToolRetrieval};
use crate::storage::FileSink;

/// Run against a real archive through the DCMTK tools
pub async fn run(config: Config, cancel: CancellationToken) -> anyhow::Result<RunResult> {
    let protocol: Arc<dyn DimseProtocol> = Arc::new(DcmtkProtocol::new(config.dimse_config()));
    run_with_protocol(config, protocol, cancel).await
}

/// Run with any protocol implementation. Configuration problems fail before the
/// protocol is touched.
pub async fn run_with_protocol(
    config: Config,
    protocol: Arc<dyn DimseProtocol>,
    cancel: CancellationToken,
) -> anyhow::Result<RunResult> {
    let orchestrator = build_orchestrator(&config, protocol, cancel)?;
    let sink = FileSink::new(&config.retrieval.output_dir);

    tracing::info!("🔧 Starting PACS retriever v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!(
        "Target: {} | local AE: {} | strategy: {} | model: {}",
        config.remote_node()?,
        config.local.ae_title,
        config.retrieval.strategy,
        config.retrieval.query_model
    );
    tracing::info!("Date range: {}", orchestrator.date_range());

    if config.retrieval.dry_run {
        tracing::info!("[DRY RUN] Output directory {} will not be touched", sink.root().display());
    } else {
        sink.ensure_root()
            .with_context(|| format!("Cannot create output directory {}", sink.root().display()))?;
        tracing::info!("Output directory: {}", sink.root().display());
        if config.retrieval.strategy == StrategyKind::ExternalTool
            && !tool_available(&config.retrieval.tool_path)
        {
            tracing::warn!(
                "{} not found; every series will fail (install DCMTK, e.g. `apt-get install dcmtk`)",
                config.retrieval.tool_path.display()
            );
        }
    }

    let result = orchestrator.retrieve_images(config.limits()).await;

    let dicom_files = if result.dry_run {
        None
    } else {
        let counter = sink.clone();
        tokio::task::spawn_blocking(move || counter.count_dicom_files())
            .await
            .ok()
    };
    result.log_summary(dicom_files);

    Ok(result)
}

/// Validate `config` and wire the planner, strategy and orchestrator together
pub fn build_orchestrator(
    config: &Config,
    protocol: Arc<dyn DimseProtocol>,
    cancel: CancellationToken,
) -> Result<Orchestrator, RetrievalError> {
    config.validate()?;
    let remote = config.remote_node()?;

    let planner = QueryPlanner::new(config.query.modality.as_str(), config.local.ae_title.as_str());
    let sink = FileSink::new(&config.retrieval.output_dir);
    let model = config.retrieval.query_model;

    let strategy: Box<dyn RetrievalStrategy> = match config.retrieval.strategy {
        StrategyKind::ExternalTool => Box::new(ToolRetrieval::new(
            config.retrieval.tool_path.clone(),
            remote.clone(),
            config.local.ae_title.as_str(),
            model,
            sink,
            config.tool_timeout(),
        )),
        StrategyKind::Listener => Box::new(ListenerRetrieval::new(
            protocol.clone(),
            remote.clone(),
            config.dimse_config().listen_addr(),
            model,
            sink,
        )),
    };

    let date_range = resolve_date_range(
        config.query.study_date.as_deref(),
        config.query.from_date.as_deref(),
        config.query.to_date.as_deref(),
    );

    Ok(Orchestrator::new(protocol, remote, planner, strategy, date_range)
        .with_model(model)
        .with_dry_run(config.retrieval.dry_run)
        .with_cancellation(cancel))
}
