//! C-GET through DCMTK `getscu`
//!
//! `getscu` owns the association and the on-disk layout: it writes every received object
//! straight into the output root, named after its SOP Instance UID but without an
//! extension. After each successful run the sink's repair pass appends `.dcm`.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use dimse::{MoveQuery, QueryModel, RemoteNode};
use tokio::process::Command;
use tracing::{debug, error, info, warn};

use crate::error::RetrievalError;
use crate::retrieval::{RetrievalOutcome, RetrievalStrategy, STATUS_SUBOPERATIONS_FAILED};
use crate::storage::FileSink;

/// Fetches a series by running `getscu` once per series
pub struct ToolRetrieval {
    tool: PathBuf,
    remote: RemoteNode,
    local_aet: String,
    model: QueryModel,
    sink: FileSink,
    timeout: Duration,
}

impl ToolRetrieval {
    pub fn new(
        tool: impl Into<PathBuf>,
        remote: RemoteNode,
        local_aet: impl Into<String>,
        model: QueryModel,
        sink: FileSink,
        timeout: Duration,
    ) -> Self {
        Self {
            tool: tool.into(),
            remote,
            local_aet: local_aet.into(),
            model,
            sink,
            timeout,
        }
    }

    /// Full argument list for one invocation
    pub fn arguments(&self, query: &MoveQuery) -> Vec<String> {
        let mut args = vec![
            "-v".to_string(),
            match self.model {
                QueryModel::StudyRoot => "-S".to_string(),
                QueryModel::PatientRoot => "-P".to_string(),
            },
            "-aet".to_string(),
            self.local_aet.clone(),
            "-aec".to_string(),
            self.remote.ae_title.clone(),
            self.remote.host.clone(),
            self.remote.port.to_string(),
            "-k".to_string(),
            format!("QueryRetrieveLevel={}", query.query_level),
        ];
        for (key, value) in &query.parameters {
            args.push("-k".to_string());
            args.push(format!("{}={}", key, value));
        }
        args.push("-od".to_string());
        args.push(self.sink.root().to_string_lossy().into_owned());
        args
    }

    async fn run(&self, args: &[String]) -> Result<String, RetrievalError> {
        let mut cmd = Command::new(&self.tool);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = match tokio::time::timeout(self.timeout, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(RetrievalError::tool(
                    &self.tool,
                    "not found (install DCMTK, e.g. `apt-get install dcmtk`, or pass --getscu)",
                ))
            }
            Ok(Err(e)) => return Err(RetrievalError::tool(&self.tool, format!("failed to start: {}", e))),
            Err(_) => {
                return Err(RetrievalError::tool(
                    &self.tool,
                    format!("timed out after {}s", self.timeout.as_secs()),
                ))
            }
        };

        let stderr = String::from_utf8_lossy(&output.stderr);
        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&stderr);

        if !output.status.success() {
            if !stderr.trim().is_empty() {
                error!("{} stderr: {}", self.tool.display(), stderr.trim());
            }
            let reason = match output.status.code() {
                Some(code) => format!("exited with status {}", code),
                None => "terminated by signal".to_string(),
            };
            return Err(RetrievalError::tool(&self.tool, reason));
        }

        Ok(text)
    }

    async fn repair(&self) {
        let sink = self.sink.clone();
        match tokio::task::spawn_blocking(move || sink.repair_extensions()).await {
            Ok(report) if report.renamed > 0 => {
                info!("Renamed {} files to add .dcm extension", report.renamed)
            }
            Ok(_) => {}
            Err(e) => warn!("Extension repair pass did not complete: {}", e),
        }
    }
}

#[async_trait]
impl RetrievalStrategy for ToolRetrieval {
    fn name(&self) -> &'static str {
        "getscu"
    }

    async fn retrieve(&self, query: &MoveQuery) -> RetrievalOutcome {
        let args = self.arguments(query);
        info!(
            "Retrieving series {} via {}",
            query.parameter("SeriesInstanceUID").unwrap_or("?"),
            self.tool.display()
        );
        debug!("Running: {} {:?}", self.tool.display(), args);

        let text = match self.run(&args).await {
            Ok(text) => text,
            Err(e) => {
                error!("{}", e);
                return RetrievalOutcome::failed(e);
            }
        };

        let completed = parse_completed_suboperations(&text);
        let failed = parse_suboperations(&text, "failed suboperations");
        self.repair().await;

        if completed > 0 {
            info!("Retrieved {} images", completed);
        } else {
            info!(
                "{} completed (check {} for files)",
                self.tool.display(),
                self.sink.root().display()
            );
        }

        let error = if failed > 0 {
            warn!("{} reported {} failed sub-operations", self.tool.display(), failed);
            Some(RetrievalError::suboperations_failed(
                STATUS_SUBOPERATIONS_FAILED,
                failed,
            ))
        } else {
            None
        };

        RetrievalOutcome {
            images_stored: completed,
            failed_objects: failed,
            error,
        }
    }
}

/// Count from the last "Completed Suboperations" line; 0 when absent or unparsable
pub fn parse_completed_suboperations(text: &str) -> u64 {
    parse_suboperations(text, "completed suboperations")
}

fn parse_suboperations(text: &str, label: &str) -> u64 {
    text.lines()
        .rev()
        .find(|line| line.to_ascii_lowercase().contains(label))
        .and_then(|line| line.rsplit(':').next())
        .and_then(|value| value.trim().parse().ok())
        .unwrap_or(0)
}

/// Whether `tool` resolves to an executable, either as a path or through `PATH`
pub fn tool_available(tool: &Path) -> bool {
    if tool.components().count() > 1 {
        return tool.is_file();
    }
    std::env::var_os("PATH")
        .map(|paths| std::env::split_paths(&paths).any(|dir| dir.join(tool).is_file()))
        .unwrap_or(false)
}
