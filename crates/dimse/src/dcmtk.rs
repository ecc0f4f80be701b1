//! DIMSE backend driving the DCMTK command line tools
//!
//! Each exchange runs one DCMTK process (`echoscu`, `findscu`, `movescu`) under a
//! wall-clock timeout; the process is killed when the timeout fires. Find and move
//! results are read from the tools' verbose output, so queries touch no files. The storage
//! listener runs `storescp` into a staging directory and hands every completed file
//! to the [`StoreHandler`].

use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::Output;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dicom_dictionary_std::tags;
use futures::stream::{self, BoxStream, StreamExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{DimseConfig, RemoteNode};
use crate::protocol::{Association, DimseProtocol, StoreHandler, StoreListener};
use crate::types::{
    DatasetMetadata, DatasetStream, DimseStatus, FindQuery, FindResponse, Identifier, MoveQuery,
    MoveResponse, QueryModel,
};
use crate::{DimseError, Result};

/// Processing failure, reported when a tool exits non-zero without a usable status
const STATUS_PROCESSING_FAILURE: u16 = 0x0110;

/// Names (or paths) of the DCMTK binaries
#[derive(Debug, Clone)]
pub struct DcmtkTools {
    pub echoscu: String,
    pub findscu: String,
    pub movescu: String,
    pub storescp: String,
}

impl Default for DcmtkTools {
    fn default() -> Self {
        Self {
            echoscu: "echoscu".to_string(),
            findscu: "findscu".to_string(),
            movescu: "movescu".to_string(),
            storescp: "storescp".to_string(),
        }
    }
}

/// DIMSE protocol implemented on top of DCMTK
pub struct DcmtkProtocol {
    config: DimseConfig,
    tools: DcmtkTools,
}

impl DcmtkProtocol {
    pub fn new(config: DimseConfig) -> Self {
        Self {
            config,
            tools: DcmtkTools::default(),
        }
    }

    /// Override the DCMTK binary locations
    pub fn with_tools(mut self, tools: DcmtkTools) -> Self {
        self.tools = tools;
        self
    }
}

#[async_trait]
impl DimseProtocol for DcmtkProtocol {
    async fn associate(&self, node: &RemoteNode) -> Result<Box<dyn Association>> {
        node.validate()?;
        info!("Requesting association with {}", node);

        // A C-ECHO round trip stands in for association negotiation: every later
        // exchange opens its own association inside the DCMTK process.
        let mut args = vec![
            "-aet".to_string(),
            self.config.local_aet.clone(),
            "-aec".to_string(),
            node.ae_title.clone(),
        ];
        args.extend(timeout_args(&self.config, node));
        args.push(node.host.clone());
        args.push(node.port.to_string());

        debug!("Running: {} {:?}", self.tools.echoscu, args);
        let established = match run_tool(&self.tools.echoscu, &args, node.connect_timeout(&self.config)).await {
            Ok(output) if output.status.success() => true,
            Ok(output) => {
                warn!(
                    "C-ECHO to {} failed: status={:?}, stderr={}",
                    node,
                    output.status.code(),
                    String::from_utf8_lossy(&output.stderr)
                );
                false
            }
            Err(DimseError::Timeout(msg)) => {
                warn!("C-ECHO to {} timed out: {}", node, msg);
                false
            }
            Err(e) => return Err(e),
        };

        Ok(Box::new(DcmtkAssociation {
            node: node.clone(),
            config: self.config.clone(),
            tools: self.tools.clone(),
            established,
            released: false,
        }))
    }

    async fn start_listener(
        &self,
        bind_addr: SocketAddr,
        handler: Arc<dyn StoreHandler>,
    ) -> Result<Box<dyn StoreListener>> {
        let listener = DcmtkStoreListener::start(&self.tools.storescp, &self.config, bind_addr, handler).await?;
        Ok(Box::new(listener))
    }
}

/// Association backed by DCMTK processes
pub struct DcmtkAssociation {
    node: RemoteNode,
    config: DimseConfig,
    tools: DcmtkTools,
    established: bool,
    released: bool,
}

impl DcmtkAssociation {
    fn ensure_usable(&self) -> Result<()> {
        if self.released {
            return Err(DimseError::Released);
        }
        if !self.established {
            return Err(DimseError::AssociationRejected(self.node.to_string()));
        }
        Ok(())
    }

    fn base_args(&self, model: QueryModel) -> Vec<String> {
        let mut args = vec![
            "-aet".to_string(),
            self.config.local_aet.clone(),
            "-aec".to_string(),
            self.node.ae_title.clone(),
            model_flag(model).to_string(),
            "-pdu".to_string(),
            self.config.max_pdu.to_string(),
        ];
        args.extend(timeout_args(&self.config, &self.node));
        args
    }
}

#[async_trait]
impl Association for DcmtkAssociation {
    fn is_established(&self) -> bool {
        self.established && !self.released
    }

    async fn send_find(
        &mut self,
        query: &FindQuery,
        model: QueryModel,
    ) -> Result<BoxStream<'static, Result<FindResponse>>> {
        self.ensure_usable()?;
        info!(
            "Sending C-FIND to {} (level: {}, model: {})",
            self.node, query.query_level, model
        );
        debug!("C-FIND query parameters: {:?}", query.parameters);

        let mut args = self.base_args(model);
        args.push("-v".into());
        args.push("-k".into());
        args.push(format!("QueryRetrieveLevel={}", query.query_level));
        args.extend(key_args(&query.parameters));
        args.push(self.node.host.clone());
        args.push(self.node.port.to_string());

        debug!("Running findscu args: {:?}", args);
        let output = run_tool(&self.tools.findscu, &args, self.config.association_timeout()).await?;
        let text = combined_output(&output);

        let mut responses: Vec<Result<FindResponse>> =
            parse_find_output(&text, query.parameters.keys())
                .into_iter()
                .map(|identifier| Ok(FindResponse::pending(identifier)))
                .collect();

        let final_status = if output.status.success() {
            info!("C-FIND completed with {} matches", responses.len());
            DimseStatus::Success
        } else {
            warn!(
                "findscu failed: status={:?}, stderr={}",
                output.status.code(),
                String::from_utf8_lossy(&output.stderr)
            );
            DimseStatus::Failure(STATUS_PROCESSING_FAILURE)
        };
        responses.push(Ok(FindResponse::last(final_status)));

        Ok(stream::iter(responses).boxed())
    }

    async fn send_move(
        &mut self,
        query: &MoveQuery,
        model: QueryModel,
    ) -> Result<BoxStream<'static, Result<MoveResponse>>> {
        self.ensure_usable()?;
        info!(
            "Sending C-MOVE to {} (level: {}, dest: {})",
            self.node, query.query_level, query.destination_aet
        );
        debug!("C-MOVE query parameters: {:?}", query.parameters);

        let mut args = self.base_args(model);
        args.push("-v".into());
        args.push("-aem".into());
        args.push(query.destination_aet.clone());
        args.push("-k".into());
        args.push(format!("QueryRetrieveLevel={}", query.query_level));
        args.extend(key_args(&query.parameters));
        args.push(self.node.host.clone());
        args.push(self.node.port.to_string());

        debug!("Running movescu args: {:?}", args);
        let output = run_tool(&self.tools.movescu, &args, self.config.association_timeout()).await?;
        let text = combined_output(&output);

        let mut responses = parse_move_output(&text);
        let has_final = responses.last().map(|r| !r.status.is_pending()).unwrap_or(false);
        if !has_final {
            let status = if output.status.success() {
                DimseStatus::Success
            } else {
                DimseStatus::Failure(STATUS_PROCESSING_FAILURE)
            };
            responses.push(MoveResponse::status(status));
        }

        Ok(stream::iter(responses.into_iter().map(Ok)).boxed())
    }

    async fn release(&mut self) -> Result<()> {
        if !self.released {
            debug!("Releasing association with {}", self.node);
            self.released = true;
        }
        Ok(())
    }
}

/// `storescp` running into a staging directory plus an ingest loop
pub struct DcmtkStoreListener {
    addr: SocketAddr,
    child: Option<Child>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
    // Dropped after the ingest task finishes
    _staging: tempfile::TempDir,
    running: bool,
}

impl DcmtkStoreListener {
    const POLL_INTERVAL: Duration = Duration::from_millis(100);

    async fn start(
        program: &str,
        config: &DimseConfig,
        addr: SocketAddr,
        handler: Arc<dyn StoreHandler>,
    ) -> Result<Self> {
        let staging = tempfile::Builder::new().prefix("storescp_").tempdir()?;

        let mut cmd = Command::new(program);
        cmd.arg("-aet")
            .arg(&config.local_aet)
            .arg("-pdu")
            .arg(config.max_pdu.to_string())
            .arg("-od")
            .arg(staging.path())
            .arg(addr.port().to_string())
            .kill_on_drop(true);

        info!(
            "Starting DCMTK storescp AET='{}' on :{} -> {}",
            config.local_aet,
            addr.port(),
            staging.path().display()
        );

        let mut child = cmd
            .spawn()
            .map_err(|e| DimseError::listener(format!("Failed to spawn {}: {}", program, e)))?;

        wait_for_listener_ready(addr).await;
        if let Ok(Some(status)) = child.try_wait() {
            return Err(DimseError::listener(format!(
                "{} exited during startup with {:?} (port {} in use?)",
                program,
                status.code(),
                addr.port()
            )));
        }

        let cancel = CancellationToken::new();
        let task = tokio::spawn(ingest_loop(
            staging.path().to_path_buf(),
            handler,
            cancel.clone(),
        ));

        Ok(Self {
            addr,
            child: Some(child),
            cancel,
            task: Some(task),
            _staging: staging,
            running: true,
        })
    }
}

#[async_trait]
impl StoreListener for DcmtkStoreListener {
    fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    fn is_running(&self) -> bool {
        self.running
    }

    async fn stop(&mut self) -> Result<()> {
        if !self.running {
            return Ok(());
        }
        self.running = false;

        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.kill().await {
                warn!("Failed to stop storescp: {}", e);
            }
        }

        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            task.await
                .map_err(|e| DimseError::listener(format!("ingest task failed: {}", e)))?;
        }

        info!("Storage listener on :{} stopped", self.addr.port());
        Ok(())
    }
}

impl Drop for DcmtkStoreListener {
    fn drop(&mut self) {
        // The child is killed on drop; the ingest task only needs its signal.
        self.cancel.cancel();
    }
}

async fn ingest_loop(staging: PathBuf, handler: Arc<dyn StoreHandler>, cancel: CancellationToken) {
    let mut sizes: HashMap<PathBuf, u64> = HashMap::new();
    let mut interval = tokio::time::interval(DcmtkStoreListener::POLL_INTERVAL);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                ingest_staged(&staging, &handler, &mut sizes, false).await;
            }
        }
    }

    // storescp is gone, whatever is left is complete
    ingest_staged(&staging, &handler, &mut sizes, true).await;
}

/// Hand staged files to the handler once their size stopped changing between polls
async fn ingest_staged(
    staging: &Path,
    handler: &Arc<dyn StoreHandler>,
    sizes: &mut HashMap<PathBuf, u64>,
    drain: bool,
) {
    let mut entries = match tokio::fs::read_dir(staging).await {
        Ok(entries) => entries,
        Err(e) => {
            error!("Cannot read staging directory {:?}: {}", staging, e);
            return;
        }
    };

    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        let size = match entry.metadata().await {
            Ok(meta) if meta.is_file() => meta.len(),
            _ => continue,
        };

        let stable = sizes.get(&path) == Some(&size);
        if !stable && !drain {
            sizes.insert(path, size);
            continue;
        }
        sizes.remove(&path);

        let metadata = read_metadata(&path).unwrap_or_else(|e| {
            warn!("Received object {:?} has unreadable header: {}", path, e);
            DatasetMetadata::new()
        });
        let dataset = DatasetStream::from_file(path.clone(), true).with_metadata(metadata);
        let status = handler.on_store(dataset).await;
        if !status.is_success() {
            warn!("Store handler rejected {:?}: {}", path, status);
        }
    }
}

/// Wait for the listener to be ready by attempting TCP connection
async fn wait_for_listener_ready(addr: SocketAddr) {
    let target = if addr.ip().is_unspecified() {
        SocketAddr::from(([127, 0, 0, 1], addr.port()))
    } else {
        addr
    };

    for _ in 0..40 {
        if tokio::net::TcpStream::connect(target).await.is_ok() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

/// Run a tool to completion, killing it when `timeout` elapses
async fn run_tool(program: &str, args: &[String], timeout: Duration) -> Result<Output> {
    let mut cmd = Command::new(program);
    cmd.args(args).kill_on_drop(true);

    match tokio::time::timeout(timeout, cmd.output()).await {
        Ok(Ok(output)) => Ok(output),
        Ok(Err(e)) => Err(DimseError::operation_failed(format!(
            "Failed to spawn {}: {}",
            program, e
        ))),
        Err(_) => Err(DimseError::Timeout(format!(
            "{} did not finish within {}s",
            program,
            timeout.as_secs()
        ))),
    }
}

fn model_flag(model: QueryModel) -> &'static str {
    match model {
        QueryModel::StudyRoot => "-S",
        QueryModel::PatientRoot => "-P",
    }
}

fn timeout_args(config: &DimseConfig, node: &RemoteNode) -> Vec<String> {
    let secs = node.connect_timeout(config).as_secs().max(1).to_string();
    vec![
        "-to".to_string(),
        secs.clone(),
        "-ta".to_string(),
        secs.clone(),
        "-td".to_string(),
        secs,
    ]
}

/// Render query keys as `-k` arguments; 8-digit hex tags become `(gggg,eeee)`
fn key_args(parameters: &BTreeMap<String, String>) -> Vec<String> {
    let mut args = Vec::with_capacity(parameters.len() * 2);
    for (k, v) in parameters {
        let tag = if k.len() == 8 && k.chars().all(|c| c.is_ascii_hexdigit()) {
            format!("({},{})", &k[0..4], &k[4..8])
        } else {
            k.clone()
        };
        args.push("-k".to_string());
        args.push(format!("{}={}", tag, v));
    }
    args
}

fn combined_output(output: &Output) -> String {
    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    text.push_str(&String::from_utf8_lossy(&output.stderr));
    text
}

/// Parse `findscu -v` output into identifiers, in arrival order.
///
/// Every match is dumped after a `Find Response: N (Pending)` line, one element per
/// line: `(0020,000d) UI [1.2.3]   #   6, 1 StudyInstanceUID`. Only attributes named in
/// `keys` are kept; empty values are dropped.
pub fn parse_find_output<'a>(text: &str, keys: impl IntoIterator<Item = &'a String>) -> Vec<Identifier> {
    let wanted: HashSet<&str> = keys.into_iter().map(String::as_str).collect();
    let mut identifiers = Vec::new();
    let mut current: Option<Identifier> = None;

    for line in text.lines() {
        if line.to_ascii_lowercase().contains("find response") {
            identifiers.extend(current.take());
            if bracketed_status(line).map(|s| s.is_pending()).unwrap_or(false) {
                current = Some(Identifier::new());
            }
            continue;
        }

        let Some(identifier) = current.as_mut() else {
            continue;
        };
        if let Some((keyword, value)) = dump_element(line) {
            if wanted.contains(keyword) && !value.is_empty() {
                identifier.insert(keyword.to_string(), value.to_string());
            }
        }
    }

    identifiers.extend(current);
    identifiers
}

/// Keyword and trimmed value of one dataset dump line
fn dump_element(line: &str) -> Option<(&str, &str)> {
    let body = &line[line.find('(')?..];
    let bytes = body.as_bytes();
    if bytes.len() < 11 || bytes[5] != b',' || bytes[10] != b')' {
        return None;
    }

    let (element, comment) = body.rsplit_once('#')?;
    let keyword = comment.split_whitespace().last()?;
    let value = match (element.find('['), element.rfind(']')) {
        (Some(open), Some(close)) if close > open => element[open + 1..close].trim(),
        // "(no value available)"
        _ => "",
    };
    Some((keyword, value))
}

fn read_metadata(path: &Path) -> Result<DatasetMetadata> {
    let obj = dicom_object::open_file(path).map_err(|e| DimseError::DicomParsing(e.to_string()))?;
    let text = |tag| {
        obj.element(tag)
            .ok()
            .and_then(|e| e.to_str().ok())
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    };

    let mut metadata = DatasetMetadata::new();
    metadata.patient_id = text(tags::PATIENT_ID);
    metadata.study_instance_uid = text(tags::STUDY_INSTANCE_UID);
    metadata.series_instance_uid = text(tags::SERIES_INSTANCE_UID);
    metadata.sop_instance_uid = text(tags::SOP_INSTANCE_UID);
    metadata.sop_class_uid = text(tags::SOP_CLASS_UID);
    metadata.size_bytes = std::fs::metadata(path).ok().map(|m| m.len());
    Ok(metadata)
}

/// Parse `movescu -v` output into move responses.
///
/// Status lines look like `I: Received Move Response 2 (Pending)` and
/// `I: Received Final Move Response (Success)`; sub-operation counters, when printed,
/// are attached to the final response.
pub fn parse_move_output(text: &str) -> Vec<MoveResponse> {
    let mut responses = Vec::new();
    let mut counters = MoveResponse::status(DimseStatus::Pending);

    for line in text.lines() {
        let lower = line.to_ascii_lowercase();
        if lower.contains("move response") {
            if let Some(status) = bracketed_status(line) {
                responses.push(MoveResponse::status(status));
            }
        } else if lower.contains("suboperations") {
            let Some(value) = line
                .rsplit(':')
                .next()
                .and_then(|v| v.trim().parse::<u32>().ok())
            else {
                continue;
            };
            if lower.contains("remaining") {
                counters.remaining = value;
            } else if lower.contains("completed") {
                counters.completed = value;
            } else if lower.contains("failed") {
                counters.failed = value;
            } else if lower.contains("warning") {
                counters.warning = value;
            }
        }
    }

    if let Some(last) = responses.last_mut() {
        if !last.status.is_pending() {
            last.remaining = counters.remaining;
            last.completed = counters.completed;
            last.failed = counters.failed;
            last.warning = counters.warning;
        }
    }
    responses
}

fn bracketed_status(line: &str) -> Option<DimseStatus> {
    let start = line.rfind('(')?;
    let end = line[start..].find(')')? + start;
    let inner = line[start + 1..end].trim();
    let lower = inner.to_ascii_lowercase();

    let explicit_code = lower
        .find("0x")
        .and_then(|i| u16::from_str_radix(lower[i + 2..].get(..4)?, 16).ok());

    Some(match explicit_code {
        Some(code) => DimseStatus::from_code(code),
        None if lower.starts_with("success") => DimseStatus::Success,
        None if lower.starts_with("pending") => DimseStatus::Pending,
        None if lower.starts_with("warning") => DimseStatus::Warning(0xB000),
        None if lower.starts_with("cancel") => DimseStatus::Cancel,
        None => DimseStatus::Failure(0xC000),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_args_render_hex_tags() {
        let mut params = BTreeMap::new();
        params.insert("00100020".to_string(), "PID1".to_string());
        params.insert("Modality".to_string(), "NM".to_string());
        params.insert("SeriesInstanceUID".to_string(), String::new());

        let args = key_args(&params);
        assert_eq!(
            args,
            vec![
                "-k", "(0010,0020)=PID1",
                "-k", "Modality=NM",
                "-k", "SeriesInstanceUID=",
            ]
        );
    }

    #[test]
    fn test_model_flags() {
        assert_eq!(model_flag(QueryModel::StudyRoot), "-S");
        assert_eq!(model_flag(QueryModel::PatientRoot), "-P");
    }

    #[test]
    fn test_parse_find_output() {
        let text = "I: Requesting Association\n\
                    I: Association Accepted (Max Send PDV: 16372)\n\
                    I: Sending Find Request\n\
                    I: ---------------------------\n\
                    I: Find Response: 1 (Pending)\n\
                    I: \n\
                    I: # Dicom-Data-Set\n\
                    I: # Used TransferSyntax: Little Endian Explicit\n\
                    I: (0008,0052) CS [STUDY ]                                #   6, 1 QueryRetrieveLevel\n\
                    I: (0008,0061) CS [CT\\NM ]                               #   6, 2 ModalitiesInStudy\n\
                    I: (0010,0020) LO (no value available)                    #   0, 0 PatientID\n\
                    I: (0020,000d) UI [1.2.840.1]                             #  10, 1 StudyInstanceUID\n\
                    I: (0020,1208) IS [42]                                    #   2, 1 NumberOfStudyRelatedInstances\n\
                    I: ---------------------------\n\
                    I: Find Response: 2 (Pending)\n\
                    I: (0010,0020) LO [P2]                                    #   2, 1 PatientID\n\
                    I: (0020,000d) UI [1.2.840.2]                             #  10, 1 StudyInstanceUID\n\
                    I: Received Final Find Response (Success)\n\
                    I: Releasing Association\n";
        let keys: Vec<String> = ["StudyInstanceUID", "PatientID", "ModalitiesInStudy", "NumberOfStudyRelatedInstances"]
            .iter()
            .map(|k| k.to_string())
            .collect();

        let found = parse_find_output(text, &keys);
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].get("StudyInstanceUID").map(String::as_str), Some("1.2.840.1"));
        assert_eq!(found[0].get("ModalitiesInStudy").map(String::as_str), Some("CT\\NM"));
        assert_eq!(found[0].get("NumberOfStudyRelatedInstances").map(String::as_str), Some("42"));
        // Not requested, and empty
        assert!(!found[0].contains_key("QueryRetrieveLevel"));
        assert!(!found[0].contains_key("PatientID"));
        assert_eq!(found[1].get("PatientID").map(String::as_str), Some("P2"));
    }

    #[test]
    fn test_parse_find_output_without_matches() {
        let keys = vec!["StudyInstanceUID".to_string()];
        let text = "I: Received Final Find Response (Success)\n";
        assert!(parse_find_output(text, &keys).is_empty());
        assert!(parse_find_output("E: Association Request Failed", &keys).is_empty());
    }

    #[test]
    fn test_parse_move_output_success() {
        let text = "I: Requesting Association\n\
                    I: Received Move Response 1 (Pending)\n\
                    I: Received Move Response 2 (Pending)\n\
                    I: Number of Completed Suboperations : 12\n\
                    I: Number of Failed Suboperations    : 1\n\
                    I: Received Final Move Response (Warning)\n\
                    I: Releasing Association\n";

        let responses = parse_move_output(text);
        assert_eq!(responses.len(), 3);
        assert!(responses[0].status.is_pending());
        let last = responses[2];
        assert_eq!(last.status, DimseStatus::Warning(0xB000));
        assert_eq!(last.completed, 12);
        assert_eq!(last.failed, 1);
    }

    #[test]
    fn test_parse_move_output_failure_code() {
        let text = "E: Received Final Move Response (Failed: Move Destination unknown 0xa801)\n";
        let responses = parse_move_output(text);
        assert_eq!(responses, vec![MoveResponse::status(DimseStatus::Failure(0xA801))]);
    }

    #[test]
    fn test_parse_move_output_without_responses() {
        assert!(parse_move_output("E: Association Request Failed").is_empty());
    }

    #[tokio::test]
    async fn test_run_tool_reports_missing_binary() {
        let result = run_tool("definitely-not-a-dcmtk-tool", &[], Duration::from_secs(1)).await;
        assert!(matches!(result, Err(DimseError::OperationFailed(_))));
    }

    #[tokio::test]
    async fn test_released_association_rejects_find() {
        let mut assoc = DcmtkAssociation {
            node: RemoteNode::new("PACS", "localhost", 11112),
            config: DimseConfig::default(),
            tools: DcmtkTools::default(),
            established: true,
            released: false,
        };
        assoc.release().await.unwrap();
        assert!(!assoc.is_established());

        let query = FindQuery::study(None);
        let result = assoc.send_find(&query, QueryModel::StudyRoot).await;
        assert!(matches!(result, Err(DimseError::Released)));
    }

    #[tokio::test]
    async fn test_echo_against_missing_dcmtk_is_an_error_or_refusal() {
        if std::process::Command::new("echoscu").arg("--version").output().is_ok() {
            // With DCMTK installed an unreachable node is a refused association
            let protocol = DcmtkProtocol::new(DimseConfig {
                connect_timeout_ms: 1000,
                ..Default::default()
            });
            let node = RemoteNode::new("NOBODY", "127.0.0.1", 1);
            let assoc = protocol.associate(&node).await.unwrap();
            assert!(!assoc.is_established());
        } else {
            eprintln!("Skipping: echoscu not found");
        }
    }
}
