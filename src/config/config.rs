use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::NaiveDate;
use dimse::{DimseConfig, QueryModel, RemoteNode};
use serde::Deserialize;
use thiserror::Error;

use crate::config::logging_config::LoggingConfig;
use crate::orchestrator::Limits;

/// Top-level configuration, loaded from TOML and overlaid by command line flags
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub remote: RemoteConfig,
    pub local: LocalConfig,
    pub query: QueryConfig,
    pub retrieval: RetrievalConfig,
    pub logging: LoggingConfig,
}

/// The archive to query. Every field is required before a run starts.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct RemoteConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub ae_title: Option<String>,
}

/// Our own DICOM identity; the port is where the storage listener binds
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LocalConfig {
    pub ae_title: String,
    pub port: u16,
    pub bind_address: IpAddr,
    /// Maximum PDU size offered by the DCMTK tools
    pub max_pdu: u32,
}

/// What to look for
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    /// Modality code a study must list in `ModalitiesInStudy`
    pub modality: String,
    /// Exact date or DICOM range, used verbatim
    pub study_date: Option<String>,
    pub from_date: Option<String>,
    pub to_date: Option<String>,
    pub max_studies: Option<usize>,
    pub max_images: Option<u64>,
}

/// How to fetch and where to put the files
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    pub output_dir: PathBuf,
    pub strategy: StrategyKind,
    pub query_model: QueryModel,
    pub dry_run: bool,
    /// Path or name of the `getscu` binary used by the external tool strategy
    pub tool_path: PathBuf,
    pub tool_timeout_secs: u64,
    pub network_timeout_secs: u64,
}

/// Transport used to fetch one series
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    /// Shell out to DCMTK `getscu` (C-GET)
    #[default]
    ExternalTool,
    /// C-MOVE into a storage listener we host ourselves
    Listener,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required remote setting '{0}' (set it in the config file, the environment or on the command line)")]
    MissingRemote(&'static str),

    #[error("{side} AE title '{value}' must be 1-16 characters")]
    InvalidAeTitle { side: &'static str, value: String },

    #[error("{0} port must be greater than 0")]
    InvalidPort(&'static str),

    #[error("Invalid {field} '{value}': expected YYYYMMDD")]
    InvalidDate { field: &'static str, value: String },

    #[error("Modality code must not be empty")]
    EmptyModality,

    #[error("{0} timeout must be greater than 0 seconds")]
    InvalidTimeout(&'static str),

    #[error("Invalid protocol settings: {0}")]
    Protocol(#[from] dimse::DimseError),

    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to initialise logging: {0}")]
    Logging(String),
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            ae_title: "MY_LOCAL_AET".to_string(),
            port: dimse::DEFAULT_DIMSE_PORT,
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            max_pdu: DimseConfig::default().max_pdu,
        }
    }
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            modality: "NM".to_string(),
            study_date: None,
            from_date: None,
            to_date: None,
            max_studies: None,
            max_images: None,
        }
    }
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("./nm_images"),
            strategy: StrategyKind::default(),
            query_model: QueryModel::default(),
            dry_run: false,
            tool_path: PathBuf::from("getscu"),
            tool_timeout_secs: 300,
            network_timeout_secs: 30,
        }
    }
}

impl Config {
    /// Load a TOML configuration file
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(toml::from_str(&text)?)
    }

    /// Check required connection settings and value ranges. Runs before any network use.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.remote_node()?;

        validate_ae_title("Local", &self.local.ae_title)?;
        if self.local.port == 0 {
            return Err(ConfigError::InvalidPort("Local"));
        }

        if self.query.modality.trim().is_empty() {
            return Err(ConfigError::EmptyModality);
        }
        if let Some(from) = &self.query.from_date {
            validate_date("from date", from)?;
        }
        if let Some(to) = &self.query.to_date {
            validate_date("to date", to)?;
        }
        if let Some(single) = &self.query.study_date {
            // Either an exact date or a DICOM range with open ends
            for side in single.split('-').filter(|s| !s.is_empty()) {
                validate_date("study date", side)?;
            }
        }

        if self.retrieval.tool_timeout_secs == 0 {
            return Err(ConfigError::InvalidTimeout("Tool"));
        }
        if self.retrieval.network_timeout_secs == 0 {
            return Err(ConfigError::InvalidTimeout("Network"));
        }

        self.dimse_config().validate()?;
        Ok(())
    }

    /// The archive as a validated [`RemoteNode`]
    pub fn remote_node(&self) -> Result<RemoteNode, ConfigError> {
        let host = self
            .remote
            .host
            .as_deref()
            .filter(|h| !h.trim().is_empty())
            .ok_or(ConfigError::MissingRemote("host"))?;
        let port = self.remote.port.ok_or(ConfigError::MissingRemote("port"))?;
        let ae_title = self
            .remote
            .ae_title
            .as_deref()
            .filter(|a| !a.trim().is_empty())
            .ok_or(ConfigError::MissingRemote("ae_title"))?;

        if port == 0 {
            return Err(ConfigError::InvalidPort("Remote"));
        }
        validate_ae_title("Remote", ae_title)?;

        Ok(RemoteNode::new(ae_title, host, port).with_timeout(self.network_timeout().as_millis() as u64))
    }

    /// Settings handed to the protocol layer
    pub fn dimse_config(&self) -> DimseConfig {
        let network = self.network_timeout().as_millis() as u64;
        DimseConfig {
            local_aet: self.local.ae_title.clone(),
            bind_addr: self.local.bind_address,
            port: self.local.port,
            max_pdu: self.local.max_pdu,
            connect_timeout_ms: network,
            // A whole find or move may run for as long as the tool timeout allows
            association_timeout_ms: self.tool_timeout().as_millis() as u64,
        }
    }

    pub fn limits(&self) -> Limits {
        Limits {
            max_studies: self.query.max_studies,
            max_images: self.query.max_images,
        }
    }

    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.retrieval.tool_timeout_secs)
    }

    pub fn network_timeout(&self) -> Duration {
        Duration::from_secs(self.retrieval.network_timeout_secs)
    }
}

impl std::fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StrategyKind::ExternalTool => write!(f, "external-tool (C-GET)"),
            StrategyKind::Listener => write!(f, "listener (C-MOVE)"),
        }
    }
}

fn validate_ae_title(side: &'static str, value: &str) -> Result<(), ConfigError> {
    if value.trim().is_empty() || value.len() > 16 {
        return Err(ConfigError::InvalidAeTitle {
            side,
            value: value.to_string(),
        });
    }
    Ok(())
}

/// Accept exactly eight digits forming a real calendar date
pub fn validate_date(field: &'static str, value: &str) -> Result<(), ConfigError> {
    let well_formed = value.len() == 8
        && value.chars().all(|c| c.is_ascii_digit())
        && NaiveDate::parse_from_str(value, "%Y%m%d").is_ok();
    if !well_formed {
        return Err(ConfigError::InvalidDate {
            field,
            value: value.to_string(),
        });
    }
    Ok(())
}
