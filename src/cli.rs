//! Command-line arguments
//!
//! Every flag is optional at parse time so that values can also come from the
//! environment or a TOML file; [`Cli::apply`] overlays whatever was given onto a
//! [`Config`], and [`Config::validate`] then rejects incomplete settings.

use std::path::PathBuf;

use clap::Parser;
use dimse::QueryModel;

use crate::config::config::validate_date;
use crate::config::{Config, StrategyKind};

/// Retrieve studies of one modality from a PACS
#[derive(Parser, Debug)]
#[command(
    name = "pacs-retriever",
    version,
    about = "Retrieve modality-filtered studies from a PACS for cataloguing",
    long_about = "Queries a PACS for studies in a date range, keeps those whose ModalitiesInStudy lists the target modality, \
and fetches their series with C-GET (DCMTK getscu) or C-MOVE into a local storage listener."
)]
pub struct Cli {
    /// TOML configuration file
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// PACS hostname or IP address
    #[arg(long, env = "PACS_HOST")]
    pub host: Option<String>,

    /// PACS port
    #[arg(long, env = "PACS_PORT")]
    pub port: Option<u16>,

    /// PACS AE title
    #[arg(long, env = "PACS_AET")]
    pub aet: Option<String>,

    /// Local AE title [default: MY_LOCAL_AET]
    #[arg(long, env = "LOCAL_AET")]
    pub local_aet: Option<String>,

    /// Local port for the C-MOVE storage listener [default: 11112]
    #[arg(long, env = "LOCAL_PORT")]
    pub local_port: Option<u16>,

    /// Output directory [default: ./nm_images]
    #[arg(short, long, value_name = "DIR")]
    pub output: Option<PathBuf>,

    /// Modality code to look for in ModalitiesInStudy [default: NM]
    #[arg(long)]
    pub modality: Option<String>,

    /// Maximum number of studies to retrieve
    #[arg(long)]
    pub max_studies: Option<usize>,

    /// Stop starting new studies once this many images were retrieved
    #[arg(long)]
    pub max_images: Option<u64>,

    /// Study date: YYYYMMDD, YYYYMMDD-, -YYYYMMDD or YYYYMMDD-YYYYMMDD
    #[arg(long, value_parser = parse_study_date)]
    pub study_date: Option<String>,

    /// Start of the date range (YYYYMMDD)
    #[arg(long, value_parser = parse_date)]
    pub from_date: Option<String>,

    /// End of the date range (YYYYMMDD)
    #[arg(long, value_parser = parse_date)]
    pub to_date: Option<String>,

    /// Use C-MOVE into a local listener instead of C-GET
    #[arg(long)]
    pub use_c_move: bool,

    /// Use the Patient Root information model instead of Study Root
    #[arg(long)]
    pub patient_root: bool,

    /// Query and report without retrieving anything
    #[arg(long)]
    pub dry_run: bool,

    /// Enable debug logging
    #[arg(long)]
    pub debug: bool,

    /// Path to the getscu binary [default: getscu]
    #[arg(long, value_name = "PATH")]
    pub getscu: Option<PathBuf>,

    /// Seconds before a getscu run is killed [default: 300]
    #[arg(long, value_name = "SECS")]
    pub tool_timeout: Option<u64>,

    /// Also write logs to this file
    #[arg(long, value_name = "FILE")]
    pub log_file: Option<PathBuf>,
}

impl Cli {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Load the configuration file, if any, and overlay the flags given on the command line
    pub fn into_config(self) -> Result<Config, crate::config::ConfigError> {
        let mut config = match &self.config {
            Some(path) => Config::load(path)?,
            None => Config::default(),
        };
        self.apply(&mut config);
        Ok(config)
    }

    /// Overlay flags (and their environment fallbacks) onto `config`
    pub fn apply(&self, config: &mut Config) {
        if let Some(host) = &self.host {
            config.remote.host = Some(host.clone());
        }
        if let Some(port) = self.port {
            config.remote.port = Some(port);
        }
        if let Some(aet) = &self.aet {
            config.remote.ae_title = Some(aet.clone());
        }
        if let Some(aet) = &self.local_aet {
            config.local.ae_title = aet.clone();
        }
        if let Some(port) = self.local_port {
            config.local.port = port;
        }

        if let Some(output) = &self.output {
            config.retrieval.output_dir = output.clone();
        }
        if let Some(modality) = &self.modality {
            config.query.modality = modality.clone();
        }
        if self.max_studies.is_some() {
            config.query.max_studies = self.max_studies;
        }
        if self.max_images.is_some() {
            config.query.max_images = self.max_images;
        }
        if self.study_date.is_some() {
            config.query.study_date = self.study_date.clone();
        }
        if self.from_date.is_some() {
            config.query.from_date = self.from_date.clone();
        }
        if self.to_date.is_some() {
            config.query.to_date = self.to_date.clone();
        }

        if self.use_c_move {
            config.retrieval.strategy = StrategyKind::Listener;
        }
        if self.patient_root {
            config.retrieval.query_model = QueryModel::PatientRoot;
        }
        if self.dry_run {
            config.retrieval.dry_run = true;
        }
        if let Some(getscu) = &self.getscu {
            config.retrieval.tool_path = getscu.clone();
        }
        if let Some(secs) = self.tool_timeout {
            config.retrieval.tool_timeout_secs = secs;
        }

        if self.debug {
            config.logging.debug = true;
        }
        if let Some(path) = &self.log_file {
            config.logging.log_to_file = true;
            config.logging.log_file_path = path.to_string_lossy().into_owned();
        }
    }
}

fn parse_date(value: &str) -> Result<String, String> {
    validate_date("date", value)
        .map(|_| value.to_string())
        .map_err(|e| e.to_string())
}

fn parse_study_date(value: &str) -> Result<String, String> {
    let sides: Vec<&str> = value.splitn(2, '-').collect();
    if sides.iter().all(|s| s.is_empty()) {
        return Err(format!("Invalid study date '{}'", value));
    }
    for side in sides.iter().filter(|s| !s.is_empty()) {
        validate_date("study date", side).map_err(|e| e.to_string())?;
    }
    Ok(value.to_string())
}
