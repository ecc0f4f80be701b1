//! Common types for DIMSE operations

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Attribute keyword to value, as returned in a C-FIND identifier.
///
/// Multi-valued attributes are joined with `\`, the DICOM value delimiter.
pub type Identifier = BTreeMap<String, String>;

/// Represents a DICOM dataset as either in-memory bytes or a file path
#[derive(Debug)]
pub enum DatasetStream {
    /// DICOM object in memory
    Memory {
        /// Raw DICOM bytes
        data: Bytes,
        /// Associated metadata
        metadata: DatasetMetadata,
    },
    /// DICOM object stored as a (possibly temporary) file
    File {
        /// Path to the file
        path: PathBuf,
        /// Associated metadata
        metadata: DatasetMetadata,
        /// Whether to delete the file when dropped
        delete_on_drop: bool,
    },
}

/// Metadata associated with a DICOM dataset
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatasetMetadata {
    /// SOP Class UID
    pub sop_class_uid: Option<String>,

    /// SOP Instance UID
    pub sop_instance_uid: Option<String>,

    /// Study Instance UID
    pub study_instance_uid: Option<String>,

    /// Series Instance UID
    pub series_instance_uid: Option<String>,

    /// Patient ID
    pub patient_id: Option<String>,

    /// Size of the dataset in bytes
    pub size_bytes: Option<u64>,
}

/// DICOM query/retrieve levels used by the retriever
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueryLevel {
    Study,
    Series,
}

/// Query/Retrieve information model used for C-FIND and C-MOVE
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryModel {
    /// Study Root Query/Retrieve Information Model
    #[default]
    StudyRoot,
    /// Patient Root Query/Retrieve Information Model
    PatientRoot,
}

/// Query parameters for C-FIND operations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FindQuery {
    pub query_level: QueryLevel,

    /// Matching and return keys by attribute keyword; an empty value requests the attribute
    pub parameters: BTreeMap<String, String>,
}

/// Query parameters for C-MOVE operations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoveQuery {
    pub query_level: QueryLevel,

    /// Unique keys identifying what to move
    pub parameters: BTreeMap<String, String>,

    /// Destination AE Title for the move operation
    pub destination_aet: String,
}

/// DIMSE operation status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DimseStatus {
    /// Operation completed successfully
    Success,
    /// Operation is pending (more responses to follow)
    Pending,
    /// Operation cancelled by user
    Cancel,
    /// Operation failed with error
    Failure(u16), // DICOM status code
    /// Warning occurred during operation
    Warning(u16), // DICOM status code
}

/// One C-FIND response: a status and, while pending, the matched identifier
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FindResponse {
    pub status: DimseStatus,
    pub identifier: Option<Identifier>,
}

/// One C-MOVE response with the sub-operation counters reported by the remote
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MoveResponse {
    pub status: DimseStatus,
    pub remaining: u32,
    pub completed: u32,
    pub failed: u32,
    pub warning: u32,
}

impl DatasetStream {
    /// Create a new in-memory dataset
    pub fn from_bytes(data: Bytes) -> Self {
        let mut metadata = DatasetMetadata::new();
        metadata.size_bytes = Some(data.len() as u64);
        Self::Memory { data, metadata }
    }

    /// Create a new file-based dataset
    pub fn from_file(path: PathBuf, delete_on_drop: bool) -> Self {
        Self::File {
            path,
            metadata: DatasetMetadata::new(),
            delete_on_drop,
        }
    }

    /// Replace the metadata, keeping the payload
    pub fn with_metadata(mut self, metadata: DatasetMetadata) -> Self {
        *self.metadata_mut() = metadata;
        self
    }

    /// Get the metadata for this dataset
    pub fn metadata(&self) -> &DatasetMetadata {
        match self {
            Self::Memory { metadata, .. } => metadata,
            Self::File { metadata, .. } => metadata,
        }
    }

    /// Get mutable metadata for this dataset
    pub fn metadata_mut(&mut self) -> &mut DatasetMetadata {
        match self {
            Self::Memory { metadata, .. } => metadata,
            Self::File { metadata, .. } => metadata,
        }
    }
}

impl DatasetMetadata {
    /// Metadata with every identifier unknown
    pub fn new() -> Self {
        Self::default()
    }
}

impl FindQuery {
    /// Create an empty query at the given level
    pub fn new(query_level: QueryLevel) -> Self {
        Self {
            query_level,
            parameters: BTreeMap::new(),
        }
    }

    /// Create a new study-level query
    pub fn study(study_instance_uid: Option<String>) -> Self {
        Self::new(QueryLevel::Study)
            .with_parameter("StudyInstanceUID", study_instance_uid.unwrap_or_default())
    }

    /// Create a new series-level query scoped to one study
    pub fn series(study_instance_uid: impl Into<String>) -> Self {
        Self::new(QueryLevel::Series).with_parameter("StudyInstanceUID", study_instance_uid)
    }

    /// Add a query parameter
    pub fn with_parameter(mut self, tag: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(tag.into(), value.into());
        self
    }

    /// Request an attribute without constraining it
    pub fn with_return_key(self, tag: impl Into<String>) -> Self {
        self.with_parameter(tag, "")
    }

    /// Look up a parameter value
    pub fn parameter(&self, tag: &str) -> Option<&str> {
        self.parameters.get(tag).map(String::as_str)
    }
}

impl MoveQuery {
    /// Create a new move query
    pub fn new(query_level: QueryLevel, destination_aet: impl Into<String>) -> Self {
        Self {
            query_level,
            parameters: BTreeMap::new(),
            destination_aet: destination_aet.into(),
        }
    }

    /// Add a query parameter
    pub fn with_parameter(mut self, tag: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(tag.into(), value.into());
        self
    }

    /// Look up a parameter value
    pub fn parameter(&self, tag: &str) -> Option<&str> {
        self.parameters.get(tag).map(String::as_str)
    }
}

impl DimseStatus {
    /// Classify a raw DIMSE status code (PS3.7 Annex C)
    pub fn from_code(code: u16) -> Self {
        match code {
            0x0000 => DimseStatus::Success,
            0xFF00 | 0xFF01 => DimseStatus::Pending,
            0xFE00 => DimseStatus::Cancel,
            0x0001 | 0x0107 | 0x0116 | 0xB000..=0xBFFF => DimseStatus::Warning(code),
            other => DimseStatus::Failure(other),
        }
    }

    /// Raw status code
    pub fn code(&self) -> u16 {
        match self {
            DimseStatus::Success => 0x0000,
            DimseStatus::Pending => 0xFF00,
            DimseStatus::Cancel => 0xFE00,
            DimseStatus::Failure(code) | DimseStatus::Warning(code) => *code,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, DimseStatus::Pending)
    }

    pub fn is_success(&self) -> bool {
        matches!(self, DimseStatus::Success)
    }

    /// Failure or cancel: the operation did not complete
    pub fn is_failure(&self) -> bool {
        matches!(self, DimseStatus::Failure(_) | DimseStatus::Cancel)
    }
}

impl FindResponse {
    /// Pending response carrying one match
    pub fn pending(identifier: Identifier) -> Self {
        Self {
            status: DimseStatus::Pending,
            identifier: Some(identifier),
        }
    }

    /// Final response without identifier
    pub fn last(status: DimseStatus) -> Self {
        Self {
            status,
            identifier: None,
        }
    }
}

impl MoveResponse {
    /// Response with only a status and zeroed counters
    pub fn status(status: DimseStatus) -> Self {
        Self {
            status,
            remaining: 0,
            completed: 0,
            failed: 0,
            warning: 0,
        }
    }
}

impl std::fmt::Display for QueryLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueryLevel::Study => write!(f, "STUDY"),
            QueryLevel::Series => write!(f, "SERIES"),
        }
    }
}

impl std::fmt::Display for QueryModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueryModel::StudyRoot => write!(f, "study-root"),
            QueryModel::PatientRoot => write!(f, "patient-root"),
        }
    }
}

impl std::fmt::Display for DimseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DimseStatus::Success => write!(f, "Success"),
            DimseStatus::Pending => write!(f, "Pending"),
            DimseStatus::Cancel => write!(f, "Cancel"),
            DimseStatus::Failure(code) => write!(f, "Failure (0x{:04X})", code),
            DimseStatus::Warning(code) => write!(f, "Warning (0x{:04X})", code),
        }
    }
}

// Implement Drop for DatasetStream to handle file cleanup
impl Drop for DatasetStream {
    fn drop(&mut self) {
        if let DatasetStream::File {
            path,
            delete_on_drop,
            ..
        } = self
        {
            if *delete_on_drop {
                if let Err(e) = std::fs::remove_file(&*path) {
                    tracing::warn!("Failed to delete temporary DICOM file {:?}: {}", path, e);
                }
            }
        }
    }
}
