//! DIMSE (DICOM Message Service Element) protocol layer
//!
//! This crate is the protocol collaborator of the PACS retriever. It exposes the
//! association-oriented operations the retriever needs and nothing more:
//!
//! - [`DimseProtocol::associate`] opens a session with a remote archive
//! - [`Association::send_find`] / [`Association::send_move`] issue C-FIND / C-MOVE
//! - [`DimseProtocol::start_listener`] runs an inbound C-STORE receiver
//!
//! Two backends implement the traits: [`dcmtk::DcmtkProtocol`] drives the DCMTK command
//! line tools (feature `dcmtk_cli`), and `mock::MockArchive` (feature `mock`) is an in-memory
//! archive used by tests.

pub mod config;
#[cfg(feature = "dcmtk_cli")]
pub mod dcmtk;
pub mod error;
#[cfg(any(test, feature = "mock"))]
pub mod mock;
pub mod protocol;
pub mod types;

// Re-export commonly used types
pub use config::{DimseConfig, RemoteNode};
pub use error::{DimseError, Result};
pub use protocol::{Association, DimseProtocol, StoreHandler, StoreListener};
pub use types::{
    DatasetMetadata, DatasetStream, DimseStatus, FindQuery, FindResponse, Identifier, MoveQuery,
    MoveResponse, QueryLevel, QueryModel,
};

/// Default DICOM port (non-TLS)
pub const DEFAULT_DIMSE_PORT: u16 = 11112;
