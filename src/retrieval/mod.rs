//! Series retrieval strategies
//!
//! A [`RetrievalStrategy`] fetches exactly one series and reports what happened as a
//! [`RetrievalOutcome`]. Strategies never return `Err`: every failure is recovered into the
//! outcome so that the orchestrator can count it and move on to the next series.

use async_trait::async_trait;
use dimse::MoveQuery;

use crate::error::RetrievalError;

pub mod external;
pub mod listener;

pub use external::{parse_completed_suboperations, ToolRetrieval};
pub use listener::{ListenerRetrieval, SinkStoreHandler};

/// Warning status for a retrieve in which some sub-operations failed
pub const STATUS_SUBOPERATIONS_FAILED: u16 = 0xB000;

/// Result of fetching one series
#[derive(Debug, Default)]
pub struct RetrievalOutcome {
    /// Objects that reached the output root
    pub images_stored: u64,
    /// Objects the remote or the local sink reported as failed
    pub failed_objects: u64,
    /// Set when the series failed, wholly or for some of its objects
    pub error: Option<RetrievalError>,
}

impl RetrievalOutcome {
    pub fn stored(images_stored: u64) -> Self {
        Self {
            images_stored,
            ..Default::default()
        }
    }

    pub fn failed(error: RetrievalError) -> Self {
        Self {
            error: Some(error),
            ..Default::default()
        }
    }

    pub fn success(&self) -> bool {
        self.error.is_none()
    }

    /// Human readable one-liner for logs
    pub fn detail(&self) -> String {
        match &self.error {
            None if self.failed_objects > 0 => format!(
                "{} stored, {} failed",
                self.images_stored, self.failed_objects
            ),
            None => format!("{} stored", self.images_stored),
            Some(e) => format!("{} stored before failure: {}", self.images_stored, e),
        }
    }
}

/// Transport used to fetch one series
#[async_trait]
pub trait RetrievalStrategy: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &'static str;

    /// Fetch the series identified by `query`
    async fn retrieve(&self, query: &MoveQuery) -> RetrievalOutcome;
}
