//! C-MOVE into a storage listener hosted for the duration of one move

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use dimse::{
    Association, DatasetStream, DimseProtocol, DimseStatus, MoveQuery, MoveResponse, QueryModel,
    RemoteNode, StoreHandler,
};
use futures_util::StreamExt;
use tracing::{debug, error, info, warn};

use crate::error::RetrievalError;
use crate::retrieval::{RetrievalOutcome, RetrievalStrategy, STATUS_SUBOPERATIONS_FAILED};
use crate::storage::{FileSink, StorageError};

/// Status answered for an object we could not write (Refused: Out of Resources)
pub const STATUS_OUT_OF_RESOURCES: u16 = 0xA700;

/// Writes every received object through a [`FileSink`] and counts the results.
/// The first write error is kept to describe the series failure.
pub struct SinkStoreHandler {
    sink: FileSink,
    stored: AtomicU64,
    failed: AtomicU64,
    first_error: Mutex<Option<StorageError>>,
}

impl SinkStoreHandler {
    pub fn new(sink: FileSink) -> Self {
        Self {
            sink,
            stored: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            first_error: Mutex::new(None),
        }
    }

    pub fn stored(&self) -> u64 {
        self.stored.load(Ordering::SeqCst)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::SeqCst)
    }

    pub fn take_error(&self) -> Option<StorageError> {
        self.first_error.lock().ok().and_then(|mut slot| slot.take())
    }
}

#[async_trait]
impl StoreHandler for SinkStoreHandler {
    async fn on_store(&self, dataset: DatasetStream) -> DimseStatus {
        match self.sink.write_instance(&dataset).await {
            Ok(path) => {
                self.stored.fetch_add(1, Ordering::SeqCst);
                info!("Stored: {}", path.display());
                DimseStatus::Success
            }
            Err(e) => {
                self.failed.fetch_add(1, Ordering::SeqCst);
                error!("Failed to store received object: {}", e);
                if let Ok(mut slot) = self.first_error.lock() {
                    slot.get_or_insert(e);
                }
                DimseStatus::Failure(STATUS_OUT_OF_RESOURCES)
            }
        }
    }
}

/// Fetches a series with C-MOVE, receiving the objects on a listener of our own
pub struct ListenerRetrieval {
    protocol: Arc<dyn DimseProtocol>,
    remote: RemoteNode,
    bind_addr: SocketAddr,
    model: QueryModel,
    sink: FileSink,
}

impl ListenerRetrieval {
    pub fn new(
        protocol: Arc<dyn DimseProtocol>,
        remote: RemoteNode,
        bind_addr: SocketAddr,
        model: QueryModel,
        sink: FileSink,
    ) -> Self {
        Self {
            protocol,
            remote,
            bind_addr,
            model,
            sink,
        }
    }

    /// Associate, drain the move responses and release, whatever happened in between
    async fn run_move(&self, query: &MoveQuery) -> Result<MoveResponse, RetrievalError> {
        let mut association = self.protocol.associate(&self.remote).await?;
        if !association.is_established() {
            if let Err(e) = association.release().await {
                debug!("Release after rejected association failed: {}", e);
            }
            return Err(RetrievalError::Connectivity(self.remote.to_string()));
        }

        let result = drain_move(association.as_mut(), query, self.model).await;

        if let Err(e) = association.release().await {
            warn!("Failed to release association with {}: {}", self.remote, e);
        }
        result
    }
}

async fn drain_move(
    association: &mut dyn Association,
    query: &MoveQuery,
    model: QueryModel,
) -> Result<MoveResponse, RetrievalError> {
    let mut responses = association.send_move(query, model).await?;
    let mut last = None;

    while let Some(response) = responses.next().await {
        let response = response?;
        debug!(
            "C-MOVE response {}: remaining={} completed={} failed={}",
            response.status, response.remaining, response.completed, response.failed
        );
        last = Some(response);
    }

    last.ok_or_else(|| RetrievalError::ProtocolStatus {
        code: 0,
        detail: "no C-MOVE response received".to_string(),
    })
}

#[async_trait]
impl RetrievalStrategy for ListenerRetrieval {
    fn name(&self) -> &'static str {
        "c-move"
    }

    async fn retrieve(&self, query: &MoveQuery) -> RetrievalOutcome {
        let handler = Arc::new(SinkStoreHandler::new(self.sink.clone()));

        info!("Starting storage listener on {}", self.bind_addr);
        let mut listener = match self.protocol.start_listener(self.bind_addr, handler.clone()).await {
            Ok(listener) => listener,
            Err(e) => {
                error!("Failed to start storage listener on {}: {}", self.bind_addr, e);
                return RetrievalOutcome::failed(e.into());
            }
        };

        info!(
            "Retrieving series {} via C-MOVE to {}",
            query.parameter("SeriesInstanceUID").unwrap_or("?"),
            query.destination_aet
        );
        let result = self.run_move(query).await;

        // Stopping drains objects still in flight, so count afterwards
        if let Err(e) = listener.stop().await {
            warn!("Failed to stop storage listener: {}", e);
        }

        let mut outcome = RetrievalOutcome {
            images_stored: handler.stored(),
            failed_objects: handler.failed(),
            error: None,
        };

        match result {
            Ok(last) if last.status.is_failure() => {
                outcome.failed_objects = outcome.failed_objects.max(u64::from(last.failed));
                outcome.error = Some(RetrievalError::ProtocolStatus {
                    code: last.status.code(),
                    detail: format!("C-MOVE finished with {}", last.status),
                });
            }
            Ok(last) => {
                outcome.failed_objects = outcome.failed_objects.max(u64::from(last.failed));
                if let Some(e) = handler.take_error() {
                    outcome.error = Some(e.into());
                } else if outcome.failed_objects > 0 {
                    let code = match last.status.code() {
                        0 => STATUS_SUBOPERATIONS_FAILED,
                        code => code,
                    };
                    outcome.error = Some(RetrievalError::suboperations_failed(
                        code,
                        outcome.failed_objects,
                    ));
                } else {
                    info!("C-MOVE completed: {}", outcome.detail());
                }
            }
            Err(e) => outcome.error = Some(e),
        }

        if let Some(e) = &outcome.error {
            error!("C-MOVE failed: {}", e);
        }
        outcome
    }
}
