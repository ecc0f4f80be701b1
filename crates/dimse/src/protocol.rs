//! Protocol traits consumed by the retriever
//!
//! An [`Association`] is owned by the call that opened it and must be released by that
//! call on every exit path. A [`StoreListener`] runs a background receive loop until
//! [`StoreListener::stop`] is called.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::config::RemoteNode;
use crate::types::{DatasetStream, DimseStatus, FindQuery, FindResponse, MoveQuery, MoveResponse, QueryModel};
use crate::Result;

/// An open (or failed) session with a remote archive
#[async_trait]
pub trait Association: Send {
    /// Whether the remote accepted the association
    fn is_established(&self) -> bool;

    /// Issue a C-FIND; responses arrive in the order the remote produced them
    async fn send_find(
        &mut self,
        query: &FindQuery,
        model: QueryModel,
    ) -> Result<BoxStream<'static, Result<FindResponse>>>;

    /// Issue a C-MOVE towards `query.destination_aet`
    async fn send_move(
        &mut self,
        query: &MoveQuery,
        model: QueryModel,
    ) -> Result<BoxStream<'static, Result<MoveResponse>>>;

    /// Release the association. Releasing twice is a no-op.
    async fn release(&mut self) -> Result<()>;
}

/// Callback invoked for each object received by a [`StoreListener`]
#[async_trait]
pub trait StoreHandler: Send + Sync {
    /// Persist one received object and answer with the C-STORE status to report
    async fn on_store(&self, dataset: DatasetStream) -> DimseStatus;
}

/// An inbound C-STORE receiver bound to a local port
#[async_trait]
pub trait StoreListener: Send {
    /// Address the listener was asked to bind
    fn local_addr(&self) -> SocketAddr;

    /// Whether the receive loop is still running
    fn is_running(&self) -> bool;

    /// Stop accepting objects and release the port. Stopping twice is a no-op.
    async fn stop(&mut self) -> Result<()>;
}

/// Entry point into a DIMSE implementation
#[async_trait]
pub trait DimseProtocol: Send + Sync {
    /// Open an association with `node`. A refused association is returned with
    /// `is_established() == false` rather than as an error.
    async fn associate(&self, node: &RemoteNode) -> Result<Box<dyn Association>>;

    /// Start a storage listener that hands each received object to `handler`
    async fn start_listener(
        &self,
        bind_addr: SocketAddr,
        handler: Arc<dyn StoreHandler>,
    ) -> Result<Box<dyn StoreListener>>;
}
