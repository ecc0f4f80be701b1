use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use dimse::mock::{MockArchive, MockSeries, MockStudy};
use dimse::{DimseStatus, MoveQuery, QueryLevel, QueryModel, RemoteNode};
use pacs_retriever::error::{FailureKind, RetrievalError};
use pacs_retriever::retrieval::{ListenerRetrieval, RetrievalStrategy};
use pacs_retriever::storage::FileSink;

fn archive() -> MockArchive {
    MockArchive::new(vec![MockStudy::new("1.2", "AB/12*ID", Some("NM"))
        .with_series(MockSeries::new("1.2.1", 1, "NM").with_instances(3))])
}

fn strategy(archive: &MockArchive, root: &Path) -> ListenerRetrieval {
    ListenerRetrieval::new(
        Arc::new(archive.clone()),
        RemoteNode::new("ARCHIVE", "pacs.test", 104),
        "0.0.0.0:11112".parse::<SocketAddr>().unwrap(),
        QueryModel::StudyRoot,
        FileSink::new(root),
    )
}

fn series_query() -> MoveQuery {
    MoveQuery::new(QueryLevel::Series, "MY_LOCAL_AET")
        .with_parameter("StudyInstanceUID", "1.2")
        .with_parameter("SeriesInstanceUID", "1.2.1")
}

#[tokio::test]
async fn objects_land_at_canonical_paths() {
    let out = tempfile::tempdir().unwrap();
    let archive = archive();

    let outcome = strategy(&archive, out.path()).retrieve(&series_query()).await;

    assert!(outcome.success(), "{}", outcome.detail());
    assert_eq!(outcome.images_stored, 3);
    for n in 1..=3 {
        let path = out.path().join(format!("AB12ID/1.2/1.2.1/1.2.1.{}.dcm", n));
        assert!(path.is_file(), "missing {}", path.display());
    }

    let stats = archive.stats();
    assert_eq!(stats.listeners_started, 1);
    assert_eq!(stats.listeners_stopped, 1);
    assert_eq!(stats.associations_released, 1);
}

#[tokio::test]
async fn listener_is_stopped_after_failing_move() {
    let out = tempfile::tempdir().unwrap();
    let archive = archive().failing_move_after(1);
    let retrieval = strategy(&archive, out.path());

    let outcome = retrieval.retrieve(&series_query()).await;

    assert!(!outcome.success());
    assert_eq!(outcome.images_stored, 1);
    assert!(matches!(outcome.error, Some(RetrievalError::Protocol(_))));

    let stats = archive.stats();
    assert!(!stats.listener_running);
    assert_eq!(stats.listeners_stopped, 1);
    assert_eq!(stats.associations_opened, stats.associations_released);

    // The port is free again: a second attempt can start its own listener
    let again = retrieval.retrieve(&series_query()).await;
    assert_eq!(again.images_stored, 1);
    assert_eq!(archive.stats().listeners_started, 2);
}

#[tokio::test]
async fn failure_status_marks_series_failed() {
    let out = tempfile::tempdir().unwrap();
    let archive = archive().with_final_move_status(DimseStatus::Failure(0xA702));

    let outcome = strategy(&archive, out.path()).retrieve(&series_query()).await;

    match &outcome.error {
        Some(e @ RetrievalError::ProtocolStatus { code, .. }) => {
            assert_eq!(*code, 0xA702);
            assert_eq!(e.kind(), FailureKind::ProtocolStatus);
        }
        other => panic!("expected protocol status error, got {:?}", other),
    }
    assert!(!archive.stats().listener_running);
}

#[tokio::test]
async fn refused_association_still_stops_listener() {
    let out = tempfile::tempdir().unwrap();
    let archive = archive().offline();

    let outcome = strategy(&archive, out.path()).retrieve(&series_query()).await;

    assert!(matches!(outcome.error, Some(RetrievalError::Connectivity(_))));
    assert_eq!(outcome.images_stored, 0);

    let stats = archive.stats();
    assert_eq!(stats.move_requests, 0);
    assert_eq!(stats.listeners_stopped, 1);
    assert!(!stats.listener_running);
}

#[tokio::test]
async fn write_failures_are_per_object() {
    let scratch = tempfile::tempdir().unwrap();
    // A regular file where the output root should be makes every write fail
    let root = scratch.path().join("blocked");
    std::fs::write(&root, b"not a directory").unwrap();
    let archive = archive();

    let outcome = strategy(&archive, &root).retrieve(&series_query()).await;

    assert_eq!(outcome.images_stored, 0);
    assert_eq!(outcome.failed_objects, 3);
    // Each object was refused on its own, and the series reports the write error
    match &outcome.error {
        Some(e @ RetrievalError::StorageWrite(_)) => {
            assert_eq!(e.kind(), FailureKind::StorageWrite)
        }
        other => panic!("expected storage write error, got {:?}", other),
    }
    assert!(!archive.stats().listener_running);
}
