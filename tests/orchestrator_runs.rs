use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use dimse::mock::{MockArchive, MockSeries, MockStudy};
use dimse::{MoveQuery, RemoteNode};
use pacs_retriever::config::{Config, StrategyKind};
use pacs_retriever::error::FailureKind;
use pacs_retriever::orchestrator::{Limits, Orchestrator, StopReason};
use pacs_retriever::planner::QueryPlanner;
use pacs_retriever::retrieval::{RetrievalOutcome, RetrievalStrategy};
use tokio_util::sync::CancellationToken;

/// Stores one image per series and fires the interrupt on its first call
struct InterruptingStrategy {
    cancel: CancellationToken,
}

#[async_trait]
impl RetrievalStrategy for InterruptingStrategy {
    fn name(&self) -> &'static str {
        "interrupting"
    }

    async fn retrieve(&self, _query: &MoveQuery) -> RetrievalOutcome {
        self.cancel.cancel();
        RetrievalOutcome::stored(1)
    }
}

fn config(output: &Path, strategy: StrategyKind) -> Config {
    let mut config = Config::default();
    config.remote.host = Some("pacs.test".into());
    config.remote.port = Some(104);
    config.remote.ae_title = Some("ARCHIVE".into());
    config.query.from_date = Some("20240101".into());
    config.query.to_date = Some("20240131".into());
    config.retrieval.output_dir = output.to_path_buf();
    config.retrieval.strategy = strategy;
    config
}

fn nm_study(uid: &str, patient: &str, instances: usize) -> MockStudy {
    MockStudy::new(uid, patient, Some("CT\\NM"))
        .with_declared_instances(instances as u64)
        .with_series(MockSeries::new(format!("{}.1", uid), 1, "NM").with_instances(instances))
        .with_series(MockSeries::new(format!("{}.2", uid), 2, "CT").with_instances(4))
}

async fn run(config: Config, archive: &MockArchive) -> pacs_retriever::orchestrator::RunResult {
    pacs_retriever::run_with_protocol(config, Arc::new(archive.clone()), CancellationToken::new())
        .await
        .expect("run should succeed")
}

#[tokio::test]
async fn study_limit_processes_first_studies_only() {
    let out = tempfile::tempdir().unwrap();
    let archive = MockArchive::new(vec![
        nm_study("1.1", "A", 2),
        nm_study("1.2", "B", 2),
        nm_study("1.3", "C", 2),
    ]);
    let mut config = config(out.path(), StrategyKind::Listener);
    config.query.max_studies = Some(2);

    let result = run(config, &archive).await;

    assert_eq!(result.studies_matched, 3);
    assert_eq!(result.studies_processed, 2);
    assert_eq!(result.images_stored, 4);
    assert_eq!(result.stop_reason, StopReason::StudyLimit);
    assert!(out.path().join("A/1.1").is_dir());
    assert!(out.path().join("B/1.2").is_dir());
    assert!(!out.path().join("C").exists());

    let stats = archive.stats();
    assert_eq!(stats.move_requests, 2);
    // One study find plus one series find per processed study
    assert_eq!(stats.find_requests, 3);
    assert_eq!(stats.associations_opened, stats.associations_released);
}

#[tokio::test]
async fn modality_filter_keeps_only_target_studies() {
    let out = tempfile::tempdir().unwrap();
    let archive = MockArchive::new(vec![
        nm_study("2.1", "KEEP", 1),
        MockStudy::new("2.2", "MR", Some("CT\\MR")),
        MockStudy::new("2.3", "NONE", None),
    ]);

    let result = run(config(out.path(), StrategyKind::Listener), &archive).await;

    assert_eq!(result.studies_seen, 3);
    assert_eq!(result.studies_matched, 1);
    assert_eq!(result.studies_retrieved, 1);
    assert_eq!(result.stop_reason, StopReason::Completed);
    // Only the NM series of the kept study was moved
    assert_eq!(archive.stats().move_requests, 1);
    assert!(out.path().join("KEEP/2.1/2.1.1/2.1.1.1.dcm").is_file());
    assert!(!out.path().join("KEEP/2.1/2.1.2").exists());
}

#[tokio::test]
async fn dry_run_estimates_without_side_effects() {
    let scratch = tempfile::tempdir().unwrap();
    let out = scratch.path().join("never-created");
    let archive = MockArchive::new(vec![
        MockStudy::new("3.1", "P1", Some("NM")).with_declared_instances(10),
        MockStudy::new("3.2", "P2", Some("NM\\CT")).with_declared_instances(20),
        MockStudy::new("3.3", "P3", Some("NM")),
    ]);
    let mut config = config(&out, StrategyKind::Listener);
    config.retrieval.dry_run = true;

    let result = run(config, &archive).await;

    assert!(result.dry_run);
    assert_eq!(result.images_stored, 30);
    assert_eq!(result.studies_processed, 3);
    assert!(!out.exists());

    let stats = archive.stats();
    assert_eq!(stats.find_requests, 1);
    assert_eq!(stats.move_requests, 0);
    assert_eq!(stats.listeners_started, 0);
}

#[tokio::test]
async fn unreachable_archive_finds_nothing() {
    let out = tempfile::tempdir().unwrap();
    let archive = MockArchive::new(vec![nm_study("4.1", "P1", 1)]).offline();

    let result = run(config(out.path(), StrategyKind::Listener), &archive).await;

    assert_eq!(result.studies_seen, 0);
    assert_eq!(result.stop_reason, StopReason::NothingFound);

    let stats = archive.stats();
    assert_eq!(stats.associations_opened, 1);
    assert_eq!(stats.associations_released, 1);
    assert_eq!(stats.find_requests, 0);
}

#[tokio::test]
async fn image_limit_is_checked_between_studies() {
    let out = tempfile::tempdir().unwrap();
    let archive = MockArchive::new(vec![
        nm_study("5.1", "P1", 3),
        nm_study("5.2", "P2", 3),
        nm_study("5.3", "P3", 3),
    ]);
    let mut config = config(out.path(), StrategyKind::Listener);
    config.query.max_images = Some(2);

    let result = run(config, &archive).await;

    // The first study runs to completion even though it crosses the limit
    assert_eq!(result.studies_processed, 1);
    assert_eq!(result.images_stored, 3);
    assert_eq!(result.stop_reason, StopReason::ImageLimit);
}

#[tokio::test]
async fn cancellation_stops_before_next_study() {
    let out = tempfile::tempdir().unwrap();
    let archive = MockArchive::new(vec![nm_study("6.1", "P1", 1), nm_study("6.2", "P2", 1)]);
    let cancel = CancellationToken::new();
    cancel.cancel();

    let result = pacs_retriever::run_with_protocol(
        config(out.path(), StrategyKind::Listener),
        Arc::new(archive.clone()),
        cancel,
    )
    .await
    .unwrap();

    assert_eq!(result.stop_reason, StopReason::Cancelled);
    assert_eq!(result.studies_matched, 2);
    assert_eq!(result.studies_processed, 0);
    assert_eq!(archive.stats().move_requests, 0);
}

#[tokio::test]
async fn direct_find_respects_response_limit() {
    let archive = MockArchive::new(vec![
        nm_study("7.1", "P1", 1),
        MockStudy::new("7.2", "P2", Some("MR")),
        nm_study("7.3", "P3", 1),
    ]);
    let out = tempfile::tempdir().unwrap();
    let orchestrator = pacs_retriever::build_orchestrator(
        &config(out.path(), StrategyKind::Listener),
        Arc::new(archive.clone()),
        CancellationToken::new(),
    )
    .unwrap();

    let studies = orchestrator.find_studies(Some(2), "20240101-20240131").await;
    let uids: Vec<&str> = studies.iter().map(|s| s.study_uid.as_str()).collect();
    assert_eq!(uids, vec!["7.1", "7.2"]);

    assert!(orchestrator.find_studies(Some(0), "20240101-20240131").await.is_empty());

    let series = orchestrator.find_series("7.1", None).await;
    assert_eq!(series.len(), 1);
    assert_eq!(series[0].series_uid, "7.1.1");
    assert_eq!(series[0].declared_instance_count, Some(1));

    assert_eq!(archive.stats().associations_opened, 3);
    assert_eq!(archive.stats().associations_released, 3);
}

#[tokio::test]
async fn failed_writes_mark_the_series_failed() {
    let out = tempfile::tempdir().unwrap();
    // A regular file where the patient directory should go
    std::fs::write(out.path().join("PAT"), b"in the way").unwrap();
    let archive = MockArchive::new(vec![MockStudy::new("8.1", "PAT", Some("NM"))
        .with_series(MockSeries::new("8.1.1", 1, "NM").with_instances(3))]);

    let result = run(config(out.path(), StrategyKind::Listener), &archive).await;

    assert_eq!(result.studies_processed, 1);
    assert_eq!(result.studies_retrieved, 0);
    assert_eq!(result.images_stored, 0);
    assert_eq!(result.objects_failed, 3);
    assert_eq!(result.series_failures.len(), 1);
    assert_eq!(result.series_failures[0].series_uid, "8.1.1");
    assert_eq!(result.series_failures[0].kind, FailureKind::StorageWrite);
}

#[tokio::test]
async fn interrupt_during_last_study_is_reported() {
    let archive = MockArchive::new(vec![nm_study("9.1", "P1", 1)]);
    let cancel = CancellationToken::new();
    let strategy = InterruptingStrategy {
        cancel: cancel.clone(),
    };

    let orchestrator = Orchestrator::new(
        Arc::new(archive.clone()),
        RemoteNode::new("ARCHIVE", "pacs.test", 104),
        QueryPlanner::new("NM", "MY_LOCAL_AET"),
        Box::new(strategy),
        "20240101-20240131",
    )
    .with_cancellation(cancel.clone());

    let result = orchestrator.retrieve_images(Limits::default()).await;

    assert!(cancel.is_cancelled());
    assert_eq!(result.studies_processed, 1);
    assert_eq!(result.images_stored, 1);
    assert_eq!(result.stop_reason, StopReason::Cancelled);
}
