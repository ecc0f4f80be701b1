//! In-memory archive implementing [`DimseProtocol`] for tests
//!
//! The archive answers STUDY and SERIES level C-FIND requests from a fixed list of
//! studies and delivers C-MOVE sub-operations straight into whichever storage listener
//! is currently running. Counters on [`MockStats`] let tests assert how often each
//! protocol operation was used.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};

use crate::config::RemoteNode;
use crate::protocol::{Association, DimseProtocol, StoreHandler, StoreListener};
use crate::types::{
    DatasetMetadata, DatasetStream, DimseStatus, FindQuery, FindResponse, Identifier, MoveQuery,
    MoveResponse, QueryLevel, QueryModel,
};
use crate::{DimseError, Result};

#[derive(Debug, Clone)]
pub struct MockInstance {
    pub sop_instance_uid: String,
    pub data: Bytes,
}

#[derive(Debug, Clone)]
pub struct MockSeries {
    pub series_uid: String,
    pub series_number: i32,
    pub modality: String,
    pub description: String,
    pub instances: Vec<MockInstance>,
}

#[derive(Debug, Clone)]
pub struct MockStudy {
    pub study_uid: String,
    pub patient_id: String,
    /// `ModalitiesInStudy`, only returned when the query asks for it
    pub modalities: Option<String>,
    /// `NumberOfStudyRelatedInstances` as declared by the archive
    pub declared_instances: Option<u64>,
    pub series: Vec<MockSeries>,
}

impl MockStudy {
    pub fn new(study_uid: impl Into<String>, patient_id: impl Into<String>, modalities: Option<&str>) -> Self {
        Self {
            study_uid: study_uid.into(),
            patient_id: patient_id.into(),
            modalities: modalities.map(str::to_string),
            declared_instances: None,
            series: Vec::new(),
        }
    }

    pub fn with_declared_instances(mut self, count: u64) -> Self {
        self.declared_instances = Some(count);
        self
    }

    pub fn with_series(mut self, series: MockSeries) -> Self {
        self.series.push(series);
        self
    }
}

impl MockSeries {
    pub fn new(series_uid: impl Into<String>, series_number: i32, modality: impl Into<String>) -> Self {
        Self {
            series_uid: series_uid.into(),
            series_number,
            modality: modality.into(),
            description: String::new(),
            instances: Vec::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Add `count` instances with UIDs `<series_uid>.<n>`
    pub fn with_instances(mut self, count: usize) -> Self {
        for n in 1..=count {
            let uid = format!("{}.{}", self.series_uid, n);
            let data = Bytes::from(format!("DICM:{}", uid));
            self.instances.push(MockInstance {
                sop_instance_uid: uid,
                data,
            });
        }
        self
    }
}

/// Snapshot of how the archive was used
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MockStats {
    pub associations_opened: usize,
    pub associations_released: usize,
    pub find_requests: usize,
    pub move_requests: usize,
    pub listeners_started: usize,
    pub listeners_stopped: usize,
    pub listener_running: bool,
}

#[derive(Default)]
struct MockState {
    offline: bool,
    fail_move_after: Option<usize>,
    final_move_status: Option<DimseStatus>,
    active_listener: Option<Arc<dyn StoreHandler>>,
    stats: MockStats,
}

/// In-memory archive; clones share state
#[derive(Clone)]
pub struct MockArchive {
    studies: Arc<Vec<MockStudy>>,
    state: Arc<Mutex<MockState>>,
}

impl MockArchive {
    pub fn new(studies: Vec<MockStudy>) -> Self {
        Self {
            studies: Arc::new(studies),
            state: Arc::new(Mutex::new(MockState::default())),
        }
    }

    /// Refuse every association
    pub fn offline(self) -> Self {
        self.lock().offline = true;
        self
    }

    /// Break the C-MOVE transport after `delivered` objects were sent
    pub fn failing_move_after(self, delivered: usize) -> Self {
        self.lock().fail_move_after = Some(delivered);
        self
    }

    /// Force the final C-MOVE status
    pub fn with_final_move_status(self, status: DimseStatus) -> Self {
        self.lock().final_move_status = Some(status);
        self
    }

    pub fn stats(&self) -> MockStats {
        let state = self.lock();
        let mut stats = state.stats;
        stats.listener_running = state.active_listener.is_some();
        stats
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().expect("mock archive state poisoned")
    }
}

#[async_trait]
impl DimseProtocol for MockArchive {
    async fn associate(&self, node: &RemoteNode) -> Result<Box<dyn Association>> {
        node.validate()?;
        let established = {
            let mut state = self.lock();
            state.stats.associations_opened += 1;
            !state.offline
        };
        Ok(Box::new(MockAssociation {
            archive: self.clone(),
            established,
            released: false,
        }))
    }

    async fn start_listener(
        &self,
        bind_addr: SocketAddr,
        handler: Arc<dyn StoreHandler>,
    ) -> Result<Box<dyn StoreListener>> {
        let mut state = self.lock();
        if state.active_listener.is_some() {
            return Err(DimseError::listener(format!(
                "address {} already in use",
                bind_addr
            )));
        }
        state.active_listener = Some(handler);
        state.stats.listeners_started += 1;
        Ok(Box::new(MockListener {
            archive: self.clone(),
            addr: bind_addr,
            running: true,
        }))
    }
}

struct MockAssociation {
    archive: MockArchive,
    established: bool,
    released: bool,
}

impl MockAssociation {
    fn ensure_usable(&self) -> Result<()> {
        if self.released {
            return Err(DimseError::Released);
        }
        if !self.established {
            return Err(DimseError::AssociationRejected("mock archive offline".into()));
        }
        Ok(())
    }
}

fn matches_key(query_value: Option<&str>, actual: &str) -> bool {
    match query_value {
        None | Some("") | Some("*") => true,
        Some(wanted) => wanted == actual,
    }
}

#[async_trait]
impl Association for MockAssociation {
    fn is_established(&self) -> bool {
        self.established && !self.released
    }

    async fn send_find(
        &mut self,
        query: &FindQuery,
        _model: QueryModel,
    ) -> Result<BoxStream<'static, Result<FindResponse>>> {
        self.ensure_usable()?;
        self.archive.lock().stats.find_requests += 1;

        let study_filter = query.parameter("StudyInstanceUID");
        let mut responses = Vec::new();

        for study in self.archive.studies.iter() {
            if !matches_key(study_filter, &study.study_uid) {
                continue;
            }
            match query.query_level {
                QueryLevel::Study => {
                    let mut identifier = Identifier::new();
                    identifier.insert("StudyInstanceUID".into(), study.study_uid.clone());
                    identifier.insert("PatientID".into(), study.patient_id.clone());
                    if query.parameters.contains_key("ModalitiesInStudy") {
                        if let Some(modalities) = &study.modalities {
                            identifier.insert("ModalitiesInStudy".into(), modalities.clone());
                        }
                    }
                    if let Some(count) = study.declared_instances {
                        identifier.insert("NumberOfStudyRelatedInstances".into(), count.to_string());
                    }
                    responses.push(Ok(FindResponse::pending(identifier)));
                }
                QueryLevel::Series => {
                    for series in &study.series {
                        if !matches_key(query.parameter("Modality"), &series.modality)
                            || !matches_key(query.parameter("SeriesInstanceUID"), &series.series_uid)
                        {
                            continue;
                        }
                        let mut identifier = Identifier::new();
                        identifier.insert("StudyInstanceUID".into(), study.study_uid.clone());
                        identifier.insert("SeriesInstanceUID".into(), series.series_uid.clone());
                        identifier.insert("Modality".into(), series.modality.clone());
                        identifier.insert("SeriesNumber".into(), series.series_number.to_string());
                        if !series.description.is_empty() {
                            identifier.insert("SeriesDescription".into(), series.description.clone());
                        }
                        identifier.insert(
                            "NumberOfSeriesRelatedInstances".into(),
                            series.instances.len().to_string(),
                        );
                        responses.push(Ok(FindResponse::pending(identifier)));
                    }
                }
            }
        }

        responses.push(Ok(FindResponse::last(DimseStatus::Success)));
        Ok(stream::iter(responses).boxed())
    }

    async fn send_move(
        &mut self,
        query: &MoveQuery,
        _model: QueryModel,
    ) -> Result<BoxStream<'static, Result<MoveResponse>>> {
        self.ensure_usable()?;

        let (handler, fail_after, final_status) = {
            let mut state = self.archive.lock();
            state.stats.move_requests += 1;
            (
                state.active_listener.clone(),
                state.fail_move_after,
                state.final_move_status,
            )
        };

        let Some(handler) = handler else {
            // Nobody listening for the destination AE
            return Ok(stream::iter(vec![Ok(MoveResponse::status(DimseStatus::Failure(0xA801)))]).boxed());
        };

        let mut deliveries: Vec<(DatasetMetadata, Bytes)> = Vec::new();
        for study in self.archive.studies.iter() {
            if !matches_key(query.parameter("StudyInstanceUID"), &study.study_uid) {
                continue;
            }
            for series in &study.series {
                if !matches_key(query.parameter("SeriesInstanceUID"), &series.series_uid) {
                    continue;
                }
                for instance in &series.instances {
                    let mut metadata = DatasetMetadata::new();
                    metadata.patient_id = Some(study.patient_id.clone());
                    metadata.study_instance_uid = Some(study.study_uid.clone());
                    metadata.series_instance_uid = Some(series.series_uid.clone());
                    metadata.sop_instance_uid = Some(instance.sop_instance_uid.clone());
                    metadata.size_bytes = Some(instance.data.len() as u64);
                    deliveries.push((metadata, instance.data.clone()));
                }
            }
        }

        let total = deliveries.len() as u32;
        let responses = async_stream::stream! {
            let mut completed = 0u32;
            let mut failed = 0u32;
            for (index, (metadata, data)) in deliveries.into_iter().enumerate() {
                if fail_after == Some(index) {
                    yield Err(DimseError::Network(std::io::Error::new(
                        std::io::ErrorKind::ConnectionReset,
                        "mock archive dropped the association",
                    )));
                    return;
                }
                let dataset = DatasetStream::from_bytes(data).with_metadata(metadata);
                if handler.on_store(dataset).await.is_success() {
                    completed += 1;
                } else {
                    failed += 1;
                }
                yield Ok(MoveResponse {
                    status: DimseStatus::Pending,
                    remaining: total - completed - failed,
                    completed,
                    failed,
                    warning: 0,
                });
            }

            let status = final_status.unwrap_or(if failed > 0 {
                DimseStatus::Warning(0xB000)
            } else {
                DimseStatus::Success
            });
            yield Ok(MoveResponse { status, remaining: 0, completed, failed, warning: 0 });
        };

        Ok(Box::pin(responses))
    }

    async fn release(&mut self) -> Result<()> {
        if !self.released {
            self.released = true;
            self.archive.lock().stats.associations_released += 1;
        }
        Ok(())
    }
}

struct MockListener {
    archive: MockArchive,
    addr: SocketAddr,
    running: bool,
}

#[async_trait]
impl StoreListener for MockListener {
    fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    fn is_running(&self) -> bool {
        self.running
    }

    async fn stop(&mut self) -> Result<()> {
        if self.running {
            self.running = false;
            let mut state = self.archive.lock();
            state.active_listener = None;
            state.stats.listeners_stopped += 1;
        }
        Ok(())
    }
}
