//! Drives one retrieval run: find studies, filter them to the target modality, then
//! resolve and fetch each study's series one at a time.
//!
//! Every association is opened and released by the call that needs it. Limits and
//! cancellation are only checked before a study starts; a study in progress always
//! runs to the end of its last series.

use std::sync::Arc;

use dimse::{Association, DimseProtocol, FindQuery, Identifier, QueryModel, RemoteNode};
use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::planner::QueryPlanner;
use crate::records::{SeriesRecord, StudyRecord};
use crate::retrieval::RetrievalStrategy;

mod result;

pub use result::{Limits, RunResult, SeriesFailure, StopReason, StudyOutcome};

pub struct Orchestrator {
    protocol: Arc<dyn DimseProtocol>,
    remote: RemoteNode,
    model: QueryModel,
    planner: QueryPlanner,
    strategy: Box<dyn RetrievalStrategy>,
    date_range: String,
    dry_run: bool,
    cancel: CancellationToken,
}

impl Orchestrator {
    pub fn new(
        protocol: Arc<dyn DimseProtocol>,
        remote: RemoteNode,
        planner: QueryPlanner,
        strategy: Box<dyn RetrievalStrategy>,
        date_range: impl Into<String>,
    ) -> Self {
        Self {
            protocol,
            remote,
            model: QueryModel::default(),
            planner,
            strategy,
            date_range: date_range.into(),
            dry_run: false,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_model(mut self, model: QueryModel) -> Self {
        self.model = model;
        self
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn date_range(&self) -> &str {
        &self.date_range
    }

    /// Studies in the date range, in the order the archive reported them.
    ///
    /// `limit` caps the number of responses collected, before any filtering.
    pub async fn find_studies(&self, limit: Option<usize>, date_range: &str) -> Vec<StudyRecord> {
        info!(
            "Searching for studies on {} (date: {})",
            self.remote, date_range
        );
        let query = self.planner.build_study_query(date_range);
        let studies: Vec<StudyRecord> = self
            .run_find(&query, limit)
            .await
            .iter()
            .filter_map(|identifier| {
                let study = StudyRecord::from_identifier(identifier);
                if study.is_none() {
                    debug!("Discarding study response without StudyInstanceUID");
                }
                study
            })
            .collect();

        info!("Retrieved {} studies for date range {}", studies.len(), date_range);
        studies
    }

    /// Series of the target modality within one study
    pub async fn find_series(&self, study_uid: &str, limit: Option<usize>) -> Vec<SeriesRecord> {
        let query = self.planner.build_series_query(study_uid);
        let series: Vec<SeriesRecord> = self
            .run_find(&query, limit)
            .await
            .iter()
            .filter_map(|identifier| SeriesRecord::from_identifier(study_uid, identifier))
            .collect();

        info!(
            "Found {} {} series in study {}",
            series.len(),
            self.planner.modality(),
            study_uid
        );
        series
    }

    /// Keep studies whose `ModalitiesInStudy` mentions the target modality
    pub fn filter_studies(&self, studies: Vec<StudyRecord>) -> Vec<StudyRecord> {
        let modality = self.planner.modality();
        studies
            .into_iter()
            .filter(|study| {
                let keep = study.has_modality(modality);
                if keep {
                    info!(
                        "Found {} study: {} - Modalities: {}",
                        modality,
                        study.study_uid,
                        study.modalities_in_study.as_deref().unwrap_or_default()
                    );
                } else {
                    debug!(
                        "Skipping study {} (modalities: {:?})",
                        study.study_uid, study.modalities_in_study
                    );
                }
                keep
            })
            .collect()
    }

    /// Run the whole workflow under `limits`
    pub async fn retrieve_images(&self, limits: Limits) -> RunResult {
        let mut result = RunResult::new(self.dry_run);

        let studies = self.find_studies(None, &self.date_range).await;
        result.studies_seen = studies.len();

        let mut matched = self.filter_studies(studies);
        result.studies_matched = matched.len();
        info!(
            "Returning {} {} studies (out of {} total)",
            matched.len(),
            self.planner.modality(),
            result.studies_seen
        );

        if matched.is_empty() {
            warn!(
                "No {} studies found in date range {}",
                self.planner.modality(),
                self.date_range
            );
            result.stop_reason = StopReason::NothingFound;
            return result;
        }

        let mut truncated = false;
        if let Some(max) = limits.max_studies {
            if matched.len() > max {
                info!("Reached study limit of {}", max);
                matched.truncate(max);
                truncated = true;
            }
        }

        let estimated: u64 = matched
            .iter()
            .map(|s| s.declared_instance_count.unwrap_or(0))
            .sum();
        info!(
            "Estimated total images: {} across {} studies",
            estimated,
            matched.len()
        );

        if self.dry_run {
            info!("[DRY RUN] No files will be written and no retrievals issued");
        } else {
            warn!("{}", "!".repeat(60));
            warn!("PRODUCTION MODE - images will be retrieved");
            warn!("  Target: {}", self.remote);
            warn!("  Studies to retrieve: {}", matched.len());
            warn!("  Strategy: {}", self.strategy.name());
            warn!("{}", "!".repeat(60));
        }

        let total = matched.len();
        for (index, study) in matched.iter().enumerate() {
            if self.cancel.is_cancelled() {
                warn!("Interrupted, not starting study {}/{}", index + 1, total);
                result.stop_reason = StopReason::Cancelled;
                return result;
            }
            if result.image_limit_reached(&limits) {
                info!(
                    "Reached image limit ({} images), stopping before study {}/{}",
                    result.images_stored,
                    index + 1,
                    total
                );
                result.stop_reason = StopReason::ImageLimit;
                return result;
            }

            info!(
                "Processing study {}/{}: {} (patient {})",
                index + 1,
                total,
                study.study_uid,
                study.patient_id
            );
            let outcome = self.process_study(study).await;
            result.merge(outcome);
        }

        // An interrupt during the last study still counts
        result.stop_reason = if self.cancel.is_cancelled() {
            warn!("Interrupted during the last study");
            StopReason::Cancelled
        } else if truncated {
            StopReason::StudyLimit
        } else {
            StopReason::Completed
        };
        result
    }

    async fn process_study(&self, study: &StudyRecord) -> StudyOutcome {
        let mut outcome = StudyOutcome::new(study.study_uid.as_str());

        if self.dry_run {
            let estimate = study.declared_instance_count.unwrap_or(0);
            info!(
                "[DRY RUN] Would retrieve study {} (~{} images)",
                study.study_uid, estimate
            );
            outcome.images_stored = estimate;
            return outcome;
        }

        let series = self.find_series(&study.study_uid, None).await;
        outcome.series_found = series.len();
        if series.is_empty() {
            warn!(
                "No {} series found in study {}",
                self.planner.modality(),
                study.study_uid
            );
            return outcome;
        }

        for record in &series {
            info!(
                "Retrieving {} series {} ({})",
                record.modality, record.series_uid, record.description
            );
            let query = self.planner.build_retrieve_query(record);
            let fetched = self.strategy.retrieve(&query).await;
            outcome.images_stored += fetched.images_stored;
            outcome.objects_failed += fetched.failed_objects;

            if let Some(e) = fetched.error {
                error!("Series {} failed: {}", record.series_uid, e);
                outcome.failures.push(SeriesFailure {
                    study_uid: study.study_uid.clone(),
                    series_uid: record.series_uid.clone(),
                    kind: e.kind(),
                    message: e.to_string(),
                });
            }
        }

        info!(
            "Study {} done: {} images from {} series",
            study.study_uid, outcome.images_stored, outcome.series_found
        );
        outcome
    }

    /// One association, one find, pending identifiers in arrival order.
    /// Any failure yields what was collected so far.
    async fn run_find(&self, query: &FindQuery, limit: Option<usize>) -> Vec<Identifier> {
        let mut association = match self.protocol.associate(&self.remote).await {
            Ok(association) => association,
            Err(e) => {
                error!("Failed to associate with {}: {}", self.remote, e);
                return Vec::new();
            }
        };

        let identifiers = if association.is_established() {
            collect_find(association.as_mut(), query, self.model, limit).await
        } else {
            error!("Failed to associate with PACS {}", self.remote);
            Vec::new()
        };

        if let Err(e) = association.release().await {
            warn!("Failed to release association with {}: {}", self.remote, e);
        }
        identifiers
    }
}

async fn collect_find(
    association: &mut dyn Association,
    query: &FindQuery,
    model: QueryModel,
    limit: Option<usize>,
) -> Vec<Identifier> {
    let mut identifiers = Vec::new();

    let mut responses = match association.send_find(query, model).await {
        Ok(responses) => responses,
        Err(e) => {
            error!("Error during C-FIND: {}", e);
            return identifiers;
        }
    };

    loop {
        if limit.map(|max| identifiers.len() >= max).unwrap_or(false) {
            debug!("C-FIND limit of {} responses reached", identifiers.len());
            break;
        }
        let Some(response) = responses.next().await else {
            break;
        };

        match response {
            Ok(response) if response.status.is_pending() => {
                if let Some(identifier) = response.identifier {
                    identifiers.push(identifier);
                    if identifiers.len() % 100 == 0 {
                        info!("Retrieved {} results so far...", identifiers.len());
                    }
                }
            }
            Ok(response) => {
                if !response.status.is_success() {
                    warn!("C-FIND finished with {}", response.status);
                }
                break;
            }
            Err(e) => {
                error!("Error during C-FIND: {}", e);
                break;
            }
        }
    }

    identifiers
}
