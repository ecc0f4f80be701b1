use std::fmt;

use tracing::{info, warn};

use crate::error::FailureKind;

/// Count limits for one run. `None` means unlimited.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Limits {
    pub max_studies: Option<usize>,
    pub max_images: Option<u64>,
}

/// Why the run stopped starting new studies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Every matching study was processed
    Completed,
    /// More studies matched than `max_studies`
    StudyLimit,
    /// The image counter reached `max_images` with studies left
    ImageLimit,
    /// Interrupted; no study was started after the interrupt
    Cancelled,
    /// The study find produced no study of the target modality
    NothingFound,
}

/// A series that could not be fetched
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeriesFailure {
    pub study_uid: String,
    pub series_uid: String,
    pub kind: FailureKind,
    pub message: String,
}

/// What processing one study produced
#[derive(Debug, Clone, Default)]
pub struct StudyOutcome {
    pub study_uid: String,
    pub series_found: usize,
    pub images_stored: u64,
    pub objects_failed: u64,
    pub failures: Vec<SeriesFailure>,
}

impl StudyOutcome {
    pub fn new(study_uid: impl Into<String>) -> Self {
        Self {
            study_uid: study_uid.into(),
            ..Default::default()
        }
    }

    /// A study counts as retrieved when none of its series failed
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Accumulated result of one run
#[derive(Debug, Clone)]
pub struct RunResult {
    pub studies_seen: usize,
    pub studies_matched: usize,
    pub studies_processed: usize,
    pub studies_retrieved: usize,
    pub images_stored: u64,
    /// Objects the remote or the local sink reported as not stored
    pub objects_failed: u64,
    pub series_failures: Vec<SeriesFailure>,
    pub stop_reason: StopReason,
    pub dry_run: bool,
}

impl RunResult {
    pub fn new(dry_run: bool) -> Self {
        Self {
            studies_seen: 0,
            studies_matched: 0,
            studies_processed: 0,
            studies_retrieved: 0,
            images_stored: 0,
            objects_failed: 0,
            series_failures: Vec::new(),
            stop_reason: StopReason::Completed,
            dry_run,
        }
    }

    /// Fold one study's outcome into the totals
    pub fn merge(&mut self, outcome: StudyOutcome) {
        self.studies_processed += 1;
        if outcome.is_clean() {
            self.studies_retrieved += 1;
        }
        self.images_stored += outcome.images_stored;
        self.objects_failed += outcome.objects_failed;
        self.series_failures.extend(outcome.failures);
    }

    pub fn image_limit_reached(&self, limits: &Limits) -> bool {
        limits
            .max_images
            .map(|max| self.images_stored >= max)
            .unwrap_or(false)
    }

    /// Log the end-of-run summary. `dicom_files` is the `.dcm` count under the output root.
    pub fn log_summary(&self, dicom_files: Option<usize>) {
        info!("{}", "=".repeat(60));
        if self.dry_run {
            info!("[DRY RUN] Summary:");
            info!("  Studies found: {} of {} total", self.studies_matched, self.studies_seen);
            info!("  Studies that would be retrieved: {}", self.studies_processed);
            info!("  Estimated images: {}", self.images_stored);
        } else {
            info!("Retrieval complete:");
            info!("  Studies found: {} of {} total", self.studies_matched, self.studies_seen);
            info!(
                "  Studies retrieved: {} of {} processed",
                self.studies_retrieved, self.studies_processed
            );
            info!("  Images retrieved: {}", self.images_stored);
            if self.objects_failed > 0 {
                warn!("  Objects failed: {}", self.objects_failed);
            }
            if let Some(count) = dicom_files {
                info!("  DICOM files in output directory: {}", count);
            }
        }
        info!("  Stopped: {}", self.stop_reason);
        info!("{}", "=".repeat(60));

        for failure in &self.series_failures {
            warn!(
                "  Failed series {} (study {}) [{}]: {}",
                failure.series_uid, failure.study_uid, failure.kind, failure.message
            );
        }
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            StopReason::Completed => "all studies processed",
            StopReason::StudyLimit => "study limit reached",
            StopReason::ImageLimit => "image limit reached",
            StopReason::Cancelled => "interrupted",
            StopReason::NothingFound => "no matching studies",
        };
        f.write_str(text)
    }
}
