use chrono::{Duration, Local, NaiveDate};
use dimse::{FindQuery, MoveQuery, QueryLevel};

use crate::records::SeriesRecord;

/// Lower bound used when only an end date is given
pub const OPEN_START: &str = "19700101";
/// Upper bound used when only a start date is given
pub const OPEN_END: &str = "29991231";
/// Width of the default window when no date is given
pub const DEFAULT_WINDOW_DAYS: i64 = 30;

const DATE_FORMAT: &str = "%Y%m%d";

/// Resolve the `StudyDate` matching value against today's local date
pub fn resolve_date_range(single: Option<&str>, from: Option<&str>, to: Option<&str>) -> String {
    resolve_date_range_at(Local::now().date_naive(), single, from, to)
}

/// Same as [`resolve_date_range`] with an explicit "today"
pub fn resolve_date_range_at(
    today: NaiveDate,
    single: Option<&str>,
    from: Option<&str>,
    to: Option<&str>,
) -> String {
    let from = from.filter(|d| !d.is_empty());
    let to = to.filter(|d| !d.is_empty());

    if from.is_some() || to.is_some() {
        return format!(
            "{}-{}",
            from.unwrap_or(OPEN_START),
            to.unwrap_or(OPEN_END)
        );
    }

    if let Some(date) = single.filter(|d| !d.is_empty()) {
        return date.to_string();
    }

    let start = today - Duration::days(DEFAULT_WINDOW_DAYS);
    format!("{}-{}", start.format(DATE_FORMAT), today.format(DATE_FORMAT))
}

/// Builds every query the retriever sends for one target modality
#[derive(Debug, Clone)]
pub struct QueryPlanner {
    modality: String,
    destination_aet: String,
}

impl QueryPlanner {
    /// `destination_aet` is where C-MOVE sub-operations are sent, i.e. our own AE title
    pub fn new(modality: impl Into<String>, destination_aet: impl Into<String>) -> Self {
        Self {
            modality: modality.into(),
            destination_aet: destination_aet.into(),
        }
    }

    pub fn modality(&self) -> &str {
        &self.modality
    }

    /// STUDY level find over a date range
    pub fn build_study_query(&self, date_range: &str) -> FindQuery {
        FindQuery::study(None)
            .with_parameter("StudyDate", date_range)
            .with_return_key("PatientID")
            .with_return_key("ModalitiesInStudy")
            .with_return_key("NumberOfStudyRelatedInstances")
    }

    /// SERIES level find within one study, restricted to the target modality
    pub fn build_series_query(&self, study_uid: &str) -> FindQuery {
        FindQuery::series(study_uid)
            .with_parameter("Modality", self.modality.as_str())
            .with_return_key("SeriesInstanceUID")
            .with_return_key("SeriesDescription")
            .with_return_key("SeriesNumber")
            .with_return_key("NumberOfSeriesRelatedInstances")
    }

    /// SERIES level retrieve identifier for one series
    pub fn build_retrieve_query(&self, series: &SeriesRecord) -> MoveQuery {
        MoveQuery::new(QueryLevel::Series, self.destination_aet.as_str())
            .with_parameter("StudyInstanceUID", series.study_uid.as_str())
            .with_parameter("SeriesInstanceUID", series.series_uid.as_str())
    }
}
