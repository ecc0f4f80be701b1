//! Typed views over C-FIND identifiers

use dimse::Identifier;

/// One study as reported by the archive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StudyRecord {
    pub study_uid: String,
    pub patient_id: String,
    pub modalities_in_study: Option<String>,
    pub declared_instance_count: Option<u64>,
}

/// One series within a study
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeriesRecord {
    pub study_uid: String,
    pub series_uid: String,
    pub modality: String,
    pub description: String,
    pub series_number: Option<i32>,
    pub declared_instance_count: Option<u64>,
}

impl StudyRecord {
    /// `None` when the identifier carries no `StudyInstanceUID`
    pub fn from_identifier(identifier: &Identifier) -> Option<Self> {
        let study_uid = non_empty(identifier, "StudyInstanceUID")?;
        Some(Self {
            study_uid,
            patient_id: text(identifier, "PatientID"),
            modalities_in_study: non_empty(identifier, "ModalitiesInStudy"),
            declared_instance_count: number(identifier, "NumberOfStudyRelatedInstances"),
        })
    }

    /// Substring match against `ModalitiesInStudy`; a study without the field never matches
    pub fn has_modality(&self, code: &str) -> bool {
        self.modalities_in_study
            .as_deref()
            .map(|modalities| modalities.contains(code))
            .unwrap_or(false)
    }
}

impl SeriesRecord {
    /// `None` when the identifier carries no `SeriesInstanceUID`. The study UID is taken
    /// from the query when the archive does not echo it back.
    pub fn from_identifier(study_uid: &str, identifier: &Identifier) -> Option<Self> {
        let series_uid = non_empty(identifier, "SeriesInstanceUID")?;
        Some(Self {
            study_uid: non_empty(identifier, "StudyInstanceUID").unwrap_or_else(|| study_uid.to_string()),
            series_uid,
            modality: text(identifier, "Modality"),
            description: text(identifier, "SeriesDescription"),
            series_number: number(identifier, "SeriesNumber"),
            declared_instance_count: number(identifier, "NumberOfSeriesRelatedInstances"),
        })
    }
}

fn text(identifier: &Identifier, key: &str) -> String {
    identifier
        .get(key)
        .map(|v| v.trim().to_string())
        .unwrap_or_default()
}

fn non_empty(identifier: &Identifier, key: &str) -> Option<String> {
    Some(text(identifier, key)).filter(|v| !v.is_empty())
}

fn number<T: std::str::FromStr>(identifier: &Identifier, key: &str) -> Option<T> {
    identifier.get(key).and_then(|v| v.trim().parse().ok())
}
