//! On-disk layout for retrieved instances
//!
//! Received objects land at `<root>/<patient>/<study>/<series>/<instance>.dcm`. Every
//! segment is sanitized so that identifiers coming off the wire can never escape the
//! output root.

use std::path::{Path, PathBuf};

use dimse::DatasetStream;
use thiserror::Error;
use walkdir::WalkDir;

/// Error type for storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("IO error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Placeholder for a path segment that sanitizes to nothing
const UNKNOWN_SEGMENT: &str = "UNKNOWN";

/// Suffix matched case-sensitively, as downstream `*.dcm` globs do
const DICOM_SUFFIX: &str = ".dcm";

/// Outcome of one extension repair pass
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RepairReport {
    pub renamed: usize,
    pub failed: usize,
}

/// Writes received objects under a fixed output root
#[derive(Debug, Clone)]
pub struct FileSink {
    root: PathBuf,
}

impl FileSink {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        // Not canonicalized; the caller's spelling of the root is kept in paths and logs
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create the output root. Idempotent.
    pub fn ensure_root(&self) -> StorageResult<()> {
        std::fs::create_dir_all(&self.root).map_err(|source| StorageError::Io {
            path: self.root.clone(),
            source,
        })
    }

    /// Canonical destination of one instance
    pub fn instance_path(
        &self,
        patient_id: &str,
        study_uid: &str,
        series_uid: &str,
        instance_uid: &str,
    ) -> PathBuf {
        self.root
            .join(sanitize_patient_id(patient_id))
            .join(sanitize_uid(study_uid))
            .join(sanitize_uid(series_uid))
            .join(format!("{}{}", sanitize_uid(instance_uid), DICOM_SUFFIX))
    }

    /// Persist one received object at its canonical path and return that path.
    /// Missing identifiers file the object under `UNKNOWN`.
    pub async fn write_instance(&self, dataset: &DatasetStream) -> StorageResult<PathBuf> {
        let metadata = dataset.metadata();
        let target = self.instance_path(
            metadata.patient_id.as_deref().unwrap_or_default(),
            metadata.study_instance_uid.as_deref().unwrap_or_default(),
            metadata.series_instance_uid.as_deref().unwrap_or_default(),
            metadata.sop_instance_uid.as_deref().unwrap_or_default(),
        );
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| StorageError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }

        match dataset {
            DatasetStream::Memory { data, .. } => tokio::fs::write(&target, data).await,
            // Staged files may sit on another filesystem, so copy; the stream removes its own file
            DatasetStream::File { path, .. } => tokio::fs::copy(path, &target).await.map(|_| ()),
        }
        .map_err(|source| StorageError::Io {
            path: target.clone(),
            source,
        })?;

        tracing::debug!("Stored {}", target.display());
        Ok(target)
    }

    /// Append `.dcm` to every regular file under the root that lacks it.
    ///
    /// Individual rename failures are counted and logged; a second pass over the same tree
    /// renames nothing.
    pub fn repair_extensions(&self) -> RepairReport {
        let mut report = RepairReport::default();

        // Collected up front so renamed entries are not revisited
        let candidates: Vec<PathBuf> = WalkDir::new(&self.root)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file() && !has_dicom_extension(e.path()))
            .map(|e| e.into_path())
            .collect();

        for from in &candidates {
            let mut name = from.as_os_str().to_os_string();
            name.push(DICOM_SUFFIX);
            let to = PathBuf::from(name);

            if to.exists() {
                tracing::warn!(
                    "Not renaming {}: {} already exists",
                    from.display(),
                    to.display()
                );
                report.failed += 1;
                continue;
            }

            match std::fs::rename(from, &to) {
                Ok(()) => report.renamed += 1,
                Err(e) => {
                    tracing::warn!("Failed to rename {}: {}", from.display(), e);
                    report.failed += 1;
                }
            }
        }

        if report.renamed > 0 {
            tracing::debug!("Added .dcm extension to {} file(s)", report.renamed);
        }
        report
    }

    /// Recursive count of `.dcm` files under the root; zero when the root is absent
    pub fn count_dicom_files(&self) -> usize {
        WalkDir::new(&self.root)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file() && has_dicom_extension(e.path()))
            .count()
    }
}

fn has_dicom_extension(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(|name| name.ends_with(DICOM_SUFFIX))
        .unwrap_or(false)
}

/// Keep ASCII alphanumerics, `-` and `_`
pub fn sanitize_patient_id(patient_id: &str) -> String {
    let cleaned: String = patient_id
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .collect();
    if cleaned.is_empty() {
        UNKNOWN_SEGMENT.to_string()
    } else {
        cleaned
    }
}

/// Keep the UID alphabet plus `-` and `_`. A result made only of dots is rejected.
pub fn sanitize_uid(uid: &str) -> String {
    let cleaned: String = uid
        .trim()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
        .collect();
    if cleaned.chars().all(|c| c == '.') {
        UNKNOWN_SEGMENT.to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use dimse::DatasetMetadata;
    use tempfile::TempDir;

    fn dataset(patient: &str, instance: &str) -> DatasetStream {
        let mut metadata = DatasetMetadata::new();
        metadata.patient_id = Some(patient.to_string());
        metadata.study_instance_uid = Some("1.2.3".to_string());
        metadata.series_instance_uid = Some("1.2.3.4".to_string());
        metadata.sop_instance_uid = Some(instance.to_string());
        DatasetStream::from_bytes(Bytes::from_static(b"DICM")).with_metadata(metadata)
    }

    #[test]
    fn test_sanitize_patient_id() {
        assert_eq!(sanitize_patient_id("AB/12*ID"), "AB12ID");
        assert_eq!(sanitize_patient_id("pat-01_x"), "pat-01_x");
        assert_eq!(sanitize_patient_id("../.."), "UNKNOWN");
        assert_eq!(sanitize_patient_id(""), "UNKNOWN");
    }

    #[test]
    fn test_sanitize_uid_keeps_dots_but_not_traversal() {
        assert_eq!(sanitize_uid("1.2.840.10008"), "1.2.840.10008");
        assert_eq!(sanitize_uid("1.2/../3"), "1.2..3");
        assert_eq!(sanitize_uid(".."), "UNKNOWN");
        assert_eq!(sanitize_uid(" 1.2 "), "1.2");
    }

    #[test]
    fn test_instance_path_layout() {
        let sink = FileSink::new("/out");
        let path = sink.instance_path("AB/12*ID", "1.2", "1.2.3", "1.2.3.4");
        assert_eq!(path, PathBuf::from("/out/AB12ID/1.2/1.2.3/1.2.3.4.dcm"));
    }

    #[tokio::test]
    async fn test_write_instance_creates_directories() {
        let temp_dir = TempDir::new().unwrap();
        let sink = FileSink::new(temp_dir.path());

        let written = sink.write_instance(&dataset("P*1", "1.2.3.4.5")).await.unwrap();
        assert_eq!(written, temp_dir.path().join("P1/1.2.3/1.2.3.4/1.2.3.4.5.dcm"));
        assert_eq!(std::fs::read(&written).unwrap(), b"DICM");

        // Writing the same instance again overwrites in place
        sink.write_instance(&dataset("P*1", "1.2.3.4.5")).await.unwrap();
        assert_eq!(sink.count_dicom_files(), 1);
    }

    #[tokio::test]
    async fn test_write_instance_without_uids_goes_to_unknown() {
        let temp_dir = TempDir::new().unwrap();
        let sink = FileSink::new(temp_dir.path());
        let mut data = dataset("P1", "x");
        data.metadata_mut().sop_instance_uid = None;
        data.metadata_mut().series_instance_uid = None;

        let written = sink.write_instance(&data).await.unwrap();
        assert_eq!(written, temp_dir.path().join("P1/1.2.3/UNKNOWN/UNKNOWN.dcm"));
    }

    #[test]
    fn test_repair_extensions_is_idempotent() {
        let temp_dir = TempDir::new().unwrap();
        let nested = temp_dir.path().join("a/b");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(nested.join("1.2.840"), b"x").unwrap();
        std::fs::write(nested.join("already.dcm"), b"x").unwrap();
        std::fs::write(nested.join("upper.DCM"), b"x").unwrap();

        let sink = FileSink::new(temp_dir.path());
        // Only the upper-case file is invisible to `.dcm` counting before the pass
        assert_eq!(sink.count_dicom_files(), 1);

        let first = sink.repair_extensions();
        assert_eq!(first, RepairReport { renamed: 2, failed: 0 });
        assert!(nested.join("1.2.840.dcm").exists());
        assert!(!nested.join("1.2.840").exists());
        assert!(nested.join("upper.DCM.dcm").exists());

        let second = sink.repair_extensions();
        assert_eq!(second, RepairReport::default());
        assert_eq!(sink.count_dicom_files(), 3);
    }

    #[test]
    fn test_repair_skips_existing_target() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(temp_dir.path().join("1.2"), b"new").unwrap();
        std::fs::write(temp_dir.path().join("1.2.dcm"), b"old").unwrap();

        let report = FileSink::new(temp_dir.path()).repair_extensions();
        assert_eq!(report.failed, 1);
        assert_eq!(std::fs::read(temp_dir.path().join("1.2.dcm")).unwrap(), b"old");
    }

    #[test]
    fn test_missing_root_counts_zero() {
        let sink = FileSink::new("/nonexistent/pacs_retriever/out");
        assert_eq!(sink.count_dicom_files(), 0);
        assert_eq!(sink.repair_extensions(), RepairReport::default());
    }
}
