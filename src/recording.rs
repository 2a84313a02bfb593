//! CSV persistence of labeled windows and training datasets.
//!
//! One row per sample: timestamp, raw reading(s), independent component(s),
//! then the label. Recordings for each label are combined into a dataset
//! that the trainer consumes.

use crate::core::classifier::{feature_names, feature_rows};
use crate::core::separation::ProcessedWindow;
use crate::serial::ChannelMode;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

pub const LABEL_COLUMN: &str = "Label";

#[derive(Debug, Error)]
pub enum RecordingError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("{} has no 'Label' column", path.display())]
    MissingLabelColumn { path: PathBuf },
    #[error("{} has columns {found:?}, expected {expected:?}", path.display())]
    HeaderMismatch {
        path: PathBuf,
        expected: Vec<String>,
        found: Vec<String>,
    },
    #[error("{}: row {row} column '{column}' is not a number", path.display())]
    InvalidValue {
        path: PathBuf,
        row: usize,
        column: String,
    },
    #[error("no recordings to combine")]
    NothingToCombine,
}

/// A processed window tagged with the label it was recorded under.
#[derive(Debug, Clone)]
pub struct LabeledWindow {
    pub processed: ProcessedWindow,
    pub label: String,
}

impl LabeledWindow {
    pub fn new(processed: ProcessedWindow, label: impl Into<String>) -> Self {
        Self {
            processed,
            label: label.into(),
        }
    }
}

/// Header row for a channel layout.
pub fn csv_headers(mode: ChannelMode) -> Vec<String> {
    let mut headers = feature_names(mode);
    headers.push(LABEL_COLUMN.to_string());
    headers
}

/// `<data_path>/<prefix><label lowercased>.csv`
pub fn recording_path(data_path: &Path, prefix: &str, label: &str) -> PathBuf {
    data_path.join(format!("{prefix}{}.csv", label.to_lowercase()))
}

/// Write a labeled window, replacing any earlier recording at `path`.
pub fn write_labeled_window(path: &Path, labeled: &LabeledWindow) -> Result<usize, RecordingError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut writer = csv::Writer::from_path(path)?;
    writer.write_record(csv_headers(labeled.processed.window.mode))?;

    let rows = feature_rows(&labeled.processed);
    for row in &rows {
        let mut record: Vec<String> = row.iter().map(|v| v.to_string()).collect();
        record.push(labeled.label.clone());
        writer.write_record(&record)?;
    }
    writer.flush()?;

    info!(path = %path.display(), rows = rows.len(), label = %labeled.label, "recording saved");
    Ok(rows.len())
}

/// Feature rows with their labels, as read from or written to CSV.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Dataset {
    pub feature_names: Vec<String>,
    pub rows: Vec<Vec<f64>>,
    pub labels: Vec<String>,
}

impl Dataset {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Read a recording or combined dataset.
    pub fn read(path: &Path) -> Result<Self, RecordingError> {
        let mut reader = csv::Reader::from_path(path)?;
        let headers: Vec<String> = reader.headers()?.iter().map(str::to_string).collect();
        let label_idx = headers
            .iter()
            .position(|h| h == LABEL_COLUMN)
            .ok_or_else(|| RecordingError::MissingLabelColumn {
                path: path.to_path_buf(),
            })?;

        let feature_names: Vec<String> = headers
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != label_idx)
            .map(|(_, h)| h.clone())
            .collect();

        let mut dataset = Dataset {
            feature_names,
            ..Default::default()
        };

        for (row_idx, record) in reader.records().enumerate() {
            let record = record?;
            let mut row = Vec::with_capacity(headers.len().saturating_sub(1));
            for (col_idx, field) in record.iter().enumerate() {
                if col_idx == label_idx {
                    continue;
                }
                let value = field.trim().parse::<f64>().map_err(|_| RecordingError::InvalidValue {
                    path: path.to_path_buf(),
                    row: row_idx + 1,
                    column: headers[col_idx].clone(),
                })?;
                row.push(value);
            }
            dataset.rows.push(row);
            dataset
                .labels
                .push(record.get(label_idx).unwrap_or_default().trim().to_string());
        }

        Ok(dataset)
    }

    pub fn write(&self, path: &Path) -> Result<(), RecordingError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut writer = csv::Writer::from_path(path)?;
        let mut headers = self.feature_names.clone();
        headers.push(LABEL_COLUMN.to_string());
        writer.write_record(&headers)?;

        for (row, label) in self.rows.iter().zip(&self.labels) {
            let mut record: Vec<String> = row.iter().map(|v| v.to_string()).collect();
            record.push(label.clone());
            writer.write_record(&record)?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Distinct labels in first-seen order.
    pub fn classes(&self) -> Vec<String> {
        let mut classes: Vec<String> = Vec::new();
        for label in &self.labels {
            if !classes.contains(label) {
                classes.push(label.clone());
            }
        }
        classes
    }
}

/// Concatenate recordings into one dataset and write it to `output`.
///
/// All inputs must share the same columns.
pub fn combine_recordings(inputs: &[PathBuf], output: &Path) -> Result<Dataset, RecordingError> {
    let mut combined: Option<Dataset> = None;

    for path in inputs {
        let dataset = Dataset::read(path)?;
        match combined.as_mut() {
            None => combined = Some(dataset),
            Some(acc) => {
                if acc.feature_names != dataset.feature_names {
                    return Err(RecordingError::HeaderMismatch {
                        path: path.clone(),
                        expected: acc.feature_names.clone(),
                        found: dataset.feature_names,
                    });
                }
                acc.rows.extend(dataset.rows);
                acc.labels.extend(dataset.labels);
            }
        }
    }

    let combined = combined.ok_or(RecordingError::NothingToCombine)?;
    combined.write(output)?;
    info!(
        output = %output.display(),
        files = inputs.len(),
        rows = combined.len(),
        "recordings combined"
    );
    Ok(combined)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::windowing::Window;
    use crate::serial::Sample;
    use std::time::Duration;

    fn labeled(mode: ChannelMode, label: &str, n: usize) -> LabeledWindow {
        let samples = (0..n as i32)
            .map(|i| match mode {
                ChannelMode::Single => Sample::Single(500 + i),
                ChannelMode::Dual => Sample::Dual(500 + i, 600 - i),
            })
            .collect();
        let window = Window::from_samples(mode, Duration::from_secs(15), samples);
        let components = (0..mode.count())
            .map(|c| (0..n).map(|i| i as f64 - c as f64).collect())
            .collect();
        LabeledWindow::new(ProcessedWindow { window, components }, label)
    }

    #[test]
    fn test_recording_path_lowercases_label() {
        let path = recording_path(Path::new("/data"), "n", "GO");
        assert_eq!(path, PathBuf::from("/data/ngo.csv"));
    }

    #[test]
    fn test_single_channel_csv_layout() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nyes.csv");
        let rows = write_labeled_window(&path, &labeled(ChannelMode::Single, "YES", 4)).unwrap();
        assert_eq!(rows, 4);

        let content = std::fs::read_to_string(&path).unwrap();
        let mut lines = content.lines();
        assert_eq!(
            lines.next(),
            Some("Timestamp,Raw_EMG,Independent_Component,Label")
        );
        assert_eq!(lines.next(), Some("0,500,0,YES"));
        assert_eq!(lines.last(), Some("15,503,3,YES"));
    }

    #[test]
    fn test_dual_channel_round_trip_through_dataset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nno.csv");
        write_labeled_window(&path, &labeled(ChannelMode::Dual, "NO", 3)).unwrap();

        let dataset = Dataset::read(&path).unwrap();
        assert_eq!(dataset.feature_names, feature_names(ChannelMode::Dual));
        assert_eq!(dataset.rows[1], vec![7.5, 501.0, 599.0, 1.0, 0.0]);
        assert_eq!(dataset.labels, vec!["NO"; 3]);
    }

    #[test]
    fn test_combine_concatenates_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let yes = dir.path().join("nyes.csv");
        let no = dir.path().join("nno.csv");
        write_labeled_window(&yes, &labeled(ChannelMode::Single, "YES", 3)).unwrap();
        write_labeled_window(&no, &labeled(ChannelMode::Single, "NO", 2)).unwrap();

        let output = dir.path().join("ndata.csv");
        let combined = combine_recordings(&[yes, no], &output).unwrap();
        assert_eq!(combined.len(), 5);
        assert_eq!(combined.classes(), vec!["YES", "NO"]);
        assert_eq!(Dataset::read(&output).unwrap(), combined);
    }

    #[test]
    fn test_combine_rejects_mixed_layouts() {
        let dir = tempfile::tempdir().unwrap();
        let single = dir.path().join("na.csv");
        let dual = dir.path().join("nb.csv");
        write_labeled_window(&single, &labeled(ChannelMode::Single, "A", 2)).unwrap();
        write_labeled_window(&dual, &labeled(ChannelMode::Dual, "B", 2)).unwrap();

        let result = combine_recordings(&[single, dual], &dir.path().join("out.csv"));
        assert!(matches!(result, Err(RecordingError::HeaderMismatch { .. })));
        assert!(matches!(
            combine_recordings(&[], &dir.path().join("out.csv")),
            Err(RecordingError::NothingToCombine)
        ));
    }

    #[test]
    fn test_non_numeric_field_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.csv");
        std::fs::write(&path, "Timestamp,Raw_EMG,Label\n0,abc,YES\n").unwrap();
        assert!(matches!(
            Dataset::read(&path),
            Err(RecordingError::InvalidValue { row: 1, .. })
        ));
    }
}
