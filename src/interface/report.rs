//! Result files: CSV tables for phonon data, JSON for everything else.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::analysis::thermal::ThermalPoint;
use crate::error::{CalcError, Result};
use crate::solvers::phonon::{BandStructure, ForceConstants, PhononDos, PhononResult};
use crate::solvers::ItemSummary;

fn io_error(path: &Path, source: std::io::Error) -> CalcError {
    CalcError::Io {
        path: path.display().to_string(),
        source,
    }
}

fn csv_error(path: &Path, e: csv::Error) -> CalcError {
    io_error(path, e.into())
}

pub fn ensure_dir(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir).map_err(|e| io_error(dir, e))
}

/// File-name-safe version of a structure label.
pub fn file_stem(label: &str) -> String {
    let stem: String = label
        .trim()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '.' { c } else { '_' })
        .collect();
    if stem.is_empty() {
        "structure".to_string()
    } else {
        stem
    }
}

pub fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| CalcError::Configuration(format!("cannot serialize {}: {}", path.display(), e)))?;
    fs::write(path, json).map_err(|e| io_error(path, e))
}

pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = fs::read_to_string(path).map_err(|e| io_error(path, e))?;
    serde_json::from_str(&content).map_err(|e| CalcError::parse("JSON", &path.display().to_string(), e.to_string()))
}

/// One row per q-point: path distance, fractional q, label, then every mode (THz).
pub fn write_band_csv(path: &Path, bands: &BandStructure) -> Result<()> {
    let mut wtr = csv::Writer::from_path(path).map_err(|e| csv_error(path, e))?;
    let n_modes = bands.frequencies.first().map_or(0, Vec::len);
    let mut header = vec!["distance".to_string(), "qx".into(), "qy".into(), "qz".into(), "label".into()];
    header.extend((1..=n_modes).map(|m| format!("mode_{}", m)));
    wtr.write_record(&header).map_err(|e| csv_error(path, e))?;

    // Labels sharing a distance sit at a branch break and print as "X|M".
    let mut merged: Vec<(f64, String)> = Vec::new();
    for (d, label) in &bands.labels {
        match merged.last_mut() {
            Some((last, text)) if (*last - d).abs() < 1e-9 => {
                text.push('|');
                text.push_str(label);
            }
            _ => merged.push((*d, label.clone())),
        }
    }
    let mut pending = merged.into_iter().peekable();

    for ((q, d), freqs) in bands.qpoints.iter().zip(&bands.distances).zip(&bands.frequencies) {
        let label = match pending.peek() {
            Some((ld, _)) if (ld - d).abs() < 1e-9 => pending.next().map(|(_, l)| l).unwrap_or_default(),
            _ => String::new(),
        };
        let mut record = vec![
            format!("{:.6}", d),
            format!("{:.6}", q.x),
            format!("{:.6}", q.y),
            format!("{:.6}", q.z),
            label,
        ];
        record.extend(freqs.iter().map(|f| format!("{:.6}", f)));
        wtr.write_record(&record).map_err(|e| csv_error(path, e))?;
    }
    wtr.flush().map_err(|e| io_error(path, e))
}

pub fn write_dos_csv(path: &Path, dos: &PhononDos) -> Result<()> {
    let mut wtr = csv::Writer::from_path(path).map_err(|e| csv_error(path, e))?;
    wtr.write_record(["frequency_thz", "dos"]).map_err(|e| csv_error(path, e))?;
    for (f, g) in dos.frequency_points.iter().zip(&dos.dos) {
        wtr.write_record(&[format!("{:.6}", f), format!("{:.8}", g)])
            .map_err(|e| csv_error(path, e))?;
    }
    wtr.flush().map_err(|e| io_error(path, e))
}

/// Columns follow the `ThermalPoint` fields.
pub fn write_thermal_csv(path: &Path, points: &[ThermalPoint]) -> Result<()> {
    let mut wtr = csv::Writer::from_path(path).map_err(|e| csv_error(path, e))?;
    for point in points {
        wtr.serialize(point).map_err(|e| csv_error(path, e))?;
    }
    wtr.flush().map_err(|e| io_error(path, e))
}

pub fn write_force_constants(path: &Path, fc: &ForceConstants) -> Result<()> {
    write_json(path, fc)
}

/// Loads force constants written by `write_force_constants` and checks
/// that the block layout matches the stored structures.
pub fn read_force_constants(path: &Path) -> Result<ForceConstants> {
    let fc: ForceConstants = read_json(path)?;
    fc.validate()?;
    Ok(fc)
}

/// Writes `<stem>.band.csv`, `<stem>.dos.csv`, `<stem>.thermal.csv` and
/// `<stem>.force_constants.json` into `dir`.
pub fn write_phonon_artifacts(dir: &Path, stem: &str, result: &PhononResult) -> Result<Vec<PathBuf>> {
    ensure_dir(dir)?;
    let path = |suffix: &str| dir.join(format!("{}.{}", stem, suffix));
    let files = vec![path("band.csv"), path("dos.csv"), path("thermal.csv"), path("force_constants.json")];
    write_band_csv(&files[0], &result.band_structure)?;
    write_dos_csv(&files[1], &result.dos)?;
    write_thermal_csv(&files[2], &result.thermal)?;
    write_force_constants(&files[3], &result.force_constants)?;
    Ok(files)
}

/// Record of one batch run, written as `summary.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub version: String,
    pub calculation: String,
    pub potential: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub succeeded: usize,
    pub failed: usize,
    pub items: Vec<ItemSummary>,
}

impl RunSummary {
    pub fn new(calculation: &str, potential: &str, started_at: DateTime<Utc>, items: Vec<ItemSummary>) -> Self {
        let succeeded = items.iter().filter(|i| i.success).count();
        Self {
            run_id: Uuid::new_v4(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            calculation: calculation.to_string(),
            potential: potential.to_string(),
            started_at,
            finished_at: Utc::now(),
            succeeded,
            failed: items.len() - succeeded,
            items,
        }
    }

    pub fn write(&self, dir: &Path) -> Result<PathBuf> {
        ensure_dir(dir)?;
        let path = dir.join("summary.json");
        write_json(&path, self)?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Vector3;

    #[test]
    fn labels_are_sanitized_for_file_names() {
        assert_eq!(file_stem("Ar fcc (100)"), "Ar_fcc__100_");
        assert_eq!(file_stem("  "), "structure");
        assert_eq!(file_stem("NaCl-2.relaxed"), "NaCl-2.relaxed");
    }

    #[test]
    fn band_csv_marks_labels_once_and_merges_breaks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("band.csv");
        let bands = BandStructure {
            qpoints: vec![Vector3::zeros(), Vector3::new(0.5, 0.0, 0.0), Vector3::new(0.5, 0.0, 0.0), Vector3::new(0.5, 0.5, 0.0)],
            distances: vec![0.0, 0.1, 0.1, 0.2],
            labels: vec![(0.0, "G".into()), (0.1, "X".into()), (0.1, "Y".into()), (0.2, "M".into())],
            frequencies: vec![vec![0.0, 1.0]; 4],
        };
        write_band_csv(&path, &bands).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "distance,qx,qy,qz,label,mode_1,mode_2");
        assert!(lines[1].contains(",G,"));
        assert!(lines[2].contains(",X|Y,"));
        assert!(lines[3].contains(",,"));
        assert!(lines[4].contains(",M,"));
    }

    #[test]
    fn thermal_csv_has_field_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("thermal.csv");
        let point = ThermalPoint {
            temperature: 300.0,
            free_energy: -1.0,
            entropy: 2.0,
            heat_capacity: 3.0,
            internal_energy: 4.0,
        };
        write_thermal_csv(&path, &[point]).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("temperature,free_energy,entropy,heat_capacity,internal_energy"));
    }

    #[test]
    fn summary_counts_items() {
        let item = |index, success| ItemSummary {
            index,
            label: format!("s{}", index),
            success,
            converged: success,
            elapsed_secs: 0.1,
            message: None,
        };
        let summary = RunSummary::new("relax", "LJ-Ar", Utc::now(), vec![item(0, true), item(1, false)]);
        assert_eq!((summary.succeeded, summary.failed), (1, 1));
        let dir = tempfile::tempdir().unwrap();
        let path = summary.write(dir.path()).unwrap();
        let back: RunSummary = read_json(&path).unwrap();
        assert_eq!(back, summary);
    }
}
