//! Structure files on disk: POSCAR/CONTCAR and the JSON form of `Structure`.

pub mod poscar;

use std::fs;
use std::path::Path;

use crate::core::domain::Structure;
use crate::error::{CalcError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StructureFormat {
    Poscar,
    Json,
}

impl StructureFormat {
    /// `.json` is JSON; `.vasp`, `.poscar` and names containing POSCAR or
    /// CONTCAR are POSCAR.
    pub fn from_path(path: &Path) -> Result<Self> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();
        match ext.as_str() {
            "json" => Ok(StructureFormat::Json),
            "vasp" | "poscar" => Ok(StructureFormat::Poscar),
            _ if name.contains("poscar") || name.contains("contcar") => Ok(StructureFormat::Poscar),
            _ => Err(CalcError::Configuration(format!(
                "cannot infer structure format of '{}'",
                path.display()
            ))),
        }
    }
}

fn io_error(path: &Path, source: std::io::Error) -> CalcError {
    CalcError::Io {
        path: path.display().to_string(),
        source,
    }
}

/// Reads a structure, choosing the format from the file name.
///
/// Structures without a label are labelled with the file stem.
pub fn read_structure(path: &Path) -> Result<Structure> {
    let format = StructureFormat::from_path(path)?;
    let content = fs::read_to_string(path).map_err(|e| io_error(path, e))?;
    let source_name = path.display().to_string();
    let structure = match format {
        StructureFormat::Poscar => poscar::parse(&content, &source_name)?,
        StructureFormat::Json => serde_json::from_str::<Structure>(&content)
            .map_err(|e| CalcError::parse("JSON", &source_name, e.to_string()))?,
    };
    if structure.label().is_empty() {
        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
            .to_string();
        return Ok(structure.with_label(stem));
    }
    Ok(structure)
}

pub fn write_structure(path: &Path, structure: &Structure) -> Result<()> {
    let content = match StructureFormat::from_path(path)? {
        StructureFormat::Poscar => poscar::to_string(structure),
        StructureFormat::Json => serde_json::to_string_pretty(structure)
            .map_err(|e| CalcError::Configuration(format!("cannot serialize structure: {}", e)))?,
    };
    fs::write(path, content).map_err(|e| io_error(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn format_follows_file_name() {
        let cases = [
            ("POSCAR", StructureFormat::Poscar),
            ("run/CONTCAR", StructureFormat::Poscar),
            ("Si.vasp", StructureFormat::Poscar),
            ("POSCAR_relaxed", StructureFormat::Poscar),
            ("nacl.JSON", StructureFormat::Json),
        ];
        for (name, expected) in cases {
            assert_eq!(StructureFormat::from_path(&PathBuf::from(name)).unwrap(), expected);
        }
        assert!(matches!(
            StructureFormat::from_path(&PathBuf::from("data.xyz")),
            Err(CalcError::Configuration(_))
        ));
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = read_structure(Path::new("/nonexistent/POSCAR")).unwrap_err();
        assert!(matches!(err, CalcError::Io { .. }));
        assert!(err.is_fatal());
    }
}
