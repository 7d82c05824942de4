//! JSON job files.
//!
//! ```json
//! {
//!   "potential": "lj",
//!   "structures": ["Ar.vasp", "POSCAR_Ne"],
//!   "calculation": {"type": "elastic", "norm_strains": [-0.01, 0.01]},
//!   "jobs": 0
//! }
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::core::domain::Structure;
use crate::engine::operators::{seeded_rng, Perturber};
use crate::engine::registry::PotentialRef;
use crate::error::{CalcError, Result};
use crate::io;
use crate::solvers::batch::Parallelism;
use crate::solvers::elasticity::ElasticConfig;
use crate::solvers::phonon::PhononConfig;
use crate::solvers::relax::RelaxConfig;
use crate::solvers::surface::SurfaceConfig;

/// Which engine a job runs, with its settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CalculationConfig {
    Relax(RelaxConfig),
    Surface(SurfaceConfig),
    Phonon(PhononConfig),
    Elastic(ElasticConfig),
}

impl CalculationConfig {
    pub fn name(&self) -> &'static str {
        match self {
            CalculationConfig::Relax(_) => "relax",
            CalculationConfig::Surface(_) => "surface",
            CalculationConfig::Phonon(_) => "phonon",
            CalculationConfig::Elastic(_) => "elastic",
        }
    }
}

/// Random perturbation applied to every input before the calculation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerturbConfig {
    #[serde(flatten)]
    pub perturber: Perturber,
    /// Item `k` uses seed `seed + k`.
    #[serde(default)]
    pub seed: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobConfig {
    #[serde(default)]
    pub potential: PotentialRef,
    pub structures: Vec<PathBuf>,
    pub calculation: CalculationConfig,
    /// Worker count; `0` or negative uses every core.
    #[serde(default)]
    pub jobs: i64,
    #[serde(default)]
    pub perturb: Option<PerturbConfig>,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("propcalc-output")
}

impl JobConfig {
    /// Reads a job file. Relative structure and output paths are taken
    /// relative to the job file's directory.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| CalcError::Io {
            path: path.display().to_string(),
            source: e,
        })?;
        let mut job: JobConfig = serde_json::from_str(&content)
            .map_err(|e| CalcError::parse("job JSON", &path.display().to_string(), e.to_string()))?;

        if let Some(base) = path.parent() {
            for p in job.structures.iter_mut() {
                if p.is_relative() {
                    *p = base.join(&*p);
                }
            }
            if job.output_dir.is_relative() {
                job.output_dir = base.join(&job.output_dir);
            }
        }
        job.validate()?;
        Ok(job)
    }

    /// Checks what can be checked without touching the structure files.
    pub fn validate(&self) -> Result<()> {
        if self.structures.is_empty() {
            return Err(CalcError::Configuration("job lists no structures".to_string()));
        }
        self.potential.to_spec()?;
        if let CalculationConfig::Elastic(cfg) = &self.calculation {
            cfg.validate()?;
        }
        Ok(())
    }

    pub fn parallelism(&self) -> Parallelism {
        Parallelism::from_jobs(self.jobs)
    }

    /// Reads every structure and applies the optional perturbation.
    pub fn load_structures(&self) -> Result<Vec<Structure>> {
        self.structures
            .iter()
            .enumerate()
            .map(|(k, path)| {
                let structure = io::read_structure(path)?;
                match &self.perturb {
                    Some(p) if !p.perturber.is_identity() => {
                        let mut rng = seeded_rng(p.seed.wrapping_add(k as u64));
                        p.perturber.apply(&structure, &mut rng)
                    }
                    _ => Ok(structure),
                }
            })
            .collect()
    }
}
