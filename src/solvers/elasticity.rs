use log::{debug, info, warn};
use nalgebra::{Matrix3, Matrix6};
use serde::{Deserialize, Serialize};

use crate::analysis::moduli::{voigt_reuss_hill, ElasticModuli, EV_PER_A3_TO_GPA};
use crate::core::domain::Structure;
use crate::engine::potential::{voigt, Potential};
use crate::error::{CalcError, ConvergenceWarning, Result};
use crate::solvers::relax::{relax_or_evaluate, RelaxConfig};
use crate::solvers::{CalculationOutput, PropertyCalculator};

/// Voigt index -> tensor index pair, order xx, yy, zz, yz, xz, xy.
const VOIGT_PAIRS: [(usize, usize); 6] = [(0, 0), (1, 1), (2, 2), (1, 2), (0, 2), (0, 1)];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ElasticConfig {
    /// Normal strains applied along xx, yy and zz.
    pub norm_strains: Vec<f64>,
    /// Engineering shear strains applied to yz, xz and xy.
    pub shear_strains: Vec<f64>,
    /// Include the unstrained stress as a fit point at zero strain.
    pub use_equilibrium: bool,
    pub relax_structure: bool,
    /// Relax atomic positions (cell fixed) in every strained structure.
    pub relax_deformed_structures: bool,
    pub relax: RelaxConfig,
}

impl Default for ElasticConfig {
    fn default() -> Self {
        Self {
            norm_strains: vec![-0.01, -0.005, 0.005, 0.01],
            shear_strains: vec![-0.01, -0.005, 0.005, 0.01],
            use_equilibrium: true,
            relax_structure: true,
            relax_deformed_structures: true,
            relax: RelaxConfig::default(),
        }
    }
}

impl ElasticConfig {
    pub fn validate(&self) -> Result<()> {
        for (name, strains) in [("norm_strains", &self.norm_strains), ("shear_strains", &self.shear_strains)] {
            if strains.iter().any(|e| *e == 0.0 || !e.is_finite() || e.abs() >= 0.5) {
                return Err(CalcError::Configuration(format!(
                    "{} must be small non-zero values, got {:?}",
                    name, strains
                )));
            }
            let distinct = {
                let mut s = strains.clone();
                s.sort_by(|a, b| a.total_cmp(b));
                s.dedup();
                s.len()
            };
            let fit_points = distinct + usize::from(self.use_equilibrium);
            if fit_points < 2 {
                return Err(CalcError::Configuration(format!(
                    "{} gives {} distinct fit points; a linear fit needs 2",
                    name, fit_points
                )));
            }
        }
        Ok(())
    }
}

/// Stress response of one strained structure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrainState {
    /// Voigt component that was strained.
    pub component: usize,
    /// Applied (engineering) strain.
    pub strain: f64,
    /// Voigt stress (eV/Å³).
    pub stress: [f64; 6],
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElasticResult {
    /// Reference structure the strains were applied to.
    pub structure: Structure,
    /// Symmetrized 6x6 Voigt stiffness (eV/Å³).
    pub elastic_tensor: Matrix6<f64>,
    /// Largest |C_ij - C_ji| before symmetrization (eV/Å³).
    pub asymmetry: f64,
    pub moduli: ElasticModuli,
    pub residual_stress: [f64; 6],
    pub strain_states: Vec<StrainState>,
    pub warnings: Vec<ConvergenceWarning>,
}

impl ElasticResult {
    pub fn elastic_tensor_gpa(&self) -> Matrix6<f64> {
        self.elastic_tensor * EV_PER_A3_TO_GPA
    }

    /// The rank-4 stiffness C_ijkl expanded from the Voigt matrix.
    pub fn full_tensor(&self) -> [[[[f64; 3]; 3]; 3]; 3] {
        let mut c = [[[[0.0; 3]; 3]; 3]; 3];
        for (p, &(i, j)) in VOIGT_PAIRS.iter().enumerate() {
            for (q, &(k, l)) in VOIGT_PAIRS.iter().enumerate() {
                let v = self.elastic_tensor[(p, q)];
                for (a, b) in [(i, j), (j, i)] {
                    for (c_, d) in [(k, l), (l, k)] {
                        c[a][b][c_][d] = v;
                    }
                }
            }
        }
        c
    }
}

impl CalculationOutput for ElasticResult {
    fn converged(&self) -> bool {
        self.warnings.is_empty()
    }

    fn warnings(&self) -> Vec<ConvergenceWarning> {
        self.warnings.clone()
    }
}

/// Elastic constants from the linear stress response to small strains.
#[derive(Debug, Clone, Default)]
pub struct ElasticityEngine {
    config: ElasticConfig,
}

impl ElasticityEngine {
    pub fn new(config: ElasticConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ElasticConfig {
        &self.config
    }

    pub fn run(&self, structure: &Structure, potential: &dyn Potential) -> Result<ElasticResult> {
        let cfg = &self.config;
        cfg.validate()?;
        let mut warnings = Vec::new();

        let reference = relax_or_evaluate(structure, potential, &cfg.relax, cfg.relax_structure)?;
        warnings.extend(reference.warning_for("elastic reference relaxation"));
        let residual_stress = voigt(&reference.stress);
        info!(
            "Elastic constants of {} ({} strained structures)",
            reference.structure.formula(),
            3 * (cfg.norm_strains.len() + cfg.shear_strains.len())
        );

        let strained_relax = cfg.relax.fixed_cell();
        let mut strain_states = Vec::new();
        for (component, &(i, j)) in VOIGT_PAIRS.iter().enumerate() {
            let strains = if component < 3 { &cfg.norm_strains } else { &cfg.shear_strains };
            for &strain in strains {
                let deformation = Matrix3::identity() + strain_tensor(i, j, strain);
                let strained = reference.structure.deformed(&deformation)?;
                let result = relax_or_evaluate(
                    &strained,
                    potential,
                    &strained_relax,
                    cfg.relax_deformed_structures,
                )?;
                warnings.extend(result.warning_for(&format!(
                    "strained relaxation (component {}, strain {})",
                    component, strain
                )));
                debug!("strain {} on component {}: stress {:?}", strain, component, voigt(&result.stress));
                strain_states.push(StrainState {
                    component,
                    strain,
                    stress: voigt(&result.stress),
                });
            }
        }

        let raw = fit_stiffness(&strain_states, cfg.use_equilibrium.then_some(residual_stress));
        let asymmetry = (raw - raw.transpose()).abs().max();
        let elastic_tensor = (raw + raw.transpose()) * 0.5;
        if asymmetry > 1e-3 * elastic_tensor.abs().max() {
            warn!("Fitted stiffness is asymmetric by {:.3e} eV/Å³", asymmetry);
        }
        let moduli = voigt_reuss_hill(&elastic_tensor);
        if !moduli.has_reuss() {
            warn!(
                "Stiffness of {} is singular; only Voigt bounds are reported",
                reference.structure.formula()
            );
        }

        Ok(ElasticResult {
            structure: reference.structure,
            elastic_tensor,
            asymmetry,
            moduli,
            residual_stress,
            strain_states,
            warnings,
        })
    }
}

impl PropertyCalculator for ElasticityEngine {
    type Output = ElasticResult;

    fn name(&self) -> &'static str {
        "elasticity"
    }

    fn calculate(&self, structure: &Structure, potential: &dyn Potential) -> Result<ElasticResult> {
        self.run(structure, potential)
    }
}

/// Symmetric strain with `value` on (i, i), or an engineering shear split over (i, j) and (j, i).
fn strain_tensor(i: usize, j: usize, value: f64) -> Matrix3<f64> {
    let mut eps = Matrix3::zeros();
    if i == j {
        eps[(i, i)] = value;
    } else {
        eps[(i, j)] = 0.5 * value;
        eps[(j, i)] = 0.5 * value;
    }
    eps
}

/// Column q of C is the least-squares slope of every stress component against
/// the strain applied to component q.
fn fit_stiffness(states: &[StrainState], equilibrium: Option<[f64; 6]>) -> Matrix6<f64> {
    let mut c = Matrix6::zeros();
    for q in 0..6 {
        let mut points: Vec<(f64, [f64; 6])> = states
            .iter()
            .filter(|s| s.component == q)
            .map(|s| (s.strain, s.stress))
            .collect();
        if let Some(eq) = equilibrium {
            points.push((0.0, eq));
        }
        for p in 0..6 {
            let xy: Vec<(f64, f64)> = points.iter().map(|(e, s)| (*e, s[p])).collect();
            c[(p, q)] = slope(&xy);
        }
    }
    c
}

fn slope(points: &[(f64, f64)]) -> f64 {
    let n = points.len() as f64;
    let mean_x = points.iter().map(|p| p.0).sum::<f64>() / n;
    let mean_y = points.iter().map(|p| p.1).sum::<f64>() / n;
    let (num, den) = points.iter().fold((0.0, 0.0), |(num, den), (x, y)| {
        (num + (x - mean_x) * (y - mean_y), den + (x - mean_x).powi(2))
    });
    if den > 0.0 { num / den } else { 0.0 }
}
