use std::time::Instant;

use log::{debug, info, warn};
use nalgebra::{Matrix3, Vector3};
use serde::{Deserialize, Serialize};

use crate::core::domain::{Lattice, LatticeParameters, Structure};
use crate::engine::potential::{Evaluation, Potential};
use crate::error::{ConvergenceWarning, Result};
use crate::solvers::{CalculationOutput, PropertyCalculator};

/// Gradient-descent family optimizer driving the relaxation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Optimizer {
    /// Fast inertial relaxation engine.
    #[default]
    Fire,
    /// Steepest descent with an adaptive step and energy backtracking.
    SteepestDescent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelaxConfig {
    pub relax_atoms: bool,
    pub relax_cell: bool,
    /// Force tolerance on every atom (eV/Å).
    pub fmax: f64,
    /// Tolerance on every stress component, pressure included (eV/Å³).
    pub stress_tol: f64,
    pub max_steps: usize,
    pub optimizer: Optimizer,
    /// External hydrostatic pressure (eV/Å³).
    pub pressure: f64,
    /// Largest displacement of the generalized coordinates in one step (Å).
    pub max_step: f64,
    pub record_trajectory: bool,
}

impl Default for RelaxConfig {
    fn default() -> Self {
        Self {
            relax_atoms: true,
            relax_cell: true,
            fmax: 0.1,
            stress_tol: 0.002,
            max_steps: 500,
            optimizer: Optimizer::Fire,
            pressure: 0.0,
            max_step: 0.2,
            record_trajectory: false,
        }
    }
}

impl RelaxConfig {
    /// Same tolerances and optimizer with the cell held fixed.
    pub fn fixed_cell(&self) -> Self {
        Self {
            relax_cell: false,
            ..self.clone()
        }
    }

    fn is_noop(&self) -> bool {
        !self.relax_atoms && !self.relax_cell
    }
}

/// One optimizer step, recorded when `record_trajectory` is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrajectoryStep {
    pub step: usize,
    pub energy: f64,
    pub max_force: f64,
    pub max_stress: f64,
    pub volume: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelaxResult {
    pub structure: Structure,
    pub energy: f64,
    pub forces: Vec<Vector3<f64>>,
    pub stress: Matrix3<f64>,
    pub iterations: usize,
    pub converged: bool,
    pub lattice_parameters: LatticeParameters,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub trajectory: Vec<TrajectoryStep>,
    pub warning: Option<ConvergenceWarning>,
    pub elapsed_secs: f64,
}

impl RelaxResult {
    pub fn energy_per_atom(&self) -> f64 {
        self.energy / self.structure.len() as f64
    }

    pub fn max_force(&self) -> f64 {
        self.forces.iter().map(|f| f.norm()).fold(0.0, f64::max)
    }

    /// Warning re-labelled for the stage that requested this relaxation.
    pub fn warning_for(&self, stage: &str) -> Option<ConvergenceWarning> {
        self.warning.clone().map(|w| ConvergenceWarning {
            stage: stage.to_string(),
            ..w
        })
    }
}

impl CalculationOutput for RelaxResult {
    fn converged(&self) -> bool {
        self.converged
    }

    fn warnings(&self) -> Vec<ConvergenceWarning> {
        self.warning.iter().cloned().collect()
    }
}

/// Iterative minimization of the energy (enthalpy under pressure) over atomic
/// positions and, optionally, the cell.
///
/// The cell is handled through a unit-cell filter: the generalized
/// coordinates are the atom positions in the reference frame plus `N * F`,
/// where `F` is the deformation gradient from the input cell and `N` the
/// atom count.
#[derive(Debug, Clone, Default)]
pub struct RelaxationEngine {
    config: RelaxConfig,
}

impl RelaxationEngine {
    pub fn new(config: RelaxConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RelaxConfig {
        &self.config
    }

    pub fn relax(&self, structure: &Structure, potential: &dyn Potential) -> Result<RelaxResult> {
        let start = Instant::now();
        let cfg = &self.config;
        let initial = potential.evaluate(structure)?.validated(potential.name(), structure)?;

        if cfg.is_noop() {
            debug!("Relaxation disabled; returning a single evaluation");
            return Ok(self.finish(structure.clone(), initial, 0, true, Vec::new(), start));
        }
        if self.is_converged(&initial) {
            debug!("{} already converged", structure.formula());
            return Ok(self.finish(structure.clone(), initial, 0, true, Vec::new(), start));
        }

        info!(
            "Relaxing {} ({} atoms, cell {}) with {}",
            structure.formula(),
            structure.len(),
            if cfg.relax_cell { "free" } else { "fixed" },
            potential.name()
        );

        let n = structure.len();
        let cell_factor = n as f64;
        let reference = structure.lattice().clone();

        // Generalized coordinates: n positions followed by the columns of N * F
        let mut dofs = structure.cart_positions();
        for k in 0..3 {
            let mut column = Vector3::zeros();
            column[k] = cell_factor;
            dofs.push(column);
        }

        let mut current = structure.clone();
        let mut eval = initial;
        let mut trajectory = Vec::new();
        let mut stepper = Stepper::new(cfg);
        let mut iterations = 0;
        let mut converged = false;

        for step in 1..=cfg.max_steps {
            iterations = step;
            let deformation = deformation_of(&dofs, n, cell_factor);
            let forces = self.generalized_forces(&current, &eval, &deformation, cell_factor);

            let trial_dofs = stepper.propose(&dofs, &forces);
            let trial = apply_dofs(structure, &reference, &trial_dofs, n, cell_factor)?;
            let trial_eval = potential.evaluate(&trial)?.validated(potential.name(), &trial)?;

            if stepper.accept(self.enthalpy(&eval, &current), self.enthalpy(&trial_eval, &trial)) {
                dofs = trial_dofs;
                current = trial;
                eval = trial_eval;
            }

            debug!(
                "step {:>4}: E = {:.6} eV, Fmax = {:.4} eV/Å, Smax = {:.5} eV/Å³",
                step,
                eval.energy,
                eval.max_force(),
                self.max_stress(&eval)
            );
            if cfg.record_trajectory {
                trajectory.push(TrajectoryStep {
                    step,
                    energy: eval.energy,
                    max_force: eval.max_force(),
                    max_stress: self.max_stress(&eval),
                    volume: current.volume(),
                });
            }

            if self.is_converged(&eval) {
                converged = true;
                break;
            }
        }

        if converged {
            info!(
                "Converged in {} steps: E = {:.6} eV",
                iterations, eval.energy
            );
        } else {
            warn!(
                "Relaxation of {} stopped after {} steps (Fmax = {:.4} eV/Å)",
                structure.formula(),
                iterations,
                eval.max_force()
            );
        }

        let relaxed = current.wrapped()?;
        Ok(self.finish(relaxed, eval, iterations, converged, trajectory, start))
    }

    fn finish(
        &self,
        structure: Structure,
        eval: Evaluation,
        iterations: usize,
        converged: bool,
        trajectory: Vec<TrajectoryStep>,
        start: Instant,
    ) -> RelaxResult {
        let warning = (!converged).then(|| ConvergenceWarning {
            stage: "relaxation".to_string(),
            iterations,
            max_force: eval.max_force(),
            max_stress: self.config.relax_cell.then(|| self.max_stress(&eval)),
        });
        RelaxResult {
            lattice_parameters: structure.lattice().parameters(),
            structure,
            energy: eval.energy,
            forces: eval.forces,
            stress: eval.stress,
            iterations,
            converged,
            trajectory,
            warning,
            elapsed_secs: start.elapsed().as_secs_f64(),
        }
    }

    /// Largest stress component with the external pressure added.
    fn max_stress(&self, eval: &Evaluation) -> f64 {
        let target = eval.stress + Matrix3::from_diagonal_element(self.config.pressure);
        target.iter().map(|x| x.abs()).fold(0.0, f64::max)
    }

    fn is_converged(&self, eval: &Evaluation) -> bool {
        let cfg = &self.config;
        let atoms_ok = !cfg.relax_atoms || eval.max_force() < cfg.fmax;
        let cell_ok = !cfg.relax_cell || self.max_stress(eval) < cfg.stress_tol;
        atoms_ok && cell_ok
    }

    fn enthalpy(&self, eval: &Evaluation, structure: &Structure) -> f64 {
        eval.energy + self.config.pressure * structure.volume()
    }

    fn generalized_forces(
        &self,
        structure: &Structure,
        eval: &Evaluation,
        deformation: &Matrix3<f64>,
        cell_factor: f64,
    ) -> Vec<Vector3<f64>> {
        let mut forces: Vec<Vector3<f64>> = if self.config.relax_atoms {
            eval.forces.iter().map(|f| deformation.transpose() * f).collect()
        } else {
            vec![Vector3::zeros(); eval.forces.len()]
        };

        let cell_force = if self.config.relax_cell {
            let virial = -structure.volume()
                * (eval.stress + Matrix3::from_diagonal_element(self.config.pressure));
            match deformation.transpose().try_inverse() {
                Some(inv_t) => virial * inv_t / cell_factor,
                None => Matrix3::zeros(),
            }
        } else {
            Matrix3::zeros()
        };
        for k in 0..3 {
            forces.push(cell_force.column(k).into_owned());
        }
        forces
    }
}

impl PropertyCalculator for RelaxationEngine {
    type Output = RelaxResult;

    fn name(&self) -> &'static str {
        "relaxation"
    }

    fn calculate(&self, structure: &Structure, potential: &dyn Potential) -> Result<RelaxResult> {
        self.relax(structure, potential)
    }
}

/// Relaxes only when `enabled`, otherwise wraps a single evaluation.
pub(crate) fn relax_or_evaluate(
    structure: &Structure,
    potential: &dyn Potential,
    config: &RelaxConfig,
    enabled: bool,
) -> Result<RelaxResult> {
    let config = if enabled {
        config.clone()
    } else {
        RelaxConfig {
            relax_atoms: false,
            relax_cell: false,
            ..config.clone()
        }
    };
    RelaxationEngine::new(config).relax(structure, potential)
}

// --- Generalized coordinates ---

fn deformation_of(dofs: &[Vector3<f64>], n: usize, cell_factor: f64) -> Matrix3<f64> {
    Matrix3::from_columns(&[dofs[n], dofs[n + 1], dofs[n + 2]]) / cell_factor
}

/// Structure described by the generalized coordinates `dofs`.
fn apply_dofs(
    original: &Structure,
    reference: &Lattice,
    dofs: &[Vector3<f64>],
    n: usize,
    cell_factor: f64,
) -> Result<Structure> {
    let deformation = deformation_of(dofs, n, cell_factor);
    let lattice = reference.deformed(&deformation)?;
    // Reference-frame positions map to fractional coordinates through the reference cell
    let frac = dofs[..n].iter().map(|u| reference.to_fractional(u)).collect();
    original.with_lattice(lattice)?.with_frac_positions(frac)
}

// --- Optimizers ---

/// FIRE parameters, as in Bitzek et al. (2006).
const FIRE_DT: f64 = 0.1;
const FIRE_DT_MAX: f64 = 1.0;
const FIRE_N_MIN: usize = 5;
const FIRE_F_INC: f64 = 1.1;
const FIRE_F_DEC: f64 = 0.5;
const FIRE_ALPHA_START: f64 = 0.1;
const FIRE_F_ALPHA: f64 = 0.99;

const SD_ALPHA_START: f64 = 0.01;
const SD_ALPHA_MAX: f64 = 0.5;

enum Stepper {
    Fire {
        velocity: Option<Vec<Vector3<f64>>>,
        dt: f64,
        alpha: f64,
        n_positive: usize,
        max_step: f64,
    },
    SteepestDescent {
        alpha: f64,
        max_step: f64,
    },
}

impl Stepper {
    fn new(config: &RelaxConfig) -> Self {
        match config.optimizer {
            Optimizer::Fire => Stepper::Fire {
                velocity: None,
                dt: FIRE_DT,
                alpha: FIRE_ALPHA_START,
                n_positive: 0,
                max_step: config.max_step,
            },
            Optimizer::SteepestDescent => Stepper::SteepestDescent {
                alpha: SD_ALPHA_START,
                max_step: config.max_step,
            },
        }
    }

    /// Next generalized coordinates given the current forces.
    fn propose(&mut self, dofs: &[Vector3<f64>], forces: &[Vector3<f64>]) -> Vec<Vector3<f64>> {
        let step: Vec<Vector3<f64>> = match self {
            Stepper::Fire { velocity, dt, alpha, n_positive, .. } => {
                let v = velocity.get_or_insert_with(|| vec![Vector3::zeros(); forces.len()]);
                let vf: f64 = v.iter().zip(forces).map(|(v, f)| v.dot(f)).sum();
                if vf > 0.0 {
                    let v_norm = norm(v);
                    let f_norm = norm(forces);
                    if f_norm > 0.0 {
                        for (vi, fi) in v.iter_mut().zip(forces) {
                            *vi = *vi * (1.0 - *alpha) + fi * (*alpha * v_norm / f_norm);
                        }
                    }
                    if *n_positive > FIRE_N_MIN {
                        *dt = (*dt * FIRE_F_INC).min(FIRE_DT_MAX);
                        *alpha *= FIRE_F_ALPHA;
                    }
                    *n_positive += 1;
                } else {
                    v.iter_mut().for_each(|vi| *vi = Vector3::zeros());
                    *alpha = FIRE_ALPHA_START;
                    *dt *= FIRE_F_DEC;
                    *n_positive = 0;
                }
                for (vi, fi) in v.iter_mut().zip(forces) {
                    *vi += fi * *dt;
                }
                v.iter().map(|vi| vi * *dt).collect()
            }
            Stepper::SteepestDescent { alpha, .. } => forces.iter().map(|f| f * *alpha).collect(),
        };

        let max_step = match self {
            Stepper::Fire { max_step, .. } | Stepper::SteepestDescent { max_step, .. } => *max_step,
        };
        let length = norm(&step);
        let scale = if length > max_step { max_step / length } else { 1.0 };
        dofs.iter().zip(&step).map(|(x, dx)| x + dx * scale).collect()
    }

    /// Whether the proposed step is kept. FIRE always moves; steepest
    /// descent backs off when the enthalpy rises.
    fn accept(&mut self, current: f64, trial: f64) -> bool {
        match self {
            Stepper::Fire { .. } => true,
            Stepper::SteepestDescent { alpha, .. } => {
                if trial <= current + 1e-10 {
                    *alpha = (*alpha * 1.2).min(SD_ALPHA_MAX);
                    true
                } else {
                    *alpha *= 0.5;
                    false
                }
            }
        }
    }
}

fn norm(v: &[Vector3<f64>]) -> f64 {
    v.iter().map(|x| x.norm_squared()).sum::<f64>().sqrt()
}
