use log::{debug, info, warn};
use nalgebra::{Complex, DMatrix, Matrix3, SymmetricEigen, Vector3};
use serde::{Deserialize, Serialize};

use crate::analysis::kpath::{self, BandPath};
use crate::analysis::thermal::{self, ThermalPoint};
use crate::core::domain::Structure;
use crate::core::spatial;
use crate::engine::operators::make_supercell;
use crate::engine::potential::Potential;
use crate::error::{CalcError, ConvergenceWarning, Result};
use crate::solvers::relax::{relax_or_evaluate, RelaxConfig};
use crate::solvers::{CalculationOutput, PropertyCalculator};

/// sqrt(eV / (Å² amu)) in THz, angular factor removed.
pub const FREQUENCY_TO_THZ: f64 = 15.633302;

/// Images closer than this (Å) to the shortest one share its phase weight.
const IMAGE_TOLERANCE: f64 = 1e-4;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PhononConfig {
    /// Row i gives supercell vector i in the primitive basis.
    pub supercell_matrix: [[i32; 3]; 3],
    /// Displacement amplitude (Å).
    pub displacement: f64,
    /// Central differences (±δ) instead of forward differences.
    pub plus_minus: bool,
    pub relax_structure: bool,
    pub relax: RelaxConfig,
    pub band_path: BandPath,
    pub band_points: usize,
    pub mesh: [usize; 3],
    /// Gaussian smearing of the DOS (THz).
    pub dos_sigma: f64,
    pub dos_points: usize,
    pub t_min: f64,
    pub t_max: f64,
    pub t_step: f64,
    /// Modes below this frequency (THz) are left out of thermal sums.
    pub cutoff_frequency: f64,
    pub enforce_acoustic_sum_rule: bool,
}

impl Default for PhononConfig {
    fn default() -> Self {
        Self {
            supercell_matrix: [[2, 0, 0], [0, 2, 0], [0, 0, 2]],
            displacement: 0.01,
            plus_minus: true,
            relax_structure: true,
            relax: RelaxConfig::default(),
            band_path: BandPath::default(),
            band_points: 51,
            mesh: [8, 8, 8],
            dos_sigma: 0.1,
            dos_points: 201,
            t_min: 0.0,
            t_max: 1000.0,
            t_step: 10.0,
            cutoff_frequency: 1e-3,
            enforce_acoustic_sum_rule: true,
        }
    }
}

/// Harmonic force constants in compact form: one row of 3x3 blocks per
/// primitive atom, one block per supercell atom.
///
/// `blocks[i][j][(a, b)]` is −∂F_{j,b}/∂u_{i,a} (eV/Å²).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForceConstants {
    pub primitive: Structure,
    pub supercell: Structure,
    pub supercell_matrix: [[i32; 3]; 3],
    /// Primitive atom each supercell atom derives from.
    pub parent_index: Vec<usize>,
    pub blocks: Vec<Vec<Matrix3<f64>>>,
}

impl ForceConstants {
    pub fn n_primitive(&self) -> usize {
        self.primitive.len()
    }

    pub(crate) fn validate(&self) -> Result<()> {
        let (n_prim, n_super) = (self.primitive.len(), self.supercell.len());
        let shape_ok = self.blocks.len() == n_prim
            && self.blocks.iter().all(|row| row.len() == n_super)
            && self.parent_index.len() == n_super
            && self.parent_index.iter().all(|&p| p < n_prim);
        if !shape_ok {
            return Err(CalcError::Configuration(format!(
                "force constants do not match {} primitive and {} supercell atoms",
                n_prim, n_super
            )));
        }
        Ok(())
    }

    /// Replaces the self term so every row sums to zero (translational invariance).
    pub fn enforce_acoustic_sum_rule(&mut self) {
        for (i, row) in self.blocks.iter_mut().enumerate() {
            let total: Matrix3<f64> = row.iter().sum();
            row[i] -= total;
        }
    }

    /// Largest |Σ_j Φ(i, j)| component, zero for translation-invariant constants.
    pub fn sum_rule_violation(&self) -> f64 {
        self.blocks
            .iter()
            .map(|row| row.iter().sum::<Matrix3<f64>>().abs().max())
            .fold(0.0, f64::max)
    }

    pub fn dynamical_matrix(&self) -> Result<DynamicalMatrix<'_>> {
        DynamicalMatrix::new(self)
    }
}

/// Builds D(q) from force constants with shortest-image phase averaging.
pub struct DynamicalMatrix<'a> {
    fc: &'a ForceConstants,
    /// images[i][j]: primitive-fractional vectors from atom i to the shortest
    /// periodic images of supercell atom j.
    images: Vec<Vec<Vec<Vector3<f64>>>>,
    inv_sqrt_mass: Vec<f64>,
}

impl<'a> DynamicalMatrix<'a> {
    pub fn new(fc: &'a ForceConstants) -> Result<Self> {
        fc.validate()?;
        let prim_lattice = fc.primitive.lattice();
        let super_lattice = fc.supercell.lattice();
        let super_frac = fc.supercell.frac_positions();

        let mut images = Vec::with_capacity(fc.n_primitive());
        for i in 0..fc.n_primitive() {
            let mut row = Vec::with_capacity(fc.supercell.len());
            for frac_j in &super_frac {
                let delta = spatial::minimum_image(&(frac_j - super_frac[i]));
                let mut candidates = Vec::with_capacity(27);
                for a in -1..=1 {
                    for b in -1..=1 {
                        for c in -1..=1 {
                            let shift = Vector3::new(a as f64, b as f64, c as f64);
                            candidates.push(super_lattice.to_cartesian(&(delta + shift)));
                        }
                    }
                }
                let shortest = candidates.iter().map(|v| v.norm()).fold(f64::MAX, f64::min);
                let vectors = candidates
                    .into_iter()
                    .filter(|v| v.norm() < shortest + IMAGE_TOLERANCE)
                    .map(|v| prim_lattice.to_fractional(&v))
                    .collect();
                row.push(vectors);
            }
            images.push(row);
        }

        let inv_sqrt_mass = fc.primitive.masses().iter().map(|m| 1.0 / m.sqrt()).collect();
        Ok(Self {
            fc,
            images,
            inv_sqrt_mass,
        })
    }

    /// Mass-weighted Hermitian dynamical matrix at `q` (fractional reciprocal coordinates).
    pub fn at(&self, q: &Vector3<f64>) -> DMatrix<Complex<f64>> {
        let n = self.fc.n_primitive();
        let mut d = DMatrix::<Complex<f64>>::zeros(3 * n, 3 * n);
        for i in 0..n {
            for (j_super, block) in self.fc.blocks[i].iter().enumerate() {
                let j = self.fc.parent_index[j_super];
                let images = &self.images[i][j_super];
                let phase = images
                    .iter()
                    .map(|r| {
                        let arg = 2.0 * std::f64::consts::PI * q.dot(r);
                        Complex::new(arg.cos(), arg.sin())
                    })
                    .sum::<Complex<f64>>()
                    / images.len() as f64;
                let weight = self.inv_sqrt_mass[i] * self.inv_sqrt_mass[j];
                for a in 0..3 {
                    for b in 0..3 {
                        d[(3 * i + a, 3 * j + b)] += phase * (block[(a, b)] * weight);
                    }
                }
            }
        }
        // Finite differences break exact hermiticity slightly
        (&d + d.adjoint()) * Complex::new(0.5, 0.0)
    }

    /// Mode frequencies (THz) at `q`, ascending. Imaginary modes are negative.
    pub fn frequencies(&self, q: &Vector3<f64>) -> Vec<f64> {
        let eigen = SymmetricEigen::new(self.at(q));
        let mut freqs: Vec<f64> = eigen
            .eigenvalues
            .iter()
            .map(|&lambda| lambda.signum() * lambda.abs().sqrt() * FREQUENCY_TO_THZ)
            .collect();
        freqs.sort_by(|a, b| a.total_cmp(b));
        freqs
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BandStructure {
    pub qpoints: Vec<Vector3<f64>>,
    pub distances: Vec<f64>,
    pub labels: Vec<(f64, String)>,
    /// frequencies[k][mode] (THz)
    pub frequencies: Vec<Vec<f64>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhononDos {
    /// THz
    pub frequency_points: Vec<f64>,
    /// States per THz per unit cell; integrates to 3N.
    pub dos: Vec<f64>,
}

impl PhononDos {
    /// Gaussian-smeared density of states of equally weighted q-points.
    pub fn from_frequencies(frequencies: &[Vec<f64>], sigma: f64, points: usize) -> Result<Self> {
        if sigma <= 0.0 || points < 2 {
            return Err(CalcError::Configuration(format!(
                "DOS needs sigma > 0 and at least 2 points (got {}, {})",
                sigma, points
            )));
        }
        let all = frequencies.iter().flatten();
        let lo = all.clone().copied().fold(f64::MAX, f64::min) - 5.0 * sigma;
        let hi = all.copied().fold(f64::MIN, f64::max) + 5.0 * sigma;
        let step = (hi - lo) / (points - 1) as f64;
        let norm = 1.0 / (sigma * (2.0 * std::f64::consts::PI).sqrt() * frequencies.len() as f64);

        let frequency_points: Vec<f64> = (0..points).map(|i| lo + i as f64 * step).collect();
        let dos = frequency_points
            .iter()
            .map(|&f| {
                frequencies
                    .iter()
                    .flatten()
                    .map(|&nu| (-(f - nu).powi(2) / (2.0 * sigma * sigma)).exp())
                    .sum::<f64>()
                    * norm
            })
            .collect();
        Ok(Self { frequency_points, dos })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhononResult {
    /// Structure the force constants were computed for (relaxed if requested).
    pub structure: Structure,
    /// Formula units in `structure`; thermal properties are per cell, not per formula unit.
    pub formula_units: usize,
    pub force_constants: ForceConstants,
    pub band_structure: BandStructure,
    pub dos: PhononDos,
    pub thermal: Vec<ThermalPoint>,
    pub gamma_frequencies: Vec<f64>,
    /// Mesh modes below −cutoff_frequency.
    pub imaginary_modes: usize,
    /// Largest force on the undisplaced supercell (eV/Å).
    pub residual_force: f64,
    pub warnings: Vec<ConvergenceWarning>,
}

impl CalculationOutput for PhononResult {
    fn converged(&self) -> bool {
        self.warnings.is_empty()
    }

    fn warnings(&self) -> Vec<ConvergenceWarning> {
        self.warnings.clone()
    }
}

/// Finite-displacement phonons: force constants, band structure, DOS and
/// harmonic thermal properties.
#[derive(Debug, Clone, Default)]
pub struct PhononEngine {
    config: PhononConfig,
}

impl PhononEngine {
    pub fn new(config: PhononConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PhononConfig {
        &self.config
    }

    /// Force constants of `structure` as given (no relaxation). Also returns
    /// the largest force on the undisplaced supercell.
    pub fn force_constants(
        &self,
        structure: &Structure,
        potential: &dyn Potential,
    ) -> Result<(ForceConstants, f64)> {
        let cfg = &self.config;
        if cfg.displacement <= 0.0 {
            return Err(CalcError::Configuration(format!(
                "phonon displacement must be positive, got {}",
                cfg.displacement
            )));
        }
        let m = cfg.supercell_matrix;
        let matrix = Matrix3::from_fn(|i, j| m[j][i]);
        let sc = make_supercell(structure, &matrix)?;
        let n_prim = structure.len();
        let n_super = sc.structure.len();
        let delta = cfg.displacement;
        info!(
            "Phonons of {}: {} atom supercell, {} displacements",
            structure.formula(),
            n_super,
            n_prim * 3 * if cfg.plus_minus { 2 } else { 1 }
        );

        let reference = potential
            .evaluate(&sc.structure)?
            .validated(potential.name(), &sc.structure)?;
        let residual_force = reference.max_force();

        let positions = sc.structure.cart_positions();
        let displaced_forces = |atom: usize, axis: usize, step: f64| -> Result<Vec<Vector3<f64>>> {
            let mut moved = positions.clone();
            moved[atom][axis] += step;
            let displaced = sc.structure.with_cart_positions(&moved)?;
            Ok(potential
                .evaluate(&displaced)?
                .validated(potential.name(), &displaced)?
                .forces)
        };

        let mut blocks = vec![vec![Matrix3::zeros(); n_super]; n_prim];
        for (i, row) in blocks.iter_mut().enumerate() {
            for axis in 0..3 {
                let plus = displaced_forces(i, axis, delta)?;
                let derivative: Vec<Vector3<f64>> = if cfg.plus_minus {
                    let minus = displaced_forces(i, axis, -delta)?;
                    plus.iter().zip(&minus).map(|(p, m)| (p - m) / (2.0 * delta)).collect()
                } else {
                    plus.iter().zip(&reference.forces).map(|(p, r)| (p - r) / delta).collect()
                };
                for (block, df) in row.iter_mut().zip(&derivative) {
                    for b in 0..3 {
                        block[(axis, b)] = -df[b];
                    }
                }
            }
            debug!("force constants row {} of {} done", i + 1, n_prim);
        }

        let mut fc = ForceConstants {
            primitive: structure.clone(),
            supercell: sc.structure,
            supercell_matrix: m,
            parent_index: sc.parent_index,
            blocks,
        };
        if cfg.enforce_acoustic_sum_rule {
            debug!("acoustic sum rule violation before correction: {:.3e}", fc.sum_rule_violation());
            fc.enforce_acoustic_sum_rule();
        }
        Ok((fc, residual_force))
    }

    pub fn band_structure(&self, dm: &DynamicalMatrix<'_>, structure: &Structure) -> Result<BandStructure> {
        let samples = self
            .config
            .band_path
            .sample(structure.lattice(), self.config.band_points)?;
        let frequencies = samples.qpoints.iter().map(|q| dm.frequencies(q)).collect();
        Ok(BandStructure {
            qpoints: samples.qpoints,
            distances: samples.distances,
            labels: samples.labels,
            frequencies,
        })
    }

    pub fn run(&self, structure: &Structure, potential: &dyn Potential) -> Result<PhononResult> {
        let cfg = &self.config;
        let mut warnings = Vec::new();

        let relaxed = relax_or_evaluate(structure, potential, &cfg.relax, cfg.relax_structure)?;
        warnings.extend(relaxed.warning_for("phonon pre-relaxation"));
        let structure = relaxed.structure;

        let (fc, residual_force) = self.force_constants(&structure, potential)?;
        if residual_force > cfg.relax.fmax {
            warn!(
                "Reference supercell of {} carries forces up to {:.4} eV/Å; phonons may be unreliable",
                structure.formula(),
                residual_force
            );
            warnings.push(ConvergenceWarning {
                stage: "phonon reference structure".to_string(),
                iterations: relaxed.iterations,
                max_force: residual_force,
                max_stress: None,
            });
        }

        let dm = fc.dynamical_matrix()?;
        let gamma_frequencies = dm.frequencies(&Vector3::zeros());
        let band_structure = self.band_structure(&dm, &structure)?;

        let mesh = kpath::gamma_centered_mesh(cfg.mesh)?;
        let mesh_frequencies: Vec<Vec<f64>> = mesh.iter().map(|q| dm.frequencies(q)).collect();
        let imaginary_modes = mesh_frequencies
            .iter()
            .flatten()
            .filter(|&&f| f < -cfg.cutoff_frequency)
            .count();
        if imaginary_modes > 0 {
            warn!("{} imaginary modes on the {:?} mesh", imaginary_modes, cfg.mesh);
        }
        let dos = PhononDos::from_frequencies(&mesh_frequencies, cfg.dos_sigma, cfg.dos_points)?;

        let temperatures = thermal::temperature_range(cfg.t_min, cfg.t_max, cfg.t_step)?;
        let weights = vec![1.0; mesh_frequencies.len()];
        let thermal = thermal::thermal_properties(
            &mesh_frequencies,
            &weights,
            &temperatures,
            cfg.cutoff_frequency,
        );

        Ok(PhononResult {
            formula_units: structure.formula_units(),
            structure,
            force_constants: fc,
            band_structure,
            dos,
            thermal,
            gamma_frequencies,
            imaginary_modes,
            residual_force,
            warnings,
        })
    }
}

impl PropertyCalculator for PhononEngine {
    type Output = PhononResult;

    fn name(&self) -> &'static str {
        "phonon"
    }

    fn calculate(&self, structure: &Structure, potential: &dyn Potential) -> Result<PhononResult> {
        self.run(structure, potential)
    }
}
