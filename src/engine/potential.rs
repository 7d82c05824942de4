use nalgebra::{Matrix3, Vector3};
use serde::{Deserialize, Serialize};

use crate::core::domain::Structure;
use crate::error::{CalcError, Result};

/// Output of a single potential evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    /// Total potential energy (eV).
    pub energy: f64,
    /// Force on each atom (eV/Å), in site order.
    pub forces: Vec<Vector3<f64>>,
    /// Cell stress (eV/Å³), σ = (1/V) ∂E/∂ε. Compressed cells report negative values.
    pub stress: Matrix3<f64>,
}

impl Evaluation {
    /// Checks shapes against `structure` and symmetrizes the stress.
    pub fn validated(mut self, potential: &str, structure: &Structure) -> Result<Self> {
        if self.forces.len() != structure.len() {
            return Err(CalcError::evaluation(
                potential,
                format!("returned {} forces for {} atoms", self.forces.len(), structure.len()),
            ));
        }
        if !self.energy.is_finite()
            || self.forces.iter().any(|f| f.iter().any(|x| !x.is_finite()))
            || self.stress.iter().any(|x| !x.is_finite())
        {
            return Err(CalcError::evaluation(potential, "non-finite energy, forces or stress"));
        }
        self.stress = (self.stress + self.stress.transpose()) * 0.5;
        Ok(self)
    }

    /// Largest per-atom force norm (eV/Å).
    pub fn max_force(&self) -> f64 {
        self.forces.iter().map(|f| f.norm()).fold(0.0, f64::max)
    }

    /// Largest absolute stress component (eV/Å³).
    pub fn max_stress(&self) -> f64 {
        self.stress.iter().map(|x| x.abs()).fold(0.0, f64::max)
    }

    pub fn energy_per_atom(&self) -> f64 {
        self.energy / self.forces.len() as f64
    }

    /// Stress in Voigt order (xx, yy, zz, yz, xz, xy).
    pub fn stress_voigt(&self) -> [f64; 6] {
        voigt(&self.stress)
    }
}

/// Voigt vector (xx, yy, zz, yz, xz, xy) of a symmetric tensor.
pub fn voigt(t: &Matrix3<f64>) -> [f64; 6] {
    [t[(0, 0)], t[(1, 1)], t[(2, 2)], t[(1, 2)], t[(0, 2)], t[(0, 1)]]
}

/// A pluggable energy/force/stress evaluator.
///
/// Evaluation takes `&self` so that one instance can serve repeated and
/// concurrent calls; implementations must not expose shared mutable state
/// between calls.
pub trait Potential: Send + Sync {
    /// Energy, forces and stress of `structure`.
    fn evaluate(&self, structure: &Structure) -> Result<Evaluation>;

    /// Returns the name of the backend (e.g., "LJ-Ar").
    fn name(&self) -> &str;
}

impl<P: Potential + ?Sized> Potential for Box<P> {
    fn evaluate(&self, structure: &Structure) -> Result<Evaluation> {
        (**self).evaluate(structure)
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}

impl<P: Potential + ?Sized> Potential for std::sync::Arc<P> {
    fn evaluate(&self, structure: &Structure) -> Result<Evaluation> {
        (**self).evaluate(structure)
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}
