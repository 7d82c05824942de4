//! Built-in potentials.

pub mod pair;

pub use pair::{LennardJones, Morse, PairFunction, PairPotential};

use nalgebra::{Matrix3, Vector3};

use crate::core::domain::Structure;
use crate::engine::potential::{Evaluation, Potential};
use crate::error::Result;

/// Returns zero energy, forces and stress for any structure.
#[derive(Debug, Clone, Copy, Default)]
pub struct ZeroPotential;

impl Potential for ZeroPotential {
    fn evaluate(&self, structure: &Structure) -> Result<Evaluation> {
        Ok(Evaluation {
            energy: 0.0,
            forces: vec![Vector3::zeros(); structure.len()],
            stress: Matrix3::zeros(),
        })
    }

    fn name(&self) -> &str {
        "Zero"
    }
}
