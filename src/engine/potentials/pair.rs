use nalgebra::{Matrix3, Vector3};
use serde::{Deserialize, Serialize};

use crate::core::chemistry::{Element, InteractionGrid};
use crate::core::domain::Structure;
use crate::core::spatial;
use crate::engine::potential::{Evaluation, Potential};
use crate::error::{CalcError, Result};

/// Radial pair interaction φ(r).
pub trait PairFunction: Clone + Send + Sync {
    /// φ(r) and dφ/dr.
    fn energy_derivative(&self, r: f64) -> (f64, f64);

    /// Parameters for an unlike pair.
    fn mix(&self, other: &Self) -> Self;
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct LennardJones {
    /// Well depth (eV)
    pub epsilon: f64,
    /// Zero-crossing distance (Å)
    pub sigma: f64,
}

impl PairFunction for LennardJones {
    fn energy_derivative(&self, r: f64) -> (f64, f64) {
        let s6 = (self.sigma / r).powi(6);
        let s12 = s6 * s6;
        (4.0 * self.epsilon * (s12 - s6), 24.0 * self.epsilon * (s6 - 2.0 * s12) / r)
    }

    // Lorentz-Berthelot
    fn mix(&self, other: &Self) -> Self {
        LennardJones {
            epsilon: (self.epsilon * other.epsilon).sqrt(),
            sigma: 0.5 * (self.sigma + other.sigma),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Morse {
    /// Dissociation energy (eV)
    pub d0: f64,
    /// Width (1/Å)
    pub alpha: f64,
    /// Equilibrium distance (Å)
    pub r0: f64,
}

impl PairFunction for Morse {
    fn energy_derivative(&self, r: f64) -> (f64, f64) {
        let x = (-self.alpha * (r - self.r0)).exp();
        (
            self.d0 * (x * x - 2.0 * x),
            2.0 * self.alpha * self.d0 * (x - x * x),
        )
    }

    fn mix(&self, other: &Self) -> Self {
        Morse {
            d0: (self.d0 * other.d0).sqrt(),
            alpha: 0.5 * (self.alpha + other.alpha),
            r0: 0.5 * (self.r0 + other.r0),
        }
    }
}

/// Parameters either shared by all elements or resolved per element pair.
#[derive(Clone, Debug)]
enum PairParameters<F> {
    Uniform(F),
    PerElement(InteractionGrid<F>),
}

/// A truncated and shifted pair potential with periodic images and analytic stress.
#[derive(Clone, Debug)]
pub struct PairPotential<F: PairFunction> {
    name: String,
    params: PairParameters<F>,
    cutoff: f64,
    max_atoms: Option<usize>,
}

impl<F: PairFunction> PairPotential<F> {
    /// Same interaction for every element.
    pub fn uniform(name: &str, function: F, cutoff: f64) -> Result<Self> {
        check_cutoff(cutoff)?;
        Ok(Self {
            name: name.to_string(),
            params: PairParameters::Uniform(function),
            cutoff,
            max_atoms: None,
        })
    }

    /// Per-element parameters mixed for unlike pairs. Elements outside the list
    /// are reported as unsupported chemistry.
    pub fn per_element(name: &str, per_element: &[(Element, F)], cutoff: f64) -> Result<Self> {
        check_cutoff(cutoff)?;
        if per_element.is_empty() {
            return Err(CalcError::Configuration(format!(
                "potential '{}' defines no elements",
                name
            )));
        }
        let grid = InteractionGrid::from_mixing(per_element, |a: &F, b: &F| a.mix(b));
        Ok(Self {
            name: name.to_string(),
            params: PairParameters::PerElement(grid),
            cutoff,
            max_atoms: None,
        })
    }

    /// Refuse structures with more than `max_atoms` atoms.
    pub fn with_max_atoms(mut self, max_atoms: usize) -> Self {
        self.max_atoms = Some(max_atoms);
        self
    }

    pub fn cutoff(&self) -> f64 {
        self.cutoff
    }

    /// Parameter index of each site.
    fn resolve(&self, structure: &Structure) -> Result<Vec<usize>> {
        match &self.params {
            PairParameters::Uniform(_) => Ok(vec![0; structure.len()]),
            PairParameters::PerElement(grid) => structure
                .sites()
                .iter()
                .map(|site| {
                    grid.index_of(site.element).ok_or_else(|| {
                        CalcError::evaluation(
                            &self.name,
                            format!("element {} is not supported", site.element),
                        )
                    })
                })
                .collect(),
        }
    }

    fn pair(&self, a: usize, b: usize) -> &F {
        match &self.params {
            PairParameters::Uniform(f) => f,
            PairParameters::PerElement(grid) => grid.get(a, b),
        }
    }
}

fn check_cutoff(cutoff: f64) -> Result<()> {
    if cutoff.is_finite() && cutoff > 0.0 {
        Ok(())
    } else {
        Err(CalcError::Configuration(format!("invalid cutoff {}", cutoff)))
    }
}

impl<F: PairFunction> Potential for PairPotential<F> {
    fn name(&self) -> &str {
        &self.name
    }

    fn evaluate(&self, structure: &Structure) -> Result<Evaluation> {
        if let Some(max) = self.max_atoms {
            if structure.len() > max {
                return Err(CalcError::evaluation(
                    &self.name,
                    format!("{} atoms exceeds the limit of {}", structure.len(), max),
                ));
            }
        }

        let ids = self.resolve(structure)?;
        let lattice = structure.lattice();
        let frac = structure.frac_positions();
        let n = frac.len();
        let range = spatial::image_range(lattice, self.cutoff);
        let rc_sq = self.cutoff * self.cutoff;

        let mut energy = 0.0;
        let mut forces = vec![Vector3::zeros(); n];
        let mut virial = Matrix3::zeros();

        for i in 0..n {
            for j in i..n {
                let f = self.pair(ids[i], ids[j]);
                let (e_cut, _) = f.energy_derivative(self.cutoff);
                let d0 = spatial::minimum_image(&(frac[j] - frac[i]));

                for ta in -range[0]..=range[0] {
                    for tb in -range[1]..=range[1] {
                        for tc in -range[2]..=range[2] {
                            if i == j && ta == 0 && tb == 0 && tc == 0 {
                                continue;
                            }
                            let t = Vector3::new(ta as f64, tb as f64, tc as f64);
                            let d = lattice.to_cartesian(&(d0 + t));
                            let r_sq = d.norm_squared();
                            if r_sq >= rc_sq {
                                continue;
                            }
                            if r_sq < 1e-12 {
                                return Err(CalcError::evaluation(
                                    &self.name,
                                    format!("atoms {} and {} overlap", i, j),
                                ));
                            }

                            let r = r_sq.sqrt();
                            let (e, de) = f.energy_derivative(r);
                            // Self-image pairs are visited twice (T and -T)
                            let weight = if i == j { 0.5 } else { 1.0 };
                            energy += weight * (e - e_cut);
                            virial += (weight * de / r) * d * d.transpose();

                            if i != j {
                                let g = (de / r) * d;
                                forces[i] += g;
                                forces[j] -= g;
                            }
                        }
                    }
                }
            }
        }

        let stress = virial / lattice.volume();
        Evaluation { energy, forces, stress }.validated(&self.name, structure)
    }
}
