//! Harmonic statistical mechanics over phonon modes.

use serde::{Deserialize, Serialize};

use crate::error::{CalcError, Result};

/// Planck constant in eV per THz.
pub const THZ_TO_EV: f64 = 4.135667696e-3;
/// Boltzmann constant (eV/K).
pub const KB_EV: f64 = 8.617333262e-5;
/// eV per cell to kJ per mole of cells.
pub const EV_TO_KJ_PER_MOL: f64 = 96.48533212;

/// Thermodynamic functions at one temperature, per mole of unit cells.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ThermalPoint {
    /// K
    pub temperature: f64,
    /// Helmholtz free energy, zero-point energy included (kJ/mol)
    pub free_energy: f64,
    /// J/K/mol
    pub entropy: f64,
    /// Constant-volume heat capacity (J/K/mol)
    pub heat_capacity: f64,
    /// kJ/mol
    pub internal_energy: f64,
}

/// Evenly spaced temperatures from `t_min` to `t_max` inclusive.
pub fn temperature_range(t_min: f64, t_max: f64, t_step: f64) -> Result<Vec<f64>> {
    if t_min < 0.0 || t_max < t_min || t_step <= 0.0 {
        return Err(CalcError::Configuration(format!(
            "invalid temperature range {}..{} step {}",
            t_min, t_max, t_step
        )));
    }
    let n = ((t_max - t_min) / t_step + 1e-9).floor() as usize;
    Ok((0..=n).map(|i| t_min + i as f64 * t_step).collect())
}

/// Sums mode contributions over a weighted q-point set.
///
/// `frequencies[q]` holds the mode frequencies (THz) at q-point `q`. Modes
/// below `cutoff_frequency`, imaginary ones included, are skipped. Results are
/// normalized by the total weight, i.e. reported per unit cell.
pub fn thermal_properties(
    frequencies: &[Vec<f64>],
    weights: &[f64],
    temperatures: &[f64],
    cutoff_frequency: f64,
) -> Vec<ThermalPoint> {
    let total_weight: f64 = weights.iter().sum();
    temperatures
        .iter()
        .map(|&t| {
            let mut acc = [0.0; 4]; // F, S, Cv, U in eV and eV/K
            for (freqs, &w) in frequencies.iter().zip(weights) {
                for &nu in freqs.iter().filter(|&&nu| nu > cutoff_frequency) {
                    let m = mode_functions(nu * THZ_TO_EV, t);
                    for (a, v) in acc.iter_mut().zip(m.iter()) {
                        *a += w * v;
                    }
                }
            }
            let norm = if total_weight > 0.0 { total_weight } else { 1.0 };
            ThermalPoint {
                temperature: t,
                free_energy: acc[0] / norm * EV_TO_KJ_PER_MOL,
                entropy: acc[1] / norm * EV_TO_KJ_PER_MOL * 1000.0,
                heat_capacity: acc[2] / norm * EV_TO_KJ_PER_MOL * 1000.0,
                internal_energy: acc[3] / norm * EV_TO_KJ_PER_MOL,
            }
        })
        .collect()
}

/// Free energy, entropy, heat capacity and internal energy of one oscillator.
fn mode_functions(energy: f64, t: f64) -> [f64; 4] {
    let zero_point = 0.5 * energy;
    if t <= 0.0 {
        return [zero_point, 0.0, 0.0, zero_point];
    }
    let kt = KB_EV * t;
    let x = energy / kt;
    // Frozen-out modes contribute only their zero-point energy
    if x > 500.0 {
        return [zero_point, 0.0, 0.0, zero_point];
    }
    let expm1 = x.exp_m1();
    let free = zero_point + kt * (-(-x).exp_m1()).ln();
    let entropy = -KB_EV * (-(-x).exp_m1()).ln() + energy / (t * expm1);
    let heat_capacity = KB_EV * x * x * x.exp() / (expm1 * expm1);
    let internal = zero_point + energy / expm1;
    [free, entropy, heat_capacity, internal]
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    const GAS_CONSTANT: f64 = 8.314462618;

    #[test]
    fn temperature_range_includes_both_ends() {
        let t = temperature_range(0.0, 100.0, 10.0).unwrap();
        assert_eq!(t.len(), 11);
        assert_eq!(t[10], 100.0);
        assert!(temperature_range(10.0, 0.0, 1.0).is_err());
    }

    #[test]
    fn zero_temperature_leaves_zero_point_energy() {
        let p = thermal_properties(&[vec![5.0]], &[1.0], &[0.0], 0.0)[0];
        assert_relative_eq!(p.free_energy, 0.5 * 5.0 * THZ_TO_EV * EV_TO_KJ_PER_MOL, epsilon = 1e-12);
        assert_eq!(p.heat_capacity, 0.0);
        assert_eq!(p.entropy, 0.0);
    }

    #[test]
    fn heat_capacity_approaches_classical_limit() {
        let freqs = vec![vec![1.0, 2.0, 3.0]];
        let p = thermal_properties(&freqs, &[1.0], &[5000.0], 0.0)[0];
        assert_relative_eq!(p.heat_capacity, 3.0 * GAS_CONSTANT, max_relative = 1e-3);
    }

    #[test]
    fn free_energy_is_internal_energy_minus_ts() {
        let freqs = vec![vec![2.0, 4.0], vec![3.0, 6.0]];
        let p = thermal_properties(&freqs, &[1.0, 3.0], &[300.0], 0.0)[0];
        assert_relative_eq!(
            p.free_energy,
            p.internal_energy - p.temperature * p.entropy / 1000.0,
            epsilon = 1e-9
        );
    }

    #[test]
    fn soft_and_imaginary_modes_are_skipped() {
        let p = thermal_properties(&[vec![-1.0, 0.0, 1e-4]], &[1.0], &[300.0], 1e-3)[0];
        assert_eq!(p.heat_capacity, 0.0);
    }
}
