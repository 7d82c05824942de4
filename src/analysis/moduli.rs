//! Isotropic moduli from a 6x6 Voigt stiffness matrix.

use nalgebra::Matrix6;
use serde::{Deserialize, Serialize};

/// Conversion factor from eV/Å³ to GPa, for presentation.
pub const EV_PER_A3_TO_GPA: f64 = 160.21766208;

/// Voigt, Reuss and Hill averages, in the units of the stiffness matrix.
///
/// The Voigt bounds always exist. Everything that needs the compliance
/// matrix is `None` when the stiffness matrix is singular.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ElasticModuli {
    pub k_voigt: f64,
    pub g_voigt: f64,
    pub k_reuss: Option<f64>,
    pub g_reuss: Option<f64>,
    pub k_vrh: Option<f64>,
    pub g_vrh: Option<f64>,
    pub youngs_modulus: Option<f64>,
    pub poisson_ratio: Option<f64>,
    /// Universal anisotropy index, zero for an isotropic solid.
    pub universal_anisotropy: Option<f64>,
}

impl ElasticModuli {
    /// Same moduli scaled by `factor` (e.g. `EV_PER_A3_TO_GPA`); ratios untouched.
    pub fn scaled(&self, factor: f64) -> Self {
        let scale = |v: Option<f64>| v.map(|x| x * factor);
        Self {
            k_voigt: self.k_voigt * factor,
            g_voigt: self.g_voigt * factor,
            k_reuss: scale(self.k_reuss),
            g_reuss: scale(self.g_reuss),
            k_vrh: scale(self.k_vrh),
            g_vrh: scale(self.g_vrh),
            youngs_modulus: scale(self.youngs_modulus),
            ..*self
        }
    }

    /// False when the Reuss bound (and with it the Hill average) is missing.
    pub fn has_reuss(&self) -> bool {
        self.k_reuss.is_some() && self.g_reuss.is_some()
    }
}

/// Voigt-Reuss-Hill averages of `c`.
pub fn voigt_reuss_hill(c: &Matrix6<f64>) -> ElasticModuli {
    let diag = |m: &Matrix6<f64>| m[(0, 0)] + m[(1, 1)] + m[(2, 2)];
    let off = |m: &Matrix6<f64>| m[(0, 1)] + m[(1, 2)] + m[(0, 2)];
    let shear = |m: &Matrix6<f64>| m[(3, 3)] + m[(4, 4)] + m[(5, 5)];

    let k_voigt = (diag(c) + 2.0 * off(c)) / 9.0;
    let g_voigt = (diag(c) - off(c) + 3.0 * shear(c)) / 15.0;

    let reuss = c.try_inverse().and_then(|s| {
        let k_reuss_inv = diag(&s) + 2.0 * off(&s);
        let g_reuss_inv = 4.0 * diag(&s) - 4.0 * off(&s) + 3.0 * shear(&s);
        if k_reuss_inv.abs() < f64::EPSILON || g_reuss_inv.abs() < f64::EPSILON {
            return None;
        }
        Some((1.0 / k_reuss_inv, 15.0 / g_reuss_inv))
    });

    let Some((k_reuss, g_reuss)) = reuss else {
        return ElasticModuli {
            k_voigt,
            g_voigt,
            k_reuss: None,
            g_reuss: None,
            k_vrh: None,
            g_vrh: None,
            youngs_modulus: None,
            poisson_ratio: None,
            universal_anisotropy: None,
        };
    };

    let k_vrh = 0.5 * (k_voigt + k_reuss);
    let g_vrh = 0.5 * (g_voigt + g_reuss);
    let denom = 3.0 * k_vrh + g_vrh;
    let (youngs_modulus, poisson_ratio) = if denom.abs() > f64::EPSILON {
        (
            Some(9.0 * k_vrh * g_vrh / denom),
            Some((3.0 * k_vrh - 2.0 * g_vrh) / (2.0 * denom)),
        )
    } else {
        (None, None)
    };

    ElasticModuli {
        k_voigt,
        g_voigt,
        k_reuss: Some(k_reuss),
        g_reuss: Some(g_reuss),
        k_vrh: Some(k_vrh),
        g_vrh: Some(g_vrh),
        youngs_modulus,
        poisson_ratio,
        universal_anisotropy: Some(5.0 * g_voigt / g_reuss + k_voigt / k_reuss - 6.0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn cubic(c11: f64, c12: f64, c44: f64) -> Matrix6<f64> {
        let mut c = Matrix6::zeros();
        for i in 0..3 {
            for j in 0..3 {
                c[(i, j)] = if i == j { c11 } else { c12 };
            }
            c[(i + 3, i + 3)] = c44;
        }
        c
    }

    #[test]
    fn isotropic_bounds_coincide() {
        // Isotropic: C44 = (C11 - C12) / 2
        let m = voigt_reuss_hill(&cubic(3.0, 1.0, 1.0));
        assert_relative_eq!(m.k_voigt, m.k_reuss.unwrap(), epsilon = 1e-12);
        assert_relative_eq!(m.g_voigt, m.g_reuss.unwrap(), epsilon = 1e-12);
        assert_relative_eq!(m.k_vrh.unwrap(), 5.0 / 3.0, epsilon = 1e-12);
        assert_relative_eq!(m.g_vrh.unwrap(), 1.0, epsilon = 1e-12);
        assert_relative_eq!(m.universal_anisotropy.unwrap(), 0.0, epsilon = 1e-12);
        assert_relative_eq!(m.poisson_ratio.unwrap(), 0.25, epsilon = 1e-12);
    }

    #[test]
    fn anisotropic_reuss_is_below_voigt() {
        let m = voigt_reuss_hill(&cubic(168.4, 121.4, 75.4));
        assert!(m.g_reuss.unwrap() < m.g_voigt);
        assert!(m.universal_anisotropy.unwrap() > 0.0);
        assert_relative_eq!(m.k_vrh.unwrap(), (168.4 + 2.0 * 121.4) / 3.0, epsilon = 1e-9);
    }

    #[test]
    fn singular_matrix_keeps_voigt_bounds() {
        let mut c = cubic(3.0, 1.0, 1.0);
        c[(5, 5)] = 0.0;
        let m = voigt_reuss_hill(&c);
        assert!(!m.has_reuss());
        assert_relative_eq!(m.k_voigt, 5.0 / 3.0, epsilon = 1e-12);
        assert_relative_eq!(m.g_voigt, 0.8, epsilon = 1e-12);
        assert_eq!(m.k_vrh, None);
        assert_eq!(m.poisson_ratio, None);

        let zero = voigt_reuss_hill(&Matrix6::zeros());
        assert_eq!((zero.k_voigt, zero.g_voigt), (0.0, 0.0));
        assert!(!zero.has_reuss());
    }

    #[test]
    fn scaling_keeps_ratios() {
        let m = voigt_reuss_hill(&cubic(0.1, 0.05, 0.03));
        let gpa = m.scaled(EV_PER_A3_TO_GPA);
        assert_relative_eq!(gpa.k_vrh.unwrap(), m.k_vrh.unwrap() * EV_PER_A3_TO_GPA);
        assert_eq!(gpa.poisson_ratio, m.poisson_ratio);
    }
}
