use std::collections::BTreeMap;

use nalgebra::{Matrix3, Vector3};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::chemistry::Element;
use crate::error::{CalcError, Result};

// --- Constants ---

/// Smallest cell volume (Å³) accepted as non-degenerate.
pub const MIN_CELL_VOLUME: f64 = 1e-6;

// --- Lattice ---

/// Periodic cell. Columns of `vectors` are the a, b, c lattice vectors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "LatticeRepr", into = "LatticeRepr")]
pub struct Lattice {
    vectors: Matrix3<f64>,
    inverse: Matrix3<f64>, // Precomputed for fractional conversion
}

/// On-disk form: one row per lattice vector.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct LatticeRepr {
    vectors: [[f64; 3]; 3],
}

impl TryFrom<LatticeRepr> for Lattice {
    type Error = CalcError;

    fn try_from(repr: LatticeRepr) -> Result<Self> {
        Lattice::from_rows(repr.vectors)
    }
}

impl From<Lattice> for LatticeRepr {
    fn from(l: Lattice) -> Self {
        let m = l.vectors;
        LatticeRepr {
            vectors: [
                [m[(0, 0)], m[(1, 0)], m[(2, 0)]],
                [m[(0, 1)], m[(1, 1)], m[(2, 1)]],
                [m[(0, 2)], m[(1, 2)], m[(2, 2)]],
            ],
        }
    }
}

/// Lengths (Å), angles (degrees) and volume (Å³) of a cell.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatticeParameters {
    pub a: f64,
    pub b: f64,
    pub c: f64,
    pub alpha: f64,
    pub beta: f64,
    pub gamma: f64,
    pub volume: f64,
}

impl Lattice {
    pub fn new(a: Vector3<f64>, b: Vector3<f64>, c: Vector3<f64>) -> Result<Self> {
        Self::from_matrix(Matrix3::from_columns(&[a, b, c]))
    }

    /// Builds a lattice from a column matrix, rejecting degenerate or left-handed cells.
    pub fn from_matrix(vectors: Matrix3<f64>) -> Result<Self> {
        if vectors.iter().any(|x| !x.is_finite()) {
            return Err(CalcError::InvalidStructure(
                "lattice contains non-finite entries".to_string(),
            ));
        }
        let det = vectors.determinant();
        if det <= MIN_CELL_VOLUME {
            return Err(CalcError::InvalidStructure(format!(
                "lattice volume must be positive, got {:.3e}",
                det
            )));
        }
        let inverse = vectors.try_inverse().ok_or_else(|| {
            CalcError::InvalidStructure("lattice matrix is not invertible".to_string())
        })?;
        Ok(Self { vectors, inverse })
    }

    /// Rows are the a, b, c vectors.
    pub fn from_rows(rows: [[f64; 3]; 3]) -> Result<Self> {
        Self::new(
            Vector3::from(rows[0]),
            Vector3::from(rows[1]),
            Vector3::from(rows[2]),
        )
    }

    /// Standard setting: a along x, b in the xy plane. Angles in degrees.
    pub fn from_parameters(a: f64, b: f64, c: f64, alpha: f64, beta: f64, gamma: f64) -> Result<Self> {
        let (cos_alpha, cos_beta) = (alpha.to_radians().cos(), beta.to_radians().cos());
        let (sin_gamma, cos_gamma) = gamma.to_radians().sin_cos();

        let c1 = c * cos_beta;
        let c2 = c * (cos_alpha - cos_beta * cos_gamma) / sin_gamma;
        let c3_sq = c * c - c1 * c1 - c2 * c2;
        if c3_sq <= 0.0 {
            return Err(CalcError::InvalidStructure(format!(
                "lattice angles ({}, {}, {}) do not form a cell",
                alpha, beta, gamma
            )));
        }

        Self::new(
            Vector3::new(a, 0.0, 0.0),
            Vector3::new(b * cos_gamma, b * sin_gamma, 0.0),
            Vector3::new(c1, c2, c3_sq.sqrt()),
        )
    }

    pub fn cubic(a: f64) -> Result<Self> {
        Self::from_matrix(Matrix3::from_diagonal_element(a))
    }

    pub fn vectors(&self) -> &Matrix3<f64> {
        &self.vectors
    }

    pub fn inverse(&self) -> &Matrix3<f64> {
        &self.inverse
    }

    /// Lattice vector `i` (0 = a, 1 = b, 2 = c).
    pub fn vector(&self, i: usize) -> Vector3<f64> {
        self.vectors.column(i).into_owned()
    }

    pub fn volume(&self) -> f64 {
        self.vectors.determinant()
    }

    pub fn to_fractional(&self, cart: &Vector3<f64>) -> Vector3<f64> {
        self.inverse * cart
    }

    pub fn to_cartesian(&self, frac: &Vector3<f64>) -> Vector3<f64> {
        self.vectors * frac
    }

    /// Reciprocal vectors as columns, without the 2π factor (a_i · b_j = δ_ij).
    pub fn reciprocal(&self) -> Matrix3<f64> {
        self.inverse.transpose()
    }

    /// Distance between adjacent lattice planes spanned by the other two vectors.
    pub fn plane_spacings(&self) -> [f64; 3] {
        let r = self.reciprocal();
        [
            1.0 / r.column(0).norm(),
            1.0 / r.column(1).norm(),
            1.0 / r.column(2).norm(),
        ]
    }

    pub fn parameters(&self) -> LatticeParameters {
        let (va, vb, vc) = (self.vector(0), self.vector(1), self.vector(2));
        let (a, b, c) = (va.norm(), vb.norm(), vc.norm());
        LatticeParameters {
            a,
            b,
            c,
            alpha: (vb.dot(&vc) / (b * c)).acos().to_degrees(),
            beta: (va.dot(&vc) / (a * c)).acos().to_degrees(),
            gamma: (va.dot(&vb) / (a * b)).acos().to_degrees(),
            volume: self.volume(),
        }
    }

    /// Applies a deformation gradient to every lattice vector.
    pub fn deformed(&self, deformation: &Matrix3<f64>) -> Result<Self> {
        Self::from_matrix(deformation * self.vectors)
    }
}

// --- Sites & Structures ---

/// One atom of a structure, in fractional coordinates of the owning lattice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Site {
    pub element: Element,
    pub frac: Vector3<f64>,
    /// Free-form per-site data (magnetic moments, selective-dynamics flags, ...).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, serde_json::Value>,
}

impl Site {
    pub fn new(element: Element, frac: Vector3<f64>) -> Self {
        Self {
            element,
            frac,
            properties: BTreeMap::new(),
        }
    }
}

/// Immutable snapshot of a periodic atomic structure.
///
/// Every transformation returns a new structure with a fresh id; nothing in the
/// crate mutates a structure after construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "StructureRepr")]
pub struct Structure {
    id: Uuid,
    label: String,
    lattice: Lattice,
    sites: Vec<Site>,
}

#[derive(Deserialize)]
struct StructureRepr {
    #[serde(default = "Uuid::new_v4")]
    id: Uuid,
    #[serde(default)]
    label: String,
    lattice: Lattice,
    sites: Vec<Site>,
}

impl TryFrom<StructureRepr> for Structure {
    type Error = CalcError;

    fn try_from(repr: StructureRepr) -> Result<Self> {
        let mut s = Structure::from_sites(repr.lattice, repr.sites)?;
        s.id = repr.id;
        s.label = repr.label;
        Ok(s)
    }
}

impl Structure {
    pub fn from_sites(lattice: Lattice, sites: Vec<Site>) -> Result<Self> {
        if sites.is_empty() {
            return Err(CalcError::InvalidStructure("structure has no sites".to_string()));
        }
        if let Some(i) = sites
            .iter()
            .position(|s| s.frac.iter().any(|x| !x.is_finite()))
        {
            return Err(CalcError::InvalidStructure(format!(
                "site {} has non-finite coordinates",
                i
            )));
        }
        Ok(Self {
            id: Uuid::new_v4(),
            label: String::new(),
            lattice,
            sites,
        })
    }

    /// Builds a structure from parallel species and fractional coordinate lists.
    pub fn new(lattice: Lattice, elements: Vec<Element>, frac: Vec<Vector3<f64>>) -> Result<Self> {
        if elements.len() != frac.len() {
            return Err(CalcError::InvalidStructure(format!(
                "{} species for {} coordinates",
                elements.len(),
                frac.len()
            )));
        }
        let sites = elements
            .into_iter()
            .zip(frac)
            .map(|(e, f)| Site::new(e, f))
            .collect();
        Self::from_sites(lattice, sites)
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    // --- Accessors ---

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn lattice(&self) -> &Lattice {
        &self.lattice
    }

    pub fn sites(&self) -> &[Site] {
        &self.sites
    }

    pub fn len(&self) -> usize {
        self.sites.len()
    }

    /// Always false for a validated structure; kept for API symmetry with `len`.
    pub fn is_empty(&self) -> bool {
        self.sites.is_empty()
    }

    pub fn elements(&self) -> Vec<Element> {
        self.sites.iter().map(|s| s.element).collect()
    }

    pub fn masses(&self) -> Vec<f64> {
        self.sites.iter().map(|s| s.element.mass()).collect()
    }

    pub fn frac_positions(&self) -> Vec<Vector3<f64>> {
        self.sites.iter().map(|s| s.frac).collect()
    }

    pub fn cart_positions(&self) -> Vec<Vector3<f64>> {
        self.sites
            .iter()
            .map(|s| self.lattice.to_cartesian(&s.frac))
            .collect()
    }

    pub fn volume(&self) -> f64 {
        self.lattice.volume()
    }

    /// Element counts, ordered by atomic number.
    pub fn composition(&self) -> BTreeMap<Element, usize> {
        let mut counts = BTreeMap::new();
        for site in &self.sites {
            *counts.entry(site.element).or_insert(0) += 1;
        }
        counts
    }

    /// Formula such as "Na4Cl4"; counts of one are omitted.
    pub fn formula(&self) -> String {
        self.composition()
            .into_iter()
            .map(|(el, count)| {
                if count == 1 {
                    el.symbol().to_string()
                } else {
                    format!("{}{}", el.symbol(), count)
                }
            })
            .collect::<Vec<_>>()
            .join("")
    }

    /// Number of formula units (gcd of element counts).
    pub fn formula_units(&self) -> usize {
        self.composition().values().fold(0, |acc, &n| gcd(acc, n))
    }

    // --- Derived structures ---

    fn derive(&self, lattice: Lattice, frac: Vec<Vector3<f64>>) -> Result<Self> {
        debug_assert_eq!(frac.len(), self.sites.len());
        let sites = self
            .sites
            .iter()
            .zip(frac)
            .map(|(site, f)| Site {
                element: site.element,
                frac: f,
                properties: site.properties.clone(),
            })
            .collect();
        Ok(Structure::from_sites(lattice, sites)?.with_label(self.label.clone()))
    }

    /// Same lattice and species, new fractional coordinates.
    pub fn with_frac_positions(&self, frac: Vec<Vector3<f64>>) -> Result<Self> {
        self.check_count(frac.len())?;
        self.derive(self.lattice.clone(), frac)
    }

    /// Same lattice and species, new cartesian coordinates.
    pub fn with_cart_positions(&self, cart: &[Vector3<f64>]) -> Result<Self> {
        self.check_count(cart.len())?;
        let frac = cart.iter().map(|r| self.lattice.to_fractional(r)).collect();
        self.derive(self.lattice.clone(), frac)
    }

    /// New lattice with the fractional coordinates carried over unchanged.
    pub fn with_lattice(&self, lattice: Lattice) -> Result<Self> {
        self.derive(lattice, self.frac_positions())
    }

    /// Homogeneous deformation: lattice becomes `F * L`, fractional coordinates kept.
    pub fn deformed(&self, deformation: &Matrix3<f64>) -> Result<Self> {
        self.with_lattice(self.lattice.deformed(deformation)?)
    }

    /// All fractional coordinates wrapped into [0, 1).
    pub fn wrapped(&self) -> Result<Self> {
        let frac = self
            .sites
            .iter()
            .map(|s| crate::core::spatial::wrap_fractional(&s.frac))
            .collect();
        self.derive(self.lattice.clone(), frac)
    }

    fn check_count(&self, n: usize) -> Result<()> {
        if n != self.sites.len() {
            return Err(CalcError::InvalidStructure(format!(
                "expected {} positions, got {}",
                self.sites.len(),
                n
            )));
        }
        Ok(())
    }
}

fn gcd(a: usize, b: usize) -> usize {
    if b == 0 {
        a
    } else {
        gcd(b, a % b)
    }
}
