use nalgebra::{Matrix3, Vector3};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use crate::core::domain::{Lattice, Site, Structure};
use crate::core::spatial;
use crate::error::{CalcError, Result};

/// Closest approach (Å) accepted after moving atoms, unless overridden.
pub const MIN_SEPARATION: f64 = 0.5;

/// Reproducible RNG for perturbations.
pub fn seeded_rng(seed: u64) -> ChaCha8Rng {
    ChaCha8Rng::seed_from_u64(seed)
}

/// A composable perturbation builder. Every enabled step is applied in a
/// fixed order (strain, breathing, displacement, rattle, swap) and the
/// result is a new structure.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Perturber {
    /// Max random strain component (symmetric tensor)
    #[serde(default)]
    strain_intensity: Option<f64>,
    /// Isotropic scaling range
    #[serde(default)]
    breathing_intensity: Option<f64>,
    /// (max, min) length of a random-direction displacement per atom (Å)
    #[serde(default)]
    displacement: Option<(f64, f64)>,
    /// Max per-component displacement (Å)
    #[serde(default)]
    rattle_intensity: Option<f64>,
    /// Pairs of sites whose species are exchanged
    #[serde(default)]
    swap_count: Option<usize>,
    /// Closest approach allowed after displacement or rattle (Å)
    #[serde(default)]
    min_separation: Option<f64>,
}

impl Perturber {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn strain(mut self, max_component: f64) -> Self {
        self.strain_intensity = Some(max_component);
        self
    }

    pub fn breathing(mut self, intensity: f64) -> Self {
        self.breathing_intensity = Some(intensity);
        self
    }

    /// Moves every atom by a random vector whose length lies in
    /// [`min_distance`, `distance`].
    pub fn displace(mut self, distance: f64, min_distance: f64) -> Self {
        self.displacement = Some((distance, min_distance.min(distance)));
        self
    }

    pub fn rattle(mut self, max_dist: f64) -> Self {
        self.rattle_intensity = Some(max_dist);
        self
    }

    pub fn swap(mut self, count: usize) -> Self {
        self.swap_count = Some(count);
        self
    }

    pub fn min_separation(mut self, distance: f64) -> Self {
        self.min_separation = Some(distance);
        self
    }

    pub fn is_identity(&self) -> bool {
        *self == Self::default()
    }

    pub fn apply<R: Rng + ?Sized>(&self, structure: &Structure, rng: &mut R) -> Result<Structure> {
        let mut current = structure.clone();

        // 1. Strain
        if let Some(mag) = self.strain_intensity.filter(|m| *m > 0.0) {
            let mut eps = Matrix3::zeros();
            for i in 0..3 {
                for j in i..3 {
                    let e = rng.gen_range(-mag..mag);
                    eps[(i, j)] = e;
                    eps[(j, i)] = e;
                }
            }
            current = current.deformed(&(Matrix3::identity() + eps))?;
        }

        // 2. Breathing (Global Scaling)
        if let Some(mag) = self.breathing_intensity.filter(|m| *m > 0.0) {
            let scale = 1.0 + rng.gen_range(-mag..mag);
            current = current.deformed(&Matrix3::from_diagonal_element(scale))?;
        }

        let mut cart = current.cart_positions();

        // 3. Fixed-length displacement
        if let Some((max, min)) = self.displacement.filter(|(m, _)| *m > 0.0) {
            for r in cart.iter_mut() {
                let length = if max > min { rng.gen_range(min..max) } else { max };
                *r += random_unit_vector(rng) * length;
            }
        }

        // 4. Rattle
        if let Some(mag) = self.rattle_intensity.filter(|m| *m > 0.0) {
            for r in cart.iter_mut() {
                r.x += rng.gen_range(-mag..mag);
                r.y += rng.gen_range(-mag..mag);
                r.z += rng.gen_range(-mag..mag);
            }
        }

        let mut moved = current.with_cart_positions(&cart)?;

        let atoms_moved = self.displacement.is_some_and(|(m, _)| m > 0.0)
            || self.rattle_intensity.is_some_and(|m| m > 0.0);
        if atoms_moved {
            let min = self.min_separation.unwrap_or(MIN_SEPARATION);
            if !spatial::check_overlap(&moved, min) {
                return Err(CalcError::InvalidStructure(format!(
                    "perturbation of {} left atoms {:.3} Å apart (minimum {:.3} Å)",
                    structure.label(),
                    spatial::min_interatomic_distance(&moved),
                    min
                )));
            }
        }

        // 5. Swap
        if let Some(count) = self.swap_count {
            let n = moved.len();
            if n >= 2 && count > 0 {
                let mut sites: Vec<Site> = moved.sites().to_vec();
                for _ in 0..count {
                    let i = rng.gen_range(0..n);
                    let j = rng.gen_range(0..n);
                    if i != j {
                        let tmp = sites[i].element;
                        sites[i].element = sites[j].element;
                        sites[j].element = tmp;
                    }
                }
                moved = Structure::from_sites(moved.lattice().clone(), sites)?
                    .with_label(structure.label());
            }
        }

        Ok(moved)
    }
}

fn random_unit_vector<R: Rng + ?Sized>(rng: &mut R) -> Vector3<f64> {
    loop {
        let v = Vector3::new(
            rng.gen_range(-1.0..1.0),
            rng.gen_range(-1.0..1.0),
            rng.gen_range(-1.0..1.0),
        );
        let n = v.norm();
        if n > 1e-3 && n <= 1.0 {
            return v / n;
        }
    }
}

// --- Supercells ---

/// A supercell together with the origin of each of its atoms.
#[derive(Debug, Clone)]
pub struct Supercell {
    pub structure: Structure,
    /// Integer matrix whose columns express the supercell vectors in the parent basis.
    pub matrix: Matrix3<i32>,
    /// Parent atom of each supercell atom.
    pub parent_index: Vec<usize>,
    /// Parent-lattice translation of each supercell atom.
    pub translation: Vec<Vector3<i32>>,
}

impl Supercell {
    /// Number of parent cells contained in the supercell.
    pub fn multiplicity(&self) -> usize {
        self.translation.len() / self.parent_len()
    }

    fn parent_len(&self) -> usize {
        self.parent_index.iter().max().map_or(0, |m| m + 1)
    }
}

pub fn diagonal_matrix(repeats: [i32; 3]) -> Matrix3<i32> {
    Matrix3::new(repeats[0], 0, 0, 0, repeats[1], 0, 0, 0, repeats[2])
}

/// Builds the supercell with lattice `L * S`.
///
/// Atoms are ordered by translation, the zero translation first, then by
/// parent index, so the first `parent.len()` atoms are the parent's own.
pub fn make_supercell(parent: &Structure, matrix: &Matrix3<i32>) -> Result<Supercell> {
    let s_f = matrix.map(|x| x as f64);
    let det = s_f.determinant().round() as i64;
    if det <= 0 {
        return Err(CalcError::Configuration(format!(
            "supercell matrix must have a positive determinant, got {}",
            det
        )));
    }
    let s_inv = s_f
        .try_inverse()
        .ok_or_else(|| CalcError::Configuration("singular supercell matrix".to_string()))?;

    // Bounding box of the supercell corners in parent fractional coordinates
    let mut lo = Vector3::repeat(i32::MAX);
    let mut hi = Vector3::repeat(i32::MIN);
    for corner in 0..8 {
        let c = Vector3::new((corner & 1) as f64, ((corner >> 1) & 1) as f64, ((corner >> 2) & 1) as f64);
        let p = s_f * c;
        for k in 0..3 {
            lo[k] = lo[k].min(p[k].floor() as i32);
            hi[k] = hi[k].max(p[k].ceil() as i32);
        }
    }

    let tol = 1e-9;
    let mut translations = Vec::with_capacity(det as usize);
    for a in lo.x..=hi.x {
        for b in lo.y..=hi.y {
            for c in lo.z..=hi.z {
                let t = Vector3::new(a, b, c);
                let f = s_inv * t.map(|x| x as f64);
                if f.iter().all(|&x| x > -tol && x < 1.0 - tol) {
                    translations.push(t);
                }
            }
        }
    }
    if translations.len() != det as usize {
        return Err(CalcError::Numerical(format!(
            "found {} lattice points for a supercell of multiplicity {}",
            translations.len(),
            det
        )));
    }
    translations.sort_by_key(|t| (*t != Vector3::zeros(), t.x, t.y, t.z));

    let lattice = Lattice::from_matrix(parent.lattice().vectors() * s_f)?;

    let mut sites = Vec::with_capacity(translations.len() * parent.len());
    let mut parent_index = Vec::with_capacity(sites.capacity());
    let mut translation = Vec::with_capacity(sites.capacity());
    for t in &translations {
        for (i, site) in parent.sites().iter().enumerate() {
            let frac = spatial::wrap_fractional(&(s_inv * (site.frac + t.map(|x| x as f64))));
            sites.push(Site {
                element: site.element,
                frac,
                properties: site.properties.clone(),
            });
            parent_index.push(i);
            translation.push(*t);
        }
    }

    let structure = Structure::from_sites(lattice, sites)?.with_label(parent.label());
    Ok(Supercell {
        structure,
        matrix: *matrix,
        parent_index,
        translation,
    })
}
