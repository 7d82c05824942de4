use log::{debug, info, warn};
use nalgebra::{Matrix3, Vector3};
use serde::{Deserialize, Serialize};

use crate::core::domain::{Lattice, Site, Structure};
use crate::engine::potential::Potential;
use crate::error::{CalcError, ConvergenceWarning, Result};
use crate::solvers::relax::{relax_or_evaluate, RelaxConfig};
use crate::solvers::{CalculationOutput, PropertyCalculator};

/// eV/Å² to J/m².
pub const EV_PER_A2_TO_J_PER_M2: f64 = 16.02176634;

/// Atomic planes closer than this along the normal (Å) are one plane.
const PLANE_TOLERANCE: f64 = 0.1;

/// Which of the distinct atomic planes of the oriented cell start a slab.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationPolicy {
    /// One slab per distinct termination.
    #[default]
    All,
    /// Only the slab starting at the lowest plane.
    First,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SurfaceConfig {
    pub miller: [i32; 3],
    /// Minimum slab thickness along the surface normal (Å).
    pub min_slab_size: f64,
    /// Minimum vacuum between periodic slab images (Å).
    pub min_vacuum_size: f64,
    /// Repeats of the in-plane surface cell.
    pub in_plane_supercell: [usize; 2],
    pub terminations: TerminationPolicy,
    /// Put the slab in the middle of the cell along c.
    pub center_slab: bool,
    pub relax_bulk: bool,
    pub relax_slab: bool,
    /// Shared settings; the bulk also relaxes its cell, slabs keep theirs fixed.
    pub relax: RelaxConfig,
}

impl Default for SurfaceConfig {
    fn default() -> Self {
        Self {
            miller: [1, 0, 0],
            min_slab_size: 10.0,
            min_vacuum_size: 20.0,
            in_plane_supercell: [1, 1],
            terminations: TerminationPolicy::All,
            center_slab: true,
            relax_bulk: true,
            relax_slab: true,
            relax: RelaxConfig::default(),
        }
    }
}

impl SurfaceConfig {
    fn validate(&self) -> Result<()> {
        if self.miller == [0, 0, 0] {
            return Err(CalcError::Configuration("Miller index (000) is not a plane".to_string()));
        }
        if self.min_slab_size <= 0.0 || self.min_vacuum_size < 0.0 {
            return Err(CalcError::Configuration(format!(
                "slab size {} and vacuum {} must be positive",
                self.min_slab_size, self.min_vacuum_size
            )));
        }
        if self.in_plane_supercell.contains(&0) {
            return Err(CalcError::Configuration("in-plane supercell has a zero repeat".to_string()));
        }
        Ok(())
    }
}

/// Bulk cell re-expressed with a and b in the (hkl) plane and c crossing it once.
#[derive(Debug, Clone)]
pub struct OrientedCell {
    pub structure: Structure,
    /// Columns are the new a, b, c in the original lattice basis (unimodular).
    pub basis: Matrix3<i32>,
    /// Unit normal of the plane (cartesian).
    pub normal: Vector3<f64>,
    /// Spacing of equivalent planes (Å).
    pub spacing: f64,
}

/// A candidate slab before any energy evaluation.
#[derive(Debug, Clone)]
pub struct Slab {
    pub structure: Structure,
    pub termination: usize,
    /// Fractional c offset of the bottom plane in the oriented cell.
    pub shift: f64,
    pub thickness: f64,
    pub area: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlabResult {
    pub termination: usize,
    pub shift: f64,
    pub structure: Structure,
    pub energy: f64,
    pub area: f64,
    pub thickness: f64,
    /// eV/Å²
    pub surface_energy: f64,
    /// Slab composition is a whole multiple of the bulk composition.
    pub stoichiometric: bool,
    pub iterations: usize,
    pub converged: bool,
}

impl SlabResult {
    pub fn surface_energy_j_per_m2(&self) -> f64 {
        self.surface_energy * EV_PER_A2_TO_J_PER_M2
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SurfaceResult {
    pub miller: [i32; 3],
    pub bulk: Structure,
    pub bulk_energy_per_atom: f64,
    pub slabs: Vec<SlabResult>,
    pub warnings: Vec<ConvergenceWarning>,
}

impl SurfaceResult {
    /// Slab with the lowest surface energy.
    pub fn lowest(&self) -> Option<&SlabResult> {
        self.slabs
            .iter()
            .min_by(|a, b| a.surface_energy.total_cmp(&b.surface_energy))
    }
}

impl CalculationOutput for SurfaceResult {
    fn converged(&self) -> bool {
        self.warnings.is_empty()
    }

    fn warnings(&self) -> Vec<ConvergenceWarning> {
        self.warnings.clone()
    }
}

/// Cleaves slabs from a bulk crystal and computes
/// γ = (E_slab − N_slab · E_bulk/atom) / (2A), assuming two equivalent surfaces.
#[derive(Debug, Clone, Default)]
pub struct SurfaceEnergyEngine {
    config: SurfaceConfig,
}

impl SurfaceEnergyEngine {
    pub fn new(config: SurfaceConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SurfaceConfig {
        &self.config
    }

    /// Candidate slabs of `bulk`, one per termination allowed by the policy.
    pub fn generate_slabs(&self, bulk: &Structure) -> Result<Vec<Slab>> {
        let cfg = &self.config;
        cfg.validate()?;
        let cell = oriented_cell(bulk, cfg.miller)?;
        let planes = plane_offsets(&cell);
        let planes = match cfg.terminations {
            TerminationPolicy::All => planes,
            TerminationPolicy::First => planes.into_iter().take(1).collect(),
        };
        debug!(
            "{:?}: plane spacing {:.3} Å, {} termination(s)",
            cfg.miller,
            cell.spacing,
            planes.len()
        );
        planes
            .iter()
            .enumerate()
            .map(|(t, &shift)| self.build_slab(bulk, &cell, t, shift))
            .collect()
    }

    fn build_slab(&self, bulk: &Structure, cell: &OrientedCell, termination: usize, shift: f64) -> Result<Slab> {
        let cfg = &self.config;
        let lattice = cell.structure.lattice();
        let (a, b, c) = (lattice.vector(0), lattice.vector(1), lattice.vector(2));
        let d = cell.spacing;

        let n_cells = ((cfg.min_slab_size / d) - 1e-9).ceil().max(1.0) as usize;
        let thickness = n_cells as f64 * d;
        let [na, nb] = cfg.in_plane_supercell;
        let c_length = thickness + cfg.min_vacuum_size;
        let slab_lattice = Lattice::new(a * na as f64, b * nb as f64, cell.normal * c_length)?;

        let margin = PLANE_TOLERANCE / d;
        let mut sites = Vec::with_capacity(n_cells * na * nb * cell.structure.len());
        for k in 0..n_cells {
            for ia in 0..na {
                for ib in 0..nb {
                    for site in cell.structure.sites() {
                        let fc = (site.frac.z - shift + margin).rem_euclid(1.0) - margin;
                        let cart = a * (site.frac.x + ia as f64)
                            + b * (site.frac.y + ib as f64)
                            + c * (fc + k as f64);
                        let f = slab_lattice.to_fractional(&cart);
                        sites.push(Site {
                            element: site.element,
                            frac: Vector3::new(f.x.rem_euclid(1.0), f.y.rem_euclid(1.0), f.z),
                            properties: site.properties.clone(),
                        });
                    }
                }
            }
        }

        if cfg.center_slab {
            let (lo, hi) = sites
                .iter()
                .fold((f64::MAX, f64::MIN), |(lo, hi), s| (lo.min(s.frac.z), hi.max(s.frac.z)));
            let offset = 0.5 - 0.5 * (lo + hi);
            for s in sites.iter_mut() {
                s.frac.z += offset;
            }
        }

        let [h, k, l] = cfg.miller;
        let name = if bulk.label().is_empty() { bulk.formula() } else { bulk.label().to_string() };
        let structure = Structure::from_sites(slab_lattice, sites)?
            .with_label(format!("{} ({} {} {}) t{}", name, h, k, l, termination));
        let area = (a * na as f64).cross(&(b * nb as f64)).norm();
        Ok(Slab {
            structure,
            termination,
            shift,
            thickness,
            area,
        })
    }

    pub fn run(&self, bulk: &Structure, potential: &dyn Potential) -> Result<SurfaceResult> {
        let cfg = &self.config;
        cfg.validate()?;
        let mut warnings = Vec::new();

        let bulk_relax = RelaxConfig {
            relax_cell: true,
            ..cfg.relax.clone()
        };
        let bulk_result = relax_or_evaluate(bulk, potential, &bulk_relax, cfg.relax_bulk)?;
        warnings.extend(bulk_result.warning_for("bulk relaxation"));
        let bulk_energy_per_atom = bulk_result.energy_per_atom();
        let bulk = bulk_result.structure;
        info!(
            "Bulk {}: {:.6} eV/atom; cleaving {:?}",
            bulk.formula(),
            bulk_energy_per_atom,
            cfg.miller
        );

        let slab_relax = cfg.relax.fixed_cell();
        let mut slabs = Vec::new();
        for slab in self.generate_slabs(&bulk)? {
            let relaxed = relax_or_evaluate(&slab.structure, potential, &slab_relax, cfg.relax_slab)?;
            warnings.extend(relaxed.warning_for(&format!("slab relaxation (termination {})", slab.termination)));
            let n = relaxed.structure.len() as f64;
            let surface_energy = (relaxed.energy - n * bulk_energy_per_atom) / (2.0 * slab.area);
            if surface_energy < 0.0 {
                warn!(
                    "Negative surface energy {:.5} eV/Å² for {}",
                    surface_energy,
                    slab.structure.label()
                );
            }
            info!(
                "{}: {} atoms, γ = {:.5} eV/Å² ({:.3} J/m²)",
                slab.structure.label(),
                relaxed.structure.len(),
                surface_energy,
                surface_energy * EV_PER_A2_TO_J_PER_M2
            );
            slabs.push(SlabResult {
                termination: slab.termination,
                shift: slab.shift,
                stoichiometric: is_stoichiometric(&relaxed.structure, &bulk),
                energy: relaxed.energy,
                area: slab.area,
                thickness: slab.thickness,
                surface_energy,
                iterations: relaxed.iterations,
                converged: relaxed.converged,
                structure: relaxed.structure,
            });
        }

        Ok(SurfaceResult {
            miller: cfg.miller,
            bulk,
            bulk_energy_per_atom,
            slabs,
            warnings,
        })
    }
}

impl PropertyCalculator for SurfaceEnergyEngine {
    type Output = SurfaceResult;

    fn name(&self) -> &'static str {
        "surface"
    }

    fn calculate(&self, structure: &Structure, potential: &dyn Potential) -> Result<SurfaceResult> {
        self.run(structure, potential)
    }
}

// --- Geometry ---

fn gcd(a: i32, b: i32) -> i32 {
    if b == 0 { a.abs() } else { gcd(b, a % b) }
}

fn cross_i(a: &Vector3<i32>, b: &Vector3<i32>) -> Vector3<i32> {
    Vector3::new(
        a.y * b.z - a.z * b.y,
        a.z * b.x - a.x * b.z,
        a.x * b.y - a.y * b.x,
    )
}

/// Re-expresses `bulk` in a unimodular basis whose a and b span the (hkl)
/// plane lattice (shortest pair) and whose c has unit index along the normal.
pub fn oriented_cell(bulk: &Structure, miller: [i32; 3]) -> Result<OrientedCell> {
    let g = miller.iter().fold(0, |acc, &x| gcd(acc, x));
    if g == 0 {
        return Err(CalcError::Configuration("Miller index (000) is not a plane".to_string()));
    }
    let n = Vector3::new(miller[0] / g, miller[1] / g, miller[2] / g);
    let lattice = bulk.lattice();
    let length = |v: &Vector3<i32>| lattice.to_cartesian(&v.map(|x| x as f64)).norm();

    let range = n.iter().map(|x| x.abs()).max().unwrap_or(1) + 2;
    let mut in_plane = Vec::new();
    let mut crossing = Vec::new();
    for x in -range..=range {
        for y in -range..=range {
            for z in -range..=range {
                let v = Vector3::new(x, y, z);
                match n.dot(&v) {
                    0 if v != Vector3::zeros() => in_plane.push(v),
                    1 => crossing.push(v),
                    _ => {}
                }
            }
        }
    }
    in_plane.sort_by(|a, b| length(a).total_cmp(&length(b)));
    crossing.sort_by(|a, b| length(a).total_cmp(&length(b)));

    let mut pair = None;
    'search: for (i, a) in in_plane.iter().enumerate() {
        for b in &in_plane[i + 1..] {
            let cross = cross_i(a, b);
            if cross == n || cross == -n {
                pair = Some((*a, *b));
                break 'search;
            }
        }
    }
    let (mut a, mut b) = pair.ok_or_else(|| {
        CalcError::Numerical(format!("no in-plane basis found for {:?}", miller))
    })?;
    let c = *crossing.first().ok_or_else(|| {
        CalcError::Numerical(format!("no out-of-plane vector found for {:?}", miller))
    })?;
    if cross_i(&a, &b).dot(&c) < 0 {
        std::mem::swap(&mut a, &mut b);
    }

    let basis = Matrix3::from_columns(&[a, b, c]);
    let basis_f = basis.map(|x| x as f64);
    let inverse = basis_f
        .try_inverse()
        .ok_or_else(|| CalcError::Numerical("oriented basis is singular".to_string()))?;
    let oriented_lattice = Lattice::from_matrix(lattice.vectors() * basis_f)?;
    let sites = bulk
        .sites()
        .iter()
        .map(|s| Site {
            element: s.element,
            frac: (inverse * s.frac).map(|x| {
                let w = x.rem_euclid(1.0);
                if w >= 1.0 - 1e-12 { 0.0 } else { w }
            }),
            properties: s.properties.clone(),
        })
        .collect();
    let structure = Structure::from_sites(oriented_lattice, sites)?.with_label(bulk.label());

    let l = structure.lattice();
    let normal = l.vector(0).cross(&l.vector(1)).normalize();
    let spacing = l.vector(2).dot(&normal);
    Ok(OrientedCell {
        structure,
        basis,
        normal,
        spacing,
    })
}

/// Fractional c offsets of the distinct atomic planes, lowest first.
fn plane_offsets(cell: &OrientedCell) -> Vec<f64> {
    let tol = PLANE_TOLERANCE / cell.spacing;
    let mut heights: Vec<f64> = cell.structure.sites().iter().map(|s| s.frac.z).collect();
    heights.sort_by(|a, b| a.total_cmp(b));

    let mut planes: Vec<f64> = Vec::new();
    for h in heights {
        match planes.last() {
            Some(&last) if h - last < tol => {}
            _ => planes.push(h),
        }
    }
    // The topmost plane may be the bottom one seen through the periodic boundary
    if planes.len() > 1 {
        if let (Some(&first), Some(&last)) = (planes.first(), planes.last()) {
            if first + 1.0 - last < tol {
                planes.pop();
            }
        }
    }
    planes
}

fn is_stoichiometric(slab: &Structure, bulk: &Structure) -> bool {
    let (s, b) = (slab.composition(), bulk.composition());
    if !s.keys().eq(b.keys()) {
        return false;
    }
    let Some((el, &n_slab)) = s.iter().next() else {
        return false;
    };
    let n_bulk = b[el];
    s.iter().all(|(e, &count)| count * n_bulk == b[e] * n_slab)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::chemistry::Element;
    use approx::assert_relative_eq;

    fn fcc(a: f64) -> Structure {
        let ar = Element::from_symbol("Ar").unwrap();
        Structure::new(
            Lattice::cubic(a).unwrap(),
            vec![ar; 4],
            vec![
                Vector3::new(0.0, 0.0, 0.0),
                Vector3::new(0.0, 0.5, 0.5),
                Vector3::new(0.5, 0.0, 0.5),
                Vector3::new(0.5, 0.5, 0.0),
            ],
        )
        .unwrap()
    }

    #[test]
    fn oriented_cell_is_unimodular() {
        for miller in [[1, 0, 0], [1, 1, 0], [1, 1, 1], [2, 1, 0], [2, 2, 0]] {
            let cell = oriented_cell(&fcc(5.26), miller).unwrap();
            assert_eq!(cell.basis.map(|x| x as f64).determinant().round() as i32, 1);
            assert_relative_eq!(cell.structure.volume(), 5.26f64.powi(3), max_relative = 1e-9);
            assert_eq!(cell.structure.len(), 4);
        }
    }

    #[test]
    fn plane_spacing_matches_miller_geometry() {
        let a = 5.26;
        let cell = oriented_cell(&fcc(a), [1, 1, 1]).unwrap();
        assert_relative_eq!(cell.spacing, a / 3f64.sqrt(), epsilon = 1e-9);
        assert_eq!(plane_offsets(&cell).len(), 1);

        let cell = oriented_cell(&fcc(a), [1, 0, 0]).unwrap();
        assert_relative_eq!(cell.spacing, a, epsilon = 1e-9);
        assert_eq!(plane_offsets(&cell).len(), 2);
    }

    #[test]
    fn slab_meets_size_requirements() {
        let engine = SurfaceEnergyEngine::new(SurfaceConfig {
            miller: [1, 1, 1],
            in_plane_supercell: [2, 1],
            ..Default::default()
        });
        let slabs = engine.generate_slabs(&fcc(5.26)).unwrap();
        assert_eq!(slabs.len(), 1);
        let slab = &slabs[0];
        assert!(slab.thickness >= 10.0);
        let c = slab.structure.lattice().vector(2).norm();
        assert!(c >= slab.thickness + 20.0 - 1e-9);
        // 4 planes of 4 atoms, doubled in plane
        assert_eq!(slab.structure.len(), 32);
        assert!(crate::core::spatial::check_overlap(&slab.structure, 3.0));
        assert!(slab.structure.frac_positions().iter().all(|f| f.z > 0.0 && f.z < 1.0));
    }

    #[test]
    fn first_policy_keeps_one_termination() {
        let engine = SurfaceEnergyEngine::new(SurfaceConfig {
            terminations: TerminationPolicy::First,
            ..Default::default()
        });
        assert_eq!(engine.generate_slabs(&fcc(5.26)).unwrap().len(), 1);
    }

    #[test]
    fn zero_miller_is_a_configuration_error() {
        let engine = SurfaceEnergyEngine::new(SurfaceConfig { miller: [0, 0, 0], ..Default::default() });
        assert!(matches!(engine.generate_slabs(&fcc(5.26)), Err(CalcError::Configuration(_))));
    }

    #[test]
    fn stoichiometry_compares_ratios() {
        let bulk = fcc(5.26);
        let slab = SurfaceEnergyEngine::default().generate_slabs(&bulk).unwrap().remove(0);
        assert!(is_stoichiometric(&slab.structure, &bulk));
    }
}
