use nalgebra::Vector3;

use crate::core::domain::{Lattice, Structure};

/// Wraps fractional coordinates into [0, 1).
#[inline]
pub fn wrap_fractional(frac: &Vector3<f64>) -> Vector3<f64> {
    frac.map(|x| {
        let w = x.rem_euclid(1.0);
        // rem_euclid can round up to exactly 1.0 for tiny negative inputs
        if w >= 1.0 { 0.0 } else { w }
    })
}

/// Maps a fractional difference onto [-0.5, 0.5] (Minimum Image Convention).
#[inline]
pub fn minimum_image(delta_frac: &Vector3<f64>) -> Vector3<f64> {
    delta_frac.map(|x| x - x.round())
}

/// Minimum-image squared distance between two fractional positions.
#[inline]
pub fn distance_sq(lattice: &Lattice, f1: &Vector3<f64>, f2: &Vector3<f64>) -> f64 {
    let d_frac = minimum_image(&(f2 - f1));
    lattice.to_cartesian(&d_frac).norm_squared()
}

/// Number of periodic images needed along each lattice vector so that every
/// pair within `cutoff` is found once fractional differences are minimum-imaged.
pub fn image_range(lattice: &Lattice, cutoff: f64) -> [i32; 3] {
    let spacings = lattice.plane_spacings();
    let mut range = [0; 3];
    for (r, d) in range.iter_mut().zip(spacings.iter()) {
        *r = (cutoff / d + 0.5).ceil() as i32;
    }
    range
}

/// Checks a structure for atoms closer than `min_distance` (Å).
/// Returns `true` if the structure is valid (no overlaps).
pub fn check_overlap(structure: &Structure, min_distance: f64) -> bool {
    let sites = structure.sites();
    let lattice = structure.lattice();
    let threshold_sq = min_distance * min_distance;

    for i in 0..sites.len() {
        for j in (i + 1)..sites.len() {
            if distance_sq(lattice, &sites[i].frac, &sites[j].frac) < threshold_sq {
                return false; // Collision detected
            }
        }
    }
    true
}

/// Shortest distance between any two atoms, including periodic self-images.
pub fn min_interatomic_distance(structure: &Structure) -> f64 {
    let lattice = structure.lattice();
    let sites = structure.sites();
    let mut best = f64::MAX;

    // Self-images: the shortest lattice vector among the nearest neighbours of the origin
    for dx in -1..=1 {
        for dy in -1..=1 {
            for dz in -1..=1 {
                if (dx, dy, dz) == (0, 0, 0) {
                    continue;
                }
                let t = Vector3::new(dx as f64, dy as f64, dz as f64);
                best = best.min(lattice.to_cartesian(&t).norm());
            }
        }
    }

    for i in 0..sites.len() {
        for j in (i + 1)..sites.len() {
            best = best.min(distance_sq(lattice, &sites[i].frac, &sites[j].frac).sqrt());
        }
    }
    best
}
