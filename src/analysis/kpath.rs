//! High-symmetry paths and q-point meshes, in fractional reciprocal coordinates.

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

use crate::core::domain::Lattice;
use crate::error::{CalcError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabeledPoint {
    pub label: String,
    pub coords: [f64; 3],
}

impl LabeledPoint {
    fn new(label: &str, coords: [f64; 3]) -> Self {
        Self {
            label: label.to_string(),
            coords,
        }
    }

    pub fn vector(&self) -> Vector3<f64> {
        Vector3::from(self.coords)
    }
}

/// Band path for a lattice family. Preset coordinates refer to the reciprocal
/// basis of the conventional setting of each family's primitive cell.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BandPath {
    /// Γ-X-M-Γ-R-X|M-R in a simple cubic cell.
    #[default]
    Cubic,
    /// Γ-X-W-K-Γ-L-U-W-L-K|U-X in the fcc primitive cell.
    Fcc,
    /// Γ-H-N-Γ-P-H|P-N in the bcc primitive cell.
    Bcc,
    /// Γ-M-K-Γ-A-L-H-A|L-M|K-H.
    Hexagonal,
    /// Continuous branches of explicit points.
    Explicit { branches: Vec<Vec<LabeledPoint>> },
}

const GAMMA: [f64; 3] = [0.0, 0.0, 0.0];

impl BandPath {
    /// Continuous branches of labelled points.
    pub fn branches(&self) -> Vec<Vec<LabeledPoint>> {
        let p = LabeledPoint::new;
        match self {
            BandPath::Cubic => {
                let (x, m, r) = ([0.0, 0.5, 0.0], [0.5, 0.5, 0.0], [0.5, 0.5, 0.5]);
                vec![
                    vec![p("Γ", GAMMA), p("X", x), p("M", m), p("Γ", GAMMA), p("R", r), p("X", x)],
                    vec![p("M", m), p("R", r)],
                ]
            }
            BandPath::Fcc => {
                let x = [0.5, 0.0, 0.5];
                let w = [0.5, 0.25, 0.75];
                let k = [0.375, 0.375, 0.75];
                let l = [0.5, 0.5, 0.5];
                let u = [0.625, 0.25, 0.625];
                vec![
                    vec![
                        p("Γ", GAMMA),
                        p("X", x),
                        p("W", w),
                        p("K", k),
                        p("Γ", GAMMA),
                        p("L", l),
                        p("U", u),
                        p("W", w),
                        p("L", l),
                        p("K", k),
                    ],
                    vec![p("U", u), p("X", x)],
                ]
            }
            BandPath::Bcc => {
                let h = [0.5, -0.5, 0.5];
                let n = [0.0, 0.0, 0.5];
                let pp = [0.25, 0.25, 0.25];
                vec![
                    vec![p("Γ", GAMMA), p("H", h), p("N", n), p("Γ", GAMMA), p("P", pp), p("H", h)],
                    vec![p("P", pp), p("N", n)],
                ]
            }
            BandPath::Hexagonal => {
                let m = [0.5, 0.0, 0.0];
                let k = [1.0 / 3.0, 1.0 / 3.0, 0.0];
                let a = [0.0, 0.0, 0.5];
                let l = [0.5, 0.0, 0.5];
                let h = [1.0 / 3.0, 1.0 / 3.0, 0.5];
                vec![
                    vec![
                        p("Γ", GAMMA),
                        p("M", m),
                        p("K", k),
                        p("Γ", GAMMA),
                        p("A", a),
                        p("L", l),
                        p("H", h),
                        p("A", a),
                    ],
                    vec![p("L", l), p("M", m)],
                    vec![p("K", k), p("H", h)],
                ]
            }
            BandPath::Explicit { branches } => branches.clone(),
        }
    }

    /// Samples every segment with `points_per_segment` points, both ends included.
    ///
    /// Distances are cumulative path lengths in cartesian reciprocal space
    /// (1/Å, without the 2π factor); they do not advance across a branch break.
    pub fn sample(&self, lattice: &Lattice, points_per_segment: usize) -> Result<PathSamples> {
        if points_per_segment < 2 {
            return Err(CalcError::Configuration(
                "band path needs at least 2 points per segment".to_string(),
            ));
        }
        let branches = self.branches();
        if branches.iter().all(|b| b.len() < 2) {
            return Err(CalcError::Configuration(
                "band path has no segment".to_string(),
            ));
        }

        let reciprocal = lattice.reciprocal();
        let mut samples = PathSamples::default();
        let mut distance = 0.0;

        for branch in branches.iter().filter(|b| b.len() >= 2) {
            for pair in branch.windows(2) {
                let (start, end) = (pair[0].vector(), pair[1].vector());
                let length = (reciprocal * (end - start)).norm();
                samples.segment_starts.push(samples.qpoints.len());
                samples.labels.push((distance, pair[0].label.clone()));
                for i in 0..points_per_segment {
                    let t = i as f64 / (points_per_segment - 1) as f64;
                    samples.qpoints.push(start + (end - start) * t);
                    samples.distances.push(distance + length * t);
                }
                distance += length;
            }
            if let Some(last) = branch.last() {
                samples.labels.push((distance, last.label.clone()));
            }
        }
        Ok(samples)
    }
}

/// Sampled q-points along a band path.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PathSamples {
    pub qpoints: Vec<Vector3<f64>>,
    pub distances: Vec<f64>,
    /// (distance, label) of every segment end.
    pub labels: Vec<(f64, String)>,
    /// Index of the first q-point of every segment.
    pub segment_starts: Vec<usize>,
}

/// Γ-centred uniform mesh with equal weights. No symmetry reduction.
pub fn gamma_centered_mesh(mesh: [usize; 3]) -> Result<Vec<Vector3<f64>>> {
    if mesh.iter().any(|&n| n == 0) {
        return Err(CalcError::Configuration(format!(
            "q-point mesh {:?} has an empty dimension",
            mesh
        )));
    }
    let fold = |i: usize, n: usize| {
        let x = i as f64 / n as f64;
        if x > 0.5 { x - 1.0 } else { x }
    };
    let mut points = Vec::with_capacity(mesh.iter().product());
    for i in 0..mesh[0] {
        for j in 0..mesh[1] {
            for k in 0..mesh[2] {
                points.push(Vector3::new(fold(i, mesh[0]), fold(j, mesh[1]), fold(k, mesh[2])));
            }
        }
    }
    Ok(points)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn cubic_path_lengths_follow_reciprocal_metric() {
        let lattice = Lattice::cubic(4.0).unwrap();
        let samples = BandPath::Cubic.sample(&lattice, 11).unwrap();
        // Γ-X is half a reciprocal vector: 0.5 / 4 Å
        assert_relative_eq!(samples.distances[10], 0.125, epsilon = 1e-12);
        assert_eq!(samples.labels[0].1, "Γ");
        assert_eq!(samples.qpoints.len(), 6 * 11);
        assert_eq!(samples.segment_starts.len(), 6);
    }

    #[test]
    fn branch_break_does_not_advance_distance() {
        let lattice = Lattice::cubic(4.0).unwrap();
        let samples = BandPath::Cubic.sample(&lattice, 5).unwrap();
        let first_of_second_branch = samples.segment_starts[5];
        assert_eq!(
            samples.distances[first_of_second_branch],
            samples.distances[first_of_second_branch - 1]
        );
    }

    #[test]
    fn explicit_path_round_trips_through_json() {
        let json = r#"{"kind": "explicit", "branches": [[{"label": "G", "coords": [0,0,0]}, {"label": "Z", "coords": [0,0,0.5]}]]}"#;
        let path: BandPath = serde_json::from_str(json).unwrap();
        let samples = path.sample(&Lattice::cubic(3.0).unwrap(), 3).unwrap();
        assert_eq!(samples.qpoints.len(), 3);
        assert_eq!(samples.labels.last().unwrap().1, "Z");
    }

    #[test]
    fn mesh_contains_gamma_and_folds() {
        let mesh = gamma_centered_mesh([4, 4, 4]).unwrap();
        assert_eq!(mesh.len(), 64);
        assert_eq!(mesh[0], Vector3::zeros());
        assert!(mesh.iter().all(|q| q.iter().all(|&x| x > -0.5 && x <= 0.5)));
        assert!(gamma_centered_mesh([0, 1, 1]).is_err());
    }
}
