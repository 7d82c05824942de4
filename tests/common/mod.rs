#![allow(dead_code)]

use nalgebra::Vector3;
use propcalc::core::chemistry::Element;
use propcalc::engine::potentials::{LennardJones, PairPotential, ZeroPotential};
use propcalc::{CalcError, Evaluation, Lattice, Potential, Result, Structure};

pub const AR_LATTICE: f64 = 5.26;

pub fn element(symbol: &str) -> Element {
    Element::from_symbol(symbol).unwrap()
}

pub fn argon_potential() -> PairPotential<LennardJones> {
    PairPotential::uniform("LJ-Ar", LennardJones { epsilon: 0.0104, sigma: 3.40 }, 8.5).unwrap()
}

/// Conventional 4-atom fcc argon cell.
pub fn fcc_argon(a: f64) -> Structure {
    Structure::new(
        Lattice::cubic(a).unwrap(),
        vec![element("Ar"); 4],
        vec![
            Vector3::new(0.0, 0.0, 0.0),
            Vector3::new(0.0, 0.5, 0.5),
            Vector3::new(0.5, 0.0, 0.5),
            Vector3::new(0.5, 0.5, 0.0),
        ],
    )
    .unwrap()
    .with_label("Ar-fcc")
}

/// One-atom fcc primitive cell.
pub fn primitive_argon(a: f64) -> Structure {
    let h = a / 2.0;
    let lattice = Lattice::from_rows([[0.0, h, h], [h, 0.0, h], [h, h, 0.0]]).unwrap();
    Structure::new(lattice, vec![element("Ar")], vec![Vector3::zeros()])
        .unwrap()
        .with_label("Ar-prim")
}

/// Conventional 8-atom diamond-cubic cell.
pub fn diamond(symbol: &str, a: f64) -> Structure {
    let fcc = [[0.0, 0.0, 0.0], [0.0, 0.5, 0.5], [0.5, 0.0, 0.5], [0.5, 0.5, 0.0]];
    let frac: Vec<Vector3<f64>> = fcc
        .iter()
        .flat_map(|p| {
            let base = Vector3::new(p[0], p[1], p[2]);
            [base, base + Vector3::new(0.25, 0.25, 0.25)]
        })
        .collect();
    Structure::new(Lattice::cubic(a).unwrap(), vec![element(symbol); 8], frac)
        .unwrap()
        .with_label(format!("{}-diamond", symbol))
}

/// Zero potential that refuses structures carrying a given label.
pub struct FailOn {
    pub label: String,
}

impl FailOn {
    pub fn new(label: &str) -> Self {
        Self { label: label.to_string() }
    }
}

impl Potential for FailOn {
    fn evaluate(&self, structure: &Structure) -> Result<Evaluation> {
        if structure.label() == self.label {
            return Err(CalcError::evaluation(self.name(), "unsupported chemistry"));
        }
        ZeroPotential.evaluate(structure)
    }

    fn name(&self) -> &str {
        "FailOn"
    }
}

/// Zero potential that panics on a given label.
pub struct PanicOn {
    pub label: String,
}

impl Potential for PanicOn {
    fn evaluate(&self, structure: &Structure) -> Result<Evaluation> {
        if structure.label() == self.label {
            panic!("backend crashed on {}", self.label);
        }
        ZeroPotential.evaluate(structure)
    }

    fn name(&self) -> &str {
        "PanicOn"
    }
}
