use approx::assert_relative_eq;
use propcalc::analysis::kpath::BandPath;
use propcalc::engine::registry;
use propcalc::solvers::elasticity::{ElasticConfig, ElasticityEngine};
use propcalc::solvers::phonon::{PhononConfig, PhononEngine};
use propcalc::solvers::relax::RelaxConfig;
use propcalc::solvers::surface::{SurfaceConfig, SurfaceEnergyEngine, SurfaceResult};
use propcalc::solvers::CalculationOutput;

use crate::common::{argon_potential, fcc_argon, primitive_argon, AR_LATTICE};

mod common;

const GAS_CONSTANT: f64 = 8.314462618;

fn surface(miller: [i32; 3]) -> SurfaceResult {
    let pot = registry::load("LJ-Ar").unwrap();
    let engine = SurfaceEnergyEngine::new(SurfaceConfig {
        miller,
        ..Default::default()
    });
    engine.run(&fcc_argon(AR_LATTICE), pot.as_ref()).unwrap()
}

#[test]
fn argon_surface_energies_are_positive_and_close_packed_is_lowest() {
    let s100 = surface([1, 0, 0]);
    let s111 = surface([1, 1, 1]);
    for result in [&s100, &s111] {
        assert!(!result.slabs.is_empty());
        assert!(result.converged(), "{:?}", result.warnings);
        for slab in &result.slabs {
            assert!(slab.stoichiometric);
            assert!(
                slab.surface_energy >= 0.0,
                "γ{:?} = {} eV/Å²",
                result.miller,
                slab.surface_energy
            );
        }
    }
    let g100 = s100.lowest().unwrap().surface_energy;
    let g111 = s111.lowest().unwrap().surface_energy;
    assert!(g111 < g100, "γ111 = {}, γ100 = {}", g111, g100);
}

fn quick_phonons() -> PhononConfig {
    PhononConfig {
        supercell_matrix: [[3, 0, 0], [0, 3, 0], [0, 0, 3]],
        band_path: BandPath::Fcc,
        band_points: 5,
        mesh: [3, 3, 3],
        t_min: 0.0,
        t_max: 1000.0,
        t_step: 250.0,
        ..Default::default()
    }
}

#[test]
fn acoustic_frequencies_vanish_at_gamma() {
    let result = PhononEngine::new(quick_phonons())
        .run(&primitive_argon(AR_LATTICE), &argon_potential())
        .unwrap();
    assert_eq!(result.gamma_frequencies.len(), 3);
    for f in &result.gamma_frequencies {
        assert!(f.abs() < 1e-2, "Γ frequency {} THz", f);
    }
    assert_eq!(result.imaginary_modes, 0);
    assert!(result.force_constants.sum_rule_violation() < 1e-10);
}

#[test]
fn heat_capacity_approaches_the_classical_limit() {
    let result = PhononEngine::new(quick_phonons())
        .run(&primitive_argon(AR_LATTICE), &argon_potential())
        .unwrap();
    let first = result.thermal.first().unwrap();
    let last = result.thermal.last().unwrap();
    assert_eq!(first.temperature, 0.0);
    assert_eq!(first.heat_capacity, 0.0);
    assert_eq!(last.temperature, 1000.0);

    // One atom per cell; the three Γ modes are left out of the sums.
    let classical = 3.0 * GAS_CONSTANT;
    let ratio = last.heat_capacity / classical;
    assert!(ratio > 0.9 && ratio <= 1.0, "Cv / 3R = {}", ratio);
    assert!(result.thermal.windows(2).all(|w| w[1].entropy >= w[0].entropy));
}

#[test]
fn fitted_voigt_matrix_is_symmetric_with_positive_bulk_modulus() {
    let config = ElasticConfig {
        relax: RelaxConfig {
            stress_tol: 1e-5,
            fmax: 1e-3,
            ..Default::default()
        },
        ..Default::default()
    };
    let result = ElasticityEngine::new(config)
        .run(&fcc_argon(AR_LATTICE), &argon_potential())
        .unwrap();
    let c = result.elastic_tensor;
    for i in 0..6 {
        for j in 0..6 {
            assert_eq!(c[(i, j)], c[(j, i)]);
        }
    }
    assert!(result.asymmetry < 0.05 * c[(0, 0)]);
    assert!(result.moduli.k_vrh.is_some_and(|k| k > 0.0));
    assert!(c[(0, 0)] > c[(0, 1)] && c[(0, 1)] > 0.0 && c[(3, 3)] > 0.0);
    assert_relative_eq!(c[(0, 0)], c[(1, 1)], max_relative = 1e-2);
    assert_eq!(result.strain_states.len(), 6 * 4);
}
