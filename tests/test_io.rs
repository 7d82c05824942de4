use std::fs;

use approx::assert_relative_eq;
use propcalc::analysis::kpath::BandPath;
use propcalc::engine::registry;
use propcalc::interface::config::{CalculationConfig, JobConfig};
use propcalc::interface::report;
use propcalc::io::{read_structure, write_structure};
use propcalc::solvers::phonon::{PhononConfig, PhononEngine};
use propcalc::{CalcError, Potential};

use crate::common::{argon_potential, diamond, primitive_argon, AR_LATTICE};

mod common;

#[test]
fn poscar_and_json_files_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let s = diamond("Si", 5.43);
    for name in ["POSCAR", "si.vasp", "si.json"] {
        let path = dir.path().join(name);
        write_structure(&path, &s).unwrap();
        let back = read_structure(&path).unwrap();
        assert_eq!(back.elements(), s.elements());
        assert_eq!(back.label(), s.label());
        assert_relative_eq!(back.volume(), s.volume(), epsilon = 1e-8);
        for (a, b) in back.frac_positions().iter().zip(s.frac_positions()) {
            assert_relative_eq!((a - b).norm(), 0.0, epsilon = 1e-10);
        }
    }
    // JSON keeps the identity of the structure as well
    let back = read_structure(&dir.path().join("si.json")).unwrap();
    assert_eq!(back, s);
}

#[test]
fn malformed_poscar_is_a_fatal_parse_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("CONTCAR");
    fs::write(&path, "broken\n1.0\n1 0 0\n0 1 0\n").unwrap();
    let err = read_structure(&path).unwrap_err();
    assert!(matches!(err, CalcError::Parse { .. }));
    assert!(err.is_fatal());
    assert!(err.to_string().contains("CONTCAR"));
}

#[test]
fn unlabelled_files_take_the_file_stem() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("argon.vasp");
    fs::write(
        &path,
        "\n1.0\n5.26 0 0\n0 5.26 0\n0 0 5.26\nAr\n1\nDirect\n0 0 0\n",
    )
    .unwrap();
    assert_eq!(read_structure(&path).unwrap().label(), "argon");
}

#[test]
fn registry_resolves_aliases_and_rejects_unknown_names() {
    assert_eq!(registry::resolve_name("ARGON").unwrap(), "LJ-Ar");
    assert_eq!(registry::load("lj").unwrap().name(), "LJ-Ar");
    let err = registry::load("MACE-MP-0").err().unwrap();
    assert!(matches!(err, CalcError::Configuration(_)));
    assert!(err.is_fatal());
    let names: Vec<_> = registry::available().into_iter().map(|(n, _)| n).collect();
    assert!(names.contains(&"Zero"));
}

#[test]
fn job_file_paths_are_relative_to_the_job() {
    let dir = tempfile::tempdir().unwrap();
    write_structure(&dir.path().join("POSCAR_Si"), &diamond("Si", 5.43)).unwrap();
    let job_path = dir.path().join("job.json");
    fs::write(
        &job_path,
        r#"{
            "potential": "zero",
            "structures": ["POSCAR_Si"],
            "calculation": {"type": "elastic", "shear_strains": [-0.02, 0.02]},
            "perturb": {"rattle_intensity": 0.02, "seed": 3}
        }"#,
    )
    .unwrap();

    let job = JobConfig::load(&job_path).unwrap();
    assert_eq!(job.structures[0], dir.path().join("POSCAR_Si"));
    assert_eq!(job.output_dir, dir.path().join("propcalc-output"));
    assert!(matches!(job.calculation, CalculationConfig::Elastic(ref c) if c.shear_strains == vec![-0.02, 0.02]));

    let first = job.load_structures().unwrap();
    let second = job.load_structures().unwrap();
    assert_eq!(first[0].frac_positions(), second[0].frac_positions());
    assert_ne!(first[0].frac_positions(), diamond("Si", 5.43).frac_positions());
}

#[test]
fn bad_job_files_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("job.json");
    fs::write(&path, r#"{"structures": ["x.vasp"], "calculation": {"type": "elastic", "norm_strains": [0.0]}}"#).unwrap();
    assert!(matches!(JobConfig::load(&path), Err(CalcError::Configuration(_))));
    fs::write(&path, "{ not json").unwrap();
    assert!(matches!(JobConfig::load(&path), Err(CalcError::Parse { .. })));
}

#[test]
fn phonon_artifacts_are_written_and_force_constants_reload() {
    let config = PhononConfig {
        relax_structure: false,
        supercell_matrix: [[2, 0, 0], [0, 2, 0], [0, 0, 2]],
        band_path: BandPath::Fcc,
        band_points: 3,
        mesh: [2, 2, 2],
        t_max: 100.0,
        t_step: 50.0,
        ..Default::default()
    };
    let pot = argon_potential();
    let result = PhononEngine::new(config).run(&primitive_argon(AR_LATTICE), &pot).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let files = report::write_phonon_artifacts(dir.path(), "ar", &result).unwrap();
    assert_eq!(files.len(), 4);
    assert!(files.iter().all(|f| f.exists()));

    let thermal = fs::read_to_string(dir.path().join("ar.thermal.csv")).unwrap();
    assert_eq!(thermal.lines().count(), 1 + 3);
    let band = fs::read_to_string(dir.path().join("ar.band.csv")).unwrap();
    assert!(band.lines().next().unwrap().ends_with("mode_3"));

    let fc = report::read_force_constants(&dir.path().join("ar.force_constants.json")).unwrap();
    assert_eq!(fc, result.force_constants);
    let dm = fc.dynamical_matrix().unwrap();
    let q = nalgebra::Vector3::new(0.5, 0.0, 0.5);
    let original = result.force_constants.dynamical_matrix().unwrap();
    for (a, b) in dm.frequencies(&q).iter().zip(original.frequencies(&q)) {
        assert_relative_eq!(*a, b, epsilon = 1e-9);
    }
}
