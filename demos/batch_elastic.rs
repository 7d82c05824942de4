//! Elastic constants of fcc argon at a few lattice constants, run as one
//! parallel batch with a progress listener on a separate thread.
//!
//! `RUST_LOG=info cargo run --release --example batch_elastic`

use std::thread;

use anyhow::{anyhow, bail, Result};
use crossbeam_channel::unbounded;
use nalgebra::Vector3;
use propcalc::analysis::moduli::EV_PER_A3_TO_GPA;
use propcalc::core::chemistry::Element;
use propcalc::engine::registry::PotentialRef;
use propcalc::interface::progress::RunProgress;
use propcalc::solvers::batch::{BatchExecutor, Parallelism};
use propcalc::solvers::elasticity::{ElasticConfig, ElasticityEngine};
use propcalc::{Lattice, Structure};

fn fcc_argon(a: f64) -> Result<Structure> {
    let ar = Element::from_symbol("Ar").ok_or_else(|| anyhow!("unknown element Ar"))?;
    let frac = vec![
        Vector3::new(0.0, 0.0, 0.0),
        Vector3::new(0.0, 0.5, 0.5),
        Vector3::new(0.5, 0.0, 0.5),
        Vector3::new(0.5, 0.5, 0.0),
    ];
    Ok(Structure::new(Lattice::cubic(a)?, vec![ar; 4], frac)?.with_label(format!("Ar a={:.2}", a)))
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let structures = [5.20, 5.26, 5.32, 5.40]
        .iter()
        .map(|&a| fcc_argon(a))
        .collect::<Result<Vec<_>>>()?;
    let factory = PotentialRef::Named("argon".into()).factory()?;

    // Strained cells are compared at fixed lattice constant, so skip the
    // initial cell relaxation.
    let engine = ElasticityEngine::new(ElasticConfig {
        relax_structure: false,
        ..Default::default()
    });

    let (tx, rx) = unbounded();
    let total = structures.len();
    let listener = thread::spawn(move || {
        let mut progress = RunProgress::new(total);
        for event in rx.iter() {
            if let Some(line) = progress.ingest(event) {
                log::info!("[{}/{}] {}", progress.done(), total, line);
            }
        }
    });

    let executor = BatchExecutor::new(Parallelism::All).with_events(tx);
    let items = executor.run(&engine, &structures, factory)?;
    drop(executor);
    if listener.join().is_err() {
        bail!("progress listener panicked");
    }

    println!("{:<12} {:>9} {:>9} {:>9} {:>9}", "structure", "C11", "C12", "C44", "K_vrh");
    for item in &items {
        match &item.outcome {
            Ok(result) => {
                let c = result.elastic_tensor_gpa();
                println!(
                    "{:<12} {:>9.3} {:>9.3} {:>9.3} {:>9.3}",
                    item.label,
                    c[(0, 0)],
                    c[(0, 1)],
                    c[(3, 3)],
                    result.moduli.scaled(EV_PER_A3_TO_GPA).k_vrh.unwrap_or(f64::NAN)
                );
            }
            Err(e) => println!("{:<12} failed: {}", item.label, e),
        }
    }
    Ok(())
}
