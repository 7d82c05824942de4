use crossbeam_channel::unbounded;
use propcalc::engine::registry::PotentialRef;
use propcalc::solvers::batch::{BatchExecutor, Parallelism};
use propcalc::solvers::relax::{RelaxConfig, RelaxationEngine};
use propcalc::solvers::CalcEvent;
use propcalc::{CalcError, Potential, Structure};

use crate::common::{diamond, fcc_argon, FailOn, PanicOn, AR_LATTICE};

mod common;

fn inputs(n: usize) -> Vec<Structure> {
    (0..n)
        .map(|i| fcc_argon(AR_LATTICE + 0.01 * i as f64).with_label(format!("item-{}", i)))
        .collect()
}

#[test]
fn results_keep_input_order_and_isolate_failures() {
    let structures = inputs(7);
    let bad = 4;
    let engine = RelaxationEngine::new(RelaxConfig::default());
    let items = BatchExecutor::new(Parallelism::Fixed(3))
        .run(&engine, &structures, || Ok(Box::new(FailOn::new("item-4")) as Box<dyn Potential>))
        .unwrap();

    assert_eq!(items.len(), structures.len());
    for (k, item) in items.iter().enumerate() {
        assert_eq!(item.index, k);
        assert_eq!(item.label, format!("item-{}", k));
        if k == bad {
            assert!(matches!(item.outcome, Err(CalcError::Evaluation { .. })));
            assert!(!item.summary().success);
        } else {
            let result = item.outcome.as_ref().unwrap();
            assert_eq!(result.structure, structures[k]);
            assert!(item.converged());
        }
    }
}

#[test]
fn panicking_backend_fails_only_its_item() {
    let structures = inputs(4);
    let engine = RelaxationEngine::default();
    let items = BatchExecutor::new(Parallelism::Fixed(2))
        .run(&engine, &structures, || {
            Ok(Box::new(PanicOn { label: "item-1".into() }) as Box<dyn Potential>)
        })
        .unwrap();
    assert_eq!(items.iter().filter(|i| i.is_ok()).count(), 3);
    match &items[1].outcome {
        Err(CalcError::Evaluation { reason, .. }) => assert!(reason.contains("backend crashed on item-1")),
        other => panic!("expected a caught panic, got {:?}", other),
    }
}

#[test]
fn unknown_potential_aborts_before_any_work() {
    let (tx, rx) = unbounded();
    let executor = BatchExecutor::new(Parallelism::All).with_events(tx);
    let result = executor.run(&RelaxationEngine::default(), &inputs(3), || {
        PotentialRef::Named("no-such-model".into()).to_spec()?.build()
    });
    drop(executor);
    assert!(matches!(result, Err(CalcError::Configuration(_))));
    assert!(rx.iter().all(|e| !matches!(e, CalcEvent::ItemStarted { .. })));
}

#[test]
fn events_report_every_item_and_the_totals() {
    let structures = vec![
        diamond("C", 3.567).with_label("ok-0"),
        diamond("Si", 5.43).with_label("bad"),
        diamond("C", 3.6).with_label("ok-2"),
    ];
    let (tx, rx) = unbounded();
    let executor = BatchExecutor::new(Parallelism::Fixed(2)).with_events(tx);
    let items = executor
        .run(&RelaxationEngine::default(), &structures, || {
            Ok(Box::new(FailOn::new("bad")) as Box<dyn Potential>)
        })
        .unwrap();
    drop(executor);
    let events: Vec<CalcEvent> = rx.iter().collect();

    let started = events.iter().filter(|e| matches!(e, CalcEvent::ItemStarted { .. })).count();
    let mut finished: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            CalcEvent::ItemFinished(s) => Some(s.clone()),
            _ => None,
        })
        .collect();
    finished.sort_by_key(|s| s.index);
    assert_eq!(started, 3);
    assert_eq!(finished.len(), 3);
    assert!(finished[0].success && !finished[1].success && finished[2].success);
    assert!(finished[1].message.as_deref().unwrap_or_default().contains("unsupported chemistry"));
    match events.last() {
        Some(CalcEvent::Finished { succeeded, failed, .. }) => assert_eq!((*succeeded, *failed), (2, 1)),
        other => panic!("last event should be Finished, got {:?}", other),
    }
    let summaries: Vec<_> = items.iter().map(|i| i.summary()).collect();
    assert_eq!(summaries, finished);
}

#[test]
fn unconverged_items_succeed_with_a_warning() {
    let mut structures = inputs(3);
    let mut frac = structures[1].frac_positions();
    frac[1].x += 0.1;
    structures[1] = structures[1].with_frac_positions(frac).unwrap();

    let engine = RelaxationEngine::new(RelaxConfig {
        max_steps: 2,
        ..Default::default()
    });
    let factory = PotentialRef::Named("argon".into()).factory().unwrap();
    let items = BatchExecutor::new(Parallelism::Fixed(2))
        .run(&engine, &structures, factory)
        .unwrap();

    let displaced = items[1].summary();
    assert!(displaced.success);
    assert!(!displaced.converged);
    assert!(displaced.message.as_deref().unwrap_or_default().contains("not converged"));
    for k in [0, 2] {
        let summary = items[k].summary();
        assert!(summary.success && summary.converged, "{:?}", summary);
        assert_eq!(summary.message, None);
    }
}

#[test]
fn registered_potentials_work_through_their_factory() {
    let factory = PotentialRef::Named("lj".into()).factory().unwrap();
    let structures = inputs(3);
    let items = BatchExecutor::new(Parallelism::Fixed(2))
        .run(&RelaxationEngine::default(), &structures, factory)
        .unwrap();
    assert!(items.iter().all(|i| i.is_ok()));
}
