use std::panic::{self, AssertUnwindSafe};
use std::time::Instant;

use crossbeam_channel::Sender;
use log::{info, warn};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::core::domain::Structure;
use crate::engine::potential::Potential;
use crate::error::{CalcError, Result};
use crate::solvers::{CalcEvent, CalculationOutput, ItemSummary, PropertyCalculator};

/// Worker count for a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Parallelism {
    /// One worker per available core.
    #[default]
    All,
    /// At most this many workers (never more than the available cores).
    Fixed(usize),
}

impl Parallelism {
    /// `jobs <= 0` means every core, as in the job files and CLI.
    pub fn from_jobs(jobs: i64) -> Self {
        if jobs <= 0 {
            Parallelism::All
        } else {
            Parallelism::Fixed(jobs as usize)
        }
    }

    pub fn threads(&self) -> usize {
        let available = num_cpus::get().max(1);
        match *self {
            Parallelism::All => available,
            Parallelism::Fixed(n) => n.clamp(1, available),
        }
    }
}

/// Outcome of one structure, in input position `index`.
#[derive(Debug)]
pub struct BatchItem<T> {
    pub index: usize,
    pub label: String,
    pub outcome: Result<T>,
    pub elapsed_secs: f64,
}

impl<T: CalculationOutput> BatchItem<T> {
    pub fn is_ok(&self) -> bool {
        self.outcome.is_ok()
    }

    /// False for failures and for results that carry convergence warnings.
    pub fn converged(&self) -> bool {
        self.outcome.as_ref().map_or(false, |o| o.converged())
    }

    pub fn summary(&self) -> ItemSummary {
        let message = match &self.outcome {
            Err(e) => Some(e.to_string()),
            Ok(o) => {
                let warnings = o.warnings();
                (!warnings.is_empty()).then(|| {
                    warnings
                        .iter()
                        .map(|w| w.to_string())
                        .collect::<Vec<_>>()
                        .join("; ")
                })
            }
        };
        ItemSummary {
            index: self.index,
            label: self.label.clone(),
            success: self.is_ok(),
            converged: self.converged(),
            elapsed_secs: self.elapsed_secs,
            message,
        }
    }
}

/// Applies one property engine to many structures in parallel.
///
/// Workers are threads of a dedicated rayon pool. Each worker split builds its
/// own potential from the factory, so no potential instance is shared between
/// threads. Every item runs under `catch_unwind`: an error or a panic inside
/// the potential becomes that item's `Err` and never aborts the others.
/// Results come back in input order.
#[derive(Debug, Clone, Default)]
pub struct BatchExecutor {
    parallelism: Parallelism,
    events: Option<Sender<CalcEvent>>,
}

impl BatchExecutor {
    pub fn new(parallelism: Parallelism) -> Self {
        Self {
            parallelism,
            events: None,
        }
    }

    /// Streams progress events to `tx`.
    pub fn with_events(mut self, tx: Sender<CalcEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    fn emit(&self, event: CalcEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    /// Runs `calculator` over `structures`.
    ///
    /// The factory is probed once before any work starts, so an unknown
    /// potential or missing executable fails the whole call.
    pub fn run<C, F>(
        &self,
        calculator: &C,
        structures: &[Structure],
        factory: F,
    ) -> Result<Vec<BatchItem<C::Output>>>
    where
        C: PropertyCalculator,
        F: Fn() -> Result<Box<dyn Potential>> + Send + Sync,
    {
        let probe = factory()?;
        let threads = self.parallelism.threads();
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("propcalc-worker-{}", i))
            .build()
            .map_err(|e| CalcError::Configuration(format!("failed to start worker pool: {}", e)))?;

        info!(
            "Running {} on {} structures with {} workers ({})",
            calculator.name(),
            structures.len(),
            threads,
            probe.name()
        );
        self.emit(CalcEvent::Log(format!(
            "{}: {} structures, {} workers",
            calculator.name(),
            structures.len(),
            threads
        )));
        drop(probe);

        let start = Instant::now();
        let items: Vec<BatchItem<C::Output>> = pool.install(|| {
            structures
                .par_iter()
                .enumerate()
                .map_init(
                    || factory().map_err(|e| e.to_string()),
                    |potential, (index, structure)| self.run_item(calculator, potential, index, structure),
                )
                .collect()
        });

        let succeeded = items.iter().filter(|i| i.is_ok()).count();
        let failed = items.len() - succeeded;
        let elapsed_secs = start.elapsed().as_secs_f64();
        info!(
            "{} finished: {} succeeded, {} failed in {:.2} s",
            calculator.name(),
            succeeded,
            failed,
            elapsed_secs
        );
        self.emit(CalcEvent::Finished {
            succeeded,
            failed,
            elapsed_secs,
        });
        Ok(items)
    }

    fn run_item<C: PropertyCalculator>(
        &self,
        calculator: &C,
        potential: &std::result::Result<Box<dyn Potential>, String>,
        index: usize,
        structure: &Structure,
    ) -> BatchItem<C::Output> {
        let label = if structure.label().is_empty() {
            format!("{}#{}", structure.formula(), index)
        } else {
            structure.label().to_string()
        };
        self.emit(CalcEvent::ItemStarted {
            index,
            label: label.clone(),
        });
        let start = Instant::now();

        let outcome = match potential {
            Ok(potential) => panic::catch_unwind(AssertUnwindSafe(|| {
                calculator.calculate(structure, potential.as_ref())
            }))
            .unwrap_or_else(|payload| {
                Err(CalcError::evaluation(
                    potential.name(),
                    format!("calculation panicked: {}", panic_message(payload.as_ref())),
                ))
            }),
            Err(reason) => Err(CalcError::Configuration(format!(
                "worker could not load potential: {}",
                reason
            ))),
        };

        let item = BatchItem {
            index,
            label,
            outcome,
            elapsed_secs: start.elapsed().as_secs_f64(),
        };
        match &item.outcome {
            Err(e) => warn!("[{}] {} failed: {}", item.index, item.label, e),
            Ok(o) if !o.converged() => warn!("[{}] {} finished without converging", item.index, item.label),
            Ok(_) => {}
        }
        self.emit(CalcEvent::ItemFinished(item.summary()));
        item
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parallelism_is_bounded_by_hardware() {
        let cores = num_cpus::get();
        assert_eq!(Parallelism::All.threads(), cores);
        assert_eq!(Parallelism::Fixed(cores + 100).threads(), cores);
        assert_eq!(Parallelism::Fixed(0).threads(), 1);
        assert_eq!(Parallelism::from_jobs(-1), Parallelism::All);
        assert_eq!(Parallelism::from_jobs(0), Parallelism::All);
        assert_eq!(Parallelism::from_jobs(3), Parallelism::Fixed(3));
    }

    #[test]
    fn panic_payloads_are_readable() {
        let payload: Box<dyn std::any::Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");
        let payload: Box<dyn std::any::Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload.as_ref()), "bang");
    }
}
