//! Property calculators over pluggable interatomic potentials: structure
//! relaxation, surface energy, phonons and elastic constants, with a
//! parallel batch executor.

pub mod analysis;
pub mod core;
pub mod engine;
pub mod error;
pub mod interface;
pub mod io;
pub mod solvers;

pub use crate::core::domain::{Lattice, Site, Structure};
pub use crate::engine::potential::{Evaluation, Potential};
pub use crate::error::{CalcError, ConvergenceWarning, Result};
