//! Potentials evaluated by external programs.

pub mod command;

pub use command::CommandPotential;
