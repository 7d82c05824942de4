//! Post-processing shared by the property engines.

pub mod kpath;
pub mod moduli;
pub mod thermal;
