pub mod external;
pub mod operators;
pub mod potential;
pub mod potentials;
pub mod registry;
