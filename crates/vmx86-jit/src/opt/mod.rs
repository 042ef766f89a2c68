//! Block-local optimization passes.

pub mod flag_elim;
