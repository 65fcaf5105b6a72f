//! The available command line argument subcommands
pub mod fuzz;
pub mod trace;
pub mod translate;
