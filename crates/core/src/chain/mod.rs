//! Reading a migration chain: the unit parser, the chain-pointer grammar and
//! the dependency graph built from both.

pub mod graph;
pub mod parser;
pub mod pointer;

pub use graph::{ChainGraph, Topology};
pub use parser::UnitParser;
pub use pointer::{ChainPointer, PointerConflict};
