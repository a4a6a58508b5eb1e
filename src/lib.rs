//! Symbolic stack-state inference, use-def chains and backward slicing
//! for WebAssembly function bodies.
//!
//! The pipeline is: [`builder::build`] a CFG from a structured body,
//! [`transfer::annotate`] it with symbolic states, then hand the annotated
//! graph to a [`slicer::Slicer`].

pub mod builder;
pub mod cfg;
pub mod config;
pub mod control_deps;
pub mod error;
pub mod fixpoint;
pub mod instr;
pub mod merge;
pub mod rpo;
pub mod slicer;
pub mod state;
pub mod stats;
pub mod transfer;
pub mod use_def;
pub mod value;

pub use crate::config::Options;
pub use crate::error::{Error, Result};
pub use crate::instr::Label;
pub use crate::slicer::Slicer;
pub use crate::state::State;
pub use crate::value::Var;
