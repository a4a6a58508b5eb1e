//! Precision options of the symbolic analysis.

use serde::{Deserialize, Serialize};

/// Controls how much value sharing the transfer functions expose.
///
/// These toggles only change which identifiers get reused; control flow
/// and the legality of a program never depend on them. Hold one value
/// fixed for a whole analysis run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Options {
    /// `local.get` pushes the local's current identifier instead of a
    /// fresh one.
    ///
    /// Memory cells are keyed by the address identifier, so with this off
    /// two `local.get`s of the same local address different cells: a load
    /// through one does not see a store through the other, and slicing
    /// the load does not keep the store.
    #[serde(default)]
    pub propagate_locals: bool,
    /// `global.get` pushes the global's current identifier instead of a
    /// fresh one.
    #[serde(default)]
    pub propagate_globals: bool,
    /// Literals push a shared `Constant` identifier instead of a fresh one.
    #[serde(default)]
    pub use_constants: bool,
}

impl Options {
    /// Every toggle on: maximal sharing.
    pub fn propagating() -> Options {
        Options {
            propagate_locals: true,
            propagate_globals: true,
            use_constants: true,
        }
    }
}
