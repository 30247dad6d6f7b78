//! Coherence engine of one level of a hierarchical MESI/MSI cache, with a
//! discrete-event harness to drive it.

pub mod mesi;
pub mod sim;
