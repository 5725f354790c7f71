//! kafkatap probe internals: capture, reassembly, and the per-flow decode
//! drivers. The `kafkatap` binary wires these together; tests drive them
//! directly.

pub mod assembly;
pub mod capture;
pub mod driver;
pub mod reassembly;
