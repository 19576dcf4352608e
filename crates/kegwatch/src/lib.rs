//! Station library behind the `kegwatch` binary.
//!
//! The launcher in `main.rs` is a thin shell; configuration, the
//! bring-up drivers and the runtime wiring live here so integration
//! tests can drive a full station without a terminal.

pub mod config;
pub mod drivers;
pub mod runtime;
