//! Composition roots for the coordination processes.
//!
//! Each process builds its stores, registries and bus handles once and passes
//! them down by `Arc`; nothing is looked up through globals.

pub mod saga;
pub mod session;
pub mod shutdown;
