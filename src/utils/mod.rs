//! Process-level helpers for binaries embedding the engine.

pub mod bootstrap;
