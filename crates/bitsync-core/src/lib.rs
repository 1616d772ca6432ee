//! bitsync Core - Download Coordination Engine
//!
//! This crate fetches content-addressed bits exactly once per hash no matter
//! how many callers ask for them, fans throttled progress out to every
//! observer, and cleans up after itself when transfers settle.
//!
//! The byte-level transfer is delegated to a [`BitTransport`] injected with
//! [`Coordinator::set_backend`].

mod binding;
mod engine;
mod error;
mod global;
mod transport;

pub use binding::*;
pub use engine::*;
pub use error::*;
pub use global::*;
pub use transport::*;

pub use bitsync_types::{
    Bit, BitPack, BitTotals, EngineSettings, PackPlan, SpeedReport, TransferSnapshot,
};
