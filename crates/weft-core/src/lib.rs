//! # weft-core
//!
//! Core types shared across the weft fiber runtime: fiber/watcher/timer
//! handles, fiber states, error types and environment helpers.
//!
//! This crate is platform-independent and has no dependencies; everything
//! that touches the kernel lives in `weft-runtime`.

pub mod env;
pub mod error;
pub mod id;
pub mod state;

pub use error::{RtError, RtResult};
pub use id::{FiberId, TimerId, WatcherId};
pub use state::FiberState;
