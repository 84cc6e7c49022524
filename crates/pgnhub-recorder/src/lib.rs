//! `pgnhub-recorder` – persists the live stream to disk.
//!
//! - [`recorder`] – the [`Recorder`]: start, stop, per-message writes and
//!   progress reporting.
//! - [`files`] – listing, resolving and deleting finished recordings, all
//!   confined to the recordings directory.

pub mod files;
pub mod recorder;

pub use recorder::{DEFAULT_PROGRESS_INTERVAL, Recorder, RecorderEvent, StartOptions};
