//! # ice-daq
//!
//! Data-acquisition daemon for an in-ice radio detector station. Two custom
//! digitizers hang off a single-board computer: the RADIANT (24-channel
//! waveform digitizer) and the FLOWER (low-threshold trigger board). The
//! daemon acquires triggered waveform events, servoes trigger thresholds
//! against observed scaler rates, snapshots device health, and persists
//! everything per run as gzip-wrapped records.
//!
//! ## Threads
//! - **main**: setup, signal handling, config reload, run-duration and
//!   disk-space enforcement, teardown.
//! - **acquire**: polls the RADIANT for triggered events and publishes them
//!   through the arena-backed event ring.
//! - **monitor**: scaler reads, both PID threshold servos, soft triggers,
//!   calpulser sweeps, periodic status snapshots.
//! - **writer**: drains both rings, rotates gzip output files, mirrors
//!   status into shared memory, publishes health.
//! - **serve**: answers HTTP health queries.
//!
//! The platform is effectively single-core, but the locking discipline
//! (documented in [`daq`]) assumes true parallelism.

pub mod arena;
pub mod buf;
pub mod config;
pub mod daq;
pub mod device;
pub mod health;
pub mod pipeline;
pub mod records;
pub mod rundir;
pub mod serve;
pub mod servo;
pub mod status;
pub mod watchdog;
