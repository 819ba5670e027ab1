//! Core of the membership bot.
//!
//! The bot listens for direct messages and enrolls every sender into one
//! shared group, keeping a configured administrator promoted there. The
//! messaging network lives behind the ports in [`ports`]; [`loopback`] is an
//! in-process implementation of them.

pub mod app;
pub mod config;
pub mod dispatch;
pub mod domain;
pub mod errors;
pub mod logging;
pub mod loopback;
pub mod ports;
pub mod reconcile;
pub mod supervisor;

pub use errors::{Error, Result};
