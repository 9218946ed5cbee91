//! Core of the flood-control-aware Telegram bot client.
//!
//! This crate is framework-agnostic: the HTTP transport, the update poller and
//! the command router live in `tgb-telegram` and talk to this crate through the
//! [`messaging::port::Transport`] port.

pub mod args;
pub mod config;
pub mod domain;
pub mod errors;
pub mod formatting;
pub mod logging;
pub mod messaging;
pub mod richtext;
pub mod scheduler;

pub use errors::{Error, Result};
