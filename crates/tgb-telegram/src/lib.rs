//! Telegram Bot API client.
//!
//! `HttpTransport` talks to the API, `tgb_core::scheduler` paces and retries
//! outgoing calls, and [`Bot`] ties both to the long-poll loop, the command
//! dispatcher and question/answer conversations.

pub mod bot;
pub mod commands;
pub mod conversation;
pub mod poller;
pub mod receiver;
pub mod transport;

pub use bot::{Bot, Listener};
pub use commands::{handler_fn, Command, CommandHandler, Denial, Registration, Registry, Scope};
pub use receiver::ChatReceiver;
pub use transport::HttpTransport;
