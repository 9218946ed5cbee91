//! Bot API plumbing: wire records, payload encoding, the transport port and pacing gates.

pub mod gate;
pub mod payload;
pub mod port;
pub mod types;
