//! Notification delivery worker.
//!
//! Consumes due notifications from the notification stream, looks up live
//! arrivals, sends a Web Push message and records the send on the row.

pub mod arrivals;
pub mod delivery;
pub mod payload;
pub mod push;
pub mod store;
