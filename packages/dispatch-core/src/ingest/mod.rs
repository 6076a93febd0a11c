//! Ingest Sources (C7): three concrete producers feeding the same handler
//! registry — MQTT, a directory watcher, and an HTTP upload acceptor. All
//! three parse into the same [`crate::records::Record`] and are otherwise
//! indistinguishable downstream.

pub mod mqtt;
pub mod upload;
pub mod watch;
