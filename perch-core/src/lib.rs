//! Perch Core - Shared wire types
//!
//! This crate contains the JSON shapes exchanged between the perch daemon
//! (`perch-server`) and the dashboard / interstitial pages: app and service
//! views, the status model, and the two kinds of server-sent event payloads.
//!
//! Process supervision, config loading and the HTTP surface live in
//! `perch-server`.

mod protocol;

pub use protocol::*;
