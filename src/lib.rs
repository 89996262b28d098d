//! Packet capture and analysis engine.
//!
//! Frames come either from a live interface ([`capture`]) or from stored
//! pcap/pcapng files ([`decode`]). Decoded captures feed single-capture
//! analysis reports and multi-capture timelines ([`report`]), all served over
//! HTTP by [`server`].

pub mod capture;
pub mod config;
pub mod decode;
pub mod error;
pub mod model;
pub mod report;
pub mod server;
pub mod store;

#[cfg(test)]
mod fixtures;

pub use error::{Error, Result};
