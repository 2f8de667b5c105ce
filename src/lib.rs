//! Reelsync - trim-aware A/V sync transcode pipeline
//!
//! This library crate exposes the configuration layer and the transcode
//! driver for the CLI and for integration testing.

pub mod config;
pub mod transcode;
