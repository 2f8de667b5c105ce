//! Reelsync-Common: Shared types, time arithmetic, and errors.
//!
//! This crate provides functionality used across the reelsync crates:
//!
//! - **Rational time**: exact timebase arithmetic (`Rational`, rescaling,
//!   cross-timebase comparison)
//! - **Core Types**: stream kinds and output track keys
//! - **Error Handling**: Common error types and result aliases
//!
//! # Examples
//!
//! ```
//! use reelsync_common::{Rational, StreamKind, TrackKey};
//!
//! let tb = Rational::new(1, 90_000);
//! let ms = Rational::new(1, 1_000);
//! assert_eq!(Rational::rescale(90_000, tb, ms), 1_000);
//!
//! let key = TrackKey::new(1, 0);
//! assert_eq!(key.kind(), StreamKind::Audio);
//! ```

pub mod error;
pub mod rational;
pub mod types;

pub use error::{Error, Result};
pub use rational::{gcd, Rational};
pub use types::*;
