//! Reelsync-Media: timeline logic for trimmed, A/V-synchronized transcodes.
//!
//! This crate holds the pure, single-threaded bookkeeping that decides which
//! video frames and which auxiliary packets end up in the output. It does no
//! I/O; the demux reader in `reelsync-av` drives it.
//!
//! # Modules
//!
//! - `ledger` - Frame position ledger: demux order in, presentation order out
//! - `estimate` - Average framerate estimation from duration histograms
//! - `trim` - Trim ranges and first-keyframe compensation
//! - `sync` - Auxiliary stream accept/reject decisions with drift tracking
//!
//! # Architecture
//!
//! During startup the reader feeds frames into the [`Ledger`] until the
//! [`FramerateEstimator`] is confident about the average framerate. The
//! number of frames skipped before the first keyframe then shifts the user's
//! trims ([`TrimSet::compile`]). From there on every auxiliary packet whose
//! timestamp is covered by fixed ledger frames goes through the
//! [`SyncFilter`].

pub mod error;
pub mod estimate;
pub mod ledger;
pub mod sync;
pub mod trim;

pub use error::{Error, Result};
pub use estimate::{DurationHistogram, Estimate, EstimatorInput, FrameSupply, FramerateEstimator};
pub use ledger::{FrameRecord, Ledger, LedgerProgress, PicStruct, PtsStatus, REORDER_DEPTH};
pub use sync::{AuxStreamState, PacketSpan, SyncFilter};
pub use trim::{TrimRange, TrimSet};
