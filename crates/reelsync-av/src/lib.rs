//! # reelsync-av
//!
//! Threaded demux/mux pipeline that keeps audio and subtitles in sync with
//! a trimmed video stream.
//!
//! This crate provides:
//! - External boundaries: [`PacketSource`], [`PictureParser`], [`HwSession`],
//!   [`PacketSink`], [`AuxDecoder`] and [`AuxEncoder`]
//! - A demux reader that estimates the framerate, compiles trims and filters
//!   auxiliary packets against the frame ledger ([`Demuxer`])
//! - A mux writer with optional process/encode/output threads ([`Muxer`])
//! - Bounded queues with a keep-length floor ([`PacketQueue`])
//! - JSON-lines packet logs standing in for container files
//! - A pixel-conversion registry keyed by CPU capabilities
//!
//! ## Example
//!
//! ```no_run
//! use reelsync_av::{Demuxer, PacketLogSource, ProgressiveParser, ReaderSettings};
//!
//! let source = PacketLogSource::open("input.jsonl".as_ref())?;
//! let mut demuxer = Demuxer::open(
//!     Box::new(source),
//!     Box::new(ProgressiveParser),
//!     ReaderSettings::default(),
//! )?;
//! println!("framerate: {}", demuxer.video_info().avg_framerate);
//! while let Some(packet) = demuxer.next_video_packet()? {
//!     let _aux = demuxer.take_aux_packets()?;
//!     println!("video packet: {} bytes", packet.size());
//! }
//! demuxer.close()?;
//! # Ok::<(), reelsync_av::Error>(())
//! ```

pub mod bitstream;
pub mod codec;
pub mod convert;
mod error;
pub mod packet;
pub mod packet_log;
pub mod queue;
pub mod reader;
pub mod source;
pub mod writer;

// Re-exports
pub use codec::{AvSyncMode, Bitstream, CopySession, HwSession, DECODED_SURFACE};
pub use convert::{find_converter, ColorSpace, SimdCaps};
pub use error::{Error, Result};
pub use packet::{Packet, PacketFlags};
pub use packet_log::{write_packet_log, LogHeader, PacketLogSink, PacketLogSource};
pub use queue::{PacketQueue, QueueUsage, UNBOUNDED};
pub use reader::{
    AudioSelect, AuxTrack, Demuxer, ReaderSettings, Timeline, TrackSelect, VideoInfo,
    TRIM_OVERREAD_FRAMES,
};
pub use source::{
    MemorySource, PacketSource, PictureInfo, PictureParser, ProgressiveParser, StreamInfo,
    VideoCodec,
};
pub use writer::{
    output_tracks, AuxCodecs, AuxDecoder, AuxEncoder, MemorySink, MuxHeader, MuxStats, Muxer,
    OutputTrack, PacketSink, PassthroughCodec, SinkEvent, WriterSettings,
};
