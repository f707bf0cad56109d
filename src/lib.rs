//! # hang: the watch-side media pipeline for MoQ broadcasts
//!
//! Built on top of the generic [`moq_lite`] transport, this crate turns a
//! subscribed [`moq_lite::BroadcastConsumer`] into decoded video/audio
//! signals: it reads the broadcast's self-describing JSON catalog, jitter
//! buffers and reorders each track's groups, selects a rendition, and runs
//! one of two decode paths (per-frame codec decode, or fragmented-container
//! assembly) to produce a reactive `current_frame` signal.
//!
//! ## Modules
//!
//! - [`catalog`]: the JSON manifest describing a broadcast's tracks and
//!   renditions, plus [`catalog::CatalogConsumer`] to subscribe to it live.
//! - [`model`]: wire types shared by every component — [`model::Frame`],
//!   [`model::Timestamp`], and the per-frame [`model::ContainerMode`] header
//!   codec.
//! - [`consumer`]: the jitter-buffered, group-reordering frame consumer.
//! - [`video`] / [`audio`]: the adaptive sources that pick a rendition and
//!   run Path A (codec decode, `decode` feature) or Path B (container
//!   assembly via [`assembly`]).
//! - [`assembly`]: the host-agnostic dual-buffer container-assembly sink.
//! - [`reactive`]: the `Signal`/`Scope` primitives the rest of the crate is
//!   composed from.
//! - [`broadcast`]: wires the above into a single broadcast orchestrator.
//!
//! Path A decoding uses FFmpeg via `ffmpeg-next` and requires a system
//! FFmpeg installation to link against.

mod error;

pub mod assembly;
pub mod audio;
pub mod broadcast;
pub mod catalog;
pub mod consumer;
pub mod model;
pub mod reactive;
pub mod video;

// export the moq-lite version in use
pub use moq_lite;

pub use error::*;
