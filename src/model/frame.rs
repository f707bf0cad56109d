use bytes::Bytes;

use super::Timestamp;

/// A single decoded media frame, tagged with the group that delivered it.
///
/// `keyframe` is never carried on the wire; it is reconstructed by the
/// [`crate::consumer::FrameConsumer`] (true for the first frame read out of
/// each group, false otherwise — spec invariant I1).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
	pub data: Bytes,
	pub timestamp: Timestamp,
	pub keyframe: bool,
	pub group: u64,
}
