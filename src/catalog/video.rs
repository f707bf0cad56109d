use std::collections::BTreeMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_with::{base64::Base64, hex::Hex};

use crate::model::ContainerMode;

/// The catalog's video section (spec.md §3 Catalog, §6 rendition fields).
#[serde_with::skip_serializing_none]
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Video {
	/// Render the video at this size in pixels.
	#[serde(default)]
	pub display: Option<Display>,

	/// If true, the decoder/renderer should flip the video horizontally.
	#[serde(default)]
	pub flip: bool,

	/// A map of rendition name to codec configuration.
	/// A `BTreeMap` so keys sort deterministically and JSON Merge Patch works.
	pub renditions: BTreeMap<String, VideoConfig>,
}

impl Video {
	pub fn is_empty(&self) -> bool {
		self.renditions.is_empty()
	}
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Display {
	pub width: u32,
	pub height: u32,
}

/// A video rendition: a named codec configuration (spec.md §3 Rendition).
#[serde_with::serde_as]
#[serde_with::skip_serializing_none]
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct VideoConfig {
	/// The codec mimetype string, e.g. `avc1.64001f`.
	pub codec: String,

	/// Codec-specific initialization data (e.g. SPS/PPS for H.264).
	#[serde(default)]
	#[serde_as(as = "Option<Hex>")]
	pub description: Option<Bytes>,

	pub coded_width: Option<u32>,
	pub coded_height: Option<u32>,

	/// Which container mode this rendition is delivered in. Defaults to
	/// `varint` for backwards compatibility with codec-based decode.
	#[serde(default)]
	pub container: ContainerMode,

	/// The fragmented-container init segment (ftyp+moov), required when
	/// `container = fragmented-container` (spec.md invariant I4).
	#[serde(default)]
	#[serde_as(as = "Option<Base64>")]
	pub init_segment: Option<Bytes>,

	#[serde(default)]
	pub optimize_for_latency: Option<bool>,

	#[serde(default)]
	pub priority: Option<u8>,
}

impl VideoConfig {
	pub fn pixels(&self) -> Option<u64> {
		Some(self.coded_width? as u64 * self.coded_height? as u64)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn defaults_to_varint_container() {
		let json = r#"{"codec":"avc1.64001f"}"#;
		let config: VideoConfig = serde_json::from_str(json).unwrap();
		assert_eq!(config.container, ContainerMode::Varint);
		assert!(config.init_segment.is_none());
	}

	#[test]
	fn pixel_count() {
		let config = VideoConfig {
			coded_width: Some(1920),
			coded_height: Some(1080),
			..Default::default()
		};
		assert_eq!(config.pixels(), Some(1920 * 1080));
	}
}
