use std::collections::BTreeMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_with::{base64::Base64, hex::Hex};

use crate::model::ContainerMode;

/// The catalog's audio section (spec.md §3 Catalog).
#[serde_with::skip_serializing_none]
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Audio {
	/// A map of rendition name to codec configuration.
	pub renditions: BTreeMap<String, AudioConfig>,

	#[serde(default)]
	pub priority: Option<u8>,
}

impl Audio {
	pub fn is_empty(&self) -> bool {
		self.renditions.is_empty()
	}
}

/// An audio rendition (spec.md §6 "Rendition document fields (audio)").
#[serde_with::serde_as]
#[serde_with::skip_serializing_none]
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct AudioConfig {
	pub codec: String,

	pub sample_rate: u32,

	#[serde(rename = "numberOfChannels")]
	pub channel_count: u32,

	#[serde(default)]
	pub container: ContainerMode,

	#[serde(default)]
	#[serde_as(as = "Option<Hex>")]
	pub description: Option<Bytes>,

	/// The init segment, required when `container = fragmented-container`.
	///
	/// Per spec.md §9's open question, this crate only supports the
	/// explicit field; in-band "moov" scanning is a legacy fallback this
	/// implementation does not build (see DESIGN.md).
	#[serde(default)]
	#[serde_as(as = "Option<Base64>")]
	pub init_segment: Option<Bytes>,

	#[serde(default)]
	pub priority: Option<u8>,
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn default_container_is_varint() {
		let json = r#"{"codec":"opus","sampleRate":48000,"numberOfChannels":2}"#;
		let config: AudioConfig = serde_json::from_str(json).unwrap();
		assert_eq!(config.container, ContainerMode::Varint);
	}
}
