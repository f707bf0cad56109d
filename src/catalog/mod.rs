//! The broadcast's self-describing manifest (spec.md §3 Catalog, §6
//! "Catalog document").

mod audio;
mod consumer;
mod video;

pub use audio::*;
pub use consumer::*;
pub use video::*;

use serde::{Deserialize, Serialize};

use crate::Result;

/// Root catalog object. Delivered as a JSON document on the well-known
/// track `catalog.json` with priority 0 (highest); every update is a full
/// replacement (spec.md §6).
///
/// Sidecar tracks (chat, location, user info) are out of core scope but are
/// preserved round-trip via `extra` so a consumer never silently drops
/// fields a publisher set.
#[serde_with::skip_serializing_none]
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Catalog {
	#[serde(default)]
	pub video: Option<Video>,

	#[serde(default)]
	pub audio: Option<Audio>,

	/// Sidecar track metadata this crate doesn't interpret (chat, location,
	/// user info, ...), kept so a re-published catalog round-trips.
	#[serde(flatten)]
	pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Catalog {
	/// The well-known track the catalog is published on.
	pub const TRACK_NAME: &'static str = "catalog.json";

	/// The priority of the catalog track: highest, so it's never starved by
	/// media tracks during congestion.
	pub const TRACK_PRIORITY: u8 = 0;

	pub fn default_track() -> moq_lite::Track {
		moq_lite::Track {
			name: Self::TRACK_NAME.to_string(),
			priority: Self::TRACK_PRIORITY,
			max_latency: std::time::Duration::ZERO,
		}
	}

	/// Subscriber-side delivery preferences for the catalog track: never
	/// expire a cached catalog and always deliver groups in order, since a
	/// stale "full replacement" catalog is worse than a slightly late one.
	pub fn default_delivery() -> moq_lite::Delivery {
		moq_lite::Delivery {
			priority: Self::TRACK_PRIORITY,
			max_latency: moq_lite::Time::ZERO,
			ordered: true,
		}
	}

	pub fn from_slice(data: &[u8]) -> Result<Self> {
		Ok(serde_json::from_slice(data)?)
	}

	pub fn to_string(&self) -> Result<String> {
		Ok(serde_json::to_string(self)?)
	}
}
