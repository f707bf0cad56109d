use super::Catalog;
use crate::Result;

/// Consumes the catalog track, returning each full-replacement update.
///
/// Grounded on `hang::catalog::produce::CatalogConsumer`: the catalog track
/// is subscribed lazily, on first [`Self::next`] call, and each JSON group
/// fully replaces the previous catalog (spec.md §6).
pub struct CatalogConsumer {
	track: Option<moq_lite::TrackConsumer>,
	group: Option<moq_lite::GroupConsumer>,
}

impl CatalogConsumer {
	/// Subscribe to the catalog track of `broadcast`.
	pub fn new(broadcast: moq_lite::BroadcastConsumer) -> Self {
		let track = broadcast.subscribe_track(Catalog::default_track(), Catalog::default_delivery());
		Self {
			track: Some(track),
			group: None,
		}
	}

	/// Wait for and return the next catalog update, or `None` once the
	/// catalog track ends.
	pub async fn next(&mut self) -> Result<Option<Catalog>> {
		loop {
			tokio::select! {
				biased;
				Some(group) = async { self.track.as_mut()?.next_group().await.transpose() } => {
					// A new catalog group supersedes any group we were mid-read on;
					// we only care about the latest full replacement.
					self.group = Some(group?);
				}
				Some(frame) = async { self.group.as_mut()?.read_frame().await.transpose() } => {
					let catalog = Catalog::from_slice(&frame?)?;
					return Ok(Some(catalog));
				}
				else => return Ok(None),
			}
		}
	}
}

#[cfg(test)]
mod tests {
	// Exercised end-to-end via `tests/catalog.rs`, which needs a real
	// `moq_lite::Broadcast` pair to produce/consume against.
}
