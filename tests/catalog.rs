//! End-to-end coverage of `CatalogConsumer` against a real `moq_lite`
//! broadcast pair, since the unit tests in `src/catalog/consumer.rs` can't
//! construct one themselves.

use hang::catalog::{Catalog, CatalogConsumer, Video, VideoConfig};
use hang::model::ContainerMode;

#[tokio::test]
async fn receives_first_catalog_and_updates() {
	let moq_lite::Produce { mut producer, consumer } = moq_lite::Broadcast::produce();

	let catalog_track = Catalog::default_track().produce();
	producer.publish_track(catalog_track.producer.clone()).unwrap();

	let mut consumer = CatalogConsumer::new(consumer);

	let mut catalog = Catalog::default();
	catalog.video = Some(Video {
		display: None,
		flip: false,
		renditions: [(
			"high".to_string(),
			VideoConfig {
				codec: "avc1.64001f".to_string(),
				description: None,
				coded_width: Some(1920),
				coded_height: Some(1080),
				container: ContainerMode::Varint,
				init_segment: None,
				optimize_for_latency: None,
				priority: None,
			},
		)]
		.into_iter()
		.collect(),
	});

	let mut track_producer = catalog_track.producer;
	let mut group = track_producer.append_group().unwrap();
	group.write_frame(catalog.to_string().unwrap(), moq_lite::Time::default()).ok();
	group.close().ok();

	let received = consumer.next().await.unwrap().unwrap();
	assert_eq!(received.video.as_ref().unwrap().renditions.len(), 1);
	assert_eq!(received.video.as_ref().unwrap().renditions["high"].codec, "avc1.64001f");

	// A second group fully replaces the first (spec.md §6).
	let empty = Catalog::default();
	let mut group = track_producer.append_group().unwrap();
	group.write_frame(empty.to_string().unwrap(), moq_lite::Time::default()).ok();
	group.close().ok();

	let replaced = consumer.next().await.unwrap().unwrap();
	assert!(replaced.video.is_none());
}

#[tokio::test]
async fn ends_when_track_closes() {
	let moq_lite::Produce { mut producer, consumer } = moq_lite::Broadcast::produce();

	let catalog_track = Catalog::default_track().produce();
	producer.publish_track(catalog_track.producer.clone()).unwrap();

	let mut consumer = CatalogConsumer::new(consumer);
	let mut track_producer = catalog_track.producer;

	track_producer.close().ok();
	drop(track_producer);
	drop(producer);

	assert!(consumer.next().await.unwrap().is_none());
}
