//! The broadcast orchestrator, C6 (spec.md §4.4 wiring notes, §9 "Cyclic
//! graph"). Resolves a path against a [`moq_lite::OriginConsumer`]'s
//! announcements into a [`moq_lite::BroadcastConsumer`], wires it to a
//! [`CatalogConsumer`], and the catalog's rendition maps to a [`VideoSource`]
//! and [`AudioSource`].
//!
//! Per the cyclic-graph note, this type owns the shared [`MediaPipeline`]
//! and hands clones of it to both sources; neither source ever reaches back
//! into the other.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::assembly::{AppendSink, MediaPipeline};
use crate::audio::{AudioRenderer, AudioSource, AudioTarget};
use crate::catalog::{AudioConfig, Catalog, CatalogConsumer, VideoConfig};
use crate::model::ContainerMode;
use crate::reactive::{Scope, Signal};
use crate::video::{VideoSource, VideoTarget};
use crate::{Error, Result};

/// The one config object passed to broadcast construction (spec.md §6
/// "Configuration", SPEC_FULL.md §2.3).
#[derive(Debug, Clone, PartialEq)]
pub struct BroadcastConfig {
	pub enabled: bool,
	pub latency: Duration,
	/// If true, wait for the broadcast's announcement to go active before
	/// opening it; if false, open as soon as it's announced at all.
	pub reload: bool,
	pub target: VideoTarget,
}

impl Default for BroadcastConfig {
	fn default() -> Self {
		Self {
			enabled: true,
			latency: Duration::from_millis(500),
			reload: false,
			target: VideoTarget::default(),
		}
	}
}

/// Orchestrates a single broadcast's catalog, video, and audio sources.
pub struct Broadcast<S: AppendSink, R: AudioRenderer> {
	scope: Scope,
	catalog: Signal<Option<Catalog>>,
	video: Arc<VideoSource<S>>,
	audio: Arc<AudioSource<R, S>>,
	_pipeline: Option<Arc<MediaPipeline<S>>>,
	/// Kept alive so the audio-target watch channel never closes; the audio
	/// source has no configurable rendition target of its own today.
	_audio_target_tx: watch::Sender<AudioTarget>,
}

impl<S: AppendSink, R: AudioRenderer> Broadcast<S, R> {
	/// Resolve `path` against `origin`'s announcements, subscribe to the
	/// resulting broadcast's catalog, and drive it. Waits for the first
	/// catalog document before returning, since renditions aren't known
	/// until then.
	///
	/// `config.reload` gates how the announcement is awaited: if true, scans
	/// past announce/unannounce flips until the broadcast is active; if
	/// false, opens it as soon as it's announced at all.
	pub async fn new(
		mut origin: moq_lite::OriginConsumer,
		path: impl Into<String>,
		config: watch::Receiver<BroadcastConfig>,
		sink: S,
		renderer: R,
	) -> Result<Self> {
		let path = path.into();
		let wait_for_active = config.borrow().reload;
		let broadcast = Self::resolve(&mut origin, &path, wait_for_active).await?;

		let mut catalog_consumer = CatalogConsumer::new(broadcast.clone());
		let first = catalog_consumer.next().await?.ok_or(Error::TransportClosed)?;

		let pipeline = Self::build_pipeline(&first, sink).await?;

		let video_renditions = first.video.as_ref().map(|v| v.renditions.clone()).unwrap_or_default();
		let audio_renditions = first.audio.as_ref().map(|a| a.renditions.clone()).unwrap_or_default();
		let display = first.video.as_ref().and_then(|v| v.display);

		let (video_renditions_tx, video_renditions_rx) = watch::channel(video_renditions);
		let (audio_renditions_tx, audio_renditions_rx) = watch::channel(audio_renditions);

		let initial = config.borrow().clone();
		let (video_target_tx, video_target_rx) = watch::channel(initial.target.clone());
		let (audio_target_tx, audio_target_rx) = watch::channel(AudioTarget::default());
		let (enabled_tx, enabled_rx) = watch::channel(initial.enabled);
		let (latency_tx, latency_rx) = watch::channel(initial.latency);

		let catalog_signal = Signal::new(Some(first));

		let video = Arc::new(VideoSource::new(
			broadcast.clone(),
			video_renditions_rx,
			video_target_rx,
			latency_rx.clone(),
			pipeline.clone(),
		));
		video.set_display(display);

		let audio = Arc::new(AudioSource::new(
			broadcast,
			audio_renditions_rx,
			audio_target_rx,
			enabled_rx,
			latency_rx,
			renderer,
			pipeline.clone(),
		));

		let scope = Scope::new();
		scope.spawn(Self::run_catalog(
			catalog_consumer,
			catalog_signal.clone(),
			video_renditions_tx,
			audio_renditions_tx,
			video.clone(),
		));
		scope.spawn(Self::run_config(config, video_target_tx, enabled_tx, latency_tx));

		Ok(Self {
			scope,
			catalog: catalog_signal,
			video,
			audio,
			_pipeline: pipeline,
			_audio_target_tx: audio_target_tx,
		})
	}

	pub fn catalog(&self) -> Signal<Option<Catalog>> {
		self.catalog.clone()
	}

	pub fn video(&self) -> &VideoSource<S> {
		&self.video
	}

	pub fn audio(&self) -> &AudioSource<R, S> {
		&self.audio
	}

	pub fn close(&self) {
		self.video.close();
		self.audio.close();
		self.scope.close();
	}

	/// Open the shared pipeline if the initial catalog has any
	/// fragmented-container video rendition (spec.md §4.5 lifecycle steps
	/// 1–2); otherwise every rendition runs Path A and no pipeline is needed.
	async fn build_pipeline(catalog: &Catalog, sink: S) -> Result<Option<Arc<MediaPipeline<S>>>> {
		let Some(video) = &catalog.video else { return Ok(None) };

		let Some(config) = video
			.renditions
			.values()
			.find(|config| config.container == ContainerMode::FragmentedContainer)
		else {
			return Ok(None);
		};

		let pipeline = MediaPipeline::new(sink);
		let mime = format!("video/mp4; codecs=\"{}\"", config.codec);
		pipeline.open(&mime).await?;
		Ok(Some(pipeline))
	}

	async fn run_catalog(
		mut consumer: CatalogConsumer,
		catalog: Signal<Option<Catalog>>,
		video_renditions: watch::Sender<BTreeMap<String, VideoConfig>>,
		audio_renditions: watch::Sender<BTreeMap<String, AudioConfig>>,
		video: Arc<VideoSource<S>>,
	) {
		loop {
			match consumer.next().await {
				Ok(Some(next)) => {
					video_renditions.send_replace(next.video.as_ref().map(|v| v.renditions.clone()).unwrap_or_default());
					audio_renditions.send_replace(next.audio.as_ref().map(|a| a.renditions.clone()).unwrap_or_default());
					video.set_display(next.video.as_ref().and_then(|v| v.display));
					catalog.set(Some(next));
				}
				Ok(None) => return,
				Err(err) => {
					tracing::warn!(%err, "catalog track ended with error");
					return;
				}
			}
		}
	}

	async fn run_config(
		mut config: watch::Receiver<BroadcastConfig>,
		video_target: watch::Sender<VideoTarget>,
		enabled: watch::Sender<bool>,
		latency: watch::Sender<Duration>,
	) {
		loop {
			if config.changed().await.is_err() {
				return;
			}
			let current = config.borrow().clone();
			video_target.send_replace(current.target.clone());
			enabled.send_replace(current.enabled);
			latency.send_replace(current.latency);
		}
	}

	/// Consume `origin`'s announcements until `path` resolves to a broadcast.
	/// `wait_for_active` keeps scanning past unannounce/re-announce flips for
	/// `path` until a `Some` broadcast shows up; otherwise the first
	/// announcement for `path` is taken as-is.
	async fn resolve(origin: &mut moq_lite::OriginConsumer, path: &str, wait_for_active: bool) -> Result<moq_lite::BroadcastConsumer> {
		loop {
			let (announced, broadcast) = origin.announced().await.ok_or(Error::TransportClosed)?;
			if announced.to_string() != path {
				continue;
			}
			match broadcast {
				Some(broadcast) => return Ok(broadcast),
				None if wait_for_active => continue,
				None => return Err(Error::TransportClosed),
			}
		}
	}
}

impl<S: AppendSink, R: AudioRenderer> Drop for Broadcast<S, R> {
	fn drop(&mut self) {
		self.close();
	}
}
