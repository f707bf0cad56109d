//! The audio source, C4 (spec.md §4.3): the same rendition-selection and
//! pending/active gapless-switching contract as [`crate::video`], adapted to
//! PCM rendering instead of frame display, plus an enabled/disabled mode.

pub mod decode;

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{watch, Notify};

use crate::assembly::{AppendSink, BufferKind, MediaPipeline};
use crate::catalog::AudioConfig;
use crate::consumer::FrameConsumer;
use crate::model::Timestamp;
use crate::reactive::{Scope, Signal};
use crate::video::{BufferStatus, Stats, SyncStatus, SYNC_WAIT_THRESHOLD};
use crate::{Error, Result};

pub use decode::{AudioDecoder, DecodedFrame};

/// The caller's rendition goal (spec.md §4.3: "same contract as §4.2").
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AudioTarget {
	pub rendition: Option<String>,
}

/// A host-provided PCM playback sink for Path A (spec.md §4.3: "a
/// single-sample-rate audio rendering graph that cooperatively schedules
/// playback under a latency budget"). Mirrors [`AppendSink`]'s shape.
pub trait AudioRenderer: Send + Sync + 'static {
	/// (Re)configure the rendering graph for a new sample rate/channel count.
	fn configure(&self, sample_rate: u32, channels: u32) -> impl Future<Output = Result<()>> + Send;

	/// Render one decoded PCM frame, scheduling it under the graph's own
	/// latency budget.
	fn render(&self, frame: DecodedFrame) -> impl Future<Output = Result<()>> + Send;
}

fn select_rendition<'a>(
	renditions: &'a BTreeMap<String, AudioConfig>,
	eligible: impl Fn(&str) -> bool,
	target: &AudioTarget,
) -> Option<&'a str> {
	if let Some(name) = &target.rendition {
		if eligible(name) && renditions.contains_key(name) {
			return Some(renditions.get_key_value(name)?.0.as_str());
		}
	}
	renditions.keys().find(|name| eligible(name)).map(|s| s.as_str())
}

struct Shared {
	sync_status: Signal<SyncStatus>,
	buffer_status: Signal<BufferStatus>,
	stats: Signal<Stats>,
	state: Mutex<State>,
	notify: Notify,
}

struct State {
	ineligible: std::collections::HashSet<String>,
	active: Option<String>,
	pending: Option<String>,
}

impl Shared {
	fn is_eligible(&self, name: &str) -> bool {
		!self.state.lock().unwrap().ineligible.contains(name)
	}

	fn remove_eligible(&self, name: &str) {
		self.state.lock().unwrap().ineligible.insert(name.to_string());
		self.notify.notify_one();
	}
}

/// The audio source. Generic over the Path A renderer `R` and the Path B
/// shared pipeline's sink `S`.
pub struct AudioSource<R: AudioRenderer, S: AppendSink> {
	shared: Arc<Shared>,
	scope: Scope,
	_renderer: Arc<R>,
	_pipeline: Option<Arc<MediaPipeline<S>>>,
}

impl<R: AudioRenderer, S: AppendSink> AudioSource<R, S> {
	pub fn new(
		broadcast: moq_lite::BroadcastConsumer,
		renditions: watch::Receiver<BTreeMap<String, AudioConfig>>,
		target: watch::Receiver<AudioTarget>,
		enabled: watch::Receiver<bool>,
		latency: watch::Receiver<Duration>,
		renderer: R,
		pipeline: Option<Arc<MediaPipeline<S>>>,
	) -> Self {
		let shared = Arc::new(Shared {
			sync_status: Signal::new(SyncStatus::Ready),
			buffer_status: Signal::new(BufferStatus::Empty),
			stats: Signal::new(Stats::default()),
			state: Mutex::new(State {
				ineligible: Default::default(),
				active: None,
				pending: None,
			}),
			notify: Notify::new(),
		});

		let renderer = Arc::new(renderer);
		let scope = Scope::new();
		scope.spawn(Self::reconcile(
			shared.clone(),
			broadcast,
			renditions,
			target,
			enabled,
			latency,
			renderer.clone(),
			pipeline.clone(),
		));

		Self {
			shared,
			scope,
			_renderer: renderer,
			_pipeline: pipeline,
		}
	}

	pub fn sync_status(&self) -> Signal<SyncStatus> {
		self.shared.sync_status.clone()
	}

	pub fn buffer_status(&self) -> Signal<BufferStatus> {
		self.shared.buffer_status.clone()
	}

	pub fn stats(&self) -> Signal<Stats> {
		self.shared.stats.clone()
	}

	pub fn close(&self) {
		self.scope.close();
	}

	async fn reconcile(
		shared: Arc<Shared>,
		broadcast: moq_lite::BroadcastConsumer,
		mut renditions: watch::Receiver<BTreeMap<String, AudioConfig>>,
		mut target: watch::Receiver<AudioTarget>,
		mut enabled: watch::Receiver<bool>,
		latency: watch::Receiver<Duration>,
		renderer: Arc<R>,
		pipeline: Option<Arc<MediaPipeline<S>>>,
	) {
		let mut active_scope: Option<Scope> = None;
		let mut active_scope_name: Option<String> = None;
		let mut pending_scope: Option<Scope> = None;

		// Path B's append buffer may be initialized while disabled, so the
		// two-buffer pipeline is fully formed before video starts appending
		// fragments (spec.md §4.3, §4.5 ordering).
		if let Some(pipeline) = &pipeline {
			if let Some(config) = renditions.borrow().values().next() {
				let mime = format!("audio/mp4; codecs=\"{}\"", config.codec);
				if let Err(err) = pipeline.initialize_audio(&mime).await {
					tracing::warn!(%err, "audio pipeline join-in failed");
				}
			}
		}

		loop {
			let is_enabled = *enabled.borrow();
			let current = renditions.borrow().clone();
			let goal = target.borrow().clone();

			let desired = is_enabled
				.then(|| select_rendition(&current, |name| shared.is_eligible(name), &goal))
				.flatten()
				.map(|s| s.to_string());

			let already_running = {
				let state = shared.state.lock().unwrap();
				state.active == desired || state.pending == desired
			};

			if !is_enabled {
				if let Some(scope) = pending_scope.take() {
					scope.close();
				}
				if let Some(scope) = active_scope.take() {
					scope.close();
					active_scope_name = None;
					shared.state.lock().unwrap().active = None;
				}
			} else if let Some(name) = desired.filter(|_| !already_running) {
				if let Some(config) = current.get(&name).cloned() {
					if let Some(scope) = pending_scope.take() {
						scope.close();
					}

					let sub_scope = Scope::new();
					let shared = shared.clone();
					let broadcast = broadcast.clone();
					let latency = latency.clone();
					let renderer = renderer.clone();
					let pipeline = pipeline.clone();
					let name_for_task = name.clone();

					shared.state.lock().unwrap().pending = Some(name.clone());

					sub_scope.spawn(Self::run_subscription(
						shared,
						broadcast,
						name_for_task,
						config,
						latency,
						renderer,
						pipeline,
					));
					pending_scope = Some(sub_scope);
				} else {
					shared.remove_eligible(&name);
				}
			}

			let notified = shared.notify.notified();
			tokio::select! {
				biased;
				_ = notified => {}
				Ok(()) = renditions.changed() => {}
				Ok(()) = target.changed() => {}
				Ok(()) = enabled.changed() => {}
				else => return,
			}

			let promoted_to = shared.state.lock().unwrap().active.clone();
			if let Some(name) = promoted_to {
				if active_scope_name.as_deref() != Some(name.as_str()) {
					if let Some(old) = active_scope.take() {
						old.close();
					}
					active_scope = pending_scope.take();
					active_scope_name = Some(name);
				}
			}
		}
	}

	async fn run_subscription(
		shared: Arc<Shared>,
		broadcast: moq_lite::BroadcastConsumer,
		name: String,
		config: AudioConfig,
		latency: watch::Receiver<Duration>,
		renderer: Arc<R>,
		pipeline: Option<Arc<MediaPipeline<S>>>,
	) {
		let track = moq_lite::Track {
			name: name.clone(),
			priority: config.priority.unwrap_or(0),
			max_latency: std::time::Duration::ZERO,
		};
		let delivery = moq_lite::Delivery {
			priority: config.priority.unwrap_or(0),
			max_latency: moq_lite::Time::ZERO,
			ordered: false,
		};
		let track = broadcast.subscribe_track(track, delivery);
		let mut consumer = FrameConsumer::new(track, config.container, latency.clone());

		match config.container {
			crate::model::ContainerMode::FragmentedContainer => {
				let Some(pipeline) = pipeline else {
					tracing::warn!(rendition = %name, "fragmented-container rendition with no pipeline configured");
					Self::mark_done(&shared, &name);
					return;
				};

				if let Some(init) = &config.init_segment {
					if let Err(err) = pipeline.append_init(BufferKind::Audio, init.clone()) {
						tracing::warn!(rendition = %name, %err, "audio init segment append failed");
						Self::mark_done(&shared, &name);
						return;
					}
				}

				let mut promoted = false;
				loop {
					let frame = match consumer.next_frame().await {
						Ok(Some(frame)) => frame,
						Ok(None) => break,
						Err(err) => {
							tracing::warn!(rendition = %name, %err, "audio subscription ended");
							break;
						}
					};

					if let Err(err) = pipeline.append_fragment(BufferKind::Audio, frame.data.clone()) {
						tracing::warn!(rendition = %name, %err, "audio fragment append failed");
					}

					// Container-assembly has no latency-sync wait to gate on;
					// the pipeline itself buffers, so the first appended
					// fragment promotes.
					if !promoted {
						promoted = true;
						Self::promote(&shared, &name);
					}
				}
			}
			_ => {
				let mut decoder = match AudioDecoder::new(&config.codec, config.description.as_deref()) {
					Ok(decoder) => decoder,
					Err(Error::CodecUnsupported(codec)) => {
						tracing::warn!(rendition = %name, %codec, "codec unsupported, removing rendition");
						shared.remove_eligible(&name);
						Self::mark_done(&shared, &name);
						return;
					}
					Err(err) => {
						tracing::warn!(rendition = %name, %err, "audio decoder init failed");
						Self::mark_done(&shared, &name);
						return;
					}
				};

				if let Err(err) = renderer.configure(config.sample_rate, config.channel_count).await {
					tracing::warn!(rendition = %name, %err, "audio renderer configuration failed");
					Self::mark_done(&shared, &name);
					return;
				}

				let mut anchor: Option<(Instant, Timestamp)> = None;
				let mut promoted = false;
				let mut frame_count = 0u64;
				let mut bytes_received = 0u64;

				loop {
					let frame = match consumer.next_frame().await {
						Ok(Some(frame)) => frame,
						Ok(None) => break,
						Err(err) => {
							tracing::warn!(rendition = %name, %err, "audio subscription ended");
							break;
						}
					};

					bytes_received += frame.data.len() as u64;

					let decoded = match decoder.decode(&frame) {
						Ok(Some(decoded)) => decoded,
						Ok(None) => continue,
						Err(err) => {
							tracing::warn!(rendition = %name, %err, "audio decoder error, terminating subscription");
							break;
						}
					};

					let now = Instant::now();
					let (anchor_instant, anchor_ts) = *anchor.get_or_insert((now, decoded.timestamp));
					let delay = crate::video::presentation_delay((anchor_instant, anchor_ts), decoded.timestamp, now, *latency.borrow());

					if delay > SYNC_WAIT_THRESHOLD {
						shared.sync_status.set(SyncStatus::Wait { buffer: delay });
						tokio::time::sleep(delay).await;
						shared.sync_status.set(SyncStatus::Ready);
					} else if !delay.is_zero() {
						tokio::time::sleep(delay).await;
					}

					let timestamp = decoded.timestamp;
					if let Err(err) = renderer.render(decoded).await {
						tracing::warn!(rendition = %name, %err, "audio render failed");
						break;
					}

					frame_count += 1;
					shared.buffer_status.set(BufferStatus::Filled);
					shared.stats.set(Stats {
						frame_count,
						timestamp,
						bytes_received,
					});

					// Track switching (spec.md §4.2): only promote once this
					// rendition catches up without a latency-sync wait.
					if !promoted && delay <= SYNC_WAIT_THRESHOLD {
						promoted = true;
						Self::promote(&shared, &name);
					}
				}
			}
		}

		Self::mark_done(&shared, &name);
	}

	fn promote(shared: &Arc<Shared>, name: &str) {
		let mut state = shared.state.lock().unwrap();
		if state.pending.as_deref() == Some(name) {
			state.pending = None;
			state.active = Some(name.to_string());
		}
		drop(state);
		shared.notify.notify_one();
	}

	fn mark_done(shared: &Arc<Shared>, name: &str) {
		let mut state = shared.state.lock().unwrap();
		if state.pending.as_deref() == Some(name) {
			state.pending = None;
		}
		if state.active.as_deref() == Some(name) {
			state.active = None;
		}
		drop(state);
		shared.notify.notify_one();
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn config(codec: &str) -> AudioConfig {
		AudioConfig {
			codec: codec.to_string(),
			sample_rate: 48_000,
			channel_count: 2,
			..Default::default()
		}
	}

	#[test]
	fn explicit_rendition_overrides_default() {
		let mut renditions = BTreeMap::new();
		renditions.insert("lo-fi".to_string(), config("opus"));
		renditions.insert("hi-fi".to_string(), config("mp4a.40.2"));

		let target = AudioTarget {
			rendition: Some("hi-fi".to_string()),
		};
		assert_eq!(select_rendition(&renditions, |_| true, &target), Some("hi-fi"));
	}

	#[test]
	fn falls_back_to_first_eligible() {
		let mut renditions = BTreeMap::new();
		renditions.insert("a".to_string(), config("opus"));
		renditions.insert("b".to_string(), config("opus"));

		let target = AudioTarget::default();
		assert_eq!(select_rendition(&renditions, |name| name != "a", &target), Some("b"));
	}
}
