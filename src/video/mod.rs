//! The adaptive video source, C3 (spec.md §4.2).
//!
//! Chooses a rendition, runs one of the two decode paths as a tagged variant
//! (spec.md §9 "Polymorphism"), and republishes the current frame, display
//! size, sync status, and stats as [`crate::reactive::Signal`]s. Gapless
//! rendition switching is a pending/active pair of subscriptions, each owned
//! by its own [`Scope`] so closing one never touches the other.

pub mod decode;

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{watch, Notify};

use crate::assembly::{AppendSink, BufferKind, MediaPipeline};
use crate::catalog::{Display, VideoConfig};
use crate::consumer::FrameConsumer;
use crate::model::{ContainerMode, Timestamp};
use crate::reactive::{Scope, Signal};
use crate::{Error, Result};

pub use decode::{DecodedFrame, VideoDecoder};

/// A buffered-frame duration past which presentation scheduling reports
/// `sync = wait` (spec.md §4.2 "Presentation scheduling").
pub const SYNC_WAIT_THRESHOLD: Duration = Duration::from_millis(200);

/// Bound on the B-frame reorder queue between decode and presentation
/// (spec.md §4.2 "Path A"): decode order isn't presentation order when a
/// codec reorders frames, so output is buffered and re-sorted before display.
pub const MAX_B_FRAMES: usize = 10;

/// The caller's rendition goal (spec.md §6 "Configuration").
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VideoTarget {
	pub pixels: Option<u32>,
	pub rendition: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
	Ready,
	Wait { buffer: Duration },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferStatus {
	Empty,
	Filled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Stats {
	pub frame_count: u64,
	pub timestamp: Timestamp,
	pub bytes_received: u64,
}

/// Which decode engine a rendition runs through (spec.md §9 "Polymorphism":
/// represented as a tagged variant, not subclasses).
fn decode_path(container: ContainerMode) -> DecodePath {
	match container {
		ContainerMode::FragmentedContainer => DecodePath::Assembly,
		ContainerMode::Varint | ContainerMode::RawU64 => DecodePath::Codec,
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodePath {
	Codec,
	Assembly,
}

/// Pick a rendition from the catalog (spec.md §4.2 "Rendition selection").
///
/// An explicit `target.rendition` wins outright if it's eligible. Otherwise:
/// the smallest eligible rendition whose pixel count is `>=` the target, or
/// if none qualifies, the largest eligible rendition below it. Ties break on
/// name for a stable, deterministic order.
pub fn select_rendition<'a>(
	renditions: &'a BTreeMap<String, VideoConfig>,
	eligible: impl Fn(&str) -> bool,
	target: &VideoTarget,
) -> Option<&'a str> {
	if let Some(name) = &target.rendition {
		if eligible(name) && renditions.contains_key(name) {
			return Some(renditions.get_key_value(name)?.0.as_str());
		}
	}

	let target_pixels = target.pixels.map(|p| p as u64).unwrap_or(0);

	let mut candidates: Vec<(&str, u64)> = renditions
		.iter()
		.filter(|(name, _)| eligible(name))
		.filter_map(|(name, config)| Some((name.as_str(), config.pixels()?)))
		.collect();
	candidates.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(b.0)));

	candidates
		.iter()
		.find(|(_, pixels)| *pixels >= target_pixels)
		.or_else(|| candidates.last())
		.map(|(name, _)| *name)
}

/// Compute how long to wait before presenting `frame_timestamp`, per spec.md
/// §4.2: `sleep = ref − (now − timestamp) + L`, where `ref` anchors the
/// first frame's timestamp to the wall-clock instant it was dequeued.
pub(crate) fn presentation_delay(anchor: (Instant, Timestamp), frame_timestamp: Timestamp, now: Instant, latency: Duration) -> Duration {
	let media_elapsed = frame_timestamp.saturating_duration_since(anchor.1);
	let target = anchor.0 + media_elapsed + latency;
	target.saturating_duration_since(now)
}

struct Shared {
	current_frame: Signal<Option<Arc<DecodedFrame>>>,
	display: Signal<Option<Display>>,
	sync_status: Signal<SyncStatus>,
	buffer_status: Signal<BufferStatus>,
	stats: Signal<Stats>,
	state: Mutex<State>,
	notify: Notify,
}

struct State {
	/// Renditions removed after a `CodecUnsupported` decode error.
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

/// The adaptive video source. Generic over the [`AppendSink`] backing the
/// shared container-assembly pipeline (Path B); renditions using `varint`/
/// `raw-u64` containers never touch it.
pub struct VideoSource<S: AppendSink> {
	shared: Arc<Shared>,
	scope: Scope,
	_pipeline: Option<Arc<MediaPipeline<S>>>,
}

impl<S: AppendSink> VideoSource<S> {
	pub fn new(
		broadcast: moq_lite::BroadcastConsumer,
		renditions: watch::Receiver<BTreeMap<String, VideoConfig>>,
		target: watch::Receiver<VideoTarget>,
		latency: watch::Receiver<Duration>,
		pipeline: Option<Arc<MediaPipeline<S>>>,
	) -> Self {
		let shared = Arc::new(Shared {
			current_frame: Signal::new(None),
			display: Signal::new(None),
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

		let scope = Scope::new();
		scope.spawn(Self::reconcile(
			shared.clone(),
			broadcast,
			renditions,
			target,
			latency,
			pipeline.clone(),
		));

		Self {
			shared,
			scope,
			_pipeline: pipeline,
		}
	}

	pub fn current_frame(&self) -> Signal<Option<Arc<DecodedFrame>>> {
		self.shared.current_frame.clone()
	}

	pub fn display(&self) -> Signal<Option<Display>> {
		self.shared.display.clone()
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

	/// Republish the catalog-declared display size (spec.md §4.5 "Display
	/// width/height are republished whenever they change").
	pub fn set_display(&self, display: Option<Display>) {
		self.shared.display.set(display);
	}

	pub fn close(&self) {
		self.scope.close();
	}

	async fn reconcile(
		shared: Arc<Shared>,
		broadcast: moq_lite::BroadcastConsumer,
		mut renditions: watch::Receiver<BTreeMap<String, VideoConfig>>,
		mut target: watch::Receiver<VideoTarget>,
		latency: watch::Receiver<Duration>,
		pipeline: Option<Arc<MediaPipeline<S>>>,
	) {
		let mut active_scope: Option<Scope> = None;
		let mut active_scope_name: Option<String> = None;
		let mut pending_scope: Option<Scope> = None;

		loop {
			let current = renditions.borrow().clone();
			let goal = target.borrow().clone();

			let desired = select_rendition(&current, |name| shared.is_eligible(name), &goal).map(|s| s.to_string());

			let already_running = {
				let state = shared.state.lock().unwrap();
				state.active == desired || state.pending == desired
			};

			if let Some(name) = desired.filter(|_| !already_running) {
				if let Some(config) = current.get(&name).cloned() {
					if let Some(scope) = pending_scope.take() {
						scope.close();
					}

					let sub_scope = Scope::new();
					let shared = shared.clone();
					let broadcast = broadcast.clone();
					let latency = latency.clone();
					let pipeline = pipeline.clone();
					let name_for_task = name.clone();

					shared.state.lock().unwrap().pending = Some(name.clone());

					sub_scope.spawn(Self::run_subscription(shared, broadcast, name_for_task, config, latency, pipeline));
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
				else => return,
			}

			// A subscription promoted itself to active: retire whatever was
			// running before it and let this loop's next iteration re-check
			// whether the rendition goal is still satisfied.
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
		config: VideoConfig,
		latency: watch::Receiver<Duration>,
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

		match decode_path(config.container) {
			DecodePath::Codec => {
				let mut decoder = match VideoDecoder::new(&config.codec, config.description.as_deref()) {
					Ok(decoder) => decoder,
					Err(Error::CodecUnsupported(codec)) => {
						tracing::warn!(rendition = %name, %codec, "codec unsupported, removing rendition");
						shared.remove_eligible(&name);
						Self::mark_done(&shared, &name);
						return;
					}
					Err(err) => {
						tracing::warn!(rendition = %name, %err, "video decoder init failed");
						Self::mark_done(&shared, &name);
						return;
					}
				};

				let mut anchor: Option<(Instant, Timestamp)> = None;
				let mut promoted = false;
				let mut frame_count = 0u64;
				let mut bytes_received = 0u64;
				let mut reorder: VecDeque<DecodedFrame> = VecDeque::with_capacity(MAX_B_FRAMES);

				loop {
					let frame = match consumer.next_frame().await {
						Ok(Some(frame)) => frame,
						Ok(None) => break,
						Err(err) => {
							tracing::warn!(rendition = %name, %err, "video subscription ended");
							break;
						}
					};

					bytes_received += frame.data.len() as u64;

					let decoded = match decoder.decode(&frame) {
						Ok(Some(decoded)) => decoded,
						Ok(None) => continue,
						Err(err) => {
							tracing::warn!(rendition = %name, %err, "video decoder error, terminating subscription");
							break;
						}
					};

					let insert_at = reorder.partition_point(|f| f.timestamp <= decoded.timestamp);
					reorder.insert(insert_at, decoded);

					if reorder.len() > MAX_B_FRAMES {
						let next = reorder.pop_front().expect("just checked non-empty");
						Self::present(&shared, &latency, &mut anchor, &mut promoted, &name, next, &mut frame_count, bytes_received)
							.await;
					}
				}

				while let Some(next) = reorder.pop_front() {
					Self::present(&shared, &latency, &mut anchor, &mut promoted, &name, next, &mut frame_count, bytes_received)
						.await;
				}
			}
			DecodePath::Assembly => {
				let Some(pipeline) = pipeline else {
					tracing::warn!(rendition = %name, "fragmented-container rendition with no pipeline configured");
					Self::mark_done(&shared, &name);
					return;
				};

				if let Some(init) = &config.init_segment {
					if let Err(err) = pipeline.append_init(BufferKind::Video, init.clone()) {
						tracing::warn!(rendition = %name, %err, "video init segment append failed");
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
							tracing::warn!(rendition = %name, %err, "video subscription ended");
							break;
						}
					};

					if let Err(err) = pipeline.append_fragment(BufferKind::Video, frame.data.clone()) {
						tracing::warn!(rendition = %name, %err, "video fragment append failed");
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
		}

		Self::mark_done(&shared, &name);
	}

	/// Run the presentation-scheduling math for one reordered decoded frame
	/// and publish it (spec.md §4.2 "Presentation scheduling (Path A)").
	async fn present(
		shared: &Arc<Shared>,
		latency: &watch::Receiver<Duration>,
		anchor: &mut Option<(Instant, Timestamp)>,
		promoted: &mut bool,
		name: &str,
		decoded: DecodedFrame,
		frame_count: &mut u64,
		bytes_received: u64,
	) {
		let now = Instant::now();
		let (anchor_instant, anchor_ts) = *anchor.get_or_insert((now, decoded.timestamp));
		let delay = presentation_delay((anchor_instant, anchor_ts), decoded.timestamp, now, *latency.borrow());

		if delay > SYNC_WAIT_THRESHOLD {
			shared.sync_status.set(SyncStatus::Wait { buffer: delay });
			tokio::time::sleep(delay).await;
			shared.sync_status.set(SyncStatus::Ready);
		} else if !delay.is_zero() {
			tokio::time::sleep(delay).await;
		}

		*frame_count += 1;
		let timestamp = decoded.timestamp;
		shared.current_frame.set(Some(Arc::new(decoded)));
		shared.buffer_status.set(BufferStatus::Filled);
		shared.stats.set(Stats {
			frame_count: *frame_count,
			timestamp,
			bytes_received,
		});

		// Track switching (spec.md §4.2): a pending rendition only becomes
		// active once it delivers a frame without a latency-sync wait.
		if !*promoted && delay <= SYNC_WAIT_THRESHOLD {
			*promoted = true;
			Self::promote(shared, name);
		}
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

	fn config(width: u32, height: u32) -> VideoConfig {
		VideoConfig {
			codec: "avc1.64001f".to_string(),
			coded_width: Some(width),
			coded_height: Some(height),
			..Default::default()
		}
	}

	#[test]
	fn explicit_rendition_overrides_target() {
		let mut renditions = BTreeMap::new();
		renditions.insert("low".to_string(), config(640, 360));
		renditions.insert("high".to_string(), config(1920, 1080));

		let target = VideoTarget {
			pixels: Some(1),
			rendition: Some("high".to_string()),
		};
		assert_eq!(select_rendition(&renditions, |_| true, &target), Some("high"));
	}

	#[test]
	fn gapless_switch_scenario() {
		// S6: {low: 640x360, high: 1920x1080}; target pixels=1 picks `low`.
		let mut renditions = BTreeMap::new();
		renditions.insert("low".to_string(), config(640, 360));
		renditions.insert("high".to_string(), config(1920, 1080));

		let target = VideoTarget {
			pixels: Some(1),
			rendition: None,
		};
		assert_eq!(select_rendition(&renditions, |_| true, &target), Some("low"));
	}

	#[test]
	fn falls_back_to_largest_below_target_when_none_qualify() {
		let mut renditions = BTreeMap::new();
		renditions.insert("low".to_string(), config(640, 360));
		renditions.insert("mid".to_string(), config(1280, 720));

		let target = VideoTarget {
			pixels: Some(1920 * 1080),
			rendition: None,
		};
		assert_eq!(select_rendition(&renditions, |_| true, &target), Some("mid"));
	}

	#[test]
	fn ineligible_renditions_are_skipped() {
		let mut renditions = BTreeMap::new();
		renditions.insert("low".to_string(), config(640, 360));
		renditions.insert("high".to_string(), config(1920, 1080));

		let target = VideoTarget::default();
		assert_eq!(select_rendition(&renditions, |name| name != "low", &target), Some("high"));
	}

	#[test]
	fn presentation_delay_accounts_for_latency_budget() {
		let anchor_instant = Instant::now();
		let anchor_ts = Timestamp::from_micros(0).unwrap();
		let frame_ts = Timestamp::from_millis(100).unwrap();

		let delay = presentation_delay((anchor_instant, anchor_ts), frame_ts, anchor_instant, Duration::from_millis(50));
		assert_eq!(delay, Duration::from_millis(150));
	}

	struct NullSink;

	impl crate::assembly::AppendSink for NullSink {
		async fn ready(&self) -> Result<()> {
			Ok(())
		}
		async fn add_buffer(&self, _kind: BufferKind, _mime: &str) -> Result<()> {
			Ok(())
		}
		async fn append(&self, _kind: BufferKind, _data: bytes::Bytes) -> Result<()> {
			Ok(())
		}
	}

	fn shared_with(active: Option<&str>, pending: Option<&str>) -> Arc<Shared> {
		Arc::new(Shared {
			current_frame: Signal::new(None),
			display: Signal::new(None),
			sync_status: Signal::new(SyncStatus::Ready),
			buffer_status: Signal::new(BufferStatus::Empty),
			stats: Signal::new(Stats::default()),
			state: Mutex::new(State {
				ineligible: Default::default(),
				active: active.map(str::to_string),
				pending: pending.map(str::to_string),
			}),
			notify: Notify::new(),
		})
	}

	fn frame_at(micros: u64) -> DecodedFrame {
		DecodedFrame {
			timestamp: Timestamp::from_micros(micros).unwrap(),
			format: decode::PixelFormat::Yuv420p,
			width: 640,
			height: 360,
			planes: Vec::new(),
		}
	}

	#[tokio::test]
	async fn gapless_switch_promotes_only_after_catching_up() {
		// S6: `low` is the pending rendition while `high` stays active. Its
		// first frame needs a sync wait (still catching up) and must not
		// promote; its second frame doesn't, and that's what swaps active.
		tokio::time::pause();

		let shared = shared_with(Some("high"), Some("low"));
		let (_tx, latency) = watch::channel(Duration::from_millis(300));

		let mut anchor = None;
		let mut promoted = false;
		let mut frame_count = 0u64;

		VideoSource::<NullSink>::present(&shared, &latency, &mut anchor, &mut promoted, "low", frame_at(0), &mut frame_count, 0).await;

		assert!(!promoted, "a frame requiring a sync wait must not promote the pending rendition");
		assert_eq!(
			shared.state.lock().unwrap().active.as_deref(),
			Some("high"),
			"active rendition must not swap until the pending one catches up"
		);
		assert!(
			shared.current_frame.get_cloned().is_some(),
			"the pending rendition's frame is still presented while catching up"
		);

		VideoSource::<NullSink>::present(&shared, &latency, &mut anchor, &mut promoted, "low", frame_at(100_000), &mut frame_count, 0).await;

		assert!(promoted, "a frame without a sync wait must promote the pending rendition");
		let state = shared.state.lock().unwrap();
		assert_eq!(state.active.as_deref(), Some("low"), "promote() swaps active to the caught-up rendition");
		assert_eq!(state.pending, None, "promote() clears pending once it becomes active");
	}
}
