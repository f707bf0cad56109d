//! The jitter-buffered frame consumer (component C2, spec.md §4.1).
//!
//! Reorders groups delivered out of order, bounds end-to-end latency by
//! dropping stale groups whole, and exposes a single `next_frame()` stream
//! in non-decreasing group order (invariant I2).

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};

use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;

use crate::model::{ContainerMode, Frame, Timestamp};
use crate::{Error, Result};

struct GroupEntry {
	frames: VecDeque<Frame>,
	ended: bool,
	/// The latest frame timestamp observed in this group so far.
	max_timestamp: Option<Timestamp>,
	/// Keeps the per-group frame-reading task (and its `GroupConsumer`,
	/// i.e. the transport handle) alive until we drop it.
	task: JoinHandle<()>,
}

struct Shared {
	groups: BTreeMap<u64, GroupEntry>,
	/// The group sequence currently being drained. May reference a sequence
	/// not yet present in `groups` (the advance rule increments it
	/// regardless of arrival).
	active: Option<u64>,
	/// The first group sequence ever observed; anything older is discarded
	/// on arrival (the first-group rule).
	baseline: Option<u64>,
	/// Total skip events, surfaced for observability (§7 LatencySkip).
	skips: u64,
	waiting: bool,
	closed: Option<Result<()>>,
}

impl Shared {
	fn latest_known_timestamp(&self) -> Option<Timestamp> {
		self.groups.values().filter_map(|g| g.max_timestamp).max()
	}

	fn earliest_unconsumed_timestamp(&self) -> Option<Timestamp> {
		self.groups
			.values()
			.filter_map(|g| g.frames.front().map(|f| f.timestamp))
			.min()
	}

	/// Evaluate the skip rule and drop the active group if it's exceeded
	/// the latency budget. Returns the skipped sequence, if any.
	fn evaluate_skip(&mut self, latency: std::time::Duration) -> Option<u64> {
		if self.groups.len() < 2 {
			return None;
		}

		let earliest = self.earliest_unconsumed_timestamp()?;
		let latest = self.latest_known_timestamp()?;

		if latest.saturating_duration_since(earliest) <= latency {
			return None;
		}

		let active = self.active?;
		let entry = self.groups.remove(&active)?;
		entry.task.abort();
		self.skips += 1;
		// Skip rule: advance to the next known group, not blindly active+1 —
		// a later group may already be buffered past a gap.
		self.active = Some(self.groups.keys().find(|&&k| k > active).copied().unwrap_or(active + 1));

		Some(active)
	}
}

/// Reorders and jitter-buffers frames for a single track.
pub struct FrameConsumer {
	shared: Arc<Mutex<Shared>>,
	notify: Arc<Notify>,
	latency: watch::Receiver<std::time::Duration>,
	track_task: JoinHandle<()>,
}

impl FrameConsumer {
	/// Subscribe to `track` and begin jitter-buffering its groups.
	///
	/// `latency` is a reactive latency budget in the sense of spec.md §3:
	/// a `watch` channel so the bound can be changed live without
	/// recreating the consumer.
	pub fn new(track: moq_lite::TrackConsumer, mode: ContainerMode, latency: watch::Receiver<std::time::Duration>) -> Self {
		let shared = Arc::new(Mutex::new(Shared {
			groups: BTreeMap::new(),
			active: None,
			baseline: None,
			skips: 0,
			waiting: false,
			closed: None,
		}));
		let notify = Arc::new(Notify::new());

		let track_task = tokio::spawn(Self::run_track(
			track,
			mode,
			shared.clone(),
			notify.clone(),
			latency.clone(),
		));

		Self {
			shared,
			notify,
			latency,
			track_task,
		}
	}

	/// The number of groups dropped so far to enforce the latency budget.
	pub fn skip_count(&self) -> u64 {
		self.shared.lock().unwrap().skips
	}

	/// Close the consumer: frees all buffered frames, aborts all per-group
	/// transport handles, and wakes any waiter with `end`. Idempotent.
	pub fn close(&self) {
		let mut state = self.shared.lock().unwrap();
		if state.closed.is_some() {
			return;
		}
		state.closed = Some(Ok(()));
		for (_, entry) in state.groups.split_off(&0) {
			entry.task.abort();
		}
		self.track_task.abort();
		self.notify.notify_one();
	}

	/// Return the next frame in decode order, advancing groups as needed.
	///
	/// Returns `Ok(None)` when the track has ended or the consumer was
	/// closed. At most one caller may await this at a time; a concurrent
	/// call returns [`Error::InvalidState`].
	pub async fn next_frame(&mut self) -> Result<Option<Frame>> {
		{
			let mut state = self.shared.lock().unwrap();
			if state.waiting {
				return Err(Error::InvalidState("next_frame: concurrent waiter"));
			}
			state.waiting = true;
		}

		let result = self.next_frame_inner().await;

		self.shared.lock().unwrap().waiting = false;
		result
	}

	async fn next_frame_inner(&mut self) -> Result<Option<Frame>> {
		loop {
			let notified = self.notify.notified();

			{
				let latency = *self.latency.borrow();
				let mut state = self.shared.lock().unwrap();

				state.evaluate_skip(latency);

				loop {
					let Some(active) = state.active else { break };
					let Some(entry) = state.groups.get_mut(&active) else { break };

					if let Some(frame) = entry.frames.pop_front() {
						return Ok(Some(frame));
					}

					if entry.ended {
						state.groups.remove(&active);
						state.active = Some(active + 1);
						continue;
					}

					break;
				}

				if let Some(closed) = state.closed.clone() {
					return closed.map(|_| None);
				}
			}

			notified.await;
		}
	}

	async fn run_track(
		mut track: moq_lite::TrackConsumer,
		mode: ContainerMode,
		shared: Arc<Mutex<Shared>>,
		notify: Arc<Notify>,
		latency: watch::Receiver<std::time::Duration>,
	) {
		loop {
			let group = match track.next_group().await {
				Ok(Some(group)) => group,
				Ok(None) => {
					let mut state = shared.lock().unwrap();
					state.closed.get_or_insert(Ok(()));
					notify.notify_one();
					return;
				}
				Err(err) => {
					tracing::warn!(%err, "track ended with error");
					let mut state = shared.lock().unwrap();
					state.closed.get_or_insert(Err(err.into()));
					notify.notify_one();
					return;
				}
			};

			let sequence = group.info().sequence;

			let mut state = shared.lock().unwrap();

			let baseline = *state.baseline.get_or_insert(sequence);
			if sequence < baseline {
				// First-group rule: a group earlier than the first one we
				// ever observed is stale; the stream is live, so discard it.
				tracing::debug!(sequence, baseline, "discarding stale group older than baseline");
				continue;
			}

			state.active.get_or_insert(sequence);

			let task = tokio::spawn(Self::run_group(sequence, group, mode, shared.clone(), notify.clone()));

			state.groups.insert(
				sequence,
				GroupEntry {
					frames: VecDeque::new(),
					ended: false,
					max_timestamp: None,
					task,
				},
			);

			drop(state);
			notify.notify_one();
		}
	}

	async fn run_group(
		sequence: u64,
		mut group: moq_lite::GroupConsumer,
		mode: ContainerMode,
		shared: Arc<Mutex<Shared>>,
		notify: Arc<Notify>,
	) {
		let mut index = 0usize;

		loop {
			let data = match group.read_frame().await {
				Ok(Some(data)) => data,
				Ok(None) => {
					if let Some(mut state) = shared.lock().ok() {
						if let Some(entry) = state.groups.get_mut(&sequence) {
							entry.ended = true;
						}
					}
					notify.notify_one();
					return;
				}
				Err(err) => {
					tracing::warn!(%err, sequence, "group ended with error");
					if let Some(mut state) = shared.lock().ok() {
						if let Some(entry) = state.groups.get_mut(&sequence) {
							entry.ended = true;
						}
					}
					notify.notify_one();
					return;
				}
			};

			let (timestamp, consumed) = match crate::model::decode_header(&data, mode) {
				Ok(header) => header,
				Err(err) => {
					tracing::warn!(%err, sequence, "dropping frame with invalid timestamp header");
					continue;
				}
			};

			let frame = Frame {
				data: data.slice(consumed..),
				timestamp,
				// Invariant I1: the first frame delivered in a group is the keyframe.
				keyframe: index == 0,
				group: sequence,
			};
			index += 1;

			let mut state = shared.lock().unwrap();
			if let Some(entry) = state.groups.get_mut(&sequence) {
				entry.max_timestamp = Some(entry.max_timestamp.map_or(timestamp, |m| m.max(timestamp)));
				entry.frames.push_back(frame);
			}
			drop(state);

			notify.notify_one();
		}
	}
}

impl Drop for FrameConsumer {
	fn drop(&mut self) {
		self.close();
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use bytes::Bytes;
	use std::time::Duration;

	fn latency(ms: u64) -> watch::Receiver<Duration> {
		watch::channel(Duration::from_millis(ms)).1
	}

	fn varint_frame(micros: u64, payload: &[u8]) -> Bytes {
		let mut buf = crate::model::encode_header(Timestamp::from_micros(micros).unwrap(), ContainerMode::Varint).to_vec();
		buf.extend_from_slice(payload);
		Bytes::from(buf)
	}

	fn new_track() -> (moq_lite::TrackProducer, moq_lite::TrackConsumer) {
		let track = moq_lite::Track::new("video").produce();
		(track.producer, track.consumer)
	}

	#[tokio::test]
	async fn two_group_reorder() {
		// S3: groups arrive in order G0 (f0.0,f0.1), G1 (f1.0); f0.1 arrives
		// after f1.0. With a generous latency budget, next_frame yields
		// f0.0, f0.1, f1.0 in that order.
		let (mut producer, consumer) = new_track();
		let mut consumer = FrameConsumer::new(consumer, ContainerMode::Varint, latency(1000));

		let mut g0 = producer.append_group().unwrap();
		g0.write_frame(varint_frame(0, b"f0.0"), moq_lite::Time::default()).ok();

		let mut g1 = producer.append_group().unwrap();
		g1.write_frame(varint_frame(10_000, b"f1.0"), moq_lite::Time::default()).ok();

		let f0_0 = consumer.next_frame().await.unwrap().unwrap();
		assert_eq!(f0_0.data.as_ref(), b"f0.0");
		assert!(f0_0.keyframe);

		g0.write_frame(varint_frame(5_000, b"f0.1"), moq_lite::Time::default()).ok();
		g0.close().ok();

		let f0_1 = consumer.next_frame().await.unwrap().unwrap();
		assert_eq!(f0_1.data.as_ref(), b"f0.1");
		assert!(!f0_1.keyframe);

		g1.close().ok();

		let f1_0 = consumer.next_frame().await.unwrap().unwrap();
		assert_eq!(f1_0.data.as_ref(), b"f1.0");
		assert!(f1_0.keyframe, "first frame of a new group is always a keyframe");
	}

	#[tokio::test]
	async fn latency_skip_advances_to_next_known_group() {
		// S4: L=100ms, G0 stalls after a single frame at t=0, G1 reaches
		// t=0..200ms. Once the budget is exceeded, G0 is skipped and the
		// active index should land on G1, not on the gap at sequence 1.
		let (mut producer, consumer) = new_track();
		let mut consumer = FrameConsumer::new(consumer, ContainerMode::Varint, latency(100));

		let mut g0 = producer.append_group().unwrap();
		g0.write_frame(varint_frame(0, b"f0.0"), moq_lite::Time::default()).ok();
		// G0 never closes: it's stalled, simulating a stuck publisher.

		let f0_0 = consumer.next_frame().await.unwrap().unwrap();
		assert_eq!(f0_0.data.as_ref(), b"f0.0");
		assert!(f0_0.keyframe);

		// Sequences 1-4 never arrive at all: the skip must land on the next
		// *known* group (5), not on the unreachable active+1 = 1.
		let mut g5 = producer.create_group(5u64).unwrap();
		for (i, micros) in [0u64, 50_000, 100_000, 150_000, 200_000].into_iter().enumerate() {
			g5.write_frame(varint_frame(micros, format!("f5.{i}").as_bytes()), moq_lite::Time::default())
				.ok();
		}

		let f5_0 = consumer.next_frame().await.unwrap().unwrap();
		assert_eq!(f5_0.data.as_ref(), b"f5.0", "skip should land on the next known group, past the gap at sequence 1");
		assert!(f5_0.keyframe, "first frame of a new active group is always a keyframe");

		assert_eq!(consumer.skip_count(), 1);

		for i in 1..5 {
			let frame = consumer.next_frame().await.unwrap().unwrap();
			assert_eq!(frame.data.as_ref(), format!("f5.{i}").as_bytes());
		}
	}

	#[tokio::test]
	async fn concurrent_waiters_are_invalid_state() {
		let (_producer, consumer) = new_track();
		let mut consumer = FrameConsumer::new(consumer, ContainerMode::Varint, latency(1000));

		let first = consumer.next_frame();
		tokio::pin!(first);
		// Poll once so `waiting` is set, without resolving it.
		futures::future::poll_immediate(&mut first).await;

		let err = consumer.next_frame().await.unwrap_err();
		assert!(matches!(err, Error::InvalidState(_)));
	}

	#[tokio::test]
	async fn close_wakes_waiter_with_end() {
		let (_producer, consumer) = new_track();
		let mut consumer = FrameConsumer::new(consumer, ContainerMode::Varint, latency(1000));

		consumer.close();
		consumer.close(); // idempotent

		let result = consumer.next_frame().await.unwrap();
		assert!(result.is_none());
	}
}
