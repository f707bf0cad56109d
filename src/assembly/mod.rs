//! The dual-buffer container-assembly source, C5 (spec.md §4.5).
//!
//! Models the browser's `MediaSource` + `SourceBuffer` pair as a host-agnostic
//! [`AppendSink`] trait so the init-before-fragment ordering invariants
//! (O1–O3) are testable without a video element. Grounded on the same
//! bounded-queue-with-background-drain shape as [`crate::consumer`]'s
//! `FrameConsumer`: a `Mutex`-protected state machine plus a `Notify` rather
//! than a channel, since readiness here is a level (queue non-empty, buffer
//! not updating), not a single event.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::Notify;

use crate::reactive::Scope;
use crate::{Error, Result};

/// How long [`MediaPipeline::open`] waits for the sink to become ready before
/// failing (spec.md §5 "Timeouts": "Pipeline `sourceopen`: 5 s").
pub const OPEN_TIMEOUT: Duration = Duration::from_secs(5);

/// Default bound on each buffer's append queue (spec.md §9 "Bounded queues").
pub const APPEND_QUEUE_BOUND: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferKind {
	Video,
	Audio,
}

/// A host-provided sink that actually owns the `MediaSource`/video element
/// (or, in tests, just records calls). Appends are serialized by
/// [`MediaPipeline`]; an implementation only needs to perform one append at a
/// time per buffer and resolve when it completes (the `updateend` event).
pub trait AppendSink: Send + Sync + 'static {
	/// Wait until the pipeline itself is ready to accept buffers (`sourceopen`).
	fn ready(&self) -> impl Future<Output = Result<()>> + Send;

	/// Register a new append buffer for `kind` with the given MIME type.
	fn add_buffer(&self, kind: BufferKind, mime: &str) -> impl Future<Output = Result<()>> + Send;

	/// Append `data` to the buffer for `kind` and wait for completion.
	fn append(&self, kind: BufferKind, data: Bytes) -> impl Future<Output = Result<()>> + Send;
}

struct Buffer {
	mime: String,
	initialized: bool,
	updating: bool,
	queue: VecDeque<Bytes>,
}

impl Buffer {
	fn new(mime: String) -> Self {
		Self {
			mime,
			initialized: false,
			updating: false,
			queue: VecDeque::new(),
		}
	}
}

struct State {
	open: bool,
	closed: bool,
	buffers: HashMap<BufferKind, Buffer>,
}

/// Drives a single media pipeline shared between video and audio (spec.md
/// §9 "Cyclic graph" note: the broadcast owns this through the video source
/// and exposes it to audio as a read-only collaborator).
pub struct MediaPipeline<S: AppendSink> {
	sink: Arc<S>,
	state: Mutex<State>,
	notify: Notify,
	bound: usize,
	scope: Scope,
}

impl<S: AppendSink> MediaPipeline<S> {
	pub fn new(sink: S) -> Arc<Self> {
		Arc::new(Self {
			sink: Arc::new(sink),
			state: Mutex::new(State {
				open: false,
				closed: false,
				buffers: HashMap::new(),
			}),
			notify: Notify::new(),
			bound: APPEND_QUEUE_BOUND,
			scope: Scope::new(),
		})
	}

	/// Wait for the sink to become ready, then add the video append buffer
	/// (spec.md §4.5 lifecycle steps 1–2).
	pub async fn open(self: &Arc<Self>, video_mime: &str) -> Result<()> {
		tokio::time::timeout(OPEN_TIMEOUT, self.sink.ready())
			.await
			.map_err(|_| Error::PipelineClosed)??;

		self.sink.add_buffer(BufferKind::Video, video_mime).await?;

		let mut state = self.state.lock().unwrap();
		state.open = true;
		state.buffers.insert(BufferKind::Video, Buffer::new(video_mime.to_string()));
		drop(state);

		self.spawn_drain(BufferKind::Video);
		Ok(())
	}

	/// Audio join-in (spec.md §4.3, §4.5 "Audio join-in"): wait for the
	/// pipeline to be open and the video buffer to finish any in-flight
	/// append, then add the audio buffer. Never races ahead of video.
	pub async fn initialize_audio(self: &Arc<Self>, audio_mime: &str) -> Result<()> {
		tokio::time::timeout(OPEN_TIMEOUT, self.wait_video_quiescent())
			.await
			.map_err(|_| Error::PipelineClosed)?;

		self.sink.add_buffer(BufferKind::Audio, audio_mime).await?;

		let mut state = self.state.lock().unwrap();
		state.buffers.insert(BufferKind::Audio, Buffer::new(audio_mime.to_string()));
		drop(state);

		self.spawn_drain(BufferKind::Audio);
		Ok(())
	}

	async fn wait_video_quiescent(&self) {
		loop {
			let notified = self.notify.notified();
			{
				let state = self.state.lock().unwrap();
				let ready = state.open
					&& state
						.buffers
						.get(&BufferKind::Video)
						.map(|b| !b.updating)
						.unwrap_or(false);
				if ready {
					return;
				}
			}
			notified.await;
		}
	}

	/// Append the init segment for `kind`. Must be the first append on that
	/// buffer (invariant I4 / O1); enforced by [`Self::enqueue`].
	pub fn append_init(&self, kind: BufferKind, data: Bytes) -> Result<()> {
		self.enqueue(kind, data, true)
	}

	/// Enqueue a fragment for `kind` to be appended once the buffer is free.
	/// FIFO per buffer; when full, the oldest entry is discarded (O3).
	pub fn append_fragment(&self, kind: BufferKind, data: Bytes) -> Result<()> {
		self.enqueue(kind, data, false)
	}

	fn enqueue(&self, kind: BufferKind, data: Bytes, is_init: bool) -> Result<()> {
		let mut state = self.state.lock().unwrap();
		let buffer = state
			.buffers
			.get_mut(&kind)
			.ok_or(Error::InvalidState("append buffer not yet added"))?;

		if !is_init && !buffer.initialized {
			return Err(Error::InvalidState("fragment appended before init segment"));
		}
		if is_init {
			buffer.initialized = true;
		}

		if buffer.queue.len() >= self.bound {
			buffer.queue.pop_front();
			tracing::warn!(?kind, bound = self.bound, "append queue full, discarding oldest fragment");
		}
		buffer.queue.push_back(data);
		drop(state);

		self.notify.notify_one();
		Ok(())
	}

	fn spawn_drain(self: &Arc<Self>, kind: BufferKind) {
		let pipeline = self.clone();
		self.scope.spawn(async move {
			loop {
				let notified = pipeline.notify.notified();

				let next = {
					let mut state = pipeline.state.lock().unwrap();
					if state.closed {
						return;
					}
					match state.buffers.get_mut(&kind) {
						Some(buffer) if !buffer.updating => buffer.queue.pop_front().map(|data| {
							buffer.updating = true;
							data
						}),
						_ => None,
					}
				};

				let Some(data) = next else {
					notified.await;
					continue;
				};

				let result = pipeline.sink.append(kind, data).await;

				let mut state = pipeline.state.lock().unwrap();
				if let Some(buffer) = state.buffers.get_mut(&kind) {
					buffer.updating = false;
				}
				drop(state);

				if let Err(err) = result {
					tracing::warn!(?kind, %err, "append failed");
				}

				pipeline.notify.notify_one();
			}
		});
	}

	/// Tear down the pipeline: stop all drain loops. Idempotent.
	pub fn close(&self) {
		let mut state = self.state.lock().unwrap();
		if state.closed {
			return;
		}
		state.closed = true;
		drop(state);
		self.notify.notify_waiters();
		self.scope.close();
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::atomic::{AtomicUsize, Ordering};
	use tokio::sync::Mutex as AsyncMutex;

	#[derive(Default)]
	struct RecordingSink {
		calls: AsyncMutex<Vec<(BufferKind, bool, Vec<u8>)>>,
		updating: AtomicUsize,
	}

	impl AppendSink for RecordingSink {
		async fn ready(&self) -> Result<()> {
			Ok(())
		}

		async fn add_buffer(&self, _kind: BufferKind, _mime: &str) -> Result<()> {
			Ok(())
		}

		async fn append(&self, kind: BufferKind, data: Bytes) -> Result<()> {
			let concurrent = self.updating.fetch_add(1, Ordering::SeqCst);
			assert_eq!(concurrent, 0, "overlapping append on a single sink (O2 violation)");
			tokio::task::yield_now().await;
			self.calls.lock().await.push((kind, true, data.to_vec()));
			self.updating.fetch_sub(1, Ordering::SeqCst);
			Ok(())
		}
	}

	#[tokio::test]
	async fn pipeline_two_buffer_ordering() {
		// S5: video init, audio init, video fragment, audio fragment.
		let pipeline = MediaPipeline::new(RecordingSink::default());
		pipeline.open("video/mp4").await.unwrap();
		pipeline.initialize_audio("audio/mp4").await.unwrap();

		pipeline.append_init(BufferKind::Video, Bytes::from_static(b"moov")).unwrap();
		pipeline.append_init(BufferKind::Audio, Bytes::from_static(b"moov")).unwrap();
		pipeline
			.append_fragment(BufferKind::Video, Bytes::from_static(b"moof+mdat"))
			.unwrap();
		pipeline
			.append_fragment(BufferKind::Audio, Bytes::from_static(b"moof+mdat"))
			.unwrap();

		tokio::time::sleep(Duration::from_millis(50)).await;

		let calls = pipeline.sink.calls.lock().await;
		assert_eq!(calls.len(), 4);
		let video_calls: Vec<_> = calls.iter().filter(|(k, ..)| *k == BufferKind::Video).collect();
		assert_eq!(video_calls[0].2, b"moov");
		assert_eq!(video_calls[1].2, b"moof+mdat");
	}

	#[tokio::test]
	async fn fragment_before_init_is_invalid_state() {
		let pipeline = MediaPipeline::new(RecordingSink::default());
		pipeline.open("video/mp4").await.unwrap();

		let err = pipeline
			.append_fragment(BufferKind::Video, Bytes::from_static(b"moof+mdat"))
			.unwrap_err();
		assert!(matches!(err, Error::InvalidState(_)));
	}

	#[tokio::test]
	async fn overflow_discards_oldest() {
		let pipeline = MediaPipeline::new(RecordingSink::default());
		pipeline.open("video/mp4").await.unwrap();
		pipeline.append_init(BufferKind::Video, Bytes::from_static(b"moov")).unwrap();

		for i in 0..(APPEND_QUEUE_BOUND + 5) {
			pipeline
				.append_fragment(BufferKind::Video, Bytes::from(format!("frag{i}")))
				.unwrap();
		}

		tokio::time::sleep(Duration::from_millis(50)).await;
		let calls = pipeline.sink.calls.lock().await;
		assert!(calls.len() <= APPEND_QUEUE_BOUND + 1);
	}
}
