//! The effect-scope primitive underpinning component lifecycles (spec.md
//! §4.4: "a signal/effect graph that binds transport state, catalog state,
//! and UI intent into coordinated lifecycles").
//!
//! `Signal<T>` is re-exported as `futures_signals::signal::Mutable<T>`
//! directly: it's the closest published equivalent of the reactive cell the
//! rest of this crate is built around, the same way the upstream browser
//! client adopts `@kixelated/signals` rather than inventing its own (see
//! SPEC_FULL.md §4). `Scope` is a tokio-native stand-in for an effect: it
//! owns a [`CancellationToken`], spawns tasks raced against that token, and
//! runs cleanup callbacks in LIFO order on close, mirroring how
//! `moq_lite::model::track::TrackProducer` ties background task lifetime to
//! its own closed signal.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub use futures_signals::signal::Mutable as Signal;

type Cleanup = Box<dyn FnOnce() + Send + 'static>;

struct Inner {
	token: CancellationToken,
	closed: AtomicBool,
	cleanups: Mutex<Vec<Cleanup>>,
	tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// An effect scope (spec.md §4.4 "Effect").
///
/// Cloning a `Scope` shares the same underlying lifecycle; closing any clone
/// closes all of them. Nested scopes created via [`Self::child`] close
/// automatically when their parent closes.
#[derive(Clone)]
pub struct Scope {
	inner: Arc<Inner>,
}

impl Scope {
	pub fn new() -> Self {
		Self {
			inner: Arc::new(Inner {
				token: CancellationToken::new(),
				closed: AtomicBool::new(false),
				cleanups: Mutex::new(Vec::new()),
				tasks: Mutex::new(Vec::new()),
			}),
		}
	}

	/// Create a nested scope that closes when `self` closes (spec.md §4.4:
	/// "Nested effects close when their parent closes").
	pub fn child(&self) -> Self {
		let child = Self {
			inner: Arc::new(Inner {
				token: self.inner.token.child_token(),
				closed: AtomicBool::new(false),
				cleanups: Mutex::new(Vec::new()),
				tasks: Mutex::new(Vec::new()),
			}),
		};

		let watcher = child.clone();
		tokio::spawn(async move {
			watcher.inner.token.clone().cancelled().await;
			watcher.close();
		});

		child
	}

	/// Resolves when this scope closes. Race ad hoc awaits against this
	/// directly (spec.md §4.4: "any `await` that races this token with a
	/// normal source wakes with `cancelled`").
	pub fn cancelled(&self) -> impl Future<Output = ()> + 'static {
		let token = self.inner.token.clone();
		async move { token.cancelled().await }
	}

	pub fn is_closed(&self) -> bool {
		self.inner.closed.load(Ordering::Acquire)
	}

	/// Spawn a task tied to this scope: it's aborted the instant the scope
	/// closes, whether or not it's currently awaiting anything.
	pub fn spawn<F>(&self, future: F)
	where
		F: Future<Output = ()> + Send + 'static,
	{
		let token = self.inner.token.clone();
		let handle = tokio::spawn(async move {
			tokio::select! {
				biased;
				_ = token.cancelled() => {}
				_ = future => {}
			}
		});
		self.inner.tasks.lock().unwrap().push(handle);
	}

	/// Register a cleanup, run exactly once when the scope closes. Cleanups
	/// run in LIFO order relative to other cleanups on this same scope.
	pub fn on_cleanup<F>(&self, cleanup: F)
	where
		F: FnOnce() + Send + 'static,
	{
		self.inner.cleanups.lock().unwrap().push(Box::new(cleanup));
	}

	/// Close the scope: cancels spawned tasks, then runs cleanups LIFO.
	/// Idempotent (spec.md §8 "Idempotent close").
	pub fn close(&self) {
		if self.inner.closed.swap(true, Ordering::AcqRel) {
			return;
		}

		self.inner.token.cancel();

		for handle in self.inner.tasks.lock().unwrap().drain(..) {
			handle.abort();
		}

		for cleanup in self.inner.cleanups.lock().unwrap().drain(..).rev() {
			cleanup();
		}
	}
}

impl Default for Scope {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::atomic::AtomicU32;
	use std::time::Duration;

	#[tokio::test]
	async fn cleanups_run_lifo_once() {
		let scope = Scope::new();
		let order = Arc::new(Mutex::new(Vec::new()));

		for i in 0..3 {
			let order = order.clone();
			scope.on_cleanup(move || order.lock().unwrap().push(i));
		}

		scope.close();
		scope.close(); // idempotent: no duplicate entries

		assert_eq!(*order.lock().unwrap(), vec![2, 1, 0]);
	}

	#[tokio::test]
	async fn spawned_tasks_abort_on_close() {
		let scope = Scope::new();
		let ran = Arc::new(AtomicU32::new(0));

		let ran_clone = ran.clone();
		scope.spawn(async move {
			tokio::time::sleep(Duration::from_secs(3600)).await;
			ran_clone.fetch_add(1, Ordering::SeqCst);
		});

		scope.close();
		tokio::task::yield_now().await;

		assert_eq!(ran.load(Ordering::SeqCst), 0);
	}

	#[tokio::test]
	async fn child_closes_with_parent() {
		let parent = Scope::new();
		let child = parent.child();

		parent.close();
		// The watcher task needs a scheduling tick to observe cancellation.
		tokio::time::sleep(Duration::from_millis(10)).await;

		assert!(child.is_closed());
	}
}
