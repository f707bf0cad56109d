/// Errors produced by the watch-side media pipeline.
///
/// Recoverable kinds (`LatencySkip`, `CodecUnsupported`, `DecoderError`,
/// `AppendQuotaExceeded`) are handled locally by the component that raises
/// them and summarized via observable signals; they should rarely escape to
/// a caller. `TransportClosed` and user-initiated close propagate as
/// end-of-stream, not as errors, wherever the API shape allows it (see
/// `FrameConsumer::next_frame`).
#[derive(thiserror::Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
	/// The underlying connection or track ended.
	#[error("transport closed")]
	TransportClosed,

	/// Groups were dropped to stay within the latency budget.
	#[error("latency skip: dropped group {group}")]
	LatencySkip { group: u64 },

	/// The rendition's codec cannot be decoded by this platform.
	#[error("codec unsupported: {0}")]
	CodecUnsupported(String),

	/// No rendition in the catalog could be decoded.
	#[error("no eligible renditions")]
	NoEligibleRenditions,

	/// The decoder reported a failure while decoding a frame.
	#[error("decoder error: {0}")]
	DecoderError(String),

	/// The media pipeline closed or timed out.
	#[error("pipeline closed")]
	PipelineClosed,

	/// An append buffer overflowed; the oldest fragment was discarded.
	#[error("append queue exceeded its bound, oldest fragment dropped")]
	AppendQuotaExceeded,

	/// The API was used incorrectly (e.g. two concurrent `next_frame` waiters).
	#[error("invalid state: {0}")]
	InvalidState(&'static str),

	/// A catalog document failed to parse.
	#[error("invalid catalog: {0}")]
	InvalidCatalog(#[from] serde_json::Error),

	/// The underlying transport returned an error.
	#[error(transparent)]
	Transport(#[from] moq_lite::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
