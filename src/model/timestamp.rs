use std::time::Duration;

/// A timestamp representing the presentation time of a media frame in microseconds.
///
/// Values are constrained to fit within a QUIC VarInt (< 2^62 microseconds,
/// ~146,000 years) since that's the widest header encoding a [`ContainerMode`]
/// can produce.
#[derive(Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("timestamp overflow")]
pub struct TimestampOverflow;

impl Timestamp {
	/// The maximum representable timestamp (2^62 - 1 microseconds).
	pub const MAX: Self = Self((1 << 62) - 1);
	pub const ZERO: Self = Self(0);

	pub const fn from_micros(micros: u64) -> Result<Self, TimestampOverflow> {
		if micros > Self::MAX.0 {
			return Err(TimestampOverflow);
		}
		Ok(Self(micros))
	}

	pub const fn from_millis(millis: u64) -> Result<Self, TimestampOverflow> {
		match millis.checked_mul(1000) {
			Some(micros) => Self::from_micros(micros),
			None => Err(TimestampOverflow),
		}
	}

	pub const fn as_micros(self) -> u64 {
		self.0
	}

	pub const fn as_millis(self) -> u64 {
		self.0 / 1000
	}

	pub fn max(self, other: Self) -> Self {
		Self(self.0.max(other.0))
	}

	pub fn checked_sub(self, rhs: Self) -> Option<Self> {
		self.0.checked_sub(rhs.0).map(Self)
	}

	pub fn checked_add(self, rhs: Self) -> Option<Self> {
		self.0.checked_add(rhs.0).and_then(|v| Self::from_micros(v).ok())
	}

	pub fn saturating_duration_since(self, earlier: Self) -> Duration {
		Duration::from_micros(self.0.saturating_sub(earlier.0))
	}
}

impl TryFrom<Duration> for Timestamp {
	type Error = TimestampOverflow;

	fn try_from(duration: Duration) -> Result<Self, Self::Error> {
		Self::from_micros(duration.as_micros().try_into().map_err(|_| TimestampOverflow)?)
	}
}

impl From<Timestamp> for Duration {
	fn from(timestamp: Timestamp) -> Self {
		Duration::from_micros(timestamp.0)
	}
}

impl std::fmt::Debug for Timestamp {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}µs", self.0)
	}
}

impl std::fmt::Display for Timestamp {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}µs", self.0)
	}
}

impl std::ops::Sub for Timestamp {
	type Output = Self;

	fn sub(self, rhs: Self) -> Self {
		self.checked_sub(rhs).expect("timestamp underflow")
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn round_trip_micros() {
		let t = Timestamp::from_micros(123_456).unwrap();
		assert_eq!(t.as_micros(), 123_456);
	}

	#[test]
	fn overflow_rejected() {
		assert!(Timestamp::from_micros(1 << 62).is_err());
		assert!(Timestamp::from_micros(Timestamp::MAX.as_micros()).is_ok());
	}
}
