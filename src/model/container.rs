//! Timestamp header codec for the three container modes (component C1).
//!
//! `varint` and `raw-u64` prefix every raw frame body with an encoded
//! timestamp in microseconds; `fragmented-container` carries no header at
//! all, since the timestamp for those frames lives in the CMAF
//! moof/tfdt box instead (see [`crate::assembly`]).

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use super::{Timestamp, TimestampOverflow};

/// Selects the wire encoding of the per-frame timestamp header, and in turn
/// which decode path ([`crate::video`]/[`crate::audio`] Path A vs.
/// [`crate::assembly`] Path B) a source should run.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ContainerMode {
	#[default]
	Varint,
	RawU64,
	FragmentedContainer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum HeaderError {
	#[error("short buffer: need more bytes to decode timestamp header")]
	Short,
	#[error(transparent)]
	Overflow(#[from] TimestampOverflow),
}

/// Encode a timestamp header for the given container mode.
///
/// Returns an empty buffer for [`ContainerMode::FragmentedContainer`]: that
/// mode has no per-frame header, the payload is an opaque container byte
/// range (invariant I3).
pub fn encode_header(timestamp: Timestamp, mode: ContainerMode) -> Bytes {
	match mode {
		ContainerMode::Varint => encode_varint(timestamp.as_micros()),
		ContainerMode::RawU64 => {
			let mut buf = BytesMut::with_capacity(8);
			buf.put_u64(timestamp.as_micros());
			buf.freeze()
		}
		ContainerMode::FragmentedContainer => Bytes::new(),
	}
}

/// Decode a timestamp header, returning the timestamp and the number of
/// bytes consumed from `buf`. For [`ContainerMode::FragmentedContainer`],
/// returns `(Timestamp::ZERO, 0)`: the caller must derive presentation time
/// from the container itself.
pub fn decode_header(buf: &[u8], mode: ContainerMode) -> Result<(Timestamp, usize), HeaderError> {
	match mode {
		ContainerMode::Varint => decode_varint(buf),
		ContainerMode::RawU64 => {
			if buf.len() < 8 {
				return Err(HeaderError::Short);
			}
			let micros = (&buf[..8]).get_u64();
			Ok((Timestamp::from_micros(micros)?, 8))
		}
		ContainerMode::FragmentedContainer => Ok((Timestamp::ZERO, 0)),
	}
}

/// Encode a QUIC-style variable-length integer: the top two bits of the
/// first byte select a length of 1, 2, 4, or 8 bytes, with the remaining
/// bits (plus any following bytes) holding the value big-endian.
fn encode_varint(value: u64) -> Bytes {
	let mut buf = BytesMut::with_capacity(8);

	if value < (1 << 6) {
		buf.put_u8(value as u8);
	} else if value < (1 << 14) {
		buf.put_u16(0b01 << 14 | value as u16);
	} else if value < (1 << 30) {
		buf.put_u32(0b10 << 30 | value as u32);
	} else {
		buf.put_u64(0b11 << 62 | value);
	}

	buf.freeze()
}

fn decode_varint(buf: &[u8]) -> Result<(Timestamp, usize), HeaderError> {
	let first = *buf.first().ok_or(HeaderError::Short)?;
	let len = 1usize << (first >> 6);

	if buf.len() < len {
		return Err(HeaderError::Short);
	}

	let value = match len {
		1 => (first & 0x3F) as u64,
		2 => (u16::from_be_bytes([buf[0] & 0x3F, buf[1]])) as u64,
		4 => (u32::from_be_bytes([buf[0] & 0x3F, buf[1], buf[2], buf[3]])) as u64,
		8 => u64::from_be_bytes([buf[0] & 0x3F, buf[1], buf[2], buf[3], buf[4], buf[5], buf[6], buf[7]]),
		_ => unreachable!("varint length is always a power of two in {{1,2,4,8}}"),
	};

	Ok((Timestamp::from_micros(value)?, len))
}

#[cfg(test)]
mod tests {
	use super::*;

	fn micros(v: u64) -> Timestamp {
		Timestamp::from_micros(v).unwrap()
	}

	#[test]
	fn varint_literal_scenarios() {
		assert_eq!(encode_varint(63).as_ref(), &[0x3F]);
		assert_eq!(encode_varint(64).as_ref(), &[0x40, 0x40]);
		assert_eq!(encode_varint(16384).as_ref(), &[0x80, 0x00, 0x40, 0x00]);
		assert_eq!(
			encode_varint(1 << 30).as_ref(),
			&[0xC0, 0x00, 0x00, 0x00, 0x40, 0x00, 0x00, 0x00]
		);
	}

	#[test]
	fn raw_u64_literal_scenarios() {
		assert_eq!(encode_header(micros(0), ContainerMode::RawU64).as_ref(), &[0u8; 8]);
		assert_eq!(
			encode_header(micros((1u64 << 53) - 1), ContainerMode::RawU64).as_ref(),
			&[0x00, 0x1F, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF]
		);
	}

	#[test]
	fn round_trip_all_modes() {
		for mode in [ContainerMode::Varint, ContainerMode::RawU64] {
			for value in [0u64, 1, 63, 64, 16383, 16384, (1 << 30) - 1, 1 << 30, Timestamp::MAX.as_micros()] {
				let ts = micros(value);
				let header = encode_header(ts, mode);
				let (decoded, consumed) = decode_header(&header, mode).unwrap();
				assert_eq!(decoded, ts, "mode={mode:?} value={value}");
				assert_eq!(consumed, header.len());
			}
		}
	}

	#[test]
	fn varint_size_buckets() {
		let cases = [(0u64, 1), (63, 1), (64, 2), (16383, 2), (16384, 4), ((1 << 30) - 1, 4), (1 << 30, 8)];
		for (value, expected_len) in cases {
			assert_eq!(encode_varint(value).len(), expected_len, "value={value}");
		}
	}

	#[test]
	fn fragmented_container_has_no_header() {
		let header = encode_header(micros(42), ContainerMode::FragmentedContainer);
		assert!(header.is_empty());
		let (ts, consumed) = decode_header(b"anything", ContainerMode::FragmentedContainer).unwrap();
		assert_eq!(ts, Timestamp::ZERO);
		assert_eq!(consumed, 0);
	}

	#[test]
	fn short_buffer_is_an_error() {
		assert_eq!(decode_header(&[0x40], ContainerMode::Varint), Err(HeaderError::Short));
		assert_eq!(decode_header(&[0; 7], ContainerMode::RawU64), Err(HeaderError::Short));
	}
}
