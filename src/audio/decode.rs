//! Path A audio decoding via FFmpeg (spec.md §4.3).

use std::sync::Arc;

use ffmpeg_next as ffmpeg;

use crate::model::{Frame, Timestamp};
use crate::{Error, Result};

#[derive(Debug, Clone)]
pub struct DecodedFrame {
	pub timestamp: Timestamp,
	pub format: SampleFormat,
	pub sample_rate: u32,
	pub channels: u32,
	/// Interleaved PCM samples.
	pub data: Arc<Vec<u8>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleFormat {
	S16,
	S32,
	F32,
	F64,
}

impl SampleFormat {
	fn from_ffmpeg(format: ffmpeg::format::Sample) -> Option<Self> {
		use ffmpeg::format::Sample;
		match format {
			Sample::I16(_) => Some(Self::S16),
			Sample::I32(_) => Some(Self::S32),
			Sample::F32(_) => Some(Self::F32),
			Sample::F64(_) => Some(Self::F64),
			_ => None,
		}
	}

	fn sample_size(self) -> usize {
		match self {
			Self::S16 => 2,
			Self::S32 => 4,
			Self::F32 => 4,
			Self::F64 => 8,
		}
	}
}

fn codec_id(codec: &str) -> Result<ffmpeg::codec::Id> {
	let family = codec.split('.').next().unwrap_or(codec);
	Ok(match family {
		"mp4a" => ffmpeg::codec::Id::AAC,
		"opus" => ffmpeg::codec::Id::OPUS,
		_ => return Err(Error::CodecUnsupported(codec.to_string())),
	})
}

/// FFmpeg-backed decoder for one audio rendition (Path A).
pub struct AudioDecoder {
	decoder: ffmpeg::decoder::Audio,
}

impl AudioDecoder {
	pub fn new(codec: &str, description: Option<&[u8]>) -> Result<Self> {
		ffmpeg::init().map_err(|e| Error::DecoderError(e.to_string()))?;

		let id = codec_id(codec)?;
		let codec = ffmpeg::codec::decoder::find(id).ok_or_else(|| Error::CodecUnsupported(codec.to_string()))?;

		let context = ffmpeg::codec::context::Context::new_with_codec(codec);
		let mut decoder = context.decoder();
		let mut decoder = decoder.audio().map_err(|e| Error::DecoderError(e.to_string()))?;

		if let Some(data) = description {
			// SAFETY: see `video::decode::VideoDecoder::new`.
			unsafe {
				let context = decoder.as_mut_ptr();
				(*context).extradata = ffmpeg::sys::av_malloc(data.len()) as *mut u8;
				(*context).extradata_size = data.len() as i32;
				std::ptr::copy_nonoverlapping(data.as_ptr(), (*context).extradata, data.len());
			}
		}

		Ok(Self { decoder })
	}

	pub fn decode(&mut self, frame: &Frame) -> Result<Option<DecodedFrame>> {
		let mut packet = ffmpeg::codec::packet::Packet::copy(frame.data.as_ref());
		packet.set_pts(Some(frame.timestamp.as_micros() as i64));

		self.decoder
			.send_packet(&packet)
			.map_err(|e| Error::DecoderError(e.to_string()))?;

		let mut decoded = ffmpeg::frame::Audio::empty();
		match self.decoder.receive_frame(&mut decoded) {
			Ok(()) => Ok(Some(to_decoded_frame(&decoded, frame.timestamp)?)),
			Err(_) => Ok(None),
		}
	}

	pub fn flush(&mut self) -> Result<Vec<DecodedFrame>> {
		self.decoder.send_eof().map_err(|e| Error::DecoderError(e.to_string()))?;

		let mut frames = Vec::new();
		loop {
			let mut decoded = ffmpeg::frame::Audio::empty();
			match self.decoder.receive_frame(&mut decoded) {
				Ok(()) => {
					let timestamp = Timestamp::from_micros(decoded.pts().unwrap_or(0).max(0) as u64).unwrap_or(Timestamp::ZERO);
					frames.push(to_decoded_frame(&decoded, timestamp)?);
				}
				Err(_) => break,
			}
		}
		Ok(frames)
	}
}

fn to_decoded_frame(decoded: &ffmpeg::frame::Audio, timestamp: Timestamp) -> Result<DecodedFrame> {
	let format = SampleFormat::from_ffmpeg(decoded.format())
		.ok_or_else(|| Error::DecoderError(format!("unsupported sample format {:?}", decoded.format())))?;

	let channels = decoded.channels() as u32;
	let sample_size = format.sample_size();

	let data = if decoded.is_planar() {
		let samples_per_channel = decoded.samples();
		let mut interleaved = Vec::with_capacity(samples_per_channel * channels as usize * sample_size);
		for sample_idx in 0..samples_per_channel {
			for channel in 0..channels as usize {
				let plane = decoded.data(channel);
				let offset = sample_idx * sample_size;
				interleaved.extend_from_slice(&plane[offset..offset + sample_size]);
			}
		}
		interleaved
	} else {
		decoded.data(0).to_vec()
	};

	Ok(DecodedFrame {
		timestamp,
		format,
		sample_rate: decoded.rate(),
		channels,
		data: Arc::new(data),
	})
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn maps_known_codec_families() {
		assert_eq!(codec_id("mp4a.40.2").unwrap(), ffmpeg::codec::Id::AAC);
		assert_eq!(codec_id("opus").unwrap(), ffmpeg::codec::Id::OPUS);
	}

	#[test]
	fn rejects_unknown_codec() {
		assert!(matches!(codec_id("avc1.64001f"), Err(Error::CodecUnsupported(_))));
	}
}
