//! Path A video decoding via FFmpeg (spec.md §4.2).

use std::sync::Arc;

use ffmpeg_next as ffmpeg;

use crate::model::{Frame, Timestamp};
use crate::{Error, Result};

/// A single decoded video frame, ready for presentation scheduling.
#[derive(Debug, Clone)]
pub struct DecodedFrame {
	pub timestamp: Timestamp,
	pub format: PixelFormat,
	pub width: u32,
	pub height: u32,
	pub planes: Vec<Plane>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
	Yuv420p,
	Yuv422p,
	Yuv444p,
	Rgb24,
	Rgba,
}

impl PixelFormat {
	fn from_ffmpeg(format: ffmpeg::format::Pixel) -> Option<Self> {
		use ffmpeg::format::Pixel;
		match format {
			Pixel::YUV420P => Some(Self::Yuv420p),
			Pixel::YUV422P => Some(Self::Yuv422p),
			Pixel::YUV444P => Some(Self::Yuv444p),
			Pixel::RGB24 => Some(Self::Rgb24),
			Pixel::RGBA => Some(Self::Rgba),
			_ => None,
		}
	}

	fn plane_count(self) -> usize {
		match self {
			Self::Yuv420p | Self::Yuv422p | Self::Yuv444p => 3,
			Self::Rgb24 | Self::Rgba => 1,
		}
	}
}

#[derive(Debug, Clone)]
pub struct Plane {
	pub data: Arc<Vec<u8>>,
	pub stride: usize,
}

/// Maps a catalog codec mimetype (e.g. `avc1.64001f`) to an FFmpeg codec id.
fn codec_id(codec: &str) -> Result<ffmpeg::codec::Id> {
	let family = codec.split('.').next().unwrap_or(codec);
	Ok(match family {
		"avc1" | "avc3" => ffmpeg::codec::Id::H264,
		"hev1" | "hvc1" => ffmpeg::codec::Id::HEVC,
		"vp8" | "vp08" => ffmpeg::codec::Id::VP8,
		"vp9" | "vp09" => ffmpeg::codec::Id::VP9,
		"av01" => ffmpeg::codec::Id::AV1,
		_ => return Err(Error::CodecUnsupported(codec.to_string())),
	})
}

/// FFmpeg-backed decoder for one video rendition (Path A).
pub struct VideoDecoder {
	decoder: ffmpeg::decoder::Video,
}

impl VideoDecoder {
	pub fn new(codec: &str, description: Option<&[u8]>) -> Result<Self> {
		ffmpeg::init().map_err(|e| Error::DecoderError(e.to_string()))?;

		let id = codec_id(codec)?;
		let codec = ffmpeg::codec::decoder::find(id).ok_or_else(|| Error::CodecUnsupported(codec.to_string()))?;

		let context = ffmpeg::codec::context::Context::new_with_codec(codec);
		let mut decoder = context.decoder();
		let mut decoder = decoder.video().map_err(|e| Error::DecoderError(e.to_string()))?;

		if let Some(data) = description {
			// SAFETY: `extradata` is owned by the decoder context and freed on drop;
			// we allocate it with FFmpeg's own allocator and copy `data` into it once.
			unsafe {
				let context = decoder.as_mut_ptr();
				(*context).extradata = ffmpeg::sys::av_malloc(data.len()) as *mut u8;
				(*context).extradata_size = data.len() as i32;
				std::ptr::copy_nonoverlapping(data.as_ptr(), (*context).extradata, data.len());
			}
		}

		Ok(Self { decoder })
	}

	/// Feed one frame to the decoder. Returns `Ok(None)` if the decoder needs
	/// more input before it can emit a picture (common with B-frame reordering).
	pub fn decode(&mut self, frame: &Frame) -> Result<Option<DecodedFrame>> {
		let mut packet = ffmpeg::codec::packet::Packet::copy(frame.data.as_ref());
		packet.set_pts(Some(frame.timestamp.as_micros() as i64));

		self.decoder
			.send_packet(&packet)
			.map_err(|e| Error::DecoderError(e.to_string()))?;

		let mut decoded = ffmpeg::frame::Video::empty();
		match self.decoder.receive_frame(&mut decoded) {
			Ok(()) => Ok(Some(to_decoded_frame(&decoded, frame.timestamp)?)),
			Err(_) => Ok(None),
		}
	}

	/// Drain any frames buffered inside the decoder (e.g. on rendition switch).
	pub fn flush(&mut self) -> Result<Vec<DecodedFrame>> {
		self.decoder.send_eof().map_err(|e| Error::DecoderError(e.to_string()))?;

		let mut frames = Vec::new();
		loop {
			let mut decoded = ffmpeg::frame::Video::empty();
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

fn to_decoded_frame(decoded: &ffmpeg::frame::Video, timestamp: Timestamp) -> Result<DecodedFrame> {
	let format = PixelFormat::from_ffmpeg(decoded.format())
		.ok_or_else(|| Error::DecoderError(format!("unsupported pixel format {:?}", decoded.format())))?;

	let planes = (0..format.plane_count())
		.map(|i| Plane {
			data: Arc::new(decoded.data(i).to_vec()),
			stride: decoded.stride(i),
		})
		.collect();

	Ok(DecodedFrame {
		timestamp,
		format,
		width: decoded.width(),
		height: decoded.height(),
		planes,
	})
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn maps_known_codec_families() {
		assert_eq!(codec_id("avc1.64001f").unwrap(), ffmpeg::codec::Id::H264);
		assert_eq!(codec_id("hev1.1.6.L93.B0").unwrap(), ffmpeg::codec::Id::HEVC);
		assert_eq!(codec_id("vp09.00.10.08").unwrap(), ffmpeg::codec::Id::VP9);
		assert_eq!(codec_id("av01.0.04M.08").unwrap(), ffmpeg::codec::Id::AV1);
	}

	#[test]
	fn rejects_unknown_codec() {
		assert!(matches!(codec_id("mp4a.40.2"), Err(Error::CodecUnsupported(_))));
	}
}
