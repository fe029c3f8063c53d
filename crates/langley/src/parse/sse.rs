//! Incremental `text/event-stream` framing.
//!
//! The proxy feeds response chunks in as they pass through the tee; frames
//! come out as soon as their terminating blank line arrives. Decoding never
//! waits for the end of the stream.

use bytes::{Buf, BytesMut};
use tokio_util::codec::Decoder;

/// One server-sent event: optional `event:` name plus the joined `data:`
/// lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
	pub event: Option<String>,
	pub data: String,
}

#[derive(Debug, Default)]
pub struct SseDecoder {
	// Scan resume offset, so re-decoding after a partial frame is O(new bytes).
	scanned: usize,
}

impl Decoder for SseDecoder {
	type Item = SseFrame;
	type Error = std::io::Error;

	fn decode(&mut self, src: &mut BytesMut) -> Result<Option<SseFrame>, Self::Error> {
		// Comment-only frames parse to nothing; keep scanning past them.
		loop {
			let Some(end) = find_frame_end(&src[..], self.scanned) else {
				self.scanned = src.len().saturating_sub(2);
				return Ok(None);
			};
			let raw = src.split_to(end.frame_len);
			src.advance(end.separator_len);
			self.scanned = 0;
			if let Some(frame) = parse_frame(&raw[..]) {
				return Ok(Some(frame));
			}
		}
	}

	fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<SseFrame>, Self::Error> {
		if let Some(frame) = self.decode(src)? {
			return Ok(Some(frame));
		}
		if src.is_empty() {
			return Ok(None);
		}
		// Trailing bytes with no blank line: emit what we have.
		let raw = src.split();
		self.scanned = 0;
		Ok(parse_frame(&raw[..]))
	}
}

struct FrameEnd {
	frame_len: usize,
	separator_len: usize,
}

fn find_frame_end(buf: &[u8], from: usize) -> Option<FrameEnd> {
	let mut i = from;
	while i < buf.len() {
		if buf[i] == b'\n' {
			if buf.len() > i + 1 && buf[i + 1] == b'\n' {
				return Some(FrameEnd {
					frame_len: i + 1,
					separator_len: 1,
				});
			}
			if buf.len() > i + 2 && buf[i + 1] == b'\r' && buf[i + 2] == b'\n' {
				return Some(FrameEnd {
					frame_len: i + 1,
					separator_len: 2,
				});
			}
		}
		i += 1;
	}
	None
}

fn parse_frame(raw: &[u8]) -> Option<SseFrame> {
	let text = String::from_utf8_lossy(raw);
	let mut event = None;
	let mut data_lines: Vec<&str> = Vec::new();
	for line in text.lines() {
		if let Some(rest) = line.strip_prefix("event:") {
			event = Some(rest.trim_start().to_string());
		} else if let Some(rest) = line.strip_prefix("data:") {
			data_lines.push(rest.strip_prefix(' ').unwrap_or(rest));
		}
		// Comment lines (':') and id/retry fields carry nothing we record.
	}
	if event.is_none() && data_lines.is_empty() {
		return None;
	}
	Some(SseFrame {
		event,
		data: data_lines.join("\n"),
	})
}

/// Push-style wrapper over the decoder for callers holding an mpsc of chunks.
#[derive(Debug, Default)]
pub struct SseParser {
	buf: BytesMut,
	decoder: SseDecoder,
}

impl SseParser {
	pub fn push(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
		self.buf.extend_from_slice(chunk);
		let mut frames = Vec::new();
		while let Ok(Some(frame)) = self.decoder.decode(&mut self.buf) {
			frames.push(frame);
		}
		frames
	}

	pub fn finish(&mut self) -> Vec<SseFrame> {
		let mut frames = Vec::new();
		while let Ok(Some(frame)) = self.decoder.decode_eof(&mut self.buf) {
			frames.push(frame);
		}
		frames
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn decodes_anthropic_style_frames() {
		let mut p = SseParser::default();
		let frames = p.push(
			b"event: message_start\ndata: {\"type\":\"message_start\"}\n\nevent: ping\ndata: {}\n\n",
		);
		assert_eq!(frames.len(), 2);
		assert_eq!(frames[0].event.as_deref(), Some("message_start"));
		assert_eq!(frames[0].data, "{\"type\":\"message_start\"}");
		assert_eq!(frames[1].event.as_deref(), Some("ping"));
	}

	#[test]
	fn decodes_openai_style_data_frames() {
		let mut p = SseParser::default();
		let frames = p.push(b"data: {\"id\":\"1\"}\n\ndata: [DONE]\n\n");
		assert_eq!(frames.len(), 2);
		assert_eq!(frames[0].event, None);
		assert_eq!(frames[1].data, "[DONE]");
	}

	#[test]
	fn frames_split_across_chunks() {
		let mut p = SseParser::default();
		assert!(p.push(b"event: content_block_del").is_empty());
		assert!(p.push(b"ta\ndata: {\"d\":1}").is_empty());
		let frames = p.push(b"\n\n");
		assert_eq!(frames.len(), 1);
		assert_eq!(frames[0].event.as_deref(), Some("content_block_delta"));
	}

	#[test]
	fn crlf_frames_decode() {
		let mut p = SseParser::default();
		let frames = p.push(b"data: one\r\n\r\ndata: two\r\n\r\n");
		assert_eq!(frames.len(), 2);
		assert_eq!(frames[0].data, "one");
		assert_eq!(frames[1].data, "two");
	}

	#[test]
	fn multi_line_data_joined() {
		let mut p = SseParser::default();
		let frames = p.push(b"data: line1\ndata: line2\n\n");
		assert_eq!(frames.len(), 1);
		assert_eq!(frames[0].data, "line1\nline2");
	}

	#[test]
	fn finish_flushes_trailing_frame() {
		let mut p = SseParser::default();
		assert!(p.push(b"data: tail").is_empty());
		let frames = p.finish();
		assert_eq!(frames.len(), 1);
		assert_eq!(frames[0].data, "tail");
	}

	#[test]
	fn comments_are_ignored() {
		let mut p = SseParser::default();
		let frames = p.push(b": keepalive\n\ndata: x\n\n");
		assert_eq!(frames.len(), 1);
		assert_eq!(frames[0].data, "x");
	}
}
