//! Body tee: capture sits *on* the forwarded stream, never in front of it.
//!
//! Frames pass through untouched while cheap `Bytes` clones feed a bounded
//! side channel. The consumer accumulates the capped capture prefix and, for
//! SSE responses, the streaming parser. A full side channel sheds clones
//! instead of applying backpressure to the data plane.

use bytes::{Bytes, BytesMut};
use http_body::Frame;
use pin_project_lite::pin_project;
use std::pin::Pin;
use std::task::{Context, Poll, ready};
use tokio::sync::mpsc;

/// Side-channel messages from the tee to its capture task.
#[derive(Debug)]
pub enum TeeMsg {
	Chunk(Bytes),
	/// Terminal marker. `ok` is false when the stream ended in an error;
	/// `live_lost` means some chunks were shed because the channel was full.
	End { ok: bool, live_lost: bool },
}

/// Channel depth for tee side channels. Chunks are refcounted slices, so
/// depth bounds latency, not payload memory.
pub const TEE_CHANNEL_DEPTH: usize = 512;

pin_project! {
	pub struct TeeBody<B> {
		#[pin]
		inner: B,
		tx: Option<mpsc::Sender<TeeMsg>>,
		live_lost: bool,
	}
}

impl<B> TeeBody<B> {
	pub fn new(inner: B) -> (TeeBody<B>, mpsc::Receiver<TeeMsg>) {
		let (tx, rx) = mpsc::channel(TEE_CHANNEL_DEPTH);
		(
			TeeBody {
				inner,
				tx: Some(tx),
				live_lost: false,
			},
			rx,
		)
	}
}

impl<B> http_body::Body for TeeBody<B>
where
	B: http_body::Body<Data = Bytes>,
{
	type Data = Bytes;
	type Error = B::Error;

	fn poll_frame(
		self: Pin<&mut Self>,
		cx: &mut Context<'_>,
	) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
		let this = self.project();
		let res = match ready!(this.inner.poll_frame(cx)) {
			None => {
				if let Some(tx) = this.tx.take() {
					let _ = tx.try_send(TeeMsg::End {
						ok: true,
						live_lost: *this.live_lost,
					});
				}
				None
			},
			Some(Ok(frame)) => {
				if let Some(data) = frame.data_ref()
					&& let Some(tx) = this.tx.as_ref()
					&& !data.is_empty()
				{
					match tx.try_send(TeeMsg::Chunk(data.clone())) {
						Ok(()) => {},
						Err(mpsc::error::TrySendError::Full(_)) => *this.live_lost = true,
						Err(mpsc::error::TrySendError::Closed(_)) => {
							*this.tx = None;
						},
					}
				}
				Some(Ok(frame))
			},
			Some(Err(err)) => {
				if let Some(tx) = this.tx.take() {
					let _ = tx.try_send(TeeMsg::End {
						ok: false,
						live_lost: *this.live_lost,
					});
				}
				Some(Err(err))
			},
		};
		Poll::Ready(res)
	}

	fn is_end_stream(&self) -> bool {
		self.inner.is_end_stream()
	}

	fn size_hint(&self) -> http_body::SizeHint {
		self.inner.size_hint()
	}
}

/// What a fully drained tee side channel amounts to.
#[derive(Debug, Clone, Default)]
pub struct RawCapture {
	/// First `limit` bytes of the stream.
	pub bytes: Bytes,
	pub total: usize,
	pub truncated: bool,
	/// None when the tee was dropped mid-stream (client disconnect).
	pub ended_ok: Option<bool>,
	pub live_lost: bool,
}

/// Accumulate the capture prefix from a tee channel. `on_chunk` sees every
/// chunk that made it onto the channel, in order, for incremental parsing.
pub async fn drain_capture(
	mut rx: mpsc::Receiver<TeeMsg>,
	limit: usize,
	mut on_chunk: impl FnMut(&Bytes),
) -> RawCapture {
	let mut buf = BytesMut::new();
	let mut capture = RawCapture::default();
	while let Some(msg) = rx.recv().await {
		match msg {
			TeeMsg::Chunk(data) => {
				capture.total += data.len();
				if buf.len() < limit {
					let want = (limit - buf.len()).min(data.len());
					buf.extend_from_slice(&data[..want]);
				}
				on_chunk(&data);
			},
			TeeMsg::End { ok, live_lost } => {
				capture.ended_ok = Some(ok);
				capture.live_lost = live_lost;
				break;
			},
		}
	}
	capture.truncated = capture.total > limit;
	capture.bytes = buf.freeze();
	capture
}
