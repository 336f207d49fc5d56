//! Request body pause/resume
//!
//! Middleware needs to do async work (filesystem probes, waiting for an
//! application to boot) before the eventual consumer of a request body is
//! attached. From the moment [`pause`] is called, a pump task captures every
//! body frame into an in-memory queue and the request emits nothing. Once
//! [`ResumeHandle::resume`] is invoked, captured frames are re-emitted in
//! order and subsequent frames flow through unmodified. No frame is ever
//! dropped, and `resume` is idempotent.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use http_body_util::BodyExt;
use hyper::body::{Body, Bytes, Frame};
use hyper::Request;
use parking_lot::Mutex;
use tokio::sync::mpsc;

/// Errors surfaced through a paused body (the inner body's error, boxed).
pub type BodyError = Box<dyn std::error::Error + Send + Sync>;

/// Gate shared between a [`PausedBody`] and its [`ResumeHandle`].
#[derive(Debug, Default)]
struct Gate {
    resumed: AtomicBool,
    waker: Mutex<Option<Waker>>,
}

/// Releases a paused request body. Cheap to clone; `resume` is idempotent.
#[derive(Debug, Clone)]
pub struct ResumeHandle {
    gate: Arc<Gate>,
}

impl ResumeHandle {
    /// Let captured and future frames flow to the consumer.
    pub fn resume(&self) {
        if !self.gate.resumed.swap(true, Ordering::AcqRel) {
            if let Some(waker) = self.gate.waker.lock().take() {
                waker.wake();
            }
        }
    }

    #[cfg(test)]
    fn is_resumed(&self) -> bool {
        self.gate.resumed.load(Ordering::Acquire)
    }
}

/// A request body whose frames are buffered until resumed.
pub struct PausedBody {
    gate: Arc<Gate>,
    frames: mpsc::UnboundedReceiver<Result<Frame<Bytes>, BodyError>>,
}

impl Body for PausedBody {
    type Data = Bytes;
    type Error = BodyError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, BodyError>>> {
        let this = self.get_mut();
        if !this.gate.resumed.load(Ordering::Acquire) {
            *this.gate.waker.lock() = Some(cx.waker().clone());
            // Re-check after storing the waker so a concurrent resume cannot
            // slip between the load and the store.
            if !this.gate.resumed.load(Ordering::Acquire) {
                return Poll::Pending;
            }
        }
        this.frames.poll_recv(cx)
    }
}

/// Pause a request's body.
///
/// The returned request carries a [`PausedBody`] in place of the original
/// body; the [`ResumeHandle`] releases it. A background task drains the
/// original body into the queue so the client is never blocked on the proxy's
/// routing decisions.
pub fn pause<B>(req: Request<B>) -> (Request<PausedBody>, ResumeHandle)
where
    B: Body<Data = Bytes> + Send + Unpin + 'static,
    B::Error: Into<BodyError>,
{
    let (parts, body) = req.into_parts();
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let mut body = body;
        while let Some(frame) = body.frame().await {
            if tx.send(frame.map_err(Into::into)).is_err() {
                // Consumer went away; stop pumping.
                break;
            }
        }
    });

    let gate = Arc::new(Gate::default());
    let paused = PausedBody {
        gate: Arc::clone(&gate),
        frames: rx,
    };
    (
        Request::from_parts(parts, paused),
        ResumeHandle { gate },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::convert::Infallible;
    use std::time::Duration;

    /// Body emitting one frame per prepared chunk.
    struct ChunkedBody {
        chunks: VecDeque<Bytes>,
    }

    impl ChunkedBody {
        fn new(chunks: &[&str]) -> Self {
            Self {
                chunks: chunks.iter().map(|c| Bytes::from(c.to_string())).collect(),
            }
        }
    }

    impl Body for ChunkedBody {
        type Data = Bytes;
        type Error = Infallible;

        fn poll_frame(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
        ) -> Poll<Option<Result<Frame<Bytes>, Infallible>>> {
            Poll::Ready(self.get_mut().chunks.pop_front().map(|c| Ok(Frame::data(c))))
        }
    }

    fn request_with_chunks(chunks: &[&str]) -> Request<ChunkedBody> {
        Request::builder()
            .uri("/upload")
            .body(ChunkedBody::new(chunks))
            .unwrap()
    }

    async fn collect_body(body: PausedBody) -> String {
        let collected = body.collect().await.unwrap();
        String::from_utf8(collected.to_bytes().to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_no_frames_before_resume() {
        let (req, _resume) = pause(request_with_chunks(&["hello"]));
        let body = req.into_body();

        let read = tokio::time::timeout(Duration::from_millis(50), collect_body(body)).await;
        assert!(read.is_err(), "paused body must not yield frames");
    }

    #[tokio::test]
    async fn test_resume_releases_captured_frames_in_order() {
        let (req, resume) = pause(request_with_chunks(&["a", "b", "c"]));
        let body = req.into_body();

        // Give the pump a chance to capture everything before resuming.
        tokio::time::sleep(Duration::from_millis(20)).await;
        resume.resume();

        assert_eq!(collect_body(body).await, "abc");
    }

    #[tokio::test]
    async fn test_resume_before_consumer_polls() {
        let (req, resume) = pause(request_with_chunks(&["payload"]));
        resume.resume();
        assert_eq!(collect_body(req.into_body()).await, "payload");
    }

    #[tokio::test]
    async fn test_resume_is_idempotent() {
        let (req, resume) = pause(request_with_chunks(&["x"]));
        resume.resume();
        resume.resume();
        assert!(resume.is_resumed());
        assert_eq!(collect_body(req.into_body()).await, "x");
    }

    #[tokio::test]
    async fn test_resume_wakes_pending_consumer() {
        let (req, resume) = pause(request_with_chunks(&["wa", "ke"]));
        let reader = tokio::spawn(collect_body(req.into_body()));

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!reader.is_finished());

        resume.resume();
        assert_eq!(reader.await.unwrap(), "wake");
    }

    #[tokio::test]
    async fn test_empty_body_ends_cleanly() {
        let (req, resume) = pause(request_with_chunks(&[]));
        resume.resume();
        assert_eq!(collect_body(req.into_body()).await, "");
    }

    #[tokio::test]
    async fn test_headers_preserved() {
        let req = Request::builder()
            .uri("/")
            .header("content-type", "text/plain")
            .body(ChunkedBody::new(&["z"]))
            .unwrap();
        let (req, _resume) = pause(req);
        assert_eq!(req.headers().get("content-type").unwrap(), "text/plain");
    }
}
