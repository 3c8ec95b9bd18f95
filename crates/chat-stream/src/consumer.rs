use bytes::Bytes;
use futures::StreamExt as _;
use futures::stream::{self, BoxStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::errors::{ChatError, TransportError};
use crate::frame::{SseDecoder, SseFrame, StreamFrame, frames_from_sse};
use crate::render::{PacingPolicy, RenderBuffer};
use crate::stream::StreamObserver;

type ByteStream = BoxStream<'static, Result<Bytes, TransportError>>;

/// Handle used to stop a render task.
#[derive(Clone)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    /// Stops network consumption and the display timer.
    ///
    /// No observer callback begins after this returns, on any runtime flavor:
    /// a callback already running finishes first. Repeated calls are no-ops.
    /// Observers must not cancel their own task from inside a callback.
    pub fn cancel(&self) {
        if !self.tx.send_replace(true) {
            debug!("render task cancellation requested");
        }
    }

    /// Returns `true` once `cancel` has been called.
    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }
}

/// How a render task ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RenderStatus {
    /// Network ended and every received character was displayed.
    Completed,
    /// The caller cancelled the task.
    Cancelled,
}

/// Final state of a render task.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RenderOutcome {
    pub stream_id: uuid::Uuid,
    pub status: RenderStatus,
    /// Displayed text when the task ended. Partial on cancellation.
    pub text: String,
    /// Message of the `error` frame or read failure, if any.
    pub error: Option<String>,
    /// Session the stream belongs to: the bound one, else the known one.
    pub session_id: Option<String>,
}

impl RenderOutcome {
    /// `true` when the stream completed without content and without error.
    pub fn is_empty_response(&self) -> bool {
        self.status == RenderStatus::Completed && self.error.is_none() && self.text.is_empty()
    }
}

/// A running render task.
pub struct RenderTask {
    stream_id: uuid::Uuid,
    cancel: CancelHandle,
    join: JoinHandle<RenderOutcome>,
}

impl RenderTask {
    pub fn stream_id(&self) -> uuid::Uuid {
        self.stream_id
    }

    /// Returns a handle that can cancel the task.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Shorthand for `cancel_handle().cancel()`.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Waits for the task to end and returns its outcome.
    pub async fn wait(self) -> Result<RenderOutcome, ChatError> {
        self.join.await.map_err(|e| {
            ChatError::Protocol(format!(
                "render task {} ended without an outcome: {e}",
                self.stream_id
            ))
        })
    }
}

/// Consumes an SSE chat response and paces its text onto the screen.
///
/// Arrival and display are decoupled: content frames land in a pending buffer
/// as fast as the network delivers them, and a fixed-period display tick moves
/// a backlog-sized prefix into the displayed text.
#[derive(Clone, Debug, Default)]
pub struct StreamingResponseConsumer {
    policy: PacingPolicy,
}

impl StreamingResponseConsumer {
    pub fn new(policy: PacingPolicy) -> Result<Self, ChatError> {
        policy.validate()?;
        Ok(Self { policy })
    }

    pub fn policy(&self) -> &PacingPolicy {
        &self.policy
    }

    /// Starts rendering `body` with a fresh stream id.
    ///
    /// `body` must be the body of a 2xx `text/event-stream` response.
    /// `known_session` is the session id the caller currently holds; a
    /// `session` frame carrying the same id is not reported.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start<S, E, O>(&self, body: S, observer: O, known_session: Option<String>) -> RenderTask
    where
        S: futures::Stream<Item = Result<Bytes, E>> + Send + 'static,
        E: Into<TransportError> + 'static,
        O: StreamObserver,
    {
        self.start_with_id(uuid::Uuid::new_v4(), body, observer, known_session)
    }

    /// Same as [`start`](Self::start) with a caller-chosen stream id, so
    /// observer events and the task can be correlated.
    pub fn start_with_id<S, E, O>(
        &self,
        stream_id: uuid::Uuid,
        body: S,
        observer: O,
        known_session: Option<String>,
    ) -> RenderTask
    where
        S: futures::Stream<Item = Result<Bytes, E>> + Send + 'static,
        E: Into<TransportError> + 'static,
        O: StreamObserver,
    {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let body: ByteStream = body.map(|item| item.map_err(Into::into)).boxed();
        debug!(stream_id = %stream_id, known_session = ?known_session, "starting render task");
        let join = tokio::spawn(render_task(
            stream_id,
            self.policy.clone(),
            body,
            observer,
            known_session,
            cancel_rx,
        ));
        RenderTask {
            stream_id,
            cancel: CancelHandle { tx: cancel_tx },
            join,
        }
    }
}

struct RenderState<O> {
    stream_id: uuid::Uuid,
    observer: O,
    cancel_rx: watch::Receiver<bool>,
    buffer: RenderBuffer,
    decoder: SseDecoder,
    network_open: bool,
    known_session: Option<String>,
    bound_session: Option<String>,
    error: Option<String>,
    content_frames: u64,
}

impl<O: StreamObserver> RenderState<O> {
    fn cancelled(&self) -> bool {
        *self.cancel_rx.borrow()
    }

    fn apply_chunk(&mut self, chunk: &[u8]) {
        for frame in self.decoder.push_chunk(chunk) {
            if !self.apply_sse_frame(&frame) {
                return;
            }
        }
    }

    fn apply_end_of_stream(&mut self) {
        if let Some(frame) = self.decoder.finish() {
            self.apply_sse_frame(&frame);
        }
        self.close_network("end of stream");
    }

    /// Returns `false` once the network phase has ended.
    fn apply_sse_frame(&mut self, frame: &SseFrame) -> bool {
        for parsed in frames_from_sse(frame) {
            self.apply_frame(parsed);
            if !self.network_open {
                return false;
            }
        }
        true
    }

    fn apply_frame(&mut self, frame: StreamFrame) {
        match frame {
            StreamFrame::Content { text } => {
                self.content_frames += 1;
                self.buffer.push_pending(&text);
            }
            StreamFrame::Session { session_id } => self.bind_session(session_id),
            StreamFrame::Done => self.close_network("done frame"),
            StreamFrame::Error { message } => {
                self.report_error(message);
                self.close_network("error frame");
            }
            StreamFrame::Unknown { kind } => {
                debug!(stream_id = %self.stream_id, kind = %kind, "ignoring frame");
            }
        }
    }

    fn bind_session(&mut self, session_id: String) {
        if self.bound_session.is_some() {
            debug!(stream_id = %self.stream_id, "ignoring repeated session frame");
            return;
        }
        let changed = self.known_session.as_deref() != Some(session_id.as_str());
        if changed {
            debug!(stream_id = %self.stream_id, session_id = %session_id, "session assigned");
            notify(&self.cancel_rx, &mut self.observer, |o| {
                o.on_session_assigned(&session_id)
            });
        }
        self.bound_session = Some(session_id);
    }

    fn report_error(&mut self, message: String) {
        if self.error.is_some() {
            return;
        }
        warn!(stream_id = %self.stream_id, error = %message, "chat stream reported an error");
        notify(&self.cancel_rx, &mut self.observer, |o| o.on_error(&message));
        self.error = Some(message);
    }

    fn handle_read_error(&mut self, err: TransportError) {
        if err.is_cancelled() {
            debug!(stream_id = %self.stream_id, "stream read aborted by caller");
        } else {
            warn!(stream_id = %self.stream_id, error = %err, "stream read failed");
            self.report_error(err.to_string());
        }
        self.close_network("read failure");
    }

    fn close_network(&mut self, reason: &'static str) {
        if self.network_open {
            debug!(
                stream_id = %self.stream_id,
                reason,
                content_frames = self.content_frames,
                discarded_bytes = self.decoder.buffered_len(),
                "network phase ended"
            );
            self.network_open = false;
        }
    }

    fn tick(&mut self, policy: &PacingPolicy) {
        let step = policy.chunk_size(self.buffer.backlog());
        if self.buffer.promote(step) {
            notify(&self.cancel_rx, &mut self.observer, |o| {
                o.on_update(self.buffer.displayed())
            });
        }
    }

    fn outcome(self, status: RenderStatus) -> RenderOutcome {
        RenderOutcome {
            stream_id: self.stream_id,
            status,
            text: self.buffer.into_displayed(),
            error: self.error,
            session_id: self.bound_session.or(self.known_session),
        }
    }
}

/// Runs `f` unless the task was cancelled. Returns whether it ran.
///
/// The watch read guard is held across the callback, so `CancelHandle::cancel`
/// waits for a running callback and no callback starts once it has returned.
fn notify<O>(
    cancel_rx: &watch::Receiver<bool>,
    observer: &mut O,
    f: impl FnOnce(&mut O),
) -> bool {
    let cancelled = cancel_rx.borrow();
    if *cancelled {
        return false;
    }
    f(observer);
    true
}

async fn render_task<O: StreamObserver>(
    stream_id: uuid::Uuid,
    policy: PacingPolicy,
    mut body: ByteStream,
    observer: O,
    known_session: Option<String>,
    cancel_rx: watch::Receiver<bool>,
) -> RenderOutcome {
    let mut watch_rx = cancel_rx.clone();
    let mut state = RenderState {
        stream_id,
        observer,
        cancel_rx,
        buffer: RenderBuffer::default(),
        decoder: SseDecoder::default(),
        network_open: true,
        known_session,
        bound_session: None,
        error: None,
        content_frames: 0,
    };
    let mut ticker = tokio::time::interval(policy.tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut cancel_open = true;
    let mut body_released = false;

    loop {
        if state.cancelled() {
            debug!(stream_id = %stream_id, displayed = state.buffer.displayed().len(), "render task cancelled");
            return state.outcome(RenderStatus::Cancelled);
        }
        if !state.network_open {
            if !body_released {
                // Dropping the body releases the connection and any unread bytes.
                body = stream::empty().boxed();
                body_released = true;
            }
            if state.buffer.backlog() == 0 {
                let completed = notify(&state.cancel_rx, &mut state.observer, |o| {
                    o.on_complete(state.buffer.displayed())
                });
                if !completed {
                    return state.outcome(RenderStatus::Cancelled);
                }
                debug!(stream_id = %stream_id, chars = state.buffer.displayed().chars().count(), "render task completed");
                return state.outcome(RenderStatus::Completed);
            }
        }

        let has_backlog = state.buffer.backlog() > 0;
        let network_open = state.network_open;
        tokio::select! {
            biased;
            changed = watch_rx.changed(), if cancel_open => {
                // Every handle dropped: the task can no longer be cancelled.
                if changed.is_err() {
                    cancel_open = false;
                }
            }
            _ = ticker.tick(), if has_backlog => state.tick(&policy),
            next = body.next(), if network_open => match next {
                Some(Ok(chunk)) => state.apply_chunk(&chunk),
                Some(Err(err)) => state.handle_read_error(err),
                None => state.apply_end_of_stream(),
            },
        }
    }
}
