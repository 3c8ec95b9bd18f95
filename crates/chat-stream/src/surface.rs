use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::consumer::{CancelHandle, RenderOutcome, RenderStatus, StreamingResponseConsumer};
use crate::conversation::{Conversation, ConversationTurn};
use crate::errors::ChatError;
use crate::stream::{ChannelObserver, RenderEvent};
use crate::transport::{Attachment, ChatRequest, ChatTransport, upload_all};

/// Attachments uploaded at once when none is configured.
pub const DEFAULT_UPLOAD_CONCURRENCY: usize = 3;

struct InFlight {
    stream_id: uuid::Uuid,
    cancel: CancelHandle,
    /// Session the stream belongs to; `None` until the backend assigns one to
    /// a brand-new conversation.
    session_id: Option<String>,
    error: Option<String>,
}

/// One chat view: a conversation plus at most one in-flight stream.
///
/// Render tasks report through a channel owned by the surface; the caller
/// drives the surface from a single task with [`pump`](Self::pump) or
/// [`next_event`](Self::next_event) + [`apply`](Self::apply).
pub struct ChatSurface<T: ChatTransport + ?Sized> {
    transport: Arc<T>,
    consumer: StreamingResponseConsumer,
    conversation: Conversation,
    events_tx: mpsc::UnboundedSender<RenderEvent>,
    events_rx: mpsc::UnboundedReceiver<RenderEvent>,
    in_flight: Option<InFlight>,
    upload_concurrency: usize,
    last_error: Option<String>,
}

impl<T: ChatTransport + ?Sized> ChatSurface<T> {
    pub fn new(transport: Arc<T>, consumer: StreamingResponseConsumer) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            transport,
            consumer,
            conversation: Conversation::new(),
            events_tx,
            events_rx,
            in_flight: None,
            upload_concurrency: DEFAULT_UPLOAD_CONCURRENCY,
            last_error: None,
        }
    }

    /// Overrides how many attachments upload concurrently.
    pub fn upload_concurrency(mut self, concurrency: usize) -> Self {
        self.upload_concurrency = concurrency.max(1);
        self
    }

    pub fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    pub fn is_streaming(&self) -> bool {
        self.in_flight.is_some()
    }

    pub fn active_stream_id(&self) -> Option<uuid::Uuid> {
        self.in_flight.as_ref().map(|f| f.stream_id)
    }

    /// Last transport or stream error message, cleared on the next submit.
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Sends a user message and starts rendering the reply.
    ///
    /// Any stream already in flight is cancelled first. Attachments are
    /// uploaded before the message is sent; an upload failure leaves the
    /// conversation untouched.
    pub async fn submit(
        &mut self,
        text: &str,
        attachments: Vec<Attachment>,
    ) -> Result<uuid::Uuid, ChatError> {
        let text = text.trim();
        if text.is_empty() && attachments.is_empty() {
            return Err(ChatError::Validation("message must not be empty".into()));
        }
        self.stop();
        self.last_error = None;

        let uploaded = upload_all(&*self.transport, &attachments, self.upload_concurrency).await?;
        self.conversation.push_user(text, uploaded);

        let request = ChatRequest {
            messages: self
                .conversation
                .to_request_messages()
                .map_err(|e| ChatError::Protocol(format!("failed to serialize messages: {e}")))?,
            session_id: self.conversation.session_id().map(ToOwned::to_owned),
        };
        let body = match self.transport.open_stream(&request).await {
            Ok(body) => body,
            Err(err) => {
                warn!(error = %err, "chat request failed before streaming");
                self.conversation.fail_request();
                self.last_error = Some(err.to_string());
                return Err(err.into());
            }
        };

        let stream_id = uuid::Uuid::new_v4();
        let observer = ChannelObserver::new(stream_id, self.events_tx.clone());
        let known_session = request.session_id.clone();
        let task = self
            .consumer
            .start_with_id(stream_id, body, observer, known_session.clone());
        info!(stream_id = %stream_id, session_id = ?known_session, "chat stream started");
        self.in_flight = Some(InFlight {
            stream_id,
            cancel: task.cancel_handle(),
            session_id: known_session,
            error: None,
        });
        Ok(stream_id)
    }

    /// Applies one render event. Returns the outcome when it resolved the
    /// in-flight stream.
    ///
    /// Events from streams that are no longer in flight are ignored.
    pub fn apply(&mut self, event: RenderEvent) -> Option<RenderOutcome> {
        let flight = match self.in_flight.as_mut() {
            Some(flight) if flight.stream_id == event.stream_id() => flight,
            _ => {
                debug!(stream_id = %event.stream_id(), "dropping event from stale stream");
                return None;
            }
        };
        match event {
            RenderEvent::Update { text, .. } => {
                self.conversation.upsert_assistant(&text);
                None
            }
            RenderEvent::SessionAssigned { session_id, .. } => {
                // The stream naming its own conversation is not a switch away.
                flight.session_id = Some(session_id.clone());
                self.conversation.bind_session(session_id);
                None
            }
            RenderEvent::Error { message, .. } => {
                self.last_error = Some(message.clone());
                flight.error = Some(message);
                None
            }
            RenderEvent::Completed { stream_id, text } => {
                let flight = self.in_flight.take()?;
                let outcome = RenderOutcome {
                    stream_id,
                    status: RenderStatus::Completed,
                    text,
                    error: flight.error,
                    session_id: flight.session_id,
                };
                self.conversation.finish_assistant(&outcome);
                Some(outcome)
            }
        }
    }

    /// Waits for the next render event of any stream.
    pub async fn next_event(&mut self) -> Option<RenderEvent> {
        self.events_rx.recv().await
    }

    /// Applies events until the in-flight stream resolves.
    ///
    /// Returns `None` right away when nothing is streaming.
    pub async fn pump(&mut self) -> Option<RenderOutcome> {
        while self.in_flight.is_some() {
            let event = self.events_rx.recv().await?;
            if let Some(outcome) = self.apply(event) {
                return Some(outcome);
            }
        }
        None
    }

    /// Stops the in-flight stream, keeping whatever text it displayed.
    ///
    /// Events the task queued before the cancel are applied first, so the
    /// outcome text matches the render task's displayed text. If the stream
    /// had already completed, that outcome is returned instead.
    pub fn stop(&mut self) -> Option<RenderOutcome> {
        let cancel = self.in_flight.as_ref()?.cancel.clone();
        cancel.cancel();
        while let Ok(event) = self.events_rx.try_recv() {
            if let Some(outcome) = self.apply(event) {
                return Some(outcome);
            }
        }
        let flight = self.in_flight.take()?;
        let outcome = RenderOutcome {
            stream_id: flight.stream_id,
            status: RenderStatus::Cancelled,
            text: self
                .conversation
                .current_assistant()
                .unwrap_or_default()
                .to_string(),
            error: flight.error,
            session_id: flight.session_id,
        };
        info!(stream_id = %outcome.stream_id, "chat stream stopped");
        self.conversation.finish_assistant(&outcome);
        Some(outcome)
    }

    /// Shows another session (user action).
    ///
    /// A stream that belongs to a different session, including one still
    /// waiting for its id, is cancelled first. Re-selecting the assigned
    /// session that is streaming keeps the stream and the current turns;
    /// `None` always starts over.
    pub fn switch_session(&mut self, session_id: Option<String>, turns: Vec<ConversationTurn>) {
        if let Some(flight) = &self.in_flight {
            if flight.session_id.is_some() && flight.session_id == session_id {
                debug!(session_id = ?session_id, "re-selected the streaming session");
                return;
            }
            debug!(
                from = ?flight.session_id,
                to = ?session_id,
                "switching away from streaming session"
            );
            self.stop();
        }
        self.conversation.load(session_id, turns);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::{AttachmentRef, NO_RESPONSE_FALLBACK, Role, UNREACHABLE_FALLBACK};
    use crate::errors::TransportError;
    use crate::transport::EventStream;
    use bytes::Bytes;
    use futures::StreamExt as _;
    use futures::channel::mpsc as fmpsc;
    use futures::stream;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct ScriptedTransport {
        bodies: Mutex<VecDeque<Result<EventStream, TransportError>>>,
        requests: Mutex<Vec<ChatRequest>>,
        uploads: Mutex<Vec<String>>,
    }

    impl ScriptedTransport {
        fn with(bodies: Vec<Result<EventStream, TransportError>>) -> Arc<Self> {
            Arc::new(Self {
                bodies: Mutex::new(bodies.into()),
                ..Self::default()
            })
        }
    }

    #[async_trait::async_trait]
    impl ChatTransport for ScriptedTransport {
        async fn open_stream(&self, request: &ChatRequest) -> Result<EventStream, TransportError> {
            self.requests.lock().expect("lock").push(request.clone());
            self.bodies
                .lock()
                .expect("lock")
                .pop_front()
                .unwrap_or_else(|| Err(TransportError::request("no scripted body")))
        }

        async fn upload(&self, attachment: &Attachment) -> Result<AttachmentRef, TransportError> {
            self.uploads.lock().expect("lock").push(attachment.file_name.clone());
            Ok(AttachmentRef {
                file_id: format!("r2://{}", attachment.file_name),
                file_name: attachment.file_name.clone(),
            })
        }
    }

    fn body(parts: &[&str]) -> Result<EventStream, TransportError> {
        let owned: Vec<Result<Bytes, TransportError>> = parts
            .iter()
            .map(|p| Ok(Bytes::from(p.to_string())))
            .collect();
        Ok(stream::iter(owned).boxed())
    }

    type LiveSender = fmpsc::UnboundedSender<Result<Bytes, TransportError>>;

    fn live_body() -> (LiveSender, Result<EventStream, TransportError>) {
        let (tx, rx) = fmpsc::unbounded();
        (tx, Ok(rx.boxed()))
    }

    fn send(tx: &LiveSender, payload: &str) {
        tx.unbounded_send(Ok(Bytes::from(format!("data: {payload}\n\n"))))
            .expect("body receiver alive");
    }

    fn surface(transport: Arc<ScriptedTransport>) -> ChatSurface<ScriptedTransport> {
        ChatSurface::new(transport, StreamingResponseConsumer::default())
    }

    #[tokio::test(start_paused = true)]
    async fn submit_streams_reply_into_conversation() {
        let transport = ScriptedTransport::with(vec![body(&[
            "data: {\"type\":\"session\",\"sessionId\":\"s-1\"}\n\n",
            "data: {\"type\":\"content\",\"content\":\"Hello, \"}\n\n",
            "data: {\"type\":\"content\",\"content\":\"world!\"}\n\ndata: {\"type\":\"done\"}\n\n",
        ])]);
        let mut surface = surface(transport.clone());

        surface.submit("  hi  ", Vec::new()).await.expect("submit");
        assert!(surface.is_streaming());
        let outcome = surface.pump().await.expect("outcome");

        assert_eq!(outcome.status, RenderStatus::Completed);
        assert_eq!(outcome.text, "Hello, world!");
        assert!(!surface.is_streaming());
        assert_eq!(surface.conversation().session_id(), Some("s-1"));
        assert_eq!(
            surface.conversation().turns(),
            &[
                ConversationTurn::user("hi"),
                ConversationTurn::assistant("Hello, world!"),
            ]
        );
        let requests = transport.requests.lock().expect("lock");
        assert_eq!(requests[0].session_id, None);
        assert_eq!(requests[0].messages[0].content, "hi");
    }

    #[tokio::test(start_paused = true)]
    async fn session_self_assignment_does_not_cancel_the_stream() {
        let (tx, live) = live_body();
        let mut surface = surface(ScriptedTransport::with(vec![live]));
        surface.submit("new case", Vec::new()).await.expect("submit");

        send(&tx, r#"{"type":"session","sessionId":"s-1"}"#);
        let event = surface.next_event().await.expect("event");
        assert!(matches!(event, RenderEvent::SessionAssigned { .. }));
        assert!(surface.apply(event).is_none());
        assert!(surface.is_streaming());
        assert_eq!(surface.conversation().session_id(), Some("s-1"));

        send(&tx, r#"{"type":"content","content":"still here"}"#);
        send(&tx, r#"{"type":"done"}"#);
        let outcome = surface.pump().await.expect("outcome");
        assert_eq!(outcome.text, "still here");
        assert_eq!(outcome.session_id.as_deref(), Some("s-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn switching_to_another_session_cancels_the_stream() {
        let (tx, live) = live_body();
        let mut surface = surface(ScriptedTransport::with(vec![live]));
        surface.switch_session(Some("s-1".into()), vec![ConversationTurn::user("earlier")]);
        surface.submit("follow up", Vec::new()).await.expect("submit");

        send(&tx, r#"{"type":"content","content":"par"}"#);
        while surface.conversation().current_assistant() != Some("par") {
            let event = surface.next_event().await.expect("event");
            surface.apply(event);
        }

        surface.switch_session(Some("s-2".into()), vec![ConversationTurn::user("other")]);
        assert!(!surface.is_streaming());
        assert_eq!(surface.conversation().session_id(), Some("s-2"));
        assert_eq!(surface.conversation().turns(), &[ConversationTurn::user("other")]);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(tx.is_closed(), "cancelled stream should release its body");
        while let Ok(event) = surface.events_rx.try_recv() {
            assert!(surface.apply(event).is_none());
        }
        assert_eq!(surface.conversation().turns(), &[ConversationTurn::user("other")]);
    }

    #[tokio::test(start_paused = true)]
    async fn reselecting_the_streaming_session_keeps_it() {
        let (tx, live) = live_body();
        let mut surface = surface(ScriptedTransport::with(vec![live]));
        surface.switch_session(Some("s-1".into()), Vec::new());
        surface.submit("q", Vec::new()).await.expect("submit");

        surface.switch_session(Some("s-1".into()), Vec::new());
        assert!(surface.is_streaming());

        send(&tx, r#"{"type":"content","content":"ok"}"#);
        send(&tx, "[DONE]");
        assert_eq!(surface.pump().await.expect("outcome").text, "ok");
        assert_eq!(surface.conversation().turns().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn new_submit_cancels_previous_stream() {
        let (first_tx, first) = live_body();
        let transport = ScriptedTransport::with(vec![
            first,
            body(&["data: {\"type\":\"content\",\"content\":\"second\"}\n\ndata: [DONE]\n\n"]),
        ]);
        let mut surface = surface(transport);

        let first_id = surface.submit("one", Vec::new()).await.expect("first");
        let second_id = surface.submit("two", Vec::new()).await.expect("second");
        assert_ne!(first_id, second_id);
        assert_eq!(surface.active_stream_id(), Some(second_id));

        let outcome = surface.pump().await.expect("outcome");
        assert_eq!(outcome.stream_id, second_id);
        assert!(first_tx.is_closed());
        let roles: Vec<Role> = surface.conversation().turns().iter().map(|t| t.role).collect();
        assert_eq!(roles, vec![Role::User, Role::User, Role::Assistant]);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_keeps_partial_text() {
        let (tx, live) = live_body();
        let mut surface = surface(ScriptedTransport::with(vec![live]));
        surface.submit("q", Vec::new()).await.expect("submit");
        send(&tx, r#"{"type":"content","content":"ab"}"#);
        while surface.conversation().current_assistant() != Some("ab") {
            let event = surface.next_event().await.expect("event");
            surface.apply(event);
        }

        let outcome = surface.stop().expect("stopped");
        assert_eq!(outcome.status, RenderStatus::Cancelled);
        assert_eq!(outcome.text, "ab");
        assert!(surface.stop().is_none());
        assert_eq!(surface.conversation().last(), Some(&ConversationTurn::assistant("ab")));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_applies_queued_updates_first() {
        let (tx, live) = live_body();
        let mut surface = surface(ScriptedTransport::with(vec![live]));
        surface.submit("q", Vec::new()).await.expect("submit");
        send(&tx, r#"{"type":"content","content":"abcdef"}"#);
        // Let the task display everything without applying its events.
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(surface.conversation().current_assistant(), None);

        let outcome = surface.stop().expect("stopped");
        assert_eq!(outcome.status, RenderStatus::Cancelled);
        assert_eq!(outcome.text, "abcdef");
        assert_eq!(
            surface.conversation().last(),
            Some(&ConversationTurn::assistant("abcdef"))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn new_chat_while_first_reply_streams_cancels_it() {
        let (tx, live) = live_body();
        let mut surface = surface(ScriptedTransport::with(vec![live]));
        surface.submit("first question", Vec::new()).await.expect("submit");
        assert_eq!(surface.conversation().session_id(), None);

        surface.switch_session(None, Vec::new());
        assert!(!surface.is_streaming());
        assert!(surface.conversation().turns().is_empty());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(tx.is_closed(), "cancelled stream should release its body");
    }

    #[tokio::test(start_paused = true)]
    async fn empty_reply_and_stream_error_use_fallback_turns() {
        let transport = ScriptedTransport::with(vec![
            body(&["data: [DONE]\n\n"]),
            body(&[
                "data: {\"type\":\"content\",\"content\":\"Partial\"}\n\n",
                "data: {\"type\":\"error\",\"message\":\"upstream failed\"}\n\n",
            ]),
        ]);
        let mut surface = surface(transport);

        surface.submit("a", Vec::new()).await.expect("submit");
        surface.pump().await.expect("outcome");
        assert_eq!(
            surface.conversation().last(),
            Some(&ConversationTurn::assistant(NO_RESPONSE_FALLBACK))
        );

        surface.submit("b", Vec::new()).await.expect("submit");
        let outcome = surface.pump().await.expect("outcome");
        assert_eq!(outcome.error.as_deref(), Some("upstream failed"));
        assert_eq!(surface.last_error(), Some("upstream failed"));
        let tail: Vec<&str> = surface
            .conversation()
            .turns()
            .iter()
            .rev()
            .take(2)
            .map(|t| t.content.as_str())
            .collect();
        assert!(tail[0].contains("upstream failed"));
        assert_eq!(tail[1], "Partial");
    }

    #[tokio::test]
    async fn transport_failure_adds_unreachable_turn() {
        let transport = ScriptedTransport::with(vec![Err(TransportError::status(503, "down"))]);
        let mut surface = surface(transport);
        let err = surface.submit("hello", Vec::new()).await.expect_err("fails");
        assert!(matches!(err, ChatError::Transport(TransportError::Status { status: 503, .. })));
        assert!(!surface.is_streaming());
        assert_eq!(
            surface.conversation().last(),
            Some(&ConversationTurn::assistant(UNREACHABLE_FALLBACK))
        );
        assert!(surface.pump().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn attachments_are_uploaded_before_sending() {
        let transport = ScriptedTransport::with(vec![body(&["data: [DONE]\n\n"])]);
        let mut surface = surface(transport.clone()).upload_concurrency(2);
        surface
            .submit(
                "check these",
                vec![
                    Attachment::new("lease.pdf", "application/pdf", "a"),
                    Attachment::new("id.png", "image/png", "b"),
                ],
            )
            .await
            .expect("submit");
        surface.pump().await.expect("outcome");

        assert_eq!(
            *transport.uploads.lock().expect("lock"),
            vec!["lease.pdf".to_string(), "id.png".to_string()]
        );
        let requests = transport.requests.lock().expect("lock");
        assert_eq!(requests[0].messages[0].content_type, "object_string");
        assert!(requests[0].messages[0].content.contains("r2://id.png"));
    }

    #[tokio::test]
    async fn empty_submit_is_rejected() {
        let mut surface = surface(ScriptedTransport::with(Vec::new()));
        assert!(matches!(
            surface.submit("   ", Vec::new()).await,
            Err(ChatError::Validation(_))
        ));
        assert!(surface.conversation().turns().is_empty());
    }
}
