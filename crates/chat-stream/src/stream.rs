use tokio::sync::mpsc;

/// Callbacks a render task reports through.
///
/// Every method runs on the render task; implementations should hand the value
/// off (for example into a channel) rather than block.
pub trait StreamObserver: Send + 'static {
    /// Displayed text grew. `text` always extends the previous value.
    fn on_update(&mut self, _text: &str) {}
    /// The backend bound the stream to a new session id.
    fn on_session_assigned(&mut self, _session_id: &str) {}
    /// The stream failed. Called at most once.
    fn on_error(&mut self, _message: &str) {}
    /// Network ended and the pending buffer drained. Called exactly once
    /// unless the task is cancelled. An empty `text` means no content arrived.
    fn on_complete(&mut self, _text: &str) {}
}

/// Observer events tagged with the render task that produced them.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RenderEvent {
    /// Displayed text grew.
    Update { stream_id: uuid::Uuid, text: String },
    /// The backend assigned a session id.
    SessionAssigned {
        stream_id: uuid::Uuid,
        session_id: String,
    },
    /// The stream reported or hit an error.
    Error {
        stream_id: uuid::Uuid,
        message: String,
    },
    /// Terminal event with the final displayed text.
    Completed { stream_id: uuid::Uuid, text: String },
}

impl RenderEvent {
    /// Returns the id of the render task that produced this event.
    pub fn stream_id(&self) -> uuid::Uuid {
        match self {
            Self::Update { stream_id, .. }
            | Self::SessionAssigned { stream_id, .. }
            | Self::Error { stream_id, .. }
            | Self::Completed { stream_id, .. } => *stream_id,
        }
    }
}

/// Forwards observer callbacks into an unbounded channel.
///
/// Send failures are ignored: a dropped receiver means nobody is rendering.
pub struct ChannelObserver {
    stream_id: uuid::Uuid,
    tx: mpsc::UnboundedSender<RenderEvent>,
}

impl ChannelObserver {
    pub fn new(stream_id: uuid::Uuid, tx: mpsc::UnboundedSender<RenderEvent>) -> Self {
        Self { stream_id, tx }
    }

    /// Creates an observer with a fresh stream id and its receiving end.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<RenderEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(uuid::Uuid::new_v4(), tx), rx)
    }

    pub fn stream_id(&self) -> uuid::Uuid {
        self.stream_id
    }
}

impl StreamObserver for ChannelObserver {
    fn on_update(&mut self, text: &str) {
        let _ = self.tx.send(RenderEvent::Update {
            stream_id: self.stream_id,
            text: text.to_string(),
        });
    }

    fn on_session_assigned(&mut self, session_id: &str) {
        let _ = self.tx.send(RenderEvent::SessionAssigned {
            stream_id: self.stream_id,
            session_id: session_id.to_string(),
        });
    }

    fn on_error(&mut self, message: &str) {
        let _ = self.tx.send(RenderEvent::Error {
            stream_id: self.stream_id,
            message: message.to_string(),
        });
    }

    fn on_complete(&mut self, text: &str) {
        let _ = self.tx.send(RenderEvent::Completed {
            stream_id: self.stream_id,
            text: text.to_string(),
        });
    }
}

type TextFn = Box<dyn FnMut(&str) + Send + 'static>;

/// Observer built from plain closures. Unset callbacks do nothing.
#[derive(Default)]
pub struct FnObserver {
    update: Option<TextFn>,
    session: Option<TextFn>,
    error: Option<TextFn>,
    complete: Option<TextFn>,
}

impl FnObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_update(mut self, f: impl FnMut(&str) + Send + 'static) -> Self {
        self.update = Some(Box::new(f));
        self
    }

    pub fn with_session_assigned(mut self, f: impl FnMut(&str) + Send + 'static) -> Self {
        self.session = Some(Box::new(f));
        self
    }

    pub fn with_error(mut self, f: impl FnMut(&str) + Send + 'static) -> Self {
        self.error = Some(Box::new(f));
        self
    }

    pub fn with_complete(mut self, f: impl FnMut(&str) + Send + 'static) -> Self {
        self.complete = Some(Box::new(f));
        self
    }
}

impl StreamObserver for FnObserver {
    fn on_update(&mut self, text: &str) {
        if let Some(f) = self.update.as_mut() {
            f(text);
        }
    }

    fn on_session_assigned(&mut self, session_id: &str) {
        if let Some(f) = self.session.as_mut() {
            f(session_id);
        }
    }

    fn on_error(&mut self, message: &str) {
        if let Some(f) = self.error.as_mut() {
            f(message);
        }
    }

    fn on_complete(&mut self, text: &str) {
        if let Some(f) = self.complete.as_mut() {
            f(text);
        }
    }
}
