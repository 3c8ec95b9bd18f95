//! Common imports for typical chat-stream usage.
pub use crate::{
    Attachment, CancelHandle, ChatError, ChatSurface, ChatTransport, Conversation,
    ConversationTurn, HttpChatTransport, PacingPolicy, RenderEvent, RenderOutcome, RenderStatus,
    RenderTask, StreamObserver, StreamingResponseConsumer, TransportConfig, TransportError,
};
