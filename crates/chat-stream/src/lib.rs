//! Streaming chat-response consumer for SSE chat backends.
//!
//! A response body arrives as arbitrary byte chunks. The consumer decodes
//! them into frames, buffers received text, and reveals it at a paced rate so
//! the displayed reply grows smoothly regardless of how the network delivers
//! it. Each stream runs in its own task and can be cancelled at any time.
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use chat_stream::prelude::*;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), ChatError> {
//! let transport = Arc::new(HttpChatTransport::from_env()?);
//! let mut surface = ChatSurface::new(transport, StreamingResponseConsumer::default());
//!
//! surface.submit("What does clause 4 of my lease mean?", Vec::new()).await?;
//! while let Some(event) = surface.next_event().await {
//!     if let RenderEvent::Update { text, .. } = &event {
//!         println!("{text}");
//!     }
//!     if surface.apply(event).is_some() {
//!         break;
//!     }
//! }
//! # Ok(())
//! # }
//! ```

/// Transport configuration and environment loading.
pub mod config;
/// Render task, cancellation handle, and render outcomes.
pub mod consumer;
/// Conversation turns and request message encoding.
pub mod conversation;
/// Public error types.
pub mod errors;
/// SSE decoding and stream frame classification.
pub mod frame;
/// Process-wide logging setup.
pub mod observability;
/// Common imports for typical usage.
pub mod prelude;
/// Pending/displayed buffer and pacing policy.
pub mod render;
/// Render observers and channel events.
pub mod stream;
/// Chat view state driving one stream at a time.
pub mod surface;
/// Chat transport contract and the HTTP implementation.
pub mod transport;

pub use config::TransportConfig;
pub use consumer::{CancelHandle, RenderOutcome, RenderStatus, RenderTask, StreamingResponseConsumer};
pub use conversation::{AttachmentRef, Conversation, ConversationTurn, Role, WireMessage};
pub use errors::{ChatError, TransportError};
pub use frame::{SseDecoder, SseFrame, StreamFrame};
pub use observability::init_observability;
pub use render::{PacingPolicy, PacingStep, RenderBuffer};
pub use stream::{ChannelObserver, FnObserver, RenderEvent, StreamObserver};
pub use surface::ChatSurface;
pub use transport::{Attachment, ChatRequest, ChatTransport, EventStream, HttpChatTransport, upload_all};
