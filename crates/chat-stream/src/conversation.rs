use crate::consumer::{RenderOutcome, RenderStatus};

/// Shown when a stream completes without any content and without an error.
pub const NO_RESPONSE_FALLBACK: &str =
    "Sorry, I couldn't generate a reply for that. Please try rephrasing your question.";

/// Shown when the request never reached a streaming response.
pub const UNREACHABLE_FALLBACK: &str =
    "Sorry, we can't reach the server right now. Please try again later.";

/// Who authored a turn.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// A file already uploaded to the backend and referenced by id.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct AttachmentRef {
    pub file_id: String,
    pub file_name: String,
}

/// One message of a conversation.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ConversationTurn {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<AttachmentRef>,
}

impl ConversationTurn {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            attachments: Vec::new(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

/// A turn in the shape the chat endpoint expects.
///
/// User turns with attachments are sent as `object_string`: `content` holds a
/// JSON array of text and file parts.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct WireMessage {
    pub role: Role,
    pub content: String,
    pub content_type: String,
}

#[derive(serde::Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum WirePart<'a> {
    Text { text: &'a str },
    File { file_id: &'a str },
}

/// In-memory turn list for one chat session.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Conversation {
    session_id: Option<String>,
    turns: Vec<ConversationTurn>,
    /// Index of the assistant turn of the request in flight, once created.
    assistant_index: Option<usize>,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a conversation for a persisted session.
    pub fn with_session(session_id: impl Into<String>, turns: Vec<ConversationTurn>) -> Self {
        Self {
            session_id: Some(session_id.into()),
            turns,
            assistant_index: None,
        }
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn turns(&self) -> &[ConversationTurn] {
        &self.turns
    }

    pub fn last(&self) -> Option<&ConversationTurn> {
        self.turns.last()
    }

    /// Binds the conversation to a session id assigned by the backend.
    pub fn bind_session(&mut self, session_id: impl Into<String>) {
        self.session_id = Some(session_id.into());
    }

    /// Replaces the whole turn list, for example when switching sessions.
    pub fn load(&mut self, session_id: Option<String>, turns: Vec<ConversationTurn>) {
        self.session_id = session_id;
        self.turns = turns;
        self.assistant_index = None;
    }

    /// Appends the user's turn and opens a new request.
    pub fn push_user(&mut self, content: impl Into<String>, attachments: Vec<AttachmentRef>) {
        self.turns.push(ConversationTurn {
            role: Role::User,
            content: content.into(),
            attachments,
        });
        self.assistant_index = None;
    }

    /// Sets the text of the current request's assistant turn.
    ///
    /// The turn is created on the first non-empty text and replaced in place
    /// afterwards.
    pub fn upsert_assistant(&mut self, text: &str) {
        match self.assistant_index {
            Some(idx) => {
                if let Some(turn) = self.turns.get_mut(idx) {
                    turn.content.clear();
                    turn.content.push_str(text);
                }
            }
            None if !text.is_empty() => {
                self.turns.push(ConversationTurn::assistant(text));
                self.assistant_index = Some(self.turns.len() - 1);
            }
            None => {}
        }
    }

    /// Text of the current request's assistant turn, if one was created.
    pub fn current_assistant(&self) -> Option<&str> {
        self.assistant_index
            .and_then(|idx| self.turns.get(idx))
            .map(|turn| turn.content.as_str())
    }

    /// Resolves the current request from the render outcome.
    ///
    /// Partial text is never rolled back. An error adds an explanatory
    /// assistant turn after it; a completed stream without any text gets the
    /// fallback reply; a cancelled stream is left as it is.
    pub fn finish_assistant(&mut self, outcome: &RenderOutcome) {
        if outcome.status == RenderStatus::Completed {
            self.upsert_assistant(&outcome.text);
            if let Some(message) = &outcome.error {
                self.turns.push(ConversationTurn::assistant(format!(
                    "Sorry, the assistant ran into a problem: {message}"
                )));
            } else if outcome.text.is_empty() {
                self.turns
                    .push(ConversationTurn::assistant(NO_RESPONSE_FALLBACK));
            }
        }
        if self.session_id.is_none()
            && let Some(session_id) = &outcome.session_id
        {
            self.session_id = Some(session_id.clone());
        }
        self.assistant_index = None;
    }

    /// Records that the request failed before streaming began.
    pub fn fail_request(&mut self) {
        self.turns
            .push(ConversationTurn::assistant(UNREACHABLE_FALLBACK));
        self.assistant_index = None;
    }

    /// Renders the turns for the chat endpoint, in order.
    pub fn to_request_messages(&self) -> Result<Vec<WireMessage>, serde_json::Error> {
        self.turns.iter().map(wire_message).collect()
    }
}

fn wire_message(turn: &ConversationTurn) -> Result<WireMessage, serde_json::Error> {
    if turn.role != Role::User || turn.attachments.is_empty() {
        return Ok(WireMessage {
            role: turn.role,
            content: turn.content.clone(),
            content_type: "text".into(),
        });
    }
    let mut parts = Vec::with_capacity(turn.attachments.len() + 1);
    if !turn.content.trim().is_empty() {
        parts.push(WirePart::Text {
            text: &turn.content,
        });
    }
    parts.extend(turn.attachments.iter().map(|a| WirePart::File {
        file_id: &a.file_id,
    }));
    Ok(WireMessage {
        role: turn.role,
        content: serde_json::to_string(&parts)?,
        content_type: "object_string".into(),
    })
}
