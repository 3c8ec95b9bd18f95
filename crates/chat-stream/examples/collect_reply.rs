use chat_stream::conversation::ConversationTurn;
use chat_stream::prelude::*;
use chat_stream::{ChatRequest, FnObserver, init_observability};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), ChatError> {
    init_observability();

    let transport = HttpChatTransport::from_env()?;
    let mut conversation = Conversation::new();
    conversation.push_user("Summarise my tenant rights in two sentences.", Vec::new());
    let request = ChatRequest {
        messages: conversation
            .to_request_messages()
            .map_err(|e| ChatError::Protocol(e.to_string()))?,
        session_id: None,
    };

    let body = transport.open_stream(&request).await?;
    let observer = FnObserver::new()
        .with_session_assigned(|id| eprintln!("session assigned: {id}"))
        .with_error(|message| eprintln!("stream error: {message}"));
    let outcome = StreamingResponseConsumer::default()
        .start(body, observer, None)
        .wait()
        .await?;

    conversation.finish_assistant(&outcome);
    if let Some(ConversationTurn { content, .. }) = conversation.last() {
        println!("{content}");
    }
    Ok(())
}
