use std::io::Write as _;
use std::sync::Arc;

use chat_stream::init_observability;
use chat_stream::prelude::*;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), ChatError> {
    init_observability();

    let question = std::env::args()
        .skip(1)
        .collect::<Vec<_>>()
        .join(" ");
    let question = if question.trim().is_empty() {
        "What should I check before signing a rental agreement?".to_string()
    } else {
        question
    };

    let transport = Arc::new(HttpChatTransport::from_env()?);
    let mut surface = ChatSurface::new(transport, StreamingResponseConsumer::default());
    surface.submit(&question, Vec::new()).await?;

    let mut printed = 0;
    while let Some(event) = surface.next_event().await {
        if let RenderEvent::Update { text, .. } = &event
            && let Some(delta) = text.get(printed..)
        {
            print!("{delta}");
            let _ = std::io::stdout().flush();
            printed = text.len();
        }
        if let RenderEvent::Error { message, .. } = &event {
            eprintln!("\nstream error: {message}");
        }
        if let Some(outcome) = surface.apply(event) {
            println!();
            if let Some(session_id) = outcome.session_id {
                println!("session: {session_id}");
            }
            break;
        }
    }
    Ok(())
}
