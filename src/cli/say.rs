//! One-shot "say" command

use std::error::Error;
use std::path::PathBuf;

use crate::cli::chat::stream_reply;
use crate::cli::speak::speak_to_file;
use crate::cli::Backend;
use crate::core::session::SessionStatus;

pub async fn run_say(
    backend: &Backend,
    prompt: Vec<String>,
    speak: Option<PathBuf>,
) -> Result<(), Box<dyn Error>> {
    let prompt = prompt.join(" ");
    if prompt.trim().is_empty() {
        eprintln!("Usage: palaver say <prompt>");
        std::process::exit(1);
    }

    let engine = backend.engine();
    let spawned = engine.submit(prompt)?;
    let outcome = match stream_reply(&engine, spawned).await {
        Ok(outcome) => outcome,
        Err(err) => {
            eprintln!("❌ Error: {err}");
            std::process::exit(1);
        }
    };
    if outcome.status == SessionStatus::Cancelled {
        eprintln!("[stopped]");
        return Ok(());
    }

    if let Some(path) = speak {
        let reply = engine
            .store()
            .find_by_id(outcome.assistant_id)
            .map(|turn| turn.content)
            .unwrap_or_default();
        speak_to_file(backend, &reply, &path).await?;
    }
    Ok(())
}
