//! Line-based interactive chat

use std::error::Error;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::debug;

use crate::cli::Backend;
use crate::core::conversation::Exchange;
use crate::core::engine::{ChatEngine, SpawnedSession};
use crate::core::error::ChatError;
use crate::core::message::{Role, Turn};
use crate::core::session::{SessionOutcome, SessionStatus};
use crate::utils::logging::TranscriptLog;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReplCommand<'a> {
    Prompt(&'a str),
    Retry,
    System(&'a str),
    File(&'a str),
    Save(&'a str),
    Previous,
    Next,
    Quit,
    Empty,
    Unknown(&'a str),
}

fn parse_line(line: &str) -> ReplCommand<'_> {
    let line = line.trim();
    if line.is_empty() {
        return ReplCommand::Empty;
    }
    let Some(command) = line.strip_prefix('/') else {
        return ReplCommand::Prompt(line);
    };
    let (name, rest) = command
        .split_once(char::is_whitespace)
        .map_or((command, ""), |(name, rest)| (name, rest.trim()));
    match name {
        "retry" => ReplCommand::Retry,
        "system" if !rest.is_empty() => ReplCommand::System(rest),
        "file" if !rest.is_empty() => ReplCommand::File(rest),
        "save" if !rest.is_empty() => ReplCommand::Save(rest),
        "prev" => ReplCommand::Previous,
        "next" => ReplCommand::Next,
        "quit" | "exit" => ReplCommand::Quit,
        _ => ReplCommand::Unknown(line),
    }
}

pub async fn run_chat(backend: &Backend, log: Option<PathBuf>) -> Result<(), Box<dyn Error>> {
    let engine = backend.engine();
    let transcript = log.map(TranscriptLog::open).transpose()?;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut cursor: Option<Exchange> = None;

    loop {
        print!("> ");
        io::stdout().flush()?;

        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => {
                println!();
                break;
            }
        };
        let Some(line) = line else {
            println!();
            break;
        };

        let command = parse_line(&line);
        let retried = command == ReplCommand::Retry;
        let spawned = match command {
            ReplCommand::Empty => continue,
            ReplCommand::Quit => break,
            ReplCommand::Unknown(text) => {
                eprintln!("Unknown command: {text}");
                continue;
            }
            ReplCommand::System(text) => {
                let turn = engine.add_system(text);
                if let Some(log) = &transcript {
                    log.append(&[turn])?;
                }
                continue;
            }
            ReplCommand::File(path) => {
                match inject_file(&engine, Path::new(path)).await {
                    Ok(turn) => {
                        eprintln!("Added {} bytes from {path}", turn.content.len());
                        if let Some(log) = &transcript {
                            log.append(&[turn])?;
                        }
                    }
                    Err(err) => eprintln!("❌ Error: {err}"),
                }
                continue;
            }
            ReplCommand::Save(path) => {
                match save_last_reply(&engine, Path::new(path)).await {
                    Ok(bytes) => eprintln!("Saved {bytes} bytes to {path}"),
                    Err(err) => eprintln!("❌ Error: {err}"),
                }
                continue;
            }
            ReplCommand::Previous | ReplCommand::Next => {
                let step = if command == ReplCommand::Previous {
                    engine.store().previous_exchange(cursor.as_ref())
                } else {
                    engine.store().next_exchange(cursor.as_ref())
                };
                match step {
                    Ok(exchange) => {
                        print_exchange(&exchange);
                        cursor = Some(exchange);
                    }
                    Err(err) => eprintln!("{err}"),
                }
                continue;
            }
            ReplCommand::Retry => match engine.store().last_message(Role::User) {
                Some(user) => engine.retry(user.id),
                None => {
                    eprintln!("Nothing to retry yet");
                    continue;
                }
            },
            ReplCommand::Prompt(text) => engine.submit(text),
        };
        cursor = None;

        let outcome = match spawned {
            Ok(spawned) => stream_reply(&engine, spawned).await,
            Err(err) => Err(err),
        };
        match outcome {
            Ok(outcome) => {
                if outcome.status == SessionStatus::Cancelled {
                    eprintln!("[stopped]");
                }
                if let Some(log) = &transcript {
                    if retried {
                        log.rewrite(&engine.store().snapshot())?;
                    } else {
                        log.append(&exchange_turns(&engine, &outcome))?;
                    }
                }
            }
            Err(err) => eprintln!("❌ Error: {err}"),
        }
    }

    engine.shutdown();
    Ok(())
}

async fn inject_file(engine: &ChatEngine, path: &Path) -> Result<Turn, Box<dyn Error>> {
    let contents = tokio::fs::read_to_string(path)
        .await
        .map_err(|err| format!("Failed to read {}: {err}", path.display()))?;
    Ok(engine.add_file(contents))
}

/// Write the most recent reply to `path`, returning the bytes written.
async fn save_last_reply(engine: &ChatEngine, path: &Path) -> Result<usize, Box<dyn Error>> {
    let reply = engine
        .store()
        .last_message(Role::Assistant)
        .ok_or("no assistant message found")?;
    tokio::fs::write(path, reply.content.as_bytes()).await?;
    Ok(reply.content.len())
}

fn exchange_turns(engine: &ChatEngine, outcome: &SessionOutcome) -> Vec<Turn> {
    [outcome.user_id, outcome.assistant_id]
        .into_iter()
        .filter_map(|id| engine.store().find_by_id(id))
        .collect()
}

fn print_exchange(exchange: &Exchange) {
    match exchange {
        Exchange::Pair { user, assistant } => {
            println!("You: {}\n{}", user.content, assistant.content);
        }
        Exchange::Lone(turn) => println!("{}: {}", turn.role, turn.content),
    }
}

/// Print the reply as it streams. Ctrl+C stops the generation but still
/// waits for the session to wind down, so the returned outcome is final.
pub async fn stream_reply(
    engine: &ChatEngine,
    spawned: SpawnedSession,
) -> Result<SessionOutcome, ChatError> {
    let mut updates = engine.subscribe();
    let SpawnedSession {
        user_id,
        assistant_id,
        mut handle,
    } = spawned;
    let mut printed = 0;
    let mut watching = true;

    let result = loop {
        tokio::select! {
            update = updates.recv(), if watching => match update {
                Ok(turn) if turn.id == assistant_id => {
                    printed = print_new_text(&turn.content, printed);
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    debug!(skipped, "Display fell behind, catching up");
                }
                Err(RecvError::Closed) => watching = false,
            },
            _ = tokio::signal::ctrl_c() => {
                engine.cancel(user_id);
            }
            result = &mut handle => {
                break result.map_err(|err| {
                    ChatError::InvalidState(format!("session task failed: {err}"))
                })?;
            }
        }
    };

    if let Some(turn) = engine.store().find_by_id(assistant_id) {
        print_new_text(&turn.content, printed);
    }
    println!();
    result
}

/// Print whatever follows the first `printed` bytes of `content` and return
/// the new printed length. Snapshots that do not extend what is on screen
/// are ignored.
fn print_new_text(content: &str, printed: usize) -> usize {
    match content.get(printed..) {
        Some(rest) if !rest.is_empty() => {
            print!("{rest}");
            let _ = io::stdout().flush();
            content.len()
        }
        _ => printed,
    }
}
