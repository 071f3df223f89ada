//! Interactive chat loop over stdin/stdout. The local operator gets an
//! admin session; privilege rules still apply to any mode switching the
//! operator does afterwards.

use common::{error::AppError, modes::ResponseMode};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::debug;

use crate::agent::RagAgent;
use crate::session::ChatMode;

/// Runs the REPL until EOF, `quit`, or interrupt. Returns the process exit
/// code (0 on normal exit, 130 on interrupt).
pub async fn run_chat(agent: &RagAgent, response_mode: ResponseMode) -> Result<i32, AppError> {
    let session = agent
        .sessions
        .create_session("operator", "local", "operator", ChatMode::Admin)?;
    agent
        .sessions
        .with_session(&session.session_id, |s| s.response_mode = response_mode)?;

    println!("ragmend chat (mode: {response_mode})");
    println!("Type 'help' for commands, 'quit' to exit.\n");

    let stdin = BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => {
                println!();
                return Ok(130);
            }
        };

        let Some(line) = line else {
            // EOF
            break;
        };
        let input = line.trim();
        if input.is_empty() {
            continue;
        }
        if matches!(input.to_lowercase().as_str(), "quit" | "exit" | "q") {
            break;
        }

        let reply = agent.handle_chat_message(&session.session_id, input).await;
        if reply.is_success() {
            println!("{}\n", reply.content);
        } else {
            println!(
                "[error] {}\n",
                reply.error.unwrap_or_else(|| "unknown error".to_string())
            );
        }
    }

    debug!(session_id = %session.session_id, "chat session closed");
    agent.sessions.remove(&session.session_id)?;

    Ok(0)
}
