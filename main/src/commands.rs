//! Chat command grammar. Prefix-matched and case-insensitive; multi-part
//! arguments are separated with `|`. Anything that is not a recognized
//! command is treated as a retrieval query.

use std::str::FromStr;

use common::modes::ResponseMode;

use crate::session::{ChatMode, ChatSession};

#[derive(Debug, Clone, PartialEq)]
pub enum ChatCommand {
    Help,
    Status,
    Clear,
    SetMode(ResponseMode),
    SetChatMode(ChatMode),
    Query(String),
    IngestFile(String),
    IngestText(String),
    IngestTable {
        table: String,
        db_path: Option<String>,
    },
    Heal {
        doc_id: String,
        quality: f64,
    },
    Optimize(String),
    CheckHealth(String),
}

impl ChatCommand {
    pub fn parse(text: &str) -> Result<Self, String> {
        let text = text.trim();
        let lowered = text.to_lowercase();

        match lowered.as_str() {
            "help" | "/help" | "?" => return Ok(Self::Help),
            "status" | "/status" => return Ok(Self::Status),
            "clear" | "/clear" => return Ok(Self::Clear),
            _ => {}
        }

        if let Some(args) = strip_prefix(text, &lowered, &["set_mode:", "mode:"]) {
            let mode = ResponseMode::from_str(&args)?;
            return Ok(Self::SetMode(mode));
        }

        if let Some(args) = strip_prefix(text, &lowered, &["set_chat_mode:", "chat_mode:"]) {
            let mode = ChatMode::from_str(&args)?;
            return Ok(Self::SetChatMode(mode));
        }

        if let Some(args) = strip_prefix(text, &lowered, &["ingest_file:"]) {
            let path = required(&args, "File path")?;
            return Ok(Self::IngestFile(path));
        }

        if let Some(args) = strip_prefix(text, &lowered, &["ingest_text:"]) {
            let content = required(&args, "Text content")?;
            return Ok(Self::IngestText(content));
        }

        if let Some(args) = strip_prefix(text, &lowered, &["ingest_table:"]) {
            let mut parts = split_args(&args);
            let table = required(parts.first().map(String::as_str).unwrap_or(""), "Table name")?;
            let db_path = parts.get_mut(1).map(std::mem::take).filter(|p| !p.is_empty());
            return Ok(Self::IngestTable { table, db_path });
        }

        if let Some(args) = strip_prefix(text, &lowered, &["heal:"]) {
            let parts = split_args(&args);
            if parts.len() < 2 {
                return Err("heal requires doc_id and quality score".to_string());
            }
            let quality: f64 = parts[1]
                .parse()
                .map_err(|_| format!("Invalid quality score: {}", parts[1]))?;
            return Ok(Self::Heal {
                doc_id: parts[0].clone(),
                quality,
            });
        }

        if let Some(args) = strip_prefix(text, &lowered, &["optimize:"]) {
            let doc_id = required(&args, "doc_id")?;
            return Ok(Self::Optimize(doc_id));
        }

        if let Some(args) = strip_prefix(text, &lowered, &["check_health:"]) {
            let doc_id = required(&args, "doc_id")?;
            return Ok(Self::CheckHealth(doc_id));
        }

        if let Some(args) = strip_prefix(text, &lowered, &["rag_query:", "rag:", "query:"]) {
            let question = required(&args, "Question")?;
            return Ok(Self::Query(question));
        }

        // Bare text is a retrieval query.
        if text.is_empty() {
            return Err("Please enter a command or question".to_string());
        }
        Ok(Self::Query(text.to_string()))
    }

    pub const fn requires_admin(&self) -> bool {
        matches!(
            self,
            Self::IngestFile(_)
                | Self::IngestText(_)
                | Self::IngestTable { .. }
                | Self::Heal { .. }
                | Self::Optimize(_)
                | Self::CheckHealth(_)
        )
    }

    pub const fn label(&self) -> &'static str {
        match self {
            Self::Help => "help",
            Self::Status => "status",
            Self::Clear => "clear",
            Self::SetMode(_) => "set_mode",
            Self::SetChatMode(_) => "set_chat_mode",
            Self::Query(_) => "query",
            Self::IngestFile(_) => "ingest_file",
            Self::IngestText(_) => "ingest_text",
            Self::IngestTable { .. } => "ingest_table",
            Self::Heal { .. } => "heal",
            Self::Optimize(_) => "optimize",
            Self::CheckHealth(_) => "check_health",
        }
    }
}

fn strip_prefix(text: &str, lowered: &str, prefixes: &[&str]) -> Option<String> {
    for prefix in prefixes {
        if lowered.starts_with(prefix) {
            return Some(text.get(prefix.len()..).unwrap_or_default().trim().to_string());
        }
    }
    None
}

fn split_args(args: &str) -> Vec<String> {
    args.split('|').map(|part| part.trim().to_string()).collect()
}

fn required(value: &str, what: &str) -> Result<String, String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(format!("{what} required"));
    }
    Ok(trimmed.to_string())
}

pub fn help_text(session: &ChatSession) -> String {
    let mut help = String::from(
        "RAG Chat Commands\n\
         =================\n\n\
         QUERY COMMANDS:\n\
           query: <question>          - Question answering\n\
           rag_query: <question>      - Same, explicit prefix\n\
           <question>                 - Bare text is treated as a query\n\n\
         MODE COMMANDS:\n\
           set_mode: concise|verbose|internal    - Change response mode\n\
           set_chat_mode: admin|user             - Switch chat mode\n\n\
         SYSTEM COMMANDS:\n\
           status                     - Show session status\n\
           clear                      - Clear session history\n\
           help                       - Show this help\n",
    );

    if session.is_admin() {
        help.push_str(
            "\nADMIN COMMANDS:\n\
               ingest_file: <path>        - Ingest a document file\n\
               ingest_text: <content>     - Ingest raw text\n\
               ingest_table: <table>|<db> - Ingest a database table\n\
               heal: <doc_id>|<quality>   - Healing recommendation (quality 0-1)\n\
               optimize: <doc_id>         - Optimize a document\n\
               check_health: <doc_id>     - Embedding health probe\n",
        );
    } else {
        help.push_str("\nAdmin commands not available in user mode\n");
    }

    help
}

pub fn status_text(session: &ChatSession) -> String {
    format!(
        "Session Status\n\
         ==============\n\
         Session ID:      {}\n\
         User:            {} ({}/{})\n\
         Mode:            {}\n\
         Response Mode:   {}\n\
         Messages:        {}\n\
         Commands:        {}\n\
         Last Doc:        {}\n\
         Ingested Files:  {}\n\
         Healed Docs:     {}\n\
         Created:         {}\n\
         Last Activity:   {}\n",
        session.session_id,
        session.user_id,
        session.department,
        session.role,
        session.mode.as_str(),
        session.response_mode,
        session.messages.len(),
        session.commands.len(),
        session.context.last_doc_id.as_deref().unwrap_or("None"),
        session.context.ingested_files.len(),
        session.context.healed_docs.len(),
        session.created_at.format("%Y-%m-%d %H:%M:%S"),
        session.last_activity.format("%Y-%m-%d %H:%M:%S"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_commands_parse_case_insensitively() {
        assert_eq!(ChatCommand::parse("HELP").unwrap(), ChatCommand::Help);
        assert_eq!(ChatCommand::parse("/status").unwrap(), ChatCommand::Status);
        assert_eq!(ChatCommand::parse(" clear ").unwrap(), ChatCommand::Clear);
    }

    #[test]
    fn mode_commands_validate_their_argument() {
        assert_eq!(
            ChatCommand::parse("set_mode: VERBOSE").unwrap(),
            ChatCommand::SetMode(ResponseMode::Verbose)
        );
        assert_eq!(
            ChatCommand::parse("chat_mode: admin").unwrap(),
            ChatCommand::SetChatMode(ChatMode::Admin)
        );
        assert!(ChatCommand::parse("set_mode: shouty").is_err());
        assert!(ChatCommand::parse("set_chat_mode: root").is_err());
    }

    #[test]
    fn queries_parse_with_and_without_prefix() {
        assert_eq!(
            ChatCommand::parse("query: what is the budget?").unwrap(),
            ChatCommand::Query("what is the budget?".to_string())
        );
        assert_eq!(
            ChatCommand::parse("rag: what is the budget?").unwrap(),
            ChatCommand::Query("what is the budget?".to_string())
        );
        assert_eq!(
            ChatCommand::parse("what is the budget?").unwrap(),
            ChatCommand::Query("what is the budget?".to_string())
        );
    }

    #[test]
    fn multi_part_commands_split_on_pipe() {
        assert_eq!(
            ChatCommand::parse("ingest_table: incidents|/tmp/source.db").unwrap(),
            ChatCommand::IngestTable {
                table: "incidents".to_string(),
                db_path: Some("/tmp/source.db".to_string()),
            }
        );
        assert_eq!(
            ChatCommand::parse("heal: doc_42|0.55").unwrap(),
            ChatCommand::Heal {
                doc_id: "doc_42".to_string(),
                quality: 0.55,
            }
        );
    }

    #[test]
    fn missing_arguments_are_input_errors() {
        assert!(ChatCommand::parse("ingest_file:").is_err());
        assert!(ChatCommand::parse("heal: doc_only").is_err());
        assert!(ChatCommand::parse("heal: doc|not-a-number").is_err());
        assert!(ChatCommand::parse("").is_err());
    }

    #[test]
    fn admin_requirements_cover_mutating_commands() {
        assert!(ChatCommand::parse("ingest_text: hello")
            .unwrap()
            .requires_admin());
        assert!(ChatCommand::parse("optimize: doc_1")
            .unwrap()
            .requires_admin());
        assert!(!ChatCommand::parse("query: hello").unwrap().requires_admin());
        assert!(!ChatCommand::parse("set_chat_mode: user")
            .unwrap()
            .requires_admin());
    }
}
