//! Top-level agent: owns the services and compiled workflows, dispatches
//! programmatic operations, and backs the chat command layer.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use common::{
    config::AppConfig,
    error::AppError,
    llm::{LlmService, OpenAiLlm},
    modes::ResponseMode,
    storage::{history::HistoryLog, tracking::TrackingStore, vector::VectorStore},
};
use guardrails::GuardrailEngine;
use healing_agent::{ActionKind, HealingAgent, Recommendation};
use ingestion_pipeline::{
    ingest_table, normalize::discover_documents, IngestionConfig, IngestionPipeline,
    IngestionRequest, IngestionServices, TableIngestionSpec,
};
use retrieval_pipeline::{
    optimize::PerformanceEntry, AskRequest, OptimizationPipeline, RetrievalConfig,
    RetrievalPipeline, RetrievalServices,
};
use serde_json::json;
use tracing::{info, warn};

use crate::commands::{help_text, status_text, ChatCommand};
use crate::session::{ChatMode, ChatSession, DocSource, IngestedFile, SessionManager};

/// Programmatic operations, mirroring the chat surface.
#[derive(Debug, Clone)]
pub enum Operation {
    IngestDocument {
        text: String,
        doc_id: Option<String>,
        rbac_namespace: Option<String>,
    },
    IngestSqliteTable {
        table_name: String,
        db_path: String,
        rbac_namespace: Option<String>,
    },
    IngestFromPath {
        path: PathBuf,
        recursive: bool,
    },
    AskQuestion {
        question: String,
        doc_id: Option<String>,
        response_mode: ResponseMode,
    },
    Optimize {
        doc_id: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyStatus {
    Success,
    Error,
}

/// Unified chat reply: human-readable content plus the structured result.
#[derive(Debug, Clone)]
pub struct ChatReply {
    pub status: ReplyStatus,
    pub content: String,
    pub data: Option<serde_json::Value>,
    pub error: Option<String>,
}

impl ChatReply {
    fn ok(content: impl Into<String>) -> Self {
        Self {
            status: ReplyStatus::Success,
            content: content.into(),
            data: None,
            error: None,
        }
    }

    fn ok_with(content: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            status: ReplyStatus::Success,
            content: content.into(),
            data: Some(data),
            error: None,
        }
    }

    fn err(error: impl Into<String>) -> Self {
        let error = error.into();
        Self {
            status: ReplyStatus::Error,
            content: String::new(),
            data: None,
            error: Some(error),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ReplyStatus::Success
    }
}

pub struct RagAgent {
    llm: Arc<dyn LlmService>,
    vector: Arc<VectorStore>,
    tracking: Arc<TrackingStore>,
    history: HistoryLog,
    healing: Arc<HealingAgent>,
    ingestion_services: Arc<IngestionServices>,
    ingestion_config: IngestionConfig,
    ingestion: IngestionPipeline,
    retrieval: RetrievalPipeline,
    optimization: OptimizationPipeline,
    pub sessions: SessionManager,
}

impl RagAgent {
    /// Builds the full production wiring from configuration: OpenAI-backed
    /// LLM service, on-disk vector store, and the SQLite tracking file.
    pub async fn from_config(config: &AppConfig) -> Result<Self, AppError> {
        let llm: Arc<dyn LlmService> = Arc::new(OpenAiLlm::from_config(config));

        let vector = Arc::new(
            VectorStore::connect(
                &config.vector_store_address,
                &config.vector_store_namespace,
                &config.vector_store_database,
                &config.vector_store_collection,
                config.embedding_dimensions as usize,
            )
            .await?,
        );

        if let Some(parent) = Path::new(&config.tracking_db_path).parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tracking = Arc::new(TrackingStore::open(&config.tracking_db_path)?);

        Self::with_services(
            llm,
            vector,
            tracking,
            config.alternate_embedding_model.clone(),
            IngestionConfig {
                chunker: ingestion_pipeline::chunking::ChunkerConfig {
                    chunk_size: config.chunk_size,
                    overlap: config.chunk_overlap,
                },
                trace_dir: Some(PathBuf::from(&config.trace_dir)),
                graph_dir: Some(PathBuf::from(&config.graph_dir)),
            },
            RetrievalConfig {
                top_k: config.retrieval_top_k,
                trace_dir: Some(PathBuf::from(&config.trace_dir)),
                graph_dir: Some(PathBuf::from(&config.graph_dir)),
            },
        )
    }

    /// Wires the agent over already-constructed services. Tests hand in
    /// in-memory stores and a mock LLM here.
    pub fn with_services(
        llm: Arc<dyn LlmService>,
        vector: Arc<VectorStore>,
        tracking: Arc<TrackingStore>,
        alternate_embedding_model: String,
        ingestion_config: IngestionConfig,
        retrieval_config: RetrievalConfig,
    ) -> Result<Self, AppError> {
        let history = HistoryLog::new(Arc::clone(&tracking));
        let healing = Arc::new(HealingAgent::new(
            Arc::clone(&tracking),
            history.clone(),
            alternate_embedding_model,
        ));

        let ingestion_services = Arc::new(IngestionServices {
            llm: Arc::clone(&llm),
            vector: Arc::clone(&vector),
            tracking: Arc::clone(&tracking),
        });
        let ingestion =
            IngestionPipeline::new(Arc::clone(&ingestion_services), ingestion_config.clone())?;

        let retrieval_services = Arc::new(RetrievalServices {
            llm: Arc::clone(&llm),
            vector: Arc::clone(&vector),
            history: history.clone(),
            agent: Some(Arc::clone(&healing)),
            guardrails: Arc::new(GuardrailEngine::new()),
        });
        let retrieval = RetrievalPipeline::new(retrieval_services, retrieval_config)?;

        let optimization = OptimizationPipeline::new(history.clone())?;

        Ok(Self {
            llm,
            vector,
            tracking,
            history,
            healing,
            ingestion_services,
            ingestion_config,
            ingestion,
            retrieval,
            optimization,
            sessions: SessionManager::new(),
        })
    }

    pub fn history(&self) -> &HistoryLog {
        &self.history
    }

    /// Programmatic dispatch mirroring the chat surface.
    pub async fn invoke(&self, operation: Operation) -> Result<serde_json::Value, AppError> {
        match operation {
            Operation::IngestDocument {
                text,
                doc_id,
                rbac_namespace,
            } => {
                let doc_id = match doc_id {
                    Some(doc_id) => doc_id,
                    None => self.sessions.generate_doc_id(DocSource::Text, "user_input")?,
                };
                let mut request = IngestionRequest::text(doc_id, text);
                if let Some(namespace) = rbac_namespace {
                    request = request.with_namespace(namespace);
                }
                let report = self.ingestion.ingest(request).await?;
                Ok(serde_json::to_value(report)?)
            }
            Operation::IngestSqliteTable {
                table_name,
                db_path,
                rbac_namespace,
            } => {
                let report = self
                    .ingest_sqlite_table(&table_name, &db_path, rbac_namespace.as_deref(), None)
                    .await?;
                Ok(serde_json::to_value(report)?)
            }
            Operation::IngestFromPath { path, recursive } => {
                let report = self.ingest_from_path(&path, recursive).await?;
                Ok(report)
            }
            Operation::AskQuestion {
                question,
                doc_id,
                response_mode,
            } => {
                let mut request = AskRequest::new(question).with_mode(response_mode);
                if let Some(doc_id) = doc_id {
                    request = request.with_doc_id(doc_id);
                }
                let response = self.retrieval.ask(request).await?;
                Ok(response.to_json())
            }
            Operation::Optimize { doc_id } => {
                let report = self.optimize_document(&doc_id, None).await?;
                Ok(report)
            }
        }
    }

    /// Walks a path for ingestable files and runs each through the
    /// ingestion workflow.
    pub async fn ingest_from_path(
        &self,
        path: &Path,
        recursive: bool,
    ) -> Result<serde_json::Value, AppError> {
        let files = discover_documents(path, recursive)?;
        let mut ingested = Vec::new();
        let mut errors = Vec::new();

        for file in &files {
            let name = file
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "document".to_string());
            let doc_id = self.sessions.generate_doc_id(DocSource::File, &name)?;

            match self
                .ingestion
                .ingest(IngestionRequest::file(
                    doc_id.clone(),
                    file.to_string_lossy().into_owned(),
                ))
                .await
            {
                Ok(report) => {
                    errors.extend(report.errors.iter().cloned());
                    ingested.push(json!({
                        "doc_id": report.doc_id,
                        "path": file.to_string_lossy(),
                        "chunks_saved": report.chunks_saved,
                        "success": report.success,
                    }));
                }
                Err(err) => errors.push(format!("{}: {err}", file.display())),
            }
        }

        info!(
            documents = ingested.len(),
            errors = errors.len(),
            "path ingestion finished"
        );

        Ok(json!({
            "success": errors.is_empty(),
            "documents_discovered": files.len(),
            "documents_ingested": ingested,
            "errors": errors,
        }))
    }

    pub async fn ingest_sqlite_table(
        &self,
        table_name: &str,
        db_path: &str,
        rbac_namespace: Option<&str>,
        session_id: Option<&str>,
    ) -> Result<ingestion_pipeline::TableIngestionReport, AppError> {
        let text_columns = table_columns(db_path, table_name)?;
        let spec = TableIngestionSpec {
            table_name: table_name.to_string(),
            source_db_path: db_path.to_string(),
            text_columns,
            metadata_columns: Vec::new(),
            filter: None,
            rbac_namespace: rbac_namespace.unwrap_or("general").to_string(),
        };

        let base_doc_id = self.sessions.generate_doc_id(DocSource::Table, table_name)?;
        ingest_table(
            &self.ingestion_services,
            &self.ingestion_config,
            &spec,
            &base_doc_id,
            session_id,
        )
        .await
    }

    /// Runs the optimization workflow for one document, feeding it the
    /// document's QUERY history as performance entries.
    pub async fn optimize_document(
        &self,
        doc_id: &str,
        session_id: Option<String>,
    ) -> Result<serde_json::Value, AppError> {
        let document = self.tracking.document(doc_id)?;
        let chunk_size = document.as_ref().map_or(500, |d| d.chunk_size_char);

        let performance_history: Vec<PerformanceEntry> = self
            .history
            .get_by_doc_id(doc_id, 50)?
            .into_iter()
            .filter(|event| event.event_type == "QUERY")
            .map(|event| {
                let metrics = event.metrics();
                PerformanceEntry {
                    params: json!({ "chunk_size": chunk_size, "k": 5 }),
                    metrics: json!({
                        "cost": metrics.get("cost_tokens").and_then(serde_json::Value::as_f64).unwrap_or(0.0)
                    }),
                }
            })
            .collect();

        let report = self
            .optimization
            .run(performance_history, json!({}), session_id)
            .await?;
        Ok(serde_json::to_value(report)?)
    }

    /// Chunk and query statistics for a document, recorded as a synthetic
    /// test in the history log. Also reports whether the vector and
    /// relational chunk counts agree.
    pub async fn check_document_health(
        &self,
        doc_id: &str,
        session_id: Option<&str>,
    ) -> Result<serde_json::Value, AppError> {
        let chunk_stats = self.tracking.chunk_stats(doc_id)?;
        let query_stats = self.tracking.query_stats(doc_id)?;
        let vector_chunk_count = self.vector.count_for_doc(doc_id).await?;

        let report = json!({
            "doc_id": doc_id,
            "chunk_count": chunk_stats.chunk_count,
            "vector_chunk_count": vector_chunk_count,
            "stores_in_sync": vector_chunk_count == chunk_stats.chunk_count,
            "avg_reindex_count": chunk_stats.avg_reindex_count,
            "query_count": query_stats.query_count,
            "avg_accuracy": query_stats.avg_accuracy,
            "avg_cost_tokens": query_stats.avg_cost_tokens,
            "learning_stats": self.healing.learning_stats(),
        });

        let metrics = json!({
            "chunk_count": chunk_stats.chunk_count,
            "query_count": query_stats.query_count,
        });
        if let Err(err) = self.history.log_synthetic_test(
            "health_probe",
            doc_id,
            &metrics.to_string(),
            "{}",
            "rag_agent",
            session_id,
        ) {
            warn!(error = %err, "failed to log health probe");
        }

        Ok(report)
    }

    /// Processes one chat message for a session: parse, authorize, route.
    pub async fn handle_chat_message(&self, session_id: &str, text: &str) -> ChatReply {
        let Ok(Some(session)) = self.sessions.get(session_id) else {
            return ChatReply::err(format!("Session not found: {session_id}"));
        };

        let command = match ChatCommand::parse(text) {
            Ok(command) => command,
            Err(parse_error) => return ChatReply::err(parse_error),
        };

        let record = self.sessions.with_session(session_id, |s| {
            s.add_message("user", text);
            s.commands.push(command.label().to_string());
        });
        if let Err(err) = record {
            return ChatReply::err(err.to_string());
        }

        // Privilege gate before any side effects.
        if command.requires_admin() && !session.is_admin() {
            return ChatReply::err(format!(
                "Permission denied: {} requires admin mode",
                command.label()
            ));
        }

        match command {
            ChatCommand::Help => ChatReply::ok(help_text(&session)),
            ChatCommand::Status => ChatReply::ok(status_text(&session)),
            ChatCommand::Clear => match self.sessions.with_session(session_id, ChatSession::clear)
            {
                Ok(()) => ChatReply::ok("Session cleared"),
                Err(err) => ChatReply::err(err.to_string()),
            },
            ChatCommand::SetMode(mode) => {
                match self
                    .sessions
                    .with_session(session_id, |s| s.response_mode = mode)
                {
                    Ok(()) => ChatReply::ok(format!("Response mode set to: {mode}")),
                    Err(err) => ChatReply::err(err.to_string()),
                }
            }
            ChatCommand::SetChatMode(mode) => {
                if mode == ChatMode::Admin && !session.is_admin() {
                    return ChatReply::err(
                        "Permission denied: Admin mode requires elevated privileges",
                    );
                }
                match self.sessions.with_session(session_id, |s| s.mode = mode) {
                    Ok(()) => ChatReply::ok(format!("Chat mode set to: {}", mode.as_str())),
                    Err(err) => ChatReply::err(err.to_string()),
                }
            }
            ChatCommand::Query(question) => self.chat_query(&session, question).await,
            ChatCommand::IngestFile(path) => self.chat_ingest_file(&session, path).await,
            ChatCommand::IngestText(content) => self.chat_ingest_text(&session, content).await,
            ChatCommand::IngestTable { table, db_path } => {
                let Some(db_path) = db_path else {
                    return ChatReply::err("ingest_table requires <table>|<db_path>");
                };
                match self
                    .ingest_sqlite_table(&table, &db_path, None, Some(&session.session_id))
                    .await
                {
                    Ok(report) => {
                        let summary = format!(
                            "Ingested table: {table}\n   rows: {}  chunks: {}",
                            report.rows_ingested, report.chunks_saved
                        );
                        let _ = self.sessions.with_session(session_id, |s| {
                            s.context.last_doc_id = Some(report.base_doc_id.clone());
                        });
                        ChatReply::ok_with(summary, serde_json::to_value(report).unwrap_or_default())
                    }
                    Err(err) => ChatReply::err(err.to_string()),
                }
            }
            ChatCommand::Heal { doc_id, quality } => {
                match self.healing.recommend(&doc_id, quality) {
                    Ok(recommendation) => {
                        let applied = match self.apply_healing(&doc_id, &recommendation).await {
                            Ok(applied) => applied,
                            Err(err) => {
                                warn!(doc_id, error = %err, "healing action failed to apply");
                                false
                            }
                        };
                        let _ = self.sessions.with_session(session_id, |s| {
                            s.context.healed_docs.push(doc_id.clone());
                        });
                        let summary = format!(
                            "Healing recommendation for {doc_id}: {}{} ({})",
                            recommendation.action.action.as_str(),
                            if applied { " [applied]" } else { "" },
                            recommendation.reasoning
                        );
                        ChatReply::ok_with(
                            summary,
                            serde_json::to_value(recommendation).unwrap_or_default(),
                        )
                    }
                    Err(err) => ChatReply::err(err.to_string()),
                }
            }
            ChatCommand::Optimize(doc_id) => {
                match self
                    .optimize_document(&doc_id, Some(session.session_id.clone()))
                    .await
                {
                    Ok(report) => {
                        ChatReply::ok_with(format!("Optimization staged for {doc_id}"), report)
                    }
                    Err(err) => ChatReply::err(err.to_string()),
                }
            }
            ChatCommand::CheckHealth(doc_id) => {
                match self
                    .check_document_health(&doc_id, Some(&session.session_id))
                    .await
                {
                    Ok(report) => {
                        ChatReply::ok_with(format!("Health check completed for {doc_id}"), report)
                    }
                    Err(err) => ChatReply::err(err.to_string()),
                }
            }
        }
    }

    async fn chat_query(&self, session: &ChatSession, question: String) -> ChatReply {
        let request = AskRequest {
            question: question.clone(),
            doc_id: session.context.last_doc_id.clone(),
            rbac_namespace: None,
            response_mode: session.response_mode,
            session_id: Some(session.session_id.clone()),
            user_id: Some(session.user_id.clone()),
        };

        match self.retrieval.ask(request).await {
            Ok(response) => {
                let _ = self.sessions.with_session(&session.session_id, |s| {
                    s.context.last_query = Some(question);
                });
                ChatReply::ok_with(response.answer().to_string(), response.to_json())
            }
            Err(err) => ChatReply::err(err.to_string()),
        }
    }

    async fn chat_ingest_file(&self, session: &ChatSession, path: String) -> ChatReply {
        let file_name = Path::new(&path)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.clone());
        let doc_id = match self.sessions.generate_doc_id(DocSource::File, &file_name) {
            Ok(doc_id) => doc_id,
            Err(err) => return ChatReply::err(err.to_string()),
        };

        let request = IngestionRequest::file(doc_id.clone(), path.clone())
            .with_session(session.session_id.clone());

        match self.ingestion.ingest(request).await {
            Ok(report) => {
                self.remember_ingestion(&session.session_id, &path, &doc_id);
                let summary = format!("Ingested: {path}\n   doc_id: {doc_id}");
                ChatReply::ok_with(summary, serde_json::to_value(report).unwrap_or_default())
            }
            Err(err) => ChatReply::err(err.to_string()),
        }
    }

    /// Text ingestion goes through a temp file that is removed when the
    /// workflow completes, successful or not.
    async fn chat_ingest_text(&self, session: &ChatSession, content: String) -> ChatReply {
        let doc_id = match self.sessions.generate_doc_id(DocSource::Text, "user_input") {
            Ok(doc_id) => doc_id,
            Err(err) => return ChatReply::err(err.to_string()),
        };

        let temp_file = match tempfile::Builder::new()
            .prefix("ragmend-chat-")
            .suffix(".txt")
            .tempfile()
        {
            Ok(file) => file,
            Err(err) => return ChatReply::err(format!("failed to stage text: {err}")),
        };
        if let Err(err) = std::fs::write(temp_file.path(), &content) {
            return ChatReply::err(format!("failed to stage text: {err}"));
        }

        let request = IngestionRequest {
            doc_id: doc_id.clone(),
            source_label: "chat_text_ingestion".to_string(),
            input: ingestion_pipeline::IngestionInput::FilePath(
                temp_file.path().to_string_lossy().into_owned(),
            ),
            rbac_namespace: "general".to_string(),
            session_id: Some(session.session_id.clone()),
            response_mode: session.response_mode,
        };

        let result = self.ingestion.ingest(request).await;
        // Dropping the handle deletes the staged file regardless of outcome.
        drop(temp_file);

        match result {
            Ok(report) => {
                self.remember_ingestion(&session.session_id, "chat_text", &doc_id);
                let summary = format!("Ingested text content\n   doc_id: {doc_id}");
                ChatReply::ok_with(summary, serde_json::to_value(report).unwrap_or_default())
            }
            Err(err) => ChatReply::err(err.to_string()),
        }
    }

    /// Applies an actionable recommendation to the stores. SKIP does
    /// nothing; OPTIMIZE only surfaces parameters for re-ingestion; REINDEX
    /// recomputes embeddings with the current model; RE_EMBED recomputes
    /// with the recommended alternate model. Applied actions bump the chunk
    /// reindex counters, update quality scores, and feed the agent a
    /// placeholder reward until measured deltas exist.
    async fn apply_healing(
        &self,
        doc_id: &str,
        recommendation: &Recommendation,
    ) -> Result<bool, AppError> {
        let model = match recommendation.action.action {
            ActionKind::Skip | ActionKind::Optimize => return Ok(false),
            ActionKind::Reindex => None,
            ActionKind::ReEmbed => recommendation
                .action
                .params
                .get("new_model")
                .and_then(serde_json::Value::as_str)
                .map(str::to_string),
        };

        let texts = self.vector.texts_for_doc(doc_id).await?;
        for (chunk_id, text) in &texts {
            let embedding = match model.as_deref() {
                Some(model) => self.llm.generate_embedding_with_model(text, model).await?,
                None => self.llm.generate_embedding(text).await?,
            };
            self.vector
                .update_embedding(
                    chunk_id,
                    embedding,
                    model.as_deref().unwrap_or_else(|| self.llm.model_label()),
                )
                .await?;
        }

        self.tracking
            .record_heal_applied(doc_id, recommendation.current_quality)?;
        self.healing.observe_reward(
            &recommendation.action,
            recommendation.action.estimated_improvement,
            None,
        )?;

        info!(
            doc_id,
            action = recommendation.action.action.as_str(),
            chunks = texts.len(),
            "healing action applied"
        );

        Ok(true)
    }

    fn remember_ingestion(&self, session_id: &str, source: &str, doc_id: &str) {
        let _ = self.sessions.with_session(session_id, |s| {
            s.context.ingested_files.push(IngestedFile {
                source: source.to_string(),
                doc_id: doc_id.to_string(),
                ingested_at: chrono::Utc::now(),
            });
            s.context.last_doc_id = Some(doc_id.to_string());
        });
    }

    pub fn vector(&self) -> &Arc<VectorStore> {
        &self.vector
    }

    pub fn llm(&self) -> &Arc<dyn LlmService> {
        &self.llm
    }
}

/// All column names of a source table, used when no explicit column spec is
/// given for table ingestion.
fn table_columns(db_path: &str, table_name: &str) -> Result<Vec<String>, AppError> {
    let conn = rusqlite::Connection::open(db_path)?;
    let mut stmt = conn.prepare("SELECT name FROM pragma_table_info(?1)")?;
    let columns: Result<Vec<String>, rusqlite::Error> = stmt
        .query_map([table_name], |row| row.get::<_, String>(0))?
        .collect();
    let columns = columns?;
    if columns.is_empty() {
        return Err(AppError::NotFound(format!(
            "table {table_name} not found in {db_path}"
        )));
    }
    Ok(columns)
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::llm::mock::MockLlm;
    use common::storage::history::EventType;
    use uuid::Uuid;

    const DIM: usize = 16;

    async fn test_agent(llm: MockLlm) -> RagAgent {
        let table = format!("chunk_{}", Uuid::new_v4().simple());
        let vector = Arc::new(VectorStore::memory(&table, DIM).await.unwrap());
        let tracking = Arc::new(TrackingStore::in_memory().unwrap());

        RagAgent::with_services(
            Arc::new(llm),
            vector,
            tracking,
            "alternate-model".to_string(),
            IngestionConfig::default(),
            RetrievalConfig::default(),
        )
        .unwrap()
    }

    fn answering_llm() -> MockLlm {
        MockLlm::new(DIM)
            .with_response("Paris is the capital of France.")
            .with_json(serde_json::json!({
                "intent": "reference",
                "primary_department": "general",
                "required_roles": ["viewer"],
                "sensitivity_level": "public",
                "keywords": ["france", "paris"],
                "title": "France facts",
                "summary": "Facts about France.",
                "topics": ["geography"],
                "doc_type": "article"
            }))
    }

    #[tokio::test]
    async fn ingest_then_query_round_trip() {
        let agent = test_agent(answering_llm()).await;

        let ingest = agent
            .invoke(Operation::IngestDocument {
                text: "The capital of France is Paris. It is known for the Eiffel Tower."
                    .to_string(),
                doc_id: Some("test_modes_001".to_string()),
                rbac_namespace: None,
            })
            .await
            .unwrap();
        assert_eq!(ingest["success"], true);
        assert!(ingest["chunks_saved"].as_u64().unwrap() >= 1);

        let answer = agent
            .invoke(Operation::AskQuestion {
                question: "What is the capital of France?".to_string(),
                doc_id: None,
                response_mode: ResponseMode::Concise,
            })
            .await
            .unwrap();

        assert_eq!(answer["success"], true);
        assert!(answer["answer"]
            .as_str()
            .unwrap()
            .to_lowercase()
            .contains("paris"));
    }

    #[tokio::test]
    async fn user_sessions_cannot_elevate_or_ingest() {
        let agent = test_agent(answering_llm()).await;
        let session = agent
            .sessions
            .create_session("bob", "general", "user", ChatMode::User)
            .unwrap();

        let elevation = agent
            .handle_chat_message(&session.session_id, "set_chat_mode: admin")
            .await;
        assert!(!elevation.is_success());
        assert!(elevation.error.unwrap().contains("Permission denied"));

        // Still a user afterwards.
        let current = agent.sessions.get(&session.session_id).unwrap().unwrap();
        assert_eq!(current.mode, ChatMode::User);

        let ingest = agent
            .handle_chat_message(&session.session_id, "ingest_text: foo")
            .await;
        assert!(!ingest.is_success());
        assert!(ingest.error.unwrap().contains("Permission denied"));

        // Dropping to user mode is always allowed.
        let demote = agent
            .handle_chat_message(&session.session_id, "set_chat_mode: user")
            .await;
        assert!(demote.is_success());
    }

    #[tokio::test]
    async fn admin_chat_ingests_text_and_updates_context() {
        let agent = test_agent(answering_llm()).await;
        let session = agent
            .sessions
            .create_session("alice", "it", "admin", ChatMode::Admin)
            .unwrap();

        let reply = agent
            .handle_chat_message(
                &session.session_id,
                "ingest_text: The VPN portal lives at portal.example.internal.",
            )
            .await;
        assert!(reply.is_success(), "error: {:?}", reply.error);
        assert!(reply.content.contains("doc_id: text_user_input_"));

        let current = agent.sessions.get(&session.session_id).unwrap().unwrap();
        assert_eq!(current.context.ingested_files.len(), 1);
        let doc_id = current.context.last_doc_id.clone().unwrap();
        assert!(doc_id.starts_with("text_user_input_"));
        assert_eq!(agent.vector().count_for_doc(&doc_id).await.unwrap(), 1);

        // A follow-up query is attributed to the ingested document.
        let query = agent
            .handle_chat_message(&session.session_id, "query: where is the VPN portal?")
            .await;
        assert!(query.is_success());

        let events = agent
            .history()
            .get_session_history(&session.session_id)
            .unwrap();
        assert!(events
            .iter()
            .any(|e| e.event_type == EventType::Query.as_str()));
    }

    #[tokio::test]
    async fn heal_command_returns_recommendation_and_tracks_doc() {
        let agent = test_agent(answering_llm()).await;
        let session = agent
            .sessions
            .create_session("ops", "it", "admin", ChatMode::Admin)
            .unwrap();

        let reply = agent
            .handle_chat_message(&session.session_id, "heal: doc_77|0.4")
            .await;
        assert!(reply.is_success());
        let data = reply.data.unwrap();
        assert_eq!(data["doc_id"], "doc_77");
        assert!(data["action"]["action"].is_string());
        assert!(data["learning_stats"]["epsilon"].is_number());

        let current = agent.sessions.get(&session.session_id).unwrap().unwrap();
        assert_eq!(current.context.healed_docs, vec!["doc_77"]);
    }

    #[tokio::test]
    async fn check_health_logs_synthetic_test() {
        let agent = test_agent(answering_llm()).await;
        let session = agent
            .sessions
            .create_session("ops", "it", "admin", ChatMode::Admin)
            .unwrap();

        agent
            .invoke(Operation::IngestDocument {
                text: "Document to probe.".to_string(),
                doc_id: Some("probe_doc".to_string()),
                rbac_namespace: None,
            })
            .await
            .unwrap();

        let reply = agent
            .handle_chat_message(&session.session_id, "check_health: probe_doc")
            .await;
        assert!(reply.is_success());
        let data = reply.data.unwrap();
        assert_eq!(data["stores_in_sync"], true);
        assert_eq!(data["vector_chunk_count"], 1);

        let tests = agent
            .history()
            .get_by_event_type(EventType::SyntheticTest, 10)
            .unwrap();
        assert_eq!(tests.len(), 1);
        assert_eq!(tests[0].target_doc_id.as_deref(), Some("probe_doc"));
    }

    #[tokio::test]
    async fn sqlite_table_ingestion_via_invoke() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("source.db");
        {
            let conn = rusqlite::Connection::open(&db_path).unwrap();
            conn.execute_batch(
                "CREATE TABLE kb (topic TEXT, body TEXT);
                 INSERT INTO kb VALUES ('vpn', 'Use the VPN portal for remote access.');
                 INSERT INTO kb VALUES ('wifi', 'Guest wifi password rotates weekly.');",
            )
            .unwrap();
        }

        let agent = test_agent(answering_llm()).await;
        let result = agent
            .invoke(Operation::IngestSqliteTable {
                table_name: "kb".to_string(),
                db_path: db_path.to_string_lossy().into_owned(),
                rbac_namespace: None,
            })
            .await
            .unwrap();

        assert_eq!(result["success"], true);
        assert_eq!(result["rows_ingested"], 2);
    }

    #[tokio::test]
    async fn path_ingestion_discovers_and_ingests_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "First document about printers.").unwrap();
        std::fs::write(dir.path().join("b.md"), "# Second\n\nAbout networks.").unwrap();

        let agent = test_agent(answering_llm()).await;
        let result = agent
            .invoke(Operation::IngestFromPath {
                path: dir.path().to_path_buf(),
                recursive: false,
            })
            .await
            .unwrap();

        assert_eq!(result["success"], true);
        assert_eq!(result["documents_discovered"], 2);
        assert_eq!(result["documents_ingested"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn optimize_operation_stages_parameters() {
        let agent = test_agent(answering_llm()).await;

        agent
            .invoke(Operation::IngestDocument {
                text: "Document that will be optimized later.".to_string(),
                doc_id: Some("opt_doc".to_string()),
                rbac_namespace: None,
            })
            .await
            .unwrap();

        let result = agent
            .invoke(Operation::Optimize {
                doc_id: "opt_doc".to_string(),
            })
            .await
            .unwrap();

        assert_eq!(result["success"], true);
        assert!(result["optimization"]["suggested_params"]["chunk_size"].is_number());
    }

    #[tokio::test]
    async fn reindex_healing_recomputes_and_bumps_counters() {
        let agent = test_agent(answering_llm()).await;

        agent
            .invoke(Operation::IngestDocument {
                text: "A document in need of healing. It has two sentences.".to_string(),
                doc_id: Some("heal_doc".to_string()),
                rbac_namespace: None,
            })
            .await
            .unwrap();

        let recommendation = Recommendation {
            doc_id: "heal_doc".to_string(),
            current_quality: 0.4,
            action: agent
                .healing
                .action_details(ActionKind::Reindex, &healing_agent::RlState::defaults_for(0.4)),
            reasoning: String::new(),
            learning_stats: agent.healing.learning_stats(),
        };

        let applied = agent
            .apply_healing("heal_doc", &recommendation)
            .await
            .unwrap();
        assert!(applied);

        let chunks = agent.tracking.chunks_for_doc("heal_doc").unwrap();
        assert!(!chunks.is_empty());
        assert!(chunks.iter().all(|c| c.reindex_count == 1));
        assert!(chunks.iter().all(|c| (c.quality_score - 0.4).abs() < 1e-9));

        // The observation decayed exploration.
        assert!(agent.healing.epsilon() < 0.3);
    }

    #[tokio::test]
    async fn mode_switching_changes_response_shape() {
        let agent = test_agent(answering_llm()).await;
        let session = agent
            .sessions
            .create_session("eve", "eng", "engineer", ChatMode::Admin)
            .unwrap();

        agent
            .handle_chat_message(&session.session_id, "ingest_text: Paris is in France.")
            .await;

        let set_mode = agent
            .handle_chat_message(&session.session_id, "set_mode: verbose")
            .await;
        assert!(set_mode.is_success());

        let reply = agent
            .handle_chat_message(&session.session_id, "query: where is Paris?")
            .await;
        let data = reply.data.unwrap();
        assert!(data.get("traceability").is_some());
        assert_eq!(data["guardrails_applied"], false);

        agent
            .handle_chat_message(&session.session_id, "set_mode: concise")
            .await;
        let reply = agent
            .handle_chat_message(&session.session_id, "query: where is Paris?")
            .await;
        let data = reply.data.unwrap();
        assert!(data.get("traceability").is_none());
        assert_eq!(data["guardrails_applied"], true);
    }
}
