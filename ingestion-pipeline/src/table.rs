//! Table ingestion: reads rows from a source SQLite database (distinct from
//! the tracking database), renders each row as a titled markdown record,
//! and runs chunking, embedding and audit for every row as its own
//! synthetic document.

use std::sync::{Arc, LazyLock};

use common::{error::AppError, modes::ResponseMode, workflow::WorkflowCommon};
use regex::Regex;
use rusqlite::types::ValueRef;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use crate::{
    chunking::chunk_document,
    metadata::{DocKind, DocMetadata},
    normalize::render_table_row,
    pipeline::{IngestionConfig, IngestionInput, IngestionServices, IngestionState},
};

static IDENTIFIER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("identifier pattern"));

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableIngestionSpec {
    pub table_name: String,
    pub source_db_path: String,
    pub text_columns: Vec<String>,
    pub metadata_columns: Vec<String>,
    /// Optional SQL filter appended as a WHERE clause. Trusted
    /// configuration, not user input.
    pub filter: Option<String>,
    pub rbac_namespace: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableIngestionReport {
    pub success: bool,
    pub base_doc_id: String,
    pub rows_ingested: usize,
    pub chunks_saved: usize,
    pub errors: Vec<String>,
}

#[instrument(skip_all, fields(table = %spec.table_name, base_doc_id))]
pub async fn ingest_table(
    services: &Arc<IngestionServices>,
    config: &IngestionConfig,
    spec: &TableIngestionSpec,
    base_doc_id: &str,
    session_id: Option<&str>,
) -> Result<TableIngestionReport, AppError> {
    validate_spec(spec)?;

    let rows = read_rows(spec)?;
    let mut errors = Vec::new();
    let mut rows_ingested = 0usize;
    let mut chunks_saved = 0usize;

    for (index, columns) in rows.iter().enumerate() {
        let doc_id = format!("{base_doc_id}_row_{index}");
        let rendered = render_table_row(&spec.table_name, index, columns);

        let common = WorkflowCommon::new(
            session_id.unwrap_or("session_default"),
            ResponseMode::Concise,
        );
        let mut state = IngestionState::new(
            common,
            doc_id.clone(),
            format!("sqlite:{}:{}", spec.source_db_path, spec.table_name),
            IngestionInput::Text(rendered.clone()),
            spec.rbac_namespace.clone(),
        );
        state.markdown = Some(rendered.clone());
        state.metadata = Some(DocMetadata {
            title: format!("{} record {index}", spec.table_name),
            summary: rendered.chars().take(200).collect(),
            keywords: Vec::new(),
            topics: spec
                .metadata_columns
                .iter()
                .filter_map(|name| {
                    columns
                        .iter()
                        .find(|(col, _)| col == name)
                        .map(|(col, value)| format!("{col}:{value}"))
                })
                .collect(),
            doc_type: DocKind::Other,
        });

        let chunks = chunk_document(&doc_id, &rendered, &config.chunker);
        crate::pipeline::stages::persist_synthetic_document(services, config, &mut state, chunks)
            .await;

        if state.common.success() && state.chunks_saved > 0 {
            rows_ingested += 1;
        }
        chunks_saved += state.chunks_saved;
        errors.extend(state.common.errors);
    }

    info!(
        table = %spec.table_name,
        rows = rows.len(),
        rows_ingested,
        chunks_saved,
        "table ingestion finished"
    );

    Ok(TableIngestionReport {
        success: errors.is_empty(),
        base_doc_id: base_doc_id.to_string(),
        rows_ingested,
        chunks_saved,
        errors,
    })
}

fn validate_spec(spec: &TableIngestionSpec) -> Result<(), AppError> {
    if spec.text_columns.is_empty() {
        return Err(AppError::Validation(
            "table ingestion requires at least one text column".into(),
        ));
    }
    for identifier in std::iter::once(&spec.table_name)
        .chain(spec.text_columns.iter())
        .chain(spec.metadata_columns.iter())
    {
        if !IDENTIFIER.is_match(identifier) {
            return Err(AppError::Validation(format!(
                "invalid SQL identifier: {identifier}"
            )));
        }
    }
    Ok(())
}

type RenderedRow = Vec<(String, String)>;

fn read_rows(spec: &TableIngestionSpec) -> Result<Vec<RenderedRow>, AppError> {
    let conn = Connection::open(&spec.source_db_path)?;

    let columns: Vec<&String> = spec
        .text_columns
        .iter()
        .chain(spec.metadata_columns.iter())
        .collect();
    let column_list = columns
        .iter()
        .map(|c| c.as_str())
        .collect::<Vec<_>>()
        .join(", ");

    let mut sql = format!("SELECT {column_list} FROM {}", spec.table_name);
    if let Some(filter) = &spec.filter {
        sql.push_str(" WHERE ");
        sql.push_str(filter);
    }

    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;

    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let mut rendered = Vec::with_capacity(columns.len());
        for (idx, column) in columns.iter().enumerate() {
            rendered.push(((*column).clone(), value_to_string(row.get_ref(idx)?)));
        }
        out.push(rendered);
    }

    Ok(out)
}

fn value_to_string(value: ValueRef<'_>) -> String {
    match value {
        ValueRef::Null => String::new(),
        ValueRef::Integer(i) => i.to_string(),
        ValueRef::Real(f) => f.to_string(),
        ValueRef::Text(bytes) => String::from_utf8_lossy(bytes).into_owned(),
        ValueRef::Blob(bytes) => format!("<blob:{} bytes>", bytes.len()),
    }
}
