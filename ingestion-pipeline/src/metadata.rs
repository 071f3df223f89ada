//! Second LLM pass over the normalized text: title, summary, keywords,
//! topics and a document-type tag. Defaults are derived from the text
//! itself when the model call fails.

use std::str::FromStr;
use std::sync::Arc;

use common::{error::AppError, llm::LlmService};
use serde::{Deserialize, Serialize};

/// Chars of normalized text handed to the extractor.
pub const METADATA_EXCERPT_CHARS: usize = 2000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DocKind {
    Report,
    Policy,
    Manual,
    Faq,
    Correspondence,
    Article,
    #[default]
    Other,
}

impl FromStr for DocKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "report" => Ok(Self::Report),
            "policy" => Ok(Self::Policy),
            "manual" => Ok(Self::Manual),
            "faq" => Ok(Self::Faq),
            "correspondence" => Ok(Self::Correspondence),
            "article" => Ok(Self::Article),
            "other" => Ok(Self::Other),
            unknown => Err(format!("unknown document type: {unknown}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DocMetadata {
    pub title: String,
    pub summary: String,
    pub keywords: Vec<String>,
    pub topics: Vec<String>,
    pub doc_type: DocKind,
}

#[derive(Deserialize)]
struct RawMetadata {
    title: String,
    summary: String,
    keywords: Vec<String>,
    topics: Vec<String>,
    doc_type: String,
}

pub fn metadata_schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "title": { "type": "string" },
            "summary": { "type": "string" },
            "keywords": { "type": "array", "items": { "type": "string" } },
            "topics": { "type": "array", "items": { "type": "string" } },
            "doc_type": {
                "type": "string",
                "enum": ["report", "policy", "manual", "faq", "correspondence", "article", "other"]
            }
        },
        "required": ["title", "summary", "keywords", "topics", "doc_type"],
        "additionalProperties": false
    })
}

pub async fn extract_metadata(
    llm: &Arc<dyn LlmService>,
    text: &str,
) -> Result<DocMetadata, AppError> {
    let excerpt: String = text.chars().take(METADATA_EXCERPT_CHARS).collect();
    let prompt = format!(
        "Extract metadata from the document below: a title, a 2-3 sentence summary, \
         5-10 keywords, a topic list, and the document type.\n\nDOCUMENT:\n{excerpt}"
    );

    let value = llm
        .generate_json(&prompt, "document_metadata", metadata_schema())
        .await?;
    let raw: RawMetadata = serde_json::from_value(value)
        .map_err(|e| AppError::LlmParsing(format!("metadata payload mismatch: {e}")))?;

    Ok(DocMetadata {
        title: raw.title,
        summary: raw.summary,
        keywords: raw.keywords,
        topics: raw.topics,
        doc_type: DocKind::from_str(&raw.doc_type).unwrap_or_default(),
    })
}

/// Derives usable defaults from the text itself.
pub fn fallback_metadata(text: &str) -> DocMetadata {
    let title: String = text
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or("Untitled document")
        .trim_start_matches('#')
        .trim()
        .chars()
        .take(80)
        .collect();

    DocMetadata {
        title: if title.is_empty() {
            "Untitled document".to_string()
        } else {
            title
        },
        summary: "Summary unavailable".to_string(),
        keywords: Vec::new(),
        topics: Vec::new(),
        doc_type: DocKind::Other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::llm::mock::MockLlm;

    #[tokio::test]
    async fn metadata_parses_structured_output() {
        let llm: Arc<dyn LlmService> = Arc::new(MockLlm::new(8).with_json(serde_json::json!({
            "title": "Network outage review",
            "summary": "A summary. In two sentences.",
            "keywords": ["network", "outage"],
            "topics": ["infrastructure"],
            "doc_type": "report"
        })));

        let metadata = extract_metadata(&llm, "some document text").await.unwrap();
        assert_eq!(metadata.title, "Network outage review");
        assert_eq!(metadata.doc_type, DocKind::Report);
    }

    #[tokio::test]
    async fn unknown_doc_type_defaults_to_other() {
        let llm: Arc<dyn LlmService> = Arc::new(MockLlm::new(8).with_json(serde_json::json!({
            "title": "t",
            "summary": "s",
            "keywords": [],
            "topics": [],
            "doc_type": "screenplay"
        })));

        let metadata = extract_metadata(&llm, "text").await.unwrap();
        assert_eq!(metadata.doc_type, DocKind::Other);
    }

    #[test]
    fn fallback_uses_first_line_as_title() {
        let metadata = fallback_metadata("# Quarterly Report\n\nNumbers follow.");
        assert_eq!(metadata.title, "Quarterly Report");
        assert_eq!(metadata.doc_type, DocKind::Other);

        let empty = fallback_metadata("   \n\n ");
        assert_eq!(empty.title, "Untitled document");
    }
}
