//! LLM-backed document classification. A structured call assigns intent,
//! department, required roles, sensitivity and keywords; the result is
//! translated into RBAC tags (`rbac:dept:{d}:role:{r}`) and meta tags
//! (`meta:intent:{i}`, `meta:sensitivity:{s}`). Failures fall back to the
//! generic viewer tag and never abort ingestion.

use std::str::FromStr;
use std::sync::Arc;

use common::{error::AppError, llm::LlmService};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Chars of normalized text handed to the classifier.
pub const CLASSIFICATION_EXCERPT_CHARS: usize = 2000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Sensitivity {
    Public,
    #[default]
    Internal,
    Confidential,
    Restricted,
}

impl Sensitivity {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Public => "public",
            Self::Internal => "internal",
            Self::Confidential => "confidential",
            Self::Restricted => "restricted",
        }
    }
}

impl FromStr for Sensitivity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "public" => Ok(Self::Public),
            "internal" => Ok(Self::Internal),
            "confidential" => Ok(Self::Confidential),
            "restricted" => Ok(Self::Restricted),
            other => Err(format!("unknown sensitivity level: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Classification {
    pub intent: String,
    pub primary_department: String,
    pub required_roles: Vec<String>,
    pub sensitivity: Sensitivity,
    pub keywords: Vec<String>,
    pub rbac_tags: Vec<String>,
    pub meta_tags: Vec<String>,
}

/// Default used when the classifier is unavailable or returns garbage:
/// generic viewer access, no meta tags.
pub fn fallback_classification() -> Classification {
    Classification {
        intent: "unclassified".to_string(),
        primary_department: "general".to_string(),
        required_roles: vec!["viewer".to_string()],
        sensitivity: Sensitivity::Internal,
        keywords: Vec::new(),
        rbac_tags: vec!["rbac:generic:viewer".to_string()],
        meta_tags: Vec::new(),
    }
}

#[derive(Deserialize)]
struct RawClassification {
    intent: String,
    primary_department: String,
    required_roles: Vec<String>,
    sensitivity_level: String,
    keywords: Vec<String>,
}

pub fn classification_schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "intent": { "type": "string" },
            "primary_department": { "type": "string" },
            "required_roles": { "type": "array", "items": { "type": "string" } },
            "sensitivity_level": {
                "type": "string",
                "enum": ["public", "internal", "confidential", "restricted"]
            },
            "keywords": { "type": "array", "items": { "type": "string" } }
        },
        "required": ["intent", "primary_department", "required_roles", "sensitivity_level", "keywords"],
        "additionalProperties": false
    })
}

pub async fn classify_document(
    llm: &Arc<dyn LlmService>,
    title: &str,
    text: &str,
) -> Result<Classification, AppError> {
    let excerpt: String = text.chars().take(CLASSIFICATION_EXCERPT_CHARS).collect();
    let prompt = format!(
        "Classify the document below for access control and retrieval.\n\
         Assign one short intent tag, the primary department it belongs to, the roles \
         required to read it, a sensitivity level, and 5-10 keywords.\n\n\
         TITLE: {title}\n\nDOCUMENT:\n{excerpt}"
    );

    let value = llm
        .generate_json(&prompt, "document_classification", classification_schema())
        .await?;
    let raw: RawClassification = serde_json::from_value(value)
        .map_err(|e| AppError::LlmParsing(format!("classification payload mismatch: {e}")))?;

    let sensitivity = Sensitivity::from_str(&raw.sensitivity_level).unwrap_or_default();
    let classification = build_classification(
        raw.intent,
        raw.primary_department,
        raw.required_roles,
        sensitivity,
        raw.keywords,
    );

    debug!(
        intent = %classification.intent,
        department = %classification.primary_department,
        rbac_tags = classification.rbac_tags.len(),
        "document classified"
    );

    Ok(classification)
}

fn build_classification(
    intent: String,
    primary_department: String,
    required_roles: Vec<String>,
    sensitivity: Sensitivity,
    keywords: Vec<String>,
) -> Classification {
    let department = tag_segment(&primary_department);
    let intent_tag = tag_segment(&intent);

    let mut rbac_tags: Vec<String> = required_roles
        .iter()
        .map(|role| format!("rbac:dept:{department}:role:{}", tag_segment(role)))
        .collect();
    if rbac_tags.is_empty() {
        rbac_tags.push("rbac:generic:viewer".to_string());
    }

    let meta_tags = vec![
        format!("meta:intent:{intent_tag}"),
        format!("meta:sensitivity:{}", sensitivity.as_str()),
    ];

    Classification {
        intent,
        primary_department,
        required_roles,
        sensitivity,
        keywords,
        rbac_tags,
        meta_tags,
    }
}

/// Lowercases and strips a value into a tag-safe segment.
fn tag_segment(value: &str) -> String {
    let segment: String = value
        .trim()
        .to_lowercase()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if segment.is_empty() {
        "general".to_string()
    } else {
        segment
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::llm::mock::MockLlm;

    #[tokio::test]
    async fn classification_builds_rbac_and_meta_tags() {
        let llm: Arc<dyn LlmService> = Arc::new(MockLlm::new(8).with_json(serde_json::json!({
            "intent": "incident report",
            "primary_department": "IT Support",
            "required_roles": ["Engineer", "manager"],
            "sensitivity_level": "confidential",
            "keywords": ["outage", "printer"]
        })));

        let classification = classify_document(&llm, "Printer outage", "The printer is down.")
            .await
            .unwrap();

        assert_eq!(
            classification.rbac_tags,
            vec![
                "rbac:dept:it_support:role:engineer",
                "rbac:dept:it_support:role:manager"
            ]
        );
        assert_eq!(
            classification.meta_tags,
            vec!["meta:intent:incident_report", "meta:sensitivity:confidential"]
        );
        assert_eq!(classification.sensitivity, Sensitivity::Confidential);
    }

    #[tokio::test]
    async fn llm_failure_surfaces_for_caller_fallback() {
        let llm: Arc<dyn LlmService> = Arc::new(MockLlm::new(8).failing_json());

        let result = classify_document(&llm, "t", "text").await;
        assert!(matches!(result, Err(AppError::LlmParsing(_))));

        let fallback = fallback_classification();
        assert_eq!(fallback.rbac_tags, vec!["rbac:generic:viewer"]);
        assert!(fallback.meta_tags.is_empty());
    }

    #[tokio::test]
    async fn empty_roles_still_produce_a_viewer_tag() {
        let llm: Arc<dyn LlmService> = Arc::new(MockLlm::new(8).with_json(serde_json::json!({
            "intent": "note",
            "primary_department": "",
            "required_roles": [],
            "sensitivity_level": "not-a-level",
            "keywords": []
        })));

        let classification = classify_document(&llm, "t", "text").await.unwrap();
        assert_eq!(classification.rbac_tags, vec!["rbac:generic:viewer"]);
        assert_eq!(classification.sensitivity, Sensitivity::Internal);
    }
}
