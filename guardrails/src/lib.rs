//! Pattern-based response validation: PII, credential and injection-shaped
//! SQL sweeps over generated answers, with in-place redaction. No model
//! calls; everything here is static and deterministic.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

static EMAIL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b").expect("email pattern")
});
static PHONE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b\d{3}[-.\s]?\d{3}[-.\s]?\d{4}\b").expect("phone pattern"));
static SSN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b\d{3}-\d{2}-\d{4}\b").expect("ssn pattern"));
static CREDIT_CARD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b\d{4}[\s-]?\d{4}[\s-]?\d{4}[\s-]?\d{4}\b").expect("credit card pattern")
});
static CREDENTIAL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(api[_-]?key|password|token|secret|credential)[\s:=]+\S+")
        .expect("credential pattern")
});
static SQL_FRAGMENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)(\bUNION\b|\bSELECT\b.*\bWHERE\b|\bDROP\b.*\bTABLE\b)")
        .expect("sql pattern")
});

/// Risk classification for a validated response. The maximum violation risk
/// classifies the whole response.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum RiskLevel {
    #[default]
    Safe,
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Safe => "SAFE",
            Self::Low => "LOW",
            Self::Medium => "MEDIUM",
            Self::High => "HIGH",
            Self::Critical => "CRITICAL",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Violation {
    pub kind: String,
    pub risk: RiskLevel,
    pub message: String,
}

/// Result of a full validation pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardrailReport {
    pub is_safe: bool,
    pub safety_level: RiskLevel,
    /// Pattern label -> number of matches found in the output.
    pub pii_detected: BTreeMap<String, usize>,
    pub input_errors: Vec<String>,
    pub output_errors: Vec<String>,
    /// Present when redaction changed the output.
    pub filtered_output: Option<String>,
    pub message: String,
}

impl GuardrailReport {
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

#[derive(Default)]
pub struct GuardrailEngine;

struct PatternCheck {
    regex: &'static LazyLock<Regex>,
    label: &'static str,
    risk: RiskLevel,
    replacement: Option<&'static str>,
}

/// Redaction order matters: card numbers first so the phone pattern cannot
/// claim a fragment of a longer digit run.
static OUTPUT_CHECKS: [PatternCheck; 6] = [
    PatternCheck {
        regex: &CREDIT_CARD,
        label: "PII - Credit Card",
        risk: RiskLevel::Critical,
        replacement: Some("[REDACTED_CARD]"),
    },
    PatternCheck {
        regex: &SSN,
        label: "PII - SSN",
        risk: RiskLevel::Critical,
        replacement: Some("[REDACTED_SSN]"),
    },
    PatternCheck {
        regex: &PHONE,
        label: "PII - Phone Number",
        risk: RiskLevel::High,
        replacement: Some("[REDACTED_PHONE]"),
    },
    PatternCheck {
        regex: &EMAIL,
        label: "PII - Email Address",
        risk: RiskLevel::High,
        replacement: Some("[REDACTED_EMAIL]"),
    },
    PatternCheck {
        regex: &CREDENTIAL,
        label: "Security - Credential Exposure",
        risk: RiskLevel::Critical,
        replacement: Some("[REDACTED_CREDENTIAL]"),
    },
    PatternCheck {
        regex: &SQL_FRAGMENT,
        label: "Security - SQL Patterns",
        risk: RiskLevel::Medium,
        replacement: None,
    },
];

impl GuardrailEngine {
    pub fn new() -> Self {
        Self
    }

    /// Validates a user input / model output pair. Input violations are
    /// reported but never redacted; output PII and credentials are replaced
    /// with placeholders.
    pub fn process_request(&self, user_input: &str, llm_output: &str) -> GuardrailReport {
        let input_errors = Self::check_input(user_input);

        let mut output_errors = Vec::new();
        let mut pii_detected = BTreeMap::new();
        let mut max_risk = RiskLevel::Safe;
        let mut filtered = llm_output.to_string();
        let mut redacted = false;

        for check in &OUTPUT_CHECKS {
            let count = check.regex.find_iter(&filtered).count();
            if count == 0 {
                continue;
            }

            max_risk = max_risk.max(check.risk);
            output_errors.push(format!("{} detected ({count} match(es))", check.label));
            if check.label.starts_with("PII") {
                pii_detected.insert(check.label.to_string(), count);
            }

            if let Some(replacement) = check.replacement {
                filtered = check
                    .regex
                    .replace_all(&filtered, replacement)
                    .into_owned();
                redacted = true;
            }
        }

        let is_safe = output_errors.is_empty() && input_errors.is_empty();
        debug!(
            safe = is_safe,
            risk = max_risk.as_str(),
            violations = output_errors.len(),
            "guardrail sweep finished"
        );

        GuardrailReport {
            is_safe,
            safety_level: max_risk,
            pii_detected,
            input_errors,
            output_errors,
            filtered_output: redacted.then_some(filtered),
            message: recommendation(is_safe, max_risk).to_string(),
        }
    }

    fn check_input(user_input: &str) -> Vec<String> {
        let mut errors = Vec::new();
        if SQL_FRAGMENT.is_match(user_input) {
            errors.push("Input contains SQL-injection-shaped fragments".to_string());
        }
        if CREDENTIAL.is_match(user_input) {
            errors.push("Input appears to contain credentials".to_string());
        }
        errors
    }
}

const fn recommendation(is_safe: bool, max_risk: RiskLevel) -> &'static str {
    if is_safe {
        return "Response is safe to return to user";
    }
    match max_risk {
        RiskLevel::Critical => "BLOCK: Response poses critical risk. Do not return to user.",
        RiskLevel::High => "REVIEW: Response has high-risk issues. Consider manual review before returning.",
        RiskLevel::Medium => "WARN: Response has medium-risk issues. Consider flagging to user.",
        _ => "INFO: Response has minor issues but can be returned.",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_text_is_safe() {
        let report = GuardrailEngine::new()
            .process_request("What is the capital of France?", "The capital is Paris.");

        assert!(report.is_safe);
        assert_eq!(report.safety_level, RiskLevel::Safe);
        assert!(report.filtered_output.is_none());
        assert!(report.pii_detected.is_empty());
    }

    #[test]
    fn password_and_email_are_redacted() {
        let report = GuardrailEngine::new()
            .process_request("", "Your password: hunter2 and email foo@bar.com");

        assert!(!report.is_safe);
        assert!(matches!(
            report.safety_level,
            RiskLevel::High | RiskLevel::Critical
        ));

        let filtered = report.filtered_output.expect("output should be redacted");
        assert!(!filtered.contains("hunter2"));
        assert!(!filtered.contains("foo@bar.com"));
        assert!(filtered.contains("[REDACTED_CREDENTIAL]"));
        assert!(filtered.contains("[REDACTED_EMAIL]"));
    }

    #[test]
    fn ssn_and_credit_card_are_critical() {
        let report = GuardrailEngine::new()
            .process_request("", "SSN 123-45-6789 card 4111 1111 1111 1111");

        assert_eq!(report.safety_level, RiskLevel::Critical);
        let filtered = report.filtered_output.unwrap();
        assert!(filtered.contains("[REDACTED_SSN]"));
        assert!(filtered.contains("[REDACTED_CARD]"));
        assert!(!filtered.contains("123-45-6789"));
    }

    #[test]
    fn phone_number_variants_match() {
        for phone in ["555-867-5309", "555.867.5309", "555 867 5309", "5558675309"] {
            let report =
                GuardrailEngine::new().process_request("", &format!("call {phone} today"));
            assert!(
                report.pii_detected.contains_key("PII - Phone Number"),
                "expected {phone} to match"
            );
        }
    }

    #[test]
    fn credential_pattern_matches_across_line_breaks() {
        let report = GuardrailEngine::new().process_request("", "api_key:\n    sk-deadbeef");

        assert!(!report.is_safe);
        assert!(!report.filtered_output.unwrap().contains("sk-deadbeef"));
    }

    #[test]
    fn sql_fragments_are_flagged_but_not_redacted() {
        let report = GuardrailEngine::new()
            .process_request("", "try SELECT name\nFROM users\nWHERE admin = 1");

        assert!(!report.is_safe);
        assert_eq!(report.safety_level, RiskLevel::Medium);
        assert!(report.filtered_output.is_none());
        assert!(report
            .output_errors
            .iter()
            .any(|e| e.contains("SQL Patterns")));
    }

    #[test]
    fn input_violations_are_reported_separately() {
        let report = GuardrailEngine::new()
            .process_request("'; DROP my TABLE; --", "Nothing sensitive here.");

        assert!(!report.is_safe);
        assert_eq!(report.output_errors.len(), 0);
        assert_eq!(report.input_errors.len(), 1);
    }

    #[test]
    fn max_risk_classifies_the_response() {
        let report = GuardrailEngine::new()
            .process_request("", "email foo@bar.com and UNION select tricks");

        // Email is HIGH, SQL is MEDIUM; HIGH wins.
        assert_eq!(report.safety_level, RiskLevel::High);
    }
}
