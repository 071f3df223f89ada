use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Verbosity and validation profile of a returned answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ResponseMode {
    #[default]
    Concise,
    Verbose,
    Internal,
}

impl ResponseMode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Concise => "concise",
            Self::Verbose => "verbose",
            Self::Internal => "internal",
        }
    }

    /// Guardrails run for concise and internal output; verbose is raw.
    pub const fn validates_output(self) -> bool {
        !matches!(self, Self::Verbose)
    }
}

impl FromStr for ResponseMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "concise" => Ok(Self::Concise),
            "verbose" => Ok(Self::Verbose),
            "internal" => Ok(Self::Internal),
            other => Err(format!("Invalid response mode: {other}")),
        }
    }
}

impl fmt::Display for ResponseMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_modes_case_insensitively() {
        assert_eq!(
            "CONCISE".parse::<ResponseMode>().unwrap(),
            ResponseMode::Concise
        );
        assert_eq!(
            " internal ".parse::<ResponseMode>().unwrap(),
            ResponseMode::Internal
        );
        assert!("loud".parse::<ResponseMode>().is_err());
    }

    #[test]
    fn verbose_skips_validation() {
        assert!(ResponseMode::Concise.validates_output());
        assert!(ResponseMode::Internal.validates_output());
        assert!(!ResponseMode::Verbose.validates_output());
    }
}
