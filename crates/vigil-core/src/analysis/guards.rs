//! Input guard: size, emptiness, language and denylist checks applied
//! before any parsing work.

use std::sync::LazyLock;

use regex::{Regex, RegexBuilder};
use tracing::{debug, warn};

use crate::config::VigilConfig;
use crate::errors::{VigilError, VigilResult};
use crate::models::{Language, SourceUnit};

/// Keywords that are logged (never blocked) when they appear in submitted code.
pub const SUSPICIOUS_KEYWORDS: &[&str] = &[
    "password",
    "secret",
    "key",
    "token",
    "credential",
    "private",
];

const REDACTION_PLACEHOLDER: &str = "[REDACTED - Contains sensitive information]";

static SENSITIVE_LINE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)password|secret|key|token|credential").unwrap()
});

/// Why the guard refused a submission.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Rejection {
    Empty,
    Oversized { chars: usize, max: usize },
    UnknownLanguage(String),
    /// A denylist pattern matched. Carries the offending pattern for logs only.
    DangerousPattern { pattern: String, line: usize },
}

impl Rejection {
    pub fn is_dangerous(&self) -> bool {
        matches!(self, Rejection::DangerousPattern { .. })
    }

    /// Caller-facing message. Never echoes the matched pattern.
    pub fn message(&self) -> String {
        match self {
            Rejection::Empty => "Code cannot be empty".to_string(),
            Rejection::Oversized { max, .. } => {
                format!("Code too large (max {max} characters)")
            }
            Rejection::UnknownLanguage(lang) => format!("Unsupported language: {lang}"),
            Rejection::DangerousPattern { .. } => {
                "Potentially dangerous code pattern detected".to_string()
            }
        }
    }
}

impl From<Rejection> for VigilError {
    fn from(rejection: Rejection) -> Self {
        VigilError::Validation(rejection.message())
    }
}

pub struct InputGuard {
    max_code_chars: usize,
    denylist: Vec<Regex>,
    redact_sensitive_lines: bool,
}

impl InputGuard {
    pub fn new(config: &VigilConfig) -> VigilResult<Self> {
        let denylist = config
            .denylist
            .iter()
            .map(|pattern| {
                RegexBuilder::new(pattern)
                    .case_insensitive(true)
                    .multi_line(true)
                    .build()
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            max_code_chars: config.max_code_chars,
            denylist,
            redact_sensitive_lines: config.redact_sensitive_lines,
        })
    }

    pub fn max_code_chars(&self) -> usize {
        self.max_code_chars
    }

    /// Validate a raw submission and turn it into a `SourceUnit`.
    pub fn admit(&self, code: &str, language: &str) -> Result<SourceUnit, Rejection> {
        if code.trim().is_empty() {
            return Err(Rejection::Empty);
        }
        let chars = code.chars().count();
        if chars > self.max_code_chars {
            return Err(Rejection::Oversized {
                chars,
                max: self.max_code_chars,
            });
        }
        let language: Language = language
            .parse()
            .map_err(|_| Rejection::UnknownLanguage(language.trim().to_string()))?;

        if let Some(rejection) = self.scan_denylist(code) {
            return Err(rejection);
        }

        let lowered = code.to_lowercase();
        for keyword in SUSPICIOUS_KEYWORDS {
            if lowered.contains(keyword) {
                debug!(keyword, "Suspicious keyword in submitted code");
            }
        }

        let text = if self.redact_sensitive_lines {
            redact_sensitive_lines(code, language)
        } else {
            code.to_string()
        };
        Ok(SourceUnit::new(text, language))
    }

    fn scan_denylist(&self, code: &str) -> Option<Rejection> {
        for pattern in &self.denylist {
            if let Some(m) = pattern.find(code) {
                let line = code[..m.start()].matches('\n').count() + 1;
                warn!(
                    target: "vigil::security",
                    event = "DANGEROUS_PATTERN",
                    pattern = pattern.as_str(),
                    line,
                    "Dangerous pattern detected in submitted code"
                );
                return Some(Rejection::DangerousPattern {
                    pattern: pattern.as_str().to_string(),
                    line,
                });
            }
        }
        None
    }
}

/// Replace every line naming a credential with a comment placeholder.
/// Line count is preserved so finding positions stay meaningful.
pub fn redact_sensitive_lines(code: &str, language: Language) -> String {
    code.split('\n')
        .map(|line| {
            if SENSITIVE_LINE_RE.is_match(line) {
                let indent = &line[..line.len() - line.trim_start().len()];
                format!(
                    "{indent}{} {REDACTION_PLACEHOLDER}",
                    language.comment_prefix()
                )
            } else {
                line.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guard() -> InputGuard {
        InputGuard::new(&VigilConfig::default()).unwrap()
    }

    #[test]
    fn test_import_os_rejected() {
        let err = guard().admit("import os\nprint('x')", "python").unwrap_err();
        assert!(err.is_dangerous());
        assert_eq!(
            err,
            Rejection::DangerousPattern {
                pattern: r"import\s+os\s*$".to_string(),
                line: 1
            }
        );
        let as_error: VigilError = err.into();
        assert_eq!(as_error.status_code(), 400);
    }

    #[test]
    fn test_denylist_is_case_insensitive_and_multiline() {
        let src = "x = 1\nWHILE TRUE:\n    pass";
        let err = guard().admit(src, "python").unwrap_err();
        assert!(matches!(err, Rejection::DangerousPattern { line: 2, .. }));
    }

    #[test]
    fn test_empty_rejected() {
        assert_eq!(guard().admit("   \n\t", "python").unwrap_err(), Rejection::Empty);
    }

    #[test]
    fn test_oversized_rejected_by_chars() {
        let mut config = VigilConfig::default();
        config.max_code_chars = 10;
        let guard = InputGuard::new(&config).unwrap();
        // ten multi-byte chars fit even though they exceed ten bytes
        assert!(guard.admit("éééééééééé", "python").is_ok());
        let err = guard.admit("x = 12345678", "python").unwrap_err();
        assert_eq!(err, Rejection::Oversized { chars: 12, max: 10 });
        assert_eq!(err.message(), "Code too large (max 10 characters)");
    }

    #[test]
    fn test_unknown_language_rejected() {
        let err = guard().admit("x = 1", "cobol").unwrap_err();
        assert_eq!(err, Rejection::UnknownLanguage("cobol".into()));
    }

    #[test]
    fn test_clean_code_admitted() {
        let unit = guard().admit("def f(): return 1", "Python").unwrap();
        assert_eq!(unit.language, Language::Python);
        assert_eq!(unit.byte_len, 17);
    }

    #[test]
    fn test_redaction_keeps_line_count() {
        let src = "a = 1\n    db_password = 'hunter2'\nb = 2";
        let out = redact_sensitive_lines(src, Language::Python);
        let lines: Vec<&str> = out.split('\n').collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[1], "    # [REDACTED - Contains sensitive information]");
        assert!(!out.contains("hunter2"));
    }
}
