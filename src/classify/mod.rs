//! Error classification for the fix feedback loop.
//!
//! Only errors whose textual signature matches a known mechanical defect
//! class are eligible for automated repair. Runtime exceptions, network
//! failures, and anything unclassified are never handed to the fixer: the
//! loop must not attempt to patch non-deterministic or environmental
//! failures with a code edit.

use regex::Regex;

use crate::store::records::{Severity, ValidationError};

/// A single named auto-fix pattern.
#[derive(Debug, Clone)]
pub struct FixPattern {
    /// Stable name for logs (e.g. "missing_import").
    pub name: &'static str,
    regex: Regex,
}

/// Strategy object deciding which error messages are auto-fixable.
///
/// Patterns are pluggable so new diagnostic tools can register their own
/// signatures without touching the feedback loop.
#[derive(Debug, Clone)]
pub struct AutoFixMatcher {
    patterns: Vec<FixPattern>,
}

impl Default for AutoFixMatcher {
    /// Matcher covering the known-mechanical defect classes: missing or
    /// unresolvable imports, undefined names, type-assignability and
    /// missing-property diagnostics, and unused-variable lint rules.
    fn default() -> Self {
        let mut matcher = Self {
            patterns: Vec::new(),
        };
        matcher.register(
            "missing_import",
            r"(?i)cannot find module|unresolved import|module not found|failed to resolve import",
        );
        matcher.register("undefined_name", r"(?i)is not defined|cannot find name");
        matcher.register(
            "type_mismatch",
            r"(?i)is not assignable to|missing the following properties|property '[^']+' does not exist",
        );
        matcher.register(
            "unused_variable",
            r"(?i)unused variable|is (declared|defined) but (its value is )?never (used|read)|no-unused-vars",
        );
        matcher
    }
}

impl AutoFixMatcher {
    /// Matcher with no patterns; nothing is auto-fixable until patterns
    /// are registered.
    pub fn empty() -> Self {
        Self {
            patterns: Vec::new(),
        }
    }

    /// Register an additional pattern. Invalid regexes are rejected with a
    /// warning rather than a panic so a bad tool plugin cannot take down
    /// the orchestrator.
    pub fn register(&mut self, name: &'static str, pattern: &str) {
        match Regex::new(pattern) {
            Ok(regex) => self.patterns.push(FixPattern { name, regex }),
            Err(err) => {
                tracing::warn!(pattern = name, error = %err, "rejected invalid auto-fix pattern");
            }
        }
    }

    /// Whether this message matches a known mechanical defect class.
    ///
    /// Pure and deterministic: same message, same verdict, independent of
    /// call order.
    pub fn is_auto_fixable(&self, message: &str) -> bool {
        self.patterns.iter().any(|p| p.regex.is_match(message))
    }

    /// Name of the first matching pattern, if any.
    pub fn matching_pattern(&self, message: &str) -> Option<&'static str> {
        self.patterns
            .iter()
            .find(|p| p.regex.is_match(message))
            .map(|p| p.name)
    }
}

/// Parse raw diagnostic text into structured validation errors.
///
/// Two known formats are recognized: a compiler-style
/// `file(line,col): severity CODE: message` form and a linter-style
/// `file line:col severity message rule` form. Unmatched non-empty lines
/// are preserved verbatim under the `raw` code so no information is
/// silently dropped.
pub fn parse_error_details(raw_text: &str) -> Vec<ValidationError> {
    // Compiled per call; diagnostic parsing is rare relative to its cost.
    let compiler = Regex::new(
        r"^(?P<file>[^()\s]+)\((?P<line>\d+),(?P<col>\d+)\):\s+(?P<sev>error|warning)\s+(?P<code>[A-Za-z0-9_-]+):\s+(?P<msg>.+)$",
    )
    .expect("compiler diagnostic regex");
    let linter = Regex::new(
        r"^(?P<file>\S+)\s+(?P<line>\d+):(?P<col>\d+)\s+(?P<sev>error|warning)\s+(?P<msg>.+?)\s{2,}(?P<rule>[A-Za-z0-9@/_.-]+)$",
    )
    .expect("linter diagnostic regex");

    let mut errors = Vec::new();
    for line in raw_text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if let Some(caps) = compiler.captures(line) {
            errors.push(ValidationError {
                file: caps["file"].to_string(),
                line: caps["line"].parse().ok(),
                column: caps["col"].parse().ok(),
                code: caps["code"].to_string(),
                message: caps["msg"].to_string(),
                severity: parse_severity(&caps["sev"]),
            });
        } else if let Some(caps) = linter.captures(line) {
            errors.push(ValidationError {
                file: caps["file"].to_string(),
                line: caps["line"].parse().ok(),
                column: caps["col"].parse().ok(),
                code: caps["rule"].to_string(),
                message: caps["msg"].to_string(),
                severity: parse_severity(&caps["sev"]),
            });
        } else {
            errors.push(ValidationError {
                file: "unknown".to_string(),
                line: None,
                column: None,
                code: "raw".to_string(),
                message: line.to_string(),
                severity: Severity::Error,
            });
        }
    }
    errors
}

fn parse_severity(text: &str) -> Severity {
    if text.eq_ignore_ascii_case("warning") {
        Severity::Warning
    } else {
        Severity::Error
    }
}
