//! Typed accumulated outputs threaded between phases.
//!
//! Earlier phases produce named artifacts ("prd", "architecture",
//! "task_breakdown") that later phases read when building their prompts.
//! The registry is a tagged union per artifact rather than untyped JSON,
//! so producers and consumers agree on a schema at compile time.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::store::records::TaskBreakdown;

/// One phase artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PhaseOutput {
    /// Product requirements document text.
    Prd { content: String },
    /// Architecture description text.
    Architecture { content: String },
    /// Detailed design text.
    DesignSpec { content: String },
    /// Implementation task breakdown.
    Breakdown { breakdown: TaskBreakdown },
    /// A validation report.
    Validation { passed: bool, report: String },
    /// Escape hatch for artifacts without a dedicated schema.
    Raw { value: Value },
}

/// Registry of phase artifacts keyed by semantic name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PhaseOutputs {
    entries: BTreeMap<String, PhaseOutput>,
}

impl PhaseOutputs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, output: PhaseOutput) {
        self.entries.insert(key.into(), output);
    }

    pub fn get(&self, key: &str) -> Option<&PhaseOutput> {
        self.entries.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The implementation breakdown, wherever a phase stored it.
    pub fn task_breakdown(&self) -> Option<&TaskBreakdown> {
        self.entries.values().find_map(|output| match output {
            PhaseOutput::Breakdown { breakdown } => Some(breakdown),
            _ => None,
        })
    }

    /// Store an agent's textual result under a semantic key, parsing it
    /// into the key's schema where one exists. Unparseable breakdown
    /// text degrades to a raw artifact rather than being dropped.
    pub fn insert_agent_result(&mut self, key: &str, result_text: &str) {
        let output = match key {
            "prd" => PhaseOutput::Prd {
                content: result_text.to_string(),
            },
            "architecture" => PhaseOutput::Architecture {
                content: result_text.to_string(),
            },
            "design" => PhaseOutput::DesignSpec {
                content: result_text.to_string(),
            },
            "task_breakdown" => match serde_json::from_str::<TaskBreakdown>(result_text) {
                Ok(breakdown) => PhaseOutput::Breakdown { breakdown },
                Err(err) => {
                    tracing::warn!(error = %err, "task breakdown output did not parse");
                    PhaseOutput::Raw {
                        value: Value::String(result_text.to_string()),
                    }
                }
            },
            _ => PhaseOutput::Raw {
                value: Value::String(result_text.to_string()),
            },
        };
        self.insert(key, output);
    }

    /// Snapshot as JSON for prompt context and checkpoints.
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}
