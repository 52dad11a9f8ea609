//! Phase catalog for the generation pipeline.
//!
//! Phases run in a fixed order; each names the agents it drives and
//! whether a failure stops the pipeline. Optional platform phases are
//! appended behind feature switches so the core ordering never changes.

use crate::agents::AgentDefinition;

/// Static description of one pipeline phase.
#[derive(Debug, Clone)]
pub struct PhaseSpec {
    pub name: String,
    pub agents: Vec<AgentDefinition>,
    /// A failed required phase stops the pipeline unless
    /// `continue_on_error` is also set.
    pub required: bool,
    /// Run the phase's agents concurrently instead of in order.
    pub parallel: bool,
    /// Record the failure and keep going instead of stopping.
    pub continue_on_error: bool,
    /// Persist a checkpoint after each successful agent.
    pub checkpoint: bool,
    /// Semantic key the phase's artifact is stored under. Defaults to
    /// the phase name when absent.
    pub output_key: Option<String>,
}

impl PhaseSpec {
    fn new(name: &str, agents: &[(&str, &str)]) -> Self {
        Self {
            name: name.to_string(),
            agents: agents
                .iter()
                .map(|(id, role)| AgentDefinition::new(*id, *role))
                .collect(),
            required: true,
            parallel: false,
            continue_on_error: false,
            checkpoint: true,
            output_key: None,
        }
    }

    fn optional(mut self) -> Self {
        self.required = false;
        self.continue_on_error = true;
        self
    }

    fn parallel(mut self) -> Self {
        self.parallel = true;
        self
    }

    fn output_key(mut self, key: &str) -> Self {
        self.output_key = Some(key.to_string());
        self
    }

    /// Key the phase's artifact lands under in the output registry.
    pub fn effective_output_key(&self) -> &str {
        self.output_key.as_deref().unwrap_or(&self.name)
    }

    /// The agent re-run during a feedback round, by convention the
    /// phase's last agent.
    pub fn validating_agent(&self) -> Option<&AgentDefinition> {
        self.agents.last()
    }
}

/// The canonical phase ordering.
pub fn default_phases(include_web_preview: bool, include_android_build: bool) -> Vec<PhaseSpec> {
    let mut phases = vec![
        PhaseSpec::new("analysis", &[("analyst", "requirements analyst")]),
        PhaseSpec::new("planning", &[("planner", "product planner")]).output_key("prd"),
        PhaseSpec::new("design", &[("architect", "system architect")]).output_key("architecture"),
        PhaseSpec::new("task-breakdown", &[("task-planner", "implementation planner")])
            .output_key("task_breakdown"),
        PhaseSpec::new(
            "implementation",
            &[
                ("backend-dev", "backend developer"),
                ("frontend-dev", "frontend developer"),
            ],
        )
        .parallel(),
        PhaseSpec::new("validation", &[("validator", "code reviewer")]).output_key("validation"),
        PhaseSpec::new("build-validation", &[("build-validator", "build engineer")]),
        PhaseSpec::new("qa", &[("qa-engineer", "quality engineer")]).optional(),
    ];

    if include_web_preview {
        phases.push(PhaseSpec::new("web-preview", &[("preview-builder", "preview packager")]).optional());
    }
    if include_android_build {
        phases.push(
            PhaseSpec::new("android-build", &[("android-builder", "mobile build engineer")])
                .optional(),
        );
    }

    phases
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_core_ordering_is_stable() {
        let names: Vec<String> = default_phases(false, false)
            .into_iter()
            .map(|p| p.name)
            .collect();
        assert_eq!(
            names,
            vec![
                "analysis",
                "planning",
                "design",
                "task-breakdown",
                "implementation",
                "validation",
                "build-validation",
                "qa",
            ]
        );
    }

    #[test]
    fn test_platform_phases_append_after_core() {
        let names: Vec<String> = default_phases(true, true)
            .into_iter()
            .map(|p| p.name)
            .collect();
        assert_eq!(names[names.len() - 2..], ["web-preview", "android-build"]);
    }

    #[test]
    fn test_qa_failure_does_not_stop_pipeline() {
        let phases = default_phases(false, false);
        let qa = phases.iter().find(|p| p.name == "qa").expect("qa phase");
        assert!(!qa.required);
        assert!(qa.continue_on_error);
    }

    #[test]
    fn test_breakdown_output_key() {
        let phases = default_phases(false, false);
        let breakdown = phases.iter().find(|p| p.name == "task-breakdown").unwrap();
        assert_eq!(breakdown.effective_output_key(), "task_breakdown");
        let analysis = phases.iter().find(|p| p.name == "analysis").unwrap();
        assert_eq!(analysis.effective_output_key(), "analysis");
    }
}
