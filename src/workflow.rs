//! Workflow catalog: fixed follow-up task lists per workflow type.
//!
//! A register row may name a workflow; elements created from such rows get the
//! workflow's full task list, in catalog order, with evenly spaced order keys.
//! Unknown workflow labels are row-level errors, not batch failures.

use serde::{Deserialize, Serialize};

/// A named, fixed set of follow-up tasks auto-generated for an element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowKind {
    /// Shop fabrication of a structural member.
    Fabrication,
    /// On-site erection and connection of a delivered member.
    Erection,
    /// Corrosion protection survey and coating application.
    CoatingSurvey,
}

impl WorkflowKind {
    /// Resolve a register's workflow label. Matching is case- and
    /// whitespace-insensitive; `None` means the label is not in the catalog.
    pub fn from_label(label: &str) -> Option<Self> {
        match label.trim().to_ascii_lowercase().as_str() {
            "fabrication" => Some(WorkflowKind::Fabrication),
            "erection" => Some(WorkflowKind::Erection),
            "coating_survey" | "coating survey" => Some(WorkflowKind::CoatingSurvey),
            _ => None,
        }
    }

    /// Canonical label for this workflow.
    pub fn label(&self) -> &'static str {
        match self {
            WorkflowKind::Fabrication => "fabrication",
            WorkflowKind::Erection => "erection",
            WorkflowKind::CoatingSurvey => "coating_survey",
        }
    }

    /// The fixed, ordered task list generated for an element on this workflow.
    pub fn task_titles(&self) -> &'static [&'static str] {
        match self {
            WorkflowKind::Fabrication => &[
                "Material receipt check",
                "Cutting and drilling",
                "Fit-up inspection",
                "Welding",
                "Weld visual inspection",
                "Non-destructive testing",
                "Dimensional survey",
                "Surface preparation",
                "Shop priming",
                "Release for dispatch",
            ],
            WorkflowKind::Erection => &[
                "Delivery inspection",
                "Lifting plan check",
                "Erection",
                "Alignment survey",
                "Bolt tightening",
                "Torque verification",
                "Site welding",
                "Connection inspection",
                "Erection clearance",
            ],
            WorkflowKind::CoatingSurvey => &[
                "Surface condition survey",
                "Blast profile check",
                "Primer application",
                "Primer DFT measurement",
                "Intermediate coat",
                "Top coat",
                "Final DFT measurement",
                "Coating clearance",
            ],
        }
    }
}

impl std::fmt::Display for WorkflowKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}
