//! Structural elements and their deduplication identity.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a structural element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ElementId(pub Uuid);

impl From<Uuid> for ElementId {
    fn from(uuid: Uuid) -> Self {
        ElementId(uuid)
    }
}

impl std::ops::Deref for ElementId {
    type Target = Uuid;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl std::fmt::Display for ElementId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// Identifier of the project an upload belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProjectId(pub Uuid);

impl From<Uuid> for ProjectId {
    fn from(uuid: Uuid) -> Self {
        ProjectId(uuid)
    }
}

impl std::ops::Deref for ProjectId {
    type Target = Uuid;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl std::fmt::Display for ProjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// Stable identity derived from row content, used to detect duplicate elements
/// across batches and retries.
///
/// The key normalizes structure and drawing numbers (trimmed, upper-cased) so
/// that re-uploading the same register matches existing elements regardless of
/// formatting drift. It embeds the project, so identical numbers in different
/// projects are distinct elements.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NaturalKey(String);

impl NaturalKey {
    pub fn new(project_id: ProjectId, structure_number: &str, drawing_number: &str) -> Self {
        NaturalKey(format!(
            "{}:{}:{}",
            project_id.0,
            normalize(structure_number),
            normalize(drawing_number)
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn normalize(field: &str) -> String {
    field.trim().to_ascii_uppercase()
}

/// One structural item created from one register row.
#[derive(Debug, Clone, Serialize)]
pub struct Element {
    pub id: ElementId,
    pub project_id: ProjectId,
    pub natural_key: NaturalKey,
    pub structure_number: String,
    pub drawing_number: String,
    pub description: Option<String>,
    pub material: Option<String>,
    pub created_at: DateTime<Utc>,
}
