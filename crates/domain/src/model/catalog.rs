use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

/// Families of prompt catalog entries the orchestrator reads.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum CatalogKind {
    /// Backgrounds for product cards, grouped.
    ProductScene,
    /// Backgrounds offered by the photo-scene flow.
    PhotoScene,
    Pose,
    /// Catalog model used when normalizing onto a new model.
    ModelPreset,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CatalogEntry {
    pub id: i64,
    pub kind: CatalogKind,
    pub group_id: Option<i64>,
    pub group_title: Option<String>,
    pub title: String,
    pub prompt: String,
    pub is_active: bool,
    pub position: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewCatalogEntry {
    pub kind: CatalogKind,
    pub group_id: Option<i64>,
    pub group_title: Option<String>,
    pub title: String,
    pub prompt: String,
    pub is_active: bool,
    pub position: i32,
}

impl NewCatalogEntry {
    pub fn active(kind: CatalogKind, title: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            kind,
            group_id: None,
            group_title: None,
            title: title.into(),
            prompt: prompt.into(),
            is_active: true,
            position: 0,
        }
    }

    pub fn in_group(mut self, group_id: i64, group_title: impl Into<String>) -> Self {
        self.group_id = Some(group_id);
        self.group_title = Some(group_title.into());
        self
    }
}
