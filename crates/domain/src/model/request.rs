use serde::{Deserialize, Serialize};

use super::TaskKind;

/// URL the remote generation API can fetch an input image from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MediaRef(String);

impl MediaRef {
    pub fn new(url: impl Into<String>) -> Self {
        Self(url.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_fetchable(&self) -> bool {
        let url = self.0.trim();
        (url.starts_with("https://") || url.starts_with("http://")) && !url.contains(char::is_whitespace)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShotPlan {
    Far,
    Medium,
    Close,
}

impl ShotPlan {
    pub const ALL: [ShotPlan; 3] = [ShotPlan::Far, ShotPlan::Medium, ShotPlan::Close];
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum SceneSelection {
    AllScenes,
    Group { group_id: i64 },
    Single { scene_id: i64, plan: ShotPlan },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VideoTier {
    Balance,
    Pro6,
    Pro10,
    Super6,
}

impl VideoTier {
    pub fn kind(self) -> TaskKind {
        match self {
            Self::Balance => TaskKind::VideoBalance,
            Self::Pro6 => TaskKind::VideoPro6,
            Self::Pro10 => TaskKind::VideoPro10,
            Self::Super6 => TaskKind::VideoSuper6,
        }
    }
}

/// A user's generation request after the gateway collected every input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "variant", rename_all = "snake_case")]
pub enum GenerationRequest {
    ProductCard {
        image: MediaRef,
        selection: SceneSelection,
    },
    NormalizeOwn {
        item_image: MediaRef,
        model_image: MediaRef,
    },
    NormalizeNew {
        item_image: MediaRef,
        preset_id: i64,
    },
    Video {
        tier: VideoTier,
        image: MediaRef,
        #[serde(default)]
        prompt: Option<String>,
    },
    PhotoScene {
        image: MediaRef,
        element_ids: Vec<i64>,
    },
    PhotoPose {
        image: MediaRef,
        element_ids: Vec<i64>,
    },
    PhotoCustom {
        image: MediaRef,
        prompt: String,
    },
}

impl GenerationRequest {
    pub fn kind(&self) -> TaskKind {
        match self {
            Self::ProductCard { .. } => TaskKind::ProductCard,
            Self::NormalizeOwn { .. } => TaskKind::NormalizeOwn,
            Self::NormalizeNew { .. } => TaskKind::NormalizeNew,
            Self::Video { tier, .. } => tier.kind(),
            Self::PhotoScene { .. } => TaskKind::PhotoScene,
            Self::PhotoPose { .. } => TaskKind::PhotoPose,
            Self::PhotoCustom { .. } => TaskKind::PhotoCustom,
        }
    }

    /// Every user-supplied image, in the order the request lists them.
    pub fn images(&self) -> Vec<&MediaRef> {
        match self {
            Self::NormalizeOwn {
                item_image,
                model_image,
            } => vec![item_image, model_image],
            Self::NormalizeNew { item_image, .. } => vec![item_image],
            Self::ProductCard { image, .. }
            | Self::Video { image, .. }
            | Self::PhotoScene { image, .. }
            | Self::PhotoPose { image, .. }
            | Self::PhotoCustom { image, .. } => vec![image],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_deserializes_from_tagged_json() {
        let raw = r#"{
            "variant": "product_card",
            "image": "https://cdn.example/item.jpg",
            "selection": { "mode": "single", "scene_id": 4, "plan": "close" }
        }"#;
        let request: GenerationRequest = serde_json::from_str(raw).unwrap();
        assert_eq!(request.kind(), TaskKind::ProductCard);
        assert_eq!(
            request,
            GenerationRequest::ProductCard {
                image: MediaRef::new("https://cdn.example/item.jpg"),
                selection: SceneSelection::Single {
                    scene_id: 4,
                    plan: ShotPlan::Close
                },
            }
        );
    }

    #[test]
    fn video_kind_follows_tier() {
        let raw = r#"{"variant":"video","tier":"pro10","image":"https://x/y.png"}"#;
        let request: GenerationRequest = serde_json::from_str(raw).unwrap();
        assert_eq!(request.kind(), TaskKind::VideoPro10);
    }

    #[test]
    fn media_refs_must_be_http_urls() {
        assert!(MediaRef::new("https://cdn.example/a.png").is_fetchable());
        assert!(!MediaRef::new("file:///etc/passwd").is_fetchable());
        assert!(!MediaRef::new("https://cdn.example/a b.png").is_fetchable());
    }
}
