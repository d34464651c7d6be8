//! Phase A: turns a validated request into priced, ordered sub-jobs.

use std::collections::HashSet;

use cardsmith_domain::config::ModelTable;
use cardsmith_domain::model::{
    CatalogEntry, CatalogKind, Credits, GenerationRequest, MediaRef, PriceTable, SceneSelection,
    ShotPlan, TaskKind, VideoTier,
};
use cardsmith_domain::storage::{CatalogStore, StorageError};
use serde_json::{json, Value};
use thiserror::Error;

use crate::translate::{prepare_prompt, Translator};

const GHOST_PROMPT: &str = "Remove the person and present the garment as a ghost mannequin on a \
     clean white background, preserving its exact shape, color and texture.";
const COMPOSE_OWN_PROMPT: &str = "Dress the person from the second image in the garment from the \
     first image. Keep the person's face, body, pose and background unchanged.";
const DEFAULT_VIDEO_PROMPT: &str =
    "Smooth cinematic camera movement that showcases the product in detail.";
const GROK_MODE: &str = "normal";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PlanError {
    #[error("{0}")]
    Validation(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

fn invalid(message: impl Into<String>) -> PlanError {
    PlanError::Validation(message.into())
}

/// Where a sub-job's input image comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobImage {
    Url(String),
    /// The first result of the preceding sub-job.
    Predecessor,
}

/// Input schema expected by the model family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadShape {
    ImageEdit,
    GrokVideo,
    HailuoVideo {
        duration: &'static str,
        resolution: &'static str,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubJob {
    pub label: String,
    pub model: String,
    pub prompt: String,
    pub images: Vec<JobImage>,
    pub shape: PayloadShape,
    /// Intermediate artifacts (ghost mannequins) are not delivered.
    pub deliver: bool,
}

impl SubJob {
    fn image_edit(model: &str, label: String, prompt: String, images: Vec<JobImage>) -> Self {
        Self {
            label,
            model: model.to_string(),
            prompt,
            images,
            shape: PayloadShape::ImageEdit,
            deliver: true,
        }
    }

    pub fn depends_on_predecessor(&self) -> bool {
        self.images.contains(&JobImage::Predecessor)
    }

    /// Substitutes the predecessor's result; `None` when it is needed but absent.
    pub fn resolve_images(&self, predecessor: Option<&str>) -> Option<Vec<String>> {
        self.images
            .iter()
            .map(|image| match image {
                JobImage::Url(url) => Some(url.clone()),
                JobImage::Predecessor => predecessor.map(str::to_string),
            })
            .collect()
    }

    pub fn payload(&self, images: &[String]) -> Value {
        match self.shape {
            PayloadShape::ImageEdit => json!({
                "prompt": self.prompt,
                "image_urls": images,
                "output_format": "png",
                "image_size": "auto",
            }),
            PayloadShape::GrokVideo => json!({
                "prompt": self.prompt,
                "image_urls": images,
                "mode": GROK_MODE,
            }),
            PayloadShape::HailuoVideo {
                duration,
                resolution,
            } => json!({
                "prompt": self.prompt,
                "image_url": images.first().cloned().unwrap_or_default(),
                "duration": duration,
                "resolution": resolution,
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Plan {
    pub kind: TaskKind,
    pub unit_cost: Credits,
    pub jobs: Vec<SubJob>,
    pub input_params: Value,
}

impl Plan {
    pub fn total_cost(&self) -> Credits {
        self.unit_cost.saturating_mul(self.jobs.len() as Credits)
    }

    /// Chained plans feed each result into the next job and run sequentially.
    pub fn is_chained(&self) -> bool {
        self.jobs.iter().any(SubJob::depends_on_predecessor)
    }
}

/// Validates `request` against the catalog and derives its sub-jobs. No
/// ledger state is touched.
pub async fn plan_request<C, T>(
    catalog: &C,
    translator: &T,
    prices: &PriceTable,
    models: &ModelTable,
    request: &GenerationRequest,
) -> Result<Plan, PlanError>
where
    C: CatalogStore + ?Sized,
    T: Translator + ?Sized,
{
    for image in request.images() {
        if !image.is_fetchable() {
            return Err(invalid("every image must be a fetchable http(s) URL"));
        }
    }

    let kind = request.kind();
    let image_model = models.image_model.as_str();
    let mut input_params = json!({ "request": request });

    let jobs = match request {
        GenerationRequest::ProductCard { image, selection } => {
            let shots: Vec<(CatalogEntry, ShotPlan)> = match selection {
                SceneSelection::AllScenes => {
                    let scenes = catalog.catalog_entries(CatalogKind::ProductScene).await?;
                    cross_with_plans(scenes)
                }
                SceneSelection::Group { group_id } => {
                    let scenes = catalog
                        .catalog_group(CatalogKind::ProductScene, *group_id)
                        .await?;
                    cross_with_plans(scenes)
                }
                SceneSelection::Single { scene_id, plan } => {
                    let scene =
                        active_entry(catalog, *scene_id, CatalogKind::ProductScene).await?;
                    vec![(scene, *plan)]
                }
            };
            if shots.is_empty() {
                return Err(invalid("no scenes available for this selection"));
            }
            shots
                .into_iter()
                .map(|(scene, plan)| {
                    SubJob::image_edit(
                        image_model,
                        format!("{} / {}", scene.title, plan_label(plan)),
                        format!(
                            "{}. {}. Keep the product exactly as in the reference photo.",
                            scene.prompt.trim_end_matches('.'),
                            plan_directive(plan)
                        ),
                        vec![url(image)],
                    )
                })
                .collect()
        }
        GenerationRequest::NormalizeOwn {
            item_image,
            model_image,
        } => vec![
            ghost_job(image_model, item_image),
            SubJob::image_edit(
                image_model,
                "composite".into(),
                COMPOSE_OWN_PROMPT.into(),
                vec![JobImage::Predecessor, url(model_image)],
            ),
        ],
        GenerationRequest::NormalizeNew {
            item_image,
            preset_id,
        } => {
            let preset = active_entry(catalog, *preset_id, CatalogKind::ModelPreset).await?;
            vec![
                ghost_job(image_model, item_image),
                SubJob::image_edit(
                    image_model,
                    format!("composite / {}", preset.title),
                    format!(
                        "{}. The model wears the garment from the reference image.",
                        preset.prompt.trim_end_matches('.')
                    ),
                    vec![JobImage::Predecessor],
                ),
            ]
        }
        GenerationRequest::Video {
            tier,
            image,
            prompt,
        } => {
            let model = models.video_model(*tier);
            let prompt = match prompt.as_deref().map(str::trim) {
                Some(text) if !text.is_empty() => prepare_prompt(translator, text).await,
                _ => DEFAULT_VIDEO_PROMPT.to_string(),
            };
            vec![SubJob {
                label: format!("video / {}", kind),
                model: model.to_string(),
                prompt,
                images: vec![url(image)],
                shape: video_shape(model, *tier),
                deliver: true,
            }]
        }
        GenerationRequest::PhotoScene { image, element_ids } => {
            let scenes = selected_entries(catalog, element_ids, CatalogKind::PhotoScene).await?;
            scenes
                .into_iter()
                .map(|scene| {
                    SubJob::image_edit(
                        image_model,
                        scene.title.clone(),
                        format!(
                            "Place the subject of the photo into this setting: {}. Keep the \
                             subject unchanged.",
                            scene.prompt.trim_end_matches('.')
                        ),
                        vec![url(image)],
                    )
                })
                .collect()
        }
        GenerationRequest::PhotoPose { image, element_ids } => {
            let poses = selected_entries(catalog, element_ids, CatalogKind::Pose).await?;
            poses
                .into_iter()
                .map(|pose| {
                    SubJob::image_edit(
                        image_model,
                        pose.title.clone(),
                        format!(
                            "Change the pose of the person to: {}. Keep identity, clothing and \
                             background.",
                            pose.prompt.trim_end_matches('.')
                        ),
                        vec![url(image)],
                    )
                })
                .collect()
        }
        GenerationRequest::PhotoCustom { image, prompt } => {
            if prompt.trim().is_empty() {
                return Err(invalid("custom prompt must not be empty"));
            }
            let prompt = prepare_prompt(translator, prompt).await;
            input_params["prompt_en"] = Value::String(prompt.clone());
            vec![SubJob::image_edit(
                image_model,
                "custom".into(),
                prompt,
                vec![url(image)],
            )]
        }
    };

    Ok(Plan {
        kind,
        unit_cost: prices.unit_cost(kind),
        jobs,
        input_params,
    })
}

fn url(image: &MediaRef) -> JobImage {
    JobImage::Url(image.as_str().trim().to_string())
}

fn ghost_job(model: &str, item_image: &MediaRef) -> SubJob {
    SubJob {
        deliver: false,
        ..SubJob::image_edit(
            model,
            "ghost mannequin".into(),
            GHOST_PROMPT.into(),
            vec![url(item_image)],
        )
    }
}

fn cross_with_plans(scenes: Vec<CatalogEntry>) -> Vec<(CatalogEntry, ShotPlan)> {
    scenes
        .into_iter()
        .flat_map(|scene| ShotPlan::ALL.map(|plan| (scene.clone(), plan)))
        .collect()
}

fn plan_label(plan: ShotPlan) -> &'static str {
    match plan {
        ShotPlan::Far => "far",
        ShotPlan::Medium => "medium",
        ShotPlan::Close => "close",
    }
}

fn plan_directive(plan: ShotPlan) -> &'static str {
    match plan {
        ShotPlan::Far => "Wide shot showing the whole product within the scene",
        ShotPlan::Medium => "Medium shot with the product filling about half of the frame",
        ShotPlan::Close => "Close-up shot focusing on product details and texture",
    }
}

fn video_shape(model: &str, tier: VideoTier) -> PayloadShape {
    if model.to_ascii_lowercase().contains("grok") {
        return PayloadShape::GrokVideo;
    }
    let (duration, resolution) = match tier {
        VideoTier::Pro10 => ("10", "768P"),
        VideoTier::Balance | VideoTier::Pro6 | VideoTier::Super6 => ("6", "1080P"),
    };
    PayloadShape::HailuoVideo {
        duration,
        resolution,
    }
}

async fn active_entry<C>(catalog: &C, id: i64, kind: CatalogKind) -> Result<CatalogEntry, PlanError>
where
    C: CatalogStore + ?Sized,
{
    catalog
        .catalog_entry(id)
        .await?
        .filter(|entry| entry.kind == kind && entry.is_active)
        .ok_or_else(|| invalid(format!("{kind} #{id} is not available")))
}

async fn selected_entries<C>(
    catalog: &C,
    element_ids: &[i64],
    kind: CatalogKind,
) -> Result<Vec<CatalogEntry>, PlanError>
where
    C: CatalogStore + ?Sized,
{
    let mut seen = HashSet::new();
    let mut entries = Vec::with_capacity(element_ids.len());
    for id in element_ids.iter().copied().filter(|id| seen.insert(*id)) {
        entries.push(active_entry(catalog, id, kind).await?);
    }
    if entries.is_empty() {
        return Err(invalid("select at least one element"));
    }
    Ok(entries)
}
