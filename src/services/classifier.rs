use anyhow::Result;
use image::imageops::FilterType;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::models::{ClassificationResult, FoodPrediction};
use crate::services::camera::Frame;

/// Default number of ranked labels returned.
pub const DEFAULT_TOP_K: usize = 3;
/// The contract allows 3..=5 ranked labels; requests outside are clamped.
pub const MAX_TOP_K: usize = 5;

#[derive(Debug, Error)]
pub enum ClassifyError {
    #[error("classifier model is not loaded yet")]
    NotReady,
    #[error("classifier model failed to load: {0}")]
    LoadFailed(String),
    #[error("captured frame is empty or undecodable: {0}")]
    BadFrame(String),
    #[error("no predictions returned from model")]
    NoPredictions,
    #[error("inference failed: {0}")]
    Backend(String),
}

/// The pre-trained model itself is an external collaborator; this trait is
/// its input/output contract. Input is RGB, HWC layout, normalized to
/// [-1, 1]; output is one score per class index, in [0, 1].
#[async_trait::async_trait]
pub trait ClassifierBackend: Send + Sync {
    /// Expected input geometry as (width, height).
    fn input_size(&self) -> (u32, u32);
    async fn infer(&self, input: &[f32]) -> Result<Vec<f32>>;
}

/// Load lifecycle of the adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelPhase {
    Unloaded,
    Loading,
    Ready,
    Failed,
}

struct ReadyModel {
    backend: Arc<dyn ClassifierBackend>,
    // index → human-readable label, inverted from the label-table asset
    labels: HashMap<usize, String>,
}

enum ModelState {
    Unloaded,
    Loading,
    Ready(Arc<ReadyModel>),
    Failed(String),
}

/// In-process image classifier, loaded once and shared read-only after.
///
/// The label table is owned by the instance, so the adapter can be stood
/// up per test instead of leaning on process-wide state.
pub struct FoodClassifier {
    state: RwLock<ModelState>,
}

impl Default for FoodClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl FoodClassifier {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(ModelState::Unloaded),
        }
    }

    pub async fn phase(&self) -> ModelPhase {
        match *self.state.read().await {
            ModelState::Unloaded => ModelPhase::Unloaded,
            ModelState::Loading => ModelPhase::Loading,
            ModelState::Ready(_) => ModelPhase::Ready,
            ModelState::Failed(_) => ModelPhase::Failed,
        }
    }

    pub async fn is_ready(&self) -> bool {
        self.phase().await == ModelPhase::Ready
    }

    /// Load the model once. Idempotent: while loading or once ready,
    /// further calls return without duplicating work. A failed load is
    /// remembered; calling again after a failure re-attempts.
    ///
    /// `label_table_json` is the asset mapping label → class index; it is
    /// inverted here for index → label lookup at classify time.
    pub async fn load(
        &self,
        backend: Arc<dyn ClassifierBackend>,
        label_table_json: &str,
    ) -> Result<(), ClassifyError> {
        {
            let mut state = self.state.write().await;
            match *state {
                ModelState::Loading | ModelState::Ready(_) => return Ok(()),
                ModelState::Unloaded | ModelState::Failed(_) => *state = ModelState::Loading,
            }
        }

        log::info!("loading food classifier model");
        match invert_label_table(label_table_json) {
            Ok(labels) => {
                log::info!("classifier ready ({} labels)", labels.len());
                *self.state.write().await = ModelState::Ready(Arc::new(ReadyModel {
                    backend,
                    labels,
                }));
                Ok(())
            }
            Err(message) => {
                log::error!("classifier load failed: {}", message);
                *self.state.write().await = ModelState::Failed(message.clone());
                Err(ClassifyError::LoadFailed(message))
            }
        }
    }

    /// Classify one frozen frame into ranked food labels.
    ///
    /// `top_k` is clamped to 1..=5. Calls before the model is ready fail
    /// fast with `NotReady`; they never trigger a load themselves.
    pub async fn classify(
        &self,
        frame: &Frame,
        top_k: usize,
    ) -> Result<ClassificationResult, ClassifyError> {
        let model = {
            let state = self.state.read().await;
            match &*state {
                ModelState::Unloaded | ModelState::Loading => return Err(ClassifyError::NotReady),
                ModelState::Failed(message) => {
                    return Err(ClassifyError::LoadFailed(message.clone()))
                }
                ModelState::Ready(model) => model.clone(),
            }
        };

        let (width, height) = model.backend.input_size();
        // Preprocessing buffers live only inside this call.
        let input = preprocess(frame, width, height)?;

        let scores = model
            .backend
            .infer(&input)
            .await
            .map_err(|e| ClassifyError::Backend(e.to_string()))?;
        if scores.is_empty() {
            return Err(ClassifyError::NoPredictions);
        }

        let mut ranked: Vec<(usize, f32)> = scores.iter().copied().enumerate().collect();
        ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        let top_k = top_k.clamp(1, MAX_TOP_K);
        let predictions = ranked
            .into_iter()
            .take(top_k)
            .map(|(index, score)| FoodPrediction {
                // A miss in the label table degrades one label, not the call.
                label: model
                    .labels
                    .get(&index)
                    .cloned()
                    .unwrap_or_else(|| format!("Unknown ({})", index)),
                probability: f64::from(score),
            })
            .collect();

        Ok(ClassificationResult { predictions })
    }
}

// Stand-in backend so the on-device path can be exercised without a
// linked ML runtime; real deployments implement `ClassifierBackend` over
// their inference engine. Scores are derived from the mean pixel value,
// so different images rank differently, deterministically.
pub struct MockClassifierBackend {
    pub classes: usize,
}

#[async_trait::async_trait]
impl ClassifierBackend for MockClassifierBackend {
    fn input_size(&self) -> (u32, u32) {
        // MobileNet v2 geometry
        (224, 224)
    }

    async fn infer(&self, input: &[f32]) -> Result<Vec<f32>> {
        let mean: f32 = input.iter().sum::<f32>() / input.len().max(1) as f32;
        let raw: Vec<f32> = (0..self.classes)
            .map(|i| ((i + 1) as f32 * (mean + 2.0)).sin().abs())
            .collect();
        let total: f32 = raw.iter().sum::<f32>().max(f32::EPSILON);
        Ok(raw.into_iter().map(|v| v / total).collect())
    }
}

fn invert_label_table(label_table_json: &str) -> Result<HashMap<usize, String>, String> {
    let table: HashMap<String, usize> = serde_json::from_str(label_table_json)
        .map_err(|e| format!("invalid label table: {}", e))?;

    let mut inverted = HashMap::with_capacity(table.len());
    for (label, index) in table {
        if inverted.insert(index, label).is_some() {
            return Err(format!("label table reuses class index {}", index));
        }
    }
    Ok(inverted)
}

/// Decode, resize to the model geometry and normalize RGB to [-1, 1].
fn preprocess(frame: &Frame, width: u32, height: u32) -> Result<Vec<f32>, ClassifyError> {
    if frame.is_empty() {
        return Err(ClassifyError::BadFrame("frame has no pixel data".to_string()));
    }

    let decoded = image::load_from_memory(&frame.data)
        .map_err(|e| ClassifyError::BadFrame(e.to_string()))?;
    let resized = decoded.resize_exact(width, height, FilterType::Triangle);
    let rgb = resized.to_rgb8();

    Ok(rgb
        .pixels()
        .flat_map(|p| p.0)
        .map(|v| f32::from(v) / 127.5 - 1.0)
        .collect())
}
