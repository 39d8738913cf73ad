mod handlers;
mod models;
mod services;

use anyhow::Result;
use dotenv::dotenv;
use std::collections::HashMap;
use std::env;
use std::sync::Arc;
use std::time::Duration;

use handlers::{AnalysisPath, CaptureSession};
use models::{AnalysisOutcome, CaptureOutcome};
use services::classifier::DEFAULT_TOP_K;
use services::{
    FoodClassifier, MockClassifierBackend, OllamaService, StillCamera, DEFAULT_OLLAMA_URL,
};

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    dotenv().ok();

    let image_path = env::args()
        .nth(1)
        .ok_or_else(|| anyhow::anyhow!("usage: bitescan <image-file>"))?;

    log::info!("📷 Analyzing {}", image_path);

    // The still image stands in for the live camera's frozen frame.
    let data = std::fs::read(&image_path)?;
    let (width, height) = image::image_dimensions(&image_path).unwrap_or((0, 0));
    let camera = Arc::new(StillCamera::from_bytes(data, width, height));

    let path_kind = env::var("ANALYSIS_PATH").unwrap_or_else(|_| "remote".to_string());
    let path = match path_kind.as_str() {
        "classifier" => {
            let labels_path = env::var("CLASSIFIER_LABELS")
                .unwrap_or_else(|_| "assets/food_labels.json".to_string());
            let labels_json = std::fs::read_to_string(&labels_path)?;
            let classes = serde_json::from_str::<HashMap<String, usize>>(&labels_json)?.len();
            log::info!("✅ Using in-process classifier ({} labels from {})", classes, labels_path);

            AnalysisPath::OnDevice {
                classifier: Arc::new(FoodClassifier::new()),
                backend: Arc::new(MockClassifierBackend { classes }),
                labels_json,
                top_k: DEFAULT_TOP_K,
            }
        }
        "remote" => {
            let url = env::var("OLLAMA_URL").unwrap_or_else(|_| DEFAULT_OLLAMA_URL.to_string());
            let model = env::var("OLLAMA_MODEL").unwrap_or_else(|_| "llava:7b-v1.6".to_string());
            let timeout = env::var("OLLAMA_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(120);
            let retries = env::var("OLLAMA_RETRIES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(2);
            log::info!("✅ Using vision model '{}' at {}", model, url);

            AnalysisPath::Remote {
                gateway: Arc::new(OllamaService::new(
                    url,
                    Duration::from_secs(timeout),
                    retries,
                )?),
                model,
            }
        }
        other => anyhow::bail!("ANALYSIS_PATH must be 'remote' or 'classifier', got '{}'", other),
    };

    let session = CaptureSession::new(camera, path);
    session.mount().await?;
    if !session.ready_to_capture().await {
        session.unmount().await;
        anyhow::bail!("classifier model is not ready; capture is disabled");
    }

    // Tracks are released even when the analysis itself fails.
    let outcome = session.capture().await;
    session.unmount().await;

    if let Some(outcome) = outcome? {
        render(&outcome);
    }
    Ok(())
}

/// Result view: itemized nutrients with recomputed totals, raw-text
/// fallback with a visible notice, or ranked classifier labels.
fn render(outcome: &CaptureOutcome) {
    match outcome {
        CaptureOutcome::Analysis(AnalysisOutcome::Success { data, .. }) => {
            println!("Estimated nutrition:\n");
            println!(
                "  {:<28} {:>8} {:>8} {:>8} {:>8} {:>8} {:>8}",
                "ingredient", "g", "kcal", "protein", "carbs", "fats", "fiber"
            );
            for (name, rec) in data.iter() {
                println!(
                    "  {:<28} {:>8.1} {:>8.0} {:>8.1} {:>8.1} {:>8.1} {:>8.1}",
                    name, rec.weight, rec.calories, rec.protein, rec.carbs, rec.fats, rec.fiber
                );
            }
            let totals = data.aggregate();
            println!(
                "\n  {:<28} {:>8.1} {:>8.0} {:>8.1} {:>8.1} {:>8.1} {:>8.1}",
                "TOTAL",
                totals.weight,
                totals.calories,
                totals.protein,
                totals.carbs,
                totals.fats,
                totals.fiber
            );
        }
        CaptureOutcome::Analysis(AnalysisOutcome::PartialFailure { raw_text, parse_error }) => {
            println!("⚠️  Could not read the model's answer as nutrition data: {}", parse_error);
            println!("\nRaw model output:\n{}", raw_text);
        }
        CaptureOutcome::Analysis(AnalysisOutcome::Failure { error }) => {
            println!("Analysis failed: {}", error);
        }
        CaptureOutcome::Classification(result) => {
            println!("Most likely foods:\n");
            for prediction in &result.predictions {
                println!(
                    "  {:<28} {:>5.1}%",
                    prediction.label,
                    prediction.probability * 100.0
                );
            }
        }
    }
}
