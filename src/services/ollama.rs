use base64::{engine::general_purpose, Engine};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Default local Ollama endpoint.
pub const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434/api/generate";

/// Instruction sent with every image. Part of the wire contract: the
/// answer must be a bare JSON object whose keys are ingredient names and
/// whose values carry exactly the six nutrient fields the parser expects.
pub const NUTRITION_PROMPT: &str = "\
Act as a certified nutritionist specialized in visual food analysis.

CONTEXT: You are going to analyze a food photograph to extract nutritional information.

SPECIFIC INSTRUCTIONS:
- Identify each individual visible ingredient
- Estimate the weight in grams (use visual references like plate size, cutlery, etc.)
- Calculate calories based on standard nutritional values
- Consider the cooking method if visible (fried, baked, boiled)
- If there are sauces or dressings, include them separately

MANDATORY FORMAT:
Answer with ONLY a JSON object and nothing else. Each key is an ingredient
name. Each value is an object with exactly these numeric fields:
\"weight\" (grams), \"calories\" (kcal), \"protein\" (grams), \"carbs\" (grams),
\"fats\" (grams), \"fiber\" (grams).

CORRECT EXAMPLE:
{\"grilled chicken breast\":{\"weight\":200,\"calories\":330,\"protein\":62,\"carbs\":0,\"fats\":7,\"fiber\":0},\"cooked white rice\":{\"weight\":150,\"calories\":195,\"protein\":4,\"carbs\":42,\"fats\":0.4,\"fiber\":0.6}}

Now analyze this image:";

#[derive(Debug, Error)]
pub enum GatewayError {
    /// The backend answered with a non-2xx status; body text retained.
    #[error("inference backend returned HTTP {status}: {body}")]
    Transport { status: u16, body: String },

    /// 2xx answer without the expected response text.
    #[error("inference backend returned an empty response")]
    EmptyResponse,

    /// The request never produced a response (connection, timeout).
    #[error("could not reach inference backend: {0}")]
    Network(#[from] reqwest::Error),
}

impl GatewayError {
    /// Local inference servers are often transiently warming up, so
    /// connection failures, timeouts and 5xx are worth another attempt.
    fn is_retryable(&self) -> bool {
        match self {
            GatewayError::Transport { status, .. } => *status >= 500,
            GatewayError::Network(e) => e.is_connect() || e.is_timeout(),
            GatewayError::EmptyResponse => false,
        }
    }
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    images: Vec<&'a str>,
    format: &'a str,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    response: Option<String>,
}

/// HTTP gateway to the generative vision backend.
///
/// Stateless; returns the backend's text verbatim. Turning that text into
/// a `FoodAnalysis` is the parser's job, so the same gateway can serve
/// other prompt/parse strategies.
pub struct OllamaService {
    client: reqwest::Client,
    url: String,
    retries: u32,
}

impl OllamaService {
    pub fn new(
        url: impl Into<String>,
        timeout: Duration,
        retries: u32,
    ) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
            retries,
        })
    }

    /// The backend expects bare base64; browser captures arrive as
    /// `data:image/...;base64,` URIs.
    pub fn strip_data_uri(image: &str) -> &str {
        if image.starts_with("data:image/") {
            if let Some(pos) = image.find(";base64,") {
                return &image[pos + ";base64,".len()..];
            }
        }
        image
    }

    /// Submit one base64-encoded image plus the instruction prompt and
    /// return the backend's raw answer text.
    pub async fn analyze(
        &self,
        image_base64: &str,
        prompt: &str,
        model: &str,
    ) -> Result<String, GatewayError> {
        let image = Self::strip_data_uri(image_base64);
        let request = GenerateRequest {
            model,
            prompt,
            images: vec![image],
            format: "json",
            stream: false,
        };

        let mut attempt = 0;
        loop {
            log::debug!(
                "sending image to {} (model: {}, attempt {}/{})",
                self.url,
                model,
                attempt + 1,
                self.retries + 1
            );

            match self.send_once(&request).await {
                Ok(text) => return Ok(text),
                Err(e) if attempt < self.retries && e.is_retryable() => {
                    let backoff = Duration::from_millis(250 * 2u64.pow(attempt));
                    log::warn!("inference attempt failed ({}), retrying in {:?}", e, backoff);
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Convenience for callers holding a raw image buffer.
    pub async fn analyze_bytes(
        &self,
        image: &[u8],
        prompt: &str,
        model: &str,
    ) -> Result<String, GatewayError> {
        let encoded = general_purpose::STANDARD.encode(image);
        self.analyze(&encoded, prompt, model).await
    }

    async fn send_once(&self, request: &GenerateRequest<'_>) -> Result<String, GatewayError> {
        let response = self
            .client
            .post(self.url.as_str())
            .json(request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            log::error!("inference backend error ({}): {}", status, body);
            return Err(GatewayError::Transport {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: GenerateResponse = response.json().await?;
        match parsed.response {
            Some(text) if !text.trim().is_empty() => {
                log::debug!("received {} bytes of response text", text.len());
                Ok(text)
            }
            _ => Err(GatewayError::EmptyResponse),
        }
    }
}
