use thiserror::Error;

use crate::models::FoodAnalysis;

/// The backend text could not be interpreted as a valid analysis.
///
/// Always carries the original text untouched so callers can show it as a
/// fallback result.
#[derive(Debug, Clone, Error)]
#[error("could not parse model response: {message}")]
pub struct ParseError {
    message: String,
    raw_text: String,
}

impl ParseError {
    pub fn message(&self) -> &str {
        &self.message
    }

    /// The backend's response exactly as received.
    pub fn raw_text(&self) -> &str {
        &self.raw_text
    }
}

/// Parse the inference backend's raw text into a `FoodAnalysis`.
///
/// The backend is instructed to answer with a strict JSON object but may
/// not comply. Anything that is not an object of well-formed nutrient
/// records is a `ParseError`; an empty object is a valid empty analysis.
/// Retries, if any, belong to the gateway, not here.
pub fn parse(raw_text: &str) -> Result<FoodAnalysis, ParseError> {
    let analysis: FoodAnalysis = serde_json::from_str(raw_text).map_err(|e| ParseError {
        message: e.to_string(),
        raw_text: raw_text.to_string(),
    })?;

    // Shape checks the decoder can't express: reject negative or
    // non-finite values so they never reach aggregation.
    for (name, record) in analysis.iter() {
        if let Err(reason) = record.validate() {
            return Err(ParseError {
                message: format!("ingredient '{}': {}", name, reason),
                raw_text: raw_text.to_string(),
            });
        }
    }

    Ok(analysis)
}
