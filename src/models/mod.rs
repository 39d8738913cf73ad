use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// One ingredient's estimated contribution to the meal.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct NutrientRecord {
    pub weight: f64,   // grams
    pub calories: f64, // kcal
    pub protein: f64,  // grams
    pub carbs: f64,    // grams
    pub fats: f64,     // grams
    pub fiber: f64,    // grams
}

impl NutrientRecord {
    /// All six fields must be finite and non-negative.
    pub fn validate(&self) -> Result<(), String> {
        let fields = [
            ("weight", self.weight),
            ("calories", self.calories),
            ("protein", self.protein),
            ("carbs", self.carbs),
            ("fats", self.fats),
            ("fiber", self.fiber),
        ];
        for (name, value) in fields {
            if !value.is_finite() {
                return Err(format!("field '{}' is not a finite number", name));
            }
            if value < 0.0 {
                return Err(format!("field '{}' is negative ({})", name, value));
            }
        }
        Ok(())
    }

    pub fn add(&self, other: &NutrientRecord) -> NutrientRecord {
        NutrientRecord {
            weight: self.weight + other.weight,
            calories: self.calories + other.calories,
            protein: self.protein + other.protein,
            carbs: self.carbs + other.carbs,
            fats: self.fats + other.fats,
            fiber: self.fiber + other.fiber,
        }
    }
}

impl std::iter::Sum for NutrientRecord {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(NutrientRecord::default(), |acc, r| acc.add(&r))
    }
}

/// Per-meal totals, recomputed from a `FoodAnalysis` whenever it is shown.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct NutritionTotals {
    pub weight: f64,
    pub calories: f64,
    pub protein: f64,
    pub carbs: f64,
    pub fats: f64,
    pub fiber: f64,
}

/// Ingredient name → nutrient record, in the model's reporting order.
///
/// Serializes as a JSON object. Keys are unique within one analysis and
/// insertion order is preserved for display.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FoodAnalysis {
    entries: Vec<(String, NutrientRecord)>,
}

impl FoodAnalysis {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&NutrientRecord> {
        self.entries.iter().find(|(n, _)| n == name).map(|(_, r)| r)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &NutrientRecord)> {
        self.entries.iter().map(|(n, r)| (n.as_str(), r))
    }

    /// Append an ingredient. Returns false (and inserts nothing) when the
    /// name is empty or already present.
    pub fn insert(&mut self, name: impl Into<String>, record: NutrientRecord) -> bool {
        let name = name.into();
        if name.trim().is_empty() || self.get(&name).is_some() {
            return false;
        }
        self.entries.push((name, record));
        true
    }

    /// Sum every field over all records; all zeros for an empty analysis.
    pub fn aggregate(&self) -> NutritionTotals {
        let sum: NutrientRecord = self.entries.iter().map(|(_, r)| *r).sum();
        NutritionTotals {
            weight: sum.weight,
            calories: sum.calories,
            protein: sum.protein,
            carbs: sum.carbs,
            fats: sum.fats,
            fiber: sum.fiber,
        }
    }
}

impl Serialize for FoodAnalysis {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (name, record) in &self.entries {
            map.serialize_entry(name, record)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for FoodAnalysis {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct AnalysisVisitor;

        impl<'de> Visitor<'de> for AnalysisVisitor {
            type Value = FoodAnalysis;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a JSON object mapping ingredient names to nutrient records")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
                let mut analysis = FoodAnalysis::new();
                while let Some((name, record)) = map.next_entry::<String, NutrientRecord>()? {
                    if !analysis.insert(name.clone(), record) {
                        return Err(serde::de::Error::custom(format!(
                            "empty or duplicate ingredient name '{}'",
                            name
                        )));
                    }
                }
                Ok(analysis)
            }
        }

        deserializer.deserialize_map(AnalysisVisitor)
    }
}

/// Result of one analysis attempt; created per capture, never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AnalysisOutcome {
    /// Parsing succeeded.
    Success { data: FoodAnalysis, raw_text: String },
    /// The backend answered but the text could not be interpreted;
    /// raw text is kept for fallback display.
    PartialFailure { raw_text: String, parse_error: String },
    /// The backend call itself produced nothing usable.
    Failure { error: String },
}

/// A single ranked label from the in-process classifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FoodPrediction {
    pub label: String,
    pub probability: f64, // in [0, 1]
}

/// Ranked classifier output, most confident first. Coarser than a
/// `FoodAnalysis` (one label per food, no per-ingredient macros) and
/// never merged with it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationResult {
    pub predictions: Vec<FoodPrediction>,
}

impl ClassificationResult {
    pub fn top_prediction(&self) -> Option<&str> {
        self.predictions.first().map(|p| p.label.as_str())
    }

    pub fn confidence(&self) -> Option<f64> {
        self.predictions.first().map(|p| p.probability)
    }
}

/// What one shutter press produced, whichever path handled it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureOutcome {
    Analysis(AnalysisOutcome),
    Classification(ClassificationResult),
}
