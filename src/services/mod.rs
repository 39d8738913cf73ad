pub mod camera;
pub mod classifier;
pub mod ollama; // local vision-language backend over HTTP
pub mod parser;

pub use camera::StillCamera;
pub use classifier::{FoodClassifier, MockClassifierBackend};
pub use ollama::{OllamaService, DEFAULT_OLLAMA_URL};
