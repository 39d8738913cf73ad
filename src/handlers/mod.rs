pub mod capture;

pub use capture::{AnalysisPath, CaptureSession};
