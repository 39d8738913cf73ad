use anyhow::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

use crate::models::{AnalysisOutcome, CaptureOutcome};
use crate::services::camera::{CameraConstraints, CameraSource, CameraStream};
use crate::services::classifier::{ClassifierBackend, FoodClassifier};
use crate::services::ollama::{GatewayError, OllamaService, NUTRITION_PROMPT};
use crate::services::parser;

/// Cancellation token handed to capture tasks and checked at each
/// resumption point before shared state is touched.
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Which analysis backend this session dispatches captures to. Exactly one
/// path per session, selected by configuration.
pub enum AnalysisPath {
    /// Vision-language model over HTTP, answer parsed into a FoodAnalysis.
    Remote {
        gateway: Arc<OllamaService>,
        model: String,
    },
    /// In-process classifier; loaded during mount, gates the shutter.
    OnDevice {
        classifier: Arc<FoodClassifier>,
        backend: Arc<dyn ClassifierBackend>,
        labels_json: String,
        top_k: usize,
    },
}

/// Map the gateway's answer (or failure) to a presentable outcome. Parse
/// failures keep the raw text so the user always sees some result.
pub fn outcome_from_gateway(result: Result<String, GatewayError>) -> AnalysisOutcome {
    match result {
        Ok(raw) => match parser::parse(&raw) {
            Ok(data) => AnalysisOutcome::Success { data, raw_text: raw },
            Err(e) => AnalysisOutcome::PartialFailure {
                raw_text: e.raw_text().to_string(),
                parse_error: e.message().to_string(),
            },
        },
        Err(e) => AnalysisOutcome::Failure { error: e.to_string() },
    }
}

struct InFlightGuard<'a>(&'a AtomicBool);

impl<'a> InFlightGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Coordinates the camera lifecycle and dispatches each shutter press to
/// exactly one analysis path.
///
/// Camera acquisition and model loading run concurrently on mount; the
/// shutter stays blocked until both sides report ready. At most one
/// analysis is in flight per session, and an outcome is only published
/// when the session has not been torn down in the meantime.
pub struct CaptureSession {
    camera: Arc<dyn CameraSource>,
    constraints: CameraConstraints,
    path: AnalysisPath,
    cancel: CancelToken,
    stream: RwLock<Option<Box<dyn CameraStream>>>,
    outcome: RwLock<Option<CaptureOutcome>>,
    in_flight: AtomicBool,
    trace: Mutex<Vec<String>>,
}

impl CaptureSession {
    pub fn new(camera: Arc<dyn CameraSource>, path: AnalysisPath) -> Self {
        Self {
            camera,
            constraints: CameraConstraints::default(),
            path,
            cancel: CancelToken::new(),
            stream: RwLock::new(None),
            outcome: RwLock::new(None),
            in_flight: AtomicBool::new(false),
            trace: Mutex::new(Vec::new()),
        }
    }

    pub fn with_constraints(mut self, constraints: CameraConstraints) -> Self {
        self.constraints = constraints;
        self
    }

    /// Acquire the camera and, on the on-device path, start the model
    /// load; the two proceed concurrently and independently.
    pub async fn mount(&self) -> Result<()> {
        if self.stream.read().await.is_some() {
            return Ok(());
        }

        self.push_trace("Requesting camera access...").await;
        let (acquired, _) = tokio::join!(
            self.camera.acquire(self.constraints),
            self.prepare_model()
        );

        let stream = match acquired {
            Ok(stream) => stream,
            Err(e) => {
                self.push_trace(&format!("Camera error: {}", e)).await;
                return Err(e.into());
            }
        };

        // Torn down while the permission prompt was open: release the
        // hardware instead of keeping a stream nobody owns.
        if self.cancel.is_cancelled() {
            stream.stop().await;
            anyhow::bail!("capture view was torn down during camera init");
        }

        self.push_trace("Camera access granted").await;
        *self.stream.write().await = Some(stream);
        Ok(())
    }

    async fn prepare_model(&self) {
        if let AnalysisPath::OnDevice {
            classifier,
            backend,
            labels_json,
            ..
        } = &self.path
        {
            if let Err(e) = classifier.load(backend.clone(), labels_json).await {
                // Shutter stays blocked; the error is already remembered
                // by the classifier and surfaced on demand.
                log::error!("classifier load failed: {}", e);
            }
        }
    }

    pub async fn is_mounted(&self) -> bool {
        match self.stream.read().await.as_ref() {
            Some(stream) => stream.is_live().await,
            None => false,
        }
    }

    /// Gates the shutter: the camera must be live and, on the on-device
    /// path, the model must have finished loading.
    pub async fn ready_to_capture(&self) -> bool {
        if !self.is_mounted().await {
            return false;
        }
        match &self.path {
            AnalysisPath::Remote { .. } => true,
            AnalysisPath::OnDevice { classifier, .. } => classifier.is_ready().await,
        }
    }

    /// Freeze one frame and run it through the configured analysis path.
    ///
    /// Returns `Ok(None)` when the session was torn down while the
    /// analysis was in flight; in that case nothing is published.
    pub async fn capture(&self) -> Result<Option<CaptureOutcome>> {
        let _guard = InFlightGuard::acquire(&self.in_flight)
            .ok_or_else(|| anyhow::anyhow!("an analysis is already in flight"))?;

        if !self.ready_to_capture().await {
            anyhow::bail!("capture is not ready (camera or model still initializing)");
        }

        let frame = {
            let stream = self.stream.read().await;
            let stream = stream
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("camera is not mounted"))?;
            stream.capture_frame().await?
        };
        self.push_trace(&format!(
            "Photo captured ({} bytes, {}x{})",
            frame.data.len(),
            frame.width,
            frame.height
        ))
        .await;

        let token = self.cancel.clone();
        let outcome = match &self.path {
            AnalysisPath::Remote { gateway, model } => {
                let result = gateway
                    .analyze_bytes(&frame.data, NUTRITION_PROMPT, model)
                    .await;
                CaptureOutcome::Analysis(outcome_from_gateway(result))
            }
            AnalysisPath::OnDevice {
                classifier, top_k, ..
            } => CaptureOutcome::Classification(classifier.classify(&frame, *top_k).await?),
        };

        // The view may have been unmounted while inference ran; publishing
        // now would mutate state after teardown.
        if token.is_cancelled() {
            self.push_trace("Analysis finished after teardown, discarded").await;
            return Ok(None);
        }

        *self.outcome.write().await = Some(outcome.clone());
        Ok(Some(outcome))
    }

    pub async fn outcome(&self) -> Option<CaptureOutcome> {
        self.outcome.read().await.clone()
    }

    /// Discard the current outcome and go back to live capture. The
    /// camera stream is kept; no re-acquisition happens.
    pub async fn retry(&self) {
        self.outcome.write().await.take();
        self.push_trace("Outcome discarded, back to live capture").await;
    }

    /// Tear the session down: cancel in-flight work and stop all media
    /// tracks. Safe to call more than once.
    pub async fn unmount(&self) {
        self.cancel.cancel();
        if let Some(stream) = self.stream.write().await.take() {
            stream.stop().await;
            self.push_trace("Camera tracks stopped").await;
        }
    }

    /// Timestamped session events, oldest first.
    pub async fn debug_trace(&self) -> Vec<String> {
        self.trace.lock().await.clone()
    }

    async fn push_trace(&self, message: &str) {
        log::debug!("{}", message);
        let line = format!("{}: {}", chrono::Local::now().format("%H:%M:%S"), message);
        self.trace.lock().await.push(line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::camera::{CameraError, DeniedCamera, Frame, StillCamera};
    use std::io::Cursor;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn png_frame() -> Frame {
        let img = image::RgbImage::from_pixel(16, 16, image::Rgb([80, 140, 60]));
        let mut data = Vec::new();
        image::DynamicImage::ImageRgb8(img)
            .write_to(&mut Cursor::new(&mut data), image::ImageFormat::Png)
            .unwrap();
        Frame { width: 16, height: 16, data }
    }

    fn labels() -> &'static str {
        r#"{"apple pie": 0, "pizza": 1, "ramen": 2}"#
    }

    /// Backend double with a configurable inference delay.
    struct SlowBackend {
        scores: Vec<f32>,
        delay: Duration,
    }

    #[async_trait::async_trait]
    impl ClassifierBackend for SlowBackend {
        fn input_size(&self) -> (u32, u32) {
            (8, 8)
        }

        async fn infer(&self, _input: &[f32]) -> Result<Vec<f32>> {
            tokio::time::sleep(self.delay).await;
            Ok(self.scores.clone())
        }
    }

    fn on_device_session(delay: Duration) -> CaptureSession {
        let camera = Arc::new(StillCamera::new(png_frame()));
        CaptureSession::new(
            camera,
            AnalysisPath::OnDevice {
                classifier: Arc::new(FoodClassifier::new()),
                backend: Arc::new(SlowBackend { scores: vec![0.1, 0.7, 0.2], delay }),
                labels_json: labels().to_string(),
                top_k: 3,
            },
        )
    }

    /// Camera double that counts how often its stream was stopped.
    struct CountingCamera {
        stops: Arc<AtomicUsize>,
    }

    struct CountingStream {
        live: AtomicBool,
        stops: Arc<AtomicUsize>,
        frame: Frame,
    }

    #[async_trait::async_trait]
    impl CameraSource for CountingCamera {
        async fn acquire(
            &self,
            _constraints: CameraConstraints,
        ) -> Result<Box<dyn CameraStream>, CameraError> {
            Ok(Box::new(CountingStream {
                live: AtomicBool::new(true),
                stops: self.stops.clone(),
                frame: png_frame(),
            }))
        }
    }

    #[async_trait::async_trait]
    impl CameraStream for CountingStream {
        async fn capture_frame(&self) -> Result<Frame> {
            Ok(self.frame.clone())
        }

        async fn stop(&self) {
            self.live.store(false, Ordering::SeqCst);
            self.stops.fetch_add(1, Ordering::SeqCst);
        }

        async fn is_live(&self) -> bool {
            self.live.load(Ordering::SeqCst)
        }
    }

    #[tokio::test]
    async fn test_on_device_capture_produces_classification() {
        let session = on_device_session(Duration::ZERO);
        session.mount().await.unwrap();
        assert!(session.ready_to_capture().await);

        match session.capture().await.unwrap() {
            Some(CaptureOutcome::Classification(result)) => {
                assert_eq!(result.top_prediction(), Some("pizza"));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert!(session.outcome().await.is_some());
    }

    #[tokio::test]
    async fn test_shutter_blocked_until_model_ready() {
        let camera = Arc::new(StillCamera::new(png_frame()));
        let session = CaptureSession::new(
            camera,
            AnalysisPath::OnDevice {
                classifier: Arc::new(FoodClassifier::new()),
                backend: Arc::new(SlowBackend { scores: vec![], delay: Duration::ZERO }),
                // load will fail, so the model never becomes ready
                labels_json: "not a label table".to_string(),
                top_k: 3,
            },
        );

        session.mount().await.unwrap();
        assert!(session.is_mounted().await);
        assert!(!session.ready_to_capture().await);
        assert!(session.capture().await.is_err());
    }

    #[tokio::test]
    async fn test_only_one_analysis_in_flight() {
        let session = Arc::new(on_device_session(Duration::from_millis(300)));
        session.mount().await.unwrap();

        let background = {
            let session = session.clone();
            tokio::spawn(async move { session.capture().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let err = session.capture().await.unwrap_err();
        assert!(err.to_string().contains("in flight"));

        let first = background.await.unwrap().unwrap();
        assert!(first.is_some());
    }

    #[tokio::test]
    async fn test_unmount_discards_in_flight_outcome() {
        let session = Arc::new(on_device_session(Duration::from_millis(300)));
        session.mount().await.unwrap();

        let background = {
            let session = session.clone();
            tokio::spawn(async move { session.capture().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        session.unmount().await;

        // resolved after teardown: nothing published
        assert!(background.await.unwrap().unwrap().is_none());
        assert!(session.outcome().await.is_none());
    }

    #[tokio::test]
    async fn test_retry_clears_outcome_without_reacquiring() {
        let stops = Arc::new(AtomicUsize::new(0));
        let camera = Arc::new(CountingCamera { stops: stops.clone() });
        let session = CaptureSession::new(
            camera,
            AnalysisPath::OnDevice {
                classifier: Arc::new(FoodClassifier::new()),
                backend: Arc::new(SlowBackend { scores: vec![0.9], delay: Duration::ZERO }),
                labels_json: labels().to_string(),
                top_k: 1,
            },
        );
        session.mount().await.unwrap();

        assert!(session.capture().await.unwrap().is_some());
        session.retry().await;
        assert!(session.outcome().await.is_none());
        // same stream, still live, capture works again
        assert_eq!(stops.load(Ordering::SeqCst), 0);
        assert!(session.capture().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_unmount_stops_tracks_exactly_once() {
        let stops = Arc::new(AtomicUsize::new(0));
        let camera = Arc::new(CountingCamera { stops: stops.clone() });
        let session = CaptureSession::new(
            camera,
            AnalysisPath::OnDevice {
                classifier: Arc::new(FoodClassifier::new()),
                backend: Arc::new(SlowBackend { scores: vec![0.9], delay: Duration::ZERO }),
                labels_json: labels().to_string(),
                top_k: 1,
            },
        );
        session.mount().await.unwrap();
        assert!(session.is_mounted().await);

        session.unmount().await;
        session.unmount().await;
        assert_eq!(stops.load(Ordering::SeqCst), 1);
        assert!(!session.is_mounted().await);
    }

    /// Camera double that remembers the constraints it was asked for.
    struct RecordingCamera {
        seen: Arc<Mutex<Option<CameraConstraints>>>,
    }

    #[async_trait::async_trait]
    impl CameraSource for RecordingCamera {
        async fn acquire(
            &self,
            constraints: CameraConstraints,
        ) -> Result<Box<dyn CameraStream>, CameraError> {
            *self.seen.lock().await = Some(constraints);
            StillCamera::new(png_frame()).acquire(constraints).await
        }
    }

    #[tokio::test]
    async fn test_custom_constraints_reach_the_camera() {
        let seen = Arc::new(Mutex::new(None));
        let camera = Arc::new(RecordingCamera { seen: seen.clone() });
        let wanted = CameraConstraints {
            rear_facing: false,
            ideal_width: 640,
            ideal_height: 480,
        };
        let session = CaptureSession::new(
            camera,
            AnalysisPath::OnDevice {
                classifier: Arc::new(FoodClassifier::new()),
                backend: Arc::new(SlowBackend { scores: vec![0.9], delay: Duration::ZERO }),
                labels_json: labels().to_string(),
                top_k: 1,
            },
        )
        .with_constraints(wanted);

        session.mount().await.unwrap();
        assert_eq!(*seen.lock().await, Some(wanted));
    }

    #[tokio::test]
    async fn test_mount_surfaces_distinct_camera_errors() {
        let session = CaptureSession::new(
            Arc::new(DeniedCamera { error: CameraError::PermissionDenied }),
            AnalysisPath::OnDevice {
                classifier: Arc::new(FoodClassifier::new()),
                backend: Arc::new(SlowBackend { scores: vec![], delay: Duration::ZERO }),
                labels_json: labels().to_string(),
                top_k: 3,
            },
        );

        let err = session.mount().await.unwrap_err();
        assert!(err.to_string().contains("permissions"));
        assert!(!session.is_mounted().await);
    }

    #[test]
    fn test_gateway_outcome_mapping() {
        let raw = r#"{"chicken": {"weight":200,"calories":330,"protein":62,"carbs":0,"fats":7,"fiber":0}}"#;
        match outcome_from_gateway(Ok(raw.to_string())) {
            AnalysisOutcome::Success { data, raw_text } => {
                assert_eq!(data.len(), 1);
                assert_eq!(raw_text, raw);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }

        match outcome_from_gateway(Ok("the meal looks tasty".to_string())) {
            AnalysisOutcome::PartialFailure { raw_text, parse_error } => {
                assert_eq!(raw_text, "the meal looks tasty");
                assert!(!parse_error.is_empty());
            }
            other => panic!("unexpected outcome: {:?}", other),
        }

        match outcome_from_gateway(Err(GatewayError::Transport {
            status: 500,
            body: "server error".to_string(),
        })) {
            AnalysisOutcome::Failure { error } => {
                assert!(error.contains("500"));
                assert!(error.contains("server error"));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_debug_trace_records_lifecycle() {
        let session = on_device_session(Duration::ZERO);
        session.mount().await.unwrap();
        session.capture().await.unwrap();
        session.unmount().await;

        let trace = session.debug_trace().await;
        assert!(trace.iter().any(|l| l.contains("Camera access granted")));
        assert!(trace.iter().any(|l| l.contains("Photo captured")));
        assert!(trace.iter().any(|l| l.contains("Camera tracks stopped")));
    }
}
