use std::env;
use std::fmt;
use std::thread;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, Rgba, RgbaImage};
use reqwest::blocking::Client as HttpClient;
use serde_json::{json, Value};
use thiserror::Error;
use veriscript_contracts::events::{EventPayload, EventWriter};
use veriscript_contracts::report::{assemble_report, AnalysisReport, RawAnalysis};
use veriscript_contracts::schema::{response_schema, ANALYSIS_INSTRUCTIONS};

pub const DEFAULT_MODEL: &str = "gemini-3-pro-preview";
pub const DEFAULT_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const DEFAULT_THINKING_BUDGET: u32 = 32768;

/// Which of the two specimens an error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpecimenRole {
    Reference,
    Questioned,
}

impl fmt::Display for SpecimenRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpecimenRole::Reference => write!(f, "reference"),
            SpecimenRole::Questioned => write!(f, "questioned"),
        }
    }
}

/// Terminal failures of one pipeline invocation. Nothing here is
/// recoverable in place; transient engine failures are retried internally
/// and only surface as `ExhaustedRetries`.
#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("no reasoning engine credential is configured")]
    MissingCredential,
    #[error("could not decode the {role} specimen: {detail}")]
    UnreadableImage { role: SpecimenRole, detail: String },
    #[error("reasoning engine still failing after {attempts} attempts")]
    ExhaustedRetries {
        attempts: usize,
        #[source]
        last: EngineCallError,
    },
    #[error("reasoning engine rejected the request (status {status}): {detail}")]
    NonRetryableEngineFailure { status: u16, detail: String },
    #[error("reasoning engine returned an empty report")]
    EmptyReport,
    #[error("report payload failed validation: {detail}")]
    MalformedReport { detail: String },
}

impl AnalysisError {
    pub fn kind(&self) -> &'static str {
        match self {
            AnalysisError::MissingCredential => "missing_credential",
            AnalysisError::UnreadableImage { .. } => "unreadable_image",
            AnalysisError::ExhaustedRetries { .. } => "exhausted_retries",
            AnalysisError::NonRetryableEngineFailure { .. } => "non_retryable_engine_failure",
            AnalysisError::EmptyReport => "empty_report",
            AnalysisError::MalformedReport { .. } => "malformed_report",
        }
    }
}

/// One failed engine attempt, before retry classification.
#[derive(Debug, Error)]
pub enum EngineCallError {
    #[error("engine returned status {status}: {detail}")]
    Http { status: u16, detail: String },
    #[error("engine transport failure: {detail}")]
    Transport { detail: String },
    #[error("engine response envelope was not valid JSON: {detail}")]
    Envelope { detail: String },
}

impl EngineCallError {
    /// Transient means worth retrying: rate limiting, server-side 5xx, or
    /// a connect/timeout-class transport failure.
    pub fn is_transient(&self) -> bool {
        match self {
            EngineCallError::Http { status, .. } => {
                *status == 429 || (500..=599).contains(status)
            }
            EngineCallError::Transport { .. } => true,
            EngineCallError::Envelope { .. } => false,
        }
    }
}

/// Bounded, compressed encoding of one specimen, consumed only by the
/// reasoning client within a single pipeline run.
#[derive(Debug, Clone)]
pub struct TransportImage {
    pub bytes: Vec<u8>,
    pub mime_type: &'static str,
    pub width: u32,
    pub height: u32,
}

impl TransportImage {
    fn inline_part(&self) -> Value {
        json!({
            "inlineData": {
                "mimeType": self.mime_type,
                "data": BASE64.encode(&self.bytes),
            }
        })
    }
}

#[derive(Debug, Clone)]
pub struct NormalizeOptions {
    pub max_dimension: u32,
    pub jpeg_quality: u8,
}

impl Default for NormalizeOptions {
    fn default() -> Self {
        Self {
            max_dimension: 1024,
            jpeg_quality: 70,
        }
    }
}

impl NormalizeOptions {
    /// Higher-quality encoding for thoroughness-sensitive runs.
    pub fn thorough() -> Self {
        Self {
            jpeg_quality: 80,
            ..Self::default()
        }
    }
}

/// Decodes an arbitrary raster specimen and produces a transport-ready
/// JPEG: alpha flattened onto white, larger side clamped to the bound
/// (never upscaled), re-encoded at the configured quality.
pub fn normalize_specimen(
    bytes: &[u8],
    role: SpecimenRole,
    options: &NormalizeOptions,
) -> Result<TransportImage, AnalysisError> {
    let decoded = image::load_from_memory(bytes).map_err(|err| AnalysisError::UnreadableImage {
        role,
        detail: err.to_string(),
    })?;
    let flattened = flatten_alpha(decoded);
    let bounded = if flattened.width().max(flattened.height()) > options.max_dimension {
        flattened.resize(
            options.max_dimension,
            options.max_dimension,
            FilterType::Triangle,
        )
    } else {
        flattened
    };
    let rgb = bounded.to_rgb8();
    let (width, height) = rgb.dimensions();
    let mut encoded = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut encoded, options.jpeg_quality);
    encoder
        .encode_image(&DynamicImage::ImageRgb8(rgb))
        .map_err(|err| AnalysisError::UnreadableImage {
            role,
            detail: format!("jpeg encode failed: {err}"),
        })?;
    Ok(TransportImage {
        bytes: encoded,
        mime_type: "image/jpeg",
        width,
        height,
    })
}

fn flatten_alpha(image: DynamicImage) -> DynamicImage {
    if !image.color().has_alpha() {
        return image;
    }
    let rgba = image.to_rgba8();
    let mut flattened = RgbaImage::new(rgba.width(), rgba.height());
    for (x, y, pixel) in rgba.enumerate_pixels() {
        let alpha = u16::from(pixel[3]);
        let blend = |channel: u8| -> u8 {
            (((u16::from(channel) * alpha) + (255 * (255 - alpha))) / 255) as u8
        };
        flattened.put_pixel(
            x,
            y,
            Rgba([blend(pixel[0]), blend(pixel[1]), blend(pixel[2]), 255]),
        );
    }
    DynamicImage::ImageRgba8(flattened)
}

/// One request to the external reasoning engine: the fixed instruction
/// block plus both transport images.
#[derive(Debug)]
pub struct EngineRequest<'a> {
    pub instructions: &'static str,
    pub reference: &'a TransportImage,
    pub questioned: &'a TransportImage,
    pub model: &'a str,
    pub thinking_budget: u32,
}

#[derive(Debug, Clone)]
pub struct EngineResponse {
    pub text: String,
}

/// Seam between the retrying client and a concrete engine backend.
pub trait ReasoningEngine: Send + Sync {
    fn name(&self) -> &str;

    /// Fail fast, before any network attempt, when the backend has no
    /// usable credential.
    fn check_credential(&self) -> Result<(), AnalysisError> {
        Ok(())
    }

    fn generate(&self, request: &EngineRequest<'_>) -> Result<EngineResponse, EngineCallError>;
}

#[derive(Debug, Clone)]
pub struct GeminiConfig {
    pub api_key: Option<String>,
    pub api_base: String,
    pub request_timeout: Duration,
}

impl Default for GeminiConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            api_base: DEFAULT_API_BASE.to_string(),
            request_timeout: Duration::from_secs(90),
        }
    }
}

impl GeminiConfig {
    pub fn from_env() -> Self {
        Self {
            api_key: non_empty_env("GEMINI_API_KEY").or_else(|| non_empty_env("GOOGLE_API_KEY")),
            api_base: non_empty_env("GEMINI_API_BASE")
                .map(|value| value.trim_end_matches('/').to_string())
                .unwrap_or_else(|| DEFAULT_API_BASE.to_string()),
            ..Self::default()
        }
    }
}

pub struct GeminiEngine {
    config: GeminiConfig,
    http: HttpClient,
}

impl GeminiEngine {
    pub fn new(config: GeminiConfig) -> Self {
        Self {
            config,
            http: HttpClient::new(),
        }
    }

    pub fn from_env() -> Self {
        Self::new(GeminiConfig::from_env())
    }

    fn endpoint_for_model(&self, model: &str) -> String {
        let trimmed = model.trim();
        let model_path = if trimmed.starts_with("models/") {
            trimmed.to_string()
        } else {
            format!("models/{trimmed}")
        };
        format!("{}/{}:generateContent", self.config.api_base, model_path)
    }

    fn build_payload(request: &EngineRequest<'_>) -> Value {
        json!({
            "contents": [{
                "role": "user",
                "parts": [
                    { "text": request.instructions },
                    request.reference.inline_part(),
                    request.questioned.inline_part(),
                ],
            }],
            "generationConfig": {
                "responseMimeType": "application/json",
                "responseSchema": response_schema(),
                "thinkingConfig": { "thinkingBudget": request.thinking_budget },
            },
        })
    }
}

impl ReasoningEngine for GeminiEngine {
    fn name(&self) -> &str {
        "gemini"
    }

    fn check_credential(&self) -> Result<(), AnalysisError> {
        if self.config.api_key.is_none() {
            return Err(AnalysisError::MissingCredential);
        }
        Ok(())
    }

    fn generate(&self, request: &EngineRequest<'_>) -> Result<EngineResponse, EngineCallError> {
        let Some(api_key) = self.config.api_key.as_deref() else {
            return Err(EngineCallError::Http {
                status: 401,
                detail: "no API key configured".to_string(),
            });
        };
        let endpoint = self.endpoint_for_model(request.model);
        let payload = Self::build_payload(request);

        let response = self
            .http
            .post(&endpoint)
            .query(&[("key", api_key)])
            .timeout(self.config.request_timeout)
            .json(&payload)
            .send()
            .map_err(|err| EngineCallError::Transport {
                detail: err.to_string(),
            })?;
        let status = response.status();
        let body = response.text().map_err(|err| EngineCallError::Transport {
            detail: format!("response body read failed: {err}"),
        })?;
        if !status.is_success() {
            return Err(EngineCallError::Http {
                status: status.as_u16(),
                detail: truncate_text(&body, 512),
            });
        }
        let envelope: Value =
            serde_json::from_str(&body).map_err(|err| EngineCallError::Envelope {
                detail: err.to_string(),
            })?;
        Ok(EngineResponse {
            text: extract_candidate_text(&envelope),
        })
    }
}

/// Concatenated text parts from every candidate in a `generateContent`
/// envelope.
fn extract_candidate_text(envelope: &Value) -> String {
    let mut out = String::new();
    let candidates = envelope
        .get("candidates")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    for candidate in candidates {
        let parts = candidate
            .get("content")
            .and_then(Value::as_object)
            .and_then(|content| content.get("parts"))
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        for part in parts {
            if let Some(text) = part.get("text").and_then(Value::as_str) {
                out.push_str(text);
            }
        }
    }
    out
}

/// Offline engine that emits a deterministic, schema-conformant payload.
/// Lets the CLI and tests exercise the full pipeline with no credential
/// and no network.
pub struct DryrunEngine;

impl ReasoningEngine for DryrunEngine {
    fn name(&self) -> &str {
        "dryrun"
    }

    fn generate(&self, request: &EngineRequest<'_>) -> Result<EngineResponse, EngineCallError> {
        let payload = json!({
            "isForgery": false,
            "confidence": 72.0,
            "summary": format!(
                "Dry run: no material divergence found between the {}x{} reference and the {}x{} questioned specimen.",
                request.reference.width,
                request.reference.height,
                request.questioned.width,
                request.questioned.height,
            ),
            "reasoning": [
                "Stroke rhythm is consistent across both specimens.",
                "No patching or retouching artifacts detected.",
            ],
            "comparisons": {
                "slant": "Slant angles agree within measurement tolerance.",
                "pressure": "Pressure modulation follows the same pattern.",
                "formation": "Letterforms are constructed identically.",
                "connectivity": "Inter-letter connections are equally fluid.",
                "flow": "Overall flow is unbroken in both specimens.",
                "terminations": "Stroke endings taper the same way.",
            },
            "evidenceMarkers": [
                {
                    "type": "habit",
                    "subType": "terminal-flick",
                    "description": "Recurring terminal flick present in both specimens.",
                    "confidence": 64.0,
                    "box_2d": [420.0, 180.0, 520.0, 430.0],
                }
            ],
        });
        Ok(EngineResponse {
            text: payload.to_string(),
        })
    }
}

/// Sequential retry schedule for transient engine failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Additional attempts after the first, so 2 means 3 total.
    pub max_retries: usize,
    pub initial_delay: Duration,
    pub backoff_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_delay: Duration::from_millis(500),
            backoff_factor: 1.5,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub model: String,
    pub thinking_budget: u32,
    pub retry: RetryPolicy,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            thinking_budget: DEFAULT_THINKING_BUDGET,
            retry: RetryPolicy::default(),
        }
    }
}

/// Obtains a validated raw analysis from a reasoning engine, enforcing
/// the retry policy. Stateless between calls; retries are sequential,
/// never parallel.
pub struct ReasoningClient {
    engine: Box<dyn ReasoningEngine>,
    options: ClientOptions,
    events: Option<EventWriter>,
}

impl ReasoningClient {
    pub fn new(engine: Box<dyn ReasoningEngine>, options: ClientOptions) -> Self {
        Self {
            engine,
            options,
            events: None,
        }
    }

    pub fn with_events(mut self, events: EventWriter) -> Self {
        self.events = Some(events);
        self
    }

    pub fn engine_name(&self) -> &str {
        self.engine.name()
    }

    pub fn model(&self) -> &str {
        &self.options.model
    }

    pub fn analyze(
        &self,
        reference: &TransportImage,
        questioned: &TransportImage,
    ) -> Result<RawAnalysis, AnalysisError> {
        self.engine.check_credential()?;
        let request = EngineRequest {
            instructions: ANALYSIS_INSTRUCTIONS,
            reference,
            questioned,
            model: &self.options.model,
            thinking_budget: self.options.thinking_budget,
        };
        let response = self.call_with_retries(&request)?;
        let text = response.text.trim();
        if text.is_empty() {
            return Err(AnalysisError::EmptyReport);
        }
        let raw: RawAnalysis =
            serde_json::from_str(text).map_err(|err| AnalysisError::MalformedReport {
                detail: err.to_string(),
            })?;
        raw.validate().map_err(|err| AnalysisError::MalformedReport {
            detail: err.to_string(),
        })?;
        Ok(raw)
    }

    fn call_with_retries(
        &self,
        request: &EngineRequest<'_>,
    ) -> Result<EngineResponse, AnalysisError> {
        let retry = &self.options.retry;
        let mut delay = retry.initial_delay;
        for attempt in 0..=retry.max_retries {
            match self.engine.generate(request) {
                Ok(response) => return Ok(response),
                Err(err) => {
                    if !err.is_transient() {
                        return Err(match err {
                            EngineCallError::Http { status, detail } => {
                                AnalysisError::NonRetryableEngineFailure { status, detail }
                            }
                            EngineCallError::Envelope { detail } => {
                                AnalysisError::MalformedReport { detail }
                            }
                            EngineCallError::Transport { .. } => {
                                unreachable!("transport failures classify as transient")
                            }
                        });
                    }
                    if attempt >= retry.max_retries {
                        return Err(AnalysisError::ExhaustedRetries {
                            attempts: attempt + 1,
                            last: err,
                        });
                    }
                    if let Some(events) = &self.events {
                        let mut payload = EventPayload::new();
                        payload.insert("attempt".to_string(), json!(attempt + 1));
                        payload.insert("delay_ms".to_string(), json!(delay.as_millis() as u64));
                        payload.insert("detail".to_string(), json!(err.to_string()));
                        let _ = events.emit("engine_retry", payload);
                    }
                    thread::sleep(delay);
                    delay = delay.mul_f64(retry.backoff_factor);
                }
            }
        }
        unreachable!("retry loop always returns a response or an error")
    }
}

/// The specimen submission pipeline: normalize both images, run one
/// engine analysis, assemble the report. Holds no mutable state; each
/// `run` is independent of any other.
pub struct AnalysisPipeline {
    client: ReasoningClient,
    normalize: NormalizeOptions,
    events: Option<EventWriter>,
}

impl AnalysisPipeline {
    pub fn new(client: ReasoningClient) -> Self {
        Self {
            client,
            normalize: NormalizeOptions::default(),
            events: None,
        }
    }

    pub fn with_normalize_options(mut self, options: NormalizeOptions) -> Self {
        self.normalize = options;
        self
    }

    pub fn with_events(mut self, events: EventWriter) -> Self {
        self.events = Some(events);
        self
    }

    /// Runs one analysis. Terminal errors are never swallowed and a
    /// partially valid report is never returned.
    pub fn run(
        &self,
        reference: &[u8],
        questioned: &[u8],
    ) -> Result<AnalysisReport, AnalysisError> {
        let mut payload = EventPayload::new();
        payload.insert("engine".to_string(), json!(self.client.engine_name()));
        payload.insert("model".to_string(), json!(self.client.model()));
        self.emit("analysis_started", payload);

        let result = self.run_inner(reference, questioned);
        if let Err(err) = &result {
            let mut payload = EventPayload::new();
            payload.insert("kind".to_string(), json!(err.kind()));
            payload.insert("error".to_string(), json!(err.to_string()));
            self.emit("analysis_failed", payload);
        }
        result
    }

    fn run_inner(
        &self,
        reference: &[u8],
        questioned: &[u8],
    ) -> Result<AnalysisReport, AnalysisError> {
        let (reference_image, questioned_image) = self.normalize_pair(reference, questioned)?;

        let mut payload = EventPayload::new();
        payload.insert("reference".to_string(), specimen_summary(&reference_image));
        payload.insert("questioned".to_string(), specimen_summary(&questioned_image));
        self.emit("specimens_normalized", payload);

        let raw = self.client.analyze(&reference_image, &questioned_image)?;
        let report = assemble_report(raw);

        let mut payload = EventPayload::new();
        payload.insert("report_id".to_string(), json!(report.id));
        payload.insert("is_forgery".to_string(), json!(report.is_forgery));
        payload.insert("confidence".to_string(), json!(report.confidence));
        payload.insert("markers".to_string(), json!(report.evidence_markers.len()));
        self.emit("report_assembled", payload);

        Ok(report)
    }

    /// Normalizes both specimens concurrently and joins. Both tasks run
    /// to completion; on failure the reference error wins, then the
    /// questioned one.
    fn normalize_pair(
        &self,
        reference: &[u8],
        questioned: &[u8],
    ) -> Result<(TransportImage, TransportImage), AnalysisError> {
        let options = &self.normalize;
        thread::scope(|scope| {
            let reference_task =
                scope.spawn(move || normalize_specimen(reference, SpecimenRole::Reference, options));
            let questioned_task = scope
                .spawn(move || normalize_specimen(questioned, SpecimenRole::Questioned, options));
            let reference_image = match reference_task.join() {
                Ok(result) => result,
                Err(panic) => std::panic::resume_unwind(panic),
            };
            let questioned_image = match questioned_task.join() {
                Ok(result) => result,
                Err(panic) => std::panic::resume_unwind(panic),
            };
            Ok((reference_image?, questioned_image?))
        })
    }

    fn emit(&self, event_type: &str, payload: EventPayload) {
        if let Some(events) = &self.events {
            let _ = events.emit(event_type, payload);
        }
    }
}

fn specimen_summary(image: &TransportImage) -> Value {
    json!({
        "width": image.width,
        "height": image.height,
        "bytes": image.bytes.len(),
    })
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::io::Cursor;
    use std::sync::{Arc, Mutex};
    use std::time::Instant;

    use image::{ImageFormat, Rgb, RgbImage};
    use serde_json::json;

    use super::*;

    fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(width, height, Rgb([40, 40, 120])));
        let mut bytes = Vec::new();
        image
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .expect("encode test png");
        bytes
    }

    fn valid_payload_text() -> String {
        json!({
            "isForgery": true,
            "confidence": 91.0,
            "summary": "Tremor concentrated along the baseline.",
            "reasoning": ["Pen lifts mid-stroke.", "Uniform pressure throughout."],
            "comparisons": {
                "slant": "Slant differs by 6 degrees.",
                "pressure": "Questioned pressure is flat.",
                "formation": "Capital R built from three strokes instead of two.",
                "connectivity": "Letter joins break where the reference flows.",
                "flow": "Hesitant rhythm.",
                "terminations": "Blunt stroke endings.",
            },
            "evidenceMarkers": [{
                "type": "tremor",
                "subType": "vertical-shiver",
                "description": "Shaky ascender.",
                "confidence": 88.0,
                "box_2d": [200.0, 100.0, 400.0, 300.0],
            }],
        })
        .to_string()
    }

    fn http_error(status: u16) -> EngineCallError {
        EngineCallError::Http {
            status,
            detail: format!("synthetic status {status}"),
        }
    }

    #[derive(Clone)]
    struct ScriptedEngine {
        inner: Arc<ScriptedInner>,
    }

    struct ScriptedInner {
        calls: Mutex<Vec<Instant>>,
        script: Mutex<VecDeque<Result<EngineResponse, EngineCallError>>>,
    }

    impl ScriptedEngine {
        fn new(script: Vec<Result<EngineResponse, EngineCallError>>) -> Self {
            Self {
                inner: Arc::new(ScriptedInner {
                    calls: Mutex::new(Vec::new()),
                    script: Mutex::new(script.into()),
                }),
            }
        }

        fn ok(text: &str) -> Result<EngineResponse, EngineCallError> {
            Ok(EngineResponse {
                text: text.to_string(),
            })
        }

        fn call_times(&self) -> Vec<Instant> {
            self.inner.calls.lock().unwrap().clone()
        }
    }

    impl ReasoningEngine for ScriptedEngine {
        fn name(&self) -> &str {
            "scripted"
        }

        fn generate(
            &self,
            _request: &EngineRequest<'_>,
        ) -> Result<EngineResponse, EngineCallError> {
            self.inner.calls.lock().unwrap().push(Instant::now());
            self.inner
                .script
                .lock()
                .unwrap()
                .pop_front()
                .expect("scripted engine called past its script")
        }
    }

    fn fast_client(engine: ScriptedEngine) -> ReasoningClient {
        let options = ClientOptions {
            retry: RetryPolicy {
                max_retries: 2,
                initial_delay: Duration::from_millis(20),
                backoff_factor: 2.0,
            },
            ..ClientOptions::default()
        };
        ReasoningClient::new(Box::new(engine), options)
    }

    fn transport_pair() -> (TransportImage, TransportImage) {
        let options = NormalizeOptions::default();
        (
            normalize_specimen(&png_bytes(320, 200), SpecimenRole::Reference, &options).unwrap(),
            normalize_specimen(&png_bytes(300, 220), SpecimenRole::Questioned, &options).unwrap(),
        )
    }

    #[test]
    fn normalization_clamps_the_larger_side_and_keeps_aspect() {
        let transport = normalize_specimen(
            &png_bytes(2048, 1024),
            SpecimenRole::Reference,
            &NormalizeOptions::default(),
        )
        .unwrap();
        assert_eq!(transport.width.max(transport.height), 1024);
        assert_eq!(transport.mime_type, "image/jpeg");

        let decoded = image::load_from_memory(&transport.bytes).unwrap();
        assert_eq!(decoded.width(), transport.width);
        assert_eq!(decoded.height(), transport.height);

        let input_ratio = 2048.0 / 1024.0;
        let output_ratio = transport.width as f64 / transport.height as f64;
        assert!((input_ratio - output_ratio).abs() < 0.01);
    }

    #[test]
    fn normalization_clamps_portrait_inputs_on_height() {
        let transport = normalize_specimen(
            &png_bytes(500, 2000),
            SpecimenRole::Questioned,
            &NormalizeOptions::default(),
        )
        .unwrap();
        assert_eq!(transport.height, 1024);
        assert!(transport.width < 500);
    }

    #[test]
    fn normalization_never_upscales_small_inputs() {
        let transport = normalize_specimen(
            &png_bytes(300, 200),
            SpecimenRole::Reference,
            &NormalizeOptions::default(),
        )
        .unwrap();
        assert_eq!((transport.width, transport.height), (300, 200));
    }

    #[test]
    fn corrupt_bytes_fail_with_unreadable_image() {
        let err = normalize_specimen(
            b"definitely not an image",
            SpecimenRole::Questioned,
            &NormalizeOptions::default(),
        )
        .unwrap_err();
        match err {
            AnalysisError::UnreadableImage { role, .. } => {
                assert_eq!(role, SpecimenRole::Questioned);
            }
            other => panic!("expected UnreadableImage, got {other:?}"),
        }
    }

    #[test]
    fn transparent_pixels_flatten_onto_white() {
        let rgba = RgbaImage::from_pixel(64, 64, Rgba([0, 0, 0, 0]));
        let mut bytes = Vec::new();
        DynamicImage::ImageRgba8(rgba)
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .unwrap();

        let transport =
            normalize_specimen(&bytes, SpecimenRole::Reference, &NormalizeOptions::default())
                .unwrap();
        let decoded = image::load_from_memory(&transport.bytes).unwrap().to_rgb8();
        let pixel = decoded.get_pixel(32, 32);
        assert!(pixel[0] > 240 && pixel[1] > 240 && pixel[2] > 240);
    }

    #[test]
    fn retries_transient_failures_then_succeeds() {
        let engine = ScriptedEngine::new(vec![
            Err(http_error(500)),
            Err(http_error(500)),
            ScriptedEngine::ok(&valid_payload_text()),
        ]);
        let client = fast_client(engine.clone());
        let (reference, questioned) = transport_pair();

        let raw = client.analyze(&reference, &questioned).unwrap();
        assert!(raw.is_forgery);

        let calls = engine.call_times();
        assert_eq!(calls.len(), 3);
        let first_gap = calls[1].duration_since(calls[0]);
        let second_gap = calls[2].duration_since(calls[1]);
        assert!(first_gap >= Duration::from_millis(20), "{first_gap:?}");
        assert!(second_gap >= Duration::from_millis(40), "{second_gap:?}");
    }

    #[test]
    fn rate_limit_status_is_retried() {
        let engine = ScriptedEngine::new(vec![
            Err(http_error(429)),
            ScriptedEngine::ok(&valid_payload_text()),
        ]);
        let client = fast_client(engine.clone());
        let (reference, questioned) = transport_pair();

        client.analyze(&reference, &questioned).unwrap();
        assert_eq!(engine.call_times().len(), 2);
    }

    #[test]
    fn non_retryable_status_short_circuits() {
        let engine = ScriptedEngine::new(vec![
            Err(http_error(400)),
            ScriptedEngine::ok(&valid_payload_text()),
        ]);
        let client = fast_client(engine.clone());
        let (reference, questioned) = transport_pair();

        let err = client.analyze(&reference, &questioned).unwrap_err();
        match err {
            AnalysisError::NonRetryableEngineFailure { status, .. } => assert_eq!(status, 400),
            other => panic!("expected NonRetryableEngineFailure, got {other:?}"),
        }
        assert_eq!(engine.call_times().len(), 1);
    }

    #[test]
    fn exhausted_retries_wraps_the_last_failure() {
        let engine = ScriptedEngine::new(vec![
            Err(http_error(500)),
            Err(http_error(503)),
            Err(http_error(502)),
        ]);
        let client = fast_client(engine.clone());
        let (reference, questioned) = transport_pair();

        let err = client.analyze(&reference, &questioned).unwrap_err();
        match err {
            AnalysisError::ExhaustedRetries { attempts, last } => {
                assert_eq!(attempts, 3);
                match last {
                    EngineCallError::Http { status, .. } => assert_eq!(status, 502),
                    other => panic!("expected Http failure, got {other:?}"),
                }
            }
            other => panic!("expected ExhaustedRetries, got {other:?}"),
        }
        assert_eq!(engine.call_times().len(), 3);
    }

    #[test]
    fn empty_payload_fails_with_empty_report() {
        let engine = ScriptedEngine::new(vec![ScriptedEngine::ok("   ")]);
        let client = fast_client(engine);
        let (reference, questioned) = transport_pair();

        let err = client.analyze(&reference, &questioned).unwrap_err();
        assert!(matches!(err, AnalysisError::EmptyReport));
    }

    #[test]
    fn non_json_payload_fails_with_malformed_report() {
        let engine = ScriptedEngine::new(vec![ScriptedEngine::ok("this is prose, not JSON")]);
        let client = fast_client(engine);
        let (reference, questioned) = transport_pair();

        let err = client.analyze(&reference, &questioned).unwrap_err();
        assert!(matches!(err, AnalysisError::MalformedReport { .. }));
    }

    #[test]
    fn missing_required_field_fails_with_malformed_report() {
        let mut payload: Value = serde_json::from_str(&valid_payload_text()).unwrap();
        payload.as_object_mut().unwrap().remove("comparisons");
        let engine = ScriptedEngine::new(vec![ScriptedEngine::ok(&payload.to_string())]);
        let client = fast_client(engine.clone());
        let (reference, questioned) = transport_pair();

        let err = client.analyze(&reference, &questioned).unwrap_err();
        assert!(matches!(err, AnalysisError::MalformedReport { .. }));
        assert_eq!(engine.call_times().len(), 1);
    }

    #[test]
    fn inverted_marker_region_fails_with_malformed_report() {
        let mut payload: Value = serde_json::from_str(&valid_payload_text()).unwrap();
        payload["evidenceMarkers"][0]["box_2d"] = json!([400.0, 100.0, 200.0, 300.0]);
        let engine = ScriptedEngine::new(vec![ScriptedEngine::ok(&payload.to_string())]);
        let client = fast_client(engine);
        let (reference, questioned) = transport_pair();

        let err = client.analyze(&reference, &questioned).unwrap_err();
        assert!(matches!(err, AnalysisError::MalformedReport { .. }));
    }

    #[test]
    fn missing_credential_fails_before_any_engine_call() {
        let config = GeminiConfig {
            api_key: None,
            ..GeminiConfig::default()
        };
        let client = ReasoningClient::new(
            Box::new(GeminiEngine::new(config)),
            ClientOptions::default(),
        );
        let (reference, questioned) = transport_pair();

        let err = client.analyze(&reference, &questioned).unwrap_err();
        assert!(matches!(err, AnalysisError::MissingCredential));
    }

    #[test]
    fn dryrun_pipeline_produces_a_valid_report_and_ordered_events() {
        let temp = tempfile::tempdir().unwrap();
        let events_path = temp.path().join("events.jsonl");
        let writer = EventWriter::new(&events_path, "case-test");

        let client = ReasoningClient::new(Box::new(DryrunEngine), ClientOptions::default());
        let pipeline = AnalysisPipeline::new(client).with_events(writer);

        let report = pipeline
            .run(&png_bytes(640, 480), &png_bytes(600, 400))
            .unwrap();
        assert!(!report.id.is_empty());
        assert!(!report.evidence_markers.is_empty());
        assert!(report.timestamp > 0);

        let raw = std::fs::read_to_string(&events_path).unwrap();
        let types: Vec<String> = raw
            .lines()
            .filter_map(|line| serde_json::from_str::<Value>(line).ok())
            .filter_map(|row| row.get("type").and_then(Value::as_str).map(str::to_string))
            .collect();
        let started_idx = types
            .iter()
            .position(|value| value == "analysis_started")
            .expect("missing analysis_started");
        let normalized_idx = types
            .iter()
            .position(|value| value == "specimens_normalized")
            .expect("missing specimens_normalized");
        let assembled_idx = types
            .iter()
            .position(|value| value == "report_assembled")
            .expect("missing report_assembled");
        assert!(started_idx < normalized_idx);
        assert!(normalized_idx < assembled_idx);
    }

    #[test]
    fn pipeline_surfaces_reference_decode_failure_first() {
        let client = ReasoningClient::new(Box::new(DryrunEngine), ClientOptions::default());
        let pipeline = AnalysisPipeline::new(client);

        let err = pipeline
            .run(b"broken reference", b"broken questioned")
            .unwrap_err();
        match err {
            AnalysisError::UnreadableImage { role, .. } => {
                assert_eq!(role, SpecimenRole::Reference);
            }
            other => panic!("expected UnreadableImage, got {other:?}"),
        }
    }

    #[test]
    fn pipeline_failure_emits_analysis_failed_event() {
        let temp = tempfile::tempdir().unwrap();
        let events_path = temp.path().join("events.jsonl");
        let writer = EventWriter::new(&events_path, "case-test");

        let client = ReasoningClient::new(Box::new(DryrunEngine), ClientOptions::default());
        let pipeline = AnalysisPipeline::new(client).with_events(writer);

        assert!(pipeline.run(b"broken", &png_bytes(64, 64)).is_err());

        let raw = std::fs::read_to_string(&events_path).unwrap();
        let failed: Vec<Value> = raw
            .lines()
            .filter_map(|line| serde_json::from_str::<Value>(line).ok())
            .filter(|row| row["type"] == json!("analysis_failed"))
            .collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0]["kind"], json!("unreadable_image"));
    }

    #[test]
    fn gemini_endpoint_handles_prefixed_and_bare_model_names() {
        let engine = GeminiEngine::new(GeminiConfig::default());
        assert_eq!(
            engine.endpoint_for_model("gemini-3-pro-preview"),
            format!("{DEFAULT_API_BASE}/models/gemini-3-pro-preview:generateContent")
        );
        assert_eq!(
            engine.endpoint_for_model("models/gemini-3-pro-preview"),
            format!("{DEFAULT_API_BASE}/models/gemini-3-pro-preview:generateContent")
        );
    }

    #[test]
    fn gemini_payload_bundles_instructions_schema_and_both_images() {
        let (reference, questioned) = transport_pair();
        let request = EngineRequest {
            instructions: ANALYSIS_INSTRUCTIONS,
            reference: &reference,
            questioned: &questioned,
            model: DEFAULT_MODEL,
            thinking_budget: DEFAULT_THINKING_BUDGET,
        };
        let payload = GeminiEngine::build_payload(&request);

        let parts = payload["contents"][0]["parts"].as_array().unwrap();
        assert_eq!(parts.len(), 3);
        assert!(parts[0]["text"].as_str().unwrap().contains("forensic"));
        assert_eq!(parts[1]["inlineData"]["mimeType"], json!("image/jpeg"));
        assert_eq!(parts[2]["inlineData"]["mimeType"], json!("image/jpeg"));

        let config = &payload["generationConfig"];
        assert_eq!(config["responseMimeType"], json!("application/json"));
        assert_eq!(
            config["thinkingConfig"]["thinkingBudget"],
            json!(DEFAULT_THINKING_BUDGET)
        );
        assert!(config["responseSchema"]["required"].is_array());
    }

    #[test]
    fn candidate_text_extraction_concatenates_parts() {
        let envelope = json!({
            "candidates": [{
                "content": {
                    "parts": [
                        { "text": "{\"half\":" },
                        { "text": "1}" },
                    ],
                },
            }],
        });
        assert_eq!(extract_candidate_text(&envelope), "{\"half\":1}");
        assert_eq!(extract_candidate_text(&json!({})), "");
    }
}
