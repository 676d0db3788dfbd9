use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

/// Closed set of forensic finding categories the engine may emit.
///
/// Anything outside this set fails deserialization, which the client
/// surfaces as a malformed report rather than passing the value through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarkerKind {
    Tremor,
    Retouching,
    Habit,
    Alignment,
    Pressure,
}

impl MarkerKind {
    pub const ALL: [MarkerKind; 5] = [
        MarkerKind::Tremor,
        MarkerKind::Retouching,
        MarkerKind::Habit,
        MarkerKind::Alignment,
        MarkerKind::Pressure,
    ];

    pub fn wire_name(&self) -> &'static str {
        match self {
            MarkerKind::Tremor => "tremor",
            MarkerKind::Retouching => "retouching",
            MarkerKind::Habit => "habit",
            MarkerKind::Alignment => "alignment",
            MarkerKind::Pressure => "pressure",
        }
    }
}

/// Bounding box on the 1000x1000 virtual canvas, wire order
/// `[y_min, x_min, y_max, x_max]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f64; 4]", into = "[f64; 4]")]
pub struct Region {
    pub y_min: f64,
    pub x_min: f64,
    pub y_max: f64,
    pub x_max: f64,
}

impl From<[f64; 4]> for Region {
    fn from(raw: [f64; 4]) -> Self {
        Self {
            y_min: raw[0],
            x_min: raw[1],
            y_max: raw[2],
            x_max: raw[3],
        }
    }
}

impl From<Region> for [f64; 4] {
    fn from(region: Region) -> Self {
        [region.y_min, region.x_min, region.y_max, region.x_max]
    }
}

impl Region {
    pub const CANVAS: f64 = 1000.0;

    /// Invariants: ordered corners, every component within `[0, 1000]`.
    pub fn validate(&self) -> Result<()> {
        let components = [self.y_min, self.x_min, self.y_max, self.x_max];
        if components
            .iter()
            .any(|value| !value.is_finite() || *value < 0.0 || *value > Self::CANVAS)
        {
            bail!("region component out of the 0..=1000 canvas: {components:?}");
        }
        if self.y_min > self.y_max || self.x_min > self.x_max {
            bail!("region corners are inverted: {components:?}");
        }
        Ok(())
    }
}

/// One localized forensic finding, owned by the report that carries it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceMarker {
    #[serde(rename = "type")]
    pub kind: MarkerKind,
    #[serde(rename = "subType")]
    pub sub_kind: String,
    pub description: String,
    #[serde(rename = "confidence")]
    pub local_confidence: f64,
    #[serde(rename = "box_2d")]
    pub region: Region,
}

/// Six required trait-by-trait findings. Modeled as a struct so a missing
/// key is a deserialization error, not a silently absent entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparisonSet {
    pub slant: String,
    pub pressure: String,
    pub formation: String,
    pub connectivity: String,
    pub flow: String,
    pub terminations: String,
}

/// The engine's structured payload, exactly as the response schema
/// declares it. Every field is required on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawAnalysis {
    pub is_forgery: bool,
    pub confidence: f64,
    pub summary: String,
    pub reasoning: Vec<String>,
    pub comparisons: ComparisonSet,
    pub evidence_markers: Vec<EvidenceMarker>,
}

impl RawAnalysis {
    /// Checks the invariants the schema cannot express: marker regions
    /// must be ordered boxes on the 1000x1000 canvas.
    pub fn validate(&self) -> Result<()> {
        for (idx, marker) in self.evidence_markers.iter().enumerate() {
            if let Err(err) = marker.region.validate() {
                bail!("evidence marker {idx} ({}): {err}", marker.kind.wire_name());
            }
        }
        Ok(())
    }
}

/// The unit of work output: one identified, timestamped analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisReport {
    pub id: String,
    /// Milliseconds since epoch, captured at assembly time.
    pub timestamp: i64,
    pub is_forgery: bool,
    pub confidence: f64,
    pub summary: String,
    pub reasoning: Vec<String>,
    pub comparisons: ComparisonSet,
    pub evidence_markers: Vec<EvidenceMarker>,
}

/// Stitches a validated payload into a domain report. Pure apart from the
/// id draw and the clock read; every payload field passes through
/// verbatim, without clamping.
pub fn assemble_report(raw: RawAnalysis) -> AnalysisReport {
    AnalysisReport {
        id: uuid::Uuid::new_v4().to_string(),
        timestamp: chrono::Utc::now().timestamp_millis(),
        is_forgery: raw.is_forgery,
        confidence: raw.confidence,
        summary: raw.summary,
        reasoning: raw.reasoning,
        comparisons: raw.comparisons,
        evidence_markers: raw.evidence_markers,
    }
}
