use serde_json::{json, Value};

use crate::report::MarkerKind;

/// Fixed task description sent alongside the two specimens. Sample A is
/// the known-authentic reference, Sample B the questioned specimen.
pub const ANALYSIS_INSTRUCTIONS: &str = "\
You are a forensic handwriting examiner. Perform a high-precision \
comparative analysis. Sample A: known authentic reference. Sample B: \
questioned specimen.

TASK:
1. Identify tremor and shakiness (forgery signs) versus fluid motion \
(authentic writing).
2. Detect retouching or patching of strokes.
3. Compare slant consistency, pen pressure, letter formation, and the \
naturalness of connections between letters.
4. Examine stroke terminations for blunt or hesitant endings.
5. Return evidence markers located on Sample B, with bounding boxes \
normalized to a 1000x1000 grid.";

/// Strict response schema the engine must conform its output to. The
/// shape mirrors `report::RawAnalysis` field for field; any deviation is
/// rejected at the client as a malformed report.
pub fn response_schema() -> Value {
    let kinds: Vec<Value> = MarkerKind::ALL
        .iter()
        .map(|kind| Value::String(kind.wire_name().to_string()))
        .collect();
    json!({
        "type": "OBJECT",
        "properties": {
            "isForgery": { "type": "BOOLEAN" },
            "confidence": { "type": "NUMBER" },
            "summary": { "type": "STRING" },
            "reasoning": {
                "type": "ARRAY",
                "items": { "type": "STRING" }
            },
            "evidenceMarkers": {
                "type": "ARRAY",
                "items": {
                    "type": "OBJECT",
                    "properties": {
                        "type": { "type": "STRING", "enum": kinds },
                        "subType": { "type": "STRING" },
                        "description": { "type": "STRING" },
                        "confidence": { "type": "NUMBER" },
                        "box_2d": {
                            "type": "ARRAY",
                            "items": { "type": "NUMBER" }
                        }
                    },
                    "required": ["type", "subType", "description", "confidence", "box_2d"]
                }
            },
            "comparisons": {
                "type": "OBJECT",
                "properties": {
                    "slant": { "type": "STRING" },
                    "pressure": { "type": "STRING" },
                    "formation": { "type": "STRING" },
                    "connectivity": { "type": "STRING" },
                    "flow": { "type": "STRING" },
                    "terminations": { "type": "STRING" }
                },
                "required": ["slant", "pressure", "formation", "connectivity", "flow", "terminations"]
            }
        },
        "required": ["isForgery", "confidence", "summary", "reasoning", "comparisons", "evidenceMarkers"]
    })
}
