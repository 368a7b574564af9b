use async_trait::async_trait;
use base64::Engine;
use serde_json::Value;
use std::sync::Arc;

use crate::chat::VisionAnalysis;
use crate::gateway::BackendError;

/// Black-box image-understanding capability: image bytes plus a context
/// prompt in, provider JSON out.
#[async_trait]
pub trait VisionBackend: Send + Sync {
    async fn analyze(
        &self,
        image_b64: &str,
        mime_type: &str,
        system: &str,
        prompt: &str,
    ) -> Result<Value, BackendError>;
}

#[derive(Debug, thiserror::Error)]
pub enum AnalysisError {
    #[error(transparent)]
    Backend(#[from] BackendError),
}

const VISION_SYSTEM: &str = "You are an expert agricultural AI vision analyst specializing in crop disease detection and livestock health assessment.

Analyze the provided image and provide:
1. Diagnosis - identify the disease, pest, or health condition
2. Confidence level (0-100%)
3. Treatment recommendations (specific, actionable steps)
4. Prevention measures for future
5. Detailed description of what you observe";

const VISION_FORMAT: &str = r#"Respond in JSON format with this structure:
{
  "diagnosis": "disease/condition name",
  "confidence": 95,
  "treatment": ["step 1", "step 2"],
  "prevention": ["measure 1", "measure 2"],
  "description": "detailed observation"
}"#;

fn vision_system_prompt(language: &str) -> String {
    if language == "en" {
        format!("{VISION_SYSTEM}\n\n{VISION_FORMAT}")
    } else {
        format!("{VISION_SYSTEM}\n\nRespond in {language} language.\n\n{VISION_FORMAT}")
    }
}

/// Image-diagnosis gateway. The provider can return sloppy JSON; every
/// field is defaulted rather than failing the call, because the result is
/// persisted as message content downstream. Only a failed provider call
/// surfaces as an error.
#[derive(Clone)]
pub struct VisionGateway {
    backend: Arc<dyn VisionBackend>,
}

impl VisionGateway {
    pub fn new(backend: Arc<dyn VisionBackend>) -> Self {
        Self { backend }
    }

    pub async fn analyze(
        &self,
        image: &[u8],
        mime_type: &str,
        context: &str,
        language: &str,
    ) -> Result<VisionAnalysis, AnalysisError> {
        let image_b64 = base64::engine::general_purpose::STANDARD.encode(image);
        let system = vision_system_prompt(language);
        let prompt = format!("Analyze this agricultural image. Context: {context}");

        let raw = self
            .backend
            .analyze(&image_b64, mime_type, &system, &prompt)
            .await?;

        Ok(VisionAnalysis::from_raw(&raw))
    }
}

impl VisionAnalysis {
    /// Normalize a raw provider payload. Missing confidence defaults the
    /// raw value to 0 before clamping into [0, 100].
    pub fn from_raw(raw: &Value) -> Self {
        let confidence = raw
            .get("confidence")
            .and_then(Value::as_f64)
            .unwrap_or(0.0)
            .clamp(0.0, 100.0)
            .round() as u8;

        Self {
            diagnosis: string_or(raw, "diagnosis", "Unknown condition"),
            confidence,
            treatment: string_list(raw, "treatment"),
            prevention: string_list(raw, "prevention"),
            description: string_or(raw, "description", "No description available"),
        }
    }
}

fn string_or(raw: &Value, key: &str, default: &str) -> String {
    raw.get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .unwrap_or(default)
        .to_string()
}

fn string_list(raw: &Value, key: &str) -> Vec<String> {
    raw.get(key)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn clamps_negative_confidence_to_zero() {
        let analysis = VisionAnalysis::from_raw(&json!({ "confidence": -10 }));
        assert_eq!(analysis.confidence, 0);
    }

    #[test]
    fn clamps_overflowing_confidence_to_hundred() {
        let analysis = VisionAnalysis::from_raw(&json!({ "confidence": 150 }));
        assert_eq!(analysis.confidence, 100);
    }

    #[test]
    fn missing_confidence_defaults_to_zero() {
        let analysis = VisionAnalysis::from_raw(&json!({ "diagnosis": "Leaf rust" }));
        assert_eq!(analysis.confidence, 0);
    }

    #[test]
    fn missing_fields_are_defaulted_not_fatal() {
        let analysis = VisionAnalysis::from_raw(&json!({}));
        assert_eq!(analysis.diagnosis, "Unknown condition");
        assert_eq!(analysis.description, "No description available");
        assert!(analysis.treatment.is_empty());
        assert!(analysis.prevention.is_empty());
    }

    #[test]
    fn well_formed_payload_passes_through() {
        let analysis = VisionAnalysis::from_raw(&json!({
            "diagnosis": "Late blight",
            "confidence": 88,
            "treatment": ["Remove infected plants", "Apply copper fungicide"],
            "prevention": ["Rotate crops"],
            "description": "Dark lesions on lower leaves"
        }));
        assert_eq!(analysis.diagnosis, "Late blight");
        assert_eq!(analysis.confidence, 88);
        assert_eq!(analysis.treatment.len(), 2);
        assert_eq!(analysis.prevention, vec!["Rotate crops".to_string()]);
    }

    #[test]
    fn non_string_list_entries_are_dropped() {
        let analysis = VisionAnalysis::from_raw(&json!({ "treatment": ["spray", 42, null] }));
        assert_eq!(analysis.treatment, vec!["spray".to_string()]);
    }

    #[test]
    fn hindi_prompt_carries_language_directive() {
        let prompt = vision_system_prompt("hi");
        assert!(prompt.contains("Respond in hi language."));
        let en = vision_system_prompt("en");
        assert!(!en.contains("Respond in"));
    }
}
