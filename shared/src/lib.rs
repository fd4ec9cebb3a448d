use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use strum::{EnumCount, IntoEnumIterator};
use strum_macros::{AsRefStr, Display, EnumIter, EnumString};

/// Diagnostic categories in the order the classifier emits them.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
    EnumIter,
    EnumCount,
)]
#[serde(rename_all = "UPPERCASE")]
#[strum(serialize_all = "UPPERCASE")]
pub enum Label {
    Normal,
    Pneumonia,
}

impl Label {
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(index: usize) -> Option<Self> {
        Label::iter().nth(index)
    }

    pub fn count() -> usize {
        Label::COUNT
    }
}

/// Renders a probability in `[0, 1]` as `"NN.NN%"`.
pub fn format_percent(probability: f32) -> String {
    format!("{:.2}%", probability * 100.0)
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct PredictionResponse {
    pub result: Label,
    pub confidence: String,
    pub probabilities: BTreeMap<Label, String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct HealthResponse {
    pub status: String,
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn labels_map_positionally() {
        assert_eq!(Label::count(), 2);
        assert_eq!(Label::from_index(0), Some(Label::Normal));
        assert_eq!(Label::from_index(1), Some(Label::Pneumonia));
        assert_eq!(Label::from_index(2), None);
        assert_eq!(Label::Pneumonia.index(), 1);
    }

    #[test]
    fn labels_render_uppercase() {
        assert_eq!(Label::Normal.to_string(), "NORMAL");
        assert_eq!(Label::Pneumonia.as_ref(), "PNEUMONIA");
        assert_eq!(Label::from_str("PNEUMONIA").unwrap(), Label::Pneumonia);
    }

    #[test]
    fn percent_has_two_decimals() {
        assert_eq!(format_percent(0.880797), "88.08%");
        assert_eq!(format_percent(1.0), "100.00%");
        assert_eq!(format_percent(0.0), "0.00%");
        assert_eq!(format_percent(0.5), "50.00%");
    }

    #[test]
    fn prediction_response_wire_shape() {
        let mut probabilities = BTreeMap::new();
        probabilities.insert(Label::Normal, "11.92%".to_string());
        probabilities.insert(Label::Pneumonia, "88.08%".to_string());
        let response = PredictionResponse {
            result: Label::Pneumonia,
            confidence: "88.08%".into(),
            probabilities,
        };

        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "result": "PNEUMONIA",
                "confidence": "88.08%",
                "probabilities": {"NORMAL": "11.92%", "PNEUMONIA": "88.08%"}
            })
        );
    }

    #[test]
    fn health_response_skips_absent_fields() {
        let health = HealthResponse {
            status: "degraded".into(),
            model: "unavailable".into(),
            device: None,
            reason: Some("artifact_missing".into()),
        };
        let json = serde_json::to_value(&health).unwrap();
        assert!(json.get("device").is_none());
        assert_eq!(json["reason"], "artifact_missing");
    }
}
