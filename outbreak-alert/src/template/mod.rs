//! Message template engine.
//!
//! Templates live in a fixed table keyed by `(template_name, variant)` that is
//! loaded once (built-in defaults or a JSON file) and never mutated afterwards.
//! Placeholders are literal `{token}` replacements; a placeholder without a
//! matching parameter fails the render instead of leaking into the output.

pub mod builtin;

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::debug;

use crate::domain::AlertEvent;
use crate::error::DeliveryError;
use crate::{Error, Result};

pub use builtin::OUTBREAK_ALERT;

static PLACEHOLDER_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*)\}").unwrap());

/// One entry of the template table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateDefinition {
    pub name: String,
    /// `None` for variant-less templates such as `reminder`.
    #[serde(default)]
    pub variant: Option<String>,
    pub title: String,
    pub body: String,
}

impl TemplateDefinition {
    pub fn new(
        name: impl Into<String>,
        variant: Option<&str>,
        title: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            variant: variant.map(str::to_string),
            title: title.into(),
            body: body.into(),
        }
    }

    fn key(&self) -> TemplateKey {
        (self.name.clone(), self.variant.clone())
    }
}

type TemplateKey = (String, Option<String>);

#[derive(Debug, Deserialize)]
struct TemplateFile {
    templates: Vec<TemplateDefinition>,
}

/// Template parameter value.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Text(String),
    List(Vec<String>),
}

/// Named parameters for one render.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TemplateParams {
    values: BTreeMap<String, ParamValue>,
}

impl TemplateParams {
    pub fn new() -> Self {
        Self::default()
    }

    /// Standard parameters derived from an alert event.
    pub fn for_alert(alert: &AlertEvent) -> Self {
        let mut params = Self::new();
        params.insert_text("alert_id", &alert.alert_id);
        params.insert_text("risk_level", alert.risk_level.as_str());
        params.insert_text("confidence", alert.confidence_percent());
        params.insert_text(
            "location",
            alert
                .location
                .map(|l| l.to_string())
                .unwrap_or_else(|| "your area".to_string()),
        );
        params.insert_text("timestamp", alert.created_at.format("%Y-%m-%d %H:%M UTC").to_string());
        params.insert_list("contributing_factors", alert.contributing_factors.clone());
        params.insert_list("recommendations", alert.recommendations.clone());
        if let Some(version) = &alert.model_version {
            params.insert_text("model_version", version);
        }
        params
    }

    pub fn insert_text(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), ParamValue::Text(value.into()));
    }

    pub fn insert_list(&mut self, key: impl Into<String>, values: Vec<String>) {
        self.values.insert(key.into(), ParamValue::List(values));
    }

    pub fn with_text(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert_text(key, value);
        self
    }

    /// Add text parameters, keeping existing values on key collisions.
    pub fn merge_missing<'a, I>(&mut self, extra: I)
    where
        I: IntoIterator<Item = (&'a String, &'a String)>,
    {
        for (key, value) in extra {
            self.values
                .entry(key.clone())
                .or_insert_with(|| ParamValue::Text(value.clone()));
        }
    }

    pub fn get(&self, key: &str) -> Option<&ParamValue> {
        self.values.get(key)
    }

    fn to_json(&self) -> Map<String, Value> {
        self.values
            .iter()
            .map(|(k, v)| {
                let value = match v {
                    ParamValue::Text(s) => Value::String(s.clone()),
                    ParamValue::List(items) => json!(items),
                };
                (k.clone(), value)
            })
            .collect()
    }
}

/// Channel-specific rendering knobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderOptions {
    /// Truncate list parameters in title/body to this many items.
    pub max_list_items: Option<usize>,
    pub list_separator: String,
}

impl RenderOptions {
    /// Unrestricted lists (push, email, structured data).
    pub fn full() -> Self {
        Self {
            max_list_items: None,
            list_separator: "; ".to_string(),
        }
    }

    pub fn truncated(max_list_items: usize) -> Self {
        Self {
            max_list_items: Some(max_list_items),
            ..Self::full()
        }
    }
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self::full()
    }
}

/// Output of a render, ready for a channel adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderedMessage {
    pub title: String,
    pub body: String,
    /// Full parameter set plus template identity. Lists are never truncated here.
    pub structured_data: Value,
}

/// Immutable template table.
#[derive(Debug, Clone)]
pub struct TemplateEngine {
    table: HashMap<TemplateKey, TemplateDefinition>,
}

impl TemplateEngine {
    /// Engine with the built-in template set.
    pub fn builtin() -> Self {
        let table = builtin::definitions()
            .into_iter()
            .map(|d| (d.key(), d))
            .collect();
        Self { table }
    }

    /// Build a table, rejecting duplicates and malformed placeholders.
    pub fn from_definitions(definitions: Vec<TemplateDefinition>) -> Result<Self> {
        let mut table = HashMap::with_capacity(definitions.len());
        for definition in definitions {
            validate_template_text(&definition, &definition.title)?;
            validate_template_text(&definition, &definition.body)?;
            let key = definition.key();
            if table.insert(key, definition.clone()).is_some() {
                return Err(Error::config(format!(
                    "Duplicate template '{}' (variant: {})",
                    definition.name,
                    definition.variant.as_deref().unwrap_or("none")
                )));
            }
        }
        Ok(Self { table })
    }

    /// Load a `{"templates": [...]}` document.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let file: TemplateFile = serde_json::from_str(json)?;
        Self::from_definitions(file.templates)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::config(format!("Failed to read templates from {}: {}", path.display(), e))
        })?;
        let engine = Self::from_json_str(&content)?;
        debug!(path = %path.display(), templates = engine.len(), "Loaded template table");
        Ok(engine)
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    pub fn contains(&self, name: &str, variant: Option<&str>) -> bool {
        self.lookup(name, variant).is_some()
    }

    fn lookup(&self, name: &str, variant: Option<&str>) -> Option<&TemplateDefinition> {
        self.table
            .get(&(name.to_string(), variant.map(str::to_string)))
    }

    pub fn render(
        &self,
        name: &str,
        variant: Option<&str>,
        params: &TemplateParams,
        options: &RenderOptions,
    ) -> std::result::Result<RenderedMessage, DeliveryError> {
        let definition =
            self.lookup(name, variant)
                .ok_or_else(|| DeliveryError::UnknownTemplate {
                    template: name.to_string(),
                    variant: variant.map(str::to_string),
                })?;

        let title = substitute(name, &definition.title, params, options)?;
        let body = substitute(name, &definition.body, params, options)?;

        let mut data = params.to_json();
        data.insert("template".to_string(), Value::String(name.to_string()));
        if let Some(variant) = variant {
            data.insert("variant".to_string(), Value::String(variant.to_string()));
        }

        Ok(RenderedMessage {
            title,
            body,
            structured_data: Value::Object(data),
        })
    }
}

impl Default for TemplateEngine {
    fn default() -> Self {
        Self::builtin()
    }
}

fn validate_template_text(definition: &TemplateDefinition, text: &str) -> Result<()> {
    let stripped = PLACEHOLDER_REGEX.replace_all(text, "");
    if stripped.contains('{') || stripped.contains('}') {
        return Err(Error::config(format!(
            "Template '{}' (variant: {}) contains a malformed placeholder: {}",
            definition.name,
            definition.variant.as_deref().unwrap_or("none"),
            text
        )));
    }
    Ok(())
}

fn substitute(
    template: &str,
    text: &str,
    params: &TemplateParams,
    options: &RenderOptions,
) -> std::result::Result<String, DeliveryError> {
    let mut out = String::with_capacity(text.len());
    let mut last = 0;

    for m in PLACEHOLDER_REGEX.find_iter(text) {
        let key = &text[m.start() + 1..m.end() - 1];
        let value = params.get(key).ok_or_else(|| DeliveryError::TemplateRender {
            template: template.to_string(),
            key: key.to_string(),
        })?;

        out.push_str(&text[last..m.start()]);
        match value {
            ParamValue::Text(s) => out.push_str(s),
            ParamValue::List(items) => {
                let limit = options.max_list_items.unwrap_or(items.len());
                let shown: Vec<&str> = items.iter().take(limit).map(String::as_str).collect();
                if shown.is_empty() {
                    out.push_str("none");
                } else {
                    out.push_str(&shown.join(&options.list_separator));
                }
            }
        }
        last = m.end();
    }
    out.push_str(&text[last..]);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Location, RiskLevel};

    fn alert(level: RiskLevel, confidence: f64) -> AlertEvent {
        AlertEvent::new(level, confidence)
            .with_factors(["pH anomaly", "turbidity spike"])
            .with_recommendations([
                "boil water",
                "avoid tap water",
                "seek medical advice",
                "report symptoms",
            ])
            .with_location(Location::new(12.9, 77.6))
    }

    #[test]
    fn test_render_outbreak_high() {
        let engine = TemplateEngine::builtin();
        let params = TemplateParams::for_alert(&alert(RiskLevel::High, 0.92));
        let msg = engine
            .render(OUTBREAK_ALERT, Some("high"), &params, &RenderOptions::full())
            .unwrap();

        assert!(msg.body.contains("92"));
        assert!(!msg.body.contains('{'));
        assert!(!msg.title.contains('{'));
        assert!(msg.title.contains("12.9000, 77.6000"));
        assert!(msg.body.contains("report symptoms"));
        assert_eq!(msg.structured_data["variant"], "high");
        assert_eq!(msg.structured_data["template"], OUTBREAK_ALERT);
    }

    #[test]
    fn test_every_builtin_outbreak_variant_renders() {
        let engine = TemplateEngine::builtin();
        for level in RiskLevel::ALL {
            let params = TemplateParams::for_alert(&alert(level, 0.5));
            let msg = engine
                .render(OUTBREAK_ALERT, Some(level.as_str()), &params, &RenderOptions::full())
                .unwrap();
            assert!(msg.body.contains("50%"));
        }
    }

    #[test]
    fn test_sms_truncates_recommendations_but_not_structured_data() {
        let engine = TemplateEngine::builtin();
        let params = TemplateParams::for_alert(&alert(RiskLevel::High, 0.92));
        let msg = engine
            .render(OUTBREAK_ALERT, Some("high"), &params, &RenderOptions::truncated(3))
            .unwrap();

        assert!(msg.body.contains("boil water; avoid tap water; seek medical advice"));
        assert!(!msg.body.contains("report symptoms"));
        assert_eq!(
            msg.structured_data["recommendations"].as_array().unwrap().len(),
            4
        );
    }

    #[test]
    fn test_missing_parameter_fails_with_key() {
        let engine = TemplateEngine::builtin();
        let params = TemplateParams::new()
            .with_text("sensor_id", "S-7")
            .with_text("location", "Ward 4")
            .with_text("ph", "4.2");

        let err = engine
            .render("sensor_alert", None, &params, &RenderOptions::full())
            .unwrap_err();
        assert_eq!(
            err,
            DeliveryError::TemplateRender {
                template: "sensor_alert".to_string(),
                key: "turbidity".to_string(),
            }
        );
    }

    #[test]
    fn test_unknown_template() {
        let engine = TemplateEngine::builtin();
        let err = engine
            .render(OUTBREAK_ALERT, Some("extreme"), &TemplateParams::new(), &RenderOptions::full())
            .unwrap_err();
        assert!(matches!(err, DeliveryError::UnknownTemplate { .. }));

        // Variant-less templates need an exact (name, None) match.
        assert!(engine.contains("reminder", None));
        assert!(!engine.contains("reminder", Some("high")));
    }

    #[test]
    fn test_empty_list_renders_none() {
        let engine = TemplateEngine::builtin();
        let params = TemplateParams::for_alert(&AlertEvent::new(RiskLevel::Low, 0.3));
        let msg = engine
            .render(OUTBREAK_ALERT, Some("low"), &params, &RenderOptions::full())
            .unwrap();
        assert!(msg.body.contains("Factors: none"));
        assert!(msg.title.contains("your area"));
    }

    #[test]
    fn test_load_rejects_malformed_placeholder() {
        let json = r#"{"templates": [
            {"name": "sensor_alert", "title": "Sensor", "body": "{pH: {ph}} reading"}
        ]}"#;
        let err = TemplateEngine::from_json_str(json).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn test_load_rejects_duplicates() {
        let defs = vec![
            TemplateDefinition::new("reminder", None, "a", "b"),
            TemplateDefinition::new("reminder", None, "c", "d"),
        ];
        assert!(TemplateEngine::from_definitions(defs).is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("templates.json");
        std::fs::write(
            &path,
            r#"{"templates": [
                {"name": "outbreak_alert", "variant": "high", "title": "Alert {district}", "body": "{confidence}% in {district}"}
            ]}"#,
        )
        .unwrap();

        let engine = TemplateEngine::from_file(&path).unwrap();
        assert_eq!(engine.len(), 1);

        let params = TemplateParams::for_alert(&AlertEvent::new(RiskLevel::High, 0.8))
            .with_text("district", "North");
        let msg = engine
            .render(OUTBREAK_ALERT, Some("high"), &params, &RenderOptions::full())
            .unwrap();
        assert_eq!(msg.body, "80% in North");
    }

    #[test]
    fn test_merge_missing_keeps_alert_params() {
        let mut params = TemplateParams::for_alert(&AlertEvent::new(RiskLevel::High, 0.8));
        let attrs: BTreeMap<String, String> = [
            ("confidence".to_string(), "spoofed".to_string()),
            ("name".to_string(), "Asha".to_string()),
        ]
        .into_iter()
        .collect();
        params.merge_missing(&attrs);

        assert_eq!(params.get("confidence"), Some(&ParamValue::Text("80".to_string())));
        assert_eq!(params.get("name"), Some(&ParamValue::Text("Asha".to_string())));
    }
}
