//! Alert events produced by the risk-scoring oracle.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::{Error, Result};

/// Outbreak risk level assigned by the oracle.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    pub const ALL: [RiskLevel; 3] = [RiskLevel::Low, RiskLevel::Medium, RiskLevel::High];

    /// Template variant key for this level.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

/// Geographic point in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Location {
    #[serde(alias = "latitude")]
    pub lat: f64,
    #[serde(alias = "longitude", alias = "lon")]
    pub lng: f64,
}

impl Location {
    const EARTH_RADIUS_KM: f64 = 6371.0;

    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lng.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lng)
    }

    /// Great-circle (haversine) distance in kilometres.
    pub fn distance_km(&self, other: &Location) -> f64 {
        let (lat1, lat2) = (self.lat.to_radians(), other.lat.to_radians());
        let d_lat = (other.lat - self.lat).to_radians();
        let d_lng = (other.lng - self.lng).to_radians();

        let a = (d_lat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (d_lng / 2.0).sin().powi(2);
        2.0 * Self::EARTH_RADIUS_KM * a.sqrt().asin()
    }
}

impl std::fmt::Display for Location {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:.4}, {:.4}", self.lat, self.lng)
    }
}

/// A risk assessment ready for notification fan-out.
///
/// Immutable once it enters the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertEvent {
    /// Opaque unique identifier. Generated when the oracle omits it.
    #[serde(default = "generate_alert_id")]
    pub alert_id: String,
    pub risk_level: RiskLevel,
    /// Prediction confidence in `[0, 1]`.
    pub confidence: f64,
    #[serde(default)]
    pub contributing_factors: Vec<String>,
    #[serde(default)]
    pub recommendations: Vec<String>,
    #[serde(default)]
    pub location: Option<Location>,
    #[serde(
        alias = "timestamp",
        default = "Utc::now",
        deserialize_with = "deserialize_timestamp"
    )]
    pub created_at: DateTime<Utc>,
    /// Per-level class probabilities reported by the model.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub probability_scores: Option<BTreeMap<RiskLevel, f64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_version: Option<String>,
}

fn generate_alert_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Accepts RFC 3339 timestamps as well as the offset-less ISO form the oracle
/// emits (`2024-05-01T10:00:00.123456`), which is interpreted as UTC.
fn deserialize_timestamp<'de, D>(deserializer: D) -> std::result::Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_timestamp(&raw).ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp: {raw}")))
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

impl AlertEvent {
    pub fn new(risk_level: RiskLevel, confidence: f64) -> Self {
        Self {
            alert_id: generate_alert_id(),
            risk_level,
            confidence,
            contributing_factors: Vec::new(),
            recommendations: Vec::new(),
            location: None,
            created_at: Utc::now(),
            probability_scores: None,
            model_version: None,
        }
    }

    pub fn with_id(mut self, alert_id: impl Into<String>) -> Self {
        self.alert_id = alert_id.into();
        self
    }

    pub fn with_factors<I, S>(mut self, factors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.contributing_factors = factors.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_recommendations<I, S>(mut self, recommendations: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.recommendations = recommendations.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_location(mut self, location: Location) -> Self {
        self.location = Some(location);
        self
    }

    /// Parse and validate an oracle payload.
    pub fn from_oracle_json(payload: &str) -> Result<Self> {
        let event: AlertEvent = serde_json::from_str(payload)
            .map_err(|e| Error::validation(format!("Malformed alert event: {}", e)))?;
        event.validate()?;
        Ok(event)
    }

    /// Check structural invariants.
    pub fn validate(&self) -> Result<()> {
        if self.alert_id.trim().is_empty() {
            return Err(Error::validation("alert_id must not be empty"));
        }
        if !self.confidence.is_finite() || !(0.0..=1.0).contains(&self.confidence) {
            return Err(Error::validation(format!(
                "confidence must be within [0, 1], got {}",
                self.confidence
            )));
        }
        if let Some(location) = &self.location
            && !location.is_valid()
        {
            return Err(Error::validation(format!("invalid location: {:?}", location)));
        }
        if let Some(scores) = &self.probability_scores {
            for (level, score) in scores {
                if !score.is_finite() || !(0.0..=1.0).contains(score) {
                    return Err(Error::validation(format!(
                        "probability score for {} must be within [0, 1], got {}",
                        level, score
                    )));
                }
            }
        }
        Ok(())
    }

    /// Confidence as a whole percentage, e.g. `0.92` -> `"92"`.
    pub fn confidence_percent(&self) -> String {
        format!("{:.0}", self.confidence * 100.0)
    }
}
