//! Built-in message templates.

use super::TemplateDefinition;

pub const OUTBREAK_ALERT: &str = "outbreak_alert";
pub const HEALTH_REPORT_CONFIRMATION: &str = "health_report_confirmation";
pub const SENSOR_ALERT: &str = "sensor_alert";
pub const SYSTEM_ALERT: &str = "system_alert";
pub const REMINDER: &str = "reminder";

pub(super) fn definitions() -> Vec<TemplateDefinition> {
    vec![
        TemplateDefinition::new(
            OUTBREAK_ALERT,
            Some("high"),
            "\u{1f6a8} HIGH outbreak risk near {location}",
            "URGENT: high risk of a waterborne disease outbreak near {location} \
             (confidence {confidence}%). Factors: {contributing_factors}. \
             Act now: {recommendations}",
        ),
        TemplateDefinition::new(
            OUTBREAK_ALERT,
            Some("medium"),
            "\u{26a0}\u{fe0f} Elevated outbreak risk near {location}",
            "Warning: elevated risk of a waterborne disease outbreak near {location} \
             (confidence {confidence}%). Factors: {contributing_factors}. \
             Recommended: {recommendations}",
        ),
        TemplateDefinition::new(
            OUTBREAK_ALERT,
            Some("low"),
            "\u{2139}\u{fe0f} Outbreak risk advisory for {location}",
            "Advisory: low outbreak risk detected near {location} \
             (confidence {confidence}%). Factors: {contributing_factors}. \
             Suggested: {recommendations}",
        ),
        TemplateDefinition::new(
            HEALTH_REPORT_CONFIRMATION,
            None,
            "Health report received",
            "Thank you. Your health report {report_id} was received and will be \
             reviewed by a health worker.",
        ),
        TemplateDefinition::new(
            SENSOR_ALERT,
            None,
            "Water quality alert: sensor {sensor_id}",
            "Sensor {sensor_id} at {location} reported an abnormal reading: \
             pH {ph}, turbidity {turbidity} NTU.",
        ),
        TemplateDefinition::new(SYSTEM_ALERT, None, "System alert: {subject}", "{message}"),
        TemplateDefinition::new(REMINDER, None, "Reminder: {subject}", "{message}"),
    ]
}
