//! Recipient resolution.
//!
//! Expands an alert into an ordered, deduplicated list of `(recipient, channel)`
//! targets according to a per-risk-level policy table.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::Result;
use crate::domain::{AlertEvent, Channel, Location, Recipient, RiskLevel, Role};

/// Query passed to the recipient directory.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RecipientFilter {
    pub roles: Vec<Role>,
    /// Alert location, if the rule restricts by distance.
    pub location: Option<Location>,
    pub radius_km: Option<f64>,
}

/// Read-only recipient source.
#[async_trait]
pub trait RecipientDirectory: Send + Sync {
    /// List recipients in a stable order. The filter is a hint; roles and
    /// distance are re-checked by the resolver.
    async fn list_recipients(&self, filter: &RecipientFilter) -> Result<Vec<Recipient>>;

    /// Notify the directory that an address was permanently rejected.
    async fn report_stale_address(
        &self,
        _recipient_id: &str,
        _channel: Channel,
        _address: &str,
        _reason: &str,
    ) -> Result<()> {
        Ok(())
    }
}

/// How many of a recipient's preferred channels to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FanoutStrategy {
    AllPreferred,
    FirstPreferred,
}

/// Fan-out rule for one risk level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyRule {
    pub roles: Vec<Role>,
    pub fanout: FanoutStrategy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub radius_km: Option<f64>,
}

impl PolicyRule {
    pub fn new(roles: impl Into<Vec<Role>>, fanout: FanoutStrategy) -> Self {
        Self {
            roles: roles.into(),
            fanout,
            radius_km: None,
        }
    }

    pub fn with_radius_km(mut self, radius_km: f64) -> Self {
        self.radius_km = Some(radius_km);
        self
    }
}

/// Risk level -> fan-out rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecipientPolicy {
    rules: BTreeMap<RiskLevel, PolicyRule>,
}

impl RecipientPolicy {
    pub fn new(rules: BTreeMap<RiskLevel, PolicyRule>) -> Self {
        Self { rules }
    }

    pub fn with_rule(mut self, level: RiskLevel, rule: PolicyRule) -> Self {
        self.rules.insert(level, rule);
        self
    }

    pub fn rule_for(&self, level: RiskLevel) -> Option<&PolicyRule> {
        self.rules.get(&level)
    }
}

impl Default for RecipientPolicy {
    fn default() -> Self {
        let rules = BTreeMap::from([
            (
                RiskLevel::High,
                PolicyRule::new(Role::ALL, FanoutStrategy::AllPreferred),
            ),
            (
                RiskLevel::Medium,
                PolicyRule::new(Role::ALL, FanoutStrategy::FirstPreferred),
            ),
            (
                RiskLevel::Low,
                PolicyRule::new([Role::HealthWorker, Role::Admin], FanoutStrategy::FirstPreferred),
            ),
        ]);
        Self { rules }
    }
}

/// One `(recipient, channel)` pair to notify.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedTarget {
    pub recipient: Recipient,
    pub channel: Channel,
}

pub struct RecipientResolver {
    directory: Arc<dyn RecipientDirectory>,
    policy: RecipientPolicy,
}

impl RecipientResolver {
    pub fn new(directory: Arc<dyn RecipientDirectory>, policy: RecipientPolicy) -> Self {
        Self { directory, policy }
    }

    pub fn directory(&self) -> &Arc<dyn RecipientDirectory> {
        &self.directory
    }

    /// Targets ordered by directory order, then preferred-channel order.
    ///
    /// No rule for the level, or no matching recipients, yields an empty list.
    #[instrument(skip(self, alert), fields(alert_id = %alert.alert_id, risk_level = %alert.risk_level))]
    pub async fn resolve(&self, alert: &AlertEvent) -> Result<Vec<ResolvedTarget>> {
        let Some(rule) = self.policy.rule_for(alert.risk_level) else {
            debug!("No recipient policy for risk level");
            return Ok(Vec::new());
        };

        let filter = RecipientFilter {
            roles: rule.roles.clone(),
            location: alert.location,
            radius_km: rule.radius_km,
        };
        let recipients = self.directory.list_recipients(&filter).await?;
        let listed = recipients.len();

        let mut seen = HashSet::new();
        let mut targets = Vec::new();

        for recipient in recipients {
            if !rule.roles.contains(&recipient.role) {
                continue;
            }
            if !within_radius(&recipient, alert.location.as_ref(), rule.radius_km) {
                continue;
            }

            let preferred = recipient.preferred();
            let channels: &[Channel] = match rule.fanout {
                FanoutStrategy::AllPreferred => &preferred,
                FanoutStrategy::FirstPreferred => &preferred[..preferred.len().min(1)],
            };

            for &channel in channels {
                if seen.insert((recipient.recipient_id.clone(), channel)) {
                    targets.push(ResolvedTarget {
                        recipient: recipient.clone(),
                        channel,
                    });
                }
            }
        }

        debug!(listed, targets = targets.len(), "Resolved recipients");
        Ok(targets)
    }
}

fn within_radius(recipient: &Recipient, center: Option<&Location>, radius_km: Option<f64>) -> bool {
    match (center, radius_km, recipient.location.as_ref()) {
        (Some(center), Some(radius), Some(location)) => center.distance_km(location) <= radius,
        _ => true,
    }
}
