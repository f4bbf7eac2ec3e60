//! Recipient directory entries and delivery channels.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

use super::alert::Location;

/// A delivery medium.
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
pub enum Channel {
    Sms,
    Push,
    Email,
}

impl Channel {
    pub const ALL: [Channel; 3] = [Channel::Sms, Channel::Push, Channel::Email];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sms => "sms",
            Self::Push => "push",
            Self::Email => "email",
        }
    }
}

/// Recipient role in the health system.
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
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Role {
    Citizen,
    HealthWorker,
    Admin,
}

impl Role {
    pub const ALL: [Role; 3] = [Role::Citizen, Role::HealthWorker, Role::Admin];
}

/// A directory entry. Read-only from the pipeline's point of view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recipient {
    pub recipient_id: String,
    pub role: Role,
    /// Channel -> phone number / device token / email address.
    #[serde(default)]
    pub channel_addresses: BTreeMap<Channel, String>,
    /// Ordered by preference, most preferred first.
    #[serde(default)]
    pub preferred_channels: Vec<Channel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
    /// Extra template parameters, e.g. `name` or `district`.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, String>,
}

impl Recipient {
    pub fn new(recipient_id: impl Into<String>, role: Role) -> Self {
        Self {
            recipient_id: recipient_id.into(),
            role,
            channel_addresses: BTreeMap::new(),
            preferred_channels: Vec::new(),
            location: None,
            attributes: BTreeMap::new(),
        }
    }

    /// Register an address and append the channel to the preference list.
    pub fn with_channel(mut self, channel: Channel, address: impl Into<String>) -> Self {
        self.channel_addresses.insert(channel, address.into());
        if !self.preferred_channels.contains(&channel) {
            self.preferred_channels.push(channel);
        }
        self
    }

    pub fn with_location(mut self, location: Location) -> Self {
        self.location = Some(location);
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn address_for(&self, channel: Channel) -> Option<&str> {
        self.channel_addresses
            .get(&channel)
            .map(String::as_str)
            .filter(|a| !a.trim().is_empty())
    }

    /// Preferred channels with duplicates removed, order kept.
    pub fn preferred(&self) -> Vec<Channel> {
        let mut seen = HashSet::new();
        self.preferred_channels
            .iter()
            .copied()
            .filter(|c| seen.insert(*c))
            .collect()
    }
}
