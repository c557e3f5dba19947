//! Gated features and their static properties.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A user action guarded by a quota and a cooldown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Feature {
    Conversation,
    Refresh,
    Filter,
    Search,
    Message,
}

/// How a feature decides whether the blocking popup is shown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PopupPolicy {
    /// Non-exempt callers always see the popup, so the UI can render the
    /// remaining count or the timer before the limit is hit.
    AlwaysShow,
    /// The popup appears only once the limit is reached or a cooldown runs.
    Threshold,
}

impl Feature {
    pub const ALL: [Feature; 5] = [
        Feature::Conversation,
        Feature::Refresh,
        Feature::Filter,
        Feature::Search,
        Feature::Message,
    ];

    /// Stable identifier used in store keys, config sections and events.
    pub fn id(self) -> &'static str {
        match self {
            Feature::Conversation => "conversation",
            Feature::Refresh => "refresh",
            Feature::Filter => "filter",
            Feature::Search => "search",
            Feature::Message => "message",
        }
    }

    pub fn popup_policy(self) -> PopupPolicy {
        match self {
            Feature::Conversation | Feature::Refresh | Feature::Filter => PopupPolicy::AlwaysShow,
            Feature::Search | Feature::Message => PopupPolicy::Threshold,
        }
    }

    /// Quota used when configuration is silent or reports zero.
    pub fn default_limit(self) -> u32 {
        match self {
            Feature::Conversation => 5,
            Feature::Refresh => 10,
            Feature::Filter => 10,
            Feature::Search => 20,
            Feature::Message => 50,
        }
    }

    pub fn default_cooldown_secs(self) -> u64 {
        match self {
            Feature::Conversation => 1800,
            Feature::Refresh => 600,
            Feature::Filter => 600,
            Feature::Search => 300,
            Feature::Message => 3600,
        }
    }

    /// Only conversations are subject to the shadow-ban override.
    pub fn is_moderated(self) -> bool {
        self == Feature::Conversation
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

impl FromStr for Feature {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Feature::ALL
            .into_iter()
            .find(|f| f.id().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown feature: {s}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_parse_back() {
        for feature in Feature::ALL {
            assert_eq!(feature.id().parse::<Feature>().unwrap(), feature);
        }
        assert!("chat".parse::<Feature>().is_err());
    }

    #[test]
    fn popup_families() {
        assert_eq!(Feature::Conversation.popup_policy(), PopupPolicy::AlwaysShow);
        assert_eq!(Feature::Filter.popup_policy(), PopupPolicy::AlwaysShow);
        assert_eq!(Feature::Search.popup_policy(), PopupPolicy::Threshold);
        assert_eq!(Feature::Message.popup_policy(), PopupPolicy::Threshold);
    }

    #[test]
    fn serde_uses_lowercase_ids() {
        let json = serde_json::to_string(&Feature::Refresh).unwrap();
        assert_eq!(json, "\"refresh\"");
    }
}
