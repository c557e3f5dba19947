//! Exemptions evaluated before any quota math.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;

use super::limit::SharedConfig;
use crate::clock::{from_epoch_ms, to_epoch_ms};
use crate::storage::StateStore;

/// Reports whether the caller's subscription tier is at or above the
/// exempting tier.
pub trait TierSource: Send + Sync {
    fn is_exempt_tier(&self) -> bool;
}

/// Reports when the caller first used the product.
pub trait FirstUseSource: Send + Sync {
    fn first_use(&self) -> Option<DateTime<Utc>>;
}

impl<F> TierSource for F
where
    F: Fn() -> bool + Send + Sync,
{
    fn is_exempt_tier(&self) -> bool {
        self()
    }
}

impl<F> FirstUseSource for F
where
    F: Fn() -> Option<DateTime<Utc>> + Send + Sync,
{
    fn first_use(&self) -> Option<DateTime<Utc>> {
        self()
    }
}

/// Session fields kept in the state store by the profile collaborator.
pub struct StoredSession {
    store: Arc<dyn StateStore>,
}

impl StoredSession {
    pub const EXEMPT_TIER_KEY: &'static str = "session.exempt_tier";
    pub const FIRST_USE_KEY: &'static str = "session.first_use_ms";

    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }

    pub fn set_exempt_tier(&self, exempt: bool) -> crate::Result<()> {
        self.store.set_bool(Self::EXEMPT_TIER_KEY, exempt)?;
        Ok(())
    }

    pub fn set_first_use(&self, at: DateTime<Utc>) -> crate::Result<()> {
        self.store.set_i64(Self::FIRST_USE_KEY, to_epoch_ms(at))?;
        Ok(())
    }
}

impl TierSource for StoredSession {
    fn is_exempt_tier(&self) -> bool {
        match self.store.get_bool(Self::EXEMPT_TIER_KEY) {
            Ok(exempt) => exempt.unwrap_or(false),
            Err(e) => {
                warn!(error = %e, "failed to read subscription tier, treating as not exempt");
                false
            }
        }
    }
}

impl FirstUseSource for StoredSession {
    fn first_use(&self) -> Option<DateTime<Utc>> {
        match self.store.get_i64(Self::FIRST_USE_KEY) {
            Ok(ms) => ms.and_then(from_epoch_ms),
            Err(e) => {
                warn!(error = %e, "failed to read first-use timestamp");
                None
            }
        }
    }
}

/// Which exemption let a caller through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BypassReason {
    ExemptTier,
    NewUserGrace,
}

/// Subscription-tier and new-user-grace exemptions.
///
/// Either one alone is enough. The tier is checked first.
pub struct BypassPolicy {
    tier: Arc<dyn TierSource>,
    first_use: Arc<dyn FirstUseSource>,
    config: SharedConfig,
}

impl BypassPolicy {
    pub fn new(
        tier: Arc<dyn TierSource>,
        first_use: Arc<dyn FirstUseSource>,
        config: SharedConfig,
    ) -> Self {
        Self {
            tier,
            first_use,
            config,
        }
    }

    pub fn reason(&self, now: DateTime<Utc>) -> Option<BypassReason> {
        if self.tier.is_exempt_tier() {
            return Some(BypassReason::ExemptTier);
        }

        let grace = self
            .config
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .grace_period();
        if grace <= chrono::Duration::zero() {
            return None;
        }

        let first_use = self.first_use.first_use()?;
        if now - first_use < grace {
            Some(BypassReason::NewUserGrace)
        } else {
            None
        }
    }

    pub fn is_exempt(&self, now: DateTime<Utc>) -> bool {
        self.reason(now).is_some()
    }
}
