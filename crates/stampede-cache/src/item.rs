use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::dependency::{Dependency, DependencyContext};
use crate::error::{Error, InvalidArgument, StoreError};

/// The current wall clock time in fractional seconds since the epoch.
pub fn timestamp() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0.0, |since| since.as_secs_f64())
}

/// Rejects negative and NaN `beta` values.
pub(crate) fn check_beta(beta: f64) -> Result<(), InvalidArgument> {
    if beta.is_nan() || beta < 0.0 {
        return Err(InvalidArgument::Beta(beta));
    }
    Ok(())
}

/// Decides whether an entry that is not yet hard-expired should be recomputed early.
///
/// This is the XFetch algorithm: `delta` is the time since the entry was last written, rounded
/// up to milliseconds, and the entry counts as expired if
/// `expiry <= now - delta * beta * ln(r)`. Since `ln(r) <= 0` for `r` in `(0, 1]`, the synthetic
/// expiry lies at or after `now`, and the closer `now` is to `expiry` (or the larger `delta` and
/// `beta` are), the more likely the entry is recomputed early.
///
/// `r` must be drawn uniformly from `(0, 1]`.
pub fn early_expiration(expiry: f64, updated: f64, now: f64, beta: f64, r: f64) -> bool {
    let delta = (1000.0 * (now - updated)).ceil() / 1000.0;
    let synthetic_expiry = now - delta * beta * r.ln();
    expiry <= synthetic_expiry
}

/// Metadata stored alongside every cached value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheItem {
    /// The normalized key this item was written under.
    pub(crate) key: String,
    /// The epoch second at which the entry hard-expires, `None` if it never does.
    pub(crate) expiry: Option<i64>,
    /// The dependency, with its baseline snapshot already captured.
    pub(crate) dependency: Option<Dependency>,
    /// When the entry was last written, in fractional epoch seconds.
    pub(crate) updated: f64,
}

impl CacheItem {
    /// Creates an item for `key`, written right now.
    ///
    /// The dependency is stored as-is, see [`evaluate_dependency`](Self::evaluate_dependency).
    pub fn new(key: impl Into<String>, expiry: Option<i64>, dependency: Option<Dependency>) -> Self {
        Self {
            key: key.into(),
            expiry,
            dependency,
            updated: timestamp(),
        }
    }

    /// Overrides when the entry was last written, in fractional epoch seconds.
    pub fn with_updated(mut self, updated: f64) -> Self {
        self.updated = updated;
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn expiry(&self) -> Option<i64> {
        self.expiry
    }

    pub fn dependency(&self) -> Option<&Dependency> {
        self.dependency.as_ref()
    }

    pub fn updated(&self) -> f64 {
        self.updated
    }

    /// Captures the baseline snapshot of the attached dependency.
    pub fn evaluate_dependency(&mut self, ctx: &DependencyContext<'_>) -> Result<(), StoreError> {
        match self.dependency {
            Some(ref mut dependency) => dependency.evaluate(ctx),
            None => Ok(()),
        }
    }

    /// Checks whether the entry should be recomputed.
    ///
    /// A changed dependency always expires the entry. Otherwise, entries without an expiry never
    /// expire, entries past their expiry always do, and entries in between are subject to
    /// [`early_expiration`]. A `beta` of `0` disables early expiration.
    pub fn expired(&self, beta: f64, ctx: &DependencyContext<'_>) -> Result<bool, Error> {
        check_beta(beta)?;

        if let Some(ref dependency) = self.dependency {
            if dependency.is_changed(ctx)? {
                tracing::trace!(key = %self.key, "Dependency changed");
                return Ok(true);
            }
        }

        let Some(expiry) = self.expiry else {
            return Ok(false);
        };

        let now = timestamp();
        let expiry = expiry as f64;
        if expiry <= now {
            return Ok(true);
        }

        // `random` yields values in `[0, 1)`
        let r = 1.0 - rand::random::<f64>();
        Ok(early_expiration(expiry, self.updated, now, beta, r))
    }
}
