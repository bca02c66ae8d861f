//! Cache lifecycle
//!
//! A [`Cache`] is the supervisory wrapper around one in-memory dataset. It
//! records a load state, a running count of loaded items, and when it was
//! created. Reads of the dataset must go through [`Cache::ensure_loaded`].
//!
//! Legal transitions:
//!
//! ```text
//! UNINITIALIZED ─┐
//! LOADED ────────┼─> UPDATING ─> LOADED | ERROR
//! ERROR ─────────┘
//! ```

use crate::error::{Result, TownsError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicI64, AtomicU8, Ordering};
use std::time::Instant;

/// Current status of a cache
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CacheStatus {
    Uninitialized,
    Updating,
    Loaded,
    Error,
}

impl CacheStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheStatus::Uninitialized => "UNINITIALIZED",
            CacheStatus::Updating => "UPDATING",
            CacheStatus::Loaded => "LOADED",
            CacheStatus::Error => "ERROR",
        }
    }

    /// States reachable from this one through [`Cache::transition`]
    pub fn legal_next_states(&self) -> &'static [CacheStatus] {
        match self {
            CacheStatus::Uninitialized | CacheStatus::Loaded | CacheStatus::Error => {
                &[CacheStatus::Updating]
            }
            CacheStatus::Updating => &[CacheStatus::Loaded, CacheStatus::Error],
        }
    }

    pub fn can_transition_to(&self, next: CacheStatus) -> bool {
        self.legal_next_states().contains(&next)
    }

    fn to_u8(self) -> u8 {
        match self {
            CacheStatus::Uninitialized => 0,
            CacheStatus::Updating => 1,
            CacheStatus::Loaded => 2,
            CacheStatus::Error => 3,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => CacheStatus::Updating,
            2 => CacheStatus::Loaded,
            3 => CacheStatus::Error,
            _ => CacheStatus::Uninitialized,
        }
    }
}

impl std::fmt::Display for CacheStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Named load-state gate for one cached dataset.
///
/// Any thread may read the status; only the loader of the dataset should
/// move it. [`Cache::transition`] rejects out-of-order moves, which also
/// stops two loads from running against the same cache at once.
#[derive(Debug)]
pub struct Cache {
    name: String,
    status: AtomicU8,
    items_loaded: AtomicI64,
    initialized_at: Instant,
    initialized_at_utc: DateTime<Utc>,
}

impl Cache {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: AtomicU8::new(CacheStatus::Uninitialized.to_u8()),
            items_loaded: AtomicI64::new(0),
            initialized_at: Instant::now(),
            initialized_at_utc: Utc::now(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn status(&self) -> CacheStatus {
        CacheStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    /// Unchecked status change; the caller owns sequencing
    pub fn set_status(&self, status: CacheStatus) {
        self.status.store(status.to_u8(), Ordering::Release);
    }

    /// Checked status change against the transition table
    pub fn transition(&self, next: CacheStatus) -> Result<CacheStatus> {
        let mut current = self.status();
        loop {
            if !current.can_transition_to(next) {
                return Err(TownsError::IllegalTransition {
                    name: self.name.clone(),
                    from: current,
                    to: next,
                });
            }
            match self.status.compare_exchange(
                current.to_u8(),
                next.to_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(current),
                Err(actual) => current = CacheStatus::from_u8(actual),
            }
        }
    }

    pub fn has_loaded(&self) -> bool {
        self.status() == CacheStatus::Loaded
    }

    /// `Err(CacheNotLoaded)` unless the cache is LOADED
    pub fn ensure_loaded(&self) -> Result<()> {
        let status = self.status();
        if status == CacheStatus::Loaded {
            Ok(())
        } else {
            Err(TownsError::CacheNotLoaded {
                name: self.name.clone(),
                status,
            })
        }
    }

    pub fn illegal_access_message(&self) -> String {
        format!(
            "Exception attempting to access unloaded {} cache (current state: {})",
            self.name,
            self.status()
        )
    }

    pub fn items_loaded(&self) -> i64 {
        self.items_loaded.load(Ordering::Relaxed)
    }

    pub fn increment_items_loaded(&self) {
        self.items_loaded.fetch_add(1, Ordering::Relaxed);
    }

    /// Not clamped: a negative count points at an unbalanced caller
    pub fn decrement_items_loaded(&self) {
        self.items_loaded.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn clear_items_loaded(&self) {
        self.items_loaded.store(0, Ordering::Relaxed);
    }

    /// Whole seconds since this cache object was constructed
    pub fn time_since_initialization(&self) -> u64 {
        self.initialized_at.elapsed().as_secs()
    }

    pub fn initialized_at(&self) -> DateTime<Utc> {
        self.initialized_at_utc
    }
}
