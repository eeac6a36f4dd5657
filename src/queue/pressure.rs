// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Queue pressure per operation kind.
//!
//! # Example
//!
//! ```
//! use fleet_sync::QueuePressure;
//!
//! assert_eq!(QueuePressure::from_fill(500, 1000), QueuePressure::Normal);
//! assert_eq!(QueuePressure::from_fill(850, 1000), QueuePressure::Warn);
//! assert_eq!(QueuePressure::from_fill(1000, 1000), QueuePressure::Full);
//! assert!(QueuePressure::Full.evicts_on_enqueue());
//! ```

/// Fill level of one kind's lane.
///
/// - **Normal** (< 80%): admit without comment
/// - **Warn** (80-100%): admit, emit warnings
/// - **Full** (100%): the next admission evicts, or is rejected if nothing is evictable
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum QueuePressure {
    Normal = 0,
    Warn = 1,
    Full = 2,
}

impl QueuePressure {
    pub const WARN_RATIO: f64 = 0.80;

    #[must_use]
    pub fn from_fill(len: usize, capacity: usize) -> Self {
        if len >= capacity {
            return Self::Full;
        }
        match len as f64 / capacity as f64 {
            p if p < Self::WARN_RATIO => Self::Normal,
            _ => Self::Warn,
        }
    }

    /// Proof of delivery is never evicted: past the soft threshold it only warns,
    /// and is full only when a hard limit is configured and reached.
    #[must_use]
    pub fn for_proof(len: usize, warn_threshold: usize, hard_limit: Option<usize>) -> Self {
        match hard_limit {
            Some(limit) if len >= limit => Self::Full,
            _ if len >= warn_threshold => Self::Warn,
            _ => Self::Normal,
        }
    }

    #[must_use]
    pub fn evicts_on_enqueue(&self) -> bool {
        matches!(self, Self::Full)
    }

    #[must_use]
    pub fn description(&self) -> &'static str {
        match self {
            Self::Normal => "Normal operation",
            Self::Warn => "Warning - queue filling while offline",
            Self::Full => "Full - oldest pending records are being evicted",
        }
    }
}

impl std::fmt::Display for QueuePressure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Normal => write!(f, "Normal"),
            Self::Warn => write!(f, "Warn"),
            Self::Full => write!(f, "Full"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thresholds() {
        assert_eq!(QueuePressure::from_fill(0, 1000), QueuePressure::Normal);
        assert_eq!(QueuePressure::from_fill(799, 1000), QueuePressure::Normal);
        assert_eq!(QueuePressure::from_fill(800, 1000), QueuePressure::Warn);
        assert_eq!(QueuePressure::from_fill(999, 1000), QueuePressure::Warn);
        assert_eq!(QueuePressure::from_fill(1000, 1000), QueuePressure::Full);
    }

    #[test]
    fn test_zero_capacity_is_full() {
        assert_eq!(QueuePressure::from_fill(0, 0), QueuePressure::Full);
    }

    #[test]
    fn test_proof_pressure() {
        assert_eq!(QueuePressure::for_proof(10, 200, None), QueuePressure::Normal);
        assert_eq!(QueuePressure::for_proof(5_000, 200, None), QueuePressure::Warn);
        assert_eq!(QueuePressure::for_proof(250, 200, Some(250)), QueuePressure::Full);
    }

    #[test]
    fn test_ordering_and_display() {
        assert!(QueuePressure::Normal < QueuePressure::Warn);
        assert!(QueuePressure::Warn < QueuePressure::Full);
        assert_eq!(QueuePressure::Warn.to_string(), "Warn");
        assert!(!QueuePressure::Warn.evicts_on_enqueue());
        assert!(QueuePressure::Full.evicts_on_enqueue());
        assert!(QueuePressure::Full.description().contains("evicted"));
    }
}
