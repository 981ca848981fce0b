//! Limits and policies for turn execution and result eviction.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Resource limits for the execution coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorLimits {
    /// Maximum number of worker threads executing turn computations
    /// concurrently across sessions.
    pub max_workers: usize,
    /// Maximum idle window between stream chunks before the consumer
    /// reports a timeout.
    #[serde(with = "duration_ms")]
    pub stream_idle_timeout: Duration,
}

impl Default for CoordinatorLimits {
    fn default() -> Self {
        Self {
            max_workers: 4,
            stream_idle_timeout: Duration::from_secs(60),
        }
    }
}

/// Policy for offloading oversized tool results.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvictionPolicy {
    /// Results longer than this many characters are written to storage and
    /// replaced with a path reference.
    pub max_inline_chars: usize,
    /// Virtual directory evicted results are written under.
    pub result_dir: String,
}

impl Default for EvictionPolicy {
    fn default() -> Self {
        Self {
            max_inline_chars: 50_000,
            result_dir: "/tool_results".to_string(),
        }
    }
}

/// Helper for serializing Duration as milliseconds
mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_default_limits() {
        let limits = CoordinatorLimits::default();

        assert_eq!(limits.max_workers, 4);
        assert_eq!(limits.stream_idle_timeout, Duration::from_secs(60));
    }

    #[test]
    fn test_limits_serialization() {
        let limits = CoordinatorLimits {
            max_workers: 2,
            stream_idle_timeout: Duration::from_secs(5),
        };

        let json = serde_json::to_string(&limits).unwrap();
        let deserialized: CoordinatorLimits = serde_json::from_str(&json).unwrap();

        assert_eq!(deserialized.max_workers, 2);
        assert_eq!(deserialized.stream_idle_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_limits_serialization_format() {
        let limits = CoordinatorLimits {
            max_workers: 1,
            stream_idle_timeout: Duration::from_millis(5000),
        };

        let json = serde_json::to_string(&limits).unwrap();

        // Timeout should be serialized as milliseconds
        assert!(json.contains("\"stream_idle_timeout\":5000"));
    }

    #[test]
    fn test_default_eviction_policy() {
        let policy = EvictionPolicy::default();

        assert_eq!(policy.max_inline_chars, 50_000);
        assert_eq!(policy.result_dir, "/tool_results");
    }
}
