//! Configuration types for the translib-subscribe crate
//!
//! This module defines the knobs of the subscription engine: sample
//! interval floor, buffering between the store and session workers, scan
//! batch sizes and the namespaces allowed for dynamic data sources.

use crate::error::SubscribeError;

/// Lowest sample interval supported by the system, in seconds
pub const MIN_SUBSCRIBE_INTERVAL: u32 = 20;

/// Configuration for the subscription engine
#[derive(Debug, Clone)]
pub struct SubscribeConfig {
    /// Default and floor of the minimum sample interval reported by
    /// `is_subscribe_supported`, in seconds
    /// Default: 20
    pub min_sample_interval: u32,

    /// Capacity of the channel between store callbacks and a session worker
    /// Default: 1000
    pub change_buffer_size: usize,

    /// Batch hint for key scans during initial sync
    /// Default: 100
    pub key_scan_count_hint: usize,

    /// Batch hint for field scans during initial sync
    /// Default: 1000
    pub field_scan_count_hint: usize,

    /// Namespaces (first path element prefixes) allowed for dynamic sources
    /// Default: ["openconfig-"]
    pub dynamic_source_prefixes: Vec<String>,
}

impl Default for SubscribeConfig {
    fn default() -> Self {
        Self {
            min_sample_interval: MIN_SUBSCRIBE_INTERVAL,
            change_buffer_size: 1000,
            key_scan_count_hint: 100,
            field_scan_count_hint: 1000,
            dynamic_source_prefixes: vec!["openconfig-".to_string()],
        }
    }
}

impl SubscribeConfig {
    /// Create a SubscribeConfig with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Small buffers and scan batches, for constrained targets
    pub fn resource_efficient() -> Self {
        Self {
            change_buffer_size: 100,
            key_scan_count_hint: 20,
            field_scan_count_hint: 200,
            ..Default::default()
        }
    }

    /// Large buffers for bursty tables such as counters
    pub fn high_throughput() -> Self {
        Self {
            change_buffer_size: 10_000,
            key_scan_count_hint: 1000,
            field_scan_count_hint: 5000,
            ..Default::default()
        }
    }

    /// Validate the configuration and return any issues
    pub fn validate(&self) -> Result<(), SubscribeError> {
        if self.min_sample_interval == 0 {
            return Err(SubscribeError::Config(
                "Minimum sample interval must be greater than 0".to_string(),
            ));
        }

        if self.change_buffer_size == 0 {
            return Err(SubscribeError::Config(
                "Change buffer size must be greater than 0".to_string(),
            ));
        }

        if self.key_scan_count_hint == 0 || self.field_scan_count_hint == 0 {
            return Err(SubscribeError::Config(
                "Scan count hints must be greater than 0".to_string(),
            ));
        }

        if self.dynamic_source_prefixes.iter().any(String::is_empty) {
            return Err(SubscribeError::Config(
                "Dynamic source prefixes must not be empty".to_string(),
            ));
        }

        Ok(())
    }

    /// Builder pattern methods for fluent configuration

    pub fn with_min_sample_interval(mut self, seconds: u32) -> Self {
        self.min_sample_interval = seconds;
        self
    }

    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.change_buffer_size = size;
        self
    }

    pub fn with_scan_count_hints(mut self, keys: usize, fields: usize) -> Self {
        self.key_scan_count_hint = keys;
        self.field_scan_count_hint = fields;
        self
    }

    pub fn with_dynamic_source_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.dynamic_source_prefixes.push(prefix.into());
        self
    }

    /// Whether a first path element belongs to an allowed dynamic namespace
    pub fn is_dynamic_source_allowed(&self, first_elem: &str) -> bool {
        self.dynamic_source_prefixes
            .iter()
            .any(|p| first_elem.starts_with(p.as_str()))
    }
}
