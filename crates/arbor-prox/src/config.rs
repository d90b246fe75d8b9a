// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxConfig {
    /// Split objects into separate static and dynamic indexes.
    pub separate_dynamic_objects: bool,
    /// Number of query handler instances per tree: 1 or 2.
    pub handlers_per_tree: usize,
    /// How long an object must stay slow before it moves to the static
    /// index. Keeps short stops (an avatar pausing mid-walk) from bouncing
    /// objects between trees.
    pub move_to_static_delay: Duration,
    /// Speed below which an object counts as static, units per second.
    pub static_velocity_threshold: f32,
    /// Maximum additions + removals per result update.
    pub max_per_result: usize,
    /// Tree fan-out bound; nodes split past this many children.
    pub branching_factor: usize,
    /// Whether handlers accept replicated objects in addition to local ones.
    pub global_queries: bool,
}

impl Default for ProxConfig {
    fn default() -> Self {
        ProxConfig {
            separate_dynamic_objects: true,
            handlers_per_tree: 2,
            move_to_static_delay: Duration::from_secs(5),
            static_velocity_threshold: 0.05,
            max_per_result: 100,
            branching_factor: 10,
            global_queries: false,
        }
    }
}

/// Invalid configuration.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// `handlers_per_tree` must be 1 or 2.
    #[error("handlers_per_tree must be 1 or 2, got {0}")]
    BadHandlerCount(usize),
    /// The static/dynamic split needs two handler instances.
    #[error("separate_dynamic_objects requires handlers_per_tree = 2")]
    SplitNeedsTwoHandlers,
    /// The branching factor must leave room for a split.
    #[error("branching_factor must be at least 2, got {0}")]
    BadBranching(usize),
    /// `max_per_result` must be nonzero.
    #[error("max_per_result must be nonzero")]
    ZeroMaxPerResult,
}

impl ProxConfig {
    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=2).contains(&self.handlers_per_tree) {
            return Err(ConfigError::BadHandlerCount(self.handlers_per_tree));
        }
        if self.separate_dynamic_objects && self.handlers_per_tree != 2 {
            return Err(ConfigError::SplitNeedsTwoHandlers);
        }
        if self.branching_factor < 2 {
            return Err(ConfigError::BadBranching(self.branching_factor));
        }
        if self.max_per_result == 0 {
            return Err(ConfigError::ZeroMaxPerResult);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert_eq!(ProxConfig::default().validate(), Ok(()));
    }

    #[test]
    fn split_without_two_handlers_is_rejected() {
        let cfg = ProxConfig {
            handlers_per_tree: 1,
            ..ProxConfig::default()
        };
        assert_eq!(cfg.validate(), Err(ConfigError::SplitNeedsTwoHandlers));
    }
}
