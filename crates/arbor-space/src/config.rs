// SPDX-License-Identifier: Apache-2.0

use arbor_prox::ProxConfig;
use clap::{ArgAction, Parser};
use std::net::SocketAddr;
use std::time::Duration;

/// Command line options for the space server.
#[derive(Debug, Parser)]
#[command(name = "arbor-space", about = "arbor virtual-world space server")]
pub struct Options {
    /// Address the proximity session listener binds to.
    #[arg(long, default_value = "127.0.0.1:7180")]
    pub listen: SocketAddr,

    /// Address the control/introspection listener binds to.
    #[arg(long, default_value = "127.0.0.1:7181")]
    pub control: SocketAddr,

    /// Origin-server identifier echoed in tree root announcements.
    #[arg(long, default_value = "1")]
    pub server_id: String,

    /// Worker tick interval in milliseconds.
    #[arg(long, default_value_t = 100)]
    pub tick_interval_ms: u64,

    /// Split objects into separate static and dynamic indexes.
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    pub separate_dynamic_objects: bool,

    /// Query handler instances per tree: 1 or 2.
    #[arg(long, default_value_t = 2)]
    pub handlers_per_tree: usize,

    /// Seconds an object must stay slow before moving to the static index.
    #[arg(long, default_value_t = 5.0)]
    pub move_to_static_delay: f64,

    /// Speed below which an object counts as static, units per second.
    #[arg(long, default_value_t = 0.05)]
    pub static_velocity_threshold: f32,

    /// Maximum additions + removals per result update.
    #[arg(long, default_value_t = 100)]
    pub max_per_result: usize,

    /// Tree fan-out bound.
    #[arg(long, default_value_t = 10)]
    pub branching_factor: usize,
}

impl Options {
    /// The engine configuration implied by these options.
    pub fn prox_config(&self) -> ProxConfig {
        ProxConfig {
            separate_dynamic_objects: self.separate_dynamic_objects,
            handlers_per_tree: self.handlers_per_tree,
            move_to_static_delay: Duration::from_secs_f64(self.move_to_static_delay),
            static_velocity_threshold: self.static_velocity_threshold,
            max_per_result: self.max_per_result,
            branching_factor: self.branching_factor,
            global_queries: false,
        }
    }

    /// The worker tick interval.
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_produce_a_valid_engine_config() {
        let opts = Options::parse_from(["arbor-space"]);
        assert!(opts.prox_config().validate().is_ok());
        assert_eq!(opts.tick_interval(), Duration::from_millis(100));
    }

    #[test]
    fn split_can_be_disabled_from_the_command_line() {
        let opts = Options::parse_from([
            "arbor-space",
            "--separate-dynamic-objects",
            "false",
            "--handlers-per-tree",
            "1",
        ]);
        let cfg = opts.prox_config();
        assert!(!cfg.separate_dynamic_objects);
        assert!(cfg.validate().is_ok());
    }
}
