// Copyright 2024 The BatchLink Authors. All rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//    http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use serde::{Deserialize, Serialize};

use crate::serde_utils::{
    convert_numeric_with_shellexpand, convert_optional_numeric_with_shellexpand,
    convert_string_with_shellexpand, convert_vec_string_with_shellexpand,
};

/// Top level configuration for the coordinator binary.
#[derive(Deserialize, Serialize, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct CoordinatorConfig {
    /// Target selection and batch cycling knobs.
    #[serde(default)]
    pub scheduler: SchedulerSpec,

    /// The simulated network the coordinator runs against.
    pub sim: SimSpec,
}

#[derive(Deserialize, Serialize, Debug, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct SchedulerSpec {
    /// Nodes that are never rated as targets and never receive workers.
    #[serde(default, deserialize_with = "convert_vec_string_with_shellexpand")]
    pub exclude_nodes: Vec<String>,

    /// Memory held back on the operator's own node so interactive tooling
    /// keeps room to run.
    ///
    /// Default: 1024
    #[serde(default, deserialize_with = "convert_numeric_with_shellexpand")]
    pub reserve_home_gb: u64,

    /// Fraction of a target's available money drained per batch cycle.
    /// Zero or omitted selects the adaptive thread-budget search instead
    /// of a fixed fraction.
    #[serde(default)]
    pub hack_ratio: f64,

    /// Buffer between paired phase completions in milliseconds. Absorbs
    /// host scheduling jitter.
    ///
    /// Default: 50
    #[serde(default, deserialize_with = "convert_numeric_with_shellexpand")]
    pub batch_gap_ms: u64,

    /// Score multiplier a challenger target must beat before the scheduler
    /// abandons its current target. Guards against re-prepare thrash.
    ///
    /// Default: 1.1
    #[serde(default)]
    pub switch_margin: f64,

    /// Pause between consecutive batch schedules in milliseconds.
    ///
    /// Default: 500
    #[serde(default, deserialize_with = "convert_numeric_with_shellexpand")]
    pub schedule_breather_ms: u64,

    /// Sleep after the network saturates before re-rating targets, in
    /// milliseconds.
    ///
    /// Default: 1000
    #[serde(default, deserialize_with = "convert_numeric_with_shellexpand")]
    pub idle_sleep_ms: u64,

    /// Interval of the process liveness sweep used when the host offers no
    /// push exit notifications, in milliseconds.
    ///
    /// Default: 250
    #[serde(
        default,
        deserialize_with = "convert_optional_numeric_with_shellexpand"
    )]
    pub exit_poll_interval_ms: Option<u64>,
}

#[derive(Deserialize, Serialize, Debug, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct SimSpec {
    /// Hacking skill of the simulated player, compared against each node's
    /// `required_skill` for target eligibility.
    ///
    /// Default: 1
    #[serde(default, deserialize_with = "convert_numeric_with_shellexpand")]
    pub player_skill: u32,

    /// Every machine in the simulated network. A node with money is also a
    /// candidate target; a node with memory is also worker capacity.
    pub nodes: Vec<SimNodeConfig>,
}

#[derive(Deserialize, Serialize, Debug, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct SimNodeConfig {
    #[serde(deserialize_with = "convert_string_with_shellexpand")]
    pub name: String,

    /// Total memory of this node in GB. Zero means no worker capacity.
    #[serde(default)]
    pub ram_gb: f64,

    /// Whether scripts may be placed on this node.
    #[serde(default)]
    pub admin_rights: bool,

    /// Nodes bought by the operator are worker capacity but never targets.
    #[serde(default)]
    pub operator_owned: bool,

    /// Maximum money this node can hold. Zero makes it ineligible as a
    /// target.
    #[serde(default)]
    pub money_max: f64,

    /// Starting money.
    ///
    /// Default: `money_max`
    #[serde(default)]
    pub money_available: Option<f64>,

    /// Lowest security level this node can be weakened to.
    ///
    /// Default: 1
    #[serde(default)]
    pub min_security: f64,

    /// Starting security level.
    ///
    /// Default: `min_security`
    #[serde(default)]
    pub security: Option<f64>,

    /// Growth parameter feeding the profitability rating and grow-thread
    /// sizing. Values are typically in the tens.
    #[serde(default)]
    pub growth_rate: f64,

    /// Minimum player skill needed to operate on this node.
    #[serde(default, deserialize_with = "convert_numeric_with_shellexpand")]
    pub required_skill: u32,

    /// Duration of one hack operation at minimum security, in milliseconds.
    /// Weaken and grow durations derive from this.
    ///
    /// Default: 5000
    #[serde(default, deserialize_with = "convert_numeric_with_shellexpand")]
    pub hack_time_ms: u64,
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn parses_full_config() {
        let cfg: CoordinatorConfig = serde_json5::from_str(
            r#"{
                scheduler: {
                    exclude_nodes: ["home"],
                    reserve_home_gb: 64,
                    hack_ratio: 0.35,
                    batch_gap_ms: 50,
                },
                sim: {
                    player_skill: 100,
                    nodes: [
                        {
                            name: "alpha",
                            ram_gb: 128,
                            admin_rights: true,
                            money_max: 2e6,
                            money_available: 1e6,
                            min_security: 1,
                            security: 5,
                            growth_rate: 30,
                            hack_time_ms: 1000,
                        },
                    ],
                },
            }"#,
        )
        .unwrap();

        assert_eq!(cfg.scheduler.exclude_nodes, vec!["home".to_string()]);
        assert_eq!(cfg.scheduler.reserve_home_gb, 64);
        assert_eq!(cfg.scheduler.batch_gap_ms, 50);
        assert_eq!(cfg.scheduler.exit_poll_interval_ms, None);
        assert_eq!(cfg.sim.player_skill, 100);
        assert_eq!(cfg.sim.nodes.len(), 1);
        let node = &cfg.sim.nodes[0];
        assert_eq!(node.name, "alpha");
        assert_eq!(node.money_available, Some(1e6));
        assert_eq!(node.security, Some(5.0));
        assert_eq!(node.required_skill, 0);
    }

    #[test]
    fn numeric_fields_expand_environment_variables() {
        // Safety: tests in this module do not race on this variable.
        unsafe { std::env::set_var("BL_TEST_RESERVE", "32") };
        let spec: SchedulerSpec =
            serde_json5::from_str(r#"{ reserve_home_gb: "$BL_TEST_RESERVE" }"#).unwrap();
        assert_eq!(spec.reserve_home_gb, 32);
    }

    #[test]
    fn empty_optional_numeric_is_none() {
        let spec: SchedulerSpec =
            serde_json5::from_str(r#"{ exit_poll_interval_ms: "" }"#).unwrap();
        assert_eq!(spec.exit_poll_interval_ms, None);
    }

    #[test]
    fn rejects_unknown_fields() {
        let result = serde_json5::from_str::<SchedulerSpec>(r#"{ reserve_ram: 12 }"#);
        assert!(result.is_err());
    }
}
