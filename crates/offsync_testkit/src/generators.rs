//! Property-based test generators using proptest.
//!
//! Provides strategies for payloads, local ids and scripts of device
//! activity that stay within validation limits.

use crate::fixtures::{group_payload, post_payload};
use offsync_protocol::{Payload, MAX_GROUP_NAME, MAX_POST_CONTENT};
use proptest::prelude::*;

/// Strategy for generating local ids.
pub fn local_id_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("L[0-9a-f]{1,12}").expect("Invalid regex")
}

/// Strategy for generating valid post bodies.
pub fn post_content_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-zA-Z0-9 .,!?]{1,80}")
        .expect("Invalid regex")
        .prop_filter("Content must not be blank", |s| !s.trim().is_empty())
        .prop_map(|s| s.chars().take(MAX_POST_CONTENT).collect())
}

/// Strategy for generating valid post payloads.
pub fn post_payload_strategy() -> impl Strategy<Value = Payload> {
    post_content_strategy().prop_map(|content| post_payload(&content))
}

/// Strategy for generating valid group payloads.
pub fn group_payload_strategy() -> impl Strategy<Value = Payload> {
    (
        prop::string::string_regex("[a-zA-Z][a-zA-Z0-9 ]{0,30}").expect("Invalid regex"),
        prop::collection::vec(
            prop::string::string_regex("u[0-9]{1,3}").expect("Invalid regex"),
            0..6,
        ),
    )
        .prop_map(|(name, members)| {
            let name: String = name.chars().take(MAX_GROUP_NAME).collect();
            let members: Vec<&str> = members.iter().map(String::as_str).collect();
            group_payload(&name, &members)
        })
}

/// One step of simulated device activity.
#[derive(Debug, Clone)]
pub enum DeviceAction {
    /// Write a post on a device.
    Write {
        /// Device index.
        device: usize,
        /// Index into the shared pool of local ids.
        slot: usize,
        /// Post body.
        content: String,
    },
    /// Run a sync cycle on a device.
    Sync {
        /// Device index.
        device: usize,
    },
    /// Pull the change feed on a device.
    Pull {
        /// Device index.
        device: usize,
    },
}

/// Strategy for generating one device action.
pub fn device_action_strategy(devices: usize, slots: usize) -> impl Strategy<Value = DeviceAction> {
    prop_oneof![
        3 => (0..devices, 0..slots, post_content_strategy())
            .prop_map(|(device, slot, content)| DeviceAction::Write { device, slot, content }),
        2 => (0..devices).prop_map(|device| DeviceAction::Sync { device }),
        1 => (0..devices).prop_map(|device| DeviceAction::Pull { device }),
    ]
}

/// Strategy for generating a script of device actions.
pub fn device_script_strategy(
    devices: usize,
    slots: usize,
    min_steps: usize,
    max_steps: usize,
) -> impl Strategy<Value = Vec<DeviceAction>> {
    prop::collection::vec(device_action_strategy(devices, slots), min_steps..max_steps)
}

/// Configuration for property tests.
#[derive(Debug, Clone)]
pub struct PropTestConfig {
    /// Number of test cases to run.
    pub cases: u32,
    /// Maximum shrink iterations.
    pub max_shrink_iters: u32,
}

impl Default for PropTestConfig {
    fn default() -> Self {
        Self {
            cases: 256,
            max_shrink_iters: 1000,
        }
    }
}

impl PropTestConfig {
    /// Creates a configuration for quick tests.
    #[must_use]
    pub fn quick() -> Self {
        Self {
            cases: 32,
            max_shrink_iters: 100,
        }
    }

    /// Converts to proptest config.
    #[must_use]
    pub fn to_proptest_config(&self) -> ProptestConfig {
        ProptestConfig {
            cases: self.cases,
            max_shrink_iters: self.max_shrink_iters,
            ..ProptestConfig::default()
        }
    }
}
