// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use hashbrown::HashMap;
use std::sync::RwLock;

/// Flag gating the v4 integration protocol.
pub const FLAG_PROTOCOL_V4: &str = "protocol_v4";

pub trait FeatureFlagRetriever: Send + Sync {
    /// Returns `None` when the flag was never set.
    fn get_feature_flag(&self, name: &str) -> Option<bool>;
}

/// In-memory flag store, typically fed from agent configuration or the command channel.
#[derive(Debug, Default)]
pub struct FeatureFlagManager {
    flags: RwLock<HashMap<String, bool>>,
}

impl FeatureFlagManager {
    pub fn new<I, S>(initial: I) -> Self
    where
        I: IntoIterator<Item = (S, bool)>,
        S: Into<String>,
    {
        Self {
            flags: RwLock::new(
                initial
                    .into_iter()
                    .map(|(name, enabled)| (name.into(), enabled))
                    .collect(),
            ),
        }
    }

    pub fn set_feature_flag(&self, name: &str, enabled: bool) {
        match self.flags.write() {
            Ok(mut flags) => {
                flags.insert(name.to_string(), enabled);
            }
            Err(poisoned) => {
                poisoned.into_inner().insert(name.to_string(), enabled);
            }
        }
    }
}

impl FeatureFlagRetriever for FeatureFlagManager {
    fn get_feature_flag(&self, name: &str) -> Option<bool> {
        match self.flags.read() {
            Ok(flags) => flags.get(name).copied(),
            Err(poisoned) => poisoned.into_inner().get(name).copied(),
        }
    }
}
