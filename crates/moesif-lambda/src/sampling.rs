// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;

use crate::remote_config::ConfigManager;

const FULL_SAMPLE_RATE: u8 = 100;

/// Sampling configuration published by the Remote Configuration Service.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ConfigSnapshot {
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u8,
    #[serde(default)]
    pub user_sample_rate: HashMap<String, u8>,
    #[serde(default)]
    pub company_sample_rate: HashMap<String, u8>,
    /// Freshness marker, compared against the e-tag returned by event submissions.
    #[serde(skip)]
    pub etag: Option<String>,
}

fn default_sample_rate() -> u8 {
    FULL_SAMPLE_RATE
}

impl Default for ConfigSnapshot {
    fn default() -> Self {
        ConfigSnapshot {
            sample_rate: FULL_SAMPLE_RATE,
            user_sample_rate: HashMap::new(),
            company_sample_rate: HashMap::new(),
            etag: None,
        }
    }
}

impl ConfigSnapshot {
    /// Sample rate in percent, most specific match first: company, then user, then global.
    pub fn sample_rate_for(&self, user_id: Option<&str>, company_id: Option<&str>) -> u8 {
        let rate = company_id
            .and_then(|id| self.company_sample_rate.get(id))
            .or_else(|| user_id.and_then(|id| self.user_sample_rate.get(id)))
            .copied()
            .unwrap_or(self.sample_rate);
        rate.min(FULL_SAMPLE_RATE)
    }
}

/// Number of unsent records a sampled record stands in for.
pub fn weight_for_rate(rate: u8) -> u32 {
    if rate == 0 {
        1
    } else {
        u32::from(FULL_SAMPLE_RATE) / u32::from(rate)
    }
}

/// Independent draw with probability `rate / 100`.
pub fn draw(rate: u8) -> bool {
    match rate {
        0 => false,
        r if r >= FULL_SAMPLE_RATE => true,
        r => fastrand::u8(0..FULL_SAMPLE_RATE) < r,
    }
}

/// Decides whether a finished record is transmitted, using the latest cached snapshot.
#[derive(Clone)]
pub struct SamplingGate {
    config: Arc<ConfigManager>,
}

impl SamplingGate {
    pub fn new(config: Arc<ConfigManager>) -> Self {
        SamplingGate { config }
    }

    pub fn should_send(&self, user_id: Option<&str>, company_id: Option<&str>) -> bool {
        draw(self.config.snapshot().sample_rate_for(user_id, company_id))
    }

    pub fn weight_for(&self, user_id: Option<&str>, company_id: Option<&str>) -> u32 {
        weight_for_rate(self.config.snapshot().sample_rate_for(user_id, company_id))
    }

    /// Draws and weighs against the same snapshot. `None` means the record is dropped.
    pub fn decide(&self, user_id: Option<&str>, company_id: Option<&str>) -> Option<u32> {
        let rate = self.config.snapshot().sample_rate_for(user_id, company_id);
        draw(rate).then(|| weight_for_rate(rate))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::governance::RulesSnapshot;
    use crate::remote_config::tests::StaticRemoteConfig;
    use serde_json::json;

    fn snapshot() -> ConfigSnapshot {
        serde_json::from_value(json!({
            "sample_rate": 50,
            "user_sample_rate": {"user-a": 10, "user-b": 0},
            "company_sample_rate": {"acme": 80}
        }))
        .unwrap()
    }

    #[test]
    fn test_most_specific_rate_wins() {
        let snapshot = snapshot();
        assert_eq!(snapshot.sample_rate_for(Some("user-a"), Some("acme")), 80);
        assert_eq!(snapshot.sample_rate_for(Some("user-a"), Some("other")), 10);
        assert_eq!(snapshot.sample_rate_for(Some("user-b"), None), 0);
        assert_eq!(snapshot.sample_rate_for(Some("nobody"), None), 50);
        assert_eq!(snapshot.sample_rate_for(None, None), 50);
    }

    #[test]
    fn test_default_snapshot_sends_everything() {
        let snapshot = ConfigSnapshot::default();
        assert_eq!(snapshot.sample_rate_for(Some("u"), Some("c")), 100);
        assert!((0..1000).all(|_| draw(100)));
    }

    #[test]
    fn test_missing_fields_fall_back_to_defaults() {
        let snapshot: ConfigSnapshot = serde_json::from_value(json!({})).unwrap();
        assert_eq!(snapshot, ConfigSnapshot::default());
    }

    #[test]
    fn test_weight() {
        assert_eq!(weight_for_rate(0), 1);
        assert_eq!(weight_for_rate(25), 4);
        assert_eq!(weight_for_rate(30), 3);
        assert_eq!(weight_for_rate(100), 1);
    }

    #[test]
    fn test_zero_rate_never_sends() {
        assert!((0..1000).all(|_| !draw(0)));
    }

    #[test]
    fn test_draws_converge_to_rate() {
        const TRIALS: usize = 100_000;
        for rate in [10_u8, 25, 50, 90] {
            let sent = (0..TRIALS).filter(|_| draw(rate)).count();
            let fraction = sent as f64 / TRIALS as f64;
            let expected = f64::from(rate) / 100.0;
            assert!(
                (fraction - expected).abs() < 0.02,
                "rate {rate}: observed {fraction}"
            );
        }
    }

    async fn gate_with(snapshot: ConfigSnapshot) -> SamplingGate {
        let service = Arc::new(StaticRemoteConfig::new(snapshot, RulesSnapshot::default()));
        let manager = Arc::new(ConfigManager::new(service));
        manager.try_refresh();
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        SamplingGate::new(manager)
    }

    #[tokio::test]
    async fn test_gate_reads_cached_snapshot() {
        let gate = gate_with(snapshot()).await;

        assert_eq!(gate.weight_for(Some("user-a"), None), 10);
        assert_eq!(gate.weight_for(None, Some("acme")), 1);
        assert_eq!(gate.weight_for(Some("user-b"), None), 1);
        assert_eq!(gate.weight_for(None, None), 2);

        assert!((0..1000).all(|_| !gate.should_send(Some("user-b"), None)));
        assert!((0..1000).all(|_| gate.decide(Some("user-b"), None).is_none()));
    }

    #[tokio::test]
    async fn test_gate_sends_everything_at_full_rate() {
        let gate = gate_with(ConfigSnapshot::default()).await;

        assert!((0..1000).all(|_| gate.should_send(Some("u"), Some("c"))));
        assert_eq!(gate.weight_for(Some("u"), Some("c")), 1);
        assert_eq!(gate.decide(Some("u"), Some("c")), Some(1));
    }
}
