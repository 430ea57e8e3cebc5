// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Governance gate: decides, before the handler runs, whether a request is blocked and
//! which response headers are overridden.
//!
//! Rules arrive as an ordered snapshot. Each rule scopes itself (everyone, listed users or
//! listed companies) and carries an OR of AND-groups of regex conditions over the request
//! attributes. The first matching blocking rule decides the response; every matching rule
//! contributes its headers, later rules winning on collisions.

use regex::Regex;
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use std::collections::HashMap;
use tracing::{debug, warn};

const DEFAULT_BLOCK_STATUS: u16 = 403;

/// Request attributes rules are evaluated against.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GovernanceRequest {
    /// `request.verb`, `request.ip`, `request.route`, `request.body.operationName`.
    pub fields: HashMap<String, String>,
    pub headers: HashMap<String, String>,
    pub body: Option<Value>,
}

impl GovernanceRequest {
    fn lookup(&self, path: &str) -> Option<String> {
        if let Some(value) = self.fields.get(path) {
            return Some(value.clone());
        }
        if let Some(name) = path.strip_prefix("request.headers.") {
            return self
                .headers
                .iter()
                .find(|(key, _)| key.eq_ignore_ascii_case(name))
                .map(|(_, value)| value.clone());
        }
        if let Some(pointer) = path.strip_prefix("request.body.") {
            let mut current = self.body.as_ref()?;
            for segment in pointer.split('.') {
                current = current.get(segment)?;
            }
            return match current {
                Value::String(s) => Some(s.clone()),
                Value::Null => None,
                other => Some(other.to_string()),
            };
        }
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleKind {
    Regex,
    User,
    Company,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppliedTo {
    #[default]
    Matching,
    NotMatching,
}

#[derive(Debug, Clone)]
pub struct Condition {
    pub path: String,
    pub value: Regex,
}

impl<'de> Deserialize<'de> for Condition {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        struct Raw {
            path: String,
            value: String,
        }
        let raw = Raw::deserialize(deserializer)?;
        let value = Regex::new(&raw.value).map_err(serde::de::Error::custom)?;
        Ok(Condition {
            path: raw.path,
            value,
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConditionGroup {
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl ConditionGroup {
    fn matches(&self, request: &GovernanceRequest) -> bool {
        self.conditions.iter().all(|condition| {
            request
                .lookup(&condition.path)
                .is_some_and(|value| condition.value.is_match(&value))
        })
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RuleResponse {
    pub status: Option<u16>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GovernanceRule {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(rename = "type")]
    pub kind: RuleKind,
    #[serde(default)]
    pub block: bool,
    #[serde(default)]
    pub applied_to: AppliedTo,
    #[serde(default)]
    pub regex_config: Vec<ConditionGroup>,
    #[serde(default)]
    pub entity_ids: Vec<String>,
    #[serde(default)]
    pub response: RuleResponse,
}

impl GovernanceRule {
    fn matches(
        &self,
        request: &GovernanceRequest,
        user_id: Option<&str>,
        company_id: Option<&str>,
    ) -> bool {
        let regex_hit = self.regex_config.is_empty()
            || self.regex_config.iter().any(|group| group.matches(request));
        let inverted = self.applied_to == AppliedTo::NotMatching;

        match self.kind {
            RuleKind::Regex => regex_hit != inverted,
            RuleKind::User => self.entity_hit(user_id) != inverted && regex_hit,
            RuleKind::Company => self.entity_hit(company_id) != inverted && regex_hit,
        }
    }

    fn entity_hit(&self, entity: Option<&str>) -> bool {
        entity.is_some_and(|id| self.entity_ids.iter().any(|candidate| candidate == id))
    }
}

/// Ordered, immutable set of governance rules.
#[derive(Debug, Clone, Default)]
pub struct RulesSnapshot {
    pub rules: Vec<GovernanceRule>,
}

/// Rules are decoded one by one; a rule that fails to decode (for instance over an invalid
/// regex) is dropped without affecting its siblings.
impl<'de> Deserialize<'de> for RulesSnapshot {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Vec::<Value>::deserialize(deserializer)?;
        let rules = raw
            .into_iter()
            .filter_map(|value| {
                let id = value.get("_id").and_then(Value::as_str).map(str::to_string);
                match serde_json::from_value::<GovernanceRule>(value) {
                    Ok(rule) => Some(rule),
                    Err(e) => {
                        warn!(
                            "dropping governance rule {}: {e}",
                            id.as_deref().unwrap_or("<unknown>")
                        );
                        None
                    }
                }
            })
            .collect();
        Ok(RulesSnapshot { rules })
    }
}

impl RulesSnapshot {
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// Outcome of evaluating a request against a rules snapshot.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// The handler runs; `headers` are merged into its response.
    Allow { headers: HashMap<String, String> },
    /// The handler is skipped and this response is returned instead.
    Block {
        status: u16,
        headers: HashMap<String, String>,
        body: Option<Value>,
        rule_id: String,
    },
}

impl Decision {
    pub fn headers(&self) -> &HashMap<String, String> {
        match self {
            Decision::Allow { headers } | Decision::Block { headers, .. } => headers,
        }
    }

    pub fn is_blocked(&self) -> bool {
        matches!(self, Decision::Block { .. })
    }
}

/// Evaluates `request` against `snapshot` in declared order.
pub fn evaluate(
    request: &GovernanceRequest,
    user_id: Option<&str>,
    company_id: Option<&str>,
    snapshot: &RulesSnapshot,
) -> Decision {
    let mut headers = HashMap::new();
    let mut blocked: Option<&GovernanceRule> = None;

    for rule in &snapshot.rules {
        if !rule.matches(request, user_id, company_id) {
            continue;
        }
        debug!("governance rule {} matched", rule.id);
        headers.extend(
            rule.response
                .headers
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );
        if rule.block && blocked.is_none() {
            blocked = Some(rule);
        }
    }

    match blocked {
        Some(rule) => Decision::Block {
            status: rule.response.status.unwrap_or(DEFAULT_BLOCK_STATUS),
            headers,
            body: rule.response.body.clone(),
            rule_id: rule.id.clone(),
        },
        None => Decision::Allow { headers },
    }
}
