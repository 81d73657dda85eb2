//! # Policy Model
//!
//! Serde model for the authorization policy set and the per-request
//! evaluation context. The wire shape is camelCase JSON, shared by the
//! policy file mirror, the admin API and the seeding bundle.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Effect a policy yields when it applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Effect {
    Permit,
    Deny,
}

/// How matching policies combine into a single decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CombiningAlgorithm {
    /// First policy (by priority) whose effect applies wins
    #[serde(rename = "first-applicable")]
    FirstApplicable,
    /// Any applicable deny wins over any permit
    #[serde(rename = "deny-overrides")]
    DenyOverrides,
    /// Any applicable permit wins over any deny
    #[serde(rename = "permit-overrides")]
    PermitOverrides,
    /// Exactly one policy may apply; more than one is treated as deny
    #[serde(rename = "only-one-applicable")]
    OnlyOneApplicable,
}

impl Default for CombiningAlgorithm {
    fn default() -> Self {
        CombiningAlgorithm::DenyOverrides
    }
}

/// A single authorization policy.
///
/// `subjects`, `resources` and `actions` each match if *any* entry matches;
/// an empty list means "no restriction". `conditions` must *all* hold.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Policy {
    /// Unique policy identifier
    pub id: String,
    pub effect: Effect,
    /// Higher priority evaluates first
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub subjects: Vec<SubjectMatch>,
    #[serde(default)]
    pub resources: Vec<ResourceMatch>,
    #[serde(default)]
    pub actions: Vec<ActionMatch>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// One subject matcher; all present fields must hold.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectMatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Role pattern; `*` wildcards supported
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claim: Option<ClaimMatch>,
}

/// Operator applied to a single subject claim.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimMatch {
    /// Claim key to look up on the subject
    pub name: String,
    pub operator: ClaimOperator,
    pub value: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClaimOperator {
    Eq,
    Ne,
    Gt,
    Lt,
    Contains,
    Regex,
}

/// One resource matcher. `path` and `app` use glob semantics; `type` is an
/// exact comparison.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceMatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app: Option<String>,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub resource_type: Option<String>,
}

/// One action matcher. `method` compares case-insensitively and accepts the
/// `*` wildcard; `operation` is exact.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionMatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
}

/// Environmental conditions ANDed onto a matching policy.
///
/// `ip` lists are exact matches; CIDR notation never matches (a future
/// extension). `custom` is a placeholder that always evaluates true.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Condition {
    #[serde(rename_all = "camelCase")]
    Time {
        /// `HH:MM`, inclusive lower bound
        #[serde(default, skip_serializing_if = "Option::is_none")]
        after: Option<String>,
        /// `HH:MM`, exclusive upper bound
        #[serde(default, skip_serializing_if = "Option::is_none")]
        before: Option<String>,
        /// 0 = Sunday
        #[serde(default, skip_serializing_if = "Option::is_none")]
        day_of_week: Option<Vec<u8>>,
    },
    Ip {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        allowlist: Option<Vec<String>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        blocklist: Option<Vec<String>>,
    },
    Custom {
        #[serde(flatten)]
        config: Map<String, Value>,
    },
}

/// Identity attributes of the caller.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subject {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub groups: Vec<String>,
    #[serde(default)]
    pub claims: Map<String, Value>,
}

/// What the request is addressing.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resource {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app: Option<String>,
    #[serde(default)]
    pub path: String,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub resource_type: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Action {
    #[serde(default)]
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Environment {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    /// Evaluation instant; the PDP falls back to `Utc::now()` when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
}

/// Everything the PDP needs for one evaluation, built once per request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationContext {
    #[serde(default)]
    pub subject: Subject,
    #[serde(default)]
    pub resource: Resource,
    #[serde(default)]
    pub action: Action,
    #[serde(default)]
    pub environment: Environment,
}

/// Outcome of one evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Decision {
    pub effect: Effect,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matched_policy: Option<String>,
}

impl Decision {
    pub fn permitted(&self) -> bool {
        self.effect == Effect::Permit
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn policy_deserializes_from_wire_shape() {
        let policy: Policy = serde_json::from_value(json!({
            "id": "deny-all",
            "effect": "deny",
            "resources": [{"path": "*"}],
            "actions": [{"method": "*"}]
        }))
        .unwrap();
        assert_eq!(policy.id, "deny-all");
        assert_eq!(policy.effect, Effect::Deny);
        assert_eq!(policy.priority, 0);
        assert!(policy.subjects.is_empty());
        assert_eq!(policy.resources[0].path.as_deref(), Some("*"));
    }

    #[test]
    fn conditions_are_type_tagged() {
        let cond: Condition = serde_json::from_value(json!({
            "type": "time",
            "after": "09:00",
            "dayOfWeek": [1, 2, 3, 4, 5]
        }))
        .unwrap();
        match cond {
            Condition::Time { after, day_of_week, .. } => {
                assert_eq!(after.as_deref(), Some("09:00"));
                assert_eq!(day_of_week.unwrap(), vec![1, 2, 3, 4, 5]);
            }
            other => panic!("wrong condition: {other:?}"),
        }
    }

    #[test]
    fn combining_algorithm_names() {
        let alg: CombiningAlgorithm = serde_json::from_value(json!("deny-overrides")).unwrap();
        assert_eq!(alg, CombiningAlgorithm::DenyOverrides);
        let alg: CombiningAlgorithm = serde_json::from_value(json!("first-applicable")).unwrap();
        assert_eq!(alg, CombiningAlgorithm::FirstApplicable);
    }
}
