//! # Policy Decision Point
//!
//! Pure evaluation of a policy snapshot against an [`EvaluationContext`].
//! No I/O and no shared state: the PAP hands in a consistent snapshot and
//! the PDP folds it into a single [`Decision`] under the configured
//! combining algorithm.

use super::model::{
    ActionMatch, ClaimMatch, ClaimOperator, CombiningAlgorithm, Condition, Decision, Effect,
    EvaluationContext, Policy, ResourceMatch, SubjectMatch,
};
use crate::glob::Glob;
use chrono::{Datelike, Timelike, Utc};
use serde_json::Value;

/// How a single policy relates to a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Applicability {
    Applicable(Effect),
    NotApplicable,
}

/// Evaluate `policies` against `ctx`.
///
/// Policies are considered in descending priority (stable for equal
/// priorities). A policy applies when its subject/resource/action matchers
/// hold and every condition passes; a failed condition demotes a matching
/// policy to not-applicable. When nothing applies the decision is
/// `default_effect` with reason "No applicable policy".
pub fn evaluate(
    ctx: &EvaluationContext,
    policies: &[Policy],
    algorithm: CombiningAlgorithm,
    default_effect: Effect,
) -> Decision {
    let mut ordered: Vec<&Policy> = policies.iter().collect();
    ordered.sort_by_key(|p| std::cmp::Reverse(p.priority));

    let applicable: Vec<&Policy> = ordered
        .iter()
        .filter(|p| applicability(ctx, p) == Applicability::Applicable(p.effect))
        .copied()
        .collect();

    if applicable.is_empty() {
        return Decision {
            effect: default_effect,
            reason: Some("No applicable policy".to_string()),
            matched_policy: None,
        };
    }

    match algorithm {
        CombiningAlgorithm::FirstApplicable => decision_for(applicable[0]),
        CombiningAlgorithm::DenyOverrides => {
            match applicable.iter().copied().find(|p| p.effect == Effect::Deny) {
                Some(deny) => decision_for(deny),
                None => decision_for(applicable[0]),
            }
        }
        CombiningAlgorithm::PermitOverrides => {
            match applicable.iter().copied().find(|p| p.effect == Effect::Permit) {
                Some(permit) => decision_for(permit),
                None => decision_for(applicable[0]),
            }
        }
        CombiningAlgorithm::OnlyOneApplicable => {
            if applicable.len() > 1 {
                Decision {
                    effect: Effect::Deny,
                    reason: Some(format!(
                        "{} policies applicable where only one is allowed",
                        applicable.len()
                    )),
                    matched_policy: None,
                }
            } else {
                decision_for(applicable[0])
            }
        }
    }
}

fn decision_for(policy: &Policy) -> Decision {
    Decision {
        effect: policy.effect,
        reason: policy.description.clone(),
        matched_policy: Some(policy.id.clone()),
    }
}

fn applicability(ctx: &EvaluationContext, policy: &Policy) -> Applicability {
    let matches = matches_any(&policy.subjects, |s| subject_matches(ctx, s))
        && matches_any(&policy.resources, |r| resource_matches(ctx, r))
        && matches_any(&policy.actions, |a| action_matches(ctx, a));
    if !matches {
        return Applicability::NotApplicable;
    }
    if !policy.conditions.iter().all(|c| condition_holds(ctx, c)) {
        return Applicability::NotApplicable;
    }
    Applicability::Applicable(policy.effect)
}

// Empty list = no restriction.
fn matches_any<T>(entries: &[T], pred: impl Fn(&T) -> bool) -> bool {
    entries.is_empty() || entries.iter().any(pred)
}

fn subject_matches(ctx: &EvaluationContext, matcher: &SubjectMatch) -> bool {
    let subject = &ctx.subject;
    if let Some(id) = &matcher.id {
        if subject.id.as_deref() != Some(id.as_str()) {
            return false;
        }
    }
    if let Some(role) = &matcher.role {
        if !glob_matches_any(role, &subject.roles) {
            return false;
        }
    }
    if let Some(group) = &matcher.group {
        if !subject.groups.iter().any(|g| g == group) {
            return false;
        }
    }
    if let Some(claim) = &matcher.claim {
        if !claim_matches(subject.claims.get(&claim.name), claim) {
            return false;
        }
    }
    true
}

fn glob_matches_any(pattern: &str, candidates: &[String]) -> bool {
    match Glob::compile(pattern) {
        Ok(glob) => candidates.iter().any(|c| glob.matches(c)),
        Err(_) => candidates.iter().any(|c| c == pattern),
    }
}

fn claim_matches(actual: Option<&Value>, matcher: &ClaimMatch) -> bool {
    let Some(actual) = actual else {
        // absence only satisfies "not equal"
        return matcher.operator == ClaimOperator::Ne;
    };
    match matcher.operator {
        ClaimOperator::Eq => actual == &matcher.value,
        ClaimOperator::Ne => actual != &matcher.value,
        ClaimOperator::Gt => compare_values(actual, &matcher.value)
            .map(|o| o == std::cmp::Ordering::Greater)
            .unwrap_or(false),
        ClaimOperator::Lt => compare_values(actual, &matcher.value)
            .map(|o| o == std::cmp::Ordering::Less)
            .unwrap_or(false),
        ClaimOperator::Contains => match actual {
            Value::String(s) => matcher
                .value
                .as_str()
                .map(|needle| s.contains(needle))
                .unwrap_or(false),
            Value::Array(items) => items.contains(&matcher.value),
            _ => false,
        },
        ClaimOperator::Regex => {
            let (Some(haystack), Some(pattern)) = (actual.as_str(), matcher.value.as_str())
            else {
                return false;
            };
            regex::Regex::new(pattern)
                .map(|re| re.is_match(haystack))
                .unwrap_or(false)
        }
    }
}

fn compare_values(a: &Value, b: &Value) -> Option<std::cmp::Ordering> {
    if let (Some(x), Some(y)) = (a.as_f64(), b.as_f64()) {
        return x.partial_cmp(&y);
    }
    match (a.as_str(), b.as_str()) {
        (Some(x), Some(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

fn resource_matches(ctx: &EvaluationContext, matcher: &ResourceMatch) -> bool {
    let resource = &ctx.resource;
    if let Some(path) = &matcher.path {
        if !glob_matches(path, &resource.path) {
            return false;
        }
    }
    if let Some(app) = &matcher.app {
        match &resource.app {
            Some(actual) if glob_matches(app, actual) => {}
            _ => return false,
        }
    }
    if let Some(rtype) = &matcher.resource_type {
        if resource.resource_type.as_deref() != Some(rtype.as_str()) {
            return false;
        }
    }
    true
}

fn glob_matches(pattern: &str, input: &str) -> bool {
    // bare "*" is the conventional match-everything in policy files, even
    // across path separators
    if pattern == "*" {
        return true;
    }
    Glob::compile(pattern)
        .map(|g| g.matches(input))
        .unwrap_or(false)
}

fn action_matches(ctx: &EvaluationContext, matcher: &ActionMatch) -> bool {
    if let Some(method) = &matcher.method {
        if method != "*" && !method.eq_ignore_ascii_case(&ctx.action.method) {
            return false;
        }
    }
    if let Some(operation) = &matcher.operation {
        if ctx.action.operation.as_deref() != Some(operation.as_str()) {
            return false;
        }
    }
    true
}

fn condition_holds(ctx: &EvaluationContext, condition: &Condition) -> bool {
    match condition {
        Condition::Time {
            after,
            before,
            day_of_week,
        } => {
            let now = ctx.environment.time.unwrap_or_else(Utc::now);
            let minute_of_day = now.hour() * 60 + now.minute();
            if let Some(after) = after {
                match parse_hh_mm(after) {
                    Some(bound) if minute_of_day >= bound => {}
                    _ => return false,
                }
            }
            if let Some(before) = before {
                match parse_hh_mm(before) {
                    Some(bound) if minute_of_day < bound => {}
                    _ => return false,
                }
            }
            if let Some(days) = day_of_week {
                let today = now.weekday().num_days_from_sunday() as u8;
                if !days.contains(&today) {
                    return false;
                }
            }
            true
        }
        Condition::Ip {
            allowlist,
            blocklist,
        } => {
            let ip = ctx.environment.ip.as_deref().unwrap_or("");
            if let Some(block) = blocklist {
                if block.iter().any(|b| b == ip) {
                    return false;
                }
            }
            if let Some(allow) = allowlist {
                if !allow.iter().any(|a| a == ip) {
                    return false;
                }
            }
            true
        }
        // placeholder for a pluggable safe evaluator
        Condition::Custom { .. } => true,
    }
}

fn parse_hh_mm(s: &str) -> Option<u32> {
    let (hh, mm) = s.split_once(':')?;
    let hours: u32 = hh.parse().ok()?;
    let minutes: u32 = mm.parse().ok()?;
    if hours > 23 || minutes > 59 {
        return None;
    }
    Some(hours * 60 + minutes)
}
