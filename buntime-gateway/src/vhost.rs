//! # Virtual-Host Matching
//!
//! Maps an inbound `Host` header to a worker app, an optional tenant and an
//! optional path prefix. Patterns are exact hostnames or `*.domain`
//! wildcards where the wildcard stands for a single leading label. Exact
//! entries always win over wildcard entries, and a wildcard never matches
//! the bare base domain.

use crate::config::VirtualHostTarget;
use std::collections::HashMap;

/// Result of a successful host match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualHostMatch {
    pub app: String,
    pub path_prefix: Option<String>,
    /// Captured leading label when matched through a wildcard
    pub tenant: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct VirtualHostMatcher {
    exact: HashMap<String, VirtualHostTarget>,
    /// base domain (without the leading `*.`) → target
    wildcard: HashMap<String, VirtualHostTarget>,
}

impl VirtualHostMatcher {
    pub fn new(hosts: &HashMap<String, VirtualHostTarget>) -> Self {
        let mut exact = HashMap::new();
        let mut wildcard = HashMap::new();
        for (pattern, target) in hosts {
            let key = pattern.to_ascii_lowercase();
            match key.strip_prefix("*.") {
                Some(base) if !base.is_empty() => {
                    wildcard.insert(base.to_string(), target.clone());
                }
                _ => {
                    exact.insert(key, target.clone());
                }
            }
        }
        Self { exact, wildcard }
    }

    pub fn is_empty(&self) -> bool {
        self.exact.is_empty() && self.wildcard.is_empty()
    }

    /// Match a `Host` header value (port stripped here if present).
    pub fn matches(&self, host: &str) -> Option<VirtualHostMatch> {
        let host = strip_port(host).to_ascii_lowercase();
        if host.is_empty() {
            return None;
        }

        if let Some(target) = self.exact.get(&host) {
            return Some(VirtualHostMatch {
                app: target.app.clone(),
                path_prefix: target.path_prefix.clone(),
                tenant: None,
            });
        }

        let (label, base) = host.split_once('.')?;
        // one label only: a.b.domain is not covered by *.domain
        if label.is_empty() || label.contains('.') {
            return None;
        }
        let target = self.wildcard.get(base)?;
        Some(VirtualHostMatch {
            app: target.app.clone(),
            path_prefix: target.path_prefix.clone(),
            tenant: Some(label.to_string()),
        })
    }
}

fn strip_port(host: &str) -> &str {
    // bracketed IPv6 hosts keep their brackets, everything after is a port
    if let Some(end) = host.rfind(']') {
        return &host[..=end.min(host.len() - 1)];
    }
    match host.rsplit_once(':') {
        Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) => name,
        _ => host,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matcher() -> VirtualHostMatcher {
        let mut hosts = HashMap::new();
        hosts.insert(
            "sked.ly".to_string(),
            VirtualHostTarget {
                app: "A".to_string(),
                path_prefix: None,
            },
        );
        hosts.insert(
            "*.sked.ly".to_string(),
            VirtualHostTarget {
                app: "A".to_string(),
                path_prefix: None,
            },
        );
        hosts.insert(
            "api.sked.ly".to_string(),
            VirtualHostTarget {
                app: "A".to_string(),
                path_prefix: Some("/api".to_string()),
            },
        );
        VirtualHostMatcher::new(&hosts)
    }

    #[test]
    fn exact_match_without_tenant() {
        let m = matcher().matches("sked.ly").unwrap();
        assert_eq!(m.app, "A");
        assert_eq!(m.tenant, None);
        assert_eq!(m.path_prefix, None);
    }

    #[test]
    fn wildcard_captures_tenant() {
        let m = matcher().matches("t1.sked.ly").unwrap();
        assert_eq!(m.app, "A");
        assert_eq!(m.tenant.as_deref(), Some("t1"));
    }

    #[test]
    fn exact_beats_wildcard() {
        let m = matcher().matches("api.sked.ly").unwrap();
        assert_eq!(m.path_prefix.as_deref(), Some("/api"));
        assert_eq!(m.tenant, None);
    }

    #[test]
    fn wildcard_needs_the_dot() {
        assert!(matcher().matches("notsked.ly").is_none());
    }

    #[test]
    fn wildcard_does_not_match_bare_base() {
        let mut hosts = HashMap::new();
        hosts.insert(
            "*.tenants.example".to_string(),
            VirtualHostTarget {
                app: "B".to_string(),
                path_prefix: None,
            },
        );
        let matcher = VirtualHostMatcher::new(&hosts);
        assert!(matcher.matches("tenants.example").is_none());
        assert!(matcher.matches("acme.tenants.example").is_some());
    }

    #[test]
    fn wildcard_is_single_label() {
        assert!(matcher().matches("a.b.sked.ly").is_none());
    }

    #[test]
    fn port_is_stripped_and_case_folded() {
        let m = matcher().matches("T1.Sked.LY:8443").unwrap();
        assert_eq!(m.tenant.as_deref(), Some("t1"));
    }

    #[test]
    fn unknown_host_is_none() {
        assert!(matcher().matches("other.example").is_none());
        assert!(matcher().matches("").is_none());
    }
}
