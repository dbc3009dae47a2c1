//! Host-supplied policy: blocked hosts, latency injection, and runtime rule
//! installation. The poll thread consults this on flow admission; control
//! channel writers mutate it behind single-writer locks.

use crate::config::{LatencyRule, PolicySettings};
use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use wildmatch::WildMatch;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ShapingConfig {
    pub latency_ms: u32,
    pub jitter_ms: u32,
}

#[derive(Clone, Debug, PartialEq)]
pub enum RuleAction {
    Block,
    Shape(ShapingConfig),
}

#[derive(Clone, Debug)]
pub struct PolicyDecision {
    pub host: String,
    pub action: RuleAction,
}

/// Set of normalised lower-case host suffixes matched at label boundaries:
/// `example.com` covers `example.com` and `a.b.example.com`, never
/// `notexample.com` or `example.company`.
#[derive(Debug, Default, Clone)]
pub struct BlockedHostSet {
    suffixes: HashSet<String>,
}

impl BlockedHostSet {
    pub fn new<I, S>(hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let suffixes = hosts
            .into_iter()
            .filter_map(|host| normalize_host(host.as_ref()))
            .collect();
        Self { suffixes }
    }

    pub fn matches(&self, host: &str) -> bool {
        let Some(normalized) = normalize_host(host) else {
            return false;
        };
        if self.suffixes.contains(&normalized) {
            return true;
        }
        // Walk label boundaries: a.b.example.com -> b.example.com -> ...
        let mut rest = normalized.as_str();
        while let Some(dot) = rest.find('.') {
            rest = &rest[dot + 1..];
            if self.suffixes.contains(rest) {
                return true;
            }
        }
        false
    }

    pub fn is_empty(&self) -> bool {
        self.suffixes.is_empty()
    }
}

fn normalize_host(host: &str) -> Option<String> {
    let trimmed = host.trim().trim_end_matches('.');
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_ascii_lowercase())
    }
}

#[derive(Debug)]
struct CompiledLatencyRule {
    /// Absent suffix applies globally.
    suffix: Option<String>,
    shaping: ShapingConfig,
}

#[derive(Debug)]
pub struct HostRule {
    pub id: u64,
    pub pattern: String,
    matcher: WildMatch,
    pub action: RuleAction,
}

pub struct PolicyManager {
    blocked: RwLock<BlockedHostSet>,
    latency_rules: RwLock<Vec<CompiledLatencyRule>>,
    dynamic_rules: RwLock<Vec<HostRule>>,
    next_rule_id: AtomicU64,
}

impl PolicyManager {
    pub fn new(settings: &PolicySettings) -> Arc<Self> {
        let manager = Arc::new(Self {
            blocked: RwLock::new(BlockedHostSet::new(settings.blocked_hosts.iter())),
            latency_rules: RwLock::new(Vec::new()),
            dynamic_rules: RwLock::new(Vec::new()),
            next_rule_id: AtomicU64::new(1),
        });
        manager.set_latency_rules(&settings.latency_rules);
        manager
    }

    /// Rebuilds the blocked set; called whenever configuration changes.
    pub fn set_blocked_hosts<I, S>(&self, hosts: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        *self.blocked.write() = BlockedHostSet::new(hosts);
    }

    pub fn set_latency_rules(&self, rules: &[LatencyRule]) {
        let compiled = rules
            .iter()
            .map(|rule| CompiledLatencyRule {
                suffix: rule.host.as_deref().and_then(normalize_host),
                shaping: ShapingConfig {
                    latency_ms: rule.latency_ms,
                    jitter_ms: rule.jitter_ms,
                },
            })
            .collect();
        *self.latency_rules.write() = compiled;
    }

    /// Installs a wildcard rule at runtime; newest rules win.
    pub fn install_rule(&self, pattern: &str, action: RuleAction) -> u64 {
        let id = self.next_rule_id.fetch_add(1, Ordering::Relaxed);
        let normalized = pattern.trim().to_ascii_lowercase();
        self.dynamic_rules.write().push(HostRule {
            id,
            matcher: WildMatch::new(&normalized),
            pattern: normalized,
            action,
        });
        id
    }

    pub fn remove_rule(&self, id: u64) -> bool {
        let mut rules = self.dynamic_rules.write();
        let before = rules.len();
        rules.retain(|rule| rule.id != id);
        before != rules.len()
    }

    pub fn rule_count(&self) -> usize {
        self.dynamic_rules.read().len()
    }

    /// Policy verdict for a flow toward `host` (a hostname when one is known,
    /// otherwise the literal address).
    pub fn decision_for_host(&self, host: &str) -> Option<PolicyDecision> {
        let Some(normalized) = normalize_host(host) else {
            return None;
        };
        {
            let rules = self.dynamic_rules.read();
            for rule in rules.iter().rev() {
                if rule.matcher.matches(&normalized) {
                    return Some(PolicyDecision {
                        host: host.to_string(),
                        action: rule.action.clone(),
                    });
                }
            }
        }
        if self.blocked.read().matches(&normalized) {
            return Some(PolicyDecision {
                host: host.to_string(),
                action: RuleAction::Block,
            });
        }
        let rules = self.latency_rules.read();
        let mut global: Option<ShapingConfig> = None;
        for rule in rules.iter() {
            match &rule.suffix {
                Some(suffix) => {
                    if normalized == *suffix || normalized.ends_with(&format!(".{suffix}")) {
                        return Some(PolicyDecision {
                            host: host.to_string(),
                            action: RuleAction::Shape(rule.shaping),
                        });
                    }
                }
                None => global = global.or(Some(rule.shaping)),
            }
        }
        global.map(|shaping| PolicyDecision {
            host: host.to_string(),
            action: RuleAction::Shape(shaping),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PolicySettings;

    #[test]
    fn blocked_hosts_match_at_label_boundaries() {
        let set = BlockedHostSet::new(["example.com"]);
        assert!(set.matches("example.com"));
        assert!(set.matches("sub.example.com"));
        assert!(set.matches("a.b.example.com"));
        assert!(!set.matches("notexample.com"));
        assert!(!set.matches("example.company"));
    }

    #[test]
    fn blocked_hosts_are_case_insensitive() {
        let set = BlockedHostSet::new(["Example.com"]);
        assert!(set.matches("sub.example.COM"));
        assert!(set.matches("EXAMPLE.com."));
    }

    #[test]
    fn per_host_latency_rules_beat_global_ones() {
        let settings = PolicySettings {
            blocked_hosts: Vec::new(),
            latency_rules: vec![
                LatencyRule {
                    host: None,
                    latency_ms: 10,
                    jitter_ms: 0,
                },
                LatencyRule {
                    host: Some("video.example.com".into()),
                    latency_ms: 125,
                    jitter_ms: 15,
                },
            ],
        };
        let policy = PolicyManager::new(&settings);
        let decision = policy.decision_for_host("video.example.com").unwrap();
        assert_eq!(
            decision.action,
            RuleAction::Shape(ShapingConfig {
                latency_ms: 125,
                jitter_ms: 15
            })
        );
        let decision = policy.decision_for_host("other.example.net").unwrap();
        assert_eq!(
            decision.action,
            RuleAction::Shape(ShapingConfig {
                latency_ms: 10,
                jitter_ms: 0
            })
        );
    }

    #[test]
    fn dynamic_rules_win_and_can_be_removed() {
        let policy = PolicyManager::new(&PolicySettings::default());
        assert!(policy.decision_for_host("ads.tracker.example").is_none());
        let id = policy.install_rule("*.tracker.example", RuleAction::Block);
        let decision = policy.decision_for_host("ads.tracker.example").unwrap();
        assert_eq!(decision.action, RuleAction::Block);
        assert!(policy.remove_rule(id));
        assert!(!policy.remove_rule(id));
        assert!(policy.decision_for_host("ads.tracker.example").is_none());
    }
}
