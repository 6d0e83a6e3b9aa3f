//! Audit rule engine.
//!
//! Holds per-tag compiled regex sets and the detection results accumulated
//! since the last report cycle. Results are deduplicated by
//! (UID, rule id, source IP) within a cycle and drained on report.

use dashmap::DashMap;

use crate::api::{DetectResult, DetectRule};
use crate::logger::log;

pub struct RuleManager {
    rules: DashMap<String, Vec<DetectRule>>,
    results: DashMap<String, Vec<DetectResult>>,
}

impl Default for RuleManager {
    fn default() -> Self {
        Self::new()
    }
}

impl RuleManager {
    pub fn new() -> Self {
        Self {
            rules: DashMap::new(),
            results: DashMap::new(),
        }
    }

    /// Replace the tag's rule set atomically.
    pub fn update_rule(&self, tag: &str, new_rules: Vec<DetectRule>) {
        log::debug!(tag = tag, count = new_rules.len(), "Audit rules updated");
        self.rules.insert(tag.to_string(), new_rules);
    }

    /// Check `destination` against the tag's rules; record a result on the
    /// first match.
    ///
    /// `user_key` is either the plain UID or the composite
    /// `{tag}|{email}|{uid}` limiter key; the UID is parsed from the last
    /// segment either way.
    pub fn detect(&self, tag: &str, destination: &str, user_key: &str, src_ip: &str) -> bool {
        let matched_rule = {
            let Some(rules) = self.rules.get(tag) else {
                return false;
            };
            rules
                .iter()
                .find(|r| r.pattern.is_match(destination))
                .map(|r| r.id)
        };

        let Some(rule_id) = matched_rule else {
            return false;
        };

        let uid = user_key
            .rsplit('|')
            .next()
            .and_then(|s| s.parse::<i64>().ok())
            .unwrap_or(0);

        let result = DetectResult {
            uid,
            rule_id,
            ip: src_ip.to_string(),
        };
        let mut buf = self.results.entry(tag.to_string()).or_default();
        if !buf.contains(&result) {
            buf.push(result);
        }
        true
    }

    /// Drain and return the tag's accumulated detection results.
    pub fn get_detect_result(&self, tag: &str) -> Vec<DetectResult> {
        self.results
            .remove(tag)
            .map(|(_, results)| results)
            .unwrap_or_default()
    }

    /// Drop all state held for a tag.
    pub fn remove_tag(&self, tag: &str) {
        self.rules.remove(tag);
        self.results.remove(tag);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use regex::Regex;

    fn rule(id: i64, pattern: &str) -> DetectRule {
        DetectRule {
            id,
            pattern: Regex::new(pattern).unwrap(),
        }
    }

    #[test]
    fn test_detect_no_rules() {
        let mgr = RuleManager::new();
        assert!(!mgr.detect("tag", "ads.example.com:443", "1", "1.1.1.1"));
    }

    #[test]
    fn test_detect_match_records_result() {
        let mgr = RuleManager::new();
        mgr.update_rule("tag", vec![rule(5, r"^ads\.example\.com$")]);

        assert!(mgr.detect("tag", "ads.example.com", "7", "9.9.9.9"));
        let results = mgr.get_detect_result("tag");
        assert_eq!(
            results,
            vec![DetectResult {
                uid: 7,
                rule_id: 5,
                ip: "9.9.9.9".to_string()
            }]
        );
    }

    #[test]
    fn test_detect_result_drained() {
        let mgr = RuleManager::new();
        mgr.update_rule("tag", vec![rule(1, "blocked")]);
        assert!(mgr.detect("tag", "blocked.example.com", "1", "1.1.1.1"));

        assert_eq!(mgr.get_detect_result("tag").len(), 1);
        assert!(mgr.get_detect_result("tag").is_empty());
    }

    #[test]
    fn test_detect_dedup_within_cycle() {
        let mgr = RuleManager::new();
        mgr.update_rule("tag", vec![rule(1, "blocked")]);

        assert!(mgr.detect("tag", "blocked.example.com", "1", "1.1.1.1"));
        assert!(mgr.detect("tag", "blocked.example.com", "1", "1.1.1.1"));
        assert!(mgr.detect("tag", "blocked.example.com", "1", "2.2.2.2"));

        let results = mgr.get_detect_result("tag");
        assert_eq!(results.len(), 2);
    }

    #[test]
    fn test_detect_first_match_wins() {
        let mgr = RuleManager::new();
        mgr.update_rule("tag", vec![rule(1, "example"), rule(2, "ads")]);

        assert!(mgr.detect("tag", "ads.example.com", "3", "1.1.1.1"));
        let results = mgr.get_detect_result("tag");
        assert_eq!(results[0].rule_id, 1);
    }

    #[test]
    fn test_uid_parsed_from_composite_key() {
        let mgr = RuleManager::new();
        mgr.update_rule("tag", vec![rule(1, "blocked")]);

        assert!(mgr.detect(
            "tag",
            "blocked.example.com",
            "Vmess_0.0.0.0_443_1|user@example.com|42",
            "1.1.1.1"
        ));
        assert_eq!(mgr.get_detect_result("tag")[0].uid, 42);
    }

    #[test]
    fn test_tags_are_isolated() {
        let mgr = RuleManager::new();
        mgr.update_rule("tag-a", vec![rule(1, "blocked")]);

        assert!(!mgr.detect("tag-b", "blocked.example.com", "1", "1.1.1.1"));
        assert!(mgr.detect("tag-a", "blocked.example.com", "1", "1.1.1.1"));
        assert!(mgr.get_detect_result("tag-b").is_empty());
        assert_eq!(mgr.get_detect_result("tag-a").len(), 1);
    }

    #[test]
    fn test_update_rule_full_replacement() {
        let mgr = RuleManager::new();
        mgr.update_rule("tag", vec![rule(1, "old")]);
        mgr.update_rule("tag", vec![rule(2, "new")]);

        assert!(!mgr.detect("tag", "old.example.com", "1", "1.1.1.1"));
        assert!(mgr.detect("tag", "new.example.com", "1", "1.1.1.1"));
    }

    #[test]
    fn test_remove_tag() {
        let mgr = RuleManager::new();
        mgr.update_rule("tag", vec![rule(1, "blocked")]);
        assert!(mgr.detect("tag", "blocked.example.com", "1", "1.1.1.1"));

        mgr.remove_tag("tag");
        assert!(!mgr.detect("tag", "blocked.example.com", "1", "1.1.1.1"));
        assert!(mgr.get_detect_result("tag").is_empty());
    }
}
