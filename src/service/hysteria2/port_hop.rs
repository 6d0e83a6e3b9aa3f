//! Port-hopping firewall rules for Hysteria2.
//!
//! A ports expression like `"30000-50000,60000"` is translated into NAT
//! PREROUTING REDIRECT rules towards the node's base port. No rule ever
//! mentions the base port itself. Removal uses the exact parameters used on
//! installation.

use crate::api::NodeInfo;
use crate::logger::log;

/// One REDIRECT rule over an inclusive destination port range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortHopRule {
    pub from_start: u16,
    pub from_end: u16,
    pub to_port: u16,
}

/// Extract port-hop rules from the node's Hysteria2 configuration.
pub fn rules_from_node(node: &NodeInfo) -> Vec<PortHopRule> {
    let Some(hy) = node.hysteria2.as_ref() else {
        return Vec::new();
    };
    if !hy.port_hop_enabled || hy.port_hop_ports.is_empty() {
        return Vec::new();
    }
    if node.port == 0 {
        return Vec::new();
    }
    build_port_hop_rules(node.port, &hy.port_hop_ports)
}

/// Parse a ports expression into the minimal REDIRECT rule set.
///
/// Segments are separated by commas (ASCII or fullwidth) or whitespace, each
/// either `start-end` or a single port within [1, 65535]. A segment
/// containing the base port is split so the base port is never redirected to
/// itself.
pub fn build_port_hop_rules(base_port: u16, ports_expr: &str) -> Vec<PortHopRule> {
    let base = base_port as u32;
    let mut rules = Vec::new();

    for segment in ports_expr.split([',', '\u{ff0c}', ' ', '\t', '\n', '\r']) {
        let segment = segment.trim();
        if segment.is_empty() {
            continue;
        }

        let (start, end) = if let Some(dash) = segment.find('-') {
            let left = segment[..dash].trim().parse::<u32>();
            let right = segment[dash + 1..].trim().parse::<u32>();
            match (left, right) {
                (Ok(s), Ok(e)) => (s, e),
                _ => continue,
            }
        } else {
            match segment.parse::<u32>() {
                Ok(p) => (p, p),
                Err(_) => continue,
            }
        };

        if !(1..=65535).contains(&start) || !(1..=65535).contains(&end) {
            continue;
        }
        let (start, end) = if start > end { (end, start) } else { (start, end) };

        if base >= start && base <= end {
            if base > start {
                rules.push(PortHopRule {
                    from_start: start as u16,
                    from_end: (base - 1) as u16,
                    to_port: base_port,
                });
            }
            if base < end {
                rules.push(PortHopRule {
                    from_start: (base + 1) as u16,
                    from_end: end as u16,
                    to_port: base_port,
                });
            }
            continue;
        }

        rules.push(PortHopRule {
            from_start: start as u16,
            from_end: end as u16,
            to_port: base_port,
        });
    }

    rules
}

fn rule_args(action: &str, rule: &PortHopRule) -> Vec<String> {
    let mut args: Vec<String> = ["-t", "nat", action, "PREROUTING", "-p", "udp", "--dport"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    if rule.from_start == rule.from_end {
        args.push(rule.from_start.to_string());
    } else {
        args.push(format!("{}:{}", rule.from_start, rule.from_end));
    }
    args.extend([
        "-j".to_string(),
        "REDIRECT".to_string(),
        "--to-port".to_string(),
        rule.to_port.to_string(),
    ]);
    args
}

#[cfg(target_os = "linux")]
async fn apply_rules(rules: &[PortHopRule]) {
    for rule in rules {
        match tokio::process::Command::new("iptables")
            .args(rule_args("-A", rule))
            .output()
            .await
        {
            Ok(out) if out.status.success() => {
                log::debug!(rule = ?rule, "Port hop: added iptables rule");
            }
            Ok(out) => {
                log::error!(
                    rule = ?rule,
                    output = %String::from_utf8_lossy(&out.stderr),
                    "Port hop: failed to add iptables rule"
                );
            }
            Err(e) => {
                log::error!(rule = ?rule, error = %e, "Port hop: failed to run iptables");
            }
        }
    }
}

#[cfg(target_os = "linux")]
async fn delete_rules(rules: &[PortHopRule]) {
    for rule in rules {
        match tokio::process::Command::new("iptables")
            .args(rule_args("-D", rule))
            .output()
            .await
        {
            Ok(out) if out.status.success() => {
                log::debug!(rule = ?rule, "Port hop: deleted iptables rule");
            }
            // A missing rule on delete is not an error worth surfacing.
            Ok(out) => {
                log::debug!(
                    rule = ?rule,
                    output = %String::from_utf8_lossy(&out.stderr),
                    "Port hop: failed to delete iptables rule"
                );
            }
            Err(e) => {
                log::debug!(rule = ?rule, error = %e, "Port hop: failed to run iptables");
            }
        }
    }
}

#[cfg(not(target_os = "linux"))]
async fn apply_rules(rules: &[PortHopRule]) {
    if !rules.is_empty() {
        log::warn!("Port hop: iptables is only supported on Linux; skipping port hop rules");
    }
}

#[cfg(not(target_os = "linux"))]
async fn delete_rules(_rules: &[PortHopRule]) {}

/// Tracks the rules installed by this service instance so they can be
/// replaced on reload and removed on close.
pub struct PortHopManager {
    installed: Vec<PortHopRule>,
}

impl Default for PortHopManager {
    fn default() -> Self {
        Self::new()
    }
}

impl PortHopManager {
    pub fn new() -> Self {
        Self {
            installed: Vec::new(),
        }
    }

    pub fn installed(&self) -> &[PortHopRule] {
        &self.installed
    }

    /// Remove the previously installed rules and apply the new set.
    pub async fn refresh(&mut self, rules: Vec<PortHopRule>) {
        self.clear().await;
        if rules.is_empty() {
            return;
        }
        apply_rules(&rules).await;
        self.installed = rules;
    }

    pub async fn clear(&mut self) {
        if self.installed.is_empty() {
            return;
        }
        delete_rules(&self.installed).await;
        self.installed.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_inside_range_splits_around_base() {
        let rules = build_port_hop_rules(30000, "30000-50000,60000");
        assert_eq!(
            rules,
            vec![
                PortHopRule {
                    from_start: 30001,
                    from_end: 50000,
                    to_port: 30000
                },
                PortHopRule {
                    from_start: 60000,
                    from_end: 60000,
                    to_port: 30000
                },
            ]
        );
    }

    #[test]
    fn test_range_without_base() {
        let rules = build_port_hop_rules(30000, "10000-20000");
        assert_eq!(
            rules,
            vec![PortHopRule {
                from_start: 10000,
                from_end: 20000,
                to_port: 30000
            }]
        );
    }

    #[test]
    fn test_base_in_middle_emits_two_ranges() {
        let rules = build_port_hop_rules(40000, "30000-50000");
        assert_eq!(
            rules,
            vec![
                PortHopRule {
                    from_start: 30000,
                    from_end: 39999,
                    to_port: 40000
                },
                PortHopRule {
                    from_start: 40001,
                    from_end: 50000,
                    to_port: 40000
                },
            ]
        );
    }

    #[test]
    fn test_single_port_equal_to_base_is_dropped() {
        assert!(build_port_hop_rules(30000, "30000").is_empty());
    }

    #[test]
    fn test_reversed_range_normalized() {
        let rules = build_port_hop_rules(30000, "20000-10000");
        assert_eq!(
            rules,
            vec![PortHopRule {
                from_start: 10000,
                from_end: 20000,
                to_port: 30000
            }]
        );
    }

    #[test]
    fn test_invalid_segments_skipped() {
        let rules = build_port_hop_rules(30000, "abc,0-100,70000,1000-abc,40000");
        assert_eq!(
            rules,
            vec![PortHopRule {
                from_start: 40000,
                from_end: 40000,
                to_port: 30000
            }]
        );
    }

    #[test]
    fn test_fullwidth_comma_and_whitespace_separators() {
        let rules = build_port_hop_rules(30000, "40000\u{ff0c}50000 60000\t65000");
        assert_eq!(rules.len(), 4);
    }

    #[test]
    fn test_empty_expression() {
        assert!(build_port_hop_rules(30000, "").is_empty());
        assert!(build_port_hop_rules(30000, " , ,").is_empty());
    }

    #[test]
    fn test_rule_args_single_port_and_range() {
        let single = PortHopRule {
            from_start: 60000,
            from_end: 60000,
            to_port: 30000,
        };
        assert_eq!(
            rule_args("-A", &single),
            vec![
                "-t", "nat", "-A", "PREROUTING", "-p", "udp", "--dport", "60000", "-j",
                "REDIRECT", "--to-port", "30000"
            ]
        );

        let range = PortHopRule {
            from_start: 30001,
            from_end: 50000,
            to_port: 30000,
        };
        assert_eq!(
            rule_args("-D", &range),
            vec![
                "-t", "nat", "-D", "PREROUTING", "-p", "udp", "--dport", "30001:50000", "-j",
                "REDIRECT", "--to-port", "30000"
            ]
        );
    }

    #[test]
    fn test_delete_args_mirror_add_args() {
        let rule = PortHopRule {
            from_start: 30001,
            from_end: 50000,
            to_port: 30000,
        };
        let add = rule_args("-A", &rule);
        let del = rule_args("-D", &rule);
        assert_eq!(add.len(), del.len());
        for (a, d) in add.iter().zip(del.iter()) {
            if a == "-A" {
                assert_eq!(d, "-D");
            } else {
                assert_eq!(a, d);
            }
        }
    }

    #[test]
    fn test_rules_from_node_requires_enabled() {
        use crate::api::{Hysteria2Config, NodeType};

        let mut node = NodeInfo {
            node_type: NodeType::Hysteria2,
            node_id: 1,
            port: 30000,
            speed_limit: 0,
            host: String::new(),
            sni: String::new(),
            enable_tls: false,
            hysteria2: Some(Hysteria2Config {
                port_hop_enabled: false,
                port_hop_ports: "30000-50000".to_string(),
                ..Hysteria2Config::default()
            }),
            tuic: None,
            anytls: None,
        };
        assert!(rules_from_node(&node).is_empty());

        node.hysteria2.as_mut().unwrap().port_hop_enabled = true;
        assert_eq!(rules_from_node(&node).len(), 1);
    }
}
