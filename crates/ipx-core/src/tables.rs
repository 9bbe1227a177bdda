use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Parsed counter dump: table name -> chain name -> chain.
pub type Tables = BTreeMap<String, Table>;

/// Chains of a single table, keyed by chain name.
pub type Table = BTreeMap<String, Chain>;

/// A chain with the counters of its default policy.
///
/// `packets` and `bytes` count traffic that fell through to the policy,
/// they are not the sum of the rule counters.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Chain {
    /// Default target, or `-` for user-defined chains.
    pub policy: String,
    pub packets: u64,
    pub bytes: u64,
    #[serde(default)]
    pub rules: Vec<Rule>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Rule {
    pub packets: u64,
    pub bytes: u64,
    /// Match and target flags, without the counter token and `-A <chain>`.
    pub text: String,
}

impl Chain {
    pub fn new(policy: &str, packets: u64, bytes: u64) -> Self {
        Self {
            policy: policy.to_string(),
            packets,
            bytes,
            rules: vec![],
        }
    }

    pub fn contains_rule(&self, text: &str) -> bool {
        self.rules.iter().any(|rule| rule.text == text)
    }

    /// Append `rule` unless a rule with the same text is already present.
    ///
    /// Identity is the rule text alone: the first occurrence keeps its
    /// counters and later copies are dropped. Returns whether the rule
    /// was appended.
    pub fn push_unique(&mut self, rule: Rule) -> bool {
        if self.contains_rule(&rule.text) {
            return false;
        }
        self.rules.push(rule);
        true
    }
}

impl Rule {
    pub fn new(packets: u64, bytes: u64, text: &str) -> Self {
        Self {
            packets,
            bytes,
            text: text.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSummary {
    pub name: String,
    pub chains: usize,
    pub rules: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TablesSummary {
    pub tables: Vec<TableSummary>,
}

pub fn summarize(tables: &Tables) -> TablesSummary {
    let tables = tables
        .iter()
        .map(|(name, table)| TableSummary {
            name: name.clone(),
            chains: table.len(),
            rules: table.values().map(|chain| chain.rules.len()).sum(),
        })
        .collect();

    TablesSummary { tables }
}

impl TablesSummary {
    pub fn total_chains(&self) -> usize {
        self.tables.iter().map(|t| t.chains).sum()
    }

    pub fn total_rules(&self) -> usize {
        self.tables.iter().map(|t| t.rules).sum()
    }

    pub fn display(&self) {
        println!("🔥 iptables ({} tables):", self.tables.len());
        if self.tables.is_empty() {
            println!("  (none)");
            return;
        }

        for table in &self.tables {
            println!(
                "  • {} - {} chains, {} rules",
                table.name, table.chains, table.rules
            );
        }
        println!(
            "\n  Total: {} chains, {} rules",
            self.total_chains(),
            self.total_rules()
        );
    }
}

/// Print every chain with its policy counters and rules.
pub fn display_tables(tables: &Tables) {
    for (table_name, table) in tables {
        println!("*{}", table_name);
        for (chain_name, chain) in table {
            println!(
                "  :{} {} [{}:{}]",
                chain_name, chain.policy, chain.packets, chain.bytes
            );
            for rule in &chain.rules {
                println!("    [{}:{}] {}", rule.packets, rule.bytes, rule.text);
            }
        }
    }
}
