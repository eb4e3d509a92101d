use crate::bpf::RuleBpf;
use crate::matcher::{AffixPattern, HashKey, IntRange};
use crate::ops::FieldOps;
use crate::patricia::PatriciaTree;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

/// Upper bound of rules per lifecycle point.
pub const RULES_MAX: usize = 100;

pub const SAVE_FLAG_MIDDLE: u8 = 0x01;
pub const SAVE_FLAG_FINAL: u8 = 0x02;
pub const SAVE_FLAG_BOTH: u8 = 0x03;

/// When in a session's life a rule is evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    EveryPacket,
    SessionSetup,
    AfterClassify,
    FieldSet,
    BeforeSave,
}

pub const TRIGGER_COUNT: usize = 5;

impl Trigger {
    pub fn index(&self) -> usize {
        match self {
            Trigger::EveryPacket => 0,
            Trigger::SessionSetup => 1,
            Trigger::AfterClassify => 2,
            Trigger::FieldSet => 3,
            Trigger::BeforeSave => 4,
        }
    }
}

/// What one rule requires of one field.
#[derive(Debug)]
pub struct FieldMatcher {
    pub hash: HashSet<HashKey>,
    pub affixes: Vec<AffixPattern>,
    pub ranges: Vec<IntRange>,
    pub cidrs4: Vec<(u128, u8)>,
    pub cidrs6: Vec<(u128, u8)>,
    pub tree4: PatriciaTree<()>,
    pub tree6: PatriciaTree<()>,
}

impl Default for FieldMatcher {
    fn default() -> Self {
        Self {
            hash: HashSet::new(),
            affixes: Vec::new(),
            ranges: Vec::new(),
            cidrs4: Vec::new(),
            cidrs6: Vec::new(),
            tree4: PatriciaTree::new(32),
            tree6: PatriciaTree::new(128),
        }
    }
}

impl FieldMatcher {
    pub fn add_cidr4(&mut self, prefix: u128, bitlen: u8) {
        self.cidrs4.push((prefix, bitlen));
        self.tree4.insert(prefix, bitlen);
    }

    pub fn add_cidr6(&mut self, prefix: u128, bitlen: u8) {
        self.cidrs6.push((prefix, bitlen));
        self.tree6.insert(prefix, bitlen);
    }
}

#[derive(Debug)]
pub struct Rule {
    pub name: String,
    /// File the rule came from, or the configuration list that synthesized
    /// it.
    pub source: String,
    pub trigger: Trigger,
    pub save_flags: u8,
    pub log: bool,
    pub bpf: Option<RuleBpf>,
    /// Field positions in first-reference order; all must match.
    pub fields: Vec<u16>,
    pub matchers: HashMap<u16, FieldMatcher>,
    pub ops: FieldOps,
    pub matched: AtomicU64,
}

impl Rule {
    pub fn matcher(&self, pos: u16) -> Option<&FieldMatcher> {
        self.matchers.get(&pos)
    }
}

/// Index tables for string-affix and integer-range matchers at one field
/// position; both are scanned, unlike the exact-value hash.
#[derive(Debug, Default)]
pub struct MatchTable {
    pub affixes: Vec<(AffixPattern, Vec<Arc<Rule>>)>,
    pub ranges: Vec<(IntRange, Vec<Arc<Rule>>)>,
}

/// One compiled generation of the rule configuration: the per-trigger rule
/// lists plus, per field position, the maps from every matchable value to
/// the rules referencing it. Field setting consults only these maps, so
/// evaluation cost scales with the rules that can possibly match.
#[derive(Debug)]
pub struct RuleSet {
    pub rules: [Vec<Arc<Rule>>; TRIGGER_COUNT],
    pub fields_hash: HashMap<u16, HashMap<HashKey, Vec<Arc<Rule>>>>,
    pub fields_match: HashMap<u16, MatchTable>,
    pub fields_tree4: HashMap<u16, PatriciaTree<Vec<Arc<Rule>>>>,
    pub fields_tree6: HashMap<u16, PatriciaTree<Vec<Arc<Rule>>>>,
}

impl RuleSet {
    pub fn empty() -> Self {
        Self {
            rules: Default::default(),
            fields_hash: HashMap::new(),
            fields_match: HashMap::new(),
            fields_tree4: HashMap::new(),
            fields_tree6: HashMap::new(),
        }
    }

    pub fn iter_rules(&self) -> impl Iterator<Item = &Arc<Rule>> {
        self.rules.iter().flatten()
    }

    pub fn rule_count(&self) -> usize {
        self.rules.iter().map(|list| list.len()).sum()
    }

    /// Fills the value-to-rules maps from the rules' own matchers. Called
    /// once after all rules of a generation are in place.
    pub(crate) fn build_value_index(&mut self) {
        let rules: Vec<Arc<Rule>> = self.iter_rules().cloned().collect();
        for rule in rules {
            for (pos, matcher) in rule.matchers.iter() {
                for key in matcher.hash.iter() {
                    self.fields_hash
                        .entry(*pos)
                        .or_default()
                        .entry(key.clone())
                        .or_default()
                        .push(rule.clone());
                }
                if !matcher.affixes.is_empty() || !matcher.ranges.is_empty() {
                    let table = self.fields_match.entry(*pos).or_default();
                    for affix in matcher.affixes.iter() {
                        match table.affixes.iter_mut().find(|(a, _)| a == affix) {
                            Some((_, rules)) => rules.push(rule.clone()),
                            None => table.affixes.push((affix.clone(), vec![rule.clone()])),
                        }
                    }
                    for range in matcher.ranges.iter() {
                        match table.ranges.iter_mut().find(|(r, _)| r == range) {
                            Some((_, rules)) => rules.push(rule.clone()),
                            None => table.ranges.push((*range, vec![rule.clone()])),
                        }
                    }
                }
                for (prefix, bitlen) in matcher.cidrs4.iter() {
                    self.fields_tree4
                        .entry(*pos)
                        .or_insert_with(|| PatriciaTree::new(32))
                        .insert(*prefix, *bitlen)
                        .push(rule.clone());
                }
                for (prefix, bitlen) in matcher.cidrs6.iter() {
                    self.fields_tree6
                        .entry(*pos)
                        .or_insert_with(|| PatriciaTree::new(128))
                        .insert(*prefix, *bitlen)
                        .push(rule.clone());
                }
            }
        }
    }
}
