use crate::bpf::{BpfCompiler, RuleBpf};
use crate::document::{scalar_string, RuleDoc, RuleFile};
use crate::index::{
    FieldMatcher, Rule, RuleSet, Trigger, RULES_MAX, SAVE_FLAG_BOTH, SAVE_FLAG_FINAL,
    SAVE_FLAG_MIDDLE,
};
use crate::matcher::{AffixKind, AffixPattern, HashKey, IntRange};
use crate::ops::{FieldOps, OpValue};
use crate::patricia::{v4_key, v6_key};
use ipnet::{Ipv4Net, Ipv6Net};
use std::collections::HashMap;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::Path;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use vigil_session::{FieldKind, FieldRegistry};

/// Ranges narrower than this are expanded into exact values.
const RANGE_EXPAND_WIDTH: u32 = 20;

const MAX_AFFIX_LEN: usize = 255;

/// Errors that abort a load. A failed load leaves the live rule set
/// untouched; the message carries the file and offending token so startup
/// can exit with a single diagnostic line.
#[derive(Debug)]
pub enum LoadError {
    Io { file: String, message: String },
    Parse { file: String, message: String },
    Config { file: String, message: String },
    UnknownField { file: String, expression: String },
}

impl std::fmt::Display for LoadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoadError::Io { file, message } => write!(f, "{file}: {message}"),
            LoadError::Parse { file, message } => write!(f, "{file}: {message}"),
            LoadError::Config { file, message } => write!(f, "{file}: {message}"),
            LoadError::UnknownField { file, expression } => {
                write!(f, "{file}: couldn't find field '{expression}'")
            }
        }
    }
}

impl std::error::Error for LoadError {}

fn config_err(file: &str, message: impl Into<String>) -> LoadError {
    LoadError::Config {
        file: file.to_string(),
        message: message.into(),
    }
}

/// BPF lists taken from the main configuration; each entry becomes a
/// synthesized session-setup rule.
#[derive(Debug, Clone, Default)]
pub struct SyntheticLists {
    pub dont_save_bpfs: Vec<String>,
    pub min_packets_save_bpfs: Vec<String>,
}

/// Reads and parses rule documents from disk.
pub fn load_paths<P: AsRef<Path>>(paths: &[P]) -> Result<Vec<(String, RuleFile)>, LoadError> {
    let mut files = Vec::with_capacity(paths.len());
    for path in paths {
        let name = path.as_ref().display().to_string();
        let text = std::fs::read_to_string(path.as_ref()).map_err(|err| LoadError::Io {
            file: name.clone(),
            message: format!("can not open rules file: {err}"),
        })?;
        let file: RuleFile = serde_yaml::from_str(&text).map_err(|err| LoadError::Parse {
            file: name.clone(),
            message: format!("parse error: {err}"),
        })?;
        files.push((name, file));
    }
    Ok(files)
}

/// Compiles parsed documents plus the synthetic lists into one rule-set
/// generation. Nothing of a failed compile leaks: the caller only swaps
/// the result in on success.
pub fn compile(
    files: &[(String, RuleFile)],
    lists: &SyntheticLists,
    registry: &FieldRegistry,
    compiler: &dyn BpfCompiler,
) -> Result<RuleSet, LoadError> {
    let mut set = RuleSet::empty();

    for (name, file) in files {
        if !file.version_is_1() {
            return Err(config_err(name, "Missing version: 1"));
        }
        let rules = file
            .rules
            .as_ref()
            .ok_or_else(|| config_err(name, "Missing rules"))?;
        for doc in rules {
            let rule = compile_rule(name, doc, registry, compiler)?;
            push_rule(&mut set, name, rule)?;
        }
    }

    synthesize_bpf_rules(
        &mut set,
        "dontSaveBPFs",
        &lists.dont_save_bpfs,
        "_maxPacketsToSave",
        registry,
        compiler,
    )?;
    synthesize_bpf_rules(
        &mut set,
        "minPacketsSaveBPFs",
        &lists.min_packets_save_bpfs,
        "_minPacketsBeforeSavingSPI",
        registry,
        compiler,
    )?;

    set.build_value_index();
    Ok(set)
}

fn push_rule(set: &mut RuleSet, file: &str, rule: Rule) -> Result<(), LoadError> {
    let list = &mut set.rules[rule.trigger.index()];
    if list.len() >= RULES_MAX {
        return Err(config_err(file, "Too many rules for one trigger"));
    }
    list.push(Arc::new(rule));
    Ok(())
}

fn trigger_of(file: &str, name: &str, when: &str) -> Result<(Trigger, u8, bool), LoadError> {
    // (trigger, save flags, bpf allowed)
    match when {
        "everyPacket" => Ok((Trigger::EveryPacket, 0, true)),
        "sessionSetup" => Ok((Trigger::SessionSetup, 0, true)),
        "afterClassify" => Ok((Trigger::AfterClassify, 0, false)),
        "fieldSet" => Ok((Trigger::FieldSet, 0, false)),
        "beforeMiddleSave" => Ok((Trigger::BeforeSave, SAVE_FLAG_MIDDLE, false)),
        "beforeFinalSave" => Ok((Trigger::BeforeSave, SAVE_FLAG_FINAL, false)),
        "beforeBothSave" => Ok((Trigger::BeforeSave, SAVE_FLAG_BOTH, false)),
        other => Err(config_err(
            file,
            format!("Unknown when '{other}' for rule '{name}'"),
        )),
    }
}

fn compile_rule(
    file: &str,
    doc: &RuleDoc,
    registry: &FieldRegistry,
    compiler: &dyn BpfCompiler,
) -> Result<Rule, LoadError> {
    let name = doc
        .name
        .as_deref()
        .ok_or_else(|| config_err(file, "name required for rule"))?;
    let when = doc
        .when
        .as_deref()
        .ok_or_else(|| config_err(file, format!("when required for rule '{name}'")))?;

    let selectors = [
        doc.bpf.is_some(),
        doc.fields.is_some(),
        doc.expression.is_some(),
    ];
    match selectors.iter().filter(|present| **present).count() {
        0 => {
            return Err(config_err(
                file,
                format!("bpf, fields, or expression required for rule '{name}'"),
            ))
        }
        1 => {}
        _ => {
            return Err(config_err(
                file,
                format!("Only one of bpf, fields, or expression can be set for rule '{name}'"),
            ))
        }
    }

    if doc.expression.is_some() {
        return Err(config_err(
            file,
            "Currently don't support expression, hopefully soon!",
        ));
    }

    let ops_doc = doc
        .ops
        .as_ref()
        .ok_or_else(|| config_err(file, format!("ops required for rule '{name}'")))?;

    let (trigger, save_flags, bpf_allowed) = trigger_of(file, name, when)?;
    if doc.bpf.is_some() && !bpf_allowed {
        return Err(config_err(file, format!("{when} doesn't support bpf")));
    }
    if trigger == Trigger::EveryPacket && doc.bpf.is_none() {
        return Err(config_err(file, "everyPacket only supports bpf"));
    }

    let bpf = match doc.bpf.as_deref() {
        Some(expression) => Some(compile_bpf(file, expression, compiler)?),
        None => None,
    };

    let mut rule = Rule {
        name: name.to_string(),
        source: file.to_string(),
        trigger,
        save_flags,
        log: doc.log_enabled(),
        bpf,
        fields: Vec::new(),
        matchers: HashMap::new(),
        ops: FieldOps::default(),
        matched: AtomicU64::new(0),
    };

    if let Some(fields) = doc.fields.as_ref() {
        for (key, value) in fields {
            let key = scalar_string(key)
                .ok_or_else(|| config_err(file, "rule field keys must be scalars"))?;
            compile_field_entry(file, &mut rule, registry, &key, value)?;
        }
    }

    for (key, value) in ops_doc {
        let expression = scalar_string(key)
            .ok_or_else(|| config_err(file, "op keys must be scalars"))?;
        let value = scalar_string(value)
            .ok_or_else(|| config_err(file, format!("op '{expression}' needs a scalar value")))?;
        let pos = registry
            .by_expression(&expression)
            .ok_or_else(|| LoadError::UnknownField {
                file: file.to_string(),
                expression: expression.clone(),
            })?;
        let op_value = parse_op_value(file, registry, pos, &expression, &value)?;
        rule.ops.push(pos, op_value);
    }

    Ok(rule)
}

fn compile_bpf(
    file: &str,
    expression: &str,
    compiler: &dyn BpfCompiler,
) -> Result<RuleBpf, LoadError> {
    let program = compiler.compile(expression).map_err(|err| {
        config_err(
            file,
            format!("Couldn't compile bpf filter '{expression}': {err}"),
        )
    })?;
    Ok(RuleBpf::new(expression.to_string(), program))
}

fn compile_field_entry(
    file: &str,
    rule: &mut Rule,
    registry: &FieldRegistry,
    key: &str,
    value: &serde_yaml::Value,
) -> Result<(), LoadError> {
    let (expression, modifier) = match key.split_once(',') {
        Some((expression, modifier)) => {
            let kind = match modifier {
                "tail" | "endsWith" => AffixKind::Tail,
                "head" | "startsWith" => AffixKind::Head,
                "contains" => AffixKind::Contains,
                other => {
                    return Err(config_err(
                        file,
                        format!("Rule field {expression} doesn't support modifier {other}"),
                    ))
                }
            };
            (expression, Some(kind))
        }
        None => (key, None),
    };

    let pos = registry
        .by_expression(expression)
        .ok_or_else(|| LoadError::UnknownField {
            file: file.to_string(),
            expression: expression.to_string(),
        })?;
    let kind = registry
        .kind(pos)
        .ok_or_else(|| config_err(file, format!("field '{expression}' has no kind")))?;

    if modifier.is_some() && !kind.is_string() {
        return Err(config_err(
            file,
            format!("Rule field {expression} doesn't support modifiers"),
        ));
    }
    if kind == FieldKind::Object {
        return Err(config_err(
            file,
            format!("Rule field {expression} isn't matchable"),
        ));
    }

    registry.set_rule_enabled(pos);
    if !rule.matchers.contains_key(&pos) {
        rule.fields.push(pos);
        rule.matchers.insert(pos, FieldMatcher::default());
    }

    match value {
        serde_yaml::Value::Sequence(items) => {
            for item in items {
                let text = scalar_string(item).ok_or_else(|| {
                    config_err(file, format!("field '{expression}' has a non-scalar value"))
                })?;
                add_field_value(file, rule, pos, kind, &text, modifier)?;
            }
        }
        other => {
            let text = scalar_string(other).ok_or_else(|| {
                config_err(file, format!("field '{expression}' has a non-scalar value"))
            })?;
            add_field_value(file, rule, pos, kind, &text, modifier)?;
        }
    }
    Ok(())
}

fn add_field_value(
    file: &str,
    rule: &mut Rule,
    pos: u16,
    kind: FieldKind,
    text: &str,
    modifier: Option<AffixKind>,
) -> Result<(), LoadError> {
    if let Some(affix) = modifier {
        if text.len() > MAX_AFFIX_LEN {
            return Err(config_err(file, format!("Match {text} is too large")));
        }
        let matcher = rule.matchers.get_mut(&pos).unwrap();
        matcher.affixes.push(AffixPattern {
            kind: affix,
            bytes: text.as_bytes().to_vec(),
        });
        return Ok(());
    }

    if kind.is_int() && !text.starts_with('-') && text.contains('-') {
        return add_int_range(file, rule, pos, text);
    }

    let matcher = rule.matchers.get_mut(&pos).unwrap();
    if kind.is_int() {
        let n: u32 = text
            .parse()
            .map_err(|_| config_err(file, format!("invalid integer '{text}'")))?;
        matcher.hash.insert(HashKey::Int(n as u64));
    } else if kind.is_float() {
        let f: f32 = text
            .parse()
            .map_err(|_| config_err(file, format!("invalid float '{text}'")))?;
        matcher.hash.insert(HashKey::float(f));
    } else if kind.is_ip() {
        add_cidr(file, matcher, text)?;
    } else {
        matcher.hash.insert(HashKey::Str(text.to_string()));
    }
    Ok(())
}

fn add_int_range(file: &str, rule: &mut Rule, pos: u16, text: &str) -> Result<(), LoadError> {
    let (min, max) = text.split_once('-').unwrap();
    let min: u32 = min
        .parse()
        .map_err(|_| config_err(file, format!("invalid range '{text}'")))?;
    let max: u32 = max
        .parse()
        .map_err(|_| config_err(file, format!("invalid range '{text}'")))?;
    if min > max {
        return Err(config_err(file, format!("Min {min} > Max {max} not allowed")));
    }

    let matcher = rule.matchers.get_mut(&pos).unwrap();
    if max - min < RANGE_EXPAND_WIDTH {
        for n in min..=max {
            matcher.hash.insert(HashKey::Int(n as u64));
        }
        return Ok(());
    }
    matcher.ranges.push(IntRange { min, max });
    Ok(())
}

fn add_cidr(file: &str, matcher: &mut FieldMatcher, text: &str) -> Result<(), LoadError> {
    if text == "ipv4" {
        matcher.add_cidr4(0, 0);
        return Ok(());
    }
    if text == "ipv6" {
        matcher.add_cidr6(0, 0);
        return Ok(());
    }
    if text.contains('.') {
        let (addr, len) = if text.contains('/') {
            let net: Ipv4Net = text
                .parse()
                .map_err(|_| config_err(file, format!("invalid ipv4 cidr '{text}'")))?;
            (net.network(), net.prefix_len())
        } else {
            let addr: Ipv4Addr = text
                .parse()
                .map_err(|_| config_err(file, format!("invalid ipv4 address '{text}'")))?;
            (addr, 32)
        };
        matcher.add_cidr4(v4_key(addr), len);
    } else {
        let (addr, len) = if text.contains('/') {
            let net: Ipv6Net = text
                .parse()
                .map_err(|_| config_err(file, format!("invalid ipv6 cidr '{text}'")))?;
            (net.network(), net.prefix_len())
        } else {
            let addr: Ipv6Addr = text
                .parse()
                .map_err(|_| config_err(file, format!("invalid ipv6 address '{text}'")))?;
            (addr, 128)
        };
        matcher.add_cidr6(v6_key(addr), len);
    }
    Ok(())
}

fn parse_op_value(
    file: &str,
    registry: &FieldRegistry,
    pos: u16,
    expression: &str,
    value: &str,
) -> Result<OpValue, LoadError> {
    let kind = registry
        .kind(pos)
        .ok_or_else(|| config_err(file, format!("field '{expression}' has no kind")))?;
    if kind.is_int() {
        let n: u32 = value
            .parse()
            .map_err(|_| config_err(file, format!("op '{expression}' needs an integer")))?;
        return Ok(OpValue::Int(n));
    }
    if kind.is_float() {
        let f: f32 = value
            .parse()
            .map_err(|_| config_err(file, format!("op '{expression}' needs a float")))?;
        return Ok(OpValue::Float(f));
    }
    if kind.is_ip() {
        let ip = value
            .parse()
            .map_err(|_| config_err(file, format!("op '{expression}' needs an ip")))?;
        return Ok(OpValue::Ip(ip));
    }
    if kind.is_string() {
        return Ok(OpValue::Str(value.to_string()));
    }
    Err(config_err(
        file,
        format!("op '{expression}' targets an unsupported field kind"),
    ))
}

/// `<bpf>[: <n>]`: a trailing integer sets the op value, otherwise 1.
fn split_bpf_count(entry: &str) -> (&str, u32) {
    if let Some((head, tail)) = entry.rsplit_once(':') {
        let tail = tail.trim();
        if !tail.is_empty() && tail.chars().all(|c| c.is_ascii_digit()) {
            if let Ok(n) = tail.parse() {
                return (head.trim_end(), n);
            }
        }
    }
    (entry, 1)
}

fn synthesize_bpf_rules(
    set: &mut RuleSet,
    source: &str,
    entries: &[String],
    target_expression: &str,
    registry: &FieldRegistry,
    compiler: &dyn BpfCompiler,
) -> Result<(), LoadError> {
    if entries.is_empty() {
        return Ok(());
    }
    let pos = registry
        .by_expression(target_expression)
        .ok_or_else(|| LoadError::UnknownField {
            file: source.to_string(),
            expression: target_expression.to_string(),
        })?;

    for entry in entries {
        let (bpf, count) = split_bpf_count(entry);
        let mut ops = FieldOps::default();
        ops.push(pos, OpValue::Int(count));
        let rule = Rule {
            name: bpf.to_string(),
            source: source.to_string(),
            trigger: Trigger::SessionSetup,
            save_flags: 0,
            log: false,
            bpf: Some(compile_bpf(source, bpf, compiler)?),
            fields: Vec::new(),
            matchers: HashMap::new(),
            ops,
            matched: AtomicU64::new(0),
        };
        push_rule(set, source, rule)?;
    }
    Ok(())
}
