use std::collections::BTreeMap;

/// One rule document as it sits on disk. Validation happens in the loader
/// so that diagnostics carry the file name and offending token; unknown
/// top-level keys on a rule are collected and accepted for forward
/// compatibility.
#[derive(Debug, serde::Deserialize)]
pub struct RuleFile {
    pub version: Option<serde_yaml::Value>,
    pub rules: Option<Vec<RuleDoc>>,
}

#[derive(Debug, serde::Deserialize)]
pub struct RuleDoc {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub when: Option<String>,
    #[serde(default)]
    pub bpf: Option<String>,
    #[serde(default)]
    pub fields: Option<serde_yaml::Mapping>,
    #[serde(default)]
    pub expression: Option<String>,
    #[serde(default)]
    pub ops: Option<serde_yaml::Mapping>,
    #[serde(default)]
    pub log: Option<serde_yaml::Value>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

impl RuleFile {
    pub fn version_is_1(&self) -> bool {
        match self.version.as_ref() {
            Some(serde_yaml::Value::Number(n)) => n.as_u64() == Some(1),
            Some(serde_yaml::Value::String(s)) => s == "1",
            _ => false,
        }
    }
}

impl RuleDoc {
    pub fn log_enabled(&self) -> bool {
        match self.log.as_ref() {
            Some(serde_yaml::Value::Bool(b)) => *b,
            Some(serde_yaml::Value::String(s)) => s.eq_ignore_ascii_case("true"),
            _ => false,
        }
    }
}

/// The string form of a scalar node; rule values are processed textually
/// whatever their YAML type.
pub fn scalar_string(value: &serde_yaml::Value) -> Option<String> {
    match value {
        serde_yaml::Value::String(s) => Some(s.clone()),
        serde_yaml::Value::Number(n) => Some(n.to_string()),
        serde_yaml::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::RuleFile;

    #[test]
    fn should_parse_rule_document() {
        let file: RuleFile = serde_yaml::from_str(
            r#"
version: 1
rules:
  - name: ads
    when: fieldSet
    fields:
      dns.host,tail: ".ads.example"
    ops:
      tags: ad
"#,
        )
        .unwrap();
        assert!(file.version_is_1());
        let rules = file.rules.unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].name.as_deref(), Some("ads"));
        assert_eq!(rules[0].when.as_deref(), Some("fieldSet"));
        assert!(rules[0].fields.is_some());
        assert!(rules[0].ops.is_some());
        assert!(!rules[0].log_enabled());
    }

    #[test]
    fn should_accept_unknown_rule_keys() {
        let file: RuleFile = serde_yaml::from_str(
            r#"
version: "1"
rules:
  - name: x
    when: sessionSetup
    comment: something for later
    bpf: "port 53"
    ops:
      tags: t
"#,
        )
        .unwrap();
        assert!(file.version_is_1());
        let rules = file.rules.unwrap();
        assert!(rules[0].extra.contains_key("comment"));
    }

    #[test]
    fn should_accept_sequence_field_values() {
        let file: RuleFile = serde_yaml::from_str(
            r#"
version: 1
rules:
  - name: ports
    when: fieldSet
    fields:
      dstPort:
        - 53
        - 5353
    ops:
      tags: resolver
"#,
        )
        .unwrap();
        let rules = file.rules.unwrap();
        let fields = rules[0].fields.as_ref().unwrap();
        let value = fields.get("dstPort").unwrap();
        assert!(value.is_sequence());
    }
}
