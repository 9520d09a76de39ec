//! Value normalization applied after mapping.
//!
//! Each rule checks an attribute's value against a set of canonical values
//! and either rewrites it to the matching canonical value or falls back to
//! an unmatched action:
//!
//! ```yaml
//! mobility_needs:
//!   normalizations:
//!     Wheelchair: [wheel chair, wheelchr]
//!     Scooter: /scooter/i
//!   output_attribute: customer_service_level
//!   unmatched_action: [append, customer_notes, See notes]
//! ```
//!
//! The compact form `[normalizations, output_attribute, unmatched_action]`
//! is also accepted. Attribute names are canonicalized; canonical values
//! keep their case.

use std::path::Path;

use regex::Regex;
use serde_json::Value;

use crate::error::ConfigurationError;
use crate::pattern::parse_literal;
use crate::value::{canonical_key, canonicalize_keys, display, scalar_string, Record};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct NormalizationRuleset {
    rules: Record,
}

impl NormalizationRuleset {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_value(value: &Value) -> Result<Self, ConfigurationError> {
        match value {
            Value::Object(rules) => Ok(Self {
                rules: canonicalize_keys(rules),
            }),
            Value::Null => Ok(Self::default()),
            _ => Err(ConfigurationError::NotAMap),
        }
    }

    pub fn from_yaml_str(input: &str) -> Result<Self, ConfigurationError> {
        let value: Value = serde_yaml::from_str(input).map_err(|source| ConfigurationError::Parse {
            path: "<inline>".into(),
            source,
        })?;
        Self::from_value(&value)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigurationError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigurationError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let value: Value = serde_yaml::from_str(&contents).map_err(|source| ConfigurationError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_value(&value)
    }

    /// The rules for `sub`, or the whole document. A missing sub-ruleset is empty.
    pub fn select(&self, sub: Option<&str>) -> Record {
        match sub {
            None => self.rules.clone(),
            Some(name) => self
                .rules
                .get(&canonical_key(name))
                .and_then(Value::as_object)
                .map(canonicalize_keys)
                .unwrap_or_default(),
        }
    }

    pub fn has_sub(&self, name: &str) -> bool {
        self.rules
            .get(&canonical_key(name))
            .and_then(Value::as_object)
            .map(|sub| !sub.contains_key("normalizations"))
            .unwrap_or(false)
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn validate(&self, sub: Option<&str>) -> Result<usize, ConfigurationError> {
        let rules = self.select(sub);
        for (field, rule) in &rules {
            NormalizationRule::parse(field, rule)?;
        }
        Ok(rules.len())
    }
}

/// What a canonical value matches against.
#[derive(Debug, Clone)]
pub enum MatchSpec {
    /// Matches a null input.
    Nil,
    /// Case-insensitive string equality.
    Literal(String),
    Pattern(Regex),
    Any(Vec<MatchSpec>),
}

impl MatchSpec {
    fn parse(field: &str, value: &Value) -> Result<Self, ConfigurationError> {
        match value {
            Value::Array(items) => items
                .iter()
                .map(|item| match item {
                    Value::Array(_) => Err(ConfigurationError::invalid(
                        field,
                        format!("match set contains invalid entry {}", item),
                    )),
                    other => Self::parse_single(field, other),
                })
                .collect::<Result<_, _>>()
                .map(MatchSpec::Any),
            other => Self::parse_single(field, other),
        }
    }

    fn parse_single(field: &str, value: &Value) -> Result<Self, ConfigurationError> {
        match value {
            Value::Null => Ok(MatchSpec::Nil),
            Value::String(s) => Ok(match parse_literal(field, s)? {
                Some(re) => MatchSpec::Pattern(re),
                None => MatchSpec::Literal(s.clone()),
            }),
            other => Err(ConfigurationError::invalid(
                field,
                format!("match set contains invalid entry {}", other),
            )),
        }
    }

    pub fn matches(&self, input: &Value) -> bool {
        match self {
            MatchSpec::Nil => input.is_null(),
            MatchSpec::Literal(s) => scalar_string(input)
                .map(|v| v.eq_ignore_ascii_case(s))
                .unwrap_or(false),
            MatchSpec::Pattern(re) => !input.is_null() && re.is_match(&display(input)),
            MatchSpec::Any(specs) => specs.iter().any(|spec| spec.matches(input)),
        }
    }
}

/// Policy for a value that matched no canonical value.
#[derive(Debug, Clone, PartialEq)]
pub enum UnmatchedAction {
    Accept,
    Ignore,
    Append { notes: String, placeholder: Option<String> },
    Replace { target: String, value: Option<Value> },
}

impl UnmatchedAction {
    fn parse(field: &str, value: Option<&Value>) -> Result<Self, ConfigurationError> {
        let invalid = |v: &Value| ConfigurationError::invalid(field, format!("invalid unmatched_action {}", v));
        match value {
            None | Some(Value::Null) => Ok(UnmatchedAction::Accept),
            Some(Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
                "" | "accept" => Ok(UnmatchedAction::Accept),
                "ignore" => Ok(UnmatchedAction::Ignore),
                _ => Err(invalid(&Value::String(s.clone()))),
            },
            Some(Value::Array(items)) if items.is_empty() => Ok(UnmatchedAction::Accept),
            Some(action @ Value::Array(items)) => {
                if !(2..=3).contains(&items.len()) {
                    return Err(invalid(action));
                }
                let target = match &items[1] {
                    Value::String(s) if !s.trim().is_empty() => canonical_key(s),
                    _ => return Err(invalid(action)),
                };
                let verb = items[0].as_str().map(|s| s.trim().to_ascii_lowercase());
                match verb.as_deref() {
                    Some("append") => Ok(UnmatchedAction::Append {
                        notes: target,
                        placeholder: items
                            .get(2)
                            .map(display)
                            .filter(|p| !p.trim().is_empty()),
                    }),
                    Some("replace") => Ok(UnmatchedAction::Replace {
                        target,
                        value: items.get(2).filter(|v| !v.is_null()).cloned(),
                    }),
                    _ => Err(invalid(action)),
                }
            }
            Some(other) => Err(invalid(other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NormalizationRule {
    normalizations: Vec<(String, MatchSpec)>,
    output_attribute: Option<String>,
    unmatched_action: UnmatchedAction,
}

impl NormalizationRule {
    /// Parses a rule. `Ok(None)` means the value passes through unchanged.
    pub fn parse(field: &str, rule: &Value) -> Result<Option<Self>, ConfigurationError> {
        let (normalizations, output, action) = match rule {
            Value::Null => return Ok(None),
            Value::Object(map) => {
                let map = canonicalize_keys(map);
                (
                    map.get("normalizations").cloned(),
                    map.get("output_attribute").cloned(),
                    map.get("unmatched_action").cloned(),
                )
            }
            Value::Array(items) if (1..=3).contains(&items.len()) => {
                (items.first().cloned(), items.get(1).cloned(), items.get(2).cloned())
            }
            other => {
                return Err(ConfigurationError::invalid(
                    field,
                    format!("invalid normalization rule {}", other),
                ))
            }
        };

        let normalizations: Vec<(String, MatchSpec)> = match normalizations {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Object(set)) => set
                .iter()
                .map(|(canonical, spec)| Ok((canonical.clone(), MatchSpec::parse(field, spec)?)))
                .collect::<Result<_, ConfigurationError>>()?,
            Some(other) => {
                return Err(ConfigurationError::invalid(
                    field,
                    format!("normalizations must be a map, got {}", other),
                ))
            }
        };

        let output_attribute = match output {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) if s.trim().is_empty() => None,
            Some(Value::String(s)) => Some(canonical_key(&s)),
            Some(other) => {
                return Err(ConfigurationError::invalid(
                    field,
                    format!("invalid output_attribute {}", other),
                ))
            }
        };

        Ok(Some(Self {
            normalizations,
            output_attribute,
            unmatched_action: UnmatchedAction::parse(field, action.as_ref())?,
        }))
    }

    /// The first canonical value that `input` equals or matches.
    pub fn canonical_for(&self, input: &Value) -> Option<&str> {
        self.normalizations
            .iter()
            .find(|(canonical, spec)| input.as_str() == Some(canonical.as_str()) || spec.matches(input))
            .map(|(canonical, _)| canonical.as_str())
    }

    fn apply(&self, output: &mut Record, name: &str, value: &Value) {
        let output_name = self.output_attribute.as_deref().unwrap_or(name);
        if let Some(canonical) = self.canonical_for(value) {
            output.insert(output_name.to_string(), Value::String(canonical.to_string()));
            return;
        }
        match &self.unmatched_action {
            UnmatchedAction::Accept => {
                output.insert(output_name.to_string(), value.clone());
            }
            UnmatchedAction::Ignore => {}
            UnmatchedAction::Append { notes, placeholder } => {
                append_note(output, notes, &format!("{}: {}", name, display(value)));
                if let Some(placeholder) = placeholder {
                    output.insert(output_name.to_string(), Value::String(placeholder.clone()));
                }
            }
            UnmatchedAction::Replace { target, value: replacement } => {
                output.insert(target.clone(), replacement.clone().unwrap_or_else(|| value.clone()));
            }
        }
    }
}

fn append_note(output: &mut Record, notes: &str, line: &str) {
    let existing = output.get(notes).map(display).unwrap_or_default();
    let combined = if existing.trim().is_empty() {
        line.to_string()
    } else {
        format!("{}\n{}", existing, line)
    };
    output.insert(notes.to_string(), Value::String(combined));
}

/// Normalizes `input` with `ruleset` (or its `sub` ruleset) into `seed`.
///
/// Attributes without a rule pass through. Rules for attributes missing
/// from the input are evaluated once with a null value.
pub fn normalize(
    input: &Record,
    ruleset: &NormalizationRuleset,
    sub: Option<&str>,
    seed: Record,
) -> Result<Record, ConfigurationError> {
    let rules = ruleset.select(sub);
    let mut output = canonicalize_keys(&seed);
    let mut remaining: Vec<&String> = rules.keys().collect();

    for (name, value) in &canonicalize_keys(input) {
        remaining.retain(|k| *k != name);
        match NormalizationRule::parse(name, rules.get(name).unwrap_or(&Value::Null))? {
            Some(rule) => rule.apply(&mut output, name, value),
            None => {
                output.insert(name.clone(), value.clone());
            }
        }
    }

    for name in remaining {
        if let Some(rule) = NormalizationRule::parse(name, rules.get(name).unwrap_or(&Value::Null))? {
            rule.apply(&mut output, name, &Value::Null);
        }
    }

    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rec(value: Value) -> Record {
        value.as_object().cloned().unwrap()
    }

    fn normalized(input: Value, rules: Value) -> Value {
        let ruleset = NormalizationRuleset::from_value(&rules).unwrap();
        Value::Object(normalize(&rec(input), &ruleset, None, Record::new()).unwrap())
    }

    #[test]
    fn test_passes_through_without_rules() {
        assert_eq!(normalized(json!({ "abc": 123 }), json!({})), json!({ "abc": 123 }));
    }

    #[test]
    fn test_string_rule_is_invalid() {
        let ruleset = NormalizationRuleset::from_value(&json!({ "abc": "invalid" })).unwrap();
        assert!(normalize(&rec(json!({ "abc": "test" })), &ruleset, None, Record::new()).is_err());
    }

    #[test]
    fn test_map_and_compact_forms_agree() {
        let long = json!({ "abc": {
            "normalizations": { "normal": ["test"] },
            "output_attribute": "def",
            "unmatched_action": "accept"
        }});
        let compact = json!({ "abc": [{ "normal": ["test"] }, "def", "accept"] });
        assert_eq!(normalized(json!({ "abc": "test" }), long), json!({ "def": "normal" }));
        assert_eq!(normalized(json!({ "abc": "test" }), compact), json!({ "def": "normal" }));
    }

    #[test]
    fn test_output_attribute_defaults_to_input_name() {
        assert_eq!(
            normalized(json!({ "abc": "test" }), json!({ "abc": [{ "normal": ["test"] }] })),
            json!({ "abc": "normal" })
        );
    }

    #[test]
    fn test_sub_rulesets() {
        let ruleset = NormalizationRuleset::from_value(&json!({
            "subset1": { "my_attr": [{}, "output1"] },
            "subset2": { "my_attr": [{}, "output2"] }
        }))
        .unwrap();
        let input = rec(json!({ "my_attr": 123 }));
        let output = normalize(&input, &ruleset, Some("subset2"), Record::new()).unwrap();
        assert_eq!(Value::Object(output), json!({ "output2": 123 }));
        let output = normalize(&input, &ruleset, Some("invalid"), Record::new()).unwrap();
        assert_eq!(Value::Object(output), json!({ "my_attr": 123 }));
        assert!(ruleset.has_sub("subset1"));
    }

    #[test]
    fn test_exact_match_is_case_sensitive() {
        let rules = json!({ "my_attr": [{ "FOO": ["random", "stuff"] }] });
        assert_eq!(normalized(json!({ "my_attr": "FOO" }), rules.clone()), json!({ "my_attr": "FOO" }));
        assert_eq!(normalized(json!({ "my_attr": "foo" }), rules), json!({ "my_attr": "foo" }));
    }

    #[test]
    fn test_list_match_is_case_insensitive() {
        let rules = json!({ "my_attr": [{ "foo": ["random", "stuff"] }] });
        assert_eq!(normalized(json!({ "my_attr": "STUFF" }), rules), json!({ "my_attr": "foo" }));
    }

    #[test]
    fn test_regex_and_string_specs() {
        assert_eq!(
            normalized(json!({ "my_attr": "stuff" }), json!({ "my_attr": [{ "foo": ["random", "/ff$/"] }] })),
            json!({ "my_attr": "foo" })
        );
        assert_eq!(
            normalized(json!({ "my_attr": "STUFF" }), json!({ "my_attr": [{ "foo": "stuff" }] })),
            json!({ "my_attr": "foo" })
        );
        assert_eq!(
            normalized(json!({ "mobility": "Power Scooter" }), json!({ "mobility": [{ "Scooter": "/scooter/i" }] })),
            json!({ "mobility": "Scooter" })
        );
    }

    #[test]
    fn test_nil_spec_matches_missing_value() {
        assert_eq!(
            normalized(json!({}), json!({ "gender": [{ "U": null }] })),
            json!({ "gender": "U" })
        );
    }

    #[test]
    fn test_first_canonical_value_wins() {
        assert_eq!(
            normalized(
                json!({ "level": "curb" }),
                json!({ "level": [{ "Curb to Curb": ["curb"], "Door to Door": ["/curb/"] }] })
            ),
            json!({ "level": "Curb to Curb" })
        );
    }

    #[test]
    fn test_invalid_match_entries() {
        for spec in [json!([1234]), json!(123), json!({ "a": 1 })] {
            let ruleset = NormalizationRuleset::from_value(&json!({ "my_attr": [{ "foo": spec }] })).unwrap();
            assert!(normalize(&rec(json!({ "my_attr": "stuff" })), &ruleset, None, Record::new()).is_err());
        }
    }

    #[test]
    fn test_unmatched_accept_and_ignore() {
        assert_eq!(
            normalized(json!({ "abc": "nomatch" }), json!({ "abc": [{ "normal": ["match"] }, "def"] })),
            json!({ "def": "nomatch" })
        );
        assert_eq!(
            normalized(json!({ "abc": "nomatch" }), json!({ "abc": [{ "normal": ["match"] }, "def", "ignore"] })),
            json!({})
        );
    }

    #[test]
    fn test_unmatched_append() {
        let rules = NormalizationRuleset::from_value(&json!({
            "abc": [{ "normal": ["match"] }, "def", ["append", "notes"]]
        }))
        .unwrap();
        let seed = rec(json!({ "notes": "existing value" }));
        let output = normalize(&rec(json!({ "abc": "nomatch" })), &rules, None, seed).unwrap();
        assert_eq!(Value::Object(output), json!({ "notes": "existing value\nabc: nomatch" }));

        let output = normalize(&rec(json!({ "abc": "nomatch" })), &rules, None, Record::new()).unwrap();
        assert_eq!(Value::Object(output), json!({ "notes": "abc: nomatch" }));
    }

    #[test]
    fn test_unmatched_append_placeholder() {
        assert_eq!(
            normalized(
                json!({ "abc": "nomatch" }),
                json!({ "abc": [{ "normal": ["match"] }, "def", ["append", "notes", "See notes"]] })
            ),
            json!({ "notes": "abc: nomatch", "def": "See notes" })
        );
    }

    #[test]
    fn test_unmatched_replace() {
        assert_eq!(
            normalized(json!({ "abc": "nomatch" }), json!({ "abc": [{ "normal": ["match"] }, "def", ["replace", "ghi"]] })),
            json!({ "ghi": "nomatch" })
        );
        assert_eq!(
            normalized(
                json!({ "abc": "nomatch" }),
                json!({ "abc": [{ "normal": ["match"] }, "def", ["replace", "ghi", "unmatched"]] })
            ),
            json!({ "ghi": "unmatched" })
        );
    }

    #[test]
    fn test_invalid_unmatched_actions() {
        for action in [json!("invalid"), json!(["invalid", "invalid"]), json!(["append"])] {
            let ruleset =
                NormalizationRuleset::from_value(&json!({ "abc": [{ "normal": ["match"] }, "def", action] })).unwrap();
            assert!(ruleset.validate(None).is_err());
        }
    }

    #[test]
    fn test_from_yaml_str() {
        let ruleset = NormalizationRuleset::from_yaml_str(
            "Customer_Gender:\n  normalizations:\n    M: [male, m]\n    F: [female, f]\n  unmatched_action: [append, customer_notes]\n",
        )
        .unwrap();
        let output = normalize(&rec(json!({ "customer_gender": "Male" })), &ruleset, None, Record::new()).unwrap();
        assert_eq!(Value::Object(output), json!({ "customer_gender": "M" }));
    }
}
