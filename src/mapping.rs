//! Declarative field mapping between the provider's flat rows and the
//! Clearinghouse's nested records.
//!
//! A mapping ruleset is a map from input attribute name to a rule. Rules are
//! either a target (a field name, or a nested path such as
//! `[customer_address_attributes, city]`), `true` to copy unchanged, or a map
//! of commands:
//!
//! ```yaml
//! __accept_unmapped__: true
//! trip_id: origin_trip_id
//! customer_home_city: [customer_address_attributes, city]
//! customer_middle_name: { truncate: [customer_middle_initial, 1] }
//! customer_home_telephone: { prepend: [[customer_address_attributes, phone_number], " "] }
//! phone_plus_extension: { split: [" ", phone_number, extension] }
//! customer_internal_id: { key_values: [customer_identifiers, ",", rc_customer_id] }
//! customer_assistance_needs: { list: [customer_mobility_factors, "|"] }
//! status: { ignore: true }
//! ```
//!
//! `__accept_unmapped__` controls whether attributes without a rule pass
//! through (`true`, `"true"` or absent) or are dropped (anything else).
//! A ruleset can hold named sub-rulesets, selected per call with `sub`.

use std::path::Path;

use regex::Regex;
use serde_json::Value;

use crate::error::ConfigurationError;
use crate::pattern::{parse_literal, parse_pattern};
use crate::value::{canonical_key, canonicalize_deep, canonicalize_keys, display, Record};

/// Rule key controlling whether attributes without a rule pass through.
pub const ACCEPT_UNMAPPED_KEY: &str = "__accept_unmapped__";

/// An immutable mapping rule document with canonicalized keys.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MappingRuleset {
    rules: Record,
}

impl MappingRuleset {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_value(value: &Value) -> Result<Self, ConfigurationError> {
        match canonicalize_deep(value) {
            Value::Object(rules) => Ok(Self { rules }),
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

    /// Loads a YAML rule document.
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

    /// The rules for `sub`, or the whole document when `sub` is `None`.
    ///
    /// A named sub-ruleset that does not exist selects an empty ruleset.
    pub fn select(&self, sub: Option<&str>) -> Record {
        match sub {
            None => self.rules.clone(),
            Some(name) => self
                .rules
                .get(&canonical_key(name))
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default(),
        }
    }

    pub fn has_sub(&self, name: &str) -> bool {
        self.rules
            .get(&canonical_key(name))
            .map(Value::is_object)
            .unwrap_or(false)
    }

    /// Field names with a rule in `sub`, excluding the unmapped marker.
    pub fn keys(&self, sub: Option<&str>) -> Vec<String> {
        self.select(sub)
            .keys()
            .filter(|k| k.as_str() != ACCEPT_UNMAPPED_KEY)
            .cloned()
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Parses every rule in `sub`, failing on the first malformed one.
    pub fn validate(&self, sub: Option<&str>) -> Result<usize, ConfigurationError> {
        let rules = self.select(sub);
        let mut count = 0;
        for (field, rule) in rules.iter().filter(|(k, _)| k.as_str() != ACCEPT_UNMAPPED_KEY) {
            MappingRule::parse(field, rule)?;
            count += 1;
        }
        Ok(count)
    }
}

/// Where a rule writes its result.
#[derive(Debug, Clone, PartialEq)]
pub struct Target {
    /// Nested container names, outermost first. Empty for a top-level field.
    containers: Vec<String>,
    /// Output attribute name. `None` reuses the input attribute name.
    leaf: Option<String>,
}

impl Target {
    pub fn field(name: impl Into<String>) -> Self {
        Self {
            containers: Vec::new(),
            leaf: Some(name.into()),
        }
    }

    fn parse(field: &str, value: &Value) -> Result<Self, ConfigurationError> {
        match value {
            Value::Array(items) => Self::parse_path(field, items),
            other => Ok(Self::field(attribute_name(field, other)?)),
        }
    }

    /// `[a]` writes `a.<input>`, `[a, b]` writes `a.b`, `[a, [b, c]]` writes `a.b.c`.
    fn parse_path(field: &str, items: &[Value]) -> Result<Self, ConfigurationError> {
        let mut containers = Vec::new();
        let mut level = items;
        loop {
            if !(1..=2).contains(&level.len()) {
                return Err(ConfigurationError::invalid(
                    field,
                    "nested attribute paths must have one or two entries per level",
                ));
            }
            containers.push(attribute_name(field, &level[0])?);
            match level.get(1) {
                None => return Ok(Self { containers, leaf: None }),
                Some(Value::Array(next)) => level = next,
                Some(other) => {
                    let leaf = attribute_name(field, other)?;
                    return Ok(Self {
                        containers,
                        leaf: Some(leaf),
                    });
                }
            }
        }
    }

    fn leaf<'a>(&'a self, input_name: &'a str) -> &'a str {
        self.leaf.as_deref().unwrap_or(input_name)
    }

    fn is_nested(&self) -> bool {
        !self.containers.is_empty()
    }
}

fn attribute_name(field: &str, value: &Value) -> Result<String, ConfigurationError> {
    match value {
        Value::String(s) => {
            let name = canonical_key(s.strip_prefix(':').unwrap_or(s));
            if name.is_empty() {
                Err(ConfigurationError::invalid(field, "attribute names must not be empty"))
            } else {
                Ok(name)
            }
        }
        other => Err(ConfigurationError::invalid(
            field,
            format!("invalid attribute name {}", other),
        )),
    }
}

/// How `split` breaks its input apart.
#[derive(Debug, Clone)]
pub enum Splitter {
    /// A single space splits on runs of whitespace.
    Whitespace,
    Literal(String),
    Pattern(Regex),
}

impl Splitter {
    fn parse(field: &str, value: &Value) -> Result<Self, ConfigurationError> {
        let raw = match value {
            Value::String(s) if !s.is_empty() => s,
            _ => {
                return Err(ConfigurationError::invalid(
                    field,
                    "split requires a string or /regex/ separator",
                ))
            }
        };
        if raw == " " {
            return Ok(Splitter::Whitespace);
        }
        Ok(match parse_literal(field, raw)? {
            Some(re) => Splitter::Pattern(re),
            None => Splitter::Literal(raw.clone()),
        })
    }

    fn split(&self, input: &str) -> Vec<String> {
        let mut pieces: Vec<String> = match self {
            Splitter::Whitespace => input.split_whitespace().map(str::to_string).collect(),
            Splitter::Literal(sep) => input.split(sep.as_str()).map(|p| p.trim().to_string()).collect(),
            Splitter::Pattern(re) => re.split(input).map(|p| p.trim().to_string()).collect(),
        };
        drop_trailing_empty(&mut pieces);
        pieces
    }
}

fn drop_trailing_empty(pieces: &mut Vec<String>) {
    while pieces.last().map(|p| p.is_empty()).unwrap_or(false) {
        pieces.pop();
    }
}

/// One transformation inside a command rule.
#[derive(Debug, Clone)]
pub enum Command {
    Truncate { target: Target, length: usize },
    Prepend { target: Target, separator: Option<String> },
    Append { target: Target, separator: Option<String> },
    Split { splitter: Splitter, targets: Vec<Target> },
    And(Vec<Target>),
    Or(Target),
    Match(Vec<(Regex, Target)>),
    KeyValues { target: Target, separator: String, default_key: String },
    KeyValueMerge { target: Target, separator: String },
    List { target: Target, separator: String },
    ListMerge { target: Target, separator: String },
    Ignore,
}

impl Command {
    fn parse(field: &str, name: &str, args: &Value) -> Result<Self, ConfigurationError> {
        let command = match name {
            "truncate" => {
                let args = arguments(field, name, args, 2..=2)?;
                let length = args[1]
                    .as_u64()
                    .ok_or_else(|| ConfigurationError::invalid(field, "truncate length must be a positive integer"))?;
                Command::Truncate {
                    target: Target::parse(field, &args[0])?,
                    length: length as usize,
                }
            }
            "prepend" | "append" => {
                let args = arguments(field, name, args, 1..=2)?;
                let target = Target::parse(field, &args[0])?;
                let separator = optional_string(field, args.get(1))?;
                if name == "prepend" {
                    Command::Prepend { target, separator }
                } else {
                    Command::Append { target, separator }
                }
            }
            "split" => {
                let args = arguments(field, name, args, 2..=usize::MAX)?;
                Command::Split {
                    splitter: Splitter::parse(field, &args[0])?,
                    targets: args[1..]
                        .iter()
                        .map(|t| Target::parse(field, t))
                        .collect::<Result<_, _>>()?,
                }
            }
            "and" => {
                let args = arguments(field, name, args, 1..=usize::MAX)?;
                Command::And(
                    args.iter()
                        .map(|t| Target::parse(field, t))
                        .collect::<Result<_, _>>()?,
                )
            }
            "or" => Command::Or(Target::parse(field, args)?),
            "match" => {
                let args = arguments(field, name, args, 2..=usize::MAX)?;
                if args.len() % 2 != 0 {
                    return Err(ConfigurationError::invalid(
                        field,
                        "match requires pairs of pattern and target",
                    ));
                }
                let mut pairs = Vec::with_capacity(args.len() / 2);
                for pair in args.chunks(2) {
                    let pattern = pair[0].as_str().ok_or_else(|| {
                        ConfigurationError::invalid(field, "match patterns must be strings")
                    })?;
                    pairs.push((parse_pattern(field, pattern)?, Target::parse(field, &pair[1])?));
                }
                Command::Match(pairs)
            }
            "key_values" => {
                let args = arguments(field, name, args, 1..=3)?;
                Command::KeyValues {
                    target: Target::parse(field, &args[0])?,
                    separator: optional_string(field, args.get(1))?.unwrap_or_else(|| ",".to_string()),
                    default_key: match args.get(2) {
                        None | Some(Value::Null) => "value".to_string(),
                        Some(key) => attribute_name(field, key)?,
                    },
                }
            }
            "key_value_merge" | "list" | "list_merge" => {
                let args = arguments(field, name, args, 1..=2)?;
                let target = Target::parse(field, &args[0])?;
                let separator = optional_string(field, args.get(1))?.unwrap_or_else(|| ",".to_string());
                match name {
                    "key_value_merge" => Command::KeyValueMerge { target, separator },
                    "list" => Command::List { target, separator },
                    _ => Command::ListMerge { target, separator },
                }
            }
            "ignore" => Command::Ignore,
            other => {
                return Err(ConfigurationError::UnknownTransformation {
                    field: field.to_string(),
                    name: other.to_string(),
                })
            }
        };
        Ok(command)
    }
}

fn arguments<'a>(
    field: &str,
    command: &str,
    args: &'a Value,
    arity: std::ops::RangeInclusive<usize>,
) -> Result<&'a [Value], ConfigurationError> {
    match args {
        Value::Array(items) if arity.contains(&items.len()) => Ok(items),
        _ => Err(ConfigurationError::invalid(
            field,
            format!("invalid {} arguments: {}", command.to_uppercase(), args),
        )),
    }
}

fn optional_string(field: &str, value: Option<&Value>) -> Result<Option<String>, ConfigurationError> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(other) => Err(ConfigurationError::invalid(
            field,
            format!("separator must be a string, got {}", other),
        )),
    }
}

/// A parsed rule for a single input attribute.
#[derive(Debug, Clone)]
pub enum MappingRule {
    /// No rule: copy under the same name if unmapped attributes are accepted.
    Unmapped,
    Copy,
    Assign(Target),
    Commands(Vec<Command>),
}

impl MappingRule {
    pub fn parse(field: &str, rule: &Value) -> Result<Self, ConfigurationError> {
        match rule {
            Value::Null => Ok(MappingRule::Unmapped),
            Value::Bool(true) => Ok(MappingRule::Copy),
            Value::String(s) if s == "true" => Ok(MappingRule::Copy),
            Value::String(_) | Value::Array(_) => Ok(MappingRule::Assign(Target::parse(field, rule)?)),
            Value::Object(commands) => commands
                .iter()
                .map(|(name, args)| Command::parse(field, name, args))
                .collect::<Result<_, _>>()
                .map(MappingRule::Commands),
            other => Err(ConfigurationError::invalid(field, format!("invalid mapping {}", other))),
        }
    }
}

/// Maps `input` through `ruleset` (or its `sub` ruleset) into `seed`.
///
/// Every rule is evaluated once, including rules for attributes missing
/// from the input, which see a null value.
pub fn map(
    input: &Record,
    ruleset: &MappingRuleset,
    sub: Option<&str>,
    seed: Record,
) -> Result<Record, ConfigurationError> {
    let rules = ruleset.select(sub);
    let accept_unmapped = match rules.get(ACCEPT_UNMAPPED_KEY) {
        None | Some(Value::Null) | Some(Value::Bool(true)) => true,
        Some(Value::String(s)) => s == "true",
        Some(_) => false,
    };

    let mut output = canonicalize_keys(&seed);
    let mut remaining: Vec<&String> = rules
        .keys()
        .filter(|k| k.as_str() != ACCEPT_UNMAPPED_KEY)
        .collect();

    for (name, value) in &canonicalize_keys(input) {
        if name == ACCEPT_UNMAPPED_KEY {
            continue;
        }
        remaining.retain(|k| *k != name);
        let rule = MappingRule::parse(name, rules.get(name).unwrap_or(&Value::Null))?;
        apply(&mut output, &rule, name, value, accept_unmapped);
    }

    for name in remaining {
        let rule = MappingRule::parse(name, rules.get(name).unwrap_or(&Value::Null))?;
        apply(&mut output, &rule, name, &Value::Null, accept_unmapped);
    }

    Ok(output)
}

fn apply(output: &mut Record, rule: &MappingRule, name: &str, value: &Value, accept_unmapped: bool) {
    match rule {
        MappingRule::Unmapped if accept_unmapped => assign(output, &Target::field(name), name, value.clone()),
        MappingRule::Unmapped => {}
        MappingRule::Copy => assign(output, &Target::field(name), name, value.clone()),
        MappingRule::Assign(target) => assign(output, target, name, value.clone()),
        MappingRule::Commands(commands) => {
            for command in commands {
                run(output, command, name, value);
            }
        }
    }
}

fn run(output: &mut Record, command: &Command, name: &str, value: &Value) {
    match command {
        Command::Truncate { target, length } => {
            let result = match value {
                Value::Null => Value::Null,
                other => Value::String(display(other).chars().take(*length).collect()),
            };
            assign(output, target, name, result);
        }
        Command::Prepend { target, separator } => assign_with(output, target, name, |previous| {
            join(&display(value), &previous.map(display).unwrap_or_default(), separator.as_deref())
        }),
        Command::Append { target, separator } => assign_with(output, target, name, |previous| {
            join(&previous.map(display).unwrap_or_default(), &display(value), separator.as_deref())
        }),
        Command::Split { splitter, targets } => {
            let pieces = match value {
                Value::Null => Vec::new(),
                other => splitter.split(&display(other)),
            };
            for (i, target) in targets.iter().enumerate() {
                let piece = pieces.get(i).cloned().map(Value::String).unwrap_or(Value::Null);
                assign(output, target, name, piece);
            }
        }
        Command::And(targets) => {
            for target in targets {
                assign(output, target, name, value.clone());
            }
        }
        Command::Or(target) => assign_with(output, target, name, |previous| match previous {
            Some(existing) if !existing.is_null() => existing.clone(),
            _ => value.clone(),
        }),
        Command::Match(pairs) => {
            if value.is_null() {
                return;
            }
            let text = display(value);
            for (re, target) in pairs {
                if let Some(found) = re.find(&text) {
                    assign(output, target, name, Value::String(found.as_str().to_string()));
                }
            }
        }
        Command::KeyValues { target, separator, default_key } => {
            let result = match value {
                Value::Null => Value::Null,
                other => Value::Object(key_values(&display(other), separator, default_key)),
            };
            assign(output, target, name, result);
        }
        Command::KeyValueMerge { target, separator } => {
            let result = match value {
                Value::Object(pairs) => Value::String(key_value_merge(pairs, separator)),
                other => other.clone(),
            };
            assign(output, target, name, result);
        }
        Command::List { target, separator } => {
            let result = match value {
                Value::Null => Value::Null,
                other => Value::Array(list(&display(other), separator).into_iter().map(Value::String).collect()),
            };
            assign(output, target, name, result);
        }
        Command::ListMerge { target, separator } => {
            let result = match value {
                Value::Array(items) => Value::String(list_merge(items, separator)),
                other => other.clone(),
            };
            assign(output, target, name, result);
        }
        Command::Ignore => {}
    }
}

/// Joins two strings, adding `separator` only where it is not already present.
fn join(first: &str, second: &str, separator: Option<&str>) -> Value {
    let separator = match separator {
        Some(sep) if !sep.is_empty() && !first.is_empty() && !second.is_empty() => {
            if first.ends_with(sep) || second.starts_with(sep) {
                ""
            } else {
                sep
            }
        }
        _ => "",
    };
    Value::String(format!("{first}{separator}{second}"))
}

/// Parses `"home:503-555-1212,work:503-555-3434"` into a map.
pub fn key_values(input: &str, separator: &str, default_key: &str) -> Record {
    input
        .split(separator)
        .map(str::trim)
        .filter(|piece| !piece.is_empty())
        .map(|piece| match piece.split_once(':') {
            Some((key, value)) => (canonical_key(key), Value::String(value.trim().to_string())),
            None => (default_key.to_string(), Value::String(piece.to_string())),
        })
        .collect()
}

pub fn key_value_merge(pairs: &Record, separator: &str) -> String {
    pairs
        .iter()
        .map(|(k, v)| format!("{}:{}", k, display(v)))
        .collect::<Vec<_>>()
        .join(separator)
}

pub fn list(input: &str, separator: &str) -> Vec<String> {
    let mut pieces: Vec<String> = input.split(separator).map(|p| p.trim().to_string()).collect();
    drop_trailing_empty(&mut pieces);
    pieces
}

pub fn list_merge(items: &[Value], separator: &str) -> String {
    items.iter().map(display).collect::<Vec<_>>().join(separator)
}

fn assign(output: &mut Record, target: &Target, input_name: &str, value: Value) {
    assign_with(output, target, input_name, move |_| value)
}

/// Writes the result of `compute(previous value at target)` into `output`.
///
/// Top-level fields are always written. Nested paths skip null and empty
/// results, and create their containers only when something is written.
fn assign_with<F>(output: &mut Record, target: &Target, input_name: &str, compute: F)
where
    F: FnOnce(Option<&Value>) -> Value,
{
    let leaf = target.leaf(input_name).to_string();
    if !target.is_nested() {
        let result = trim_result(compute(output.get(&leaf)));
        output.insert(leaf, result);
        return;
    }

    let previous = lookup(output, &target.containers).and_then(|container| container.get(&leaf));
    let result = trim_result(compute(previous));
    if result.is_null() || result.as_str() == Some("") {
        return;
    }
    insert_at(output, &target.containers, leaf, result);
}

fn trim_result(value: Value) -> Value {
    match value {
        Value::String(s) => Value::String(s.trim().to_string()),
        other => other,
    }
}

fn lookup<'a>(output: &'a Record, path: &[String]) -> Option<&'a Record> {
    path.iter()
        .try_fold(output, |container, key| container.get(key)?.as_object())
}

fn insert_at(container: &mut Record, path: &[String], leaf: String, value: Value) {
    match path.split_first() {
        None => {
            container.insert(leaf, value);
        }
        Some((key, rest)) => {
            let slot = container
                .entry(key.clone())
                .or_insert_with(|| Value::Object(Record::new()));
            if !slot.is_object() {
                *slot = Value::Object(Record::new());
            }
            if let Value::Object(child) = slot {
                insert_at(child, rest, leaf, value);
            }
        }
    }
}
