//! Property values with deferred output references.
//!
//! Declared properties are plain JSON except for three forms:
//!
//! - `"${network.id}"`: the whole value is another resource's output
//! - `"${project}-ng-${role.name}"`: string interpolation
//! - `{"$concat": [a, b]}`: concatenation of list values
//!
//! References stay as explicit placeholders until the executor has the
//! upstream outputs in hand. `${project}` and `${environment}` are naming
//! variables and are substituted while parsing.

use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Key of the concatenation form.
const CONCAT_KEY: &str = "$concat";

/// Naming variables threaded from configuration into property parsing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamingContext {
    /// Project name (`${project}`).
    pub project: String,
    /// Environment name (`${environment}`).
    pub environment: String,
}

/// A reference to one output of another resource.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OutputRef {
    /// Referenced resource name.
    pub resource: String,
    /// Output key on that resource.
    pub output: String,
}

/// A parsed property value.
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    /// Fully known JSON value.
    Literal(Value),
    /// The whole value is an upstream output.
    Ref(OutputRef),
    /// String built from text and upstream outputs.
    Template(Vec<Segment>),
    /// List whose items may hold references.
    List(Vec<PropertyValue>),
    /// Map whose values may hold references.
    Map(BTreeMap<String, PropertyValue>),
    /// Concatenation of list values.
    Concat(Vec<PropertyValue>),
}

/// Piece of an interpolated string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    /// Literal text.
    Text(String),
    /// Upstream output rendered as text.
    Ref(OutputRef),
}

/// Why a value could not be resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    /// The referenced output is not known yet.
    Unknown(OutputRef),
    /// The referenced output has the wrong shape.
    Invalid(String),
}

impl NamingContext {
    /// Creates a naming context.
    #[must_use]
    pub fn new(project: impl Into<String>, environment: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            environment: environment.into(),
        }
    }

    fn variable(&self, name: &str) -> Option<&str> {
        match name {
            "project" => Some(&self.project),
            "environment" => Some(&self.environment),
            _ => None,
        }
    }
}

impl OutputRef {
    /// Creates a reference.
    #[must_use]
    pub fn new(resource: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            output: output.into(),
        }
    }
}

impl fmt::Display for OutputRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "${{{}.{}}}", self.resource, self.output)
    }
}

impl PropertyValue {
    /// Parses a declared JSON value.
    ///
    /// # Errors
    ///
    /// Returns a message when a placeholder is malformed or names an
    /// unknown naming variable.
    pub fn parse(value: &Value, naming: &NamingContext) -> Result<Self, String> {
        match value {
            Value::String(s) => parse_string(s, naming),
            Value::Array(items) => {
                let parsed = items
                    .iter()
                    .map(|item| Self::parse(item, naming))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Self::collapse_list(parsed))
            }
            Value::Object(map) => {
                if let Some(items) = map.get(CONCAT_KEY) {
                    if map.len() != 1 {
                        return Err(format!("'{CONCAT_KEY}' cannot be combined with other keys"));
                    }
                    let Value::Array(items) = items else {
                        return Err(format!("'{CONCAT_KEY}' expects a list"));
                    };
                    let parsed = items
                        .iter()
                        .map(|item| Self::parse(item, naming))
                        .collect::<Result<Vec<_>, _>>()?;
                    return Ok(Self::Concat(parsed));
                }

                let mut parsed = BTreeMap::new();
                for (key, item) in map {
                    parsed.insert(key.clone(), Self::parse(item, naming)?);
                }
                Ok(Self::collapse_map(parsed))
            }
            other => Ok(Self::Literal(other.clone())),
        }
    }

    /// Returns every output reference held by this value.
    #[must_use]
    pub fn references(&self) -> Vec<&OutputRef> {
        let mut refs = Vec::new();
        self.collect_references(&mut refs);
        refs
    }

    fn collect_references<'a>(&'a self, refs: &mut Vec<&'a OutputRef>) {
        match self {
            Self::Literal(_) => {}
            Self::Ref(r) => refs.push(r),
            Self::Template(segments) => {
                for segment in segments {
                    if let Segment::Ref(r) = segment {
                        refs.push(r);
                    }
                }
            }
            Self::List(items) | Self::Concat(items) => {
                for item in items {
                    item.collect_references(refs);
                }
            }
            Self::Map(map) => {
                for item in map.values() {
                    item.collect_references(refs);
                }
            }
        }
    }

    /// Returns true if the value holds no references.
    #[must_use]
    pub const fn is_literal(&self) -> bool {
        matches!(self, Self::Literal(_))
    }

    /// Resolves placeholders using `lookup`.
    ///
    /// # Errors
    ///
    /// Returns [`ResolveError::Unknown`] for the first reference `lookup`
    /// cannot answer and [`ResolveError::Invalid`] for shape mismatches.
    pub fn resolve<F>(&self, lookup: &F) -> Result<Value, ResolveError>
    where
        F: Fn(&OutputRef) -> Option<Value>,
    {
        match self {
            Self::Literal(v) => Ok(v.clone()),
            Self::Ref(r) => lookup(r).ok_or_else(|| ResolveError::Unknown(r.clone())),
            Self::Template(segments) => {
                let mut out = String::new();
                for segment in segments {
                    match segment {
                        Segment::Text(t) => out.push_str(t),
                        Segment::Ref(r) => {
                            let value = lookup(r).ok_or_else(|| ResolveError::Unknown(r.clone()))?;
                            out.push_str(&scalar_to_string(r, &value)?);
                        }
                    }
                }
                Ok(Value::String(out))
            }
            Self::List(items) => items
                .iter()
                .map(|item| item.resolve(lookup))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            Self::Map(map) => {
                let mut out = serde_json::Map::new();
                for (key, item) in map {
                    out.insert(key.clone(), item.resolve(lookup)?);
                }
                Ok(Value::Object(out))
            }
            Self::Concat(items) => {
                let mut out = Vec::new();
                for item in items {
                    match item.resolve(lookup)? {
                        Value::Array(values) => out.extend(values),
                        other => {
                            return Err(ResolveError::Invalid(format!(
                                "'{CONCAT_KEY}' item is not a list: {other}"
                            )));
                        }
                    }
                }
                Ok(Value::Array(out))
            }
        }
    }

    fn collapse_list(items: Vec<Self>) -> Self {
        if items.iter().all(Self::is_literal) {
            Self::Literal(Value::Array(
                items.into_iter().filter_map(Self::into_literal).collect(),
            ))
        } else {
            Self::List(items)
        }
    }

    fn collapse_map(map: BTreeMap<String, Self>) -> Self {
        if map.values().all(Self::is_literal) {
            Self::Literal(Value::Object(
                map.into_iter()
                    .filter_map(|(k, v)| v.into_literal().map(|v| (k, v)))
                    .collect(),
            ))
        } else {
            Self::Map(map)
        }
    }

    fn into_literal(self) -> Option<Value> {
        match self {
            Self::Literal(v) => Some(v),
            _ => None,
        }
    }
}

fn scalar_to_string(r: &OutputRef, value: &Value) -> Result<String, ResolveError> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        _ => Err(ResolveError::Invalid(format!(
            "{r} is not a scalar and cannot be interpolated"
        ))),
    }
}

/// Parses a string into a literal, a reference or a template.
fn parse_string(input: &str, naming: &NamingContext) -> Result<PropertyValue, String> {
    let mut segments: Vec<Segment> = Vec::new();
    let mut text = String::new();
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        // "$${" escapes a literal "${"
        if start > 0 && rest[..start].ends_with('$') {
            text.push_str(&rest[..start - 1]);
            text.push_str("${");
            rest = &rest[start + 2..];
            continue;
        }

        text.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after
            .find('}')
            .ok_or_else(|| format!("unterminated placeholder in '{input}'"))?;
        let expr = after[..end].trim();
        rest = &after[end + 1..];

        if let Some((resource, output)) = expr.split_once('.') {
            if resource.is_empty() || output.is_empty() {
                return Err(format!("malformed reference '${{{expr}}}'"));
            }
            if !text.is_empty() {
                segments.push(Segment::Text(std::mem::take(&mut text)));
            }
            segments.push(Segment::Ref(OutputRef::new(resource, output)));
        } else {
            let value = naming
                .variable(expr)
                .ok_or_else(|| format!("unknown variable '${{{expr}}}'"))?;
            text.push_str(value);
        }
    }
    text.push_str(rest);
    if !text.is_empty() {
        segments.push(Segment::Text(text));
    }

    let has_refs = segments.iter().any(|s| matches!(s, Segment::Ref(_)));
    if !has_refs {
        let literal = segments
            .into_iter()
            .map(|s| match s {
                Segment::Text(t) => t,
                Segment::Ref(_) => String::new(),
            })
            .collect::<String>();
        return Ok(PropertyValue::Literal(Value::String(literal)));
    }

    if segments.len() == 1
        && let Some(Segment::Ref(r)) = segments.first()
    {
        return Ok(PropertyValue::Ref(r.clone()));
    }

    Ok(PropertyValue::Template(segments))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn naming() -> NamingContext {
        NamingContext::new("elk", "prod")
    }

    fn outputs(r: &OutputRef) -> Option<Value> {
        match (r.resource.as_str(), r.output.as_str()) {
            ("network", "id") => Some(json!("vpc-123")),
            ("network", "private_subnet_ids") => Some(json!(["subnet-a", "subnet-b"])),
            ("network", "public_subnet_ids") => Some(json!(["subnet-c"])),
            ("group", "size") => Some(json!(3)),
            _ => None,
        }
    }

    #[test]
    fn test_plain_values_are_literals() {
        let v = PropertyValue::parse(&json!({"a": [1, 2], "b": "text"}), &naming()).unwrap();
        assert_eq!(v, PropertyValue::Literal(json!({"a": [1, 2], "b": "text"})));
    }

    #[test]
    fn test_naming_variables_are_substituted() {
        let v = PropertyValue::parse(&json!("${project}-${environment}-ng"), &naming()).unwrap();
        assert_eq!(v, PropertyValue::Literal(json!("elk-prod-ng")));
    }

    #[test]
    fn test_unknown_variable_is_rejected() {
        assert!(PropertyValue::parse(&json!("${region}"), &naming()).is_err());
        assert!(PropertyValue::parse(&json!("${network.id"), &naming()).is_err());
    }

    #[test]
    fn test_whole_string_reference_keeps_type() {
        let v = PropertyValue::parse(&json!("${network.private_subnet_ids}"), &naming()).unwrap();
        assert_eq!(
            v,
            PropertyValue::Ref(OutputRef::new("network", "private_subnet_ids"))
        );
        assert_eq!(v.resolve(&outputs).unwrap(), json!(["subnet-a", "subnet-b"]));
    }

    #[test]
    fn test_template_interpolates_scalars() {
        let v = PropertyValue::parse(&json!("${project}/${network.id}/${group.size}"), &naming())
            .unwrap();
        assert_eq!(v.references().len(), 2);
        assert_eq!(v.resolve(&outputs).unwrap(), json!("elk/vpc-123/3"));
    }

    #[test]
    fn test_concat_flattens_lists() {
        let v = PropertyValue::parse(
            &json!({"$concat": ["${network.private_subnet_ids}", "${network.public_subnet_ids}", ["extra"]]}),
            &naming(),
        )
        .unwrap();
        assert_eq!(
            v.resolve(&outputs).unwrap(),
            json!(["subnet-a", "subnet-b", "subnet-c", "extra"])
        );
    }

    #[test]
    fn test_concat_rejects_scalars() {
        let v = PropertyValue::parse(&json!({"$concat": ["${network.id}"]}), &naming()).unwrap();
        assert!(matches!(v.resolve(&outputs), Err(ResolveError::Invalid(_))));
    }

    #[test]
    fn test_missing_output_is_unknown() {
        let v = PropertyValue::parse(&json!({"role": "${role.arn}"}), &naming()).unwrap();
        assert_eq!(
            v.resolve(&outputs),
            Err(ResolveError::Unknown(OutputRef::new("role", "arn")))
        );
    }

    #[test]
    fn test_escaped_placeholder() {
        let v = PropertyValue::parse(&json!("$${literal}"), &naming()).unwrap();
        assert_eq!(v, PropertyValue::Literal(json!("${literal}")));
    }
}
