//! Declarative validation of configuration structs.
//!
//! A configuration type describes its fields through [`FieldSpec`]
//! descriptors: the field name, an annotation tag, and a mutable
//! binding to the value itself. The validator parses each tag,
//! writes `default=` values through into fields still holding their
//! zero value, and enforces the remaining constraints. It runs once
//! per package per provisioning run, before any remote action.
//!
//! Supported annotations per field kind:
//!
//! | kind    | tags                                      |
//! |---------|-------------------------------------------|
//! | bool    | `default`                                 |
//! | integer | `default`, `min`, `max`                   |
//! | string  | `required`, `default`, `min`, `max`, `size` |

use regex::Regex;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("field {field}: unknown tag {key:?}")]
    UnknownTag { field: String, key: String },

    #[error("field {field}: malformed annotation {tag:?}")]
    TagSyntax { field: String, tag: String },

    #[error("field {field}: type does not support tag {key:?}")]
    TypeDoesNotSupportTag { field: String, key: String },

    #[error("field {field} is required")]
    RequiredFieldMissing { field: String },

    #[error("field {field}: value {value} below minimum {min}")]
    ValueBelowMin { field: String, value: i64, min: i64 },

    #[error("field {field}: value {value} above maximum {max}")]
    ValueAboveMax { field: String, value: i64, max: i64 },

    #[error("field {field}: length {len} does not match size {size}")]
    WrongSize { field: String, len: usize, size: usize },

    /// Raised by a command's post-render sanity check.
    #[error("{0}")]
    Command(String),
}

/// Mutable binding to one annotated configuration field.
pub enum FieldValue<'a> {
    Bool(&'a mut bool),
    Int(&'a mut i64),
    String(&'a mut String),
}

/// One field descriptor: name, annotation tag, value binding.
pub struct FieldSpec<'a> {
    pub name: &'static str,
    pub tag: &'static str,
    pub value: FieldValue<'a>,
}

impl<'a> FieldSpec<'a> {
    pub fn new(name: &'static str, tag: &'static str, value: FieldValue<'a>) -> Self {
        Self { name, tag, value }
    }
}

/// Validate a set of field descriptors, applying defaults in place.
pub fn validate_fields(fields: Vec<FieldSpec<'_>>) -> Result<(), ValidationError> {
    for field in fields {
        validate_field(field)?;
    }
    Ok(())
}

fn validate_field(field: FieldSpec<'_>) -> Result<(), ValidationError> {
    let tags = parse_tag(field.name, field.tag)?;
    for (key, _) in &tags {
        if !matches!(key.as_str(), "required" | "default" | "min" | "max" | "size") {
            return Err(ValidationError::UnknownTag {
                field: field.name.to_string(),
                key: key.clone(),
            });
        }
        let supported = match field.value {
            FieldValue::Bool(_) => matches!(key.as_str(), "default"),
            FieldValue::Int(_) => matches!(key.as_str(), "default" | "min" | "max"),
            FieldValue::String(_) => true,
        };
        if !supported {
            return Err(ValidationError::TypeDoesNotSupportTag {
                field: field.name.to_string(),
                key: key.clone(),
            });
        }
    }

    let name = field.name;
    match field.value {
        FieldValue::Bool(value) => {
            if let Some(default) = tag_value(&tags, "default") {
                let default = parse_literal::<bool>(name, field.tag, default)?;
                if !*value {
                    *value = default;
                }
            }
        }
        FieldValue::Int(value) => {
            if let Some(default) = tag_value(&tags, "default") {
                let default = parse_literal::<i64>(name, field.tag, default)?;
                if *value == 0 {
                    *value = default;
                }
            }
            if let Some(min) = tag_value(&tags, "min") {
                let min = parse_literal::<i64>(name, field.tag, min)?;
                if *value < min {
                    return Err(ValidationError::ValueBelowMin {
                        field: name.to_string(),
                        value: *value,
                        min,
                    });
                }
            }
            if let Some(max) = tag_value(&tags, "max") {
                let max = parse_literal::<i64>(name, field.tag, max)?;
                if *value > max {
                    return Err(ValidationError::ValueAboveMax {
                        field: name.to_string(),
                        value: *value,
                        max,
                    });
                }
            }
        }
        FieldValue::String(value) => {
            if let Some(default) = tag_value(&tags, "default") {
                if value.is_empty() {
                    *value = default.to_string();
                }
            }
            if let Some(required) = tag_value(&tags, "required") {
                let required = parse_literal::<bool>(name, field.tag, required)?;
                if required && value.is_empty() {
                    return Err(ValidationError::RequiredFieldMissing {
                        field: name.to_string(),
                    });
                }
            }
            let len = value.chars().count();
            if let Some(min) = tag_value(&tags, "min") {
                let min = parse_literal::<i64>(name, field.tag, min)?;
                if (len as i64) < min {
                    return Err(ValidationError::ValueBelowMin {
                        field: name.to_string(),
                        value: len as i64,
                        min,
                    });
                }
            }
            if let Some(max) = tag_value(&tags, "max") {
                let max = parse_literal::<i64>(name, field.tag, max)?;
                if (len as i64) > max {
                    return Err(ValidationError::ValueAboveMax {
                        field: name.to_string(),
                        value: len as i64,
                        max,
                    });
                }
            }
            if let Some(size) = tag_value(&tags, "size") {
                let size = parse_literal::<usize>(name, field.tag, size)?;
                if len != size {
                    return Err(ValidationError::WrongSize {
                        field: name.to_string(),
                        len,
                        size,
                    });
                }
            }
        }
    }
    Ok(())
}

/// Parse an annotation tag into ordered `key=value` pairs. Values may
/// be single-quoted to contain spaces: `default='with spaces'`.
fn parse_tag(field: &str, tag: &str) -> Result<Vec<(String, String)>, ValidationError> {
    let pattern = Regex::new(r"^([A-Za-z_]+)=(?:'([^']*)'|(\S+))\s*").expect("tag pattern");
    let mut pairs = Vec::new();
    let mut rest = tag.trim_start();
    while !rest.is_empty() {
        let captures = pattern.captures(rest).ok_or_else(|| ValidationError::TagSyntax {
            field: field.to_string(),
            tag: tag.to_string(),
        })?;
        let key = captures[1].to_string();
        let value = captures
            .get(2)
            .or_else(|| captures.get(3))
            .map(|m| m.as_str().to_string())
            .unwrap_or_default();
        pairs.push((key, value));
        rest = &rest[captures[0].len()..];
    }
    Ok(pairs)
}

fn tag_value<'a>(tags: &'a [(String, String)], key: &str) -> Option<&'a str> {
    tags.iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.as_str())
}

fn parse_literal<T: std::str::FromStr>(
    field: &str,
    tag: &str,
    value: &str,
) -> Result<T, ValidationError> {
    value.parse().map_err(|_| ValidationError::TagSyntax {
        field: field.to_string(),
        tag: tag.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_tag_is_valid() {
        let mut s = String::new();
        let fields = vec![FieldSpec::new("Name", "", FieldValue::String(&mut s))];
        assert!(validate_fields(fields).is_ok());
    }

    #[test]
    fn default_writes_through_into_zero_values() {
        let mut version = String::new();
        let mut jobs = 0i64;
        let mut verbose = false;
        let fields = vec![
            FieldSpec::new("Version", "default=1.4.2", FieldValue::String(&mut version)),
            FieldSpec::new("Jobs", "default=4", FieldValue::Int(&mut jobs)),
            FieldSpec::new("Verbose", "default=true", FieldValue::Bool(&mut verbose)),
        ];
        validate_fields(fields).unwrap();
        assert_eq!(version, "1.4.2");
        assert_eq!(jobs, 4);
        assert!(verbose);
    }

    #[test]
    fn default_does_not_override_set_values() {
        let mut version = "2.0.0".to_string();
        let fields = vec![FieldSpec::new(
            "Version",
            "default=1.4.2",
            FieldValue::String(&mut version),
        )];
        validate_fields(fields).unwrap();
        assert_eq!(version, "2.0.0");
    }

    #[test]
    fn quoted_default_may_contain_spaces() {
        let mut motd = String::new();
        let fields = vec![FieldSpec::new(
            "Motd",
            "default='hello there'",
            FieldValue::String(&mut motd),
        )];
        validate_fields(fields).unwrap();
        assert_eq!(motd, "hello there");
    }

    #[test]
    fn required_rejects_empty_string() {
        let mut version = String::new();
        let fields = vec![FieldSpec::new(
            "Version",
            "required=true",
            FieldValue::String(&mut version),
        )];
        assert_eq!(
            validate_fields(fields).unwrap_err(),
            ValidationError::RequiredFieldMissing {
                field: "Version".to_string()
            }
        );
    }

    #[test]
    fn required_with_default_is_satisfied() {
        let mut version = String::new();
        let fields = vec![FieldSpec::new(
            "Version",
            "required=true default=1.0",
            FieldValue::String(&mut version),
        )];
        validate_fields(fields).unwrap();
        assert_eq!(version, "1.0");
    }

    #[test]
    fn int_bounds_are_enforced() {
        let mut port = 80i64;
        let fields = vec![FieldSpec::new(
            "Port",
            "min=1024 max=65535",
            FieldValue::Int(&mut port),
        )];
        assert_eq!(
            validate_fields(fields).unwrap_err(),
            ValidationError::ValueBelowMin {
                field: "Port".to_string(),
                value: 80,
                min: 1024
            }
        );

        let mut port = 70000i64;
        let fields = vec![FieldSpec::new(
            "Port",
            "min=1024 max=65535",
            FieldValue::Int(&mut port),
        )];
        assert_eq!(
            validate_fields(fields).unwrap_err(),
            ValidationError::ValueAboveMax {
                field: "Port".to_string(),
                value: 70000,
                max: 65535
            }
        );
    }

    #[test]
    fn string_size_is_exact() {
        let mut code = "abcd".to_string();
        let fields = vec![FieldSpec::new("Code", "size=3", FieldValue::String(&mut code))];
        assert_eq!(
            validate_fields(fields).unwrap_err(),
            ValidationError::WrongSize {
                field: "Code".to_string(),
                len: 4,
                size: 3
            }
        );
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let mut s = String::new();
        let fields = vec![FieldSpec::new("X", "reqired=true", FieldValue::String(&mut s))];
        assert_eq!(
            validate_fields(fields).unwrap_err(),
            ValidationError::UnknownTag {
                field: "X".to_string(),
                key: "reqired".to_string()
            }
        );
    }

    #[test]
    fn size_on_integer_is_unsupported() {
        let mut n = 0i64;
        let fields = vec![FieldSpec::new("N", "size=3", FieldValue::Int(&mut n))];
        assert_eq!(
            validate_fields(fields).unwrap_err(),
            ValidationError::TypeDoesNotSupportTag {
                field: "N".to_string(),
                key: "size".to_string()
            }
        );
    }

    #[test]
    fn required_on_bool_is_unsupported() {
        let mut b = false;
        let fields = vec![FieldSpec::new("B", "required=true", FieldValue::Bool(&mut b))];
        assert_eq!(
            validate_fields(fields).unwrap_err(),
            ValidationError::TypeDoesNotSupportTag {
                field: "B".to_string(),
                key: "required".to_string()
            }
        );
    }

    #[test]
    fn malformed_tag_is_a_syntax_error() {
        let mut s = String::new();
        let fields = vec![FieldSpec::new("X", "required", FieldValue::String(&mut s))];
        assert!(matches!(
            validate_fields(fields).unwrap_err(),
            ValidationError::TagSyntax { .. }
        ));
    }

    #[test]
    fn unparsable_default_is_a_syntax_error() {
        let mut n = 0i64;
        let fields = vec![FieldSpec::new("N", "default=abc", FieldValue::Int(&mut n))];
        assert!(matches!(
            validate_fields(fields).unwrap_err(),
            ValidationError::TagSyntax { .. }
        ));
    }
}
