//! Template renderer for configuration substitution.
//!
//! Supports the `{{ .Field }}` reference grammar plus conditional
//! blocks (`{{ if .Flag }} … {{ else }} … {{ end }}`) over a
//! [`serde_json::Value`] context built from the serialized
//! configuration struct. Rendering is a pure function and fails on
//! any missing field or malformed action.

use serde_json::Value;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RenderError {
    #[error("unclosed {{{{ action at byte {0}")]
    UnclosedAction(usize),

    #[error("unexpected {{{{ {0} }}}}")]
    UnexpectedAction(String),

    #[error("missing {{{{ end }}}}")]
    MissingEnd,

    #[error("malformed expression {0:?}, expected a .Field reference")]
    BadExpression(String),

    #[error("unknown field .{0}")]
    UnknownField(String),

    #[error("configuration is not renderable: {0}")]
    Context(String),
}

/// Render `text` against `ctx`, substituting every `{{ .Field }}`
/// reference and evaluating conditional blocks.
pub fn render(text: &str, ctx: &Value) -> Result<String, RenderError> {
    let tokens = tokenize(text)?;
    let mut pos = 0;
    let nodes = parse_nodes(&tokens, &mut pos, false)?;
    let mut out = String::with_capacity(text.len());
    eval(&nodes, ctx, &mut out)?;
    Ok(out)
}

/// True if `text` contains any template action at all. Callers use
/// this to skip rendering for plain names.
pub fn is_template(text: &str) -> bool {
    text.contains("{{")
}

#[derive(Debug)]
enum Token {
    Literal(String),
    Action(String),
}

#[derive(Debug)]
enum Node {
    Literal(String),
    Field(Vec<String>),
    If {
        cond: Vec<String>,
        then: Vec<Node>,
        otherwise: Vec<Node>,
    },
}

fn tokenize(text: &str) -> Result<Vec<Token>, RenderError> {
    let mut tokens = Vec::new();
    let mut rest = text;
    let mut offset = 0;
    while let Some(start) = rest.find("{{") {
        if start > 0 {
            tokens.push(Token::Literal(rest[..start].to_string()));
        }
        let body = &rest[start + 2..];
        let end = body
            .find("}}")
            .ok_or(RenderError::UnclosedAction(offset + start))?;
        tokens.push(Token::Action(body[..end].trim().to_string()));
        offset += start + 2 + end + 2;
        rest = &body[end + 2..];
    }
    if !rest.is_empty() {
        tokens.push(Token::Literal(rest.to_string()));
    }
    Ok(tokens)
}

fn parse_nodes(
    tokens: &[Token],
    pos: &mut usize,
    nested: bool,
) -> Result<Vec<Node>, RenderError> {
    let mut nodes = Vec::new();
    while *pos < tokens.len() {
        match &tokens[*pos] {
            Token::Literal(text) => {
                nodes.push(Node::Literal(text.clone()));
                *pos += 1;
            }
            Token::Action(action) => {
                if action == "end" || action == "else" {
                    if nested {
                        return Ok(nodes);
                    }
                    return Err(RenderError::UnexpectedAction(action.clone()));
                }
                if let Some(cond) = action.strip_prefix("if ") {
                    *pos += 1;
                    let cond = parse_path(cond)?;
                    let then = parse_nodes(tokens, pos, true)?;
                    let otherwise = match tokens.get(*pos) {
                        Some(Token::Action(a)) if a == "else" => {
                            *pos += 1;
                            parse_nodes(tokens, pos, true)?
                        }
                        _ => Vec::new(),
                    };
                    match tokens.get(*pos) {
                        Some(Token::Action(a)) if a == "end" => *pos += 1,
                        _ => return Err(RenderError::MissingEnd),
                    }
                    nodes.push(Node::If {
                        cond,
                        then,
                        otherwise,
                    });
                } else {
                    nodes.push(Node::Field(parse_path(action)?));
                    *pos += 1;
                }
            }
        }
    }
    if nested {
        return Err(RenderError::MissingEnd);
    }
    Ok(nodes)
}

fn parse_path(expr: &str) -> Result<Vec<String>, RenderError> {
    let expr = expr.trim();
    let rest = expr
        .strip_prefix('.')
        .ok_or_else(|| RenderError::BadExpression(expr.to_string()))?;
    if rest.is_empty() {
        return Err(RenderError::BadExpression(expr.to_string()));
    }
    let path: Vec<String> = rest.split('.').map(str::to_string).collect();
    if path.iter().any(|s| s.is_empty() || s.contains(char::is_whitespace)) {
        return Err(RenderError::BadExpression(expr.to_string()));
    }
    Ok(path)
}

fn eval(nodes: &[Node], ctx: &Value, out: &mut String) -> Result<(), RenderError> {
    for node in nodes {
        match node {
            Node::Literal(text) => out.push_str(text),
            Node::Field(path) => out.push_str(&stringify(lookup(ctx, path)?)),
            Node::If {
                cond,
                then,
                otherwise,
            } => {
                if truthy(lookup(ctx, cond)?) {
                    eval(then, ctx, out)?;
                } else {
                    eval(otherwise, ctx, out)?;
                }
            }
        }
    }
    Ok(())
}

fn lookup<'a>(ctx: &'a Value, path: &[String]) -> Result<&'a Value, RenderError> {
    let mut current = ctx;
    for segment in path {
        current = current
            .get(segment)
            .ok_or_else(|| RenderError::UnknownField(path.join(".")))?;
    }
    Ok(current)
}

fn stringify(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}
