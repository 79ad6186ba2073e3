// Expression evaluation for `if:` conditions and `${{ }}` interpolation.
//
// The job engine consumes expressions through the `ExpressionEvaluator` trait.
// `ContextEvaluator` is the default implementation: a small recursive
// evaluator over a JSON context (github, env, matrix, steps, job, inputs,
// secrets) covering literals, property access, comparisons, logical
// operators, a handful of functions and the status functions.

use std::sync::Arc;

use anyhow::{bail, Result};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

/// Interpolates strings and evaluates conditions.
pub trait ExpressionEvaluator: Send + Sync {
    /// Replace every `${{ expr }}` segment with its value. A string without
    /// an expression is returned unchanged; an expression that fails to
    /// evaluate interpolates to the empty string.
    fn interpolate(&self, input: &str) -> String;

    /// Evaluate a condition. An empty condition means `success()`, and a
    /// condition without a status function is implicitly `success() && ...`.
    fn evaluate_bool(&self, expr: &str) -> Result<bool>;
}

/// Everything an evaluator can see.
#[derive(Debug, Clone, Default)]
pub struct ExpressionContext {
    /// Object keyed by context name (`github`, `env`, `steps`, ...).
    pub data: Value,
    /// Drives `cancelled()`.
    pub cancel: CancellationToken,
}

/// Builds evaluators for a snapshot of job state.
pub trait EvaluatorFactory: Send + Sync {
    fn create(&self, context: ExpressionContext) -> Arc<dyn ExpressionEvaluator>;
}

/// Produces `ContextEvaluator`s.
#[derive(Debug, Clone, Default)]
pub struct DefaultEvaluatorFactory;

impl EvaluatorFactory for DefaultEvaluatorFactory {
    fn create(&self, context: ExpressionContext) -> Arc<dyn ExpressionEvaluator> {
        Arc::new(ContextEvaluator::new(context))
    }
}

/// Evaluates expressions against a JSON context.
#[derive(Debug, Clone)]
pub struct ContextEvaluator {
    context: ExpressionContext,
}

impl ContextEvaluator {
    pub fn new(context: ExpressionContext) -> Self {
        Self { context }
    }

    /// Evaluate a bare expression (no `${{ }}`) to a value.
    pub fn evaluate(&self, expr: &str) -> Result<Value> {
        check_balanced(expr)?;
        self.eval(expr)
    }

    fn eval(&self, expr: &str) -> Result<Value> {
        let expr = strip_outer_parens(expr.trim());
        if expr.is_empty() {
            bail!("empty expression");
        }

        let parts = split_top_level(expr, "||");
        if parts.len() > 1 {
            for part in &parts {
                let value = self.eval(part)?;
                if is_truthy(&value) {
                    return Ok(value);
                }
            }
            return Ok(Value::Bool(false));
        }

        let parts = split_top_level(expr, "&&");
        if parts.len() > 1 {
            let mut last = Value::Null;
            for part in &parts {
                last = self.eval(part)?;
                if !is_truthy(&last) {
                    return Ok(last);
                }
            }
            return Ok(last);
        }

        for op in ["==", "!="] {
            let parts = split_top_level(expr, op);
            if parts.len() == 2 {
                let left = self.eval(parts[0])?;
                let right = self.eval(parts[1])?;
                let equal = loose_equals(&left, &right);
                return Ok(Value::Bool(if op == "==" { equal } else { !equal }));
            }
            if parts.len() > 2 {
                bail!("chained '{}' comparison in '{}'", op, expr);
            }
        }

        if let Some(inner) = expr.strip_prefix('!') {
            return Ok(Value::Bool(!is_truthy(&self.eval(inner)?)));
        }

        if let Some((name, args)) = parse_call(expr) {
            return self.call(&name, &args);
        }

        if let Some(literal) = parse_literal(expr)? {
            return Ok(literal);
        }

        self.lookup(expr)
    }

    fn call(&self, name: &str, args: &[&str]) -> Result<Value> {
        let arity = |n: usize| -> Result<()> {
            if args.len() != n {
                bail!("{}() expects {} argument(s), got {}", name, n, args.len());
            }
            Ok(())
        };

        match name.to_lowercase().as_str() {
            "success" => {
                arity(0)?;
                Ok(Value::Bool(
                    !self.context.cancel.is_cancelled() && self.job_status() != "failure",
                ))
            }
            "failure" => {
                arity(0)?;
                Ok(Value::Bool(self.job_status() == "failure"))
            }
            "always" => {
                arity(0)?;
                Ok(Value::Bool(true))
            }
            "cancelled" => {
                arity(0)?;
                Ok(Value::Bool(self.context.cancel.is_cancelled()))
            }
            "contains" => {
                arity(2)?;
                let haystack = self.eval(args[0])?;
                let needle = self.eval(args[1])?;
                let found = match haystack {
                    Value::Array(items) => items.iter().any(|i| loose_equals(i, &needle)),
                    other => to_display(&other)
                        .to_lowercase()
                        .contains(&to_display(&needle).to_lowercase()),
                };
                Ok(Value::Bool(found))
            }
            "startswith" => {
                arity(2)?;
                let s = to_display(&self.eval(args[0])?).to_lowercase();
                let prefix = to_display(&self.eval(args[1])?).to_lowercase();
                Ok(Value::Bool(s.starts_with(&prefix)))
            }
            "endswith" => {
                arity(2)?;
                let s = to_display(&self.eval(args[0])?).to_lowercase();
                let suffix = to_display(&self.eval(args[1])?).to_lowercase();
                Ok(Value::Bool(s.ends_with(&suffix)))
            }
            "format" => {
                if args.is_empty() {
                    bail!("format() expects at least 1 argument");
                }
                let mut out = to_display(&self.eval(args[0])?);
                for (i, arg) in args[1..].iter().enumerate() {
                    let value = to_display(&self.eval(arg)?);
                    out = out.replace(&format!("{{{i}}}"), &value);
                }
                Ok(Value::String(out))
            }
            "join" => {
                if args.is_empty() || args.len() > 2 {
                    bail!("join() expects 1 or 2 arguments");
                }
                let separator = match args.get(1) {
                    Some(arg) => to_display(&self.eval(arg)?),
                    None => ",".to_string(),
                };
                let joined = match self.eval(args[0])? {
                    Value::Array(items) => items
                        .iter()
                        .map(to_display)
                        .collect::<Vec<_>>()
                        .join(&separator),
                    other => to_display(&other),
                };
                Ok(Value::String(joined))
            }
            "tojson" => {
                arity(1)?;
                Ok(Value::String(serde_json::to_string_pretty(
                    &self.eval(args[0])?,
                )?))
            }
            "fromjson" => {
                arity(1)?;
                let raw = to_display(&self.eval(args[0])?);
                Ok(serde_json::from_str(&raw)?)
            }
            _ => bail!("unknown function '{}'", name),
        }
    }

    fn job_status(&self) -> String {
        self.context
            .data
            .get("job")
            .and_then(|j| j.get("status"))
            .and_then(Value::as_str)
            .unwrap_or("success")
            .to_string()
    }

    /// Resolve `a.b['c'].d`. A missing key or a type mismatch yields null.
    fn lookup(&self, path: &str) -> Result<Value> {
        let segments = parse_path(path)?;
        let mut current = &self.context.data;
        for segment in &segments {
            let next = match (current, segment) {
                (Value::Object(map), PathSegment::Key(key)) => map.get(key).or_else(|| {
                    map.iter()
                        .find(|(k, _)| k.eq_ignore_ascii_case(key))
                        .map(|(_, v)| v)
                }),
                (Value::Array(items), PathSegment::Index(i)) => items.get(*i),
                _ => None,
            };
            match next {
                Some(value) => current = value,
                None => return Ok(Value::Null),
            }
        }
        Ok(current.clone())
    }
}

impl ExpressionEvaluator for ContextEvaluator {
    fn interpolate(&self, input: &str) -> String {
        if !input.contains("${{") || !input.contains("}}") {
            return input.to_string();
        }

        let mut out = String::new();
        let mut rest = input;
        while let Some(start) = rest.find("${{") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 3..];
            let Some(end) = find_expression_end(after) else {
                tracing::error!("Unable to interpolate expression '{}': unterminated", input);
                return String::new();
            };
            match self.evaluate(&after[..end]) {
                Ok(value) => out.push_str(&to_display(&value)),
                Err(e) => {
                    tracing::error!("Unable to interpolate expression '{}': {:#}", input, e);
                    return String::new();
                }
            }
            rest = &after[end + 2..];
        }
        out.push_str(rest);
        out
    }

    fn evaluate_bool(&self, expr: &str) -> Result<bool> {
        let mut trimmed = expr.trim();
        if let Some(inner) = trimmed
            .strip_prefix("${{")
            .and_then(|s| s.strip_suffix("}}"))
        {
            trimmed = inner.trim();
        }
        if trimmed.contains("${{") {
            bail!("nested expression in '{}'", expr);
        }
        if trimmed.is_empty() {
            return Ok(is_truthy(&self.evaluate("success()")?));
        }

        let value = self.evaluate(trimmed)?;
        if !contains_status_function(trimmed) {
            return Ok(is_truthy(&self.evaluate("success()")?) && is_truthy(&value));
        }
        Ok(is_truthy(&value))
    }
}

/// Whether a condition references a status function.
fn contains_status_function(expr: &str) -> bool {
    let lower = expr.to_lowercase();
    ["success(", "failure(", "always(", "cancelled("]
        .iter()
        .any(|f| lower.contains(f))
}

/// Truthiness of a value in workflow expressions.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0 && !f.is_nan()).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// String form used for interpolation.
pub fn to_display(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => serde_json::to_string_pretty(other).unwrap_or_default(),
    }
}

/// Equality with number coercion and case-insensitive strings.
fn loose_equals(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Null, Value::Null) => true,
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        (Value::Bool(a), Value::Bool(b)) => a == b,
        (Value::String(a), Value::String(b)) => a.eq_ignore_ascii_case(b),
        (Value::Number(n), Value::String(s)) | (Value::String(s), Value::Number(n)) => {
            s.trim().parse::<f64>().ok() == n.as_f64()
        }
        (Value::Array(_), _) | (Value::Object(_), _) => false,
        (a, b) => to_display(a).eq_ignore_ascii_case(&to_display(b)),
    }
}

/// Parse `'string'` (with `''` escapes), numbers, `true`, `false`, `null`.
fn parse_literal(expr: &str) -> Result<Option<Value>> {
    if let Some(body) = expr.strip_prefix('\'') {
        let Some(body) = body.strip_suffix('\'') else {
            bail!("unterminated string in '{}'", expr);
        };
        return Ok(Some(Value::String(body.replace("''", "'"))));
    }
    match expr {
        "true" => return Ok(Some(Value::Bool(true))),
        "false" => return Ok(Some(Value::Bool(false))),
        "null" => return Ok(Some(Value::Null)),
        _ => {}
    }
    let first = expr.chars().next().unwrap_or(' ');
    if first.is_ascii_digit() || first == '-' || first == '.' {
        if let Ok(n) = expr.parse::<i64>() {
            return Ok(Some(Value::from(n)));
        }
        if let Ok(f) = expr.parse::<f64>() {
            return Ok(Some(Value::from(f)));
        }
    }
    Ok(None)
}

#[derive(Debug, PartialEq)]
enum PathSegment {
    Key(String),
    Index(usize),
}

fn parse_path(path: &str) -> Result<Vec<PathSegment>> {
    let mut segments = Vec::new();
    let mut chars = path.chars().peekable();
    let mut current = String::new();

    while let Some(c) = chars.next() {
        match c {
            '.' => {
                if !current.is_empty() {
                    segments.push(PathSegment::Key(std::mem::take(&mut current)));
                }
            }
            '[' => {
                if !current.is_empty() {
                    segments.push(PathSegment::Key(std::mem::take(&mut current)));
                }
                let mut inner = String::new();
                let mut closed = false;
                for c in chars.by_ref() {
                    if c == ']' {
                        closed = true;
                        break;
                    }
                    inner.push(c);
                }
                if !closed {
                    bail!("unterminated '[' in '{}'", path);
                }
                let inner = inner.trim();
                if let Some(key) = inner.strip_prefix('\'').and_then(|s| s.strip_suffix('\'')) {
                    segments.push(PathSegment::Key(key.to_string()));
                } else if let Ok(i) = inner.parse::<usize>() {
                    segments.push(PathSegment::Index(i));
                } else {
                    bail!("invalid index '{}' in '{}'", inner, path);
                }
            }
            c if c.is_alphanumeric() || c == '_' || c == '-' => current.push(c),
            c => bail!("unexpected '{}' in '{}'", c, path),
        }
    }
    if !current.is_empty() {
        segments.push(PathSegment::Key(current));
    }
    if segments.is_empty() {
        bail!("empty property path");
    }
    Ok(segments)
}

/// `name(arg, ...)` when the closing parenthesis is the final character.
fn parse_call(expr: &str) -> Option<(String, Vec<&str>)> {
    let open = expr.find('(')?;
    let name = &expr[..open];
    if name.is_empty() || !name.chars().all(|c| c.is_alphanumeric() || c == '_') {
        return None;
    }
    let body = expr[open + 1..].strip_suffix(')')?;
    if matching_close(&expr[open..]) != Some(expr.len() - open - 1) {
        return None;
    }
    let args = if body.trim().is_empty() {
        Vec::new()
    } else {
        split_top_level(body, ",")
    };
    Some((name.to_string(), args))
}

/// Split on `op` outside quotes and parentheses.
fn split_top_level<'a>(expr: &'a str, op: &str) -> Vec<&'a str> {
    let bytes = expr.as_bytes();
    let op_bytes = op.as_bytes();
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut in_string = false;
    let mut start = 0;
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i];
        if in_string {
            if c == b'\'' {
                in_string = false;
            }
        } else if c == b'\'' {
            in_string = true;
        } else if c == b'(' || c == b'[' {
            depth += 1;
        } else if c == b')' || c == b']' {
            depth -= 1;
        } else if depth == 0 && bytes[i..].starts_with(op_bytes) {
            parts.push(expr[start..i].trim());
            i += op_bytes.len();
            start = i;
            continue;
        }
        i += 1;
    }
    parts.push(expr[start..].trim());
    parts
}

/// Index of the parenthesis closing the one at position 0.
fn matching_close(expr: &str) -> Option<usize> {
    let mut depth = 0i32;
    let mut in_string = false;
    for (i, c) in expr.char_indices() {
        match c {
            '\'' => in_string = !in_string,
            '(' if !in_string => depth += 1,
            ')' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

fn strip_outer_parens(mut expr: &str) -> &str {
    while expr.starts_with('(') && matching_close(expr) == Some(expr.len() - 1) {
        expr = expr[1..expr.len() - 1].trim();
    }
    expr
}

/// Position of the `}}` closing an expression, skipping quoted text.
fn find_expression_end(s: &str) -> Option<usize> {
    let mut in_string = false;
    let bytes = s.as_bytes();
    for i in 0..bytes.len() {
        match bytes[i] {
            b'\'' => in_string = !in_string,
            b'}' if !in_string && bytes.get(i + 1) == Some(&b'}') => return Some(i),
            _ => {}
        }
    }
    None
}

fn check_balanced(expr: &str) -> Result<()> {
    let mut depth = 0i32;
    let mut in_string = false;
    for c in expr.chars() {
        match c {
            '\'' => in_string = !in_string,
            '(' if !in_string => depth += 1,
            ')' if !in_string => {
                depth -= 1;
                if depth < 0 {
                    bail!("unbalanced ')' in '{}'", expr);
                }
            }
            _ => {}
        }
    }
    if in_string {
        bail!("unterminated string in '{}'", expr);
    }
    if depth != 0 {
        bail!("unbalanced '(' in '{}'", expr);
    }
    Ok(())
}
