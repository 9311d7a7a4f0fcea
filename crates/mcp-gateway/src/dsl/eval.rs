//! Pure evaluator for template expressions.
//!
//! Evaluation is side-effect free: the same `{args, config, request}`
//! context always yields the same value for an expression that does not
//! reference `response.*`. Higher-order built-ins (`map`, `filter`, `find`,
//! `sort`) take an expression as their second argument and evaluate it once
//! per element with `item` (the element) and `index` bound.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use crate::dsl::parser::{BinaryOp, Expr, UnaryOp};
use crate::dsl::value::Value;
use crate::error::{DslError, DslResult};

/// Evaluate a parsed expression against a root context value.
///
/// # Errors
///
/// Any type mismatch, unknown root identifier, unknown function, arity
/// mismatch, or division by zero is returned as a [`DslError`].
pub fn eval(expr: &Expr, root: &Value) -> DslResult<Value> {
    let mut ev = Evaluator { root, scopes: Vec::new() };
    ev.eval(expr)
}

struct Evaluator<'a> {
    root: &'a Value,
    /// Innermost bindings last; consulted before the root context.
    scopes: Vec<(String, Value)>,
}

impl Evaluator<'_> {
    fn eval(&mut self, expr: &Expr) -> DslResult<Value> {
        match expr {
            Expr::Null => Ok(Value::Null),
            Expr::Bool(b) => Ok(Value::Bool(*b)),
            Expr::Number(n) => Ok(Value::Number(*n)),
            Expr::Str(s) => Ok(Value::String(s.clone())),
            Expr::Ident(name) => self.lookup(name),
            Expr::Member(base, name) => Ok(self.eval(base)?.member(name)),
            Expr::Index(base, index) => {
                let base = self.eval(base)?;
                let index = self.eval(index)?;
                Ok(base.index(&index))
            }
            Expr::Unary(op, operand) => self.eval_unary(*op, operand),
            Expr::Binary(op, left, right) => self.eval_binary(*op, left, right),
            Expr::Ternary(cond, then_branch, else_branch) => {
                if self.eval(cond)?.truthy() {
                    self.eval(then_branch)
                } else {
                    self.eval(else_branch)
                }
            }
            Expr::Call(name, call_args) => self.eval_call(name, call_args),
            Expr::Array(items) => {
                let values = items.iter().map(|e| self.eval(e)).collect::<DslResult<Vec<_>>>()?;
                Ok(Value::Seq(values))
            }
            Expr::Object(entries) => {
                let mut map = BTreeMap::new();
                for (key, value_expr) in entries {
                    map.insert(key.clone(), self.eval(value_expr)?);
                }
                Ok(Value::Map(map))
            }
        }
    }

    fn lookup(&self, name: &str) -> DslResult<Value> {
        for (bound, value) in self.scopes.iter().rev() {
            if bound == name {
                return Ok(value.clone());
            }
        }
        match self.root {
            Value::Map(entries) => entries
                .get(name)
                .cloned()
                .ok_or_else(|| DslError::UnknownIdentifier { name: name.to_string() }),
            _ => Err(DslError::UnknownIdentifier { name: name.to_string() }),
        }
    }

    fn eval_unary(&mut self, op: UnaryOp, operand: &Expr) -> DslResult<Value> {
        let value = self.eval(operand)?;
        match op {
            UnaryOp::Not => Ok(Value::Bool(!value.truthy())),
            UnaryOp::Neg => Ok(Value::Number(-value.as_number()?)),
        }
    }

    fn eval_binary(&mut self, op: BinaryOp, left: &Expr, right: &Expr) -> DslResult<Value> {
        // Logical operators short-circuit; everything else is strict.
        match op {
            BinaryOp::And => {
                if !self.eval(left)?.truthy() {
                    return Ok(Value::Bool(false));
                }
                return Ok(Value::Bool(self.eval(right)?.truthy()));
            }
            BinaryOp::Or => {
                if self.eval(left)?.truthy() {
                    return Ok(Value::Bool(true));
                }
                return Ok(Value::Bool(self.eval(right)?.truthy()));
            }
            _ => {}
        }

        let lhs = self.eval(left)?;
        let rhs = self.eval(right)?;

        match op {
            BinaryOp::Add => match (&lhs, &rhs) {
                (Value::Number(a), Value::Number(b)) => Ok(Value::Number(a + b)),
                (Value::String(a), Value::String(b)) => Ok(Value::String(format!("{a}{b}"))),
                (Value::String(_), other) | (other, Value::String(_)) => {
                    Err(DslError::type_error("string", other.type_name()))
                }
                (other, _) => Err(DslError::type_error("number or string", other.type_name())),
            },
            BinaryOp::Sub => Ok(Value::Number(lhs.as_number()? - rhs.as_number()?)),
            BinaryOp::Mul => Ok(Value::Number(lhs.as_number()? * rhs.as_number()?)),
            BinaryOp::Div => {
                let numerator = lhs.as_number()?;
                let divisor = rhs.as_number()?;
                if divisor == 0.0 {
                    return Err(DslError::DivisionByZero);
                }
                Ok(Value::Number(numerator / divisor))
            }
            BinaryOp::Eq => Ok(Value::Bool(lhs == rhs)),
            BinaryOp::NotEq => Ok(Value::Bool(lhs != rhs)),
            BinaryOp::Lt => Ok(Value::Bool(compare(&lhs, &rhs)? == Ordering::Less)),
            BinaryOp::LtEq => Ok(Value::Bool(compare(&lhs, &rhs)? != Ordering::Greater)),
            BinaryOp::Gt => Ok(Value::Bool(compare(&lhs, &rhs)? == Ordering::Greater)),
            BinaryOp::GtEq => Ok(Value::Bool(compare(&lhs, &rhs)? != Ordering::Less)),
            BinaryOp::And | BinaryOp::Or => unreachable!("handled above"),
        }
    }

    fn eval_call(&mut self, name: &str, call_args: &[Expr]) -> DslResult<Value> {
        // Higher-order built-ins receive their second argument unevaluated.
        match name {
            "map" => return self.eval_map(call_args),
            "filter" => return self.eval_filter(call_args),
            "find" => return self.eval_find(call_args),
            "sort" => return self.eval_sort(call_args),
            _ => {}
        }

        let values = call_args.iter().map(|e| self.eval(e)).collect::<DslResult<Vec<_>>>()?;
        apply_builtin(name, &values)
    }

    fn with_item<T>(
        &mut self,
        item: Value,
        index: usize,
        f: impl FnOnce(&mut Self) -> DslResult<T>,
    ) -> DslResult<T> {
        #[allow(clippy::cast_precision_loss)]
        self.scopes.push(("index".to_string(), Value::Number(index as f64)));
        self.scopes.push(("item".to_string(), item));
        let result = f(self);
        self.scopes.pop();
        self.scopes.pop();
        result
    }

    fn eval_map(&mut self, call_args: &[Expr]) -> DslResult<Value> {
        let [seq_expr, body] = two_args("map", call_args)?;
        let items = self.eval(seq_expr)?;
        let items = items.as_seq()?;
        let mut out = Vec::with_capacity(items.len());
        for (i, item) in items.iter().enumerate() {
            out.push(self.with_item(item.clone(), i, |ev| ev.eval(body))?);
        }
        Ok(Value::Seq(out))
    }

    fn eval_filter(&mut self, call_args: &[Expr]) -> DslResult<Value> {
        let [seq_expr, body] = two_args("filter", call_args)?;
        let items = self.eval(seq_expr)?;
        let items = items.as_seq()?;
        let mut out = Vec::new();
        for (i, item) in items.iter().enumerate() {
            if self.with_item(item.clone(), i, |ev| ev.eval(body))?.truthy() {
                out.push(item.clone());
            }
        }
        Ok(Value::Seq(out))
    }

    fn eval_find(&mut self, call_args: &[Expr]) -> DslResult<Value> {
        let [seq_expr, body] = two_args("find", call_args)?;
        let items = self.eval(seq_expr)?;
        let items = items.as_seq()?;
        for (i, item) in items.iter().enumerate() {
            if self.with_item(item.clone(), i, |ev| ev.eval(body))?.truthy() {
                return Ok(item.clone());
            }
        }
        Ok(Value::Null)
    }

    fn eval_sort(&mut self, call_args: &[Expr]) -> DslResult<Value> {
        if call_args.is_empty() || call_args.len() > 2 {
            return Err(DslError::Arity {
                name: "sort",
                expected: "1..2",
                found: call_args.len(),
            });
        }
        let items = self.eval(&call_args[0])?;
        let items = items.as_seq()?.to_vec();

        let mut keyed = Vec::with_capacity(items.len());
        for (i, item) in items.into_iter().enumerate() {
            let key = match call_args.get(1) {
                Some(body) => self.with_item(item.clone(), i, |ev| ev.eval(body))?,
                None => item.clone(),
            };
            keyed.push((key, item));
        }

        // Validate comparability up front so sort_by can stay total.
        for window in keyed.windows(2) {
            compare(&window[0].0, &window[1].0)?;
        }
        keyed.sort_by(|a, b| compare(&a.0, &b.0).unwrap_or(Ordering::Equal));

        Ok(Value::Seq(keyed.into_iter().map(|(_, item)| item).collect()))
    }
}

fn two_args<'e>(name: &'static str, call_args: &'e [Expr]) -> DslResult<[&'e Expr; 2]> {
    if call_args.len() == 2 {
        Ok([&call_args[0], &call_args[1]])
    } else {
        Err(DslError::Arity { name, expected: "2", found: call_args.len() })
    }
}

fn compare(a: &Value, b: &Value) -> DslResult<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            Ok(x.partial_cmp(y).unwrap_or(Ordering::Equal))
        }
        (Value::String(x), Value::String(y)) => Ok(x.cmp(y)),
        (Value::Number(_), other) | (Value::String(_), other) | (other, _) => {
            Err(DslError::type_error("comparable values", other.type_name()))
        }
    }
}

fn arity(name: &'static str, expected: &'static str, ok: bool, found: usize) -> DslResult<()> {
    if ok { Ok(()) } else { Err(DslError::Arity { name, expected, found }) }
}

#[allow(clippy::too_many_lines)]
fn apply_builtin(name: &str, values: &[Value]) -> DslResult<Value> {
    match name {
        "toString" => {
            arity("toString", "1", values.len() == 1, values.len())?;
            Ok(Value::String(values[0].render()))
        }
        "toNumber" => {
            arity("toNumber", "1", values.len() == 1, values.len())?;
            match &values[0] {
                Value::Number(n) => Ok(Value::Number(*n)),
                Value::Bool(b) => Ok(Value::Number(f64::from(u8::from(*b)))),
                Value::String(s) => s
                    .trim()
                    .parse::<f64>()
                    .map(Value::Number)
                    .map_err(|_| DslError::type_error("numeric string", "string")),
                other => Err(DslError::type_error("number", other.type_name())),
            }
        }
        "toJSON" => {
            arity("toJSON", "1", values.len() == 1, values.len())?;
            Ok(Value::String(values[0].to_json().to_string()))
        }
        "fromJSON" => {
            arity("fromJSON", "1", values.len() == 1, values.len())?;
            let text = values[0].as_str()?;
            let json: serde_json::Value = serde_json::from_str(text)
                .map_err(|e| DslError::parse(format!("invalid JSON: {e}"), 0))?;
            Ok(Value::from_json(&json))
        }
        "length" => {
            arity("length", "1", values.len() == 1, values.len())?;
            #[allow(clippy::cast_precision_loss)]
            let len = match &values[0] {
                Value::String(s) => s.chars().count() as f64,
                Value::Seq(items) => items.len() as f64,
                Value::Map(entries) => entries.len() as f64,
                other => return Err(DslError::type_error("string, seq or map", other.type_name())),
            };
            Ok(Value::Number(len))
        }
        "slice" => {
            arity("slice", "2..3", values.len() == 2 || values.len() == 3, values.len())?;
            let start = index_arg(&values[1])?;
            let end = values.get(2).map(index_arg).transpose()?;
            match &values[0] {
                Value::Seq(items) => {
                    let end = end.unwrap_or(items.len()).min(items.len());
                    let start = start.min(end);
                    Ok(Value::Seq(items[start..end].to_vec()))
                }
                Value::String(s) => {
                    let chars: Vec<char> = s.chars().collect();
                    let end = end.unwrap_or(chars.len()).min(chars.len());
                    let start = start.min(end);
                    Ok(Value::String(chars[start..end].iter().collect()))
                }
                other => Err(DslError::type_error("seq or string", other.type_name())),
            }
        }
        "concat" => {
            arity("concat", "1+", !values.is_empty(), values.len())?;
            match &values[0] {
                Value::Seq(_) => {
                    let mut out = Vec::new();
                    for value in values {
                        out.extend(value.as_seq()?.iter().cloned());
                    }
                    Ok(Value::Seq(out))
                }
                _ => {
                    let mut out = String::new();
                    for value in values {
                        out.push_str(value.as_str()?);
                    }
                    Ok(Value::String(out))
                }
            }
        }
        "join" => {
            arity("join", "2", values.len() == 2, values.len())?;
            let items = values[0].as_seq()?;
            let sep = values[1].as_str()?;
            Ok(Value::String(
                items.iter().map(Value::render).collect::<Vec<_>>().join(sep),
            ))
        }
        "keys" => {
            arity("keys", "1", values.len() == 1, values.len())?;
            let entries = values[0].as_map()?;
            Ok(Value::Seq(entries.keys().map(|k| Value::String(k.clone())).collect()))
        }
        "values" => {
            arity("values", "1", values.len() == 1, values.len())?;
            let entries = values[0].as_map()?;
            Ok(Value::Seq(entries.values().cloned().collect()))
        }
        "merge" => {
            arity("merge", "1+", !values.is_empty(), values.len())?;
            let mut out = BTreeMap::new();
            for value in values {
                for (k, v) in value.as_map()? {
                    out.insert(k.clone(), v.clone());
                }
            }
            Ok(Value::Map(out))
        }
        "pick" => {
            arity("pick", "2+", values.len() >= 2, values.len())?;
            let entries = values[0].as_map()?;
            let wanted = key_list(&values[1..])?;
            Ok(Value::Map(
                entries
                    .iter()
                    .filter(|(k, _)| wanted.iter().any(|w| w == *k))
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
            ))
        }
        "omit" => {
            arity("omit", "2+", values.len() >= 2, values.len())?;
            let entries = values[0].as_map()?;
            let unwanted = key_list(&values[1..])?;
            Ok(Value::Map(
                entries
                    .iter()
                    .filter(|(k, _)| !unwanted.iter().any(|w| w == *k))
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
            ))
        }
        "split" => {
            arity("split", "2", values.len() == 2, values.len())?;
            let text = values[0].as_str()?;
            let sep = values[1].as_str()?;
            Ok(Value::Seq(text.split(sep).map(Value::from).collect()))
        }
        "replace" => {
            arity("replace", "3", values.len() == 3, values.len())?;
            let text = values[0].as_str()?;
            let from = values[1].as_str()?;
            let to = values[2].as_str()?;
            Ok(Value::String(text.replace(from, to)))
        }
        "match" => {
            arity("match", "2", values.len() == 2, values.len())?;
            let text = values[0].as_str()?;
            let re = compile_regex(values[1].as_str()?)?;
            Ok(Value::Bool(re.is_match(text)))
        }
        "extract" => {
            arity("extract", "2", values.len() == 2, values.len())?;
            let text = values[0].as_str()?;
            let re = compile_regex(values[1].as_str()?)?;
            Ok(re.captures(text).map_or(Value::Null, |caps| {
                let matched = caps.get(1).or_else(|| caps.get(0));
                matched.map_or(Value::Null, |m| Value::String(m.as_str().to_string()))
            }))
        }
        "default" => {
            arity("default", "2", values.len() == 2, values.len())?;
            if matches!(values[0], Value::Null) {
                Ok(values[1].clone())
            } else {
                Ok(values[0].clone())
            }
        }
        other => Err(DslError::UnknownFunction { name: other.to_string() }),
    }
}

fn index_arg(value: &Value) -> DslResult<usize> {
    let n = value.as_number()?;
    if n < 0.0 || n.fract() != 0.0 {
        return Err(DslError::type_error("non-negative integer", "number"));
    }
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let index = n as usize;
    Ok(index)
}

/// Keys for pick/omit: either varargs strings or one sequence of strings.
fn key_list(values: &[Value]) -> DslResult<Vec<String>> {
    if values.len() == 1 {
        if let Value::Seq(items) = &values[0] {
            return items.iter().map(|v| v.as_str().map(str::to_string)).collect();
        }
    }
    values.iter().map(|v| v.as_str().map(str::to_string)).collect()
}

fn compile_regex(pattern: &str) -> DslResult<regex::Regex> {
    regex::Regex::new(pattern)
        .map_err(|e| DslError::parse(format!("invalid regex: {e}"), 0))
}
