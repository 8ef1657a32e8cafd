//! Built-in functions, namespaces and value methods available to scripts

use crate::ast::Expr;
use crate::errors::ScriptError;
use crate::interpreter::{
    check_collection_len, check_string_len, value_size, Eval, Halt, Interpreter, MAX_COLLECTION_SIZE,
};
use crate::value::{compare, number, strict_equals, to_display, to_number, truthy, type_of};
use chrono::format::{Item, StrftimeItems};
use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use regex::RegexBuilder;
use runflow_types::path;
use serde_json::{json, Map, Value};
use std::cmp::Ordering;

static NULL: Value = Value::Null;

const NAMESPACES: &[&str] = &[
    "Math", "JSON", "console", "Object", "Array", "Number", "Date", "http", "data",
];

const FUNCTIONS: &[&str] = &[
    "now",
    "today",
    "addDays",
    "addHours",
    "addMinutes",
    "daysBetween",
    "formatDate",
    "parseDate",
    "value",
    "previousValue",
    "changed",
    "changedTo",
    "changedFrom",
    "isEmpty",
    "isEmail",
    "matches",
    "setField",
    "abort",
    "String",
    "Number",
    "Boolean",
    "parseInt",
    "parseFloat",
    "isNaN",
];

const REGEX_SIZE_LIMIT: usize = 1 << 20;
const MAX_PAD: usize = 10_000;

pub(crate) fn is_namespace(name: &str) -> bool {
    NAMESPACES.contains(&name)
}

pub(crate) fn is_function(name: &str) -> bool {
    FUNCTIONS.contains(&name)
}

fn arg(args: &[Value], index: usize) -> &Value {
    args.get(index).unwrap_or(&NULL)
}

fn str_arg(args: &[Value], index: usize) -> String {
    to_display(arg(args, index))
}

fn num_arg(args: &[Value], index: usize) -> Option<f64> {
    to_number(arg(args, index))
}

fn not_a_function(owner: &str, name: &str) -> Halt {
    ScriptError::type_error(format!("{}.{} is not a function", owner, name)).into()
}

// ── Dates ────────────────────────────────────────────────────────────

fn parse_date(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|d| d.with_timezone(&Utc))
            .ok()
            .or_else(|| {
                NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S")
                    .ok()
                    .map(|n| Utc.from_utc_datetime(&n))
            })
            .or_else(|| {
                NaiveDate::parse_from_str(s, "%Y-%m-%d")
                    .ok()
                    .and_then(|d| d.and_hms_opt(0, 0, 0))
                    .map(|n| Utc.from_utc_datetime(&n))
            }),
        Value::Number(n) => n.as_i64().and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
        _ => None,
    }
}

fn iso(dt: DateTime<Utc>) -> Value {
    Value::String(dt.to_rfc3339_opts(SecondsFormat::Millis, true))
}

fn is_date_only(value: &Value) -> bool {
    matches!(value, Value::String(s) if s.len() == 10 && NaiveDate::parse_from_str(s, "%Y-%m-%d").is_ok())
}

fn shift_date(args: &[Value], unit: fn(i64) -> ChronoDuration) -> Value {
    let Some(start) = parse_date(arg(args, 0)) else {
        return Value::Null;
    };
    let amount = num_arg(args, 1).unwrap_or(0.0) as i64;
    match start.checked_add_signed(unit(amount)) {
        Some(shifted) if is_date_only(arg(args, 0)) => {
            Value::String(shifted.format("%Y-%m-%d").to_string())
        }
        Some(shifted) => iso(shifted),
        None => Value::Null,
    }
}

fn format_date(date: &Value, format: &str) -> Eval<Value> {
    let Some(dt) = parse_date(date) else {
        return Ok(Value::Null);
    };
    let items: Vec<Item<'_>> = StrftimeItems::new(format).collect();
    if items.iter().any(|item| matches!(item, Item::Error)) {
        return Err(ScriptError::runtime(format!("invalid date format '{}'", format)).into());
    }
    Ok(Value::String(dt.format_with_items(items.into_iter()).to_string()))
}

// ── Checks ───────────────────────────────────────────────────────────

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

fn is_email(value: &Value) -> bool {
    let Value::String(s) = value else {
        return false;
    };
    let Some((local, domain)) = s.split_once('@') else {
        return false;
    };
    !local.is_empty()
        && !domain.contains('@')
        && !s.chars().any(char::is_whitespace)
        && domain
            .split_once('.')
            .map(|(host, tld)| !host.is_empty() && !tld.is_empty() && !tld.ends_with('.'))
            .unwrap_or(false)
}

pub(crate) fn regex_matches(subject: &str, pattern: &str) -> Eval<bool> {
    let regex = RegexBuilder::new(pattern)
        .size_limit(REGEX_SIZE_LIMIT)
        .build()
        .map_err(|e| ScriptError::runtime(format!("invalid pattern: {}", e)))?;
    Ok(regex.is_match(subject))
}

fn parse_int(text: &str, radix: Option<f64>) -> Value {
    let radix = radix.map(|r| r as u32).filter(|r| (2..=36).contains(r)).unwrap_or(10);
    let trimmed = text.trim();
    let (negative, digits) = match trimmed.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, trimmed.strip_prefix('+').unwrap_or(trimmed)),
    };
    let digits = if radix == 16 {
        digits.trim_start_matches("0x").trim_start_matches("0X")
    } else {
        digits
    };
    let end = digits
        .char_indices()
        .find(|(_, c)| !c.is_digit(radix))
        .map(|(i, _)| i)
        .unwrap_or(digits.len());
    match i64::from_str_radix(&digits[..end], radix) {
        Ok(n) => number(if negative { -(n as f64) } else { n as f64 }),
        Err(_) => Value::Null,
    }
}

fn parse_float(text: &str) -> Value {
    let trimmed = text.trim();
    let end = trimmed
        .char_indices()
        .take_while(|(i, c)| {
            c.is_ascii_digit() || *c == '.' || ((*c == '-' || *c == '+') && *i == 0) || *c == 'e' || *c == 'E'
        })
        .last()
        .map(|(i, c)| i + c.len_utf8())
        .unwrap_or(0);
    let mut candidate = &trimmed[..end];
    while !candidate.is_empty() {
        if let Ok(n) = candidate.parse::<f64>() {
            return number(n);
        }
        candidate = &candidate[..candidate.len() - 1];
    }
    Value::Null
}

fn slice_bounds(len: usize, start: Option<f64>, end: Option<f64>) -> (usize, usize) {
    let clamp = |n: f64| -> usize {
        if n < 0.0 {
            (len as f64 + n).max(0.0) as usize
        } else {
            (n as usize).min(len)
        }
    };
    let start = start.map(clamp).unwrap_or(0);
    let end = end.map(clamp).unwrap_or(len);
    (start, end.max(start))
}

fn sort_compare(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Number(_), Value::Number(_)) => compare(a, b).unwrap_or(Ordering::Equal),
        _ => to_display(a).cmp(&to_display(b)),
    }
}

impl<'h> Interpreter<'h> {
    fn context_value(&self, name: &str) -> &Value {
        self.globals.get(name).unwrap_or(&NULL)
    }

    fn field_changed(&self, field: &str) -> bool {
        let listed = match self.context_value("changedFields") {
            Value::Array(items) => items.iter().any(|f| f.as_str() == Some(field)),
            _ => false,
        };
        listed || {
            let previous = self.context_value("previous");
            let current = path::lookup_or_null(self.context_value("record"), field);
            if previous.is_null() {
                !current.is_null()
            } else {
                !strict_equals(&current, &path::lookup_or_null(previous, field))
            }
        }
    }

    // ── Global functions ─────────────────────────────────────────────

    pub(crate) fn call_global(&mut self, name: &str, args: Vec<Value>) -> Eval<Value> {
        match name {
            "now" => Ok(iso(Utc::now())),
            "today" => Ok(Value::String(Utc::now().format("%Y-%m-%d").to_string())),
            "addDays" => Ok(shift_date(&args, ChronoDuration::days)),
            "addHours" => Ok(shift_date(&args, ChronoDuration::hours)),
            "addMinutes" => Ok(shift_date(&args, ChronoDuration::minutes)),
            "daysBetween" => Ok(match (parse_date(arg(&args, 0)), parse_date(arg(&args, 1))) {
                (Some(a), Some(b)) => number((b.date_naive() - a.date_naive()).num_days() as f64),
                _ => Value::Null,
            }),
            "formatDate" => {
                let format = match arg(&args, 1) {
                    Value::Null => "%Y-%m-%d".to_string(),
                    other => to_display(other),
                };
                format_date(arg(&args, 0), &format)
            }
            "parseDate" => Ok(parse_date(arg(&args, 0)).map(iso).unwrap_or(Value::Null)),
            "value" => Ok(path::lookup_or_null(self.context_value("record"), &str_arg(&args, 0))),
            "previousValue" => Ok(path::lookup_or_null(
                self.context_value("previous"),
                &str_arg(&args, 0),
            )),
            "changed" => Ok(Value::Bool(self.field_changed(&str_arg(&args, 0)))),
            "changedTo" => {
                let field = str_arg(&args, 0);
                let current = path::lookup_or_null(self.context_value("record"), &field);
                Ok(Value::Bool(
                    self.field_changed(&field) && strict_equals(&current, arg(&args, 1)),
                ))
            }
            "changedFrom" => {
                let field = str_arg(&args, 0);
                let before = path::lookup_or_null(self.context_value("previous"), &field);
                Ok(Value::Bool(
                    self.field_changed(&field) && strict_equals(&before, arg(&args, 1)),
                ))
            }
            "isEmpty" => Ok(Value::Bool(is_empty(arg(&args, 0)))),
            "isEmail" => Ok(Value::Bool(is_email(arg(&args, 0)))),
            "matches" => Ok(Value::Bool(regex_matches(
                &str_arg(&args, 0),
                &str_arg(&args, 1),
            )?)),
            "setField" => {
                let field = str_arg(&args, 0);
                let value = arg(&args, 1).clone();
                self.set_fields.insert(field, value.clone());
                Ok(value)
            }
            "abort" => {
                let message = match arg(&args, 0) {
                    Value::Null => "Aborted by script".to_string(),
                    other => to_display(other),
                };
                Err(Halt::Abort(message))
            }
            "String" => Ok(Value::String(str_arg(&args, 0))),
            "Number" => Ok(num_arg(&args, 0).map(number).unwrap_or(Value::Null)),
            "Boolean" => Ok(Value::Bool(truthy(arg(&args, 0)))),
            "parseInt" => Ok(parse_int(&str_arg(&args, 0), num_arg(&args, 1))),
            "parseFloat" => Ok(parse_float(&str_arg(&args, 0))),
            "isNaN" => Ok(Value::Bool(num_arg(&args, 0).map(f64::is_nan).unwrap_or(true))),
            _ if self.globals.contains_key(name) => {
                Err(ScriptError::type_error(format!("{} is not a function", name)).into())
            }
            _ => Err(ScriptError::reference(name).into()),
        }
    }

    // ── Namespaces ───────────────────────────────────────────────────

    pub(crate) fn namespace_constant(&self, namespace: &str, name: &str) -> Eval<Value> {
        match (namespace, name) {
            ("Math", "PI") => Ok(number(std::f64::consts::PI)),
            ("Math", "E") => Ok(number(std::f64::consts::E)),
            ("Number", "MAX_SAFE_INTEGER") => Ok(json!(9_007_199_254_740_991_i64)),
            ("Number", "MIN_SAFE_INTEGER") => Ok(json!(-9_007_199_254_740_991_i64)),
            _ => Err(ScriptError::type_error(format!(
                "{}.{} cannot be used as a value",
                namespace, name
            ))
            .into()),
        }
    }

    pub(crate) fn call_namespace(&mut self, namespace: &str, name: &str, args: Vec<Value>) -> Eval<Value> {
        match namespace {
            "Math" => self.call_math(name, &args),
            "JSON" => match name {
                "stringify" => {
                    let value = arg(&args, 0);
                    let text = if arg(&args, 2).is_null() {
                        serde_json::to_string(value)
                    } else {
                        serde_json::to_string_pretty(value)
                    }
                    .map_err(|e| ScriptError::runtime(e.to_string()))?;
                    check_string_len(&text)?;
                    Ok(Value::String(text))
                }
                "parse" => serde_json::from_str(&str_arg(&args, 0)).map_err(|e| {
                    ScriptError::new(crate::ScriptErrorKind::Syntax, format!("JSON.parse: {}", e)).into()
                }),
                _ => Err(not_a_function(namespace, name)),
            },
            "console" => match name {
                "log" | "info" | "warn" | "error" | "debug" => {
                    let line = args.iter().map(to_display).collect::<Vec<_>>().join(" ");
                    let line = if name == "log" || name == "info" {
                        line
                    } else {
                        format!("[{}] {}", name, line)
                    };
                    self.log(line);
                    Ok(Value::Null)
                }
                _ => Err(not_a_function(namespace, name)),
            },
            "Object" => match (name, arg(&args, 0)) {
                ("keys", Value::Object(map)) => {
                    Ok(Value::Array(map.keys().cloned().map(Value::String).collect()))
                }
                ("values", Value::Object(map)) => Ok(Value::Array(map.values().cloned().collect())),
                ("entries", Value::Object(map)) => Ok(Value::Array(
                    map.iter().map(|(k, v)| json!([k, v])).collect(),
                )),
                ("keys" | "values" | "entries", _) => Ok(Value::Array(Vec::new())),
                ("assign", _) => {
                    let mut merged = Map::new();
                    for source in &args {
                        if let Value::Object(map) = source {
                            merged.extend(map.clone());
                        }
                    }
                    Ok(Value::Object(merged))
                }
                _ => Err(not_a_function(namespace, name)),
            },
            "Array" => match name {
                "isArray" => Ok(Value::Bool(arg(&args, 0).is_array())),
                "from" => Ok(match arg(&args, 0) {
                    Value::Array(items) => Value::Array(items.clone()),
                    Value::String(s) => {
                        check_collection_len(s.chars().count())?;
                        Value::Array(s.chars().map(|c| Value::String(c.to_string())).collect())
                    }
                    _ => Value::Array(Vec::new()),
                }),
                _ => Err(not_a_function(namespace, name)),
            },
            "Number" => match name {
                "isInteger" => Ok(Value::Bool(
                    matches!(arg(&args, 0), Value::Number(n) if n.as_f64().map(|f| f.fract() == 0.0).unwrap_or(false)),
                )),
                "isFinite" => Ok(Value::Bool(arg(&args, 0).is_number())),
                "parseFloat" => Ok(parse_float(&str_arg(&args, 0))),
                "parseInt" => Ok(parse_int(&str_arg(&args, 0), num_arg(&args, 1))),
                _ => Err(not_a_function(namespace, name)),
            },
            "Date" => match name {
                "now" => Ok(json!(Utc::now().timestamp_millis())),
                _ => Err(not_a_function(namespace, name)),
            },
            "http" => self.call_http(name, args),
            "data" => self.call_data(name, args),
            _ => Err(ScriptError::reference(namespace).into()),
        }
    }

    fn call_math(&mut self, name: &str, args: &[Value]) -> Eval<Value> {
        let unary = |f: fn(f64) -> f64| num_arg(args, 0).map(|n| number(f(n))).unwrap_or(Value::Null);
        Ok(match name {
            "abs" => unary(f64::abs),
            "floor" => unary(f64::floor),
            "ceil" => unary(f64::ceil),
            "round" => unary(|n| (n + 0.5).floor()),
            "trunc" => unary(f64::trunc),
            "sqrt" => unary(f64::sqrt),
            "sign" => unary(|n| if n == 0.0 { 0.0 } else { n.signum() }),
            "pow" => match (num_arg(args, 0), num_arg(args, 1)) {
                (Some(base), Some(exp)) => number(base.powf(exp)),
                _ => Value::Null,
            },
            "min" | "max" => {
                let mut values = Vec::with_capacity(args.len());
                for value in args {
                    match to_number(value) {
                        Some(n) => values.push(n),
                        None => return Ok(Value::Null),
                    }
                }
                let folded = if name == "min" {
                    values.into_iter().fold(f64::INFINITY, f64::min)
                } else {
                    values.into_iter().fold(f64::NEG_INFINITY, f64::max)
                };
                number(folded)
            }
            _ => return Err(not_a_function("Math", name)),
        })
    }

    // ── Host capabilities ────────────────────────────────────────────

    fn call_http(&mut self, name: &str, args: Vec<Value>) -> Eval<Value> {
        let request = match name {
            "request" => arg(&args, 0).clone(),
            "get" => json!({"method": "GET", "url": str_arg(&args, 0), "headers": arg(&args, 1)}),
            "post" => json!({
                "method": "POST",
                "url": str_arg(&args, 0),
                "body": arg(&args, 1),
                "headers": arg(&args, 2),
            }),
            _ => return Err(not_a_function("http", name)),
        };
        if !self.capabilities.http {
            return Err(ScriptError::permission("http").into());
        }
        let host = self.host.ok_or_else(|| Halt::from(ScriptError::permission("http")))?;
        self.check_deadline()?;
        let response = host
            .http_request(request, self.remaining())
            .map_err(|e| ScriptError::runtime(format!("http request failed: {}", e)))?;
        self.check_deadline()?;
        Ok(response)
    }

    fn call_data(&mut self, name: &str, args: Vec<Value>) -> Eval<Value> {
        let collection = str_arg(&args, 0);
        let query = match name {
            "query" => arg(&args, 1).clone(),
            "get" => json!({"id": arg(&args, 1)}),
            _ => return Err(not_a_function("data", name)),
        };
        if !self.capabilities.data_query {
            return Err(ScriptError::permission("data query").into());
        }
        let host = self.host.ok_or_else(|| Halt::from(ScriptError::permission("data query")))?;
        self.check_deadline()?;
        let result = host
            .data_query(&collection, query, self.remaining())
            .map_err(|e| ScriptError::runtime(format!("data query failed: {}", e)))?;
        self.check_deadline()?;
        Ok(result)
    }

    // ── Methods ──────────────────────────────────────────────────────

    /// Call `receiver.name(args)`; arguments stay unevaluated so array
    /// methods can receive arrow callbacks
    pub(crate) fn call_method(&mut self, receiver: Value, name: &str, args: &[Expr]) -> Eval<Value> {
        match receiver {
            Value::Array(items) => self.call_array_method(items, name, args),
            Value::String(s) => {
                let values = self.eval_args(args)?;
                string_method(&s, name, &values)
            }
            Value::Number(n) => {
                let values = self.eval_args(args)?;
                let n = n.as_f64().unwrap_or(0.0);
                match name {
                    "toFixed" => {
                        let digits = num_arg(&values, 0).unwrap_or(0.0).clamp(0.0, 20.0) as usize;
                        Ok(Value::String(format!("{:.*}", digits, n)))
                    }
                    "toString" => Ok(Value::String(to_display(&number(n)))),
                    _ => Err(not_a_function("number", name)),
                }
            }
            Value::Object(map) => match name {
                "hasOwnProperty" => {
                    let values = self.eval_args(args)?;
                    Ok(Value::Bool(map.contains_key(&str_arg(&values, 0))))
                }
                _ => Err(not_a_function("object", name)),
            },
            Value::Null => Err(ScriptError::type_error(format!(
                "Cannot read properties of undefined (reading '{}')",
                name
            ))
            .into()),
            other => Err(not_a_function(type_of(&other), name)),
        }
    }

    fn callback<'e>(&self, args: &'e [Expr], method: &str) -> Eval<&'e Expr> {
        match args.first() {
            Some(expr @ Expr::Arrow { .. }) => Ok(expr),
            _ => Err(ScriptError::type_error(format!(
                "Array.{} expects an arrow function callback",
                method
            ))
            .into()),
        }
    }

    fn call_array_method(&mut self, items: Vec<Value>, name: &str, args: &[Expr]) -> Eval<Value> {
        self.charge(items.len())?;
        match name {
            "map" => {
                let f = self.callback(args, name)?;
                let mut out = Vec::with_capacity(items.len());
                let mut size = 1usize;
                for (i, item) in items.into_iter().enumerate() {
                    let mapped = self.call_arrow(f, vec![item, number(i as f64)])?;
                    let mapped_size = value_size(&mapped, MAX_COLLECTION_SIZE);
                    size += mapped_size;
                    check_collection_len(size)?;
                    self.charge(mapped_size)?;
                    out.push(mapped);
                }
                Ok(Value::Array(out))
            }
            "filter" => {
                let f = self.callback(args, name)?;
                let mut out = Vec::new();
                for (i, item) in items.into_iter().enumerate() {
                    if truthy(&self.call_arrow(f, vec![item.clone(), number(i as f64)])?) {
                        out.push(item);
                    }
                }
                Ok(Value::Array(out))
            }
            "find" | "findIndex" => {
                let f = self.callback(args, name)?;
                for (i, item) in items.into_iter().enumerate() {
                    if truthy(&self.call_arrow(f, vec![item.clone(), number(i as f64)])?) {
                        return Ok(if name == "find" { item } else { number(i as f64) });
                    }
                }
                Ok(if name == "find" { Value::Null } else { number(-1.0) })
            }
            "some" | "every" => {
                let f = self.callback(args, name)?;
                let want = name == "some";
                for (i, item) in items.into_iter().enumerate() {
                    if truthy(&self.call_arrow(f, vec![item, number(i as f64)])?) == want {
                        return Ok(Value::Bool(want));
                    }
                }
                Ok(Value::Bool(!want))
            }
            "forEach" => {
                let f = self.callback(args, name)?;
                for (i, item) in items.into_iter().enumerate() {
                    self.call_arrow(f, vec![item, number(i as f64)])?;
                }
                Ok(Value::Null)
            }
            "reduce" => {
                let f = self.callback(args, name)?;
                let mut iter = items.into_iter().enumerate();
                let mut acc = match args.get(1) {
                    Some(init) => self.eval(init)?,
                    None => match iter.next() {
                        Some((_, first)) => first,
                        None => {
                            return Err(ScriptError::type_error(
                                "Reduce of empty array with no initial value",
                            )
                            .into())
                        }
                    },
                };
                for (i, item) in iter {
                    acc = self.call_arrow(f, vec![acc, item, number(i as f64)])?;
                }
                Ok(acc)
            }
            "sort" => {
                let mut items = items;
                match args.first() {
                    Some(f @ Expr::Arrow { .. }) => {
                        for i in 1..items.len() {
                            let mut j = i;
                            while j > 0 {
                                let order = self.call_arrow(f, vec![items[j - 1].clone(), items[j].clone()])?;
                                if to_number(&order).map(|n| n > 0.0).unwrap_or(false) {
                                    items.swap(j - 1, j);
                                    j -= 1;
                                } else {
                                    break;
                                }
                            }
                        }
                    }
                    _ => items.sort_by(sort_compare),
                }
                Ok(Value::Array(items))
            }
            _ => {
                let values = self.eval_args(args)?;
                if name == "concat" {
                    self.charge_collection(items.iter().chain(values.iter()))?;
                }
                array_method(items, name, &values)
            }
        }
    }
}

fn array_method(items: Vec<Value>, name: &str, args: &[Value]) -> Eval<Value> {
    Ok(match name {
        "includes" => Value::Bool(items.iter().any(|v| strict_equals(v, arg(args, 0)))),
        "indexOf" => number(
            items
                .iter()
                .position(|v| strict_equals(v, arg(args, 0)))
                .map(|i| i as f64)
                .unwrap_or(-1.0),
        ),
        "join" => {
            let separator = match arg(args, 0) {
                Value::Null => ",".to_string(),
                other => to_display(other),
            };
            let joined = items
                .iter()
                .map(|v| if v.is_null() { String::new() } else { to_display(v) })
                .collect::<Vec<_>>()
                .join(&separator);
            check_string_len(&joined)?;
            Value::String(joined)
        }
        "slice" => {
            let (start, end) = slice_bounds(items.len(), num_arg(args, 0), num_arg(args, 1));
            Value::Array(items[start..end].to_vec())
        }
        "concat" => {
            let mut out = items;
            for value in args {
                match value {
                    Value::Array(more) => out.extend(more.iter().cloned()),
                    other => out.push(other.clone()),
                }
            }
            Value::Array(out)
        }
        "reverse" => Value::Array(items.into_iter().rev().collect()),
        "at" => {
            let len = items.len() as f64;
            let index = num_arg(args, 0).unwrap_or(0.0);
            let index = if index < 0.0 { len + index } else { index };
            if index < 0.0 {
                Value::Null
            } else {
                items.get(index as usize).cloned().unwrap_or(Value::Null)
            }
        }
        "push" => {
            return Err(ScriptError::type_error(
                "push is only supported on local array variables",
            )
            .into())
        }
        _ => return Err(not_a_function("array", name)),
    })
}

fn string_method(s: &str, name: &str, args: &[Value]) -> Eval<Value> {
    let chars = || s.chars().collect::<Vec<_>>();
    Ok(match name {
        "toUpperCase" => Value::String(s.to_uppercase()),
        "toLowerCase" => Value::String(s.to_lowercase()),
        "trim" => Value::String(s.trim().to_string()),
        "trimStart" => Value::String(s.trim_start().to_string()),
        "trimEnd" => Value::String(s.trim_end().to_string()),
        "includes" => Value::Bool(s.contains(str_arg(args, 0).as_str())),
        "startsWith" => Value::Bool(s.starts_with(str_arg(args, 0).as_str())),
        "endsWith" => Value::Bool(s.ends_with(str_arg(args, 0).as_str())),
        "indexOf" => number(
            s.find(str_arg(args, 0).as_str())
                .map(|byte| s[..byte].chars().count() as f64)
                .unwrap_or(-1.0),
        ),
        "charAt" => Value::String(
            num_arg(args, 0)
                .and_then(|i| chars().get(i as usize).copied())
                .map(String::from)
                .unwrap_or_default(),
        ),
        "slice" => {
            let chars = chars();
            let (start, end) = slice_bounds(chars.len(), num_arg(args, 0), num_arg(args, 1));
            Value::String(chars[start..end].iter().collect())
        }
        "substring" => {
            let chars = chars();
            let len = chars.len();
            let clamp = |n: Option<f64>, default: usize| {
                n.map(|n| n.max(0.0) as usize).unwrap_or(default).min(len)
            };
            let (a, b) = (clamp(num_arg(args, 0), 0), clamp(num_arg(args, 1), len));
            let (start, end) = if a <= b { (a, b) } else { (b, a) };
            Value::String(chars[start..end].iter().collect())
        }
        "split" => match arg(args, 0) {
            Value::Null => Value::Array(vec![Value::String(s.to_string())]),
            sep => {
                let sep = to_display(sep);
                if sep.is_empty() {
                    check_collection_len(s.chars().count())?;
                    Value::Array(s.chars().map(|c| Value::String(c.to_string())).collect())
                } else {
                    check_collection_len(s.matches(sep.as_str()).count() + 1)?;
                    Value::Array(s.split(sep.as_str()).map(|p| Value::String(p.to_string())).collect())
                }
            }
        },
        "replace" => Value::String(s.replacen(str_arg(args, 0).as_str(), &str_arg(args, 1), 1)),
        "replaceAll" => {
            let replaced = s.replace(str_arg(args, 0).as_str(), &str_arg(args, 1));
            check_string_len(&replaced)?;
            Value::String(replaced)
        }
        "padStart" | "padEnd" => {
            let target = (num_arg(args, 0).unwrap_or(0.0).max(0.0) as usize).min(MAX_PAD);
            let fill = match arg(args, 1) {
                Value::Null => " ".to_string(),
                other => to_display(other),
            };
            let current = s.chars().count();
            if current >= target || fill.is_empty() {
                Value::String(s.to_string())
            } else {
                let padding: String = fill.chars().cycle().take(target - current).collect();
                Value::String(if name == "padStart" {
                    format!("{}{}", padding, s)
                } else {
                    format!("{}{}", s, padding)
                })
            }
        }
        "toString" => Value::String(s.to_string()),
        _ => return Err(not_a_function("string", name)),
    })
}
