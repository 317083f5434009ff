//! Filter expressions for remote reads.
//!
//! A `Filter` renders to the REST endpoint's `field=op.value` query syntax
//! and can also be evaluated locally, so a cache fallback answers the same
//! question the remote would have.

use std::cmp::Ordering;

use serde_json::Value;

use crate::types::Record;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
    Is,
}

impl FilterOp {
    pub fn as_str(self) -> &'static str {
        match self {
            FilterOp::Eq => "eq",
            FilterOp::Neq => "neq",
            FilterOp::Gt => "gt",
            FilterOp::Gte => "gte",
            FilterOp::Lt => "lt",
            FilterOp::Lte => "lte",
            FilterOp::In => "in",
            FilterOp::Is => "is",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    pub field: String,
    pub op: FilterOp,
    pub value: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SortKey {
    pub field: String,
    pub direction: SortDirection,
}

/// Conjunction of conditions plus optional ordering and limit.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    conditions: Vec<Condition>,
    order: Vec<SortKey>,
    limit: Option<usize>,
}

impl Filter {
    /// Matches every record.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn condition(mut self, field: impl Into<String>, op: FilterOp, value: impl Into<Value>) -> Self {
        self.conditions.push(Condition {
            field: field.into(),
            op,
            value: value.into(),
        });
        self
    }

    pub fn eq(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.condition(field, FilterOp::Eq, value)
    }

    pub fn neq(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.condition(field, FilterOp::Neq, value)
    }

    pub fn gt(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.condition(field, FilterOp::Gt, value)
    }

    pub fn gte(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.condition(field, FilterOp::Gte, value)
    }

    pub fn lt(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.condition(field, FilterOp::Lt, value)
    }

    pub fn lte(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.condition(field, FilterOp::Lte, value)
    }

    pub fn in_list(self, field: impl Into<String>, values: Vec<Value>) -> Self {
        self.condition(field, FilterOp::In, Value::Array(values))
    }

    pub fn is_null(self, field: impl Into<String>) -> Self {
        self.condition(field, FilterOp::Is, Value::Null)
    }

    pub fn order_by(mut self, field: impl Into<String>, direction: SortDirection) -> Self {
        self.order.push(SortKey {
            field: field.into(),
            direction,
        });
        self
    }

    pub fn limit(mut self, n: usize) -> Self {
        self.limit = Some(n);
        self
    }

    pub fn conditions(&self) -> &[Condition] {
        &self.conditions
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty() && self.order.is_empty() && self.limit.is_none()
    }

    // -----------------------------------------------------------------------
    // Remote rendering
    // -----------------------------------------------------------------------

    /// Query-string pairs in `field=op.value` form, followed by `order` and
    /// `limit` when set.
    pub fn query_pairs(&self) -> Vec<(String, String)> {
        let mut pairs: Vec<(String, String)> = self
            .conditions
            .iter()
            .map(|c| (c.field.clone(), format!("{}.{}", c.op.as_str(), render_operand(c))))
            .collect();

        if !self.order.is_empty() {
            let order = self
                .order
                .iter()
                .map(|k| match k.direction {
                    SortDirection::Asc => format!("{}.asc", k.field),
                    SortDirection::Desc => format!("{}.desc", k.field),
                })
                .collect::<Vec<_>>()
                .join(",");
            pairs.push(("order".to_string(), order));
        }
        if let Some(n) = self.limit {
            pairs.push(("limit".to_string(), n.to_string()));
        }
        pairs
    }

    // -----------------------------------------------------------------------
    // Local evaluation
    // -----------------------------------------------------------------------

    /// Whether `record` satisfies every condition.
    pub fn matches(&self, record: &Record) -> bool {
        self.conditions.iter().all(|c| condition_matches(c, record))
    }

    /// Filter, sort and limit `records` the way the remote would.
    pub fn apply(&self, records: Vec<Record>) -> Vec<Record> {
        let mut out: Vec<Record> = records.into_iter().filter(|r| self.matches(r)).collect();
        if !self.order.is_empty() {
            out.sort_by(|a, b| {
                for key in &self.order {
                    let ord = compare_for_sort(a.get(&key.field), b.get(&key.field));
                    let ord = match key.direction {
                        SortDirection::Asc => ord,
                        SortDirection::Desc => ord.reverse(),
                    };
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                Ordering::Equal
            });
        }
        if let Some(n) = self.limit {
            out.truncate(n);
        }
        out
    }
}

fn render_scalar(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        other => other.to_string(),
    }
}

fn render_operand(c: &Condition) -> String {
    match (&c.op, &c.value) {
        (FilterOp::In, Value::Array(items)) => {
            let inner = items
                .iter()
                .map(|v| {
                    let s = render_scalar(v);
                    if s.contains([',', '(', ')', '"']) {
                        format!("\"{}\"", s.replace('"', "\\\""))
                    } else {
                        s
                    }
                })
                .collect::<Vec<_>>()
                .join(",");
            format!("({inner})")
        }
        _ => render_scalar(&c.value),
    }
}

/// Order two JSON scalars. Numeric strings compare against numbers
/// numerically; mismatched kinds are incomparable.
fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (Value::String(s), Value::Number(n)) => s.parse::<f64>().ok()?.partial_cmp(&n.as_f64()?),
        (Value::Number(n), Value::String(s)) => n.as_f64()?.partial_cmp(&s.parse::<f64>().ok()?),
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        _ => None,
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    compare_values(a, b) == Some(Ordering::Equal) || a == b
}

fn condition_matches(c: &Condition, record: &Record) -> bool {
    let field = record.get(&c.field);
    match c.op {
        FilterOp::Is => match (&c.value, field) {
            (Value::Null, None) | (Value::Null, Some(Value::Null)) => true,
            (Value::Bool(want), Some(Value::Bool(have))) => want == have,
            _ => false,
        },
        FilterOp::In => match (&c.value, field) {
            (Value::Array(items), Some(v)) => items.iter().any(|item| values_equal(item, v)),
            _ => false,
        },
        _ => {
            // Missing fields behave like SQL NULL: no comparison matches.
            let Some(v) = field.filter(|v| !v.is_null()) else {
                return false;
            };
            match c.op {
                FilterOp::Eq => values_equal(v, &c.value),
                FilterOp::Neq => !values_equal(v, &c.value),
                FilterOp::Gt => compare_values(v, &c.value) == Some(Ordering::Greater),
                FilterOp::Gte => matches!(
                    compare_values(v, &c.value),
                    Some(Ordering::Greater | Ordering::Equal)
                ),
                FilterOp::Lt => compare_values(v, &c.value) == Some(Ordering::Less),
                FilterOp::Lte => matches!(
                    compare_values(v, &c.value),
                    Some(Ordering::Less | Ordering::Equal)
                ),
                FilterOp::In | FilterOp::Is => unreachable!("handled above"),
            }
        }
    }
}

/// Total order for sorting: missing/null values sort last.
fn compare_for_sort(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    let a = a.filter(|v| !v.is_null());
    let b = b.filter(|v| !v.is_null());
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Greater,
        (Some(_), None) => Ordering::Less,
        (Some(x), Some(y)) => compare_values(x, y).unwrap_or(Ordering::Equal),
    }
}
