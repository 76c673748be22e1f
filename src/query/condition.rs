//! Predicate compiler
//!
//! Renders a `WhereExpr` tree into the store's native filter-expression
//! syntax. Field names are replaced by `#condNameN` aliases (one alias per
//! distinct field) and literals by `:condValueN` placeholders (one per
//! occurrence, never shared).

use std::collections::BTreeMap;

use serde_json::Value;

use crate::backend::FilterExpression;
use crate::error::{AuditError, AuditResult};
use crate::types::{attr, WhereExpr};

/// Attribute holding the payload that predicate fields refer to
pub const PAYLOAD_ROOT: &str = attr::FIELDS_MAP;

/// Placeholder bindings accumulated while compiling one predicate
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CondFilterParams {
    /// Alias (`#condNameN`) to field name
    pub attr_names: BTreeMap<String, String>,
    /// Placeholder (`:condValueN`) to literal value
    pub attr_values: BTreeMap<String, Value>,
}

impl CondFilterParams {
    pub fn new() -> Self {
        Self::default()
    }

    fn field_ref(&mut self, name: &str) -> String {
        let existing = self
            .attr_names
            .iter()
            .find(|(_, field)| field.as_str() == name)
            .map(|(alias, _)| alias.clone());

        let alias = match existing {
            Some(alias) => alias,
            None => {
                let alias = format!("#condName{}", self.attr_names.len());
                self.attr_names.insert(alias.clone(), name.to_string());
                alias
            }
        };
        format!("{}.{}", PAYLOAD_ROOT, alias)
    }

    fn value_ref(&mut self, value: &Value) -> String {
        let placeholder = format!(":condValue{}", self.attr_values.len());
        self.attr_values.insert(placeholder.clone(), value.clone());
        placeholder
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OperandKind {
    Field,
    Literal,
}

/// Compile a predicate into a filter expression, recording its bindings in `params`.
pub fn compile(expr: &WhereExpr, params: &mut CondFilterParams) -> AuditResult<String> {
    match expr {
        WhereExpr::Field(_) | WhereExpr::Literal(_) => Err(AuditError::UnsupportedPredicate(
            format!("a bare {} is not a predicate", expr.kind()),
        )),
        WhereExpr::Equals(left, right) => {
            let [(_, left), (_, right)] = compile_comparison("equals", left, right, params)?;
            Ok(format!("{} = {}", left, right))
        }
        WhereExpr::Contains(left, right) => {
            let operands = compile_comparison("contains", left, right, params)?;
            let (field, literal) = match operands {
                [(OperandKind::Field, field), (_, literal)] => (field, literal),
                [(_, literal), (_, field)] => (field, literal),
            };
            Ok(format!("contains({}, {})", field, literal))
        }
        WhereExpr::And(left, right) => {
            let left = compile(left, params)?;
            let right = compile(right, params)?;
            Ok(format!("({}) AND ({})", left, right))
        }
        WhereExpr::Or(left, right) => {
            let left = compile(left, params)?;
            let right = compile(right, params)?;
            Ok(format!("({}) OR ({})", left, right))
        }
        WhereExpr::Not(inner) => Ok(format!("NOT ({})", compile(inner, params)?)),
    }
}

fn compile_comparison(
    op: &str,
    left: &WhereExpr,
    right: &WhereExpr,
    params: &mut CondFilterParams,
) -> AuditResult<[(OperandKind, String); 2]> {
    let left = compile_operand(op, left, params)?;
    let right = compile_operand(op, right, params)?;
    if left.0 == right.0 {
        return Err(AuditError::UnsupportedPredicate(format!(
            "{} needs one field and one literal operand",
            op
        )));
    }
    Ok([left, right])
}

fn compile_operand(
    op: &str,
    expr: &WhereExpr,
    params: &mut CondFilterParams,
) -> AuditResult<(OperandKind, String)> {
    match expr {
        WhereExpr::Field(name) if name.is_empty() => Err(AuditError::UnsupportedPredicate(
            "field name must not be empty".to_string(),
        )),
        WhereExpr::Field(name) => Ok((OperandKind::Field, params.field_ref(name))),
        WhereExpr::Literal(value) => Ok((OperandKind::Literal, params.value_ref(value))),
        other => Err(AuditError::UnsupportedPredicate(format!(
            "{} cannot be an operand of {}",
            other.kind(),
            op
        ))),
    }
}

/// Assemble the full filter for a search.
///
/// Conditions are joined with `AND` in a fixed order: namespace, event
/// types, then the caller's predicate. Returns `None` when nothing filters.
pub fn build_filter(
    namespace: Option<&str>,
    event_types: &[String],
    condition: Option<&WhereExpr>,
) -> AuditResult<Option<FilterExpression>> {
    let mut clauses = Vec::new();
    let mut params = CondFilterParams::new();

    if let Some(namespace) = namespace {
        clauses.push(format!("{} = :eventNamespace", attr::EVENT_NAMESPACE));
        params
            .attr_values
            .insert(":eventNamespace".to_string(), Value::from(namespace));
    }

    if !event_types.is_empty() {
        let placeholders: Vec<String> = event_types
            .iter()
            .enumerate()
            .map(|(i, event_type)| {
                let placeholder = format!(":eventType{}", i);
                params
                    .attr_values
                    .insert(placeholder.clone(), Value::from(event_type.as_str()));
                placeholder
            })
            .collect();
        clauses.push(format!("{} IN ({})", attr::EVENT_TYPE, placeholders.join(", ")));
    }

    if let Some(condition) = condition {
        // Compiled separately so its placeholder numbering starts at zero.
        let mut cond_params = CondFilterParams::new();
        let expression = compile(condition, &mut cond_params)?;
        clauses.push(format!("({})", expression));
        params.attr_names.extend(cond_params.attr_names);
        params.attr_values.extend(cond_params.attr_values);
    }

    if clauses.is_empty() {
        return Ok(None);
    }

    Ok(Some(FilterExpression {
        expression: clauses.join(" AND "),
        names: params.attr_names,
        values: params.attr_values,
    }))
}
