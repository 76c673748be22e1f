//! Boolean predicates over event payload fields

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A filter condition over `FieldsMap`
///
/// `Equals` and `Contains` compare one `Field` against one `Literal`, in
/// either order. `And`, `Or` and `Not` combine predicates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WhereExpr {
    Field(String),
    Literal(Value),
    Equals(Box<WhereExpr>, Box<WhereExpr>),
    Contains(Box<WhereExpr>, Box<WhereExpr>),
    And(Box<WhereExpr>, Box<WhereExpr>),
    Or(Box<WhereExpr>, Box<WhereExpr>),
    Not(Box<WhereExpr>),
}

impl WhereExpr {
    pub fn field(name: impl Into<String>) -> Self {
        WhereExpr::Field(name.into())
    }

    pub fn literal(value: impl Into<Value>) -> Self {
        WhereExpr::Literal(value.into())
    }

    pub fn equals(left: WhereExpr, right: WhereExpr) -> Self {
        WhereExpr::Equals(Box::new(left), Box::new(right))
    }

    pub fn contains(left: WhereExpr, right: WhereExpr) -> Self {
        WhereExpr::Contains(Box::new(left), Box::new(right))
    }

    pub fn and(self, other: WhereExpr) -> Self {
        WhereExpr::And(Box::new(self), Box::new(other))
    }

    pub fn or(self, other: WhereExpr) -> Self {
        WhereExpr::Or(Box::new(self), Box::new(other))
    }

    pub fn negate(self) -> Self {
        WhereExpr::Not(Box::new(self))
    }

    /// Short name of the node kind, for error messages
    pub fn kind(&self) -> &'static str {
        match self {
            WhereExpr::Field(_) => "field",
            WhereExpr::Literal(_) => "literal",
            WhereExpr::Equals(..) => "equals",
            WhereExpr::Contains(..) => "contains",
            WhereExpr::And(..) => "and",
            WhereExpr::Or(..) => "or",
            WhereExpr::Not(_) => "not",
        }
    }
}
