//! Front-end filter conditions and the expression builder
//!
//! Untrusted `where`/`having` conditions are compiled in two passes:
//!
//! 1. [`FilterExpressionBuilder::parse`] checks the whole tree for field
//!    format, whitelisted operators and argument counts.
//! 2. [`FilterExpressionBuilder::build`] authorizes every leaf through the
//!    [`PermissionEvaluator`] and produces an [`Expr`] whose literal values
//!    are all bound as named parameters.

use crate::core::error::{GateResult, PermissionError, RequestError};
use crate::core::permission::{Bucket, PermissionEvaluator, PermissionLayer, PermissionNode};
use crate::core::resolver::ResolveContext;
use indexmap::IndexMap;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;
use tracing::warn;

/// Prefix of parameters generated for front-end values
pub const GENERATED_PARAM_PREFIX: &str = "frontEndParam";

/// `alias.column`
pub fn is_valid_field(field: &str) -> bool {
    static FIELD_REGEX: OnceLock<Regex> = OnceLock::new();
    let regex = FIELD_REGEX.get_or_init(|| Regex::new(r"^\w+\.\w+$").unwrap());
    regex.is_match(field)
}

/// Fail with a malformed-field error unless `field` is `alias.column`
pub fn verify_field_format(field: &str) -> GateResult<()> {
    if is_valid_field(field) {
        Ok(())
    } else {
        Err(RequestError::MalformedField {
            field: field.to_string(),
        }
        .into())
    }
}

/// The closed set of operators the front end may use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operator {
    #[serde(rename = "andX")]
    AndX,
    #[serde(rename = "orX")]
    OrX,
    #[serde(rename = "eq")]
    Eq,
    #[serde(rename = "neq")]
    Neq,
    #[serde(rename = "lt")]
    Lt,
    #[serde(rename = "lte")]
    Lte,
    #[serde(rename = "gt")]
    Gt,
    #[serde(rename = "gte")]
    Gte,
    #[serde(rename = "in")]
    In,
    #[serde(rename = "notIn")]
    NotIn,
    #[serde(rename = "isNull")]
    IsNull,
    #[serde(rename = "isNotNull")]
    IsNotNull,
    #[serde(rename = "like")]
    Like,
    #[serde(rename = "notLike")]
    NotLike,
    #[serde(rename = "between")]
    Between,
}

impl Operator {
    pub const ALL: [Operator; 15] = [
        Operator::AndX,
        Operator::OrX,
        Operator::Eq,
        Operator::Neq,
        Operator::Lt,
        Operator::Lte,
        Operator::Gt,
        Operator::Gte,
        Operator::In,
        Operator::NotIn,
        Operator::IsNull,
        Operator::IsNotNull,
        Operator::Like,
        Operator::NotLike,
        Operator::Between,
    ];

    /// Wire name of the operator
    pub fn as_str(&self) -> &'static str {
        match self {
            Operator::AndX => "andX",
            Operator::OrX => "orX",
            Operator::Eq => "eq",
            Operator::Neq => "neq",
            Operator::Lt => "lt",
            Operator::Lte => "lte",
            Operator::Gt => "gt",
            Operator::Gte => "gte",
            Operator::In => "in",
            Operator::NotIn => "notIn",
            Operator::IsNull => "isNull",
            Operator::IsNotNull => "isNotNull",
            Operator::Like => "like",
            Operator::NotLike => "notLike",
            Operator::Between => "between",
        }
    }

    /// `andX` and `orX` combine nested conditions instead of testing a field
    pub fn is_combinator(&self) -> bool {
        matches!(self, Operator::AndX | Operator::OrX)
    }

    /// Check the number of arguments given to a leaf operator
    fn check_arity(&self, count: usize) -> Result<(), &'static str> {
        let ok = match self {
            Operator::AndX | Operator::OrX => true,
            Operator::IsNull | Operator::IsNotNull => count == 0,
            Operator::In | Operator::NotIn => count >= 1,
            Operator::Between => count == 2,
            _ => count == 1,
        };
        if ok {
            return Ok(());
        }
        Err(match self {
            Operator::IsNull | Operator::IsNotNull => "0",
            Operator::In | Operator::NotIn => "at least 1",
            Operator::Between => "2",
            _ => "1",
        })
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operator {
    type Err = RequestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Operator::ALL
            .iter()
            .find(|op| op.as_str() == s)
            .copied()
            .ok_or_else(|| RequestError::UnsafeOperator {
                operator: s.to_string(),
            })
    }
}

/// How a top-level condition combines with the conditions before it
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConditionType {
    #[default]
    And,
    Or,
    None,
}

/// A front-end filter condition as received on the wire
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FilterCondition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,

    #[serde(default, rename = "type")]
    pub condition_type: ConditionType,

    /// Kept as text until it has been checked against the whitelist
    pub operator: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub arguments: Vec<Value>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<FilterCondition>,
}

impl FilterCondition {
    /// Leaf condition on a field
    pub fn new(field: &str, operator: &str, arguments: Vec<Value>) -> Self {
        Self {
            field: Some(field.to_string()),
            operator: operator.to_string(),
            arguments,
            ..Default::default()
        }
    }

    /// `andX` / `orX` over nested conditions
    pub fn group(operator: &str, conditions: Vec<FilterCondition>) -> Self {
        Self {
            operator: operator.to_string(),
            conditions,
            ..Default::default()
        }
    }

    pub fn with_type(mut self, condition_type: ConditionType) -> Self {
        self.condition_type = condition_type;
        self
    }
}

/// Operand of a predicate
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Operand {
    /// Named parameter, written `:name` by backends
    Param(String),
    /// Trusted configuration text such as `t.id` or `:userId`
    Fragment(String),
    /// Nested expression
    Expr(Box<Expr>),
}

/// Verified filter expression
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Expr {
    /// Trusted configuration text, passed to the backend untouched
    Fragment { text: String },
    /// `field <operator> arguments`
    Predicate {
        field: String,
        operator: Operator,
        arguments: Vec<Operand>,
    },
    And { items: Vec<Expr> },
    Or { items: Vec<Expr> },
}

impl Expr {
    pub fn fragment(text: impl Into<String>) -> Self {
        Expr::Fragment { text: text.into() }
    }

    pub fn and(self, other: Expr) -> Expr {
        match self {
            Expr::And { mut items } => {
                items.push(other);
                Expr::And { items }
            }
            first => Expr::And {
                items: vec![first, other],
            },
        }
    }

    pub fn or(self, other: Expr) -> Expr {
        match self {
            Expr::Or { mut items } => {
                items.push(other);
                Expr::Or { items }
            }
            first => Expr::Or {
                items: vec![first, other],
            },
        }
    }

    /// Combine an optional accumulator with a new expression
    pub fn combine(acc: Option<Expr>, next: Expr, condition_type: ConditionType) -> Expr {
        match (acc, condition_type) {
            (None, _) => next,
            (Some(acc), ConditionType::Or) => acc.or(next),
            (Some(acc), _) => acc.and(next),
        }
    }

    /// Names of every parameter referenced by this expression
    pub fn parameter_names(&self) -> Vec<&str> {
        let mut names = Vec::new();
        self.collect_params(&mut names);
        names
    }

    fn collect_params<'a>(&'a self, names: &mut Vec<&'a str>) {
        match self {
            Expr::Fragment { .. } => {}
            Expr::Predicate { arguments, .. } => {
                for operand in arguments {
                    match operand {
                        Operand::Param(name) => names.push(name),
                        Operand::Expr(inner) => inner.collect_params(names),
                        Operand::Fragment(_) => {}
                    }
                }
            }
            Expr::And { items } | Expr::Or { items } => {
                for item in items {
                    item.collect_params(names);
                }
            }
        }
    }
}

/// Condition that passed the structural checks
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedCondition {
    Leaf {
        condition_type: ConditionType,
        field: String,
        operator: Operator,
        arguments: Vec<ParsedArgument>,
    },
    Group {
        condition_type: ConditionType,
        operator: Operator,
        conditions: Vec<ParsedCondition>,
    },
}

impl ParsedCondition {
    fn condition_type(&self) -> ConditionType {
        match self {
            ParsedCondition::Leaf { condition_type, .. }
            | ParsedCondition::Group { condition_type, .. } => *condition_type,
        }
    }

    /// Number of leaf conditions in this subtree
    pub fn leaf_count(&self) -> usize {
        match self {
            ParsedCondition::Leaf { arguments, .. } => {
                1 + arguments
                    .iter()
                    .map(|a| match a {
                        ParsedArgument::Nested(inner) => inner.leaf_count(),
                        ParsedArgument::Literal(_) => 0,
                    })
                    .sum::<usize>()
            }
            ParsedCondition::Group { conditions, .. } => {
                conditions.iter().map(ParsedCondition::leaf_count).sum()
            }
        }
    }
}

/// Argument of a parsed leaf
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedArgument {
    Literal(Value),
    Nested(Box<ParsedCondition>),
}

/// Builds verified expressions from front-end conditions
///
/// One builder is used per compiled query so that generated parameter
/// names stay unique across the `where` and `having` clauses.
pub struct FilterExpressionBuilder<'a> {
    evaluator: PermissionEvaluator<'a>,
    next_param: usize,
    parameters: IndexMap<String, Value>,
}

impl<'a> FilterExpressionBuilder<'a> {
    pub fn new(evaluator: PermissionEvaluator<'a>) -> Self {
        Self {
            evaluator,
            next_param: 0,
            parameters: IndexMap::new(),
        }
    }

    /// Pass 1: structural checks over the whole tree
    pub fn parse(conditions: &[FilterCondition]) -> GateResult<Vec<ParsedCondition>> {
        conditions.iter().map(Self::parse_condition).collect()
    }

    fn parse_condition(condition: &FilterCondition) -> GateResult<ParsedCondition> {
        let operator: Operator = condition.operator.parse()?;

        if operator.is_combinator() {
            if condition.conditions.is_empty() {
                return Err(RequestError::InvalidArguments {
                    operator: operator.to_string(),
                    expected: "at least 1 nested condition".to_string(),
                    actual: 0,
                }
                .into());
            }
            return Ok(ParsedCondition::Group {
                condition_type: condition.condition_type,
                operator,
                conditions: Self::parse(&condition.conditions)?,
            });
        }

        let field = condition.field.clone().unwrap_or_default();
        verify_field_format(&field)?;

        operator
            .check_arity(condition.arguments.len())
            .map_err(|expected| RequestError::InvalidArguments {
                operator: operator.to_string(),
                expected: expected.to_string(),
                actual: condition.arguments.len(),
            })?;

        let arguments = condition
            .arguments
            .iter()
            .map(|argument| -> GateResult<ParsedArgument> {
                match argument {
                    Value::Object(map) if map.contains_key("operator") => {
                        let nested: FilterCondition = serde_json::from_value(argument.clone())
                            .map_err(|e| RequestError::InvalidParams {
                                message: e.to_string(),
                            })?;
                        Ok(ParsedArgument::Nested(Box::new(Self::parse_condition(&nested)?)))
                    }
                    literal => Ok(ParsedArgument::Literal(literal.clone())),
                }
            })
            .collect::<GateResult<Vec<_>>>()?;

        Ok(ParsedCondition::Leaf {
            condition_type: condition.condition_type,
            field,
            operator,
            arguments,
        })
    }

    /// Pass 2: authorize each leaf and build the expression
    ///
    /// Top-level conditions combine by their `type`. Returns `None` when
    /// there is nothing to add.
    pub fn build(
        &mut self,
        parsed: &[ParsedCondition],
        permissions: &PermissionNode,
        ctx: &ResolveContext,
    ) -> GateResult<Option<Expr>> {
        let mut acc: Option<Expr> = None;
        for condition in parsed {
            let expr = self.build_condition(condition, permissions, ctx)?;
            acc = Some(Expr::combine(acc, expr, condition.condition_type()));
        }
        Ok(acc)
    }

    fn build_condition(
        &mut self,
        condition: &ParsedCondition,
        permissions: &PermissionNode,
        ctx: &ResolveContext,
    ) -> GateResult<Expr> {
        match condition {
            ParsedCondition::Group {
                operator,
                conditions,
                ..
            } => {
                let items = conditions
                    .iter()
                    .map(|c| self.build_condition(c, permissions, ctx))
                    .collect::<GateResult<Vec<_>>>()?;
                Ok(match operator {
                    Operator::OrX => Expr::Or { items },
                    _ => Expr::And { items },
                })
            }
            ParsedCondition::Leaf {
                field,
                operator,
                arguments,
                ..
            } => {
                let literals: Vec<Value> = arguments
                    .iter()
                    .filter_map(|a| match a {
                        ParsedArgument::Literal(v) => Some(v.clone()),
                        ParsedArgument::Nested(_) => None,
                    })
                    .collect();

                let check_ctx = ctx
                    .with_extra("field", Value::String(field.clone()))
                    .with_extra("operator", Value::String(operator.to_string()));
                let field_layer = permissions.field(field).map(|f| f as &dyn PermissionLayer);
                let verdict = self.evaluator.permissive_permission_check(
                    permissions,
                    field_layer,
                    Bucket::Operators,
                    operator.as_str(),
                    Value::Array(literals),
                    &check_ctx,
                )?;

                if verdict.vetoed {
                    warn!(field = %field, operator = %operator, "filter value vetoed by closure");
                    return Err(PermissionError::ClosureVeto {
                        field: field.clone(),
                    }
                    .into());
                }
                if !verdict.allowed {
                    warn!(field = %field, operator = %operator, "filter operator denied");
                    return Err(PermissionError::OperatorNotAllowed {
                        field: field.clone(),
                        operator: operator.to_string(),
                    }
                    .into());
                }

                let mut mutated = match verdict.value {
                    Value::Array(items) => items.into_iter(),
                    single => vec![single].into_iter(),
                };

                let mut operands = Vec::new();
                if matches!(operator, Operator::In | Operator::NotIn) {
                    let list: Vec<Value> = mutated
                        .flat_map(|v| match v {
                            Value::Array(items) => items,
                            other => vec![other],
                        })
                        .collect();
                    operands.push(self.bind(Value::Array(list)));
                    for argument in arguments {
                        if let ParsedArgument::Nested(inner) = argument {
                            let expr = self.build_condition(inner, permissions, ctx)?;
                            operands.push(Operand::Expr(Box::new(expr)));
                        }
                    }
                } else {
                    for argument in arguments {
                        match argument {
                            ParsedArgument::Literal(original) => {
                                let value = mutated.next().unwrap_or_else(|| original.clone());
                                operands.push(self.bind(value));
                            }
                            ParsedArgument::Nested(inner) => {
                                let expr = self.build_condition(inner, permissions, ctx)?;
                                operands.push(Operand::Expr(Box::new(expr)));
                            }
                        }
                    }
                }

                Ok(Expr::Predicate {
                    field: field.clone(),
                    operator: *operator,
                    arguments: operands,
                })
            }
        }
    }

    fn bind(&mut self, value: Value) -> Operand {
        let name = format!("{}{}", GENERATED_PARAM_PREFIX, self.next_param);
        self.next_param += 1;
        self.parameters.insert(name.clone(), value);
        Operand::Param(name)
    }

    /// Parameters generated so far
    pub fn parameters(&self) -> &IndexMap<String, Value> {
        &self.parameters
    }

    pub fn into_parameters(self) -> IndexMap<String, Value> {
        self.parameters
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::resolver::ConfigResolver;
    use serde_json::json;

    fn permissions(yaml: &str) -> PermissionNode {
        serde_yaml::from_str(yaml).unwrap()
    }

    fn build(
        conditions: Vec<FilterCondition>,
        perms: &PermissionNode,
    ) -> GateResult<(Option<Expr>, IndexMap<String, Value>)> {
        let resolver = ConfigResolver::default();
        let mut builder = FilterExpressionBuilder::new(PermissionEvaluator::new(&resolver));
        let parsed = FilterExpressionBuilder::parse(&conditions)?;
        let expr = builder.build(&parsed, perms, &ResolveContext::default())?;
        Ok((expr, builder.into_parameters()))
    }

    // --- parse ---

    #[test]
    fn test_operator_whitelist() {
        assert_eq!("notIn".parse::<Operator>().unwrap(), Operator::NotIn);
        let err = "orWhere".parse::<Operator>().unwrap_err();
        assert!(matches!(err, RequestError::UnsafeOperator { ref operator } if operator == "orWhere"));
    }

    #[test]
    fn test_field_format() {
        assert!(is_valid_field("t.name"));
        assert!(is_valid_field("a1.created_at"));
        assert!(!is_valid_field("name"));
        assert!(!is_valid_field("t.name; DROP"));
        assert!(!is_valid_field("t.a.b"));
    }

    #[test]
    fn test_arity_checked() {
        let err = FilterExpressionBuilder::parse(&[FilterCondition::new(
            "t.age",
            "between",
            vec![json!(1)],
        )])
        .unwrap_err();
        assert!(matches!(
            err,
            crate::core::error::GateError::Request(RequestError::InvalidArguments { .. })
        ));
    }

    #[test]
    fn test_nested_malformed_field_rejected_in_first_pass() {
        let conditions = vec![FilterCondition::group(
            "orX",
            vec![
                FilterCondition::new("t.name", "eq", vec![json!("a")]),
                FilterCondition::new("bad", "eq", vec![json!("b")]),
            ],
        )];
        let err = FilterExpressionBuilder::parse(&conditions).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Fields must be passed as [table alias].[field name]. field = bad"
        );
    }

    // --- build ---

    #[test]
    fn test_literals_are_bound_as_parameters() {
        let perms = permissions("permissive: true");
        let (expr, params) = build(
            vec![FilterCondition::new("t.name", "eq", vec![json!("Bob'; --")])],
            &perms,
        )
        .unwrap();
        assert_eq!(
            expr.unwrap(),
            Expr::Predicate {
                field: "t.name".to_string(),
                operator: Operator::Eq,
                arguments: vec![Operand::Param("frontEndParam0".to_string())],
            }
        );
        assert_eq!(params["frontEndParam0"], json!("Bob'; --"));
    }

    #[test]
    fn test_denied_operator_reports_field_and_operator() {
        let perms = permissions("permissive: false\nfields:\n  t.name:\n    operators: {eq: true}\n");
        let err = build(
            vec![FilterCondition::new("t.name", "like", vec![json!("%b%")])],
            &perms,
        )
        .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Operator not allowed. field = t.name, operator = like"
        );
    }

    #[test]
    fn test_in_binds_single_list() {
        let perms = permissions("permissive: true");
        let (_, params) = build(
            vec![FilterCondition::new("t.id", "in", vec![json!([1, 2, 3])])],
            &perms,
        )
        .unwrap();
        assert_eq!(params.len(), 1);
        assert_eq!(params["frontEndParam0"], json!([1, 2, 3]));
    }

    #[test]
    fn test_top_level_or_type() {
        let perms = permissions("permissive: true");
        let (expr, _) = build(
            vec![
                FilterCondition::new("t.a", "eq", vec![json!(1)]),
                FilterCondition::new("t.b", "eq", vec![json!(2)]).with_type(ConditionType::Or),
            ],
            &perms,
        )
        .unwrap();
        assert!(matches!(expr, Some(Expr::Or { ref items }) if items.len() == 2));
    }

    #[test]
    fn test_mutated_arguments_are_bound() {
        let perms = permissions(
            r#"
permissive: true
fields:
  t.name:
    settings:
      mutate: ["fixed"]
"#,
        );
        let (_, params) = build(
            vec![FilterCondition::new("t.name", "eq", vec![json!("anything")])],
            &perms,
        )
        .unwrap();
        assert_eq!(params["frontEndParam0"], json!("fixed"));
    }
}
