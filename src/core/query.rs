//! Read query compilation
//!
//! [`QueryCompiler`] turns the trusted base configuration of an entity plus
//! untrusted [`FrontEndOptions`] into a [`QuerySpec`]. Parts are assembled
//! in a fixed order:
//!
//! ```text
//! select → from/joins → base where → base having/orderBy/groupBy → caching
//!   → placeholders → front-end where → front-end having → front-end orderBy
//!   → front-end groupBy → limit/offset → result shaping
//! ```
//!
//! Every front-end condition is structurally checked before any permission
//! is evaluated, and the front-end filter is always AND-ed with the base
//! filter so untrusted input can only narrow what configuration exposes.

use crate::config::{
    CallOptions, ConditionConfig, EntityConfig, PlaceholderConfig, QueryPart, ReadPermissions,
};
use crate::core::error::{ConfigError, GateResult, LimitError, PermissionError, RequestError};
use crate::core::filter::{
    ConditionType, Expr, FilterCondition, FilterExpressionBuilder, GENERATED_PARAM_PREFIX, Operand,
    Operator, ParsedCondition, verify_field_format,
};
use crate::core::permission::{Bucket, PermissionEvaluator, PermissionLayer};
use crate::core::resolver::{ConfigResolver, ResolveContext};
use crate::core::value::ConfigValue;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use tracing::{debug, warn};

pub const DEFAULT_LIMIT: u64 = 25;
pub const DEFAULT_MAX_LIMIT: u64 = 100;
pub const DEFAULT_OFFSET: u64 = 1;

/// Prefix of parameters generated for base-config literals
const CONFIG_PARAM_PREFIX: &str = "configParam";

/// Generated parameter names are never available to placeholders
fn is_generated_param(name: &str) -> bool {
    name.starts_with(CONFIG_PARAM_PREFIX) || name.starts_with(GENERATED_PARAM_PREFIX)
}

// =============================================================================
// Front-end wire types
// =============================================================================

/// Untrusted query options sent by the front end
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FrontEndOptions {
    #[serde(default)]
    pub query: FrontEndQuery,
    #[serde(default)]
    pub options: RequestOptions,
}

/// `frontEndOptions.query`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrontEndQuery {
    #[serde(default, rename = "where", skip_serializing_if = "Vec::is_empty")]
    pub where_clause: Vec<FilterCondition>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub having: Vec<FilterCondition>,

    /// field → `ASC` / `DESC`
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub order_by: IndexMap<String, String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub group_by: Vec<String>,

    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub placeholders: IndexMap<String, FrontEndPlaceholder>,
}

/// A placeholder value supplied by the front end, always a literal
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FrontEndPlaceholder {
    #[serde(default)]
    pub value: Value,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub param_type: Option<String>,
}

/// `frontEndOptions.options`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub return_count: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
    /// 1-based position of the first row
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub use_get_params: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub simplified_params: Option<bool>,
}

impl FrontEndOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_where(mut self, condition: FilterCondition) -> Self {
        self.query.where_clause.push(condition);
        self
    }

    pub fn with_having(mut self, condition: FilterCondition) -> Self {
        self.query.having.push(condition);
        self
    }

    pub fn with_order_by(mut self, field: &str, direction: &str) -> Self {
        self.query
            .order_by
            .insert(field.to_string(), direction.to_string());
        self
    }

    pub fn with_group_by(mut self, field: &str) -> Self {
        self.query.group_by.push(field.to_string());
        self
    }

    pub fn with_placeholder(mut self, name: &str, value: Value) -> Self {
        self.query.placeholders.insert(
            name.to_string(),
            FrontEndPlaceholder {
                value,
                param_type: None,
            },
        );
        self
    }

    pub fn with_limit(mut self, limit: u64) -> Self {
        self.options.limit = Some(limit);
        self
    }

    pub fn with_offset(mut self, offset: u64) -> Self {
        self.options.offset = Some(offset);
        self
    }

    pub fn with_return_count(mut self, return_count: bool) -> Self {
        self.options.return_count = Some(return_count);
        self
    }

    pub fn simplified(&self) -> bool {
        self.options.simplified_params.unwrap_or(false)
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

// =============================================================================
// Compiled query
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    Asc,
    Desc,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Asc => "ASC",
            Direction::Desc => "DESC",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Direction {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "ASC" => Ok(Direction::Asc),
            "DESC" => Ok(Direction::Desc),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FromClause {
    pub entity: String,
    pub alias: String,
    pub index_by: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JoinClause {
    pub kind: crate::config::JoinKind,
    pub target: String,
    pub alias: String,
    pub condition_type: Option<String>,
    pub condition: Option<String>,
    pub index_by: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderClause {
    pub field: String,
    pub direction: Direction,
}

/// A bound query parameter
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Parameter {
    pub value: Value,
    pub param_type: Option<String>,
}

/// Resolved caching directives
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheSettings {
    pub enabled: bool,
    pub use_query_cache: bool,
    pub use_result_cache: bool,
    pub time_to_live: Option<u64>,
    pub cache_id: Option<String>,
    pub query_cache_driver: Option<String>,
    pub result_cache_driver: Option<String>,
}

/// How the result should be produced
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ResultShaping {
    pub paginate: bool,
    pub fetch_join: bool,
    pub hydrate: bool,
    pub return_count: bool,
}

impl Default for ResultShaping {
    fn default() -> Self {
        Self {
            paginate: false,
            fetch_join: true,
            hydrate: true,
            return_count: true,
        }
    }
}

/// A verified, executable query description
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QuerySpec {
    pub entity_type: String,
    pub select: Vec<String>,
    pub from: Vec<FromClause>,
    pub joins: Vec<JoinClause>,
    pub where_clause: Option<Expr>,
    pub having: Option<Expr>,
    pub order_by: Vec<OrderClause>,
    pub group_by: Vec<String>,
    pub parameters: IndexMap<String, Parameter>,
    pub cache: CacheSettings,
    pub limit: u64,
    /// 1-based position of the first row
    pub offset: u64,
    pub shaping: ResultShaping,
}

impl QuerySpec {
    pub fn new(entity_type: &str) -> Self {
        Self {
            entity_type: entity_type.to_string(),
            select: Vec::new(),
            from: Vec::new(),
            joins: Vec::new(),
            where_clause: None,
            having: None,
            order_by: Vec::new(),
            group_by: Vec::new(),
            parameters: IndexMap::new(),
            cache: CacheSettings::default(),
            limit: DEFAULT_LIMIT,
            offset: DEFAULT_OFFSET,
            shaping: ResultShaping::default(),
        }
    }

    /// Alias of the root entity
    pub fn root_alias(&self) -> &str {
        self.from.first().map(|f| f.alias.as_str()).unwrap_or("t")
    }

    pub fn and_where(&mut self, expr: Expr) -> &mut Self {
        self.where_clause = Some(match self.where_clause.take() {
            Some(current) => current.and(expr),
            None => expr,
        });
        self
    }

    pub fn and_having(&mut self, expr: Expr) -> &mut Self {
        self.having = Some(match self.having.take() {
            Some(current) => current.and(expr),
            None => expr,
        });
        self
    }

    pub fn add_order_by(&mut self, field: &str, direction: Direction) -> &mut Self {
        self.order_by.push(OrderClause {
            field: field.to_string(),
            direction,
        });
        self
    }

    pub fn set_parameter(&mut self, name: &str, value: Value, param_type: Option<String>) -> &mut Self {
        self.parameters
            .insert(name.to_string(), Parameter { value, param_type });
        self
    }

    /// Look up a bound parameter value
    pub fn parameter(&self, name: &str) -> Option<&Value> {
        self.parameters.get(name).map(|p| &p.value)
    }
}

/// Pagination metadata derived from a limit, a 1-based offset and a count
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PaginationMeta {
    pub offset: u64,
    pub limit: u64,
    pub total: u64,
    pub has_next: bool,
    pub has_prev: bool,
}

impl PaginationMeta {
    pub fn new(offset: u64, limit: u64, total: u64) -> Self {
        let start = offset.saturating_sub(1);
        Self {
            offset,
            limit,
            total,
            has_next: start.saturating_add(limit) < total,
            has_prev: start > 0,
        }
    }
}

// =============================================================================
// Compiler
// =============================================================================

/// Lifecycle of a read call, reported through tracing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadPhase {
    Idle,
    Resolving,
    PermissionChecking,
    Assembling,
    Executing,
    ReturnUnexecuted,
    Done,
    Failed,
}

impl ReadPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReadPhase::Idle => "idle",
            ReadPhase::Resolving => "resolving",
            ReadPhase::PermissionChecking => "permission_checking",
            ReadPhase::Assembling => "assembling",
            ReadPhase::Executing => "executing",
            ReadPhase::ReturnUnexecuted => "return_unexecuted",
            ReadPhase::Done => "done",
            ReadPhase::Failed => "failed",
        }
    }
}

pub(crate) fn enter_phase(entity_type: &str, phase: ReadPhase) {
    debug!(entity_type, phase = phase.as_str(), "read phase");
}

/// Everything a compilation needs, borrowed for one call
pub struct ReadRequest<'r> {
    pub entity_type: &'r str,
    pub config: &'r EntityConfig,
    pub front_end: &'r FrontEndOptions,
    pub overrides: &'r CallOptions,
    pub ctx: &'r ResolveContext,
}

impl ReadRequest<'_> {
    /// Layers for a scalar setting: overrides, then entity options
    fn layers<'a>(&'a self, key: &str) -> [Option<&'a ConfigValue>; 2] {
        [self.overrides.get(key), self.config.read.options.get(key)]
    }

    /// Configured permissions with the call-time overrides merged in
    pub fn effective_permissions(&self) -> ReadPermissions {
        let mut permissions = self.config.read.permissions.clone();
        if let Some(overrides) = &self.overrides.permissions {
            permissions.merge(overrides);
        }
        permissions
    }
}

/// Compiles read requests into [`QuerySpec`]s
#[derive(Debug, Clone, Copy)]
pub struct QueryCompiler<'a> {
    resolver: &'a ConfigResolver,
}

impl<'a> QueryCompiler<'a> {
    pub fn new(resolver: &'a ConfigResolver) -> Self {
        Self { resolver }
    }

    pub fn compile(&self, request: &ReadRequest<'_>) -> GateResult<QuerySpec> {
        let ctx = request.ctx;
        let query = &request.front_end.query;

        enter_phase(request.entity_type, ReadPhase::Resolving);
        let permissions = request.effective_permissions();

        // Structural checks over all front-end input before any permission runs
        let parsed_where = FilterExpressionBuilder::parse(&query.where_clause)?;
        let parsed_having = FilterExpressionBuilder::parse(&query.having)?;
        let mut orders = Vec::with_capacity(query.order_by.len());
        for (field, direction) in &query.order_by {
            verify_field_format(field)?;
            let parsed = direction.parse::<Direction>().map_err(|_| {
                RequestError::InvalidDirection {
                    field: field.clone(),
                    direction: direction.clone(),
                }
            })?;
            orders.push((field.as_str(), parsed));
        }
        for field in &query.group_by {
            verify_field_format(field)?;
        }
        self.check_param_count(request, &parsed_where, &parsed_having)?;

        let mut spec = QuerySpec::new(request.entity_type);
        let mut config_params = 0usize;

        self.add_select(request, &mut spec)?;
        self.add_from_and_joins(request, &mut spec)?;

        let base = &request.config.read.query;
        if let Some(expr) = self.base_conditions(&base.where_clause, ctx, &mut spec, &mut config_params)? {
            spec.where_clause = Some(expr);
        }
        if let Some(expr) = self.base_conditions(&base.having, ctx, &mut spec, &mut config_params)? {
            spec.having = Some(expr);
        }
        for (key, order) in &base.order_by {
            let sort = self.required_string(&order.sort, ctx, &format!("query.orderBy.{}.sort", key))?;
            let raw = self.required_string(&order.order, ctx, &format!("query.orderBy.{}.order", key))?;
            let direction = raw.parse::<Direction>().map_err(|_| ConfigError::InvalidValue {
                path: format!("query.orderBy.{}.order", key),
                message: format!("'{}' is not ASC or DESC", raw),
            })?;
            spec.add_order_by(&sort, direction);
        }
        for (key, group) in &base.group_by {
            let field = self.required_string(group, ctx, &format!("query.groupBy.{}", key))?;
            spec.group_by.push(field);
        }

        self.apply_caching(request, &mut spec)?;

        enter_phase(request.entity_type, ReadPhase::PermissionChecking);
        self.add_placeholders(request, &permissions, &mut spec)?;

        let evaluator = PermissionEvaluator::new(self.resolver);
        let mut builder = FilterExpressionBuilder::new(evaluator);
        if let Some(expr) = builder.build(&parsed_where, &permissions.where_clause, ctx)? {
            spec.and_where(expr);
        }
        if let Some(expr) = builder.build(&parsed_having, &permissions.having, ctx)? {
            spec.and_having(expr);
        }
        for (name, value) in builder.into_parameters() {
            spec.set_parameter(&name, value, None);
        }

        for (field, direction) in orders {
            let direction = self.authorize_order_by(&permissions, field, direction, ctx)?;
            spec.add_order_by(field, direction);
        }
        for field in &query.group_by {
            self.authorize_group_by(&permissions, field, ctx)?;
            spec.group_by.push(field.clone());
        }

        enter_phase(request.entity_type, ReadPhase::Assembling);
        self.apply_limit_and_offset(request, &permissions, &mut spec)?;
        self.apply_shaping(request, &mut spec)?;

        debug!(
            entity_type = request.entity_type,
            parameters = spec.parameters.len(),
            limit = spec.limit,
            offset = spec.offset,
            "query compiled"
        );
        Ok(spec)
    }

    fn check_param_count(
        &self,
        request: &ReadRequest<'_>,
        parsed_where: &[ParsedCondition],
        parsed_having: &[ParsedCondition],
    ) -> GateResult<()> {
        let max = self
            .resolver
            .find_u64(&request.layers("queryMaxParams"), request.ctx, "queryMaxParams")?;
        let Some(max) = max else {
            return Ok(());
        };
        let count = parsed_where
            .iter()
            .chain(parsed_having)
            .map(ParsedCondition::leaf_count)
            .sum::<usize>()
            + request.front_end.query.placeholders.len();
        if count as u64 > max {
            return Err(LimitError::TooManyParams { count, max }.into());
        }
        Ok(())
    }

    fn required_string(&self, value: &ConfigValue, ctx: &ResolveContext, path: &str) -> GateResult<String> {
        self.resolver
            .resolve_string(Some(value), ctx, path)?
            .ok_or_else(|| {
                ConfigError::InvalidValue {
                    path: path.to_string(),
                    message: "value resolved to null".to_string(),
                }
                .into()
            })
    }

    fn optional_string(
        &self,
        value: Option<&ConfigValue>,
        ctx: &ResolveContext,
        path: &str,
    ) -> GateResult<Option<String>> {
        self.resolver.resolve_string(value, ctx, path)
    }

    fn add_select(&self, request: &ReadRequest<'_>, spec: &mut QuerySpec) -> GateResult<()> {
        for (key, part) in &request.config.read.query.select {
            let select = self.required_string(part, request.ctx, &format!("query.select.{}", key))?;
            spec.select.push(select);
        }
        if spec.select.is_empty() {
            spec.select.push(request.config.alias.clone());
        }
        Ok(())
    }

    fn add_from_and_joins(&self, request: &ReadRequest<'_>, spec: &mut QuerySpec) -> GateResult<()> {
        let ctx = request.ctx;
        let query = &request.config.read.query;

        for (key, from) in &query.from {
            spec.from.push(FromClause {
                entity: self.required_string(&from.entity, ctx, &format!("query.from.{}.entity", key))?,
                alias: self.required_string(&from.alias, ctx, &format!("query.from.{}.alias", key))?,
                index_by: self.optional_string(from.index_by.as_ref(), ctx, "indexBy")?,
            });
        }
        if spec.from.is_empty() {
            spec.from.push(FromClause {
                entity: request.entity_type.to_string(),
                alias: request.config.alias.clone(),
                index_by: None,
            });
        }

        for (key, join) in &query.joins {
            spec.joins.push(JoinClause {
                kind: join.kind,
                target: self.required_string(&join.target, ctx, &format!("query.joins.{}.target", key))?,
                alias: self.required_string(&join.join_alias, ctx, &format!("query.joins.{}.joinAlias", key))?,
                condition_type: self.optional_string(join.condition_type.as_ref(), ctx, "conditionType")?,
                condition: self.optional_string(join.condition.as_ref(), ctx, "condition")?,
                index_by: self.optional_string(join.index_by.as_ref(), ctx, "indexBy")?,
            });
        }
        Ok(())
    }

    fn base_conditions(
        &self,
        entries: &IndexMap<String, ConditionConfig>,
        ctx: &ResolveContext,
        spec: &mut QuerySpec,
        counter: &mut usize,
    ) -> GateResult<Option<Expr>> {
        let mut acc: Option<Expr> = None;
        for entry in entries.values() {
            let expr = self.part_to_expr(&entry.value, ctx, spec, counter)?;
            acc = match entry.condition_type {
                // An untyped entry replaces what came before it
                ConditionType::None => Some(expr),
                other => Some(Expr::combine(acc, expr, other)),
            };
        }
        Ok(acc)
    }

    fn part_to_expr(
        &self,
        part: &QueryPart,
        ctx: &ResolveContext,
        spec: &mut QuerySpec,
        counter: &mut usize,
    ) -> GateResult<Expr> {
        match part {
            QueryPart::Value(value) => {
                let text = self.required_string(value, ctx, "query condition")?;
                Ok(Expr::fragment(text))
            }
            QueryPart::Expression { expr, arguments } => {
                let operator: Operator = expr.parse()?;
                if operator.is_combinator() {
                    let items = arguments
                        .iter()
                        .map(|a| self.part_to_expr(a, ctx, spec, counter))
                        .collect::<GateResult<Vec<_>>>()?;
                    return Ok(match operator {
                        Operator::OrX => Expr::Or { items },
                        _ => Expr::And { items },
                    });
                }

                let mut arguments = arguments.iter();
                let field = match arguments.next() {
                    Some(QueryPart::Value(value)) => self.required_string(value, ctx, "query condition field")?,
                    _ => {
                        return Err(ConfigError::InvalidValue {
                            path: format!("query condition '{}'", expr),
                            message: "first argument must be a field".to_string(),
                        }
                        .into());
                    }
                };
                let operands = arguments
                    .map(|a| self.part_to_operand(a, ctx, spec, counter))
                    .collect::<GateResult<Vec<_>>>()?;
                Ok(Expr::Predicate {
                    field,
                    operator,
                    arguments: operands,
                })
            }
        }
    }

    fn part_to_operand(
        &self,
        part: &QueryPart,
        ctx: &ResolveContext,
        spec: &mut QuerySpec,
        counter: &mut usize,
    ) -> GateResult<Operand> {
        match part {
            QueryPart::Expression { .. } => Ok(Operand::Expr(Box::new(
                self.part_to_expr(part, ctx, spec, counter)?,
            ))),
            QueryPart::Value(value) => match self.resolver.resolve(value, ctx)? {
                Value::String(text) => Ok(Operand::Fragment(text)),
                literal => {
                    let name = format!("{}{}", CONFIG_PARAM_PREFIX, counter);
                    *counter += 1;
                    spec.set_parameter(&name, literal, None);
                    Ok(Operand::Param(name))
                }
            },
        }
    }

    fn apply_caching(&self, request: &ReadRequest<'_>, spec: &mut QuerySpec) -> GateResult<()> {
        let ctx = request.ctx;
        let allowed = self
            .resolver
            .find_bool(&request.layers("allowCache"), ctx, "allowCache")?
            .unwrap_or(true);
        if !allowed {
            spec.cache = CacheSettings::default();
            return Ok(());
        }

        let cache = &request.config.read.settings.cache;
        let layers = |key: &str| {
            let [overrides, options] = request.layers(key);
            [overrides, options, cache.get(key)]
        };
        spec.cache = CacheSettings {
            enabled: true,
            use_query_cache: self
                .resolver
                .find_bool(&layers("useQueryCache"), ctx, "useQueryCache")?
                .unwrap_or(true),
            use_result_cache: self
                .resolver
                .find_bool(&layers("useResultCache"), ctx, "useResultCache")?
                .unwrap_or(true),
            time_to_live: self
                .resolver
                .find_u64(&layers("timeToLive"), ctx, "timeToLive")?,
            cache_id: self
                .resolver
                .find_setting(&layers("cacheId"), ctx)?
                .map(|v| v.as_str().map(str::to_string).unwrap_or_else(|| v.to_string())),
            query_cache_driver: self
                .resolver
                .find_setting(&layers("queryCacheDriver"), ctx)?
                .and_then(|v| v.as_str().map(str::to_string)),
            result_cache_driver: self
                .resolver
                .find_setting(&layers("resultCacheDriver"), ctx)?
                .and_then(|v| v.as_str().map(str::to_string)),
        };
        Ok(())
    }

    /// Merge placeholders: config < options < overrides < front end
    fn add_placeholders(
        &self,
        request: &ReadRequest<'_>,
        permissions: &ReadPermissions,
        spec: &mut QuerySpec,
    ) -> GateResult<()> {
        let ctx = request.ctx;

        let mut back_end: IndexMap<String, PlaceholderConfig> =
            request.config.read.settings.placeholders.clone();
        if let Some(raw) = request.config.read.options.get("placeholders") {
            let from_options: IndexMap<String, PlaceholderConfig> =
                serde_json::from_value(raw.clone().into_value()).map_err(|e| ConfigError::InvalidValue {
                    path: "read.options.placeholders".to_string(),
                    message: e.to_string(),
                })?;
            back_end.extend(from_options);
        }
        back_end.extend(
            request
                .overrides
                .placeholders
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );

        for (name, placeholder) in &back_end {
            if is_generated_param(name) {
                return Err(ConfigError::InvalidValue {
                    path: format!("read.settings.placeholders.{}", name),
                    message: "name is reserved for generated parameters".to_string(),
                }
                .into());
            }
            let value = self.resolver.resolve(&placeholder.value, ctx)?;
            let param_type = self.optional_string(placeholder.param_type.as_ref(), ctx, "placeholder type")?;
            spec.set_parameter(name, value, param_type);
        }

        let evaluator = PermissionEvaluator::new(self.resolver);
        let node = &permissions.placeholders;
        for (name, placeholder) in &request.front_end.query.placeholders {
            if is_generated_param(name) {
                warn!(placeholder = %name, "front-end placeholder shadows a generated parameter");
                return Err(PermissionError::PlaceholderNotAllowed { name: name.clone() }.into());
            }
            let field = node.placeholder_names.get(name);
            let check_ctx = ctx.with_extra("placeholder", Value::String(name.clone()));
            let allowed = evaluator.permissive_allowed_check(
                node,
                field.and_then(|f| f.allowed.as_ref()),
                &check_ctx,
            )?;
            if !allowed {
                warn!(placeholder = %name, "front-end placeholder denied");
                return Err(PermissionError::PlaceholderNotAllowed { name: name.clone() }.into());
            }
            let (value, vetoed) = evaluator.apply_hooks(
                node,
                field.map(|f| f as &dyn PermissionLayer),
                placeholder.value.clone(),
                &check_ctx,
            )?;
            if vetoed {
                return Err(PermissionError::ClosureVeto { field: name.clone() }.into());
            }
            spec.set_parameter(name, value, placeholder.param_type.clone());
        }
        Ok(())
    }

    fn authorize_order_by(
        &self,
        permissions: &ReadPermissions,
        field: &str,
        direction: Direction,
        ctx: &ResolveContext,
    ) -> GateResult<Direction> {
        let evaluator = PermissionEvaluator::new(self.resolver);
        let node = &permissions.order_by;
        let check_ctx = ctx.with_extra("field", Value::String(field.to_string()));
        let verdict = evaluator.permissive_permission_check(
            node,
            node.field(field).map(|f| f as &dyn PermissionLayer),
            Bucket::Directions,
            direction.as_str(),
            Value::String(direction.as_str().to_string()),
            &check_ctx,
        )?;
        if verdict.vetoed {
            return Err(PermissionError::ClosureVeto {
                field: field.to_string(),
            }
            .into());
        }
        if !verdict.allowed {
            warn!(field, direction = direction.as_str(), "order by denied");
            return Err(PermissionError::OrderByNotAllowed {
                field: field.to_string(),
                direction: direction.to_string(),
            }
            .into());
        }
        let mutated = verdict.value.as_str().unwrap_or(direction.as_str()).to_string();
        mutated.parse::<Direction>().map_err(|_| {
            RequestError::InvalidDirection {
                field: field.to_string(),
                direction: mutated.clone(),
            }
            .into()
        })
    }

    fn authorize_group_by(
        &self,
        permissions: &ReadPermissions,
        field: &str,
        ctx: &ResolveContext,
    ) -> GateResult<()> {
        let evaluator = PermissionEvaluator::new(self.resolver);
        let node = &permissions.group_by;
        let field_layer = node.field(field);
        let check_ctx = ctx.with_extra("field", Value::String(field.to_string()));

        let (_, vetoed) = evaluator.apply_hooks(
            node,
            field_layer.map(|f| f as &dyn PermissionLayer),
            Value::String(field.to_string()),
            &check_ctx,
        )?;
        if vetoed {
            return Err(PermissionError::ClosureVeto {
                field: field.to_string(),
            }
            .into());
        }
        let allowed = evaluator.permissive_allowed_check(
            node,
            field_layer.and_then(|f| f.allowed.as_ref()),
            &check_ctx,
        )?;
        if !allowed {
            warn!(field, "group by denied");
            return Err(PermissionError::GroupByNotAllowed {
                field: field.to_string(),
            }
            .into());
        }
        Ok(())
    }

    fn apply_limit_and_offset(
        &self,
        request: &ReadRequest<'_>,
        permissions: &ReadPermissions,
        spec: &mut QuerySpec,
    ) -> GateResult<()> {
        let ctx = request.ctx;
        let options = &request.front_end.options;
        let limit = options.limit.unwrap_or(DEFAULT_LIMIT);
        let offset = options.offset.unwrap_or(DEFAULT_OFFSET).max(1);

        let [overrides, entity_options] = request.layers("maxLimit");
        let max_limit = self
            .resolver
            .find_u64(
                &[overrides, entity_options, permissions.max_limit.as_ref()],
                ctx,
                "maxLimit",
            )?
            .unwrap_or(DEFAULT_MAX_LIMIT);

        if limit > max_limit {
            warn!(limit, max_limit, "requested limit above maximum");
            return Err(LimitError::LimitExceeded { limit, max_limit }.into());
        }

        spec.limit = limit;
        spec.offset = offset;
        Ok(())
    }

    fn apply_shaping(&self, request: &ReadRequest<'_>, spec: &mut QuerySpec) -> GateResult<()> {
        let ctx = request.ctx;
        let [overrides, options] = request.layers("fetchJoin");
        spec.shaping = ResultShaping {
            paginate: self
                .resolver
                .find_bool(&request.layers("paginate"), ctx, "paginate")?
                .unwrap_or(false),
            fetch_join: self
                .resolver
                .find_bool(
                    &[overrides, options, request.config.read.settings.fetch_join.as_ref()],
                    ctx,
                    "fetchJoin",
                )?
                .unwrap_or(true),
            hydrate: self
                .resolver
                .find_bool(&request.layers("hydrate"), ctx, "hydrate")?
                .unwrap_or(true),
            return_count: request.front_end.options.return_count.unwrap_or(true),
        };
        Ok(())
    }
}
