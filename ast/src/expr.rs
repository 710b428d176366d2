use std::fmt;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

use enquote::enquote;
use serde::{Deserialize, Serialize};

use crate::ast_error::AstResult;
use crate::functions::{AggregateFunction, BuiltinFunction, RollupFunction};
use crate::label::{LabelFilter, NAME_LABEL};
use crate::operator::Operator;

pub type BExpr = Box<Expr>;

/// Matching Modifier, for VectorMatching of binary expr.
/// Label lists provided to matching keywords will determine how vectors are combined.
#[derive(Debug, Clone, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub enum VectorMatchModifier {
    On(Vec<String>),
    Ignoring(Vec<String>),
}

impl VectorMatchModifier {
    pub fn labels(&self) -> &[String] {
        match self {
            VectorMatchModifier::On(l) => l,
            VectorMatchModifier::Ignoring(l) => l,
        }
    }

    pub fn is_on(&self) -> bool {
        matches!(*self, VectorMatchModifier::On(_))
    }
}

/// Which side of a binary expression may hold several series per matching key.
#[derive(Debug, Clone, Default, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub enum VectorMatchCardinality {
    #[default]
    OneToOne,
    /// `group_left(labels)`: the left side is the "many" side.
    ManyToOne(Vec<String>),
    /// `group_right(labels)`: the right side is the "many" side.
    OneToMany(Vec<String>),
}

impl VectorMatchCardinality {
    pub fn group_left(labels: Vec<String>) -> Self {
        VectorMatchCardinality::ManyToOne(labels)
    }

    pub fn group_right(labels: Vec<String>) -> Self {
        VectorMatchCardinality::OneToMany(labels)
    }

    pub fn is_grouping(&self) -> bool {
        !matches!(self, VectorMatchCardinality::OneToOne)
    }

    pub fn labels(&self) -> Option<&[String]> {
        match self {
            VectorMatchCardinality::ManyToOne(labels) | VectorMatchCardinality::OneToMany(labels) => {
                Some(labels)
            }
            VectorMatchCardinality::OneToOne => None,
        }
    }
}

/// Binary Expr Modifier
#[derive(Debug, Clone, Default, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub struct BinModifier {
    /// The matching behavior for the operation if both operands are Vectors.
    pub card: VectorMatchCardinality,

    /// on/ignoring on labels.
    pub matching: Option<VectorMatchModifier>,

    /// If keep_metric_names is set to true, then the operation should keep metric names.
    pub keep_metric_names: bool,

    /// If a comparison operator, return 0/1 rather than filtering.
    /// For example, `foo > bool bar`.
    pub return_bool: bool,
}

impl BinModifier {
    pub fn with_card(mut self, card: VectorMatchCardinality) -> Self {
        self.card = card;
        self
    }

    pub fn with_matching(mut self, matching: VectorMatchModifier) -> Self {
        self.matching = Some(matching);
        self
    }

    pub fn with_return_bool(mut self, return_bool: bool) -> Self {
        self.return_bool = return_bool;
        self
    }

    pub fn with_keep_metric_names(mut self, keep_metric_names: bool) -> Self {
        self.keep_metric_names = keep_metric_names;
        self
    }

    pub fn is_default(&self) -> bool {
        self.card == VectorMatchCardinality::OneToOne
            && self.matching.is_none()
            && !self.keep_metric_names
            && !self.return_bool
    }
}

impl Display for BinModifier {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        if self.return_bool {
            write!(f, " bool")?;
        }
        if let Some(matching) = &self.matching {
            match matching {
                VectorMatchModifier::On(labels) => write!(f, " on({})", labels.join(", "))?,
                VectorMatchModifier::Ignoring(labels) => {
                    write!(f, " ignoring({})", labels.join(", "))?
                }
            }
        }
        match &self.card {
            VectorMatchCardinality::ManyToOne(labels) => {
                write!(f, " group_left({})", labels.join(", "))?
            }
            VectorMatchCardinality::OneToMany(labels) => {
                write!(f, " group_right({})", labels.join(", "))?
            }
            VectorMatchCardinality::OneToOne => {}
        }
        if self.keep_metric_names {
            write!(f, " keep_metric_names")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub enum AggregateModifier {
    By(Vec<String>),
    Without(Vec<String>),
}

impl AggregateModifier {
    pub fn labels(&self) -> &[String] {
        match self {
            AggregateModifier::By(v) | AggregateModifier::Without(v) => v,
        }
    }
}

impl Display for AggregateModifier {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            AggregateModifier::By(labels) => write!(f, "by ({})", labels.join(", ")),
            AggregateModifier::Without(labels) => write!(f, "without ({})", labels.join(", ")),
        }
    }
}

/// Duration from a `[window:step]`, `offset` or a bare duration literal. Durations written
/// in steps (`5i`) are resolved against the evaluation step.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum DurationExpr {
    Millis(i64),
    StepValue(f64),
}

impl DurationExpr {
    pub fn new(millis: i64) -> Self {
        DurationExpr::Millis(millis)
    }

    pub fn new_step(value: f64) -> Self {
        DurationExpr::StepValue(value)
    }

    pub fn requires_step(&self) -> bool {
        matches!(self, DurationExpr::StepValue(_))
    }

    /// Returns the duration in milliseconds.
    pub fn value(&self, step: i64) -> i64 {
        match self {
            DurationExpr::Millis(v) => *v,
            DurationExpr::StepValue(v) => (*v * step as f64) as i64,
        }
    }
}

impl Default for DurationExpr {
    fn default() -> Self {
        DurationExpr::Millis(0)
    }
}

impl Display for DurationExpr {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            DurationExpr::Millis(v) => write!(f, "{v}ms"),
            DurationExpr::StepValue(v) => write!(f, "{v}i"),
        }
    }
}

/// A series selector, e.g. `foo{job="bar"}`.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MetricExpr {
    /// Label filters from curly braces. The metric name filter, if any, is a `__name__` filter.
    pub filters: Vec<LabelFilter>,
}

impl MetricExpr {
    pub fn new<S: Into<String>>(name: S) -> MetricExpr {
        MetricExpr {
            filters: vec![LabelFilter::equal(NAME_LABEL, name)],
        }
    }

    pub fn with_filters(filters: Vec<LabelFilter>) -> Self {
        MetricExpr { filters }
    }

    pub fn append(mut self, filter: LabelFilter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    pub fn metric_name(&self) -> Option<&str> {
        self.filters
            .iter()
            .find(|f| f.is_metric_name_filter())
            .map(|f| f.value.as_str())
    }

    /// Filters in canonical order. Two selectors differing only in filter order yield the
    /// same sequence.
    pub fn sorted_filters(&self) -> Vec<&LabelFilter> {
        let mut filters: Vec<&LabelFilter> = self.filters.iter().collect();
        filters.sort();
        filters
    }
}

impl Display for MetricExpr {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let name = self.metric_name();
        if let Some(name) = name {
            write!(f, "{name}")?;
        }
        let rest: Vec<String> = self
            .filters
            .iter()
            .filter(|x| !(name.is_some() && x.is_metric_name_filter()))
            .map(|x| x.to_string())
            .collect();
        if !rest.is_empty() || name.is_none() {
            write!(f, "{{{}}}", rest.join(","))?;
        }
        Ok(())
    }
}

/// FunctionExpr represents a function call such as `rate(...)`
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionExpr {
    pub name: String,

    pub function: BuiltinFunction,

    /// Args contains function args.
    pub args: Vec<Expr>,

    /// If keep_metric_names is set to true, then the function should keep metric names.
    pub keep_metric_names: bool,
}

impl FunctionExpr {
    pub fn new(name: &str, args: Vec<Expr>) -> AstResult<Self> {
        let func_name = if name.is_empty() { "union" } else { name };
        let function = BuiltinFunction::new(func_name)?;

        Ok(Self {
            name: func_name.to_string(),
            args,
            keep_metric_names: false,
            function,
        })
    }

    pub fn default_rollup(arg: Expr) -> Self {
        Self {
            name: RollupFunction::DefaultRollup.name().to_string(),
            function: BuiltinFunction::Rollup(RollupFunction::DefaultRollup),
            args: vec![arg],
            keep_metric_names: false,
        }
    }

    pub fn with_keep_metric_names(mut self) -> Self {
        self.keep_metric_names = true;
        self
    }

    pub fn rollup_function(&self) -> Option<RollupFunction> {
        match self.function {
            BuiltinFunction::Rollup(rf) => Some(rf),
            _ => None,
        }
    }
}

impl Display for FunctionExpr {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.name)?;
        write_args(f, &self.args)?;
        write!(f, ")")?;
        if self.keep_metric_names {
            write!(f, " keep_metric_names")?;
        }
        Ok(())
    }
}

/// AggregationExpr represents aggregate function such as `sum(...) by (...)`
#[derive(Debug, Clone, PartialEq)]
pub struct AggregationExpr {
    /// function is the aggregation function.
    pub function: AggregateFunction,

    /// function args.
    pub args: Vec<Expr>,

    /// optional modifier such as `by (...)` or `without (...)`.
    pub modifier: Option<AggregateModifier>,

    /// optional limit for the number of output time series.
    ///
    /// Example: `sum(...) by (...) limit 10` would return maximum 10 time series.
    pub limit: usize,

    pub keep_metric_names: bool,
}

impl AggregationExpr {
    pub fn new(function: AggregateFunction, args: Vec<Expr>) -> AggregationExpr {
        AggregationExpr {
            args,
            modifier: None,
            limit: 0,
            function,
            keep_metric_names: false,
        }
    }

    pub fn from_name(name: &str, args: Vec<Expr>) -> AstResult<Self> {
        let function = AggregateFunction::from_str(name)?;
        Ok(Self::new(function, args))
    }

    pub fn with_modifier(mut self, modifier: AggregateModifier) -> Self {
        self.modifier = Some(modifier);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn name(&self) -> &'static str {
        self.function.name()
    }
}

impl Display for AggregationExpr {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.function.name())?;
        write_args(f, &self.args)?;
        write!(f, ")")?;
        if let Some(modifier) = &self.modifier {
            write!(f, " {modifier}")?;
        }
        if self.limit > 0 {
            write!(f, " limit {}", self.limit)?;
        }
        Ok(())
    }
}

/// RollupExpr represents an expression which contains at least `offset` or `[...]` part.
#[derive(Debug, Clone, PartialEq)]
pub struct RollupExpr {
    /// The expression for the rollup. Usually it is MetricExpr, but may be arbitrary expr
    /// if subquery is used.
    pub expr: BExpr,

    /// window contains optional window value from square brackets.
    ///
    /// For example, `http_requests_total[5m]` will have window value `5m`.
    pub window: Option<DurationExpr>,

    /// step contains optional step value from square brackets.
    ///
    /// For example, `foobar[1h:3m]` will have step value `3m`.
    pub step: Option<DurationExpr>,

    /// offset contains optional value from `offset` part.
    ///
    /// For example, `foobar{baz="aa"} offset 5m` will have offset value `5m`.
    pub offset: Option<DurationExpr>,

    /// if set to true, then `foo[1h:]` is a subquery inheriting the outer step.
    pub inherit_step: bool,

    /// at contains an optional expression after `@` modifier.
    ///
    /// For example, `foo @ end()` or `bar[5m] @ 12345`
    pub at: Option<BExpr>,
}

impl RollupExpr {
    pub fn new(expr: Expr) -> Self {
        RollupExpr {
            expr: Box::new(expr),
            window: None,
            offset: None,
            step: None,
            inherit_step: false,
            at: None,
        }
    }

    pub fn with_window(mut self, window: DurationExpr) -> Self {
        self.window = Some(window);
        self
    }

    pub fn with_step(mut self, step: DurationExpr) -> Self {
        self.step = Some(step);
        self
    }

    pub fn with_inherited_step(mut self) -> Self {
        self.inherit_step = true;
        self
    }

    pub fn with_offset(mut self, offset: DurationExpr) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn with_at(mut self, at: Expr) -> Self {
        self.at = Some(Box::new(at));
        self
    }

    pub fn for_subquery(&self) -> bool {
        self.step.is_some() || self.inherit_step
    }

    pub fn wraps_metric_expr(&self) -> bool {
        matches!(*self.expr, Expr::MetricExpression(_))
    }
}

impl Display for RollupExpr {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let needs_parens = matches!(*self.expr, Expr::BinaryOperator(_));
        if needs_parens {
            write!(f, "({})", self.expr)?;
        } else {
            write!(f, "{}", self.expr)?;
        }
        if self.window.is_some() || self.for_subquery() {
            write!(f, "[")?;
            if let Some(win) = &self.window {
                write!(f, "{win}")?;
            }
            if let Some(step) = &self.step {
                write!(f, ":{step}")?;
            } else if self.inherit_step {
                write!(f, ":")?;
            }
            write!(f, "]")?;
        }
        if let Some(offset) = &self.offset {
            write!(f, " offset {offset}")?;
        }
        if let Some(at) = &self.at {
            write!(f, " @ {at}")?;
        }
        Ok(())
    }
}

/// BinaryExpr represents a binary operation.
#[derive(Debug, Clone, PartialEq)]
pub struct BinaryExpr {
    /// left contains left arg for the `left op right` expression.
    pub left: BExpr,

    /// contains right arg for the `left op right` expression.
    pub right: BExpr,

    /// Op is the operation itself, i.e. `+`, `-`, `*`, etc.
    pub op: Operator,

    pub modifier: Option<BinModifier>,
}

impl BinaryExpr {
    pub fn new(op: Operator, lhs: Expr, rhs: Expr) -> Self {
        BinaryExpr {
            op,
            left: Box::new(lhs),
            right: Box::new(rhs),
            modifier: None,
        }
    }

    pub fn with_modifier(mut self, modifier: BinModifier) -> Self {
        self.modifier = Some(modifier);
        self
    }

    pub fn returns_bool(&self) -> bool {
        matches!(&self.modifier, Some(modifier) if modifier.return_bool)
    }

    pub fn keep_metric_names(&self) -> bool {
        matches!(&self.modifier, Some(modifier) if modifier.keep_metric_names)
    }
}

impl Display for BinaryExpr {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.left, self.op)?;
        if let Some(modifier) = &self.modifier {
            write!(f, "{modifier}")?;
        }
        write!(f, " {}", self.right)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// A single scalar number.
    Number(f64),

    Duration(DurationExpr),

    /// A single scalar string. Evaluates to a series named after the string.
    StringLiteral(String),

    /// A function call
    Function(FunctionExpr),

    /// Aggregation represents aggregate functions such as `sum(...) by (...)`
    Aggregation(AggregationExpr),

    /// A binary operator expression
    BinaryOperator(BinaryExpr),

    /// RollupExpr represents an expression which contains at least `offset` or `[...]` part.
    Rollup(RollupExpr),

    /// MetricExpr represents a metric with optional filters, i.e. `foo{...}`.
    MetricExpression(MetricExpr),
}

impl Expr {
    pub fn number(v: f64) -> Self {
        Expr::Number(v)
    }

    pub fn string<S: Into<String>>(s: S) -> Self {
        Expr::StringLiteral(s.into())
    }

    pub fn metric<S: Into<String>>(name: S) -> Self {
        Expr::MetricExpression(MetricExpr::new(name))
    }

    pub fn call(name: &str, args: Vec<Expr>) -> AstResult<Self> {
        Ok(Expr::Function(FunctionExpr::new(name, args)?))
    }

    pub fn aggregate(name: &str, args: Vec<Expr>) -> AstResult<Self> {
        Ok(Expr::Aggregation(AggregationExpr::from_name(name, args)?))
    }

    pub fn binary(op: Operator, left: Expr, right: Expr) -> Self {
        Expr::BinaryOperator(BinaryExpr::new(op, left, right))
    }

    pub fn is_scalar(&self) -> bool {
        matches!(self, Expr::Number(_) | Expr::Duration(_))
    }

    pub fn variant_name(&self) -> &'static str {
        match self {
            Expr::Number(_) => "Number",
            Expr::Duration(_) => "Duration",
            Expr::StringLiteral(_) => "String",
            Expr::Function(_) => "Function",
            Expr::Aggregation(_) => "Aggregation",
            Expr::BinaryOperator(_) => "BinaryOperator",
            Expr::Rollup(_) => "Rollup",
            Expr::MetricExpression(_) => "Selector",
        }
    }
}

impl Display for Expr {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Number(v) => write_number(f, *v),
            Expr::Duration(d) => write!(f, "{d}"),
            Expr::StringLiteral(s) => write!(f, "{}", enquote('"', s)),
            Expr::Function(fe) => write!(f, "{fe}"),
            Expr::Aggregation(ae) => write!(f, "{ae}"),
            Expr::BinaryOperator(be) => write!(f, "({be})"),
            Expr::Rollup(re) => write!(f, "{re}"),
            Expr::MetricExpression(me) => write!(f, "{me}"),
        }
    }
}

impl From<f64> for Expr {
    fn from(v: f64) -> Self {
        Expr::Number(v)
    }
}

impl From<MetricExpr> for Expr {
    fn from(me: MetricExpr) -> Self {
        Expr::MetricExpression(me)
    }
}

impl From<RollupExpr> for Expr {
    fn from(re: RollupExpr) -> Self {
        Expr::Rollup(re)
    }
}

impl From<FunctionExpr> for Expr {
    fn from(fe: FunctionExpr) -> Self {
        Expr::Function(fe)
    }
}

impl From<AggregationExpr> for Expr {
    fn from(ae: AggregationExpr) -> Self {
        Expr::Aggregation(ae)
    }
}

impl From<BinaryExpr> for Expr {
    fn from(be: BinaryExpr) -> Self {
        Expr::BinaryOperator(be)
    }
}

fn write_args(f: &mut Formatter<'_>, args: &[Expr]) -> fmt::Result {
    for (i, arg) in args.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{arg}")?;
    }
    Ok(())
}

fn write_number(f: &mut Formatter<'_>, v: f64) -> fmt::Result {
    if v.is_nan() {
        write!(f, "NaN")
    } else if v.is_infinite() {
        if v.is_sign_positive() {
            write!(f, "+Inf")
        } else {
            write!(f, "-Inf")
        }
    } else {
        write!(f, "{v}")
    }
}
