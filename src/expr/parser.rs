//! Parser for the workflow expression language
//!
//! Parses next_step expressions, only_if guards and Code snippets into an
//! explicit AST. The engine evaluates the AST against a per-call binding
//! table; nothing here touches the context directly.

use pest::iterators::Pair;
use pest::Parser as _;
use pest_derive::Parser;

use super::ExprError;

#[derive(Parser)]
#[grammar = "expr/expression.pest"]
struct ExpressionParser;

/// Expression AST
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Null,
    Bool(bool),
    Number(f64),
    Str(String),
    Array(Vec<Expr>),
    Object(Vec<(String, Expr)>),
    Ident(String),
    Member {
        object: Box<Expr>,
        accessor: Accessor,
    },
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Ternary {
        condition: Box<Expr>,
        then: Box<Expr>,
        otherwise: Box<Expr>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Accessor {
    /// Dot access: `a.b`
    Field(String),
    /// Bracket access: `a[0]`, `a["key"]`, `a[expr]`
    Index(Box<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
    And,
    Or,
}

/// Parse an expression source string
pub fn parse_expression(source: &str) -> Result<Expr, ExprError> {
    let mut pairs = ExpressionParser::parse(Rule::expression_input, source)
        .map_err(|e| ExprError::Parse(e.to_string()))?;
    let input = pairs.next().expect("expression_input pair");
    let expr = input
        .into_inner()
        .find(|p| p.as_rule() == Rule::expression)
        .expect("expression pair");
    build_expression(expr)
}

/// Parse a Code snippet: an expression with an optional leading `return`
pub fn parse_snippet(source: &str) -> Result<Expr, ExprError> {
    let mut pairs = ExpressionParser::parse(Rule::snippet_input, source)
        .map_err(|e| ExprError::Parse(e.to_string()))?;
    let input = pairs.next().expect("snippet_input pair");
    let expr = input
        .into_inner()
        .find(|p| p.as_rule() == Rule::expression)
        .expect("expression pair");
    build_expression(expr)
}

/// Collect the free identifiers referenced by an expression source
///
/// Used by the diagram generator to find step names inside next_step
/// expressions. Returns an empty list when the source does not parse.
pub fn identifiers(source: &str) -> Vec<String> {
    let Ok(expr) = parse_expression(source) else {
        return Vec::new();
    };
    let mut names = Vec::new();
    collect_identifiers(&expr, &mut names);
    names
}

fn collect_identifiers(expr: &Expr, names: &mut Vec<String>) {
    match expr {
        Expr::Ident(name) => {
            if !names.iter().any(|n| n == name) {
                names.push(name.clone());
            }
        }
        Expr::Array(items) => {
            for item in items {
                collect_identifiers(item, names);
            }
        }
        Expr::Object(pairs) => {
            for (_, value) in pairs {
                collect_identifiers(value, names);
            }
        }
        Expr::Member { object, accessor } => {
            collect_identifiers(object, names);
            if let Accessor::Index(index) = accessor {
                collect_identifiers(index, names);
            }
        }
        Expr::Unary { operand, .. } => collect_identifiers(operand, names),
        Expr::Binary { left, right, .. } => {
            collect_identifiers(left, names);
            collect_identifiers(right, names);
        }
        Expr::Ternary {
            condition,
            then,
            otherwise,
        } => {
            collect_identifiers(condition, names);
            collect_identifiers(then, names);
            collect_identifiers(otherwise, names);
        }
        Expr::Null | Expr::Bool(_) | Expr::Number(_) | Expr::Str(_) => {}
    }
}

fn build_expression(pair: Pair<Rule>) -> Result<Expr, ExprError> {
    let ternary = pair.into_inner().next().expect("ternary pair");
    build_ternary(ternary)
}

fn build_ternary(pair: Pair<Rule>) -> Result<Expr, ExprError> {
    let mut inner = pair.into_inner();
    let condition = build_binary(inner.next().expect("ternary condition"))?;
    match (inner.next(), inner.next()) {
        (Some(then), Some(otherwise)) => Ok(Expr::Ternary {
            condition: Box::new(condition),
            then: Box::new(build_expression(then)?),
            otherwise: Box::new(build_expression(otherwise)?),
        }),
        _ => Ok(condition),
    }
}

/// Build a left-associative binary operator chain
fn build_binary(pair: Pair<Rule>) -> Result<Expr, ExprError> {
    match pair.as_rule() {
        Rule::logical_or
        | Rule::logical_and
        | Rule::equality
        | Rule::comparison
        | Rule::additive
        | Rule::multiplicative => {
            let mut inner = pair.into_inner();
            let mut left = build_binary(inner.next().expect("binary operand"))?;
            while let Some(op_pair) = inner.next() {
                let op = binary_op(op_pair.as_str());
                let right = build_binary(inner.next().expect("binary operand"))?;
                left = Expr::Binary {
                    op,
                    left: Box::new(left),
                    right: Box::new(right),
                };
            }
            Ok(left)
        }
        Rule::unary => build_unary(pair),
        rule => unreachable!("unexpected binary rule: {:?}", rule),
    }
}

fn binary_op(text: &str) -> BinaryOp {
    match text {
        "+" => BinaryOp::Add,
        "-" => BinaryOp::Sub,
        "*" => BinaryOp::Mul,
        "/" => BinaryOp::Div,
        "%" => BinaryOp::Rem,
        "==" => BinaryOp::Eq,
        "!=" => BinaryOp::Ne,
        "<" => BinaryOp::Lt,
        ">" => BinaryOp::Gt,
        "<=" => BinaryOp::Le,
        ">=" => BinaryOp::Ge,
        "&&" => BinaryOp::And,
        "||" => BinaryOp::Or,
        other => unreachable!("unexpected operator: {}", other),
    }
}

fn build_unary(pair: Pair<Rule>) -> Result<Expr, ExprError> {
    let mut inner = pair.into_inner();
    let first = inner.next().expect("unary pair");
    match first.as_rule() {
        Rule::not_op => Ok(Expr::Unary {
            op: UnaryOp::Not,
            operand: Box::new(build_unary(inner.next().expect("unary operand"))?),
        }),
        Rule::neg_op => Ok(Expr::Unary {
            op: UnaryOp::Neg,
            operand: Box::new(build_unary(inner.next().expect("unary operand"))?),
        }),
        Rule::postfix => build_postfix(first),
        rule => unreachable!("unexpected unary rule: {:?}", rule),
    }
}

fn build_postfix(pair: Pair<Rule>) -> Result<Expr, ExprError> {
    let mut inner = pair.into_inner();
    let mut expr = build_primary(inner.next().expect("primary pair"))?;
    for accessor_pair in inner {
        let accessor = accessor_pair.into_inner().next().expect("accessor pair");
        let accessor = match accessor.as_rule() {
            Rule::dot_access => {
                let field = accessor.into_inner().next().expect("field identifier");
                Accessor::Field(field.as_str().to_string())
            }
            Rule::index_access => {
                let index = accessor.into_inner().next().expect("index expression");
                Accessor::Index(Box::new(build_expression(index)?))
            }
            rule => unreachable!("unexpected accessor rule: {:?}", rule),
        };
        expr = Expr::Member {
            object: Box::new(expr),
            accessor,
        };
    }
    Ok(expr)
}

fn build_primary(pair: Pair<Rule>) -> Result<Expr, ExprError> {
    let inner = pair.into_inner().next().expect("primary child");
    match inner.as_rule() {
        Rule::literal => build_literal(inner),
        Rule::identifier => Ok(Expr::Ident(inner.as_str().to_string())),
        Rule::array => {
            let items = inner
                .into_inner()
                .map(build_expression)
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Expr::Array(items))
        }
        Rule::object => {
            let mut pairs = Vec::new();
            for entry in inner.into_inner() {
                let mut kv = entry.into_inner();
                let key_pair = kv.next().expect("object key");
                let key = match key_pair.as_rule() {
                    Rule::string => unquote(key_pair.as_str()),
                    _ => key_pair.as_str().to_string(),
                };
                let value = build_expression(kv.next().expect("object value"))?;
                pairs.push((key, value));
            }
            Ok(Expr::Object(pairs))
        }
        Rule::expression => build_expression(inner),
        rule => unreachable!("unexpected primary rule: {:?}", rule),
    }
}

fn build_literal(pair: Pair<Rule>) -> Result<Expr, ExprError> {
    let inner = pair.into_inner().next().expect("literal child");
    match inner.as_rule() {
        Rule::null => Ok(Expr::Null),
        Rule::boolean => Ok(Expr::Bool(inner.as_str() == "true")),
        Rule::number => inner
            .as_str()
            .parse::<f64>()
            .map(Expr::Number)
            .map_err(|e| ExprError::Parse(format!("invalid number '{}': {}", inner.as_str(), e))),
        Rule::string => Ok(Expr::Str(unquote(inner.as_str()))),
        rule => unreachable!("unexpected literal rule: {:?}", rule),
    }
}

/// Strip the surrounding quotes and process escape sequences
fn unquote(raw: &str) -> String {
    let body = &raw[1..raw.len() - 1];
    let mut out = String::with_capacity(body.len());
    let mut chars = body.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some(other) => out.push(other),
            None => {}
        }
    }
    out
}
