//! Dependency-ordered evaluation of parameter sets.
//!
//! Parameters may reference each other through `Parameters["name"]`; the
//! resolver extracts those references from the parsed AST, orders the set
//! so every dependency is resolved before its dependents, and rejects
//! cycles outright rather than guessing an order.

use std::collections::BTreeSet;

use super::ast::{Expr, Value};
use super::context::Context;
use super::parser::{self, ParseError, MAX_DEPTH};
use crate::error::ExpressionError;

/// Evaluates parameter expressions against an owned [`Context`].
#[derive(Debug)]
pub struct Evaluator {
    context: Context,
}

impl Evaluator {
    pub fn new(context: Context) -> Self {
        Self { context }
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    pub fn into_context(self) -> Context {
        self.context
    }

    /// Evaluate a single expression.
    ///
    /// With `add_to_context`, the resolved value is fed back into the
    /// context unless the name is already bound (reserved system
    /// parameters are never overwritten).
    pub fn evaluate(
        &mut self,
        name: &str,
        expression: &str,
        add_to_context: bool,
    ) -> Result<Value, ExpressionError> {
        let parsed = parse_named(name, expression)?;
        self.evaluate_parsed(name, expression, &parsed, add_to_context)
    }

    /// Evaluate every parameter exactly once, in dependency order, feeding
    /// each resolved value back into the shared context before its
    /// dependents run.
    ///
    /// Parameters are given in declaration order as `(name, expression)`
    /// pairs; the returned list is the order they were evaluated in.
    pub fn evaluate_all(
        &mut self,
        parameters: &[(String, String)],
    ) -> Result<Vec<String>, ExpressionError> {
        let mut parsed = Vec::with_capacity(parameters.len());
        for (name, expression) in parameters {
            parsed.push((name.clone(), expression.clone(), parse_named(name, expression)?));
        }

        let order = evaluation_order(&parsed)?;

        for name in &order {
            let (_, expression, expr) = parsed
                .iter()
                .find(|(n, _, _)| n == name)
                .expect("ordering only yields declared names");
            self.evaluate_parsed(name, expression, expr, true)?;
        }

        Ok(order)
    }

    fn evaluate_parsed(
        &mut self,
        name: &str,
        expression: &str,
        parsed: &Expr,
        add_to_context: bool,
    ) -> Result<Value, ExpressionError> {
        let value = self
            .context
            .eval(parsed)
            .map_err(|reason| ExpressionError::Eval {
                name: name.to_string(),
                expression: expression.to_string(),
                reason,
            })?;

        if add_to_context {
            self.context.insert_if_absent(name, value.clone());
        }

        Ok(value)
    }
}

fn parse_named(name: &str, expression: &str) -> Result<Expr, ExpressionError> {
    parser::parse(expression).map_err(|e| match e {
        ParseError::TooDeep => ExpressionError::DepthExceeded {
            name: name.to_string(),
            limit: MAX_DEPTH,
        },
        ParseError::Message(reason) => ExpressionError::Parse {
            name: name.to_string(),
            expression: expression.to_string(),
            reason,
        },
    })
}

/// Dependency edges as (dependent, dependency) pairs.
///
/// Only references to names declared in the same parameter set form
/// edges; references to context-seeded values (system parameters, values
/// persisted by earlier passes) are satisfied already.
fn dependency_edges(parsed: &[(String, String, Expr)]) -> Vec<(String, String)> {
    let declared: BTreeSet<&str> = parsed.iter().map(|(name, _, _)| name.as_str()).collect();

    let mut edges = Vec::new();
    for (dependent, _, expr) in parsed {
        for reference in expr.references() {
            if declared.contains(reference.as_str()) {
                edges.push((dependent.clone(), reference));
            }
        }
    }
    edges
}

/// Iterative ready-set topological ordering.
///
/// Each round takes every name that no longer appears on the dependent
/// side of an edge (stable, first-seen order), retires the edges it
/// satisfies, and repeats. A round that yields nothing while edges remain
/// is a cycle. Parameters with no edges at all come last, in declaration
/// order.
fn evaluation_order(parsed: &[(String, String, Expr)]) -> Result<Vec<String>, ExpressionError> {
    let names: Vec<&str> = parsed.iter().map(|(name, _, _)| name.as_str()).collect();
    let mut edges = dependency_edges(parsed);
    let mut order: Vec<String> = Vec::with_capacity(names.len());

    while !edges.is_empty() {
        let dependents: BTreeSet<&str> = edges.iter().map(|(d, _)| d.as_str()).collect();
        let ready: Vec<&str> = names
            .iter()
            .copied()
            .filter(|name| !dependents.contains(name))
            .collect();

        if ready.is_empty() {
            return Err(ExpressionError::CircularDependency);
        }

        let ready_set: BTreeSet<&str> = ready.iter().copied().collect();
        edges.retain(|(_, dependency)| !ready_set.contains(dependency.as_str()));

        for name in ready {
            if !order.iter().any(|o| o == name) {
                order.push(name.to_string());
            }
        }
    }

    for name in names {
        if !order.iter().any(|o| o == name) {
            order.push(name.to_string());
        }
    }

    Ok(order)
}
