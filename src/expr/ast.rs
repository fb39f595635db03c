//! Typed expression AST for deployment parameters.
//!
//! The grammar is deliberately small: literals, `+`, named-parameter
//! lookups, and a fixed allow-list of helper functions. There is no
//! general-purpose scripting here, so evaluation cost is bounded by the
//! size of the expression.

use std::collections::BTreeSet;
use std::fmt;

/// A parsed parameter expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expr {
    Int(i64),
    Str(String),
    /// `Parameters["name"]` lookup against the evaluation context.
    Param(String),
    /// `lhs + rhs`: integer addition, or concatenation when either side is
    /// a string.
    Add(Box<Expr>, Box<Expr>),
    Call(HelperFn, Vec<Expr>),
}

impl Expr {
    /// Collect every context name this expression references.
    ///
    /// This is the real reference-extraction pass dependency ordering is
    /// built on; substring matching over raw expression text is not used.
    pub fn references(&self) -> BTreeSet<String> {
        let mut names = BTreeSet::new();
        self.collect_references(&mut names);
        names
    }

    fn collect_references(&self, names: &mut BTreeSet<String>) {
        match self {
            Expr::Int(_) | Expr::Str(_) => {}
            Expr::Param(name) => {
                names.insert(name.clone());
            }
            Expr::Add(lhs, rhs) => {
                lhs.collect_references(names);
                rhs.collect_references(names);
            }
            Expr::Call(_, args) => {
                for arg in args {
                    arg.collect_references(names);
                }
            }
        }
    }
}

/// The allow-listed helper functions expressions may call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HelperFn {
    GetIpRange,
    GetSubIpRange,
    GetRandomString,
}

impl HelperFn {
    pub fn lookup(name: &str) -> Option<Self> {
        match name {
            "GetIpRange" => Some(HelperFn::GetIpRange),
            "GetSubIpRange" => Some(HelperFn::GetSubIpRange),
            "GetRandomString" => Some(HelperFn::GetRandomString),
            _ => None,
        }
    }

    pub fn arity(&self) -> usize {
        match self {
            HelperFn::GetIpRange => 3,
            HelperFn::GetSubIpRange => 3,
            HelperFn::GetRandomString => 1,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            HelperFn::GetIpRange => "GetIpRange",
            HelperFn::GetSubIpRange => "GetSubIpRange",
            HelperFn::GetRandomString => "GetRandomString",
        }
    }
}

/// A resolved parameter value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Int(i64),
    Str(String),
}

impl Value {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            Value::Str(_) => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(n) => write!(f, "{n}"),
            Value::Str(s) => write!(f, "{s}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn references_walks_nested_expressions() {
        let expr = Expr::Add(
            Box::new(Expr::Param("base".into())),
            Box::new(Expr::Call(
                HelperFn::GetSubIpRange,
                vec![
                    Expr::Param("pool".into()),
                    Expr::Int(0),
                    Expr::Int(16),
                ],
            )),
        );
        let refs = expr.references();
        assert_eq!(
            refs.into_iter().collect::<Vec<_>>(),
            vec!["base".to_string(), "pool".to_string()]
        );
    }

    #[test]
    fn helper_lookup_rejects_unknown_names() {
        assert_eq!(HelperFn::lookup("GetIpRange"), Some(HelperFn::GetIpRange));
        assert_eq!(HelperFn::lookup("System.Exit"), None);
    }
}
