//! Boolean permission expressions
//!
//! Expressions are bounded at construction: an [`ExpressionSpec`] whose AST
//! exceeds the configured leaf count or depth is never built, so evaluation
//! cannot fail.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::{validate_permission, Resolver};
use crate::config::ComplexityLimits;
use crate::error::{GuardError, Result};
use crate::types::PermissionSnapshot;

/// Boolean AST over permissions.
///
/// JSON form: `{"and":[..]}`, `{"or":[..]}`, `{"not":{..}}`,
/// `{"permission":"x"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionExpression {
    And(Vec<PermissionExpression>),
    Or(Vec<PermissionExpression>),
    Not(Box<PermissionExpression>),
    #[serde(rename = "permission")]
    Leaf(String),
}

impl PermissionExpression {
    pub fn and(children: Vec<PermissionExpression>) -> Self {
        Self::And(children)
    }

    pub fn or(children: Vec<PermissionExpression>) -> Self {
        Self::Or(children)
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(child: PermissionExpression) -> Self {
        Self::Not(Box::new(child))
    }

    pub fn leaf(permission: impl Into<String>) -> Self {
        Self::Leaf(permission.into())
    }

    /// Total number of leaves
    pub fn leaf_count(&self) -> usize {
        match self {
            Self::And(children) | Self::Or(children) => {
                children.iter().map(Self::leaf_count).sum()
            }
            Self::Not(child) => child.leaf_count(),
            Self::Leaf(_) => 1,
        }
    }

    /// Leaf = 1, composite = 1 + deepest child
    pub fn depth(&self) -> usize {
        match self {
            Self::And(children) | Self::Or(children) => {
                1 + children.iter().map(Self::depth).max().unwrap_or(0)
            }
            Self::Not(child) => 1 + child.depth(),
            Self::Leaf(_) => 1,
        }
    }

    /// Depth if it is at most `limit`, `None` otherwise.
    ///
    /// Iterative, and stops at the first node deeper than `limit`, so an
    /// arbitrarily deep tree is rejected without recursing through it.
    pub fn depth_within(&self, limit: usize) -> Option<usize> {
        let mut deepest = 0;
        let mut pending = vec![(self, 1usize)];

        while let Some((node, depth)) = pending.pop() {
            if depth > limit {
                return None;
            }
            deepest = deepest.max(depth);

            match node {
                Self::And(children) | Self::Or(children) => {
                    pending.extend(children.iter().map(|child| (child, depth + 1)));
                }
                Self::Not(child) => pending.push((child.as_ref(), depth + 1)),
                Self::Leaf(_) => {}
            }
        }

        Some(deepest)
    }

    /// Visits every leaf permission
    pub fn leaves(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_leaves(&mut out);
        out
    }

    fn collect_leaves<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Self::And(children) | Self::Or(children) => {
                for child in children {
                    child.collect_leaves(out);
                }
            }
            Self::Not(child) => child.collect_leaves(out),
            Self::Leaf(permission) => out.push(permission),
        }
    }

    /// Short-circuit evaluation with a caller-supplied leaf oracle.
    ///
    /// `AND([])` is true, `OR([])` is false. Children after the deciding one
    /// are never visited.
    pub fn evaluate_with<F>(&self, oracle: &mut F) -> bool
    where
        F: FnMut(&str) -> bool,
    {
        match self {
            Self::And(children) => children.iter().all(|c| c.evaluate_with(oracle)),
            Self::Or(children) => children.iter().any(|c| c.evaluate_with(oracle)),
            Self::Not(child) => !child.evaluate_with(oracle),
            Self::Leaf(permission) => oracle(permission),
        }
    }
}

impl fmt::Display for PermissionExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let write_list = |f: &mut fmt::Formatter<'_>, op: &str, children: &[Self]| -> fmt::Result {
            write!(f, "{}(", op)?;
            for (i, child) in children.iter().enumerate() {
                if i > 0 {
                    f.write_str(", ")?;
                }
                write!(f, "{}", child)?;
            }
            f.write_str(")")
        };

        match self {
            Self::And(children) => write_list(f, "AND", children),
            Self::Or(children) => write_list(f, "OR", children),
            Self::Not(child) => write!(f, "NOT({})", child),
            Self::Leaf(permission) => f.write_str(permission),
        }
    }
}

/// An expression proven within the complexity limits
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExpressionSpec {
    expression: PermissionExpression,
    #[serde(skip)]
    leaf_count: usize,
    #[serde(skip)]
    depth: usize,
}

impl ExpressionSpec {
    pub fn new(expression: PermissionExpression, limits: &ComplexityLimits) -> Result<Self> {
        // Bounded first: the recursive walks below rely on it
        let Some(depth) = expression.depth_within(limits.max_nesting_depth) else {
            return Err(GuardError::Validation(format!(
                "expression exceeds maximum nesting depth {}",
                limits.max_nesting_depth
            )));
        };

        let leaf_count = expression.leaf_count();
        if leaf_count > limits.max_expression_complexity {
            return Err(GuardError::Validation(format!(
                "expression has {} permissions, maximum complexity is {}",
                leaf_count, limits.max_expression_complexity
            )));
        }

        for leaf in expression.leaves() {
            validate_permission(leaf)?;
        }

        Ok(Self {
            expression,
            leaf_count,
            depth,
        })
    }

    pub fn expression(&self) -> &PermissionExpression {
        &self.expression
    }

    pub fn leaf_count(&self) -> usize {
        self.leaf_count
    }

    pub fn depth(&self) -> usize {
        self.depth
    }
}

/// Evaluates expressions with plain membership at the leaves
#[derive(Debug, Default, Clone, Copy)]
pub struct ExpressionResolver;

impl Resolver for ExpressionResolver {
    type Spec = ExpressionSpec;

    fn evaluate(&self, snapshot: &PermissionSnapshot, spec: &ExpressionSpec) -> bool {
        spec.expression
            .evaluate_with(&mut |permission: &str| snapshot.holds(permission))
    }
}
