use super::Configuration;
use crate::errors::Result;
use crate::expr::Expr;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

type PredicateFn = dyn Fn(&Configuration) -> bool + Send + Sync;

/// Validity predicate over a configuration.
///
/// String restrictions are parsed once into an [`Expr`]; typed restrictions are
/// closures that declare the parameters they read so the space can reject
/// references to undefined names up front.
#[derive(Clone)]
pub enum Restriction {
    Expr { source: String, expr: Expr },
    Predicate {
        params: Vec<String>,
        check: Arc<PredicateFn>,
    },
}

impl Restriction {
    pub fn parse(source: &str) -> Result<Self> {
        let expr = Expr::parse(source)?;
        Ok(Restriction::Expr {
            source: source.to_string(),
            expr,
        })
    }

    pub fn predicate<F>(params: &[&str], check: F) -> Self
    where
        F: Fn(&Configuration) -> bool + Send + Sync + 'static,
    {
        Restriction::Predicate {
            params: params.iter().map(|p| p.to_string()).collect(),
            check: Arc::new(check),
        }
    }

    /// Parameter names read by this restriction.
    pub fn referenced(&self) -> Vec<String> {
        match self {
            Restriction::Expr { expr, .. } => expr.variables(),
            Restriction::Predicate { params, .. } => params.clone(),
        }
    }

    /// Evaluation errors count as a violation.
    pub fn check(&self, config: &Configuration) -> bool {
        match self {
            Restriction::Expr { source, expr } => match expr.eval_bool(config) {
                Ok(ok) => ok,
                Err(e) => {
                    debug!("restriction `{}` failed on [{}]: {}", source, config, e);
                    false
                }
            },
            Restriction::Predicate { check, .. } => check(config),
        }
    }
}

impl fmt::Display for Restriction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Restriction::Expr { source, .. } => write!(f, "{}", source),
            Restriction::Predicate { params, .. } => {
                write!(f, "<predicate over {}>", params.join(", "))
            }
        }
    }
}

impl fmt::Debug for Restriction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Restriction::Expr { source, .. } => f.debug_tuple("Expr").field(source).finish(),
            Restriction::Predicate { params, .. } => {
                f.debug_struct("Predicate").field("params", params).finish()
            }
        }
    }
}
