use std::sync::Arc;

use crate::error::{BrokerError, Result};
use crate::types::{Header, SelectorExpr};

/// A compiled message selector, an opaque predicate over the message header.
pub trait SelectorEvaluator: Sync + Send {
    fn test(&self, header: &Header) -> bool;
}

impl<F> SelectorEvaluator for F
where
    F: Fn(&Header) -> bool + Sync + Send,
{
    #[inline]
    fn test(&self, header: &Header) -> bool {
        self(header)
    }
}

pub type Selector = Arc<dyn SelectorEvaluator>;

pub trait SelectorFactory: Sync + Send {
    /// Compiles `expr`. An empty expression selects everything and yields `None`.
    fn compile(&self, expr: &SelectorExpr) -> Result<Option<Selector>>;
}

/// Rejects every non-empty selector expression.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoSelectorFactory;

impl SelectorFactory for NoSelectorFactory {
    #[inline]
    fn compile(&self, expr: &SelectorExpr) -> Result<Option<Selector>> {
        if expr.trim().is_empty() {
            Ok(None)
        } else {
            Err(BrokerError::InvalidSelector(expr.clone(), "message selectors are not supported".into()))
        }
    }
}

type CompileFn = dyn Fn(&str) -> std::result::Result<Selector, String> + Sync + Send;

/// Delegates compilation to a closure, usually the bridge to an external selector engine.
pub struct FnSelectorFactory {
    compile_fn: Box<CompileFn>,
}

impl FnSelectorFactory {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&str) -> std::result::Result<Selector, String> + Sync + Send + 'static,
    {
        Self { compile_fn: Box::new(f) }
    }
}

impl SelectorFactory for FnSelectorFactory {
    fn compile(&self, expr: &SelectorExpr) -> Result<Option<Selector>> {
        let expr_str = expr.trim();
        if expr_str.is_empty() {
            return Ok(None);
        }
        (self.compile_fn)(expr_str).map(Some).map_err(|e| BrokerError::InvalidSelector(expr.clone(), e))
    }
}
