//! Ignore predicate consulted by both pipelines and the reconciliation pass.

/// Decides whether a local relative path is excluded from sync.
pub trait IgnorePredicate: Send + Sync {
    fn should_ignore(&self, path: &str) -> bool;
}

/// Syncs everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoIgnore;

impl IgnorePredicate for NoIgnore {
    fn should_ignore(&self, _path: &str) -> bool {
        false
    }
}

impl<F> IgnorePredicate for F
where
    F: Fn(&str) -> bool + Send + Sync,
{
    fn should_ignore(&self, path: &str) -> bool {
        self(path)
    }
}
