//! The cancellation tree.
//!
//! Every executor creates a child [`AbortScope`] linked to its parent;
//! aborting a parent transitively aborts children via
//! [`tokio_util::sync::CancellationToken`]'s own child-token propagation.
//! Each scope additionally carries a reason slot so callers can tell a
//! pause apart from a timeout or a `stop` step: `execute()`
//! raises `PauseError` only when the *effective* reason -- the nearest
//! cancelled ancestor's reason -- is [`AbortReason::Pause`].

use std::sync::{Arc, Mutex};

use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

#[derive(Debug, Clone, PartialEq)]
pub enum AbortReason {
    Pause,
    UserAbort,
    Timeout,
    Reset,
    Stop { step: String },
}

struct Inner {
    token: CancellationToken,
    reason: Mutex<Option<AbortReason>>,
    parent: Option<AbortScope>,
}

/// A cancellation handle with a parent pointer and a reason slot (
/// "Cancellation tree").
#[derive(Clone)]
pub struct AbortScope(Arc<Inner>);

impl AbortScope {
    /// A fresh root scope, e.g. one per `execute()` run.
    pub fn root() -> Self {
        AbortScope(Arc::new(Inner {
            token: CancellationToken::new(),
            reason: Mutex::new(None),
            parent: None,
        }))
    }

    /// A child scope linked to `self`; cancelling `self` (or any ancestor)
    /// cancels it too.
    pub fn child(&self) -> Self {
        AbortScope(Arc::new(Inner {
            token: self.0.token.child_token(),
            reason: Mutex::new(None),
            parent: Some(self.clone()),
        }))
    }

    /// Cancel this scope (and transitively its children) for `reason`.
    /// A no-op if this scope is already cancelled`: "If
    /// already aborted, no-op").
    pub fn cancel(&self, reason: AbortReason) {
        if self.0.token.is_cancelled() {
            return;
        }
        let mut slot = self.0.reason.lock().unwrap();
        if slot.is_none() {
            *slot = Some(reason);
        }
        self.0.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.token.is_cancelled()
    }

    /// The reason recorded at the nearest ancestor (including `self`) that
    /// is actually cancelled. `None` if nothing in the chain was cancelled
    /// yet, which shouldn't happen once `is_cancelled()` is true.
    pub fn reason(&self) -> Option<AbortReason> {
        if let Some(r) = self.0.reason.lock().unwrap().clone() {
            return Some(r);
        }
        self.0.parent.as_ref().and_then(|p| p.reason())
    }

    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.0.token.cancelled()
    }

    pub fn is_pause(&self) -> bool {
        matches!(self.reason(), Some(AbortReason::Pause))
    }
}

impl Default for AbortScope {
    fn default() -> Self {
        Self::root()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_cancellation_follows_parent() {
        let root = AbortScope::root();
        let child = root.child();
        assert!(!child.is_cancelled());
        root.cancel(AbortReason::Pause);
        assert!(child.is_cancelled());
        assert_eq!(child.reason(), Some(AbortReason::Pause));
    }

    #[test]
    fn second_cancel_does_not_overwrite_reason() {
        let scope = AbortScope::root();
        scope.cancel(AbortReason::Timeout);
        scope.cancel(AbortReason::Pause);
        assert_eq!(scope.reason(), Some(AbortReason::Timeout));
    }

    #[test]
    fn own_reason_takes_precedence_over_parent() {
        let root = AbortScope::root();
        let child = root.child();
        child.cancel(AbortReason::Stop { step: "s".to_string() });
        root.cancel(AbortReason::Pause);
        assert_eq!(child.reason(), Some(AbortReason::Stop { step: "s".to_string() }));
    }
}
