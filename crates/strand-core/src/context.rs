//! Per-call ambient state: metadata, deadline, cancellation, user values.
//!
//! A context is created by the caller (client side) or per inbound request
//! (server side). Derived contexts inherit the deadline (narrowed, never
//! widened) and observe the parent's cancellation. Propagation between
//! calls is by deep clone; a context is never shared mutably.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::cancel::CancelToken;
use crate::deadline::Deadline;
use crate::metadata::Metadata;

/// The ambient state of a call.
#[derive(Clone)]
pub struct Context {
    metadata: Metadata,
    deadline: Option<Deadline>,
    cancel: CancelToken,
    values: HashMap<TypeId, Arc<dyn Any + Send + Sync>>,
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("metadata", &self.metadata)
            .field("deadline", &self.deadline)
            .field("cancelled", &self.is_cancelled())
            .field("values", &self.values.len())
            .finish()
    }
}

impl Context {
    /// An empty root context: no metadata, no deadline, unfired cancel.
    pub fn background() -> Self {
        Context {
            metadata: Metadata::new(),
            deadline: None,
            cancel: CancelToken::new(),
            values: HashMap::new(),
        }
    }

    /// Derive a child context: deep-cloned metadata and values, inherited
    /// deadline, and a cancel token observing this one.
    pub fn child(&self) -> Context {
        Context {
            metadata: self.metadata.clone(),
            deadline: self.deadline,
            cancel: self.cancel.child(),
            values: self.values.clone(),
        }
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn metadata_mut(&mut self) -> &mut Metadata {
        &mut self.metadata
    }

    pub fn set_metadata(&mut self, metadata: Metadata) {
        self.metadata = metadata;
    }

    /// Narrow the deadline. An existing earlier deadline wins; a context
    /// can never widen what it inherited.
    pub fn with_deadline(mut self, deadline: Deadline) -> Self {
        self.deadline = Some(match self.deadline {
            Some(existing) => existing.earliest(deadline),
            None => deadline,
        });
        self
    }

    /// Narrow the deadline to `timeout` from now.
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Deadline::after(timeout))
    }

    pub fn deadline(&self) -> Option<Deadline> {
        self.deadline
    }

    pub fn deadline_exceeded(&self) -> bool {
        self.deadline.is_some_and(|d| d.is_expired())
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Attach a user value keyed by its type. One value per type.
    pub fn insert_value<T: Any + Send + Sync>(&mut self, value: T) {
        self.values.insert(TypeId::of::<T>(), Arc::new(value));
    }

    /// Look up a user value by type.
    pub fn value<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.values
            .get(&TypeId::of::<T>())
            .cloned()
            .and_then(|v| v.downcast::<T>().ok())
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::background()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn background_is_empty() {
        let ctx = Context::background();
        assert!(ctx.metadata().is_empty());
        assert!(ctx.deadline().is_none());
        assert!(!ctx.is_cancelled());
        assert!(!ctx.deadline_exceeded());
    }

    #[test]
    fn child_inherits_deadline() {
        let ctx = Context::background().with_timeout(Duration::from_secs(5));
        let child = ctx.child();
        assert_eq!(child.deadline(), ctx.deadline());
    }

    #[test]
    fn deadline_only_narrows() {
        let near = Deadline::after(Duration::from_millis(10));
        let far = Deadline::after(Duration::from_secs(60));
        let ctx = Context::background().with_deadline(near).with_deadline(far);
        assert_eq!(ctx.deadline(), Some(near));
    }

    #[test]
    fn expired_deadline_propagates_to_children() {
        let ctx = Context::background().with_timeout(Duration::ZERO);
        assert!(ctx.deadline_exceeded());
        assert!(ctx.child().deadline_exceeded());
        assert!(ctx.child().child().deadline_exceeded());
    }

    #[test]
    fn parent_cancel_reaches_child_context() {
        let ctx = Context::background();
        let child = ctx.child();
        ctx.cancel();
        assert!(child.is_cancelled());
        assert!(!Context::background().is_cancelled());
    }

    #[test]
    fn child_cancel_stays_local() {
        let ctx = Context::background();
        let child = ctx.child();
        child.cancel();
        assert!(!ctx.is_cancelled());
    }

    #[test]
    fn typed_values() {
        #[derive(Debug, PartialEq)]
        struct Tenant(String);

        let mut ctx = Context::background();
        ctx.insert_value(Tenant("acme".to_string()));
        assert_eq!(ctx.value::<Tenant>().unwrap().0, "acme");
        assert!(ctx.value::<u64>().is_none());

        // Children see the parent's values.
        let child = ctx.child();
        assert_eq!(child.value::<Tenant>().unwrap().0, "acme");
    }

    #[test]
    fn metadata_clone_is_deep() {
        let mut ctx = Context::background();
        ctx.metadata_mut().insert_ascii("k", "v").unwrap();
        let mut child = ctx.child();
        child.metadata_mut().insert_ascii("k", "other").unwrap();
        assert_eq!(ctx.metadata().get("k"), Some("v"));
    }
}
