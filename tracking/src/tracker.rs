//! Per-request context attached to every event emitted while handling that request.
//!
//! Contexts are named mappings pushed on a stack. Each request runs inside its own
//! task-local stack (see [`scope`]), so nothing leaks between concurrent requests, and
//! code anywhere in the request can enter a context or resolve the merged view without
//! threading a handle through every call.
use std::cell::RefCell;
use std::future::Future;

use serde_json::{Map, Value};

tokio::task_local! {
    static CONTEXT_STACK: RefCell<ContextStack>;
}

#[derive(Debug, Default, Clone)]
pub struct ContextStack {
    entries: Vec<(String, Map<String, Value>)>,
}

impl ContextStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enter_context(&mut self, name: impl Into<String>, context: Map<String, Value>) {
        self.entries.push((name.into(), context));
    }

    /// Pop the most recent context pushed under `name`. No-op when there is none.
    pub fn exit_context(&mut self, name: &str) -> Option<Map<String, Value>> {
        let position = self.entries.iter().rposition(|(entry, _)| entry == name)?;
        Some(self.entries.remove(position).1)
    }

    /// Merge every active context, oldest first, so newer values override older ones.
    pub fn resolve_context(&self) -> Map<String, Value> {
        let mut merged = Map::new();
        for (_, context) in &self.entries {
            for (key, value) in context {
                merged.insert(key.clone(), value.clone());
            }
        }
        merged
    }

    pub fn depth(&self, name: &str) -> usize {
        self.entries.iter().filter(|(entry, _)| entry == name).count()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Run `f` with a fresh context stack, unless one is already in scope.
pub async fn scope<F>(f: F) -> F::Output
where
    F: Future,
{
    if in_scope() {
        f.await
    } else {
        CONTEXT_STACK
            .scope(RefCell::new(ContextStack::new()), f)
            .await
    }
}

pub fn in_scope() -> bool {
    CONTEXT_STACK.try_with(|_| ()).is_ok()
}

/// Run `f` against the current stack, if there is one.
pub fn with_context_stack<R>(f: impl FnOnce(&mut ContextStack) -> R) -> Option<R> {
    CONTEXT_STACK
        .try_with(|stack| f(&mut stack.borrow_mut()))
        .ok()
}

pub fn enter_context(name: &str, context: Map<String, Value>) {
    if with_context_stack(|stack| stack.enter_context(name, context)).is_none() {
        tracing::debug!(context = name, "no context stack in scope, context ignored");
    }
}

pub fn exit_context(name: &str) {
    with_context_stack(|stack| stack.exit_context(name));
}

pub fn resolve_context() -> Map<String, Value> {
    with_context_stack(|stack| stack.resolve_context()).unwrap_or_default()
}

/// Enter a context that is exited when the guard is dropped, which covers early returns,
/// errors and cancelled futures alike.
#[must_use = "the context is exited as soon as the guard is dropped"]
pub struct ContextGuard {
    name: String,
}

impl ContextGuard {
    pub fn enter(name: impl Into<String>, context: Map<String, Value>) -> Self {
        let name = name.into();
        enter_context(&name, context);
        ContextGuard { name }
    }
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        exit_context(&self.name);
    }
}
