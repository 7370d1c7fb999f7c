//! Action registry
//!
//! Actions are the atomic operations tasks dispatch to: polymorphism
//! over a single-method interface. The registry is read-only once the
//! executor is constructed; concrete tools (file readers, calculators,
//! sandboxes) are collaborator-provided and register here.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value, json};

/// One invokable operation
#[async_trait]
pub trait Action: Send + Sync {
    /// Registry key; matches `Task::action`
    fn name(&self) -> &str;

    /// Run the action against a task's parameter map
    ///
    /// Errors become task failures; they never abort the plan directly.
    async fn invoke(&self, params: &Map<String, Value>) -> eyre::Result<Value>;
}

/// Adapter turning a plain closure into an [`Action`]
pub struct FnAction<F> {
    name: String,
    func: F,
}

impl<F> FnAction<F>
where
    F: Fn(&Map<String, Value>) -> eyre::Result<Value> + Send + Sync,
{
    pub fn new(name: impl Into<String>, func: F) -> Self {
        Self { name: name.into(), func }
    }
}

#[async_trait]
impl<F> Action for FnAction<F>
where
    F: Fn(&Map<String, Value>) -> eyre::Result<Value> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, params: &Map<String, Value>) -> eyre::Result<Value> {
        (self.func)(params)
    }
}

/// Reserved fallback action
///
/// Always admitted by the policy guard; used for queries no rule or
/// decomposition could break down further. Echoes its parameters so the
/// caller sees what was asked for.
pub struct GenericExecute;

#[async_trait]
impl Action for GenericExecute {
    fn name(&self) -> &str {
        "generic_execute"
    }

    async fn invoke(&self, params: &Map<String, Value>) -> eyre::Result<Value> {
        Ok(json!({
            "action": "generic_execute",
            "params": params,
        }))
    }
}

/// Name-keyed action table, read-only after executor construction
#[derive(Clone, Default)]
pub struct ActionRegistry {
    actions: HashMap<String, Arc<dyn Action>>,
}

impl ActionRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-loaded with the reserved fallback action
    pub fn standard() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(GenericExecute));
        registry
    }

    /// Register an action under its own name
    pub fn register(&mut self, action: Arc<dyn Action>) {
        self.actions.insert(action.name().to_string(), action);
    }

    /// Register a closure as an action
    pub fn register_fn<F>(&mut self, name: &str, func: F)
    where
        F: Fn(&Map<String, Value>) -> eyre::Result<Value> + Send + Sync + 'static,
    {
        self.register(Arc::new(FnAction::new(name, func)));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Action>> {
        self.actions.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.actions.contains_key(name)
    }

    /// Registered action names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.actions.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}
