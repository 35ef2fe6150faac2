//! Scripted [`ProviderApi`] test double
//!
//! Used by the core's own tests and by the provider crates' controller
//! tests. Responses are staged per operation and consumed in order; every
//! call is recorded so tests can assert on what reached the provider.

use crate::api::{ApiError, ProviderApi};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

type StagedResult = std::result::Result<Value, ApiError>;

/// A mock provider API with scripted responses and a call log.
pub struct MockApi {
    provider: String,
    service: String,
    responses: Mutex<HashMap<String, VecDeque<StagedResult>>>,
    calls: Mutex<Vec<(String, Value)>>,
}

impl MockApi {
    pub fn new(provider: impl Into<String>, service: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            service: service.into(),
            responses: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Stage a successful response for the next call to `operation`.
    pub fn stage_ok(&self, operation: &str, response: Value) {
        self.responses
            .lock()
            .unwrap()
            .entry(operation.to_string())
            .or_default()
            .push_back(Ok(response));
    }

    /// Stage an error for the next call to `operation`.
    pub fn stage_err(&self, operation: &str, error: ApiError) {
        self.responses
            .lock()
            .unwrap()
            .entry(operation.to_string())
            .or_default()
            .push_back(Err(error));
    }

    /// All recorded calls, in order.
    pub fn calls(&self) -> Vec<(String, Value)> {
        self.calls.lock().unwrap().clone()
    }

    /// Arguments of every call to `operation`, in order.
    pub fn calls_for(&self, operation: &str) -> Vec<Value> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(op, _)| op == operation)
            .map(|(_, args)| args.clone())
            .collect()
    }

    pub fn call_count(&self, operation: &str) -> usize {
        self.calls_for(operation).len()
    }
}

#[async_trait]
impl ProviderApi for MockApi {
    fn provider(&self) -> &str {
        &self.provider
    }

    fn service(&self) -> &str {
        &self.service
    }

    async fn invoke(&self, operation: &str, args: Value) -> std::result::Result<Value, ApiError> {
        self.calls
            .lock()
            .unwrap()
            .push((operation.to_string(), args));

        let staged = self
            .responses
            .lock()
            .unwrap()
            .get_mut(operation)
            .and_then(|queue| queue.pop_front());

        // Unstaged operations succeed with an empty object so incidental
        // calls (tagging, attribute tweaks) don't need explicit staging.
        staged.unwrap_or_else(|| Ok(Value::Object(Default::default())))
    }
}
