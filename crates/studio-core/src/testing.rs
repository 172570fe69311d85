//! In-memory gateway double for unit tests.

use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Mutex;
use studio_gateway::{GatewayError, GatewayResult, GatewayRpc};

#[derive(Default)]
pub(crate) struct ScriptedGateway {
    sticky: Mutex<HashMap<String, GatewayResult<Value>>>,
    queued: Mutex<HashMap<String, VecDeque<GatewayResult<Value>>>>,
    calls: Mutex<Vec<(String, Value)>>,
}

impl ScriptedGateway {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Answer every call to `method` with `payload`.
    pub(crate) fn on(self, method: &str, payload: Value) -> Self {
        self.sticky
            .lock()
            .unwrap()
            .insert(method.to_string(), Ok(payload));
        self
    }

    /// Fail every call to `method` with `err`.
    pub(crate) fn on_err(self, method: &str, err: GatewayError) -> Self {
        self.sticky
            .lock()
            .unwrap()
            .insert(method.to_string(), Err(err));
        self
    }

    /// Answer the next call to `method` with `result`, ahead of any sticky answer.
    pub(crate) fn then(self, method: &str, result: GatewayResult<Value>) -> Self {
        self.queued
            .lock()
            .unwrap()
            .entry(method.to_string())
            .or_default()
            .push_back(result);
        self
    }

    pub(crate) fn calls(&self) -> Vec<(String, Value)> {
        self.calls.lock().unwrap().clone()
    }

    pub(crate) fn methods(&self) -> Vec<String> {
        self.calls().into_iter().map(|(method, _)| method).collect()
    }

    pub(crate) fn count(&self, method: &str) -> usize {
        self.calls().iter().filter(|(m, _)| m == method).count()
    }

    pub(crate) fn params_of(&self, method: &str) -> Vec<Value> {
        self.calls()
            .into_iter()
            .filter(|(m, _)| m == method)
            .map(|(_, params)| params)
            .collect()
    }

    fn respond(&self, method: &str) -> GatewayResult<Value> {
        if let Some(result) = self
            .queued
            .lock()
            .unwrap()
            .get_mut(method)
            .and_then(VecDeque::pop_front)
        {
            return result;
        }
        self.sticky
            .lock()
            .unwrap()
            .get(method)
            .cloned()
            .unwrap_or_else(|| {
                Err(GatewayError::Response {
                    code: "UNKNOWN_METHOD".to_string(),
                    message: format!("unexpected method {method}"),
                })
            })
    }
}

impl GatewayRpc for ScriptedGateway {
    fn call(&self, method: &str, params: Value) -> impl Future<Output = GatewayResult<Value>> + Send {
        self.calls
            .lock()
            .unwrap()
            .push((method.to_string(), params));
        let result = self.respond(method);
        async move { result }
    }
}

pub(crate) fn conflict() -> GatewayError {
    GatewayError::Response {
        code: "INVALID_REQUEST".to_string(),
        message: "config changed since last load; re-run config.get and retry".to_string(),
    }
}

pub(crate) fn disconnected() -> GatewayError {
    GatewayError::Disconnected {
        message: "socket disconnected".to_string(),
    }
}
