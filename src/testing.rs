//! In-memory transports for unit tests.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::time::Instant;

use crate::error::TransportError;
use crate::request::{ExecutionResult, Operation};
use crate::transport::HttpTransport;

type Handler = Box<dyn Fn(&Operation) -> Result<ExecutionResult, TransportError> + Send + Sync>;

/// Replays a fixed script of responses, or answers through a handler.
pub(crate) struct ScriptedTransport {
    script: Mutex<VecDeque<Result<ExecutionResult, TransportError>>>,
    fallback: Option<ExecutionResult>,
    handler: Option<Handler>,
    log: Mutex<Vec<(Instant, Operation)>>,
}

impl ScriptedTransport {
    pub(crate) fn new(script: Vec<Result<ExecutionResult, TransportError>>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            fallback: None,
            handler: None,
            log: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn repeating(result: ExecutionResult) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(VecDeque::new()),
            fallback: Some(result),
            handler: None,
            log: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn with_handler<F>(handler: F) -> Arc<Self>
    where
        F: Fn(&Operation) -> Result<ExecutionResult, TransportError> + Send + Sync + 'static,
    {
        Arc::new(Self {
            script: Mutex::new(VecDeque::new()),
            fallback: None,
            handler: Some(Box::new(handler)),
            log: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn calls(&self) -> usize {
        self.log.lock().unwrap().len()
    }

    pub(crate) fn call_times(&self) -> Vec<Instant> {
        self.log.lock().unwrap().iter().map(|(at, _)| *at).collect()
    }

    pub(crate) fn operations(&self) -> Vec<Operation> {
        self.log.lock().unwrap().iter().map(|(_, op)| op.clone()).collect()
    }
}

#[async_trait]
impl HttpTransport for ScriptedTransport {
    async fn send(&self, operation: &Operation) -> Result<ExecutionResult, TransportError> {
        self.log
            .lock()
            .unwrap()
            .push((Instant::now(), operation.clone()));

        if let Some(handler) = &self.handler {
            return handler(operation);
        }

        if let Some(next) = self.script.lock().unwrap().pop_front() {
            return next;
        }

        self.fallback
            .clone()
            .ok_or_else(|| TransportError::new("script exhausted"))
    }
}
