//! ABOUTME: Mock agent executors for tests
//! ABOUTME: Scripted reply sequences with optional per-call delays

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

use maestro_core::{
    AgentExecutionInput, AgentExecutionOutput, AgentExecutor, MaestroError, Result,
};

/// One planned reply of a ScriptedExecutor
#[derive(Debug, Clone)]
pub enum ScriptedReply {
    /// Successful output with this result value
    Success(Value),
    /// `success: false` output with this error message
    Failure(String),
    /// Transport-level error
    TransientError(String),
}

struct Planned {
    reply: ScriptedReply,
    delay: Option<Duration>,
}

/// Executor that replays a scripted sequence of replies.
///
/// When the script runs out, the last reply repeats. Prompts are
/// recorded for assertions.
pub struct ScriptedExecutor {
    script: Mutex<VecDeque<Planned>>,
    last: Mutex<Option<ScriptedReply>>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            last: Mutex::new(None),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn then(self, reply: ScriptedReply) -> Self {
        self.script.lock().push_back(Planned { reply, delay: None });
        self
    }

    pub fn then_success(self, result: Value) -> Self {
        self.then(ScriptedReply::Success(result))
    }

    pub fn then_failure(self, message: impl Into<String>) -> Self {
        self.then(ScriptedReply::Failure(message.into()))
    }

    pub fn then_delayed_success(self, result: Value, delay: Duration) -> Self {
        self.script.lock().push_back(Planned {
            reply: ScriptedReply::Success(result),
            delay: Some(delay),
        });
        self
    }

    /// Prompts received so far
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().clone()
    }

    /// Number of calls received
    pub fn call_count(&self) -> usize {
        self.prompts.lock().len()
    }
}

impl Default for ScriptedExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AgentExecutor for ScriptedExecutor {
    async fn execute(&self, input: AgentExecutionInput) -> Result<AgentExecutionOutput> {
        self.prompts.lock().push(input.prompt.clone());
        let planned = self.script.lock().pop_front();
        let (reply, delay) = match planned {
            Some(planned) => {
                *self.last.lock() = Some(planned.reply.clone());
                (planned.reply, planned.delay)
            }
            None => {
                let repeat = self.last.lock().clone().unwrap_or_else(|| {
                    ScriptedReply::Failure("scripted executor exhausted".into())
                });
                (repeat, None)
            }
        };
        let started = Instant::now();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let duration_ms = started.elapsed().as_millis() as u64;
        match reply {
            ScriptedReply::Success(result) => {
                Ok(AgentExecutionOutput::success(result, duration_ms))
            }
            ScriptedReply::Failure(message) => {
                Ok(AgentExecutionOutput::failure(message, duration_ms))
            }
            ScriptedReply::TransientError(message) => {
                Err(MaestroError::Transient { message })
            }
        }
    }
}

/// Executor that echoes the prompt after an optional delay
pub struct EchoExecutor {
    delay: Option<Duration>,
    prompts: Mutex<Vec<String>>,
}

impl EchoExecutor {
    pub fn new() -> Self {
        Self {
            delay: None,
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().clone()
    }
}

impl Default for EchoExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AgentExecutor for EchoExecutor {
    async fn execute(&self, input: AgentExecutionInput) -> Result<AgentExecutionOutput> {
        self.prompts.lock().push(input.prompt.clone());
        let started = Instant::now();
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        Ok(AgentExecutionOutput::success(
            Value::String(input.prompt),
            started.elapsed().as_millis() as u64,
        ))
    }
}
