//! Scripted LLM for tests: pops one canned response per `invoke`.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::message::Message;
use crate::registry::ToolSpec;

use super::{LlmClient, LlmError, LlmResponse};

/// Mock LLM returning pre-scripted responses in order.
///
/// Records every `invoke` input so tests can assert on the dialog the runtime
/// built. Running out of scripted responses is an error: tests script exactly
/// as many turns as they expect.
pub struct MockLlm {
    responses: Mutex<VecDeque<LlmResponse>>,
    calls: Mutex<Vec<Vec<Message>>>,
}

impl MockLlm {
    pub fn new(responses: Vec<LlmResponse>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Dialogs seen so far, one entry per `invoke`.
    pub fn recorded_calls(&self) -> Vec<Vec<Message>> {
        self.calls.lock().unwrap().clone()
    }

    pub fn remaining(&self) -> usize {
        self.responses.lock().unwrap().len()
    }
}

#[async_trait]
impl LlmClient for MockLlm {
    async fn invoke(
        &self,
        messages: &[Message],
        _tools: &[ToolSpec],
    ) -> Result<LlmResponse, LlmError> {
        self.calls.lock().unwrap().push(messages.to_vec());
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| LlmError::Response("mock llm: no scripted response left".into()))
    }
}
