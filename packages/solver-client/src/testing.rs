//! Scripted solver mock for tests.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, RwLock};

use crate::client::{ChatMessage, Solver};
use crate::error::{Result, SolverError};

/// A mock solver that replays scripted responses in order.
///
/// Records every prompt it receives so tests can assert on call shape.
#[derive(Default, Clone)]
pub struct MockSolver {
    responses: Arc<RwLock<VecDeque<String>>>,
    calls: Arc<RwLock<Vec<String>>>,
}

impl MockSolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a response to return from the next completion.
    pub fn with_response(self, response: impl Into<String>) -> Self {
        self.responses.write().unwrap().push_back(response.into());
        self
    }

    /// Queue several responses at once.
    pub fn with_responses(self, responses: impl IntoIterator<Item = impl Into<String>>) -> Self {
        {
            let mut queue = self.responses.write().unwrap();
            for r in responses {
                queue.push_back(r.into());
            }
        }
        self
    }

    /// Prompts received so far (user-role content, concatenated per call).
    pub fn calls(&self) -> Vec<String> {
        self.calls.read().unwrap().clone()
    }
}

#[async_trait]
impl Solver for MockSolver {
    async fn complete_with_temperature(
        &self,
        messages: &[ChatMessage],
        _temperature: f32,
    ) -> Result<String> {
        let prompt = messages
            .iter()
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        self.calls.write().unwrap().push(prompt);

        self.responses
            .write()
            .unwrap()
            .pop_front()
            .ok_or_else(|| SolverError::Malformed("mock solver exhausted".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_replays_in_order() {
        let solver = MockSolver::new().with_responses(["first", "second"]);

        assert_eq!(solver.complete("a").await.unwrap(), "first");
        assert_eq!(solver.complete("b").await.unwrap(), "second");
        assert!(solver.complete("c").await.is_err());

        let calls = solver.calls();
        assert_eq!(calls, vec!["a", "b", "c"]);
    }
}
