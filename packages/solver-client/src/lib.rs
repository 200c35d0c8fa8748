//! Client for the solver text-completion endpoint.
//!
//! Every LLM interaction in the workspace goes through the single contract
//! defined here: POST `{model, messages, temperature, max_tokens}`, receive
//! `{choices: [{message: {content}}]}`. Prompts are loaded by name from a
//! recipe directory rather than embedded in call sites.
//!
//! # Example
//!
//! ```rust,ignore
//! use solver_client::{Solver, SolverClient};
//!
//! let solver = SolverClient::from_env()?;
//! let answer = solver.complete("Summarize this page: ...").await?;
//! ```

pub mod client;
pub mod error;
pub mod recipes;
pub mod testing;

pub use client::{ChatMessage, Solver, SolverClient};
pub use error::{Result, SolverError};
pub use recipes::RecipeStore;
pub use testing::MockSolver;
