//! Research orchestration.
//!
//! The outer control loop over the browser and perception stacks: plan
//! queries with the solver, drive a search engine like a human, classify and
//! extract vendor pages, verify candidates on their product detail pages,
//! filter for viability, and assemble the answer set. Progress is reported
//! through ordered typed events.
//!
//! - [`orchestrator`] - the control loop
//! - [`fetcher`] - resilient multi-transport fetching
//! - [`engines`] - search engine driving with a fallback chain
//! - [`planner`] - solver-backed query planning
//! - [`classify`] - PDP vs listing classification
//! - [`events`] - the research event emitter
//! - [`catalog`] - vendor catalog exploration

pub mod catalog;
pub mod classify;
pub mod engines;
pub mod error;
pub mod events;
pub mod fetcher;
pub mod orchestrator;
pub mod planner;

pub use catalog::{explore_catalog, CatalogResult};
pub use error::{ResearchError, Result};
pub use events::{EventEmitter, ResearchEvent};
pub use fetcher::{FetchResult, ResilientFetcher};
pub use orchestrator::{
    ResearchConfig, ResearchOrchestrator, ResearchOutcome, ResearchRequest, VendorProducts,
};
pub use planner::{plan, ResearchPlan};
