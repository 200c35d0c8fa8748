//! Query planning.
//!
//! The solver turns a natural-language request into search queries and a
//! structured requirements object. Learned rejection refinements are folded
//! into the queries before each hop.

use serde_json::Value;
use std::sync::Arc;

use perception::{PriceRange, Requirements};
use solver_client::{ChatMessage, Solver};

use crate::error::Result;

/// A plan for one research hop.
#[derive(Debug, Clone)]
pub struct ResearchPlan {
    pub search_queries: Vec<String>,
    pub requirements: Requirements,
}

impl ResearchPlan {
    /// Fall back to the raw query when planning fails.
    pub fn fallback(query: &str) -> Self {
        Self {
            search_queries: vec![query.to_string()],
            requirements: Requirements::default(),
        }
    }
}

/// Ask the solver for a plan.
pub async fn plan(solver: &Arc<dyn Solver>, query: &str) -> Result<ResearchPlan> {
    let base = perception::prompts::load(
        "research_plan",
        perception::prompts::RESEARCH_PLAN_FALLBACK,
    );
    let prompt = format!(
        "{base}\n\nRequest: \"{query}\"\n\n\
         Respond with JSON: {{\"search_queries\": [\"...\", \"...\"], \
         \"hard_requirements\": [\"...\"], \"nice_to_haves\": [\"...\"], \
         \"price_range\": {{\"min\": null, \"max\": null}}, \
         \"recommended_brands\": [\"...\"], \"category\": \"...\"}}. \
         Search queries are what a person would type into a retailer search \
         box: 2 to 4 of them, most specific first. Hard requirements are \
         constraints the user stated or clearly implied; preferences go in \
         nice_to_haves."
    );

    let response = solver
        .complete_with_temperature(&[ChatMessage::user(prompt)], 0.3)
        .await?;

    let Some(value) = perception::jsonx::extract_json_object(&response) else {
        tracing::warn!("plan response unparseable, using raw query");
        return Ok(ResearchPlan::fallback(query));
    };

    let search_queries: Vec<String> = value
        .get("search_queries")
        .and_then(Value::as_array)
        .map(|a| {
            a.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .filter(|q| !q.trim().is_empty())
                .collect()
        })
        .unwrap_or_default();

    let requirements = Requirements {
        hard_requirements: string_list(&value, "hard_requirements"),
        nice_to_haves: string_list(&value, "nice_to_haves"),
        price_range: PriceRange {
            min: value.pointer("/price_range/min").and_then(Value::as_f64),
            max: value.pointer("/price_range/max").and_then(Value::as_f64),
        },
        recommended_brands: string_list(&value, "recommended_brands"),
        category: value
            .get("category")
            .and_then(Value::as_str)
            .map(str::to_string),
        keyed: Default::default(),
    };

    let plan = if search_queries.is_empty() {
        ResearchPlan {
            search_queries: vec![query.to_string()],
            requirements,
        }
    } else {
        ResearchPlan {
            search_queries,
            requirements,
        }
    };

    tracing::info!(
        queries = plan.search_queries.len(),
        hard = plan.requirements.hard_requirements.len(),
        "research plan built"
    );
    Ok(plan)
}

/// Fold rejection-tracker refinements into the plan's queries.
pub fn apply_refinements(plan: &mut ResearchPlan, refinements: &[String]) {
    if refinements.is_empty() {
        return;
    }
    let suffix = refinements.join(" ");
    for query in &mut plan.search_queries {
        for fragment in refinements {
            if !query.to_lowercase().contains(&fragment.to_lowercase()) {
                query.push(' ');
                query.push_str(fragment);
            }
        }
    }
    tracing::info!(suffix = %suffix, "query refinements applied");
}

fn string_list(value: &Value, key: &str) -> Vec<String> {
    value
        .get(key)
        .and_then(Value::as_array)
        .map(|a| a.iter().filter_map(Value::as_str).map(str::to_string).collect())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use solver_client::MockSolver;

    #[tokio::test]
    async fn test_plan_parses_full_response() {
        let solver: Arc<dyn Solver> = Arc::new(MockSolver::new().with_response(
            r#"{"search_queries": ["rtx 4060 gaming laptop", "nvidia gaming laptop 16gb"],
                "hard_requirements": ["NVIDIA RTX GPU", "laptop form factor"],
                "nice_to_haves": ["144Hz display"],
                "price_range": {"min": 800, "max": 1500},
                "recommended_brands": ["Acer", "ASUS"],
                "category": "gaming laptop"}"#,
        ));

        let plan = plan(&solver, "a gaming laptop with an nvidia gpu under $1500")
            .await
            .unwrap();
        assert_eq!(plan.search_queries.len(), 2);
        assert_eq!(plan.requirements.hard_requirements.len(), 2);
        assert_eq!(plan.requirements.price_range.max, Some(1500.0));
        assert_eq!(plan.requirements.recommended_brands, vec!["Acer", "ASUS"]);
    }

    #[tokio::test]
    async fn test_plan_falls_back_on_garbage() {
        let solver: Arc<dyn Solver> =
            Arc::new(MockSolver::new().with_response("I cannot help with that."));
        let plan = plan(&solver, "rtx laptop").await.unwrap();
        assert_eq!(plan.search_queries, vec!["rtx laptop".to_string()]);
    }

    #[test]
    fn test_refinements_append_once() {
        let mut plan = ResearchPlan {
            search_queries: vec![
                "rtx 4060 laptop".to_string(),
                "gaming laptop nvidia rtx gpu".to_string(),
            ],
            requirements: Requirements::default(),
        };
        apply_refinements(&mut plan, &["nvidia rtx gpu".to_string()]);

        assert_eq!(plan.search_queries[0], "rtx 4060 laptop nvidia rtx gpu");
        // Already contains the fragment; unchanged.
        assert_eq!(plan.search_queries[1], "gaming laptop nvidia rtx gpu");
    }
}
