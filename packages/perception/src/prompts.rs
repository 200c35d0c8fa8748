//! Prompt loading with inline fallbacks.
//!
//! Base prompts live in the recipe directory (`RECIPES_DIR`, default
//! `recipes/`) and are loaded by name; call sites append their task context.
//! A missing recipe falls back to the compiled-in default so extraction
//! never stalls on a deployment artifact.

use solver_client::RecipeStore;
use std::sync::OnceLock;

fn store() -> &'static RecipeStore {
    static STORE: OnceLock<RecipeStore> = OnceLock::new();
    STORE.get_or_init(|| {
        let dir = std::env::var("RECIPES_DIR").unwrap_or_else(|_| "recipes".to_string());
        RecipeStore::new(dir)
    })
}

/// Load a named recipe, falling back to the inline default.
pub fn load(name: &str, fallback: &str) -> String {
    match store().load(name) {
        Ok(body) => body,
        Err(_) => {
            tracing::debug!(name, "recipe not found, using inline default");
            fallback.to_string()
        }
    }
}

/// Base prompt for structuring OCR groups into products.
pub const OCR_ITEMS_FALLBACK: &str = "Extract items for sale from these OCR text groups taken \
from a retail listing page. For each real product return an object with fields \"title\", \
\"price\" (raw string) and \"price_numeric\" (number). Ignore navigation, filters and \
advertising rows.";

/// Base prompt for zone identification during page calibration.
pub const ZONE_ANALYSIS_FALLBACK: &str = "You are analyzing the structure of a retail web page \
to locate its functional zones.";

/// Base prompt for evaluating products against requirements.
pub const VIABILITY_FALLBACK: &str = "Evaluate these products against the user's needs.";

/// Base prompt for extracting hardware specs from page text.
pub const PDP_SPECS_FALLBACK: &str = "From this product page text, extract the hardware specs \
relevant to the stated goal.";

/// Base prompt for calibrating PDP selectors.
pub const PDP_SELECTORS_FALLBACK: &str = "Pick the selectors for the main product price, the \
product title and the add-to-cart button. Prefer data-testid, stable ids, or semantic class \
names; never hashed CSS-in-JS classes.";

/// Base prompt for turning a shopping request into a research plan.
pub const RESEARCH_PLAN_FALLBACK: &str = "Turn this shopping request into a research plan.";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fallback_used_when_recipe_missing() {
        let prompt = load("definitely-not-a-recipe", OCR_ITEMS_FALLBACK);
        assert_eq!(prompt, OCR_ITEMS_FALLBACK);
    }
}
