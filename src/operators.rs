//! The operator library: a closed set of pure recipe transforms, each
//! tagged with the framework it belongs to. The bandit's action set is
//! exactly this registry, filtered by the run's framework mask.

use rand::rngs::StdRng;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::engines::EngineKind;
use crate::prompts::{fewshot_for, NUDGES, SYSTEM_VOICES};

pub const TEMP_MIN: f64 = 0.1;
pub const TEMP_MAX: f64 = 1.5;
pub const TOP_K_MIN: u32 = 1;
pub const TOP_K_MAX: u32 = 100;
/// Default retrieval depth when an inject operator enables a context source.
pub const CONTEXT_K_DEFAULT: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Framework {
    Seal,
    Web,
    Engine,
    Sampling,
}

impl Framework {
    pub const ALL: [Framework; 4] = [
        Framework::Seal,
        Framework::Web,
        Framework::Engine,
        Framework::Sampling,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Seal => "SEAL",
            Self::Web => "WEB",
            Self::Engine => "ENGINE",
            Self::Sampling => "SAMPLING",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    ChangeSystem,
    ChangeNudge,
    RaiseTemp,
    LowerTemp,
    AddFewshot,
    InjectMemory,
    InjectRag,
    ToggleWeb,
    UseAltEngine,
    RaiseTopK,
    LowerTopK,
}

impl Operator {
    /// Registry order. Warm-start tie-breaks follow this order.
    pub const ALL: [Operator; 11] = [
        Operator::ChangeSystem,
        Operator::ChangeNudge,
        Operator::RaiseTemp,
        Operator::LowerTemp,
        Operator::AddFewshot,
        Operator::InjectMemory,
        Operator::InjectRag,
        Operator::ToggleWeb,
        Operator::UseAltEngine,
        Operator::RaiseTopK,
        Operator::LowerTopK,
    ];

    pub fn framework(self) -> Framework {
        match self {
            Self::ChangeSystem
            | Self::ChangeNudge
            | Self::RaiseTemp
            | Self::LowerTemp
            | Self::AddFewshot
            | Self::InjectMemory
            | Self::InjectRag => Framework::Seal,
            Self::ToggleWeb => Framework::Web,
            Self::UseAltEngine => Framework::Engine,
            Self::RaiseTopK | Self::LowerTopK => Framework::Sampling,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::ChangeSystem => "change_system",
            Self::ChangeNudge => "change_nudge",
            Self::RaiseTemp => "raise_temp",
            Self::LowerTemp => "lower_temp",
            Self::AddFewshot => "add_fewshot",
            Self::InjectMemory => "inject_memory",
            Self::InjectRag => "inject_rag",
            Self::ToggleWeb => "toggle_web",
            Self::UseAltEngine => "use_alt_engine",
            Self::RaiseTopK => "raise_top_k",
            Self::LowerTopK => "lower_top_k",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|op| op.as_str() == s)
    }

    /// Operators visible under a framework mask, in registry order.
    pub fn allowed(mask: &[Framework]) -> Vec<Operator> {
        Self::ALL
            .into_iter()
            .filter(|op| mask.contains(&op.framework()))
            .collect()
    }
}

/// The concrete set of generation parameters and context flags used for one
/// iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recipe {
    pub system: String,
    pub nudge: String,
    pub temperature: f64,
    pub top_k: u32,
    pub memory_k: u32,
    pub rag_k: u32,
    pub use_web: bool,
    pub engine: EngineKind,
    pub fewshot: Option<String>,
}

impl Default for Recipe {
    fn default() -> Self {
        Self {
            system: SYSTEM_VOICES[0].to_string(),
            nudge: NUDGES[0].to_string(),
            temperature: 0.7,
            top_k: 40,
            memory_k: 0,
            rag_k: 0,
            use_web: false,
            engine: EngineKind::Local,
            fewshot: None,
        }
    }
}

/// Inputs an operator may consult beyond the base recipe.
#[derive(Debug, Clone)]
pub struct OperatorContext<'a> {
    pub task_class: &'a str,
    /// Retrieval depth the run was configured with; inject operators use it
    /// when the base recipe carries none.
    pub memory_k: u32,
    pub rag_k: u32,
}

fn rotate(catalog: &[&'static str], current: &str) -> String {
    let idx = catalog.iter().position(|v| *v == current);
    let next = match idx {
        Some(i) => (i + 1) % catalog.len(),
        None => 0,
    };
    catalog[next].to_string()
}

/// Apply one operator to a base recipe, producing the mutated recipe.
/// Pure in `(recipe, ctx, rng)`; the caller owns the PRNG so selection is
/// reproducible under a pinned seed.
pub fn apply(op: Operator, recipe: &Recipe, ctx: &OperatorContext<'_>, rng: &mut StdRng) -> Recipe {
    let mut next = recipe.clone();
    match op {
        Operator::ChangeSystem => {
            next.system = rotate(&SYSTEM_VOICES, &recipe.system);
        }
        Operator::ChangeNudge => {
            next.nudge = rotate(&NUDGES, &recipe.nudge);
        }
        Operator::RaiseTemp => {
            let delta = rng.gen_range(0.1..0.3);
            next.temperature = (recipe.temperature + delta).min(TEMP_MAX);
        }
        Operator::LowerTemp => {
            let delta = rng.gen_range(0.1..0.3);
            next.temperature = (recipe.temperature - delta).max(TEMP_MIN);
        }
        Operator::AddFewshot => {
            next.fewshot = Some(fewshot_for(ctx.task_class).to_string());
        }
        Operator::InjectMemory => {
            next.memory_k = if recipe.memory_k > 0 {
                recipe.memory_k
            } else if ctx.memory_k > 0 {
                ctx.memory_k
            } else {
                CONTEXT_K_DEFAULT
            };
        }
        Operator::InjectRag => {
            next.rag_k = if recipe.rag_k > 0 {
                recipe.rag_k
            } else if ctx.rag_k > 0 {
                ctx.rag_k
            } else {
                CONTEXT_K_DEFAULT
            };
        }
        Operator::ToggleWeb => {
            next.use_web = !recipe.use_web;
        }
        Operator::UseAltEngine => {
            next.engine = recipe.engine.alternate();
        }
        Operator::RaiseTopK => {
            let delta = rng.gen_range(5..=15);
            next.top_k = (recipe.top_k + delta).min(TOP_K_MAX);
        }
        Operator::LowerTopK => {
            let delta = rng.gen_range(5..=15);
            next.top_k = recipe.top_k.saturating_sub(delta).max(TOP_K_MIN);
        }
    }
    next
}

/// Context snippets gathered for one iteration, per the recipe's flags.
#[derive(Debug, Clone, Default)]
pub struct GatheredContext {
    pub memory: Vec<String>,
    pub rag: Vec<String>,
    pub web: Vec<String>,
}

impl GatheredContext {
    pub fn is_empty(&self) -> bool {
        self.memory.is_empty() && self.rag.is_empty() && self.web.is_empty()
    }
}

/// Splice the task, few-shot examples, gathered context, and nudge into the
/// final user prompt.
pub fn assemble_prompt(recipe: &Recipe, task: &str, ctx: &GatheredContext) -> String {
    let mut sections: Vec<String> = Vec::new();
    if let Some(fewshot) = &recipe.fewshot {
        sections.push(format!("Examples:\n{fewshot}"));
    }
    if !ctx.rag.is_empty() {
        sections.push(format!("Reference Context:\n{}", ctx.rag.join("\n")));
    }
    if !ctx.memory.is_empty() {
        sections.push(format!("Memory Context:\n{}", ctx.memory.join("\n")));
    }
    if !ctx.web.is_empty() {
        sections.push(format!("Web Context:\n{}", ctx.web.join("\n")));
    }

    if sections.is_empty() {
        format!("{task}\n\nConstraints:\n{}", recipe.nudge)
    } else {
        format!(
            "{task}\n\nContext:\n{}\n\nConstraints:\n{}",
            sections.join("\n\n"),
            recipe.nudge
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn ctx() -> OperatorContext<'static> {
        OperatorContext {
            task_class: "code",
            memory_k: 3,
            rag_k: 3,
        }
    }

    #[test]
    fn registry_has_eleven_operators_with_expected_frameworks() {
        assert_eq!(Operator::ALL.len(), 11);
        let seal = Operator::ALL
            .iter()
            .filter(|op| op.framework() == Framework::Seal)
            .count();
        assert_eq!(seal, 7);
        assert_eq!(Operator::ToggleWeb.framework(), Framework::Web);
        assert_eq!(Operator::UseAltEngine.framework(), Framework::Engine);
    }

    #[test]
    fn mask_filters_by_framework() {
        let allowed = Operator::allowed(&[Framework::Sampling]);
        assert_eq!(allowed, vec![Operator::RaiseTopK, Operator::LowerTopK]);
        let all = Operator::allowed(&Framework::ALL);
        assert_eq!(all.len(), 11);
    }

    #[test]
    fn temperature_clamps_hold() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut recipe = Recipe {
            temperature: 1.45,
            ..Recipe::default()
        };
        for _ in 0..10 {
            recipe = apply(Operator::RaiseTemp, &recipe, &ctx(), &mut rng);
            assert!(recipe.temperature <= TEMP_MAX);
        }
        for _ in 0..20 {
            recipe = apply(Operator::LowerTemp, &recipe, &ctx(), &mut rng);
            assert!(recipe.temperature >= TEMP_MIN);
        }
    }

    #[test]
    fn top_k_clamps_hold() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut recipe = Recipe {
            top_k: 95,
            ..Recipe::default()
        };
        for _ in 0..5 {
            recipe = apply(Operator::RaiseTopK, &recipe, &ctx(), &mut rng);
            assert!(recipe.top_k <= TOP_K_MAX);
        }
        for _ in 0..20 {
            recipe = apply(Operator::LowerTopK, &recipe, &ctx(), &mut rng);
            assert!(recipe.top_k >= TOP_K_MIN);
        }
    }

    #[test]
    fn system_rotation_cycles_voices() {
        let mut rng = StdRng::seed_from_u64(1);
        let base = Recipe::default();
        let r1 = apply(Operator::ChangeSystem, &base, &ctx(), &mut rng);
        assert_eq!(r1.system, SYSTEM_VOICES[1]);
        let r2 = apply(Operator::ChangeSystem, &r1, &ctx(), &mut rng);
        assert_eq!(r2.system, SYSTEM_VOICES[2]);
    }

    #[test]
    fn inject_operators_use_run_depth() {
        let mut rng = StdRng::seed_from_u64(1);
        let base = Recipe::default();
        let r = apply(Operator::InjectMemory, &base, &ctx(), &mut rng);
        assert_eq!(r.memory_k, 3);
        let r = apply(Operator::InjectRag, &base, &ctx(), &mut rng);
        assert_eq!(r.rag_k, 3);
    }

    #[test]
    fn toggle_web_flips() {
        let mut rng = StdRng::seed_from_u64(1);
        let base = Recipe::default();
        let r = apply(Operator::ToggleWeb, &base, &ctx(), &mut rng);
        assert!(r.use_web);
        let r2 = apply(Operator::ToggleWeb, &r, &ctx(), &mut rng);
        assert!(!r2.use_web);
    }

    #[test]
    fn assemble_prompt_splices_sections_in_order() {
        let recipe = Recipe {
            fewshot: Some("Example: x".to_string()),
            ..Recipe::default()
        };
        let gathered = GatheredContext {
            rag: vec!["doc snippet".to_string()],
            ..GatheredContext::default()
        };
        let p = assemble_prompt(&recipe, "do the thing", &gathered);
        let fewshot_at = p.find("Examples:").unwrap();
        let rag_at = p.find("Reference Context:").unwrap();
        let nudge_at = p.find("Constraints:").unwrap();
        assert!(fewshot_at < rag_at && rag_at < nudge_at);
    }

    #[test]
    fn bare_prompt_has_no_context_header() {
        let p = assemble_prompt(&Recipe::default(), "task", &GatheredContext::default());
        assert!(!p.contains("Context:\n"));
        assert!(p.contains("Constraints:"));
    }

    #[test]
    fn operator_names_round_trip() {
        for op in Operator::ALL {
            assert_eq!(Operator::from_str(op.as_str()), Some(op));
        }
    }
}
