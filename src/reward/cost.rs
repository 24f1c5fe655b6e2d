//! Cost penalty: resource usage normalized against a rolling per-task-class
//! baseline.

use std::sync::OnceLock;

use tiktoken_rs::{cl100k_base, CoreBPE};

/// Weights folding time, tool calls, and tokens into one raw cost figure
/// (millisecond-equivalents).
#[derive(Debug, Clone, Copy)]
pub struct CostWeights {
    pub time_ms: f64,
    pub tool_calls: f64,
    pub tokens: f64,
}

impl Default for CostWeights {
    fn default() -> Self {
        Self {
            time_ms: 1.0,
            tool_calls: 1000.0,
            tokens: 10.0,
        }
    }
}

/// Ratio cap: cost beyond 3x baseline stops accruing penalty.
pub const COST_RATIO_MAX: f64 = 3.0;

fn bpe() -> &'static CoreBPE {
    static BPE: OnceLock<CoreBPE> = OnceLock::new();
    BPE.get_or_init(|| cl100k_base().expect("Failed to load cl100k_base tokenizer"))
}

/// Count tokens in text using the cl100k_base tokenizer.
pub fn estimate_tokens(text: &str) -> usize {
    bpe().encode_with_special_tokens(text).len()
}

/// Raw cost of one iteration in millisecond-equivalents.
pub fn raw_cost(weights: &CostWeights, duration_ms: u64, tool_calls: u32, tokens: usize) -> f64 {
    weights.time_ms * duration_ms as f64
        + weights.tool_calls * tool_calls as f64
        + weights.tokens * tokens as f64
}

/// Normalized penalty: `cost/baseline` clipped to [0, 3], minus one, so a
/// variant cheaper than baseline earns a negative penalty.
pub fn cost_penalty(raw: f64, baseline: f64) -> f64 {
    let baseline = baseline.max(1.0);
    let ratio = (raw / baseline).clamp(0.0, COST_RATIO_MAX);
    ratio - 1.0
}

/// Fallback baseline when a task class has no history yet, scaled by rough
/// task complexity.
pub fn default_baseline_for(task: &str) -> f64 {
    let task = task.to_ascii_lowercase();
    let code_markers = ["code", "function", "class", "implement", "rust", "python"];
    let analysis_markers = ["analyze", "review", "explain", "compare"];
    if code_markers.iter().any(|m| task.contains(m)) {
        // ~45 s and ~3k tokens.
        45_000.0 + 3_000.0 * 10.0
    } else if analysis_markers.iter().any(|m| task.contains(m)) {
        35_000.0 + 2_500.0 * 10.0
    } else {
        25_000.0 + 1_500.0 * 10.0
    }
}
