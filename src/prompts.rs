//! Prompt text: system voices, nudges, few-shot catalogs, and the judge
//! prompt templates. Provider-agnostic.

/// Enumerated system voices the `change_system` operator rotates through.
pub const SYSTEM_VOICES: [&str; 5] = [
    "You are a concise senior engineer. Return precise, directly usable output.",
    "You are a careful analyst. Explain steps briefly and verify constraints.",
    "You are a creative optimizer. Offer improved alternatives and rationale.",
    "You are a detail-oriented specialist. Focus on accuracy and completeness.",
    "You are an experienced architect. Design robust and scalable solutions.",
];

/// Nudge lines the `change_nudge` operator rotates through.
pub const NUDGES: [&str; 7] = [
    "Respond in bullet points.",
    "Prioritize correctness and include one test example.",
    "Add a short checklist at the end.",
    "Use concise, technical language.",
    "Provide step-by-step reasoning.",
    "Include potential edge cases.",
    "Format as structured sections.",
];

/// Few-shot examples keyed by task class.
const FEWSHOT_EXAMPLES: [(&str, &str); 4] = [
    (
        "code",
        "Example: Write a function to reverse a string.\nfn reverse(s: &str) -> String { s.chars().rev().collect() }",
    ),
    (
        "analysis",
        "Example: Analyze this data pattern.\nPattern shows 20% increase in usage during peak hours, suggesting need for scaling.",
    ),
    (
        "debug",
        "Example: Fix this bug.\nIssue: index out of bounds on line 42. Solution: add a bounds check before the access.",
    ),
    (
        "design",
        "Example: Design a user login system.\nComponents: authentication service, session management, password hashing, rate limiting.",
    ),
];

/// Few-shot block for a task class; falls back to the code example.
pub fn fewshot_for(task_class: &str) -> &'static str {
    let key = task_class.trim().to_ascii_lowercase();
    FEWSHOT_EXAMPLES
        .iter()
        .find(|(k, _)| *k == key)
        .map(|(_, v)| *v)
        .unwrap_or(FEWSHOT_EXAMPLES[0].1)
}

// =============================================================================
// Judge prompts
// =============================================================================

pub const JUDGE_SYSTEM: &str = "You are an expert evaluator. Rate the quality of an AI response for the given task.\n\n\
Consider:\n\
- Accuracy and correctness\n\
- Completeness and thoroughness\n\
- Clarity and coherence\n\
- Relevance to the task\n\
- Practical usefulness\n\n\
Return ONLY a JSON object with:\n\
{\n  \"score\": <float 0.0-1.0>,\n  \"reasoning\": \"<brief explanation>\"\n}";

pub const TIE_BREAKER_SYSTEM: &str = "You are an expert evaluator resolving a disagreement between two other judges.\n\n\
Two AI evaluators have scored the same response but gave significantly different scores. \
Review the original task and response, consider both previous evaluations, and make a final, \
definitive judgment.\n\n\
Return ONLY a JSON object with:\n\
{\n  \"score\": <float 0.0-1.0>,\n  \"reasoning\": \"<explanation of your decision>\"\n}";

/// First-round judge prompt.
pub fn build_judge_prompt(task: &str, assertions: &[String], output: &str) -> String {
    let mut prompt = format!("Task: {task}\n\n");
    if !assertions.is_empty() {
        prompt.push_str("Requirements:\n");
        for a in assertions {
            prompt.push_str(&format!("- {a}\n"));
        }
        prompt.push('\n');
    }
    prompt.push_str(&format!(
        "AI Response to Evaluate:\n{output}\n\nPlease evaluate this response's quality."
    ));
    prompt
}

/// Tie-breaker prompt carrying both prior verdicts.
pub fn build_tie_breaker_prompt(
    task: &str,
    assertions: &[String],
    output: &str,
    judge1: (&str, f64, Option<&str>),
    judge2: (&str, f64, Option<&str>),
) -> String {
    let mut prompt = format!("Original Task: {task}\n\n");
    if !assertions.is_empty() {
        prompt.push_str("Requirements:\n");
        for a in assertions {
            prompt.push_str(&format!("- {a}\n"));
        }
        prompt.push('\n');
    }
    prompt.push_str(&format!("AI Response Being Evaluated:\n{output}\n\n"));
    prompt.push_str(&format!(
        "JUDGE 1 ({}) - Score: {:.3}\nReasoning: {}\n\n",
        judge1.0,
        judge1.1,
        judge1.2.unwrap_or("N/A")
    ));
    prompt.push_str(&format!(
        "JUDGE 2 ({}) - Score: {:.3}\nReasoning: {}\n\n",
        judge2.0,
        judge2.1,
        judge2.2.unwrap_or("N/A")
    ));
    prompt.push_str("The judges disagree significantly. Please make the final decision.");
    prompt
}
