//! Process reward: cheap heuristics over the output text measuring how the
//! response was built, not whether it is right.

use std::sync::OnceLock;

use regex::Regex;

fn reasoning_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            r"(?i)\b(first|second|third|next|then|finally)\b",
            r"(?i)\b(because|since|therefore|thus|hence)\b",
            r"(?i)(step \d+|phase \d+|^\d+\))",
            r"(?i)\b(consider|note that|important)\b",
        ]
        .iter()
        .map(|p| Regex::new(p).expect("valid reasoning pattern"))
        .collect()
    })
}

/// Structured-reasoning score: fraction of marker families present, with
/// two families already counting as fully structured.
pub fn structured_reasoning(output: &str) -> f64 {
    let hits = reasoning_patterns()
        .iter()
        .filter(|re| re.is_match(output))
        .count();
    ((hits as f64) / 2.0).min(1.0)
}

/// Code-block validity: fences must pair up and brackets must balance
/// inside fenced blocks. Outputs with no code score a neutral 1.0.
pub fn code_block_validity(output: &str) -> f64 {
    let fence_count = output.matches("```").count();
    if fence_count == 0 {
        return 1.0;
    }
    if fence_count % 2 != 0 {
        return 0.0;
    }

    let mut score: f64 = 1.0;
    let mut in_block = false;
    let mut block = String::new();
    for line in output.lines() {
        if line.trim_start().starts_with("```") {
            if in_block {
                if !brackets_balanced(&block) {
                    score = score.min(0.5);
                }
                block.clear();
            }
            in_block = !in_block;
            continue;
        }
        if in_block {
            block.push_str(line);
            block.push('\n');
        }
    }
    score
}

fn brackets_balanced(code: &str) -> bool {
    let mut stack: Vec<char> = Vec::new();
    for ch in code.chars() {
        match ch {
            '(' | '[' | '{' => stack.push(ch),
            ')' => {
                if stack.pop() != Some('(') {
                    return false;
                }
            }
            ']' => {
                if stack.pop() != Some('[') {
                    return false;
                }
            }
            '}' => {
                if stack.pop() != Some('{') {
                    return false;
                }
            }
            _ => {}
        }
    }
    stack.is_empty()
}

/// Refusal-of-hallucination: admissions of uncertainty score, confident
/// fabrication markers do not. Neutral 0.5 when no signal either way.
pub fn uncertainty_admission(output: &str) -> f64 {
    static ADMIT: OnceLock<Regex> = OnceLock::new();
    let admit = ADMIT.get_or_init(|| {
        Regex::new(
            r"(?i)\b(i'm not sure|i am not sure|cannot verify|can't verify|uncertain|may not be accurate|don't have enough information|unable to confirm)\b",
        )
        .expect("valid admission pattern")
    });
    static FABRICATE: OnceLock<Regex> = OnceLock::new();
    let fabricate = FABRICATE.get_or_init(|| {
        Regex::new(r"(?i)\b(definitely|guaranteed|always works|100% certain)\b")
            .expect("valid fabrication pattern")
    });

    let admits = admit.is_match(output);
    let overclaims = fabricate.is_match(output);
    match (admits, overclaims) {
        (true, false) => 1.0,
        (true, true) => 0.5,
        (false, false) => 0.5,
        (false, true) => 0.0,
    }
}

/// Fraction of task-provided assertions literally present in the output
/// (case-insensitive). No assertions means full coverage.
pub fn assertion_coverage(output: &str, assertions: &[String]) -> f64 {
    if assertions.is_empty() {
        return 1.0;
    }
    let haystack = output.to_ascii_lowercase();
    let satisfied = assertions
        .iter()
        .filter(|a| haystack.contains(&a.to_ascii_lowercase()))
        .count();
    satisfied as f64 / assertions.len() as f64
}

/// Mean of the four sub-scores, each in [0, 1].
pub fn process_reward(output: &str, assertions: &[String]) -> f64 {
    let subs = [
        structured_reasoning(output),
        code_block_validity(output),
        uncertainty_admission(output),
        assertion_coverage(output, assertions),
    ];
    subs.iter().sum::<f64>() / subs.len() as f64
}
