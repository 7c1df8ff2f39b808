//! Static Scanner Validator (C11, §4.5): a heuristic linter run on every
//! newly-generated scanner before it is ever executed. Operates on raw
//! source text — the language the LLM collaborator emits is out of scope
//! (§1) — so these are structural/textual heuristics, not a real parser.

use crate::error::Violation;

#[derive(Debug, Clone)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub violations: Vec<Violation>,
}

impl ValidationResult {
    fn ok() -> Self {
        Self {
            is_valid: true,
            violations: Vec::new(),
        }
    }
}

/// Runs the truncation check (§4.5.1) followed by the four structural
/// look-ahead heuristics (§4.5). Truncation is checked first and reported
/// distinctly so callers can decide whether to raise `MAX_TOKENS_GENERATION`
/// instead of simply regenerating (§7).
pub fn validate(code: &str) -> ValidationResult {
    let mut violations = Vec::new();

    if let Some(v) = check_truncation(code) {
        violations.push(v);
        // Truncated code can't be reasoned about further; stop here.
        return ValidationResult {
            is_valid: false,
            violations,
        };
    }

    violations.extend(check_extremum_before_loop(code));
    violations.extend(check_future_slicing(code));
    violations.extend(check_whole_array_aggregate(code));
    violations.extend(check_peak_index_offset(code));

    if violations.is_empty() {
        ValidationResult::ok()
    } else {
        ValidationResult {
            is_valid: false,
            violations,
        }
    }
}

/// §4.5.1: unbalanced braces/parens/brackets, or source that doesn't end in
/// a statement terminator.
fn check_truncation(code: &str) -> Option<Violation> {
    let trimmed = code.trim_end();
    if trimmed.is_empty() {
        return Some(Violation {
            rule: "TRUNCATION".to_string(),
            message: "generated code is empty".to_string(),
        });
    }

    let mut depth_curly = 0i32;
    let mut depth_paren = 0i32;
    let mut depth_square = 0i32;
    for c in trimmed.chars() {
        match c {
            '{' => depth_curly += 1,
            '}' => depth_curly -= 1,
            '(' => depth_paren += 1,
            ')' => depth_paren -= 1,
            '[' => depth_square += 1,
            ']' => depth_square -= 1,
            _ => {}
        }
    }
    if depth_curly != 0 || depth_paren != 0 || depth_square != 0 {
        return Some(Violation {
            rule: "TRUNCATION".to_string(),
            message: "unbalanced braces/parens/brackets — generation likely truncated".to_string(),
        });
    }

    let last_char = trimmed.chars().last().unwrap();
    if !matches!(last_char, ';' | '}' | ')' | ']') {
        return Some(Violation {
            rule: "TRUNCATION".to_string(),
            message: "code does not end in a statement terminator".to_string(),
        });
    }

    None
}

/// §4.5 rule 1: iteration that traverses all bars to find the day's
/// high/low *before* the main scanning loop. Heuristic: a
/// reduce/sort/max/min call over the full bar array appears textually
/// before the first `for`/`while` loop that looks like the per-bar scan.
fn check_extremum_before_loop(code: &str) -> Option<Violation> {
    let extremum_markers = ["highOfDay", "lowOfDay", "Math.max(...bars", "Math.min(...bars", ".sort("];
    let first_extremum = extremum_markers
        .iter()
        .filter_map(|m| code.find(m))
        .min();
    let first_loop = find_first_scan_loop(code);

    match (first_extremum, first_loop) {
        (Some(ext_pos), Some(loop_pos)) if ext_pos < loop_pos => Some(Violation {
            rule: "LOOKAHEAD".to_string(),
            message: "locates the day's high/low before the main scanning loop".to_string(),
        }),
        (Some(_), None) => Some(Violation {
            rule: "LOOKAHEAD".to_string(),
            message: "locates the day's high/low with no bounded scanning loop".to_string(),
        }),
        _ => None,
    }
}

fn find_first_scan_loop(code: &str) -> Option<usize> {
    ["for (", "for(", "while (", "while("]
        .iter()
        .filter_map(|m| code.find(m))
        .min()
}

/// §4.5 rule 2: slicing a bar array with an upper bound beyond the current
/// loop index (e.g. `bars.slice(i, bars.length)`, `bars[i:]` reaching past
/// `i`, or any `bars.slice(` call whose arguments reference `bars.length`
/// without also referencing the loop index as an upper bound).
fn check_future_slicing(code: &str) -> Option<Violation> {
    let needles = [".slice(i,", ".slice(i +", "bars[i:]", "bars.slice(i)"];
    if needles.iter().any(|n| code.contains(n)) && code.contains("bars.length") {
        return Some(Violation {
            rule: "LOOKAHEAD".to_string(),
            message: "slices the bar array past the current loop index".to_string(),
        });
    }
    None
}

/// §4.5 rule 3: aggregate functions (`reduce`, `sort`, `max`, `min`, `avg`)
/// called on the entire day's bar array before any signal is emitted.
fn check_whole_array_aggregate(code: &str) -> Option<Violation> {
    let emit_pos = code.find("emitSignal").or_else(|| code.find("return signal"));
    let aggregate_markers = ["bars.reduce(", "bars.map(", "allBars.sort(", "dayBars.sort("];
    let first_aggregate = aggregate_markers.iter().filter_map(|m| code.find(m)).min();

    match (first_aggregate, emit_pos) {
        (Some(agg_pos), Some(emit)) if agg_pos < emit => Some(Violation {
            rule: "LOOKAHEAD".to_string(),
            message: "aggregates the entire day's bars before emitting a signal".to_string(),
        }),
        (Some(_), None) => Some(Violation {
            rule: "LOOKAHEAD".to_string(),
            message: "aggregates the entire day's bars with no bounded signal emission".to_string(),
        }),
        _ => None,
    }
}

/// §4.5 rule 4: "peak index + N" constructs that assume future knowledge
/// (e.g. `peakIndex + 1`, `highIndex + offset`).
fn check_peak_index_offset(code: &str) -> Option<Violation> {
    let markers = ["peakIndex +", "highIndex +", "lowIndex +", "extremumIndex +"];
    if markers.iter().any(|m| code.contains(m)) {
        return Some(Violation {
            rule: "LOOKAHEAD".to_string(),
            message: "uses a peak-index-plus-offset construct that assumes future knowledge".to_string(),
        });
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_scanner_that_sorts_full_day_then_signals() {
        // §8 S1: sorts the full day's bars by high, returns the top bar's
        // time as the signal.
        let code = r#"
            function scan(bars) {
                const sorted = [...bars].sort((a, b) => b.high - a.high);
                const top = sorted[0];
                return emitSignal(top.time, "LONG");
            }
        "#;
        let result = validate(code);
        assert!(!result.is_valid);
        assert!(result.violations.iter().any(|v| v.rule == "LOOKAHEAD"));
    }

    #[test]
    fn accepts_a_bounded_per_bar_scanner() {
        let code = r#"
            function scan(bars) {
                const i = bars.length - 1;
                const last = bars[i];
                if (last.close > last.open) {
                    return emitSignal(last.time, "LONG");
                }
                return null;
            }
        "#;
        let result = validate(code);
        assert!(result.is_valid, "unexpected violations: {:?}", result.violations);
    }

    #[test]
    fn detects_truncated_generation_unbalanced_braces() {
        let code = "function scan(bars) {\n  if (true) {\n    return null;\n";
        let result = validate(code);
        assert!(!result.is_valid);
        assert_eq!(result.violations[0].rule, "TRUNCATION");
    }

    #[test]
    fn detects_future_slicing() {
        let code = r#"
            function scan(bars) {
                for (let i = 0; i < bars.length; i++) {
                    const future = bars.slice(i, bars.length);
                    if (future.length > 0) {
                        return emitSignal(bars[i].time, "LONG");
                    }
                }
                return null;
            }
        "#;
        let result = validate(code);
        assert!(!result.is_valid);
    }

    #[test]
    fn detects_peak_index_offset() {
        let code = r#"
            function scan(bars) {
                const peakIndex = 5;
                const entry = bars[peakIndex + 1];
                return emitSignal(entry.time, "LONG");
            }
        "#;
        let result = validate(code);
        assert!(!result.is_valid);
    }
}
