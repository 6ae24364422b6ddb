//! Priority labels.
//!
//! Two label vocabularies are in use ({High, Medium, Low} and
//! {Production, MVP, POC}); both map onto one three-tier rank.

use std::cmp::Ordering;

/// Numeric tier of a priority label: 3 is most urgent.
pub fn priority_rank(label: &str) -> u8 {
    match label.trim().to_ascii_lowercase().as_str() {
        "high" | "production" => 3,
        "medium" | "mvp" => 2,
        _ => 1,
    }
}

/// Total order over priority labels by rank. `Greater` means `a` is more
/// urgent than `b`.
pub fn compare_priority(a: &str, b: &str) -> Ordering {
    priority_rank(a).cmp(&priority_rank(b))
}
