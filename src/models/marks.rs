// src/models/marks.rs

use std::{fmt, str::FromStr, sync::LazyLock};

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Accepts "+4/-1", "4,-1", "4 / 1", "+3|-0".
static MARKS_TYPE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*\+?(\d{1,3})\s*[/,|]\s*-?(\d{1,3})\s*$").expect("valid marks regex")
});

/// Largest mark magnitude a scheme may carry.
pub const MAX_MARKS: i32 = 1000;

/// Marks awarded for a correct answer and deducted for a wrong one.
///
/// `negative` is a magnitude: a "+4/-1" scheme is `{ positive: 4, negative: 1 }`.
/// Unattempted questions score zero under every scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkScheme {
    pub positive: i32,
    pub negative: i32,
}

impl MarkScheme {
    /// Total marks delta when a wrong answer becomes correct: the penalty is
    /// refunded and the credit is added.
    /// `None` when the sum does not fit, which only an out-of-range stored scheme can cause.
    pub fn flip_delta(&self) -> Option<i32> {
        self.positive.checked_add(self.negative)
    }

    pub fn is_valid(&self) -> bool {
        (0..=MAX_MARKS).contains(&self.positive) && (0..=MAX_MARKS).contains(&self.negative)
    }
}

impl Default for MarkScheme {
    fn default() -> Self {
        Self {
            positive: 4,
            negative: 1,
        }
    }
}

impl fmt::Display for MarkScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "+{}/-{}", self.positive, self.negative)
    }
}

impl FromStr for MarkScheme {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let caps = MARKS_TYPE_RE
            .captures(s)
            .ok_or_else(|| format!("unrecognised marks type '{}'", s))?;

        // Both groups are at most three digits, so the parse cannot overflow.
        let positive = caps[1].parse::<i32>().map_err(|e| e.to_string())?;
        let negative = caps[2].parse::<i32>().map_err(|e| e.to_string())?;

        Ok(Self { positive, negative })
    }
}

/// Resolves the scheme stored on a report. Blank means "use the default".
pub fn scheme_for_marks_type(marks_type: &str, fallback: MarkScheme) -> Result<MarkScheme, String> {
    if marks_type.trim().is_empty() {
        return Ok(fallback);
    }
    marks_type.parse()
}
