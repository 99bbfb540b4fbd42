// src/grading/recompute.rs

//! Pure re-grading of one stored report against a changed answer key.
//!
//! All counter arithmetic for regeneration lives here. The function never
//! touches storage, so idempotence and conservation can be tested directly.

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
};

use serde::Serialize;

use crate::models::{
    answer_key::AnswerKey,
    marks::{MarkScheme, scheme_for_marks_type},
    student_report::{StudentReport, accuracy},
    test::normalize_option,
};

/// How one question should be graded after the key change.
#[derive(Debug, Clone, PartialEq)]
pub struct QuestionKey {
    pub correct_options: BTreeSet<String>,
    pub grace: bool,
    pub marks: Option<MarkScheme>,
}

/// The answer key reduced to what grading needs, keyed by question number.
#[derive(Debug, Clone, Default)]
pub struct KeyDelta {
    questions: BTreeMap<i32, QuestionKey>,
}

impl KeyDelta {
    pub fn from_answer_key(key: &AnswerKey) -> Self {
        let questions = key
            .entries
            .iter()
            .map(|e| {
                (
                    e.question_number,
                    QuestionKey {
                        correct_options: e.correct_options.clone(),
                        grace: e.is_grace,
                        marks: e.marks,
                    },
                )
            })
            .collect();
        Self { questions }
    }

    /// Graces extra questions. Numbers the key does not contain are ignored.
    pub fn with_grace<I: IntoIterator<Item = i32>>(mut self, question_numbers: I) -> Self {
        for number in question_numbers {
            if let Some(question) = self.questions.get_mut(&number) {
                question.grace = true;
            }
        }
        self
    }

    pub fn insert(&mut self, question_number: i32, question: QuestionKey) {
        self.questions.insert(question_number, question);
    }

    pub fn len(&self) -> usize {
        self.questions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.questions.is_empty()
    }
}

/// Why a stored report could not be re-graded.
#[derive(Debug, Clone, PartialEq)]
pub enum RecomputeError {
    /// `correct + wrong + unattempted != total` before any change.
    NotConserved {
        correct: i32,
        wrong: i32,
        unattempted: i32,
        total: i32,
    },
    DuplicateResponse(i32),
    /// The key grades a question the report has no response for.
    MissingResponse(i32),
    /// A blank response is flagged correct; the counters cannot be trusted.
    UnattemptedMarkedCorrect(i32),
    /// A flip would drive a counter below zero.
    NegativeCount { question: i32, field: &'static str },
    BadMarksType(String),
    /// Applying the flip would overflow a counter or the total.
    MarksOverflow(i32),
}

impl fmt::Display for RecomputeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecomputeError::NotConserved {
                correct,
                wrong,
                unattempted,
                total,
            } => write!(
                f,
                "counts do not add up: {} correct + {} wrong + {} unattempted != {} total",
                correct, wrong, unattempted, total
            ),
            RecomputeError::DuplicateResponse(q) => {
                write!(f, "question {} has more than one response", q)
            }
            RecomputeError::MissingResponse(q) => write!(f, "no response stored for question {}", q),
            RecomputeError::UnattemptedMarkedCorrect(q) => {
                write!(f, "question {} is unattempted but flagged correct", q)
            }
            RecomputeError::NegativeCount { question, field } => {
                write!(f, "re-grading question {} would make {} negative", question, field)
            }
            RecomputeError::BadMarksType(reason) => write!(f, "{}", reason),
            RecomputeError::MarksOverflow(q) => {
                write!(f, "re-grading question {} overflows the stored totals", q)
            }
        }
    }
}

impl std::error::Error for RecomputeError {}

/// A single correctness flip.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QuestionFlip {
    pub question_number: i32,
    pub is_correct: bool,
    pub marks_delta: i32,
}

#[derive(Debug, Clone)]
pub struct Recomputed {
    pub report: StudentReport,
    pub flips: Vec<QuestionFlip>,
    /// Responses whose snapshot of the key was refreshed.
    pub refreshed: usize,
}

impl Recomputed {
    /// Whether the record has to be written back.
    pub fn is_changed(&self) -> bool {
        !self.flips.is_empty() || self.refreshed > 0
    }
}

fn marked_is_correct(marked: Option<&str>, correct_options: &BTreeSet<String>) -> bool {
    marked.is_some_and(|m| correct_options.contains(&normalize_option(m)))
}

fn normalized(options: &BTreeSet<String>) -> BTreeSet<String> {
    options.iter().map(|o| normalize_option(o)).collect()
}

/// Re-grades `old` against `delta` and returns the new state.
///
/// A response is looked at only when its question is graced or when the key's
/// value differs from the snapshot taken at last grading; everything else is
/// left alone. Grace credits attempted responses only. Running this twice with
/// the same delta yields the state of running it once.
pub fn recompute(
    old: &StudentReport,
    delta: &KeyDelta,
    fallback: MarkScheme,
) -> Result<Recomputed, RecomputeError> {
    if !old.is_conserved() {
        return Err(RecomputeError::NotConserved {
            correct: old.correct_answers,
            wrong: old.wrong_answers,
            unattempted: old.unattempted,
            total: old.total_questions,
        });
    }

    let report_scheme =
        scheme_for_marks_type(&old.marks_type, fallback).map_err(RecomputeError::BadMarksType)?;

    let mut index = BTreeMap::new();
    for (pos, response) in old.responses.iter().enumerate() {
        if index.insert(response.question_number, pos).is_some() {
            return Err(RecomputeError::DuplicateResponse(response.question_number));
        }
    }

    let mut next = old.clone();
    let mut flips = Vec::new();
    let mut refreshed = 0;

    for (&number, question) in &delta.questions {
        let &pos = index
            .get(&number)
            .ok_or(RecomputeError::MissingResponse(number))?;
        let response = &mut next.responses[pos];

        let key_changed = normalized(&response.correct_options) != question.correct_options
            || response.grace_snapshot != question.grace;
        if !question.grace && !key_changed {
            continue;
        }

        let attempted = response.is_attempted();
        if !attempted && response.is_correct {
            return Err(RecomputeError::UnattemptedMarkedCorrect(number));
        }

        let should_be_correct = attempted
            && (question.grace
                || marked_is_correct(response.marked_option.as_deref(), &question.correct_options));

        if should_be_correct != response.is_correct {
            let overflow = RecomputeError::MarksOverflow(number);
            let step = question
                .marks
                .unwrap_or(report_scheme)
                .flip_delta()
                .ok_or(overflow.clone())?;
            let (gained, lost, marks_delta) = if should_be_correct {
                (&mut next.correct_answers, &mut next.wrong_answers, step)
            } else {
                let refund = step.checked_neg().ok_or(overflow.clone())?;
                (&mut next.wrong_answers, &mut next.correct_answers, refund)
            };
            *gained = gained.checked_add(1).ok_or(overflow.clone())?;
            *lost = lost.checked_sub(1).ok_or(overflow.clone())?;
            if next.wrong_answers < 0 {
                return Err(RecomputeError::NegativeCount {
                    question: number,
                    field: "wrong_answers",
                });
            }
            if next.correct_answers < 0 {
                return Err(RecomputeError::NegativeCount {
                    question: number,
                    field: "correct_answers",
                });
            }
            next.total_marks = next.total_marks.checked_add(marks_delta).ok_or(overflow)?;
            response.is_correct = should_be_correct;
            flips.push(QuestionFlip {
                question_number: number,
                is_correct: should_be_correct,
                marks_delta,
            });
        }

        if key_changed {
            response.correct_options = question.correct_options.clone();
            response.grace_snapshot = question.grace;
            refreshed += 1;
        }
    }

    if !flips.is_empty() {
        next.accuracy = accuracy(next.correct_answers, next.total_questions);
    }
    debug_assert!(next.is_conserved());

    Ok(Recomputed {
        report: next,
        flips,
        refreshed,
    })
}
