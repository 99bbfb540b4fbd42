// src/models/answer_key.rs

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    str::FromStr,
};

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize, Serializer};
use validator::Validate;

use crate::{
    models::{
        marks::MarkScheme,
        test::{QuestionType, Stream, normalize_option},
    },
    utils::html::clean_html,
};

/// Lifecycle of a single answer key entry.
///
/// Only a correction of an already published entry (`Published -> Corrected`)
/// invalidates stored reports. Draft edits and publication never do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryState {
    Draft,
    Published,
    Corrected,
}

impl EntryState {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryState::Draft => "Draft",
            EntryState::Published => "Published",
            EntryState::Corrected => "Corrected",
        }
    }

    pub fn is_published(&self) -> bool {
        !matches!(self, EntryState::Draft)
    }
}

impl fmt::Display for EntryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntryState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Draft" => Ok(EntryState::Draft),
            "Published" => Ok(EntryState::Published),
            "Corrected" => Ok(EntryState::Corrected),
            other => Err(format!("unknown entry state '{}'", other)),
        }
    }
}

/// One question of an answer key.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnswerKeyEntry {
    pub id: i64,
    pub question_number: i32,
    /// Normalized option labels. Empty is legal for theory questions and grace entries.
    pub correct_options: BTreeSet<String>,
    pub correct_solution: Option<String>,
    /// Everyone who attempted the question is credited, whatever they marked.
    pub is_grace: bool,
    /// Per-question marks overriding the report's scheme.
    pub marks: Option<MarkScheme>,
    pub state: EntryState,
    /// Number of post-publication corrections applied.
    pub revision: i32,
}

/// What `AnswerKeyEntry::apply_correction` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CorrectionOutcome {
    /// The submitted value equals the stored one.
    Unchanged,
    /// A draft entry was replaced in place.
    Replaced,
    /// A published entry changed; stored reports must be regenerated.
    Corrected,
}

impl AnswerKeyEntry {
    /// Builds a fresh draft entry from validated input. The id is assigned by the store.
    pub fn from_input(input: &EntryInput) -> Self {
        Self {
            id: 0,
            question_number: input.question_number,
            correct_options: input.normalized_options(),
            correct_solution: input.sanitized_solution(),
            is_grace: input.is_grace,
            marks: input.marks,
            state: EntryState::Draft,
            revision: 0,
        }
    }

    fn same_value(&self, input: &EntryInput) -> bool {
        self.correct_options == input.normalized_options()
            && self.correct_solution == input.sanitized_solution()
            && self.is_grace == input.is_grace
            && self.marks == input.marks
    }

    /// Full replace of the graded value. Diffing happens here so that a
    /// correction call that repeats the stored value is a no-op.
    pub fn apply_correction(&mut self, input: &EntryInput) -> CorrectionOutcome {
        if self.same_value(input) {
            return CorrectionOutcome::Unchanged;
        }

        self.correct_options = input.normalized_options();
        self.correct_solution = input.sanitized_solution();
        self.is_grace = input.is_grace;
        self.marks = input.marks;

        if self.state.is_published() {
            self.state = EntryState::Corrected;
            self.revision += 1;
            CorrectionOutcome::Corrected
        } else {
            CorrectionOutcome::Replaced
        }
    }

    /// Marks the entry as graced. Returns false when it already was.
    pub fn grant_grace(&mut self) -> bool {
        if self.is_grace {
            return false;
        }
        self.is_grace = true;
        if self.state.is_published() {
            self.state = EntryState::Corrected;
            self.revision += 1;
        }
        true
    }

    /// `Draft -> Published`. Returns false if the entry was already published.
    pub fn publish(&mut self) -> bool {
        if self.state.is_published() {
            return false;
        }
        self.state = EntryState::Published;
        true
    }
}

/// Answer key entries keyed and ordered by question number.
///
/// Construction rejects duplicate question numbers, so lookups never have to
/// decide between two candidates.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AnswerKeyEntries(BTreeMap<i32, AnswerKeyEntry>);

impl AnswerKeyEntries {
    pub fn try_from_entries(entries: Vec<AnswerKeyEntry>) -> Result<Self, String> {
        let mut map = BTreeMap::new();
        for entry in entries {
            let number = entry.question_number;
            if map.insert(number, entry).is_some() {
                return Err(format!("duplicate question number {}", number));
            }
        }
        Ok(Self(map))
    }

    pub fn get(&self, question_number: i32) -> Option<&AnswerKeyEntry> {
        self.0.get(&question_number)
    }

    pub fn get_mut(&mut self, question_number: i32) -> Option<&mut AnswerKeyEntry> {
        self.0.get_mut(&question_number)
    }

    pub fn contains(&self, question_number: i32) -> bool {
        self.0.contains_key(&question_number)
    }

    /// Inserts or replaces the entry for its question number.
    pub fn put(&mut self, entry: AnswerKeyEntry) {
        self.0.insert(entry.question_number, entry);
    }

    pub fn remove(&mut self, question_number: i32) -> Option<AnswerKeyEntry> {
        self.0.remove(&question_number)
    }

    pub fn iter(&self) -> impl Iterator<Item = &AnswerKeyEntry> {
        self.0.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut AnswerKeyEntry> {
        self.0.values_mut()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Serialize for AnswerKeyEntries {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.0.values())
    }
}

/// The authoritative answers of one test instance.
#[derive(Debug, Clone, Serialize)]
pub struct AnswerKey {
    pub id: i64,
    pub stream: Stream,
    pub question_type: QuestionType,
    pub test_name: String,
    pub date: NaiveDate,
    pub entries: AnswerKeyEntries,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl AnswerKey {
    pub fn identity(&self) -> TestIdentity {
        TestIdentity {
            test_name: self.test_name.clone(),
            date: self.date,
            stream: self.stream,
            question_type: self.question_type,
        }
    }
}

/// Natural key of an answer key: (testName, date, stream, questionType).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TestIdentity {
    pub test_name: String,
    pub date: NaiveDate,
    pub stream: Stream,
    pub question_type: QuestionType,
}

impl fmt::Display for TestIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.test_name, self.date, self.stream, self.question_type
        )
    }
}

/// Answer key ready to be inserted; entry ids are assigned by the store.
#[derive(Debug, Clone)]
pub struct NewAnswerKey {
    pub identity: TestIdentity,
    pub entries: AnswerKeyEntries,
}

/// DTO for one answer key entry, used on creation and for corrections.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct EntryInput {
    #[validate(range(min = 1, max = 10000))]
    pub question_number: i32,
    #[serde(default)]
    #[validate(custom(function = validate_option_labels))]
    pub correct_options: Vec<String>,
    #[validate(length(max = 5000))]
    pub correct_solution: Option<String>,
    #[serde(default)]
    pub is_grace: bool,
    #[validate(custom(function = validate_marks))]
    pub marks: Option<MarkScheme>,
}

impl EntryInput {
    pub fn normalized_options(&self) -> BTreeSet<String> {
        self.correct_options
            .iter()
            .map(|label| normalize_option(label))
            .collect()
    }

    pub fn sanitized_solution(&self) -> Option<String> {
        self.correct_solution
            .as_deref()
            .map(clean_html)
            .filter(|text| !text.trim().is_empty())
    }
}

fn validate_option_labels(options: &[String]) -> Result<(), validator::ValidationError> {
    for opt in options {
        if opt.trim().is_empty() {
            return Err(validator::ValidationError::new("option_cannot_be_blank"));
        }
        if opt.len() > 200 {
            return Err(validator::ValidationError::new("option_too_long"));
        }
    }
    Ok(())
}

fn validate_marks(marks: &MarkScheme) -> Result<(), validator::ValidationError> {
    if !marks.is_valid() {
        return Err(validator::ValidationError::new("marks_out_of_range"));
    }
    Ok(())
}

/// Checks the cross-entry rules a single `EntryInput` cannot see on its own.
pub fn validate_entries(question_type: QuestionType, entries: &[EntryInput]) -> Result<(), String> {
    let mut seen = BTreeSet::new();
    for entry in entries {
        if !seen.insert(entry.question_number) {
            return Err(format!("duplicate question number {}", entry.question_number));
        }
        check_entry_for_type(question_type, entry)?;
    }
    Ok(())
}

pub fn check_entry_for_type(question_type: QuestionType, entry: &EntryInput) -> Result<(), String> {
    if question_type.is_objective() && !entry.is_grace && entry.correct_options.is_empty() {
        return Err(format!(
            "question {} needs at least one correct option for {} keys",
            entry.question_number, question_type
        ));
    }
    Ok(())
}

/// DTO for creating an answer key with its entries.
#[derive(Debug, Deserialize, Validate)]
pub struct CreateAnswerKeyRequest {
    pub stream: Stream,
    pub question_type: QuestionType,
    #[validate(length(min = 1, max = 200))]
    pub test_name: String,
    pub date: NaiveDate,
    #[validate(length(min = 1), nested)]
    pub entries: Vec<EntryInput>,
    /// Publish every entry immediately instead of leaving them as drafts.
    #[serde(default)]
    pub publish: bool,
}

/// DTO for updating answer key metadata. Fields are optional.
#[derive(Debug, Deserialize, Validate)]
pub struct UpdateAnswerKeyRequest {
    #[validate(length(min = 1, max = 200))]
    pub test_name: Option<String>,
    pub date: Option<NaiveDate>,
    pub question_type: Option<QuestionType>,
}

/// Query-string filters for listing answer keys.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct AnswerKeyFilter {
    pub stream: Option<Stream>,
    pub question_type: Option<QuestionType>,
    pub test_name: Option<String>,
    pub date: Option<NaiveDate>,
}

impl AnswerKeyFilter {
    pub fn matches(&self, key: &AnswerKey) -> bool {
        self.stream.is_none_or(|s| s == key.stream)
            && self.question_type.is_none_or(|q| q == key.question_type)
            && self.test_name.as_deref().is_none_or(|t| t == key.test_name)
            && self.date.is_none_or(|d| d == key.date)
    }
}
