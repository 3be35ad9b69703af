use chrono::{NaiveDate, NaiveDateTime};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum Degree {
    #[serde(rename = "Bachelor's")]
    Bachelors,
    #[serde(rename = "Master's")]
    Masters,
    #[serde(rename = "PhD")]
    Phd,
}

impl Degree {
    /// Display order used by every education view.
    pub const ORDER: [Degree; 3] = [Degree::Bachelors, Degree::Masters, Degree::Phd];

    /// Accepts "Bachelors", "Bachelor's", "bachelor's degree", "PhD", "Ph.D." and so on.
    pub fn parse(raw: &str) -> Option<Degree> {
        let key: String = raw
            .trim()
            .to_lowercase()
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect();
        let key = key.strip_suffix("degree").unwrap_or(&key);

        match key {
            "bachelors" | "bachelor" => Some(Degree::Bachelors),
            "masters" | "master" => Some(Degree::Masters),
            "phd" | "doctorate" => Some(Degree::Phd),
            _ => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Degree::Bachelors => "Bachelor's",
            Degree::Masters => "Master's",
            Degree::Phd => "PhD",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum QuizOutcome {
    #[serde(rename = "Not Completed")]
    NotCompleted,
    #[serde(rename = "Completed")]
    Completed,
}

impl QuizOutcome {
    pub const ORDER: [QuizOutcome; 2] = [QuizOutcome::NotCompleted, QuizOutcome::Completed];

    /// Expects an already normalized (trimmed, lowercased) value.
    pub fn from_normalized(value: &str) -> Option<QuizOutcome> {
        match value {
            "completed" => Some(QuizOutcome::Completed),
            "not completed" | "incomplete" => Some(QuizOutcome::NotCompleted),
            _ => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            QuizOutcome::NotCompleted => "Not Completed",
            QuizOutcome::Completed => "Completed",
        }
    }
}

/// `data` value marking rows produced by the experiment simulator.
pub const SIMULATED_DATA: &str = "simulated user event";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ApplicantRecord {
    pub created_at: Option<NaiveDateTime>,
    /// `created_at` as written, echoed back verbatim on a rewrite.
    pub created_at_raw: String,
    /// Kept as written; parsed on demand so unparseable values survive a rewrite.
    pub birthday: String,
    pub country_iso2: String,
    pub highest_degree_earned: String,
    pub group: String,
    pub admission_quiz: String,
    pub data: String,
    /// Columns the loader does not interpret, in header order.
    pub extra: Vec<String>,
}

impl ApplicantRecord {
    /// Placeholder row produced by the experiment simulator.
    pub fn simulated(day: NaiveDate) -> Self {
        let created_at = day.and_hms_opt(0, 0, 0);
        ApplicantRecord {
            created_at_raw: created_at
                .as_ref()
                .map(crate::parse::format_timestamp)
                .unwrap_or_default(),
            created_at,
            data: SIMULATED_DATA.to_string(),
            ..Default::default()
        }
    }

    pub fn birth_date(&self) -> Option<NaiveDate> {
        crate::parse::parse_date(&self.birthday).ok()
    }

    pub fn is_simulated(&self) -> bool {
        self.data == SIMULATED_DATA
    }

    pub fn degree(&self) -> Option<Degree> {
        Degree::parse(&self.highest_degree_earned)
    }

    pub fn quiz_outcome(&self) -> Option<QuizOutcome> {
        QuizOutcome::from_normalized(&self.admission_quiz)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NationalityCount {
    pub country_iso2: String,
    pub count: usize,
    pub country_name: Option<String>,
    pub country_iso3: Option<String>,
    pub count_pct: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EducationCount {
    pub degree: Degree,
    pub count: usize,
    pub pct: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DailyCount {
    pub date: NaiveDate,
    pub users: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContingencyTable {
    pub groups: Vec<String>,
    pub outcomes: Vec<QuizOutcome>,
    /// `counts[g][o]` for group `g` and outcome `o`.
    pub counts: Vec<Vec<usize>>,
}

impl ContingencyTable {
    pub fn total(&self) -> usize {
        self.counts.iter().flatten().sum()
    }

    pub fn get(&self, group: &str, outcome: QuizOutcome) -> usize {
        let Some(row) = self.groups.iter().position(|g| g == group) else {
            return 0;
        };
        let Some(col) = self.outcomes.iter().position(|o| *o == outcome) else {
            return 0;
        };
        self.counts[row][col]
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SimulationResult {
    pub days_sampled: usize,
    pub total_users: usize,
    pub daily_sample: Vec<DailyCount>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ChiSquareResult {
    pub statistic: f64,
    pub df: usize,
    pub pvalue: f64,
}
