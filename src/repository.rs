use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::path::{Path, PathBuf};

use chrono::{Datelike, NaiveDate, Utc};
use tracing::{debug, info, warn};

use crate::countries;
use crate::error::{AnalysisError, Result};
use crate::models::{
    ApplicantRecord, ContingencyTable, DailyCount, Degree, EducationCount, NationalityCount,
    QuizOutcome,
};
use crate::parse;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Column {
    CreatedAt,
    Birthday,
    Country,
    Degree,
    Group,
    Quiz,
    Data,
    Extra(usize),
}

impl Column {
    fn recognise(header: &str) -> Option<Column> {
        match header.trim().to_lowercase().as_str() {
            "created_at" => Some(Column::CreatedAt),
            "birthday" => Some(Column::Birthday),
            "countryiso2" | "country_iso2" => Some(Column::Country),
            "highest_degree_earned" => Some(Column::Degree),
            "group" => Some(Column::Group),
            "admission_quiz" => Some(Column::Quiz),
            "data" => Some(Column::Data),
            _ => None,
        }
    }
}

/// Applicant table backed by a CSV file.
///
/// The file is read once on [`CsvRepository::load`] and rewritten wholesale by
/// [`CsvRepository::persist`]; every query works on the in-memory copy.
#[derive(Debug, Clone)]
pub struct CsvRepository {
    path: PathBuf,
    headers: Vec<String>,
    layout: Vec<Column>,
    records: Vec<ApplicantRecord>,
}

impl CsvRepository {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path).map_err(|source| AnalysisError::FileAccess {
            path: path.clone(),
            source,
        })?;
        let mut reader = csv::ReaderBuilder::new().has_headers(true).from_reader(file);

        let mut headers = Vec::new();
        let mut layout = Vec::new();
        let mut extra_count = 0usize;
        for header in reader.headers()?.iter() {
            let column = Column::recognise(header).unwrap_or_else(|| {
                extra_count += 1;
                Column::Extra(extra_count - 1)
            });
            headers.push(header.to_string());
            layout.push(column);
        }
        if !layout.contains(&Column::Data) {
            headers.push("data".to_string());
            layout.push(Column::Data);
        }

        let mut records = Vec::new();
        let mut bad_timestamps = 0usize;
        for result in reader.records() {
            let row = result?;
            let mut record = ApplicantRecord {
                extra: vec![String::new(); extra_count],
                ..Default::default()
            };

            for (column, value) in layout.iter().zip(row.iter()) {
                match column {
                    Column::CreatedAt => {
                        record.created_at_raw = value.to_string();
                        record.created_at = match parse::parse_timestamp(value) {
                            Ok(dt) => Some(dt),
                            Err(err) => {
                                debug!("{err}");
                                bad_timestamps += 1;
                                None
                            }
                        }
                    }
                    Column::Birthday => record.birthday = value.to_string(),
                    Column::Country => record.country_iso2 = value.trim().to_string(),
                    Column::Degree => record.highest_degree_earned = value.to_string(),
                    Column::Group => record.group = value.trim().to_string(),
                    Column::Quiz => record.admission_quiz = parse::normalize_quiz(value),
                    Column::Data => record.data = value.to_string(),
                    Column::Extra(idx) => record.extra[*idx] = value.to_string(),
                }
            }
            records.push(record);
        }

        if bad_timestamps > 0 {
            warn!(
                "{} rows in {} have an unparseable created_at",
                bad_timestamps,
                path.display()
            );
        }
        info!("loaded {} applicants from {}", records.len(), path.display());

        Ok(CsvRepository {
            path,
            headers,
            layout,
            records,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn records(&self) -> &[ApplicantRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn nationality_counts(&self, normalize: bool) -> Vec<NationalityCount> {
        let mut counts: HashMap<&str, usize> = HashMap::new();
        for record in &self.records {
            if record.country_iso2.is_empty() {
                continue;
            }
            *counts.entry(record.country_iso2.as_str()).or_insert(0) += 1;
        }

        let total: usize = counts.values().sum();
        let mut rows: Vec<NationalityCount> = counts
            .into_iter()
            .map(|(code, count)| {
                let country = countries::lookup(code);
                if country.is_none() {
                    debug!("no country reference for code {code:?}");
                }
                NationalityCount {
                    country_iso2: code.to_string(),
                    count,
                    country_name: country.map(|c| c.name.to_string()),
                    country_iso3: country.map(|c| c.iso3.to_string()),
                    count_pct: normalize.then(|| count as f64 / total as f64 * 100.0),
                }
            })
            .collect();

        rows.sort_by(|a, b| {
            b.count
                .cmp(&a.count)
                .then_with(|| a.country_iso2.cmp(&b.country_iso2))
        });
        rows
    }

    pub fn ages(&self) -> Vec<i32> {
        self.ages_on(Utc::now().date_naive())
    }

    /// Whole-year ages as of `today`; records without a parseable birth date are skipped.
    pub fn ages_on(&self, today: NaiveDate) -> Vec<i32> {
        self.records
            .iter()
            .filter_map(|record| record.birth_date())
            .map(|birth| age_on(birth, today))
            .collect()
    }

    pub fn education_counts(&self, normalize: bool) -> Vec<EducationCount> {
        let mut counts: BTreeMap<Degree, usize> = BTreeMap::new();
        for degree in self.records.iter().filter_map(|r| r.degree()) {
            *counts.entry(degree).or_insert(0) += 1;
        }

        let total: usize = counts.values().sum();
        Degree::ORDER
            .iter()
            .filter_map(|degree| {
                counts.get(degree).map(|&count| EducationCount {
                    degree: *degree,
                    count,
                    pct: normalize.then(|| count as f64 / total as f64 * 100.0),
                })
            })
            .collect()
    }

    pub fn daily_applicant_counts(&self) -> Vec<DailyCount> {
        let mut counts: BTreeMap<NaiveDate, usize> = BTreeMap::new();
        for created_at in self.records.iter().filter_map(|r| r.created_at) {
            *counts.entry(created_at.date()).or_insert(0) += 1;
        }
        counts
            .into_iter()
            .map(|(date, users)| DailyCount { date, users })
            .collect()
    }

    pub fn contingency_table(&self) -> ContingencyTable {
        let mut cells: BTreeMap<&str, [usize; 2]> = BTreeMap::new();
        for record in &self.records {
            if record.group.is_empty() {
                continue;
            }
            let Some(outcome) = record.quiz_outcome() else {
                continue;
            };
            let col = QuizOutcome::ORDER
                .iter()
                .position(|o| *o == outcome)
                .unwrap_or_default();
            cells.entry(record.group.as_str()).or_insert([0, 0])[col] += 1;
        }

        ContingencyTable {
            groups: cells.keys().map(|g| g.to_string()).collect(),
            outcomes: QuizOutcome::ORDER.to_vec(),
            counts: cells.values().map(|row| row.to_vec()).collect(),
        }
    }

    /// Appends rows and rewrites the backing file. Repeated calls keep stacking
    /// rows; nothing is deduplicated. On a failed write the table is left as it was.
    pub fn append_simulated_records(&mut self, new_records: Vec<ApplicantRecord>) -> Result<()> {
        let previous_len = self.records.len();
        let extra_count = self.extra_column_count();
        self.records.extend(new_records.into_iter().map(|mut record| {
            record.extra.resize(extra_count, String::new());
            record
        }));

        if let Err(err) = self.persist() {
            self.records.truncate(previous_len);
            return Err(err);
        }
        info!(
            "appended {} simulated applicants; table now holds {}",
            self.records.len() - previous_len,
            self.records.len()
        );
        Ok(())
    }

    fn extra_column_count(&self) -> usize {
        self.layout
            .iter()
            .filter(|c| matches!(c, Column::Extra(_)))
            .count()
    }

    /// Rewrites the full table to the backing file. The rows go to a sibling
    /// temporary file first, which then replaces the original.
    pub fn persist(&self) -> Result<()> {
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        let file = File::create(&tmp).map_err(|source| AnalysisError::FileAccess {
            path: tmp.clone(),
            source,
        })?;
        let mut writer = csv::Writer::from_writer(file);
        writer.write_record(&self.headers)?;
        for record in &self.records {
            writer.write_record(self.layout.iter().map(|column| field(record, *column)))?;
        }
        writer.flush().map_err(|source| AnalysisError::FileAccess {
            path: tmp.clone(),
            source,
        })?;
        drop(writer);

        if let Err(source) = fs::rename(&tmp, &self.path) {
            if let Err(err) = fs::remove_file(&tmp) {
                warn!("could not remove {}: {err}", tmp.display());
            }
            return Err(AnalysisError::FileAccess {
                path: self.path.clone(),
                source,
            });
        }
        debug!("wrote {} rows to {}", self.records.len(), self.path.display());
        Ok(())
    }
}

fn field(record: &ApplicantRecord, column: Column) -> String {
    match column {
        Column::CreatedAt => record.created_at_raw.clone(),
        Column::Birthday => record.birthday.clone(),
        Column::Country => record.country_iso2.clone(),
        Column::Degree => record.highest_degree_earned.clone(),
        Column::Group => record.group.clone(),
        Column::Quiz => record.admission_quiz.clone(),
        Column::Data => record.data.clone(),
        Column::Extra(idx) => record.extra.get(idx).cloned().unwrap_or_default(),
    }
}

pub fn age_on(birth: NaiveDate, today: NaiveDate) -> i32 {
    let before_birthday = (today.month(), today.day()) < (birth.month(), birth.day());
    today.year() - birth.year() - i32::from(before_birthday)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = "\
created_at,birthday,countryISO2,highest_degree_earned,group,admission_quiz,source
2022-05-01 09:15:00,1994-03-12,US,Bachelor's degree,email (t),Completed,web
2022-05-01 17:40:12,1990-12-30,US,Master's degree,email (t),  not completed ,web
2022-05-02 08:00:00,not-a-date,CA,Bachelor's degree,no email (c),COMPLETED,ads
garbage,2001-07-04,ZZ,High School,no email (c),Not Completed,ads
2022-05-04 11:11:11,1985-01-01,,Bachelor's degree,,completed,web
";

    fn write_fixture(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn load_parses_timestamps_and_normalizes_quiz() {
        let file = write_fixture(SAMPLE);
        let repo = CsvRepository::load(file.path()).unwrap();

        assert_eq!(repo.len(), 5);
        assert!(repo.records()[3].created_at.is_none());
        assert_eq!(repo.records()[1].admission_quiz, "not completed");
        assert_eq!(repo.records()[2].admission_quiz, "completed");
        assert_eq!(repo.records()[0].extra, vec!["web".to_string()]);
    }

    #[test]
    fn missing_file_is_a_file_access_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = CsvRepository::load(dir.path().join("absent.csv")).unwrap_err();
        assert!(matches!(err, AnalysisError::FileAccess { .. }));
    }

    #[test]
    fn ragged_rows_are_rejected() {
        let file = write_fixture("created_at,group\n2022-05-01,a\n2022-05-02,b,extra\n");
        let err = CsvRepository::load(file.path()).unwrap_err();
        assert!(matches!(err, AnalysisError::Csv(_)));
    }

    #[test]
    fn nationality_counts_with_percentages() {
        let file = write_fixture("countryISO2\nUS\nUS\nCA\n");
        let repo = CsvRepository::load(file.path()).unwrap();
        let counts = repo.nationality_counts(true);

        assert_eq!(counts.len(), 2);
        assert_eq!(counts[0].country_iso2, "US");
        assert_eq!(counts[0].count, 2);
        assert!((counts[0].count_pct.unwrap() - 66.7).abs() < 0.1);
        assert_eq!(counts[0].country_iso3.as_deref(), Some("USA"));
        assert_eq!(counts[1].country_iso2, "CA");
        assert!((counts[1].count_pct.unwrap() - 33.3).abs() < 0.1);
        assert_eq!(counts[1].country_name.as_deref(), Some("Canada"));
    }

    #[test]
    fn unknown_nationality_degrades_to_none() {
        let file = write_fixture(SAMPLE);
        let repo = CsvRepository::load(file.path()).unwrap();
        let counts = repo.nationality_counts(false);

        let unknown = counts.iter().find(|c| c.country_iso2 == "ZZ").unwrap();
        assert!(unknown.country_name.is_none());
        assert!(unknown.country_iso3.is_none());
        assert!(counts.iter().all(|c| c.count_pct.is_none()));
        assert_eq!(counts.iter().map(|c| c.count).sum::<usize>(), 4);
    }

    #[test]
    fn ages_skip_unparseable_birthdays() {
        let file = write_fixture(SAMPLE);
        let repo = CsvRepository::load(file.path()).unwrap();
        let ages = repo.ages_on(ymd(2024, 6, 1));

        assert_eq!(ages, vec![30, 33, 22, 39]);
    }

    #[test]
    fn age_drops_a_year_before_the_birthday() {
        let today = ymd(2024, 6, 15);
        assert_eq!(age_on(ymd(2000, 6, 16), today), 23);
        assert_eq!(age_on(ymd(2000, 6, 15), today), 24);
        assert_eq!(age_on(ymd(2000, 1, 1), today), 24);
    }

    #[test]
    fn education_counts_follow_fixed_order_and_omit_absent() {
        let file = write_fixture(SAMPLE);
        let repo = CsvRepository::load(file.path()).unwrap();
        let counts = repo.education_counts(true);

        let degrees: Vec<Degree> = counts.iter().map(|c| c.degree).collect();
        assert_eq!(degrees, vec![Degree::Bachelors, Degree::Masters]);
        assert_eq!(counts[0].count, 3);
        assert!((counts[0].pct.unwrap() - 75.0).abs() < 1e-9);
    }

    #[test]
    fn daily_counts_ascend_by_date() {
        let file = write_fixture(SAMPLE);
        let repo = CsvRepository::load(file.path()).unwrap();
        let daily = repo.daily_applicant_counts();

        assert_eq!(
            daily,
            vec![
                DailyCount { date: ymd(2022, 5, 1), users: 2 },
                DailyCount { date: ymd(2022, 5, 2), users: 1 },
                DailyCount { date: ymd(2022, 5, 4), users: 1 },
            ]
        );
    }

    #[test]
    fn contingency_table_crosses_group_and_outcome() {
        let file = write_fixture(SAMPLE);
        let repo = CsvRepository::load(file.path()).unwrap();
        let table = repo.contingency_table();

        assert_eq!(table.groups, vec!["email (t)", "no email (c)"]);
        assert_eq!(table.get("email (t)", QuizOutcome::Completed), 1);
        assert_eq!(table.get("email (t)", QuizOutcome::NotCompleted), 1);
        assert_eq!(table.get("no email (c)", QuizOutcome::Completed), 1);
        assert_eq!(table.get("no email (c)", QuizOutcome::NotCompleted), 1);
        assert_eq!(table.total(), 4);
    }

    #[test]
    fn append_persists_and_stacks_duplicates() {
        let file = write_fixture(SAMPLE);
        let mut repo = CsvRepository::load(file.path()).unwrap();
        let synthetic = vec![ApplicantRecord::simulated(ymd(2022, 5, 1))];

        repo.append_simulated_records(synthetic.clone()).unwrap();
        repo.append_simulated_records(synthetic).unwrap();
        assert_eq!(repo.len(), 7);

        let reloaded = CsvRepository::load(file.path()).unwrap();
        assert_eq!(reloaded.len(), 7);
        assert!(reloaded.records()[6].is_simulated());
        assert_eq!(reloaded.records()[6].extra, vec![String::new()]);
        assert_eq!(reloaded.records()[2].birthday, "not-a-date");
        assert_eq!(reloaded.daily_applicant_counts()[0].users, 4);
    }

    #[test]
    fn failed_persist_leaves_table_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("applicants.csv");
        fs::write(&path, SAMPLE).unwrap();
        let mut repo = CsvRepository::load(&path).unwrap();
        repo.path = dir.path().join("missing-dir").join("applicants.csv");

        let err = repo
            .append_simulated_records(vec![ApplicantRecord::simulated(ymd(2022, 5, 1))])
            .unwrap_err();
        assert!(matches!(err, AnalysisError::FileAccess { .. }));
        assert_eq!(repo.len(), 5);
    }

    #[test]
    fn rewrite_keeps_created_at_as_written() {
        let file = write_fixture(
            "created_at,group\n2022-05-01T09:15:00.250+02:00,a\nsometime in May,b\n2022-05-02,c\n",
        );
        let mut repo = CsvRepository::load(file.path()).unwrap();
        assert!(repo.records()[1].created_at.is_none());

        repo.append_simulated_records(vec![ApplicantRecord::simulated(ymd(2022, 5, 3))])
            .unwrap();

        let rewritten = fs::read_to_string(file.path()).unwrap();
        assert!(rewritten.contains("2022-05-01T09:15:00.250+02:00,a,"));
        assert!(rewritten.contains("sometime in May,b,"));
        assert!(rewritten.contains("2022-05-02,c,"));
        assert!(rewritten.contains("2022-05-03 00:00:00,,simulated user event"));

        let reloaded = CsvRepository::load(file.path()).unwrap();
        assert_eq!(reloaded.daily_applicant_counts().len(), 3);
    }

    #[test]
    fn failed_rename_removes_the_temporary_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("applicants.csv");
        fs::write(&path, SAMPLE).unwrap();
        let mut repo = CsvRepository::load(&path).unwrap();
        // A non-empty directory cannot be replaced by a file.
        let target = dir.path().join("occupied");
        fs::create_dir(&target).unwrap();
        fs::write(target.join("keep"), "x").unwrap();
        repo.path = target.clone();

        let err = repo.persist().unwrap_err();
        assert!(matches!(err, AnalysisError::FileAccess { .. }));
        assert!(!dir.path().join("occupied.tmp").exists());
        assert!(target.is_dir());
    }
}
