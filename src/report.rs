use std::fmt::Write;

use chrono::NaiveDate;

use crate::repository::CsvRepository;
use crate::stats::StatsBuilder;

/// Effect sizes offered by the dashboard slider.
pub const EFFECT_SIZES: [f64; 8] = [0.1, 0.2, 0.3, 0.4, 0.5, 0.6, 0.7, 0.8];
/// Durations offered by the dashboard slider.
pub const DURATIONS: [u32; 8] = [150, 200, 250, 300, 350, 400, 450, 500];

#[derive(Debug, Clone, PartialEq)]
pub struct AgeSummary {
    pub count: usize,
    pub min: i32,
    pub max: i32,
    pub mean: f64,
}

pub fn summarize_ages(ages: &[i32]) -> Option<AgeSummary> {
    let min = *ages.iter().min()?;
    let max = *ages.iter().max()?;
    let mean = ages.iter().map(|&a| f64::from(a)).sum::<f64>() / ages.len() as f64;
    Some(AgeSummary {
        count: ages.len(),
        min,
        max,
        mean,
    })
}

pub fn build_report(repo: &CsvRepository, stats: &StatsBuilder, today: NaiveDate) -> String {
    let mut output = String::new();

    let _ = writeln!(output, "# Admissions Experiment Report");
    let _ = writeln!(
        output,
        "Generated on {} from {} ({} applicants, {} simulated)",
        today,
        repo.path().display(),
        repo.len(),
        repo.records().iter().filter(|r| r.is_simulated()).count()
    );
    let _ = writeln!(output);
    let _ = writeln!(output, "## Nationality");

    let nationalities = repo.nationality_counts(true);
    if nationalities.is_empty() {
        let _ = writeln!(output, "No nationality recorded.");
    } else {
        for row in nationalities.iter().take(10) {
            let _ = writeln!(
                output,
                "- {} ({}): {} applicants ({:.1}%)",
                row.country_name.as_deref().unwrap_or("unknown"),
                row.country_iso2,
                row.count,
                row.count_pct.unwrap_or_default()
            );
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Highest Degree Earned");

    let education = repo.education_counts(true);
    if education.is_empty() {
        let _ = writeln!(output, "No recognised degrees.");
    } else {
        for row in &education {
            let _ = writeln!(
                output,
                "- {}: {} ({:.1}%)",
                row.degree.label(),
                row.count,
                row.pct.unwrap_or_default()
            );
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Age");

    match summarize_ages(&repo.ages_on(today)) {
        Some(summary) => {
            let _ = writeln!(
                output,
                "{} applicants with a birth date, aged {} to {} (mean {:.1})",
                summary.count, summary.min, summary.max, summary.mean
            );
        }
        None => {
            let _ = writeln!(output, "No parseable birth dates.");
        }
    }

    let daily = repo.daily_applicant_counts();
    let _ = writeln!(output);
    let _ = writeln!(output, "## Daily Volume");

    match (daily.first(), daily.last()) {
        (Some(first), Some(last)) => {
            let total: usize = daily.iter().map(|d| d.users).sum();
            let _ = writeln!(
                output,
                "{} applicants over {} days between {} and {} ({:.1} per day)",
                total,
                daily.len(),
                first.date,
                last.date,
                total as f64 / daily.len() as f64
            );
        }
        _ => {
            let _ = writeln!(output, "No dated applicants.");
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Experiment Design");
    let _ = writeln!(
        output,
        "Chance of collecting the required observations within each duration."
    );
    let _ = writeln!(output);

    let mut header = String::from("| effect size | observations |");
    let mut rule = String::from("|---|---|");
    for days in DURATIONS {
        let _ = write!(header, " {days} days |");
        rule.push_str("---|");
    }
    let _ = writeln!(output, "{header}");
    let _ = writeln!(output, "{rule}");

    for effect_size in EFFECT_SIZES {
        let _ = write!(output, "| {effect_size:.1} |");
        let n_obs = match stats.required_sample_size(effect_size) {
            Ok(n) => n,
            Err(err) => {
                let _ = writeln!(output, " {err} |");
                continue;
            }
        };
        let _ = write!(output, " {n_obs} |");
        for days in DURATIONS {
            match stats.reach_probability(repo, n_obs, days) {
                Ok(pct) => {
                    let _ = write!(output, " {pct:.1}% |");
                }
                Err(_) => {
                    let _ = write!(output, " n/a |");
                }
            }
        }
        let _ = writeln!(output);
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[test]
    fn age_summary_handles_empty_input() {
        assert!(summarize_ages(&[]).is_none());
        let summary = summarize_ages(&[20, 30, 40]).unwrap();
        assert_eq!(summary.min, 20);
        assert_eq!(summary.max, 40);
        assert!((summary.mean - 30.0).abs() < 1e-9);
    }

    #[test]
    fn report_covers_every_section() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "created_at,birthday,countryISO2,highest_degree_earned,group,admission_quiz"
        )
        .unwrap();
        writeln!(file, "2022-05-01 09:00:00,1994-03-12,NG,Bachelor's,a,completed").unwrap();
        writeln!(file, "2022-05-02 09:00:00,1990-03-12,NG,Master's,b,not completed").unwrap();
        writeln!(file, "2022-05-02 10:00:00,1992-03-12,KE,Master's,b,completed").unwrap();
        file.flush().unwrap();

        let repo = CsvRepository::load(file.path()).unwrap();
        let today = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let report = build_report(&repo, &StatsBuilder::default(), today);

        assert!(report.contains("# Admissions Experiment Report"));
        assert!(report.contains("- Nigeria (NG): 2 applicants (66.7%)"));
        assert!(report.contains("- Master's: 2 (66.7%)"));
        assert!(report.contains("aged 29 to 33"));
        assert!(report.contains("3 applicants over 2 days"));
        assert!(report.contains("| 0.2 | 392 |"));
    }
}
