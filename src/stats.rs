use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use statrs::distribution::{ChiSquared, ContinuousCDF, Normal};
use tracing::{debug, info};

use crate::config::ExperimentSettings;
use crate::error::{AnalysisError, Result};
use crate::models::{ApplicantRecord, ChiSquareResult, DailyCount, SimulationResult};
use crate::repository::CsvRepository;

#[derive(Debug, Clone, Default)]
pub struct StatsBuilder {
    settings: ExperimentSettings,
}

impl StatsBuilder {
    pub fn new(settings: ExperimentSettings) -> Self {
        StatsBuilder { settings }
    }

    /// Total observations, across all groups, needed to detect `effect_size`
    /// with a two-bin chi-square goodness-of-fit test.
    pub fn required_sample_size(&self, effect_size: f64) -> Result<usize> {
        if !effect_size.is_finite()
            || effect_size <= 0.0
            || effect_size > self.settings.max_effect_size
        {
            return Err(AnalysisError::InvalidParameter(format!(
                "effect size must be in (0, {}], got {effect_size}",
                self.settings.max_effect_size
            )));
        }

        let lambda = required_noncentrality(self.settings.alpha, self.settings.power)?;
        let group_size = (lambda / (effect_size * effect_size)).floor();
        debug!(effect_size, lambda, group_size, "solved chi-square power");

        let too_large = || {
            AnalysisError::InvalidParameter(format!(
                "effect size {effect_size} needs more observations than can be counted"
            ))
        };
        // `usize::MAX as f64` rounds up to 2^64, so the comparison must be strict.
        if !group_size.is_finite() || group_size >= usize::MAX as f64 {
            return Err(too_large());
        }
        (group_size as usize)
            .checked_mul(self.settings.groups)
            .ok_or_else(too_large)
    }

    /// Percent chance (0-100) of collecting at least `target` observations in
    /// `days` days.
    ///
    /// Daily volumes are treated as i.i.d. and the window total as Normal with
    /// mean `days * mean` and standard deviation `sqrt(days) * sd`. This is an
    /// approximation: real daily counts are discrete and autocorrelated.
    pub fn reach_probability(
        &self,
        repo: &CsvRepository,
        target: usize,
        days: u32,
    ) -> Result<f64> {
        reach_probability_from(&repo.daily_applicant_counts(), target, days)
    }

    /// Replays `days` distinct historical days, chosen with a seeded RNG, as
    /// synthetic applicants and appends them to the repository.
    pub fn simulate_experiment(
        &self,
        repo: &mut CsvRepository,
        days: usize,
        seed: u64,
    ) -> Result<SimulationResult> {
        if days == 0 {
            return Err(AnalysisError::InvalidParameter(
                "experiment must run for at least one day".to_string(),
            ));
        }

        let history = repo.daily_applicant_counts();
        let daily_sample = sample_days(&history, days, seed)?;

        let records: Vec<ApplicantRecord> = daily_sample
            .iter()
            .flat_map(|day| (0..day.users).map(move |_| ApplicantRecord::simulated(day.date)))
            .collect();
        let total_users = records.len();

        repo.append_simulated_records(records)?;
        info!(days, seed, total_users, "simulated experiment");

        Ok(SimulationResult {
            days_sampled: days,
            total_users,
            daily_sample,
        })
    }

    /// Pearson chi-square test of independence between experimental group and
    /// quiz completion.
    pub fn association_test(&self, repo: &CsvRepository) -> Result<ChiSquareResult> {
        let table = repo.contingency_table();
        chi_square_independence(&table.counts)
    }
}

/// Noncentrality at which a 1-df chi-square test at `alpha` reaches `power`.
fn required_noncentrality(alpha: f64, power: f64) -> Result<f64> {
    let in_unit = |v: f64| v > 0.0 && v < 1.0;
    if !in_unit(alpha) || !in_unit(power) {
        return Err(AnalysisError::InvalidParameter(format!(
            "alpha {alpha} and power {power} must lie in (0, 1)"
        )));
    }
    let standard = Normal::standard();
    let critical = standard.inverse_cdf(1.0 - alpha / 2.0);
    // Squared shifted normal: P((Z + sqrt(l))^2 > critical^2).
    let power_at = |lambda: f64| {
        let shift = lambda.sqrt();
        standard.cdf(shift - critical) + standard.cdf(-shift - critical)
    };
    if power <= power_at(0.0) {
        return Ok(0.0);
    }

    let (mut lo, mut hi) = (0.0_f64, 1.0_f64);
    while power_at(hi) < power {
        hi *= 2.0;
    }
    for _ in 0..200 {
        let mid = 0.5 * (lo + hi);
        if power_at(mid) < power {
            lo = mid;
        } else {
            hi = mid;
        }
        if hi - lo < 1e-12 {
            break;
        }
    }
    Ok(hi)
}

pub fn reach_probability_from(daily: &[DailyCount], target: usize, days: u32) -> Result<f64> {
    if days == 0 {
        return Err(AnalysisError::InvalidParameter(
            "duration must be at least one day".to_string(),
        ));
    }
    if daily.is_empty() {
        return Err(AnalysisError::InsufficientData(
            "no dated applicants to estimate daily volume".to_string(),
        ));
    }

    let n = daily.len() as f64;
    let mean = daily.iter().map(|d| d.users as f64).sum::<f64>() / n;
    let variance = if daily.len() > 1 {
        daily
            .iter()
            .map(|d| (d.users as f64 - mean).powi(2))
            .sum::<f64>()
            / (n - 1.0)
    } else {
        0.0
    };

    let days = f64::from(days);
    let total_mean = days * mean;
    let total_sd = days.sqrt() * variance.sqrt();
    let target = target as f64;

    if total_sd <= 0.0 {
        return Ok(if target <= total_mean { 100.0 } else { 0.0 });
    }

    let normal = Normal::new(total_mean, total_sd)
        .map_err(|err| AnalysisError::InvalidParameter(err.to_string()))?;
    Ok((normal.sf(target) * 100.0).clamp(0.0, 100.0))
}

/// Picks `days` distinct entries of `history`, returned in date order.
pub fn sample_days(history: &[DailyCount], days: usize, seed: u64) -> Result<Vec<DailyCount>> {
    if days > history.len() {
        return Err(AnalysisError::InsufficientData(format!(
            "requested {days} days, have {}",
            history.len()
        )));
    }
    let mut rng = StdRng::seed_from_u64(seed);
    let mut sampled: Vec<DailyCount> = history.choose_multiple(&mut rng, days).copied().collect();
    sampled.sort_by_key(|d| d.date);
    Ok(sampled)
}

pub fn chi_square_independence(counts: &[Vec<usize>]) -> Result<ChiSquareResult> {
    let rows = counts.len();
    let cols = counts.first().map_or(0, Vec::len);
    if rows < 2 || cols < 2 || counts.iter().any(|row| row.len() != cols) {
        return Err(AnalysisError::InsufficientData(format!(
            "need at least a 2x2 table, got {rows}x{cols}"
        )));
    }

    let row_totals: Vec<f64> = counts
        .iter()
        .map(|row| row.iter().sum::<usize>() as f64)
        .collect();
    let col_totals: Vec<f64> = (0..cols)
        .map(|c| counts.iter().map(|row| row[c]).sum::<usize>() as f64)
        .collect();
    let total: f64 = row_totals.iter().sum();

    let mut statistic = 0.0;
    let mut sparse_cells = 0usize;
    for (r, row) in counts.iter().enumerate() {
        for (c, &observed) in row.iter().enumerate() {
            let expected = row_totals[r] * col_totals[c] / total.max(1.0);
            if expected <= 0.0 {
                return Err(AnalysisError::InsufficientData(
                    "contingency table has a cell with zero expected count".to_string(),
                ));
            }
            if expected < 5.0 {
                sparse_cells += 1;
            }
            statistic += (observed as f64 - expected).powi(2) / expected;
        }
    }

    let cells = rows * cols;
    if sparse_cells * 5 > cells {
        return Err(AnalysisError::InsufficientData(format!(
            "{sparse_cells} of {cells} cells have an expected count below 5"
        )));
    }

    let df = (rows - 1) * (cols - 1);
    let reference = ChiSquared::new(df as f64)
        .map_err(|err| AnalysisError::InvalidParameter(err.to_string()))?;

    Ok(ChiSquareResult {
        statistic,
        df,
        pvalue: reference.sf(statistic),
    })
}
