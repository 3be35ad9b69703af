use serde::Serialize;
use serde_json::{json, Value};

use crate::config::ExperimentSettings;
use crate::models::{ContingencyTable, EducationCount, NationalityCount};
use crate::repository::CsvRepository;

/// Plotly figure: traces plus layout, rendered client side.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Figure {
    pub data: Vec<Value>,
    pub layout: Value,
}

#[derive(Debug, Clone, Default)]
pub struct GraphBuilder {
    settings: ExperimentSettings,
}

impl GraphBuilder {
    pub fn new(settings: ExperimentSettings) -> Self {
        GraphBuilder { settings }
    }

    pub fn nationality_choropleth(&self, repo: &CsvRepository) -> Figure {
        choropleth(&repo.nationality_counts(true))
    }

    pub fn age_histogram(&self, repo: &CsvRepository) -> Figure {
        histogram(&repo.ages(), self.settings.age_histogram_bins)
    }

    pub fn education_bar(&self, repo: &CsvRepository) -> Figure {
        education_bar(&repo.education_counts(true))
    }

    pub fn contingency_bar(&self, repo: &CsvRepository) -> Figure {
        contingency_bar(&repo.contingency_table())
    }
}

pub fn choropleth(counts: &[NationalityCount]) -> Figure {
    // Plotly cannot place rows without an ISO-3 code.
    let located: Vec<&NationalityCount> =
        counts.iter().filter(|c| c.country_iso3.is_some()).collect();

    let trace = json!({
        "type": "choropleth",
        "locationmode": "ISO-3",
        "locations": located.iter().map(|c| c.country_iso3.clone()).collect::<Vec<_>>(),
        "z": located.iter().map(|c| c.count_pct.unwrap_or_default()).collect::<Vec<_>>(),
        "text": located
            .iter()
            .map(|c| c.country_name.clone().unwrap_or_else(|| c.country_iso2.clone()))
            .collect::<Vec<_>>(),
        "customdata": located.iter().map(|c| c.count).collect::<Vec<_>>(),
        "hovertemplate": "<b>%{text}</b><br>count=%{customdata}<br>count_pct=%{z:.2f}<extra></extra>",
        "colorscale": "Oranges",
        "colorbar": { "title": { "text": "count_pct" } },
    });

    Figure {
        data: vec![trace],
        layout: json!({
            "title": { "text": "Applicants: Nationality" },
            "geo": { "projection": { "type": "natural earth" } },
        }),
    }
}

pub fn histogram(ages: &[i32], bins: usize) -> Figure {
    let trace = json!({
        "type": "histogram",
        "x": ages,
        "nbinsx": bins,
    });

    Figure {
        data: vec![trace],
        layout: json!({
            "title": { "text": "Applicants: Age" },
            "xaxis": { "title": { "text": "Age" } },
            "yaxis": { "title": { "text": "Frequency [count]" } },
            "width": 800,
            "height": 600,
        }),
    }
}

pub fn education_bar(counts: &[EducationCount]) -> Figure {
    let trace = json!({
        "type": "bar",
        "x": counts.iter().map(|c| c.degree.label()).collect::<Vec<_>>(),
        "y": counts
            .iter()
            .map(|c| c.pct.unwrap_or(c.count as f64))
            .collect::<Vec<_>>(),
    });

    Figure {
        data: vec![trace],
        layout: json!({
            "title": { "text": "Applicants: Highest Degree Earned" },
            "xaxis": {
                "title": { "text": "Degree" },
                "categoryorder": "total descending",
            },
            "yaxis": { "title": { "text": "Frequency [%]" } },
            "width": 800,
            "height": 600,
        }),
    }
}

/// Grouped bars: one trace per outcome, groups along the x axis.
pub fn contingency_bar(table: &ContingencyTable) -> Figure {
    let data = table
        .outcomes
        .iter()
        .enumerate()
        .map(|(col, outcome)| {
            json!({
                "type": "bar",
                "name": outcome.label(),
                "x": table.groups,
                "y": table.counts.iter().map(|row| row[col]).collect::<Vec<_>>(),
            })
        })
        .collect();

    Figure {
        data,
        layout: json!({
            "title": { "text": "Quiz Completion by Group" },
            "barmode": "group",
            "xaxis": { "title": { "text": "Group" } },
            "yaxis": { "title": { "text": "Number of Users" } },
            "legend": { "title": { "text": "Outcome" } },
        }),
    }
}
