use std::convert::Infallible;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{info, warn};
use warp::http::StatusCode;
use warp::reply::{Reply, Response};
use warp::{Filter, Rejection};

use crate::config::DashboardConfig;
use crate::error::AnalysisError;
use crate::graphs::{Figure, GraphBuilder};
use crate::models::{ChiSquareResult, SimulationResult};
use crate::repository::CsvRepository;
use crate::stats::StatsBuilder;

/// Shared by every request. Queries hold the read lock, the experiment run
/// holds the write lock for its whole append.
pub struct AppState {
    pub repo: RwLock<CsvRepository>,
    pub graphs: GraphBuilder,
    pub stats: StatsBuilder,
    pub default_seed: u64,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    pub fn new(repo: CsvRepository, config: &DashboardConfig) -> SharedState {
        Arc::new(AppState {
            repo: RwLock::new(repo),
            graphs: GraphBuilder::new(config.settings),
            stats: StatsBuilder::new(config.settings),
            default_seed: config.seed,
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct SampleSizeQuery {
    pub effect_size: f64,
}

#[derive(Debug, Deserialize)]
pub struct ReachQuery {
    pub effect_size: f64,
    pub days: u32,
}

#[derive(Debug, Deserialize)]
pub struct ExperimentRequest {
    pub days: usize,
    pub seed: Option<u64>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Serialize)]
struct SampleSizeBody {
    effect_size: f64,
    observations: usize,
    text: String,
}

#[derive(Debug, Serialize)]
struct ReachBody {
    effect_size: f64,
    days: u32,
    observations: usize,
    probability_pct: f64,
    text: String,
}

#[derive(Debug, Serialize)]
struct ExperimentBody {
    simulation: SimulationResult,
    figure: Figure,
    chi_square: Option<ChiSquareResult>,
    chi_square_error: Option<String>,
}

pub async fn serve(state: SharedState, config: &DashboardConfig) {
    info!(
        "dashboard for {} listening on http://{}",
        config.data_path.display(),
        config.addr
    );
    warp::serve(routes(state)).run(config.addr).await;
}

pub fn routes(state: SharedState) -> impl Filter<Extract = (Response,), Error = Infallible> + Clone {
    let index = warp::path::end()
        .and(warp::get())
        .map(|| warp::reply::html(INDEX_HTML).into_response());

    let health = warp::path("health").and(warp::get()).map(|| {
        warp::reply::json(&serde_json::json!({ "status": "healthy" })).into_response()
    });

    let demographics = warp::path!("api" / "demographics" / String)
        .and(warp::get())
        .and(with_state(state.clone()))
        .and_then(demographic_chart);

    let size = warp::path!("api" / "sample-size")
        .and(warp::get())
        .and(warp::query::<SampleSizeQuery>())
        .and(with_state(state.clone()))
        .and_then(sample_size);

    let reach = warp::path!("api" / "reach-probability")
        .and(warp::get())
        .and(warp::query::<ReachQuery>())
        .and(with_state(state.clone()))
        .and_then(reach_probability);

    let experiment = warp::path!("api" / "experiment")
        .and(warp::post())
        .and(warp::body::json::<ExperimentRequest>())
        .and(with_state(state))
        .and_then(run_experiment);

    index
        .or(health)
        .unify()
        .or(demographics)
        .unify()
        .or(size)
        .unify()
        .or(reach)
        .unify()
        .or(experiment)
        .unify()
        .recover(handle_rejection)
        .unify()
}

fn with_state(state: SharedState) -> impl Filter<Extract = (SharedState,), Error = Infallible> + Clone {
    warp::any().map(move || state.clone())
}

async fn demographic_chart(name: String, state: SharedState) -> Result<Response, Infallible> {
    let repo = state.repo.read().await;
    let figure = match name.to_lowercase().as_str() {
        "nationality" => state.graphs.nationality_choropleth(&repo),
        "age" => state.graphs.age_histogram(&repo),
        "education" => state.graphs.education_bar(&repo),
        other => {
            return Ok(error_reply(
                StatusCode::NOT_FOUND,
                format!("unknown demographic chart {other:?}"),
            ))
        }
    };
    Ok(warp::reply::json(&figure).into_response())
}

async fn sample_size(query: SampleSizeQuery, state: SharedState) -> Result<Response, Infallible> {
    let observations = match state.stats.required_sample_size(query.effect_size) {
        Ok(n) => n,
        Err(err) => return Ok(analysis_error_reply(err)),
    };
    Ok(warp::reply::json(&SampleSizeBody {
        effect_size: query.effect_size,
        observations,
        text: format!(
            "To detect an effect size of {}, you would need {} observations",
            query.effect_size, observations
        ),
    })
    .into_response())
}

async fn reach_probability(query: ReachQuery, state: SharedState) -> Result<Response, Infallible> {
    let observations = match state.stats.required_sample_size(query.effect_size) {
        Ok(n) => n,
        Err(err) => return Ok(analysis_error_reply(err)),
    };
    let repo = state.repo.read().await;
    let pct = match state.stats.reach_probability(&repo, observations, query.days) {
        Ok(pct) => pct,
        Err(err) => return Ok(analysis_error_reply(err)),
    };
    Ok(warp::reply::json(&ReachBody {
        effect_size: query.effect_size,
        days: query.days,
        observations,
        probability_pct: pct,
        text: format!(
            "The probability of getting this number of observations in {} days is {:.1}%",
            query.days, pct
        ),
    })
    .into_response())
}

async fn run_experiment(
    request: ExperimentRequest,
    state: SharedState,
) -> Result<Response, Infallible> {
    let seed = request.seed.unwrap_or(state.default_seed);

    // The append rewrites the CSV with std::fs, so it runs off the async workers.
    let outcome = tokio::task::spawn_blocking({
        let state = Arc::clone(&state);
        move || experiment_body(&state, request.days, seed)
    })
    .await;

    match outcome {
        Ok(Ok(body)) => Ok(warp::reply::json(&body).into_response()),
        Ok(Err(err)) => Ok(analysis_error_reply(err)),
        Err(err) => {
            warn!("experiment task failed: {err}");
            Ok(error_reply(
                StatusCode::INTERNAL_SERVER_ERROR,
                "experiment task failed".to_string(),
            ))
        }
    }
}

/// Holds the write lock from the append until the association test has read
/// the grown table.
fn experiment_body(
    state: &AppState,
    days: usize,
    seed: u64,
) -> Result<ExperimentBody, AnalysisError> {
    let mut repo = state.repo.blocking_write();

    let simulation = state.stats.simulate_experiment(&mut repo, days, seed)?;
    let figure = state.graphs.contingency_bar(&repo);
    let (chi_square, chi_square_error) = match state.stats.association_test(&repo) {
        Ok(result) => (Some(result), None),
        Err(err) => {
            warn!("association test failed: {err}");
            (None, Some(err.to_string()))
        }
    };

    Ok(ExperimentBody {
        simulation,
        figure,
        chi_square,
        chi_square_error,
    })
}

async fn handle_rejection(rejection: Rejection) -> Result<Response, Infallible> {
    if rejection.is_not_found() {
        return Ok(error_reply(StatusCode::NOT_FOUND, "not found".to_string()));
    }
    warn!("rejected request: {rejection:?}");
    Ok(error_reply(
        StatusCode::BAD_REQUEST,
        "malformed request parameters".to_string(),
    ))
}

fn analysis_error_reply(err: AnalysisError) -> Response {
    let status = if err.is_user_facing() {
        StatusCode::UNPROCESSABLE_ENTITY
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    warn!("request failed: {err}");
    error_reply(status, err.to_string())
}

fn error_reply(status: StatusCode, error: String) -> Response {
    warp::reply::with_status(warp::reply::json(&ErrorBody { error }), status).into_response()
}

const INDEX_HTML: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
  <meta charset="utf-8">
  <title>Admissions Experiment</title>
  <script src="https://cdn.plot.ly/plotly-2.35.2.min.js"></script>
  <style>
    body { font-family: system-ui, sans-serif; margin: 2rem auto; max-width: 960px; color: #0c1625; }
    .error { color: #e11d48; }
    label { display: block; margin-top: 1rem; }
    input[type=range] { width: 100%; }
  </style>
</head>
<body>
  <h1>Application Demographics</h1>
  <select id="demo-plots-dropdown">
    <option value="nationality" selected>Nationality</option>
    <option value="age">Age</option>
    <option value="education">Education</option>
  </select>
  <div id="demo-plot-display"></div>

  <h1>Experiment</h1>
  <h2>Choose your effect size</h2>
  <input type="range" id="effect-size-slider" min="0.1" max="0.8" step="0.1" value="0.2">
  <span id="effect-size-value">0.2</span>
  <div id="effect-size-display"></div>

  <h2>Choose Experiment Duration</h2>
  <input type="range" id="experiment-days-slider" min="150" max="500" step="50" value="150">
  <span id="experiment-days-value">150</span>
  <div id="experiment-days-display"></div>

  <h1>Results</h1>
  <button id="start-experiment-button">Display Experiment</button>
  <div id="results-display"></div>
  <div id="results-plot"></div>

<script>
const $ = (id) => document.getElementById(id);

async function getJson(url, options) {
  const resp = await fetch(url, options);
  const body = await resp.json();
  if (!resp.ok) throw new Error(body.error || resp.statusText);
  return body;
}

function showError(id, err) {
  const el = $(id);
  Plotly.purge(el);
  const p = document.createElement('p');
  p.className = 'error';
  p.textContent = err.message;
  el.replaceChildren(p);
}

async function refreshDemographics() {
  try {
    const fig = await getJson('/api/demographics/' + $('demo-plots-dropdown').value);
    $('demo-plot-display').innerHTML = '';
    Plotly.newPlot('demo-plot-display', fig.data, fig.layout);
  } catch (err) {
    showError('demo-plot-display', err);
  }
}

async function refreshExperimentDesign() {
  const effect = parseFloat($('effect-size-slider').value).toFixed(1);
  const days = $('experiment-days-slider').value;
  $('effect-size-value').textContent = effect;
  $('experiment-days-value').textContent = days;
  try {
    const size = await getJson('/api/sample-size?effect_size=' + effect);
    $('effect-size-display').textContent = size.text;
  } catch (err) {
    showError('effect-size-display', err);
  }
  try {
    const reach = await getJson('/api/reach-probability?effect_size=' + effect + '&days=' + days);
    $('experiment-days-display').textContent = reach.text;
  } catch (err) {
    showError('experiment-days-display', err);
  }
}

async function runExperiment() {
  const days = parseInt($('experiment-days-slider').value, 10);
  try {
    const result = await getJson('/api/experiment', {
      method: 'POST',
      headers: { 'Content-Type': 'application/json' },
      body: JSON.stringify({ days: days }),
    });
    const sim = result.simulation;
    let text = 'Simulated ' + sim.total_users + ' applicants over ' + sim.days_sampled + ' days. ';
    if (result.chi_square) {
      const c = result.chi_square;
      text += 'Chi-square: statistic ' + c.statistic.toFixed(3) + ', df ' + c.df +
        ', p-value ' + c.pvalue.toFixed(4) + '.';
    } else {
      text += 'Chi-square test unavailable: ' + result.chi_square_error;
    }
    $('results-display').textContent = text;
    Plotly.newPlot('results-plot', result.figure.data, result.figure.layout);
  } catch (err) {
    showError('results-display', err);
    Plotly.purge($('results-plot'));
  }
}

$('demo-plots-dropdown').addEventListener('change', refreshDemographics);
$('effect-size-slider').addEventListener('input', refreshExperimentDesign);
$('experiment-days-slider').addEventListener('input', refreshExperimentDesign);
$('start-experiment-button').addEventListener('click', runExperiment);

refreshDemographics();
refreshExperimentDesign();
</script>
</body>
</html>
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExperimentSettings;
    use std::io::Write;

    fn fixture() -> (tempfile::NamedTempFile, SharedState) {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "created_at,birthday,countryISO2,highest_degree_earned,group,admission_quiz"
        )
        .unwrap();
        for day in 1..=9 {
            for (group, quiz) in [
                ("email (t)", "Completed"),
                ("email (t)", "Not Completed"),
                ("no email (c)", "Completed"),
                ("no email (c)", "Not Completed"),
            ] {
                writeln!(
                    file,
                    "2022-06-0{day} 12:00:00,1995-04-0{day},DE,Master's,{group},{quiz}"
                )
                .unwrap();
            }
        }
        file.flush().unwrap();

        let repo = CsvRepository::load(file.path()).unwrap();
        let config = DashboardConfig {
            data_path: file.path().to_path_buf(),
            addr: ([127, 0, 0, 1], 0).into(),
            seed: 42,
            settings: ExperimentSettings::default(),
        };
        let state = AppState::new(repo, &config);
        (file, state)
    }

    fn json_body(body: &[u8]) -> serde_json::Value {
        serde_json::from_slice(body).unwrap()
    }

    #[tokio::test]
    async fn index_wires_the_button_to_its_own_id() {
        let (_file, state) = fixture();
        let resp = warp::test::request().path("/").reply(&routes(state)).await;

        assert_eq!(resp.status(), StatusCode::OK);
        let html = std::str::from_utf8(resp.body()).unwrap();
        assert!(html.contains(r#"id="start-experiment-button""#));
        assert!(html.contains("$('start-experiment-button').addEventListener"));
    }

    #[tokio::test]
    async fn sample_size_reports_observations() {
        let (_file, state) = fixture();
        let resp = warp::test::request()
            .path("/api/sample-size?effect_size=0.2")
            .reply(&routes(state))
            .await;

        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(json_body(resp.body())["observations"], serde_json::json!(392));
    }

    #[tokio::test]
    async fn invalid_effect_size_is_unprocessable() {
        let (_file, state) = fixture();
        let resp = warp::test::request()
            .path("/api/sample-size?effect_size=0")
            .reply(&routes(state))
            .await;

        assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert!(json_body(resp.body())["error"]
            .as_str()
            .unwrap()
            .contains("effect size"));
    }

    #[tokio::test]
    async fn vanishing_effect_size_is_unprocessable() {
        let (_file, state) = fixture();
        let resp = warp::test::request()
            .path("/api/sample-size?effect_size=1e-10")
            .reply(&routes(state))
            .await;

        assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn index_renders_errors_as_text() {
        let (_file, state) = fixture();
        let resp = warp::test::request().path("/").reply(&routes(state)).await;

        let html = std::str::from_utf8(resp.body()).unwrap();
        assert!(html.contains("p.textContent = err.message;"));
        assert!(!html.contains("+ err.message +"));
    }

    #[tokio::test]
    async fn reach_probability_is_a_percentage() {
        let (_file, state) = fixture();
        let resp = warp::test::request()
            .path("/api/reach-probability?effect_size=0.5&days=150")
            .reply(&routes(state))
            .await;

        assert_eq!(resp.status(), StatusCode::OK);
        let pct = json_body(resp.body())["probability_pct"].as_f64().unwrap();
        assert!((0.0..=100.0).contains(&pct));
    }

    #[tokio::test]
    async fn demographic_charts_are_served() {
        let (_file, state) = fixture();
        let routes = routes(state);
        for (name, kind) in [
            ("nationality", "choropleth"),
            ("age", "histogram"),
            ("education", "bar"),
        ] {
            let resp = warp::test::request()
                .path(&format!("/api/demographics/{name}"))
                .reply(&routes)
                .await;
            assert_eq!(resp.status(), StatusCode::OK);
            assert_eq!(json_body(resp.body())["data"][0]["type"], serde_json::json!(kind));
        }

        let resp = warp::test::request()
            .path("/api/demographics/income")
            .reply(&routes)
            .await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn experiment_runs_simulation_then_association_test() {
        let (file, state) = fixture();
        let resp = warp::test::request()
            .method("POST")
            .path("/api/experiment")
            .json(&serde_json::json!({ "days": 3, "seed": 1 }))
            .reply(&routes(state.clone()))
            .await;

        assert_eq!(resp.status(), StatusCode::OK);
        let body = json_body(resp.body());
        assert_eq!(body["simulation"]["days_sampled"], serde_json::json!(3));
        assert_eq!(body["simulation"]["total_users"], serde_json::json!(12));
        assert_eq!(body["figure"]["layout"]["barmode"], serde_json::json!("group"));
        assert_eq!(body["chi_square"]["df"], serde_json::json!(1));
        assert_eq!(state.repo.read().await.len(), 48);
        assert_eq!(CsvRepository::load(file.path()).unwrap().len(), 48);
    }

    #[tokio::test]
    async fn experiment_longer_than_history_is_rejected() {
        let (_file, state) = fixture();
        let resp = warp::test::request()
            .method("POST")
            .path("/api/experiment")
            .json(&serde_json::json!({ "days": 150 }))
            .reply(&routes(state.clone()))
            .await;

        assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(state.repo.read().await.len(), 36);
    }
}
