use std::net::SocketAddr;
use std::path::PathBuf;

/// Fixed experiment-design parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExperimentSettings {
    /// Significance level of the power analysis.
    pub alpha: f64,
    /// Target power of the power analysis.
    pub power: f64,
    /// Number of experimental groups sharing the sample.
    pub groups: usize,
    pub max_effect_size: f64,
    pub age_histogram_bins: usize,
}

impl Default for ExperimentSettings {
    fn default() -> Self {
        ExperimentSettings {
            alpha: 0.05,
            power: 0.8,
            groups: 2,
            max_effect_size: 1.0,
            age_histogram_bins: 20,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DashboardConfig {
    pub data_path: PathBuf,
    pub addr: SocketAddr,
    pub seed: u64,
    pub settings: ExperimentSettings,
}
