use super::value::Params;
use serde::{Deserialize, Serialize};

/// One configured stage: an algorithm invocation with its own parameters.
///
/// `id` is client-supplied and unique within the run, so the same algorithm
/// can appear twice with different parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageSpec {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default)]
    pub params: Params,
}

impl StageSpec {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            label: None,
            params: Params::new(),
        }
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn param(mut self, key: impl Into<String>, value: impl Into<super::ParamValue>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// Label shown to clients; falls back to the algorithm name.
    pub fn display_label(&self) -> &str {
        self.label.as_deref().unwrap_or(&self.name)
    }
}

/// Immutable snapshot of everything needed to reproduce a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub model: String,

    pub ensemble_size: usize,

    /// Number of observed state components.
    pub m: usize,
    pub std_obs: f64,

    /// Simulated time between assimilation cycles.
    pub obs_freq: f64,
    pub end_time: f64,
    pub inf_fact: f64,

    pub lorenz96_n: usize,
    #[serde(rename = "lorenz96_F")]
    pub lorenz96_f: f64,

    /// Fixes every random draw of the run when present.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,

    pub methods: Vec<StageSpec>,
}

pub const LORENZ96_MODEL: &str = "lorenz96";

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            model: LORENZ96_MODEL.to_string(),
            ensemble_size: 20,
            m: 32,
            std_obs: 0.01,
            obs_freq: 0.1,
            end_time: 10.0,
            inf_fact: 1.04,
            lorenz96_n: 40,
            lorenz96_f: 8.0,
            seed: None,
            methods: Vec::new(),
        }
    }
}

impl RunConfig {
    pub fn with_stage(mut self, stage: StageSpec) -> Self {
        self.methods.push(stage);
        self
    }

    pub fn end_time(mut self, end_time: f64) -> Self {
        self.end_time = end_time;
        self
    }

    pub fn obs_freq(mut self, obs_freq: f64) -> Self {
        self.obs_freq = obs_freq;
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_take_defaults() {
        let config: RunConfig = serde_json::from_str(
            r#"{"end_time": 1.0, "lorenz96_F": 9.5, "methods": [{"id": "m1", "name": "enkf"}]}"#,
        )
        .unwrap();

        assert_eq!(config.model, "lorenz96");
        assert_eq!(config.ensemble_size, 20);
        assert_eq!(config.lorenz96_f, 9.5);
        assert_eq!(config.end_time, 1.0);
        assert_eq!(config.methods[0].display_label(), "enkf");
        assert!(config.methods[0].params.is_empty());
    }

    #[test]
    fn serializes_forcing_under_capital_f_key() {
        let json = serde_json::to_value(RunConfig::default()).unwrap();
        assert_eq!(json["lorenz96_F"], 8.0);
        assert!(json.get("seed").is_none());
    }
}
