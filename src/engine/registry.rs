use super::{Analysis, BLocalizedEnKF, EngineError, EngineResult, Model, StochasticEnKF};
use crate::core::{ParamValue, Params};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Builds an analysis from merged parameters. `model` is `Some` exactly when
/// the descriptor requires it.
pub type AnalysisConstructor = Arc<
    dyn Fn(&Params, Option<Arc<dyn Model>>) -> EngineResult<Box<dyn Analysis>> + Send + Sync,
>;

#[derive(Clone)]
pub struct AlgorithmDescriptor {
    pub name: String,
    pub requires_model: bool,
    pub help: String,
    pub defaults: Params,
    constructor: AnalysisConstructor,
}

impl AlgorithmDescriptor {
    pub fn new<F>(name: impl Into<String>, constructor: F) -> Self
    where
        F: Fn(&Params, Option<Arc<dyn Model>>) -> EngineResult<Box<dyn Analysis>>
            + Send
            + Sync
            + 'static,
    {
        Self {
            name: name.into(),
            requires_model: false,
            help: String::new(),
            defaults: Params::new(),
            constructor: Arc::new(constructor),
        }
    }

    pub fn requires_model(mut self) -> Self {
        self.requires_model = true;
        self
    }

    pub fn help(mut self, help: impl Into<String>) -> Self {
        self.help = help.into();
        self
    }

    pub fn default_param(mut self, key: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        self.defaults.insert(key.into(), value.into());
        self
    }
}

impl std::fmt::Debug for AlgorithmDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlgorithmDescriptor")
            .field("name", &self.name)
            .field("requires_model", &self.requires_model)
            .field("defaults", &self.defaults)
            .finish_non_exhaustive()
    }
}

/// Static capability table: which algorithms exist, which need the model,
/// and how to construct them.
#[derive(Debug, Clone, Default)]
pub struct AnalysisRegistry {
    algorithms: BTreeMap<String, AlgorithmDescriptor>,
}

/// Serializable view of the registry for clients.
#[derive(Debug, Clone, Serialize)]
pub struct MethodCatalog {
    pub methods: Vec<String>,
    pub requires_model: Vec<String>,
    pub defaults: BTreeMap<String, Params>,
    pub help: BTreeMap<String, String>,
}

impl AnalysisRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the built-in EnKF variants.
    pub fn with_reference_algorithms() -> Self {
        let mut registry = Self::new();

        registry.register(
            AlgorithmDescriptor::new(StochasticEnKF::NAME, |params, _| {
                reject_unknown(StochasticEnKF::NAME, params, &[])?;
                Ok(Box::new(StochasticEnKF::new()))
            })
            .help("Stochastic ensemble Kalman filter with perturbed observations."),
        );

        registry.register(
            AlgorithmDescriptor::new(BLocalizedEnKF::NAME, |params, model| {
                reject_unknown(BLocalizedEnKF::NAME, params, &["r"])?;
                let radius = positive_param(BLocalizedEnKF::NAME, params, "r")?;
                let model = model.ok_or_else(|| EngineError::InvalidParameter {
                    algorithm: BLocalizedEnKF::NAME.to_string(),
                    name: "model".to_string(),
                    reason: "a model is required".to_string(),
                })?;
                Ok(Box::new(BLocalizedEnKF::new(model, radius)))
            })
            .requires_model()
            .default_param("r", 2.0)
            .help("EnKF with Gaussian localisation of the background covariance; r is the radius in grid points."),
        );

        registry
    }

    /// Add or replace an algorithm.
    pub fn register(&mut self, descriptor: AlgorithmDescriptor) {
        self.algorithms.insert(descriptor.name.clone(), descriptor);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.algorithms.contains_key(name)
    }

    pub fn requires_model(&self, name: &str) -> bool {
        self.algorithms
            .get(name)
            .is_some_and(|descriptor| descriptor.requires_model)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        self.algorithms.keys().cloned().collect()
    }

    pub fn descriptor(&self, name: &str) -> Option<&AlgorithmDescriptor> {
        self.algorithms.get(name)
    }

    /// Construct `name` with its defaults overridden by `params`. The model is
    /// handed over only to algorithms that declare they need it.
    pub fn build(
        &self,
        name: &str,
        params: &Params,
        model: &Arc<dyn Model>,
    ) -> EngineResult<Box<dyn Analysis>> {
        let descriptor = self
            .algorithms
            .get(name)
            .ok_or_else(|| EngineError::UnknownAlgorithm(name.to_string()))?;

        let mut merged = descriptor.defaults.clone();
        merged.extend(params.iter().map(|(k, v)| (k.clone(), v.clone())));

        let model = descriptor.requires_model.then(|| Arc::clone(model));
        (descriptor.constructor)(&merged, model)
    }

    pub fn catalog(&self) -> MethodCatalog {
        MethodCatalog {
            methods: self.names(),
            requires_model: self
                .algorithms
                .values()
                .filter(|d| d.requires_model)
                .map(|d| d.name.clone())
                .collect(),
            defaults: self
                .algorithms
                .values()
                .map(|d| (d.name.clone(), d.defaults.clone()))
                .collect(),
            help: self
                .algorithms
                .values()
                .map(|d| (d.name.clone(), d.help.clone()))
                .collect(),
        }
    }
}

fn reject_unknown(algorithm: &str, params: &Params, known: &[&str]) -> EngineResult<()> {
    match params.keys().find(|key| !known.contains(&key.as_str())) {
        Some(key) => Err(EngineError::InvalidParameter {
            algorithm: algorithm.to_string(),
            name: key.clone(),
            reason: "unknown parameter".to_string(),
        }),
        None => Ok(()),
    }
}

fn positive_param(algorithm: &str, params: &Params, key: &str) -> EngineResult<f64> {
    let invalid = |reason: String| EngineError::InvalidParameter {
        algorithm: algorithm.to_string(),
        name: key.to_string(),
        reason,
    };

    let value = params
        .get(key)
        .ok_or_else(|| invalid("missing".to_string()))?;
    let number = value
        .as_f64()
        .ok_or_else(|| invalid(format!("expected a number, got {}", value.type_name())))?;
    if number.is_finite() && number > 0.0 {
        Ok(number)
    } else {
        Err(invalid(format!("must be positive, got {number}")))
    }
}
