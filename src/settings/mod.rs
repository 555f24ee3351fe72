//! Loading and validation of settings.
//!
//! Values defined in the configuration file can be overridden by environment variables, which in
//! turn can be overridden by the command line. An example of a configuration file can be found in
//! the `configs/` directory located in the repository root.

use std::{fmt, path::Path, path::PathBuf};

use config::{Config, ConfigError, Environment};
use serde::{
    de::{self, Deserializer, Visitor},
    Deserialize,
};
use thiserror::Error;
use tracing_subscriber::filter::EnvFilter;
use validator::{Validate, ValidationError, ValidationErrors};

use crate::{algorithms::AlgorithmName, registry::Args, sampling::SampleScheme};

#[derive(Error, Debug)]
/// An error related to loading and validation of settings.
pub enum SettingsError {
    #[error("configuration loading failed: {0}")]
    Loading(#[from] ConfigError),
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationErrors),
}

#[derive(Debug, Validate, Deserialize)]
/// The combined settings.
///
/// Each section in the configuration file corresponds to the identically named settings field.
pub struct Settings {
    #[validate]
    pub federation: FederationSettings,
    #[validate]
    pub sampling: SamplingSettings,
    pub algorithm: ComponentSettings,
    pub model: ComponentSettings,
    /// The server optimizer.
    pub optimizer: ComponentSettings,
    /// The client optimizer.
    pub local_optimizer: ComponentSettings,
    /// The learning rate scheduler of the server optimizer, stepped once per round.
    #[serde(default)]
    pub lr_scheduler: Option<ComponentSettings>,
    /// The learning rate scheduler of the client optimizer, stepped once per local epoch.
    #[serde(default)]
    pub local_lr_scheduler: Option<ComponentSettings>,
    /// The scheduler of the initial learning rate of the client optimizer, stepped once per
    /// round.
    #[serde(default)]
    pub r2r_local_lr_scheduler: Option<ComponentSettings>,
    #[validate]
    pub training: TrainingSettings,
    pub data: ComponentSettings,
    #[validate]
    pub summary: SummarySettings,
    #[serde(default)]
    pub early_stop: Option<EarlyStopSettings>,
    #[validate]
    #[serde(default)]
    pub concurrency: ConcurrencySettings,
    pub log: LoggingSettings,
}

/// Overrides of single settings, typically from the command line.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Overrides {
    pub rounds: Option<u64>,
    pub num_clients: Option<usize>,
    pub sample_scheme: Option<SampleScheme>,
    pub sample_rate: Option<f64>,
    pub algorithm: Option<AlgorithmName>,
    pub epochs: Option<usize>,
    pub batch_size: Option<usize>,
    pub test_batch_size: Option<usize>,
    pub seed: Option<u64>,
    pub log_dir: Option<PathBuf>,
    pub log_freq: Option<u64>,
    pub n_point_summary: Option<usize>,
    pub workers: Option<usize>,
}

impl Settings {
    /// Loads and validates the settings via a configuration file.
    ///
    /// # Errors
    /// Fails when the loading of the configuration file or its validation failed.
    pub fn new(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        Self::with_overrides(path, &Overrides::default())
    }

    /// Loads the settings via a configuration file, applies the overrides and validates the
    /// result.
    ///
    /// # Errors
    /// Fails when the loading of the configuration file or its validation failed.
    pub fn with_overrides(
        path: impl AsRef<Path>,
        overrides: &Overrides,
    ) -> Result<Self, SettingsError> {
        let mut settings: Settings = Self::load(path)?;
        settings.apply(overrides);
        settings.validate()?;
        Ok(settings)
    }

    fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let mut config = Config::new();
        config.merge(config::File::from(path.as_ref()))?;
        config.merge(Environment::with_prefix("fedsim").separator("__"))?;
        config.try_into()
    }

    /// Applies the overrides. Overriding the algorithm drops the arguments of the configured
    /// one.
    pub fn apply(&mut self, overrides: &Overrides) {
        let Overrides {
            rounds,
            num_clients,
            sample_scheme,
            sample_rate,
            algorithm,
            epochs,
            batch_size,
            test_batch_size,
            seed,
            log_dir,
            log_freq,
            n_point_summary,
            workers,
        } = overrides.clone();

        override_with(&mut self.federation.rounds, rounds);
        override_with(&mut self.federation.num_clients, num_clients);
        override_with(&mut self.federation.seed, seed);
        override_with(&mut self.sampling.scheme, sample_scheme);
        override_with(&mut self.sampling.rate, sample_rate);
        if let Some(algorithm) = algorithm {
            let name = algorithm.to_string();
            if name != self.algorithm.name {
                self.algorithm = ComponentSettings {
                    name,
                    args: Args::new(),
                };
            }
        }
        override_with(&mut self.training.epochs, epochs);
        override_with(&mut self.training.batch_size, batch_size);
        override_with(&mut self.training.test_batch_size, test_batch_size);
        if log_dir.is_some() {
            self.log.dir = log_dir;
        }
        override_with(&mut self.summary.log_freq, log_freq);
        override_with(&mut self.summary.n_point_summary, n_point_summary);
        override_with(&mut self.concurrency.workers, workers);
    }
}

fn override_with<T>(setting: &mut T, value: Option<T>) {
    if let Some(value) = value {
        *setting = value;
    }
}

#[derive(Debug, Deserialize, Validate, Clone, Copy)]
/// Federation settings.
pub struct FederationSettings {
    /// The number of communication rounds.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [federation]
    /// rounds = 100
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDSIM_FEDERATION__ROUNDS=100
    /// ```
    #[validate(range(min = 1))]
    pub rounds: u64,
    /// The number of simulated clients.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [federation]
    /// num_clients = 500
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDSIM_FEDERATION__NUM_CLIENTS=500
    /// ```
    #[validate(range(min = 1))]
    pub num_clients: usize,
    /// The seed of every random generator of a run. The default is `0`.
    #[serde(default)]
    pub seed: u64,
}

#[derive(Debug, Deserialize, Validate, Clone, Copy)]
#[validate(schema(function = "validate_sampling"))]
/// Client sampling settings.
pub struct SamplingSettings {
    /// The client sampling scheme, `uniform` or `sequential`.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [sampling]
    /// scheme = "sequential"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDSIM_SAMPLING__SCHEME=sequential
    /// ```
    pub scheme: SampleScheme,
    /// The mean share of clients selected per round. The value must be between `0` and `1`
    /// (i.e. `0 < rate <= 1`).
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [sampling]
    /// rate = 0.01
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDSIM_SAMPLING__RATE=0.01
    /// ```
    pub rate: f64,
}

/// A wrapper for validate derive.
fn validate_sampling(s: &SamplingSettings) -> Result<(), ValidationError> {
    // the range validator can't exclude its lower bound
    if 0. < s.rate && s.rate <= 1. {
        Ok(())
    } else {
        Err(ValidationError::new("sample rate outside of (0, 1]"))
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
/// A component built by name from the registry.
///
/// # Examples
///
/// **TOML**
/// ```text
/// [local_optimizer]
/// name = "sgd"
///
/// [local_optimizer.args]
/// lr = 0.1
/// weight_decay = 0.001
/// ```
///
/// **Environment variable**
/// ```text
/// FEDSIM_LOCAL_OPTIMIZER__NAME=adam
/// ```
pub struct ComponentSettings {
    /// The registered name of the component.
    pub name: String,
    /// The arguments of the component. Omitted arguments take their default values.
    #[serde(default)]
    pub args: Args,
}

#[derive(Debug, Deserialize, Validate, Clone)]
/// Local training settings.
pub struct TrainingSettings {
    /// The number of local epochs per round.
    #[validate(range(min = 1))]
    pub epochs: usize,
    /// The local batch size.
    #[validate(range(min = 1))]
    pub batch_size: usize,
    /// The batch size of the inference for the scores.
    #[validate(range(min = 1))]
    pub test_batch_size: usize,
    /// The registered name of the loss function.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [training]
    /// loss = "cross_entropy"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDSIM_TRAINING__LOSS=mse
    /// ```
    pub loss: String,
}

#[derive(Debug, Deserialize, Validate, Clone)]
/// Score reporting settings.
pub struct SummarySettings {
    /// The gap in rounds between two evaluations of the global scores.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [summary]
    /// log_freq = 50
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDSIM_SUMMARY__LOG_FREQ=50
    /// ```
    #[validate(range(min = 1))]
    pub log_freq: u64,
    /// The number of most recent reports per score averaged into the summary of a run.
    #[validate(range(min = 1))]
    pub n_point_summary: usize,
    /// The registered names of the scores evaluated on the global splits of every deployed
    /// model.
    #[serde(default)]
    pub global_scores: Vec<String>,
    /// The registered names of the scores evaluated by the clients on their local splits.
    #[serde(default)]
    pub local_scores: Vec<String>,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
/// When an early stop threshold is reached.
pub enum StopMode {
    /// As soon as the score is at least the threshold.
    Above,
    /// As soon as the score is at most the threshold.
    Below,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
/// Early stop settings. Without this section all rounds are run.
///
/// # Examples
///
/// **TOML**
/// ```text
/// [early_stop]
/// key = "server.cloud.test.accuracy"
/// threshold = 0.9
/// mode = "above"
/// ```
pub struct EarlyStopSettings {
    /// The reported score to watch.
    pub key: String,
    pub threshold: f64,
    pub mode: StopMode,
}

impl EarlyStopSettings {
    /// Checks whether `score` reached the threshold.
    pub fn is_reached(&self, score: f64) -> bool {
        match self.mode {
            StopMode::Above => score >= self.threshold,
            StopMode::Below => score <= self.threshold,
        }
    }
}

#[derive(Debug, Deserialize, Validate, Clone, Copy)]
/// Concurrency settings.
pub struct ConcurrencySettings {
    /// The number of worker threads training the selected clients. `1` trains them one after
    /// the other.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [concurrency]
    /// workers = 4
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDSIM_CONCURRENCY__WORKERS=4
    /// ```
    #[validate(range(min = 1))]
    pub workers: usize,
}

impl Default for ConcurrencySettings {
    fn default() -> Self {
        Self { workers: 1 }
    }
}

#[derive(Debug, Deserialize)]
/// Logging settings.
pub struct LoggingSettings {
    /// A comma-separated list of logging directives. More information about logging directives
    /// can be found [here].
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [log]
    /// filter = "info"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDSIM_LOG__FILTER=info
    /// ```
    ///
    /// [here]: https://docs.rs/tracing-subscriber/0.2.25/tracing_subscriber/filter/struct.EnvFilter.html#directives
    #[serde(deserialize_with = "deserialize_env_filter")]
    pub filter: EnvFilter,
    /// The directory of the metric log `metrics.jsonl`. Without a directory no metrics are
    /// written.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [log]
    /// dir = "logs/run-1"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDSIM_LOG__DIR=logs/run-1
    /// ```
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

fn deserialize_env_filter<'de, D>(deserializer: D) -> Result<EnvFilter, D::Error>
where
    D: Deserializer<'de>,
{
    struct EnvFilterVisitor;

    impl<'de> Visitor<'de> for EnvFilterVisitor {
        type Value = EnvFilter;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            write!(formatter, "a valid tracing filter directive: https://docs.rs/tracing-subscriber/0.2.25/tracing_subscriber/filter/struct.EnvFilter.html#directives")
        }

        fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            EnvFilter::try_new(value)
                .map_err(|_| de::Error::invalid_value(serde::de::Unexpected::Str(value), &self))
        }
    }

    deserializer.deserialize_str(EnvFilterVisitor)
}

#[cfg(test)]
mod tests {
    use super::*;

    impl Default for FederationSettings {
        fn default() -> Self {
            Self {
                rounds: 10,
                num_clients: 8,
                seed: 0,
            }
        }
    }

    impl Default for TrainingSettings {
        fn default() -> Self {
            Self {
                epochs: 1,
                batch_size: 32,
                test_batch_size: 64,
                loss: "cross_entropy".to_string(),
            }
        }
    }

    impl Default for SummarySettings {
        fn default() -> Self {
            Self {
                log_freq: 1,
                n_point_summary: 10,
                global_scores: Vec::new(),
                local_scores: Vec::new(),
            }
        }
    }

    fn sampling(rate: f64) -> SamplingSettings {
        SamplingSettings {
            scheme: SampleScheme::Uniform,
            rate,
        }
    }

    #[test]
    fn test_settings_new() {
        assert!(Settings::new("configs/config.toml").is_ok());
        assert!(Settings::new("").is_err());
    }

    #[test]
    fn test_settings_with_overrides() {
        let overrides = Overrides {
            rounds: Some(3),
            sample_scheme: Some(SampleScheme::Sequential),
            sample_rate: Some(0.5),
            algorithm: Some(AlgorithmName::FedNova),
            workers: Some(2),
            log_dir: Some(PathBuf::from("logs")),
            ..Overrides::default()
        };
        let settings = Settings::with_overrides("configs/config.toml", &overrides).unwrap();
        assert_eq!(settings.federation.rounds, 3);
        assert_eq!(settings.sampling.scheme, SampleScheme::Sequential);
        assert_eq!(settings.sampling.rate, 0.5);
        assert_eq!(settings.algorithm.name, "fednova");
        assert!(settings.algorithm.args.is_empty());
        assert_eq!(settings.concurrency.workers, 2);
        assert_eq!(settings.log.dir, Some(PathBuf::from("logs")));

        let overrides = Overrides {
            sample_rate: Some(1.5),
            ..Overrides::default()
        };
        assert!(matches!(
            Settings::with_overrides("configs/config.toml", &overrides),
            Err(SettingsError::Validation(_))
        ));
    }

    #[test]
    fn test_validate_sampling() {
        assert!(sampling(1.).validate().is_ok());
        assert!(sampling(0.25).validate().is_ok());
        assert!(sampling(0.).validate().is_err());
        assert!(sampling(-0.5).validate().is_err());
        assert!(sampling(1. + f64::EPSILON).validate().is_err());
    }

    #[test]
    fn test_validate_federation() {
        assert!(FederationSettings::default().validate().is_ok());

        let mut federation = FederationSettings::default();
        federation.rounds = 0;
        assert!(federation.validate().is_err());

        let mut federation = FederationSettings::default();
        federation.num_clients = 0;
        assert!(federation.validate().is_err());
    }

    #[test]
    fn test_validate_training() {
        assert!(TrainingSettings::default().validate().is_ok());

        let mut training = TrainingSettings::default();
        training.epochs = 0;
        assert!(training.validate().is_err());

        let mut training = TrainingSettings::default();
        training.batch_size = 0;
        assert!(training.validate().is_err());

        let mut training = TrainingSettings::default();
        training.test_batch_size = 0;
        assert!(training.validate().is_err());
    }

    #[test]
    fn test_validate_summary_and_concurrency() {
        assert!(SummarySettings::default().validate().is_ok());

        let mut summary = SummarySettings::default();
        summary.n_point_summary = 0;
        assert!(summary.validate().is_err());

        let mut summary = SummarySettings::default();
        summary.log_freq = 0;
        assert!(summary.validate().is_err());

        assert!(ConcurrencySettings::default().validate().is_ok());
        assert!(ConcurrencySettings { workers: 0 }.validate().is_err());
    }

    #[test]
    fn test_early_stop() {
        let early_stop = EarlyStopSettings {
            key: "server.cloud.test.accuracy".to_string(),
            threshold: 0.9,
            mode: StopMode::Above,
        };
        assert!(early_stop.is_reached(0.9));
        assert!(!early_stop.is_reached(0.5));

        let early_stop = EarlyStopSettings {
            mode: StopMode::Below,
            ..early_stop
        };
        assert!(early_stop.is_reached(0.5));
    }
}
