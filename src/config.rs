use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::{fmt::Debug, fs, ops::RangeBounds, path::Path};

/// Simulation configuration.
///
/// Loaded from a TOML file and validated before use.
/// See [`Config::from_file`] for loading.
#[derive(Debug, Default, PartialEq, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Initial condition parameters.
    pub init: InitConfig,
    /// Model parameters.
    pub model: ModelConfig,
    /// Output parameters.
    pub output: OutputConfig,
}

#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct InitConfig {
    /// Number of hosts.
    pub n_hosts: usize,
    /// Number of individuals per host, also the per-host capacity.
    pub n_per_host: usize,

    /// Resistant founders placed at the front of the first host.
    #[serde(default)]
    pub n_resistant: usize,
    /// Mutant founders placed after the resistant ones.
    #[serde(default)]
    pub n_mutant: usize,

    /// Random number generator seed (drawn from the OS if absent).
    #[serde(default)]
    pub seed: Option<u64>,
}

#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Per-generation probability of a general mutation.
    pub mutation_rate: f64,
    /// Per-generation probability of acquiring drug resistance.
    pub resistance_rate: f64,

    /// Per-host probability of receiving a transmission bottleneck.
    pub transmission_rate: f64,
    /// Number of individuals transmitted per bottleneck.
    pub bottleneck_size: usize,

    /// Probability that the drug acts on a host with resistant individuals.
    pub drug_pressure: f64,
    /// Strength of genetic drift.
    pub drift_strength: f64,

    /// Per-individual probability of recombination.
    pub recombination_rate: f64,
    /// Fraction of each host's population that emigrates.
    pub migration_rate: f64,

    pub enable_recombination: bool,
    pub enable_migration: bool,
}

#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Number of generations simulated per run.
    pub n_generations: usize,
    /// Number of generations between progress reports.
    pub gens_per_report: usize,
}

impl Default for InitConfig {
    fn default() -> Self {
        Self {
            n_hosts: 3,
            n_per_host: 100,
            n_resistant: 0,
            n_mutant: 0,
            seed: None,
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            mutation_rate: 0.05,
            resistance_rate: 0.01,
            transmission_rate: 0.4,
            bottleneck_size: 10,
            drug_pressure: 0.7,
            drift_strength: 0.1,
            recombination_rate: 0.02,
            migration_rate: 0.05,
            enable_recombination: true,
            enable_migration: true,
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            n_generations: 1000,
            gens_per_report: 100,
        }
    }
}

impl Config {
    /// Load a [`Config`] from a TOML file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read, deserialized,
    /// or if the configuration values are invalid.
    pub fn from_file<P: AsRef<Path>>(file: P) -> Result<Self> {
        let file = file.as_ref();
        let contents =
            fs::read_to_string(file).with_context(|| format!("failed to read {file:?}"))?;

        let config: Config = toml::from_str(&contents).context("failed to deserialize config")?;

        config.validate().context("failed to validate config")?;

        Ok(config)
    }

    /// Check every parameter against its allowed range.
    pub fn validate(&self) -> Result<()> {
        self.init.validate().context("invalid init section")?;
        self.model.validate().context("invalid model section")?;
        self.output.validate().context("invalid output section")?;
        Ok(())
    }
}

impl InitConfig {
    fn validate(&self) -> Result<()> {
        check_num(self.n_hosts, 1..=1_000).context("invalid number of hosts")?;
        check_num(self.n_per_host, 1..=100_000).context("invalid number of individuals per host")?;
        let n_founders = self.n_resistant + self.n_mutant;
        if n_founders > self.n_per_host {
            bail!(
                "founders ({n_founders}) must fit in the first host ({} individuals)",
                self.n_per_host
            );
        }
        Ok(())
    }
}

impl ModelConfig {
    fn validate(&self) -> Result<()> {
        check_prob(self.mutation_rate).context("invalid mutation rate")?;
        check_prob(self.resistance_rate).context("invalid resistance rate")?;
        check_prob(self.transmission_rate).context("invalid transmission rate")?;
        check_num(self.bottleneck_size, 0..=100_000).context("invalid bottleneck size")?;
        check_prob(self.drug_pressure).context("invalid drug pressure")?;
        check_prob(self.drift_strength).context("invalid drift strength")?;
        check_prob(self.recombination_rate).context("invalid recombination rate")?;
        check_prob(self.migration_rate).context("invalid migration rate")?;
        Ok(())
    }
}

impl OutputConfig {
    fn validate(&self) -> Result<()> {
        check_num(self.n_generations, 1..=10_000_000).context("invalid number of generations")?;
        check_num(self.gens_per_report, 1..=10_000_000)
            .context("invalid number of generations per report")?;
        Ok(())
    }
}

fn check_num<T, R>(num: T, range: R) -> Result<()>
where
    T: PartialOrd + Debug,
    R: RangeBounds<T> + Debug,
{
    if !range.contains(&num) {
        bail!("number must be in the range {range:?}, but is {num:?}");
    }
    Ok(())
}

fn check_prob(prob: f64) -> Result<()> {
    check_num(prob, 0.0..=1.0)
}
