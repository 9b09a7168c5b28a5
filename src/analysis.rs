//! Run summary built from the per-generation snapshots.

use crate::model::Lineage;
use crate::stats::StatsSnapshot;
use anyhow::{Context, Result};
use serde::Serialize;

/// Online mean and standard deviation (Welford).
#[derive(Default)]
pub struct Accumulator {
    n_vals: usize,
    mean: f64,
    diff_2_sum: f64,
}

#[derive(Debug, Serialize)]
pub struct AccumulatorReport {
    pub mean: f64,
    pub std_dev: f64,
}

impl Accumulator {
    pub fn add(&mut self, val: f64) {
        self.n_vals += 1;
        let diff_a = val - self.mean;
        self.mean += diff_a / self.n_vals as f64;
        let diff_b = val - self.mean;
        self.diff_2_sum += diff_a * diff_b;
    }

    pub fn report(&self) -> AccumulatorReport {
        let std_dev = match self.n_vals {
            0 | 1 => f64::NAN,
            n_vals => (self.diff_2_sum / (n_vals - 1) as f64).sqrt(),
        };
        AccumulatorReport {
            mean: if self.n_vals == 0 { f64::NAN } else { self.mean },
            std_dev,
        }
    }
}

/// Stored series whose statistics discard an initial transient.
#[derive(Default)]
pub struct TimeSeries {
    vals: Vec<f64>,
}

#[derive(Debug, Serialize)]
pub struct TimeSeriesReport {
    pub mean: f64,
    pub std_dev: f64,
    pub sem: f64,
    pub is_equil: bool,
}

impl TimeSeries {
    pub fn push(&mut self, val: f64) {
        self.vals.push(val);
    }

    pub fn report(&self) -> TimeSeriesReport {
        let i_equil = equil_index(&self.vals);
        let tail = &self.vals[i_equil..];
        TimeSeriesReport {
            mean: mean(tail),
            std_dev: var(tail).sqrt(),
            sem: blocked_sem(tail),
            // Falling back to the midpoint means no cut was better.
            is_equil: !self.vals.is_empty() && i_equil != self.vals.len() / 2,
        }
    }
}

fn mean(vals: &[f64]) -> f64 {
    if vals.is_empty() {
        return f64::NAN;
    }
    vals.iter().sum::<f64>() / vals.len() as f64
}

fn var(vals: &[f64]) -> f64 {
    if vals.len() < 2 {
        return f64::NAN;
    }
    let mean = mean(vals);
    let sq_sum: f64 = vals.iter().map(|&val| (val - mean).powi(2)).sum();
    sq_sum / (vals.len() - 1) as f64
}

/// Standard error of the mean by Flyvbjerg-Petersen blocking.
///
/// Picks the first blocking level whose estimate exceeds the lower error
/// bound of every coarser level.
fn blocked_sem(vals: &[f64]) -> f64 {
    let mut levels = Vec::new();
    let mut blocked = vals.to_vec();
    while blocked.len() >= 2 {
        let n_vals = blocked.len() as f64;
        let sem_2 = var(&blocked) / n_vals;
        levels.push((sem_2, sem_2 * (2.0 / (n_vals - 1.0)).sqrt()));
        blocked = blocked
            .chunks_exact(2)
            .map(|pair| (pair[0] + pair[1]) / 2.0)
            .collect();
    }

    for (i_level, &(sem_2, _)) in levels.iter().enumerate() {
        let max_low = levels[i_level..]
            .iter()
            .map(|(est, err)| est - err)
            .fold(f64::NEG_INFINITY, f64::max);
        if sem_2 > max_low {
            return sem_2.sqrt();
        }
    }

    levels.last().map_or(f64::NAN, |&(sem_2, _)| sem_2.sqrt())
}

/// Equilibration index chosen by the marginal standard error rule.
fn equil_index(vals: &[f64]) -> usize {
    let n_vals = vals.len();
    let mut opt_i_equil = n_vals / 2;
    if n_vals == 0 {
        return opt_i_equil;
    }

    let mut min_mse = f64::INFINITY;
    let n_cuts = n_vals.ilog2() + 1;
    for i_cut in 0..n_cuts {
        let i_equil = n_vals / 2_usize.pow(n_cuts - i_cut);
        let tail = &vals[i_equil..];
        let n_tail = tail.len();
        let mse = var(tail) * (n_tail - 1) as f64 / n_tail.pow(2) as f64;
        if mse < min_mse {
            min_mse = mse;
            opt_i_equil = i_equil;
        }
    }

    opt_i_equil
}

/// Observable tracked over a run.
pub trait Obs {
    fn update(&mut self, snapshot: &StatsSnapshot);
    fn report(&self) -> Result<(&'static str, toml::Value)>;
}

/// Lineage fractions, averaged over generations.
#[derive(Default)]
pub struct LineageFractions {
    wild_type: Accumulator,
    resistant: Accumulator,
    mutant: Accumulator,
}

#[derive(Serialize)]
struct LineageFractionsReport {
    wild_type: AccumulatorReport,
    resistant: AccumulatorReport,
    mutant: AccumulatorReport,
}

impl Obs for LineageFractions {
    fn update(&mut self, snapshot: &StatsSnapshot) {
        self.wild_type.add(snapshot.fraction(Lineage::WildType));
        self.resistant.add(snapshot.fraction(Lineage::Resistant));
        self.mutant.add(snapshot.fraction(Lineage::Mutant));
    }

    fn report(&self) -> Result<(&'static str, toml::Value)> {
        let report = LineageFractionsReport {
            wild_type: self.wild_type.report(),
            resistant: self.resistant.report(),
            mutant: self.mutant.report(),
        };
        Ok(("lineage_fractions", toml::Value::try_from(report)?))
    }
}

/// Scalar snapshot field tracked as a time series.
pub struct Series {
    name: &'static str,
    extract: fn(&StatsSnapshot) -> f64,
    time_series: TimeSeries,
}

impl Series {
    pub fn new(name: &'static str, extract: fn(&StatsSnapshot) -> f64) -> Self {
        Self {
            name,
            extract,
            time_series: TimeSeries::default(),
        }
    }
}

impl Obs for Series {
    fn update(&mut self, snapshot: &StatsSnapshot) {
        self.time_series.push((self.extract)(snapshot));
    }

    fn report(&self) -> Result<(&'static str, toml::Value)> {
        Ok((self.name, toml::Value::try_from(self.time_series.report())?))
    }
}

/// Collects observables over a run and renders their summary.
pub struct Analyzer {
    n_generations: usize,
    obs_vec: Vec<Box<dyn Obs>>,
}

impl Default for Analyzer {
    fn default() -> Self {
        Self::new()
    }
}

impl Analyzer {
    pub fn new() -> Self {
        let obs_vec: Vec<Box<dyn Obs>> = vec![
            Box::new(LineageFractions::default()),
            Box::new(Series::new("mean_fitness", |s| s.mean_fitness)),
            Box::new(Series::new("diversity", |s| s.diversity as f64)),
            Box::new(Series::new("n_total", |s| s.n_total as f64)),
        ];
        Self {
            n_generations: 0,
            obs_vec,
        }
    }

    pub fn update(&mut self, snapshot: &StatsSnapshot) {
        self.n_generations += 1;
        for obs in &mut self.obs_vec {
            obs.update(snapshot);
        }
    }

    pub fn n_generations(&self) -> usize {
        self.n_generations
    }

    /// Render the summary of every observable as a TOML table.
    pub fn report(&self) -> Result<toml::Table> {
        let mut table = toml::Table::new();
        table.insert(
            "n_generations".to_string(),
            toml::Value::Integer(self.n_generations() as i64),
        );
        for obs in &self.obs_vec {
            let (name, value) = obs.report().context("failed to report observable")?;
            table.insert(name.to_string(), value);
        }
        Ok(table)
    }
}
