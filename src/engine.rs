use crate::analysis::Analyzer;
use crate::config::Config;
use crate::model::{Host, Individual, TagSource};
use crate::stages;
use crate::stats::StatsSnapshot;
use anyhow::{Context, Result};
use rand::prelude::*;
use rand_chacha::ChaCha12Rng;
use rmp_serde::{decode, encode};
use serde::{Deserialize, Serialize};
use std::{
    fs::{self, File},
    io::{BufWriter, Write},
    path::Path,
};

/// Simulation engine.
///
/// Owns the configuration, the host list, the mutation tag counter and the
/// random number generator. Callers only get shared views of the hosts and
/// copies of the statistics, so a generation is never observed half done.
#[derive(Serialize, Deserialize)]
pub struct Engine {
    cfg: Config,
    generation: u64,
    hosts: Vec<Host>,
    stats: StatsSnapshot,
    tags: TagSource,
    rng: ChaCha12Rng,
}

impl Engine {
    /// Create a new `Engine` in the initial condition described by `cfg`.
    ///
    /// # Errors
    /// Returns an error if the configuration is invalid or the generator
    /// cannot be seeded.
    pub fn new(cfg: Config) -> Result<Self> {
        cfg.validate().context("failed to validate config")?;

        let mut rng = match cfg.init.seed {
            Some(seed) => ChaCha12Rng::seed_from_u64(seed),
            None => ChaCha12Rng::try_from_os_rng()?,
        };
        let mut tags = TagSource::default();
        let hosts = initial_hosts(&cfg, &mut tags, &mut rng)?;
        let stats = StatsSnapshot::from_hosts(&hosts);

        Ok(Self {
            cfg,
            generation: 0,
            hosts,
            stats,
            tags,
            rng,
        })
    }

    /// Discard the current state and start over from `cfg`.
    ///
    /// On error the current state is left untouched.
    pub fn initialize(&mut self, cfg: Config) -> Result<()> {
        *self = Self::new(cfg)?;
        Ok(())
    }

    /// Advance the simulation by one generation.
    pub fn step(&mut self) -> Result<StatsSnapshot> {
        let model = &self.cfg.model;
        let rng = &mut self.rng;

        // Stages work on locals; state is only committed at the end.
        let mut tags = self.tags.clone();
        let hosts = stages::mutate(&self.hosts, model, self.generation, &mut tags, rng)
            .context("failed to mutate")?;
        log::debug!("mutate: {} tags issued so far", tags.n_issued());
        let hosts = stages::transmit(&hosts, model, rng).context("failed to transmit")?;
        log::debug!("transmit: host sizes {:?}", host_sizes(&hosts));
        let hosts = stages::select_drug(&hosts, model, rng).context("failed to select")?;
        log::debug!("select_drug: host sizes {:?}", host_sizes(&hosts));
        let hosts = stages::drift(&hosts, model, rng).context("failed to drift")?;
        log::debug!("drift: host sizes {:?}", host_sizes(&hosts));
        let hosts = stages::recombine(&hosts, model, rng).context("failed to recombine")?;
        log::debug!("recombine: host sizes {:?}", host_sizes(&hosts));
        let hosts = stages::migrate(&hosts, model, rng).context("failed to migrate")?;
        log::debug!("migrate: host sizes {:?}", host_sizes(&hosts));
        let hosts = stages::regulate(&hosts, self.cfg.init.n_per_host);
        log::debug!("regulate: host sizes {:?}", host_sizes(&hosts));

        self.stats = StatsSnapshot::from_hosts(&hosts);
        self.hosts = hosts;
        self.tags = tags;
        self.generation += 1;
        log::debug!("generation {}: {}", self.generation, self.stats);

        Ok(self.stats.clone())
    }

    /// Run the configured number of generations, feeding every snapshot to
    /// `analyzer`.
    pub fn run_simulation(&mut self, analyzer: &mut Analyzer) -> Result<()> {
        let n_generations = self.cfg.output.n_generations;
        let gens_per_report = self.cfg.output.gens_per_report;

        for i_gen in 0..n_generations {
            let stats = self.step().context("failed to perform step")?;
            analyzer.update(&stats);

            if (i_gen + 1) % gens_per_report == 0 || i_gen + 1 == n_generations {
                let progress = 100.0 * (i_gen + 1) as f64 / n_generations as f64;
                log::info!(
                    "completed {progress:06.2}% (generation {}): {stats}",
                    self.generation
                );
            }
        }

        Ok(())
    }

    /// Save a checkpoint of the entire engine state.
    ///
    /// Can be used to resume the simulation later. The file is flushed and
    /// synced before returning, so a success means the checkpoint is whole.
    pub fn save_checkpoint<P: AsRef<Path>>(&self, file: P) -> Result<()> {
        let path = file.as_ref();
        let file = File::create(path).with_context(|| format!("failed to create {path:?}"))?;
        let mut writer = BufWriter::new(file);
        encode::write(&mut writer, self).context("failed to serialize engine")?;
        writer.flush().context("failed to flush writer stream")?;
        writer
            .get_ref()
            .sync_all()
            .with_context(|| format!("failed to sync {path:?}"))?;
        log::debug!("saved {path:?} at generation {}", self.generation);
        Ok(())
    }

    /// Load a previously saved engine checkpoint.
    pub fn load_checkpoint<P: AsRef<Path>>(file: P) -> Result<Self> {
        let path = file.as_ref();
        let bytes = fs::read(path).with_context(|| format!("failed to read {path:?}"))?;
        let engine: Self = decode::from_slice(&bytes).context("failed to deserialize engine")?;
        engine
            .cfg
            .validate()
            .context("checkpoint holds an invalid config")?;
        Ok(engine)
    }

    pub fn cfg(&self) -> &Config {
        &self.cfg
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn hosts(&self) -> &[Host] {
        &self.hosts
    }

    pub fn stats(&self) -> &StatsSnapshot {
        &self.stats
    }
}

fn host_sizes(hosts: &[Host]) -> Vec<usize> {
    hosts.iter().map(|host| host.population().len()).collect()
}

/// Build the initial hosts; founders go at the front of the first host.
fn initial_hosts<R: Rng + ?Sized>(
    cfg: &Config,
    tags: &mut TagSource,
    rng: &mut R,
) -> Result<Vec<Host>> {
    let init = &cfg.init;

    let mut hosts = Vec::with_capacity(init.n_hosts);
    for id in 0..init.n_hosts {
        let mut population = Vec::with_capacity(init.n_per_host);
        if id == 0 {
            for _ in 0..init.n_resistant {
                population.push(Individual::resistant());
            }
            for _ in 0..init.n_mutant {
                population.push(Individual::mutant(tags.issue(0), rng)?);
            }
        }
        population.resize_with(init.n_per_host, Individual::wild_type);
        hosts.push(Host::new(id, population));
    }

    Ok(hosts)
}
