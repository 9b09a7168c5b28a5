use crate::analysis::Analyzer;
use crate::config::Config;
use crate::engine::Engine;
use anyhow::{Context, Result, bail};
use std::{
    fs,
    path::{Path, PathBuf},
};

/// Simulation directory holding `config.toml` and the engine checkpoint.
pub struct Manager {
    sim_dir: PathBuf,
    cfg: Config,
}

impl Manager {
    pub fn new<P: AsRef<Path>>(sim_dir: P) -> Result<Self> {
        let sim_dir = sim_dir.as_ref().to_path_buf();

        let cfg =
            Config::from_file(sim_dir.join("config.toml")).context("failed to construct cfg")?;
        log::info!("{cfg:#?}");

        Ok(Self { sim_dir, cfg })
    }

    /// Start a fresh simulation from the initial condition.
    pub fn run(&self) -> Result<()> {
        let engine =
            Engine::new(self.cfg.clone()).context("failed to generate initial condition")?;
        self.simulate(engine)
    }

    /// Continue the simulation stored in the checkpoint.
    pub fn resume(&self) -> Result<()> {
        let checkpoint_file = self.checkpoint_file();
        let engine = Engine::load_checkpoint(&checkpoint_file)
            .with_context(|| format!("failed to load {checkpoint_file:?}"))?;
        if engine.cfg() != &self.cfg {
            bail!("checkpoint config differs from the current config");
        }
        log::info!("loaded {checkpoint_file:?} at generation {}", engine.generation());

        self.simulate(engine)
    }

    /// Remove the checkpoint, if any.
    pub fn clean(&self) -> Result<()> {
        let checkpoint_file = self.checkpoint_file();
        if checkpoint_file.exists() {
            fs::remove_file(&checkpoint_file)
                .with_context(|| format!("failed to remove {checkpoint_file:?}"))?;
            log::info!("removed {checkpoint_file:?}");
        }
        Ok(())
    }

    fn simulate(&self, mut engine: Engine) -> Result<()> {
        let mut analyzer = Analyzer::new();
        engine
            .run_simulation(&mut analyzer)
            .context("failed to run simulation")?;
        log::info!(
            "analyzed {} generations, engine at generation {}",
            analyzer.n_generations(),
            engine.generation()
        );

        let report = analyzer.report().context("failed to build report")?;
        let report = toml::to_string(&report).context("failed to serialize report")?;
        println!("{report}");

        engine
            .save_checkpoint(self.checkpoint_file())
            .context("failed to save checkpoint")?;

        Ok(())
    }

    fn checkpoint_file(&self) -> PathBuf {
        self.sim_dir.join("checkpoint.msgpack")
    }
}
