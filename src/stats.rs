use crate::model::{Host, Lineage};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeSet, fmt};

/// Aggregate statistics of the whole host list.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub n_total: usize,
    pub n_wild_type: usize,
    pub n_resistant: usize,
    pub n_mutant: usize,
    /// Mean fitness, rounded to three decimals.
    pub mean_fitness: f64,
    /// Number of distinct mutation tags currently carried.
    pub diversity: usize,
}

impl StatsSnapshot {
    /// Compute the snapshot of `hosts` from scratch.
    pub fn from_hosts(hosts: &[Host]) -> Self {
        let mut snapshot = Self::default();
        let mut fitness_sum = 0.0;
        let mut tags = BTreeSet::new();

        for ind in hosts.iter().flat_map(|host| host.population()) {
            snapshot.n_total += 1;
            match ind.lineage() {
                Lineage::WildType => snapshot.n_wild_type += 1,
                Lineage::Resistant => snapshot.n_resistant += 1,
                Lineage::Mutant => snapshot.n_mutant += 1,
            }
            fitness_sum += ind.fitness();
            tags.extend(ind.mutations().iter().copied());
        }

        if snapshot.n_total > 0 {
            let mean = fitness_sum / snapshot.n_total as f64;
            snapshot.mean_fitness = (mean * 1000.0).round() / 1000.0;
        }
        snapshot.diversity = tags.len();

        snapshot
    }

    /// Fraction of the population carrying the given lineage label.
    pub fn fraction(&self, lineage: Lineage) -> f64 {
        if self.n_total == 0 {
            return 0.0;
        }
        let count = match lineage {
            Lineage::WildType => self.n_wild_type,
            Lineage::Resistant => self.n_resistant,
            Lineage::Mutant => self.n_mutant,
        };
        count as f64 / self.n_total as f64
    }
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "total {} | wild-type {} | resistant {} | mutant {} | fitness {:.3} | diversity {}",
            self.n_total,
            self.n_wild_type,
            self.n_resistant,
            self.n_mutant,
            self.mean_fitness,
            self.diversity
        )
    }
}
