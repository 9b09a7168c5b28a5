//! Population data types.

use anyhow::Result;
use rand::Rng;
use rand_distr::{Distribution, Uniform};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeSet, fmt};

/// Lowest fitness any individual can reach.
pub const FITNESS_FLOOR: f64 = 0.1;

/// Fitness cost charged per carried mutation when a founder is created.
const COST_PER_MUTATION: f64 = 0.02;

/// Clamp a fitness value to the floor.
pub fn floor_fitness(fitness: f64) -> f64 {
    fitness.max(FITNESS_FLOOR)
}

/// Coarse lineage label of an individual.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Lineage {
    WildType,
    Resistant,
    Mutant,
}

/// Marker for one acquired genetic change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum MutationTag {
    /// The distinguished drug resistance marker.
    DrugResistance,
    /// A point mutation issued by a [`TagSource`].
    Point { generation: u64, serial: u64 },
}

impl fmt::Display for MutationTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DrugResistance => write!(f, "drug_resistance"),
            Self::Point { generation, serial } => write!(f, "mut_{generation}_{serial}"),
        }
    }
}

/// Issues unique point mutation tags.
///
/// The serial counter never repeats, so tags stay unique across generations
/// and across checkpoint/resume cycles.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct TagSource {
    n_issued: u64,
}

impl TagSource {
    pub fn issue(&mut self, generation: u64) -> MutationTag {
        let serial = self.n_issued;
        self.n_issued += 1;
        MutationTag::Point { generation, serial }
    }

    pub fn n_issued(&self) -> u64 {
        self.n_issued
    }
}

/// Single pathogen individual.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Individual {
    lineage: Lineage,
    fitness: f64,
    mutations: BTreeSet<MutationTag>,
    // Carried but never advanced.
    age: u32,
}

impl Individual {
    fn founder(lineage: Lineage, base_fitness: f64, mutations: BTreeSet<MutationTag>) -> Self {
        let cost = COST_PER_MUTATION * mutations.len() as f64;
        Self {
            lineage,
            fitness: floor_fitness(base_fitness - cost),
            mutations,
            age: 0,
        }
    }

    /// Create a wild-type individual with full fitness and no mutations.
    pub fn wild_type() -> Self {
        Self::founder(Lineage::WildType, 1.0, BTreeSet::new())
    }

    /// Create a resistant founder carrying the resistance marker.
    pub fn resistant() -> Self {
        let mutations = BTreeSet::from([MutationTag::DrugResistance]);
        Self::founder(Lineage::Resistant, 0.85, mutations)
    }

    /// Create a mutant founder with random base fitness and one fresh tag.
    pub fn mutant<R: Rng + ?Sized>(tag: MutationTag, rng: &mut R) -> Result<Self> {
        let fitness_dist = Uniform::new(0.7, 1.0)?;
        let mutations = BTreeSet::from([tag]);
        Ok(Self::founder(
            Lineage::Mutant,
            fitness_dist.sample(rng),
            mutations,
        ))
    }

    pub fn lineage(&self) -> Lineage {
        self.lineage
    }

    pub fn fitness(&self) -> f64 {
        self.fitness
    }

    pub fn mutations(&self) -> &BTreeSet<MutationTag> {
        &self.mutations
    }

    pub fn age(&self) -> u32 {
        self.age
    }

    pub fn is_drug_resistant(&self) -> bool {
        self.mutations.contains(&MutationTag::DrugResistance)
    }

    /// Copy of this individual after acquiring drug resistance.
    pub fn with_resistance(&self) -> Self {
        let mut mutations = self.mutations.clone();
        mutations.insert(MutationTag::DrugResistance);
        Self {
            lineage: Lineage::Resistant,
            fitness: floor_fitness(self.fitness - 0.05),
            mutations,
            age: self.age,
        }
    }

    /// Copy of this individual after acquiring a general mutation.
    pub fn with_mutation(&self, tag: MutationTag) -> Self {
        let mut mutations = self.mutations.clone();
        mutations.insert(tag);
        Self {
            lineage: Lineage::Mutant,
            fitness: floor_fitness(self.fitness - 0.02),
            mutations,
            age: self.age,
        }
    }

    /// Copy of this individual after exchanging material with `partner`.
    ///
    /// The lineage label is left untouched, even when the resistance marker
    /// is gained or lost.
    pub fn recombined(&self, partner: &Individual, mutations: BTreeSet<MutationTag>) -> Self {
        Self {
            lineage: self.lineage,
            fitness: floor_fitness((self.fitness + partner.fitness) / 2.0 - 0.01),
            mutations,
            age: self.age,
        }
    }
}

/// Host carrying an ordered pathogen population.
///
/// Order matters: eviction removes a suffix and regulation keeps a prefix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Host {
    id: usize,
    population: Vec<Individual>,
}

impl Host {
    pub fn new(id: usize, population: Vec<Individual>) -> Self {
        Self { id, population }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn population(&self) -> &[Individual] {
        &self.population
    }

    /// Same host with its population replaced.
    pub fn with_population(&self, population: Vec<Individual>) -> Self {
        Self {
            id: self.id,
            population,
        }
    }

    pub(crate) fn population_mut(&mut self) -> &mut Vec<Individual> {
        &mut self.population
    }
}
