//! Generation pipeline stages.
//!
//! Each stage reads a frozen snapshot of every host and returns a brand-new
//! host list. A stage never observes writes made by another stage, or by
//! itself on another host, within the same pass.

use crate::config::ModelConfig;
use crate::model::{Host, Individual, TagSource};
use anyhow::{Context, Result};
use rand::prelude::*;
use rand_distr::{Bernoulli, Uniform, weighted::WeightedIndex};
use std::collections::BTreeSet;

/// Survival probability of drug resistant individuals under treatment.
const PROB_SURV_RES: f64 = 0.90;
/// Survival probability of susceptible individuals under treatment.
const PROB_SURV_SUS: f64 = 0.05;
/// Probability of keeping each tag of the recombined union.
const PROB_KEEP_TAG: f64 = 0.5;

/// Apply resistance and general mutations to every individual.
pub fn mutate<R: Rng + ?Sized>(
    hosts: &[Host],
    model: &ModelConfig,
    generation: u64,
    tags: &mut TagSource,
    rng: &mut R,
) -> Result<Vec<Host>> {
    let res_dist = Bernoulli::new(model.resistance_rate)?;
    let mut_dist = Bernoulli::new(model.mutation_rate)?;

    let mut new_hosts = Vec::with_capacity(hosts.len());
    for host in hosts {
        let mut population = Vec::with_capacity(host.population().len());
        for ind in host.population() {
            // A resistance hit skips the general mutation test.
            let ind = if res_dist.sample(rng) {
                ind.with_resistance()
            } else if mut_dist.sample(rng) {
                ind.with_mutation(tags.issue(generation))
            } else {
                ind.clone()
            };
            population.push(ind);
        }
        new_hosts.push(host.with_population(population));
    }

    Ok(new_hosts)
}

/// Replace a suffix of each host's population with a bottleneck sampled
/// from the next host in circular order.
pub fn transmit<R: Rng + ?Sized>(
    hosts: &[Host],
    model: &ModelConfig,
    rng: &mut R,
) -> Result<Vec<Host>> {
    let n_hosts = hosts.len();
    if n_hosts < 2 {
        return Ok(hosts.to_vec());
    }

    let trans_dist = Bernoulli::new(model.transmission_rate)?;
    let n_bottleneck = model.bottleneck_size;

    let mut new_hosts = Vec::with_capacity(n_hosts);
    for (i_host, host) in hosts.iter().enumerate() {
        if !trans_dist.sample(rng) {
            new_hosts.push(host.clone());
            continue;
        }

        let source = hosts[(i_host + 1) % n_hosts].population();
        if source.is_empty() {
            new_hosts.push(host.clone());
            continue;
        }

        let n_kept = host.population().len().saturating_sub(n_bottleneck);
        let mut population = Vec::with_capacity(n_kept + n_bottleneck);
        population.extend_from_slice(&host.population()[..n_kept]);
        for _ in 0..n_bottleneck {
            let ind = source
                .choose(rng)
                .context("failed to choose a transmitted individual")?;
            population.push(ind.clone());
        }

        new_hosts.push(host.with_population(population));
    }

    Ok(new_hosts)
}

/// Cull susceptible individuals in hosts where the drug acts.
pub fn select_drug<R: Rng + ?Sized>(
    hosts: &[Host],
    model: &ModelConfig,
    rng: &mut R,
) -> Result<Vec<Host>> {
    let drug_dist = Bernoulli::new(model.drug_pressure)?;
    let surv_res_dist = Bernoulli::new(PROB_SURV_RES)?;
    let surv_sus_dist = Bernoulli::new(PROB_SURV_SUS)?;

    let mut new_hosts = Vec::with_capacity(hosts.len());
    for host in hosts {
        let population = host.population();

        // The drug only acts where resistance is already present.
        let any_resistant = population.iter().any(Individual::is_drug_resistant);
        if !any_resistant || !drug_dist.sample(rng) {
            new_hosts.push(host.clone());
            continue;
        }

        let mut survivors = Vec::with_capacity(population.len());
        for ind in population {
            let surv_dist = if ind.is_drug_resistant() {
                &surv_res_dist
            } else {
                &surv_sus_dist
            };
            if surv_dist.sample(rng) {
                survivors.push(ind.clone());
            }
        }

        if survivors.is_empty() {
            // Never wipe out a host.
            new_hosts.push(host.clone());
        } else {
            new_hosts.push(host.with_population(survivors));
        }
    }

    Ok(new_hosts)
}

/// Shrink each population to a random pool, then regrow it to its former
/// size by fitness-weighted resampling.
pub fn drift<R: Rng + ?Sized>(
    hosts: &[Host],
    model: &ModelConfig,
    rng: &mut R,
) -> Result<Vec<Host>> {
    let mut new_hosts = Vec::with_capacity(hosts.len());
    for host in hosts {
        let population = host.population();
        let n_ind = population.len();
        if n_ind == 0 {
            new_hosts.push(host.clone());
            continue;
        }

        let n_pool = pool_size(n_ind, model.drift_strength);
        let mut pool = Vec::with_capacity(n_pool);
        for _ in 0..n_pool {
            let ind = population
                .choose(rng)
                .context("failed to choose a pooled individual")?;
            pool.push(ind.clone());
        }

        let population = regrow(&pool, n_ind, rng).context("failed to regrow population")?;
        new_hosts.push(host.with_population(population));
    }

    Ok(new_hosts)
}

/// Size of the intermediate drift pool.
pub fn pool_size(n_ind: usize, drift_strength: f64) -> usize {
    let n_ind = n_ind as f64;
    let n_shrunk = (n_ind * (1.0 - drift_strength * 0.1)).floor() as usize;
    let n_half = ((n_ind * 0.5).floor() as usize).max(1);
    n_shrunk.max(n_half)
}

fn regrow<R: Rng + ?Sized>(
    pool: &[Individual],
    n_ind: usize,
    rng: &mut R,
) -> Result<Vec<Individual>> {
    let weights: Vec<f64> = pool.iter().map(Individual::fitness).collect();

    let mut population = Vec::with_capacity(n_ind);
    match WeightedIndex::new(&weights) {
        Ok(fit_dist) => {
            for _ in 0..n_ind {
                population.push(pool[fit_dist.sample(rng)].clone());
            }
        }
        Err(error) => {
            // Only reachable if the fitness floor is ever broken.
            log::warn!("invalid fitness weights ({error}), resampling uniformly");
            for _ in 0..n_ind {
                let ind = pool
                    .choose(rng)
                    .context("failed to choose a regrown individual")?;
                population.push(ind.clone());
            }
        }
    }

    Ok(population)
}

/// Exchange mutation tags between random pairs within each host.
pub fn recombine<R: Rng + ?Sized>(
    hosts: &[Host],
    model: &ModelConfig,
    rng: &mut R,
) -> Result<Vec<Host>> {
    if !model.enable_recombination {
        return Ok(hosts.to_vec());
    }

    let rec_dist = Bernoulli::new(model.recombination_rate)?;
    let keep_dist = Bernoulli::new(PROB_KEEP_TAG)?;

    let mut new_hosts = Vec::with_capacity(hosts.len());
    for host in hosts {
        let population = host.population();
        if population.len() < 2 {
            new_hosts.push(host.clone());
            continue;
        }

        let mut new_population = Vec::with_capacity(population.len());
        for ind in population {
            if !rec_dist.sample(rng) {
                new_population.push(ind.clone());
                continue;
            }

            // Self-pairing is allowed.
            let partner = population
                .choose(rng)
                .context("failed to choose a recombination partner")?;

            let mut mutations = BTreeSet::new();
            for &tag in ind.mutations().union(partner.mutations()) {
                if keep_dist.sample(rng) {
                    mutations.insert(tag);
                }
            }

            new_population.push(ind.recombined(partner, mutations));
        }

        new_hosts.push(host.with_population(new_population));
    }

    Ok(new_hosts)
}

/// Move a fraction of each host's population to another random host.
///
/// Emigrants are drawn with replacement from the source's pre-stage
/// population, while the source loses the same number of individuals from
/// the end of its working population.
pub fn migrate<R: Rng + ?Sized>(
    hosts: &[Host],
    model: &ModelConfig,
    rng: &mut R,
) -> Result<Vec<Host>> {
    let n_hosts = hosts.len();
    if !model.enable_migration || n_hosts < 2 {
        return Ok(hosts.to_vec());
    }

    let target_dist = Uniform::new(0, n_hosts - 1)?;

    let mut new_hosts = hosts.to_vec();
    for (i_host, host) in hosts.iter().enumerate() {
        let population = host.population();
        let n_migrants = (population.len() as f64 * model.migration_rate).floor() as usize;
        if n_migrants == 0 {
            continue;
        }

        // Uniform over every host except the source.
        let mut i_target = target_dist.sample(rng);
        if i_target >= i_host {
            i_target += 1;
        }

        for _ in 0..n_migrants {
            let migrant = population
                .choose(rng)
                .context("failed to choose a migrant")?;
            new_hosts[i_target].population_mut().push(migrant.clone());
        }

        let source = new_hosts[i_host].population_mut();
        source.truncate(source.len().saturating_sub(n_migrants));
    }

    Ok(new_hosts)
}

/// Keep only the first `capacity` individuals of each host.
pub fn regulate(hosts: &[Host], capacity: usize) -> Vec<Host> {
    hosts
        .iter()
        .map(|host| {
            let n_kept = host.population().len().min(capacity);
            host.with_population(host.population()[..n_kept].to_vec())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FITNESS_FLOOR, Lineage, MutationTag};
    use rand_chacha::ChaCha12Rng;

    fn quiet_model() -> ModelConfig {
        ModelConfig {
            mutation_rate: 0.0,
            resistance_rate: 0.0,
            transmission_rate: 0.0,
            bottleneck_size: 0,
            drug_pressure: 0.0,
            drift_strength: 0.0,
            recombination_rate: 0.0,
            migration_rate: 0.0,
            enable_recombination: false,
            enable_migration: false,
        }
    }

    fn wild_host(id: usize, n_ind: usize) -> Host {
        Host::new(id, vec![Individual::wild_type(); n_ind])
    }

    fn resistant_host(id: usize, n_ind: usize) -> Host {
        Host::new(id, vec![Individual::wild_type().with_resistance(); n_ind])
    }

    #[test]
    fn quiet_mutation_changes_nothing() {
        let mut rng = ChaCha12Rng::seed_from_u64(1);
        let mut tags = TagSource::default();
        let hosts = vec![wild_host(0, 10), resistant_host(1, 10)];
        let new_hosts = mutate(&hosts, &quiet_model(), 0, &mut tags, &mut rng).unwrap();
        assert_eq!(new_hosts, hosts);
        assert_eq!(tags.n_issued(), 0);
    }

    #[test]
    fn resistance_excludes_general_mutation() {
        let mut rng = ChaCha12Rng::seed_from_u64(2);
        let mut tags = TagSource::default();
        let model = ModelConfig {
            mutation_rate: 1.0,
            resistance_rate: 1.0,
            ..quiet_model()
        };
        let hosts = vec![wild_host(0, 10)];
        let new_hosts = mutate(&hosts, &model, 0, &mut tags, &mut rng).unwrap();
        for ind in new_hosts[0].population() {
            assert_eq!(ind.lineage(), Lineage::Resistant);
            assert_eq!(ind.mutations().len(), 1);
            assert!((ind.fitness() - 0.95).abs() < 1e-12);
        }
        assert_eq!(tags.n_issued(), 0);
    }

    #[test]
    fn general_mutations_get_fresh_tags() {
        let mut rng = ChaCha12Rng::seed_from_u64(3);
        let mut tags = TagSource::default();
        let model = ModelConfig {
            mutation_rate: 1.0,
            ..quiet_model()
        };
        let hosts = vec![wild_host(0, 10), wild_host(1, 10)];
        let new_hosts = mutate(&hosts, &model, 4, &mut tags, &mut rng).unwrap();
        let mut seen = BTreeSet::new();
        for ind in new_hosts.iter().flat_map(|host| host.population()) {
            assert_eq!(ind.lineage(), Lineage::Mutant);
            assert!((ind.fitness() - 0.98).abs() < 1e-12);
            let tag = *ind.mutations().first().unwrap();
            assert!(matches!(tag, MutationTag::Point { generation: 4, .. }));
            assert!(seen.insert(tag));
        }
        assert_eq!(seen.len(), 20);
    }

    #[test]
    fn transmission_replaces_suffix_with_neighbour_clones() {
        let mut rng = ChaCha12Rng::seed_from_u64(4);
        let model = ModelConfig {
            transmission_rate: 1.0,
            bottleneck_size: 5,
            ..quiet_model()
        };
        let hosts = vec![resistant_host(0, 20), wild_host(1, 20)];
        let new_hosts = transmit(&hosts, &model, &mut rng).unwrap();

        let pop_0 = new_hosts[0].population();
        assert_eq!(pop_0.len(), 20);
        assert_eq!(&pop_0[..15], &hosts[0].population()[..15]);
        assert!(pop_0[15..].iter().all(|ind| ind.lineage() == Lineage::WildType));

        let pop_1 = new_hosts[1].population();
        assert_eq!(pop_1.len(), 20);
        assert!(pop_1[..15].iter().all(|ind| ind.lineage() == Lineage::WildType));
        assert!(pop_1[15..].iter().all(Individual::is_drug_resistant));
    }

    #[test]
    fn transmission_edge_cases() {
        let mut rng = ChaCha12Rng::seed_from_u64(5);
        let model = ModelConfig {
            transmission_rate: 1.0,
            bottleneck_size: 5,
            ..quiet_model()
        };

        let single = vec![wild_host(0, 3)];
        assert_eq!(transmit(&single, &model, &mut rng).unwrap(), single);

        // Small recipient loses everything, empty source transmits nothing.
        let hosts = vec![wild_host(0, 3), resistant_host(1, 2), wild_host(2, 0)];
        let new_hosts = transmit(&hosts, &model, &mut rng).unwrap();
        assert_eq!(new_hosts[0].population().len(), 5);
        assert!(new_hosts[0].population().iter().all(Individual::is_drug_resistant));
        assert_eq!(new_hosts[1], hosts[1]);
        assert_eq!(new_hosts[2].population().len(), 5);
        assert!(
            new_hosts[2]
                .population()
                .iter()
                .all(|ind| ind.lineage() == Lineage::WildType)
        );
    }

    #[test]
    fn drug_needs_resistance_to_act() {
        let mut rng = ChaCha12Rng::seed_from_u64(6);
        let model = ModelConfig {
            drug_pressure: 1.0,
            ..quiet_model()
        };
        let hosts = vec![wild_host(0, 50)];
        assert_eq!(select_drug(&hosts, &model, &mut rng).unwrap(), hosts);
    }

    #[test]
    fn drug_never_empties_a_host() {
        let mut rng = ChaCha12Rng::seed_from_u64(7);
        let model = ModelConfig {
            drug_pressure: 1.0,
            ..quiet_model()
        };
        let hosts = vec![resistant_host(0, 1)];
        for _ in 0..200 {
            let new_hosts = select_drug(&hosts, &model, &mut rng).unwrap();
            assert_eq!(new_hosts, hosts);
        }
    }

    #[test]
    fn pool_size_follows_formula() {
        assert_eq!(pool_size(10, 0.0), 10);
        assert_eq!(pool_size(10, 1.0), 9);
        assert_eq!(pool_size(1, 1.0), 1);
        assert_eq!(pool_size(2, 1.0), 1);
    }

    #[test]
    fn drift_preserves_size_and_membership() {
        let mut rng = ChaCha12Rng::seed_from_u64(8);
        let model = ModelConfig {
            drift_strength: 1.0,
            ..quiet_model()
        };
        let mut population = vec![Individual::wild_type(); 10];
        population.extend(vec![Individual::wild_type().with_resistance(); 10]);
        let hosts = vec![Host::new(0, population), wild_host(1, 0)];

        let new_hosts = drift(&hosts, &model, &mut rng).unwrap();
        assert_eq!(new_hosts[0].population().len(), 20);
        assert!(
            new_hosts[0]
                .population()
                .iter()
                .all(|ind| hosts[0].population().contains(ind))
        );
        assert!(new_hosts[1].population().is_empty());
    }

    #[test]
    fn regrowth_is_fitness_weighted() {
        let mut rng = ChaCha12Rng::seed_from_u64(13);
        let mut weak = Individual::wild_type();
        while weak.fitness() > FITNESS_FLOOR {
            weak = weak.with_resistance();
        }
        let mut pool = vec![weak; 50];
        pool.extend(vec![Individual::wild_type(); 50]);

        let n_trials = 200;
        let mut n_strong = 0;
        for _ in 0..n_trials {
            let population = regrow(&pool, 100, &mut rng).unwrap();
            n_strong += population.iter().filter(|ind| ind.fitness() == 1.0).count();
        }

        // Expected share is 1.0 / (1.0 + 0.1), a uniform draw would give 0.5.
        let frac_strong = n_strong as f64 / (100 * n_trials) as f64;
        assert!((frac_strong - 1.0 / 1.1).abs() < 0.02, "strong share {frac_strong}");
    }

    #[test]
    fn recombination_mixes_tags_without_relabeling() {
        let mut rng = ChaCha12Rng::seed_from_u64(9);
        let mut tags = TagSource::default();
        let model = ModelConfig {
            recombination_rate: 1.0,
            enable_recombination: true,
            ..quiet_model()
        };
        let population = vec![
            Individual::wild_type().with_resistance(),
            Individual::wild_type().with_mutation(tags.issue(0)),
            Individual::wild_type(),
        ];
        let hosts = vec![Host::new(0, population), wild_host(1, 1)];
        let union: BTreeSet<_> = hosts[0]
            .population()
            .iter()
            .flat_map(|ind| ind.mutations().iter().copied())
            .collect();

        let new_hosts = recombine(&hosts, &model, &mut rng).unwrap();
        for (old, new) in hosts[0].population().iter().zip(new_hosts[0].population()) {
            assert_eq!(old.lineage(), new.lineage());
            assert!(new.mutations().is_subset(&union));
            assert!(new.fitness() <= 0.99 + 1e-12);
        }
        assert_eq!(new_hosts[1], hosts[1]);
    }

    #[test]
    fn disabled_recombination_is_identity() {
        let mut rng = ChaCha12Rng::seed_from_u64(10);
        let model = ModelConfig {
            recombination_rate: 1.0,
            ..quiet_model()
        };
        let hosts = vec![resistant_host(0, 5), wild_host(1, 5)];
        assert_eq!(recombine(&hosts, &model, &mut rng).unwrap(), hosts);
    }

    #[test]
    fn migration_truncates_independently_of_emigrants() {
        let mut rng = ChaCha12Rng::seed_from_u64(11);
        let model = ModelConfig {
            migration_rate: 0.25,
            enable_migration: true,
            ..quiet_model()
        };
        let hosts = vec![resistant_host(0, 20), wild_host(1, 20)];
        let new_hosts = migrate(&hosts, &model, &mut rng).unwrap();

        // Host 0 sends 5 to host 1 and loses its last 5, then host 1 sends 5
        // back and loses its last 5, which are the immigrants it just got.
        let pop_0 = new_hosts[0].population();
        assert_eq!(pop_0.len(), 20);
        assert!(pop_0[..15].iter().all(Individual::is_drug_resistant));
        assert!(pop_0[15..].iter().all(|ind| ind.lineage() == Lineage::WildType));
        assert_eq!(new_hosts[1], hosts[1]);
    }

    #[test]
    fn migration_needs_two_hosts_and_flag() {
        let mut rng = ChaCha12Rng::seed_from_u64(12);
        let model = ModelConfig {
            migration_rate: 0.5,
            enable_migration: true,
            ..quiet_model()
        };
        let single = vec![wild_host(0, 10)];
        assert_eq!(migrate(&single, &model, &mut rng).unwrap(), single);

        let disabled = ModelConfig {
            enable_migration: false,
            ..model
        };
        let hosts = vec![resistant_host(0, 10), wild_host(1, 10)];
        assert_eq!(migrate(&hosts, &disabled, &mut rng).unwrap(), hosts);
    }

    #[test]
    fn regulation_keeps_prefix() {
        let mut population = vec![Individual::wild_type(); 3];
        population.extend(vec![Individual::wild_type().with_resistance(); 4]);
        let hosts = vec![Host::new(0, population), wild_host(1, 2)];

        let new_hosts = regulate(&hosts, 3);
        assert_eq!(new_hosts[0].population(), &hosts[0].population()[..3]);
        assert_eq!(new_hosts[1], hosts[1]);
    }
}
