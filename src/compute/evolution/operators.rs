//! Genetic operators on bit-string chromosomes.
//!
//! Provides selection probabilities, roulette selection, single-point
//! crossover, bit-flip mutation and the full population update.

use rand::prelude::*;

use crate::schema::{Chromosome, GeneticConfig};

/// Random number generator wrapper for genetic operations.
pub struct GeneticRng {
    rng: StdRng,
}

impl GeneticRng {
    /// Create from seed.
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Create with random seed.
    pub fn random() -> Self {
        Self {
            rng: StdRng::from_entropy(),
        }
    }

    /// Uniform draw in `[0, 1)`.
    pub fn unit(&mut self) -> f64 {
        self.rng.gen_range(0.0..1.0)
    }

    /// True with probability `p`. Never true for `p == 0`.
    pub fn bernoulli(&mut self, p: f64) -> bool {
        self.unit() < p
    }

    /// Crossover point in `0..=len`.
    pub fn crossover_point(&mut self, len: usize) -> usize {
        self.rng.gen_range(0..=len)
    }

    /// Uniformly random chromosome.
    pub fn random_chromosome(&mut self, len: usize) -> Chromosome {
        Chromosome::from_bits((0..len).map(|_| self.rng.r#gen::<bool>()).collect())
    }

    /// Uniformly random population.
    pub fn random_population(&mut self, size: usize, len: usize) -> Vec<Chromosome> {
        (0..size).map(|_| self.random_chromosome(len)).collect()
    }
}

/// Fitness-proportional selection probabilities after min-max normalization.
///
/// A constant fitness vector yields uniform probabilities.
///
/// # Panics
///
/// Panics on non-finite fitness values.
pub fn selection_probabilities(fitness: &[f64]) -> Vec<f64> {
    assert!(
        fitness.iter().all(|f| f.is_finite()),
        "fitness values must be finite"
    );
    if fitness.is_empty() {
        return Vec::new();
    }

    let n = fitness.len() as f64;
    let min = fitness.iter().copied().fold(f64::INFINITY, f64::min);
    let max = fitness.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if max == min {
        return vec![1.0 / n; fitness.len()];
    }

    // Halved so that finite extremes such as -1e308 and 1e308 cannot overflow the range.
    let range = max / 2.0 - min / 2.0;
    let scores: Vec<f64> = fitness
        .iter()
        .map(|f| (f / 2.0 - min / 2.0) / range)
        .collect();
    let total: f64 = scores.iter().sum();
    scores.into_iter().map(|s| s / total).collect()
}

/// Running sum of probabilities.
pub fn cumulative_probabilities(probabilities: &[f64]) -> Vec<f64> {
    probabilities
        .iter()
        .scan(0.0, |acc, p| {
            *acc += p;
            Some(*acc)
        })
        .collect()
}

/// Smallest index whose cumulative value reaches `r`.
///
/// Zero-width slots are never chosen, so a draw of exactly `0.0` cannot land
/// on a zero-probability chromosome. If rounding leaves the total below `r`,
/// the last selectable slot is returned.
///
/// # Panics
///
/// Panics on an empty cumulative array.
pub fn roulette_select(cumulative: &[f64], r: f64) -> usize {
    assert!(!cumulative.is_empty(), "cannot select from an empty population");

    let mut previous = 0.0;
    let mut last_selectable = None;
    for (i, &c) in cumulative.iter().enumerate() {
        if c > previous {
            if c >= r {
                return i;
            }
            last_selectable = Some(i);
        }
        previous = c;
    }
    last_selectable.unwrap_or(cumulative.len() - 1)
}

/// Single-point crossover: `parent1[..k] ++ parent2[k..]`.
///
/// # Panics
///
/// Panics if the parents differ in length or `k` exceeds it.
pub fn crossover(parent1: &Chromosome, parent2: &Chromosome, k: usize) -> Chromosome {
    assert_eq!(parent1.len(), parent2.len(), "parents differ in length");
    assert!(k <= parent1.len(), "crossover point beyond chromosome");

    let mut bits = Vec::with_capacity(parent1.len());
    bits.extend_from_slice(&parent1.bits()[..k]);
    bits.extend_from_slice(&parent2.bits()[k..]);
    Chromosome::from_bits(bits)
}

/// Bit-flip mutation.
///
/// When `apply` is false the chromosome is returned unchanged. Otherwise one
/// bit is flipped, or `max(1, round(rate * len))` distinct bits when a rate
/// is given.
pub fn mutate(
    chromosome: &Chromosome,
    apply: bool,
    rate: Option<f64>,
    rng: &mut GeneticRng,
) -> Chromosome {
    let mut mutated = chromosome.clone();
    let len = mutated.len();
    if !apply || len == 0 {
        return mutated;
    }

    let count = rate
        .map(|r| ((r * len as f64).round() as usize).clamp(1, len))
        .unwrap_or(1);
    for position in rand::seq::index::sample(&mut rng.rng, len, count) {
        mutated.flip(position);
    }
    mutated
}

/// Produce the next population by roulette selection, crossover and mutation.
///
/// `fitness` must already be oriented so that higher is better.
///
/// # Panics
///
/// Panics if `population` and `fitness` differ in length or are empty.
pub fn population_update(
    population: &[Chromosome],
    fitness: &[f64],
    config: &GeneticConfig,
    rng: &mut GeneticRng,
) -> Vec<Chromosome> {
    assert_eq!(population.len(), fitness.len(), "one fitness per chromosome");
    assert!(!population.is_empty(), "cannot update an empty population");

    let cumulative = cumulative_probabilities(&selection_probabilities(fitness));
    let len = population[0].len();

    (0..population.len())
        .map(|_| {
            let first = roulette_select(&cumulative, rng.unit());
            let second = roulette_select(&cumulative, rng.unit());
            let k = rng.crossover_point(len);
            let child = crossover(&population[first], &population[second], k);
            let apply = rng.bernoulli(config.mutation_probability);
            mutate(&child, apply, config.mutation_rate, rng)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn chromosome(s: &str) -> Chromosome {
        s.parse().unwrap()
    }

    #[test]
    fn test_uniform_when_constant() {
        let p = selection_probabilities(&[2.5, 2.5, 2.5, 2.5]);
        assert_eq!(p, vec![0.25; 4]);
    }

    #[test]
    fn test_probabilities_normalized() {
        let p = selection_probabilities(&[1.0, 2.0, 3.0]);
        assert_eq!(p[0], 0.0);
        assert!((p[1] - 1.0 / 3.0).abs() < 1e-12);
        assert!((p[2] - 2.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_probabilities_with_extreme_range() {
        let p = selection_probabilities(&[-1e308, 0.0, 1e308]);
        assert!(p.iter().all(|x| x.is_finite()));
        assert_eq!(p[0], 0.0);
        assert!((p[1] - 1.0 / 3.0).abs() < 1e-12);
        assert!((p[2] - 2.0 / 3.0).abs() < 1e-12);

        let cumulative = cumulative_probabilities(&p);
        assert_eq!(roulette_select(&cumulative, 0.2), 1);
    }

    #[test]
    #[should_panic(expected = "finite")]
    fn test_probabilities_reject_nan() {
        selection_probabilities(&[1.0, f64::NAN]);
    }

    #[test]
    fn test_roulette_smallest_index() {
        let cumulative = [0.2, 0.5, 1.0];
        assert_eq!(roulette_select(&cumulative, 0.1), 0);
        assert_eq!(roulette_select(&cumulative, 0.2), 0);
        assert_eq!(roulette_select(&cumulative, 0.21), 1);
        assert_eq!(roulette_select(&cumulative, 0.99), 2);
    }

    #[test]
    fn test_roulette_skips_zero_width() {
        let cumulative = [0.0, 0.0, 0.0, 1.0];
        assert_eq!(roulette_select(&cumulative, 0.0), 3);
        assert_eq!(roulette_select(&cumulative, 0.5), 3);
    }

    #[test]
    fn test_roulette_rounding_fallback() {
        let cumulative = [0.5, 0.999_999_9, 0.999_999_9];
        assert_eq!(roulette_select(&cumulative, 0.999_999_95), 1);
    }

    #[test]
    fn test_crossover_splices() {
        let child = crossover(&chromosome("1111"), &chromosome("0000"), 1);
        assert_eq!(child, chromosome("1000"));
    }

    #[test]
    fn test_mutation_rate_flips_distinct_bits() {
        let mut rng = GeneticRng::new(7);
        let original = Chromosome::zeros(20);
        let mutated = mutate(&original, true, Some(0.25), &mut rng);
        assert_eq!(original.hamming_distance(&mutated), 5);

        let single = mutate(&original, true, None, &mut rng);
        assert_eq!(original.hamming_distance(&single), 1);
    }

    #[test]
    fn test_degenerate_convergence() {
        let population = vec![
            chromosome("11111"),
            chromosome("00000"),
            chromosome("11100"),
            chromosome("00011"),
        ];
        let fitness = [0.0, 0.0, 0.0, 1.0];
        let config = GeneticConfig {
            mutation_probability: 0.0,
            ..Default::default()
        };

        for seed in 0..20 {
            let mut rng = GeneticRng::new(seed);
            let next = population_update(&population, &fitness, &config, &mut rng);
            assert_eq!(next.len(), 4);
            assert!(next.iter().all(|c| *c == population[3]));
        }
    }

    #[test]
    fn test_population_update_preserves_shape() {
        let mut rng = GeneticRng::new(42);
        let population = rng.random_population(10, 16);
        let fitness: Vec<f64> = (0..10).map(|i| i as f64).collect();
        let config = GeneticConfig {
            mutation_probability: 1.0,
            mutation_rate: Some(0.1),
            ..Default::default()
        };

        let next = population_update(&population, &fitness, &config, &mut rng);
        assert_eq!(next.len(), 10);
        assert!(next.iter().all(|c| c.len() == 16));
    }

    fn bits(len: usize) -> impl Strategy<Value = Chromosome> {
        proptest::collection::vec(any::<bool>(), len).prop_map(Chromosome::from_bits)
    }

    proptest! {
        #[test]
        fn prop_probabilities_sum_to_one(
            fitness in proptest::collection::vec(-1e6f64..1e6, 1..40),
        ) {
            let p = selection_probabilities(&fitness);
            let total: f64 = p.iter().sum();
            prop_assert!((total - 1.0).abs() < 1e-9);
            prop_assert!(p.iter().all(|&x| x >= 0.0));

            for i in 0..fitness.len() {
                for j in 0..fitness.len() {
                    if fitness[i] <= fitness[j] {
                        prop_assert!(p[i] <= p[j]);
                    }
                }
            }
        }

        #[test]
        fn prop_constant_fitness_is_uniform(value in -100.0f64..100.0, n in 1usize..30) {
            let p = selection_probabilities(&vec![value; n]);
            prop_assert!(p.iter().all(|&x| x == 1.0 / n as f64));
        }

        #[test]
        fn prop_crossover_identities(
            (p1, p2) in (1usize..64).prop_flat_map(|len| (bits(len), bits(len))),
        ) {
            prop_assert_eq!(crossover(&p1, &p2, p1.len()), p1.clone());
            prop_assert_eq!(crossover(&p1, &p2, 0), p2.clone());
        }

        #[test]
        fn prop_mutation_shape(
            gene in (0usize..64).prop_flat_map(bits),
            rate in proptest::option::of(0.01f64..=1.0),
            seed in any::<u64>(),
        ) {
            let mut rng = GeneticRng::new(seed);
            prop_assert_eq!(mutate(&gene, false, rate, &mut rng), gene.clone());

            let mutated = mutate(&gene, true, rate, &mut rng);
            prop_assert_eq!(mutated.len(), gene.len());
            if !gene.is_empty() {
                prop_assert!(gene.hamming_distance(&mutated) >= 1);
            }
        }
    }
}
