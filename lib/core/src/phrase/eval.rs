//! Phrase-bundle evaluation
//!
//! A bundle is a set of phrases that should be mutually related. Every bundle
//! phrase is registered in a [`KnownPhraseSim`] under its own id. Each sample
//! draws a random phrase from a random bundle, asks for its top k + 1
//! neighbouring phrases, drops the phrase itself and counts how many of the
//! remaining neighbours belong to the same bundle.

use super::{KnownPhraseSim, PhraseId};
use crate::Result;
use ahash::AHashSet;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::Serialize;
use std::io::BufRead;
use std::sync::Arc;
use tracing::{debug, info};

/// Bundles used when no bundle file is supplied
pub const DEFAULT_BUNDLES: &[&str] = &[
    "jazz\tmusic\tblues",
    "music\tmath\tstatistics",
    "music\tbrain",
    "brain\tmind",
    "brain\tstatistics\talgorithm",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bundle {
    phrases: Vec<String>,
}

impl Bundle {
    pub fn new(phrases: Vec<String>) -> Self {
        Self { phrases }
    }

    pub fn phrases(&self) -> &[String] {
        &self.phrases
    }
}

/// Tab-separated phrases, one bundle per line; bundles with fewer than two
/// phrases are dropped
pub fn read_bundles<R: BufRead>(reader: R) -> Result<Vec<Bundle>> {
    let mut bundles = Vec::new();
    for line in reader.lines() {
        let line = line?;
        let phrases: Vec<String> = line
            .split('\t')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(str::to_string)
            .collect();
        if phrases.len() >= 2 {
            bundles.push(Bundle::new(phrases));
        }
    }
    Ok(bundles)
}

pub fn default_bundles() -> Vec<Bundle> {
    let text = DEFAULT_BUNDLES.join("\n");
    read_bundles(text.as_bytes()).unwrap_or_default()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvalOptions {
    pub samples: usize,
    pub k: usize,
    pub seed: u64,
}

impl Default for EvalOptions {
    fn default() -> Self {
        Self {
            samples: 1000,
            k: 10,
            seed: 42,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct EvalReport {
    pub samples: usize,
    pub errors: usize,
    /// Samples with at least one hit
    pub sample_hits: usize,
    pub hits: usize,
    pub recommended: usize,
    pub possible: usize,
    pub precision: f64,
    pub recall: f64,
}

impl std::fmt::Display for EvalReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "samples={} errors={} sample_hits={} hits={} precision={:.4} recall={:.4}",
            self.samples, self.errors, self.sample_hits, self.hits, self.precision, self.recall
        )
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Outcome {
    errors: usize,
    sample_hits: usize,
    hits: usize,
    recommended: usize,
    possible: usize,
}

impl std::ops::Add for Outcome {
    type Output = Outcome;

    fn add(self, other: Outcome) -> Outcome {
        Outcome {
            errors: self.errors + other.errors,
            sample_hits: self.sample_hits + other.sample_hits,
            hits: self.hits + other.hits,
            recommended: self.recommended + other.recommended,
            possible: self.possible + other.possible,
        }
    }
}

pub struct PhraseSimEvaluator {
    sim: Arc<KnownPhraseSim>,
    bundles: Vec<Bundle>,
}

impl PhraseSimEvaluator {
    pub fn new(sim: Arc<KnownPhraseSim>, bundles: Vec<Bundle>) -> Self {
        Self { sim, bundles }
    }

    pub fn bundles(&self) -> &[Bundle] {
        &self.bundles
    }

    pub fn sim(&self) -> &Arc<KnownPhraseSim> {
        &self.sim
    }

    /// Register every bundle phrase concurrently; returns the number of
    /// distinct phrases
    pub fn register(&self) -> Result<usize> {
        self.bundles
            .par_iter()
            .flat_map_iter(|b| b.phrases.iter())
            .try_for_each(|phrase| self.sim.add_phrase(phrase).map(|_| ()))?;
        let registered = self.sim.len();
        info!("Registered {} evaluation phrases", registered);
        Ok(registered)
    }

    pub fn evaluate(&self, options: EvalOptions) -> EvalReport {
        if self.bundles.is_empty() || options.samples == 0 {
            return EvalReport::default();
        }

        let mut rng = StdRng::seed_from_u64(options.seed);
        let draws: Vec<(usize, usize)> = (0..options.samples)
            .map(|_| {
                let bundle = rng.random_range(0..self.bundles.len());
                let phrase = rng.random_range(0..self.bundles[bundle].phrases.len());
                (bundle, phrase)
            })
            .collect();

        let total = draws
            .par_iter()
            .map(|&(bundle, phrase)| self.sample(&self.bundles[bundle], phrase, options.k))
            .reduce(Outcome::default, |a, b| a + b);

        let ratio = |num: usize, den: usize| if den == 0 { 0.0 } else { num as f64 / den as f64 };
        let report = EvalReport {
            samples: options.samples,
            errors: total.errors,
            sample_hits: total.sample_hits,
            hits: total.hits,
            recommended: total.recommended,
            possible: total.possible,
            precision: ratio(total.hits, total.recommended),
            recall: ratio(total.hits, total.possible),
        };
        info!("Phrase evaluation: {}", report);
        report
    }

    fn sample(&self, bundle: &Bundle, target: usize, k: usize) -> Outcome {
        let error = Outcome {
            errors: 1,
            ..Outcome::default()
        };
        let text = &bundle.phrases[target];
        let Some(target_id) = self.sim.resolve(text) else {
            debug!("Evaluation phrase '{}' was never registered", text);
            return error;
        };

        let results = match self.sim.most_similar(text, k.saturating_add(1)) {
            Ok(results) => results,
            Err(e) => {
                debug!("Evaluation query for '{}' failed: {}", text, e);
                return error;
            }
        };

        let related: AHashSet<PhraseId> = bundle
            .phrases
            .iter()
            .filter_map(|p| self.sim.resolve(p))
            .filter(|&id| id != target_id)
            .collect();

        let recommended: Vec<PhraseId> = results
            .into_iter()
            .map(|(id, _)| id)
            .filter(|&id| id != target_id)
            .take(k)
            .collect();
        let hits = recommended.iter().filter(|id| related.contains(*id)).count();

        Outcome {
            errors: 0,
            sample_hits: usize::from(hits > 0),
            hits,
            recommended: recommended.len(),
            possible: related.len(),
        }
    }
}
