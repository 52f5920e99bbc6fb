//! Arrival Generator Registry (C2, spec §4.2). Produces a lazy sequence of
//! release times per task. Built-in kinds are a closed tagged union, per the
//! "dynamic plugin dispatch -> tagged variants" redesign flag (spec §9); the
//! one deliberate exception is `ArrivalProcess::Custom`, the only category
//! spec §9 calls out as genuinely needing third-party extension.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::rng::SimRng;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum ArrivalProcess {
    Fixed {
        interval: f64,
    },
    Uniform {
        min_interval: f64,
        max_interval: f64,
    },
    Poisson {
        rate: f64,
    },
    OneShot,
    Custom {
        generator: String,
        params: serde_json::Value,
    },
}

/// An arrival process plus its release cap (spec §4.2: "`max_releases` caps
/// the sequence length").
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ArrivalSpec {
    pub process: ArrivalProcess,
    pub max_releases: Option<u64>,
}

/// Legacy configuration fields (spec §4.2), mapped to `fixed` or `uniform`
/// equivalents when no explicit `arrival_process` is given.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct LegacyArrivalFields {
    pub arrival: Option<f64>,
    pub min_inter_arrival: Option<f64>,
    pub max_inter_arrival: Option<f64>,
    pub arrival_model: Option<String>,
}

/// Normalizes legacy fields into an `ArrivalSpec`, per spec §4.2. Returns
/// `None` if no legacy fields are populated (a `one_shot`-by-default task,
/// or a task with an explicit `arrival` already set, is the caller's
/// concern — this function only covers the legacy mapping).
pub fn normalize_legacy(legacy: &LegacyArrivalFields) -> Option<ArrivalSpec> {
    match (legacy.min_inter_arrival, legacy.max_inter_arrival) {
        (Some(min), Some(max)) if (min - max).abs() > f64::EPSILON => Some(ArrivalSpec {
            process: ArrivalProcess::Uniform {
                min_interval: min,
                max_interval: max,
            },
            max_releases: None,
        }),
        // Open question (DESIGN.md #1): min == max behaves like `fixed`
        // numerically but still draws one PRNG sample per release, so it
        // stays on the `Uniform` path rather than being rewritten to `Fixed`.
        (Some(min), Some(max)) => Some(ArrivalSpec {
            process: ArrivalProcess::Uniform {
                min_interval: min,
                max_interval: max,
            },
            max_releases: None,
        }),
        _ => legacy.arrival.map(|interval| ArrivalSpec {
            process: ArrivalProcess::Fixed { interval },
            max_releases: None,
        }),
    }
}

/// A registered `custom` generator: a pure function of its params and an
/// injected PRNG, returning the next inter-arrival delay.
pub type CustomGeneratorFn = Arc<dyn Fn(&serde_json::Value, &mut SimRng) -> f64 + Send + Sync>;

#[derive(Clone, Default)]
pub struct GeneratorRegistry {
    custom: HashMap<String, CustomGeneratorFn>,
}

impl fmt::Debug for GeneratorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GeneratorRegistry")
            .field("custom_ids", &self.custom.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl GeneratorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, id: impl Into<String>, f: CustomGeneratorFn) {
        self.custom.insert(id.into(), f);
    }

    pub fn contains(&self, id: &str) -> bool {
        self.custom.contains_key(id)
    }

    fn get(&self, id: &str) -> Option<&CustomGeneratorFn> {
        self.custom.get(id)
    }
}

/// Per-task generator state: owns its own `SimRng` sub-stream and the
/// count of releases produced so far.
pub struct ArrivalGenerator {
    spec: ArrivalSpec,
    rng: SimRng,
    phase: f64,
    released: u64,
    last_release: Option<f64>,
}

impl ArrivalGenerator {
    pub fn new(spec: ArrivalSpec, phase: f64, run_seed: i64, task_key: &str) -> Self {
        Self {
            spec,
            rng: SimRng::derive(run_seed, task_key),
            phase,
            released: 0,
            last_release: None,
        }
    }

    /// Number of releases this generator has produced so far. Used as part
    /// of a stable per-job consumer key for deterministic job id derivation
    /// (`engine::release_job`): the same `(task, released_count)` pair
    /// always names the same job release across two runs of the same seed.
    pub fn released_count(&self) -> u64 {
        self.released
    }

    /// Produces the next release time, or `None` if the sequence has ended
    /// (`one_shot` after its single release, or `max_releases` reached).
    pub fn next(&mut self, registry: &GeneratorRegistry) -> Option<f64> {
        if let Some(max) = self.spec.max_releases {
            if self.released >= max {
                return None;
            }
        }

        let t = match &self.spec.process {
            ArrivalProcess::OneShot => {
                if self.released > 0 {
                    return None;
                }
                self.phase
            }
            ArrivalProcess::Fixed { interval } => {
                self.phase + self.released as f64 * interval
            }
            ArrivalProcess::Uniform {
                min_interval,
                max_interval,
            } => {
                let prev = self.last_release.unwrap_or(self.phase);
                let delta = self.rng.uniform(*min_interval, *max_interval);
                if self.released == 0 {
                    self.phase
                } else {
                    prev + delta
                }
            }
            ArrivalProcess::Poisson { rate } => {
                let prev = self.last_release.unwrap_or(self.phase);
                if self.released == 0 {
                    self.phase
                } else {
                    prev + self.rng.exponential(*rate)
                }
            }
            ArrivalProcess::Custom { generator, params } => {
                let f = registry.get(generator)?;
                let prev = self.last_release.unwrap_or(self.phase);
                if self.released == 0 {
                    self.phase
                } else {
                    prev + f(params, &mut self.rng)
                }
            }
        };

        self.released += 1;
        self.last_release = Some(t);
        Some(t)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_is_exactly_periodic() {
        let spec = ArrivalSpec {
            process: ArrivalProcess::Fixed { interval: 10.0 },
            max_releases: Some(3),
        };
        let registry = GeneratorRegistry::new();
        let mut gen = ArrivalGenerator::new(spec, 5.0, 1, "t0");
        let releases: Vec<f64> = std::iter::from_fn(|| gen.next(&registry)).collect();
        assert_eq!(releases, vec![5.0, 15.0, 25.0]);
    }

    #[test]
    fn one_shot_releases_once() {
        let spec = ArrivalSpec {
            process: ArrivalProcess::OneShot,
            max_releases: None,
        };
        let registry = GeneratorRegistry::new();
        let mut gen = ArrivalGenerator::new(spec, 0.0, 1, "t0");
        assert_eq!(gen.next(&registry), Some(0.0));
        assert_eq!(gen.next(&registry), None);
    }

    #[test]
    fn uniform_respects_bounds() {
        let spec = ArrivalSpec {
            process: ArrivalProcess::Uniform {
                min_interval: 2.0,
                max_interval: 4.0,
            },
            max_releases: Some(20),
        };
        let registry = GeneratorRegistry::new();
        let mut gen = ArrivalGenerator::new(spec, 0.0, 7, "t0");
        let mut prev = 0.0;
        while let Some(t) = gen.next(&registry) {
            if prev > 0.0 {
                assert!((t - prev) >= 2.0 - 1e-9 && (t - prev) <= 4.0 + 1e-9);
            }
            prev = t;
        }
    }
}
