//! Deadline/energy admission heuristics. Given a module and the batch it is
//! about to run against, pick an effort level (or conclude that nothing can
//! be afforded right now) and report whether that level's cost is already
//! cached.

use crate::cost_cache::CostCache;
use crate::model::{BatchShape, EffortLevel, Module};

pub const BEST_EFFORT_MAX_LATENCY_MEDIUM_EFFORT_US: f64 = 3_000_000.0;
pub const BEST_EFFORT_MAX_LATENCY_LOW_EFFORT_US: f64 = 1_000_000.0;

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum HeuristicResult {
    FoundCached,
    FoundNotCached,
    NotFound,
}

#[derive(Clone, Copy, Debug)]
pub struct Judged {
    pub result: HeuristicResult,
    pub effort: EffortLevel,
    pub fingerprint: u32,
}

/// The deadline/energy budget a single heuristic call is evaluated against.
#[derive(Clone, Copy, Debug)]
pub struct Budget {
    pub latency_requirement_us: f64,
    pub energy_requirement_uwh: f64,
}

impl Budget {
    pub fn from_batch(priority_s: i64, now_s: i64, modules_left: usize, current_energy_wh: f32, safety_margin_wh: f32) -> Self {
        let modules_left = modules_left.max(1) as f64;
        let latency_requirement_us = ((priority_s - now_s) as f64 * 1_000_000.0) / modules_left;
        let energy_requirement_uwh = (current_energy_wh - safety_margin_wh) as f64 * 1_000_000.0;
        Self {
            latency_requirement_us,
            energy_requirement_uwh,
        }
    }
}

/// Resolve a single effort level: compute its fingerprint, look it up in the
/// cache, and accept it if it fits the budget. `is_lowest_effort` means this
/// is the cheapest level the module offers, in which case latency is not a
/// gating factor (only energy is checked).
fn judge(
    cache: &mut dyn CostCache,
    shape: BatchShape,
    impl_hash: u32,
    static_latency_us: u32,
    static_energy_uwh: f32,
    budget: Budget,
    is_lowest_effort: bool,
    effort: EffortLevel,
) -> Judged {
    let fingerprint = crate::hash::batch_fingerprint(shape, impl_hash);
    let latency_requirement_us = if is_lowest_effort {
        f64::INFINITY
    } else {
        budget.latency_requirement_us
    };

    if let Some(entry) = cache.lookup(fingerprint) {
        let energy_scaled = entry.energy_uwh as f64 * crate::battery::STEPS_PER_UPDATE as f64;
        if entry.latency_us as f64 <= latency_requirement_us && energy_scaled <= budget.energy_requirement_uwh {
            return Judged {
                result: HeuristicResult::FoundCached,
                effort,
                fingerprint,
            };
        }
        return Judged {
            result: HeuristicResult::NotFound,
            effort,
            fingerprint,
        };
    }

    let energy_scaled = static_energy_uwh as f64 * crate::battery::STEPS_PER_UPDATE as f64;
    if static_latency_us as f64 <= latency_requirement_us && energy_scaled <= budget.energy_requirement_uwh {
        Judged {
            result: HeuristicResult::FoundNotCached,
            effort,
            fingerprint,
        }
    } else {
        Judged {
            result: HeuristicResult::NotFound,
            effort,
            fingerprint,
        }
    }
}

/// Energy-only admission for a module that only offers a `Default`
/// implementation: no latency gate at all.
pub fn judge_default(cache: &mut dyn CostCache, module: &Module, shape: BatchShape, budget: Budget) -> Option<Judged> {
    let implementation = module.default.as_ref()?;
    let fingerprint = crate::hash::batch_fingerprint(shape, implementation.hash);

    if let Some(entry) = cache.lookup(fingerprint) {
        let energy_scaled = entry.energy_uwh as f64 * crate::battery::STEPS_PER_UPDATE as f64;
        if energy_scaled <= budget.energy_requirement_uwh {
            return Some(Judged {
                result: HeuristicResult::FoundCached,
                effort: EffortLevel::Default,
                fingerprint,
            });
        }
        return Some(Judged {
            result: HeuristicResult::NotFound,
            effort: EffortLevel::Default,
            fingerprint,
        });
    }

    let energy_scaled = implementation.energy_cost() as f64 * crate::battery::STEPS_PER_UPDATE as f64;
    if energy_scaled <= budget.energy_requirement_uwh {
        Some(Judged {
            result: HeuristicResult::FoundNotCached,
            effort: EffortLevel::Default,
            fingerprint,
        })
    } else {
        Some(Judged {
            result: HeuristicResult::NotFound,
            effort: EffortLevel::Default,
            fingerprint,
        })
    }
}

/// Descend High -> Medium -> Low, trying each until one is admitted.
/// Medium is only attempted if High exists and the latency budget is still
/// under the medium-effort ceiling; Low likewise behind the low-effort
/// ceiling, gated on either High or Medium existing.
pub fn best_effort(cache: &mut dyn CostCache, module: &Module, shape: BatchShape, budget: Budget) -> Option<Judged> {
    if module.is_default_only() {
        return judge_default(cache, module, shape, budget);
    }

    let lowest = module.lowest_available_effort();

    if let Some(high) = module.high.as_ref() {
        let is_lowest = lowest == Some(EffortLevel::High);
        let judged = judge(
            cache,
            shape,
            high.hash,
            high.latency_cost(),
            high.energy_cost(),
            budget,
            is_lowest,
            EffortLevel::High,
        );
        if judged.result != HeuristicResult::NotFound {
            return Some(judged);
        }
    }

    if module.high.is_some() && budget.latency_requirement_us < BEST_EFFORT_MAX_LATENCY_MEDIUM_EFFORT_US {
        if let Some(medium) = module.medium.as_ref() {
            let is_lowest = lowest == Some(EffortLevel::Medium);
            let judged = judge(
                cache,
                shape,
                medium.hash,
                medium.latency_cost(),
                medium.energy_cost(),
                budget,
                is_lowest,
                EffortLevel::Medium,
            );
            if judged.result != HeuristicResult::NotFound {
                return Some(judged);
            }
        }
    }

    if (module.high.is_some() || module.medium.is_some())
        && budget.latency_requirement_us < BEST_EFFORT_MAX_LATENCY_LOW_EFFORT_US
    {
        if let Some(low) = module.low.as_ref() {
            let is_lowest = lowest == Some(EffortLevel::Low);
            let judged = judge(
                cache,
                shape,
                low.hash,
                low.latency_cost(),
                low.energy_cost(),
                budget,
                is_lowest,
                EffortLevel::Low,
            );
            if judged.result != HeuristicResult::NotFound {
                return Some(judged);
            }
        }
    }

    None
}

/// Skip straight to the cheapest level a module offers.
pub fn lowest_effort(cache: &mut dyn CostCache, module: &Module, shape: BatchShape, budget: Budget) -> Option<Judged> {
    if module.is_default_only() {
        return judge_default(cache, module, shape, budget);
    }

    let effort = module.lowest_available_effort()?;
    let implementation = module.implementation(effort)?;
    let judged = judge(
        cache,
        shape,
        implementation.hash,
        implementation.latency_cost(),
        implementation.energy_cost(),
        budget,
        true,
        effort,
    );
    if judged.result != HeuristicResult::NotFound {
        Some(judged)
    } else {
        None
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HeuristicKind {
    BestEffort,
    LowestEffort,
}

impl HeuristicKind {
    /// `D = ingest.size + partial.size`; below the threshold the scheduler
    /// runs best-effort, at or above it, lowest-effort.
    pub fn from_queue_depth(total_depth: usize) -> Self {
        if total_depth < crate::pqueue::LOW_QUEUE_DEPTH_THRESHOLD {
            HeuristicKind::BestEffort
        } else {
            HeuristicKind::LowestEffort
        }
    }

    pub fn select(self, cache: &mut dyn CostCache, module: &Module, shape: BatchShape, budget: Budget) -> Option<Judged> {
        match self {
            HeuristicKind::BestEffort => best_effort(cache, module, shape, budget),
            HeuristicKind::LowestEffort => lowest_effort(cache, module, shape, budget),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cost_cache::RamCostCache;
    use crate::model::ModuleParameterList;

    fn implementation(hash: u32, latency_us: u32, energy_uwh: f32) -> ModuleParameterList {
        ModuleParameterList {
            entry_point: "x".into(),
            hash,
            latency_cost_us: latency_us,
            energy_cost_uwh: energy_uwh,
            parameters: vec![],
        }
    }

    fn shape() -> BatchShape {
        BatchShape {
            num_images: 4,
            batch_size: 1024,
            pipeline_id: 0,
        }
    }

    #[test]
    fn default_only_module_is_energy_gated_only() {
        let module = Module {
            name: "m".into(),
            default: Some(implementation(1, 100_000_000, 1.0)),
            low: None,
            medium: None,
            high: None,
        };
        let mut cache = RamCostCache::new();
        let generous_budget = Budget {
            latency_requirement_us: 1.0, // would fail any latency gate
            energy_requirement_uwh: 1_000_000.0,
        };
        let judged = judge_default(&mut cache, &module, shape(), generous_budget).unwrap();
        assert_eq!(judged.result, HeuristicResult::FoundNotCached);
    }

    #[test]
    fn best_effort_descends_to_medium_when_high_too_slow() {
        let module = Module {
            name: "m".into(),
            default: None,
            low: Some(implementation(1, 10, 0.1)),
            medium: Some(implementation(2, 10, 0.1)),
            high: Some(implementation(3, 50_000_000, 0.1)),
        };
        let mut cache = RamCostCache::new();
        let budget = Budget {
            latency_requirement_us: 2_000_000.0,
            energy_requirement_uwh: 1_000.0,
        };
        let judged = best_effort(&mut cache, &module, shape(), budget).unwrap();
        assert_eq!(judged.effort, EffortLevel::Medium);
    }

    #[test]
    fn lowest_effort_skips_straight_to_cheapest() {
        let module = Module {
            name: "m".into(),
            default: None,
            low: Some(implementation(1, 10, 0.1)),
            medium: Some(implementation(2, 10, 0.1)),
            high: Some(implementation(3, 10, 0.1)),
        };
        let mut cache = RamCostCache::new();
        let budget = Budget {
            latency_requirement_us: 5.0,
            energy_requirement_uwh: 1_000.0,
        };
        let judged = lowest_effort(&mut cache, &module, shape(), budget).unwrap();
        assert_eq!(judged.effort, EffortLevel::Low);
    }

    #[test]
    fn queue_depth_selects_heuristic_kind() {
        assert_eq!(HeuristicKind::from_queue_depth(0), HeuristicKind::BestEffort);
        assert_eq!(HeuristicKind::from_queue_depth(29), HeuristicKind::BestEffort);
        assert_eq!(HeuristicKind::from_queue_depth(30), HeuristicKind::LowestEffort);
    }
}
