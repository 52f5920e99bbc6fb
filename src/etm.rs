//! Execution-Time Model (C3, spec §4.3). Stateless strategy: `duration`
//! maps `(segment, core)` to an effective simulated duration. Consulted
//! exactly once, when a segment begins running on a core (spec §4.3,
//! §4.6 "Heterogeneous execution") — the engine, not this module, owns
//! decrementing the remaining nominal work thereafter.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::model::{CoreId, Platform, SegmentId};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Etm {
    /// `remaining_nominal_wcet / effective_core_speed(core)`.
    Constant,
    /// `remaining_nominal_wcet * scale / effective_core_speed(core)`, where
    /// `scale` is looked up `(segment, core)` -> per-segment default ->
    /// global default.
    TableBased {
        scale_by_segment_core: HashMap<(SegmentId, CoreId), f64>,
        segment_default: HashMap<SegmentId, f64>,
        global_default: f64,
    },
}

impl Etm {
    /// Simulated duration to execute `remaining_nominal` units of nominal
    /// work (wcet-scaled) of `segment` on `core`. Returns `None` if the
    /// platform doesn't know `core` (a build-time configuration error, not
    /// a runtime one — callers are expected to have validated this).
    pub fn duration(
        &self,
        platform: &Platform,
        segment: SegmentId,
        core: CoreId,
        remaining_nominal: f64,
    ) -> Option<f64> {
        let speed = platform.effective_speed(core)?;
        let scale = match self {
            Etm::Constant => 1.0,
            Etm::TableBased {
                scale_by_segment_core,
                segment_default,
                global_default,
            } => scale_by_segment_core
                .get(&(segment, core))
                .copied()
                .or_else(|| segment_default.get(&segment).copied())
                .unwrap_or(*global_default),
        };
        Some(remaining_nominal * scale / speed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Core, ProcTypeId, ProcessorType};

    fn platform() -> Platform {
        Platform {
            processor_types: vec![ProcessorType {
                id: ProcTypeId(0),
                name: "p0".into(),
                core_count: 2,
                family_speed: 1.0,
            }],
            cores: vec![
                Core {
                    id: CoreId(0),
                    type_id: ProcTypeId(0),
                    speed_factor: 1.0,
                },
                Core {
                    id: CoreId(1),
                    type_id: ProcTypeId(0),
                    speed_factor: 5.0,
                },
            ],
        }
    }

    #[test]
    fn constant_scales_by_core_speed() {
        let p = platform();
        let etm = Etm::Constant;
        assert_eq!(etm.duration(&p, SegmentId(0), CoreId(0), 3.0), Some(3.0));
        assert_eq!(etm.duration(&p, SegmentId(0), CoreId(1), 3.0), Some(0.6));
    }

    #[test]
    fn table_based_falls_back_through_levels() {
        let p = platform();
        let mut scale_by_segment_core = HashMap::new();
        scale_by_segment_core.insert((SegmentId(1), CoreId(0)), 2.0);
        let mut segment_default = HashMap::new();
        segment_default.insert(SegmentId(1), 1.5);
        let etm = Etm::TableBased {
            scale_by_segment_core,
            segment_default,
            global_default: 1.0,
        };
        // Exact (segment, core) hit.
        assert_eq!(etm.duration(&p, SegmentId(1), CoreId(0), 2.0), Some(4.0));
        // Falls back to segment default on a different core.
        assert_eq!(etm.duration(&p, SegmentId(1), CoreId(1), 2.0), Some(0.6));
        // Falls back to global default for an unknown segment.
        assert_eq!(etm.duration(&p, SegmentId(9), CoreId(0), 2.0), Some(2.0));
    }
}
