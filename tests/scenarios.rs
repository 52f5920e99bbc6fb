//! End-to-end scenarios exercising `Engine` against whole models, one per
//! named behavior in spec.md §8. These build models directly (no
//! validator in this crate's scope) and drive the engine to completion.

use rt_sim_core::{
    arrivals::{ArrivalProcess, ArrivalSpec, GeneratorRegistry},
    audit,
    etm::Etm,
    events::{EventBus, EventIdMode, EventKind},
    metrics,
    model::{
        Core, CoreId, Model, Platform, ProcTypeId, Protocol, ProcessorType, Resource, ResourceId,
        Segment, SegmentId, SimParams, Subtask, SubtaskId, TaskGraph, TaskId, TaskKind,
    },
    protocol::ResourceAcquirePolicy,
    scheduler::{SchedulerConfig, SchedulerKind, TieBreaker},
    Engine, EngineConfig,
};

fn one_core_platform() -> Platform {
    Platform {
        processor_types: vec![ProcessorType {
            id: ProcTypeId(0),
            name: "p0".into(),
            core_count: 1,
            family_speed: 1.0,
        }],
        cores: vec![Core { id: CoreId(0), type_id: ProcTypeId(0), speed_factor: 1.0 }],
    }
}

// Release time is the task's own `phase` field; `ArrivalSpec` only says
// how releases are *spaced*, so a one_shot spec here carries no time of
// its own.
fn one_shot() -> ArrivalSpec {
    ArrivalSpec { process: ArrivalProcess::OneShot, max_releases: None }
}

fn default_engine_config(scheduler: SchedulerKind) -> EngineConfig {
    EngineConfig {
        scheduler: SchedulerConfig { kind: scheduler, tie_breaker: TieBreaker::Fifo, allow_preempt: true },
        resource_acquire_policy: ResourceAcquirePolicy::LegacySequential,
        etm: Etm::Constant,
        event_id_mode: EventIdMode::Deterministic,
        generators: GeneratorRegistry::new(),
    }
}

fn segment(id: u32, wcet: f64, resources: Vec<ResourceId>, mapping_hint: Option<CoreId>) -> Segment {
    Segment {
        id: SegmentId(id),
        index: 1,
        wcet,
        acet: None,
        resources,
        mapping_hint,
        preemptible: true,
        release_offset: None,
    }
}

fn leaf_subtask(id: u32, seg: Segment, predecessors: Vec<SubtaskId>, successors: Vec<SubtaskId>) -> Subtask {
    Subtask { id: SubtaskId(id), predecessors, successors, mapping_hint: None, segments: vec![seg] }
}

fn kind_from_event(trace: &[rt_sim_core::Event]) -> Vec<(f64, &'static str)> {
    trace.iter().map(|e| (e.time, e.kind.name())).collect()
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

#[test]
fn scenario_1_single_dag_single_core_edf_no_resources() {
    init_tracing();
    let platform = one_core_platform();
    let task = TaskGraph {
        id: TaskId(0),
        name: "t0".into(),
        kind: TaskKind::DynamicRt,
        period: Some(20.0),
        deadline: Some(20.0),
        phase: Some(0.0),
        arrival: Some(one_shot()),
        abort_on_miss: false,
        mapping_hint: None,
        subtasks: vec![
            leaf_subtask(0, segment(0, 2.0, vec![], None), vec![], vec![SubtaskId(1)]),
            leaf_subtask(1, segment(1, 3.0, vec![], None), vec![SubtaskId(0)], vec![]),
        ],
    };
    let model = Model {
        version: "0.2".into(),
        platform,
        resources: vec![],
        tasks: vec![task],
        sim: SimParams { duration: 10.0, seed: 1 },
    };

    let mut bus = EventBus::new(EventIdMode::Deterministic, 1);
    let mut engine = Engine::build(&model, default_engine_config(SchedulerKind::Edf), &mut bus).unwrap();
    engine.run(&mut bus).unwrap();

    let kinds = kind_from_event(bus.trace());
    assert_eq!(
        kinds,
        vec![
            (0.0, "JobRelease"),
            (0.0, "SubtaskReady"),
            (0.0, "SegmentStart"),
            (2.0, "SegmentEnd"),
            (2.0, "SubtaskReady"),
            (2.0, "SegmentStart"),
            (5.0, "SegmentEnd"),
            (5.0, "JobComplete"),
        ]
    );

    let metrics = metrics::compute(bus.trace(), &model);
    assert_eq!(metrics.per_job[0].response_time, Some(5.0));
    assert_eq!(metrics.summary.deadline_miss_rate, 0.0);
}

#[test]
fn scenario_2_heterogeneous_speed_migrates_and_rescales() {
    init_tracing();
    let platform = Platform {
        processor_types: vec![
            ProcessorType { id: ProcTypeId(0), name: "p0".into(), core_count: 1, family_speed: 1.0 },
            ProcessorType { id: ProcTypeId(1), name: "p1".into(), core_count: 1, family_speed: 5.0 },
        ],
        cores: vec![
            Core { id: CoreId(0), type_id: ProcTypeId(0), speed_factor: 1.0 },
            Core { id: CoreId(1), type_id: ProcTypeId(1), speed_factor: 1.0 },
        ],
    };
    assert_eq!(platform.effective_speed(CoreId(1)), Some(5.0));

    let task = TaskGraph {
        id: TaskId(0),
        name: "t0".into(),
        kind: TaskKind::DynamicRt,
        period: Some(20.0),
        deadline: Some(20.0),
        phase: Some(0.0),
        arrival: Some(one_shot()),
        abort_on_miss: false,
        mapping_hint: Some(CoreId(0)),
        subtasks: vec![
            leaf_subtask(0, segment(0, 2.0, vec![], None), vec![], vec![SubtaskId(1)]),
            leaf_subtask(1, segment(1, 3.0, vec![], Some(CoreId(1))), vec![SubtaskId(0)], vec![]),
        ],
    };
    let model = Model {
        version: "0.2".into(),
        platform,
        resources: vec![],
        tasks: vec![task],
        sim: SimParams { duration: 10.0, seed: 1 },
    };

    let mut bus = EventBus::new(EventIdMode::Deterministic, 1);
    let mut engine = Engine::build(&model, default_engine_config(SchedulerKind::Edf), &mut bus).unwrap();
    engine.run(&mut bus).unwrap();

    let trace = bus.trace();
    let migration_idx = trace.iter().position(|e| e.kind.name() == "Migration").expect("migration emitted");
    let second_start_idx = trace[migration_idx + 1..]
        .iter()
        .position(|e| e.kind.name() == "SegmentStart")
        .map(|i| i + migration_idx + 1)
        .expect("segment start after migration");
    assert_eq!(second_start_idx, migration_idx + 1, "Migration must immediately precede the SegmentStart it describes");
    assert_eq!(trace[migration_idx].time, 2.0);

    let segment_end_at_2_6 = trace
        .iter()
        .filter(|e| e.kind.name() == "SegmentEnd")
        .nth(1)
        .expect("second segment end");
    assert!((segment_end_at_2_6.time - 2.6).abs() < 1e-9);
}

#[test]
fn scenario_3_pip_inversion_avoidance() {
    init_tracing();
    let platform = one_core_platform();
    let r0 = Resource {
        id: ResourceId(0),
        name: "r0".into(),
        bound_core_id: CoreId(0),
        protocol: Protocol::Pip,
        declared_ceiling: None,
    };

    // L: released first, lowest priority (largest absolute deadline), holds
    // r0 for its whole 5-unit segment.
    let low = TaskGraph {
        id: TaskId(0),
        name: "low".into(),
        kind: TaskKind::DynamicRt,
        period: Some(1000.0),
        deadline: Some(1000.0),
        phase: Some(0.0),
        arrival: Some(one_shot()),
        abort_on_miss: false,
        mapping_hint: Some(CoreId(0)),
        subtasks: vec![leaf_subtask(0, segment(0, 5.0, vec![ResourceId(0)], None), vec![], vec![])],
    };
    // M and H both become ready at t=2: M has worse priority than H but
    // better than L's base priority, so only PIP's raise keeps it off the core.
    let medium = TaskGraph {
        id: TaskId(1),
        name: "medium".into(),
        kind: TaskKind::DynamicRt,
        period: Some(50.0),
        deadline: Some(50.0),
        phase: Some(2.0),
        arrival: Some(one_shot()),
        abort_on_miss: false,
        mapping_hint: Some(CoreId(0)),
        subtasks: vec![leaf_subtask(1, segment(1, 3.0, vec![], None), vec![], vec![])],
    };
    let high = TaskGraph {
        id: TaskId(2),
        name: "high".into(),
        kind: TaskKind::DynamicRt,
        period: Some(1.0),
        deadline: Some(1.0),
        phase: Some(2.0),
        arrival: Some(one_shot()),
        abort_on_miss: false,
        mapping_hint: Some(CoreId(0)),
        subtasks: vec![leaf_subtask(2, segment(2, 1.0, vec![ResourceId(0)], None), vec![], vec![])],
    };
    let model = Model {
        version: "0.2".into(),
        platform,
        resources: vec![r0],
        tasks: vec![low, medium, high],
        sim: SimParams { duration: 15.0, seed: 1 },
    };

    let mut bus = EventBus::new(EventIdMode::Deterministic, 1);
    let mut engine = Engine::build(&model, default_engine_config(SchedulerKind::Edf), &mut bus).unwrap();
    engine.run(&mut bus).unwrap();

    let trace = bus.trace();
    let raise = trace
        .iter()
        .find(|e| matches!(&e.kind, EventKind::PriorityRaise { .. }))
        .expect("PIP raise emitted");
    if let EventKind::PriorityRaise { due_to_job, .. } = &raise.kind {
        let high_job = trace
            .iter()
            .find_map(|e| match &e.kind {
                EventKind::JobRelease { job_id, task_id } if *task_id == TaskId(2) => Some(*job_id),
                _ => None,
            })
            .unwrap();
        assert_eq!(*due_to_job, high_job);
    }

    // M must not start running before L's segment ends at t=5.
    let medium_job = trace
        .iter()
        .find_map(|e| match &e.kind {
            EventKind::JobRelease { job_id, task_id } if *task_id == TaskId(1) => Some(*job_id),
            _ => None,
        })
        .unwrap();
    let medium_start = trace
        .iter()
        .find(|e| matches!(&e.kind, EventKind::SegmentStart { job_id, .. } if *job_id == medium_job))
        .expect("medium eventually starts");
    assert!(medium_start.time >= 5.0, "medium started at {} before L released r0", medium_start.time);

    // H finishes right after L releases r0 at 5, then M.
    let high_job = trace
        .iter()
        .find_map(|e| match &e.kind {
            EventKind::JobRelease { job_id, task_id } if *task_id == TaskId(2) => Some(*job_id),
            _ => None,
        })
        .unwrap();
    let high_end = trace
        .iter()
        .find(|e| matches!(&e.kind, EventKind::SegmentEnd { job_id, .. } if *job_id == high_job))
        .unwrap();
    assert_eq!(high_end.time, 6.0);
}

#[test]
fn scenario_4_pcp_domain_alignment_under_edf() {
    init_tracing();
    let platform = one_core_platform();
    let r = Resource {
        id: ResourceId(0),
        name: "r".into(),
        bound_core_id: CoreId(0),
        protocol: Protocol::Pcp,
        declared_ceiling: None,
    };
    let a = TaskGraph {
        id: TaskId(0),
        name: "a".into(),
        kind: TaskKind::DynamicRt,
        period: Some(10.0),
        deadline: Some(5.0),
        phase: Some(0.0),
        arrival: Some(ArrivalSpec {
            process: ArrivalProcess::Fixed { interval: 10.0 },
            max_releases: Some(2),
        }),
        abort_on_miss: false,
        mapping_hint: Some(CoreId(0)),
        subtasks: vec![leaf_subtask(0, segment(0, 1.0, vec![ResourceId(0)], None), vec![], vec![])],
    };
    let b = TaskGraph {
        id: TaskId(1),
        name: "b".into(),
        kind: TaskKind::DynamicRt,
        period: Some(10.0),
        deadline: Some(8.0),
        phase: Some(0.1),
        arrival: Some(ArrivalSpec {
            process: ArrivalProcess::Fixed { interval: 10.0 },
            max_releases: Some(2),
        }),
        abort_on_miss: false,
        mapping_hint: Some(CoreId(0)),
        subtasks: vec![leaf_subtask(1, segment(1, 1.0, vec![ResourceId(0)], None), vec![], vec![])],
    };
    let model = Model {
        version: "0.2".into(),
        platform,
        resources: vec![r],
        tasks: vec![a, b],
        sim: SimParams { duration: 20.0, seed: 1 },
    };

    let mut bus = EventBus::new(EventIdMode::Deterministic, 1);
    let mut engine = Engine::build(&model, default_engine_config(SchedulerKind::Edf), &mut bus).unwrap();
    engine.run(&mut bus).unwrap();

    let report = audit::audit(bus.trace(), &model);
    let rule = report
        .rules
        .iter()
        .find(|r| r.name == "pcp_priority_domain_alignment")
        .expect("rule present");
    assert_eq!(rule.status, audit::RuleStatus::Pass);
}

#[test]
fn scenario_5_abort_on_deadline_miss() {
    init_tracing();
    let platform = one_core_platform();
    let r0 = Resource {
        id: ResourceId(0),
        name: "r0".into(),
        bound_core_id: CoreId(0),
        protocol: Protocol::Mutex,
        declared_ceiling: None,
    };
    let task = TaskGraph {
        id: TaskId(0),
        name: "t0".into(),
        kind: TaskKind::DynamicRt,
        period: Some(100.0),
        deadline: Some(10.0),
        phase: Some(0.0),
        arrival: Some(one_shot()),
        abort_on_miss: true,
        mapping_hint: Some(CoreId(0)),
        subtasks: vec![leaf_subtask(0, segment(0, 20.0, vec![ResourceId(0)], None), vec![], vec![])],
    };
    let model = Model {
        version: "0.2".into(),
        platform,
        resources: vec![r0],
        tasks: vec![task],
        sim: SimParams { duration: 30.0, seed: 1 },
    };

    let mut bus = EventBus::new(EventIdMode::Deterministic, 1);
    let mut engine = Engine::build(&model, default_engine_config(SchedulerKind::Edf), &mut bus).unwrap();
    engine.run(&mut bus).unwrap();

    let at_ten: Vec<&'static str> =
        bus.trace().iter().filter(|e| e.time == 10.0).map(|e| e.kind.name()).collect();
    assert_eq!(at_ten, vec!["DeadlineMiss", "Preempt", "ResourceRelease", "JobAbort"]);

    assert!(
        !bus.trace()
            .iter()
            .any(|e| e.time > 10.0 && e.kind.name() == "SegmentStart"),
        "no SegmentStart may follow the abort"
    );
}

#[test]
fn scenario_6_deterministic_rerun_with_same_seed() {
    init_tracing();
    let platform = one_core_platform();
    let task = TaskGraph {
        id: TaskId(0),
        name: "t0".into(),
        kind: TaskKind::NonRt,
        period: None,
        deadline: None,
        phase: Some(0.0),
        arrival: Some(ArrivalSpec {
            process: ArrivalProcess::Poisson { rate: 0.3 },
            max_releases: Some(5),
        }),
        abort_on_miss: false,
        mapping_hint: Some(CoreId(0)),
        subtasks: vec![leaf_subtask(0, segment(0, 1.0, vec![], None), vec![], vec![])],
    };
    let model = Model {
        version: "0.2".into(),
        platform,
        resources: vec![],
        tasks: vec![task],
        sim: SimParams { duration: 200.0, seed: 42 },
    };

    // Compares full event payloads (via `Debug`, since `EventKind` carries
    // no `PartialEq`), not just `(time, kind name, bus-assigned event id)` —
    // that narrower comparison would pass even if job ids (embedded in the
    // payload of nearly every event) were drawn from OS randomness instead
    // of the seed, which is exactly the property this scenario exists to
    // catch (spec §8 testable property 4, "identical ... key payload
    // fields").
    let run = || {
        let mut bus = EventBus::new(EventIdMode::Deterministic, 42);
        let mut engine =
            Engine::build(&model, default_engine_config(SchedulerKind::RateMonotonic), &mut bus).unwrap();
        engine.run(&mut bus).unwrap();
        bus.trace()
            .iter()
            .map(|e| (e.time, format!("{:?}", e.kind)))
            .collect::<Vec<_>>()
    };

    let (a, b) = (run(), run());
    assert_eq!(a, b);
    assert!(
        a.iter().any(|(_, kind)| kind.contains("JobRelease")),
        "sanity: the run actually released jobs"
    );
}

#[test]
fn scenario_7_static_ceiling_under_edf_is_rejected() {
    init_tracing();
    let platform = one_core_platform();
    let r = Resource {
        id: ResourceId(0),
        name: "r".into(),
        bound_core_id: CoreId(0),
        protocol: Protocol::Pcp,
        declared_ceiling: Some(rt_sim_core::priority::Priority(5.0)),
    };
    let task = TaskGraph {
        id: TaskId(0),
        name: "t0".into(),
        kind: TaskKind::DynamicRt,
        period: Some(10.0),
        deadline: Some(10.0),
        phase: Some(0.0),
        arrival: Some(one_shot()),
        abort_on_miss: false,
        mapping_hint: Some(CoreId(0)),
        subtasks: vec![leaf_subtask(0, segment(0, 1.0, vec![ResourceId(0)], None), vec![], vec![])],
    };
    let model = Model {
        version: "0.2".into(),
        platform,
        resources: vec![r],
        tasks: vec![task],
        sim: SimParams { duration: 20.0, seed: 1 },
    };

    let mut bus = EventBus::new(EventIdMode::Deterministic, 1);
    let err = Engine::build(&model, default_engine_config(SchedulerKind::Edf), &mut bus)
        .expect_err("a declared ceiling under EDF must be rejected at build time");
    assert!(matches!(err, rt_sim_core::BuildError::StaticCeilingUnderEdf { resource } if resource == ResourceId(0)));
}
