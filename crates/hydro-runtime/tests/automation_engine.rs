mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::broadcast;
use tokio::time::Instant;

use common::{CountingSessions, FakeHardware, Reply};
use hydro_runtime::automation::{
    AutomationEngine, AutomationEvent, AutomationServices, AutomationState, Block,
    BlockExecutor, BlockOutcome, DeviceConfig, Edge, EngineSettings, ExecFuture,
    ExecutorRegistry, MemoryProgramSource, ProgramDefinition, SessionStore, StaticDevices,
    StepContext,
};
use hydro_runtime::clock::MonotonicClock;
use hydro_runtime::io::Response;
use hydro_runtime::RuntimeError;

struct Rig {
    hardware: FakeHardware,
    sessions: Arc<CountingSessions>,
    engine: AutomationEngine,
}

fn rig(program: ProgramDefinition) -> Rig {
    rig_with(program, EngineSettings::default())
}

fn rig_with(program: ProgramDefinition, settings: EngineSettings) -> Rig {
    rig_with_executors(program, settings, ExecutorRegistry::standard())
}

fn rig_with_executors(
    program: ProgramDefinition,
    settings: EngineSettings,
    executors: ExecutorRegistry,
) -> Rig {
    let hardware = FakeHardware::new();
    hardware.respond_with(|packet| {
        if packet.cmd == "analog_read" {
            common::reading(packet, 5.4)
        } else {
            Reply::Now(Response::ok(Some(packet.id), None))
        }
    });
    let sessions = Arc::new(CountingSessions::new());
    let devices = StaticDevices::default()
        .with(DeviceConfig::actuator("pump-a", "rack-1", 1, 5).with_flow_rate(2.0))
        .with(DeviceConfig::sensor("ph", "rack-1", 2, 34));
    let services = AutomationServices::new(
        hardware.manager(&["rack-1"]),
        Arc::new(MemoryProgramSource::new().with(program)),
    )
    .with_sessions(sessions.clone())
    .with_devices(Arc::new(devices))
    .with_clock(Arc::new(MonotonicClock::anchored_at(1_700_000_000_000)));
    let engine = AutomationEngine::new(services, executors, settings);
    Rig {
        hardware,
        sessions,
        engine,
    }
}

fn chain(id: &str, blocks: Vec<Block>) -> ProgramDefinition {
    let edges = blocks
        .windows(2)
        .map(|pair| Edge::new(pair[0].id.clone(), pair[1].id.clone()))
        .collect();
    ProgramDefinition::new(id, blocks, edges)
}

fn start() -> Block {
    Block::new("start", "START", json!({}))
}

fn end() -> Block {
    Block::new("end", "END", json!({}))
}

fn soak(duration_ms: u64) -> ProgramDefinition {
    chain(
        "soak",
        vec![
            start(),
            Block::new("wait", "WAIT", json!({"duration_ms": duration_ms})),
            end(),
        ],
    )
}

fn started_blocks(events: &mut broadcast::Receiver<AutomationEvent>) -> Vec<String> {
    let mut blocks = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let AutomationEvent::BlockStart { block, .. } = event {
            blocks.push(block.to_string());
        }
    }
    blocks
}

#[tokio::test(start_paused = true)]
async fn paused_wait_resumes_with_only_the_remaining_time() {
    let rig = rig(chain(
        "soak",
        vec![
            start(),
            Block::new("wait", "WAIT", json!({"duration_ms": 1000})),
            end(),
        ],
    ));
    rig.engine.load_program("soak").await.expect("load");
    let started = Instant::now();
    rig.engine.start_program().await.expect("start");

    tokio::time::sleep(Duration::from_millis(400)).await;
    rig.engine.pause_program().await.expect("pause");
    let snapshot = rig.engine.get_snapshot();
    assert_eq!(snapshot.state, AutomationState::Paused);
    assert_eq!(snapshot.current_block.as_deref(), Some("wait"));
    assert_eq!(
        snapshot.context.resume_state.get("wait"),
        Some(&json!({"remaining_ms": 600}))
    );
    assert_eq!(rig.sessions.writes(), 1);

    tokio::time::sleep_until(started + Duration::from_millis(2000)).await;
    rig.engine.resume_program().await.expect("resume");
    rig.engine.wait_idle().await;

    let elapsed = started.elapsed();
    assert!(
        elapsed >= Duration::from_millis(2600) && elapsed < Duration::from_millis(2650),
        "completed after {elapsed:?}"
    );
    assert_eq!(rig.engine.state(), AutomationState::Completed);
    assert_eq!(rig.sessions.writes(), 1);
    assert_eq!(rig.sessions.clears(), 1);
    assert!(rig.engine.get_snapshot().context.resume_state.is_empty());
}

#[tokio::test(start_paused = true)]
async fn stopping_a_pulse_sends_exactly_the_pulse_and_its_revert() {
    let rig = rig(chain(
        "flush",
        vec![
            start(),
            Block::new(
                "pulse",
                "ACTUATOR_SET",
                json!({"device": "pump-a", "action": "PULSE_ON", "duration_ms": 5000}),
            ),
            end(),
        ],
    ));
    rig.engine.load_program("flush").await.expect("load");
    rig.engine.start_program().await.expect("start");

    tokio::time::sleep(Duration::from_millis(1000)).await;
    rig.engine.stop_program().await.expect("stop");

    assert_eq!(rig.engine.state(), AutomationState::Stopped);
    assert_eq!(
        rig.hardware.frames(),
        ["DIGITAL_WRITE|1_5|1", "DIGITAL_WRITE|1_5|0"]
    );
    let snapshot = rig.engine.get_snapshot();
    assert!(snapshot.context.active_resources.is_empty());
    assert!(snapshot.context.errors.is_empty());
}

#[tokio::test(start_paused = true)]
async fn dose_holds_the_pump_for_volume_over_flow_rate() {
    let rig = rig(chain(
        "dose",
        vec![
            start(),
            Block::new(
                "dose",
                "ACTUATOR_SET",
                json!({"device": "pump-a", "action": "DOSE", "volume_ml": 5}),
            ),
            end(),
        ],
    ));
    rig.engine.load_program("dose").await.expect("load");
    let started = Instant::now();
    rig.engine.start_program().await.expect("start");
    rig.engine.wait_idle().await;

    assert_eq!(rig.engine.state(), AutomationState::Completed);
    assert!(started.elapsed() >= Duration::from_millis(2500));
    assert_eq!(
        rig.hardware.frames(),
        ["DIGITAL_WRITE|1_5|1", "DIGITAL_WRITE|1_5|0"]
    );
}

#[tokio::test(start_paused = true)]
async fn if_branches_on_a_fresh_sensor_reading() {
    let program = ProgramDefinition::new(
        "ph-check",
        vec![
            start(),
            Block::new("read", "SENSOR_READ", json!({"device": "ph"})),
            Block::new(
                "check",
                "IF",
                json!({"variable": "ph", "operator": "<", "value": 5.8, "tolerance": 0.2}),
            ),
            Block::new("low", "LOG", json!({"message": "pH {ph} is low"})),
            Block::new("fine", "LOG", json!({"message": "pH ok"})),
            end(),
        ],
        vec![
            Edge::new("start", "read"),
            Edge::new("read", "check"),
            Edge::new("check", "fine").labelled("false"),
            Edge::new("check", "low").labelled("true"),
            Edge::new("low", "end"),
            Edge::new("fine", "end"),
        ],
    );
    let rig = rig(program);
    let mut events = rig.engine.subscribe();
    let session = rig.engine.load_program("ph-check").await.expect("load");
    rig.engine.start_program().await.expect("start");
    rig.engine.wait_idle().await;

    assert_eq!(rig.engine.state(), AutomationState::Completed);
    assert_eq!(
        started_blocks(&mut events),
        ["start", "read", "check", "low", "end"]
    );
    let snapshot = rig.engine.get_snapshot();
    assert_eq!(snapshot.context.variables.get("ph"), Some(&json!(5.4)));
    assert_eq!(snapshot.context.step_count, 5);
    assert_eq!(rig.hardware.frames(), ["ANALOG_READ|2_34"]);

    let record = rig
        .sessions
        .load(&session)
        .await
        .expect("load session")
        .expect("session exists");
    assert_eq!(record.status, AutomationState::Completed);
    assert_eq!(record.logs.len(), 5);
    assert!(record.logs.iter().all(|entry| entry.success));
}

#[tokio::test(start_paused = true)]
async fn loop_runs_its_body_count_times_then_exits() {
    let program = ProgramDefinition::new(
        "cycle",
        vec![
            start(),
            Block::new("repeat", "LOOP", json!({"count": 3})),
            Block::new("tick", "ACTUATOR_SET", json!({"device": "pump-a", "action": "PULSE_ON", "duration_ms": 100})),
            end(),
        ],
        vec![
            Edge::new("start", "repeat"),
            Edge::new("repeat", "tick").labelled("body"),
            Edge::new("repeat", "end").labelled("exit"),
            Edge::new("tick", "repeat"),
        ],
    );
    let rig = rig(program);
    let mut events = rig.engine.subscribe();
    rig.engine.load_program("cycle").await.expect("load");
    rig.engine.start_program().await.expect("start");
    rig.engine.wait_idle().await;

    assert_eq!(rig.engine.state(), AutomationState::Completed);
    assert_eq!(
        started_blocks(&mut events),
        ["start", "repeat", "tick", "repeat", "tick", "repeat", "tick", "repeat", "end"]
    );
    assert_eq!(rig.hardware.frames().len(), 6);
    assert!(rig.engine.get_snapshot().context.resume_state.is_empty());
}

#[tokio::test(start_paused = true)]
async fn failures_move_to_error_and_roll_back_switched_devices() {
    let rig = rig(chain(
        "broken",
        vec![
            start(),
            Block::new("pump-on", "ACTUATOR_SET", json!({"device": "pump-a", "action": "ON"})),
            Block::new("ghost-on", "ACTUATOR_SET", json!({"device": "ghost", "action": "ON"})),
            end(),
        ],
    ));
    let session = rig.engine.load_program("broken").await.expect("load");
    rig.engine.start_program().await.expect("start");
    rig.engine.wait_idle().await;

    let snapshot = rig.engine.get_snapshot();
    assert_eq!(snapshot.state, AutomationState::Error);
    assert_eq!(snapshot.failed_block.as_deref(), Some("ghost-on"));
    assert_eq!(snapshot.error.as_deref(), Some("unknown device 'ghost'"));
    assert!(snapshot.context.active_resources.is_empty());
    assert_eq!(
        rig.hardware.frames(),
        ["DIGITAL_WRITE|1_5|1", "DIGITAL_WRITE|1_5|0"]
    );

    let record = rig
        .sessions
        .load(&session)
        .await
        .expect("load session")
        .expect("session exists");
    assert_eq!(record.status, AutomationState::Error);
    assert_eq!(record.error.as_deref(), Some("unknown device 'ghost'"));

    // error is acknowledged by STOP, after which the run can start over
    rig.engine.stop_program().await.expect("stop");
    assert_eq!(rig.hardware.frames().len(), 2);
    rig.engine.start_program().await.expect("restart");
    rig.engine.wait_idle().await;
    assert_eq!(rig.engine.state(), AutomationState::Error);
}

#[tokio::test(start_paused = true)]
async fn stop_reverts_devices_left_on() {
    let rig = rig(chain(
        "fill",
        vec![
            start(),
            Block::new("valve", "ACTUATOR_SET", json!({"device": "pump-a", "action": "ON"})),
            Block::new("wait", "WAIT", json!({"seconds": 30})),
            end(),
        ],
    ));
    rig.engine.load_program("fill").await.expect("load");
    rig.engine.start_program().await.expect("start");
    tokio::time::sleep(Duration::from_secs(5)).await;
    rig.engine.stop_program().await.expect("stop");

    assert_eq!(rig.engine.state(), AutomationState::Stopped);
    assert_eq!(
        rig.hardware.frames(),
        ["DIGITAL_WRITE|1_5|1", "DIGITAL_WRITE|1_5|0"]
    );
    assert!(rig.engine.get_snapshot().context.active_resources.is_empty());
}

#[tokio::test(start_paused = true)]
async fn runaway_goto_loops_hit_the_step_limit() {
    let program = ProgramDefinition::new(
        "spin",
        vec![
            start(),
            Block::new("top", "LABEL", json!({"name": "top"})),
            Block::new("note", "LOG", json!({"message": "again"})),
            Block::new("jump", "GOTO", json!({"label": "top"})),
        ],
        vec![
            Edge::new("start", "top"),
            Edge::new("top", "note"),
            Edge::new("note", "jump"),
        ],
    );
    let rig = rig_with(program, EngineSettings { max_steps: 40 });
    rig.engine.load_program("spin").await.expect("load");
    rig.engine.start_program().await.expect("start");
    rig.engine.wait_idle().await;

    let snapshot = rig.engine.get_snapshot();
    assert_eq!(snapshot.state, AutomationState::Error);
    assert_eq!(
        snapshot.error.as_deref(),
        Some(RuntimeError::StepLimit(40).to_string().as_str())
    );
    assert_eq!(snapshot.context.step_count, 41);
}

#[tokio::test]
async fn control_events_outside_their_states_are_rejected() {
    let rig = rig(chain("noop", vec![start(), end()]));
    let err = rig.engine.start_program().await.expect_err("nothing loaded");
    assert_eq!(err.to_string(), "cannot start while idle");
    assert!(rig.engine.pause_program().await.is_err());

    rig.engine.load_program("noop").await.expect("load");
    assert!(rig.engine.resume_program().await.is_err());
    rig.engine.start_program().await.expect("start");
    rig.engine.wait_idle().await;
    assert_eq!(rig.engine.state(), AutomationState::Completed);

    rig.engine.unload_program().await.expect("unload");
    assert_eq!(rig.engine.state(), AutomationState::Idle);
    assert_eq!(rig.engine.session_id(), None);
}

#[tokio::test]
async fn unknown_block_types_are_rejected_at_load() {
    let rig = rig(chain(
        "bad",
        vec![start(), Block::new("x", "TELEPORT", json!({}))],
    ));
    let err = rig.engine.load_program("bad").await.expect_err("unknown type");
    assert_eq!(err, RuntimeError::NoExecutor("TELEPORT".into()));
    assert_eq!(rig.engine.state(), AutomationState::Idle);
    assert!(matches!(
        rig.engine.load_program("missing").await,
        Err(RuntimeError::ProgramSource(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn stop_discards_the_saved_wait_so_a_reload_waits_in_full() {
    let rig = rig(soak(1000));
    let first = rig.engine.load_program("soak").await.expect("load");
    rig.engine.start_program().await.expect("start");
    tokio::time::sleep(Duration::from_millis(400)).await;
    rig.engine.stop_program().await.expect("stop");

    assert!(rig.engine.get_snapshot().context.resume_state.is_empty());
    assert_eq!(rig.sessions.writes(), 0);
    let record = rig
        .sessions
        .load(&first)
        .await
        .expect("load session")
        .expect("session exists");
    assert!(record.resume_state.is_empty());

    rig.engine.load_program("soak").await.expect("reload");
    let started = Instant::now();
    rig.engine.start_program().await.expect("fresh start");
    rig.engine.wait_idle().await;
    assert_eq!(rig.engine.state(), AutomationState::Completed);
    assert!(
        started.elapsed() >= Duration::from_millis(1000),
        "fresh run waited only {:?}",
        started.elapsed()
    );
}

#[tokio::test(start_paused = true)]
async fn restarting_a_stopped_pause_waits_in_full() {
    let rig = rig(soak(1000));
    rig.engine.load_program("soak").await.expect("load");
    rig.engine.start_program().await.expect("start");
    tokio::time::sleep(Duration::from_millis(300)).await;
    rig.engine.pause_program().await.expect("pause");
    assert_eq!(rig.sessions.writes(), 1);
    rig.engine.stop_program().await.expect("stop");
    assert!(rig.engine.get_snapshot().context.resume_state.is_empty());

    let started = Instant::now();
    rig.engine.start_program().await.expect("restart");
    rig.engine.wait_idle().await;
    assert_eq!(rig.engine.state(), AutomationState::Completed);
    assert!(started.elapsed() >= Duration::from_millis(1000));
}

#[tokio::test(start_paused = true)]
async fn repeated_pauses_keep_shrinking_the_remaining_wait() {
    let rig = rig(soak(1000));
    rig.engine.load_program("soak").await.expect("load");
    let started = Instant::now();
    rig.engine.start_program().await.expect("start");

    tokio::time::sleep(Duration::from_millis(300)).await;
    rig.engine.pause_program().await.expect("first pause");
    assert_eq!(
        rig.engine.get_snapshot().context.resume_state.get("wait"),
        Some(&json!({"remaining_ms": 700}))
    );

    tokio::time::sleep_until(started + Duration::from_millis(500)).await;
    rig.engine.resume_program().await.expect("first resume");
    tokio::time::sleep(Duration::from_millis(200)).await;
    rig.engine.pause_program().await.expect("second pause");
    assert_eq!(
        rig.engine.get_snapshot().context.resume_state.get("wait"),
        Some(&json!({"remaining_ms": 500}))
    );
    assert_eq!(rig.sessions.writes(), 2);

    rig.engine.resume_program().await.expect("second resume");
    rig.engine.wait_idle().await;
    let elapsed = started.elapsed();
    assert!(
        elapsed >= Duration::from_millis(1200) && elapsed < Duration::from_millis(1250),
        "completed after {elapsed:?}"
    );
    assert_eq!(rig.engine.state(), AutomationState::Completed);
}

#[tokio::test(start_paused = true)]
async fn failed_pulse_revert_is_retried_by_the_error_rollback() {
    let rig = rig(chain(
        "flush",
        vec![
            start(),
            Block::new(
                "pulse",
                "ACTUATOR_SET",
                json!({"device": "pump-a", "action": "PULSE_ON", "duration_ms": 100}),
            ),
            end(),
        ],
    ));
    rig.hardware.respond_with(|packet| {
        if packet.field("state") == Some(&json!(false)) {
            Reply::Now(Response::error(Some(packet.id), "relay stuck"))
        } else {
            Reply::Now(Response::ok(Some(packet.id), None))
        }
    });
    rig.engine.load_program("flush").await.expect("load");
    rig.engine.start_program().await.expect("start");
    rig.engine.wait_idle().await;

    let snapshot = rig.engine.get_snapshot();
    assert_eq!(snapshot.state, AutomationState::Error);
    assert_eq!(snapshot.failed_block.as_deref(), Some("pulse"));
    assert_eq!(snapshot.error.as_deref(), Some("relay stuck"));
    assert!(snapshot.context.active_resources.is_empty());
    assert_eq!(
        rig.hardware.frames(),
        [
            "DIGITAL_WRITE|1_5|1",
            "DIGITAL_WRITE|1_5|0",
            "DIGITAL_WRITE|1_5|0"
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn if_false_branch_never_visits_the_true_target() {
    let program = ProgramDefinition::new(
        "ph-high",
        vec![
            start(),
            Block::new("read", "SENSOR_READ", json!({"device": "ph"})),
            Block::new(
                "check",
                "IF",
                json!({"variable": "ph", "operator": ">", "value": 6.0, "tolerance": 0.2}),
            ),
            Block::new(
                "acid",
                "ACTUATOR_SET",
                json!({"device": "pump-a", "action": "PULSE_ON", "duration_ms": 500}),
            ),
            Block::new("fine", "LOG", json!({"message": "pH {ph} in range"})),
            end(),
        ],
        vec![
            Edge::new("start", "read"),
            Edge::new("read", "check"),
            Edge::new("check", "acid").labelled("true"),
            Edge::new("check", "fine").labelled("false"),
            Edge::new("acid", "end"),
            Edge::new("fine", "end"),
        ],
    );
    let rig = rig(program);
    let mut events = rig.engine.subscribe();
    rig.engine.load_program("ph-high").await.expect("load");
    rig.engine.start_program().await.expect("start");
    rig.engine.wait_idle().await;

    assert_eq!(rig.engine.state(), AutomationState::Completed);
    assert_eq!(
        started_blocks(&mut events),
        ["start", "read", "check", "fine", "end"]
    );
    assert_eq!(rig.hardware.frames(), ["ANALOG_READ|2_34"]);
}

fn timed_loop(params: serde_json::Value, body_ms: u64) -> ProgramDefinition {
    ProgramDefinition::new(
        "cycle",
        vec![
            start(),
            Block::new("repeat", "LOOP", params),
            Block::new("wait", "WAIT", json!({"duration_ms": body_ms})),
            end(),
        ],
        vec![
            Edge::new("start", "repeat"),
            Edge::new("repeat", "wait").labelled("body"),
            Edge::new("repeat", "end").labelled("exit"),
            Edge::new("wait", "repeat"),
        ],
    )
}

#[tokio::test(start_paused = true)]
async fn loop_stops_iterating_once_its_timeout_elapses() {
    let rig = rig(timed_loop(json!({"timeout_ms": 1000}), 300));
    let mut events = rig.engine.subscribe();
    rig.engine.load_program("cycle").await.expect("load");
    let started = Instant::now();
    rig.engine.start_program().await.expect("start");
    rig.engine.wait_idle().await;

    assert_eq!(rig.engine.state(), AutomationState::Completed);
    let elapsed = started.elapsed();
    assert!(
        elapsed >= Duration::from_millis(1200) && elapsed < Duration::from_millis(1250),
        "completed after {elapsed:?}"
    );
    let visited = started_blocks(&mut events);
    assert_eq!(visited.iter().filter(|block| *block == "repeat").count(), 5);
    assert_eq!(visited.iter().filter(|block| *block == "wait").count(), 4);
}

#[tokio::test(start_paused = true)]
async fn loop_iteration_and_start_time_survive_pause() {
    let rig = rig(timed_loop(json!({"count": 3}), 500));
    let mut events = rig.engine.subscribe();
    rig.engine.load_program("cycle").await.expect("load");
    let started = Instant::now();
    rig.engine.start_program().await.expect("start");

    tokio::time::sleep(Duration::from_millis(700)).await;
    rig.engine.pause_program().await.expect("pause");
    let saved = rig.engine.get_snapshot().context.resume_state;
    assert_eq!(
        saved.get("repeat"),
        Some(&json!({"iteration": 2, "started_at_ms": 1_700_000_000_000_i64}))
    );
    assert_eq!(saved.get("wait"), Some(&json!({"remaining_ms": 300})));

    rig.engine.resume_program().await.expect("resume");
    rig.engine.wait_idle().await;
    assert_eq!(rig.engine.state(), AutomationState::Completed);
    assert!(started.elapsed() < Duration::from_millis(1550));
    let visited = started_blocks(&mut events);
    assert_eq!(visited.iter().filter(|block| *block == "repeat").count(), 4);
    assert!(rig.engine.get_snapshot().context.resume_state.is_empty());
}

/// Suspends as if paused, without anyone asking.
struct NapExecutor;

impl BlockExecutor for NapExecutor {
    fn execute<'a>(&'a self, _block: &'a Block, _ctx: StepContext<'a>) -> ExecFuture<'a> {
        Box::pin(async { BlockOutcome::Paused(json!({"remaining_ms": 10})) })
    }
}

#[tokio::test(start_paused = true)]
async fn unrequested_suspension_fails_the_run() {
    let mut executors = ExecutorRegistry::standard();
    executors.register("NAP", Arc::new(NapExecutor));
    let rig = rig_with_executors(
        chain("nap", vec![start(), Block::new("nap", "NAP", json!({})), end()]),
        EngineSettings::default(),
        executors,
    );
    rig.engine.load_program("nap").await.expect("load");
    rig.engine.start_program().await.expect("start");
    rig.engine.wait_idle().await;

    let snapshot = rig.engine.get_snapshot();
    assert_eq!(snapshot.state, AutomationState::Error);
    assert_eq!(snapshot.failed_block.as_deref(), Some("nap"));
    assert_eq!(
        snapshot.error.as_deref(),
        Some("block 'nap' failed: suspended without a pause request")
    );
    assert_eq!(rig.sessions.writes(), 0);
}
