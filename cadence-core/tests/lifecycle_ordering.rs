use std::sync::Arc;
use std::time::Duration;

use cadence_core::state::EventKind;
use cadence_core::{
    CadenceError, Component, ComponentKind, Result, Runtime, RuntimeConfig, State, StateEvent,
};
use parking_lot::Mutex;

struct Step {
    name: &'static str,
    log: Arc<Mutex<Vec<String>>>,
}

impl Component for Step {
    fn initialize(&mut self) -> Result<()> {
        self.log.lock().push(format!("init {}", self.name));
        Ok(())
    }

    fn shutdown(&mut self) -> Result<()> {
        self.log.lock().push(format!("stop {}", self.name));
        Ok(())
    }
}

fn runtime() -> Runtime {
    let mut config = RuntimeConfig::default();
    config.threads.fail_fast_on_order_violation = false;
    Runtime::new(config).expect("runtime")
}

fn step(log: &Arc<Mutex<Vec<String>>>, name: &'static str) -> Box<dyn Component> {
    Box::new(Step {
        name,
        log: Arc::clone(log),
    })
}

#[test]
fn chain_initializes_in_dependency_order_and_stops_in_reverse() {
    let rt = runtime();
    let log = Arc::new(Mutex::new(Vec::new()));
    rt.register_managed("A", ComponentKind::Service, None, step(&log, "A"), &[])
        .expect("A");
    rt.register_managed("B", ComponentKind::Service, None, step(&log, "B"), &["A"])
        .expect("B");
    rt.register_managed("C", ComponentKind::Service, None, step(&log, "C"), &["B"])
        .expect("C");

    let init = rt.initialize_all().expect("initialize");
    assert_eq!(init.initialized, vec!["A", "B", "C"]);

    let stop = rt.shutdown_all().expect("shutdown");
    assert_eq!(stop.stopped, vec!["C", "B", "A"]);
    assert_eq!(
        *log.lock(),
        vec!["init A", "init B", "init C", "stop C", "stop B", "stop A"]
    );
}

#[test]
fn history_length_matches_successful_transitions() {
    let rt = runtime();
    rt.register_component("capture-0", ComponentKind::Capture, Some(0))
        .expect("register");

    let path = [
        State::Initializing,
        State::Initialized,
        State::RUNNING,
        State::Stopping,
        State::Stopped,
        State::Initializing,
    ];
    let mut successes = 0;
    for target in path {
        rt.transition_state("capture-0", target).expect("legal");
        successes += 1;
        // An illegal request in between must not count.
        let _ = rt.transition_state("capture-0", State::Registered);
    }

    let history = rt.state().history("capture-0").expect("history");
    assert_eq!(history.len(), successes);
    assert!(history.iter().all(|e| e.success));
    assert!(history.windows(2).all(|w| w[0].seq < w[1].seq));
}

#[test]
fn rollback_restores_the_immediately_preceding_state() {
    let rt = runtime();
    rt.register_component("asr", ComponentKind::Transcription, Some(1))
        .expect("register");
    rt.transition_state("asr", State::Initializing).expect("init");
    rt.transition_state("asr", State::Initialized).expect("ready");

    let event = rt
        .state()
        .rollback("asr")
        .expect("rollback")
        .expect("event");
    assert_eq!(event.kind, EventKind::Rollback);
    assert_eq!(rt.get_component_state("asr").expect("state"), State::Initializing);
    assert_eq!(rt.state().history("asr").expect("history").len(), 1);
}

#[test]
fn callbacks_observe_committed_state_and_rejections() {
    let rt = Arc::new(runtime());
    rt.register_component("storage", ComponentKind::Storage, None)
        .expect("register");

    let seen: Arc<Mutex<Vec<(State, bool, State)>>> = Arc::new(Mutex::new(Vec::new()));
    {
        let seen = Arc::clone(&seen);
        let observer = Arc::downgrade(&rt);
        rt.register_state_callback(move |event: &StateEvent| {
            // Reentrant read from the dispatcher thread.
            let now = observer
                .upgrade()
                .and_then(|rt| rt.get_component_state(&event.component).ok())
                .unwrap_or(State::Registered);
            seen.lock().push((event.to, event.success, now));
        })
        .expect("callback");
    }

    rt.transition_state("storage", State::Initializing).expect("init");
    let err = rt
        .transition_state("storage", State::Stopped)
        .err()
        .expect("illegal");
    assert!(matches!(err, CadenceError::InvalidTransition { .. }));
    assert!(rt.state().flush(Duration::from_secs(2)));

    let seen = seen.lock();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0], (State::Initializing, true, State::Initializing));
    assert_eq!(seen[1].0, State::Stopped);
    assert!(!seen[1].1);
}

#[test]
fn names_are_unique_for_the_process_lifetime() {
    let rt = runtime();
    rt.register_component("display", ComponentKind::Display, None)
        .expect("first");
    let err = rt
        .register_component("display", ComponentKind::Display, None)
        .err()
        .expect("duplicate");
    assert!(matches!(err, CadenceError::DuplicateComponent(_)));
    assert!(matches!(
        rt.get_component_state("ghost"),
        Err(CadenceError::ComponentNotRegistered(_))
    ));
}
