//! Session lifecycle.
//!
//! The [`Orchestrator`] runs one session through
//! `Provisioning → AgentSetup → Running → Reporting`, then tears the
//! environment down. Any failure, cancellation or timeout moves the session
//! to `Aborting`; teardown follows on every path once `start` has been
//! invoked.
//!
//! # Error precedence
//!
//! The first error is the session error. A teardown failure after it is
//! kept as a secondary error on [`SessionFailure`]; a teardown failure on
//! an otherwise successful session becomes the session error.
//!
//! # Cancellation
//!
//! The guarded body races the [`CancelSignal`] and the optional deadline.
//! Whichever wins, the body is dropped and `stop` is awaited before `run`
//! returns. A second cancellation during `stop` interrupts it and `stop` is
//! retried once without interruption.

use std::collections::HashMap;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};

use crate::agent::Agent;
use crate::config::{SessionConfig, SessionInput};
use crate::context::{EPISODES_KEY, RunContext};
use crate::environment::{Environment, EnvironmentSpec};
use crate::error::{EnvError, SessionError, SessionFailure};
use crate::events::{CancelSignal, EventSink, SessionEvent};

// ── Report ───────────────────────────────────────────────────

/// Results of a successful session, collected from the [`RunContext`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionReport {
    cost_usd: Option<f64>,
    turns: Option<u64>,
    metadata: HashMap<String, serde_json::Value>,
}

impl SessionReport {
    fn from_context(ctx: &RunContext) -> Result<Self, SessionError> {
        if let Some(cost) = ctx.cost_usd()
            && !(cost.is_finite() && cost >= 0.0)
        {
            return Err(SessionError::Reporting(format!(
                "agent reported an invalid cost: {cost}"
            )));
        }

        let turns = ctx.episodes();
        if turns.is_none() && ctx.metadata().contains_key(EPISODES_KEY) {
            warn!(value = %ctx.metadata()[EPISODES_KEY], "ignoring non-integer turn count");
        }

        Ok(Self {
            cost_usd: ctx.cost_usd(),
            turns,
            metadata: ctx.metadata().clone(),
        })
    }

    /// Total model cost in USD, when the agent reported one.
    pub fn cost_usd(&self) -> Option<f64> {
        self.cost_usd
    }

    /// Number of agent turns, when the agent reported one.
    pub fn turns(&self) -> Option<u64> {
        self.turns
    }

    pub fn metadata(&self) -> &HashMap<String, serde_json::Value> {
        &self.metadata
    }
}

// ── State machine ────────────────────────────────────────────

/// Session lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Init,
    Provisioning,
    AgentSetup,
    Running,
    Reporting,
    Aborting,
    Teardown,
    Done,
}

impl SessionState {
    /// Whether `next` is a legal successor of this state.
    pub fn can_transition_to(self, next: Self) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Init, Provisioning)
                | (Provisioning, AgentSetup)
                | (AgentSetup, Running)
                | (Running, Reporting)
                | (Provisioning | AgentSetup | Running | Reporting, Aborting)
                | (Reporting | Aborting, Teardown)
                | (Teardown, Done)
        )
    }
}

#[derive(Debug)]
struct Lifecycle {
    state: SessionState,
    start_invoked: bool,
}

impl Lifecycle {
    fn new() -> Self {
        Self {
            state: SessionState::Init,
            start_invoked: false,
        }
    }

    fn advance(&mut self, next: SessionState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "invalid session transition {:?} -> {next:?}",
            self.state
        );
        debug!(from = ?self.state, to = ?next, "session transition");
        self.state = next;
    }
}

// ── Orchestrator ─────────────────────────────────────────────

/// Drives one session from provisioning to teardown.
///
/// # Examples
///
/// ```no_run
/// use terminus_core::{
///     CancelSignal, ClaudeAgent, DockerEnvironment, Orchestrator, SessionInput,
/// };
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let orchestrator = Orchestrator::from_input(
///     SessionInput::builder().instruction("list files").build(),
/// )?;
/// let mut agent = ClaudeAgent::new(orchestrator.config())?;
/// let report = orchestrator
///     .run(DockerEnvironment::new, &mut agent, &mut CancelSignal::never())
///     .await?;
/// println!("cost: {:?}", report.cost_usd());
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct Orchestrator {
    config: SessionConfig,
    events: EventSink,
}

impl Orchestrator {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            events: EventSink::disabled(),
        }
    }

    /// Validate raw input and create an orchestrator for it.
    ///
    /// # Errors
    ///
    /// Returns a `SessionError::Config` failure; no environment is created.
    pub fn from_input(input: SessionInput) -> Result<Self, SessionFailure> {
        Ok(Self::new(SessionConfig::from_input(input)?))
    }

    /// Report lifecycle progress on `events`.
    pub fn with_events(mut self, events: EventSink) -> Self {
        self.events = events;
        self
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Run the session.
    ///
    /// `build_env` receives the [`EnvironmentSpec`] derived from the config
    /// and returns an unstarted environment. The environment is stopped
    /// (with `delete = true`) before this returns whenever `start` was
    /// invoked.
    ///
    /// # Errors
    ///
    /// Returns a [`SessionFailure`] whose primary error names the step that
    /// failed, with any teardown failure attached as secondary.
    #[instrument(skip_all, fields(model = %self.config.model(), parser = %self.config.parser()))]
    pub async fn run<E, A, F>(
        &self,
        build_env: F,
        agent: &mut A,
        cancel: &mut CancelSignal,
    ) -> Result<SessionReport, SessionFailure>
    where
        E: Environment,
        A: Agent,
        F: FnOnce(EnvironmentSpec) -> E,
    {
        let mut env = build_env(EnvironmentSpec::from_config(&self.config));
        let mut lifecycle = Lifecycle::new();
        info!(env = env.name(), "starting session");

        let outcome = tokio::select! {
            biased;
            result = self.drive(&mut env, agent, &mut lifecycle) => result,
            () = cancel.cancelled() => Err(SessionError::Cancelled),
            () = deadline(self.config.timeout()) => {
                Err(SessionError::TimedOut(self.config.timeout().unwrap_or_default()))
            }
        };

        if let Err(err) = &outcome {
            error!(state = ?lifecycle.state, error = %err, "session failed");
            lifecycle.advance(SessionState::Aborting);
            self.events.emit(SessionEvent::Failed(err.to_string())).await;
        }

        lifecycle.advance(SessionState::Teardown);
        let teardown = if lifecycle.start_invoked {
            self.teardown(&mut env, cancel).await
        } else {
            Ok(())
        };
        lifecycle.advance(SessionState::Done);

        match (outcome, teardown) {
            (Ok(report), Ok(())) => Ok(report),
            (Ok(_), Err(teardown_err)) => Err(SessionFailure::new(
                SessionError::Teardown(teardown_err),
                None,
            )),
            (Err(err), Ok(())) => Err(SessionFailure::new(err, None)),
            (Err(err), Err(teardown_err)) => {
                warn!(error = %teardown_err, "teardown also failed after session error");
                Err(SessionFailure::new(err, Some(teardown_err)))
            }
        }
    }

    /// Provision, set up, run and report, strictly in sequence.
    async fn drive<E, A>(
        &self,
        env: &mut E,
        agent: &mut A,
        lifecycle: &mut Lifecycle,
    ) -> Result<SessionReport, SessionError>
    where
        E: Environment,
        A: Agent,
    {
        lifecycle.advance(SessionState::Provisioning);
        self.events.emit(SessionEvent::ProvisioningStarted).await;
        lifecycle.start_invoked = true;
        env.start(self.config.force_build())
            .await
            .map_err(SessionError::Provisioning)?;
        self.events.emit(SessionEvent::ProvisioningFinished).await;

        lifecycle.advance(SessionState::AgentSetup);
        self.events.emit(SessionEvent::SetupStarted).await;
        agent.setup(&*env).await.map_err(SessionError::AgentSetup)?;
        self.events.emit(SessionEvent::SetupFinished).await;

        lifecycle.advance(SessionState::Running);
        self.events
            .emit(SessionEvent::RunStarted {
                instruction: self.config.instruction().to_owned(),
            })
            .await;
        let mut ctx = RunContext::new();
        agent
            .run(self.config.instruction(), &*env, &mut ctx)
            .await
            .map_err(SessionError::AgentRun)?;

        lifecycle.advance(SessionState::Reporting);
        let report = SessionReport::from_context(&ctx)?;
        info!(cost_usd = ?report.cost_usd(), turns = ?report.turns(), "session completed");
        self.events
            .emit(SessionEvent::Completed(report.clone()))
            .await;
        Ok(report)
    }

    /// Stop the environment, retrying once if a cancellation interrupts it.
    async fn teardown<E: Environment>(
        &self,
        env: &mut E,
        cancel: &mut CancelSignal,
    ) -> Result<(), EnvError> {
        self.events.emit(SessionEvent::CleanupStarted).await;

        let first = tokio::select! {
            biased;
            result = env.stop(true) => Some(result),
            () = cancel.cancelled() => None,
        };
        let result = match first {
            Some(result) => result,
            None => {
                warn!("cancelled during teardown, retrying stop once");
                env.stop(true).await
            }
        };

        match &result {
            Ok(()) => self.events.emit(SessionEvent::CleanupFinished).await,
            Err(err) => {
                self.events
                    .emit(SessionEvent::CleanupFailed(err.to_string()))
                    .await
            }
        }
        result
    }
}

/// Completes after `timeout`, or never.
async fn deadline(timeout: Option<Duration>) {
    match timeout {
        Some(timeout) => tokio::time::sleep(timeout).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;

    use super::*;
    use crate::environment::{EnvState, ExecOutput};
    use crate::error::{AgentError, ConfigError};

    // ── Test doubles ─────────────────────────────────────────

    /// Shared, ordered record of collaborator calls.
    #[derive(Debug, Clone, Default)]
    struct CallLog(Arc<Mutex<Vec<&'static str>>>);

    impl CallLog {
        fn push(&self, call: &'static str) {
            self.0.lock().expect("lock").push(call);
        }

        fn calls(&self) -> Vec<&'static str> {
            self.0.lock().expect("lock").clone()
        }

        fn count(&self, call: &str) -> usize {
            self.calls().iter().filter(|c| **c == call).count()
        }
    }

    /// Behavior of a mocked step.
    #[derive(Debug, Clone, Copy, Default, PartialEq)]
    enum Step {
        #[default]
        Succeed,
        Fail,
        /// Never completes. For `stop`, only the first call hangs.
        Hang,
    }

    fn env_failure(command: &str) -> EnvError {
        EnvError::Command {
            command: format!("docker compose {command}"),
            status: "exit status: 1".to_owned(),
            stderr: "boom".to_owned(),
        }
    }

    struct MockEnv {
        log: CallLog,
        start: Step,
        stop: Step,
        state: EnvState,
        stop_calls: usize,
    }

    #[async_trait]
    impl Environment for MockEnv {
        fn name(&self) -> &str {
            "mock"
        }

        fn state(&self) -> EnvState {
            self.state
        }

        fn shell_command(&self) -> String {
            "sh -c".to_owned()
        }

        async fn start(&mut self, force_build: bool) -> Result<(), EnvError> {
            assert!(!force_build);
            self.log.push("start");
            self.state = EnvState::Starting;
            match self.start {
                Step::Succeed => {
                    self.state = EnvState::Running;
                    Ok(())
                }
                Step::Fail => Err(env_failure("up")),
                Step::Hang => std::future::pending().await,
            }
        }

        async fn stop(&mut self, delete: bool) -> Result<(), EnvError> {
            assert!(delete);
            self.log.push("stop");
            self.stop_calls += 1;
            match self.stop {
                Step::Hang if self.stop_calls == 1 => std::future::pending().await,
                Step::Fail => Err(env_failure("down")),
                _ => {
                    self.state = EnvState::Stopped;
                    Ok(())
                }
            }
        }

        async fn exec(&self, _command: &str) -> Result<ExecOutput, EnvError> {
            Ok(ExecOutput {
                exit_code: Some(0),
                stdout: String::new(),
                stderr: String::new(),
            })
        }
    }

    struct MockAgent {
        log: CallLog,
        setup: Step,
        run: Step,
        cost_usd: Option<f64>,
        episodes: Option<u64>,
    }

    #[async_trait]
    impl Agent for MockAgent {
        async fn setup(&mut self, env: &dyn Environment) -> Result<(), AgentError> {
            self.log.push("setup");
            assert_eq!(env.state(), EnvState::Running);
            match self.setup {
                Step::Succeed => Ok(()),
                Step::Fail => Err(AgentError::Failed("setup broke".to_owned())),
                Step::Hang => std::future::pending().await,
            }
        }

        async fn run(
            &mut self,
            instruction: &str,
            env: &dyn Environment,
            ctx: &mut RunContext,
        ) -> Result<(), AgentError> {
            self.log.push("run");
            assert_eq!(instruction, "list files");
            assert_eq!(env.state(), EnvState::Running);
            match self.run {
                Step::Succeed => {
                    if let Some(cost) = self.cost_usd {
                        ctx.set_cost_usd(cost);
                    }
                    if let Some(episodes) = self.episodes {
                        ctx.insert_metadata(EPISODES_KEY, episodes);
                    }
                    Ok(())
                }
                Step::Fail => Err(AgentError::Failed("run broke".to_owned())),
                Step::Hang => std::future::pending().await,
            }
        }
    }

    /// Step behavior for one scenario.
    #[derive(Debug, Clone, Copy, Default)]
    struct Scenario {
        start: Step,
        setup: Step,
        run: Step,
        stop: Step,
    }

    struct Harness {
        log: CallLog,
        agent: MockAgent,
        scenario: Scenario,
    }

    impl Harness {
        fn new(scenario: Scenario) -> Self {
            let log = CallLog::default();
            let agent = MockAgent {
                log: log.clone(),
                setup: scenario.setup,
                run: scenario.run,
                cost_usd: Some(0.0123),
                episodes: Some(3),
            };
            Self {
                log,
                agent,
                scenario,
            }
        }

        async fn run(
            &mut self,
            orchestrator: &Orchestrator,
            cancel: &mut CancelSignal,
        ) -> Result<SessionReport, SessionFailure> {
            let env = MockEnv {
                log: self.log.clone(),
                start: self.scenario.start,
                stop: self.scenario.stop,
                state: EnvState::Unprovisioned,
                stop_calls: 0,
            };
            orchestrator
                .run(move |_spec| env, &mut self.agent, cancel)
                .await
        }
    }

    fn test_input(dir: &Path) -> SessionInput {
        SessionInput::builder()
            .instruction("list files")
            .logs_dir(dir.join("logs"))
            .working_dir(dir)
            .build()
    }

    fn test_orchestrator(dir: &Path) -> Orchestrator {
        Orchestrator::from_input(test_input(dir)).expect("should build orchestrator")
    }

    // ── Tests ────────────────────────────────────────────────

    #[tokio::test]
    async fn test_should_report_cost_and_turns_on_success() {
        let dir = tempfile::TempDir::new().expect("should create temp dir");
        let (sink, mut events) = EventSink::channel();
        let orchestrator = test_orchestrator(dir.path()).with_events(sink);
        let mut harness = Harness::new(Scenario::default());

        let report = harness
            .run(&orchestrator, &mut CancelSignal::never())
            .await
            .expect("session should succeed");

        assert_eq!(report.cost_usd(), Some(0.0123));
        assert_eq!(report.turns(), Some(3));
        assert_eq!(harness.log.calls(), vec!["start", "setup", "run", "stop"]);

        let expected = vec![
            SessionEvent::ProvisioningStarted,
            SessionEvent::ProvisioningFinished,
            SessionEvent::SetupStarted,
            SessionEvent::SetupFinished,
            SessionEvent::RunStarted {
                instruction: "list files".to_owned(),
            },
            SessionEvent::Completed(report.clone()),
            SessionEvent::CleanupStarted,
            SessionEvent::CleanupFinished,
        ];
        for event in expected {
            assert_eq!(events.next().await, Some(event));
        }
    }

    #[tokio::test]
    async fn test_should_stop_exactly_once_for_every_outcome() {
        let outcomes = [Step::Succeed, Step::Fail];
        for start in outcomes {
            for setup in outcomes {
                for run in outcomes {
                    let dir = tempfile::TempDir::new().expect("should create temp dir");
                    let orchestrator = test_orchestrator(dir.path());
                    let scenario = Scenario {
                        start,
                        setup,
                        run,
                        stop: Step::Succeed,
                    };
                    let mut harness = Harness::new(scenario);

                    let result = harness.run(&orchestrator, &mut CancelSignal::never()).await;
                    let calls = harness.log.calls();

                    assert_eq!(harness.log.count("start"), 1, "{scenario:?}");
                    assert_eq!(harness.log.count("stop"), 1, "{scenario:?}");
                    assert_eq!(calls.last(), Some(&"stop"), "{scenario:?}");

                    let setup_called = start == Step::Succeed;
                    let run_called = setup_called && setup == Step::Succeed;
                    assert_eq!(harness.log.count("setup") == 1, setup_called, "{scenario:?}");
                    assert_eq!(harness.log.count("run") == 1, run_called, "{scenario:?}");

                    match result {
                        Ok(_) => assert!(run_called && run == Step::Succeed, "{scenario:?}"),
                        Err(failure) => {
                            let err = failure.error();
                            if start == Step::Fail {
                                assert!(matches!(err, SessionError::Provisioning(_)));
                            } else if setup == Step::Fail {
                                assert!(matches!(err, SessionError::AgentSetup(_)));
                            } else {
                                assert!(matches!(err, SessionError::AgentRun(_)));
                            }
                            assert!(failure.teardown_error().is_none());
                        }
                    }
                }
            }
        }
    }

    #[tokio::test]
    async fn test_should_keep_run_error_when_teardown_also_fails() {
        let dir = tempfile::TempDir::new().expect("should create temp dir");
        let orchestrator = test_orchestrator(dir.path());
        let mut harness = Harness::new(Scenario {
            run: Step::Fail,
            stop: Step::Fail,
            ..Scenario::default()
        });

        let failure = harness
            .run(&orchestrator, &mut CancelSignal::never())
            .await
            .unwrap_err();

        assert!(matches!(failure.error(), SessionError::AgentRun(_)));
        assert!(matches!(
            failure.teardown_error(),
            Some(EnvError::Command { .. })
        ));
        assert!(failure.to_string().contains("run broke"));
    }

    #[tokio::test]
    async fn test_should_report_teardown_error_when_it_is_the_only_error() {
        let dir = tempfile::TempDir::new().expect("should create temp dir");
        let (sink, mut events) = EventSink::channel();
        let orchestrator = test_orchestrator(dir.path()).with_events(sink);
        let mut harness = Harness::new(Scenario {
            stop: Step::Fail,
            ..Scenario::default()
        });

        let failure = harness
            .run(&orchestrator, &mut CancelSignal::never())
            .await
            .unwrap_err();

        assert!(matches!(failure.error(), SessionError::Teardown(_)));
        assert!(failure.teardown_error().is_none());

        let mut last = None;
        for _ in 0..8 {
            last = events.next().await;
        }
        assert!(matches!(last, Some(SessionEvent::CleanupFailed(_))));
    }

    #[tokio::test]
    async fn test_should_keep_provisioning_error_over_teardown_error() {
        let dir = tempfile::TempDir::new().expect("should create temp dir");
        let orchestrator = test_orchestrator(dir.path());
        let mut harness = Harness::new(Scenario {
            start: Step::Fail,
            stop: Step::Fail,
            ..Scenario::default()
        });

        let failure = harness
            .run(&orchestrator, &mut CancelSignal::never())
            .await
            .unwrap_err();

        assert!(matches!(failure.error(), SessionError::Provisioning(_)));
        assert!(failure.teardown_error().is_some());
        assert_eq!(harness.log.calls(), vec!["start", "stop"]);
    }

    #[tokio::test]
    async fn test_should_emit_failure_before_cleanup() {
        let dir = tempfile::TempDir::new().expect("should create temp dir");
        let (sink, mut events) = EventSink::channel();
        let orchestrator = test_orchestrator(dir.path()).with_events(sink);
        let mut harness = Harness::new(Scenario {
            setup: Step::Fail,
            ..Scenario::default()
        });

        harness
            .run(&orchestrator, &mut CancelSignal::never())
            .await
            .unwrap_err();

        let expected = [
            SessionEvent::ProvisioningStarted,
            SessionEvent::ProvisioningFinished,
            SessionEvent::SetupStarted,
        ];
        for event in expected {
            assert_eq!(events.next().await, Some(event));
        }
        assert!(matches!(events.next().await, Some(SessionEvent::Failed(msg)) if msg.contains("setup broke")));
        assert_eq!(events.next().await, Some(SessionEvent::CleanupStarted));
        assert_eq!(events.next().await, Some(SessionEvent::CleanupFinished));
    }

    #[tokio::test]
    async fn test_should_never_start_when_config_is_invalid() {
        let dir = tempfile::TempDir::new().expect("should create temp dir");
        let mut input = test_input(dir.path());
        input.parser = "yaml".to_owned();

        let failure = Orchestrator::from_input(input).unwrap_err();

        assert!(matches!(
            failure.error(),
            SessionError::Config(ConfigError::UnknownParser(_))
        ));
        assert!(failure.teardown_error().is_none());
        assert!(!dir.path().join("logs").exists());
    }

    #[tokio::test]
    async fn test_should_succeed_without_cost() {
        let dir = tempfile::TempDir::new().expect("should create temp dir");
        let orchestrator = test_orchestrator(dir.path());
        let mut harness = Harness::new(Scenario::default());
        harness.agent.cost_usd = None;
        harness.agent.episodes = None;

        let report = harness
            .run(&orchestrator, &mut CancelSignal::never())
            .await
            .expect("session should succeed");

        assert!(report.cost_usd().is_none());
        assert!(report.turns().is_none());
    }

    #[tokio::test]
    async fn test_should_fail_reporting_on_invalid_cost() {
        let dir = tempfile::TempDir::new().expect("should create temp dir");
        let orchestrator = test_orchestrator(dir.path());
        let mut harness = Harness::new(Scenario::default());
        harness.agent.cost_usd = Some(-1.0);

        let failure = harness
            .run(&orchestrator, &mut CancelSignal::never())
            .await
            .unwrap_err();

        assert!(matches!(failure.error(), SessionError::Reporting(_)));
        assert_eq!(harness.log.count("stop"), 1);
    }

    #[tokio::test]
    async fn test_should_stop_before_honoring_cancellation_during_run() {
        let dir = tempfile::TempDir::new().expect("should create temp dir");
        let orchestrator = test_orchestrator(dir.path());
        let mut harness = Harness::new(Scenario {
            run: Step::Hang,
            ..Scenario::default()
        });
        let (handle, mut cancel) = CancelSignal::channel();
        handle.cancel();

        let failure = harness.run(&orchestrator, &mut cancel).await.unwrap_err();

        assert!(matches!(failure.error(), SessionError::Cancelled));
        assert_eq!(harness.log.calls(), vec!["start", "setup", "run", "stop"]);
    }

    #[tokio::test]
    async fn test_should_stop_when_cancelled_during_setup() {
        let dir = tempfile::TempDir::new().expect("should create temp dir");
        let (sink, mut events) = EventSink::channel();
        let orchestrator = test_orchestrator(dir.path()).with_events(sink);
        let mut harness = Harness::new(Scenario {
            setup: Step::Hang,
            ..Scenario::default()
        });
        let (handle, mut cancel) = CancelSignal::channel();
        handle.cancel();

        let failure = harness.run(&orchestrator, &mut cancel).await.unwrap_err();

        assert!(matches!(failure.error(), SessionError::Cancelled));
        assert!(failure.teardown_error().is_none());
        assert_eq!(harness.log.calls(), vec!["start", "setup", "stop"]);

        let expected = [
            SessionEvent::ProvisioningStarted,
            SessionEvent::ProvisioningFinished,
            SessionEvent::SetupStarted,
            SessionEvent::Failed("session cancelled".to_owned()),
            SessionEvent::CleanupStarted,
            SessionEvent::CleanupFinished,
        ];
        for event in expected {
            assert_eq!(events.next().await, Some(event));
        }
    }

    #[tokio::test]
    async fn test_should_stop_when_cancelled_during_start() {
        let dir = tempfile::TempDir::new().expect("should create temp dir");
        let orchestrator = test_orchestrator(dir.path());
        let mut harness = Harness::new(Scenario {
            start: Step::Hang,
            ..Scenario::default()
        });
        let (handle, mut cancel) = CancelSignal::channel();
        handle.cancel();

        let failure = harness.run(&orchestrator, &mut cancel).await.unwrap_err();

        assert!(matches!(failure.error(), SessionError::Cancelled));
        assert_eq!(harness.log.calls(), vec!["start", "stop"]);
    }

    #[tokio::test]
    async fn test_should_retry_stop_once_after_second_cancellation() {
        let dir = tempfile::TempDir::new().expect("should create temp dir");
        let orchestrator = test_orchestrator(dir.path());
        let mut harness = Harness::new(Scenario {
            run: Step::Hang,
            stop: Step::Hang,
            ..Scenario::default()
        });
        let (handle, mut cancel) = CancelSignal::channel();
        handle.cancel();
        handle.cancel();

        let failure = harness.run(&orchestrator, &mut cancel).await.unwrap_err();

        assert!(matches!(failure.error(), SessionError::Cancelled));
        assert!(failure.teardown_error().is_none());
        assert_eq!(harness.log.count("stop"), 2);
    }

    #[tokio::test]
    async fn test_should_time_out_and_still_stop() {
        let dir = tempfile::TempDir::new().expect("should create temp dir");
        let mut input = test_input(dir.path());
        input.timeout = Some(Duration::from_millis(50));
        let orchestrator = Orchestrator::from_input(input).expect("should build orchestrator");
        let mut harness = Harness::new(Scenario {
            run: Step::Hang,
            ..Scenario::default()
        });

        let failure = harness
            .run(&orchestrator, &mut CancelSignal::never())
            .await
            .unwrap_err();

        assert!(matches!(failure.error(), SessionError::TimedOut(d) if *d == Duration::from_millis(50)));
        assert_eq!(harness.log.count("stop"), 1);
    }

    #[tokio::test]
    async fn test_should_pass_derived_spec_to_environment_builder() {
        let dir = tempfile::TempDir::new().expect("should create temp dir");
        let orchestrator = test_orchestrator(dir.path());
        let log = CallLog::default();
        let mut agent = Harness::new(Scenario::default()).agent;
        let mut seen = None;

        orchestrator
            .run(
                |spec| {
                    seen = Some(spec);
                    MockEnv {
                        log: log.clone(),
                        start: Step::Succeed,
                        stop: Step::Succeed,
                        state: EnvState::Unprovisioned,
                        stop_calls: 0,
                    }
                },
                &mut agent,
                &mut CancelSignal::never(),
            )
            .await
            .expect("session should succeed");

        let spec = seen.expect("builder should be called");
        assert_eq!(spec.mount.host, orchestrator.config().working_dir());
        assert_eq!(spec.mount.sandbox, "/workspace");
    }

    #[test]
    fn test_should_allow_only_lifecycle_transitions() {
        use SessionState::*;

        assert!(Init.can_transition_to(Provisioning));
        assert!(Running.can_transition_to(Reporting));
        assert!(Running.can_transition_to(Aborting));
        assert!(Aborting.can_transition_to(Teardown));
        assert!(Teardown.can_transition_to(Done));

        assert!(!Init.can_transition_to(Running));
        assert!(!AgentSetup.can_transition_to(Reporting));
        assert!(!Reporting.can_transition_to(Done));
        assert!(!Done.can_transition_to(Aborting));
        assert!(!Teardown.can_transition_to(Aborting));
    }
}
