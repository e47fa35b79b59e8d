use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn, Instrument};

use super::{ReconcileError, ReconciliationContext, ReportOutcome, SyncOutcome};
use crate::flows::graphs::{self, WorkflowEvent, WorkflowState};
use crate::gateway::{FlowGateway, FlowIdentity};
use crate::machine::{Event, Machine, MalformedGraph, StateGraph, SubscriptionId, Tag, Transition};
use crate::telemetry::{create_flow_span, generate_correlation_id};

type Listener<S, E> = Box<dyn FnMut(&Transition<S, E>) + Send>;

struct Listeners<S, E> {
    next: u64,
    entries: Vec<(SubscriptionId, Listener<S, E>)>,
    /// Ids taken out of `entries` by a dispatch in progress
    in_flight: Vec<SubscriptionId>,
    /// In-flight ids unsubscribed during that dispatch
    removed: Vec<SubscriptionId>,
}

impl<S, E> Default for Listeners<S, E> {
    fn default() -> Self {
        Self {
            next: 0,
            entries: Vec::new(),
            in_flight: Vec::new(),
            removed: Vec::new(),
        }
    }
}

type SharedListeners<S, E> = Arc<StdMutex<Listeners<S, E>>>;

fn lock_listeners<S, E>(listeners: &StdMutex<Listeners<S, E>>) -> std::sync::MutexGuard<'_, Listeners<S, E>> {
    listeners.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Run every listener on `transition` without holding the listener lock, so
/// a callback may subscribe or unsubscribe, itself included.
fn dispatch<S, E>(listeners: &StdMutex<Listeners<S, E>>, transition: &Transition<S, E>) {
    let mut taken = {
        let mut guard = lock_listeners(listeners);
        let taken = std::mem::take(&mut guard.entries);
        guard.in_flight = taken.iter().map(|(id, _)| *id).collect();
        taken
    };

    for (id, listener) in taken.iter_mut() {
        let unsubscribed = lock_listeners(listeners).removed.contains(id);
        if !unsubscribed {
            listener(transition);
        }
    }

    let mut guard = lock_listeners(listeners);
    let removed = std::mem::take(&mut guard.removed);
    guard.in_flight.clear();
    taken.retain(|(id, _)| !removed.contains(id));
    let added = std::mem::replace(&mut guard.entries, taken);
    guard.entries.extend(added);
}

/// The event kind named after `state` (`completed` -> `COMPLETED`)
fn event_named_after<S: Tag, E: Tag>(state: S) -> Option<E> {
    E::from_name_ignore_case(state.name())
}

/// Keeps one local machine in line with the remote record of `identity`.
///
/// The machine lives behind an async mutex that is never held across a
/// gateway call. Every `start` and `stop` bumps a generation counter; a sync
/// or transition whose gateway call straddles one of them is discarded.
pub struct ReconciliationService<S, E> {
    identity: FlowIdentity,
    graph: Arc<StateGraph<S, E>>,
    error_event: E,
    gateway: Arc<dyn FlowGateway>,
    machine: Mutex<Option<Machine<S, E, ReconciliationContext>>>,
    listeners: SharedListeners<S, E>,
    generation: AtomicU64,
    periodic: StdMutex<Vec<AbortHandle>>,
}

impl<S: Tag, E: Tag> std::fmt::Debug for ReconciliationService<S, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconciliationService")
            .field("identity", &self.identity)
            .field("graph", &self.graph.name())
            .field("error_event", &self.error_event)
            .field("generation", &self.generation.load(Ordering::SeqCst))
            .finish()
    }
}

impl ReconciliationService<WorkflowState, WorkflowEvent> {
    /// Reconcile the built-in user workflow, with `ERROR` as failure event
    pub fn workflow(identity: FlowIdentity, gateway: Arc<dyn FlowGateway>) -> Result<Self, MalformedGraph> {
        Ok(Self::new(
            identity,
            Arc::new(graphs::workflow()?),
            WorkflowEvent::Error,
            gateway,
        ))
    }
}

impl<S: Tag, E: Tag> ReconciliationService<S, E> {
    pub fn new(
        identity: FlowIdentity,
        graph: Arc<StateGraph<S, E>>,
        error_event: E,
        gateway: Arc<dyn FlowGateway>,
    ) -> Self {
        Self {
            identity,
            graph,
            error_event,
            gateway,
            machine: Mutex::new(None),
            listeners: Arc::new(StdMutex::new(Listeners::default())),
            generation: AtomicU64::new(0),
            periodic: StdMutex::new(Vec::new()),
        }
    }

    pub fn identity(&self) -> &FlowIdentity {
        &self.identity
    }

    pub async fn is_running(&self) -> bool {
        self.machine.lock().await.is_some()
    }

    /// Create the local machine in its initial state and sync it once.
    ///
    /// A failed initial sync is returned as an error but leaves the service
    /// running.
    pub async fn start(&self) -> Result<SyncOutcome<S, E>, ReconcileError> {
        {
            let mut slot = self.machine.lock().await;
            if slot.is_some() {
                return Err(ReconcileError::AlreadyRunning {
                    identity: self.identity.clone(),
                });
            }

            self.generation.fetch_add(1, Ordering::SeqCst);
            let mut machine = Machine::new(
                Arc::clone(&self.graph),
                ReconciliationContext::new(self.identity.clone()),
            );
            let listeners = Arc::clone(&self.listeners);
            machine.subscribe(move |transition| dispatch(&listeners, transition));
            *slot = Some(machine);
        }

        info!(
            identity = %self.identity,
            graph = %self.graph.name(),
            "Reconciliation started"
        );
        self.sync().await
    }

    /// Drop the machine and every subscription and abort periodic syncs.
    /// Calling it again is a no-op.
    pub async fn stop(&self) {
        let mut slot = self.machine.lock().await;
        self.generation.fetch_add(1, Ordering::SeqCst);
        lock_listeners(&self.listeners).entries.clear();
        for task in self.periodic.lock().unwrap_or_else(PoisonError::into_inner).drain(..) {
            task.abort();
        }
        if slot.take().is_some() {
            info!(identity = %self.identity, "Reconciliation stopped");
        }
    }

    /// Pull the remote state and force the local machine onto it.
    ///
    /// Never reports anything back to the remote side.
    pub async fn sync(&self) -> Result<SyncOutcome<S, E>, ReconcileError> {
        let span = create_flow_span("reconcile.sync", self.identity.as_str(), &generate_correlation_id());
        self.run_sync().instrument(span).await
    }

    async fn run_sync(&self) -> Result<SyncOutcome<S, E>, ReconcileError> {
        let generation = self.running_generation().await?;
        let fetched = self.gateway.fetch_flow_state(&self.identity).await;

        let mut slot = self.machine.lock().await;
        let Some(machine) = self.live(&mut slot, generation) else {
            debug!(identity = %self.identity, "Discarding stale sync result");
            return Ok(SyncOutcome::Discarded);
        };

        let remote = match fetched {
            Ok(remote) => remote,
            Err(source) => {
                warn!(
                    identity = %self.identity,
                    local = %machine.current(),
                    error = %source,
                    "Could not fetch remote flow state; keeping local state"
                );
                return Err(ReconcileError::Divergence {
                    identity: self.identity.clone(),
                    source,
                });
            }
        };

        let local = machine.current();
        if local.name() == remote.state_name {
            machine.context_mut().last_remote = Some(remote);
            return Ok(SyncOutcome::InSync { state: local });
        }

        let Some(event) = S::from_name(&remote.state_name).and_then(event_named_after::<S, E>) else {
            warn!(
                identity = %self.identity,
                local = %local,
                remote = %remote.state_name,
                "Remote state has no local counterpart"
            );
            return Ok(SyncOutcome::Unmapped {
                remote: remote.state_name,
                state: local,
            });
        };

        info!(
            identity = %self.identity,
            local = %local,
            remote = %remote.state_name,
            "Forcing local state onto remote state"
        );
        let outcome = machine.send(Event::with_payload(event, remote.data.clone()));
        if outcome.is_transitioned() {
            machine.context_mut().last_remote = Some(remote);
        }
        Ok(SyncOutcome::Forced(outcome))
    }

    /// Report `new_state` to the remote side, then apply it locally.
    ///
    /// A state the local graph cannot reach from the current one is refused
    /// before anything is reported. If the remote refuses, the error event is
    /// sent instead and the reason is kept in the context.
    pub async fn transition(
        &self,
        new_state: S,
        data: serde_json::Value,
    ) -> Result<ReportOutcome<S, E>, ReconcileError> {
        let span = create_flow_span(
            "reconcile.transition",
            self.identity.as_str(),
            &generate_correlation_id(),
        );
        self.run_transition(new_state, data).instrument(span).await
    }

    async fn run_transition(
        &self,
        new_state: S,
        data: serde_json::Value,
    ) -> Result<ReportOutcome<S, E>, ReconcileError> {
        let event: E = event_named_after(new_state).ok_or(ReconcileError::NoEventForState {
            state: new_state.name(),
        })?;
        let generation = {
            let slot = self.machine.lock().await;
            let Some(machine) = slot.as_ref() else {
                return Err(ReconcileError::NotRunning {
                    identity: self.identity.clone(),
                });
            };
            let current = machine.current();
            if self.graph.transition(current, event).is_none() {
                return Err(ReconcileError::IllegalTransition {
                    from: current.name(),
                    to: new_state.name(),
                });
            }
            self.generation.load(Ordering::SeqCst)
        };

        let reported = self
            .gateway
            .report_flow_state(&self.identity, new_state.name(), data.clone())
            .await;

        let mut slot = self.machine.lock().await;
        let Some(machine) = self.live(&mut slot, generation) else {
            debug!(identity = %self.identity, "Discarding stale report result");
            return Ok(ReportOutcome::Discarded);
        };

        match reported {
            Ok(remote) => {
                let outcome = machine.send(Event::with_payload(event, data));
                let context = machine.context_mut();
                context.last_remote = Some(remote);
                context.error = None;
                Ok(ReportOutcome::Applied(outcome))
            }
            Err(error) => {
                let reason = error.to_string();
                warn!(
                    identity = %self.identity,
                    state = %new_state,
                    error = %reason,
                    "Remote refused flow state"
                );
                machine.context_mut().error = Some(reason.clone());
                let outcome = machine.send(self.error_event);
                Ok(ReportOutcome::RemoteFailed { reason, outcome })
            }
        }
    }

    /// Register a callback for every local transition, forced or reported.
    ///
    /// Callbacks may subscribe or unsubscribe, themselves included; a
    /// callback added during a dispatch first sees the next transition.
    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: FnMut(&Transition<S, E>) + Send + 'static,
    {
        let mut listeners = lock_listeners(&self.listeners);
        let id = SubscriptionId(listeners.next);
        listeners.next += 1;
        listeners.entries.push((id, Box::new(callback)));
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut listeners = lock_listeners(&self.listeners);
        let before = listeners.entries.len();
        listeners.entries.retain(|(sub, _)| *sub != id);
        if listeners.entries.len() != before {
            return true;
        }
        if listeners.in_flight.contains(&id) && !listeners.removed.contains(&id) {
            listeners.removed.push(id);
            return true;
        }
        false
    }

    pub async fn current(&self) -> Option<S> {
        self.machine.lock().await.as_ref().map(Machine::current)
    }

    pub async fn context(&self) -> Option<ReconciliationContext> {
        self.machine.lock().await.as_ref().map(|m| m.context().clone())
    }

    pub async fn history(&self) -> Vec<Transition<S, E>> {
        self.machine
            .lock()
            .await
            .as_ref()
            .map(|m| m.history().to_vec())
            .unwrap_or_default()
    }

    /// Sync every `period` in the background for the current run.
    ///
    /// The first sync runs one period from now; `start` already synced.
    /// `stop` aborts the task, and a later `start` needs a new one.
    pub fn spawn_periodic_sync(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let service = Arc::clone(self);
        let generation = self.generation.load(Ordering::SeqCst);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                ticker.tick().await;
                if service.generation.load(Ordering::SeqCst) != generation {
                    break;
                }
                match service.sync().await {
                    Err(ReconcileError::NotRunning { .. }) | Ok(SyncOutcome::Discarded) => break,
                    Ok(_) | Err(_) => {}
                }
            }

            debug!(identity = %service.identity, "Periodic sync finished");
        });

        let mut periodic = self.periodic.lock().unwrap_or_else(PoisonError::into_inner);
        periodic.retain(|task| !task.is_finished());
        periodic.push(handle.abort_handle());
        handle
    }

    async fn running_generation(&self) -> Result<u64, ReconcileError> {
        let slot = self.machine.lock().await;
        if slot.is_none() {
            return Err(ReconcileError::NotRunning {
                identity: self.identity.clone(),
            });
        }
        Ok(self.generation.load(Ordering::SeqCst))
    }

    /// The machine, unless the service stopped or restarted since `generation`
    fn live<'a>(
        &self,
        slot: &'a mut Option<Machine<S, E, ReconciliationContext>>,
        generation: u64,
    ) -> Option<&'a mut Machine<S, E, ReconciliationContext>> {
        if self.generation.load(Ordering::SeqCst) != generation {
            return None;
        }
        slot.as_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flows::graphs::{LoginEvent, LoginState};
    use crate::gateway::{GatewayError, InMemoryGateway, LoginResponse, MockFlowGateway, RemoteFlowState};
    use crate::machine::TransitionOutcome;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::AtomicBool;
    use tokio::sync::Notify;

    const ADA: &str = "ada@example.com";

    /// Mock whose fetch returns whatever `remote` holds; `None` fails
    fn scripted_fetch(mock: &mut MockFlowGateway, remote: Arc<StdMutex<Option<&'static str>>>) {
        mock.expect_fetch_flow_state().returning(move |_| {
            match *remote.lock().unwrap() {
                Some(name) => Ok(RemoteFlowState::new(name, json!({}))),
                None => Err(GatewayError::unavailable("connection refused")),
            }
        });
    }

    fn workflow_service(mock: MockFlowGateway) -> ReconciliationService<WorkflowState, WorkflowEvent> {
        ReconciliationService::workflow(FlowIdentity::from(ADA), Arc::new(mock)).unwrap()
    }

    /// Gateway whose next fetch can be held until the test releases it
    #[derive(Default)]
    struct GatedGateway {
        remote: StdMutex<String>,
        hold_next: AtomicBool,
        entered: Notify,
        release: Notify,
    }

    impl GatedGateway {
        fn new(remote: &str) -> Self {
            let gateway = Self::default();
            gateway.set_remote(remote);
            gateway
        }

        fn set_remote(&self, remote: &str) {
            *self.remote.lock().unwrap() = remote.to_string();
        }

        fn hold_next_fetch(&self) {
            self.hold_next.store(true, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl FlowGateway for GatedGateway {
        async fn register(&self, _: &str, _: &str, _: &str) -> Result<(), GatewayError> {
            Err(GatewayError::rejected("unsupported"))
        }

        async fn login(&self, _: &str, _: &str) -> Result<LoginResponse, GatewayError> {
            Err(GatewayError::rejected("unsupported"))
        }

        async fn submit_second_factor(&self, _: &str) -> Result<(), GatewayError> {
            Err(GatewayError::rejected("unsupported"))
        }

        async fn verify_email(&self, _: &str) -> Result<(), GatewayError> {
            Err(GatewayError::rejected("unsupported"))
        }

        async fn fetch_flow_state(&self, _: &FlowIdentity) -> Result<RemoteFlowState, GatewayError> {
            let state_name = self.remote.lock().unwrap().clone();
            if self.hold_next.swap(false, Ordering::SeqCst) {
                self.entered.notify_one();
                self.release.notified().await;
            }
            Ok(RemoteFlowState::new(state_name, json!({})))
        }

        async fn report_flow_state(
            &self,
            _: &FlowIdentity,
            state_name: &str,
            data: serde_json::Value,
        ) -> Result<RemoteFlowState, GatewayError> {
            self.set_remote(state_name);
            Ok(RemoteFlowState::new(state_name, data))
        }
    }

    #[tokio::test]
    async fn test_sync_forces_remote_state_without_reporting() {
        let remote = Arc::new(StdMutex::new(Some("login")));
        let mut mock = MockFlowGateway::new();
        scripted_fetch(&mut mock, remote.clone());
        mock.expect_report_flow_state().times(0);

        let service = workflow_service(mock);
        let outcome = service.start().await.unwrap();
        assert_eq!(outcome_state(&outcome), Some(WorkflowState::Login));

        *remote.lock().unwrap() = Some("completed");
        let outcome = service.sync().await.unwrap();

        match outcome {
            SyncOutcome::Forced(TransitionOutcome::Transitioned(transition)) => {
                assert_eq!(transition.from, WorkflowState::Login);
                assert_eq!(transition.to, WorkflowState::Completed);
                assert_eq!(transition.event, WorkflowEvent::Completed);
            }
            other => panic!("expected a forced transition, got {:?}", other),
        }
        assert_eq!(service.current().await, Some(WorkflowState::Completed));
    }

    #[tokio::test]
    async fn test_matching_states_are_in_sync() {
        let mut mock = MockFlowGateway::new();
        scripted_fetch(&mut mock, Arc::new(StdMutex::new(Some("initial"))));

        let service = workflow_service(mock);
        let outcome = service.start().await.unwrap();

        assert_eq!(outcome, SyncOutcome::InSync { state: WorkflowState::Initial });
        let context = service.context().await.unwrap();
        assert_eq!(context.last_remote.map(|r| r.state_name).as_deref(), Some("initial"));
        assert!(service.history().await.is_empty());
    }

    #[tokio::test]
    async fn test_remote_write_failure_moves_to_error() {
        let mut mock = MockFlowGateway::new();
        scripted_fetch(&mut mock, Arc::new(StdMutex::new(Some("login"))));
        mock.expect_report_flow_state()
            .times(1)
            .returning(|_, _, _| Err(GatewayError::unavailable("timeout")));

        let service = workflow_service(mock);
        service.start().await.unwrap();

        let outcome = service
            .transition(WorkflowState::Completed, json!({"step": "done"}))
            .await
            .unwrap();

        match outcome {
            ReportOutcome::RemoteFailed { reason, outcome } => {
                assert_eq!(reason, "Remote service unavailable: timeout");
                assert_eq!(outcome.state(), WorkflowState::Error);
            }
            other => panic!("expected remote failure, got {:?}", other),
        }
        let context = service.context().await.unwrap();
        assert_eq!(context.error.as_deref(), Some("Remote service unavailable: timeout"));
    }

    #[tokio::test]
    async fn test_fetch_failure_keeps_local_state() {
        let remote = Arc::new(StdMutex::new(Some("registration")));
        let mut mock = MockFlowGateway::new();
        scripted_fetch(&mut mock, remote.clone());

        let service = workflow_service(mock);
        service.start().await.unwrap();
        let history_before = service.history().await.len();

        *remote.lock().unwrap() = None;
        let err = service.sync().await.unwrap_err();

        assert!(matches!(err, ReconcileError::Divergence { .. }));
        assert_eq!(service.current().await, Some(WorkflowState::Registration));
        assert_eq!(service.history().await.len(), history_before);
    }

    #[tokio::test]
    async fn test_unknown_remote_state_is_unmapped() {
        let mut mock = MockFlowGateway::new();
        scripted_fetch(&mut mock, Arc::new(StdMutex::new(Some("archived"))));

        let service = workflow_service(mock);
        let outcome = service.start().await.unwrap();

        assert_eq!(
            outcome,
            SyncOutcome::Unmapped {
                remote: "archived".to_string(),
                state: WorkflowState::Initial,
            }
        );
    }

    #[tokio::test]
    async fn test_terminal_local_state_rejects_forced_event() {
        let remote = Arc::new(StdMutex::new(Some("completed")));
        let mut mock = MockFlowGateway::new();
        scripted_fetch(&mut mock, remote.clone());

        let service = workflow_service(mock);
        service.start().await.unwrap();

        *remote.lock().unwrap() = Some("login");
        let outcome = service.sync().await.unwrap();

        assert_eq!(
            outcome,
            SyncOutcome::Forced(TransitionOutcome::Rejected {
                state: WorkflowState::Completed,
                event: WorkflowEvent::Login,
            })
        );
    }

    #[tokio::test]
    async fn test_state_without_named_event_is_refused_before_reporting() {
        let mut mock = MockFlowGateway::new();
        scripted_fetch(&mut mock, Arc::new(StdMutex::new(Some("idle"))));
        mock.expect_report_flow_state().times(0);

        let service = ReconciliationService::new(
            FlowIdentity::from(ADA),
            Arc::new(graphs::login().unwrap()),
            LoginEvent::AuthFailed,
            Arc::new(mock),
        );
        service.start().await.unwrap();

        let err = service.transition(LoginState::FormInput, json!({})).await.unwrap_err();
        assert_eq!(err, ReconcileError::NoEventForState { state: "formInput" });
    }

    #[tokio::test]
    async fn test_lifecycle_misuse() {
        let mut mock = MockFlowGateway::new();
        scripted_fetch(&mut mock, Arc::new(StdMutex::new(Some("initial"))));
        mock.expect_report_flow_state().times(0);

        let service = workflow_service(mock);
        assert!(matches!(service.sync().await, Err(ReconcileError::NotRunning { .. })));

        service.start().await.unwrap();
        assert!(matches!(service.start().await, Err(ReconcileError::AlreadyRunning { .. })));

        service.stop().await;
        service.stop().await;
        assert!(!service.is_running().await);
        assert_eq!(service.current().await, None);
        assert!(matches!(
            service.transition(WorkflowState::Login, json!({})).await,
            Err(ReconcileError::NotRunning { .. })
        ));
    }

    #[tokio::test]
    async fn test_subscribers_see_forced_transitions_until_stop() {
        let remote = Arc::new(StdMutex::new(Some("login")));
        let mut mock = MockFlowGateway::new();
        scripted_fetch(&mut mock, remote.clone());

        let service = workflow_service(mock);
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = seen.clone();
        service.subscribe(move |t| sink.lock().unwrap().push(t.to));

        service.start().await.unwrap();
        service.stop().await;

        *remote.lock().unwrap() = Some("completed");
        service.start().await.unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![WorkflowState::Login]);
    }

    #[tokio::test]
    async fn test_sync_resolving_after_stop_is_discarded() {
        let gateway = Arc::new(GatedGateway::new("login"));
        let service = Arc::new(ReconciliationService::workflow(FlowIdentity::from(ADA), gateway.clone()).unwrap());
        service.start().await.unwrap();

        gateway.set_remote("completed");
        gateway.hold_next_fetch();
        let in_flight = tokio::spawn({
            let service = Arc::clone(&service);
            async move { service.sync().await }
        });
        gateway.entered.notified().await;

        service.stop().await;
        gateway.release.notify_one();

        assert_eq!(in_flight.await.unwrap().unwrap(), SyncOutcome::Discarded);
        assert_eq!(service.current().await, None);
    }

    #[tokio::test]
    async fn test_sync_resolving_after_restart_is_discarded() {
        let gateway = Arc::new(GatedGateway::new("login"));
        let service = Arc::new(ReconciliationService::workflow(FlowIdentity::from(ADA), gateway.clone()).unwrap());
        service.start().await.unwrap();

        gateway.hold_next_fetch();
        let in_flight = tokio::spawn({
            let service = Arc::clone(&service);
            async move { service.sync().await }
        });
        gateway.entered.notified().await;

        service.stop().await;
        gateway.set_remote("registration");
        service.start().await.unwrap();
        gateway.release.notify_one();

        assert_eq!(in_flight.await.unwrap().unwrap(), SyncOutcome::Discarded);
        assert_eq!(service.current().await, Some(WorkflowState::Registration));
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_sync_follows_remote_until_stopped() {
        let identity = FlowIdentity::from(ADA);
        let gateway = Arc::new(InMemoryGateway::new().with_flow_state(ADA, "initial", json!({})));
        let service = Arc::new(ReconciliationService::workflow(identity.clone(), gateway.clone()).unwrap());
        service.start().await.unwrap();

        let handle = service.spawn_periodic_sync(Duration::from_secs(5));
        gateway.report_flow_state(&identity, "login", json!({})).await.unwrap();

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(service.current().await, Some(WorkflowState::Login));

        service.stop().await;
        let joined = tokio::time::timeout(Duration::from_secs(30), handle)
            .await
            .expect("periodic sync should end after stop");
        assert!(joined.unwrap_err().is_cancelled());
    }

    #[tokio::test]
    async fn test_callback_can_unsubscribe_itself() {
        let remote = Arc::new(StdMutex::new(Some("login")));
        let mut mock = MockFlowGateway::new();
        scripted_fetch(&mut mock, remote.clone());

        let service = Arc::new(workflow_service(mock));
        let own_id = Arc::new(StdMutex::new(None::<SubscriptionId>));
        let calls = Arc::new(StdMutex::new(Vec::new()));

        let id = service.subscribe({
            let service = Arc::downgrade(&service);
            let own_id = own_id.clone();
            let calls = calls.clone();
            move |t| {
                let id = (*own_id.lock().unwrap()).expect("id is set before start");
                let removed = service.upgrade().map(|service| service.unsubscribe(id));
                calls.lock().unwrap().push((t.to, removed));
            }
        });
        *own_id.lock().unwrap() = Some(id);

        service.start().await.unwrap();
        *remote.lock().unwrap() = Some("completed");
        service.sync().await.unwrap();

        assert_eq!(*calls.lock().unwrap(), vec![(WorkflowState::Login, Some(true))]);
        assert!(!service.unsubscribe(id));
        assert_eq!(service.current().await, Some(WorkflowState::Completed));
    }

    #[tokio::test]
    async fn test_callback_can_subscribe_another() {
        let remote = Arc::new(StdMutex::new(Some("login")));
        let mut mock = MockFlowGateway::new();
        scripted_fetch(&mut mock, remote.clone());

        let service = Arc::new(workflow_service(mock));
        let late = Arc::new(StdMutex::new(Vec::new()));
        service.subscribe({
            let service = Arc::downgrade(&service);
            let late = late.clone();
            let mut added = false;
            move |_| {
                if added {
                    return;
                }
                added = true;
                let late = late.clone();
                if let Some(service) = service.upgrade() {
                    service.subscribe(move |t| late.lock().unwrap().push(t.to));
                }
            }
        });

        service.start().await.unwrap();
        assert!(late.lock().unwrap().is_empty());

        *remote.lock().unwrap() = Some("completed");
        service.sync().await.unwrap();
        assert_eq!(*late.lock().unwrap(), vec![WorkflowState::Completed]);
    }

    #[tokio::test]
    async fn test_unreachable_state_is_refused_before_reporting() {
        let remote = Arc::new(StdMutex::new(Some("completed")));
        let mut mock = MockFlowGateway::new();
        scripted_fetch(&mut mock, remote.clone());
        mock.expect_report_flow_state().times(0);

        let service = workflow_service(mock);
        service.start().await.unwrap();

        let err = service.transition(WorkflowState::Login, json!({})).await.unwrap_err();
        assert_eq!(
            err,
            ReconcileError::IllegalTransition {
                from: "completed",
                to: "login",
            }
        );
        assert_eq!(service.current().await, Some(WorkflowState::Completed));
        assert_eq!(service.context().await.unwrap().error, None);
    }

    #[tokio::test]
    async fn test_transition_to_current_state_is_refused() {
        let mut mock = MockFlowGateway::new();
        scripted_fetch(&mut mock, Arc::new(StdMutex::new(Some("login"))));
        mock.expect_report_flow_state().times(0);

        let service = workflow_service(mock);
        service.start().await.unwrap();

        let err = service.transition(WorkflowState::Login, json!({})).await.unwrap_err();
        assert_eq!(err.to_string(), "No transition from login to login");
        assert_eq!(service.history().await.len(), 1);
    }

    fn outcome_state(outcome: &SyncOutcome<WorkflowState, WorkflowEvent>) -> Option<WorkflowState> {
        match outcome {
            SyncOutcome::InSync { state } | SyncOutcome::Unmapped { state, .. } => Some(*state),
            SyncOutcome::Forced(outcome) => Some(outcome.state()),
            SyncOutcome::Discarded => None,
        }
    }
}
