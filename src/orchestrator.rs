use crate::config::AppConfig;
use crate::controller_client::{ControllerClient, InitResponse, ResetFlags, UpdateFlags};
use crate::error::MaintenanceError;
use crate::events::{MaintenanceEvent, ProgressUpdate};
use crate::poller::{PollOutcome, ProgressPoller};
use crate::reconnect::{ReconnectOutcome, ReconnectSupervisor};
use crate::services::backup::{BackupArchive, BackupTransferManager};
use crate::services::overlay::{OverlayManager, OverlayState};
use log::{info, warn};
use serde::Serialize;
use std::{sync::Arc, time::Duration};
use tokio::sync::mpsc::{UnboundedReceiver, unbounded_channel};

/// The three reboot-spanning maintenance operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum OperationKind {
    SystemUpdate,
    FactoryReset,
    BackupRestore,
}

/// Lifecycle phase of a maintenance operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum Phase {
    Idle,
    Requested,
    /// A system update is blocked on the filesystem overlay.
    PreconditionCheck,
    Running,
    /// The controller accepted the operation and will go down for a reboot.
    RebootPending,
    /// Probing for the controller to come back after the reboot.
    Reconnecting,
    Completed,
    Failed,
}

impl Phase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Completed | Phase::Failed)
    }
}

/// An operation as requested by the operator.
#[derive(Clone, Debug, PartialEq)]
pub enum OperationRequest {
    SystemUpdate(UpdateFlags),
    FactoryReset(ResetFlags),
    BackupRestore { filename: String, data: Vec<u8> },
}

impl OperationRequest {
    pub fn kind(&self) -> OperationKind {
        match self {
            OperationRequest::SystemUpdate(_) => OperationKind::SystemUpdate,
            OperationRequest::FactoryReset(_) => OperationKind::FactoryReset,
            OperationRequest::BackupRestore { .. } => OperationKind::BackupRestore,
        }
    }

    pub fn flags(&self) -> OperationFlags {
        match self {
            OperationRequest::SystemUpdate(flags) => OperationFlags::Update(*flags),
            OperationRequest::FactoryReset(flags) => OperationFlags::Reset(*flags),
            OperationRequest::BackupRestore { .. } => OperationFlags::Restore,
        }
    }
}

/// Parameters an operation was started with, kept on the session for the
/// lifetime of the operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum OperationFlags {
    Update(UpdateFlags),
    Reset(ResetFlags),
    Restore,
}

/// The single active operation. At most one exists at a time; a new request
/// is refused until the current one reaches a terminal phase.
#[derive(Clone, Debug)]
struct OperationSession {
    kind: OperationKind,
    phase: Phase,
    flags: OperationFlags,
    /// Highest progress marker seen so far. Poll responses can shrink when
    /// the kernel ring buffer wraps; the displayed value never goes back.
    progress_marker: u32,
    causes_reboot: bool,
}

impl OperationSession {
    fn new(kind: OperationKind, flags: OperationFlags) -> Self {
        OperationSession {
            kind,
            phase: Phase::Idle,
            flags,
            progress_marker: 0,
            causes_reboot: false,
        }
    }
}

/// Device state captured from the most recent handshake. Replaced wholesale
/// on every handshake, never merged.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct DeviceSnapshot {
    pub candle_version: Option<String>,
    pub candle_original_version: Option<String>,
    pub update_in_progress: bool,
    pub files_check_available: bool,
    pub needs_two_reboots: bool,
    pub hardware_clock_present: bool,
    pub live_update_attempted: bool,
    pub bootup_actions_failed: bool,
    pub post_bootup_actions_supported: bool,
}

impl From<&InitResponse> for DeviceSnapshot {
    fn from(init: &InitResponse) -> Self {
        DeviceSnapshot {
            candle_version: init.candle_version.clone(),
            candle_original_version: init.candle_original_version.clone(),
            update_in_progress: init.system_update_in_progress,
            files_check_available: init.files_check_exists,
            needs_two_reboots: init.update_needs_two_reboots,
            hardware_clock_present: init.hardware_clock_detected,
            live_update_attempted: init.live_update_attempted,
            bootup_actions_failed: init.bootup_actions_failed,
            post_bootup_actions_supported: init.post_bootup_actions_supported,
        }
    }
}

/// Timing knobs for the poll and reconnect loops.
#[derive(Clone, Copy, Debug)]
pub struct OrchestratorOptions {
    pub poll_interval: Duration,
    pub poll_failure_cap: Option<u32>,
    pub reconnect_delay: Duration,
    pub reconnect_attempt_cap: Option<u32>,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        OrchestratorOptions {
            poll_interval: Duration::from_secs(10),
            poll_failure_cap: None,
            reconnect_delay: Duration::from_secs(5),
            reconnect_attempt_cap: None,
        }
    }
}

impl OrchestratorOptions {
    pub fn from_config() -> Self {
        let config = AppConfig::get();
        OrchestratorOptions {
            poll_interval: config.poller.interval,
            poll_failure_cap: config.poller.failure_cap,
            reconnect_delay: config.reconnect.delay,
            reconnect_attempt_cap: config.reconnect.attempt_cap,
        }
    }
}

/// Drives reboot-spanning maintenance operations against the controller.
///
/// Owns the single operation session, the overlay classification, and the
/// device snapshot. Progress polling and post-reboot reconnection run as
/// background tasks; their outcomes are applied in receipt order through
/// [`MaintenanceOrchestrator::tick`]. All presentation happens elsewhere,
/// via the event stream returned by [`MaintenanceOrchestrator::new`].
pub struct MaintenanceOrchestrator<C> {
    client: Arc<C>,
    session: Option<OperationSession>,
    overlay: OverlayState,
    snapshot: Option<DeviceSnapshot>,
    events: tokio::sync::mpsc::UnboundedSender<MaintenanceEvent>,
    poller: ProgressPoller<C>,
    poll_rx: UnboundedReceiver<PollOutcome>,
    reconnect: ReconnectSupervisor<C>,
    reconnect_rx: UnboundedReceiver<ReconnectOutcome>,
}

impl<C> MaintenanceOrchestrator<C>
where
    C: ControllerClient + Send + Sync + 'static,
{
    pub fn new(
        client: C,
        options: OrchestratorOptions,
    ) -> (Self, UnboundedReceiver<MaintenanceEvent>) {
        let client = Arc::new(client);
        let (events, events_rx) = unbounded_channel();
        let (poll_tx, poll_rx) = unbounded_channel();
        let (reconnect_tx, reconnect_rx) = unbounded_channel();

        let poller = ProgressPoller::new(
            client.clone(),
            options.poll_interval,
            options.poll_failure_cap,
            poll_tx,
        );
        let reconnect = ReconnectSupervisor::new(
            client.clone(),
            options.reconnect_delay,
            options.reconnect_attempt_cap,
            reconnect_tx,
        );

        let orchestrator = MaintenanceOrchestrator {
            client,
            session: None,
            overlay: OverlayState::default(),
            snapshot: None,
            events,
            poller,
            poll_rx,
            reconnect,
            reconnect_rx,
        };
        (orchestrator, events_rx)
    }

    pub fn phase(&self) -> Phase {
        self.session
            .as_ref()
            .map_or(Phase::Idle, |session| session.phase)
    }

    pub fn active_operation(&self) -> Option<OperationKind> {
        self.session.as_ref().map(|session| session.kind)
    }

    /// Flags the active operation was started with, if one exists.
    pub fn active_flags(&self) -> Option<OperationFlags> {
        self.session.as_ref().map(|session| session.flags)
    }

    pub fn overlay(&self) -> OverlayState {
        self.overlay
    }

    pub fn snapshot(&self) -> Option<&DeviceSnapshot> {
        self.snapshot.as_ref()
    }

    /// Handshake with the controller, replacing the device snapshot and the
    /// overlay classification with what it reports now.
    pub async fn handshake(&mut self) -> Result<DeviceSnapshot, MaintenanceError> {
        let init = self
            .client
            .init()
            .await
            .map_err(MaintenanceError::ConnectionFailure)?;

        self.overlay = OverlayManager::classify(init.ro_exists, init.old_overlay_active);
        let snapshot = DeviceSnapshot::from(&init);
        self.snapshot = Some(snapshot.clone());

        self.emit(MaintenanceEvent::OverlayChanged(self.overlay));
        self.emit(MaintenanceEvent::SnapshotRefreshed(snapshot.clone()));
        Ok(snapshot)
    }

    /// Start a maintenance operation. Refused while another operation is
    /// still in a non-terminal phase.
    pub async fn start_operation(
        &mut self,
        request: OperationRequest,
    ) -> Result<(), MaintenanceError> {
        if self
            .session
            .as_ref()
            .is_some_and(|session| !session.phase.is_terminal())
        {
            return Err(MaintenanceError::OperationInProgress);
        }

        info!("starting maintenance operation: {:?}", request.kind());
        self.session = Some(OperationSession::new(request.kind(), request.flags()));
        self.transition(Phase::Requested);

        match request {
            OperationRequest::SystemUpdate(flags) => {
                if OverlayManager::update_allowed(self.overlay) {
                    self.begin_update(flags).await
                } else {
                    // The overlay must be disabled and the device rebooted
                    // before an update can run.
                    self.transition(Phase::PreconditionCheck);
                    Ok(())
                }
            }
            OperationRequest::FactoryReset(flags) => self.begin_reset(flags).await,
            OperationRequest::BackupRestore { filename, data } => {
                self.begin_restore(&filename, data).await
            }
        }
    }

    /// Disable the overlay for an update session that is blocked on it,
    /// then reboot so the change takes effect. The update itself has to be
    /// requested again once the device is back without the overlay.
    pub async fn disable_overlay(&mut self) -> Result<(), MaintenanceError> {
        if self.phase() != Phase::PreconditionCheck {
            return Err(MaintenanceError::PreconditionFailed);
        }

        match OverlayManager::request_disable(self.client.as_ref()).await {
            Ok(()) => {
                if let Some(session) = self.session.as_mut() {
                    session.causes_reboot = true;
                }
                if let Err(e) = self.client.restart_system().await {
                    warn!("restart request after overlay disable failed: {e:#}");
                }
                self.transition(Phase::RebootPending);
                self.reconnect.arm();
                Ok(())
            }
            Err(e) => {
                self.emit(MaintenanceEvent::Message(
                    "the overlay could not be disabled".to_string(),
                ));
                self.emit(MaintenanceEvent::Rollback);
                self.transition(Phase::Failed);
                self.session = None;
                Err(e)
            }
        }
    }

    /// Reboot the controller outside of any operation and track its return.
    pub async fn restart_controller(&mut self) -> Result<(), MaintenanceError> {
        self.client
            .restart_system()
            .await
            .map_err(MaintenanceError::ConnectionFailure)?;
        self.emit(MaintenanceEvent::Message(
            "restarting the controller".to_string(),
        ));
        self.reconnect.arm();
        Ok(())
    }

    async fn begin_update(&mut self, flags: UpdateFlags) -> Result<(), MaintenanceError> {
        match self.client.start_system_update(flags).await {
            Ok(response) if response.state.is_ok() => {
                if response.live_update {
                    self.emit(MaintenanceEvent::Message(
                        "attempting a live update".to_string(),
                    ));
                }
                if let Some(session) = self.session.as_mut() {
                    session.causes_reboot = true;
                }
                self.transition(Phase::Running);
                self.poller.start();
                Ok(())
            }
            Ok(_) => {
                warn!("controller rejected the system update request");
                self.emit(MaintenanceEvent::Rollback);
                self.transition(Phase::Failed);
                self.session = None;
                Err(MaintenanceError::RejectedByController {
                    action: "start_system_update",
                })
            }
            Err(e) => {
                self.session = None;
                self.emit(MaintenanceEvent::Message(
                    "could not reach the controller".to_string(),
                ));
                Err(MaintenanceError::ConnectionFailure(e))
            }
        }
    }

    async fn begin_reset(&mut self, flags: ResetFlags) -> Result<(), MaintenanceError> {
        match self.client.factory_reset(flags).await {
            Ok(response) if response.state.is_ok() => {
                if let Some(session) = self.session.as_mut() {
                    session.causes_reboot = true;
                }
                // The reset is applied during the next boot.
                if let Err(e) = self.client.restart_system().await {
                    warn!("restart request after factory reset failed: {e:#}");
                }
                self.transition(Phase::RebootPending);
                self.reconnect.arm();
                Ok(())
            }
            Ok(_) => {
                warn!("controller rejected the factory reset request");
                self.emit(MaintenanceEvent::Rollback);
                self.transition(Phase::Failed);
                self.session = None;
                Err(MaintenanceError::RejectedByController { action: "reset" })
            }
            Err(e) => {
                self.session = None;
                self.emit(MaintenanceEvent::Message(
                    "could not reach the controller".to_string(),
                ));
                Err(MaintenanceError::ConnectionFailure(e))
            }
        }
    }

    async fn begin_restore(
        &mut self,
        filename: &str,
        data: Vec<u8>,
    ) -> Result<(), MaintenanceError> {
        self.transition(Phase::Running);

        let archive = BackupArchive::new(filename, data);
        match BackupTransferManager::restore(self.client.as_ref(), archive).await {
            Ok(()) => {
                // The archive is unpacked on the next boot; the operator
                // decides when that happens.
                self.emit(MaintenanceEvent::RebootRequired);
                self.transition(Phase::Completed);
                self.session = None;
                Ok(())
            }
            Err(e) if e.is_retryable() => {
                self.session = None;
                self.emit(MaintenanceEvent::Message(
                    "could not reach the controller".to_string(),
                ));
                Err(e)
            }
            Err(e) => {
                self.emit(MaintenanceEvent::Rollback);
                self.transition(Phase::Failed);
                self.session = None;
                Err(e)
            }
        }
    }

    /// Apply one background-task outcome. Returns once something was
    /// applied; pending outcomes are handled strictly in receipt order.
    pub async fn tick(&mut self) {
        enum Pending {
            Poll(PollOutcome),
            Reconnect(ReconnectOutcome),
        }

        let pending = tokio::select! {
            Some(outcome) = self.poll_rx.recv() => Pending::Poll(outcome),
            Some(outcome) = self.reconnect_rx.recv() => Pending::Reconnect(outcome),
        };
        match pending {
            Pending::Poll(outcome) => self.apply_poll(outcome).await,
            Pending::Reconnect(outcome) => self.apply_reconnect(outcome),
        }
    }

    pub async fn run(&mut self) {
        loop {
            self.tick().await;
        }
    }

    async fn apply_poll(&mut self, outcome: PollOutcome) {
        match outcome {
            PollOutcome::Observed(observation) => {
                let overlay = OverlayManager::classify(
                    observation.ro_exists,
                    observation.old_overlay_active,
                );
                if overlay != self.overlay {
                    self.overlay = overlay;
                    self.emit(MaintenanceEvent::OverlayChanged(overlay));
                }
                // On disagreement the poll response wins, it is fresher.
                if let Some(snapshot) = self.snapshot.as_mut() {
                    snapshot.update_in_progress = observation.still_in_progress;
                }

                let Some(session) = self.session.as_mut() else {
                    return;
                };
                session.progress_marker = session.progress_marker.max(observation.marker);
                let marker = session.progress_marker;
                let causes_reboot = session.causes_reboot;

                self.emit(MaintenanceEvent::Progress(ProgressUpdate {
                    text: observation.dmesg,
                    marker,
                    in_progress: observation.still_in_progress,
                }));

                if !observation.still_in_progress {
                    self.poller.stop();
                    if causes_reboot {
                        // The applied image only takes effect after a reboot.
                        if let Err(e) = self.client.restart_system().await {
                            warn!("restart request after the update failed: {e:#}");
                        }
                        self.transition(Phase::RebootPending);
                        self.reconnect.arm();
                    } else {
                        self.transition(Phase::Completed);
                        self.session = None;
                    }
                }
            }
            PollOutcome::Exhausted { failures } => {
                self.poller.stop();
                self.emit(MaintenanceEvent::Message(format!(
                    "lost contact with the controller after {failures} poll attempts"
                )));
                self.transition(Phase::Failed);
                self.session = None;
            }
        }
    }

    fn apply_reconnect(&mut self, outcome: ReconnectOutcome) {
        match outcome {
            ReconnectOutcome::Reconnected { attempts } => {
                self.reconnect.disarm();
                self.emit(MaintenanceEvent::Message(format!(
                    "controller is back after {attempts} attempts"
                )));
                if self.session.is_some() {
                    self.transition(Phase::Reconnecting);
                    self.transition(Phase::Completed);
                    self.session = None;
                }
                self.emit(MaintenanceEvent::NavigateHome);
            }
            ReconnectOutcome::GaveUp { attempts } => {
                self.reconnect.disarm();
                self.emit(MaintenanceEvent::Message(format!(
                    "controller did not come back after {attempts} attempts"
                )));
                self.transition(Phase::Failed);
                self.session = None;
            }
        }
    }

    fn transition(&mut self, phase: Phase) {
        let Some(kind) = self.session.as_ref().map(|session| session.kind) else {
            return;
        };
        if let Some(session) = self.session.as_mut() {
            session.phase = phase;
        }
        self.emit(MaintenanceEvent::PhaseChanged { kind, phase });
    }

    fn emit(&self, event: MaintenanceEvent) {
        // A dropped receiver only means nobody is rendering.
        if self.events.send(event).is_err() {
            log::debug!("event receiver dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller_client::{
        AckState, MockControllerClient, StartUpdateResponse, StateResponse,
    };
    use crate::poller::PollObservation;

    fn ok_state() -> StateResponse {
        StateResponse {
            state: AckState::Text("ok".to_string()),
        }
    }

    fn accepted_update() -> StartUpdateResponse {
        StartUpdateResponse {
            state: AckState::Flag(true),
            live_update: false,
        }
    }

    fn drain(rx: &mut UnboundedReceiver<MaintenanceEvent>) -> Vec<MaintenanceEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn observation(marker: u32, still_in_progress: bool) -> PollOutcome {
        PollOutcome::Observed(PollObservation {
            dmesg: "log".to_string(),
            marker,
            still_in_progress,
            ro_exists: false,
            old_overlay_active: false,
        })
    }

    #[tokio::test]
    async fn accepted_update_starts_polling() {
        let mut client = MockControllerClient::new();
        client
            .expect_start_system_update()
            .returning(|_| Box::pin(std::future::ready(Ok(accepted_update()))));

        let (mut orchestrator, mut events) =
            MaintenanceOrchestrator::new(client, OrchestratorOptions::default());

        orchestrator
            .start_operation(OperationRequest::SystemUpdate(UpdateFlags::default()))
            .await
            .expect("update should start");

        assert_eq!(orchestrator.phase(), Phase::Running);
        assert!(orchestrator.poller.is_running());
        assert!(drain(&mut events).contains(&MaintenanceEvent::PhaseChanged {
            kind: OperationKind::SystemUpdate,
            phase: Phase::Running,
        }));
    }

    #[tokio::test]
    async fn second_operation_is_refused_while_one_runs() {
        let mut client = MockControllerClient::new();
        client
            .expect_start_system_update()
            .times(1)
            .returning(|_| Box::pin(std::future::ready(Ok(accepted_update()))));

        let (mut orchestrator, _events) =
            MaintenanceOrchestrator::new(client, OrchestratorOptions::default());

        orchestrator
            .start_operation(OperationRequest::SystemUpdate(UpdateFlags::default()))
            .await
            .expect("first update should start");

        let reset = orchestrator
            .start_operation(OperationRequest::FactoryReset(ResetFlags::default()))
            .await;
        assert!(matches!(reset, Err(MaintenanceError::OperationInProgress)));

        let restore = orchestrator
            .start_operation(OperationRequest::BackupRestore {
                filename: "a.tar".to_string(),
                data: vec![1],
            })
            .await;
        assert!(matches!(restore, Err(MaintenanceError::OperationInProgress)));

        let update = orchestrator
            .start_operation(OperationRequest::SystemUpdate(UpdateFlags::default()))
            .await;
        assert!(matches!(update, Err(MaintenanceError::OperationInProgress)));
        assert_eq!(orchestrator.active_operation(), Some(OperationKind::SystemUpdate));
    }

    #[tokio::test]
    async fn update_with_overlay_waits_for_the_precondition() {
        let mut client = MockControllerClient::new();
        // No start_system_update expectation: it must not be called.
        client.expect_init().returning(|| {
            Box::pin(std::future::ready(Ok(InitResponse {
                ro_exists: true,
                ..Default::default()
            })))
        });

        let (mut orchestrator, _events) =
            MaintenanceOrchestrator::new(client, OrchestratorOptions::default());
        orchestrator.handshake().await.expect("handshake");
        assert!(orchestrator.overlay().present);

        orchestrator
            .start_operation(OperationRequest::SystemUpdate(UpdateFlags::default()))
            .await
            .expect("request should be accepted");
        assert_eq!(orchestrator.phase(), Phase::PreconditionCheck);
    }

    #[tokio::test]
    async fn overlay_disable_schedules_a_reboot() {
        let mut client = MockControllerClient::new();
        client.expect_init().returning(|| {
            Box::pin(std::future::ready(Ok(InitResponse {
                old_overlay_active: true,
                ..Default::default()
            })))
        });
        client.expect_disable_overlay().returning(|| Box::pin(std::future::ready(Ok(ok_state()))));
        client.expect_restart_system().times(1).returning(|| Box::pin(std::future::ready(Ok(()))));

        let (mut orchestrator, _events) =
            MaintenanceOrchestrator::new(client, OrchestratorOptions::default());
        orchestrator.handshake().await.expect("handshake");
        orchestrator
            .start_operation(OperationRequest::SystemUpdate(UpdateFlags::default()))
            .await
            .expect("request accepted");

        orchestrator.disable_overlay().await.expect("disable");
        assert_eq!(orchestrator.phase(), Phase::RebootPending);
        assert!(orchestrator.reconnect.is_armed());
    }

    #[tokio::test]
    async fn rejected_update_rolls_back() {
        let mut client = MockControllerClient::new();
        client
            .expect_start_system_update()
            .returning(|_| Box::pin(std::future::ready(Ok(StartUpdateResponse::default()))));

        let (mut orchestrator, mut events) =
            MaintenanceOrchestrator::new(client, OrchestratorOptions::default());

        let result = orchestrator
            .start_operation(OperationRequest::SystemUpdate(UpdateFlags::default()))
            .await;
        assert!(matches!(
            result,
            Err(MaintenanceError::RejectedByController {
                action: "start_system_update"
            })
        ));
        assert_eq!(orchestrator.phase(), Phase::Idle);
        assert!(drain(&mut events).contains(&MaintenanceEvent::Rollback));
    }

    #[tokio::test]
    async fn unreachable_controller_leaves_the_orchestrator_idle() {
        let mut client = MockControllerClient::new();
        client
            .expect_start_system_update()
            .returning(|_| Box::pin(std::future::ready(Err(anyhow::anyhow!("timeout")))));

        let (mut orchestrator, _events) =
            MaintenanceOrchestrator::new(client, OrchestratorOptions::default());

        let result = orchestrator
            .start_operation(OperationRequest::SystemUpdate(UpdateFlags::default()))
            .await;
        assert!(matches!(result, Err(MaintenanceError::ConnectionFailure(_))));
        // Retryable: the next request must not be refused.
        assert_eq!(orchestrator.phase(), Phase::Idle);
    }

    #[tokio::test]
    async fn factory_reset_reboots_and_arms_the_supervisor() {
        let mut client = MockControllerClient::new();
        client.expect_factory_reset().returning(|_| Box::pin(std::future::ready(Ok(ok_state()))));
        client.expect_restart_system().times(1).returning(|| Box::pin(std::future::ready(Ok(()))));

        let (mut orchestrator, _events) =
            MaintenanceOrchestrator::new(client, OrchestratorOptions::default());

        orchestrator
            .start_operation(OperationRequest::FactoryReset(ResetFlags {
                keep_z2m: true,
                keep_bluetooth: false,
            }))
            .await
            .expect("reset accepted");
        assert_eq!(orchestrator.phase(), Phase::RebootPending);
        assert!(orchestrator.reconnect.is_armed());
    }

    #[tokio::test]
    async fn restore_completes_and_asks_for_a_reboot() {
        let mut client = MockControllerClient::new();
        client.expect_upload_chunk().returning(|_| Box::pin(std::future::ready(Ok(ok_state()))));

        let (mut orchestrator, mut events) =
            MaintenanceOrchestrator::new(client, OrchestratorOptions::default());

        orchestrator
            .start_operation(OperationRequest::BackupRestore {
                filename: "candle_backup.tar".to_string(),
                data: vec![0u8; 16],
            })
            .await
            .expect("restore accepted");

        assert_eq!(orchestrator.phase(), Phase::Idle);
        let emitted = drain(&mut events);
        assert!(emitted.contains(&MaintenanceEvent::RebootRequired));
        assert!(emitted.contains(&MaintenanceEvent::PhaseChanged {
            kind: OperationKind::BackupRestore,
            phase: Phase::Completed,
        }));
    }

    #[tokio::test]
    async fn progress_marker_never_goes_backwards() {
        let mut client = MockControllerClient::new();
        client
            .expect_start_system_update()
            .returning(|_| Box::pin(std::future::ready(Ok(accepted_update()))));

        let (mut orchestrator, mut events) =
            MaintenanceOrchestrator::new(client, OrchestratorOptions::default());
        orchestrator
            .start_operation(OperationRequest::SystemUpdate(UpdateFlags::default()))
            .await
            .expect("update accepted");
        drain(&mut events);

        orchestrator.apply_poll(observation(42, true)).await;
        orchestrator.apply_poll(observation(17, true)).await;

        let markers: Vec<u32> = drain(&mut events)
            .into_iter()
            .filter_map(|event| match event {
                MaintenanceEvent::Progress(update) => Some(update.marker),
                _ => None,
            })
            .collect();
        assert_eq!(markers, vec![42, 42]);
    }

    #[tokio::test]
    async fn update_completion_waits_for_the_reboot() {
        let mut client = MockControllerClient::new();
        client
            .expect_start_system_update()
            .returning(|_| Box::pin(std::future::ready(Ok(accepted_update()))));
        client.expect_restart_system().times(1).returning(|| Box::pin(std::future::ready(Ok(()))));

        let (mut orchestrator, _events) =
            MaintenanceOrchestrator::new(client, OrchestratorOptions::default());
        orchestrator
            .start_operation(OperationRequest::SystemUpdate(UpdateFlags::default()))
            .await
            .expect("update accepted");

        orchestrator.apply_poll(observation(90, false)).await;

        assert_eq!(orchestrator.phase(), Phase::RebootPending);
        assert!(!orchestrator.poller.is_running());
        assert!(orchestrator.reconnect.is_armed());
    }

    #[tokio::test]
    async fn reconnection_finishes_the_session_and_navigates_home() {
        let mut client = MockControllerClient::new();
        client
            .expect_start_system_update()
            .returning(|_| Box::pin(std::future::ready(Ok(accepted_update()))));
        client.expect_restart_system().returning(|| Box::pin(std::future::ready(Ok(()))));

        let (mut orchestrator, mut events) =
            MaintenanceOrchestrator::new(client, OrchestratorOptions::default());
        orchestrator
            .start_operation(OperationRequest::SystemUpdate(UpdateFlags::default()))
            .await
            .expect("update accepted");
        orchestrator.apply_poll(observation(90, false)).await;
        drain(&mut events);

        orchestrator.apply_reconnect(ReconnectOutcome::Reconnected { attempts: 3 });

        assert_eq!(orchestrator.phase(), Phase::Idle);
        let emitted = drain(&mut events);
        assert!(emitted.contains(&MaintenanceEvent::NavigateHome));
        assert!(emitted.contains(&MaintenanceEvent::PhaseChanged {
            kind: OperationKind::SystemUpdate,
            phase: Phase::Reconnecting,
        }));
    }

    #[tokio::test]
    async fn poll_exhaustion_fails_the_session() {
        let mut client = MockControllerClient::new();
        client
            .expect_start_system_update()
            .returning(|_| Box::pin(std::future::ready(Ok(accepted_update()))));

        let (mut orchestrator, mut events) =
            MaintenanceOrchestrator::new(client, OrchestratorOptions::default());
        orchestrator
            .start_operation(OperationRequest::SystemUpdate(UpdateFlags::default()))
            .await
            .expect("update accepted");
        drain(&mut events);

        orchestrator.apply_poll(PollOutcome::Exhausted { failures: 5 }).await;

        assert_eq!(orchestrator.phase(), Phase::Idle);
        assert!(drain(&mut events).iter().any(|event| matches!(
            event,
            MaintenanceEvent::PhaseChanged {
                phase: Phase::Failed,
                ..
            }
        )));
    }

    #[tokio::test]
    async fn a_terminal_session_does_not_block_the_next_operation() {
        let mut client = MockControllerClient::new();
        client
            .expect_upload_chunk()
            .times(2)
            .returning(|_| Box::pin(std::future::ready(Ok(ok_state()))));

        let (mut orchestrator, _events) =
            MaintenanceOrchestrator::new(client, OrchestratorOptions::default());

        for _ in 0..2 {
            orchestrator
                .start_operation(OperationRequest::BackupRestore {
                    filename: "candle_backup.tar".to_string(),
                    data: vec![0u8; 8],
                })
                .await
                .expect("restore accepted");
            assert_eq!(orchestrator.phase(), Phase::Idle);
        }
    }

    #[tokio::test]
    async fn the_session_keeps_the_requested_flags() {
        let mut client = MockControllerClient::new();
        client
            .expect_start_system_update()
            .returning(|_| Box::pin(std::future::ready(Ok(accepted_update()))));

        let (mut orchestrator, _events) =
            MaintenanceOrchestrator::new(client, OrchestratorOptions::default());

        let flags = UpdateFlags {
            cutting_edge: true,
            live_update: false,
        };
        orchestrator
            .start_operation(OperationRequest::SystemUpdate(flags))
            .await
            .expect("update accepted");

        assert_eq!(
            orchestrator.active_flags(),
            Some(OperationFlags::Update(flags))
        );
    }

    #[tokio::test]
    async fn polls_reemit_the_overlay_only_on_change() {
        let mut client = MockControllerClient::new();
        client
            .expect_start_system_update()
            .returning(|_| Box::pin(std::future::ready(Ok(accepted_update()))));

        let (mut orchestrator, mut events) =
            MaintenanceOrchestrator::new(client, OrchestratorOptions::default());
        orchestrator
            .start_operation(OperationRequest::SystemUpdate(UpdateFlags::default()))
            .await
            .expect("update accepted");
        drain(&mut events);

        // Overlay still absent: no overlay event.
        orchestrator.apply_poll(observation(1, true)).await;
        assert!(!drain(&mut events)
            .iter()
            .any(|event| matches!(event, MaintenanceEvent::OverlayChanged(_))));

        // Overlay appears: exactly one overlay event.
        orchestrator
            .apply_poll(PollOutcome::Observed(PollObservation {
                dmesg: "log".to_string(),
                marker: 2,
                still_in_progress: true,
                ro_exists: true,
                old_overlay_active: false,
            }))
            .await;
        let overlay_events: Vec<MaintenanceEvent> = drain(&mut events)
            .into_iter()
            .filter(|event| matches!(event, MaintenanceEvent::OverlayChanged(_)))
            .collect();
        assert_eq!(overlay_events.len(), 1);
        assert!(orchestrator.overlay().present);
    }

    #[tokio::test]
    async fn handshake_replaces_the_snapshot_wholesale() {
        let mut client = MockControllerClient::new();
        let mut calls = 0;
        client.expect_init().returning(move || {
            calls += 1;
            let result = if calls == 1 {
                Ok(InitResponse {
                    candle_version: Some("2.0.1".to_string()),
                    files_check_exists: true,
                    ..Default::default()
                })
            } else {
                Ok(InitResponse {
                    candle_version: Some("2.0.2".to_string()),
                    ..Default::default()
                })
            };
            Box::pin(std::future::ready(result))
        });

        let (mut orchestrator, _events) =
            MaintenanceOrchestrator::new(client, OrchestratorOptions::default());

        orchestrator.handshake().await.expect("first handshake");
        assert!(orchestrator.snapshot().expect("snapshot").files_check_available);

        orchestrator.handshake().await.expect("second handshake");
        let snapshot = orchestrator.snapshot().expect("snapshot");
        assert_eq!(snapshot.candle_version.as_deref(), Some("2.0.2"));
        assert!(!snapshot.files_check_available);
    }
}
