//! Hardware agent: lifts a [`MicroscopeBackend`] to the full
//! [`MicroscopeHardware`] contract.
//!
//! The agent is a [`Worker`] processing one command at a time from a bounded
//! channel. Long-running operations (stack acquisition, live capture,
//! ablation) run as separate tasks sharing the backend behind a mutex, so the
//! command loop stays responsive for `stop`, `sync` and `shutdown` while an
//! acquisition is in flight.
//!
//! Observed state lives in [`Observed`], shared between the loop and the
//! acquisition tasks. State mutation and signal emission happen under one
//! lock, which makes every emitted snapshot consistent and keeps the signal
//! order equal to the mutation order. The signal channel is bounded: a slow
//! consumer backpressures acquisition instead of losing data.
//!
//! Construction is inert. [`MicroscopeAgent::new`] only wires channels;
//! nothing touches the device until the agent is spawned.

use bytes::Bytes;
use chrono::Utc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::agent::{LoopFlow, Worker};
use crate::config::Settings;
use crate::error::{AppResult, ScopeError};
use crate::hardware::backend::MicroscopeBackend;
use crate::hardware::stack::StackPlan;
use crate::hardware::{MicroscopeHardware, SyncGate};
use crate::signals::{
    AblationPoint, AblationResults, AcquireStack, HardwareDimensions, ImageMeta, MicroscopeSignal,
    MicroscopeStatus, ServerState, Slice, Stack, Vector3,
};

use async_trait::async_trait;

/// Commands accepted by the agent loop.
enum HardwareRequest {
    MoveStage(Vector3),
    GoLive,
    Stop,
    SnapSlice,
    AcquireStack(AcquireStack),
    AblatePoints(Vec<AblationPoint>),
    DeviceSpecific(Vec<u8>),
    Sync { gate: oneshot::Sender<AppResult<()>> },
    Shutdown,
}

/// Observed state shared between the command loop and acquisition tasks.
struct Observed {
    status_tx: watch::Sender<MicroscopeStatus>,
    dims_tx: watch::Sender<HardwareDimensions>,
    output: mpsc::Sender<MicroscopeSignal>,
    /// Held across state mutation plus emission so snapshots stay consistent
    /// and signal order matches mutation order.
    emit_lock: Mutex<()>,
    sync_waiters: std::sync::Mutex<Vec<oneshot::Sender<AppResult<()>>>>,
    /// Shared id space for slices and stacks, strictly increasing.
    id_counter: AtomicU64,
}

impl Observed {
    fn status(&self) -> MicroscopeStatus {
        self.status_tx.borrow().clone()
    }

    fn dimensions(&self) -> HardwareDimensions {
        self.dims_tx.borrow().clone()
    }

    fn next_id(&self) -> u64 {
        self.id_counter.fetch_add(1, Ordering::Relaxed)
    }

    async fn send(&self, signal: MicroscopeSignal) {
        if self.output.send(signal).await.is_err() {
            debug!("signal consumer is gone, dropping signal");
        }
    }

    /// Publishes a status snapshot. Statuses are emitted unconditionally;
    /// reaching an idle state releases parked sync gates.
    async fn set_status(&self, status: MicroscopeStatus) {
        let _guard = self.emit_lock.lock().await;
        let idle = status.state == ServerState::Manual && !status.busy;
        let _ = self.status_tx.send(status.clone());
        self.send(MicroscopeSignal::Status(status)).await;
        if idle {
            for gate in self.drain_sync_waiters() {
                let _ = gate.send(Ok(()));
            }
        }
    }

    /// Publishes the hardware envelope, but only when it changed.
    async fn set_dimensions(&self, dims: HardwareDimensions) {
        let _guard = self.emit_lock.lock().await;
        if *self.dims_tx.borrow() == dims {
            return;
        }
        let _ = self.dims_tx.send(dims.clone());
        self.send(MicroscopeSignal::Dimensions(dims)).await;
    }

    /// Unconditional envelope announcement, used once at startup.
    async fn announce_dimensions(&self, dims: HardwareDimensions) {
        let _guard = self.emit_lock.lock().await;
        let _ = self.dims_tx.send(dims.clone());
        self.send(MicroscopeSignal::Dimensions(dims)).await;
    }

    async fn emit_slice(
        &self,
        at: Vector3,
        stack: Option<(u64, u32)>,
        meta: ImageMeta,
        data: Bytes,
    ) {
        let slice = Slice {
            id: self.next_id(),
            created: Utc::now(),
            stage_position: at,
            size_bytes: data.len() as u32,
            stack,
            meta,
            data,
        };
        let _guard = self.emit_lock.lock().await;
        self.send(MicroscopeSignal::Slice(slice)).await;
    }

    async fn emit(&self, signal: MicroscopeSignal) {
        let _guard = self.emit_lock.lock().await;
        self.send(signal).await;
    }

    fn park_sync_waiter(&self, gate: oneshot::Sender<AppResult<()>>) {
        self.waiters().push(gate);
    }

    fn drain_sync_waiters(&self) -> Vec<oneshot::Sender<AppResult<()>>> {
        self.waiters().drain(..).collect()
    }

    /// Resolves every parked sync gate with a hardware failure.
    fn fail_sync_waiters(&self, err: &ScopeError) {
        for gate in self.drain_sync_waiters() {
            let failure = match err {
                ScopeError::HardwareClosed => ScopeError::HardwareClosed,
                other => ScopeError::Hardware(other.to_string()),
            };
            let _ = gate.send(Err(failure));
        }
    }

    fn waiters(&self) -> std::sync::MutexGuard<'_, Vec<oneshot::Sender<AppResult<()>>>> {
        self.sync_waiters
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

struct ActiveTask {
    cancel: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Worker driving one [`MicroscopeBackend`].
///
/// Created inert together with its [`MicroscopeHandle`]; runs once passed to
/// [`crate::agent::Agent::spawn`].
pub struct MicroscopeAgent<B: MicroscopeBackend> {
    backend: Arc<Mutex<B>>,
    observed: Arc<Observed>,
    cmd_rx: mpsc::Receiver<HardwareRequest>,
    active: Option<ActiveTask>,
}

impl<B: MicroscopeBackend> MicroscopeAgent<B> {
    /// Wires an agent around `backend`. Returns the inert agent, the cloneable
    /// control handle and the signal output stream.
    pub fn new(
        backend: B,
        settings: &Settings,
    ) -> (Self, MicroscopeHandle, mpsc::Receiver<MicroscopeSignal>) {
        let dims = backend.dimensions();
        let initial = MicroscopeStatus {
            state: ServerState::Startup,
            stage_position: backend.initial_position(),
            busy: false,
        };

        let (status_tx, status_rx) = watch::channel(initial);
        let (dims_tx, dims_rx) = watch::channel(dims);
        let (signal_tx, signal_rx) = mpsc::channel(settings.channels.signal_capacity);
        let (cmd_tx, cmd_rx) = mpsc::channel(settings.channels.command_capacity);

        let observed = Arc::new(Observed {
            status_tx,
            dims_tx,
            output: signal_tx,
            emit_lock: Mutex::new(()),
            sync_waiters: std::sync::Mutex::new(Vec::new()),
            id_counter: AtomicU64::new(0),
        });

        let agent = Self {
            backend: Arc::new(Mutex::new(backend)),
            observed,
            cmd_rx,
            active: None,
        };
        let handle = MicroscopeHandle {
            tx: cmd_tx,
            status_rx,
            dims_rx,
        };
        (agent, handle, signal_rx)
    }

    fn state(&self) -> ServerState {
        self.observed.status().state
    }

    /// Logs and drops a command that is invalid in the current state.
    fn reject(&self, command: &str) {
        warn!(
            command,
            state = ?self.state(),
            "command not valid in current state, ignoring"
        );
    }

    async fn handle_move(&mut self, target: Vector3) {
        let state = self.state();
        if state != ServerState::Manual && state != ServerState::Live {
            self.reject("move_stage");
            return;
        }

        let target = self.observed.dimensions().coerce_position(target);
        let before = self.observed.status();
        self.observed
            .set_status(MicroscopeStatus { busy: true, ..before.clone() })
            .await;

        let moved = { self.backend.lock().await.move_stage(target).await };
        match moved {
            Ok(reached) => {
                self.observed
                    .set_status(MicroscopeStatus {
                        stage_position: reached,
                        busy: false,
                        ..before
                    })
                    .await;
            }
            Err(err) => {
                error!(%err, "stage move failed");
                self.observed.fail_sync_waiters(&err);
                self.observed
                    .set_status(MicroscopeStatus { busy: false, ..before })
                    .await;
            }
        }
    }

    async fn handle_snap(&mut self) {
        if self.state() != ServerState::Manual {
            self.reject("snap_slice");
            return;
        }

        let before = self.observed.status();
        self.observed
            .set_status(MicroscopeStatus { busy: true, ..before.clone() })
            .await;

        let meta = self.observed.dimensions().meta;
        let at = before.stage_position;
        let captured = { self.backend.lock().await.capture(at).await };
        match captured {
            Ok(data) => {
                self.observed.emit_slice(at, None, meta, data).await;
            }
            Err(err) => {
                error!(%err, "capture failed");
                self.observed.fail_sync_waiters(&err);
            }
        }
        self.observed
            .set_status(MicroscopeStatus { busy: false, ..before })
            .await;
    }

    async fn handle_acquire_stack(&mut self, request: AcquireStack) {
        if self.state() != ServerState::Manual {
            self.reject("acquire_stack");
            return;
        }

        let dims = self.observed.dimensions();
        let plan = match StackPlan::new(&request, &dims) {
            Ok(plan) => plan,
            Err(err) => {
                warn!(%err, "rejecting stack request");
                return;
            }
        };

        let stack_id = self.observed.next_id();
        let descriptor = Stack {
            id: stack_id,
            from: plan.start,
            to: plan.end,
            step_count: plan.steps,
            created: Utc::now(),
            meta: dims.meta.clone(),
        };

        info!(stack_id, steps = plan.steps, "starting stack acquisition");
        let status = self
            .observed
            .status()
            .with_state(ServerState::Stack, true);
        self.observed.set_status(status).await;
        self.observed.emit(MicroscopeSignal::Stack(descriptor)).await;

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let observed = Arc::clone(&self.observed);
        let backend = Arc::clone(&self.backend);
        let meta = dims.meta;
        let handle = tokio::spawn(async move {
            run_stack(observed, backend, plan, meta, stack_id, cancel_rx).await;
        });
        self.active = Some(ActiveTask {
            cancel: cancel_tx,
            handle,
        });
    }

    async fn handle_go_live(&mut self) {
        if self.state() != ServerState::Manual {
            self.reject("go_live");
            return;
        }

        let (supported, interval) = {
            let backend = self.backend.lock().await;
            (backend.supports_live(), backend.live_interval())
        };
        if !supported {
            warn!("backend does not support live capture, ignoring go_live");
            return;
        }

        let status = self.observed.status().with_state(ServerState::Live, false);
        self.observed.set_status(status).await;

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let observed = Arc::clone(&self.observed);
        let backend = Arc::clone(&self.backend);
        let meta = self.observed.dimensions().meta;
        let handle = tokio::spawn(async move {
            run_live(observed, backend, meta, interval, cancel_rx).await;
        });
        self.active = Some(ActiveTask {
            cancel: cancel_tx,
            handle,
        });
    }

    async fn handle_ablate(&mut self, points: Vec<AblationPoint>) {
        if self.state() != ServerState::Manual {
            self.reject("ablate_points");
            return;
        }

        info!(points = points.len(), "starting ablation run");
        let status = self
            .observed
            .status()
            .with_state(ServerState::Ablation, true);
        self.observed.set_status(status).await;

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let observed = Arc::clone(&self.observed);
        let backend = Arc::clone(&self.backend);
        let handle = tokio::spawn(async move {
            run_ablation(observed, backend, points, cancel_rx).await;
        });
        self.active = Some(ActiveTask {
            cancel: cancel_tx,
            handle,
        });
    }

    async fn handle_stop(&mut self) {
        if let Some(active) = self.active.take() {
            let _ = active.cancel.send(true);
            // the task publishes the return to Manual itself
            let _ = active.handle.await;
        }
    }

    async fn handle_sync(&mut self, gate: oneshot::Sender<AppResult<()>>) {
        let status = self.observed.status();
        if status.state == ServerState::Manual && !status.busy {
            let _ = gate.send(Ok(()));
        } else {
            self.observed.park_sync_waiter(gate);
        }
    }

    async fn handle_device_specific(&mut self, data: Vec<u8>) {
        let (result, dims) = {
            let mut backend = self.backend.lock().await;
            (backend.device_specific(data).await, backend.dimensions())
        };
        match result {
            Ok(()) => {
                // the payload may have reconfigured the device; announce a
                // changed envelope, stay silent otherwise
                self.observed.set_dimensions(dims).await;
            }
            Err(err) => {
                error!(%err, "device specific command failed");
                self.observed.fail_sync_waiters(&err);
            }
        }
    }

    async fn do_shutdown(&mut self) {
        info!("shutting down microscope hardware");
        // parked gates must see the shutdown, not the transient idle a
        // cancelled acquisition publishes on its way out
        self.observed.fail_sync_waiters(&ScopeError::HardwareClosed);
        if let Some(active) = self.active.take() {
            let _ = active.cancel.send(true);
            let _ = active.handle.await;
        }
        if let Err(err) = self.backend.lock().await.shutdown().await {
            error!(%err, "backend shutdown reported an error");
        }
        let status = self
            .observed
            .status()
            .with_state(ServerState::Shutdown, false);
        self.observed.set_status(status).await;
    }
}

#[async_trait]
impl<B: MicroscopeBackend> Worker for MicroscopeAgent<B> {
    fn name(&self) -> &str {
        "microscope-agent"
    }

    async fn on_start(&mut self) -> AppResult<()> {
        let (dims, at) = {
            let backend = self.backend.lock().await;
            (backend.dimensions(), backend.initial_position())
        };
        self.observed.announce_dimensions(dims).await;
        self.observed
            .set_status(MicroscopeStatus {
                state: ServerState::Manual,
                stage_position: at,
                busy: false,
            })
            .await;
        Ok(())
    }

    async fn on_loop(&mut self) -> AppResult<LoopFlow> {
        let Some(request) = self.cmd_rx.recv().await else {
            debug!("all hardware handles dropped, shutting down");
            self.do_shutdown().await;
            return Ok(LoopFlow::Break);
        };

        match request {
            HardwareRequest::MoveStage(target) => self.handle_move(target).await,
            HardwareRequest::GoLive => self.handle_go_live().await,
            HardwareRequest::Stop => self.handle_stop().await,
            HardwareRequest::SnapSlice => self.handle_snap().await,
            HardwareRequest::AcquireStack(request) => self.handle_acquire_stack(request).await,
            HardwareRequest::AblatePoints(points) => self.handle_ablate(points).await,
            HardwareRequest::DeviceSpecific(data) => self.handle_device_specific(data).await,
            HardwareRequest::Sync { gate } => self.handle_sync(gate).await,
            HardwareRequest::Shutdown => {
                self.do_shutdown().await;
                return Ok(LoopFlow::Break);
            }
        }
        Ok(LoopFlow::Continue)
    }

    async fn on_close(&mut self) {
        // a stop of the command loop must not leave an acquisition task
        // running against the backend on its own
        if let Some(active) = self.active.take() {
            let _ = active.cancel.send(true);
            let _ = active.handle.await;
        }
    }
}

async fn run_stack<B: MicroscopeBackend>(
    observed: Arc<Observed>,
    backend: Arc<Mutex<B>>,
    plan: StackPlan,
    meta: ImageMeta,
    stack_id: u64,
    cancel: watch::Receiver<bool>,
) {
    for step in 0..plan.steps {
        if *cancel.borrow() {
            info!(stack_id, step, "stack acquisition cancelled");
            break;
        }

        let target = plan.position(step);
        let captured = {
            let mut backend = backend.lock().await;
            match backend.move_stage(target).await {
                Ok(reached) => backend.capture(reached).await.map(|data| (reached, data)),
                Err(err) => Err(err),
            }
        };

        match captured {
            Ok((reached, data)) => {
                let status = observed.status().with_position(reached);
                observed.set_status(status).await;
                observed
                    .emit_slice(reached, Some((stack_id, step)), meta.clone(), data)
                    .await;
            }
            Err(err) => {
                error!(%err, stack_id, step, "stack acquisition failed");
                observed.fail_sync_waiters(&err);
                break;
            }
        }
    }

    let status = observed.status().with_state(ServerState::Manual, false);
    observed.set_status(status).await;
}

async fn run_live<B: MicroscopeBackend>(
    observed: Arc<Observed>,
    backend: Arc<Mutex<B>>,
    meta: ImageMeta,
    interval: Duration,
    mut cancel: watch::Receiver<bool>,
) {
    loop {
        if *cancel.borrow() {
            break;
        }

        let at = observed.status().stage_position;
        let captured = { backend.lock().await.capture(at).await };
        match captured {
            Ok(data) => observed.emit_slice(at, None, meta.clone(), data).await,
            Err(err) => {
                error!(%err, "live capture failed");
                observed.fail_sync_waiters(&err);
                break;
            }
        }

        tokio::select! {
            _ = cancel.changed() => break,
            () = tokio::time::sleep(interval) => {}
        }
    }

    let status = observed.status().with_state(ServerState::Manual, false);
    observed.set_status(status).await;
}

async fn run_ablation<B: MicroscopeBackend>(
    observed: Arc<Observed>,
    backend: Arc<Mutex<B>>,
    points: Vec<AblationPoint>,
    mut cancel: watch::Receiver<bool>,
) {
    let started = Instant::now();
    let mut per_point_time_ms = Vec::with_capacity(points.len());

    'points: for point in &points {
        if *cancel.borrow() {
            info!("ablation run cancelled");
            break;
        }

        let point_started = Instant::now();
        let result: AppResult<()> = async {
            let mut backend = backend.lock().await;
            backend.set_laser_power(point.laser_power).await?;
            let reached = backend.move_stage(point.position).await?;
            let travel = point_started.elapsed();
            if point.laser_on {
                backend.ablation_shutter(true).await?;
            }
            let dwell = if point.count_move_time {
                point.dwell_time.saturating_sub(travel)
            } else {
                point.dwell_time
            };
            // a cancel during the dwell must not be waited out; the shutter
            // is still closed below before the loop header breaks
            tokio::select! {
                _ = cancel.changed() => {}
                () = tokio::time::sleep(dwell) => {}
            }
            if point.laser_off {
                backend.ablation_shutter(false).await?;
            }
            drop(backend);
            let status = observed.status().with_position(reached);
            observed.set_status(status).await;
            Ok(())
        }
        .await;

        match result {
            Ok(()) => per_point_time_ms.push(point_started.elapsed().as_millis() as u32),
            Err(err) => {
                error!(%err, "ablation point failed");
                observed.fail_sync_waiters(&err);
                // leave the shutter path alone, the backend owns recovery
                break 'points;
            }
        }
    }

    let results = AblationResults {
        points_processed: per_point_time_ms.len() as u32,
        total_time_ms: started.elapsed().as_millis() as u32,
        per_point_time_ms,
    };
    observed
        .emit(MicroscopeSignal::AblationResults(results))
        .await;

    let status = observed.status().with_state(ServerState::Manual, false);
    observed.set_status(status).await;
}

/// Cloneable control handle implementing the hardware contract over the
/// agent's command channel.
///
/// Observed state is served from watch mirrors without touching the agent.
/// Once the agent has shut down, commands fail with
/// [`ScopeError::HardwareClosed`], except `stop` and `shutdown` which stay
/// successful for idempotency.
#[derive(Clone)]
pub struct MicroscopeHandle {
    tx: mpsc::Sender<HardwareRequest>,
    status_rx: watch::Receiver<MicroscopeStatus>,
    dims_rx: watch::Receiver<HardwareDimensions>,
}

impl MicroscopeHandle {
    async fn request(&self, request: HardwareRequest) -> AppResult<()> {
        self.tx
            .send(request)
            .await
            .map_err(|_| ScopeError::HardwareClosed)
    }
}

#[async_trait]
impl MicroscopeHardware for MicroscopeHandle {
    fn status(&self) -> MicroscopeStatus {
        self.status_rx.borrow().clone()
    }

    fn hardware_dimensions(&self) -> HardwareDimensions {
        self.dims_rx.borrow().clone()
    }

    async fn move_stage(&self, target: Vector3) -> AppResult<()> {
        self.request(HardwareRequest::MoveStage(target)).await
    }

    async fn go_live(&self) -> AppResult<()> {
        self.request(HardwareRequest::GoLive).await
    }

    async fn stop(&self) -> AppResult<()> {
        // stopping an already-gone agent is a successful no-op
        match self.request(HardwareRequest::Stop).await {
            Ok(()) | Err(ScopeError::HardwareClosed) => Ok(()),
            Err(err) => Err(err),
        }
    }

    async fn snap_slice(&self) -> AppResult<()> {
        self.request(HardwareRequest::SnapSlice).await
    }

    async fn acquire_stack(&self, request: AcquireStack) -> AppResult<()> {
        self.request(HardwareRequest::AcquireStack(request)).await
    }

    async fn ablate_points(&self, points: Vec<AblationPoint>) -> AppResult<()> {
        self.request(HardwareRequest::AblatePoints(points)).await
    }

    async fn device_specific(&self, data: Vec<u8>) -> AppResult<()> {
        self.request(HardwareRequest::DeviceSpecific(data)).await
    }

    async fn sync(&self) -> AppResult<SyncGate> {
        let (gate_tx, gate_rx) = oneshot::channel();
        self.request(HardwareRequest::Sync { gate: gate_tx }).await?;
        Ok(gate_rx)
    }

    async fn shutdown(&self) -> AppResult<()> {
        match self.request(HardwareRequest::Shutdown).await {
            Ok(()) | Err(ScopeError::HardwareClosed) => Ok(()),
            Err(err) => Err(err),
        }
    }
}
