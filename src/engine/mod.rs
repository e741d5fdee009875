//! Tunnel lifecycle.
//!
//! A `Tunnel` is created from a config snapshot and driven by one engine task
//! on the shared runtime (`session::run`). Every state transition happens
//! under the tunnel's status lock together with the event it produces, so
//! once a tunnel is terminal nothing else can be published for it. Logging
//! and usage teardown for a transition run after that lock is released. The host
//! receives events by pumping the tunnel's dispatcher, either inside the
//! blocking `start` or through `resume`.

pub(crate) mod runtime;
mod session;

use crate::config::{ConfigStore, TunnelConfig};
use crate::error::{BridgeError, HandleKind, Result};
use crate::events::{EventDispatcher, EventKind, EventSink, TunnelEvent, Wait};
use crate::forwarding::{ForwardingRule, ForwardingTable, ForwardingType};
use crate::handles::HandleRegistry;
use crate::logger::{self, BreadcrumbFlags};
use crate::relay::{RelayConnector, TcpRelayConnector};
use crate::usage::{UsageMonitor, UsageReport};
use parking_lot::{Mutex, MutexGuard, RwLock};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(C)]
pub enum TunnelState {
    Created = 0,
    Connecting = 1,
    Active = 2,
    Reconnecting = 3,
    Stopped = 4,
    Failed = 5,
}

impl TunnelState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TunnelState::Stopped | TunnelState::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TunnelState::Created => "created",
            TunnelState::Connecting => "connecting",
            TunnelState::Active => "active",
            TunnelState::Reconnecting => "reconnecting",
            TunnelState::Stopped => "stopped",
            TunnelState::Failed => "failed",
        }
    }
}

/// How the host delivers events; fixed by the first start call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum DriveMode {
    Blocking,
    NonBlocking,
}

pub(crate) enum Command {
    RequestForwarding(ForwardingRule),
}

struct Status {
    state: TunnelState,
    mode: Option<DriveMode>,
    retry_count: u32,
    urls: Vec<String>,
    greeting: Vec<String>,
    was_active: bool,
}

/// A state change applied under the status lock whose follow-up work still
/// has to run once the lock is released.
#[must_use]
#[derive(Clone, Copy, Debug)]
struct Transition {
    from: TunnelState,
    to: TunnelState,
}

/// State shared between the host-facing `Tunnel` and its engine task.
pub(crate) struct TunnelShared {
    handle: u32,
    status: Mutex<Status>,
    forwardings: Mutex<ForwardingTable>,
    dispatcher: EventDispatcher,
    usage: UsageMonitor,
}

impl TunnelShared {
    fn new(handle: u32, forwardings: ForwardingTable) -> Self {
        Self {
            handle,
            status: Mutex::new(Status {
                state: TunnelState::Created,
                mode: None,
                retry_count: 0,
                urls: Vec::new(),
                greeting: Vec::new(),
                was_active: false,
            }),
            forwardings: Mutex::new(forwardings),
            dispatcher: EventDispatcher::new(handle),
            usage: UsageMonitor::default(),
        }
    }

    pub(crate) fn state(&self) -> TunnelState {
        self.status.lock().state
    }

    /// Posts `event` unless the tunnel already reached a terminal state.
    pub(crate) fn emit(&self, event: TunnelEvent) -> bool {
        let status = self.status.lock();
        if status.state.is_terminal() {
            return false;
        }
        self.dispatcher.post(event);
        true
    }

    /// Moves to `next` and posts `event` in the same critical section. Fails
    /// when the tunnel is already terminal (typically a concurrent `stop`).
    pub(crate) fn transition(&self, next: TunnelState, event: Option<TunnelEvent>) -> bool {
        let applied = self.transition_locked(&mut self.status.lock(), next, event);
        self.settle(applied)
    }

    /// Applies the state change and posts its event. Must be followed by
    /// `settle` after `status` is released.
    fn transition_locked(
        &self,
        status: &mut MutexGuard<'_, Status>,
        next: TunnelState,
        event: Option<TunnelEvent>,
    ) -> Option<Transition> {
        if status.state.is_terminal() {
            return None;
        }
        let from = status.state;
        status.state = next;
        if next == TunnelState::Active {
            status.was_active = true;
        }
        if let Some(event) = event {
            self.dispatcher.post(event);
        }
        if next.is_terminal() {
            // Parked pumps drain the terminal event and return.
            self.dispatcher.close();
        }
        Some(Transition { from, to: next })
    }

    /// Lock-free half of a transition. Returns whether one was applied.
    fn settle(&self, applied: Option<Transition>) -> bool {
        let Some(Transition { from, to }) = applied else {
            return false;
        };
        logger::breadcrumb(
            BreadcrumbFlags::TUNNEL,
            format!("tunnel {} {} -> {}", self.handle, from.as_str(), to.as_str()),
        );
        if to.is_terminal() {
            self.usage.stop();
        }
        true
    }

    pub(crate) fn established(
        &self,
        urls: Vec<String>,
        greeting: Vec<String>,
        reconnected: bool,
    ) -> bool {
        let mut status = self.status.lock();
        let event = if reconnected {
            TunnelEvent::ReconnectionCompleted { urls: urls.clone() }
        } else {
            TunnelEvent::Established { urls: urls.clone() }
        };
        let Some(applied) = self.transition_locked(&mut status, TunnelState::Active, Some(event))
        else {
            return false;
        };
        status.urls = urls;
        status.greeting = greeting;
        drop(status);
        self.settle(Some(applied));
        self.usage.mark_active();
        true
    }

    pub(crate) fn begin_reconnect(&self, error: String, messages: Vec<String>) -> bool {
        let applied = {
            let mut status = self.status.lock();
            let applied = self.transition_locked(
                &mut status,
                TunnelState::Reconnecting,
                Some(TunnelEvent::WillReconnect { error, messages }),
            );
            if applied.is_some() {
                status.retry_count = 0;
            }
            applied
        };
        self.settle(applied)
    }

    /// Records one failed reconnect attempt and reports it.
    pub(crate) fn attempt_failed(&self, attempt: u32, code: u32, message: String) -> bool {
        let mut status = self.status.lock();
        if status.state.is_terminal() {
            return false;
        }
        status.retry_count = attempt;
        self.dispatcher.post(TunnelEvent::TunnelError {
            error_no: code,
            message,
            recoverable: true,
        });
        true
    }

    pub(crate) fn live_forwardings(&self) -> Vec<ForwardingRule> {
        self.forwardings.lock().rules().to_vec()
    }

    pub(crate) fn append_forwarding(&self, rule: ForwardingRule) -> Result<()> {
        self.forwardings.lock().push(rule)
    }

    /// Resolves a forwarding request that can no longer be served. Posted
    /// even after the tunnel is terminal so every request gets an answer.
    pub(crate) fn forwarding_failed(&self, rule: ForwardingRule, error: impl Into<String>) {
        self.dispatcher.post(TunnelEvent::AdditionalForwardingFailed {
            binding_url: rule.binding_url,
            forward_to: rule.forward_to,
            forwarding_type: rule.forwarding_type,
            error: error.into(),
        });
    }
}

pub struct Tunnel {
    shared: Arc<TunnelShared>,
    config: TunnelConfig,
    connector: Arc<dyn RelayConnector>,
    commands: mpsc::UnboundedSender<Command>,
    /// Taken by the engine task when the tunnel starts.
    pending_commands: Mutex<Option<mpsc::UnboundedReceiver<Command>>>,
    stop_signal: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Tunnel {
    fn new(handle: u32, config: TunnelConfig, connector: Arc<dyn RelayConnector>) -> Self {
        let (commands, pending) = mpsc::unbounded_channel();
        let (stop_signal, _) = watch::channel(false);
        Self {
            shared: Arc::new(TunnelShared::new(handle, config.forwardings.clone())),
            config,
            connector,
            commands,
            pending_commands: Mutex::new(Some(pending)),
            stop_signal,
            task: Mutex::new(None),
        }
    }

    pub fn handle(&self) -> u32 {
        self.shared.handle
    }

    pub fn config(&self) -> &TunnelConfig {
        &self.config
    }

    pub fn state(&self) -> TunnelState {
        self.shared.state()
    }

    pub fn is_active(&self) -> bool {
        self.state() == TunnelState::Active
    }

    pub fn retry_count(&self) -> u32 {
        self.shared.status.lock().retry_count
    }

    pub fn urls(&self) -> Vec<String> {
        self.shared.status.lock().urls.clone()
    }

    pub fn greeting_messages(&self) -> Vec<String> {
        self.shared.status.lock().greeting.clone()
    }

    pub fn forwardings_json(&self) -> String {
        self.shared.forwardings.lock().to_json()
    }

    pub fn register_sink(&self, kind: EventKind, sink: Option<Arc<dyn EventSink>>) -> bool {
        self.shared.dispatcher.register(kind, sink)
    }

    /// Starts the engine and delivers events on this thread until the tunnel
    /// is terminal and its queue is drained. Returns whether the tunnel was
    /// ever active.
    pub fn start(&self) -> Result<bool> {
        self.launch(DriveMode::Blocking)?;
        loop {
            let terminal = self.state().is_terminal();
            if terminal && self.shared.dispatcher.pending() == 0 {
                break;
            }
            let wait = if terminal { Wait::Poll } else { Wait::Forever };
            self.shared.dispatcher.pump(wait)?;
        }
        Ok(self.shared.status.lock().was_active)
    }

    pub fn start_non_blocking(&self) -> Result<()> {
        self.launch(DriveMode::NonBlocking)
    }

    fn launch(&self, mode: DriveMode) -> Result<()> {
        let runtime = runtime::shared()?;
        {
            let mut status = self.shared.status.lock();
            if status.state != TunnelState::Created || status.mode.is_some() {
                return Err(BridgeError::invalid_state(format!(
                    "tunnel {} cannot start from state {}",
                    self.handle(),
                    status.state.as_str()
                )));
            }
            status.mode = Some(mode);
            status.state = TunnelState::Connecting;
        }
        let commands = self
            .pending_commands
            .lock()
            .take()
            .ok_or_else(|| BridgeError::invalid_state("tunnel engine already launched"))?;
        logger::info(format!(
            "tunnel {} starting ({:?}) against {}",
            self.handle(),
            mode,
            self.config.resolved_server_address()
        ));
        let task = runtime.spawn(session::run(
            Arc::clone(&self.shared),
            Arc::clone(&self.connector),
            self.config.clone(),
            commands,
            self.stop_signal.subscribe(),
        ));
        *self.task.lock() = Some(task);
        Ok(())
    }

    pub fn resume(&self) -> Result<bool> {
        self.resume_with_timeout(-1)
    }

    /// Drains queued events; `timeout_ms` is -1 (block), 0 (poll) or a wait
    /// in milliseconds. Returns whether the host should keep resuming.
    pub fn resume_with_timeout(&self, timeout_ms: i64) -> Result<bool> {
        let state = {
            let status = self.shared.status.lock();
            match status.mode {
                Some(DriveMode::NonBlocking) => {}
                Some(DriveMode::Blocking) => {
                    return Err(BridgeError::invalid_state(format!(
                        "tunnel {} is driven by the blocking start",
                        self.handle()
                    )))
                }
                None => {
                    return Err(BridgeError::invalid_state(format!(
                        "tunnel {} has not been started",
                        self.handle()
                    )))
                }
            }
            status.state
        };
        let dispatcher = &self.shared.dispatcher;
        if state.is_terminal() && dispatcher.pending() == 0 {
            return Ok(false);
        }
        let wait = if state.is_terminal() {
            Wait::Poll
        } else {
            Wait::from_millis(timeout_ms)
        };
        dispatcher.pump(wait)?;
        Ok(!self.state().is_terminal() || dispatcher.pending() > 0)
    }

    /// Forces the tunnel to `Stopped`. Idempotent.
    pub fn stop(&self) -> Result<()> {
        let applied = {
            let mut status = self.shared.status.lock();
            let event = match status.state {
                TunnelState::Stopped | TunnelState::Failed => return Ok(()),
                TunnelState::Created | TunnelState::Connecting => None,
                TunnelState::Active | TunnelState::Reconnecting => Some(TunnelEvent::Disconnected {
                    error: "tunnel stopped".to_string(),
                    messages: Vec::new(),
                }),
            };
            self.shared
                .transition_locked(&mut status, TunnelState::Stopped, event)
        };
        self.shared.settle(applied);
        self.stop_signal.send_replace(true);
        // Requests queued before the engine ever ran have nobody to answer them.
        if let Some(mut pending) = self.pending_commands.lock().take() {
            pending.close();
            while let Ok(Command::RequestForwarding(rule)) = pending.try_recv() {
                self.shared.forwarding_failed(rule, "tunnel stopped before it started");
            }
        }
        logger::info(format!("tunnel {} stopped", self.handle()));
        Ok(())
    }

    /// Queues one forwarding for the engine. Validation errors are reported
    /// synchronously; everything else resolves through events.
    pub fn request_additional_forwarding(
        &self,
        binding_url: &str,
        forward_to: &str,
        forwarding_type: ForwardingType,
    ) -> Result<()> {
        let rule = ForwardingRule::new(forwarding_type, binding_url, forward_to)?;
        if self.state().is_terminal() {
            self.shared.forwarding_failed(rule, "tunnel is not running");
            return Ok(());
        }
        if let Err(mpsc::error::SendError(Command::RequestForwarding(rule))) =
            self.commands.send(Command::RequestForwarding(rule))
        {
            self.shared.forwarding_failed(rule, "tunnel is not running");
        }
        Ok(())
    }

    pub fn start_usage_update(&self) -> Result<bool> {
        let runtime = runtime::shared()?;
        let shared = Arc::downgrade(&self.shared);
        Ok(self
            .shared
            .usage
            .start_with(|interval| runtime.spawn(report_usage(shared, interval))))
    }

    pub fn stop_usage_update(&self) -> bool {
        self.shared.usage.stop()
    }

    pub fn current_usage(&self) -> UsageReport {
        self.shared.usage.snapshot()
    }

    fn teardown(&self) {
        let _ = self.stop();
        self.shared.usage.stop();
        self.shared.dispatcher.clear_sinks();
        // The engine task observes the stop signal and exits on its own.
        drop(self.task.lock().take());
    }
}

async fn report_usage(shared: Weak<TunnelShared>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let Some(shared) = shared.upgrade() else {
            break;
        };
        let usage = shared.usage.snapshot().to_json();
        if !shared.emit(TunnelEvent::UsageUpdate { usage }) {
            break;
        }
    }
}

/// Owns every live tunnel behind a handle.
pub struct TunnelStore {
    registry: HandleRegistry<Tunnel>,
    connector: RwLock<Arc<dyn RelayConnector>>,
}

impl Default for TunnelStore {
    fn default() -> Self {
        Self::new(Arc::new(TcpRelayConnector::new()))
    }
}

impl TunnelStore {
    pub fn new(connector: Arc<dyn RelayConnector>) -> Self {
        Self {
            registry: HandleRegistry::new(HandleKind::Tunnel),
            connector: RwLock::new(connector),
        }
    }

    /// Connector used by tunnels initiated from now on.
    pub fn set_connector(&self, connector: Arc<dyn RelayConnector>) {
        *self.connector.write() = connector;
    }

    pub fn initiate(&self, configs: &ConfigStore, config: u32) -> Result<u32> {
        let snapshot = configs.snapshot(config)?;
        self.initiate_with(snapshot)
    }

    pub fn initiate_with(&self, config: TunnelConfig) -> Result<u32> {
        let connector = Arc::clone(&*self.connector.read());
        let handle = self
            .registry
            .insert_with(|handle| Tunnel::new(handle, config, connector))?;
        logger::breadcrumb(
            BreadcrumbFlags::TUNNEL,
            format!("tunnel {handle} initiated"),
        );
        Ok(handle)
    }

    pub fn get(&self, handle: u32) -> Result<Arc<Tunnel>> {
        self.registry.get(handle)
    }

    /// Stops the tunnel, releases its callbacks and retires the handle.
    pub fn free(&self, handle: u32) -> Result<()> {
        let tunnel = self.registry.remove(handle)?;
        tunnel.teardown();
        logger::breadcrumb(BreadcrumbFlags::TUNNEL, format!("tunnel {handle} freed"));
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.registry.len()
    }
}

#[cfg(test)]
mod tests;
