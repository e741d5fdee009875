//! The engine task: connect, serve the link, reconnect, wind down.

use super::{Command, TunnelShared, TunnelState};
use crate::config::TunnelConfig;
use crate::events::TunnelEvent;
use crate::forwarding::{ForwardingRule, MAX_RULES};
use crate::logger::{self, BreadcrumbFlags, ErrorCategory};
use crate::relay::{ConnectRequest, Established, LinkError, LinkNotice, RelayConnector, RelayLink};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

/// Why `serve` returned.
enum Exit {
    Stopped,
    Lost { error: String, messages: Vec<String> },
}

pub(super) async fn run(
    shared: Arc<TunnelShared>,
    connector: Arc<dyn RelayConnector>,
    config: TunnelConfig,
    mut commands: mpsc::UnboundedReceiver<Command>,
    mut stop: watch::Receiver<bool>,
) {
    let handle = shared.handle;
    let first = tokio::select! {
        biased;
        _ = stop_requested(&mut stop) => None,
        result = connect(&shared, connector.as_ref(), &config) => Some(result),
    };

    let mut link = match first {
        None => {
            drain_commands(&shared, &mut commands, "tunnel stopped");
            return;
        }
        Some(Err(error)) => {
            logger::error(format!("tunnel {handle} could not connect: {error}"));
            shared.transition(
                TunnelState::Failed,
                Some(TunnelEvent::TunnelFailed {
                    message: error.to_string(),
                }),
            );
            drain_commands(&shared, &mut commands, "tunnel failed to connect");
            return;
        }
        Some(Ok((link, established))) => {
            if !shared.established(established.urls, established.messages, false) {
                close_link(link).await;
                drain_commands(&shared, &mut commands, "tunnel stopped");
                return;
            }
            link
        }
    };

    loop {
        match serve(&shared, link.as_mut(), &mut commands, &mut stop).await {
            Exit::Stopped => {
                link.close().await;
                break;
            }
            Exit::Lost { error, messages } => {
                logger::info(format!("tunnel {handle} lost its relay link: {error}"));
                if !config.auto_reconnect {
                    shared.transition(
                        TunnelState::Stopped,
                        Some(TunnelEvent::Disconnected { error, messages }),
                    );
                    break;
                }
                let next =
                    reconnect(&shared, connector.as_ref(), &config, &mut stop, error, messages).await;
                match next {
                    Some(next) => link = next,
                    None => break,
                }
            }
        }
    }
    drain_commands(&shared, &mut commands, "tunnel is no longer running");
    logger::breadcrumb(
        BreadcrumbFlags::TUNNEL,
        format!("tunnel {handle} engine exited in state {}", shared.state().as_str()),
    );
}

async fn connect(
    shared: &TunnelShared,
    connector: &dyn RelayConnector,
    config: &TunnelConfig,
) -> Result<(Box<dyn RelayLink>, Established), LinkError> {
    let request = ConnectRequest::from_config(config, shared.live_forwardings());
    connector.connect(request).await
}

/// Resolves once a stop was requested or the owning tunnel went away.
async fn stop_requested(stop: &mut watch::Receiver<bool>) {
    let _ = stop.wait_for(|stopped| *stopped).await;
}

async fn close_link(mut link: Box<dyn RelayLink>) {
    link.close().await;
}

/// Serves an established link until it drops or a stop is requested.
async fn serve(
    shared: &TunnelShared,
    link: &mut dyn RelayLink,
    commands: &mut mpsc::UnboundedReceiver<Command>,
    stop: &mut watch::Receiver<bool>,
) -> Exit {
    loop {
        tokio::select! {
            biased;
            _ = stop_requested(stop) => return Exit::Stopped,
            command = commands.recv() => match command {
                Some(Command::RequestForwarding(rule)) => {
                    if let Some(exit) = add_forwarding(shared, link, stop, rule).await {
                        return exit;
                    }
                }
                None => return Exit::Stopped,
            },
            notice = link.next_notice() => match notice {
                LinkNotice::ForwardingChanged { url_map } => {
                    shared.emit(TunnelEvent::ForwardingChanged { url_map });
                }
                LinkNotice::Warning { code, message } => {
                    logger::debug(format!("tunnel {} relay warning {code}: {message}", shared.handle));
                    shared.emit(TunnelEvent::TunnelError {
                        error_no: code,
                        message,
                        recoverable: true,
                    });
                }
                LinkNotice::Usage(sample) => shared.usage.record(sample),
                LinkNotice::Fatal { code, message } => {
                    logger::rate_limited_error(
                        ErrorCategory::LinkFailure,
                        format!("tunnel {} fatal relay error {code}: {message}", shared.handle),
                    );
                    shared.emit(TunnelEvent::TunnelError {
                        error_no: code,
                        message: message.clone(),
                        recoverable: false,
                    });
                    return Exit::Lost {
                        error: message,
                        messages: Vec::new(),
                    };
                }
                LinkNotice::Closed { error, messages } => return Exit::Lost { error, messages },
            },
        }
    }
}

/// Runs one additional forwarding request. Returns an exit when a stop
/// arrived while the relay was deciding.
async fn add_forwarding(
    shared: &TunnelShared,
    link: &mut dyn RelayLink,
    stop: &mut watch::Receiver<bool>,
    rule: ForwardingRule,
) -> Option<Exit> {
    let full = shared.forwardings.lock().len() >= MAX_RULES;
    if full {
        shared.forwarding_failed(rule, "forwarding table is full");
        return None;
    }
    let outcome = tokio::select! {
        biased;
        _ = stop_requested(stop) => {
            shared.forwarding_failed(rule, "tunnel stopped");
            return Some(Exit::Stopped);
        }
        outcome = link.request_forwarding(rule.clone()) => outcome,
    };
    match outcome {
        Ok(()) => match shared.append_forwarding(rule.clone()) {
            Ok(()) => {
                shared.emit(TunnelEvent::AdditionalForwardingSucceeded {
                    binding_url: rule.binding_url,
                    forward_to: rule.forward_to,
                    forwarding_type: rule.forwarding_type,
                });
            }
            Err(error) => shared.forwarding_failed(rule, error.to_string()),
        },
        Err(error) => shared.forwarding_failed(rule, error.to_string()),
    }
    None
}

/// Retries the session up to `max_reconnect_attempts` times. Returns the new
/// link, or `None` once the tunnel is terminal.
async fn reconnect(
    shared: &TunnelShared,
    connector: &dyn RelayConnector,
    config: &TunnelConfig,
    stop: &mut watch::Receiver<bool>,
    error: String,
    messages: Vec<String>,
) -> Option<Box<dyn RelayLink>> {
    if !shared.begin_reconnect(error, messages) {
        return None;
    }
    let interval = config.reconnect_interval();
    let attempts = config.max_reconnect_attempts;
    for attempt in 1..=attempts {
        tokio::select! {
            biased;
            _ = stop_requested(stop) => return None,
            _ = tokio::time::sleep(interval) => {}
        }
        logger::breadcrumb(
            BreadcrumbFlags::TUNNEL,
            format!("tunnel {} reconnect attempt {attempt}/{attempts}", shared.handle),
        );
        let result = tokio::select! {
            biased;
            _ = stop_requested(stop) => return None,
            result = connect(shared, connector, config) => result,
        };
        match result {
            Ok((link, established)) => {
                if shared.established(established.urls, established.messages, true) {
                    return Some(link);
                }
                close_link(link).await;
                return None;
            }
            Err(error) => {
                if !shared.attempt_failed(attempt, error.code(), error.to_string()) {
                    return None;
                }
            }
        }
    }
    if shared.transition(
        TunnelState::Failed,
        Some(TunnelEvent::ReconnectionFailed {
            retry_count: attempts,
        }),
    ) {
        logger::error(format!(
            "tunnel {} gave up after {attempts} reconnect attempt(s)",
            shared.handle
        ));
    }
    None
}

/// Answers every queued forwarding request with a failure and closes the
/// channel so later requests fail at send time.
fn drain_commands(
    shared: &TunnelShared,
    commands: &mut mpsc::UnboundedReceiver<Command>,
    reason: &str,
) {
    commands.close();
    while let Ok(Command::RequestForwarding(rule)) = commands.try_recv() {
        shared.forwarding_failed(rule, reason);
    }
}
