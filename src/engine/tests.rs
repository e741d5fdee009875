use super::*;
use crate::config::ConfigText;
use crate::relay::{Established, LinkError, LinkNotice, RelayLink};
use crate::usage::UsageSample;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

type Recorded = Arc<Mutex<Vec<TunnelEvent>>>;

enum Attempt {
    Accept {
        urls: Vec<String>,
        notices: mpsc::UnboundedReceiver<LinkNotice>,
        reject_forwarding: bool,
    },
    Fail(LinkError),
}

#[derive(Default)]
struct ScriptedConnector {
    attempts: Mutex<VecDeque<Attempt>>,
    dials: AtomicUsize,
    forwardings_seen: Mutex<Vec<usize>>,
}

impl ScriptedConnector {
    fn accept(&self, url: &str) -> mpsc::UnboundedSender<LinkNotice> {
        self.accept_with(url, false)
    }

    fn accept_with(&self, url: &str, reject_forwarding: bool) -> mpsc::UnboundedSender<LinkNotice> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.attempts.lock().push_back(Attempt::Accept {
            urls: vec![url.to_string()],
            notices: rx,
            reject_forwarding,
        });
        tx
    }

    fn fail(&self, error: LinkError) {
        self.attempts.lock().push_back(Attempt::Fail(error));
    }
}

impl RelayConnector for ScriptedConnector {
    fn connect(
        &self,
        request: crate::relay::ConnectRequest,
    ) -> BoxFuture<'static, std::result::Result<(Box<dyn RelayLink>, Established), LinkError>> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        self.forwardings_seen.lock().push(request.forwardings.len());
        let attempt = self.attempts.lock().pop_front();
        let outcome = match attempt {
            Some(Attempt::Accept {
                urls,
                notices,
                reject_forwarding,
            }) => Ok((
                Box::new(ScriptedLink {
                    notices,
                    reject_forwarding,
                }) as Box<dyn RelayLink>,
                Established {
                    urls,
                    messages: vec!["welcome".to_string()],
                },
            )),
            Some(Attempt::Fail(error)) => Err(error),
            None => Err(LinkError::Io("no scripted attempt left".to_string())),
        };
        async move { outcome }.boxed()
    }
}

struct ScriptedLink {
    notices: mpsc::UnboundedReceiver<LinkNotice>,
    reject_forwarding: bool,
}

impl RelayLink for ScriptedLink {
    fn next_notice(&mut self) -> BoxFuture<'_, LinkNotice> {
        async move {
            self.notices.recv().await.unwrap_or(LinkNotice::Closed {
                error: "link dropped".to_string(),
                messages: vec!["bye".to_string()],
            })
        }
        .boxed()
    }

    fn request_forwarding(
        &mut self,
        _rule: ForwardingRule,
    ) -> BoxFuture<'_, std::result::Result<(), LinkError>> {
        let reject = self.reject_forwarding;
        async move {
            if reject {
                Err(LinkError::Rejected {
                    code: 409,
                    message: "binding already taken".to_string(),
                })
            } else {
                Ok(())
            }
        }
        .boxed()
    }

    fn close(&mut self) -> BoxFuture<'_, ()> {
        async {}.boxed()
    }
}

fn store(connector: &Arc<ScriptedConnector>) -> TunnelStore {
    TunnelStore::new(Arc::clone(connector) as Arc<dyn RelayConnector>)
}

fn record_all(tunnel: &Tunnel) -> Recorded {
    let seen: Recorded = Arc::new(Mutex::new(Vec::new()));
    for kind in EventKind::ALL {
        let sink_seen = Arc::clone(&seen);
        tunnel.register_sink(
            kind,
            Some(Arc::new(move |_tunnel: u32, event: &TunnelEvent| {
                sink_seen.lock().push(event.clone());
            })),
        );
    }
    seen
}

fn drive(tunnel: &Tunnel, seen: &Recorded, until: impl Fn(&[TunnelEvent]) -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if until(seen.lock().as_slice()) {
            return;
        }
        assert!(
            Instant::now() < deadline,
            "timed out in state {:?}; saw {:?}",
            tunnel.state(),
            seen.lock()
        );
        tunnel.resume_with_timeout(20).unwrap();
    }
}

fn drain(tunnel: &Tunnel) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while tunnel.resume_with_timeout(20).unwrap() {
        assert!(Instant::now() < deadline, "tunnel never settled");
    }
}

fn count(seen: &Recorded, kind: EventKind) -> usize {
    seen.lock().iter().filter(|event| event.kind() == kind).count()
}

fn has(kind: EventKind) -> impl Fn(&[TunnelEvent]) -> bool {
    move |events| events.iter().any(|event| event.kind() == kind)
}

fn reconnecting_config(attempts: u32) -> TunnelConfig {
    let mut config = TunnelConfig::default();
    config.auto_reconnect = true;
    config.set_reconnect_interval(0.0).unwrap();
    config.max_reconnect_attempts = attempts;
    config
}

#[test]
fn established_then_stop_emits_one_disconnected() {
    let connector = Arc::new(ScriptedConnector::default());
    let _link = connector.accept("https://abc.example");
    let tunnels = store(&connector);
    let handle = tunnels.initiate_with(TunnelConfig::default()).unwrap();
    let tunnel = tunnels.get(handle).unwrap();
    let seen = record_all(&tunnel);

    tunnel.start_non_blocking().unwrap();
    drive(&tunnel, &seen, has(EventKind::Established));
    assert!(tunnel.is_active());
    assert_eq!(tunnel.urls(), vec!["https://abc.example".to_string()]);
    assert_eq!(tunnel.greeting_messages(), vec!["welcome".to_string()]);

    tunnel.stop().unwrap();
    tunnel.stop().unwrap();
    drain(&tunnel);
    assert_eq!(tunnel.state(), TunnelState::Stopped);
    assert_eq!(count(&seen, EventKind::Disconnected), 1);
    assert!(!tunnel.resume().unwrap());
    tunnels.free(handle).unwrap();
}

#[test]
fn rejected_negotiation_fails_the_tunnel() {
    let connector = Arc::new(ScriptedConnector::default());
    connector.fail(LinkError::Rejected {
        code: 401,
        message: "authentication failed".to_string(),
    });
    let tunnels = store(&connector);
    let tunnel = tunnels
        .get(tunnels.initiate_with(TunnelConfig::default()).unwrap())
        .unwrap();
    let seen = record_all(&tunnel);

    tunnel.start_non_blocking().unwrap();
    drain(&tunnel);
    assert_eq!(tunnel.state(), TunnelState::Failed);
    assert_eq!(
        seen.lock().as_slice(),
        &[TunnelEvent::TunnelFailed {
            message: "authentication failed".to_string()
        }]
    );
    // Stop after failure publishes nothing.
    tunnel.stop().unwrap();
    assert_eq!(tunnel.state(), TunnelState::Failed);
    assert!(!tunnel.resume_with_timeout(0).unwrap());
}

#[test]
fn reconnect_gives_up_after_exactly_max_attempts() {
    let connector = Arc::new(ScriptedConnector::default());
    let link = connector.accept("https://abc.example");
    for _ in 0..3 {
        connector.fail(LinkError::Io("connection refused".to_string()));
    }
    let tunnels = store(&connector);
    let tunnel = tunnels
        .get(tunnels.initiate_with(reconnecting_config(3)).unwrap())
        .unwrap();
    let seen = record_all(&tunnel);

    tunnel.start_non_blocking().unwrap();
    drive(&tunnel, &seen, has(EventKind::Established));
    drop(link);
    drain(&tunnel);

    assert_eq!(tunnel.state(), TunnelState::Failed);
    assert_eq!(tunnel.retry_count(), 3);
    let kinds: Vec<EventKind> = seen.lock().iter().map(TunnelEvent::kind).collect();
    assert_eq!(
        kinds,
        vec![
            EventKind::Established,
            EventKind::WillReconnect,
            EventKind::TunnelError,
            EventKind::TunnelError,
            EventKind::TunnelError,
            EventKind::ReconnectionFailed,
        ]
    );
    let seen = seen.lock();
    assert!(seen.iter().all(|event| match event {
        TunnelEvent::TunnelError { recoverable, .. } => *recoverable,
        _ => true,
    }));
    assert_eq!(
        seen.last(),
        Some(&TunnelEvent::ReconnectionFailed { retry_count: 3 })
    );
    assert_eq!(connector.dials.load(Ordering::SeqCst), 4);
}

#[test]
fn zero_attempts_fails_right_after_will_reconnect() {
    let connector = Arc::new(ScriptedConnector::default());
    let link = connector.accept("https://abc.example");
    let tunnels = store(&connector);
    let tunnel = tunnels
        .get(tunnels.initiate_with(reconnecting_config(0)).unwrap())
        .unwrap();
    let seen = record_all(&tunnel);
    tunnel.start_non_blocking().unwrap();
    drive(&tunnel, &seen, has(EventKind::Established));
    drop(link);
    drain(&tunnel);
    let kinds: Vec<EventKind> = seen.lock().iter().map(TunnelEvent::kind).collect();
    assert_eq!(
        kinds,
        vec![
            EventKind::Established,
            EventKind::WillReconnect,
            EventKind::ReconnectionFailed
        ]
    );
}

#[test]
fn reconnect_restores_session_with_live_forwardings() {
    let connector = Arc::new(ScriptedConnector::default());
    let first = connector.accept("https://one.example");
    connector.fail(LinkError::Timeout(10_000));
    let _second = connector.accept("https://two.example");
    let tunnels = store(&connector);
    let mut config = reconnecting_config(5);
    config.forwardings.add_simple("localhost:3000").unwrap();
    let tunnel = tunnels.get(tunnels.initiate_with(config).unwrap()).unwrap();
    let seen = record_all(&tunnel);

    tunnel.start_non_blocking().unwrap();
    drive(&tunnel, &seen, has(EventKind::Established));
    tunnel
        .request_additional_forwarding("", "localhost:4000", ForwardingType::Tcp)
        .unwrap();
    drive(&tunnel, &seen, has(EventKind::AdditionalForwardingSucceeded));
    drop(first);
    drive(&tunnel, &seen, has(EventKind::ReconnectionCompleted));

    assert!(tunnel.is_active());
    assert_eq!(tunnel.retry_count(), 1);
    assert_eq!(tunnel.urls(), vec!["https://two.example".to_string()]);
    // Dial 1 carried the seed rule; both redials carried the added one too.
    assert_eq!(*connector.forwardings_seen.lock(), vec![1, 2, 2]);
    assert!(tunnel.forwardings_json().contains("localhost:4000"));
    tunnel.stop().unwrap();
    drain(&tunnel);
    assert_eq!(count(&seen, EventKind::Disconnected), 1);
}

#[test]
fn link_loss_without_auto_reconnect_disconnects() {
    let connector = Arc::new(ScriptedConnector::default());
    let link = connector.accept("https://abc.example");
    let tunnels = store(&connector);
    let tunnel = tunnels
        .get(tunnels.initiate_with(TunnelConfig::default()).unwrap())
        .unwrap();
    let seen = record_all(&tunnel);
    tunnel.start_non_blocking().unwrap();
    drive(&tunnel, &seen, has(EventKind::Established));
    link.send(LinkNotice::Closed {
        error: "relay restarting".to_string(),
        messages: vec!["come back later".to_string()],
    })
    .unwrap();
    drain(&tunnel);
    assert_eq!(tunnel.state(), TunnelState::Stopped);
    assert_eq!(
        seen.lock().last(),
        Some(&TunnelEvent::Disconnected {
            error: "relay restarting".to_string(),
            messages: vec!["come back later".to_string()],
        })
    );
}

#[test]
fn warnings_keep_the_tunnel_active_and_fatal_errors_drop_it() {
    let connector = Arc::new(ScriptedConnector::default());
    let link = connector.accept("https://abc.example");
    let tunnels = store(&connector);
    let tunnel = tunnels
        .get(tunnels.initiate_with(TunnelConfig::default()).unwrap())
        .unwrap();
    let seen = record_all(&tunnel);
    tunnel.start_non_blocking().unwrap();
    drive(&tunnel, &seen, has(EventKind::Established));

    link.send(LinkNotice::Warning {
        code: 12,
        message: "local server slow".to_string(),
    })
    .unwrap();
    link.send(LinkNotice::ForwardingChanged {
        url_map: r#"{"https://abc.example":"localhost:8080"}"#.to_string(),
    })
    .unwrap();
    drive(&tunnel, &seen, has(EventKind::ForwardingChanged));
    assert!(tunnel.is_active());

    link.send(LinkNotice::Fatal {
        code: 99,
        message: "session revoked".to_string(),
    })
    .unwrap();
    drain(&tunnel);
    let seen = seen.lock();
    let errors: Vec<(u32, bool)> = seen
        .iter()
        .filter_map(|event| match event {
            TunnelEvent::TunnelError {
                error_no,
                recoverable,
                ..
            } => Some((*error_no, *recoverable)),
            _ => None,
        })
        .collect();
    assert_eq!(errors, vec![(12, true), (99, false)]);
    assert_eq!(seen.last().map(TunnelEvent::kind), Some(EventKind::Disconnected));
    assert_eq!(tunnel.state(), TunnelState::Stopped);
}

#[test]
fn stop_before_start_is_silent_and_final() {
    let connector = Arc::new(ScriptedConnector::default());
    let tunnels = store(&connector);
    let tunnel = tunnels
        .get(tunnels.initiate_with(TunnelConfig::default()).unwrap())
        .unwrap();
    let seen = record_all(&tunnel);
    tunnel
        .request_additional_forwarding("", "localhost:5000", ForwardingType::Http)
        .unwrap();
    assert_eq!(tunnel.state(), TunnelState::Created);
    assert_eq!(tunnel.current_usage(), UsageReport::default());

    tunnel.stop().unwrap();
    assert_eq!(tunnel.state(), TunnelState::Stopped);
    assert_eq!(
        tunnel.start_non_blocking().unwrap_err().kind_name(),
        "InvalidStateError"
    );
    assert_eq!(connector.dials.load(Ordering::SeqCst), 0);
    assert_eq!(count(&seen, EventKind::Disconnected), 0);
}

#[test]
fn forwarding_requests_resolve_through_events() {
    let connector = Arc::new(ScriptedConnector::default());
    let _link = connector.accept_with("https://abc.example", true);
    let tunnels = store(&connector);
    let tunnel = tunnels
        .get(tunnels.initiate_with(TunnelConfig::default()).unwrap())
        .unwrap();
    let seen = record_all(&tunnel);

    let error = tunnel
        .request_additional_forwarding("", "localhost", ForwardingType::Http)
        .unwrap_err();
    assert_eq!(error.kind_name(), "ValidationError");

    tunnel.start_non_blocking().unwrap();
    drive(&tunnel, &seen, has(EventKind::Established));
    tunnel
        .request_additional_forwarding("api", "localhost:7000", ForwardingType::Http)
        .unwrap();
    drive(&tunnel, &seen, has(EventKind::AdditionalForwardingFailed));
    assert!(tunnel.is_active());
    assert!(!tunnel.forwardings_json().contains("localhost:7000"));

    tunnel.stop().unwrap();
    drain(&tunnel);
    tunnel
        .request_additional_forwarding("", "localhost:7001", ForwardingType::Tcp)
        .unwrap();
    // Terminal with nothing left once this answer is delivered.
    assert!(!tunnel.resume_with_timeout(0).unwrap());
    assert_eq!(count(&seen, EventKind::AdditionalForwardingFailed), 2);
    assert_eq!(count(&seen, EventKind::AdditionalForwardingSucceeded), 0);
}

#[test]
fn blocking_start_drains_until_terminal() {
    let connector = Arc::new(ScriptedConnector::default());
    connector.fail(LinkError::Io("connection refused".to_string()));
    let tunnels = store(&connector);
    let tunnel = tunnels
        .get(tunnels.initiate_with(TunnelConfig::default()).unwrap())
        .unwrap();
    let seen = record_all(&tunnel);
    assert!(!tunnel.start().unwrap());
    assert_eq!(count(&seen, EventKind::TunnelFailed), 1);
    assert_eq!(
        tunnel.resume().unwrap_err().kind_name(),
        "InvalidStateError"
    );
    assert!(tunnel.start().is_err());
}

#[test]
fn resume_requires_non_blocking_start() {
    let connector = Arc::new(ScriptedConnector::default());
    let tunnels = store(&connector);
    let tunnel = tunnels
        .get(tunnels.initiate_with(TunnelConfig::default()).unwrap())
        .unwrap();
    assert_eq!(
        tunnel.resume_with_timeout(0).unwrap_err().kind_name(),
        "InvalidStateError"
    );
}

#[test]
fn usage_reflects_relay_counters_and_reports_periodically() {
    let connector = Arc::new(ScriptedConnector::default());
    let link = connector.accept("https://abc.example");
    let tunnels = store(&connector);
    let tunnel = tunnels
        .get(tunnels.initiate_with(TunnelConfig::default()).unwrap())
        .unwrap();
    let seen = record_all(&tunnel);
    tunnel.start_non_blocking().unwrap();
    drive(&tunnel, &seen, has(EventKind::Established));

    link.send(LinkNotice::Usage(UsageSample {
        live_connections: 1,
        total_connections: 4,
        total_req_bytes: 10,
        total_res_bytes: 20,
        total_tx_bytes: 30,
    }))
    .unwrap();
    let deadline = Instant::now() + Duration::from_secs(5);
    while tunnel.current_usage().num_total_tx_bytes != 30 {
        assert!(Instant::now() < deadline, "usage sample never applied");
        std::thread::sleep(Duration::from_millis(10));
    }

    assert!(!tunnel.stop_usage_update());
    assert!(tunnel.start_usage_update().unwrap());
    assert!(!tunnel.start_usage_update().unwrap());
    drive(&tunnel, &seen, has(EventKind::UsageUpdate));
    assert!(tunnel.stop_usage_update());
    let usage = seen
        .lock()
        .iter()
        .find_map(|event| match event {
            TunnelEvent::UsageUpdate { usage } => Some(usage.clone()),
            _ => None,
        })
        .unwrap();
    assert!(usage.contains("\"numTotalTxBytes\":30"));
    tunnel.stop().unwrap();
}

#[test]
fn initiate_snapshots_the_config() {
    let configs = ConfigStore::new();
    let config = configs.create().unwrap();
    configs
        .set_text(config, ConfigText::Token, "first-token")
        .unwrap();
    configs.add_forwarding_simple(config, "localhost:8000").unwrap();

    let connector = Arc::new(ScriptedConnector::default());
    let tunnels = store(&connector);
    let handle = tunnels.initiate(&configs, config).unwrap();
    configs
        .set_text(config, ConfigText::Token, "second-token")
        .unwrap();
    configs.reset_forwardings(config).unwrap();

    let tunnel = tunnels.get(handle).unwrap();
    assert_eq!(tunnel.config().token, "first-token");
    assert!(tunnel.forwardings_json().contains("localhost:8000"));
    assert_eq!(configs.get_forwardings(config).unwrap(), "[]");
    assert!(tunnels.initiate(&configs, 0).is_err());
}

#[test]
fn free_retires_the_handle_and_releases_sinks() {
    struct Released(Arc<AtomicUsize>);
    impl EventSink for Released {
        fn deliver(&self, _tunnel: u32, _event: &TunnelEvent) {}
    }
    impl Drop for Released {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    let connector = Arc::new(ScriptedConnector::default());
    let _link = connector.accept("https://abc.example");
    let tunnels = store(&connector);
    let handle = tunnels.initiate_with(TunnelConfig::default()).unwrap();
    let released = Arc::new(AtomicUsize::new(0));
    {
        let tunnel = tunnels.get(handle).unwrap();
        tunnel.register_sink(
            EventKind::Disconnected,
            Some(Arc::new(Released(Arc::clone(&released)))),
        );
        tunnel.start_non_blocking().unwrap();
    }
    tunnels.free(handle).unwrap();
    assert_eq!(released.load(Ordering::SeqCst), 1);
    assert_eq!(
        tunnels.get(handle).err().map(|error| error.kind_name()),
        Some("InvalidHandle")
    );
    assert!(tunnels.free(handle).is_err());
    assert_eq!(tunnels.len(), 0);
}

#[test]
fn stop_while_reconnecting_emits_one_disconnected() {
    let connector = Arc::new(ScriptedConnector::default());
    let link = connector.accept("https://abc.example");
    let tunnels = store(&connector);
    let mut config = reconnecting_config(1_000);
    config.set_reconnect_interval(0.05).unwrap();
    let tunnel = tunnels.get(tunnels.initiate_with(config).unwrap()).unwrap();
    let seen = record_all(&tunnel);

    tunnel.start_non_blocking().unwrap();
    drive(&tunnel, &seen, has(EventKind::Established));
    drop(link);
    drive(&tunnel, &seen, has(EventKind::TunnelError));
    assert_eq!(tunnel.state(), TunnelState::Reconnecting);

    tunnel.stop().unwrap();
    drain(&tunnel);
    // Give the engine a few more intervals to publish anything stray.
    std::thread::sleep(Duration::from_millis(150));
    assert!(!tunnel.resume_with_timeout(0).unwrap());

    assert_eq!(tunnel.state(), TunnelState::Stopped);
    assert_eq!(count(&seen, EventKind::Disconnected), 1);
    assert_eq!(count(&seen, EventKind::ReconnectionFailed), 0);
    assert_eq!(count(&seen, EventKind::ReconnectionCompleted), 0);
    assert_eq!(
        seen.lock().last(),
        Some(&TunnelEvent::Disconnected {
            error: "tunnel stopped".to_string(),
            messages: Vec::new(),
        })
    );
}

#[test]
fn stop_from_another_thread_unparks_blocked_resume() {
    let connector = Arc::new(ScriptedConnector::default());
    let _link = connector.accept("https://abc.example");
    let tunnels = store(&connector);
    let tunnel = tunnels
        .get(tunnels.initiate_with(TunnelConfig::default()).unwrap())
        .unwrap();
    let seen = record_all(&tunnel);
    tunnel.start_non_blocking().unwrap();
    drive(&tunnel, &seen, has(EventKind::Established));

    let (done_tx, done_rx) = crossbeam_channel::bounded(1);
    let parked = Arc::clone(&tunnel);
    let worker = std::thread::spawn(move || {
        let mut rounds = 0;
        while parked.resume().unwrap() {
            rounds += 1;
        }
        done_tx.send(rounds).unwrap();
    });
    std::thread::sleep(Duration::from_millis(30));

    // A poll from the host thread never waits behind the parked resume.
    let started = Instant::now();
    assert!(tunnel.resume_with_timeout(0).unwrap());
    assert!(tunnel.resume_with_timeout(20).unwrap());
    assert!(started.elapsed() < Duration::from_secs(1));

    tunnel.stop().unwrap();
    done_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("parked resume never returned after stop");
    worker.join().unwrap();
    assert!(!tunnel.resume_with_timeout(-1).unwrap());
    assert_eq!(count(&seen, EventKind::Disconnected), 1);
}

#[test]
fn stop_from_another_thread_ends_blocking_start() {
    let connector = Arc::new(ScriptedConnector::default());
    let _link = connector.accept("https://abc.example");
    let tunnels = store(&connector);
    let tunnel = tunnels
        .get(tunnels.initiate_with(TunnelConfig::default()).unwrap())
        .unwrap();
    let seen = record_all(&tunnel);

    let (done_tx, done_rx) = crossbeam_channel::bounded(1);
    let runner = Arc::clone(&tunnel);
    let worker = std::thread::spawn(move || {
        done_tx.send(runner.start().unwrap()).unwrap();
    });
    let deadline = Instant::now() + Duration::from_secs(5);
    while count(&seen, EventKind::Established) == 0 {
        assert!(Instant::now() < deadline, "blocking start never established");
        std::thread::sleep(Duration::from_millis(10));
    }

    tunnel.stop().unwrap();
    let was_active = done_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("blocking start never returned after stop");
    worker.join().unwrap();
    assert!(was_active);
    assert_eq!(tunnel.state(), TunnelState::Stopped);
    assert_eq!(count(&seen, EventKind::Disconnected), 1);
}

static LOGGED_TUNNEL: Mutex<Option<Weak<Tunnel>>> = Mutex::new(None);

unsafe extern "C" fn state_reading_log_sink(
    _level: *const std::ffi::c_char,
    _message: *const std::ffi::c_char,
    breadcrumbs: u32,
    _context: *mut std::ffi::c_void,
) {
    if breadcrumbs == 0 {
        return;
    }
    let tunnel = LOGGED_TUNNEL.lock().as_ref().and_then(Weak::upgrade);
    if let Some(tunnel) = tunnel {
        let _ = tunnel.state();
        let _ = tunnel.current_usage();
    }
}

#[test]
fn log_sink_may_read_the_tunnel_it_is_logging_about() {
    let connector = Arc::new(ScriptedConnector::default());
    let _link = connector.accept("https://abc.example");
    let tunnels = store(&connector);
    let tunnel = tunnels
        .get(tunnels.initiate_with(TunnelConfig::default()).unwrap())
        .unwrap();
    let seen = record_all(&tunnel);
    *LOGGED_TUNNEL.lock() = Some(Arc::downgrade(&tunnel));
    let sink = crate::ffi::TunnelLogSink {
        log: Some(state_reading_log_sink),
        context: std::ptr::null_mut(),
        enabled_breadcrumbs: (BreadcrumbFlags::TUNNEL
            | BreadcrumbFlags::EVENTS
            | BreadcrumbFlags::USAGE)
            .bits(),
    };
    logger::install_sink(Some(&sink), Some("debug")).unwrap();

    tunnel.start_non_blocking().unwrap();
    drive(&tunnel, &seen, has(EventKind::Established));
    assert!(tunnel.start_usage_update().unwrap());
    tunnel.stop().unwrap();
    drain(&tunnel);

    logger::install_sink(None, None).unwrap();
    *LOGGED_TUNNEL.lock() = None;
    assert_eq!(tunnel.state(), TunnelState::Stopped);
    assert_eq!(count(&seen, EventKind::Disconnected), 1);
}
