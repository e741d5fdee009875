use super::wire::{self, ClientFrame, ServerFrame, PROTOCOL_VERSION};
use super::{
    ConnectRequest, Established, LinkError, LinkNotice, RelayConnector, RelayLink, CODE_PROTOCOL,
};
use crate::forwarding::ForwardingRule;
use crate::logger::{self, BreadcrumbFlags, ErrorCategory};
use crate::usage::UsageSample;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Plaintext JSON-lines connector. Refuses `ssl` sessions.
#[derive(Clone, Debug)]
pub struct TcpRelayConnector {
    connect_timeout: Duration,
    handshake_timeout: Duration,
}

impl Default for TcpRelayConnector {
    fn default() -> Self {
        Self {
            connect_timeout: CONNECT_TIMEOUT,
            handshake_timeout: HANDSHAKE_TIMEOUT,
        }
    }
}

impl TcpRelayConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeouts(connect_timeout: Duration, handshake_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            handshake_timeout,
        }
    }
}

impl RelayConnector for TcpRelayConnector {
    fn connect(
        &self,
        request: ConnectRequest,
    ) -> BoxFuture<'static, Result<(Box<dyn RelayLink>, Established), LinkError>> {
        let connector = self.clone();
        async move {
            let (link, established) = connector.dial(request).await?;
            Ok((Box::new(link) as Box<dyn RelayLink>, established))
        }
        .boxed()
    }
}

impl TcpRelayConnector {
    async fn dial(&self, request: ConnectRequest) -> Result<(TcpLink, Established), LinkError> {
        if request.ssl {
            return Err(LinkError::Unsupported(
                "ssl sessions need a TLS-capable relay connector".to_string(),
            ));
        }
        logger::breadcrumb(
            BreadcrumbFlags::RELAY,
            format!("dialing relay {}", request.server_address),
        );
        let stream = timeout(
            self.connect_timeout,
            TcpStream::connect(request.server_address.as_str()),
        )
        .await
        .map_err(|_| LinkError::Timeout(self.connect_timeout.as_millis() as u64))??;
        let _ = stream.set_nodelay(true);
        let (reader, writer) = stream.into_split();
        let mut link = TcpLink {
            lines: BufReader::new(reader).lines(),
            writer,
            backlog: VecDeque::new(),
            next_request_id: 1,
            closed: false,
        };

        link.send(&ClientFrame::Hello {
            version: PROTOCOL_VERSION,
            token: request.token,
            sni: request.sni,
            forwardings: request.forwardings,
            options: request.options,
        })
        .await?;

        let greeting = timeout(self.handshake_timeout, link.lines.next_line())
            .await
            .map_err(|_| LinkError::Timeout(self.handshake_timeout.as_millis() as u64))??;
        let Some(line) = greeting else {
            return Err(LinkError::Io(
                "relay closed the connection during the handshake".to_string(),
            ));
        };
        match wire::decode_line::<ServerFrame>(&line)
            .map_err(|error| LinkError::Protocol(error.to_string()))?
        {
            ServerFrame::Welcome { urls, messages } => {
                logger::breadcrumb(
                    BreadcrumbFlags::RELAY,
                    format!("relay accepted session with {} url(s)", urls.len()),
                );
                Ok((link, Established { urls, messages }))
            }
            ServerFrame::Reject { code, message } => Err(LinkError::Rejected { code, message }),
            other => Err(LinkError::Protocol(format!(
                "expected welcome, got {other:?}"
            ))),
        }
    }
}

struct TcpLink {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
    /// Notices read while waiting for a forward result.
    backlog: VecDeque<LinkNotice>,
    next_request_id: u64,
    closed: bool,
}

enum Inbound {
    Notice(LinkNotice),
    ForwardResult { id: u64, outcome: Result<(), String> },
}

impl TcpLink {
    async fn send(&mut self, frame: &ClientFrame) -> Result<(), LinkError> {
        let line = wire::encode_line(frame).map_err(|error| LinkError::Protocol(error.to_string()))?;
        self.writer.write_all(&line).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Reads one frame. `Lines::next_line` is cancel-safe, so this is too.
    async fn read_inbound(&mut self) -> Inbound {
        if self.closed {
            return Inbound::Notice(closed_notice("relay link already closed"));
        }
        let line = match self.lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => {
                self.closed = true;
                return Inbound::Notice(closed_notice("relay closed the connection"));
            }
            Err(error) => {
                self.closed = true;
                logger::rate_limited_error(
                    ErrorCategory::LinkFailure,
                    format!("relay read failed: {error}"),
                );
                return Inbound::Notice(closed_notice(&error.to_string()));
            }
        };
        let frame = match wire::decode_line::<ServerFrame>(&line) {
            Ok(frame) => frame,
            Err(error) => {
                return Inbound::Notice(LinkNotice::Warning {
                    code: CODE_PROTOCOL,
                    message: format!("unreadable relay frame: {error}"),
                })
            }
        };
        match frame {
            ServerFrame::ForwardResult { id, ok, error } => Inbound::ForwardResult {
                id,
                outcome: if ok {
                    Ok(())
                } else {
                    Err(error.unwrap_or_else(|| "forwarding rejected".to_string()))
                },
            },
            ServerFrame::ForwardingChanged { map } => Inbound::Notice(LinkNotice::ForwardingChanged {
                url_map: map.to_string(),
            }),
            ServerFrame::Warning { code, message } => {
                Inbound::Notice(LinkNotice::Warning { code, message })
            }
            ServerFrame::Fatal { code, message } => Inbound::Notice(LinkNotice::Fatal { code, message }),
            ServerFrame::Usage {
                live_connections,
                total_connections,
                total_req_bytes,
                total_res_bytes,
                total_tx_bytes,
            } => Inbound::Notice(LinkNotice::Usage(UsageSample {
                live_connections,
                total_connections,
                total_req_bytes,
                total_res_bytes,
                total_tx_bytes,
            })),
            ServerFrame::Bye { error, messages } => {
                self.closed = true;
                Inbound::Notice(LinkNotice::Closed { error, messages })
            }
            ServerFrame::Welcome { .. } | ServerFrame::Reject { .. } => {
                Inbound::Notice(LinkNotice::Warning {
                    code: CODE_PROTOCOL,
                    message: "unexpected greeting frame mid-session".to_string(),
                })
            }
        }
    }
}

fn closed_notice(error: &str) -> LinkNotice {
    LinkNotice::Closed {
        error: error.to_string(),
        messages: Vec::new(),
    }
}

impl RelayLink for TcpLink {
    fn next_notice(&mut self) -> BoxFuture<'_, LinkNotice> {
        async move {
            if let Some(notice) = self.backlog.pop_front() {
                return notice;
            }
            loop {
                match self.read_inbound().await {
                    Inbound::Notice(notice) => return notice,
                    Inbound::ForwardResult { id, .. } => {
                        logger::debug(format!("ignoring late forward result {id}"));
                    }
                }
            }
        }
        .boxed()
    }

    fn request_forwarding(&mut self, rule: ForwardingRule) -> BoxFuture<'_, Result<(), LinkError>> {
        async move {
            if self.closed {
                return Err(LinkError::Io("relay link is closed".to_string()));
            }
            let id = self.next_request_id;
            self.next_request_id += 1;
            self.send(&ClientFrame::Forward { id, rule }).await?;

            let wait = async {
                loop {
                    match self.read_inbound().await {
                        Inbound::ForwardResult {
                            id: answered,
                            outcome,
                        } if answered == id => {
                            return outcome.map_err(|message| LinkError::Rejected {
                                code: 0,
                                message,
                            })
                        }
                        Inbound::ForwardResult { .. } => {}
                        Inbound::Notice(notice) => {
                            let closed = matches!(notice, LinkNotice::Closed { .. });
                            self.backlog.push_back(notice);
                            if closed {
                                return Err(LinkError::Io(
                                    "relay closed before answering".to_string(),
                                ));
                            }
                        }
                    }
                }
            };
            timeout(REQUEST_TIMEOUT, wait)
                .await
                .map_err(|_| LinkError::Timeout(REQUEST_TIMEOUT.as_millis() as u64))?
        }
        .boxed()
    }

    fn close(&mut self) -> BoxFuture<'_, ()> {
        async move {
            if self.closed {
                return;
            }
            self.closed = true;
            let _ = self.send(&ClientFrame::Close).await;
            let _ = self.writer.shutdown().await;
        }
        .boxed()
    }
}
