use std::{collections::VecDeque, time::Duration};

use futures_util::{Sink, SinkExt, StreamExt};
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_tungstenite::tungstenite::{Message as WsMessage, client::IntoClientRequest};
use tracing::{Instrument, info_span};

use crate::messages::{Inbound, Outbound, OutboundRx};
use crate::scheduler::{Command, SchedulerHandle};
use crate::workload::{Workload, WorkloadKind};

const INITIAL_BACKOFF: Duration = Duration::from_millis(500);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

pub fn parse_ws_url(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }

    // Accept http(s) URLs and convert them to ws(s).
    if let Some(rest) = trimmed.strip_prefix("https://") {
        return Some(format!("wss://{rest}"));
    }
    if let Some(rest) = trimmed.strip_prefix("http://") {
        return Some(format!("ws://{rest}"));
    }
    Some(trimmed.to_string())
}

fn to_command(frame: Inbound) -> Option<Command> {
    let cmd = match frame {
        Inbound::ServerStart(d) => Command::Enqueue(Workload::server(d)),
        Inbound::ProxyStart(d) => Command::Enqueue(Workload::proxy(d)),
        Inbound::ServerStopped { name } => Command::Stopped {
            kind: WorkloadKind::Server,
            name,
        },
        Inbound::ProxyStopped { name } => Command::Stopped {
            kind: WorkloadKind::Proxy,
            name,
        },
        Inbound::GroupDeclare { group } => Command::DeclareGroup(group),
        Inbound::GroupUndeclare { name } => Command::UndeclareGroup(name),
        Inbound::GroupInfoRequest { name } => Command::DescribeGroup(name),
        Inbound::Unknown => return None,
    };
    Some(cmd)
}

fn decode_frame(text: &str) -> Option<Command> {
    match serde_json::from_str::<Inbound>(text) {
        Ok(frame) => to_command(frame),
        Err(e) => {
            tracing::warn!(error = %e, "dropping malformed control frame");
            None
        }
    }
}

enum Disconnect {
    /// The peer closed the socket; reconnect.
    Remote,
    /// Nothing left to forward; the agent is shutting down.
    Shutdown,
}

/// Outbound messages not yet written to a connected socket. Only the newest
/// RESOURCES snapshot is kept.
#[derive(Debug, Default)]
struct Backlog {
    queue: VecDeque<Outbound>,
}

impl Backlog {
    fn push(&mut self, msg: Outbound) {
        if matches!(msg, Outbound::Resources { .. }) {
            self.queue
                .retain(|m| !matches!(m, Outbound::Resources { .. }));
        }
        self.queue.push_back(msg);
    }

    /// Moves everything already waiting in the channel into the backlog.
    /// Returns `false` once the channel is closed and empty.
    fn take_ready(&mut self, outbound: &mut OutboundRx) -> bool {
        loop {
            match outbound.try_recv() {
                Ok(msg) => self.push(msg),
                Err(mpsc::error::TryRecvError::Empty) => return true,
                Err(mpsc::error::TryRecvError::Disconnected) => return false,
            }
        }
    }

    /// Collects outbound messages until `delay` elapses. Returns `false` when
    /// the outbound side closed meanwhile.
    async fn collect_for(&mut self, outbound: &mut OutboundRx, delay: Duration) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return true,
                msg = outbound.recv() => match msg {
                    Some(msg) => self.push(msg),
                    None => return false,
                },
            }
        }
    }

    /// Writes queued messages in order. A message leaves the backlog only after
    /// the sink accepted it.
    async fn flush<S>(&mut self, sink: &mut S) -> anyhow::Result<()>
    where
        S: Sink<WsMessage> + Unpin,
        S::Error: std::error::Error + Send + Sync + 'static,
    {
        while let Some(msg) = self.queue.front() {
            let text = match serde_json::to_string(msg) {
                Ok(text) => text,
                Err(e) => {
                    tracing::error!(error = %e, "dropping unserializable outbound message");
                    self.queue.pop_front();
                    continue;
                }
            };
            sink.send(WsMessage::Text(text.into())).await?;
            self.queue.pop_front();
        }
        Ok(())
    }
}

/// Keeps a connection to the control plane alive until the outbound side closes.
pub fn spawn(
    url: String,
    node: String,
    token: Option<String>,
    scheduler: SchedulerHandle,
    mut outbound: OutboundRx,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let span = info_span!("control_tunnel", node = %node, url = %url);
        async move {
            let mut backlog = Backlog::default();
            let mut backoff = INITIAL_BACKOFF;
            loop {
                let res = run_once(
                    &url,
                    &node,
                    token.as_deref(),
                    &scheduler,
                    &mut outbound,
                    &mut backlog,
                )
                .await;
                match res {
                    Ok(Disconnect::Shutdown) => break,
                    Ok(Disconnect::Remote) => {
                        // Clean close; reconnect with a small delay.
                        backoff = INITIAL_BACKOFF;
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, pending = backlog.queue.len(), "control tunnel disconnected");
                        backoff = (backoff * 2).min(MAX_BACKOFF);
                    }
                }
                if !backlog.collect_for(&mut outbound, backoff).await {
                    break;
                }
            }
            tracing::info!("control tunnel closed");
        }
        .instrument(span)
        .await;
    })
}

async fn run_once(
    url: &str,
    node: &str,
    token: Option<&str>,
    scheduler: &SchedulerHandle,
    outbound: &mut OutboundRx,
    backlog: &mut Backlog,
) -> anyhow::Result<Disconnect> {
    let mut req = url.into_client_request()?;
    if let Some(tok) = token {
        let value = format!("Bearer {tok}");
        req.headers_mut().insert("Authorization", value.parse()?);
    }

    let (ws, _) = tokio_tungstenite::connect_async(req).await?;
    let (mut sink, mut stream) = ws.split();
    tracing::info!(pending = backlog.queue.len(), "control tunnel connected");

    let hello = Outbound::Hello {
        node: node.to_string(),
        agent_version: env!("CARGO_PKG_VERSION").to_string(),
    };
    sink.send(WsMessage::Text(serde_json::to_string(&hello)?.into()))
        .await?;

    let open = backlog.take_ready(outbound);
    backlog.flush(&mut sink).await?;
    if !open {
        let _ = sink.send(WsMessage::Close(None)).await;
        return Ok(Disconnect::Shutdown);
    }

    loop {
        tokio::select! {
            msg = stream.next() => {
                let Some(msg) = msg else {
                    return Ok(Disconnect::Remote);
                };
                match msg? {
                    WsMessage::Text(text) => {
                        if let Some(cmd) = decode_frame(&text) {
                            scheduler.send(cmd)?;
                        }
                    }
                    WsMessage::Close(_) => return Ok(Disconnect::Remote),
                    _ => {}
                }
            }
            out = outbound.recv() => {
                let Some(out) = out else {
                    let _ = sink.send(WsMessage::Close(None)).await;
                    return Ok(Disconnect::Shutdown);
                };
                backlog.push(out);
                backlog.flush(&mut sink).await?;
            }
        }
    }
}
