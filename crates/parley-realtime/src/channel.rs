use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use url::Url;

use parley_types::events::{RealtimeCommand, RealtimeEvent};

use crate::codec::{self, DISCONNECT, Handshake, PONG, Packet};
use crate::error::RealtimeError;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Supplies the current access token at every (re)connect.
pub trait TokenSource: Send + Sync + 'static {
    fn token(&self) -> Option<String>;
}

impl<F> TokenSource for F
where
    F: Fn() -> Option<String> + Send + Sync + 'static,
{
    fn token(&self) -> Option<String> {
        self()
    }
}

#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Server origin, e.g. `http://localhost:5500`.
    pub url: Url,
    pub reconnect_attempts: u32,
    pub reconnect_delay: Duration,
}

impl ChannelConfig {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            reconnect_attempts: 5,
            reconnect_delay: Duration::from_secs(1),
        }
    }

    /// The Engine.IO WebSocket endpoint for this origin.
    pub fn socket_url(&self) -> Result<Url, RealtimeError> {
        let mut url = self.url.clone();
        let scheme = match url.scheme() {
            "http" | "ws" => "ws",
            "https" | "wss" => "wss",
            other => return Err(RealtimeError::Url(format!("unsupported scheme '{}'", other))),
        };
        url.set_scheme(scheme)
            .map_err(|()| RealtimeError::Url(self.url.to_string()))?;
        url.set_path("/socket.io/");
        url.query_pairs_mut()
            .clear()
            .append_pair("EIO", "4")
            .append_pair("transport", "websocket");
        Ok(url)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStatus {
    Connected,
    Reconnecting { attempt: u32 },
    Disconnected,
}

/// A live Socket.IO connection. Inbound events arrive on the receiver
/// returned by [`RealtimeChannel::connect`]; that receiver yields `None` once
/// the channel is torn down, and nothing after.
pub struct RealtimeChannel {
    commands: mpsc::UnboundedSender<RealtimeCommand>,
    status: watch::Receiver<ChannelStatus>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl RealtimeChannel {
    /// Connect and complete the namespace handshake before returning, so a
    /// rejected token is reported here rather than as a silent retry loop.
    pub async fn connect<S: TokenSource>(
        config: ChannelConfig,
        tokens: S,
    ) -> Result<(Self, mpsc::UnboundedReceiver<RealtimeEvent>), RealtimeError> {
        let url = config.socket_url()?;
        let token = tokens.token().ok_or(RealtimeError::NoCredential)?;
        let (socket, handshake) = open(&url, &token).await?;
        info!("Real-time channel connected (sid {})", handshake.sid);

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(ChannelStatus::Connected);
        let cancel = CancellationToken::new();

        let supervisor = Supervisor {
            url,
            config,
            tokens,
            events: events_tx,
            commands: commands_rx,
            status: status_tx,
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(supervisor.run(socket, handshake));

        Ok((
            Self {
                commands: commands_tx,
                status: status_rx,
                cancel,
                task: Some(task),
            },
            events_rx,
        ))
    }

    /// Queue an outbound event. Delivered once connected.
    pub fn emit(&self, command: RealtimeCommand) -> Result<(), RealtimeError> {
        self.commands
            .send(command)
            .map_err(|_| RealtimeError::Closed)
    }

    pub fn status(&self) -> ChannelStatus {
        *self.status.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ChannelStatus> {
        self.status.clone()
    }

    /// Close the connection and wait until no further event can be delivered.
    pub async fn disconnect(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!("Real-time task ended abnormally: {}", e);
            }
        }
    }
}

impl Drop for RealtimeChannel {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Open the socket and join the default namespace with `token`.
async fn open(url: &Url, token: &str) -> Result<(Socket, Handshake), RealtimeError> {
    tokio::time::timeout(HANDSHAKE_TIMEOUT, handshake(url, token))
        .await
        .map_err(|_| RealtimeError::HandshakeTimeout)?
}

async fn handshake(url: &Url, token: &str) -> Result<(Socket, Handshake), RealtimeError> {
    let (mut socket, _) = tokio_tungstenite::connect_async(url.as_str()).await?;

    let handshake = match next_packet(&mut socket).await? {
        Packet::Open(handshake) => handshake,
        other => {
            return Err(RealtimeError::Protocol(format!(
                "expected open packet, got {:?}",
                other
            )));
        }
    };

    socket
        .send(Message::Text(codec::encode_connect(token).into()))
        .await?;

    loop {
        match next_packet(&mut socket).await? {
            Packet::Connected => return Ok((socket, handshake)),
            Packet::ConnectError(reason) => return Err(RealtimeError::Rejected(reason)),
            Packet::Ping => socket.send(Message::Text(PONG.into())).await?,
            other => trace!("Ignoring {:?} before namespace connect", other),
        }
    }
}

async fn next_packet(socket: &mut Socket) -> Result<Packet, RealtimeError> {
    loop {
        match socket.next().await {
            Some(Ok(Message::Text(text))) => return codec::decode(text.as_str()),
            Some(Ok(Message::Close(_))) | None => return Err(RealtimeError::Closed),
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(e.into()),
        }
    }
}

/// Why a connected session ended.
enum SessionEnd {
    /// Local teardown: disconnect, channel dropped, or receiver dropped.
    Stopped,
    /// The server removed us from the namespace. Not retried.
    Kicked,
    /// Transport failure or missed pings. Retried.
    Lost,
}

struct Supervisor<S> {
    url: Url,
    config: ChannelConfig,
    tokens: S,
    events: mpsc::UnboundedSender<RealtimeEvent>,
    commands: mpsc::UnboundedReceiver<RealtimeCommand>,
    status: watch::Sender<ChannelStatus>,
    cancel: CancellationToken,
}

impl<S: TokenSource> Supervisor<S> {
    async fn run(mut self, socket: Socket, handshake: Handshake) {
        let mut current = Some((socket, handshake));

        while let Some((socket, handshake)) = current.take() {
            self.status.send_replace(ChannelStatus::Connected);
            match self.session(socket, &handshake).await {
                SessionEnd::Stopped => break,
                SessionEnd::Kicked => {
                    warn!("Server closed the real-time session");
                    break;
                }
                SessionEnd::Lost => {
                    warn!("Real-time connection lost");
                    current = self.reconnect().await;
                }
            }
        }

        self.status.send_replace(ChannelStatus::Disconnected);
        info!("Real-time channel closed");
        // `self.events` drops here, ending the receiver's stream.
    }

    async fn reconnect(&mut self) -> Option<(Socket, Handshake)> {
        for attempt in 1..=self.config.reconnect_attempts {
            self.status
                .send_replace(ChannelStatus::Reconnecting { attempt });
            tokio::select! {
                _ = self.cancel.cancelled() => return None,
                _ = tokio::time::sleep(self.config.reconnect_delay) => {}
            }

            let Some(token) = self.tokens.token() else {
                warn!("No credential left, not reconnecting");
                return None;
            };
            let result = tokio::select! {
                _ = self.cancel.cancelled() => return None,
                result = open(&self.url, &token) => result,
            };
            match result {
                Ok(connected) => {
                    info!("Real-time channel reconnected after {} attempt(s)", attempt);
                    return Some(connected);
                }
                Err(RealtimeError::Rejected(reason)) => {
                    warn!("Reconnect rejected: {}", reason);
                    return None;
                }
                Err(e) => debug!("Reconnect attempt {} failed: {}", attempt, e),
            }
        }
        warn!(
            "Giving up on real-time channel after {} attempt(s)",
            self.config.reconnect_attempts
        );
        None
    }

    async fn session(&mut self, socket: Socket, handshake: &Handshake) -> SessionEnd {
        let (mut sink, mut stream) = socket.split();
        let liveness = handshake.liveness();
        let deadline = tokio::time::sleep(liveness);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    close(&mut sink).await;
                    return SessionEnd::Stopped;
                }
                _ = &mut deadline => {
                    warn!("No ping from server in {:?}", liveness);
                    return SessionEnd::Lost;
                }
                command = self.commands.recv() => {
                    let Some(command) = command else {
                        close(&mut sink).await;
                        return SessionEnd::Stopped;
                    };
                    let frame = codec::encode_event(command.event_name(), &command.payload());
                    trace!("-> {}", frame);
                    if let Err(e) = sink.send(Message::Text(frame.into())).await {
                        debug!("Send failed: {}", e);
                        return SessionEnd::Lost;
                    }
                }
                frame = stream.next() => {
                    let text = match frame {
                        Some(Ok(Message::Text(text))) => text,
                        Some(Ok(Message::Close(_))) | None => return SessionEnd::Lost,
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => {
                            debug!("Receive failed: {}", e);
                            return SessionEnd::Lost;
                        }
                    };
                    match codec::decode(text.as_str()) {
                        Ok(Packet::Ping) => {
                            deadline.as_mut().reset(Instant::now() + liveness);
                            if sink.send(Message::Text(PONG.into())).await.is_err() {
                                return SessionEnd::Lost;
                            }
                        }
                        Ok(Packet::Event { name, data }) => {
                            if let Some(end) = self.deliver(&name, data) {
                                close(&mut sink).await;
                                return end;
                            }
                        }
                        Ok(Packet::Disconnected) => return SessionEnd::Kicked,
                        Ok(Packet::Close) => return SessionEnd::Lost,
                        Ok(other) => trace!("Ignoring {:?}", other),
                        Err(e) => warn!("Dropping frame: {}", e),
                    }
                }
            }
        }
    }

    /// Hand a decoded event to the consumer. `Some` means stop.
    fn deliver(&self, name: &str, data: serde_json::Value) -> Option<SessionEnd> {
        if self.cancel.is_cancelled() {
            return Some(SessionEnd::Stopped);
        }
        match RealtimeEvent::from_wire(name, data) {
            Ok(Some(event)) => {
                trace!("<- {}", name);
                if self.events.send(event).is_err() {
                    debug!("Event receiver dropped");
                    return Some(SessionEnd::Stopped);
                }
            }
            Ok(None) => {}
            Err(e) => warn!("Undecodable '{}' event: {}", name, e),
        }
        None
    }
}

async fn close(sink: &mut SplitSink<Socket, Message>) {
    let _ = sink.send(Message::Text(DISCONNECT.into())).await;
    let _ = sink.close().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socket_url_for_http_origin() {
        let config = ChannelConfig::new(Url::parse("http://localhost:5500").unwrap());
        assert_eq!(
            config.socket_url().unwrap().as_str(),
            "ws://localhost:5500/socket.io/?EIO=4&transport=websocket"
        );
    }

    #[test]
    fn socket_url_keeps_tls() {
        let config = ChannelConfig::new(Url::parse("https://chat.example.com/api/").unwrap());
        assert_eq!(
            config.socket_url().unwrap().as_str(),
            "wss://chat.example.com/socket.io/?EIO=4&transport=websocket"
        );
    }

    #[test]
    fn closure_is_a_token_source() {
        let source = || Some("t1".to_string());
        assert_eq!(source.token().as_deref(), Some("t1"));
    }
}
