use crate::protocol::{Blob, RealtimeInputMessage, ServerMessage, SetupMessage};
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use url::Url;
use uuid::Uuid;

/// Events raised by a remote live channel, delivered in arrival order.
#[derive(Debug)]
pub enum NetEvent {
    Open,
    Message(ServerMessage),
    Close,
    Error(String),
}

#[derive(Debug)]
pub enum NetCommand {
    SendRealtimeInput(Blob),
    Close,
}

/// Handle to an open channel. Both calls are fire-and-forget.
pub trait LiveChannel: Clone + Send + Sync + 'static {
    fn send_realtime_input(&self, chunk: Blob);

    /// Ask the channel to close; a `NetEvent::Close` follows. Never fails,
    /// including on a channel that is already closed.
    fn close(&self);
}

#[async_trait]
pub trait LiveTransport: Send + Sync + 'static {
    type Channel: LiveChannel;

    /// Open a channel and complete the setup handshake. `NetEvent::Open` is
    /// sent on `events` before this returns.
    async fn connect(
        &self,
        setup: &SetupMessage,
        events: mpsc::UnboundedSender<NetEvent>,
    ) -> anyhow::Result<Self::Channel>;
}

#[derive(Clone, Debug)]
pub struct NetHandle {
    tx: mpsc::UnboundedSender<NetCommand>,
}

impl LiveChannel for NetHandle {
    fn send_realtime_input(&self, chunk: Blob) {
        // 不等待背压，链路断开时直接丢弃
        let _ = self.tx.send(NetCommand::SendRealtimeInput(chunk));
    }

    fn close(&self) {
        let _ = self.tx.send(NetCommand::Close);
    }
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWrite = SplitSink<WsStream, Message>;
type WsRead = SplitStream<WsStream>;

pub struct WsTransport {
    ws_url: String,
    api_key: String,
}

impl WsTransport {
    pub fn new(ws_url: &str, api_key: String) -> Self {
        Self {
            ws_url: ws_url.to_string(),
            api_key,
        }
    }

    fn endpoint(&self) -> anyhow::Result<Url> {
        let mut url = Url::parse(&self.ws_url)?;
        if !self.api_key.is_empty() {
            url.query_pairs_mut().append_pair("key", &self.api_key);
        }
        Ok(url)
    }
}

#[async_trait]
impl LiveTransport for WsTransport {
    type Channel = NetHandle;

    async fn connect(
        &self,
        setup: &SetupMessage,
        events: mpsc::UnboundedSender<NetEvent>,
    ) -> anyhow::Result<NetHandle> {
        let url = self.endpoint()?;
        let link_id = Uuid::new_v4();

        // 日志里不能带上 key
        log::info!(
            "[{}] Connecting to {}://{}{}...",
            link_id,
            url.scheme(),
            url.host_str().unwrap_or(""),
            url.path()
        );
        let (ws_stream, _) = connect_async(url.as_str()).await?;
        let (mut write, mut read) = ws_stream.split();

        let setup_json = serde_json::to_string(setup)?;
        log::debug!("[{}] Sending setup: {}", link_id, setup_json);
        write.send(Message::Text(setup_json.into())).await?;

        // 等待服务端 setupComplete 之后才算通道打开
        loop {
            match read.next().await {
                Some(Ok(msg)) => match classify(msg) {
                    Frame::Server(server_msg) if server_msg.is_setup_complete() => break,
                    Frame::Server(_) | Frame::Ignored => continue,
                    Frame::Closed(frame) => anyhow::bail!(
                        "Server closed connection during setup: {}",
                        describe_close(frame.as_ref())
                    ),
                },
                Some(Err(e)) => return Err(e.into()),
                None => anyhow::bail!("Connection closed during setup"),
            }
        }
        log::info!("[{}] Setup complete", link_id);

        let (tx, rx_cmd) = mpsc::unbounded_channel();
        let _ = events.send(NetEvent::Open);

        let link = NetLink {
            link_id,
            events,
            rx_cmd,
        };
        tokio::spawn(link.run(write, read));

        Ok(NetHandle { tx })
    }
}

/// Owns one open WebSocket: forwards commands out, server messages in.
struct NetLink {
    link_id: Uuid,
    events: mpsc::UnboundedSender<NetEvent>,
    rx_cmd: mpsc::UnboundedReceiver<NetCommand>,
}

impl NetLink {
    async fn run(mut self, mut write: WsWrite, mut read: WsRead) {
        let event = match self.pump(&mut write, &mut read).await {
            Ok(()) => {
                log::info!("[{}] Live channel closed", self.link_id);
                NetEvent::Close
            }
            Err(e) => {
                log::warn!("[{}] Live channel failed: {:#}", self.link_id, e);
                NetEvent::Error(format!("{:#}", e))
            }
        };
        let _ = self.events.send(event);
    }

    async fn pump(&mut self, write: &mut WsWrite, read: &mut WsRead) -> anyhow::Result<()> {
        loop {
            tokio::select! {
                msg = read.next() => {
                    match msg {
                        Some(Ok(msg)) => match classify(msg) {
                            Frame::Server(server_msg) => {
                                if let Some(go_away) = &server_msg.go_away {
                                    log::warn!(
                                        "[{}] Server is going away, time left: {}",
                                        self.link_id,
                                        go_away.time_left.as_deref().unwrap_or("unknown")
                                    );
                                }
                                let _ = self.events.send(NetEvent::Message(server_msg));
                            }
                            Frame::Closed(frame) => {
                                log::info!(
                                    "[{}] Server closed connection: {}",
                                    self.link_id,
                                    describe_close(frame.as_ref())
                                );
                                return close_result(frame.as_ref());
                            }
                            Frame::Ignored => {}
                        },
                        Some(Err(e)) => return Err(e.into()),
                        None => return Ok(()),
                    }
                }
                cmd = self.rx_cmd.recv() => {
                    match cmd {
                        Some(NetCommand::SendRealtimeInput(chunk)) => {
                            let json = serde_json::to_string(&RealtimeInputMessage::new(chunk))?;
                            write.send(Message::Text(json.into())).await?;
                        }
                        // 主动关闭，或者所有句柄都已释放
                        Some(NetCommand::Close) | None => {
                            let _ = write.send(Message::Close(None)).await;
                            let _ = write.close().await;
                            return Ok(());
                        }
                    }
                }
            }
        }
    }
}

enum Frame {
    Server(ServerMessage),
    Closed(Option<CloseFrame>),
    Ignored,
}

// 服务端的 JSON 可能放在文本帧也可能放在二进制帧里
fn classify(msg: Message) -> Frame {
    match msg {
        Message::Text(text) => parse_server_json(text.as_bytes()),
        Message::Binary(data) => parse_server_json(&data),
        Message::Close(frame) => Frame::Closed(frame),
        _ => Frame::Ignored,
    }
}

fn parse_server_json(bytes: &[u8]) -> Frame {
    match serde_json::from_slice::<ServerMessage>(bytes) {
        Ok(msg) => Frame::Server(msg),
        Err(e) => {
            log::warn!("Skipping unparseable server frame ({} bytes): {}", bytes.len(), e);
            Frame::Ignored
        }
    }
}

fn describe_close(frame: Option<&CloseFrame>) -> String {
    match frame {
        Some(f) => format!("{} {}", u16::from(f.code), f.reason.as_str()),
        None => "no close frame".to_string(),
    }
}

fn close_result(frame: Option<&CloseFrame>) -> anyhow::Result<()> {
    match frame {
        Some(f) if !matches!(f.code, CloseCode::Normal | CloseCode::Away) => {
            anyhow::bail!("Server closed connection: {}", describe_close(Some(f)))
        }
        _ => Ok(()),
    }
}
