//! One realtime connection, joined to one complaint room.
//!
//! ```text
//! Idle -> Connecting -> Joined -> Leaving -> Idle
//!            \            \
//!             `------------`---> Disconnected  (transport error, terminal)
//! ```
//!
//! A channel that hit `Disconnected` is not resumed; the owner drops it and
//! builds a new one. Dropping a channel disconnects it.

use std::{
    fmt,
    sync::{Arc, Mutex},
};

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use serde_json::json;
use time::OffsetDateTime;
use tokio::{
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
    time::{Instant, sleep_until},
};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{Error as WsError, Message as WsMessage},
};
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    error::{ChatError, ChatResult},
    model::{Message, RoomKey},
    wire::{ChannelEvent, Emit, NewMessagePayload, OutgoingMessage, Packet, TypingPayload},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Idle,
    Connecting,
    Joined,
    Leaving,
    Disconnected,
}

impl ChannelState {
    pub fn name(self) -> &'static str {
        match self {
            ChannelState::Idle => "idle",
            ChannelState::Connecting => "connecting",
            ChannelState::Joined => "joined",
            ChannelState::Leaving => "leaving",
            ChannelState::Disconnected => "disconnected",
        }
    }
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

type Handler<T> = Box<dyn Fn(T) + Send + Sync>;
type TypingHandler = Box<dyn Fn(String, String) + Send + Sync>;

#[derive(Default)]
struct Handlers {
    message: Option<Handler<Message>>,
    presence: Option<Handler<Vec<String>>>,
    typing: Option<TypingHandler>,
    error: Option<Handler<ChatError>>,
}

type SharedHandlers = Arc<Mutex<Handlers>>;

fn with_handlers(handlers: &SharedHandlers, f: impl FnOnce(&Handlers)) {
    if let Ok(handlers) = handlers.lock() {
        f(&handlers);
    }
}

pub struct RoomChannel {
    socket_url: String,
    state: Arc<watch::Sender<ChannelState>>,
    handlers: SharedHandlers,
    room: Option<RoomKey>,
    outgoing: Option<mpsc::UnboundedSender<Packet>>,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl fmt::Debug for RoomChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoomChannel")
            .field("socket_url", &self.socket_url)
            .field("state", &self.state())
            .field("room", &self.room)
            .finish()
    }
}

impl RoomChannel {
    pub fn new(socket_url: impl Into<String>) -> Self {
        Self {
            socket_url: socket_url.into(),
            state: Arc::new(watch::channel(ChannelState::Idle).0),
            handlers: SharedHandlers::default(),
            room: None,
            outgoing: None,
            shutdown: None,
            task: None,
        }
    }

    pub fn state(&self) -> ChannelState {
        *self.state.borrow()
    }

    pub fn room(&self) -> Option<&RoomKey> {
        self.room.as_ref()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ChannelState> {
        self.state.subscribe()
    }

    /// Resolves once the state satisfies `pred`.
    pub async fn wait_for(&self, pred: impl FnMut(&ChannelState) -> bool) -> ChannelState {
        let mut rx = self.state.subscribe();
        match rx.wait_for(pred).await {
            Ok(state) => *state,
            Err(_) => self.state(),
        }
    }

    pub fn on_message(&self, handler: impl Fn(Message) + Send + Sync + 'static) {
        self.set_handler(|h| h.message = Some(Box::new(handler)));
    }

    /// Called with the full set of online participant ids on every snapshot.
    pub fn on_presence(&self, handler: impl Fn(Vec<String>) + Send + Sync + 'static) {
        self.set_handler(|h| h.presence = Some(Box::new(handler)));
    }

    /// Called with `(participant_id, display_name)` of a remote typist.
    pub fn on_typing(&self, handler: impl Fn(String, String) + Send + Sync + 'static) {
        self.set_handler(|h| h.typing = Some(Box::new(handler)));
    }

    /// Called once if the connection fails while connecting or joined.
    pub fn on_error(&self, handler: impl Fn(ChatError) + Send + Sync + 'static) {
        self.set_handler(|h| h.error = Some(Box::new(handler)));
    }

    fn set_handler(&self, f: impl FnOnce(&mut Handlers)) {
        if let Ok(mut handlers) = self.handlers.lock() {
            f(&mut handlers);
        }
    }

    /// Opens the connection and joins `room`. Returns once the connection task
    /// is started; the join completes in the background.
    pub fn connect(
        &mut self,
        room: RoomKey,
        credential: &str,
        participant_id: &str,
    ) -> ChatResult<()> {
        let state = self.state();
        if state != ChannelState::Idle {
            return Err(ChatError::InvalidState {
                state: state.name(),
                action: "connect",
            });
        }
        let url = socket_endpoint(&self.socket_url, participant_id)?;

        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        self.state.send_replace(ChannelState::Connecting);
        info!(%room, "connecting");

        let link = Link {
            room: room.clone(),
            participant_id: participant_id.to_owned(),
            handlers: self.handlers.clone(),
            state: self.state.clone(),
        };
        self.task = Some(tokio::spawn(link.run(
            url,
            credential.to_owned(),
            outgoing_rx,
            shutdown_rx,
        )));
        self.room = Some(room);
        self.outgoing = Some(outgoing_tx);
        self.shutdown = Some(shutdown_tx);
        Ok(())
    }

    /// Publishes a typing signal. Dropped unless connected to `room`.
    pub fn send_typing(&self, room: &RoomKey, participant_id: &str, display_name: &str) -> bool {
        self.emit(
            room,
            Emit::Typing(TypingPayload {
                room: Some(room.to_string()),
                user: participant_id.to_owned(),
                user_name: display_name.to_owned(),
            }),
        )
    }

    /// Publishes a message to the other participants of `room`.
    pub fn broadcast(&self, room: &RoomKey, message: &Message) -> bool {
        self.emit(
            room,
            Emit::NewMessage(NewMessagePayload {
                complaint_id: room.complaint_id(),
                message: OutgoingMessage::from(message),
                room: room.clone(),
            }),
        )
    }

    fn emit(&self, room: &RoomKey, emit: Emit) -> bool {
        if !matches!(self.state(), ChannelState::Connecting | ChannelState::Joined) {
            debug!(%room, state = %self.state(), "not connected, dropping emit");
            return false;
        }
        if self.room.as_ref() != Some(room) {
            warn!(%room, joined = ?self.room, "emit for a room this channel has not joined");
            return false;
        }
        let Some(outgoing) = &self.outgoing else {
            return false;
        };
        match emit.into_packet() {
            Ok(packet) => outgoing.send(packet).is_ok(),
            Err(err) => {
                warn!(%err, "failed to encode emit");
                false
            }
        }
    }

    /// Leaves the room and releases the connection and every handler. Safe to
    /// call any number of times.
    pub fn disconnect(&mut self) {
        if let Ok(mut handlers) = self.handlers.lock() {
            *handlers = Handlers::default();
        }
        self.outgoing = None;

        let moved = self.state.send_if_modified(|state| match state {
            ChannelState::Connecting | ChannelState::Joined => {
                *state = ChannelState::Leaving;
                true
            }
            _ => false,
        });
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if moved {
            info!(room = ?self.room, "leaving");
        }
    }

    /// Waits for the connection task to finish after [`disconnect`](Self::disconnect).
    pub async fn closed(&mut self) {
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for RoomChannel {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// `<base>/socket.io/?userId=..&EIO=4&transport=websocket` with a ws(s) scheme.
pub fn socket_endpoint(base: &str, participant_id: &str) -> ChatResult<Url> {
    let mut url = Url::parse(base)?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(ChatError::Config(format!(
                "unsupported socket url scheme {other:?}"
            )));
        }
    };
    url.set_scheme(scheme)
        .map_err(|()| ChatError::Config(format!("cannot use {scheme} for {base}")))?;
    let path = format!("{}/socket.io/", url.path().trim_end_matches('/'));
    url.set_path(&path);
    url.query_pairs_mut()
        .clear()
        .append_pair("userId", participant_id)
        .append_pair("EIO", "4")
        .append_pair("transport", "websocket");
    Ok(url)
}

/// The connection task's half of a channel.
struct Link {
    room: RoomKey,
    participant_id: String,
    handlers: SharedHandlers,
    state: Arc<watch::Sender<ChannelState>>,
}

enum Flow {
    Continue,
    Reply(Packet),
}

impl Link {
    async fn run(
        self,
        url: Url,
        credential: String,
        outgoing: mpsc::UnboundedReceiver<Packet>,
        shutdown: oneshot::Receiver<()>,
    ) {
        let result = self.drive(url, credential, outgoing, shutdown).await;

        let leaving = *self.state.borrow() == ChannelState::Leaving;
        match result {
            Ok(()) => {
                self.state.send_replace(ChannelState::Idle);
                info!(room = %self.room, "left");
            }
            Err(_) if leaving => {
                self.state.send_replace(ChannelState::Idle);
            }
            Err(err) => {
                warn!(room = %self.room, %err, "channel lost");
                // report before publishing the state so waiters see the error
                with_handlers(&self.handlers, |h| {
                    if let Some(on_error) = &h.error {
                        on_error(err);
                    }
                });
                self.state.send_replace(ChannelState::Disconnected);
            }
        }
    }

    async fn drive(
        &self,
        url: Url,
        credential: String,
        mut outgoing: mpsc::UnboundedReceiver<Packet>,
        mut shutdown: oneshot::Receiver<()>,
    ) -> ChatResult<()> {
        let (ws, _) = tokio::select! {
            ws = connect_async(url.as_str()) => ws?,
            _ = &mut shutdown => return Ok(()),
        };
        let (mut sink, mut stream) = ws.split();

        let handshake = async {
            let liveness = loop {
                match next_packet(&mut stream).await? {
                    Packet::Open(hs) => {
                        debug!(sid = %hs.sid, ping_interval = hs.ping_interval, "engine open");
                        break hs.liveness();
                    }
                    Packet::Ping => send(&mut sink, Packet::Pong).await?,
                    other => debug!(?other, "ignored before open"),
                }
            };
            send(&mut sink, Packet::Connect(Some(json!({ "token": credential })))).await?;
            loop {
                match next_packet(&mut stream).await? {
                    Packet::Connect(_) => break,
                    Packet::ConnectError(reason) => {
                        return Err(ChatError::Transport(format!("connection refused: {reason}")));
                    }
                    Packet::Ping => send(&mut sink, Packet::Pong).await?,
                    other => debug!(?other, "ignored before connect"),
                }
            }
            send(&mut sink, Emit::JoinRoom(self.room.clone()).into_packet()?).await?;
            Ok::<_, ChatError>(liveness)
        };
        let liveness = tokio::select! {
            joined = handshake => joined?,
            _ = &mut shutdown => return Ok(()),
        };

        self.state.send_if_modified(|state| {
            if *state == ChannelState::Connecting {
                *state = ChannelState::Joined;
                true
            } else {
                false
            }
        });
        info!(room = %self.room, "joined");

        // the server pings every interval; any frame proves it is still there
        let mut deadline = liveness.map(|d| Instant::now() + d);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = until(deadline) => {
                    return Err(ChatError::Transport(format!(
                        "no frames from server within {}ms",
                        liveness.map_or(0, |d| d.as_millis())
                    )));
                }
                packet = outgoing.recv() => match packet {
                    Some(packet) => send(&mut sink, packet).await?,
                    None => break,
                },
                frame = stream.next() => match frame {
                    Some(Ok(WsMessage::Text(text))) => {
                        deadline = liveness.map(|d| Instant::now() + d);
                        if let Flow::Reply(reply) = self.handle_frame(text.as_str())? {
                            send(&mut sink, reply).await?;
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | None => {
                        return Err(ChatError::Transport("connection closed by server".to_owned()));
                    }
                    Some(Ok(_)) => deadline = liveness.map(|d| Instant::now() + d),
                    Some(Err(err)) => return Err(err.into()),
                },
            }
        }

        let _ = send(&mut sink, Packet::Disconnect).await;
        let _ = sink.close().await;
        Ok(())
    }

    fn handle_frame(&self, frame: &str) -> ChatResult<Flow> {
        let packet = match Packet::decode(frame) {
            Ok(packet) => packet,
            Err(err) => {
                warn!(%err, "undecodable frame");
                return Ok(Flow::Continue);
            }
        };

        match packet {
            Packet::Ping => Ok(Flow::Reply(Packet::Pong)),
            Packet::Close | Packet::Disconnect => {
                Err(ChatError::Transport("server ended the session".to_owned()))
            }
            Packet::Event { name, payload } => {
                match ChannelEvent::from_event(&name, payload) {
                    Ok(event) => self.dispatch(event),
                    Err(err) => warn!(event = %name, %err, "malformed event payload"),
                }
                Ok(Flow::Continue)
            }
            _ => Ok(Flow::Continue),
        }
    }

    fn dispatch(&self, event: ChannelEvent) {
        match event {
            ChannelEvent::NewMessage(incoming) => {
                if !incoming.belongs_to(&self.room) {
                    debug!(room = %self.room, tagged = ?incoming.room, "message for another room dropped");
                    return;
                }
                let message = incoming
                    .message
                    .into_message(self.room.clone(), OffsetDateTime::now_utc());
                with_handlers(&self.handlers, |h| {
                    if let Some(on_message) = &h.message {
                        on_message(message);
                    }
                });
            }
            ChannelEvent::OnlineUsers(ids) => with_handlers(&self.handlers, |h| {
                if let Some(on_presence) = &h.presence {
                    on_presence(ids);
                }
            }),
            ChannelEvent::Typing(typing) => {
                if typing.user == self.participant_id {
                    return;
                }
                if typing.room.as_deref().is_some_and(|r| r != self.room.as_str()) {
                    return;
                }
                with_handlers(&self.handlers, |h| {
                    if let Some(on_typing) = &h.typing {
                        on_typing(typing.user, typing.user_name);
                    }
                });
            }
            ChannelEvent::Unknown(name) => debug!(event = %name, "unhandled event"),
        }
    }
}

async fn next_packet<S>(stream: &mut S) -> ChatResult<Packet>
where
    S: Stream<Item = Result<WsMessage, WsError>> + Unpin,
{
    loop {
        match stream.next().await {
            Some(Ok(WsMessage::Text(text))) => return Packet::decode(text.as_str()),
            Some(Ok(WsMessage::Close(_))) | None => {
                return Err(ChatError::Transport("connection closed during handshake".to_owned()));
            }
            Some(Ok(_)) => continue,
            Some(Err(err)) => return Err(err.into()),
        }
    }
}

/// Sleeps until `deadline`, or forever without one.
pub(crate) async fn until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn send<S>(sink: &mut S, packet: Packet) -> ChatResult<()>
where
    S: Sink<WsMessage, Error = WsError> + Unpin,
{
    sink.send(WsMessage::text(packet.encode())).await?;
    Ok(())
}
