//! The chat view of one complaint: owns the mounted room's channel and state,
//! and applies every async result through a single event queue.
//!
//! Channel callbacks, history fetches and durable sends all post an
//! [`Envelope`] tagged with the generation of the mount that started them.
//! Unmounting or switching rooms bumps the generation, so anything still in
//! flight for the old room is discarded when it lands.

use std::{collections::VecDeque, sync::Arc};

use tokio::{
    sync::{mpsc, watch},
    time::Instant,
};
use tracing::{debug, info, warn};

use crate::{
    api::ComplaintApi,
    channel::{ChannelState, RoomChannel, until},
    composer::Composer,
    config::Config,
    error::{ChatError, ChatResult},
    model::{ComplaintId, Message, MessageId, Participant, RoomKey},
    presence::PresenceTracker,
    reconcile::{HistoryState, LogEvent, MessageLog},
    typing::{TypingIndicator, TypingThrottle, banner},
    view::{ChatView, ConnectionStatus, MessageLine, ParticipantBadge},
};

/// A user-facing notification, the equivalent of an error toast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    ConnectionLost(String),
    HistoryUnavailable(String),
    SendFailed { candidate: MessageId, reason: String },
}

impl Notice {
    pub fn text(&self) -> String {
        match self {
            Notice::ConnectionLost(reason) => format!("Disconnected from chat: {reason}"),
            Notice::HistoryUnavailable(reason) => format!("Could not load messages: {reason}"),
            Notice::SendFailed { reason, .. } => format!("Failed to send message: {reason}"),
        }
    }
}

#[derive(Debug)]
enum Incoming {
    Message(Message),
    Presence(Vec<String>),
    Typing { participant_id: String, display_name: String },
    ChannelLost(ChatError),
    History(ChatResult<Vec<Message>>),
    Persisted { candidate: MessageId, result: ChatResult<Message> },
}

#[derive(Debug)]
struct Envelope {
    generation: u64,
    event: Incoming,
}

#[derive(Debug)]
struct Mount {
    complaint: ComplaintId,
    room: RoomKey,
    channel: RoomChannel,
    channel_state: watch::Receiver<ChannelState>,
    log: MessageLog,
    presence: PresenceTracker,
    typing: TypingIndicator,
    throttle: TypingThrottle,
    composer: Composer,
}

pub struct ChatSession<A> {
    config: Config,
    api: Arc<A>,
    user: Participant,
    mount: Option<Mount>,
    generation: u64,
    events_tx: mpsc::UnboundedSender<Envelope>,
    events_rx: mpsc::UnboundedReceiver<Envelope>,
    notices: VecDeque<Notice>,
}

impl<A: ComplaintApi> ChatSession<A> {
    pub fn new(config: Config, api: A) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            user: config.user.participant(),
            config,
            api: Arc::new(api),
            mount: None,
            generation: 0,
            events_tx,
            events_rx,
            notices: VecDeque::new(),
        }
    }

    pub fn user(&self) -> &Participant {
        &self.user
    }

    pub fn complaint(&self) -> Option<&ComplaintId> {
        self.mount.as_ref().map(|m| &m.complaint)
    }

    /// Joins the complaint's room and starts loading its history. Any room
    /// already mounted is released first.
    pub fn mount(&mut self, complaint: ComplaintId) {
        self.unmount();

        let room = complaint.room_key();
        let generation = self.generation;
        let mut channel = RoomChannel::new(&self.config.socket_url);
        self.register_handlers(&channel, generation);

        if let Err(err) = channel.connect(room.clone(), &self.config.token, &self.user.id) {
            warn!(%room, %err, "could not open channel");
            self.notices.push_back(Notice::ConnectionLost(err.to_string()));
        }

        info!(%room, generation, "mounted");
        self.mount = Some(Mount {
            channel_state: channel.subscribe_state(),
            channel,
            log: MessageLog::new(self.config.supersede_window),
            presence: PresenceTracker::new(self.config.presence_grace),
            typing: TypingIndicator::new(self.config.typing_window),
            throttle: TypingThrottle::new(self.config.typing_throttle),
            composer: Composer::new(self.user.clone(), room.clone()),
            complaint: complaint.clone(),
            room,
        });

        let api = self.api.clone();
        let tx = self.events_tx.clone();
        tokio::spawn(async move {
            let result = api.fetch_history(&complaint).await;
            let _ = tx.send(Envelope {
                generation,
                event: Incoming::History(result),
            });
        });
    }

    /// Mounts `complaint` unless it is already the mounted one.
    pub fn switch_room(&mut self, complaint: ComplaintId) {
        if self.complaint() != Some(&complaint) {
            self.mount(complaint);
        }
    }

    /// Leaves the mounted room, if any. Results still in flight for it are
    /// dropped when they arrive.
    pub fn unmount(&mut self) {
        if let Some(mut mount) = self.mount.take() {
            mount.channel.disconnect();
            info!(room = %mount.room, "unmounted");
        }
        self.generation += 1;
    }

    fn register_handlers(&self, channel: &RoomChannel, generation: u64) {
        let post = move |tx: mpsc::UnboundedSender<Envelope>| {
            move |event: Incoming| {
                let _ = tx.send(Envelope { generation, event });
            }
        };

        let send = post(self.events_tx.clone());
        channel.on_message(move |msg| send(Incoming::Message(msg)));
        let send = post(self.events_tx.clone());
        channel.on_presence(move |ids| send(Incoming::Presence(ids)));
        let send = post(self.events_tx.clone());
        channel.on_typing(move |participant_id, display_name| {
            send(Incoming::Typing {
                participant_id,
                display_name,
            })
        });
        let send = post(self.events_tx.clone());
        channel.on_error(move |err| send(Incoming::ChannelLost(err)));
    }

    pub fn input(&self) -> &str {
        self.mount.as_ref().map_or("", |m| m.composer.input())
    }

    /// Updates the input as the user types, emitting a throttled typing signal.
    pub fn set_input(&mut self, text: impl Into<String>) {
        let Some(mount) = self.mount.as_mut() else {
            return;
        };
        mount.composer.set_input(text);
        if !mount.composer.input().is_empty() && mount.throttle.should_emit(Instant::now()) {
            mount
                .channel
                .send_typing(&mount.room, &self.user.id, &self.user.name);
        }
    }

    /// Sends the current input. Returns the candidate's temporary id, or `None`
    /// for blank input, in which case nothing is appended, broadcast or
    /// persisted.
    pub fn submit(&mut self) -> Option<MessageId> {
        let mount = self.mount.as_mut()?;
        let candidate = match mount.composer.send() {
            Ok(candidate) => candidate,
            Err(err) => {
                debug!(%err, "nothing to send");
                return None;
            }
        };
        let candidate_id = candidate.id.clone();

        mount.throttle.reset();
        if !mount.channel.broadcast(&mount.room, &candidate) {
            debug!(candidate = %candidate_id, "candidate not broadcast, channel not connected");
        }

        let api = self.api.clone();
        let tx = self.events_tx.clone();
        let generation = self.generation;
        let complaint = mount.complaint.clone();
        let body = candidate.body.clone();
        let id = candidate_id.clone();
        tokio::spawn(async move {
            let result = api.send_message(&complaint, &body).await;
            let _ = tx.send(Envelope {
                generation,
                event: Incoming::Persisted { candidate: id, result },
            });
        });

        mount.log.apply(LogEvent::CandidateCreated(candidate));
        Some(candidate_id)
    }

    /// Waits for the next event, timer or connection change and applies it.
    /// Returns whether the view changed.
    pub async fn step(&mut self) -> bool {
        let deadline = self.mount.as_ref().and_then(|m| m.typing.next_deadline());
        let channel_state = self.mount.as_mut().map(|m| &mut m.channel_state);

        tokio::select! {
            Some(envelope) = self.events_rx.recv() => self.apply(envelope),
            _ = until(deadline) => self.expire_typing(),
            state = next_state(channel_state) => {
                debug!(%state, "channel state changed");
                true
            }
        }
    }

    fn expire_typing(&mut self) -> bool {
        self.mount
            .as_mut()
            .is_some_and(|m| m.typing.expire(Instant::now()))
    }

    fn apply(&mut self, envelope: Envelope) -> bool {
        if envelope.generation != self.generation {
            debug!(
                generation = envelope.generation,
                current = self.generation,
                "discarding result for a previous room"
            );
            return false;
        }
        let Some(mount) = self.mount.as_mut() else {
            return false;
        };

        match envelope.event {
            Incoming::Message(msg) => mount.log.apply(LogEvent::MessageReceived(msg)),
            Incoming::Presence(ids) => {
                mount.presence.apply_snapshot(ids, Instant::now());
                true
            }
            Incoming::Typing {
                participant_id,
                display_name,
            } => {
                if participant_id == self.user.id {
                    return false;
                }
                mount
                    .typing
                    .on_remote_typing(&participant_id, &display_name, Instant::now());
                true
            }
            Incoming::ChannelLost(err) => {
                // no live updates from here on, so nobody is known to be online or typing
                mount.presence.clear();
                mount.typing.clear();
                self.notices.push_back(Notice::ConnectionLost(err.to_string()));
                true
            }
            Incoming::History(Ok(history)) => mount.log.apply(LogEvent::HistoryLoaded(history)),
            Incoming::History(Err(err)) => {
                warn!(complaint = %mount.complaint, %err, "history fetch failed");
                mount.log.apply(LogEvent::HistoryFailed);
                self.notices
                    .push_back(Notice::HistoryUnavailable(err.to_string()));
                true
            }
            Incoming::Persisted {
                candidate,
                result: Ok(durable),
            } => mount.log.apply(LogEvent::SendAccepted { candidate, durable }),
            Incoming::Persisted {
                candidate,
                result: Err(err),
            } => {
                let reason = err.to_string();
                let err = ChatError::Persistence {
                    candidate: candidate.clone(),
                    reason: reason.clone(),
                };
                warn!(%err, "durable send failed, candidate stays visible");
                mount.log.apply(LogEvent::SendFailed {
                    candidate: candidate.clone(),
                });
                self.notices
                    .push_back(Notice::SendFailed { candidate, reason });
                true
            }
        }
    }

    pub fn messages(&self) -> &[Message] {
        self.mount.as_ref().map_or(&[], |m| m.log.messages())
    }

    pub fn history_state(&self) -> Option<HistoryState> {
        self.mount.as_ref().map(|m| m.log.history_state())
    }

    pub fn is_online(&self, participant_id: &str) -> bool {
        self.mount
            .as_ref()
            .is_some_and(|m| m.presence.is_online(participant_id))
    }

    pub fn typing_banner(&self) -> Option<String> {
        let mount = self.mount.as_ref()?;
        banner(&mount.typing.typists(Instant::now()))
    }

    pub fn status(&self) -> ConnectionStatus {
        match self.mount.as_ref().map(|m| m.channel.state()) {
            None => ConnectionStatus::Offline,
            Some(ChannelState::Idle | ChannelState::Connecting) => ConnectionStatus::Connecting,
            Some(ChannelState::Joined) => ConnectionStatus::Live,
            Some(ChannelState::Leaving | ChannelState::Disconnected) => {
                ConnectionStatus::Disconnected
            }
        }
    }

    pub fn take_notices(&mut self) -> Vec<Notice> {
        self.notices.drain(..).collect()
    }

    /// Snapshot of everything the host renders.
    pub fn view(&self) -> ChatView {
        let now = Instant::now();
        let Some(mount) = self.mount.as_ref() else {
            return ChatView::default();
        };

        let mut participants: Vec<ParticipantBadge> = Vec::new();
        for msg in mount.log.messages() {
            if msg.is_from(&self.user.id) || participants.iter().any(|p| p.id == msg.sender.id) {
                continue;
            }
            participants.push(ParticipantBadge {
                id: msg.sender.id.clone(),
                name: msg.sender.name.clone(),
                online: mount.presence.is_online_at(&msg.sender.id, now),
            });
        }

        let messages = mount
            .log
            .messages()
            .iter()
            .map(|msg| MessageLine {
                id: msg.id.clone(),
                sender: msg.sender.name.clone(),
                body: msg.body.clone(),
                created_at: msg.created_at,
                own: msg.is_from(&self.user.id),
                pending: msg.id.is_temporary(),
                failed: mount.log.is_failed(&msg.id),
            })
            .collect();

        ChatView {
            complaint: Some(mount.complaint.clone()),
            status: self.status(),
            history: mount.log.history_state(),
            participants,
            messages,
            typing: banner(&mount.typing.typists(now)),
            input: mount.composer.input().to_owned(),
        }
    }
}

impl<A> Drop for ChatSession<A> {
    fn drop(&mut self) {
        if let Some(mut mount) = self.mount.take() {
            mount.channel.disconnect();
        }
    }
}

async fn next_state(rx: Option<&mut watch::Receiver<ChannelState>>) -> ChannelState {
    if let Some(rx) = rx {
        if rx.changed().await.is_ok() {
            return *rx.borrow_and_update();
        }
    }
    std::future::pending().await
}
