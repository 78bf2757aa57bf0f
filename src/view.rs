use std::fmt::Write as _;

use pulldown_cmark::{Event, Options, Parser};
use time::{OffsetDateTime, format_description::BorrowedFormatItem, macros::format_description};

use crate::{
    include_res,
    model::{ComplaintId, MessageId},
    reconcile::HistoryState,
};

const CLOCK: &[BorrowedFormatItem<'static>] = format_description!("[hour]:[minute]");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionStatus {
    /// Nothing mounted.
    #[default]
    Offline,
    Connecting,
    Live,
    /// The channel is gone; only history and local sends are shown.
    Disconnected,
}

impl ConnectionStatus {
    pub fn label(self) -> &'static str {
        match self {
            ConnectionStatus::Offline => "offline",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Live => "live",
            ConnectionStatus::Disconnected => "disconnected",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParticipantBadge {
    pub id: String,
    pub name: String,
    pub online: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageLine {
    pub id: MessageId,
    pub sender: String,
    pub body: String,
    pub created_at: OffsetDateTime,
    pub own: bool,
    /// Not persisted yet.
    pub pending: bool,
    pub failed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatView {
    pub complaint: Option<ComplaintId>,
    pub status: ConnectionStatus,
    pub history: HistoryState,
    /// Other senders seen in the thread, in order of first message.
    pub participants: Vec<ParticipantBadge>,
    pub messages: Vec<MessageLine>,
    pub typing: Option<String>,
    pub input: String,
}

impl Default for ChatView {
    fn default() -> Self {
        Self {
            complaint: None,
            status: ConnectionStatus::Offline,
            history: HistoryState::Pending,
            participants: Vec::new(),
            messages: Vec::new(),
            typing: None,
            input: String::new(),
        }
    }
}

fn clock(at: OffsetDateTime) -> String {
    at.format(CLOCK).unwrap_or_default()
}

/// Plain text rendering for a terminal.
pub fn render_text(view: &ChatView) -> String {
    let mut out = String::new();
    let room = view
        .complaint
        .as_ref()
        .map_or_else(|| "-".to_owned(), |c| c.room_key().to_string());
    let _ = writeln!(out, "== {room} [{}]", view.status.label());

    if !view.participants.is_empty() {
        let badges: Vec<String> = view
            .participants
            .iter()
            .map(|p| format!("{} ({})", p.name, if p.online { "online" } else { "offline" }))
            .collect();
        let _ = writeln!(out, "   {}", badges.join(", "));
    }
    if view.history == HistoryState::Pending {
        let _ = writeln!(out, "   loading messages...");
    }

    for line in &view.messages {
        let marker = if line.failed {
            " (not sent)"
        } else if line.pending {
            " (sending)"
        } else {
            ""
        };
        let who = if line.own { "you" } else { line.sender.as_str() };
        let _ = writeln!(out, "{} {who:>12} | {}{marker}", clock(line.created_at), line.body);
    }

    if let Some(typing) = &view.typing {
        let _ = writeln!(out, "   {typing}");
    }
    out
}

/// HTML fragment of the chat panel. Message bodies are markdown; raw HTML in
/// them is escaped.
pub fn render_html(view: &ChatView) -> String {
    let mut participants = String::new();
    for p in &view.participants {
        let (presence, label) = if p.online {
            ("online", "Online")
        } else {
            ("offline", "Offline")
        };
        let initial = p.name.chars().next().map(String::from).unwrap_or_default();
        participants += &fill(
            include_res!(str, "/chat/participant.html"),
            &[
                ("presence", presence),
                ("presence_label", label),
                ("id", &escape(&p.id)),
                ("initial", &escape(&initial)),
                ("name", &escape(&p.name)),
            ],
        );
    }

    let mut messages = String::new();
    for line in &view.messages {
        let state = if line.failed {
            " failed"
        } else if line.pending {
            " pending"
        } else {
            ""
        };
        messages += &fill(
            include_res!(str, "/chat/message.html"),
            &[
                ("side", if line.own { "own" } else { "remote" }),
                ("state", state),
                ("id", &escape(line.id.as_str())),
                ("time", &clock(line.created_at)),
                ("sender", &escape(&line.sender)),
                ("content", &markdown(&line.body)),
            ],
        );
    }

    let typing = view
        .typing
        .as_ref()
        .map(|banner| fill(include_res!(str, "/chat/typing.html"), &[("banner", &escape(banner))]))
        .unwrap_or_default();
    let room = view
        .complaint
        .as_ref()
        .map(|c| c.room_key().to_string())
        .unwrap_or_default();

    fill(
        include_res!(str, "/chat/view.html"),
        &[
            ("room", &escape(&room)),
            ("status", view.status.label()),
            ("participants", &participants),
            ("messages", &messages),
            ("typing", &typing),
            ("input", &escape(&view.input)),
        ],
    )
}

fn markdown(body: &str) -> String {
    let parser = Parser::new_ext(body, Options::empty()).map(|event| match event {
        Event::Html(raw) | Event::InlineHtml(raw) => Event::Text(raw),
        _ => event,
    });
    let mut html = String::new();
    pulldown_cmark::html::push_html(&mut html, parser);
    html
}

/// Substitutes `{key}` placeholders in one pass, so substituted text is never
/// scanned for placeholders itself. Unknown keys are left as they are.
fn fill(template: &str, vars: &[(&str, &str)]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let value = after
            .find('}')
            .and_then(|close| {
                let key = &after[..close];
                vars.iter()
                    .find(|(k, _)| *k == key)
                    .map(|(_, v)| (*v, close))
            });
        match value {
            Some((value, close)) => {
                out.push_str(value);
                rest = &after[close + 1..];
            }
            None => {
                out.push('{');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;

    use super::*;

    fn view() -> ChatView {
        ChatView {
            complaint: Some(ComplaintId::new("7")),
            status: ConnectionStatus::Live,
            history: HistoryState::Loaded,
            participants: vec![ParticipantBadge {
                id: "u2".into(),
                name: "Bea".into(),
                online: true,
            }],
            messages: vec![
                MessageLine {
                    id: MessageId::new("m1"),
                    sender: "Bea".into(),
                    body: "**hi** <script>x</script>".into(),
                    created_at: datetime!(2024-03-01 10:05:00 UTC),
                    own: false,
                    pending: false,
                    failed: false,
                },
                MessageLine {
                    id: MessageId::new("temp-1"),
                    sender: "Asha".into(),
                    body: "{messages}".into(),
                    created_at: datetime!(2024-03-01 10:06:00 UTC),
                    own: true,
                    pending: true,
                    failed: true,
                },
            ],
            typing: Some("Bea is typing...".into()),
            input: String::new(),
        }
    }

    #[test]
    fn text_rendering_shows_badges_messages_and_banner() {
        let text = render_text(&view());
        assert!(text.starts_with("== complaint_7 [live]"));
        assert!(text.contains("Bea (online)"));
        assert!(text.contains("10:05          Bea | **hi**"));
        assert!(text.contains("you | {messages} (not sent)"));
        assert!(text.contains("Bea is typing..."));
    }

    #[test]
    fn html_rendering_escapes_and_formats() {
        let html = render_html(&view());
        assert!(html.contains(r#"data-room="complaint_7""#));
        assert!(html.contains("<strong>hi</strong>"));
        assert!(html.contains("&lt;script&gt;"));
        assert!(!html.contains("<script>"));
        assert!(html.contains(r#"class="message own failed""#));
        assert!(html.contains(r#"class="participant online""#));
        // placeholder text inside a body is not substituted again
        assert!(html.contains("<p>{messages}</p>"));
    }

    #[test]
    fn fill_leaves_unknown_and_unbalanced_braces() {
        assert_eq!(fill("{a}-{b}-{", &[("a", "1")]), "1-{b}-{");
    }
}
