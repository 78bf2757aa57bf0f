use std::time::Duration;

use crate::{
    error::{ChatError, ChatResult},
    model::AuthUser,
    reconcile::DEFAULT_SUPERSEDE_WINDOW,
    typing::{DEFAULT_TYPING_THROTTLE, DEFAULT_TYPING_WINDOW},
};

#[derive(Debug, Clone)]
pub struct Config {
    /// Base URL of the realtime server, http(s) or ws(s).
    pub socket_url: String,
    /// Base URL of the REST api.
    pub api_url: String,
    pub token: String,
    pub user: AuthUser,
    pub typing_window: Duration,
    pub typing_throttle: Duration,
    pub presence_grace: Duration,
    pub supersede_window: time::Duration,
}

impl Config {
    pub fn new(socket_url: impl Into<String>, token: impl Into<String>, user: AuthUser) -> Self {
        let socket_url = socket_url.into();
        Self {
            api_url: default_api_url(&socket_url),
            socket_url,
            token: token.into(),
            user,
            typing_window: DEFAULT_TYPING_WINDOW,
            typing_throttle: DEFAULT_TYPING_THROTTLE,
            presence_grace: Duration::ZERO,
            supersede_window: DEFAULT_SUPERSEDE_WINDOW,
        }
    }

    /// Reads `CHAT_*` variables, loading a `.env` file first if there is one.
    pub fn from_env() -> ChatResult<Self> {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| dotenv::var(key).ok())
    }

    pub fn from_lookup(var: impl Fn(&str) -> Option<String>) -> ChatResult<Self> {
        let required = |key: &str| var(key).ok_or_else(|| ChatError::Config(format!("{key} is not set")));

        let user = AuthUser {
            id: required("CHAT_USER_ID")?,
            name: required("CHAT_USER_NAME")?,
            role: var("CHAT_USER_ROLE").unwrap_or_else(|| "user".to_owned()),
        };
        let mut config = Self::new(required("CHAT_SOCKET_URL")?, required("CHAT_TOKEN")?, user);

        if let Some(api_url) = var("CHAT_API_URL") {
            config.api_url = api_url;
        }
        let millis = |key: &str| -> ChatResult<Option<u64>> {
            var(key)
                .map(|raw| {
                    raw.trim()
                        .parse::<u64>()
                        .map_err(|e| ChatError::Config(format!("{key}={raw}: {e}")))
                })
                .transpose()
        };
        if let Some(ms) = millis("CHAT_TYPING_WINDOW_MS")? {
            config.typing_window = Duration::from_millis(ms);
        }
        if let Some(ms) = millis("CHAT_TYPING_THROTTLE_MS")? {
            config.typing_throttle = Duration::from_millis(ms);
        }
        if let Some(ms) = millis("CHAT_PRESENCE_GRACE_MS")? {
            config.presence_grace = Duration::from_millis(ms);
        }
        if let Some(ms) = millis("CHAT_SUPERSEDE_WINDOW_MS")? {
            config.supersede_window = time::Duration::milliseconds(ms as i64);
        }

        Ok(config)
    }
}

fn default_api_url(socket_url: &str) -> String {
    format!("{}/api", socket_url.trim_end_matches('/'))
}
