pub mod api;
pub mod channel;
pub mod composer;
pub mod config;
pub mod error;
pub mod model;
pub mod presence;
pub mod reconcile;
pub mod res;
pub mod session;
pub mod typing;
pub mod view;
pub mod wire;

pub use api::{ComplaintApi, HttpComplaintApi};
pub use channel::{ChannelState, RoomChannel};
pub use config::Config;
pub use error::{ChatError, ChatResult};
pub use model::{AuthUser, ComplaintId, Message, MessageId, Participant, RoomKey};
pub use reconcile::{LogEvent, MessageLog, merge};
pub use session::{ChatSession, Notice};
pub use view::{ChatView, ConnectionStatus};
