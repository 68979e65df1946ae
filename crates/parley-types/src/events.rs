use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{Message, MessageStatus};

/// Events pushed FROM server TO client over the WebSocket gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum GatewayEvent {
    /// Server confirms the connection is authenticated and registered.
    Ready { user_id: Uuid, username: String },

    /// A new message addressed to this connection's user was persisted.
    NewMessage { message: Message },

    /// The peer started or stopped typing. Ephemeral — never persisted.
    Typing { sender_id: Uuid, is_typing: bool },

    /// Every message of the conversation with `partner_id` now carries
    /// `status`. Sent to both participants after a conversation-level read.
    ConversationRead {
        partner_id: Uuid,
        status: MessageStatus,
    },

    /// Receipt for a fine-grained mark-read: `reader_id` viewed
    /// `updated_count` of this connection's messages.
    MessageRead {
        reader_id: Uuid,
        updated_count: usize,
    },

    /// Full set of currently connected users. Broadcast to everyone each
    /// time a user connects or disconnects.
    OnlineUsers { user_ids: Vec<Uuid> },
}

/// Commands sent FROM client TO server over the WebSocket gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum GatewayCommand {
    /// Relay a typing indicator to `receiver_id`. The server keeps no state
    /// for this — if the receiver is offline the signal is dropped.
    Typing { receiver_id: Uuid, is_typing: bool },

    /// Mark every message from `sender_id` to `receiver_id` as read,
    /// regardless of per-reader receipt tracking.
    MarkConversationRead { sender_id: Uuid, receiver_id: Uuid },
}
