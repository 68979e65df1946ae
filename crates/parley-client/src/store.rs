use std::collections::{HashMap, HashSet};

use tokio::sync::mpsc;
use uuid::Uuid;

use parley_types::events::{GatewayCommand, GatewayEvent};
use parley_types::models::{Message, MessageStatus};

/// Client-side state for one user's chat session.
///
/// Holds the ordered message list for the active conversation plus
/// per-partner typing and read-status caches. Everything here is a cache of
/// server state, rebuilt from pushed events — the store is never treated as
/// authoritative across a connection boundary.
pub struct ChatStore {
    local_user: Uuid,
    active_peer: Option<Uuid>,
    messages: Vec<Message>,
    typing: HashMap<Uuid, bool>,
    read_status: HashMap<Uuid, MessageStatus>,
    online: HashSet<Uuid>,
    outbound: mpsc::UnboundedSender<GatewayCommand>,
}

impl ChatStore {
    pub fn new(local_user: Uuid, outbound: mpsc::UnboundedSender<GatewayCommand>) -> Self {
        Self {
            local_user,
            active_peer: None,
            messages: Vec::new(),
            typing: HashMap::new(),
            read_status: HashMap::new(),
            online: HashSet::new(),
            outbound,
        }
    }

    /// Switch the active conversation, replacing the local message list with
    /// the server-fetched history. Only one conversation's events are
    /// applied at a time, so switching implicitly detaches the previous
    /// conversation — there is no path to duplicate delivery.
    pub fn select_conversation(&mut self, peer_id: Uuid, history: Vec<Message>) {
        self.active_peer = Some(peer_id);
        self.messages = history;
        self.typing.remove(&peer_id);
        self.maybe_mark_read();
    }

    pub fn clear_conversation(&mut self) {
        self.active_peer = None;
        self.messages.clear();
    }

    /// Apply one pushed event to local state. Two distinct reconciliation
    /// operations exist for messages: append (new-message) and bulk status
    /// rewrite (conversation-read); nothing else mutates the list.
    pub fn apply_event(&mut self, event: GatewayEvent) {
        match event {
            GatewayEvent::NewMessage { message } => {
                let Some(peer) = self.active_peer else {
                    return;
                };
                // Append only messages that belong to the active conversation.
                if message.sender_id == peer || message.receiver_id == peer {
                    self.messages.push(message);
                    self.maybe_mark_read();
                }
            }

            GatewayEvent::Typing {
                sender_id,
                is_typing,
            } => {
                if self.active_peer == Some(sender_id) {
                    self.typing.insert(sender_id, is_typing);
                }
            }

            GatewayEvent::ConversationRead { partner_id, status } => {
                if self.active_peer == Some(partner_id) {
                    // Bulk rewrite: every held message takes the new status.
                    // Coarser than per-message receipts, accepted as-is.
                    for message in &mut self.messages {
                        message.status = status;
                    }
                    self.read_status.insert(partner_id, status);
                }
            }

            GatewayEvent::MessageRead { reader_id, .. } => {
                if self.active_peer == Some(reader_id) {
                    for message in &mut self.messages {
                        if message.sender_id == self.local_user {
                            message.status = MessageStatus::Read;
                        }
                    }
                    self.read_status.insert(reader_id, MessageStatus::Read);
                }
            }

            GatewayEvent::OnlineUsers { user_ids } => {
                self.online = user_ids.into_iter().collect();
            }

            GatewayEvent::Ready { .. } => {}
        }
    }

    /// Append the local user's own message once the server has acknowledged
    /// it. There is no optimistic insert — a failed send leaves local state
    /// untouched.
    pub fn append_sent(&mut self, message: Message) {
        if self.active_peer == Some(message.receiver_id) {
            self.messages.push(message);
        }
    }

    /// The newest message in the active conversation was authored by the
    /// partner, so the local user is looking at something unread: ask the
    /// server to mark the conversation read. A heuristic, not a precise
    /// visibility signal.
    fn maybe_mark_read(&self) {
        let Some(peer) = self.active_peer else {
            return;
        };
        let Some(last) = self.messages.last() else {
            return;
        };
        if last.sender_id != self.local_user {
            let _ = self.outbound.send(GatewayCommand::MarkConversationRead {
                sender_id: peer,
                receiver_id: self.local_user,
            });
        }
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn active_peer(&self) -> Option<Uuid> {
        self.active_peer
    }

    pub fn is_partner_typing(&self) -> bool {
        self.active_peer
            .and_then(|peer| self.typing.get(&peer).copied())
            .unwrap_or(false)
    }

    pub fn partner_read_status(&self, partner_id: Uuid) -> Option<MessageStatus> {
        self.read_status.get(&partner_id).copied()
    }

    pub fn is_online(&self, user_id: Uuid) -> bool {
        self.online.contains(&user_id)
    }
}
