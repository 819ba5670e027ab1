use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::BoxStream;

use crate::{domain::*, Result};

/// Live feed of inbound messages across every conversation visible to the session.
///
/// `Ok(None)` is an absent message (skipped). `Err` is a stream-level failure:
/// the feed is considered dead and the supervisor reconnects.
pub type MessageFeed = BoxStream<'static, Result<Option<InboundMessage>>>;

/// Metadata for a newly created group.
#[derive(Clone, Debug, Default)]
pub struct GroupOptions {
    pub name: String,
    pub description: String,
    pub image_url: String,
}

/// Operations shared by every conversation kind.
#[async_trait]
pub trait ConversationPort: Send + Sync {
    fn id(&self) -> &ConversationId;

    /// Send a plaintext message into the conversation.
    async fn send(&self, text: &str) -> Result<MessageId>;
}

/// Two-party conversation between the bot and one sender.
pub trait DirectConversation: ConversationPort {}

/// Multi-party conversation with roles.
#[async_trait]
pub trait GroupConversation: ConversationPort {
    fn name(&self) -> String;

    async fn members(&self) -> Result<Vec<Member>>;
    async fn add_members(&self, identities: &[Identity]) -> Result<()>;
    async fn add_admin(&self, inbox_id: &InboxId) -> Result<()>;
    async fn add_super_admin(&self, inbox_id: &InboxId) -> Result<()>;
}

/// A resolved conversation. Kind discrimination happens here and nowhere else.
#[derive(Clone)]
pub enum Conversation {
    Group(Arc<dyn GroupConversation>),
    Direct(Arc<dyn DirectConversation>),
}

impl Conversation {
    pub fn id(&self) -> &ConversationId {
        match self {
            Conversation::Group(g) => g.id(),
            Conversation::Direct(d) => d.id(),
        }
    }
}

impl std::fmt::Debug for Conversation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Conversation::Group(g) => write!(f, "Group({})", g.id()),
            Conversation::Direct(d) => write!(f, "Direct({})", d.id()),
        }
    }
}

/// Hexagonal port for the messaging network session.
///
/// Implementations own the signing identity; the bot core only sees the
/// resulting inbox id and address.
#[async_trait]
pub trait TransportClient: Send + Sync {
    fn identity(&self) -> &SessionIdentity;

    async fn is_registered(&self) -> Result<bool>;
    async fn register(&self) -> Result<()>;

    async fn list_groups(&self) -> Result<Vec<Arc<dyn GroupConversation>>>;
    async fn new_group(
        &self,
        members: &[Identity],
        opts: GroupOptions,
    ) -> Result<Arc<dyn GroupConversation>>;
    async fn conversation_by_id(&self, id: &ConversationId) -> Result<Option<Conversation>>;

    /// Open the live feed. Failing to open is a stream-level error.
    async fn stream_all_messages(&self) -> Result<MessageFeed>;
}
