//! In-process messaging network implementing the transport ports.
//!
//! Used for local runs of the binary and as the test double for the bot core.
//! It keeps conversations, registered identities and live feeds in memory, and
//! can be told to fail specific operations to drill the failure paths.

mod client;

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
};

use futures_util::StreamExt;
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tracing::debug;

use crate::{
    config::{NetworkEnv, WalletKey},
    domain::*,
    errors::Error,
    ports::MessageFeed,
    Result,
};

pub use client::{LoopbackClient, LoopbackDirect, LoopbackGroup};

/// Operations that can be made to fail on demand.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Fault {
    StreamOpen,
    ListGroups,
    MemberRead,
    AddMembers,
    Promote,
    Send,
    Lookup,
}

/// A message as stored in a loopback conversation.
#[derive(Clone, Debug)]
pub struct StoredMessage {
    pub id: MessageId,
    pub sender: InboxId,
    pub content_type: ContentType,
    pub text: Option<String>,
}

#[derive(Clone, Debug)]
struct Account {
    inbox_id: InboxId,
    address: Address,
    registered: bool,
}

#[derive(Debug)]
enum ConvKind {
    Group {
        name: String,
        description: String,
        image_url: String,
        members: Vec<(InboxId, Role)>,
    },
    Direct {
        a: InboxId,
        b: InboxId,
    },
}

#[derive(Debug)]
struct ConvRecord {
    id: ConversationId,
    kind: ConvKind,
    messages: Vec<StoredMessage>,
}

impl ConvRecord {
    fn has_member(&self, inbox: &InboxId) -> bool {
        match &self.kind {
            ConvKind::Group { members, .. } => members.iter().any(|(m, _)| m == inbox),
            ConvKind::Direct { a, b } => a == inbox || b == inbox,
        }
    }

    fn role_of(&self, inbox: &InboxId) -> Option<Role> {
        match &self.kind {
            ConvKind::Group { members, .. } => members
                .iter()
                .find(|(m, _)| m == inbox)
                .map(|(_, role)| *role),
            ConvKind::Direct { .. } => None,
        }
    }
}

type FeedItem = Result<Option<InboundMessage>>;

struct Feed {
    owner: InboxId,
    tx: mpsc::UnboundedSender<FeedItem>,
}

#[derive(Default)]
struct NetState {
    accounts: Vec<Account>,
    conversations: Vec<ConvRecord>,
    feeds: Vec<Feed>,
    faults: HashMap<Fault, u32>,
    next_id: u64,
    stream_open_attempts: u32,
    member_add_calls: u32,
}

impl NetState {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}-{:06}", self.next_id)
    }

    /// Consume one pending failure of `fault`, if any.
    fn take_fault(&mut self, fault: Fault) -> bool {
        match self.faults.get_mut(&fault) {
            Some(n) if *n > 0 => {
                *n -= 1;
                true
            }
            _ => false,
        }
    }

    fn fail_if(&mut self, fault: Fault) -> Result<()> {
        if self.take_fault(fault) {
            let msg = format!("injected {fault:?} failure");
            return Err(match fault {
                Fault::StreamOpen => Error::Stream(msg),
                _ => Error::Transport(msg),
            });
        }
        Ok(())
    }

    fn account_by_inbox(&self, inbox: &InboxId) -> Option<&Account> {
        self.accounts.iter().find(|a| a.inbox_id == *inbox)
    }

    fn resolve(&self, identity: &Identity) -> Result<InboxId> {
        let found = match identity {
            Identity::Inbox(id) => self.account_by_inbox(id),
            Identity::Address(addr) => self.accounts.iter().find(|a| a.address == *addr),
        };
        found
            .map(|a| a.inbox_id.clone())
            .ok_or_else(|| Error::Transport(format!("no inbox registered for {identity}")))
    }

    fn conv(&self, id: &ConversationId) -> Option<&ConvRecord> {
        self.conversations.iter().find(|c| c.id == *id)
    }

    fn conv_mut(&mut self, id: &ConversationId) -> Result<&mut ConvRecord> {
        self.conversations
            .iter_mut()
            .find(|c| c.id == *id)
            .ok_or_else(|| Error::NotFound(format!("conversation {id}")))
    }

    fn member_view(&self, inbox: &InboxId, role: Role) -> Member {
        Member {
            inbox_id: inbox.clone(),
            account_addresses: self
                .accounts
                .iter()
                .filter(|a| a.inbox_id == *inbox)
                .map(|a| a.address.clone())
                .collect(),
            role,
        }
    }

    /// Store a message and fan it out to the feeds of every conversation member.
    fn post(
        &mut self,
        conv_id: &ConversationId,
        sender: &InboxId,
        content_type: ContentType,
        text: Option<String>,
    ) -> Result<InboundMessage> {
        let id = MessageId(self.next_id("msg"));
        let conv = self.conv_mut(conv_id)?;
        if !conv.has_member(sender) {
            return Err(Error::Transport(format!(
                "{sender} is not a member of {conv_id}"
            )));
        }
        conv.messages.push(StoredMessage {
            id: id.clone(),
            sender: sender.clone(),
            content_type: content_type.clone(),
            text: text.clone(),
        });

        let event = InboundMessage {
            id,
            sender_inbox_id: sender.clone(),
            conversation_id: Some(conv_id.clone()),
            content_type,
            text,
        };

        let Some(conv) = self.conv(conv_id) else {
            return Ok(event);
        };
        let audience: Vec<InboxId> = self
            .feeds
            .iter()
            .map(|f| f.owner.clone())
            .filter(|owner| conv.has_member(owner))
            .collect();
        self.feeds.retain(|f| {
            if !audience.contains(&f.owner) {
                return true;
            }
            f.tx.send(Ok(Some(event.clone()))).is_ok()
        });

        Ok(event)
    }
}

/// Handle to a shared in-memory network. Clones share state.
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    state: Arc<Mutex<NetState>>,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, NetState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Open a session for the holder of `key`. The inbox id and address are
    /// derived deterministically from the key, so reconnecting with the same
    /// key restores the same identity.
    pub fn connect(&self, key: &WalletKey, env: NetworkEnv) -> LoopbackClient {
        let inbox_digest = Sha256::digest(key.as_bytes());
        let address_digest = Sha256::digest(inbox_digest);
        let identity = SessionIdentity {
            inbox_id: InboxId::new(hex::encode(inbox_digest)),
            address: Address::new(format!("0x{}", hex::encode(&address_digest[12..]))),
        };

        let mut st = self.state();
        if st.account_by_inbox(&identity.inbox_id).is_none() {
            st.accounts.push(Account {
                inbox_id: identity.inbox_id.clone(),
                address: identity.address.clone(),
                registered: false,
            });
        }
        drop(st);

        debug!(inbox_id = %identity.inbox_id, env = env.as_str(), "loopback session opened");
        LoopbackClient::new(self.clone(), identity)
    }

    /// Register an external party by address.
    pub fn participant(&self, address: Address) -> Participant {
        let digest = Sha256::digest(address.as_str().trim().to_ascii_lowercase().as_bytes());
        let inbox_id = InboxId::new(hex::encode(digest));

        let mut st = self.state();
        if st.account_by_inbox(&inbox_id).is_none() {
            st.accounts.push(Account {
                inbox_id: inbox_id.clone(),
                address: address.clone(),
                registered: true,
            });
        }
        drop(st);

        Participant {
            net: self.clone(),
            inbox_id,
            address,
        }
    }

    /// Make the next `times` calls of `fault` fail.
    pub fn fail_next(&self, fault: Fault, times: u32) {
        *self.state().faults.entry(fault).or_insert(0) += times;
    }

    /// End every open feed cleanly. Events already delivered are still drained.
    pub fn close_feeds(&self) {
        self.state().feeds.clear();
    }

    /// Fail every open feed with a stream-level error.
    pub fn break_feeds(&self, reason: &str) {
        let mut st = self.state();
        for feed in st.feeds.drain(..) {
            let _ = feed.tx.send(Err(Error::Stream(reason.to_string())));
        }
    }

    /// Deliver an empty event to every open feed.
    pub fn inject_absent(&self) {
        self.state()
            .feeds
            .retain(|f| f.tx.send(Ok(None)).is_ok());
    }

    pub fn open_feeds(&self) -> usize {
        self.state().feeds.iter().filter(|f| !f.tx.is_closed()).count()
    }

    pub fn stream_open_attempts(&self) -> u32 {
        self.state().stream_open_attempts
    }

    /// Number of member-add calls that reached the network, across all groups.
    pub fn member_add_calls(&self) -> u32 {
        self.state().member_add_calls
    }

    pub fn group_count_named(&self, name: &str) -> usize {
        self.state()
            .conversations
            .iter()
            .filter(|c| matches!(&c.kind, ConvKind::Group { name: n, .. } if n == name))
            .count()
    }

    pub fn messages(&self, conv: &ConversationId) -> Vec<StoredMessage> {
        self.state()
            .conv(conv)
            .map(|c| c.messages.clone())
            .unwrap_or_default()
    }

    pub fn dm_between(&self, a: &InboxId, b: &InboxId) -> Option<ConversationId> {
        self.state()
            .conversations
            .iter()
            .find(|c| match &c.kind {
                ConvKind::Direct { a: x, b: y } => (x == a && y == b) || (x == b && y == a),
                ConvKind::Group { .. } => false,
            })
            .map(|c| c.id.clone())
    }

    fn open_feed(&self, owner: &InboxId) -> Result<MessageFeed> {
        let mut st = self.state();
        st.stream_open_attempts += 1;
        st.fail_if(Fault::StreamOpen)?;

        let (tx, rx) = mpsc::unbounded_channel::<FeedItem>();
        st.feeds.push(Feed {
            owner: owner.clone(),
            tx,
        });

        Ok(futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .boxed())
    }

    fn find_or_create_dm(&self, from: &InboxId, to: &InboxId) -> Result<ConversationId> {
        if let Some(id) = self.dm_between(from, to) {
            return Ok(id);
        }
        let mut st = self.state();
        if st.account_by_inbox(to).is_none() {
            return Err(Error::Transport(format!("no inbox registered for {to}")));
        }
        let id = ConversationId(st.next_id("dm"));
        st.conversations.push(ConvRecord {
            id: id.clone(),
            kind: ConvKind::Direct {
                a: from.clone(),
                b: to.clone(),
            },
            messages: Vec::new(),
        });
        Ok(id)
    }
}

/// An external party on the loopback network.
#[derive(Clone)]
pub struct Participant {
    net: LoopbackNetwork,
    inbox_id: InboxId,
    address: Address,
}

impl Participant {
    pub fn inbox_id(&self) -> InboxId {
        self.inbox_id.clone()
    }

    pub fn address(&self) -> Address {
        self.address.clone()
    }

    /// Send a text DM to `to`, opening the conversation if needed.
    pub fn send_dm(&self, to: &InboxId, text: &str) -> Result<InboundMessage> {
        self.send_content(to, ContentType::Text, Some(text.to_string()))
    }

    pub fn send_content(
        &self,
        to: &InboxId,
        content_type: ContentType,
        text: Option<String>,
    ) -> Result<InboundMessage> {
        let conv = self.net.find_or_create_dm(&self.inbox_id, to)?;
        self.net
            .state()
            .post(&conv, &self.inbox_id, content_type, text)
    }

    pub fn send_to_group(&self, group: &ConversationId, text: &str) -> Result<InboundMessage> {
        self.net
            .state()
            .post(group, &self.inbox_id, ContentType::Text, Some(text.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::{Conversation, GroupOptions, TransportClient};

    fn key(byte: u8) -> WalletKey {
        WalletKey::parse(&hex::encode([byte; 32])).unwrap()
    }

    #[test]
    fn connect_is_deterministic_per_key() {
        let net = LoopbackNetwork::new();
        let a = net.connect(&key(1), NetworkEnv::Dev);
        let b = net.connect(&key(1), NetworkEnv::Production);
        let c = net.connect(&key(2), NetworkEnv::Dev);

        assert_eq!(a.identity(), b.identity());
        assert_ne!(a.identity(), c.identity());
        assert!(Address::looks_valid(a.identity().address.as_str()));
    }

    #[tokio::test]
    async fn dm_reaches_recipient_feed_and_closes_cleanly() {
        let net = LoopbackNetwork::new();
        let bot = net.connect(&key(1), NetworkEnv::Dev);
        let alice = net.participant(Address::new(
            "0x1111111111111111111111111111111111111111",
        ));

        let mut feed = bot.stream_all_messages().await.unwrap();
        let sent = alice.send_dm(&bot.identity().inbox_id, "hi").unwrap();
        net.close_feeds();

        let got = feed.next().await.unwrap().unwrap().unwrap();
        assert_eq!(got.id, sent.id);
        assert_eq!(got.text.as_deref(), Some("hi"));
        assert!(feed.next().await.is_none());

        let conv = bot
            .conversation_by_id(got.conversation_id.as_ref().unwrap())
            .await
            .unwrap();
        assert!(matches!(conv, Some(Conversation::Direct(_))));
    }

    #[tokio::test]
    async fn broken_feed_yields_stream_error() {
        let net = LoopbackNetwork::new();
        let bot = net.connect(&key(1), NetworkEnv::Dev);
        let mut feed = bot.stream_all_messages().await.unwrap();
        net.break_feeds("connection reset");

        let err = feed.next().await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Stream(_)));
        assert!(feed.next().await.is_none());
    }

    #[tokio::test]
    async fn faults_are_consumed_one_call_at_a_time() {
        let net = LoopbackNetwork::new();
        let bot = net.connect(&key(1), NetworkEnv::Dev);
        net.fail_next(Fault::StreamOpen, 2);

        assert!(bot.stream_all_messages().await.is_err());
        assert!(bot.stream_all_messages().await.is_err());
        assert!(bot.stream_all_messages().await.is_ok());
        assert_eq!(net.stream_open_attempts(), 3);
    }

    #[tokio::test]
    async fn outsiders_cannot_post_into_groups() {
        let net = LoopbackNetwork::new();
        let bot = net.connect(&key(1), NetworkEnv::Dev);
        let group = bot
            .new_group(&[], GroupOptions::default())
            .await
            .unwrap();
        let eve = net.participant(Address::new(
            "0x2222222222222222222222222222222222222222",
        ));

        assert!(eve.send_to_group(group.id(), "let me in").is_err());
        assert!(bot.conversation_by_id(group.id()).await.unwrap().is_some());
    }
}
