//! Per-message handling: filter, resolve the conversation, enroll the sender.
//!
//! A failure while handling one message is logged, answered with a best-effort
//! apology, and never stops the feed. Only errors from the feed itself escape
//! [`Dispatcher::run`].

use std::sync::Arc;

use futures_util::StreamExt;
use tracing::{debug, error, info, warn};

use crate::{
    domain::{find_member, same_identifier, ContentType, Identity, InboundMessage, InboxId},
    errors::Error,
    ports::{
        Conversation, DirectConversation, GroupConversation, MessageFeed, TransportClient,
    },
    Result,
};

pub const ENROLLED_REPLY: &str =
    "Hi! I've added you to the Traders group. Check your message requests to view!";
pub const ALREADY_MEMBER_REPLY: &str = "You're already a member of the Traders group!";
pub const APOLOGY_REPLY: &str = "Sorry, I encountered an error processing your message.";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SkipReason {
    Absent,
    OwnMessage,
    NotText,
    MissingConversationId,
    UnknownConversation,
    GroupConversation,
}

/// What happened to one feed event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    Skipped(SkipReason),
    Enrolled,
    AlreadyMember,
    Failed { reason: String },
}

/// Tally of one feed's worth of outcomes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FeedSummary {
    pub skipped: u32,
    pub enrolled: u32,
    pub already_member: u32,
    pub failed: u32,
}

impl FeedSummary {
    pub fn record(&mut self, outcome: &Outcome) {
        match outcome {
            Outcome::Skipped(_) => self.skipped += 1,
            Outcome::Enrolled => self.enrolled += 1,
            Outcome::AlreadyMember => self.already_member += 1,
            Outcome::Failed { .. } => self.failed += 1,
        }
    }

    pub fn total(&self) -> u32 {
        self.skipped + self.enrolled + self.already_member + self.failed
    }
}

/// Cheap pre-network filter: absent events, our own echoes, and non-text content.
pub fn skip_reason(msg: Option<&InboundMessage>, own_inbox: &InboxId) -> Option<SkipReason> {
    let Some(msg) = msg else {
        return Some(SkipReason::Absent);
    };
    if same_identifier(msg.sender_inbox_id.as_str(), own_inbox.as_str()) {
        return Some(SkipReason::OwnMessage);
    }
    if msg.content_type != ContentType::Text {
        return Some(SkipReason::NotText);
    }
    None
}

pub struct Dispatcher {
    client: Arc<dyn TransportClient>,
    group: Arc<dyn GroupConversation>,
}

impl Dispatcher {
    pub fn new(client: Arc<dyn TransportClient>, group: Arc<dyn GroupConversation>) -> Self {
        Self { client, group }
    }

    /// Consume `feed` until it ends. Returns `Err` only for stream-level failures.
    pub async fn run(&self, mut feed: MessageFeed) -> Result<FeedSummary> {
        let mut summary = FeedSummary::default();
        while let Some(item) = feed.next().await {
            let msg = item?;
            let outcome = self.handle(msg).await;
            summary.record(&outcome);
        }
        Ok(summary)
    }

    /// Handle one feed event. Never fails; failures become [`Outcome::Failed`].
    pub async fn handle(&self, msg: Option<InboundMessage>) -> Outcome {
        let own = &self.client.identity().inbox_id;
        if let Some(reason) = skip_reason(msg.as_ref(), own) {
            debug!(
                message_id = msg.as_ref().map(|m| m.id.0.as_str()).unwrap_or("-"),
                ?reason,
                "skipping message"
            );
            return Outcome::Skipped(reason);
        }
        let Some(msg) = msg else {
            return Outcome::Skipped(SkipReason::Absent);
        };

        debug!(
            message_id = %msg.id,
            sender = %msg.sender_inbox_id,
            content_type = msg.content_type.type_id(),
            "message received"
        );

        let Some(conv_id) = msg.conversation_id.clone() else {
            warn!(message_id = %msg.id, "skipping message without conversation id");
            return Outcome::Skipped(SkipReason::MissingConversationId);
        };

        let dm = match self.client.conversation_by_id(&conv_id).await {
            Ok(Some(Conversation::Direct(dm))) => dm,
            Ok(Some(Conversation::Group(_))) => {
                debug!(message_id = %msg.id, "skipping group message");
                return Outcome::Skipped(SkipReason::GroupConversation);
            }
            Ok(None) => {
                error!(
                    message_id = %msg.id,
                    conversation_id = %conv_id,
                    "could not find conversation for message"
                );
                return Outcome::Skipped(SkipReason::UnknownConversation);
            }
            Err(e) => return self.fail(&msg, e, None).await,
        };

        match self.enroll(&msg.sender_inbox_id, dm.as_ref()).await {
            Ok(outcome) => outcome,
            Err(e) => self.fail(&msg, e, Some(dm)).await,
        }
    }

    async fn enroll(&self, sender: &InboxId, dm: &dyn DirectConversation) -> Result<Outcome> {
        // Read fresh every time; the group can change behind our back.
        let members = self.group.members().await?;
        let sender_identity = Identity::Inbox(sender.clone());

        if find_member(&members, &sender_identity).is_some() {
            info!(sender = %sender, "sender is already a member");
            dm.send(ALREADY_MEMBER_REPLY).await?;
            return Ok(Outcome::AlreadyMember);
        }

        info!(sender = %sender, "adding sender to group");
        self.group
            .add_members(std::slice::from_ref(&sender_identity))
            .await?;
        dm.send(ENROLLED_REPLY).await?;
        info!(sender = %sender, "sender added to group");
        Ok(Outcome::Enrolled)
    }

    async fn fail(
        &self,
        msg: &InboundMessage,
        err: Error,
        dm: Option<Arc<dyn DirectConversation>>,
    ) -> Outcome {
        error!(message_id = %msg.id, error = %err, "error processing message");

        let dm = match dm {
            Some(dm) => Some(dm),
            None => self.lookup_direct(msg).await,
        };
        if let Some(dm) = dm {
            if let Err(e) = dm.send(APOLOGY_REPLY).await {
                error!(message_id = %msg.id, error = %e, "failed to send error reply");
            }
        }

        Outcome::Failed {
            reason: err.to_string(),
        }
    }

    /// Best-effort second lookup so an apology can still be sent; groups never get one.
    async fn lookup_direct(&self, msg: &InboundMessage) -> Option<Arc<dyn DirectConversation>> {
        let conv_id = msg.conversation_id.as_ref()?;
        match self.client.conversation_by_id(conv_id).await {
            Ok(Some(Conversation::Direct(dm))) => Some(dm),
            Ok(_) => None,
            Err(e) => {
                error!(message_id = %msg.id, error = %e, "failed to send error reply");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{NetworkEnv, WalletKey},
        domain::{Address, ConversationId, MessageId},
        loopback::{Fault, LoopbackClient, LoopbackNetwork, Participant},
        ports::GroupOptions,
    };

    struct Fixture {
        net: LoopbackNetwork,
        client: Arc<LoopbackClient>,
        group: Arc<dyn GroupConversation>,
        dispatcher: Dispatcher,
    }

    async fn fixture() -> Fixture {
        let net = LoopbackNetwork::new();
        let key = WalletKey::parse(&hex::encode([9u8; 32])).unwrap();
        let client = Arc::new(net.connect(&key, NetworkEnv::Dev));
        let group = client
            .new_group(
                &[],
                GroupOptions {
                    name: "Trader Chat ⭐".to_string(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let dispatcher = Dispatcher::new(client.clone(), group.clone());
        Fixture {
            net,
            client,
            group,
            dispatcher,
        }
    }

    impl Fixture {
        fn bot(&self) -> InboxId {
            self.client.identity().inbox_id.clone()
        }

        fn user(&self, n: u8) -> Participant {
            self.net
                .participant(Address::new(format!("0x{}", hex::encode([n; 20]))))
        }

        fn replies_to(&self, who: &Participant) -> Vec<String> {
            let Some(dm) = self.net.dm_between(&self.bot(), &who.inbox_id()) else {
                return Vec::new();
            };
            self.net
                .messages(&dm)
                .into_iter()
                .filter(|m| m.sender == self.bot())
                .filter_map(|m| m.text)
                .collect()
        }

        async fn is_member(&self, who: &Participant) -> bool {
            self.group
                .members()
                .await
                .unwrap()
                .iter()
                .any(|m| m.inbox_id == who.inbox_id())
        }
    }

    fn message(sender: InboxId, content_type: ContentType) -> InboundMessage {
        InboundMessage {
            id: MessageId("m-1".to_string()),
            sender_inbox_id: sender,
            conversation_id: Some(ConversationId("c-1".to_string())),
            content_type,
            text: Some("hello".to_string()),
        }
    }

    #[test]
    fn filter_rules() {
        let me = InboxId::new("bot-inbox");
        assert_eq!(skip_reason(None, &me), Some(SkipReason::Absent));
        assert_eq!(
            skip_reason(Some(&message(InboxId::new("BOT-INBOX"), ContentType::Text)), &me),
            Some(SkipReason::OwnMessage)
        );
        assert_eq!(
            skip_reason(
                Some(&message(
                    InboxId::new("alice"),
                    ContentType::Other("reaction".to_string())
                )),
                &me
            ),
            Some(SkipReason::NotText)
        );
        assert_eq!(
            skip_reason(Some(&message(InboxId::new("alice"), ContentType::Text)), &me),
            None
        );
    }

    #[tokio::test]
    async fn enrolls_new_sender_once_then_reports_membership() {
        let fx = fixture().await;
        let alice = fx.user(1);

        let first = alice.send_dm(&fx.bot(), "let me in").unwrap();
        assert_eq!(fx.dispatcher.handle(Some(first)).await, Outcome::Enrolled);
        assert!(fx.is_member(&alice).await);
        assert_eq!(fx.net.member_add_calls(), 1);
        assert_eq!(fx.replies_to(&alice), vec![ENROLLED_REPLY.to_string()]);

        let again = alice.send_dm(&fx.bot(), "again").unwrap();
        assert_eq!(fx.dispatcher.handle(Some(again)).await, Outcome::AlreadyMember);
        assert_eq!(fx.net.member_add_calls(), 1);
        assert_eq!(
            fx.replies_to(&alice),
            vec![ENROLLED_REPLY.to_string(), ALREADY_MEMBER_REPLY.to_string()]
        );
    }

    #[tokio::test]
    async fn membership_check_ignores_inbox_id_case() {
        let fx = fixture().await;
        let alice = fx.user(1);
        fx.group
            .add_members(&[Identity::Inbox(alice.inbox_id())])
            .await
            .unwrap();
        let calls_before = fx.net.member_add_calls();

        let mut msg = alice.send_dm(&fx.bot(), "let me in").unwrap();
        msg.sender_inbox_id = InboxId::new(alice.inbox_id().as_str().to_uppercase());

        assert_eq!(fx.dispatcher.handle(Some(msg)).await, Outcome::AlreadyMember);
        assert_eq!(fx.net.member_add_calls(), calls_before);
        assert_eq!(fx.replies_to(&alice), vec![ALREADY_MEMBER_REPLY.to_string()]);
    }

    #[tokio::test]
    async fn own_messages_take_no_action() {
        let fx = fixture().await;
        let alice = fx.user(1);
        let incoming = alice.send_dm(&fx.bot(), "hi").unwrap();
        let dm = match fx
            .client
            .conversation_by_id(incoming.conversation_id.as_ref().unwrap())
            .await
            .unwrap()
        {
            Some(Conversation::Direct(dm)) => dm,
            other => panic!("expected a DM, got {other:?}"),
        };
        dm.send("echo").await.unwrap();
        let echo = fx.net.messages(dm.id()).pop().unwrap();

        let own = InboundMessage {
            id: echo.id,
            sender_inbox_id: echo.sender,
            conversation_id: Some(dm.id().clone()),
            content_type: echo.content_type,
            text: echo.text,
        };
        assert_eq!(
            fx.dispatcher.handle(Some(own)).await,
            Outcome::Skipped(SkipReason::OwnMessage)
        );
        assert_eq!(fx.net.member_add_calls(), 0);
        assert_eq!(fx.replies_to(&alice), vec!["echo".to_string()]);
    }

    #[tokio::test]
    async fn non_text_content_is_ignored() {
        let fx = fixture().await;
        let alice = fx.user(1);
        let msg = alice
            .send_content(&fx.bot(), ContentType::Other("reaction".to_string()), None)
            .unwrap();

        assert_eq!(
            fx.dispatcher.handle(Some(msg)).await,
            Outcome::Skipped(SkipReason::NotText)
        );
        assert!(!fx.is_member(&alice).await);
        assert!(fx.replies_to(&alice).is_empty());
    }

    #[tokio::test]
    async fn group_messages_are_ignored() {
        let fx = fixture().await;
        let alice = fx.user(1);
        fx.group
            .add_members(&[Identity::Inbox(alice.inbox_id())])
            .await
            .unwrap();
        let other = fx
            .client
            .new_group(&[Identity::Inbox(alice.inbox_id())], GroupOptions::default())
            .await
            .unwrap();
        let msg = alice.send_to_group(other.id(), "hello group").unwrap();
        let calls_before = fx.net.member_add_calls();

        assert_eq!(
            fx.dispatcher.handle(Some(msg)).await,
            Outcome::Skipped(SkipReason::GroupConversation)
        );
        assert_eq!(fx.net.member_add_calls(), calls_before);
        assert_eq!(fx.net.messages(other.id()).len(), 1);
    }

    #[tokio::test]
    async fn unknown_or_missing_conversations_are_skipped() {
        let fx = fixture().await;
        let mut msg = message(InboxId::new("stranger"), ContentType::Text);
        assert_eq!(
            fx.dispatcher.handle(Some(msg.clone())).await,
            Outcome::Skipped(SkipReason::UnknownConversation)
        );

        msg.conversation_id = None;
        assert_eq!(
            fx.dispatcher.handle(Some(msg)).await,
            Outcome::Skipped(SkipReason::MissingConversationId)
        );
        assert_eq!(fx.net.member_add_calls(), 0);
    }

    #[tokio::test]
    async fn failure_sends_apology_and_next_message_still_works() {
        let fx = fixture().await;
        let alice = fx.user(1);
        let bob = fx.user(2);
        fx.net.fail_next(Fault::MemberRead, 1);

        let a = alice.send_dm(&fx.bot(), "hi").unwrap();
        let b = bob.send_dm(&fx.bot(), "hi").unwrap();

        assert!(matches!(
            fx.dispatcher.handle(Some(a)).await,
            Outcome::Failed { .. }
        ));
        assert_eq!(fx.replies_to(&alice), vec![APOLOGY_REPLY.to_string()]);
        assert!(!fx.is_member(&alice).await);

        assert_eq!(fx.dispatcher.handle(Some(b)).await, Outcome::Enrolled);
        assert!(fx.is_member(&bob).await);
    }

    #[tokio::test]
    async fn lookup_failure_still_apologizes_via_second_lookup() {
        let fx = fixture().await;
        let alice = fx.user(1);
        fx.net.fail_next(Fault::Lookup, 1);

        let msg = alice.send_dm(&fx.bot(), "hi").unwrap();
        assert!(matches!(
            fx.dispatcher.handle(Some(msg)).await,
            Outcome::Failed { .. }
        ));
        assert_eq!(fx.replies_to(&alice), vec![APOLOGY_REPLY.to_string()]);
    }

    #[tokio::test]
    async fn failed_apology_is_swallowed() {
        let fx = fixture().await;
        let alice = fx.user(1);
        fx.net.fail_next(Fault::AddMembers, 1);
        fx.net.fail_next(Fault::Send, 1);

        let msg = alice.send_dm(&fx.bot(), "hi").unwrap();
        assert!(matches!(
            fx.dispatcher.handle(Some(msg)).await,
            Outcome::Failed { .. }
        ));
        assert!(fx.replies_to(&alice).is_empty());
    }

    #[tokio::test]
    async fn run_drains_feed_in_order_and_survives_bad_messages() {
        let fx = fixture().await;
        let alice = fx.user(1);
        let bob = fx.user(2);

        let feed = fx.client.stream_all_messages().await.unwrap();
        fx.net.fail_next(Fault::MemberRead, 1);
        alice.send_dm(&fx.bot(), "first").unwrap();
        fx.net.inject_absent();
        alice
            .send_content(&fx.bot(), ContentType::Other("reply".to_string()), None)
            .unwrap();
        bob.send_dm(&fx.bot(), "second").unwrap();
        alice.send_dm(&fx.bot(), "third").unwrap();
        fx.net.close_feeds();

        let summary = fx.dispatcher.run(feed).await.unwrap();
        assert_eq!(
            summary,
            FeedSummary {
                skipped: 2,
                enrolled: 2,
                already_member: 0,
                failed: 1,
            }
        );
        assert_eq!(
            fx.replies_to(&alice),
            vec![APOLOGY_REPLY.to_string(), ENROLLED_REPLY.to_string()]
        );
        assert_eq!(fx.replies_to(&bob), vec![ENROLLED_REPLY.to_string()]);
    }

    #[tokio::test]
    async fn run_surfaces_stream_errors() {
        let fx = fixture().await;
        let feed = fx.client.stream_all_messages().await.unwrap();
        fx.net.break_feeds("socket closed");

        let err = fx.dispatcher.run(feed).await.unwrap_err();
        assert!(matches!(err, Error::Stream(_)));
    }
}
