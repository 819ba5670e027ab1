use std::sync::Arc;

use async_trait::async_trait;

use super::{ConvKind, ConvRecord, Fault, LoopbackNetwork};
use crate::{
    domain::*,
    errors::Error,
    ports::*,
    Result,
};

/// A session on the loopback network.
#[derive(Clone)]
pub struct LoopbackClient {
    net: LoopbackNetwork,
    identity: SessionIdentity,
}

impl LoopbackClient {
    pub(super) fn new(net: LoopbackNetwork, identity: SessionIdentity) -> Self {
        Self { net, identity }
    }

    fn group_handle(&self, id: ConversationId) -> Arc<dyn GroupConversation> {
        Arc::new(LoopbackGroup {
            net: self.net.clone(),
            id,
            actor: self.identity.inbox_id.clone(),
        })
    }
}

#[async_trait]
impl TransportClient for LoopbackClient {
    fn identity(&self) -> &SessionIdentity {
        &self.identity
    }

    async fn is_registered(&self) -> Result<bool> {
        let st = self.net.state();
        Ok(st
            .account_by_inbox(&self.identity.inbox_id)
            .is_some_and(|a| a.registered))
    }

    async fn register(&self) -> Result<()> {
        let mut st = self.net.state();
        let account = st
            .accounts
            .iter_mut()
            .find(|a| a.inbox_id == self.identity.inbox_id)
            .ok_or_else(|| Error::NotFound(format!("account {}", self.identity.inbox_id)))?;
        account.registered = true;
        Ok(())
    }

    async fn list_groups(&self) -> Result<Vec<Arc<dyn GroupConversation>>> {
        let ids: Vec<ConversationId> = {
            let mut st = self.net.state();
            st.fail_if(Fault::ListGroups)?;
            st.conversations
                .iter()
                .filter(|c| matches!(c.kind, ConvKind::Group { .. }))
                .filter(|c| c.has_member(&self.identity.inbox_id))
                .map(|c| c.id.clone())
                .collect()
        };
        Ok(ids.into_iter().map(|id| self.group_handle(id)).collect())
    }

    async fn new_group(
        &self,
        members: &[Identity],
        opts: GroupOptions,
    ) -> Result<Arc<dyn GroupConversation>> {
        let id = {
            let mut st = self.net.state();
            let mut roster = vec![(self.identity.inbox_id.clone(), Role::SuperAdmin)];
            for identity in members {
                let inbox = st.resolve(identity)?;
                if !roster.iter().any(|(m, _)| *m == inbox) {
                    roster.push((inbox, Role::Member));
                }
            }

            let id = ConversationId(st.next_id("group"));
            st.conversations.push(ConvRecord {
                id: id.clone(),
                kind: ConvKind::Group {
                    name: opts.name,
                    description: opts.description,
                    image_url: opts.image_url,
                    members: roster,
                },
                messages: Vec::new(),
            });
            id
        };
        Ok(self.group_handle(id))
    }

    async fn conversation_by_id(&self, id: &ConversationId) -> Result<Option<Conversation>> {
        let kind_is_group = {
            let mut st = self.net.state();
            st.fail_if(Fault::Lookup)?;
            match st.conv(id) {
                Some(c) if c.has_member(&self.identity.inbox_id) => {
                    matches!(c.kind, ConvKind::Group { .. })
                }
                _ => return Ok(None),
            }
        };

        let conv = if kind_is_group {
            Conversation::Group(self.group_handle(id.clone()))
        } else {
            Conversation::Direct(Arc::new(LoopbackDirect {
                net: self.net.clone(),
                id: id.clone(),
                actor: self.identity.inbox_id.clone(),
            }))
        };
        Ok(Some(conv))
    }

    async fn stream_all_messages(&self) -> Result<MessageFeed> {
        self.net.open_feed(&self.identity.inbox_id)
    }
}

/// Group handle acting as `actor`.
pub struct LoopbackGroup {
    net: LoopbackNetwork,
    id: ConversationId,
    actor: InboxId,
}

impl LoopbackGroup {
    pub fn description(&self) -> String {
        let st = self.net.state();
        match st.conv(&self.id).map(|c| &c.kind) {
            Some(ConvKind::Group { description, .. }) => description.clone(),
            _ => String::new(),
        }
    }

    pub fn image_url(&self) -> String {
        let st = self.net.state();
        match st.conv(&self.id).map(|c| &c.kind) {
            Some(ConvKind::Group { image_url, .. }) => image_url.clone(),
            _ => String::new(),
        }
    }

    /// Change the role of an existing member. The actor needs at least `required`.
    fn set_role(&self, target: &InboxId, role: Role, required: Role) -> Result<()> {
        let mut st = self.net.state();
        st.fail_if(Fault::Promote)?;

        let conv = st.conv_mut(&self.id)?;
        match conv.role_of(&self.actor) {
            Some(r) if r >= required => {}
            _ => {
                return Err(Error::Transport(format!(
                    "{} may not grant {role:?} in {}",
                    self.actor, self.id
                )))
            }
        }

        let ConvKind::Group { members, .. } = &mut conv.kind else {
            return Err(Error::Transport(format!("{} is not a group", self.id)));
        };
        let Some(entry) = members.iter_mut().find(|(m, _)| m == target) else {
            return Err(Error::Transport(format!(
                "{target} is not a member of {}",
                self.id
            )));
        };
        entry.1 = entry.1.max(role);
        Ok(())
    }
}

#[async_trait]
impl ConversationPort for LoopbackGroup {
    fn id(&self) -> &ConversationId {
        &self.id
    }

    async fn send(&self, text: &str) -> Result<MessageId> {
        let mut st = self.net.state();
        st.fail_if(Fault::Send)?;
        let msg = st.post(&self.id, &self.actor, ContentType::Text, Some(text.to_string()))?;
        Ok(msg.id)
    }
}

#[async_trait]
impl GroupConversation for LoopbackGroup {
    fn name(&self) -> String {
        let st = self.net.state();
        match st.conv(&self.id).map(|c| &c.kind) {
            Some(ConvKind::Group { name, .. }) => name.clone(),
            _ => String::new(),
        }
    }

    async fn members(&self) -> Result<Vec<Member>> {
        let mut st = self.net.state();
        st.fail_if(Fault::MemberRead)?;
        let roster = match st.conv(&self.id).map(|c| &c.kind) {
            Some(ConvKind::Group { members, .. }) => members.clone(),
            _ => return Err(Error::NotFound(format!("group {}", self.id))),
        };
        Ok(roster
            .iter()
            .map(|(inbox, role)| st.member_view(inbox, *role))
            .collect())
    }

    async fn add_members(&self, identities: &[Identity]) -> Result<()> {
        let mut st = self.net.state();
        st.fail_if(Fault::AddMembers)?;
        st.member_add_calls += 1;

        let inboxes = identities
            .iter()
            .map(|i| st.resolve(i))
            .collect::<Result<Vec<_>>>()?;

        let actor = self.actor.clone();
        let conv = st.conv_mut(&self.id)?;
        if !conv.has_member(&actor) {
            return Err(Error::Transport(format!(
                "{actor} is not a member of {}",
                self.id
            )));
        }
        let ConvKind::Group { members, .. } = &mut conv.kind else {
            return Err(Error::Transport(format!("{} is not a group", self.id)));
        };
        for inbox in inboxes {
            // Re-adding an existing member is a no-op.
            if !members.iter().any(|(m, _)| *m == inbox) {
                members.push((inbox, Role::Member));
            }
        }
        Ok(())
    }

    async fn add_admin(&self, inbox_id: &InboxId) -> Result<()> {
        self.set_role(inbox_id, Role::Admin, Role::Admin)
    }

    async fn add_super_admin(&self, inbox_id: &InboxId) -> Result<()> {
        self.set_role(inbox_id, Role::SuperAdmin, Role::SuperAdmin)
    }
}

/// Direct-message handle acting as `actor`.
pub struct LoopbackDirect {
    net: LoopbackNetwork,
    id: ConversationId,
    actor: InboxId,
}

#[async_trait]
impl ConversationPort for LoopbackDirect {
    fn id(&self) -> &ConversationId {
        &self.id
    }

    async fn send(&self, text: &str) -> Result<MessageId> {
        let mut st = self.net.state();
        st.fail_if(Fault::Send)?;
        let msg = st.post(&self.id, &self.actor, ContentType::Text, Some(text.to_string()))?;
        Ok(msg.id)
    }
}

impl DirectConversation for LoopbackDirect {}
