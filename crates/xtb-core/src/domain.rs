use std::{
    fmt,
    hash::{Hash, Hasher},
    sync::OnceLock,
};

use regex::Regex;

/// Compare two network identifiers the way the network does: trimmed and
/// ASCII case-insensitive.
///
/// Every identity comparison in the bot (self-echo, sender lookup, admin
/// lookup) goes through this.
pub fn same_identifier(a: &str, b: &str) -> bool {
    a.trim().eq_ignore_ascii_case(b.trim())
}

/// Stable inbox identifier of a participant.
#[derive(Clone, Debug)]
pub struct InboxId(pub String);

impl InboxId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl PartialEq for InboxId {
    fn eq(&self, other: &Self) -> bool {
        same_identifier(&self.0, &other.0)
    }
}

impl Eq for InboxId {}

impl Hash for InboxId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.trim().to_ascii_lowercase().hash(state);
    }
}

impl fmt::Display for InboxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// On-chain style account address (`0x` + 40 hex chars).
#[derive(Clone, Debug)]
pub struct Address(pub String);

impl Address {
    pub fn new(addr: impl Into<String>) -> Self {
        Self(addr.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn looks_valid(s: &str) -> bool {
        static RE: OnceLock<Option<Regex>> = OnceLock::new();
        RE.get_or_init(|| Regex::new(r"^0[xX][0-9a-fA-F]{40}$").ok())
            .as_ref()
            .is_some_and(|re| re.is_match(s.trim()))
    }
}

impl PartialEq for Address {
    fn eq(&self, other: &Self) -> bool {
        same_identifier(&self.0, &other.0)
    }
}

impl Eq for Address {}

impl Hash for Address {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.trim().to_ascii_lowercase().hash(state);
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque conversation id.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ConversationId(pub String);

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque message id.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct MessageId(pub String);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Something that can be added to a group: an account address or an inbox id.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Identity {
    Address(Address),
    Inbox(InboxId),
}

impl Identity {
    /// `0x` + 40 hex chars is an address; anything else is an inbox id.
    pub fn parse(s: &str) -> Self {
        let s = s.trim();
        if Address::looks_valid(s) {
            Identity::Address(Address::new(s))
        } else {
            Identity::Inbox(InboxId::new(s))
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Identity::Address(a) => a.as_str(),
            Identity::Inbox(i) => i.as_str(),
        }
    }
}

impl From<InboxId> for Identity {
    fn from(id: InboxId) -> Self {
        Identity::Inbox(id)
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who the bot is on the network. Fixed for the process lifetime.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionIdentity {
    pub inbox_id: InboxId,
    pub address: Address,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Role {
    Member,
    Admin,
    SuperAdmin,
}

/// A group member as reported by the network.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Member {
    pub inbox_id: InboxId,
    pub account_addresses: Vec<Address>,
    pub role: Role,
}

impl Member {
    pub fn matches(&self, identity: &Identity) -> bool {
        match identity {
            Identity::Inbox(id) => self.inbox_id == *id,
            Identity::Address(addr) => self.account_addresses.iter().any(|a| a == addr),
        }
    }
}

/// Find the first member matching `identity`.
pub fn find_member<'a>(members: &'a [Member], identity: &Identity) -> Option<&'a Member> {
    members.iter().find(|m| m.matches(identity))
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ContentType {
    Text,
    Other(String),
}

impl ContentType {
    pub fn from_type_id(type_id: &str) -> Self {
        if type_id == "text" {
            ContentType::Text
        } else {
            ContentType::Other(type_id.to_string())
        }
    }

    pub fn type_id(&self) -> &str {
        match self {
            ContentType::Text => "text",
            ContentType::Other(t) => t,
        }
    }
}

/// One event from the live feed.
#[derive(Clone, Debug)]
pub struct InboundMessage {
    pub id: MessageId,
    pub sender_inbox_id: InboxId,
    pub conversation_id: Option<ConversationId>,
    pub content_type: ContentType,
    /// Present when `content_type` is text.
    pub text: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifiers_compare_case_insensitively() {
        assert!(same_identifier("0xABCdef", "0xabcDEF"));
        assert!(same_identifier(" inbox-1 ", "INBOX-1"));
        assert!(!same_identifier("inbox-1", "inbox-2"));
        assert_eq!(InboxId::new("AbC"), InboxId::new("aBc"));
    }

    #[test]
    fn identity_parse_distinguishes_addresses() {
        let addr = Identity::parse("0x80245b9C0d2Ef322F2554922cA86Cf211a24047F");
        assert!(matches!(addr, Identity::Address(_)));

        let inbox = Identity::parse("0f4a9c1e");
        assert!(matches!(inbox, Identity::Inbox(_)));

        // Too short to be an address.
        assert!(matches!(Identity::parse("0x1234"), Identity::Inbox(_)));
    }

    #[test]
    fn member_matches_by_inbox_or_address() {
        let m = Member {
            inbox_id: InboxId::new("inbox-a"),
            account_addresses: vec![Address::new("0x80245b9C0d2Ef322F2554922cA86Cf211a24047F")],
            role: Role::Member,
        };

        assert!(m.matches(&Identity::Inbox(InboxId::new("INBOX-A"))));
        assert!(m.matches(&Identity::parse(
            "0x80245b9c0d2ef322f2554922ca86cf211a24047f"
        )));
        assert!(!m.matches(&Identity::Inbox(InboxId::new("inbox-b"))));

        let members = vec![m.clone()];
        assert_eq!(
            find_member(&members, &Identity::Inbox(InboxId::new("inbox-a"))),
            Some(&m)
        );
    }

    #[test]
    fn content_type_roundtrips_type_id() {
        assert_eq!(ContentType::from_type_id("text"), ContentType::Text);
        assert_eq!(
            ContentType::from_type_id("reaction").type_id(),
            "reaction"
        );
    }
}
