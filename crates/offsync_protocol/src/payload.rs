//! Typed payload envelopes and the field merge policy.
//!
//! Each entity type has a struct of known fields plus an `extensions` map
//! that keeps unknown JSON keys intact across a round trip. Known fields are
//! typed; nothing outside the extension map can be injected dynamically.
//!
//! # Merge policy
//!
//! `Payload::merge` combines a server and a client copy deterministically:
//!
//! - list fields are unioned, server items first, then client items not
//!   already present
//! - optional scalars take the client value when the client has one
//! - extension keys merge one by one; two JSON arrays are unioned, anything
//!   else takes the client value

use crate::entity::EntityType;
use crate::error::{ProtocolError, ProtocolResult};
use crate::mutation::Operation;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Maximum post content length, in characters.
pub const MAX_POST_CONTENT: usize = 5000;
/// Maximum group name length, in characters.
pub const MAX_GROUP_NAME: usize = 100;
/// Allowed username length range, in characters.
pub const USERNAME_LEN: std::ops::RangeInclusive<usize> = 2..=30;

type Extensions = BTreeMap<String, Value>;

/// Kind of a post.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PostKind {
    /// Plain post.
    Post,
    /// Question.
    Question,
    /// Study note.
    Note,
    /// Announcement.
    Announcement,
    /// Shared resource.
    Resource,
}

/// Audience of a post.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    /// Everyone.
    Public,
    /// Members of the post's group.
    Group,
    /// Author only.
    Private,
    /// Author's followers.
    Followers,
}

/// Kind of a media attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    /// Image.
    Image,
    /// Video.
    Video,
    /// Audio clip.
    Audio,
    /// Document.
    Document,
}

/// A media item attached to a post.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaAttachment {
    /// Location of the uploaded media.
    pub url: String,
    /// Media kind.
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<MediaKind>,
    /// Optional caption.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caption: Option<String>,
}

/// Kind of a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupKind {
    /// Study group.
    Study,
    /// Class.
    Class,
    /// School.
    School,
    /// Community.
    Community,
    /// Project team.
    Project,
    /// Topic channel.
    Topic,
}

/// Join policy of a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupPrivacy {
    /// Anyone may join.
    Public,
    /// Invitation only.
    Private,
    /// Join requests need approval.
    Restricted,
}

/// Known fields of a post.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PostFields {
    /// Body text.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Attached media.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub media: Vec<MediaAttachment>,
    /// Post kind.
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<PostKind>,
    /// Tags.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    /// Category.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    /// Content language.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    /// Author user id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author_id: Option<String>,
    /// Owning group, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    /// Audience.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub visibility: Option<Visibility>,
    /// Users who liked the post.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub likes: Vec<String>,
    /// Users who saved the post.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub saves: Vec<String>,
    /// Hidden by moderation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_hidden: Option<bool>,
    /// Unknown fields, kept verbatim.
    #[serde(flatten)]
    pub extensions: Extensions,
}

/// Known fields of a group.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GroupFields {
    /// Display name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Group kind.
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<GroupKind>,
    /// Category.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    /// Creating user id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub creator_id: Option<String>,
    /// Admin user ids.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub admins: Vec<String>,
    /// Moderator user ids.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub moderators: Vec<String>,
    /// Member user ids.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub members: Vec<String>,
    /// Join policy.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub privacy: Option<GroupPrivacy>,
    /// Pinned post ids.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub pinned_posts: Vec<String>,
    /// Tags.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    /// False once the group is archived.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_active: Option<bool>,
    /// Unknown fields, kept verbatim.
    #[serde(flatten)]
    pub extensions: Extensions,
}

/// Known fields of a user profile.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UserFields {
    /// Phone number, the login identity.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    /// Handle.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// Display name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    /// Short bio.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bio: Option<String>,
    /// Avatar URL.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    /// City.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    /// Country.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    /// False once the account is deactivated.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_active: Option<bool>,
    /// Push notification tokens. Never leave the server.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub device_tokens: Vec<String>,
    /// Unknown fields, kept verbatim.
    #[serde(flatten)]
    pub extensions: Extensions,
}

/// Domain fields of an entity, one variant per entity type.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Payload {
    /// Post fields.
    Post(PostFields),
    /// Group fields.
    Group(GroupFields),
    /// User fields.
    User(UserFields),
}

impl Payload {
    /// Returns an empty payload of the given type.
    pub fn empty(entity_type: EntityType) -> Self {
        match entity_type {
            EntityType::Post => Payload::Post(PostFields::default()),
            EntityType::Group => Payload::Group(GroupFields::default()),
            EntityType::User => Payload::User(UserFields::default()),
        }
    }

    /// Decodes a JSON object as the payload of `entity_type`.
    ///
    /// `null` decodes to an empty payload.
    pub fn from_value(entity_type: EntityType, value: Value) -> ProtocolResult<Self> {
        if value.is_null() {
            return Ok(Self::empty(entity_type));
        }
        if !value.is_object() {
            return Err(ProtocolError::validation(format!(
                "{entity_type} payload must be a JSON object"
            )));
        }
        Ok(match entity_type {
            EntityType::Post => Payload::Post(serde_json::from_value(value)?),
            EntityType::Group => Payload::Group(serde_json::from_value(value)?),
            EntityType::User => Payload::User(serde_json::from_value(value)?),
        })
    }

    /// Encodes the payload as a JSON object.
    pub fn to_value(&self) -> ProtocolResult<Value> {
        Ok(serde_json::to_value(self)?)
    }

    /// Entity type of this payload.
    pub fn entity_type(&self) -> EntityType {
        match self {
            Payload::Post(_) => EntityType::Post,
            Payload::Group(_) => EntityType::Group,
            Payload::User(_) => EntityType::User,
        }
    }

    /// Checks the payload against the field rules for `operation`.
    pub fn validate(&self, operation: Operation) -> ProtocolResult<()> {
        match self {
            Payload::Post(p) => {
                if let Some(content) = &p.content {
                    if content.chars().count() > MAX_POST_CONTENT {
                        return Err(ProtocolError::validation(format!(
                            "post content exceeds {MAX_POST_CONTENT} characters"
                        )));
                    }
                }
            }
            Payload::Group(g) => {
                match g.name.as_deref().map(str::trim) {
                    Some("") | None if operation == Operation::Create => {
                        return Err(ProtocolError::validation("group name is required"));
                    }
                    Some(name) if name.chars().count() > MAX_GROUP_NAME => {
                        return Err(ProtocolError::validation(format!(
                            "group name exceeds {MAX_GROUP_NAME} characters"
                        )));
                    }
                    _ => {}
                }
            }
            Payload::User(u) => {
                if operation == Operation::Create
                    && u.phone.as_deref().map_or(true, |p| p.trim().is_empty())
                {
                    return Err(ProtocolError::validation("user phone is required"));
                }
                if let Some(username) = &u.username {
                    if !USERNAME_LEN.contains(&username.chars().count()) {
                        return Err(ProtocolError::validation(format!(
                            "username must be {}..={} characters",
                            USERNAME_LEN.start(),
                            USERNAME_LEN.end()
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// Fills ownership fields on a newly created entity.
    ///
    /// Posts get the principal as author when none is given. Groups record the
    /// principal as creator and default `members`/`admins` to the creator.
    pub fn stamp_creation(&mut self, principal: &str) {
        match self {
            Payload::Post(p) => {
                if p.author_id.is_none() {
                    p.author_id = Some(principal.to_string());
                }
            }
            Payload::Group(g) => {
                g.creator_id = Some(principal.to_string());
                if g.members.is_empty() {
                    g.members.push(principal.to_string());
                }
                if g.admins.is_empty() {
                    g.admins.push(principal.to_string());
                }
            }
            Payload::User(_) => {}
        }
    }

    /// Carries ownership fields of the stored copy over an update that does
    /// not restate them. A group's creator never changes.
    ///
    /// User device tokens never reach clients, so an edit cannot restate
    /// them: the stored tokens are kept and any new ones appended.
    pub fn keep_ownership(&mut self, stored: &Payload) {
        match (self, stored) {
            (Payload::Post(p), Payload::Post(s)) => {
                if p.author_id.is_none() {
                    p.author_id = s.author_id.clone();
                }
            }
            (Payload::Group(g), Payload::Group(s)) => {
                if s.creator_id.is_some() {
                    g.creator_id = s.creator_id.clone();
                }
            }
            (Payload::User(u), Payload::User(s)) => {
                let added = std::mem::take(&mut u.device_tokens);
                u.device_tokens = union(&s.device_tokens, &added);
            }
            _ => {}
        }
    }

    /// Removes fields that must not leave the server.
    pub fn redact_private(&mut self) {
        if let Payload::User(u) = self {
            u.device_tokens.clear();
        }
    }

    /// Returns false for hidden posts and inactive groups or users.
    pub fn is_visible(&self) -> bool {
        match self {
            Payload::Post(p) => !p.is_hidden.unwrap_or(false),
            Payload::Group(g) => g.is_active.unwrap_or(true),
            Payload::User(u) => u.is_active.unwrap_or(true),
        }
    }

    /// Merges `client` into `self` (the server copy). See the module docs.
    pub fn merge(&self, client: &Payload) -> ProtocolResult<Payload> {
        let merged = match (self, client) {
            (Payload::Post(s), Payload::Post(c)) => Payload::Post(PostFields {
                content: pick(&s.content, &c.content),
                media: union(&s.media, &c.media),
                kind: pick(&s.kind, &c.kind),
                tags: union(&s.tags, &c.tags),
                category: pick(&s.category, &c.category),
                language: pick(&s.language, &c.language),
                author_id: pick(&s.author_id, &c.author_id),
                group_id: pick(&s.group_id, &c.group_id),
                visibility: pick(&s.visibility, &c.visibility),
                likes: union(&s.likes, &c.likes),
                saves: union(&s.saves, &c.saves),
                is_hidden: pick(&s.is_hidden, &c.is_hidden),
                extensions: merge_extensions(&s.extensions, &c.extensions),
            }),
            (Payload::Group(s), Payload::Group(c)) => Payload::Group(GroupFields {
                name: pick(&s.name, &c.name),
                description: pick(&s.description, &c.description),
                kind: pick(&s.kind, &c.kind),
                category: pick(&s.category, &c.category),
                creator_id: pick(&s.creator_id, &c.creator_id),
                admins: union(&s.admins, &c.admins),
                moderators: union(&s.moderators, &c.moderators),
                members: union(&s.members, &c.members),
                privacy: pick(&s.privacy, &c.privacy),
                pinned_posts: union(&s.pinned_posts, &c.pinned_posts),
                tags: union(&s.tags, &c.tags),
                is_active: pick(&s.is_active, &c.is_active),
                extensions: merge_extensions(&s.extensions, &c.extensions),
            }),
            (Payload::User(s), Payload::User(c)) => Payload::User(UserFields {
                phone: pick(&s.phone, &c.phone),
                username: pick(&s.username, &c.username),
                display_name: pick(&s.display_name, &c.display_name),
                bio: pick(&s.bio, &c.bio),
                avatar: pick(&s.avatar, &c.avatar),
                city: pick(&s.city, &c.city),
                country: pick(&s.country, &c.country),
                is_active: pick(&s.is_active, &c.is_active),
                device_tokens: union(&s.device_tokens, &c.device_tokens),
                extensions: merge_extensions(&s.extensions, &c.extensions),
            }),
            (server, client) => {
                return Err(ProtocolError::PayloadTypeMismatch {
                    expected: server.entity_type().to_string(),
                    actual: client.entity_type().to_string(),
                })
            }
        };
        Ok(merged)
    }
}

fn pick<T: Clone>(server: &Option<T>, client: &Option<T>) -> Option<T> {
    client.clone().or_else(|| server.clone())
}

fn union<T: Clone + PartialEq>(server: &[T], client: &[T]) -> Vec<T> {
    let mut out = server.to_vec();
    for item in client {
        if !out.contains(item) {
            out.push(item.clone());
        }
    }
    out
}

fn merge_extensions(server: &Extensions, client: &Extensions) -> Extensions {
    let mut out = server.clone();
    for (key, value) in client {
        let merged = match (out.get(key), value) {
            (Some(Value::Array(s)), Value::Array(c)) => Value::Array(union(s, c)),
            _ => value.clone(),
        };
        out.insert(key.clone(), merged);
    }
    out
}
