//! Tag identities attached to events.
//!
//! A [`Tag`] is a `Group:Content` pair (e.g. `Student:42`) marking an event
//! as relevant to one conceptual entity. An event may carry any number of
//! tags; each tag has its own reservation actor and its own event stream.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::TagError;
use crate::sortable_id::SortableUniqueId;

/// A validated `Group:Content` tag identity.
///
/// The group must be non-empty and must not contain `:`. The content must
/// be non-empty and may itself contain `:`.
///
/// # Examples
///
/// ```
/// use eventfold_dcb::Tag;
///
/// let tag: Tag = "Student:42".parse().unwrap();
/// assert_eq!(tag.group(), "Student");
/// assert_eq!(tag.content(), "42");
/// assert_eq!(tag.to_string(), "Student:42");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Tag {
    group: String,
    content: String,
}

impl Tag {
    /// Build a tag from its two parts.
    ///
    /// # Errors
    ///
    /// Returns [`TagError`] if either part is empty or the group contains
    /// `:`.
    pub fn new(group: impl Into<String>, content: impl Into<String>) -> Result<Self, TagError> {
        let group = group.into();
        let content = content.into();
        if group.is_empty() {
            return Err(TagError::EmptyGroup(format!("{group}:{content}")));
        }
        if group.contains(':') {
            return Err(TagError::InvalidGroup(group));
        }
        if content.is_empty() {
            return Err(TagError::EmptyContent(format!("{group}:{content}")));
        }
        Ok(Self { group, content })
    }

    /// Parse a `Group:Content` string. The first `:` splits the two parts.
    ///
    /// # Errors
    ///
    /// Returns [`TagError::MissingSeparator`] if there is no `:`, or one of
    /// the validation errors from [`Tag::new`].
    pub fn parse(value: &str) -> Result<Self, TagError> {
        let (group, content) = value
            .split_once(':')
            .ok_or_else(|| TagError::MissingSeparator(value.to_owned()))?;
        if group.is_empty() {
            return Err(TagError::EmptyGroup(value.to_owned()));
        }
        if content.is_empty() {
            return Err(TagError::EmptyContent(value.to_owned()));
        }
        Ok(Self {
            group: group.to_owned(),
            content: content.to_owned(),
        })
    }

    /// The group part (e.g. `Student`).
    pub fn group(&self) -> &str {
        &self.group
    }

    /// The content part (e.g. the student id).
    pub fn content(&self) -> &str {
        &self.content
    }

    /// `true` if this tag belongs to `group`.
    pub fn is_in_group(&self, group: &str) -> bool {
        self.group == group
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.group, self.content)
    }
}

impl FromStr for Tag {
    type Err = TagError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Tag {
    type Error = TagError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Tag> for String {
    fn from(tag: Tag) -> Self {
        tag.to_string()
    }
}

/// How the executor guards a tag when writing an event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Consistency {
    /// Reserve the tag against the position the handler observed when it
    /// read the tag's state (or no baseline if it never did).
    #[default]
    Observed,
    /// Reserve the tag against an explicitly pinned position.
    Required(SortableUniqueId),
    /// Index the event under the tag without reserving it.
    Skip,
}

/// A tag attached to a new event, together with its [`Consistency`] mode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventTag {
    /// The tag identity.
    pub tag: Tag,
    /// How the executor guards the tag.
    pub consistency: Consistency,
}

impl EventTag {
    /// A tag reserved against the position the handler observed.
    pub fn consistent(tag: Tag) -> Self {
        Self {
            tag,
            consistency: Consistency::Observed,
        }
    }

    /// A tag reserved against an explicitly pinned position.
    pub fn required(tag: Tag, version: SortableUniqueId) -> Self {
        Self {
            tag,
            consistency: Consistency::Required(version),
        }
    }

    /// A tag that is indexed but never reserved.
    pub fn non_consistent(tag: Tag) -> Self {
        Self {
            tag,
            consistency: Consistency::Skip,
        }
    }

    /// `true` unless the tag is [`Consistency::Skip`].
    pub fn is_consistency_tag(&self) -> bool {
        !matches!(self.consistency, Consistency::Skip)
    }
}

impl From<Tag> for EventTag {
    fn from(tag: Tag) -> Self {
        Self::consistent(tag)
    }
}

/// Identity of one tag state actor: a tag plus a projector name.
///
/// Serialized as `Group:Content:Projector`. The group is everything up to
/// the first `:`, the projector everything after the last `:`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TagStateId {
    /// The tag whose events are folded.
    pub tag: Tag,
    /// Name of the registered projector that folds them.
    pub projector: String,
}

impl TagStateId {
    /// Pair a tag with a projector name.
    pub fn new(tag: Tag, projector: impl Into<String>) -> Self {
        Self {
            tag,
            projector: projector.into(),
        }
    }

    /// Parse a `Group:Content:Projector` string.
    ///
    /// # Errors
    ///
    /// Returns [`TagError::MissingProjector`] if the projector part is
    /// missing or empty, or any [`Tag::parse`] error for the rest.
    pub fn parse(value: &str) -> Result<Self, TagError> {
        let (tag, projector) = value
            .rsplit_once(':')
            .filter(|(tag, projector)| !projector.is_empty() && tag.contains(':'))
            .ok_or_else(|| TagError::MissingProjector(value.to_owned()))?;
        Ok(Self {
            tag: Tag::parse(tag)?,
            projector: projector.to_owned(),
        })
    }
}

impl fmt::Display for TagStateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.tag, self.projector)
    }
}

impl FromStr for TagStateId {
    type Err = TagError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for TagStateId {
    type Error = TagError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<TagStateId> for String {
    fn from(id: TagStateId) -> Self {
        id.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_splits_on_first_separator() {
        let tag = Tag::parse("Doc:a:b").expect("valid tag");
        assert_eq!(tag.group(), "Doc");
        assert_eq!(tag.content(), "a:b");
        assert_eq!(tag.to_string(), "Doc:a:b");
    }

    #[test]
    fn parse_rejects_missing_separator() {
        assert_eq!(
            Tag::parse("Student"),
            Err(TagError::MissingSeparator("Student".into()))
        );
    }

    #[test]
    fn parse_rejects_empty_parts() {
        assert!(matches!(Tag::parse(":42"), Err(TagError::EmptyGroup(_))));
        assert!(matches!(
            Tag::parse("Student:"),
            Err(TagError::EmptyContent(_))
        ));
    }

    #[test]
    fn new_rejects_group_with_separator() {
        assert!(matches!(
            Tag::new("A:B", "1"),
            Err(TagError::InvalidGroup(_))
        ));
    }

    #[test]
    fn tag_serializes_as_plain_string() {
        let tag = Tag::new("ClassRoom", "7").expect("valid tag");
        let json = serde_json::to_string(&tag).expect("serialize");
        assert_eq!(json, "\"ClassRoom:7\"");
        let back: Tag = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, tag);
    }

    #[test]
    fn event_tag_from_tag_is_consistent() {
        let tag = Tag::new("Student", "1").expect("valid tag");
        let event_tag = EventTag::from(tag);
        assert_eq!(event_tag.consistency, Consistency::Observed);
        assert!(event_tag.is_consistency_tag());
    }

    #[test]
    fn non_consistent_tag_is_not_reserved() {
        let tag = Tag::new("Audit", "x").expect("valid tag");
        assert!(!EventTag::non_consistent(tag).is_consistency_tag());
    }

    #[test]
    fn tag_state_id_parses_projector_from_last_segment() {
        let id = TagStateId::parse("Doc:a:b:DocProjector").expect("valid id");
        assert_eq!(id.tag.group(), "Doc");
        assert_eq!(id.tag.content(), "a:b");
        assert_eq!(id.projector, "DocProjector");
        assert_eq!(id.to_string(), "Doc:a:b:DocProjector");
    }

    #[test]
    fn tag_state_id_requires_projector() {
        assert!(matches!(
            TagStateId::parse("Student:1"),
            Err(TagError::MissingProjector(_))
        ));
        assert!(matches!(
            TagStateId::parse("Student:1:"),
            Err(TagError::MissingProjector(_))
        ));
    }
}
