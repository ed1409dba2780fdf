use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

const PREFIX: &str = "wot:";

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ResourceRefError {
    #[error("resource ref must start with \"wot:\": {0}")]
    MissingPrefix(String),
    #[error("resource ref is missing its type: {0}")]
    MissingType(String),
    #[error("unknown resource type \"{0}\"")]
    UnknownType(String),
    #[error("resource ref is missing its id: {0}")]
    MissingId(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceType {
    Attestation,
    Verification,
    Contact,
    Space,
    Item,
}

impl ResourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceType::Attestation => "attestation",
            ResourceType::Verification => "verification",
            ResourceType::Contact => "contact",
            ResourceType::Space => "space",
            ResourceType::Item => "item",
        }
    }

    fn from_name(s: &str) -> Option<Self> {
        match s {
            "attestation" => Some(ResourceType::Attestation),
            "verification" => Some(ResourceType::Verification),
            "contact" => Some(ResourceType::Contact),
            "space" => Some(ResourceType::Space),
            "item" => Some(ResourceType::Item),
            _ => None,
        }
    }
}

/// Pointer to a resource: `wot:<type>:<id>[/<sub-path>]`.
///
/// Ids may contain colons (`wot:contact:did:key:z6Mk...`); the first `/`
/// after the type separates the id from the sub-path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ResourceRef {
    pub resource_type: ResourceType,
    pub id: String,
    pub sub_path: Option<String>,
}

impl ResourceRef {
    pub fn new(resource_type: ResourceType, id: impl Into<String>) -> Self {
        Self {
            resource_type,
            id: id.into(),
            sub_path: None,
        }
    }

    pub fn with_sub_path(mut self, sub_path: impl Into<String>) -> Self {
        self.sub_path = Some(sub_path.into());
        self
    }

    pub fn space(space_id: &str) -> Self {
        Self::new(ResourceType::Space, space_id)
    }

    pub fn parse(s: &str) -> Result<Self, ResourceRefError> {
        let rest = s
            .strip_prefix(PREFIX)
            .ok_or_else(|| ResourceRefError::MissingPrefix(s.to_string()))?;

        let (type_str, rest) = rest
            .split_once(':')
            .ok_or_else(|| ResourceRefError::MissingType(s.to_string()))?;

        let resource_type = ResourceType::from_name(type_str)
            .ok_or_else(|| ResourceRefError::UnknownType(type_str.to_string()))?;

        if rest.is_empty() {
            return Err(ResourceRefError::MissingId(s.to_string()));
        }

        let (id, sub_path) = match rest.split_once('/') {
            Some((id, sub)) => (id.to_string(), Some(sub.to_string())),
            None => (rest.to_string(), None),
        };

        Ok(Self {
            resource_type,
            id,
            sub_path,
        })
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}:{}", PREFIX, self.resource_type.as_str(), self.id)?;
        if let Some(sub) = &self.sub_path {
            write!(f, "/{}", sub)?;
        }
        Ok(())
    }
}

impl TryFrom<String> for ResourceRef {
    type Error = ResourceRefError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        ResourceRef::parse(&value)
    }
}

impl From<ResourceRef> for String {
    fn from(value: ResourceRef) -> Self {
        value.to_string()
    }
}
