use anyhow::{anyhow, Result};
use std::fmt;
use std::str::FromStr;

use crate::config::ConfigError;

/// Which half of a `team/repo` reference keys logs, containers and retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IdentifierMode {
    #[default]
    Team,
    Image,
}

impl IdentifierMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            IdentifierMode::Team => "team",
            IdentifierMode::Image => "image",
        }
    }
}

impl FromStr for IdentifierMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "team" => Ok(IdentifierMode::Team),
            "image" => Ok(IdentifierMode::Image),
            other => Err(ConfigError::UnknownIdentifier(other.to_string())),
        }
    }
}

/// A published solution image, `team/repo` with an optional `:tag`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ImageRef {
    reference: String,
    split: usize,
}

impl ImageRef {
    pub fn parse(reference: &str) -> Result<Self> {
        let reference = reference.trim();
        let split = reference
            .find('/')
            .ok_or_else(|| anyhow!("image '{}' is not of the form team/repo", reference))?;
        if split == 0 || split + 1 == reference.len() {
            return Err(anyhow!(
                "image '{}' is not of the form team/repo",
                reference
            ));
        }
        Ok(Self {
            reference: reference.to_string(),
            split,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.reference
    }

    pub fn team(&self) -> &str {
        &self.reference[..self.split]
    }

    /// The path segment right after the team, without any `:tag` or
    /// `@digest` suffix. Container names must not carry either.
    pub fn repo(&self) -> &str {
        let rest = &self.reference[self.split + 1..];
        let segment = rest.split('/').next().unwrap_or(rest);
        let segment = segment.split('@').next().unwrap_or(segment);
        segment.split(':').next().unwrap_or(segment)
    }

    pub fn identifier(&self, mode: IdentifierMode) -> &str {
        match mode {
            IdentifierMode::Team => self.team(),
            IdentifierMode::Image => self.repo(),
        }
    }

    pub fn container_name(&self, prefix: &str, mode: IdentifierMode) -> String {
        format!("{}{}", prefix, self.identifier(mode))
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.reference)
    }
}
