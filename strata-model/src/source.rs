use serde::{Deserialize, Serialize};
use std::{fmt, path::PathBuf};

use crate::error::{ModelError, Result};

/// What kind of scannable unit a source points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    File,
    ArchiveMember,
}

/// One discovered, scannable unit of input.
///
/// A source is immutable once discovered: the walk builds it, the queue holds
/// it, and afterwards exactly one task owns it. There are no setters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventSource {
    location: PathBuf,
    /// Outer to inner container chain (disk image, archive, ...). Empty for
    /// plain files on a mounted filesystem.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    containers: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    size: Option<u64>,
    kind: SourceKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    format_hint: Option<String>,
}

impl EventSource {
    pub fn file(location: impl Into<PathBuf>) -> Self {
        Self {
            location: location.into(),
            containers: Vec::new(),
            size: None,
            kind: SourceKind::File,
            format_hint: None,
        }
    }

    /// A member inside one or more containers, outermost first.
    pub fn archive_member(
        containers: Vec<String>,
        location: impl Into<PathBuf>,
    ) -> Result<Self> {
        if containers.is_empty() {
            return Err(ModelError::InvalidSource(
                "archive member without a container".into(),
            ));
        }
        Ok(Self {
            location: location.into(),
            containers,
            size: None,
            kind: SourceKind::ArchiveMember,
            format_hint: None,
        })
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }

    pub fn with_format_hint(mut self, format: impl Into<String>) -> Self {
        self.format_hint = Some(format.into());
        self
    }

    pub fn location(&self) -> &std::path::Path {
        &self.location
    }

    pub fn containers(&self) -> &[String] {
        &self.containers
    }

    pub fn size(&self) -> Option<u64> {
        self.size
    }

    pub fn kind(&self) -> SourceKind {
        self.kind
    }

    pub fn format_hint(&self) -> Option<&str> {
        self.format_hint.as_deref()
    }

    /// Human readable path including the container chain, e.g.
    /// `image.e01!evidence.zip!/logs/app.log`.
    pub fn display_name(&self) -> String {
        let mut out = String::new();
        for container in &self.containers {
            out.push_str(container);
            out.push('!');
        }
        out.push_str(&self.location.to_string_lossy());
        out
    }
}

impl fmt::Display for EventSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.display_name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_name_walks_container_chain() {
        let source = EventSource::archive_member(
            vec!["image.e01".into(), "evidence.zip".into()],
            "/logs/app.log",
        )
        .expect("valid member");
        assert_eq!(
            source.display_name(),
            "image.e01!evidence.zip!/logs/app.log"
        );
        assert_eq!(source.kind(), SourceKind::ArchiveMember);
    }

    #[test]
    fn archive_member_requires_container() {
        assert!(EventSource::archive_member(Vec::new(), "a").is_err());
    }

    #[test]
    fn serde_omits_empty_optionals() {
        let json = serde_json::to_string(&EventSource::file("/tmp/a")).unwrap();
        assert_eq!(json, r#"{"location":"/tmp/a","kind":"file"}"#);
    }
}
