//! Domain types of the lineage master and their wire counterparts.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::LineageError;

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LineageId(pub i64);

impl LineageId {
    #[inline]
    pub const fn new(raw: i64) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn get(self) -> i64 {
        self.0
    }
}

impl fmt::Display for LineageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileId(pub i64);

impl FileId {
    #[inline]
    pub const fn new(raw: i64) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn get(self) -> i64 {
        self.0
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// File path, optionally qualified with `scheme://authority`.
///
/// The path component is absolute and normalized: repeated separators are
/// collapsed and a trailing separator is dropped.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct LineageUri {
    scheme: Option<String>,
    authority: Option<String>,
    path: String,
}

impl LineageUri {
    pub fn parse(raw: &str) -> Result<Self, LineageError> {
        let invalid = |reason: &str| LineageError::InvalidPath {
            path: raw.to_string(),
            reason: reason.to_string(),
        };
        if raw.trim().is_empty() {
            return Err(invalid("path is empty"));
        }

        let (scheme, authority, path) = match raw.split_once("://") {
            Some((scheme, rest)) => {
                let valid = |c: char| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.');
                if scheme.is_empty() || !scheme.chars().all(valid) {
                    return Err(invalid("malformed scheme"));
                }
                let (authority, path) = match rest.find('/') {
                    Some(idx) => (&rest[..idx], &rest[idx..]),
                    None => (rest, "/"),
                };
                let authority = (!authority.is_empty()).then(|| authority.to_string());
                (Some(scheme.to_ascii_lowercase()), authority, path)
            }
            None => (None, None, raw),
        };
        if !path.starts_with('/') {
            return Err(invalid("path must be absolute"));
        }

        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        if segments.iter().any(|s| *s == "." || *s == "..") {
            return Err(invalid("relative segments are not allowed"));
        }
        let path = format!("/{}", segments.join("/"));
        Ok(Self {
            scheme,
            authority,
            path,
        })
    }

    pub fn scheme(&self) -> Option<&str> {
        self.scheme.as_deref()
    }

    pub fn authority(&self) -> Option<&str> {
        self.authority.as_deref()
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn is_root(&self) -> bool {
        self.path == "/"
    }
}

impl FromStr for LineageUri {
    type Err = LineageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for LineageUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(scheme) = &self.scheme {
            write!(f, "{scheme}://{}", self.authority.as_deref().unwrap_or(""))?;
        }
        f.write_str(&self.path)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JobConf {
    pub output_file: String,
}

/// Job that regenerates a lineage's outputs by running a shell command.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandLineJob {
    pub command: String,
    pub conf: JobConf,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobConfInfo {
    pub output_file: String,
}

/// Wire form of [`CommandLineJob`].
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandLineJobInfo {
    pub command: String,
    pub conf: JobConfInfo,
}

impl From<CommandLineJobInfo> for CommandLineJob {
    fn from(value: CommandLineJobInfo) -> Self {
        Self {
            command: value.command,
            conf: JobConf {
                output_file: value.conf.output_file,
            },
        }
    }
}

impl From<CommandLineJob> for CommandLineJobInfo {
    fn from(value: CommandLineJob) -> Self {
        Self {
            command: value.command,
            conf: JobConfInfo {
                output_file: value.conf.output_file,
            },
        }
    }
}

/// Lineage as the master knows it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LineageInfo {
    pub id: LineageId,
    pub input_files: Vec<LineageUri>,
    pub output_files: Vec<LineageUri>,
    pub job: CommandLineJob,
    pub creation_time_ms: i64,
    pub parents: Vec<LineageId>,
    pub children: Vec<LineageId>,
}

/// Wire form of [`LineageInfo`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineageRecord {
    pub id: i64,
    pub input_files: Vec<String>,
    pub output_files: Vec<String>,
    pub job: CommandLineJobInfo,
    pub creation_time_ms: i64,
    pub parents: Vec<i64>,
    pub children: Vec<i64>,
}

impl From<LineageInfo> for LineageRecord {
    fn from(value: LineageInfo) -> Self {
        Self {
            id: value.id.get(),
            input_files: value.input_files.iter().map(ToString::to_string).collect(),
            output_files: value.output_files.iter().map(ToString::to_string).collect(),
            job: value.job.into(),
            creation_time_ms: value.creation_time_ms,
            parents: value.parents.into_iter().map(LineageId::get).collect(),
            children: value.children.into_iter().map(LineageId::get).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_and_normalizes_paths() {
        let uri = LineageUri::parse("/data//out/").unwrap();
        assert_eq!(uri.path(), "/data/out");
        assert_eq!(uri.scheme(), None);
        assert_eq!(uri.to_string(), "/data/out");

        let uri: LineageUri = "BOP://master:19998/logs/a".parse().unwrap();
        assert_eq!(uri.scheme(), Some("bop"));
        assert_eq!(uri.authority(), Some("master:19998"));
        assert_eq!(uri.to_string(), "bop://master:19998/logs/a");

        assert!(LineageUri::parse("/").unwrap().is_root());
    }

    #[test]
    fn rejects_invalid_paths() {
        for raw in ["", "  ", "relative/path", "/a/../b", "://x/y", "s c://x/y"] {
            assert!(
                matches!(LineageUri::parse(raw), Err(LineageError::InvalidPath { .. })),
                "{raw:?} should be rejected"
            );
        }
    }

    #[test]
    fn record_flattens_ids_and_paths() {
        let info = LineageInfo {
            id: LineageId::new(3),
            input_files: vec![LineageUri::parse("/in").unwrap()],
            output_files: vec![LineageUri::parse("/out").unwrap()],
            job: CommandLineJob {
                command: "make".to_string(),
                conf: JobConf {
                    output_file: "/log".to_string(),
                },
            },
            creation_time_ms: 1_000,
            parents: vec![LineageId::new(1)],
            children: vec![],
        };
        let record = LineageRecord::from(info);
        assert_eq!(record.id, 3);
        assert_eq!(record.input_files, vec!["/in"]);
        assert_eq!(record.job.conf.output_file, "/log");
        assert_eq!(record.parents, vec![1]);
    }
}
