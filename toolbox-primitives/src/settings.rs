//! Enumerations shared by configuration, the scheduler, and the loader.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::Error;

/// Policy applied to run requests that arrive while one is executing.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SchedulingStrategy {
    /// Every request runs, strictly in submission order.
    QueueAll,
    /// Only the in-flight request and the newest queued one run.
    #[default]
    KeepLatest,
}

impl SchedulingStrategy {
    /// Returns the canonical kebab-case spelling.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::QueueAll => "queue-all",
            Self::KeepLatest => "keep-latest",
        }
    }
}

impl Display for SchedulingStrategy {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SchedulingStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "queue-all" | "queue_all" => Ok(Self::QueueAll),
            "keep-latest" | "keep_latest" => Ok(Self::KeepLatest),
            other => Err(Error::UnknownVariant {
                kind: "scheduling strategy",
                value: other.to_owned(),
                expected: "queue-all, keep-latest",
            }),
        }
    }
}

/// Asset-resolution adapters for packages that ship binary payloads.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AdapterKind {
    /// Media transcoder: constructor instances gain thread-mode initializers.
    MediaTranscoder,
    /// Archive codec: factory's file locator redirects binary payloads.
    ArchiveCodec,
    /// Image codec: initializer fetches its payload when none is supplied.
    ImageCodec,
}

impl AdapterKind {
    /// Returns the canonical kebab-case spelling.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::MediaTranscoder => "media-transcoder",
            Self::ArchiveCodec => "archive-codec",
            Self::ImageCodec => "image-codec",
        }
    }
}

impl Display for AdapterKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
