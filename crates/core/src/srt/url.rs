//! Publish URLs and stream identifiers.
//!
//! ```text
//! srt://ingest.example.com:5000?streamid=abc123&latency=2000
//! srtla://192.168.1.10:5000?streamid=abc123
//! ```

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use url::Url;

use super::SrtConfig;
use crate::error::{Error, Result};

/// Identifier a receiver uses to route the stream. ASCII alphanumerics only;
/// may be empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct StreamId(String);

impl StreamId {
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        if !id.bytes().all(|b| b.is_ascii_alphanumeric()) {
            return Err(Error::InvalidStreamId(id));
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromStr for StreamId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Srt,
    /// SRT over bonded links.
    Srtla,
}

impl Scheme {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Srt => "srt",
            Self::Srtla => "srtla",
        }
    }
}

/// Where and how to publish over SRT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishUrl {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
    pub stream_id: StreamId,
    pub config: SrtConfig,
}

impl PublishUrl {
    pub fn new(scheme: Scheme, host: impl Into<String>, port: u16, stream_id: StreamId) -> Self {
        Self {
            scheme,
            host: host.into(),
            port,
            stream_id,
            config: SrtConfig::default(),
        }
    }

    /// Parse and validate a publish URL.
    ///
    /// Recognized query parameters are `streamid` and `latency` (in
    /// milliseconds); others are ignored.
    pub fn parse(input: &str) -> Result<Self> {
        let url = Url::parse(input)?;
        let scheme = match url.scheme() {
            "srt" => Scheme::Srt,
            "srtla" => Scheme::Srtla,
            _ => return Err(Error::InvalidUrl("scheme must be srt or srtla")),
        };
        let host = url
            .host_str()
            .filter(|host| !host.is_empty())
            .ok_or(Error::InvalidUrl("missing host"))?;
        let port = url.port().ok_or(Error::InvalidUrl("missing port"))?;

        let mut publish = Self::new(scheme, host, port, StreamId::default());
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "streamid" => publish.stream_id = StreamId::new(value.into_owned())?,
                "latency" => {
                    let millis: u64 = value
                        .parse()
                        .map_err(|_| Error::InvalidUrl("latency must be milliseconds"))?;
                    publish.config.latency = Duration::from_millis(millis);
                }
                other => tracing::debug!(key = other, "ignoring publish URL parameter"),
            }
        }
        Ok(publish)
    }
}

impl FromStr for PublishUrl {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for PublishUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.scheme.as_str(), self.host, self.port)?;
        let mut separator = '?';
        if !self.stream_id.is_empty() {
            write!(f, "{separator}streamid={}", self.stream_id)?;
            separator = '&';
        }
        if self.config.latency != SrtConfig::default().latency {
            write!(f, "{separator}latency={}", self.config.latency.as_millis())?;
        }
        Ok(())
    }
}
