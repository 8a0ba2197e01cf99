// src/location.rs

//! Feature-pack locations and the identities derived from them
//!
//! A location names where a feature-pack comes from using the format:
//! `producer[@universe]:channel[/frequency][#build]`
//!
//! Examples:
//! - `wildfly:current#27.0.0` - build 27.0.0 on the `current` channel
//! - `wildfly@maven(org.wildfly:universe):26.x/final#26.1.3` - with a universe
//! - `core:main/snapshot` - latest snapshot, build not yet resolved
//!
//! # Identity Levels
//!
//! - **Producer**: `(universe?, producer)` - the logical owner of a line
//! - **Channel**: `(universe?, producer, channel)` - a stream of compatible
//!   builds; equality ignores frequency and build
//! - **Fpid**: `(universe?, producer, channel, build)` - one resolvable
//!   artifact; equality ignores frequency
//! - **Location**: the full tuple

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// The logical owner of a feature-pack line
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Producer {
    universe: Option<String>,
    name: String,
}

impl Producer {
    /// Create a producer in the default universe
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            universe: None,
            name: name.into(),
        }
    }

    /// Create a producer in an explicit universe
    pub fn with_universe(name: impl Into<String>, universe: impl Into<String>) -> Self {
        Self {
            universe: Some(universe.into()),
            name: name.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn universe(&self) -> Option<&str> {
        self.universe.as_deref()
    }

    /// Parse `producer[@universe]`
    pub fn parse(s: &str) -> Result<Self> {
        let (name, universe) = split_producer(s, s)?;
        Ok(Self {
            universe: universe.map(str::to_string),
            name: name.to_string(),
        })
    }
}

impl fmt::Display for Producer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.universe {
            Some(universe) => write!(f, "{}@{}", self.name, universe),
            None => write!(f, "{}", self.name),
        }
    }
}

/// A producer's stream of backward-compatible builds
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Channel {
    producer: Producer,
    name: String,
}

impl Channel {
    pub fn new(producer: Producer, name: impl Into<String>) -> Self {
        Self {
            producer,
            name: name.into(),
        }
    }

    pub fn producer(&self) -> &Producer {
        &self.producer
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Identify a build on this channel
    pub fn fpid(&self, build: impl Into<String>) -> Fpid {
        Fpid {
            channel: self.clone(),
            build: Some(build.into()),
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.producer, self.name)
    }
}

/// Feature-pack identity: a channel plus the build it resolves to
///
/// The build is optional only so that unresolved dependency declarations can
/// be represented; version resolution reports such identities as missing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Fpid {
    channel: Channel,
    build: Option<String>,
}

impl Fpid {
    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    pub fn producer(&self) -> &Producer {
        &self.channel.producer
    }

    pub fn build(&self) -> Option<&str> {
        self.build.as_deref()
    }

    /// The location of this build with no frequency
    pub fn location(&self) -> Location {
        Location {
            channel: self.channel.clone(),
            frequency: None,
            build: self.build.clone(),
        }
    }

    /// Parse `producer[@universe]:channel[#build]`; a frequency is rejected
    pub fn parse(s: &str) -> Result<Self> {
        let location = Location::parse(s)?;
        if location.frequency.is_some() {
            return Err(Error::malformed(s, "a feature-pack id carries no frequency"));
        }
        Ok(location.fpid())
    }
}

impl fmt::Display for Fpid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.channel)?;
        if let Some(build) = &self.build {
            write!(f, "#{}", build)?;
        }
        Ok(())
    }
}

impl FromStr for Fpid {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Fpid::parse(s)
    }
}

impl TryFrom<String> for Fpid {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Fpid::parse(&value)
    }
}

impl From<Fpid> for String {
    fn from(fpid: Fpid) -> Self {
        fpid.to_string()
    }
}

/// Full feature-pack location
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Location {
    channel: Channel,
    frequency: Option<String>,
    build: Option<String>,
}

impl Location {
    /// Create a location from its parts
    pub fn new(
        producer: Producer,
        channel: impl Into<String>,
        frequency: Option<&str>,
        build: Option<&str>,
    ) -> Self {
        Self {
            channel: Channel::new(producer, channel),
            frequency: frequency.map(str::to_string),
            build: build.map(str::to_string),
        }
    }

    /// Parse a location from `producer[@universe]:channel[/frequency][#build]`
    pub fn parse(s: &str) -> Result<Self> {
        // Build: last '#' in the string
        let (rest, build) = match s.rfind('#') {
            Some(pos) => {
                let build = &s[pos + 1..];
                if build.is_empty() {
                    return Err(Error::malformed(s, "empty build after '#'"));
                }
                (&s[..pos], Some(build))
            }
            None => (s, None),
        };

        // Universe/channel boundary: last ':' outside any parentheses, so a
        // universe such as `maven(group:artifact)` may carry its own colons
        let colon = find_channel_boundary(rest)
            .ok_or_else(|| Error::malformed(s, "missing ':' between producer and channel"))?;

        let (producer, universe) = split_producer(&rest[..colon], s)?;

        let channel_part = &rest[colon + 1..];
        let (channel, frequency) = match channel_part.find('/') {
            Some(pos) => {
                let frequency = &channel_part[pos + 1..];
                if frequency.is_empty() {
                    return Err(Error::malformed(s, "empty frequency after '/'"));
                }
                (&channel_part[..pos], Some(frequency))
            }
            None => (channel_part, None),
        };

        if channel.is_empty() {
            return Err(Error::malformed(s, "empty channel"));
        }
        if channel.contains('@') {
            return Err(Error::malformed(s, "'@' must precede the channel"));
        }

        Ok(Self {
            channel: Channel {
                producer: Producer {
                    universe: universe.map(str::to_string),
                    name: producer.to_string(),
                },
                name: channel.to_string(),
            },
            frequency: frequency.map(str::to_string),
            build: build.map(str::to_string),
        })
    }

    pub fn producer(&self) -> &Producer {
        &self.channel.producer
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    pub fn frequency(&self) -> Option<&str> {
        self.frequency.as_deref()
    }

    pub fn build(&self) -> Option<&str> {
        self.build.as_deref()
    }

    pub fn has_build(&self) -> bool {
        self.build.is_some()
    }

    /// Derive the feature-pack identity (drops the frequency)
    pub fn fpid(&self) -> Fpid {
        Fpid {
            channel: self.channel.clone(),
            build: self.build.clone(),
        }
    }

    /// Same channel and frequency, different build
    pub fn with_build(&self, build: impl Into<String>) -> Self {
        Self {
            channel: self.channel.clone(),
            frequency: self.frequency.clone(),
            build: Some(build.into()),
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.channel)?;
        if let Some(frequency) = &self.frequency {
            write!(f, "/{}", frequency)?;
        }
        if let Some(build) = &self.build {
            write!(f, "#{}", build)?;
        }
        Ok(())
    }
}

impl FromStr for Location {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Location::parse(s)
    }
}

impl TryFrom<String> for Location {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Location::parse(&value)
    }
}

impl From<Location> for String {
    fn from(location: Location) -> Self {
        location.to_string()
    }
}

impl From<Fpid> for Location {
    fn from(fpid: Fpid) -> Self {
        fpid.location()
    }
}

/// Right-to-left scan for a ':' that is not enclosed in parentheses
fn find_channel_boundary(s: &str) -> Option<usize> {
    let mut depth = 0usize;
    for (pos, c) in s.char_indices().rev() {
        match c {
            ')' => depth += 1,
            '(' => depth = depth.saturating_sub(1),
            ':' if depth == 0 => return Some(pos),
            _ => {}
        }
    }
    None
}

/// Split `producer[@universe]` at the first '@'
fn split_producer<'a>(s: &'a str, input: &str) -> Result<(&'a str, Option<&'a str>)> {
    let (producer, universe) = match s.find('@') {
        Some(pos) => {
            let universe = &s[pos + 1..];
            if universe.is_empty() {
                return Err(Error::malformed(input, "empty universe after '@'"));
            }
            (&s[..pos], Some(universe))
        }
        None => (s, None),
    };

    if producer.is_empty() {
        return Err(Error::malformed(input, "empty producer"));
    }
    if producer.contains(['/', '#', ':']) {
        return Err(Error::malformed(input, "producer contains a separator"));
    }
    Ok((producer, universe))
}
