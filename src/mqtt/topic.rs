//! Topic routing for inbound broker messages.
//!
//! The client subscribes once to a fixed set of wildcard filters. Routing an
//! inbound topic walks an ordered table of `(kind, pattern, handler)` rows;
//! the first pattern that matches yields the captured ID and its handler.
//! Topics matching no row are dropped by the caller.

use super::config::TopicConfig;
use thiserror::Error;

const WILDCARD: &str = "+";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TopicError {
    #[error("Topic filter {0:?} must contain exactly one '+' segment")]
    WildcardCount(String),

    #[error("Topic filter {0:?} must not use '#'")]
    MultiLevelWildcard(String),
}

/// Message categories understood by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TopicKind {
    /// `<userID>/listDevices`
    ListDevices,
    /// `device/<deviceID>/status`
    DeviceStatus,
    /// relay switch state of `<deviceID>`
    RelayState,
    /// relay power reading of `<deviceID>`
    RelayPower,
}

/// Topic filter with a single `+` segment that captures an ID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicPattern {
    filter: String,
    prefix: Vec<String>,
    suffix: Vec<String>,
}

impl TopicPattern {
    pub fn parse(filter: &str) -> Result<Self, TopicError> {
        let segments: Vec<&str> = filter.split('/').collect();
        if segments.contains(&"#") {
            return Err(TopicError::MultiLevelWildcard(filter.to_string()));
        }

        let mut wildcards = segments.iter().enumerate().filter(|(_, s)| **s == WILDCARD);
        let position = match (wildcards.next(), wildcards.next()) {
            (Some((position, _)), None) => position,
            _ => return Err(TopicError::WildcardCount(filter.to_string())),
        };

        Ok(Self {
            filter: filter.to_string(),
            prefix: segments[..position].iter().map(|s| s.to_string()).collect(),
            suffix: segments[position + 1..].iter().map(|s| s.to_string()).collect(),
        })
    }

    pub fn filter(&self) -> &str {
        &self.filter
    }

    /// Returns the segment matched by `+`, or `None` if `topic` does not match.
    pub fn capture<'t>(&self, topic: &'t str) -> Option<&'t str> {
        let segments: Vec<&'t str> = topic.split('/').collect();
        if segments.len() != self.prefix.len() + 1 + self.suffix.len() {
            return None;
        }

        let (head, rest) = segments.split_at(self.prefix.len());
        let (captured, tail) = rest.split_first()?;
        let matches = head.iter().zip(&self.prefix).all(|(s, p)| *s == p.as_str())
            && tail.iter().zip(&self.suffix).all(|(s, p)| *s == p.as_str());

        if matches && !captured.is_empty() {
            Some(*captured)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone)]
struct Route<H> {
    kind: TopicKind,
    pattern: TopicPattern,
    handler: H,
}

/// Result of routing a topic: which row matched and the captured ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Routed<'t, H> {
    pub kind: TopicKind,
    pub id: &'t str,
    pub handler: H,
}

#[derive(Debug, Clone)]
pub struct TopicRouter<H> {
    routes: Vec<Route<H>>,
}

impl<H: Copy> TopicRouter<H> {
    pub fn new() -> Self {
        Self { routes: Vec::new() }
    }

    /// Appends a row; earlier rows take precedence.
    pub fn route(mut self, kind: TopicKind, filter: &str, handler: H) -> Result<Self, TopicError> {
        self.routes.push(Route {
            kind,
            pattern: TopicPattern::parse(filter)?,
            handler,
        });
        Ok(self)
    }

    /// Builds the standard four-row table from configured filters.
    pub fn from_config(
        topics: &TopicConfig,
        handler_for: impl Fn(TopicKind) -> H,
    ) -> Result<Self, TopicError> {
        [
            (TopicKind::ListDevices, &topics.list_devices),
            (TopicKind::DeviceStatus, &topics.device_status),
            (TopicKind::RelayState, &topics.relay_state),
            (TopicKind::RelayPower, &topics.relay_power),
        ]
        .into_iter()
        .try_fold(Self::new(), |router, (kind, filter)| {
            router.route(kind, filter, handler_for(kind))
        })
    }

    pub fn dispatch<'t>(&self, topic: &'t str) -> Option<Routed<'t, H>> {
        self.routes.iter().find_map(|route| {
            route.pattern.capture(topic).map(|id| Routed {
                kind: route.kind,
                id,
                handler: route.handler,
            })
        })
    }

    /// Filters to subscribe to, in table order.
    pub fn subscription_filters(&self) -> impl Iterator<Item = &str> {
        self.routes.iter().map(|route| route.pattern.filter())
    }
}

impl<H: Copy> Default for TopicRouter<H> {
    fn default() -> Self {
        Self::new()
    }
}
