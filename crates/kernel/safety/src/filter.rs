use conclave_types::ActorId;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// What a coercion filter says about one piece of content.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum FilterVerdict {
    /// Content may go out, possibly rewritten.
    Accept { transformed: String },
    /// Content should be revised by its author.
    Reject { reason: String },
    /// Content must never go out.
    Block { violation: String },
}

/// The external coercion filter. Pattern logic lives behind this trait.
pub trait CoercionFilter: Send + Sync {
    fn transform(&self, content: &str) -> FilterVerdict;
}

/// Content that has passed a filter. Only [`screen`] produces one.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct FilteredContent(String);

impl FilteredContent {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

/// The checked form of a [`FilterVerdict`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FilterOutcome {
    Accepted(FilteredContent),
    Rejected { reason: String },
    Blocked { violation: String },
}

impl FilterOutcome {
    pub fn accepted(&self) -> Option<&FilteredContent> {
        match self {
            FilterOutcome::Accepted(content) => Some(content),
            _ => None,
        }
    }
}

/// Run `content` through `filter`.
pub fn screen(filter: &dyn CoercionFilter, content: &str) -> FilterOutcome {
    match filter.transform(content) {
        FilterVerdict::Accept { transformed } => FilterOutcome::Accepted(FilteredContent(transformed)),
        FilterVerdict::Reject { reason } => FilterOutcome::Rejected { reason },
        FilterVerdict::Block { violation } => {
            warn!(violation = %violation, "Content blocked by coercion filter");
            FilterOutcome::Blocked { violation }
        }
    }
}

/// A participant-facing message. Its body can only be filtered content.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ParticipantMessage {
    pub recipient: ActorId,
    body: FilteredContent,
}

impl ParticipantMessage {
    pub fn new(recipient: ActorId, body: FilteredContent) -> Self {
        Self { recipient, body }
    }

    pub fn body(&self) -> &str {
        self.body.as_str()
    }
}

/// Term lists for [`TermFilter`]. Empty by default; the actual lists are
/// deployment policy.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TermFilterConfig {
    /// Any of these blocks the content.
    pub block: Vec<String>,
    /// Any of these sends the content back to its author.
    pub reject: Vec<String>,
    /// `(from, to)` replacements applied to accepted content.
    pub rewrite: Vec<(String, String)>,
}

/// Case-insensitive term matcher driven entirely by configuration.
pub struct TermFilter {
    config: TermFilterConfig,
}

impl TermFilter {
    pub fn new(config: TermFilterConfig) -> Self {
        let lower = |terms: Vec<String>| terms.into_iter().map(|t| t.to_lowercase()).collect();
        Self {
            config: TermFilterConfig {
                block: lower(config.block),
                reject: lower(config.reject),
                rewrite: config.rewrite,
            },
        }
    }

    fn first_match<'a>(terms: &'a [String], haystack: &str) -> Option<&'a str> {
        terms
            .iter()
            .find(|t| !t.is_empty() && haystack.contains(t.as_str()))
            .map(String::as_str)
    }
}

impl CoercionFilter for TermFilter {
    fn transform(&self, content: &str) -> FilterVerdict {
        let lowered = content.to_lowercase();
        if let Some(term) = Self::first_match(&self.config.block, &lowered) {
            return FilterVerdict::Block {
                violation: format!("blocked term \"{term}\""),
            };
        }
        if let Some(term) = Self::first_match(&self.config.reject, &lowered) {
            return FilterVerdict::Reject {
                reason: format!("contains \"{term}\""),
            };
        }
        let transformed = self
            .config
            .rewrite
            .iter()
            .filter(|(from, _)| !from.is_empty())
            .fold(content.to_string(), |text, (from, to)| text.replace(from.as_str(), to));
        FilterVerdict::Accept { transformed }
    }
}
