use thiserror::Error;

/// What a source adapter reports for a single query.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueryError {
    /// The source has no data for this pair (HTTP 404 or equivalent)
    #[error("not found")]
    NotFound,

    #[error("{0}")]
    Transient(String),
}

/// Per-pair fetch failures, carried as values in a fetch round's results.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("No data found for {pair} from {source_id}")]
    NotFound { pair: String, source_id: String },

    #[error("No data found for {pair} from {source_id} - hop failed for {currency}")]
    HopFailed {
        pair: String,
        source_id: String,
        currency: String,
    },

    #[error("transient failure fetching {pair} from {source_id}: {reason}")]
    Transient {
        pair: String,
        source_id: String,
        reason: String,
    },

    #[error("timed out fetching {pair} from {source_id}")]
    Timeout { pair: String, source_id: String },

    #[error("invalid price for {pair} from {source_id}: {reason}")]
    InvalidPrice {
        pair: String,
        source_id: String,
        reason: String,
    },
}

impl FetchError {
    pub fn pair(&self) -> &str {
        match self {
            FetchError::NotFound { pair, .. }
            | FetchError::HopFailed { pair, .. }
            | FetchError::Transient { pair, .. }
            | FetchError::Timeout { pair, .. }
            | FetchError::InvalidPrice { pair, .. } => pair,
        }
    }

    pub fn source_name(&self) -> &str {
        match self {
            FetchError::NotFound { source_id, .. }
            | FetchError::HopFailed { source_id, .. }
            | FetchError::Transient { source_id, .. }
            | FetchError::Timeout { source_id, .. }
            | FetchError::InvalidPrice { source_id, .. } => source_id,
        }
    }

    /// Whether the next scheduled cycle may succeed where this one did not
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            FetchError::Transient { .. } | FetchError::Timeout { .. }
        )
    }
}

/// Aggregation outcomes that are not a price.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AggregationError {
    #[error("insufficient data for {pair}: no quotes younger than {max_age}s")]
    InsufficientData { pair: String, max_age: u64 },
}

/// Publishing errors, reported per settlement-kind partition.
#[derive(Error, Debug)]
pub enum PublishError {
    #[error("no signer configured")]
    SigningUnavailable,

    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("failed to sign publish message: {0}")]
    Signing(String),

    #[error("publish rejected with status {status}: {body}")]
    Rejected { status: u16, body: String },

    /// Accepted by the server, but the acknowledgement could not be read
    #[error("unreadable publish acknowledgement: {0}")]
    InvalidAck(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("chain client error: {0}")]
    Chain(String),
}

impl PublishError {
    /// Only transport failures are worth retrying within one publish call
    pub fn is_transient(&self) -> bool {
        matches!(self, PublishError::Transport(_))
    }
}

impl From<reqwest::Error> for PublishError {
    fn from(e: reqwest::Error) -> Self {
        PublishError::Transport(e.to_string())
    }
}

/// Configuration-related errors with structured variants.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("{0} list must not be empty")]
    Empty(&'static str),

    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },

    #[error("unknown currency '{0}'")]
    UnknownCurrency(String),

    #[error("unknown source '{0}'")]
    UnknownSource(String),
}
