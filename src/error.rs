//! Typed error taxonomy for the election agent
//!
//! Every upstream failure is funneled into a closed set of variants so the
//! loops can route them with a `match` instead of string inspection. The
//! breakers only ever look at the coarse classification helpers below.

use std::time::Duration;

/// Coarse transport failure classes, used by the OFFLINE breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkErrorKind {
    Timeout,
    Connection,
    Dns,
    Tls,
    Other,
}

impl NetworkErrorKind {
    /// Stat key suffix (`net_error_<kind>`).
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::Connection => "conn",
            Self::Dns => "dns",
            Self::Tls => "tls",
            Self::Other => "other",
        }
    }
}

/// Authentication failure classes. All of them send the current session
/// back to the relogin pool and advance the auth breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthErrorKind {
    SessionExpired,
    InvalidToken,
    SharedSession,
    NoAuthInfo,
}

impl AuthErrorKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SessionExpired => "session_expired",
            Self::InvalidToken => "invalid_token",
            Self::SharedSession => "shared_session",
            Self::NoAuthInfo => "no_auth_info",
        }
    }
}

/// Why a course was moved to the `ignored` set. Once ignored, a course is
/// skipped for the remainder of the process lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum IgnoreReason {
    Elected,
    MutexRules,
    Repeated,
    TimeConflict,
    ExamTimeConflict,
    PermissionRequired,
    CreditsLimited,
    MutualExclusive,
    MultiEnglish,
    MultiPE,
}

impl std::fmt::Display for IgnoreReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Elected => "Elected",
            Self::MutexRules => "Mutex rules",
            Self::Repeated => "Repeated",
            Self::TimeConflict => "Time conflict",
            Self::ExamTimeConflict => "Exam time conflict",
            Self::PermissionRequired => "Permission required",
            Self::CreditsLimited => "Credits limited",
            Self::MutualExclusive => "Mutual exclusive",
            Self::MultiEnglish => "Multi English course",
            Self::MultiPE => "Multi PE course",
        };
        f.write_str(s)
    }
}

/// The unified error type crossing the client / classifier / loop seams.
#[derive(Debug, thiserror::Error)]
pub enum ElectiveError {
    /// Transport-level failure (timeout, refused, DNS, TLS, ...).
    #[error("network error ({}): {message}", .kind.as_str())]
    Network {
        kind: NetworkErrorKind,
        message: String,
    },

    /// 5xx from either host.
    #[error("server error: HTTP {status}")]
    ServerError { status: u16 },

    /// Any other non-2xx status.
    #[error("unexpected status code: HTTP {status}")]
    StatusCodeError { status: u16 },

    /// IAAA login rejected the password.
    #[error("IAAA incorrect password: {message}")]
    IaaaIncorrectPassword { message: String },

    /// IAAA refused to serve us at all. Critical.
    #[error("IAAA forbidden: {message}")]
    IaaaForbidden { message: String },

    /// IAAA returned `success=false` with an unrecognized code.
    #[error("IAAA not successful (code={code}): {message}")]
    IaaaNotSuccess { code: String, message: String },

    /// A known auth error page from the elective host.
    #[error("auth error ({}): {message}", .kind.as_str())]
    Auth {
        kind: AuthErrorKind,
        message: String,
    },

    /// The site reports we are outside the operation window. Carries the
    /// raw message so the schedule hint can be extracted from it.
    #[error("not in operation time: {message}")]
    NotInOperationTime { message: String },

    /// The site flagged our traffic as cheating. Critical.
    #[error("caught cheating: {message}")]
    CaughtCheating { message: String },

    /// Listing page did not contain the datagrid shape we expect.
    #[error("unexpected HTML format: {message}")]
    UnexpectedHtmlFormat { message: String },

    /// A JSON body failed to decode where one was required.
    #[error("JSON decode failed: {message}")]
    JsonDecode { message: String },

    /// A multi-step operation gave up after its local retries.
    #[error("operation failed: {message}")]
    OperationFailed { message: String },

    /// A goal course is absent from the plan listing; config problem.
    #[error("user input error: {message}")]
    UserInput { message: String },
}

impl ElectiveError {
    /// Build a transport error from a `reqwest` failure, walking the source
    /// chain to classify DNS/TLS/connection causes.
    #[must_use]
    pub fn from_reqwest(err: &reqwest::Error) -> Self {
        let kind = classify_reqwest(err);
        Self::Network {
            kind,
            message: format!("{err}"),
        }
    }

    /// Whether this error counts towards the OFFLINE streak.
    #[must_use]
    pub fn network_kind(&self) -> Option<NetworkErrorKind> {
        match self {
            Self::Network { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// Whether this error advances the auth breaker.
    #[must_use]
    pub fn auth_kind(&self) -> Option<AuthErrorKind> {
        match self {
            Self::Auth { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// Stable key for the error-aggregation report.
    #[must_use]
    pub fn agg_key(&self) -> String {
        match self {
            Self::Network { kind, .. } => format!("Network/{}", kind.as_str()),
            Self::ServerError { status } | Self::StatusCodeError { status } => {
                format!("Http/{status}")
            }
            Self::Auth { kind, .. } => format!("Auth/{}", kind.as_str()),
            Self::IaaaIncorrectPassword { .. } => "IaaaIncorrectPassword".to_string(),
            Self::IaaaForbidden { .. } => "IaaaForbidden".to_string(),
            Self::IaaaNotSuccess { code, .. } => format!("IaaaNotSuccess/{code}"),
            Self::NotInOperationTime { .. } => "NotInOperationTime".to_string(),
            Self::CaughtCheating { .. } => "CaughtCheating".to_string(),
            Self::UnexpectedHtmlFormat { .. } => "UnexpectedHtmlFormat".to_string(),
            Self::JsonDecode { .. } => "JsonDecode".to_string(),
            Self::OperationFailed { .. } => "OperationFailed".to_string(),
            Self::UserInput { .. } => "UserInput".to_string(),
        }
    }
}

fn classify_reqwest(err: &reqwest::Error) -> NetworkErrorKind {
    if err.is_timeout() {
        return NetworkErrorKind::Timeout;
    }
    // Walk the source chain; hyper/rustls bury the interesting cause.
    let mut msgs = Vec::new();
    let mut source: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(e) = source {
        msgs.push(e.to_string().to_lowercase());
        source = e.source();
    }
    let joined = msgs.join("; ");
    let dns_hints = [
        "dns error",
        "failed to lookup address",
        "name or service not known",
        "temporary failure in name resolution",
        "no address associated with hostname",
    ];
    if dns_hints.iter().any(|h| joined.contains(h)) {
        return NetworkErrorKind::Dns;
    }
    if joined.contains("tls") || joined.contains("ssl") || joined.contains("certificate") {
        return NetworkErrorKind::Tls;
    }
    if err.is_connect()
        || joined.contains("connection refused")
        || joined.contains("connection reset")
        || joined.contains("broken pipe")
    {
        return NetworkErrorKind::Connection;
    }
    NetworkErrorKind::Other
}

/// Recognizer-side failures, kept separate from `ElectiveError` because the
/// captcha chain retries and degrades on them without touching the loop's
/// error counters.
#[derive(Debug, thiserror::Error)]
pub enum RecognizerError {
    #[error("recognizer timed out after {0:?}")]
    Timeout(Duration),

    #[error("unable to reach recognizer: {0}")]
    Unreachable(String),

    #[error("recognizer rejected the request: {0}")]
    Rejected(String),

    #[error("recognizer returned an empty result")]
    EmptyResult,

    #[error("unexpected code length: {code:?}")]
    BadCodeLength { code: String },

    #[error("unknown captcha provider: {0}")]
    UnknownProvider(String),

    #[error("recognizer misconfigured: {0}")]
    Misconfigured(String),
}

/// Typed result of submitting an election request. Replaces the original
/// control-flow-by-exception with a value the loop can route on.
#[derive(Debug)]
pub enum ElectOutcome {
    /// Election accepted; carries the response body whose listing table is
    /// used to refresh the dynamic elected set inside the burst.
    Success { body: String },
    /// A business rule permanently disqualifies this course.
    Skip(IgnoreReason),
    /// Seats were gone by the time we submitted. Normal competition
    /// outcome; never pollutes the error counters.
    QuotaLimited,
    /// The site refused without a recognizable reason; retry next round.
    /// Carries the body for the opt-in debug dump.
    Failed { body: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ignore_reason_display() {
        assert_eq!(IgnoreReason::MutexRules.to_string(), "Mutex rules");
        assert_eq!(IgnoreReason::MultiPE.to_string(), "Multi PE course");
    }

    #[test]
    fn test_agg_key_stability() {
        let e = ElectiveError::ServerError { status: 502 };
        assert_eq!(e.agg_key(), "Http/502");
        let e = ElectiveError::Auth {
            kind: AuthErrorKind::SharedSession,
            message: String::new(),
        };
        assert_eq!(e.agg_key(), "Auth/shared_session");
    }

    #[test]
    fn test_network_kind_exposed() {
        let e = ElectiveError::Network {
            kind: NetworkErrorKind::Dns,
            message: "lookup failed".into(),
        };
        assert_eq!(e.network_kind(), Some(NetworkErrorKind::Dns));
        assert!(e.auth_kind().is_none());
    }
}
