//! Error classification
//!
//! A caller-supplied error carrying an explicit class is trusted as-is.
//! Otherwise a chain of classifier functions inspects the error and the
//! first non-Unknown answer wins; the built-in message-substring
//! classifier is the tail of the chain.

use thiserror::Error;
use tracing::debug;

use super::policy::ErrorClass;

/// An error tagged with an explicit taxonomy class
#[derive(Debug, Error)]
#[error("{message}")]
pub struct Classified {
    /// Class driving policy selection
    pub class: ErrorClass,
    /// Whether the retry engine may attempt again
    pub retryable: bool,
    /// Human-readable description
    pub message: String,
}

impl Classified {
    /// Tag a retryable error with an explicit class
    pub fn new(class: ErrorClass, message: impl Into<String>) -> Self {
        Self {
            class,
            retryable: true,
            message: message.into(),
        }
    }

    /// Tag an error that must not be retried
    pub fn fatal(class: ErrorClass, message: impl Into<String>) -> Self {
        Self {
            class,
            retryable: false,
            message: message.into(),
        }
    }
}

/// Classifier function: inspect a report, return Unknown for "no opinion"
pub type Classifier = Box<dyn Fn(&eyre::Report) -> ErrorClass + Send + Sync>;

/// Classify an error message by substring
///
/// Order matters: throttling phrases contain words that would otherwise
/// match the network bucket.
pub fn classify_message(message: &str) -> ErrorClass {
    let lower = message.to_lowercase();
    let contains_any = |needles: &[&str]| needles.iter().any(|n| lower.contains(n));

    if contains_any(&["rate limit", "too many requests", "429", "throttl"]) {
        return ErrorClass::RateLimit;
    }
    if contains_any(&[
        "unauthorized",
        "forbidden",
        "authentication",
        "credential",
        "login",
        "401",
        "403",
    ]) {
        return ErrorClass::Auth;
    }
    if contains_any(&[
        "connection",
        "network",
        "dns",
        "unreachable",
        "reset by peer",
        "broken pipe",
        "timed out",
        "timeout",
    ]) {
        return ErrorClass::Network;
    }
    if contains_any(&["no space left", "out of memory", "too many open files", "disk"]) {
        return ErrorClass::System;
    }
    if contains_any(&["temporar", "unavailable", "try again", "503"]) {
        return ErrorClass::Temporary;
    }
    ErrorClass::Unknown
}

/// Classify a report: explicit tag first, then the chain, then substrings
pub(crate) fn classify(report: &eyre::Report, chain: &[Classifier]) -> (ErrorClass, bool) {
    if let Some(tagged) = report.downcast_ref::<Classified>() {
        debug!(class = %tagged.class, retryable = tagged.retryable, "classify: explicit tag trusted");
        return (tagged.class, tagged.retryable);
    }

    for classifier in chain {
        let class = classifier(report);
        if class != ErrorClass::Unknown {
            debug!(%class, "classify: classifier chain matched");
            return (class, true);
        }
    }

    let class = classify_message(&format!("{report:#}"));
    debug!(%class, "classify: fell through to message classifier");
    (class, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explicit_tag_trusted_as_is() {
        // The message screams "network" but the tag wins
        let report = eyre::Report::new(Classified::new(ErrorClass::Auth, "connection refused"));
        let (class, retryable) = classify(&report, &[]);
        assert_eq!(class, ErrorClass::Auth);
        assert!(retryable);
    }

    #[test]
    fn test_fatal_tag_is_not_retryable() {
        let report = eyre::Report::new(Classified::fatal(ErrorClass::Auth, "account banned"));
        let (class, retryable) = classify(&report, &[]);
        assert_eq!(class, ErrorClass::Auth);
        assert!(!retryable);
    }

    #[test]
    fn test_chain_first_non_unknown_wins() {
        let chain: Vec<Classifier> = vec![
            Box::new(|_| ErrorClass::Unknown),
            Box::new(|_| ErrorClass::System),
            Box::new(|_| ErrorClass::Network),
        ];
        let report = eyre::eyre!("some opaque failure");
        let (class, _) = classify(&report, &chain);
        assert_eq!(class, ErrorClass::System);
    }

    #[test]
    fn test_substring_fallback() {
        let report = eyre::eyre!("connection reset by peer");
        let (class, _) = classify(&report, &[]);
        assert_eq!(class, ErrorClass::Network);
    }

    #[test]
    fn test_classify_message_buckets() {
        assert_eq!(classify_message("HTTP 429 Too Many Requests"), ErrorClass::RateLimit);
        assert_eq!(classify_message("request was throttled"), ErrorClass::RateLimit);
        assert_eq!(classify_message("401 Unauthorized"), ErrorClass::Auth);
        assert_eq!(classify_message("invalid credentials on login"), ErrorClass::Auth);
        assert_eq!(classify_message("DNS lookup failed"), ErrorClass::Network);
        assert_eq!(classify_message("read timed out"), ErrorClass::Network);
        assert_eq!(classify_message("no space left on device"), ErrorClass::System);
        assert_eq!(classify_message("service temporarily unavailable"), ErrorClass::Temporary);
        assert_eq!(classify_message("widget exploded"), ErrorClass::Unknown);
    }

    #[test]
    fn test_rate_limit_beats_network_wording() {
        // "connection" appears, but throttling is the real signal
        assert_eq!(
            classify_message("rate limit exceeded, connection closed"),
            ErrorClass::RateLimit
        );
    }
}
