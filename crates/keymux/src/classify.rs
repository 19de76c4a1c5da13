//! Response classification.
//!
//! The dispatcher never inspects responses itself; the caller supplies a
//! bundle of predicates and extractors over its own response type. Success
//! is inferred: a response that is neither rate-limited nor an error
//! resolves the request. An `is_success` predicate is accepted for
//! forward-compatibility but not consulted.
//!
//! User closures are expected to be total. One that panics is caught and
//! treated as returning `false` (extractors: `None`); classification can
//! never take down the dispatch worker.

use std::panic::{AssertUnwindSafe, catch_unwind};

type Predicate<R> = Box<dyn Fn(&R) -> bool + Send + Sync>;
type Extractor<R, T> = Box<dyn Fn(&R) -> Option<T> + Send + Sync>;

/// How the executor reacts to a response.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Outcome {
    /// Shelve the key and move to the next one.
    RateLimited {
        /// Seconds the response asked us to back off, if it said.
        retry_after_secs: Option<u64>,
    },
    /// Count a failure against the key and move on.
    Error,
    /// Resolve the request.
    Success {
        /// Server-reported remaining quota, if extractable.
        quota_remaining: Option<u64>,
    },
}

/// Caller-supplied response classification bundle.
pub struct Classifier<R> {
    is_rate_limited: Option<Predicate<R>>,
    is_error: Option<Predicate<R>>,
    #[allow(dead_code)]
    is_success: Option<Predicate<R>>,
    retry_after: Option<Extractor<R, u64>>,
    quota_remaining: Option<Extractor<R, u64>>,
}

impl<R> Default for Classifier<R> {
    /// A classifier that treats every response as a success.
    fn default() -> Self {
        Self {
            is_rate_limited: None,
            is_error: None,
            is_success: None,
            retry_after: None,
            quota_remaining: None,
        }
    }
}

impl<R> Classifier<R> {
    /// Start building a classifier.
    pub fn builder() -> ClassifierBuilder<R> {
        ClassifierBuilder {
            classifier: Self::default(),
        }
    }

    pub(crate) fn classify(&self, response: &R) -> Outcome {
        if check(self.is_rate_limited.as_deref(), response) {
            let retry_after_secs = extract(self.retry_after.as_deref(), response);
            return Outcome::RateLimited { retry_after_secs };
        }

        if check(self.is_error.as_deref(), response) {
            return Outcome::Error;
        }

        Outcome::Success {
            quota_remaining: extract(self.quota_remaining.as_deref(), response),
        }
    }
}

fn check<R>(predicate: Option<&(dyn Fn(&R) -> bool + Send + Sync)>, response: &R) -> bool {
    let Some(predicate) = predicate else {
        return false;
    };

    match catch_unwind(AssertUnwindSafe(|| predicate(response))) {
        Ok(verdict) => verdict,
        Err(_) => {
            log::warn!("classification predicate panicked; treating as false");
            false
        }
    }
}

fn extract<R, T>(extractor: Option<&(dyn Fn(&R) -> Option<T> + Send + Sync)>, response: &R) -> Option<T> {
    let extractor = extractor?;

    match catch_unwind(AssertUnwindSafe(|| extractor(response))) {
        Ok(value) => value,
        Err(_) => {
            log::warn!("response extractor panicked; treating as absent");
            None
        }
    }
}

/// Builder for [`Classifier`].
pub struct ClassifierBuilder<R> {
    classifier: Classifier<R>,
}

impl<R> ClassifierBuilder<R> {
    /// Predicate marking a response as rate-limited.
    pub fn is_rate_limited(mut self, predicate: impl Fn(&R) -> bool + Send + Sync + 'static) -> Self {
        self.classifier.is_rate_limited = Some(Box::new(predicate));
        self
    }

    /// Predicate marking a response as a retryable error.
    pub fn is_error(mut self, predicate: impl Fn(&R) -> bool + Send + Sync + 'static) -> Self {
        self.classifier.is_error = Some(Box::new(predicate));
        self
    }

    /// Accepted for forward-compatibility; the dispatcher infers success as
    /// "not rate-limited and not an error" and does not consult this.
    pub fn is_success(mut self, predicate: impl Fn(&R) -> bool + Send + Sync + 'static) -> Self {
        self.classifier.is_success = Some(Box::new(predicate));
        self
    }

    /// Extractor for a retry-after signal, in whole seconds.
    pub fn retry_after(mut self, extractor: impl Fn(&R) -> Option<u64> + Send + Sync + 'static) -> Self {
        self.classifier.retry_after = Some(Box::new(extractor));
        self
    }

    /// Extractor for the server's view of remaining quota.
    pub fn quota_remaining(mut self, extractor: impl Fn(&R) -> Option<u64> + Send + Sync + 'static) -> Self {
        self.classifier.quota_remaining = Some(Box::new(extractor));
        self
    }

    /// Finish building.
    pub fn build(self) -> Classifier<R> {
        self.classifier
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Response {
        status: u16,
        retry_after: Option<u64>,
    }

    fn classifier() -> Classifier<Response> {
        Classifier::builder()
            .is_rate_limited(|r: &Response| r.status == 429)
            .is_error(|r: &Response| r.status >= 500)
            .retry_after(|r: &Response| r.retry_after)
            .build()
    }

    #[test]
    fn rate_limit_takes_precedence_and_carries_retry_after() {
        let outcome = classifier().classify(&Response {
            status: 429,
            retry_after: Some(13),
        });

        assert_eq!(
            outcome,
            Outcome::RateLimited {
                retry_after_secs: Some(13)
            }
        );
    }

    #[test]
    fn errors_are_classified() {
        let outcome = classifier().classify(&Response {
            status: 503,
            retry_after: None,
        });

        assert_eq!(outcome, Outcome::Error);
    }

    #[test]
    fn everything_else_is_success() {
        let outcome = classifier().classify(&Response {
            status: 200,
            retry_after: None,
        });

        assert_eq!(
            outcome,
            Outcome::Success {
                quota_remaining: None
            }
        );
    }

    #[test]
    fn default_classifier_accepts_everything() {
        let classifier = Classifier::<u16>::default();

        assert_eq!(
            classifier.classify(&500),
            Outcome::Success {
                quota_remaining: None
            }
        );
    }

    #[test]
    #[allow(clippy::panic)]
    fn panicking_predicate_is_treated_as_false() {
        let classifier = Classifier::builder()
            .is_rate_limited(|_: &u16| panic!("broken predicate"))
            .is_error(|status: &u16| *status >= 500)
            .build();

        // The panic is swallowed and classification falls through to the
        // error predicate.
        assert_eq!(classifier.classify(&503), Outcome::Error);
    }

    #[test]
    #[allow(clippy::panic)]
    fn panicking_extractor_is_treated_as_absent() {
        let classifier = Classifier::builder()
            .is_rate_limited(|status: &u16| *status == 429)
            .retry_after(|_: &u16| panic!("broken extractor"))
            .build();

        assert_eq!(
            classifier.classify(&429),
            Outcome::RateLimited {
                retry_after_secs: None
            }
        );
    }
}
