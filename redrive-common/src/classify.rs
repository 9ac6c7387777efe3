//! Binary retryable/not-retryable classification of processing errors.
//!
//! A classifier is an ordered list of (error type, retryable) rules evaluated
//! in registration order; the first matching rule wins. When no rule matches
//! the classifier falls back to its default, and when cause traversal is
//! enabled the `source()` chain is walked before giving up.

use std::{
    error::Error,
    fmt::{Debug, Formatter},
};

type Matcher = Box<dyn Fn(&(dyn Error + 'static)) -> bool + Send + Sync>;

struct Rule {
    type_name: &'static str,
    matches: Matcher,
    retryable: bool,
}

impl Debug for Rule {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        fmt.debug_struct("Rule")
            .field("type_name", &self.type_name)
            .field("retryable", &self.retryable)
            .finish()
    }
}

/// Decides whether a processing failure should be retried.
#[derive(Debug)]
pub struct ErrorClassifier {
    rules: Vec<Rule>,
    traverse_causes: bool,
    default_retryable: bool,
}

impl ErrorClassifier {
    /// A classifier that retries every error.
    #[must_use]
    pub fn retry_all() -> Self {
        ClassifierBuilder::new().build()
    }

    #[must_use]
    pub fn builder() -> ClassifierBuilder {
        ClassifierBuilder::new()
    }

    /// Classify `error` as retryable (`true`) or not (`false`).
    #[must_use]
    pub fn classify(&self, error: &(dyn Error + 'static)) -> bool {
        if let Some(retryable) = self.match_rules(error) {
            return retryable;
        }

        if self.traverse_causes {
            let mut cause = error.source();
            while let Some(current) = cause {
                if let Some(retryable) = self.match_rules(current) {
                    return retryable;
                }
                cause = current.source();
            }
        }

        self.default_retryable
    }

    fn match_rules(&self, error: &(dyn Error + 'static)) -> Option<bool> {
        self.rules
            .iter()
            .find(|rule| (rule.matches)(error))
            .map(|rule| rule.retryable)
    }
}

/// Builder collecting classification rules in registration order.
#[derive(Debug, Default)]
pub struct ClassifierBuilder {
    rules: Vec<Rule>,
    traverse_causes: bool,
    saw_retry_rule: bool,
}

impl ClassifierBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Errors of type `E` are retryable.
    #[must_use]
    pub fn retry_on<E: Error + 'static>(mut self) -> Self {
        self.rules.push(Rule {
            type_name: std::any::type_name::<E>(),
            matches: Box::new(|error| error.is::<E>()),
            retryable: true,
        });
        self.saw_retry_rule = true;
        self
    }

    /// Errors of type `E` are not retryable.
    #[must_use]
    pub fn not_retry_on<E: Error + 'static>(mut self) -> Self {
        self.rules.push(Rule {
            type_name: std::any::type_name::<E>(),
            matches: Box::new(|error| error.is::<E>()),
            retryable: false,
        });
        self
    }

    /// Also inspect the `source()` chain when the top-level error matches no
    /// rule.
    #[must_use]
    pub fn traversing_causes(mut self) -> Self {
        self.traverse_causes = true;
        self
    }

    /// Finish the classifier.
    ///
    /// With no rules at all, or with only deny rules, unmatched errors are
    /// retryable; as soon as one `retry_on` rule exists, unmatched errors are
    /// not retried (an allow-list).
    #[must_use]
    pub fn build(self) -> ErrorClassifier {
        ErrorClassifier {
            default_retryable: !self.saw_retry_rule,
            rules: self.rules,
            traverse_causes: self.traverse_causes,
        }
    }
}
