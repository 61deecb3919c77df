//! Retry engine
//!
//! Runs a fallible operation under a per-class backoff policy. Two
//! execution paths with identical attempt semantics: a blocking one that
//! sleeps the calling thread, and a suspending one for tokio runtimes.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Mutex, RwLock};
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use super::classify::{Classifier, classify};
use super::context::RetryContext;
use super::policy::{ErrorClass, RetryPolicy};

/// Errors from retry execution
#[derive(Debug, Error)]
pub enum RetryError {
    /// All attempts spent; wraps the last classified failure
    #[error("retries exhausted after {attempts} attempts ({class}): {last}")]
    Exhausted {
        class: ErrorClass,
        attempts: u32,
        last: eyre::Report,
        context: RetryContext,
    },

    /// Classified as non-retryable; propagated without further attempts
    #[error("non-retryable {class} failure: {last}")]
    Fatal {
        class: ErrorClass,
        attempts: u32,
        last: eyre::Report,
        context: RetryContext,
    },
}

impl RetryError {
    /// Class of the final failure
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Exhausted { class, .. } | Self::Fatal { class, .. } => *class,
        }
    }

    /// Attempts made before giving up
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Exhausted { attempts, .. } | Self::Fatal { attempts, .. } => *attempts,
        }
    }

    /// Final snapshot of the call's retry context
    pub fn context(&self) -> &RetryContext {
        match self {
            Self::Exhausted { context, .. } | Self::Fatal { context, .. } => context,
        }
    }
}

/// Options for a single execute call
#[derive(Debug, Clone, Default)]
pub struct RetryOptions {
    /// Override the per-class policy table for this call
    pub policy: Option<RetryPolicy>,

    /// Key identifying this call's retry context; derived when omitted.
    /// Two concurrent calls under the same key interleave their attempt
    /// records - supply a unique key per in-flight call.
    pub context_key: Option<String>,
}

impl RetryOptions {
    /// Set the context key
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.context_key = Some(key.into());
        self
    }

    /// Set a policy override
    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = Some(policy);
        self
    }
}

/// Policy-driven retry executor
pub struct RetryEngine {
    policies: RwLock<HashMap<ErrorClass, RetryPolicy>>,
    classifiers: RwLock<Vec<Classifier>>,
    active: Mutex<HashMap<String, RetryContext>>,
}

impl Default for RetryEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl RetryEngine {
    /// Create an engine with the default per-class policy table
    pub fn new() -> Self {
        debug!("RetryEngine::new: called");
        let policies = ErrorClass::ALL
            .iter()
            .map(|class| (*class, class.default_policy()))
            .collect();
        Self {
            policies: RwLock::new(policies),
            classifiers: RwLock::new(Vec::new()),
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Replace the policy for one class
    pub fn set_policy(&self, class: ErrorClass, policy: RetryPolicy) {
        debug!(%class, "RetryEngine::set_policy: called");
        self.policies
            .write()
            .expect("policy table lock poisoned")
            .insert(class, policy);
    }

    /// Current policy for a class
    pub fn policy_for(&self, class: ErrorClass) -> RetryPolicy {
        self.policies
            .read()
            .expect("policy table lock poisoned")
            .get(&class)
            .cloned()
            .unwrap_or_else(|| class.default_policy())
    }

    /// Append a classifier to the chain (runs before the built-in
    /// message classifier; first non-Unknown answer wins)
    pub fn add_classifier(&self, classifier: impl Fn(&eyre::Report) -> ErrorClass + Send + Sync + 'static) {
        debug!("RetryEngine::add_classifier: called");
        self.classifiers
            .write()
            .expect("classifier chain lock poisoned")
            .push(Box::new(classifier));
    }

    /// Snapshot of an in-flight call's context, if one exists
    pub fn active_context(&self, key: &str) -> Option<RetryContext> {
        self.active
            .lock()
            .expect("active context lock poisoned")
            .get(key)
            .cloned()
    }

    /// Run a blocking operation with retries; the calling thread sleeps
    /// between attempts
    pub fn execute_blocking<T, F>(&self, opts: RetryOptions, mut op: F) -> Result<T, RetryError>
    where
        F: FnMut() -> eyre::Result<T>,
    {
        let key = self.begin_call(&opts);
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            self.begin_attempt(&key, attempt);
            match op() {
                Ok(value) => {
                    self.finish_success(&key, attempt);
                    return Ok(value);
                }
                Err(report) => {
                    let delay = self.on_failure(&key, attempt, &opts, report)?;
                    std::thread::sleep(delay);
                }
            }
        }
    }

    /// Run a suspending operation with retries; the calling task is
    /// suspended between attempts, never the thread
    pub async fn execute<T, F, Fut>(&self, opts: RetryOptions, mut op: F) -> Result<T, RetryError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = eyre::Result<T>>,
    {
        let key = self.begin_call(&opts);
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            self.begin_attempt(&key, attempt);
            match op().await {
                Ok(value) => {
                    self.finish_success(&key, attempt);
                    return Ok(value);
                }
                Err(report) => {
                    let delay = self.on_failure(&key, attempt, &opts, report)?;
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    fn begin_call(&self, opts: &RetryOptions) -> String {
        let key = opts
            .context_key
            .clone()
            .unwrap_or_else(|| format!("retry-{}", Uuid::now_v7()));
        debug!(%key, "RetryEngine::begin_call: called");
        self.active
            .lock()
            .expect("active context lock poisoned")
            .insert(key.clone(), RetryContext::new(&key));
        key
    }

    fn begin_attempt(&self, key: &str, attempt: u32) {
        let mut active = self.active.lock().expect("active context lock poisoned");
        if let Some(context) = active.get_mut(key) {
            context.begin_attempt(attempt);
        }
    }

    fn finish_success(&self, key: &str, attempt: u32) {
        debug!(%key, attempt, "RetryEngine::finish_success: call succeeded");
        let mut active = self.active.lock().expect("active context lock poisoned");
        if let Some(context) = active.get_mut(key) {
            context.mark_success();
        }
        // The context is ephemeral: discarded once the call terminates
        active.remove(key);
    }

    fn finish_failure(&self, key: &str, class: ErrorClass, message: &str) -> RetryContext {
        let mut active = self.active.lock().expect("active context lock poisoned");
        if let Some(context) = active.get_mut(key) {
            context.mark_failure(class, message, 0);
        }
        active
            .remove(key)
            .unwrap_or_else(|| RetryContext::new(key))
    }

    /// Decide what happens after a failed attempt: either the delay
    /// before the next attempt, or the terminal error
    fn on_failure(
        &self,
        key: &str,
        attempt: u32,
        opts: &RetryOptions,
        report: eyre::Report,
    ) -> Result<Duration, RetryError> {
        let (class, retryable) = {
            let chain = self.classifiers.read().expect("classifier chain lock poisoned");
            classify(&report, &chain)
        };
        let policy = opts.policy.clone().unwrap_or_else(|| self.policy_for(class));
        let message = format!("{report:#}");

        if !retryable {
            warn!(%key, attempt, %class, error = %message, "on_failure: non-retryable, giving up");
            let context = self.finish_failure(key, class, &message);
            return Err(RetryError::Fatal {
                class,
                attempts: attempt,
                last: report,
                context,
            });
        }

        if attempt >= policy.max_attempts {
            warn!(%key, attempt, %class, error = %message, "on_failure: attempts exhausted");
            let context = self.finish_failure(key, class, &message);
            return Err(RetryError::Exhausted {
                class,
                attempts: attempt,
                last: report,
                context,
            });
        }

        let delay = policy.delay_for(attempt);
        {
            let mut active = self.active.lock().expect("active context lock poisoned");
            if let Some(context) = active.get_mut(key) {
                context.mark_failure(class, &message, delay.as_millis() as u64);
            }
        }
        warn!(
            %key,
            attempt,
            %class,
            delay_ms = delay.as_millis() as u64,
            error = %message,
            "on_failure: retrying after delay"
        );
        Ok(delay)
    }
}
