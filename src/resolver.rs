//! Ordered backend resolution.
//!
//! Candidates are scanned in declaration order. The first one whose required
//! environment variables are set, that constructs without error and that
//! answers the probe prompt with non-blank text wins. Every other candidate
//! examined along the way is recorded as an [`Attempt`] so an operator can see
//! why it was passed over.

use crate::env::{EnvSource, ProcessEnv};
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use tracing::{debug, info, warn};

pub const DEFAULT_PROBE_PROMPT: &str = "Say hello in one word.";

/// A callable model backend.
#[async_trait]
pub trait ModelHandle: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<String>;
}

type Constructor = Box<dyn Fn(&dyn EnvSource) -> Result<Box<dyn ModelHandle>> + Send + Sync>;

/// One configured backend option.
pub struct BackendCandidate {
    pub identifier: String,
    pub endpoint: Option<String>,
    pub api_key_env: Option<String>,
    pub requires_env: Vec<String>,
    construct: Constructor,
}

impl BackendCandidate {
    pub fn new<F>(identifier: impl Into<String>, construct: F) -> Self
    where
        F: Fn(&dyn EnvSource) -> Result<Box<dyn ModelHandle>> + Send + Sync + 'static,
    {
        Self {
            identifier: identifier.into(),
            endpoint: None,
            api_key_env: None,
            requires_env: Vec::new(),
            construct: Box::new(construct),
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn with_api_key_env(mut self, name: impl Into<String>) -> Self {
        self.api_key_env = Some(name.into());
        self
    }

    pub fn requires<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.requires_env.extend(names.into_iter().map(Into::into));
        self
    }

    /// Environment variables this candidate needs that are currently unset.
    pub fn missing_env(&self, env: &dyn EnvSource) -> Vec<String> {
        env.missing(&self.requires_env)
            .into_iter()
            .map(String::from)
            .collect()
    }

    pub fn construct(&self, env: &dyn EnvSource) -> Result<Box<dyn ModelHandle>> {
        (self.construct)(env)
    }
}

impl fmt::Debug for BackendCandidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendCandidate")
            .field("identifier", &self.identifier)
            .field("endpoint", &self.endpoint)
            .field("api_key_env", &self.api_key_env)
            .field("requires_env", &self.requires_env)
            .finish_non_exhaustive()
    }
}

/// What happened to one candidate during a scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    Skipped { missing: Vec<String> },
    ConstructFailed { error: String },
    ProbeFailed { error: String },
    Succeeded,
}

impl Outcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::ConstructFailed { .. } | Self::ProbeFailed { .. })
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Skipped { missing } => write!(f, "skipped: missing env {}", missing.join(", ")),
            Self::ConstructFailed { error } => write!(f, "construction failed: {error}"),
            Self::ProbeFailed { error } => write!(f, "probe failed: {error}"),
            Self::Succeeded => f.write_str("ok"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Attempt {
    pub identifier: String,
    #[serde(flatten)]
    pub outcome: Outcome,
}

/// Every candidate examined, in order, when none of them worked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolutionFailure {
    pub attempts: Vec<Attempt>,
}

impl ResolutionFailure {
    pub fn skipped(&self) -> impl Iterator<Item = &Attempt> {
        self.attempts
            .iter()
            .filter(|a| matches!(a.outcome, Outcome::Skipped { .. }))
    }

    pub fn failed(&self) -> impl Iterator<Item = &Attempt> {
        self.attempts.iter().filter(|a| a.outcome.is_failure())
    }
}

impl fmt::Display for ResolutionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "no working model backend ({} tried)", self.attempts.len())?;
        for attempt in &self.attempts {
            write!(f, "\n  - {}: {}", attempt.identifier, attempt.outcome)?;
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("no candidates provided")]
    NoCandidates,

    #[error("{0}")]
    Exhausted(ResolutionFailure),
}

/// A backend that passed its probe.
pub struct Resolved {
    pub identifier: String,
    pub handle: Box<dyn ModelHandle>,
    /// Candidates examined before the winner, followed by the winner itself.
    pub attempts: Vec<Attempt>,
}

impl fmt::Debug for Resolved {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resolved")
            .field("identifier", &self.identifier)
            .field("attempts", &self.attempts)
            .finish_non_exhaustive()
    }
}

pub type ResolutionResult = std::result::Result<Resolved, ResolveError>;

/// Scans candidates against an environment with a fixed probe prompt.
#[derive(Debug, Clone)]
pub struct Resolver {
    probe_prompt: String,
}

impl Default for Resolver {
    fn default() -> Self {
        Self::new(DEFAULT_PROBE_PROMPT)
    }
}

impl Resolver {
    pub fn new(probe_prompt: impl Into<String>) -> Self {
        Self {
            probe_prompt: probe_prompt.into(),
        }
    }

    pub async fn resolve(
        &self,
        candidates: &[BackendCandidate],
        env: &dyn EnvSource,
    ) -> ResolutionResult {
        if candidates.is_empty() {
            return Err(ResolveError::NoCandidates);
        }

        let mut attempts = Vec::with_capacity(candidates.len());

        for candidate in candidates {
            let id = candidate.identifier.as_str();

            let missing = candidate.missing_env(env);
            if !missing.is_empty() {
                debug!(candidate = id, ?missing, "skipping candidate: missing env");
                attempts.push(Attempt {
                    identifier: id.to_string(),
                    outcome: Outcome::Skipped { missing },
                });
                continue;
            }

            info!(candidate = id, "trying model backend");
            let handle = match candidate.construct(env) {
                Ok(handle) => handle,
                Err(e) => {
                    warn!(candidate = id, error = %e, "backend construction failed");
                    attempts.push(Attempt {
                        identifier: id.to_string(),
                        outcome: Outcome::ConstructFailed {
                            error: e.to_string(),
                        },
                    });
                    continue;
                }
            };

            match self.probe(handle.as_ref(), id).await {
                Ok(reply) => {
                    info!(candidate = id, reply = %reply.trim(), "backend answered probe");
                    attempts.push(Attempt {
                        identifier: id.to_string(),
                        outcome: Outcome::Succeeded,
                    });
                    return Ok(Resolved {
                        identifier: id.to_string(),
                        handle,
                        attempts,
                    });
                }
                Err(e) => {
                    warn!(candidate = id, error = %e, "backend probe failed");
                    attempts.push(Attempt {
                        identifier: id.to_string(),
                        outcome: Outcome::ProbeFailed {
                            error: e.to_string(),
                        },
                    });
                }
            }
        }

        Err(ResolveError::Exhausted(ResolutionFailure { attempts }))
    }

    async fn probe(&self, handle: &dyn ModelHandle, id: &str) -> Result<String> {
        let reply = handle.complete(&self.probe_prompt).await?;
        if reply.trim().is_empty() {
            return Err(Error::EmptyResponse(id.to_string()));
        }
        Ok(reply)
    }
}

/// Resolve against the process environment with the default probe prompt.
pub async fn resolve(candidates: &[BackendCandidate]) -> ResolutionResult {
    Resolver::default().resolve(candidates, &ProcessEnv).await
}
