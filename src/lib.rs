pub mod config;
pub mod env;
pub mod error;
pub mod http;
pub mod llm;
pub mod resolver;

pub use env::{EnvSource, ProcessEnv};
pub use resolver::{
    Attempt, BackendCandidate, ModelHandle, Outcome, ResolutionFailure, ResolutionResult,
    ResolveError, Resolved, Resolver, resolve,
};
