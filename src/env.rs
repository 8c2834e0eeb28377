use std::collections::HashMap;

/// Read-only view of environment variables.
///
/// Values are trimmed; unset, empty and whitespace-only values all read as `None`.
pub trait EnvSource: Send + Sync {
    fn raw(&self, name: &str) -> Option<String>;

    fn get(&self, name: &str) -> Option<String> {
        self.raw(name)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }

    fn is_set(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Names from `names` that are not set, in the order given.
    fn missing<'a>(&self, names: &'a [String]) -> Vec<&'a str> {
        names
            .iter()
            .filter(|name| !self.is_set(name))
            .map(String::as_str)
            .collect()
    }
}

/// The real process environment.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessEnv;

impl EnvSource for ProcessEnv {
    fn raw(&self, name: &str) -> Option<String> {
        std::env::var(name).ok()
    }
}

impl EnvSource for HashMap<String, String> {
    fn raw(&self, name: &str) -> Option<String> {
        HashMap::get(self, name).cloned()
    }
}
