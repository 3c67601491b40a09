//! Dynamic call addressing.
//!
//! A chained access such as `tx.balances.transfer` is collected segment by
//! segment by a [`ProxyChain`]. When the configured depth is reached the
//! executor is invoked once with the collected names. Every top-level access
//! starts a fresh chain, so concurrent chains never share segments.

use std::collections::HashMap;
use std::fmt;

use crate::error::ChainError;

/// Terminal step of a chain: receives the accumulated segments.
pub type Executor<T> = Box<dyn FnOnce(Vec<String>) -> T + Send>;

/// Segment accumulator.
pub struct ProxyChain<T> {
    exec: Executor<T>,
    chain: Vec<String>,
    // The factory call counts as the first level.
    level: usize,
    max_level: usize,
}

/// Result of one access.
pub enum Access<T> {
    Next(ProxyChain<T>),
    Resolved(T),
}

/// Start a chain that resolves after `max_level` levels, the first being the
/// call that created it.
pub fn new_proxy_chain<T>(exec: Executor<T>, max_level: usize) -> ProxyChain<T> {
    ProxyChain {
        exec,
        chain: Vec::new(),
        level: 1,
        max_level: max_level.max(2),
    }
}

impl<T> ProxyChain<T> {
    /// Append `segment`; resolve if this access completes the chain.
    pub fn get(mut self, segment: impl Into<String>) -> Access<T> {
        self.chain.push(segment.into());
        self.level += 1;

        if self.level >= self.max_level {
            Access::Resolved((self.exec)(self.chain))
        } else {
            Access::Next(self)
        }
    }

    pub fn segments(&self) -> &[String] {
        &self.chain
    }

    /// Walk `path` from here. See [`Access::resolve`].
    pub fn resolve<S: AsRef<str>>(self, path: &[S]) -> Result<T, ChainError> {
        Access::Next(self).resolve(path)
    }

    /// Number of accesses still needed.
    pub fn remaining(&self) -> usize {
        self.max_level.saturating_sub(self.level)
    }
}

impl<T> fmt::Debug for ProxyChain<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyChain")
            .field("chain", &self.chain)
            .field("level", &self.level)
            .field("max_level", &self.max_level)
            .finish()
    }
}

impl<T> Access<T> {
    /// Continue with `segment`, or fail if already resolved.
    pub fn get(self, segment: impl Into<String>) -> Result<Access<T>, ChainError> {
        match self {
            Access::Next(chain) => Ok(chain.get(segment)),
            Access::Resolved(_) => Err(ChainError::IncompletePath {
                expected: 0,
                got: 1,
            }),
        }
    }

    /// Walk a whole path. The path must complete the chain exactly.
    pub fn resolve<S: AsRef<str>>(self, path: &[S]) -> Result<T, ChainError> {
        let mut access = self;
        let mut taken = 0;

        for segment in path {
            match access {
                Access::Next(chain) => {
                    access = chain.get(segment.as_ref());
                    taken += 1;
                }
                Access::Resolved(_) => {
                    return Err(ChainError::IncompletePath {
                        expected: taken,
                        got: path.len(),
                    });
                }
            }
        }

        match access {
            Access::Resolved(value) => Ok(value),
            Access::Next(chain) => Err(ChainError::IncompletePath {
                expected: taken + chain.remaining(),
                got: path.len(),
            }),
        }
    }

    pub fn into_resolved(self) -> Option<T> {
        match self {
            Access::Resolved(value) => Some(value),
            Access::Next(_) => None,
        }
    }
}

/// Split a dotted path such as `balances.transfer`.
pub fn path_segments(path: &str) -> Vec<&str> {
    path.split('.').filter(|s| !s.is_empty()).collect()
}

/// Bound invokers keyed by joined path.
#[derive(Debug, Clone)]
pub struct CallRegistry<I> {
    separator: &'static str,
    entries: HashMap<String, I>,
}

impl<I> Default for CallRegistry<I> {
    fn default() -> Self {
        Self::new("_")
    }
}

impl<I> CallRegistry<I> {
    pub fn new(separator: &'static str) -> Self {
        Self {
            separator,
            entries: HashMap::new(),
        }
    }

    pub fn key<S: AsRef<str>>(&self, segments: &[S]) -> String {
        segments
            .iter()
            .map(AsRef::as_ref)
            .collect::<Vec<_>>()
            .join(self.separator)
    }

    pub fn insert(&mut self, key: impl Into<String>, invoker: I) {
        self.entries.insert(key.into(), invoker);
    }

    pub fn get<S: AsRef<str>>(&self, segments: &[S]) -> Option<&I> {
        self.entries.get(&self.key(segments))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }
}
