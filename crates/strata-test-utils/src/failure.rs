//! Storage wrapper that fails selected writes.
//!
//! Used to simulate a crash partway through a stage: some outputs land, the
//! rest fail, and the stage must leave its progress marker untouched.

use std::sync::{Arc, Mutex};

use bytes::Bytes;
use strata_core::error::{Error, Result};
use strata_core::storage::{ObjectMeta, StorageBackend, WritePrecondition, WriteResult};

#[derive(Debug, Clone)]
struct FailureRule {
    prefix: String,
    /// Matching writes allowed through before failures start.
    allow: usize,
    /// Remaining failures; `None` fails until healed.
    remaining: Option<usize>,
}

/// Wraps a backend and fails puts and renames under configured prefixes.
///
/// Reads, lists and deletes always pass through.
#[derive(Debug, Clone)]
pub struct FailingBackend<S> {
    inner: Arc<S>,
    rules: Arc<Mutex<Vec<FailureRule>>>,
    failures: Arc<Mutex<Vec<String>>>,
}

impl<S: StorageBackend> FailingBackend<S> {
    /// Wraps `inner` with no failures configured.
    #[must_use]
    pub fn new(inner: Arc<S>) -> Self {
        Self {
            inner,
            rules: Arc::default(),
            failures: Arc::default(),
        }
    }

    /// Fails the next write under `prefix`, once.
    pub fn fail_on_write(&self, prefix: impl Into<String>) {
        self.rules.lock().expect("lock").push(FailureRule {
            prefix: prefix.into(),
            allow: 0,
            remaining: Some(1),
        });
    }

    /// Lets `n` writes under `prefix` succeed, then fails every later one
    /// until [`heal`](Self::heal) is called.
    pub fn fail_after_writes(&self, n: usize, prefix: impl Into<String>) {
        self.rules.lock().expect("lock").push(FailureRule {
            prefix: prefix.into(),
            allow: n,
            remaining: None,
        });
    }

    /// Removes every configured failure.
    pub fn heal(&self) {
        self.rules.lock().expect("lock").clear();
    }

    /// Paths whose writes were failed, in order.
    #[must_use]
    pub fn failed_paths(&self) -> Vec<String> {
        self.failures.lock().expect("lock").clone()
    }

    /// The wrapped backend.
    #[must_use]
    pub fn inner(&self) -> &Arc<S> {
        &self.inner
    }

    fn check_write(&self, path: &str) -> Result<()> {
        let mut rules = self.rules.lock().expect("lock");
        let mut fail = false;
        for rule in rules.iter_mut().filter(|r| path.starts_with(&r.prefix)) {
            if rule.allow > 0 {
                rule.allow -= 1;
                continue;
            }
            match &mut rule.remaining {
                Some(0) => {}
                Some(n) => {
                    *n -= 1;
                    fail = true;
                }
                None => fail = true,
            }
        }
        rules.retain(|r| r.remaining != Some(0));
        drop(rules);

        if fail {
            self.failures.lock().expect("lock").push(path.to_string());
            return Err(Error::Storage {
                message: format!("injected write failure: {path}"),
                source: None,
            });
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl<S: StorageBackend> StorageBackend for FailingBackend<S> {
    async fn get(&self, path: &str) -> Result<Bytes> {
        self.inner.get(path).await
    }

    async fn put(
        &self,
        path: &str,
        data: Bytes,
        precondition: WritePrecondition,
    ) -> Result<WriteResult> {
        self.check_write(path)?;
        self.inner.put(path, data, precondition).await
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.inner.delete(path).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
        self.inner.list(prefix).await
    }

    async fn head(&self, path: &str) -> Result<Option<ObjectMeta>> {
        self.inner.head(path).await
    }

    async fn rename(
        &self,
        from: &str,
        to: &str,
        precondition: WritePrecondition,
    ) -> Result<WriteResult> {
        self.check_write(to)?;
        self.inner.rename(from, to, precondition).await
    }
}
