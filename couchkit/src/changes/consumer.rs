use super::{Change, ChangesFeed, FeedMode};
use crate::backend::{Backend, Params};
use crate::error::Result;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::thread::JoinHandle;

/// Outcome of a one-shot [`Consumer::fetch`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChangesBatch {
    pub last_seq: Value,
    pub results: Vec<Change>,
}

/// Consumes the change feed of one database.
///
/// Callbacks run on the calling thread, one change at a time; the `_async`
/// variants move the same loop onto a background thread.
#[derive(Clone)]
pub struct Consumer {
    backend: Arc<dyn Backend>,
    db: String,
}

impl Consumer {
    pub fn new(backend: Arc<dyn Backend>, db: impl Into<String>) -> Self {
        Consumer {
            backend,
            db: db.into(),
        }
    }

    pub fn db(&self) -> &str {
        &self.db
    }

    /// Open the feed with the params as given.
    pub fn open(&self, params: &Params) -> Result<Box<dyn ChangesFeed>> {
        self.backend.changes(&self.db, params)
    }

    /// Fetch the feed and return its first change. On an empty feed the
    /// sequence stays where it was: the feed's `last_seq`, else `since`,
    /// else 0.
    pub fn fetch(&self, params: &Params) -> Result<ChangesBatch> {
        let mut feed = self.open(params)?;
        match feed.next() {
            Some(change) => {
                let change = change?;
                Ok(ChangesBatch {
                    last_seq: change.seq.clone(),
                    results: vec![change],
                })
            }
            None => Ok(ChangesBatch {
                last_seq: unchanged_seq(feed.as_ref(), params),
                results: Vec::new(),
            }),
        }
    }

    /// Like [`fetch`](Self::fetch) but hands the first change to `cb`.
    /// Returns the resulting sequence.
    pub fn fetch_with<F>(&self, cb: F, params: &Params) -> Result<Value>
    where
        F: FnOnce(Change),
    {
        let mut feed = self.open(params)?;
        match feed.next() {
            Some(change) => {
                let change = change?;
                let seq = change.seq.clone();
                cb(change);
                Ok(seq)
            }
            None => Ok(unchanged_seq(feed.as_ref(), params)),
        }
    }

    /// Wait on a long-poll feed for exactly one change.
    pub fn wait_once(&self, params: &Params) -> Result<Option<Change>> {
        let mut feed = self.open(&FeedMode::LongPoll.apply(params))?;
        feed.next().transpose()
    }

    /// Wait for one change and hand it to `cb`. Returns whether a change
    /// arrived before the feed closed.
    pub fn wait_once_with<F>(&self, cb: F, params: &Params) -> Result<bool>
    where
        F: FnOnce(Change),
    {
        match self.wait_once(params)? {
            Some(change) => {
                cb(change);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Follow a continuous feed, calling `cb` for every change until the
    /// server closes it or an error occurs.
    pub fn wait<F>(&self, mut cb: F, params: &Params) -> Result<()>
    where
        F: FnMut(Change),
    {
        let feed = self.open(&FeedMode::Continuous.apply(params))?;
        for change in feed {
            cb(change?);
        }
        log::debug!("continuous feed for '{}' closed", self.db);
        Ok(())
    }

    /// [`wait`](Self::wait) on a background thread.
    pub fn wait_async<F>(&self, cb: F, params: Params) -> JoinHandle<Result<()>>
    where
        F: FnMut(Change) + Send + 'static,
    {
        let consumer = self.clone();
        std::thread::spawn(move || {
            let result = consumer.wait(cb, &params);
            if let Err(e) = &result {
                log::warn!("change consumer for '{}' stopped: {e}", consumer.db);
            }
            result
        })
    }

    /// [`wait_once_with`](Self::wait_once_with) on a background thread.
    pub fn wait_once_async<F>(&self, cb: F, params: Params) -> JoinHandle<Result<bool>>
    where
        F: FnOnce(Change) + Send + 'static,
    {
        let consumer = self.clone();
        std::thread::spawn(move || consumer.wait_once_with(cb, &params))
    }
}

fn unchanged_seq(feed: &dyn ChangesFeed, params: &Params) -> Value {
    feed.last_seq()
        .or_else(|| params.get("since").filter(|v| !v.is_null()).cloned())
        .unwrap_or_else(|| Value::from(0))
}
