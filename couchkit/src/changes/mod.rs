//! Database change feeds: decoded change events, the feed readers for each
//! feed mode, a checkpointing cursor and the [`Consumer`].

mod consumer;

pub use consumer::{ChangesBatch, Consumer};

use crate::backend::{Backend, Params};
use crate::error::{CouchError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::io::BufRead;
use std::sync::Arc;

/// A single change event from `_changes`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Change {
    pub seq: Value,
    pub id: String,
    #[serde(default)]
    pub changes: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc: Option<Value>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub deleted: bool,
}

/// An open change feed.
pub trait ChangesFeed: Iterator<Item = Result<Change>> + Send {
    /// The last sequence reported by the server, once known.
    fn last_seq(&self) -> Option<Value>;
}

/// How the server delivers changes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FeedMode {
    #[default]
    Normal,
    LongPoll,
    Continuous,
}

impl FeedMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeedMode::Normal => "normal",
            FeedMode::LongPoll => "longpoll",
            FeedMode::Continuous => "continuous",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "normal" => Ok(FeedMode::Normal),
            "longpoll" => Ok(FeedMode::LongPoll),
            "continuous" => Ok(FeedMode::Continuous),
            other => Err(CouchError::Configuration(format!(
                "unknown feed mode '{other}' (expected normal, longpoll or continuous)"
            ))),
        }
    }

    /// Read the `feed` param. Absent means normal.
    pub fn from_params(params: &Params) -> Result<Self> {
        match params.get("feed") {
            None | Some(Value::Null) => Ok(FeedMode::Normal),
            Some(Value::String(s)) => Self::parse(s),
            Some(other) => Err(CouchError::Configuration(format!(
                "feed must be a string, got {other}"
            ))),
        }
    }

    /// A copy of `params` with `feed` set to this mode.
    pub fn apply(&self, params: &Params) -> Params {
        let mut params = params.clone();
        params.insert("feed".into(), Value::from(self.as_str()));
        params
    }
}

/// A normal or long-poll response, decoded up front.
#[derive(Debug, Default)]
pub struct BufferedFeed {
    results: VecDeque<Change>,
    last_seq: Option<Value>,
}

impl BufferedFeed {
    pub fn from_response(response: Value) -> Result<Self> {
        let Value::Object(mut body) = response else {
            return Err(CouchError::InvalidResponse(
                "changes response must be a JSON object".into(),
            ));
        };
        let results = match body.remove("results") {
            Some(results @ Value::Array(_)) => serde_json::from_value(results)?,
            _ => {
                return Err(CouchError::InvalidResponse(
                    "changes response has no 'results' list".into(),
                ))
            }
        };
        Ok(BufferedFeed {
            results,
            last_seq: body.remove("last_seq").filter(|v| !v.is_null()),
        })
    }
}

impl Iterator for BufferedFeed {
    type Item = Result<Change>;

    fn next(&mut self) -> Option<Self::Item> {
        self.results.pop_front().map(Ok)
    }
}

impl ChangesFeed for BufferedFeed {
    fn last_seq(&self) -> Option<Value> {
        self.last_seq.clone()
    }
}

/// A continuous feed: one JSON object per line, blank heartbeat lines, and
/// a closing `{"last_seq": ...}` line.
pub struct LineFeed<R> {
    lines: std::io::Lines<R>,
    last_seq: Option<Value>,
    done: bool,
}

impl<R: BufRead> LineFeed<R> {
    pub fn new(reader: R) -> Self {
        LineFeed {
            lines: reader.lines(),
            last_seq: None,
            done: false,
        }
    }
}

impl<R: BufRead> Iterator for LineFeed<R> {
    type Item = Result<Change>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            let line = match self.lines.next()? {
                Ok(line) => line,
                Err(e) => {
                    self.done = true;
                    return Some(Err(e.into()));
                }
            };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let value: Value = match serde_json::from_str(line) {
                Ok(value) => value,
                Err(e) => return Some(Err(e.into())),
            };
            if let Some(seq) = value.get("last_seq") {
                self.last_seq = Some(seq.clone());
                self.done = true;
                return None;
            }
            return Some(serde_json::from_value::<Change>(value).map_err(Into::into));
        }
    }
}

impl<R: BufRead + Send> ChangesFeed for LineFeed<R> {
    fn last_seq(&self) -> Option<Value> {
        self.last_seq.clone()
    }
}

/// Ordering key of a sequence: the number itself, or the leading integer of
/// an opaque string sequence like `"12-g1AAAA"`.
pub fn seq_rank(seq: &Value) -> Option<u64> {
    match seq {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => {
            let digits: String = s.chars().take_while(char::is_ascii_digit).collect();
            digits.parse().ok()
        }
        _ => None,
    }
}

/// A re-iterable view of a database's change feed.
#[derive(Clone)]
pub struct ChangesStream {
    backend: Arc<dyn Backend>,
    db: String,
    params: Params,
}

impl ChangesStream {
    pub fn new(backend: Arc<dyn Backend>, db: impl Into<String>, params: Params) -> Self {
        ChangesStream {
            backend,
            db: db.into(),
            params,
        }
    }

    /// Same stream starting at `since`.
    pub fn since(mut self, since: impl Into<Value>) -> Self {
        self.params.insert("since".into(), since.into());
        self
    }

    /// Same stream with extra params merged in.
    pub fn with_params(mut self, params: Params) -> Self {
        self.params.extend(params);
        self
    }

    /// Open the feed. Each call opens a fresh feed.
    pub fn open(&self) -> Result<Box<dyn ChangesFeed>> {
        self.backend.changes(&self.db, &self.params)
    }

    /// Fold every change into an accumulator.
    pub fn fold<A, F>(&self, init: A, mut fun: F) -> Result<A>
    where
        F: FnMut(A, Change) -> A,
    {
        let mut acc = init;
        for change in self.open()? {
            acc = fun(acc, change?);
        }
        Ok(acc)
    }

    /// Pass every change to `fun`.
    pub fn foreach<F>(&self, mut fun: F) -> Result<()>
    where
        F: FnMut(Change),
    {
        for change in self.open()? {
            fun(change?);
        }
        Ok(())
    }
}

/// Tracks the sequence checkpoint across repeated polls of a change feed.
#[derive(Debug, Clone)]
pub struct ChangeFeedCursor {
    since: Value,
    mode: FeedMode,
    params: Params,
}

impl ChangeFeedCursor {
    pub fn new(mode: FeedMode) -> Self {
        ChangeFeedCursor {
            since: Value::from(0),
            mode,
            params: Params::new(),
        }
    }

    pub fn starting_at(mut self, since: impl Into<Value>) -> Self {
        self.since = since.into();
        self
    }

    pub fn with_params(mut self, params: Params) -> Self {
        self.params = params;
        self
    }

    pub fn since(&self) -> &Value {
        &self.since
    }

    pub fn mode(&self) -> FeedMode {
        self.mode
    }

    /// Move the checkpoint to `seq` unless it orders before the current one.
    /// Returns whether the checkpoint moved.
    pub fn advance(&mut self, seq: &Value) -> bool {
        if let (Some(new), Some(current)) = (seq_rank(seq), seq_rank(&self.since)) {
            if new < current {
                log::debug!("ignoring change sequence {seq} behind checkpoint {}", self.since);
                return false;
            }
        }
        self.since = seq.clone();
        true
    }

    /// Params for the next request: extra params, the mode and the checkpoint.
    pub fn request_params(&self) -> Params {
        let mut params = self.mode.apply(&self.params);
        params.insert("since".into(), self.since.clone());
        params
    }

    /// Poll once in the cursor's mode, handing each change to `cb` and
    /// advancing the checkpoint. Long-poll delivers at most one change.
    /// Returns the number of changes delivered.
    pub fn poll<F>(&mut self, consumer: &Consumer, mut cb: F) -> Result<usize>
    where
        F: FnMut(Change),
    {
        let mut feed = consumer.open(&self.request_params())?;
        let mut delivered = 0;
        for change in feed.by_ref() {
            let change = change?;
            self.advance(&change.seq);
            cb(change);
            delivered += 1;
            if self.mode == FeedMode::LongPoll {
                return Ok(delivered);
            }
        }
        if let Some(last_seq) = feed.last_seq() {
            self.advance(&last_seq);
        }
        Ok(delivered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::MockBackend;
    use serde_json::json;
    use std::io::Cursor;

    fn changes_response() -> Value {
        json!({
            "results": [
                {"seq": 1, "id": "a", "changes": [{"rev": "1-x"}]},
                {"seq": 2, "id": "b", "changes": [{"rev": "1-y"}], "deleted": true},
                {"seq": 3, "id": "c", "changes": [{"rev": "2-z"}]}
            ],
            "last_seq": 3
        })
    }

    #[test]
    fn test_buffered_feed() {
        let mut feed = BufferedFeed::from_response(changes_response()).unwrap();
        assert_eq!(feed.last_seq(), Some(json!(3)));
        let first = feed.next().unwrap().unwrap();
        assert_eq!(first.id, "a");
        let second = feed.next().unwrap().unwrap();
        assert!(second.deleted);
        assert_eq!(feed.count(), 1);
    }

    #[test]
    fn test_buffered_feed_rejects_bad_shape() {
        let err = BufferedFeed::from_response(json!({"rows": []})).unwrap_err();
        assert!(matches!(err, CouchError::InvalidResponse(_)));
    }

    #[test]
    fn test_line_feed_skips_heartbeats_and_stops_at_last_seq() {
        let body = "{\"seq\":1,\"id\":\"a\",\"changes\":[]}\n\n\n{\"seq\":\"2-g1A\",\"id\":\"b\"}\n{\"last_seq\":\"2-g1A\"}\n{\"seq\":9,\"id\":\"never\"}\n";
        let mut feed = LineFeed::new(Cursor::new(body));
        let ids: Vec<String> = feed.by_ref().map(|c| c.unwrap().id).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(feed.last_seq(), Some(json!("2-g1A")));
    }

    #[test]
    fn test_line_feed_reports_garbage() {
        let mut feed = LineFeed::new(Cursor::new("not json\n"));
        assert!(matches!(feed.next(), Some(Err(CouchError::Json(_)))));
    }

    #[test]
    fn test_feed_mode_from_params() {
        let mut params = Params::new();
        assert_eq!(FeedMode::from_params(&params).unwrap(), FeedMode::Normal);
        params.insert("feed".into(), json!("longpoll"));
        assert_eq!(FeedMode::from_params(&params).unwrap(), FeedMode::LongPoll);
        params.insert("feed".into(), json!("eventsource"));
        assert!(FeedMode::from_params(&params).is_err());
        assert_eq!(
            FeedMode::Continuous.apply(&Params::new())["feed"],
            json!("continuous")
        );
    }

    #[test]
    fn test_seq_rank() {
        assert_eq!(seq_rank(&json!(42)), Some(42));
        assert_eq!(seq_rank(&json!("12-g1AAAA")), Some(12));
        assert_eq!(seq_rank(&json!("opaque")), None);
        assert_eq!(seq_rank(&json!(null)), None);
    }

    #[test]
    fn test_cursor_advances_monotonically() {
        let mut cursor = ChangeFeedCursor::new(FeedMode::Normal).starting_at(5);
        assert!(!cursor.advance(&json!(3)));
        assert_eq!(cursor.since(), &json!(5));
        assert!(cursor.advance(&json!("7-abc")));
        assert!(!cursor.advance(&json!("6-def")));
        assert_eq!(cursor.since(), &json!("7-abc"));
    }

    #[test]
    fn test_stream_fold_and_foreach() {
        let backend = Arc::new(MockBackend::new(|_| Ok(changes_response())));
        let stream = ChangesStream::new(backend.clone(), "db", Params::new()).since(0);

        let ids = stream
            .fold(Vec::new(), |mut acc, change| {
                acc.push(change.id);
                acc
            })
            .unwrap();
        assert_eq!(ids, vec!["a", "b", "c"]);

        let mut seen = 0;
        stream.foreach(|_| seen += 1).unwrap();
        assert_eq!(seen, 3);

        let calls = backend.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].params["since"], json!(0));
    }

    #[test]
    fn test_cursor_poll_moves_checkpoint() {
        let backend = Arc::new(MockBackend::new(|_| Ok(changes_response())));
        let consumer = Consumer::new(backend.clone(), "db");
        let mut cursor = ChangeFeedCursor::new(FeedMode::Normal);

        let mut ids = Vec::new();
        let delivered = cursor.poll(&consumer, |c| ids.push(c.id)).unwrap();
        assert_eq!(delivered, 3);
        assert_eq!(cursor.since(), &json!(3));

        let calls = backend.calls();
        assert_eq!(calls[0].params["feed"], json!("normal"));
        assert_eq!(calls[0].params["since"], json!(0));
    }

    #[test]
    fn test_cursor_longpoll_delivers_one() {
        let backend = Arc::new(MockBackend::new(|_| Ok(changes_response())));
        let consumer = Consumer::new(backend, "db");
        let mut cursor = ChangeFeedCursor::new(FeedMode::LongPoll);

        let delivered = cursor.poll(&consumer, |_| {}).unwrap();
        assert_eq!(delivered, 1);
        assert_eq!(cursor.since(), &json!(1));
    }
}
