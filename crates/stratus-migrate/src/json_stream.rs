//! Streaming readers for large JSON export files.
//!
//! Export files (auth exports, RTDB trees, batched collections) can be far
//! larger than memory. These readers walk the document with serde seeds and
//! hand each record to a callback as soon as it has been parsed, so only one
//! record is materialized at a time. [`spawn_stream`] runs such a reader on a
//! blocking thread and feeds a bounded channel, which is how adapters keep
//! memory proportional to their batch size.

use serde::de::{self, DeserializeSeed, Deserializer, IgnoredAny, MapAccess, SeqAccess, Visitor};
use serde_json::Value;
use std::fmt;
use std::io::{BufRead, Read};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{Error, Result};

/// Position of a record inside its tree node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryKey {
    /// Child of an object node.
    Name(String),
    /// Element of an array node.
    Index(u64),
    /// The node itself is a scalar.
    Root,
}

/// One record of a JSON tree: a child of a top-level node.
#[derive(Debug, Clone, PartialEq)]
pub struct TreeEntry {
    /// Top-level node the record belongs to.
    pub node: String,
    /// Key of the record within the node.
    pub key: EntryKey,
    /// Record contents.
    pub value: Value,
}

/// Callback plumbing shared by the seeds below.
struct Sink<'a, T> {
    emit: &'a mut dyn FnMut(T) -> Result<()>,
    failure: Option<Error>,
    count: u64,
}

impl<'a, T> Sink<'a, T> {
    fn new(emit: &'a mut dyn FnMut(T) -> Result<()>) -> Self {
        Self {
            emit,
            failure: None,
            count: 0,
        }
    }

    fn push<E: de::Error>(&mut self, item: T) -> std::result::Result<(), E> {
        match (self.emit)(item) {
            Ok(()) => {
                self.count += 1;
                Ok(())
            }
            Err(err) => {
                let message = err.to_string();
                self.failure = Some(err);
                Err(E::custom(message))
            }
        }
    }

    /// Resolves the outcome of a parse, preferring the callback's own error.
    fn finish(self, parsed: std::result::Result<(), serde_json::Error>) -> Result<u64> {
        if let Some(err) = self.failure {
            return Err(err);
        }
        parsed.map_err(|e| Error::Extraction(format!("invalid JSON: {e}")))?;
        Ok(self.count)
    }
}

/// Streams the elements of the array stored under `field` of the root object.
///
/// # Errors
///
/// Returns [`Error::Extraction`] when the document is malformed or the field
/// is missing, or the callback's error.
pub fn stream_array_field<R, F>(reader: R, field: &str, mut emit: F) -> Result<u64>
where
    R: Read,
    F: FnMut(Value) -> Result<()>,
{
    let mut sink = Sink::new(&mut emit);
    let mut de = serde_json::Deserializer::from_reader(reader);
    let parsed = (|| -> std::result::Result<(), serde_json::Error> {
        let found = KeyedArray {
            field,
            sink: &mut sink,
        }
        .deserialize(&mut de)?;
        de.end()?;
        if !found {
            return Err(de::Error::custom(format!("missing `{field}` array")));
        }
        Ok(())
    })();
    sink.finish(parsed)
}

/// Streams every child of every top-level node of a JSON tree.
///
/// A `null` root is an empty tree. Array children that are `null` are holes
/// and are skipped.
///
/// # Errors
///
/// Returns [`Error::Extraction`] when the root is not an object, or the
/// callback's error.
pub fn stream_tree<R, F>(reader: R, mut emit: F) -> Result<u64>
where
    R: Read,
    F: FnMut(TreeEntry) -> Result<()>,
{
    let mut sink = Sink::new(&mut emit);
    let mut de = serde_json::Deserializer::from_reader(reader);
    let parsed = (|| {
        TreeRoot { sink: &mut sink }.deserialize(&mut de)?;
        de.end()
    })();
    sink.finish(parsed)
}

/// Streams the children of a single node stored on its own, e.g. a batched
/// collection file holding an object map or an array of documents.
///
/// # Errors
///
/// Returns [`Error::Extraction`] on malformed input, or the callback's error.
pub fn stream_children<R, F>(reader: R, node: &str, mut emit: F) -> Result<u64>
where
    R: Read,
    F: FnMut(TreeEntry) -> Result<()>,
{
    let mut sink = Sink::new(&mut emit);
    let mut de = serde_json::Deserializer::from_reader(reader);
    let parsed = (|| {
        NodeChildren {
            node: node.to_string(),
            sink: &mut sink,
        }
        .deserialize(&mut de)?;
        de.end()
    })();
    sink.finish(parsed)
}

/// Streams one JSON value per non-blank line.
///
/// # Errors
///
/// Returns [`Error::Extraction`] naming the failing line, or the callback's
/// error.
pub fn stream_lines<R, F>(reader: R, mut emit: F) -> Result<u64>
where
    R: BufRead,
    F: FnMut(Value) -> Result<()>,
{
    let mut count = 0;
    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let value: Value = serde_json::from_str(&line)
            .map_err(|e| Error::Extraction(format!("invalid JSON on line {}: {e}", index + 1)))?;
        emit(value)?;
        count += 1;
    }
    Ok(count)
}

struct KeyedArray<'s, 'a> {
    field: &'s str,
    sink: &'s mut Sink<'a, Value>,
}

impl<'de> DeserializeSeed<'de> for KeyedArray<'_, '_> {
    type Value = bool;

    fn deserialize<D: Deserializer<'de>>(self, deserializer: D) -> std::result::Result<bool, D::Error> {
        deserializer.deserialize_map(self)
    }
}

impl<'de> Visitor<'de> for KeyedArray<'_, '_> {
    type Value = bool;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "an object with a `{}` array", self.field)
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> std::result::Result<bool, A::Error> {
        let mut found = false;
        while let Some(key) = map.next_key::<String>()? {
            if key == self.field {
                map.next_value_seed(ArrayItems {
                    sink: &mut *self.sink,
                })?;
                found = true;
            } else {
                map.next_value::<IgnoredAny>()?;
            }
        }
        Ok(found)
    }
}

struct ArrayItems<'s, 'a> {
    sink: &'s mut Sink<'a, Value>,
}

impl<'de> DeserializeSeed<'de> for ArrayItems<'_, '_> {
    type Value = ();

    fn deserialize<D: Deserializer<'de>>(self, deserializer: D) -> std::result::Result<(), D::Error> {
        deserializer.deserialize_seq(self)
    }
}

impl<'de> Visitor<'de> for ArrayItems<'_, '_> {
    type Value = ();

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("an array")
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> std::result::Result<(), A::Error> {
        while let Some(item) = seq.next_element::<Value>()? {
            self.sink.push::<A::Error>(item)?;
        }
        Ok(())
    }
}

struct TreeRoot<'s, 'a> {
    sink: &'s mut Sink<'a, TreeEntry>,
}

impl<'de> DeserializeSeed<'de> for TreeRoot<'_, '_> {
    type Value = ();

    fn deserialize<D: Deserializer<'de>>(self, deserializer: D) -> std::result::Result<(), D::Error> {
        deserializer.deserialize_any(self)
    }
}

impl<'de> Visitor<'de> for TreeRoot<'_, '_> {
    type Value = ();

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a JSON object at the root of the tree")
    }

    fn visit_unit<E: de::Error>(self) -> std::result::Result<(), E> {
        Ok(())
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> std::result::Result<(), A::Error> {
        while let Some(node) = map.next_key::<String>()? {
            map.next_value_seed(NodeChildren {
                node,
                sink: &mut *self.sink,
            })?;
        }
        Ok(())
    }
}

struct NodeChildren<'s, 'a> {
    node: String,
    sink: &'s mut Sink<'a, TreeEntry>,
}

impl NodeChildren<'_, '_> {
    fn scalar<E: de::Error>(self, value: Value) -> std::result::Result<(), E> {
        let entry = TreeEntry {
            node: self.node,
            key: EntryKey::Root,
            value,
        };
        self.sink.push(entry)
    }
}

impl<'de> DeserializeSeed<'de> for NodeChildren<'_, '_> {
    type Value = ();

    fn deserialize<D: Deserializer<'de>>(self, deserializer: D) -> std::result::Result<(), D::Error> {
        deserializer.deserialize_any(self)
    }
}

impl<'de> Visitor<'de> for NodeChildren<'_, '_> {
    type Value = ();

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("any JSON value")
    }

    fn visit_unit<E: de::Error>(self) -> std::result::Result<(), E> {
        Ok(())
    }

    fn visit_bool<E: de::Error>(self, v: bool) -> std::result::Result<(), E> {
        self.scalar(Value::Bool(v))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> std::result::Result<(), E> {
        self.scalar(Value::from(v))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> std::result::Result<(), E> {
        self.scalar(Value::from(v))
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> std::result::Result<(), E> {
        self.scalar(Value::from(v))
    }

    fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<(), E> {
        self.scalar(Value::String(v.to_string()))
    }

    fn visit_string<E: de::Error>(self, v: String) -> std::result::Result<(), E> {
        self.scalar(Value::String(v))
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> std::result::Result<(), A::Error> {
        while let Some((key, value)) = map.next_entry::<String, Value>()? {
            self.sink.push::<A::Error>(TreeEntry {
                node: self.node.clone(),
                key: EntryKey::Name(key),
                value,
            })?;
        }
        Ok(())
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> std::result::Result<(), A::Error> {
        let mut index = 0u64;
        while let Some(value) = seq.next_element::<Value>()? {
            if !value.is_null() {
                self.sink.push::<A::Error>(TreeEntry {
                    node: self.node.clone(),
                    key: EntryKey::Index(index),
                    value,
                })?;
            }
            index += 1;
        }
        Ok(())
    }
}

/// Receiving end of a reader running on a blocking thread.
pub struct StreamHandle<T> {
    rx: mpsc::Receiver<T>,
    handle: JoinHandle<Result<u64>>,
}

impl<T> StreamHandle<T> {
    /// Next record, or `None` once the reader is done.
    pub async fn next(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// Waits for the reader and returns its record count or error.
    ///
    /// # Errors
    ///
    /// Returns the reader's error, or [`Error::Extraction`] if it panicked.
    pub async fn finish(mut self) -> Result<u64> {
        self.rx.close();
        self.handle
            .await
            .map_err(|e| Error::Extraction(format!("export reader panicked: {e}")))?
    }
}

/// Runs `producer` on a blocking thread, forwarding each record through a
/// channel holding at most `capacity` records.
pub fn spawn_stream<T, P>(capacity: usize, producer: P) -> StreamHandle<T>
where
    T: Send + 'static,
    P: FnOnce(&mut dyn FnMut(T) -> Result<()>) -> Result<u64> + Send + 'static,
{
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let handle = tokio::task::spawn_blocking(move || {
        // A closed receiver means the consumer gave up; stop parsing.
        let mut emit = |item: T| tx.blocking_send(item).map_err(|_| Error::Cancelled);
        producer(&mut emit)
    });
    StreamHandle { rx, handle }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Cursor;

    #[test]
    fn test_stream_array_field_skips_other_keys() {
        let input = br#"{"kind":"export","users":[{"localId":"a"},{"localId":"b"}],"tail":{"x":[1,2]}}"#;
        let mut seen = Vec::new();
        let count = stream_array_field(Cursor::new(&input[..]), "users", |v| {
            seen.push(v["localId"].as_str().unwrap().to_string());
            Ok(())
        })
        .unwrap();
        assert_eq!(count, 2);
        assert_eq!(seen, vec!["a", "b"]);
    }

    #[test]
    fn test_stream_array_field_missing_field() {
        let result = stream_array_field(Cursor::new(&br#"{"accounts":[]}"#[..]), "users", |_| Ok(()));
        assert!(matches!(result, Err(Error::Extraction(_))));
    }

    #[test]
    fn test_stream_array_field_propagates_callback_error() {
        let input = br#"{"users":[1,2,3]}"#;
        let mut calls = 0;
        let result = stream_array_field(Cursor::new(&input[..]), "users", |_| {
            calls += 1;
            if calls == 2 {
                Err(Error::Loading("stop".to_string()))
            } else {
                Ok(())
            }
        });
        assert!(matches!(result, Err(Error::Loading(msg)) if msg == "stop"));
        assert_eq!(calls, 2);
    }

    #[test]
    fn test_stream_tree_shapes() {
        let input = json!({
            "posts": {"p1": {"title": "a"}, "p2": {"title": "b"}},
            "tags": ["x", null, "z"],
            "version": 3,
            "empty": null
        })
        .to_string();

        let mut entries = Vec::new();
        let count = stream_tree(Cursor::new(input.into_bytes()), |e| {
            entries.push(e);
            Ok(())
        })
        .unwrap();

        assert_eq!(count, 5);
        assert_eq!(entries[0].node, "posts");
        assert_eq!(entries[0].key, EntryKey::Name("p1".to_string()));
        assert_eq!(entries[0].value, json!({"title": "a"}));
        let tags: Vec<&EntryKey> = entries
            .iter()
            .filter(|e| e.node == "tags")
            .map(|e| &e.key)
            .collect();
        assert_eq!(tags, vec![&EntryKey::Index(0), &EntryKey::Index(2)]);
        let version = entries.iter().find(|e| e.node == "version").unwrap();
        assert_eq!(version.key, EntryKey::Root);
        assert_eq!(version.value, json!(3));
    }

    #[test]
    fn test_stream_tree_null_root_is_empty() {
        let count = stream_tree(Cursor::new(&b"null"[..]), |_| Ok(())).unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_stream_tree_rejects_array_root() {
        let result = stream_tree(Cursor::new(&b"[1,2]"[..]), |_| Ok(()));
        assert!(matches!(result, Err(Error::Extraction(_))));
    }

    #[test]
    fn test_stream_tree_rejects_trailing_garbage() {
        let result = stream_tree(Cursor::new(&b"{} {}"[..]), |_| Ok(()));
        assert!(result.is_err());
    }

    #[test]
    fn test_stream_children_array_of_documents() {
        let input = br#"[{"id":"d1","n":1},{"id":"d2","n":2}]"#;
        let mut keys = Vec::new();
        stream_children(Cursor::new(&input[..]), "items", |e| {
            keys.push(e.key);
            Ok(())
        })
        .unwrap();
        assert_eq!(keys, vec![EntryKey::Index(0), EntryKey::Index(1)]);
    }

    #[test]
    fn test_stream_lines() {
        let input = "{\"a\":1}\n\n{\"a\":2}\n";
        let mut sum = 0;
        let count = stream_lines(Cursor::new(input), |v| {
            sum += v["a"].as_i64().unwrap();
            Ok(())
        })
        .unwrap();
        assert_eq!(count, 2);
        assert_eq!(sum, 3);

        let err = stream_lines(Cursor::new("{\"a\":1}\nnope\n"), |_| Ok(())).unwrap_err();
        assert!(err.to_string().contains("line 2"));
    }

    #[tokio::test]
    async fn test_spawn_stream_delivers_all_records() {
        let mut stream = spawn_stream(2, |emit| {
            for i in 0..10u64 {
                emit(i)?;
            }
            Ok(10)
        });

        let mut received = Vec::new();
        while let Some(i) = stream.next().await {
            received.push(i);
        }
        assert_eq!(received, (0..10).collect::<Vec<_>>());
        assert_eq!(stream.finish().await.unwrap(), 10);
    }

    #[tokio::test]
    async fn test_spawn_stream_stops_when_consumer_leaves() {
        let mut stream = spawn_stream(1, |emit| {
            for i in 0..1_000u64 {
                emit(i)?;
            }
            Ok(1_000)
        });

        assert_eq!(stream.next().await, Some(0));
        let result = stream.finish().await;
        assert!(matches!(result, Err(Error::Cancelled)));
    }
}
