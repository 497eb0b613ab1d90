//! # Streaming JSON Output
//!
//! Analyses emit their results as a tree of dicts and lists, but a long scan
//! can produce far more output than fits comfortably in memory. This module
//! writes the tree to the sink as it is built.
//!
//! ## Sink Handoff
//!
//! Exactly one node holds the sink at a time. Items added to the holder are
//! written immediately; items added anywhere else are queued on their node.
//!
//! ```text
//! root {                      holder: root
//!   "a": 1                    written
//!   "calls": [                holder: calls   (root queues from here on)
//!   "b": 2                    queued on root
//!     {...}, {...}            written as calls grows
//!   ] calls.done()            holder: root    (drain "b")
//! } root.done()               sink flushed
//! ```
//!
//! When the holder reaches a queued child collection it writes the opening
//! bracket and passes the sink down. A child that was already closed is
//! rendered from its queue on the spot and the sink comes straight back.
//! Memory is bounded by the open path plus whatever is queued behind it.
//!
//! ## Key Types
//!
//! - [`JsonStream`] - owns the sink; [`JsonStream::root`] is the top-level dict
//! - [`JsonDict`] / [`JsonList`] - cloneable handles to open collections
//! - [`Hex`] - renders an address as a quoted hex string

use std::cell::RefCell;
use std::collections::{HashMap, HashSet, VecDeque};
use std::io::{BufWriter, Write};
use std::rc::Rc;

use serde::{Serialize, Serializer};

use crate::domain::SerializeError;

/// An address rendered as a quoted hex string (`"0x1000"`)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hex(pub u64);

impl Serialize for Hex {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("{:#x}", self.0))
    }
}

type NodeId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Dict,
    List,
}

impl Kind {
    fn name(self) -> &'static str {
        match self {
            Kind::Dict => "dict",
            Kind::List => "list",
        }
    }

    fn open(self) -> &'static str {
        match self {
            Kind::Dict => "{",
            Kind::List => "[",
        }
    }

    fn close(self) -> &'static str {
        match self {
            Kind::Dict => "}",
            Kind::List => "]",
        }
    }
}

enum Item {
    /// Pre-rendered JSON text
    Scalar(String),
    Child(NodeId),
}

struct Entry {
    /// Pre-rendered key, dicts only
    key: Option<String>,
    item: Item,
}

struct Node {
    kind: Kind,
    closed: bool,
    wrote_any: bool,
    pending: VecDeque<Entry>,
    parent: Option<NodeId>,
    keys: HashSet<String>,
}

impl Node {
    fn new(kind: Kind, parent: Option<NodeId>) -> Self {
        Self {
            kind,
            closed: false,
            wrote_any: false,
            pending: VecDeque::new(),
            parent,
            keys: HashSet::new(),
        }
    }
}

/// What a caller adds to a collection
enum Value {
    Scalar(String),
    Collection(Kind),
}

struct StreamState {
    sink: Box<dyn Write>,
    /// Nodes not yet fully written; a missing node is closed
    nodes: HashMap<NodeId, Node>,
    next_id: NodeId,
    holder: Option<NodeId>,
    open: usize,
}

impl StreamState {
    fn add(
        &mut self,
        node: NodeId,
        kind: Kind,
        key: Option<&str>,
        value: Value,
    ) -> Result<Option<NodeId>, SerializeError> {
        let rendered_key = key.map(serde_json::to_string).transpose()?;

        let target = self
            .nodes
            .get_mut(&node)
            .filter(|n| !n.closed)
            .ok_or(SerializeError::ClosedCollection(kind.name()))?;
        if let Some(key) = key {
            if !target.keys.insert(key.to_string()) {
                return Err(SerializeError::DuplicateKey(key.to_string()));
            }
        }

        let (item, child) = match value {
            Value::Scalar(text) => (Item::Scalar(text), None),
            Value::Collection(child_kind) => {
                let id = self.next_id;
                self.next_id += 1;
                self.open += 1;
                self.nodes.insert(id, Node::new(child_kind, Some(node)));
                (Item::Child(id), Some(id))
            }
        };

        if let Some(target) = self.nodes.get_mut(&node) {
            target.pending.push_back(Entry { key: rendered_key, item });
        }
        if self.holder == Some(node) {
            self.run(node)?;
        }
        Ok(child)
    }

    fn done(&mut self, node: NodeId) -> Result<(), SerializeError> {
        let Some(target) = self.nodes.get_mut(&node) else {
            return Ok(());
        };
        if target.closed {
            return Ok(());
        }
        target.closed = true;
        self.open -= 1;
        if self.holder == Some(node) {
            self.run(node)?;
        }
        Ok(())
    }

    /// Hand the sink to `node` and write until some open collection blocks
    fn run(&mut self, mut node: NodeId) -> Result<(), SerializeError> {
        loop {
            self.holder = Some(node);
            let Some(current) = self.nodes.get_mut(&node) else {
                return Ok(());
            };

            if let Some(entry) = current.pending.pop_front() {
                let mut text = String::new();
                if current.wrote_any {
                    text.push_str(", ");
                }
                current.wrote_any = true;
                if let Some(key) = entry.key {
                    text.push_str(&key);
                    text.push_str(": ");
                }
                match entry.item {
                    Item::Scalar(value) => {
                        text.push_str(&value);
                        self.sink.write_all(text.as_bytes())?;
                    }
                    Item::Child(child) => {
                        if let Some(kind) = self.nodes.get(&child).map(|n| n.kind) {
                            text.push_str(kind.open());
                        }
                        self.sink.write_all(text.as_bytes())?;
                        node = child;
                    }
                }
                continue;
            }

            if !current.closed {
                return Ok(());
            }
            let close = current.kind.close();
            let parent = current.parent;
            self.nodes.remove(&node);
            self.sink.write_all(close.as_bytes())?;
            match parent {
                Some(parent) => node = parent,
                None => {
                    self.holder = None;
                    self.sink.write_all(b"\n")?;
                    self.sink.flush()?;
                    return Ok(());
                }
            }
        }
    }
}

/// Owner of the output sink
pub struct JsonStream {
    state: Rc<RefCell<StreamState>>,
    root: NodeId,
}

impl JsonStream {
    /// Start a document whose top level is a dict
    ///
    /// # Errors
    /// Propagates errors writing the opening brace
    pub fn new<W: Write + 'static>(sink: W) -> Result<Self, SerializeError> {
        let mut sink: Box<dyn Write> = Box::new(BufWriter::new(sink));
        sink.write_all(Kind::Dict.open().as_bytes())?;

        let root = 0;
        let mut nodes = HashMap::new();
        nodes.insert(root, Node::new(Kind::Dict, None));
        let state = StreamState { sink, nodes, next_id: root + 1, holder: Some(root), open: 1 };
        Ok(Self { state: Rc::new(RefCell::new(state)), root })
    }

    /// The top-level dict
    #[must_use]
    pub fn root(&self) -> JsonDict {
        JsonDict { state: Rc::clone(&self.state), id: self.root }
    }

    /// Collections not yet closed
    #[must_use]
    pub fn open_collections(&self) -> usize {
        self.state.borrow().open
    }

    /// Check that the document is complete and flush the sink
    ///
    /// # Errors
    /// Returns [`SerializeError::Unfinished`] if any collection (the root
    /// included) is still open
    pub fn finish(self) -> Result<(), SerializeError> {
        let open = self.open_collections();
        if open > 0 {
            return Err(SerializeError::Unfinished(open));
        }
        self.state.borrow_mut().sink.flush()?;
        Ok(())
    }
}

fn render<V: Serialize + ?Sized>(value: &V) -> Result<Value, SerializeError> {
    Ok(Value::Scalar(serde_json::to_string(value)?))
}

/// Handle to an open (or closed) dict
#[derive(Clone)]
pub struct JsonDict {
    state: Rc<RefCell<StreamState>>,
    id: NodeId,
}

impl JsonDict {
    /// Add a scalar (any `Serialize` value) under `key`
    ///
    /// # Errors
    /// Fails if the dict is closed, the key is taken, or the sink fails
    pub fn put<V: Serialize + ?Sized>(&self, key: &str, value: &V) -> Result<(), SerializeError> {
        let value = render(value)?;
        self.state.borrow_mut().add(self.id, Kind::Dict, Some(key), value).map(|_| ())
    }

    /// Add a nested dict under `key`
    ///
    /// # Errors
    /// Fails if the dict is closed, the key is taken, or the sink fails
    pub fn put_dict(&self, key: &str) -> Result<JsonDict, SerializeError> {
        let id = self.add_collection(key, Kind::Dict)?;
        Ok(JsonDict { state: Rc::clone(&self.state), id })
    }

    /// Add a nested list under `key`
    ///
    /// # Errors
    /// Fails if the dict is closed, the key is taken, or the sink fails
    pub fn put_list(&self, key: &str) -> Result<JsonList, SerializeError> {
        let id = self.add_collection(key, Kind::List)?;
        Ok(JsonList { state: Rc::clone(&self.state), id })
    }

    /// Close the dict; closing twice is a no-op
    ///
    /// # Errors
    /// Propagates sink errors
    pub fn done(&self) -> Result<(), SerializeError> {
        self.state.borrow_mut().done(self.id)
    }

    fn add_collection(&self, key: &str, kind: Kind) -> Result<NodeId, SerializeError> {
        let child =
            self.state.borrow_mut().add(self.id, Kind::Dict, Some(key), Value::Collection(kind))?;
        child.ok_or(SerializeError::ClosedCollection(Kind::Dict.name()))
    }
}

/// Handle to an open (or closed) list
#[derive(Clone)]
pub struct JsonList {
    state: Rc<RefCell<StreamState>>,
    id: NodeId,
}

impl JsonList {
    /// Append a scalar (any `Serialize` value)
    ///
    /// # Errors
    /// Fails if the list is closed or the sink fails
    pub fn append<V: Serialize + ?Sized>(&self, value: &V) -> Result<(), SerializeError> {
        let value = render(value)?;
        self.state.borrow_mut().add(self.id, Kind::List, None, value).map(|_| ())
    }

    /// Append a nested dict
    ///
    /// # Errors
    /// Fails if the list is closed or the sink fails
    pub fn append_dict(&self) -> Result<JsonDict, SerializeError> {
        let id = self.add_collection(Kind::Dict)?;
        Ok(JsonDict { state: Rc::clone(&self.state), id })
    }

    /// Close the list; closing twice is a no-op
    ///
    /// # Errors
    /// Propagates sink errors
    pub fn done(&self) -> Result<(), SerializeError> {
        self.state.borrow_mut().done(self.id)
    }

    #[cfg(test)]
    fn is_closed(&self) -> bool {
        self.state.borrow().nodes.get(&self.id).map_or(true, |n| n.closed)
    }

    fn add_collection(&self, kind: Kind) -> Result<NodeId, SerializeError> {
        let child = self.state.borrow_mut().add(self.id, Kind::List, None, Value::Collection(kind))?;
        child.ok_or(SerializeError::ClosedCollection(Kind::List.name()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    /// Sink whose contents stay readable after the stream takes ownership
    #[derive(Clone, Default)]
    struct SharedBuffer(Rc<RefCell<Vec<u8>>>);

    impl Write for SharedBuffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.borrow_mut().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl SharedBuffer {
        fn text(&self) -> String {
            String::from_utf8(self.0.borrow().clone()).unwrap()
        }
    }

    fn stream() -> (JsonStream, SharedBuffer) {
        let buffer = SharedBuffer::default();
        (JsonStream::new(buffer.clone()).unwrap(), buffer)
    }

    #[test]
    fn test_list_rendering() {
        let (stream, buffer) = stream();
        let root = stream.root();
        let list = root.put_list("values").unwrap();
        list.append("v1").unwrap();
        list.append("v2").unwrap();
        list.append("v3").unwrap();
        list.done().unwrap();
        root.done().unwrap();
        stream.finish().unwrap();

        assert_eq!(buffer.text(), "{\"values\": [\"v1\", \"v2\", \"v3\"]}\n");
    }

    #[test]
    fn test_done_twice_and_append_after_done() {
        let (stream, _buffer) = stream();
        let list = stream.root().put_list("l").unwrap();
        list.done().unwrap();
        list.done().unwrap();
        assert!(matches!(list.append(&1), Err(SerializeError::ClosedCollection("list"))));
        assert!(list.is_closed());
    }

    #[test]
    fn test_empty_collections() {
        let (stream, buffer) = stream();
        let root = stream.root();
        root.put_list("l").unwrap().done().unwrap();
        root.put_dict("d").unwrap().done().unwrap();
        root.done().unwrap();
        assert_eq!(buffer.text(), "{\"l\": [], \"d\": {}}\n");
    }

    #[test]
    fn test_streams_while_child_is_open() {
        let (stream, buffer) = stream();
        let root = stream.root();
        let calls = root.put_list("calls").unwrap();
        calls.append(&1).unwrap();
        assert_eq!(buffer.0.borrow().len(), 0, "output is buffered until flushed");

        // Queued behind the open list
        root.put("after", &Hex(0x1000)).unwrap();
        let late = root.put_dict("late").unwrap();
        late.put("x", &true).unwrap();
        late.done().unwrap();

        calls.append(&2).unwrap();
        calls.done().unwrap();
        root.done().unwrap();
        stream.finish().unwrap();

        let text = buffer.text();
        assert_eq!(text, "{\"calls\": [1, 2], \"after\": \"0x1000\", \"late\": {\"x\": true}}\n");
        let parsed: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed["late"]["x"], true);
    }

    #[test]
    fn test_closed_child_waits_for_open_sibling() {
        let (stream, buffer) = stream();
        let root = stream.root();
        let first = root.put_list("first").unwrap();
        let second = root.put_list("second").unwrap();
        let nested = second.append_dict().unwrap();
        nested.put("k", "v").unwrap();
        nested.done().unwrap();
        second.done().unwrap();
        assert!(stream.open_collections() == 2);

        first.append(&0).unwrap();
        first.done().unwrap();
        root.done().unwrap();
        stream.finish().unwrap();

        assert_eq!(buffer.text(), "{\"first\": [0], \"second\": [{\"k\": \"v\"}]}\n");
    }

    #[test]
    fn test_duplicate_key_rejected() {
        let (stream, _buffer) = stream();
        let root = stream.root();
        root.put("a", &1).unwrap();
        assert!(matches!(root.put("a", &2), Err(SerializeError::DuplicateKey(k)) if k == "a"));
    }

    #[test]
    fn test_finish_with_open_collections() {
        let (stream, _buffer) = stream();
        let _list = stream.root().put_list("open").unwrap();
        assert!(matches!(stream.finish(), Err(SerializeError::Unfinished(2))));
    }
}
