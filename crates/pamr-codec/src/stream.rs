//! Encoding and decoding of object streams.
//!
//! A stream is a MessagePack document made of a class table followed by the
//! object graph. Each class appears once in the table, at its first use,
//! together with the URL of the endpoint that can serve its definition.
//! Objects refer to their class by table index.
//!
//! Decoding resolves the class table in two phases: the local
//! [`ClassCatalog`] first, then the [`ClassFetcher`] against the recorded
//! origin. A class found locally is never fetched.

use crate::catalog::ClassCatalog;
use crate::class::{ClassDef, Object, Value};
use crate::error::{CodecError, CodecResult};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, warn};

/// Out-of-band retrieval of class definitions from their origin.
#[async_trait]
pub trait ClassFetcher: Send + Sync {
    /// Return the serialized [`ClassDef`] of `class` as known by `origin`.
    async fn fetch_class(&self, class: &str, origin: &str) -> Result<Vec<u8>, String>;
}

#[derive(Debug, Serialize, Deserialize)]
struct ClassEntry {
    name: String,
    version: u32,
    origin: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
enum Node {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<Node>),
    Object { class: u32, fields: Vec<(String, Node)> },
}

#[derive(Debug, Serialize, Deserialize)]
struct Frame {
    classes: Vec<ClassEntry>,
    root: Node,
}

#[derive(Default)]
struct ClassTable {
    index: HashMap<String, u32>,
    entries: Vec<ClassEntry>,
}

/// Writes object graphs, annotating every class with its origin.
pub struct ObjectEncoder {
    catalog: Arc<ClassCatalog>,
    local_origin: String,
}

impl ObjectEncoder {
    /// `local_origin` is written for classes defined by this endpoint.
    /// Classes learned from elsewhere keep the origin they came from.
    pub fn new(catalog: Arc<ClassCatalog>, local_origin: impl Into<String>) -> Self {
        Self {
            catalog,
            local_origin: local_origin.into(),
        }
    }

    pub fn local_origin(&self) -> &str {
        &self.local_origin
    }

    pub fn encode(&self, value: &Value) -> CodecResult<Vec<u8>> {
        let mut table = ClassTable::default();
        let root = self.lower(value, &mut table)?;
        let frame = Frame {
            classes: table.entries,
            root,
        };
        Ok(rmp_serde::to_vec(&frame)?)
    }

    fn lower(&self, value: &Value, table: &mut ClassTable) -> CodecResult<Node> {
        Ok(match value {
            Value::Null => Node::Null,
            Value::Bool(v) => Node::Bool(*v),
            Value::Int(v) => Node::Int(*v),
            Value::Float(v) => Node::Float(*v),
            Value::Str(v) => Node::Str(v.clone()),
            Value::Bytes(v) => Node::Bytes(v.clone()),
            Value::List(items) => Node::List(
                items
                    .iter()
                    .map(|item| self.lower(item, table))
                    .collect::<CodecResult<Vec<_>>>()?,
            ),
            Value::Object(object) => {
                let class = self.class_index(object, table)?;
                let mut fields = Vec::with_capacity(object.fields.len());
                for (name, field) in &object.fields {
                    fields.push((name.clone(), self.lower(field, table)?));
                }
                Node::Object { class, fields }
            }
        })
    }

    fn class_index(&self, object: &Object, table: &mut ClassTable) -> CodecResult<u32> {
        if let Some(idx) = table.index.get(&object.class) {
            return Ok(*idx);
        }
        let def = self
            .catalog
            .get(&object.class)
            .ok_or_else(|| CodecError::ClassNotRegistered(object.class.clone()))?;
        check_fields(&def, object.fields.keys())?;

        let origin = self
            .catalog
            .origin_of(&def.name)
            .unwrap_or_else(|| self.local_origin.clone());
        let idx = table.entries.len() as u32;
        table.entries.push(ClassEntry {
            name: def.name.clone(),
            version: def.version,
            origin: Some(origin),
        });
        table.index.insert(def.name.clone(), idx);
        Ok(idx)
    }
}

/// Reads object graphs, resolving unknown classes from their origin.
pub struct ObjectDecoder {
    catalog: Arc<ClassCatalog>,
    fetcher: Option<Arc<dyn ClassFetcher>>,
}

impl ObjectDecoder {
    /// A decoder that only resolves classes from the local catalog.
    pub fn local(catalog: Arc<ClassCatalog>) -> Self {
        Self {
            catalog,
            fetcher: None,
        }
    }

    pub fn with_fetcher(catalog: Arc<ClassCatalog>, fetcher: Arc<dyn ClassFetcher>) -> Self {
        Self {
            catalog,
            fetcher: Some(fetcher),
        }
    }

    pub async fn decode(&self, bytes: &[u8]) -> CodecResult<Value> {
        let frame: Frame = rmp_serde::from_slice(bytes)?;
        let mut defs = Vec::with_capacity(frame.classes.len());
        for entry in &frame.classes {
            defs.push(self.resolve(entry).await?);
        }
        raise(frame.root, &defs)
    }

    async fn resolve(&self, entry: &ClassEntry) -> CodecResult<Arc<ClassDef>> {
        if let Some(def) = self.catalog.get(&entry.name) {
            check_version(&def, entry)?;
            return Ok(def);
        }

        let origin = entry
            .origin
            .as_deref()
            .ok_or_else(|| CodecError::ClassAbsent(entry.name.clone()))?;
        let not_found = |reason: String| CodecError::ClassNotFound {
            class: entry.name.clone(),
            origin: origin.to_string(),
            reason,
        };

        let fetcher = self
            .fetcher
            .as_ref()
            .ok_or_else(|| not_found("no class fetcher configured".into()))?;

        debug!(class = %entry.name, origin, "Class unknown locally, fetching from origin");
        let bytes = fetcher
            .fetch_class(&entry.name, origin)
            .await
            .map_err(|reason| {
                warn!(class = %entry.name, origin, %reason, "Remote class fetch failed");
                not_found(reason)
            })?;
        let def = ClassDef::from_bytes(&bytes).map_err(|e| not_found(e.to_string()))?;
        if def.name != entry.name {
            return Err(not_found(format!("origin answered with class '{}'", def.name)));
        }
        check_version(&def, entry)?;

        self.catalog.define_remote(def.clone(), origin);
        Ok(Arc::new(def))
    }
}

fn check_version(def: &ClassDef, entry: &ClassEntry) -> CodecResult<()> {
    if def.version != entry.version {
        return Err(CodecError::VersionMismatch {
            class: def.name.clone(),
            local: def.version,
            stream: entry.version,
        });
    }
    Ok(())
}

fn check_fields<'a>(def: &ClassDef, fields: impl Iterator<Item = &'a String>) -> CodecResult<()> {
    for field in fields {
        if !def.declares(field) {
            return Err(CodecError::IncompatibleClass {
                class: def.name.clone(),
                field: field.clone(),
            });
        }
    }
    Ok(())
}

fn raise(node: Node, defs: &[Arc<ClassDef>]) -> CodecResult<Value> {
    Ok(match node {
        Node::Null => Value::Null,
        Node::Bool(v) => Value::Bool(v),
        Node::Int(v) => Value::Int(v),
        Node::Float(v) => Value::Float(v),
        Node::Str(v) => Value::Str(v),
        Node::Bytes(v) => Value::Bytes(v),
        Node::List(items) => Value::List(
            items
                .into_iter()
                .map(|item| raise(item, defs))
                .collect::<CodecResult<Vec<_>>>()?,
        ),
        Node::Object { class, fields } => {
            let def = defs.get(class as usize).ok_or_else(|| {
                CodecError::Malformed(format!("class index {class} outside the class table"))
            })?;
            check_fields(def, fields.iter().map(|(name, _)| name))?;
            let mut values = BTreeMap::new();
            for (name, field) in fields {
                values.insert(name, raise(field, defs)?);
            }
            Value::Object(Object {
                class: def.name.clone(),
                fields: values,
            })
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const ORIGIN: &str = "pamr://4096/";

    /// Serves classes from a catalog standing in for a remote endpoint.
    struct CatalogFetcher {
        remote: ClassCatalog,
        calls: AtomicUsize,
    }

    impl CatalogFetcher {
        fn new(remote: ClassCatalog) -> Self {
            Self {
                remote,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ClassFetcher for CatalogFetcher {
        async fn fetch_class(&self, class: &str, origin: &str) -> Result<Vec<u8>, String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            assert_eq!(origin, ORIGIN);
            match self.remote.class_bytes(class) {
                Some(bytes) => bytes.map_err(|e| e.to_string()),
                None => Err(format!("{class} is not defined at {origin}")),
            }
        }
    }

    fn point_class() -> ClassDef {
        ClassDef::new("geometry.Point", 1, &["x", "y", "label"])
    }

    fn sample() -> Value {
        let a = Object::new("geometry.Point").with("x", 1i64).with("y", 2i64);
        let b = Object::new("geometry.Point")
            .with("x", 5i64)
            .with("label", "corner");
        Value::List(vec![a.into(), Value::Null, b.into(), Value::Bytes(vec![1, 2])])
    }

    fn encode_sample() -> Vec<u8> {
        let sender = Arc::new(ClassCatalog::new());
        sender.define(point_class());
        ObjectEncoder::new(sender, ORIGIN).encode(&sample()).unwrap()
    }

    #[test]
    fn test_class_table_written_once() {
        let bytes = encode_sample();
        let frame: Frame = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(frame.classes.len(), 1);
        assert_eq!(frame.classes[0].origin.as_deref(), Some(ORIGIN));
    }

    #[tokio::test]
    async fn test_local_class_never_fetched() {
        let bytes = encode_sample();

        let receiver = Arc::new(ClassCatalog::new());
        receiver.define(point_class());
        let fetcher = Arc::new(CatalogFetcher::new(ClassCatalog::new()));
        let decoder = ObjectDecoder::with_fetcher(receiver, fetcher.clone());

        assert_eq!(decoder.decode(&bytes).await.unwrap(), sample());
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_remote_only_class_fetched_once() {
        let bytes = encode_sample();

        let remote = ClassCatalog::new();
        remote.define(point_class());
        let fetcher = Arc::new(CatalogFetcher::new(remote));
        let receiver = Arc::new(ClassCatalog::new());
        let decoder = ObjectDecoder::with_fetcher(receiver.clone(), fetcher.clone());

        assert_eq!(decoder.decode(&bytes).await.unwrap(), sample());
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
        assert_eq!(receiver.origin_of("geometry.Point").as_deref(), Some(ORIGIN));

        // Now cached locally.
        decoder.decode(&bytes).await.unwrap();
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_absent_everywhere_names_origin() {
        let bytes = encode_sample();
        let fetcher = Arc::new(CatalogFetcher::new(ClassCatalog::new()));
        let decoder = ObjectDecoder::with_fetcher(Arc::new(ClassCatalog::new()), fetcher);

        match decoder.decode(&bytes).await {
            Err(CodecError::ClassNotFound { class, origin, .. }) => {
                assert_eq!(class, "geometry.Point");
                assert_eq!(origin, ORIGIN);
            }
            other => panic!("expected ClassNotFound, got {other:?}"),
        }
    }

    #[test]
    fn test_local_decoder_without_fetcher() {
        let bytes = encode_sample();
        let decoder = ObjectDecoder::local(Arc::new(ClassCatalog::new()));
        let result = tokio_test::block_on(decoder.decode(&bytes));
        assert!(matches!(result, Err(CodecError::ClassNotFound { .. })));
    }

    #[test]
    fn test_encoder_rejects_unregistered_class() {
        let encoder = ObjectEncoder::new(Arc::new(ClassCatalog::new()), ORIGIN);
        let value = Value::Object(Object::new("ghost.Class"));
        assert!(matches!(
            encoder.encode(&value),
            Err(CodecError::ClassNotRegistered(_))
        ));
    }

    #[test]
    fn test_encoder_rejects_undeclared_field() {
        let catalog = Arc::new(ClassCatalog::new());
        catalog.define(point_class());
        let encoder = ObjectEncoder::new(catalog, ORIGIN);
        let value = Value::Object(Object::new("geometry.Point").with("z", 9i64));
        assert!(matches!(
            encoder.encode(&value),
            Err(CodecError::IncompatibleClass { .. })
        ));
    }

    #[tokio::test]
    async fn test_version_mismatch_detected() {
        let bytes = encode_sample();
        let receiver = Arc::new(ClassCatalog::new());
        receiver.define(ClassDef::new("geometry.Point", 2, &["x", "y", "label"]));
        let decoder = ObjectDecoder::local(receiver);
        assert!(matches!(
            decoder.decode(&bytes).await,
            Err(CodecError::VersionMismatch { local: 2, stream: 1, .. })
        ));
    }

    #[test]
    fn test_reencoded_remote_class_keeps_origin() {
        let catalog = Arc::new(ClassCatalog::new());
        catalog.define_remote(point_class(), ORIGIN);
        let encoder = ObjectEncoder::new(catalog, "pamr://5000/");
        let bytes = encoder
            .encode(&Value::Object(Object::new("geometry.Point")))
            .unwrap();
        let frame: Frame = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(frame.classes[0].origin.as_deref(), Some(ORIGIN));
    }

    #[tokio::test]
    async fn test_garbage_stream_rejected() {
        let decoder = ObjectDecoder::local(Arc::new(ClassCatalog::new()));
        assert!(matches!(
            decoder.decode(b"definitely not msgpack").await,
            Err(CodecError::Decode(_))
        ));
    }
}
