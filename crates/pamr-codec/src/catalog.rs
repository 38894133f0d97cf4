//! Concurrent catalog of the classes an endpoint knows.

use crate::class::ClassDef;
use crate::error::CodecResult;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone)]
struct CatalogEntry {
    def: Arc<ClassDef>,
    /// Where the definition came from. `None` for classes defined locally.
    origin: Option<String>,
}

/// Set of class definitions resolvable without a network round-trip.
///
/// Classes are either defined locally by the application or learned from a
/// remote origin during decoding. Remote classes remember their origin so
/// that re-encoding them points receivers at the endpoint that owns them.
#[derive(Debug, Default)]
pub struct ClassCatalog {
    classes: DashMap<String, CatalogEntry>,
}

impl ClassCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Define a local class, replacing any previous definition of the name.
    pub fn define(&self, def: ClassDef) {
        debug!(class = %def.name, version = def.version, "Defined local class");
        self.classes.insert(
            def.name.clone(),
            CatalogEntry {
                def: Arc::new(def),
                origin: None,
            },
        );
    }

    /// Define a class fetched from `origin`.
    pub fn define_remote(&self, def: ClassDef, origin: &str) {
        debug!(class = %def.name, origin, "Defined remote class");
        self.classes.insert(
            def.name.clone(),
            CatalogEntry {
                def: Arc::new(def),
                origin: Some(origin.to_string()),
            },
        );
    }

    pub fn get(&self, name: &str) -> Option<Arc<ClassDef>> {
        self.classes.get(name).map(|e| Arc::clone(&e.def))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.classes.contains_key(name)
    }

    /// Origin a remote class was fetched from. `None` for local or unknown
    /// classes.
    pub fn origin_of(&self, name: &str) -> Option<String> {
        self.classes.get(name).and_then(|e| e.origin.clone())
    }

    /// Serialized definition of a class, as served to remote endpoints.
    pub fn class_bytes(&self, name: &str) -> Option<CodecResult<Vec<u8>>> {
        self.get(name).map(|def| def.to_bytes())
    }

    pub fn remove(&self, name: &str) -> bool {
        self.classes.remove(name).is_some()
    }

    /// Names of all known classes, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.classes.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_define_and_get() {
        let catalog = ClassCatalog::new();
        assert!(catalog.is_empty());
        catalog.define(ClassDef::new("a.Alpha", 1, &["v"]));
        assert!(catalog.contains("a.Alpha"));
        assert_eq!(catalog.get("a.Alpha").unwrap().version, 1);
        assert!(catalog.origin_of("a.Alpha").is_none());
    }

    #[test]
    fn test_remote_origin_is_remembered() {
        let catalog = ClassCatalog::new();
        catalog.define_remote(ClassDef::new("b.Beta", 3, &[]), "pamr://4200/");
        assert_eq!(catalog.origin_of("b.Beta").as_deref(), Some("pamr://4200/"));
    }

    #[test]
    fn test_class_bytes_and_names() {
        let catalog = ClassCatalog::new();
        catalog.define(ClassDef::new("z.Last", 1, &[]));
        catalog.define(ClassDef::new("a.First", 1, &["f"]));
        assert_eq!(catalog.names(), vec!["a.First", "z.Last"]);

        let bytes = catalog.class_bytes("a.First").unwrap().unwrap();
        assert_eq!(ClassDef::from_bytes(&bytes).unwrap().fields, vec!["f"]);
        assert!(catalog.class_bytes("missing").is_none());

        assert!(catalog.remove("z.Last"));
        assert_eq!(catalog.len(), 1);
    }
}
