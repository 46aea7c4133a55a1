//! Document storage
//!
//! Servers and clients persist documents through the [`DocumentStore`]
//! trait. Each instance owns its own store handle; a store shared between
//! connection handlers must tolerate concurrent writes (last writer wins).

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::RwLock;

use super::Document;

/// Default file extension for stored documents
pub const DOT_EXTENSION: &str = "dot";

/// Storage errors
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid document name: {0:?}")]
    InvalidName(String),

    #[error("Document not found: {0}")]
    NotFound(PathBuf),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Persistence collaborator for documents
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Persist a document, returning where it was written
    async fn save(&self, document: &Document) -> StoreResult<PathBuf>;

    /// Read a document from a path; the name is the file stem
    async fn load(&self, path: &Path) -> StoreResult<Document>;

    /// List stored document filenames
    async fn list(&self) -> StoreResult<Vec<String>>;
}

/// Replace path separators so a name can never escape the storage directory
pub fn sanitize_name(name: &str) -> StoreResult<String> {
    let cleaned: String = name
        .chars()
        .map(|c| if matches!(c, '/' | '\\' | '\0') { '_' } else { c })
        .collect();

    if cleaned.is_empty() || cleaned == "." || cleaned == ".." {
        return Err(StoreError::InvalidName(name.to_string()));
    }

    Ok(cleaned)
}

fn name_from_path(path: &Path) -> StoreResult<String> {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .filter(|stem| !stem.is_empty())
        .ok_or_else(|| StoreError::InvalidName(path.display().to_string()))
}

/// Directory-backed store writing `<name>.<ext>` files
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
    extension: String,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            extension: DOT_EXTENSION.to_string(),
        }
    }

    pub fn with_extension(mut self, extension: impl Into<String>) -> Self {
        self.extension = extension.into();
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path a document with this name would be written to
    pub fn path_for(&self, name: &str) -> StoreResult<PathBuf> {
        let name = sanitize_name(name)?;
        Ok(self.dir.join(format!("{}.{}", name, self.extension)))
    }
}

#[async_trait]
impl DocumentStore for FileStore {
    async fn save(&self, document: &Document) -> StoreResult<PathBuf> {
        let path = self.path_for(&document.name)?;
        tokio::fs::create_dir_all(&self.dir).await?;
        tokio::fs::write(&path, document.content.as_bytes()).await?;

        tracing::debug!("Saved '{}' to {}", document.name, path.display());
        Ok(path)
    }

    async fn load(&self, path: &Path) -> StoreResult<Document> {
        let content = match tokio::fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(path.to_path_buf()));
            }
            Err(e) => return Err(e.into()),
        };

        Ok(Document::new(name_from_path(path)?, content))
    }

    async fn list(&self) -> StoreResult<Vec<String>> {
        tokio::fs::create_dir_all(&self.dir).await?;

        let mut names = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == self.extension.as_str()) {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }

        names.sort();
        Ok(names)
    }
}

/// In-memory store, keyed by sanitized name
#[derive(Debug, Default)]
pub struct MemoryStore {
    documents: RwLock<BTreeMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch a stored document by name
    pub async fn get(&self, name: &str) -> Option<Document> {
        let documents = self.documents.read().await;
        documents
            .get(name)
            .map(|content| Document::new(name, content.clone()))
    }

    pub async fn len(&self) -> usize {
        self.documents.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.documents.read().await.is_empty()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn save(&self, document: &Document) -> StoreResult<PathBuf> {
        let name = sanitize_name(&document.name)?;
        let path = PathBuf::from(format!("{}.{}", name, DOT_EXTENSION));

        let mut documents = self.documents.write().await;
        documents.insert(name, document.content.clone());
        Ok(path)
    }

    async fn load(&self, path: &Path) -> StoreResult<Document> {
        let name = name_from_path(path)?;
        self.get(&name)
            .await
            .ok_or_else(|| StoreError::NotFound(path.to_path_buf()))
    }

    async fn list(&self) -> StoreResult<Vec<String>> {
        let documents = self.documents.read().await;
        Ok(documents
            .keys()
            .map(|name| format!("{}.{}", name, DOT_EXTENSION))
            .collect())
    }
}

/// Copy every `*.dot` file from `samples_dir` into an empty store.
///
/// Returns how many samples were stored. A store that already holds
/// documents, or a missing samples directory, seeds nothing.
pub async fn seed_samples(store: &dyn DocumentStore, samples_dir: &Path) -> StoreResult<usize> {
    if !store.list().await?.is_empty() {
        return Ok(0);
    }

    let mut entries = match tokio::fs::read_dir(samples_dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            tracing::debug!("No samples directory at {}", samples_dir.display());
            return Ok(0);
        }
        Err(e) => return Err(e.into()),
    };

    let mut seeded = 0;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().map_or(true, |ext| ext != DOT_EXTENSION) {
            continue;
        }

        // A file that cannot be read as a sample is skipped, not fatal
        let document = match FileStore::new(samples_dir).load(&path).await {
            Ok(document) => document,
            Err(e) => {
                tracing::warn!("Skipping sample {}: {}", path.display(), e);
                continue;
            }
        };

        store.save(&document).await?;
        tracing::info!("Loaded sample document: {}", document.name);
        seeded += 1;
    }

    Ok(seeded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_sanitize_name() {
        assert_eq!(sanitize_name("g1").unwrap(), "g1");
        assert_eq!(sanitize_name("../etc/passwd").unwrap(), ".._etc_passwd");
        assert_eq!(sanitize_name("a\\b").unwrap(), "a_b");
        assert!(sanitize_name("").is_err());
        assert!(sanitize_name("..").is_err());
    }

    #[tokio::test]
    async fn test_file_store_save_creates_directory() {
        let tmp = TempDir::new().unwrap();
        let store = FileStore::new(tmp.path().join("nested/storage"));

        let path = store.save(&Document::new("g1", "digraph {A->B}")).await.unwrap();

        assert_eq!(path, tmp.path().join("nested/storage/g1.dot"));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "digraph {A->B}");
    }

    #[tokio::test]
    async fn test_file_store_load_uses_file_stem() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("network.dot");
        std::fs::write(&path, "graph N { a -- b }").unwrap();

        let store = FileStore::new(tmp.path());
        let doc = store.load(&path).await.unwrap();
        assert_eq!(doc, Document::new("network", "graph N { a -- b }"));

        let missing = store.load(&tmp.path().join("absent.dot")).await;
        assert!(matches!(missing, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_file_store_list_filters_extension() {
        let tmp = TempDir::new().unwrap();
        let store = FileStore::new(tmp.path().join("store"));
        assert!(store.list().await.unwrap().is_empty());

        store.save(&Document::new("b", "graph {}")).await.unwrap();
        store.save(&Document::new("a", "graph {}")).await.unwrap();
        std::fs::write(tmp.path().join("store/notes.txt"), "ignored").unwrap();

        assert_eq!(store.list().await.unwrap(), vec!["a.dot", "b.dot"]);
    }

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemoryStore::new();
        store.save(&Document::new("g", "graph {}")).await.unwrap();
        store.save(&Document::new("g", "graph { x }")).await.unwrap();

        assert_eq!(store.len().await, 1);
        assert_eq!(store.get("g").await.unwrap().content, "graph { x }");
        assert_eq!(
            store.load(Path::new("/elsewhere/g.dot")).await.unwrap(),
            Document::new("g", "graph { x }")
        );
        assert_eq!(store.list().await.unwrap(), vec!["g.dot"]);
    }

    #[tokio::test]
    async fn test_seed_samples_only_into_empty_store() {
        let samples = TempDir::new().unwrap();
        std::fs::write(samples.path().join("one.dot"), "digraph { 1 }").unwrap();
        std::fs::write(samples.path().join("two.dot"), "digraph { 2 }").unwrap();
        std::fs::write(samples.path().join("readme.md"), "not a graph").unwrap();

        let store = MemoryStore::new();
        assert_eq!(seed_samples(&store, samples.path()).await.unwrap(), 2);
        assert_eq!(store.get("two").await.unwrap().content, "digraph { 2 }");

        // Already populated
        assert_eq!(seed_samples(&store, samples.path()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_seed_samples_missing_directory() {
        let store = MemoryStore::new();
        let seeded = seed_samples(&store, Path::new("/nonexistent/samples")).await.unwrap();
        assert_eq!(seeded, 0);
        assert!(store.is_empty().await);
    }
}
