//! Object-store boundary.
//!
//! The bot only needs opaque-key blob operations. [`FsObjectStore`] backs a
//! single-host deployment (a web server or CDN origin serves `root`);
//! [`MemoryObjectStore`] is used in development and tests.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use parking_lot::Mutex;

/// Canned access policy for a stored object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acl {
    Private,
    PublicRead,
}

pub type Tags = BTreeMap<String, String>;

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    async fn put(&self, key: &str, data: Vec<u8>, content_type: &str, acl: Acl) -> Result<()>;

    async fn delete_many(&self, keys: &[String]) -> Result<()>;

    async fn copy(&self, src_key: &str, dst_key: &str) -> Result<()>;

    async fn tag(&self, key: &str, tags: Tags) -> Result<()>;

    /// URL of the object at the origin
    fn public_url(&self, key: &str) -> String;

    /// URL of the object through the CDN edge
    fn cdn_url(&self, key: &str) -> String;
}

fn join_url(base: &str, key: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), key.trim_start_matches('/'))
}

#[derive(Debug, Clone)]
struct StoredObject {
    data: Vec<u8>,
    content_type: String,
    acl: Acl,
    tags: Tags,
}

/// In-process object store
pub struct MemoryObjectStore {
    base_url: String,
    objects: Mutex<HashMap<String, StoredObject>>,
}

impl MemoryObjectStore {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            objects: Mutex::new(HashMap::new()),
        }
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.objects.lock().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn tags(&self, key: &str) -> Option<Tags> {
        self.objects.lock().get(key).map(|object| object.tags.clone())
    }

    pub fn metadata(&self, key: &str) -> Option<(String, Acl)> {
        self.objects
            .lock()
            .get(key)
            .map(|object| (object.content_type.clone(), object.acl))
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.objects.lock().get(key).map(|object| object.data.clone()))
    }

    async fn put(&self, key: &str, data: Vec<u8>, content_type: &str, acl: Acl) -> Result<()> {
        self.objects.lock().insert(
            key.to_string(),
            StoredObject {
                data,
                content_type: content_type.to_string(),
                acl,
                tags: Tags::new(),
            },
        );
        Ok(())
    }

    async fn delete_many(&self, keys: &[String]) -> Result<()> {
        let mut objects = self.objects.lock();
        for key in keys {
            objects.remove(key);
        }
        Ok(())
    }

    async fn copy(&self, src_key: &str, dst_key: &str) -> Result<()> {
        let mut objects = self.objects.lock();
        let Some(object) = objects.get(src_key).cloned() else {
            bail!("no such object: {src_key}");
        };
        objects.insert(dst_key.to_string(), object);
        Ok(())
    }

    async fn tag(&self, key: &str, tags: Tags) -> Result<()> {
        match self.objects.lock().get_mut(key) {
            Some(object) => {
                object.tags.extend(tags);
                Ok(())
            }
            None => bail!("no such object: {key}"),
        }
    }

    fn public_url(&self, key: &str) -> String {
        join_url(&self.base_url, key)
    }

    fn cdn_url(&self, key: &str) -> String {
        join_url(&self.base_url, key)
    }
}

/// Object store rooted at a local directory; tags live in `<key>.tags.json`
pub struct FsObjectStore {
    root: PathBuf,
    public_base: String,
    cdn_base: String,
}

impl FsObjectStore {
    pub async fn new(
        root: impl Into<PathBuf>,
        public_base: impl Into<String>,
        cdn_base: impl Into<String>,
    ) -> Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root)
            .await
            .with_context(|| format!("failed to create storage root {}", root.display()))?;
        Ok(Self {
            root,
            public_base: public_base.into(),
            cdn_base: cdn_base.into(),
        })
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key.trim_start_matches('/'));
        if relative
            .components()
            .any(|component| !matches!(component, std::path::Component::Normal(_)))
        {
            bail!("invalid object key: {key}");
        }
        Ok(self.root.join(relative))
    }

    fn tags_path(path: &Path) -> PathBuf {
        let mut name = path.as_os_str().to_os_string();
        name.push(".tags.json");
        PathBuf::from(name)
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("failed to read {}", path.display())),
        }
    }

    async fn put(&self, key: &str, data: Vec<u8>, _content_type: &str, _acl: Acl) -> Result<()> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, data)
            .await
            .with_context(|| format!("failed to write {}", path.display()))
    }

    async fn delete_many(&self, keys: &[String]) -> Result<()> {
        for key in keys {
            let path = self.path_for(key)?;
            for target in [Self::tags_path(&path), path] {
                match tokio::fs::remove_file(&target).await {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => {
                        return Err(e)
                            .with_context(|| format!("failed to delete {}", target.display()));
                    }
                }
            }
        }
        Ok(())
    }

    async fn copy(&self, src_key: &str, dst_key: &str) -> Result<()> {
        let src = self.path_for(src_key)?;
        let dst = self.path_for(dst_key)?;
        if let Some(parent) = dst.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(&src, &dst)
            .await
            .with_context(|| format!("failed to copy {src_key} to {dst_key}"))?;
        Ok(())
    }

    async fn tag(&self, key: &str, tags: Tags) -> Result<()> {
        let path = self.path_for(key)?;
        let tags_path = Self::tags_path(&path);
        let mut existing: Tags = match tokio::fs::read(&tags_path).await {
            Ok(raw) => serde_json::from_slice(&raw).unwrap_or_default(),
            Err(_) => Tags::new(),
        };
        existing.extend(tags);
        tokio::fs::write(&tags_path, serde_json::to_vec(&existing)?).await?;
        Ok(())
    }

    fn public_url(&self, key: &str) -> String {
        join_url(&self.public_base, key)
    }

    fn cdn_url(&self, key: &str) -> String {
        join_url(&self.cdn_base, key)
    }
}
