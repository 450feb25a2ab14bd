use std::{fmt, path::Path, sync::Arc};

use async_trait::async_trait;
use bytes::Bytes;
use futures::{StreamExt, TryStreamExt};
use object_store::{
    ClientOptions, ObjectStore, aws::AmazonS3Builder, local::LocalFileSystem,
    memory::InMemory, path::Path as ObjectPath, prefix::PrefixStore,
};
use tracing::debug;

use super::{ByteStream, ObjectStorage, S3StorageConfig};
use crate::error::{Result, VigilError};

/// [`ObjectStorage`] over any `object_store` backend.
#[derive(Clone)]
pub struct ObjectStoreBackend {
    store: Arc<dyn ObjectStore>,
    name: &'static str,
}

impl fmt::Debug for ObjectStoreBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectStoreBackend")
            .field("backend", &self.name)
            .field("store", &self.store.to_string())
            .finish()
    }
}

impl ObjectStoreBackend {
    pub fn new(store: Arc<dyn ObjectStore>, name: &'static str) -> Self {
        Self { store, name }
    }

    /// Filesystem-backed store rooted at `root`, created if missing.
    pub fn local(root: &Path) -> Result<Self> {
        std::fs::create_dir_all(root).map_err(|err| {
            VigilError::internal(format!(
                "failed to create storage root {}: {err}",
                root.display()
            ))
        })?;
        let absolute = root.canonicalize().map_err(|err| {
            VigilError::internal(format!(
                "failed to resolve storage root {}: {err}",
                root.display()
            ))
        })?;
        let store = LocalFileSystem::new_with_prefix(absolute)
            .map_err(|err| VigilError::internal(format!("local store: {err}")))?;
        Ok(Self::new(Arc::new(store), "local"))
    }

    pub fn s3(config: &S3StorageConfig) -> Result<Self> {
        if config.bucket.trim().is_empty() {
            return Err(VigilError::internal("S3 storage requires a bucket"));
        }

        let mut builder = AmazonS3Builder::new()
            .with_bucket_name(&config.bucket)
            .with_region(config.region.as_deref().unwrap_or("us-east-1"));

        if let Some(endpoint) = &config.endpoint {
            // Path-style addressing for MinIO and similar endpoints.
            builder = builder
                .with_endpoint(endpoint)
                .with_virtual_hosted_style_request(false);
        }
        if config.allow_http {
            builder = builder.with_allow_http(true);
        }
        if let Some(key) = &config.access_key_id {
            builder = builder.with_access_key_id(key);
        }
        if let Some(secret) = &config.secret_access_key {
            builder = builder.with_secret_access_key(secret);
        }
        builder = builder.with_client_options(
            ClientOptions::new()
                .with_timeout(config.request_timeout)
                .with_connect_timeout(config.connect_timeout),
        );

        let store = builder
            .build()
            .map_err(|err| VigilError::internal(format!("S3 store: {err}")))?;

        let prefix = config
            .prefix
            .as_deref()
            .map(|p| p.trim_matches('/'))
            .filter(|p| !p.is_empty());
        let store: Arc<dyn ObjectStore> = match prefix {
            Some(prefix) => Arc::new(PrefixStore::new(store, prefix)),
            None => Arc::new(store),
        };
        Ok(Self::new(store, "s3"))
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemory::new()), "memory")
    }
}

fn object_path(key: &str) -> Result<ObjectPath> {
    ObjectPath::parse(key.trim_matches('/')).map_err(|err| {
        VigilError::InvalidRequest(format!("invalid storage key '{key}': {err}"))
    })
}

fn map_store_error(op: &str, key: &str, err: object_store::Error) -> VigilError {
    match err {
        object_store::Error::NotFound { .. } => {
            VigilError::not_found(format!("object '{key}'"))
        }
        other => VigilError::TransientIo(format!("{op} '{key}': {other}")),
    }
}

#[async_trait]
impl ObjectStorage for ObjectStoreBackend {
    async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        let path = object_path(key)?;
        let len = data.len();
        self.store
            .put(&path, data.into())
            .await
            .map_err(|err| map_store_error("put", key, err))?;
        debug!(key, bytes = len, backend = self.name, "stored object");
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Bytes> {
        let path = object_path(key)?;
        let result = self
            .store
            .get(&path)
            .await
            .map_err(|err| map_store_error("get", key, err))?;
        result
            .bytes()
            .await
            .map_err(|err| map_store_error("read", key, err))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = object_path(key)?;
        match self.store.delete(&path).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(err) => Err(map_store_error("delete", key, err)),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let trimmed = prefix.trim_matches('/');
        let prefix_path = if trimmed.is_empty() {
            None
        } else {
            Some(object_path(trimmed)?)
        };

        let mut stream = self.store.list(prefix_path.as_ref());
        let mut keys = Vec::new();
        while let Some(meta) = stream.next().await {
            let meta = meta.map_err(|err| map_store_error("list", prefix, err))?;
            keys.push(meta.location.to_string());
        }
        Ok(keys)
    }

    async fn stream(&self, key: &str) -> Result<ByteStream> {
        let path = object_path(key)?;
        let result = self
            .store
            .get(&path)
            .await
            .map_err(|err| map_store_error("get", key, err))?;
        let owned_key = key.to_string();
        Ok(result
            .into_stream()
            .map_err(move |err| map_store_error("stream", &owned_key, err))
            .boxed())
    }

    fn backend_name(&self) -> &'static str {
        self.name
    }
}

#[cfg(test)]
mod tests {
    use vigil_model::JobId;

    use super::*;
    use crate::storage::{artifact_key, job_prefix};

    async fn exercise(storage: &dyn ObjectStorage) {
        let job = JobId::generate();
        let key = artifact_key(job, "report.jsonl");

        storage
            .put(&key, Bytes::from_static(b"{\"entry_type\":\"init\"}\n"))
            .await
            .unwrap();
        assert_eq!(
            storage.get(&key).await.unwrap(),
            Bytes::from_static(b"{\"entry_type\":\"init\"}\n")
        );

        let streamed: Vec<Bytes> =
            storage.stream(&key).await.unwrap().try_collect().await.unwrap();
        assert_eq!(streamed.concat(), b"{\"entry_type\":\"init\"}\n");

        let listed = storage.list(&job_prefix(job)).await.unwrap();
        assert_eq!(listed, vec![key.clone()]);

        storage.delete(&key).await.unwrap();
        storage.delete(&key).await.unwrap();
        assert!(matches!(
            storage.get(&key).await,
            Err(VigilError::NotFound(_))
        ));
        assert!(storage.list(&job_prefix(job)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn local_backend_satisfies_contract() {
        let dir = tempfile::tempdir().unwrap();
        let backend = ObjectStoreBackend::local(dir.path()).unwrap();
        assert_eq!(backend.backend_name(), "local");
        exercise(&backend).await;
    }

    #[tokio::test]
    async fn memory_backend_satisfies_contract() {
        exercise(&ObjectStoreBackend::in_memory()).await;
    }

    #[tokio::test]
    async fn rejects_traversal_keys() {
        let backend = ObjectStoreBackend::in_memory();
        assert!(matches!(
            backend.get("jobs/../etc/passwd").await,
            Err(VigilError::InvalidRequest(_))
        ));
    }
}
