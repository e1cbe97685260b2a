use std::sync::Arc;

use object_store::gcp::GoogleCloudStorageBuilder;
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::path::Path as ObjectPath;
use object_store::{Attribute, AttributeValue, Attributes, ObjectStore, PutOptions, PutPayload};
use thiserror::Error;
use tracing::{debug, info};

pub const JSON_CONTENT_TYPE: &str = "application/json";
pub const PARQUET_CONTENT_TYPE: &str = "application/vnd.apache.parquet";
pub const AVRO_CONTENT_TYPE: &str = "avro/binary";

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("unsupported storage url {0:?}, expected gs://, file:// or memory://")]
    UnsupportedUrl(String),
    #[error("failed to prepare local storage root: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    ObjectStore(#[from] object_store::Error),
}

/// Builds the object store behind `STORAGE_URL`.
pub fn store_from_url(url: &str) -> Result<Arc<dyn ObjectStore>, StorageError> {
    if let Some(bucket) = url.strip_prefix("gs://") {
        info!("using GCS bucket {}", bucket);
        let store = GoogleCloudStorageBuilder::from_env()
            .with_bucket_name(bucket.trim_end_matches('/'))
            .build()?;
        return Ok(Arc::new(store));
    }

    if let Some(root) = url.strip_prefix("file://") {
        info!("using local storage under {}", root);
        std::fs::create_dir_all(root)?;
        return Ok(Arc::new(LocalFileSystem::new_with_prefix(root)?));
    }

    if url == "memory://" {
        info!("using in-memory storage, objects are lost on exit");
        return Ok(Arc::new(InMemory::new()));
    }

    Err(StorageError::UnsupportedUrl(url.to_owned()))
}

/// Idempotent object writer: a put to an existing key replaces the object.
#[derive(Clone)]
pub struct ObjectSink {
    store: Arc<dyn ObjectStore>,
    base_url: String,
}

impl ObjectSink {
    pub fn new(store: Arc<dyn ObjectStore>, base_url: &str) -> Self {
        Self {
            store,
            base_url: base_url.trim_end_matches('/').to_owned(),
        }
    }

    /// Fully qualified location of a key, as seen by external readers.
    pub fn uri(&self, key: &str) -> String {
        format!("{}/{}", self.base_url, key)
    }

    pub async fn put(
        &self,
        key: &str,
        bytes: Vec<u8>,
        content_type: &'static str,
    ) -> Result<String, StorageError> {
        let path = ObjectPath::from(key);
        let payload = PutPayload::from(bytes);

        let mut attributes = Attributes::new();
        drop(attributes.insert(Attribute::ContentType, AttributeValue::from(content_type)));
        let options = PutOptions {
            attributes,
            ..Default::default()
        };

        match self.store.put_opts(&path, payload.clone(), options).await {
            // Local filesystems cannot store attributes
            Err(object_store::Error::NotImplemented) => {
                drop(self.store.put(&path, payload).await?);
            }
            result => {
                drop(result?);
            }
        }

        debug!("stored {}", path);
        Ok(self.uri(key))
    }
}
