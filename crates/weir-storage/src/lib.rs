use bytes::Bytes;
use object_store::aws::AmazonS3Builder;
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::path::Path;
use object_store::{ObjectStore, PutPayload};
use regex::{Captures, Regex};
use std::borrow::Cow;
use std::fmt::{Debug, Formatter};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Arc, OnceLock};
use thiserror::Error;
use tracing::{debug, error};

mod retry;

/// A reference-counted reference to a [StorageProvider].
pub type StorageProviderRef = Arc<StorageProvider>;

#[derive(Clone)]
pub struct StorageProvider {
    config: BackendConfig,
    object_store: Arc<dyn ObjectStore>,
    canonical_url: String,
}

impl Debug for StorageProvider {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "StorageProvider<{}>", self.canonical_url)
    }
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("the provided URL is not a valid object store")]
    InvalidUrl,

    #[error("could not instantiate storage from path: {0}")]
    PathError(String),

    #[error("object store error: {0:?}")]
    ObjectStore(#[from] object_store::Error),
}

// S3://mybucket/puppy.jpg
const S3_URL: &str = r"^[sS]3[aA]?://(?P<bucket>[a-z0-9\-\.]+)(/(?P<key>.+))?$";
// unofficial, but convenient -- s3::https://my-endpoint.com:1234/mybucket/puppy.jpg
const S3_ENDPOINT_URL: &str = r"^[sS]3[aA]?::(?<protocol>https?)://(?P<endpoint>[^:/]+):(?<port>\d+)/(?P<bucket>[a-z0-9\-\.]+)(/(?P<key>.+))?$";

// file:///my/path/directory
const FILE_URI: &str = r"^file://(?P<path>.*)$";
// file:/my/path/directory
const FILE_URL: &str = r"^file:(?P<path>.*)$";
// /my/path/directory
const FILE_PATH: &str = r"^/(?P<path>.*)$";

// memory://some/key -- process-local, used for tests and dry runs
const MEMORY_URL: &str = r"^memory://(?P<key>.*)$";

#[derive(Debug, Clone, Hash, PartialEq, Eq, Copy)]
enum Backend {
    S3,
    Local,
    Memory,
}

fn matchers() -> &'static Vec<(Backend, Regex)> {
    static MATCHERS: OnceLock<Vec<(Backend, Regex)>> = OnceLock::new();
    MATCHERS.get_or_init(|| {
        // order matters: the endpoint form must be tried before the plain S3 form, and the
        // file URI before the looser file URL
        [
            (Backend::S3, S3_ENDPOINT_URL),
            (Backend::S3, S3_URL),
            (Backend::Memory, MEMORY_URL),
            (Backend::Local, FILE_URI),
            (Backend::Local, FILE_URL),
            (Backend::Local, FILE_PATH),
        ]
        .into_iter()
        .map(|(backend, pattern)| {
            (
                backend,
                Regex::new(pattern).expect("storage URL patterns are valid regexes"),
            )
        })
        .collect()
    })
}

macro_rules! storage_retry {
    ($e: expr) => {
        $crate::retry!(
            $e,
            10,
            Duration::from_millis(100),
            Duration::from_secs(10),
            |e| error!("Error: {}. Retrying...", e)
        )
    };
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct S3Config {
    endpoint: Option<String>,
    region: Option<String>,
    bucket: String,
    key: Option<Path>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalConfig {
    pub path: String,
    pub key: Option<Path>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryConfig {
    pub key: Option<Path>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendConfig {
    S3(S3Config),
    Local(LocalConfig),
    Memory(MemoryConfig),
}

impl BackendConfig {
    pub fn parse_url(url: &str) -> Result<Self, StorageError> {
        for (backend, regex) in matchers() {
            if let Some(matches) = regex.captures(url) {
                return match backend {
                    Backend::S3 => Self::parse_s3(matches),
                    Backend::Local => Self::parse_local(matches),
                    Backend::Memory => Ok(BackendConfig::Memory(MemoryConfig {
                        key: matches
                            .name("key")
                            .map(|m| m.as_str())
                            .filter(|k| !k.is_empty())
                            .map(Path::from),
                    })),
                };
            }
        }

        Err(StorageError::InvalidUrl)
    }

    fn parse_s3(matches: Captures) -> Result<Self, StorageError> {
        let bucket = matches
            .name("bucket")
            .map(|m| m.as_str().to_string())
            .ok_or(StorageError::InvalidUrl)?;

        let region = std::env::var("AWS_DEFAULT_REGION").ok();

        let endpoint = matches
            .name("endpoint")
            .map(|endpoint| -> Result<String, StorageError> {
                let port = match matches.name("port") {
                    Some(port) => u16::from_str(port.as_str()).map_err(|_| {
                        StorageError::PathError(format!("invalid port: {}", port.as_str()))
                    })?,
                    None => 443,
                };

                let protocol = matches
                    .name("protocol")
                    .map(|p| p.as_str())
                    .unwrap_or("https");

                Ok(format!("{}://{}:{}", protocol, endpoint.as_str(), port))
            })
            .transpose()?
            .or_else(|| std::env::var("AWS_ENDPOINT").ok());

        let key = matches.name("key").map(|m| m.as_str().into());

        Ok(BackendConfig::S3(S3Config {
            endpoint,
            region,
            bucket,
            key,
        }))
    }

    fn parse_local(matches: Captures) -> Result<Self, StorageError> {
        let path = matches
            .name("path")
            .map(|m| m.as_str())
            .ok_or(StorageError::InvalidUrl)?;

        let path = if !path.starts_with('/') {
            PathBuf::from(format!("/{}", path))
        } else {
            PathBuf::from(path)
        };

        let path = path
            .to_str()
            .ok_or_else(|| StorageError::PathError(format!("non-utf8 path {:?}", path)))?
            .to_string();

        Ok(BackendConfig::Local(LocalConfig { path, key: None }))
    }

    fn key(&self) -> Option<&Path> {
        match self {
            BackendConfig::S3(s3) => s3.key.as_ref(),
            BackendConfig::Local(local) => local.key.as_ref(),
            BackendConfig::Memory(memory) => memory.key.as_ref(),
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, BackendConfig::Local { .. })
    }
}

impl StorageProvider {
    pub async fn for_url(url: &str) -> Result<Self, StorageError> {
        let config = BackendConfig::parse_url(url)?;
        debug!(message = "constructing storage provider", url, config = ?config);
        match config {
            BackendConfig::S3(config) => Self::construct_s3(config),
            BackendConfig::Local(config) => Self::construct_local(config).await,
            BackendConfig::Memory(config) => Ok(Self::construct_memory(config)),
        }
    }

    fn construct_s3(config: S3Config) -> Result<Self, StorageError> {
        let mut builder = AmazonS3Builder::from_env().with_bucket_name(&config.bucket);

        if let Some(region) = &config.region {
            builder = builder.with_region(region);
        }

        if let Some(endpoint) = &config.endpoint {
            builder = builder
                .with_endpoint(endpoint)
                .with_virtual_hosted_style_request(false)
                .with_allow_http(true);
        }

        let mut canonical_url = match (&config.region, &config.endpoint) {
            (_, Some(endpoint)) => format!("s3::{}/{}", endpoint, config.bucket),
            (Some(region), _) => format!("https://s3.{}.amazonaws.com/{}", region, config.bucket),
            _ => format!("https://s3.amazonaws.com/{}", config.bucket),
        };
        if let Some(key) = &config.key {
            canonical_url = format!("{}/{}", canonical_url, key);
        }

        let object_store = Arc::new(builder.build()?);

        Ok(Self {
            config: BackendConfig::S3(config),
            object_store,
            canonical_url,
        })
    }

    async fn construct_local(config: LocalConfig) -> Result<Self, StorageError> {
        tokio::fs::create_dir_all(&config.path).await.map_err(|e| {
            StorageError::PathError(format!(
                "failed to create directory {}: {:?}",
                config.path, e
            ))
        })?;

        let object_store = Arc::new(LocalFileSystem::new_with_prefix(&config.path)?);

        let canonical_url = format!("file://{}", config.path);
        Ok(Self {
            config: BackendConfig::Local(config),
            object_store,
            canonical_url,
        })
    }

    fn construct_memory(config: MemoryConfig) -> Self {
        let canonical_url = match &config.key {
            Some(key) => format!("memory://{}", key),
            None => "memory://".to_string(),
        };

        Self {
            config: BackendConfig::Memory(config),
            object_store: Arc::new(InMemory::new()),
            canonical_url,
        }
    }

    pub async fn get(&self, path: impl Into<Path>) -> Result<Bytes, StorageError> {
        let path = path.into();
        let bytes = self
            .object_store
            .get(&self.qualify_path(&path))
            .await?
            .bytes()
            .await?;

        Ok(bytes)
    }

    pub async fn get_if_present(
        &self,
        path: impl Into<Path>,
    ) -> Result<Option<Bytes>, StorageError> {
        let path: Path = path.into();
        match self.object_store.get(&self.qualify_path(&path)).await {
            Ok(obj) => Ok(Some(obj.bytes().await?)),
            Err(object_store::Error::NotFound { .. }) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn exists(&self, path: impl Into<Path>) -> Result<bool, StorageError> {
        let path: Path = path.into();
        match self.object_store.head(&self.qualify_path(&path)).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn put(&self, path: impl Into<Path>, bytes: Vec<u8>) -> Result<(), StorageError> {
        use std::time::Duration;

        let bytes = PutPayload::from(Bytes::from(bytes));
        let path = path.into();
        let path = self.qualify_path(&path);
        debug!(message = "writing object", path = %path, url = self.canonical_url);
        storage_retry!(self.object_store.put(&path, bytes.clone()).await)?;

        Ok(())
    }

    pub async fn delete_if_present(&self, path: impl Into<Path>) -> Result<(), StorageError> {
        let path = path.into();
        let path = self.qualify_path(&path);
        match self.object_store.delete(&path).await {
            Ok(_) => Ok(()),
            Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn qualify_path<'a>(&self, path: &'a Path) -> Cow<'a, Path> {
        match self.config.key() {
            Some(prefix) => Cow::Owned(prefix.parts().chain(path.parts()).collect()),
            None => Cow::Borrowed(path),
        }
    }

    /// Produces a URL representation of this provider that can be handed to other systems.
    pub fn canonical_url(&self) -> &str {
        &self.canonical_url
    }

    pub fn canonical_url_for(&self, path: &str) -> String {
        format!("{}/{}", self.canonical_url.trim_end_matches('/'), path)
    }

    pub fn config(&self) -> &BackendConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use object_store::path::Path;
    use test_case::test_case;

    use crate::{matchers, BackendConfig, LocalConfig, MemoryConfig, S3Config, StorageProvider};

    #[test]
    fn test_regex_compilation() {
        assert_eq!(matchers().len(), 6);
    }

    #[test]
    fn test_s3_configs() {
        std::env::remove_var("AWS_DEFAULT_REGION");
        std::env::remove_var("AWS_ENDPOINT");

        assert_eq!(
            BackendConfig::parse_url("s3://mybucket/puppy.jpg").unwrap(),
            BackendConfig::S3(S3Config {
                endpoint: None,
                region: None,
                bucket: "mybucket".to_string(),
                key: Some("puppy.jpg".into()),
            })
        );

        assert_eq!(
            BackendConfig::parse_url("s3::http://localhost:9000/my-bucket/checkpoints").unwrap(),
            BackendConfig::S3(S3Config {
                endpoint: Some("http://localhost:9000".to_string()),
                region: None,
                bucket: "my-bucket".to_string(),
                key: Some("checkpoints".into()),
            })
        );
    }

    #[test_case("file:///my/path/directory", "/my/path/directory")]
    #[test_case("file:/my/path/directory", "/my/path/directory")]
    #[test_case("/my/path/directory", "/my/path/directory")]
    fn test_local_configs(url: &str, expected: &str) {
        assert_eq!(
            BackendConfig::parse_url(url).unwrap(),
            BackendConfig::Local(LocalConfig {
                path: expected.to_string(),
                key: None,
            })
        );
    }

    #[test]
    fn test_memory_and_invalid_configs() {
        assert_eq!(
            BackendConfig::parse_url("memory://savepoints").unwrap(),
            BackendConfig::Memory(MemoryConfig {
                key: Some("savepoints".into())
            })
        );
        assert!(BackendConfig::parse_url("ftp://nope").is_err());
        assert!(BackendConfig::parse_url("relative/path").is_err());
    }

    #[tokio::test]
    async fn test_local_fs() {
        let dir = tempfile::tempdir().unwrap();
        let storage = StorageProvider::for_url(&format!("file://{}", dir.path().display()))
            .await
            .unwrap();

        let path = Path::from("savepoint-1/_metadata");
        assert!(!storage.exists(path.clone()).await.unwrap());

        storage.put(path.clone(), b"hello".to_vec()).await.unwrap();
        assert!(storage.exists(path.clone()).await.unwrap());
        assert_eq!(&storage.get(path.clone()).await.unwrap()[..], b"hello");
        assert!(dir.path().join("savepoint-1/_metadata").exists());

        storage.delete_if_present(path.clone()).await.unwrap();
        assert!(storage.get_if_present(path.clone()).await.unwrap().is_none());
        storage.delete_if_present(path).await.unwrap();

        assert_eq!(
            storage.canonical_url_for("x"),
            format!("file://{}/x", dir.path().display())
        );
    }

    #[tokio::test]
    async fn test_memory_prefixes_keys() {
        let storage = StorageProvider::for_url("memory://prefix").await.unwrap();
        storage.put("a", vec![1, 2, 3]).await.unwrap();

        let qualified = storage.qualify_path(&Path::from("a")).into_owned();
        assert_eq!(qualified, Path::from("prefix/a"));
        assert_eq!(&storage.get("a").await.unwrap()[..], &[1, 2, 3]);
        assert_eq!(storage.canonical_url_for("a"), "memory://prefix/a");
    }
}
