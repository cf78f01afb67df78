//! Object-store upload client for calculation inputs.
//!
//! The adaptor needs exactly one capability: `upload(path) -> url`. The
//! default implementation targets an OSS-style HTTPS gateway; credential
//! provisioning beyond the four environment variables is out of scope.

use std::path::Path;

use super::AdaptorError;

/// Environment variables the uploader reads once at construction.
pub const ENV_ENDPOINT: &str = "OSS_ENDPOINT";
pub const ENV_BUCKET: &str = "OSS_BUCKET_NAME";
pub const ENV_ACCESS_KEY_ID: &str = "OSS_ACCESS_KEY_ID";
pub const ENV_ACCESS_KEY_SECRET: &str = "OSS_ACCESS_KEY_SECRET";

const OBJECT_PREFIX: &str = "matforge/calculation";

/// Uploads a local file and returns its public URL.
///
/// Runs on the blocking caller side (the adaptor resolves arguments before
/// the call is submitted to the tool loop), so implementations are
/// synchronous.
pub trait ObjectStore: Send + Sync {
    fn upload(&self, path: &Path) -> Result<String, AdaptorError>;
}

/// OSS-style uploader: PUT to `https://{bucket}.{host}/{key}` where the key
/// is `matforge/calculation/{unix_ts}_{filename}`.
#[derive(Debug)]
pub struct OssUploader {
    endpoint: String,
    bucket: String,
    access_key_id: String,
    #[allow(dead_code)]
    access_key_secret: String,
}

impl OssUploader {
    /// Reads the `OSS_*` environment; any missing variable is a credentials
    /// error, raised here so the first upload cannot half-succeed.
    pub fn from_env() -> Result<Self, AdaptorError> {
        let read = |key: &str| {
            std::env::var(key)
                .ok()
                .filter(|v| !v.trim().is_empty())
                .ok_or_else(|| {
                    AdaptorError::Credentials(format!(
                        "{} not set; calculation uploads need {}, {}, {}, {}",
                        key, ENV_ENDPOINT, ENV_BUCKET, ENV_ACCESS_KEY_ID, ENV_ACCESS_KEY_SECRET
                    ))
                })
        };
        Ok(Self {
            endpoint: read(ENV_ENDPOINT)?,
            bucket: read(ENV_BUCKET)?,
            access_key_id: read(ENV_ACCESS_KEY_ID)?,
            access_key_secret: read(ENV_ACCESS_KEY_SECRET)?,
        })
    }

    fn host(&self) -> String {
        self.endpoint
            .trim_start_matches("https://")
            .trim_start_matches("http://")
            .split('/')
            .next()
            .unwrap_or_default()
            .to_string()
    }

    fn object_url(&self, key: &str) -> String {
        format!("https://{}.{}/{}", self.bucket, self.host(), key)
    }
}

impl ObjectStore for OssUploader {
    fn upload(&self, path: &Path) -> Result<String, AdaptorError> {
        let data = std::fs::read(path).map_err(|e| AdaptorError::Upload(format!(
            "read {}: {}",
            path.display(),
            e
        )))?;
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "upload.bin".into());
        let key = format!(
            "{}/{}_{}",
            OBJECT_PREFIX,
            chrono::Utc::now().timestamp(),
            filename
        );
        let url = self.object_url(&key);

        let response = ureq::put(&url)
            .header("x-oss-access-key-id", &self.access_key_id)
            .send(data.as_slice())
            .map_err(|e| {
                AdaptorError::Upload(format!(
                    "upload {} failed: {}; check {} / {} and bucket permissions",
                    path.display(),
                    e,
                    ENV_ENDPOINT,
                    ENV_BUCKET
                ))
            })?;
        if !response.status().is_success() {
            return Err(AdaptorError::Upload(format!(
                "upload {} failed: HTTP {}",
                path.display(),
                response.status()
            )));
        }
        tracing::debug!("uploaded {} -> {}", path.display(), url);
        Ok(url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_url_uses_bucket_subdomain() {
        let uploader = OssUploader {
            endpoint: "https://oss-cn-example.aliyuncs.com/extra".into(),
            bucket: "mybucket".into(),
            access_key_id: "id".into(),
            access_key_secret: "secret".into(),
        };
        assert_eq!(
            uploader.object_url("matforge/calculation/1_x.cif"),
            "https://mybucket.oss-cn-example.aliyuncs.com/matforge/calculation/1_x.cif"
        );
    }

    #[test]
    fn from_env_missing_variable_is_credentials_error() {
        let prev: Vec<(&str, Option<String>)> =
            [ENV_ENDPOINT, ENV_BUCKET, ENV_ACCESS_KEY_ID, ENV_ACCESS_KEY_SECRET]
                .iter()
                .map(|k| (*k, std::env::var(k).ok()))
                .collect();
        for (k, _) in &prev {
            std::env::remove_var(k);
        }

        let err = OssUploader::from_env().unwrap_err();
        assert!(matches!(err, AdaptorError::Credentials(_)));

        for (k, v) in prev {
            if let Some(v) = v {
                std::env::set_var(k, v);
            }
        }
    }
}
