// Copyright 2024-2025 Tree xie.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use crate::metrics::{Stage, Stats};
use crate::util;
use arc_swap::ArcSwap;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use snafu::Snafu;
use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tracing::{error, info};

pub static LOG_CATEGORY: &str = "config";

pub static PRODUCTION_DIRECTORY_URL: &str =
    "https://acme-v02.api.letsencrypt.org/directory";
pub static STAGING_DIRECTORY_URL: &str =
    "https://acme-staging-v02.api.letsencrypt.org/directory";

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Io error {source}, {file}"))]
    Io {
        source: std::io::Error,
        file: String,
    },
    #[snafu(display("Json de error {source}"))]
    Json { source: serde_json::Error },
    #[snafu(display("{message}"))]
    Invalid { message: String },
    #[snafu(display("same hash as last read config file"))]
    SameHash,
}

type Result<T, E = Error> = std::result::Result<T, E>;

/// Identifies a secret by namespace and name, unique across the config.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SecretName {
    pub namespace: String,
    pub name: String,
}

impl fmt::Display for SecretName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.namespace, self.name)
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Deserialize)]
pub struct SecretConf {
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub domains: Vec<String>,
    /// Request an RSA-2048 certificate key instead of ECDSA P-256.
    #[serde(default)]
    pub use_rsa: bool,
}

impl SecretConf {
    pub fn full_name(&self) -> SecretName {
        SecretName {
            namespace: self.namespace.clone(),
            name: self.name.clone(),
        }
    }
}

fn default_check_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_start_renew() -> Duration {
    // three weeks
    Duration::from_secs(3 * 7 * 24 * 3600)
}

#[derive(Debug, Default, Clone, Deserialize)]
pub struct AppConf {
    #[serde(default)]
    pub email: String,
    /// Required tri-state: absent is a validation error, `true` selects the
    /// production directory, `false` the staging one.
    #[serde(default)]
    pub use_prod: Option<bool>,
    #[serde(default)]
    pub allow_remote_debug: bool,
    /// Directory holding `tls.crt`/`tls.key` for the HTTPS listener. Empty
    /// disables HTTPS.
    #[serde(default)]
    pub tls_dir: String,
    #[serde(default = "default_check_interval", with = "humantime_serde")]
    pub config_check_interval: Duration,
    #[serde(default = "default_start_renew", with = "humantime_serde")]
    pub start_renew_duration: Duration,
    #[serde(default)]
    pub secrets: Vec<SecretConf>,
}

impl AppConf {
    pub fn directory_url(&self) -> &'static str {
        if self.use_prod.unwrap_or_default() {
            PRODUCTION_DIRECTORY_URL
        } else {
            STAGING_DIRECTORY_URL
        }
    }
}

fn unmarshal_conf(data: &[u8]) -> Result<AppConf> {
    let mut conf: AppConf =
        serde_json::from_slice(data).map_err(|e| Error::Json { source: e })?;
    // a zero duration means unset
    if conf.config_check_interval.is_zero() {
        conf.config_check_interval = default_check_interval();
    }
    if conf.start_renew_duration.is_zero() {
        conf.start_renew_duration = default_start_renew();
    }
    Ok(conf)
}

fn validate_conf(conf: &mut AppConf) -> Result<()> {
    if conf.email.is_empty() {
        return Err(Error::Invalid {
            message: "'email' must be set in the config file".to_string(),
        });
    }
    if conf.use_prod.is_none() {
        return Err(Error::Invalid {
            message: "'use_prod' must be set to `false` or `true`. `false` \
                means use the staging Let's Encrypt API (which has untrusted \
                certs and higher rate limits), and `true` means use the \
                production Let's Encrypt API with working certs but much \
                lower rate limits"
                .to_string(),
        });
    }
    let mut seen = HashSet::new();
    for (i, secret) in conf.secrets.iter_mut().enumerate() {
        if secret.name.is_empty() {
            return Err(Error::Invalid {
                message: format!(
                    "no Name given for secret config at index {i} in \"secrets\""
                ),
            });
        }
        if secret.namespace.is_empty() {
            return Err(Error::Invalid {
                message: format!(
                    "no Namespace given for secret config at index {i} in \"secrets\""
                ),
            });
        }
        if !seen.insert(secret.full_name()) {
            return Err(Error::Invalid {
                message: format!("duplicate config for secret {}", secret.name),
            });
        }
        if secret.domains.is_empty() {
            return Err(Error::Invalid {
                message: format!("no domains given for secret {}", secret.name),
            });
        }
        for (j, domain) in secret.domains.iter_mut().enumerate() {
            let trimmed = domain.trim();
            if trimmed.is_empty() {
                return Err(Error::Invalid {
                    message: format!(
                        "empty string in domains of secret config at index {j} in \"secrets\""
                    ),
                });
            }
            *domain = trimmed.to_string();
        }
    }
    Ok(())
}

struct LoaderState {
    last_hash: Option<[u8; 32]>,
}

/// Loads and revalidates the config file, publishing accepted snapshots
/// atomically. A reload is skipped when the file bytes hash to the last
/// accepted value.
///
/// The first load happens in the constructor so a broken config file fails
/// the boot instead of being silently swallowed by the watch loop.
pub struct ConfLoader {
    path: PathBuf,
    stats: Arc<Stats>,
    current: ArcSwap<AppConf>,
    // serializes file reads and guards last_hash together with the snapshot
    // swap, so two concurrent loads cannot publish out of order
    state: tokio::sync::Mutex<LoaderState>,
}

impl ConfLoader {
    pub async fn new(
        path: impl Into<PathBuf>,
        stats: Arc<Stats>,
    ) -> Result<(Arc<ConfLoader>, Arc<AppConf>)> {
        let loader = Arc::new(ConfLoader {
            path: path.into(),
            stats: stats.clone(),
            current: ArcSwap::from_pointee(AppConf::default()),
            state: tokio::sync::Mutex::new(LoaderState { last_hash: None }),
        });
        match loader.load().await {
            Ok(()) => {
                stats.success(Stage::LoadConfig);
                let conf = loader.get();
                Ok((loader, conf))
            },
            Err(e) => {
                stats.error(Stage::LoadConfig);
                Err(e)
            },
        }
    }

    /// Atomic snapshot of the most recently accepted config. Callers keep the
    /// returned `Arc` for the whole operation and treat it as immutable.
    pub fn get(&self) -> Arc<AppConf> {
        self.current.load().clone()
    }

    async fn load(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        self.stats.config_checked(util::now_sec());
        let data = fs::read(&self.path).await.map_err(|e| Error::Io {
            source: e,
            file: self.path.to_string_lossy().to_string(),
        })?;

        let hash: [u8; 32] = Sha256::digest(&data).into();
        if state.last_hash == Some(hash) {
            return Err(Error::SameHash);
        }

        let mut conf = unmarshal_conf(&data)?;
        validate_conf(&mut conf)?;

        self.current.store(Arc::new(conf));
        state.last_hash = Some(hash);
        self.stats.config_changed(util::now_sec());
        Ok(())
    }

    /// Blocks until a changed config file loads and validates successfully,
    /// then returns the new snapshot. Read, parse and validation errors as
    /// well as the unchanged-hash case are recorded and retried on the next
    /// check interval instead of being surfaced.
    pub async fn watch(&self) -> Arc<AppConf> {
        let mut prev_err: Option<Error> = None;
        loop {
            self.stats.attempt(Stage::LoadConfig);
            let result = self.load().await;
            let conf = self.get();
            match result {
                Ok(()) => {
                    if prev_err.is_some() {
                        info!(
                            category = LOG_CATEGORY,
                            "previous config file error resolved and load was successful"
                        );
                    }
                    self.stats.success(Stage::LoadConfig);
                    return self.get();
                },
                Err(Error::SameHash) => {
                    if prev_err.is_none() {
                        // the good config stayed in place
                        self.stats.success(Stage::LoadConfig);
                    } else {
                        // the bad config stayed in place; bump the stat but
                        // keep the log quiet
                        self.stats.error(Stage::LoadConfig);
                    }
                },
                Err(e) => {
                    error!(
                        category = LOG_CATEGORY,
                        error = e.to_string(),
                        "unable to load config file in watch loop"
                    );
                    self.stats.error(Stage::LoadConfig);
                    prev_err = Some(e);
                },
            }
            tokio::time::sleep(conf.config_check_interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn new_conf_file(data: &str) -> NamedTempFile {
        let mut file = NamedTempFile::with_suffix(".json").unwrap();
        file.write_all(data.as_bytes()).unwrap();
        file
    }

    fn new_stats() -> Arc<Stats> {
        Arc::new(Stats::new().unwrap())
    }

    static GOLDEN_CONF: &str = r#"{
  "email": "fake@example.com",
  "use_prod": true,
  "allow_remote_debug": true,
  "config_check_interval": "3m",
  "start_renew_duration": "3h",
  "secrets": [
    {
      "namespace": "default",
      "name": "test",
      "domains": ["example.com"]
    },
    {
      "namespace": "default",
      "name": "missingtest",
      "use_rsa": true,
      "domains": ["www.example.com", "alt.example.com"]
    },
    {
      "namespace": "staging",
      "name": "missingtest",
      "domains": ["test.example.com"]
    }
  ]
}"#;

    #[tokio::test]
    async fn test_load_golden_path() {
        let file = new_conf_file(GOLDEN_CONF);
        let (loader, conf) =
            ConfLoader::new(file.path(), new_stats()).await.unwrap();
        assert_eq!(
            true,
            Arc::ptr_eq(&conf, &loader.get()),
            "constructor and get should return the same snapshot"
        );

        assert_eq!("fake@example.com", conf.email);
        assert_eq!(Some(true), conf.use_prod);
        assert_eq!(true, conf.allow_remote_debug);
        assert_eq!(Duration::from_secs(3 * 60), conf.config_check_interval);
        assert_eq!(Duration::from_secs(3 * 3600), conf.start_renew_duration);

        let expected = vec![
            SecretConf {
                namespace: "default".to_string(),
                name: "test".to_string(),
                domains: vec!["example.com".to_string()],
                use_rsa: false,
            },
            SecretConf {
                namespace: "default".to_string(),
                name: "missingtest".to_string(),
                domains: vec![
                    "www.example.com".to_string(),
                    "alt.example.com".to_string(),
                ],
                use_rsa: true,
            },
            SecretConf {
                namespace: "staging".to_string(),
                name: "missingtest".to_string(),
                domains: vec!["test.example.com".to_string()],
                use_rsa: false,
            },
        ];
        assert_eq!(expected, conf.secrets);
        assert_eq!(PRODUCTION_DIRECTORY_URL, conf.directory_url());
    }

    #[tokio::test]
    async fn test_load_default_durations() {
        let file = new_conf_file(
            r#"{
  "email": "fake@example.com",
  "use_prod": false,
  "secrets": [
    {"namespace": "default", "name": "test", "domains": ["example.com"]}
  ]
}"#,
        );
        let (_, conf) = ConfLoader::new(file.path(), new_stats()).await.unwrap();
        assert_eq!(Duration::from_secs(30), conf.config_check_interval);
        assert_eq!(Duration::from_secs(504 * 3600), conf.start_renew_duration);
        assert_eq!(STAGING_DIRECTORY_URL, conf.directory_url());
    }

    #[tokio::test]
    async fn test_disallow_empty_namespace() {
        let file = new_conf_file(
            r#"{
  "email": "fake@example.com",
  "use_prod": false,
  "secrets": [
    {"namespace": "", "name": "test", "domains": ["example.com"]}
  ]
}"#,
        );
        let err = ConfLoader::new(file.path(), new_stats())
            .await
            .err()
            .unwrap();
        assert_eq!(
            "no Namespace given for secret config at index 0 in \"secrets\"",
            err.to_string()
        );
    }

    #[tokio::test]
    async fn test_disallow_missing_use_prod() {
        let file = new_conf_file(
            r#"{
  "email": "fake@example.com",
  "secrets": [
    {"namespace": "default", "name": "test", "domains": ["example.com"]}
  ]
}"#,
        );
        let result = ConfLoader::new(file.path(), new_stats()).await;
        assert_eq!(true, result.is_err());
    }

    #[tokio::test]
    async fn test_disallow_duplicate_secret() {
        let file = new_conf_file(
            r#"{
  "email": "fake@example.com",
  "use_prod": false,
  "secrets": [
    {"namespace": "default", "name": "test", "domains": ["example.com"]},
    {"namespace": "default", "name": "test", "domains": ["www.example.com"]}
  ]
}"#,
        );
        let err = ConfLoader::new(file.path(), new_stats())
            .await
            .err()
            .unwrap();
        assert_eq!("duplicate config for secret test", err.to_string());
    }

    #[tokio::test]
    async fn test_domains_are_trimmed() {
        let file = new_conf_file(
            r#"{
  "email": "fake@example.com",
  "use_prod": false,
  "secrets": [
    {"namespace": "default", "name": "test", "domains": [" example.com "]}
  ]
}"#,
        );
        let (_, conf) = ConfLoader::new(file.path(), new_stats()).await.unwrap();
        assert_eq!(vec!["example.com".to_string()], conf.secrets[0].domains);
    }

    #[tokio::test]
    async fn test_duration_must_be_string() {
        let file = new_conf_file(
            r#"{
  "email": "fake@example.com",
  "use_prod": false,
  "config_check_interval": 30,
  "secrets": [
    {"namespace": "default", "name": "test", "domains": ["example.com"]}
  ]
}"#,
        );
        let result = ConfLoader::new(file.path(), new_stats()).await;
        assert_eq!(true, result.is_err());
    }

    #[tokio::test]
    async fn test_same_hash_skips_reload() {
        let file = new_conf_file(GOLDEN_CONF);
        let (loader, conf) =
            ConfLoader::new(file.path(), new_stats()).await.unwrap();

        let err = loader.load().await.err().unwrap();
        assert_eq!(true, matches!(err, Error::SameHash));
        // the snapshot was not replaced
        assert_eq!(true, Arc::ptr_eq(&conf, &loader.get()));
    }

    #[test]
    fn test_secret_name_display() {
        let name = SecretName {
            namespace: "default".to_string(),
            name: "test".to_string(),
        };
        assert_eq!("default:test", name.to_string());
    }
}
