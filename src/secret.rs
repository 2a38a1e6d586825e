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

use crate::acme::NewCertificate;
use crate::config::{SecretConf, SecretName};
use crate::metrics::Stats;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use http::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::json;
use snafu::Snafu;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use x509_parser::pem::Pem;
use x509_parser::prelude::{FromDer, GeneralName, X509Certificate};
use x509_parser::public_key::PublicKey;

pub static LOG_CATEGORY: &str = "secret";

static TLS_CERT_KEY: &str = "tls.crt";
static TLS_KEY_KEY: &str = "tls.key";

static SERVICE_ACCOUNT_TOKEN_FILE: &str =
    "/var/run/secrets/kubernetes.io/serviceaccount/token";
static SERVICE_ACCOUNT_CA_FILE: &str =
    "/var/run/secrets/kubernetes.io/serviceaccount/ca.crt";

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Http error {source}, category: {category}"))]
    Http {
        category: String,
        source: reqwest::Error,
    },
    #[snafu(display("Secret store responded {status}, {message}"))]
    Api { status: u16, message: String },
    #[snafu(display("Io error {source}, {file}"))]
    Io {
        source: std::io::Error,
        file: String,
    },
    #[snafu(display("Invalid error {message}"))]
    Invalid { message: String },
}

type Result<T, E = Error> = std::result::Result<T, E>;

/// Wire form of a Kubernetes Secret. Everything this process does not touch
/// (labels, annotations, resourceVersion, unrelated data keys) rides along
/// untouched so updates never clobber foreign fields.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct Secret {
    #[serde(default)]
    pub metadata: serde_json::Value,
    /// Data values stay base64 encoded exactly as the API serves them.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub data: BTreeMap<String, String>,
    #[serde(
        rename = "type",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub secret_type: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Backend operations against the secret store, injected so tests run against
/// an in-memory map instead of a cluster.
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// `Ok(None)` when the secret does not exist; other failures are errors.
    async fn get(&self, namespace: &str, name: &str)
        -> Result<Option<Secret>>;
    async fn create(&self, namespace: &str, secret: &Secret) -> Result<()>;
    async fn update(&self, namespace: &str, secret: &Secret) -> Result<()>;
}

/// Public key algorithm of a leaf certificate, only as precise as the refresh
/// decision needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyAlg {
    Rsa,
    Ec,
    Other,
}

/// Parsed view of the leaf certificate stored under `tls.crt`.
#[derive(Debug, Clone)]
pub struct LeafCert {
    pub common_name: String,
    pub dns_names: Vec<String>,
    pub not_before: i64,
    pub not_after: i64,
    pub issuer: String,
    pub key_alg: KeyAlg,
}

/// A fetched secret plus the parsed leaf, if one could be extracted.
#[derive(Debug, Clone)]
pub struct TlsSecret {
    pub secret: Secret,
    pub leaf: Option<LeafCert>,
}

fn leaf_from_x509(x509: &X509Certificate) -> LeafCert {
    let common_name = x509
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .unwrap_or_default()
        .to_string();
    let mut dns_names = vec![];
    if let Ok(Some(san)) = x509.subject_alternative_name() {
        for item in san.value.general_names.iter() {
            if let GeneralName::DNSName(name) = item {
                dns_names.push(name.to_string());
            }
        }
    }
    let key_alg = match x509.public_key().parsed() {
        Ok(PublicKey::RSA(_)) => KeyAlg::Rsa,
        Ok(PublicKey::EC(_)) => KeyAlg::Ec,
        _ => KeyAlg::Other,
    };
    let validity = x509.validity();
    LeafCert {
        common_name,
        dns_names,
        not_before: validity.not_before.timestamp(),
        not_after: validity.not_after.timestamp(),
        issuer: x509.issuer().to_string(),
        key_alg,
    }
}

/// Picks the first non-CA certificate of the PEM chain. People store chains
/// in all sorts of orders, and some secrets hold nothing but CA certs; both
/// cases yield `None` so the reconciler treats the secret as refreshable
/// instead of failing the tick.
pub fn parse_leaf_cert(pem_data: &[u8]) -> Option<LeafCert> {
    for pem in Pem::iter_from_buffer(pem_data) {
        let Ok(pem) = pem else {
            debug!(category = LOG_CATEGORY, "invalid pem block in tls.crt");
            return None;
        };
        let Ok((_, x509)) = X509Certificate::from_der(&pem.contents) else {
            debug!(category = LOG_CATEGORY, "unparseable certificate in tls.crt");
            return None;
        };
        let is_ca = x509
            .basic_constraints()
            .ok()
            .flatten()
            .map(|ext| ext.value.ca)
            .unwrap_or_default();
        if !is_ca {
            return Some(leaf_from_x509(&x509));
        }
    }
    None
}

/// Reads and writes TLS secrets through a [`SecretStore`], translating
/// between the wire record and the reconciler's snapshot view.
pub struct SecretAdapter {
    store: Arc<dyn SecretStore>,
    stats: Arc<Stats>,
}

impl SecretAdapter {
    pub fn new(store: Arc<dyn SecretStore>, stats: Arc<Stats>) -> Self {
        Self { store, stats }
    }

    /// Fetches a secret snapshot. A missing secret maps to `Ok(None)`; a
    /// secret without (or with unusable) certificate data maps to a snapshot
    /// with no leaf, which lets the reconciler overwrite it.
    pub async fn fetch(&self, name: &SecretName) -> Result<Option<TlsSecret>> {
        let Some(secret) =
            self.store.get(&name.namespace, &name.name).await?
        else {
            return Ok(None);
        };
        let leaf = secret
            .data
            .get(TLS_CERT_KEY)
            .and_then(|value| STANDARD.decode(value).ok())
            .and_then(|pem| parse_leaf_cert(&pem));
        Ok(Some(TlsSecret { secret, leaf }))
    }

    /// Persists a freshly issued certificate. With no prior record a new
    /// secret carrying only the TLS keys is created; otherwise the old record
    /// is copied and exactly `tls.crt`/`tls.key` are overwritten.
    pub async fn store(
        &self,
        conf: &SecretConf,
        old: Option<&Secret>,
        cert: &NewCertificate,
    ) -> Result<()> {
        let chain = STANDARD.encode(&cert.chain_pem);
        let key = STANDARD.encode(&cert.key_pem);
        match old {
            None => {
                let mut secret = Secret {
                    metadata: json!({"name": conf.name}),
                    ..Default::default()
                };
                secret.data.insert(TLS_CERT_KEY.to_string(), chain);
                secret.data.insert(TLS_KEY_KEY.to_string(), key);
                self.store.create(&conf.namespace, &secret).await?;
                self.stats.secret_created();
            },
            Some(old) => {
                let mut secret = old.clone();
                secret.data.insert(TLS_CERT_KEY.to_string(), chain);
                secret.data.insert(TLS_KEY_KEY.to_string(), key);
                self.store.update(&conf.namespace, &secret).await?;
                self.stats.secret_updated();
            },
        }
        Ok(())
    }
}

/// Talks to the Kubernetes API from inside the cluster using the mounted
/// service account: bearer token plus the cluster CA bundle.
pub struct KubeClient {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

impl KubeClient {
    pub fn new_in_cluster() -> Result<KubeClient> {
        let host = std::env::var("KUBERNETES_SERVICE_HOST").map_err(|_| {
            Error::Invalid {
                message: "KUBERNETES_SERVICE_HOST is not set, not running in a cluster"
                    .to_string(),
            }
        })?;
        let port = std::env::var("KUBERNETES_SERVICE_PORT")
            .unwrap_or_else(|_| "443".to_string());
        let token = std::fs::read_to_string(SERVICE_ACCOUNT_TOKEN_FILE)
            .map_err(|e| Error::Io {
                source: e,
                file: SERVICE_ACCOUNT_TOKEN_FILE.to_string(),
            })?;
        let ca = std::fs::read(SERVICE_ACCOUNT_CA_FILE).map_err(|e| {
            Error::Io {
                source: e,
                file: SERVICE_ACCOUNT_CA_FILE.to_string(),
            }
        })?;
        let ca = reqwest::Certificate::from_pem(&ca).map_err(|e| {
            Error::Http {
                category: "ca_bundle".to_string(),
                source: e,
            }
        })?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(20))
            .add_root_certificate(ca)
            .build()
            .map_err(|e| Error::Http {
                category: "client_build".to_string(),
                source: e,
            })?;
        Ok(KubeClient {
            client,
            base_url: format!("https://{host}:{port}"),
            token: token.trim().to_string(),
        })
    }

    fn secrets_url(&self, namespace: &str, name: Option<&str>) -> String {
        match name {
            Some(name) => format!(
                "{}/api/v1/namespaces/{namespace}/secrets/{name}",
                self.base_url
            ),
            None => format!(
                "{}/api/v1/namespaces/{namespace}/secrets",
                self.base_url
            ),
        }
    }

    async fn fail_from(&self, resp: reqwest::Response) -> Error {
        let status = resp.status().as_u16();
        let message = resp.text().await.unwrap_or_default();
        Error::Api { status, message }
    }
}

#[async_trait]
impl SecretStore for KubeClient {
    async fn get(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Secret>> {
        let resp = self
            .client
            .get(self.secrets_url(namespace, Some(name)))
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| Error::Http {
                category: "get_secret".to_string(),
                source: e,
            })?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Err(self.fail_from(resp).await);
        }
        let secret = resp.json::<Secret>().await.map_err(|e| Error::Http {
            category: "get_secret_body".to_string(),
            source: e,
        })?;
        Ok(Some(secret))
    }

    async fn create(&self, namespace: &str, secret: &Secret) -> Result<()> {
        let resp = self
            .client
            .post(self.secrets_url(namespace, None))
            .bearer_auth(&self.token)
            .json(secret)
            .send()
            .await
            .map_err(|e| Error::Http {
                category: "create_secret".to_string(),
                source: e,
            })?;
        if !resp.status().is_success() {
            return Err(self.fail_from(resp).await);
        }
        Ok(())
    }

    async fn update(&self, namespace: &str, secret: &Secret) -> Result<()> {
        let name = secret
            .metadata
            .get("name")
            .and_then(|value| value.as_str())
            .ok_or_else(|| Error::Invalid {
                message: "secret metadata has no name".to_string(),
            })?
            .to_string();
        let resp = self
            .client
            .put(self.secrets_url(namespace, Some(&name)))
            .bearer_auth(&self.token)
            .json(secret)
            .send()
            .await
            .map_err(|e| Error::Http {
                category: "update_secret".to_string(),
                source: e,
            })?;
        if !resp.status().is_success() {
            return Err(self.fail_from(resp).await);
        }
        Ok(())
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// In-memory secret store used by the adapter and reconciler tests.
    #[derive(Default)]
    pub struct MemoryStore {
        secrets: Mutex<HashMap<(String, String), Secret>>,
        pub fail_get: Mutex<bool>,
    }

    impl MemoryStore {
        pub fn insert(&self, namespace: &str, secret: Secret) {
            let name = secret
                .metadata
                .get("name")
                .and_then(|value| value.as_str())
                .unwrap_or_default()
                .to_string();
            self.secrets
                .lock()
                .unwrap()
                .insert((namespace.to_string(), name), secret);
        }

        pub fn snapshot(&self, namespace: &str, name: &str) -> Option<Secret> {
            self.secrets
                .lock()
                .unwrap()
                .get(&(namespace.to_string(), name.to_string()))
                .cloned()
        }
    }

    #[async_trait]
    impl SecretStore for MemoryStore {
        async fn get(
            &self,
            namespace: &str,
            name: &str,
        ) -> Result<Option<Secret>> {
            if *self.fail_get.lock().unwrap() {
                return Err(Error::Api {
                    status: 500,
                    message: "injected failure".to_string(),
                });
            }
            Ok(self.snapshot(namespace, name))
        }

        async fn create(
            &self,
            namespace: &str,
            secret: &Secret,
        ) -> Result<()> {
            self.insert(namespace, secret.clone());
            Ok(())
        }

        async fn update(
            &self,
            namespace: &str,
            secret: &Secret,
        ) -> Result<()> {
            self.insert(namespace, secret.clone());
            Ok(())
        }
    }
}
