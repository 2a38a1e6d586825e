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

use crate::acme::{issue_certificate, AccountMaker, RateLimiter};
use crate::config::{AppConf, SecretConf, SecretName};
use crate::metrics::{Stage, Stats};
use crate::responder::Responder;
use crate::secret::{KeyAlg, Secret, SecretAdapter, TlsSecret};
use crate::util;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{timeout_at, Instant};
use tracing::{error, info};

pub static LOG_CATEGORY: &str = "reconcile";

/// 2022-01-26T00:48:00Z. Certificates Let's Encrypt issued before this
/// instant were caught in their TLS-ALPN-01 mass revocation and must be
/// reissued even if they look healthy.
const LEGACY_REVOCATION_CUTOFF: i64 = 1_643_158_080;

fn close_to_expiration(
    not_after: i64,
    start_renew_duration: Duration,
    now: i64,
) -> bool {
    now + start_renew_duration.as_secs() as i64 >= not_after
}

/// The certificate covers exactly the configured domains when the set of
/// `{CN} ∪ SANs` equals the configured set. The CN can repeat inside the
/// SANs, so both sides compare as sets.
fn domain_mismatch(
    common_name: &str,
    dns_names: &[String],
    domains: &[String],
) -> bool {
    let mut cert_domains = HashSet::new();
    cert_domains.insert(common_name.to_string());
    for name in dns_names {
        cert_domains.insert(name.to_string());
    }
    let conf_domains =
        domains.iter().cloned().collect::<HashSet<String>>();
    cert_domains != conf_domains
}

/// Decides whether a secret requires a fresh certificate this tick. Returns
/// the reason for logging, `None` when no work is needed.
fn needs_refresh(
    snapshot: Option<&TlsSecret>,
    conf: &SecretConf,
    start_renew_duration: Duration,
    now: i64,
) -> Option<&'static str> {
    let Some(snapshot) = snapshot else {
        return Some("secret does not exist");
    };
    let Some(leaf) = &snapshot.leaf else {
        return Some("no parseable certificate in secret");
    };
    if close_to_expiration(leaf.not_after, start_renew_duration, now) {
        return Some("certificate close to expiration");
    }
    if domain_mismatch(&leaf.common_name, &leaf.dns_names, &conf.domains) {
        return Some("certificate domains mismatch config");
    }
    if leaf.issuer.contains("Let's Encrypt")
        && leaf.not_before < LEGACY_REVOCATION_CUTOFF
    {
        return Some("certificate in legacy revocation batch");
    }
    let alg_ok = if conf.use_rsa {
        leaf.key_alg == KeyAlg::Rsa
    } else {
        leaf.key_alg == KeyAlg::Ec
    };
    if !alg_ok {
        return Some("certificate key algorithm mismatch");
    }
    None
}

/// Runs the per-tick pipeline: fetch every configured secret, decide which
/// need a fresh certificate, then drive issuance and storage for each. A
/// failing secret is skipped for the tick, never aborting the others; the
/// scheduler's next event is the retry.
pub struct Reconciler {
    adapter: SecretAdapter,
    accounts: Arc<AccountMaker>,
    limiter: Arc<RateLimiter>,
    responder: Arc<Responder>,
    stats: Arc<Stats>,
    le_timeout: Duration,
}

impl Reconciler {
    pub fn new(
        adapter: SecretAdapter,
        accounts: Arc<AccountMaker>,
        limiter: Arc<RateLimiter>,
        responder: Arc<Responder>,
        stats: Arc<Stats>,
        le_timeout: Duration,
    ) -> Self {
        Self {
            adapter,
            accounts,
            limiter,
            responder,
            stats,
            le_timeout,
        }
    }

    pub async fn run(&self, conf: &AppConf) {
        self.stats.run();
        self.responder.reset();

        let mut snapshots: HashMap<SecretName, Option<TlsSecret>> =
            HashMap::new();
        let mut working: Vec<&SecretConf> = vec![];
        for secret_conf in &conf.secrets {
            let full_name = secret_conf.full_name();
            info!(
                category = LOG_CATEGORY,
                secret = full_name.to_string(),
                "fetching secret"
            );
            self.stats.attempt(Stage::FetchSecret);
            match self.adapter.fetch(&full_name).await {
                Ok(snapshot) => {
                    self.stats.success(Stage::FetchSecret);
                    snapshots.insert(full_name, snapshot);
                    working.push(secret_conf);
                },
                Err(e) => {
                    error!(
                        category = LOG_CATEGORY,
                        secret = full_name.to_string(),
                        error = e.to_string(),
                        "unable to fetch TLS secret value"
                    );
                    self.stats.error(Stage::FetchSecret);
                },
            }
        }

        let now = util::now_sec();
        for secret_conf in working {
            let full_name = secret_conf.full_name();
            let snapshot =
                snapshots.get(&full_name).and_then(|value| value.as_ref());
            match needs_refresh(
                snapshot,
                secret_conf,
                conf.start_renew_duration,
                now,
            ) {
                Some(reason) => {
                    info!(
                        category = LOG_CATEGORY,
                        secret = full_name.to_string(),
                        reason,
                        "refreshing secret"
                    );
                    let old = snapshot.map(|snapshot| &snapshot.secret);
                    self.refresh(conf, secret_conf, old).await;
                },
                None => {
                    info!(
                        category = LOG_CATEGORY,
                        secret = full_name.to_string(),
                        "no work needed for secret"
                    );
                },
            }
        }
    }

    async fn refresh(
        &self,
        conf: &AppConf,
        secret_conf: &SecretConf,
        old: Option<&Secret>,
    ) {
        let full_name = secret_conf.full_name().to_string();
        // the order shares one deadline; storage gets a little slack on top
        let order_deadline = Instant::now() + self.le_timeout;
        let store_deadline = order_deadline + Duration::from_secs(20);

        self.stats.attempt(Stage::FetchCert);
        let account = match timeout_at(
            order_deadline,
            self.accounts.make(conf.directory_url(), &conf.email),
        )
        .await
        {
            Ok(Ok(account)) => account,
            Ok(Err(e)) => {
                error!(
                    category = LOG_CATEGORY,
                    secret = full_name,
                    error = e.to_string(),
                    "unable to get an up to date acme account"
                );
                self.stats.error(Stage::FetchCert);
                return;
            },
            Err(_) => {
                error!(
                    category = LOG_CATEGORY,
                    secret = full_name,
                    "deadline exceeded while registering acme account"
                );
                self.stats.error(Stage::FetchCert);
                return;
            },
        };

        let cert = match timeout_at(
            order_deadline,
            issue_certificate(
                &account,
                &self.limiter,
                secret_conf,
                &self.responder,
                order_deadline,
            ),
        )
        .await
        {
            Ok(Ok(cert)) => cert,
            Ok(Err(e)) => {
                error!(
                    category = LOG_CATEGORY,
                    secret = full_name,
                    error = e.to_string(),
                    "unable to get certificate"
                );
                self.stats.error(Stage::FetchCert);
                return;
            },
            Err(_) => {
                error!(
                    category = LOG_CATEGORY,
                    secret = full_name,
                    "deadline exceeded while creating certificate"
                );
                self.stats.error(Stage::FetchCert);
                return;
            },
        };
        self.stats.success(Stage::FetchCert);
        info!(
            category = LOG_CATEGORY,
            secret = full_name,
            "have new certificate"
        );

        self.stats.attempt(Stage::StoreSecret);
        match timeout_at(
            store_deadline,
            self.adapter.store(secret_conf, old, &cert),
        )
        .await
        {
            Ok(Ok(())) => {
                self.stats.success(Stage::StoreSecret);
                info!(
                    category = LOG_CATEGORY,
                    secret = full_name,
                    "successfully stored new certificate"
                );
            },
            Ok(Err(e)) => {
                error!(
                    category = LOG_CATEGORY,
                    secret = full_name,
                    error = e.to_string(),
                    "unable to store the TLS cert and key as secret"
                );
                self.stats.error(Stage::StoreSecret);
            },
            Err(_) => {
                error!(
                    category = LOG_CATEGORY,
                    secret = full_name,
                    "deadline exceeded while storing secret"
                );
                self.stats.error(Stage::StoreSecret);
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secret::testing::MemoryStore;
    use crate::secret::LeafCert;
    use base64::{engine::general_purpose::STANDARD, Engine};
    use pretty_assertions::assert_eq;
    use rcgen::{CertificateParams, DnType, KeyPair};
    use serde_json::json;

    fn to_domains(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    fn new_leaf() -> LeafCert {
        LeafCert {
            common_name: "example.com".to_string(),
            dns_names: to_domains(&["example.com", "www.example.com"]),
            not_before: 1_700_000_000,
            not_after: 1_700_000_000 + 90 * 24 * 3600,
            issuer: "CN=R3, O=Let's Encrypt, C=US".to_string(),
            key_alg: KeyAlg::Ec,
        }
    }

    fn new_snapshot(leaf: Option<LeafCert>) -> TlsSecret {
        TlsSecret {
            secret: Secret::default(),
            leaf,
        }
    }

    fn new_secret_conf() -> SecretConf {
        SecretConf {
            namespace: "default".to_string(),
            name: "test".to_string(),
            domains: to_domains(&["example.com", "www.example.com"]),
            use_rsa: false,
        }
    }

    const RENEW: Duration = Duration::from_secs(21 * 24 * 3600);

    #[test]
    fn test_needs_refresh_missing_and_unparseable() {
        let conf = new_secret_conf();
        assert_eq!(
            Some("secret does not exist"),
            needs_refresh(None, &conf, RENEW, 1_700_000_000)
        );
        assert_eq!(
            Some("no parseable certificate in secret"),
            needs_refresh(
                Some(&new_snapshot(None)),
                &conf,
                RENEW,
                1_700_000_000
            )
        );
    }

    #[test]
    fn test_needs_refresh_expiration_boundary() {
        let conf = new_secret_conf();
        let leaf = new_leaf();
        let snapshot = new_snapshot(Some(leaf.clone()));

        // now + renew == not_after is close to expiration
        let now = leaf.not_after - RENEW.as_secs() as i64;
        assert_eq!(
            Some("certificate close to expiration"),
            needs_refresh(Some(&snapshot), &conf, RENEW, now)
        );
        // one second earlier is not
        assert_eq!(
            None,
            needs_refresh(Some(&snapshot), &conf, RENEW, now - 1)
        );
    }

    #[test]
    fn test_needs_refresh_domain_mismatch() {
        let conf = new_secret_conf();
        let mut leaf = new_leaf();
        leaf.dns_names = to_domains(&["example.com"]);
        let snapshot = new_snapshot(Some(leaf));
        assert_eq!(
            Some("certificate domains mismatch config"),
            needs_refresh(Some(&snapshot), &conf, RENEW, 1_700_000_000)
        );

        // order and duplicates do not matter, the CN may repeat in the SANs
        let mut conf = new_secret_conf();
        conf.domains =
            to_domains(&["www.example.com", "example.com", "example.com"]);
        let snapshot = new_snapshot(Some(new_leaf()));
        assert_eq!(
            None,
            needs_refresh(Some(&snapshot), &conf, RENEW, 1_700_000_000)
        );
    }

    #[test]
    fn test_needs_refresh_legacy_revocation() {
        let conf = new_secret_conf();
        let mut leaf = new_leaf();
        leaf.not_before = LEGACY_REVOCATION_CUTOFF - 1;
        // keep it far from expiration so only the batch rule triggers
        leaf.not_after = 1_700_000_000 + 365 * 24 * 3600;
        let snapshot = new_snapshot(Some(leaf.clone()));
        assert_eq!(
            Some("certificate in legacy revocation batch"),
            needs_refresh(Some(&snapshot), &conf, RENEW, 1_700_000_000)
        );

        // other issuers from that era are fine
        leaf.issuer = "CN=some other ca".to_string();
        let snapshot = new_snapshot(Some(leaf));
        assert_eq!(
            None,
            needs_refresh(Some(&snapshot), &conf, RENEW, 1_700_000_000)
        );
    }

    #[test]
    fn test_needs_refresh_key_algorithm() {
        let mut conf = new_secret_conf();
        conf.use_rsa = true;
        let snapshot = new_snapshot(Some(new_leaf()));
        assert_eq!(
            Some("certificate key algorithm mismatch"),
            needs_refresh(Some(&snapshot), &conf, RENEW, 1_700_000_000)
        );

        let mut leaf = new_leaf();
        leaf.key_alg = KeyAlg::Rsa;
        let snapshot = new_snapshot(Some(leaf));
        assert_eq!(
            None,
            needs_refresh(Some(&snapshot), &conf, RENEW, 1_700_000_000)
        );
    }

    fn fresh_cert_pem(domains: &[&str]) -> String {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(
            domains.iter().map(|d| d.to_string()).collect::<Vec<_>>(),
        )
        .unwrap();
        params
            .distinguished_name
            .push(DnType::CommonName, domains[0]);
        params.self_signed(&key).unwrap().pem()
    }

    fn new_reconciler(
        store: Arc<MemoryStore>,
        stats: Arc<Stats>,
    ) -> Reconciler {
        let limiter = Arc::new(RateLimiter::new(3.0, 3));
        Reconciler::new(
            SecretAdapter::new(store, stats.clone()),
            Arc::new(AccountMaker::new(limiter.clone())),
            limiter,
            Arc::new(Responder::new()),
            stats,
            Duration::from_secs(60),
        )
    }

    #[tokio::test]
    async fn test_run_skips_fresh_secret() {
        let store = Arc::new(MemoryStore::default());
        let mut secret = Secret {
            metadata: json!({"name": "test"}),
            ..Default::default()
        };
        // rcgen issues with a far-future expiry, well past the renew window
        secret.data.insert(
            "tls.crt".to_string(),
            STANDARD
                .encode(fresh_cert_pem(&["example.com", "www.example.com"])),
        );
        store.insert("default", secret);

        let stats = Arc::new(Stats::new().unwrap());
        let reconciler = new_reconciler(store, stats.clone());
        let conf = AppConf {
            email: "fake@example.com".to_string(),
            use_prod: Some(false),
            secrets: vec![new_secret_conf()],
            start_renew_duration: RENEW,
            ..Default::default()
        };
        reconciler.run(&conf).await;

        let text = stats.encode().unwrap();
        assert_eq!(true, text.contains("kubecert_runs_total 1"));
        assert_eq!(
            true,
            text.contains(
                r#"kubecert_stage_successes_total{stage="fetch_secret"} 1"#
            )
        );
        // no refresh happened
        assert_eq!(false, text.contains(r#"stage="fetch_cert""#));
    }

    #[tokio::test]
    async fn test_run_records_fetch_failure_and_continues() {
        let store = Arc::new(MemoryStore::default());
        *store.fail_get.lock().unwrap() = true;

        let stats = Arc::new(Stats::new().unwrap());
        let reconciler = new_reconciler(store, stats.clone());
        let conf = AppConf {
            email: "fake@example.com".to_string(),
            use_prod: Some(false),
            secrets: vec![new_secret_conf()],
            start_renew_duration: RENEW,
            ..Default::default()
        };
        reconciler.run(&conf).await;

        let text = stats.encode().unwrap();
        assert_eq!(
            true,
            text.contains(
                r#"kubecert_stage_errors_total{stage="fetch_secret"} 1"#
            )
        );
        assert_eq!(true, text.contains("kubecert_errors_total 1"));
    }
}
