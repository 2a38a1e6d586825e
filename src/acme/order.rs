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

use super::{Error, NewCertificate, RateLimiter, Result, LOG_CATEGORY};
use crate::config::SecretConf;
use crate::responder::Responder;
use async_trait::async_trait;
use instant_acme::{
    Account, AuthorizationStatus, ChallengeType, Identifier, NewOrder, Order,
    OrderStatus,
};
use rcgen::{
    CertificateParams, CertificateSigningRequest, DistinguishedName, DnType,
    KeyPair,
};
use std::time::Duration;
use tokio::time::Instant;
use tracing::info;

const INITIAL_POLL_DELAY: Duration = Duration::from_millis(250);
const MAX_POLL_DELAY: Duration = Duration::from_secs(30);

/// Removes duplicate domains after the first occurrence, preserving order.
/// The first domain becomes the CSR common name, so accidental reordering
/// would change the issued subject.
fn unique_domains(domains: &[String]) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    domains
        .iter()
        .filter(|domain| seen.insert(domain.as_str()))
        .cloned()
        .collect()
}

/// Builds the certificate key pair and signing request. The subject CN is
/// the first unique domain while the SAN list carries the configured domains
/// verbatim, duplicates included; the CA tolerates duplicate SANs and older
/// consumers relied on the full list.
fn build_csr(
    common_name: &str,
    san_domains: &[String],
    use_rsa: bool,
) -> Result<(KeyPair, CertificateSigningRequest)> {
    let algorithm = if use_rsa {
        &rcgen::PKCS_RSA_SHA256
    } else {
        &rcgen::PKCS_ECDSA_P256_SHA256
    };
    let key = KeyPair::generate_for(algorithm).map_err(|e| Error::Rcgen {
        category: "generate_key".to_string(),
        source: e,
    })?;

    let mut params =
        CertificateParams::new(san_domains.to_vec()).map_err(|e| {
            Error::Rcgen {
                category: "csr_params".to_string(),
                source: e,
            }
        })?;
    params.distinguished_name = DistinguishedName::new();
    params
        .distinguished_name
        .push(DnType::CommonName, common_name);
    let csr = params.serialize_request(&key).map_err(|e| Error::Rcgen {
        category: "serialize_csr".to_string(),
        source: e,
    })?;
    Ok((key, csr))
}

/// Order state access the ready-wait loop needs, separated so the loop can
/// be exercised without a live CA.
#[async_trait]
trait PollableOrder {
    fn status(&mut self) -> OrderStatus;
    async fn refresh(&mut self) -> Result<()>;
}

struct LiveOrder<'a> {
    order: &'a mut Order,
    limiter: &'a RateLimiter,
}

#[async_trait]
impl PollableOrder for LiveOrder<'_> {
    fn status(&mut self) -> OrderStatus {
        self.order.state().status
    }

    async fn refresh(&mut self) -> Result<()> {
        self.limiter.acquire().await;
        self.order.refresh().await.map_err(|e| Error::Instant {
            category: "refresh_order".to_string(),
            source: e,
        })?;
        Ok(())
    }
}

/// Polls until the order leaves pending/processing, backing off
/// exponentially with a fresh delay per order. Only the caller's deadline
/// ends the wait: an order still in flight at the deadline fails with the
/// timeout category.
async fn wait_for_order_ready<T>(
    order: &mut T,
    deadline: Instant,
) -> Result<OrderStatus>
where
    T: PollableOrder + Send,
{
    let mut delay = INITIAL_POLL_DELAY;
    loop {
        let status = order.status();
        if let OrderStatus::Ready | OrderStatus::Invalid | OrderStatus::Valid =
            status
        {
            return Ok(status);
        }
        let now = Instant::now();
        if now >= deadline {
            return Err(Error::Fail {
                category: "authorization_timeout".to_string(),
                message: format!("order still {status:?} at deadline"),
            });
        }
        info!(
            category = LOG_CATEGORY,
            status = format!("{status:?}"),
            delay = format!("{delay:?}"),
            "order is not ready"
        );
        tokio::time::sleep(delay.min(deadline - now)).await;
        delay = (delay * 2).min(MAX_POLL_DELAY);
        order.refresh().await?;
    }
}

/// Drives one multi-domain order to completion: authorize every identifier
/// through the responder, wait for the order to become ready, finalize with a
/// fresh CSR and fetch the issued chain.
///
/// There are no retries here; a failed order surfaces to the reconciler and
/// the next tick tries again. The whole operation shares the caller's
/// `deadline`: the ready-wait gives up at that instant, and the caller's
/// cancellation cuts off any in-flight protocol call.
pub async fn issue_certificate(
    account: &Account,
    limiter: &RateLimiter,
    conf: &SecretConf,
    responder: &Responder,
    deadline: Instant,
) -> Result<NewCertificate> {
    if conf.domains.is_empty() {
        return Err(Error::Fail {
            category: "new_order".to_string(),
            message: "cannot request a certificate with no names".to_string(),
        });
    }
    let domains = unique_domains(&conf.domains);
    info!(
        category = LOG_CATEGORY,
        secret = conf.full_name().to_string(),
        domains = domains.join(","),
        "authorizing order"
    );

    let identifiers = domains
        .iter()
        .map(|domain| Identifier::Dns(domain.to_owned()))
        .collect::<Vec<Identifier>>();
    limiter.acquire().await;
    let mut order = account
        .new_order(&NewOrder {
            identifiers: &identifiers,
        })
        .await
        .map_err(|e| Error::Instant {
            category: "new_order".to_string(),
            source: e,
        })?;

    // the client fetches each authorization url of the order separately, so
    // every one of those calls takes its own token
    let authz_count = order.state().authorizations.len();
    for _ in 0..authz_count {
        limiter.acquire().await;
    }
    let authorizations =
        order.authorizations().await.map_err(|e| Error::Instant {
            category: "authorizations".to_string(),
            source: e,
        })?;

    for authz in &authorizations {
        match authz.status {
            AuthorizationStatus::Pending => {},
            AuthorizationStatus::Valid => continue,
            status => {
                return Err(Error::Fail {
                    category: "authorization".to_string(),
                    message: format!(
                        "unexpected authorization status {status:?}"
                    ),
                })
            },
        }

        let challenge = authz
            .challenges
            .iter()
            .find(|challenge| challenge.r#type == ChallengeType::Http01)
            .ok_or_else(|| {
                let seen = authz
                    .challenges
                    .iter()
                    .map(|challenge| format!("{:?}", challenge.r#type))
                    .collect::<Vec<String>>();
                Error::NotFound {
                    message: format!("no http-01 challenge in {seen:?}"),
                }
            })?;

        let Identifier::Dns(domain) = &authz.identifier;
        let key_auth = order.key_authorization(challenge);
        // registered before the challenge is flagged ready, so the CA never
        // probes a token this process cannot answer
        responder.add(domain, &challenge.token, key_auth.as_str());

        limiter.acquire().await;
        order
            .set_challenge_ready(&challenge.url)
            .await
            .map_err(|e| Error::Instant {
                category: "set_challenge_ready".to_string(),
                source: e,
            })?;
    }

    let status = {
        let mut live = LiveOrder {
            order: &mut order,
            limiter,
        };
        wait_for_order_ready(&mut live, deadline).await?
    };
    if status == OrderStatus::Invalid {
        return Err(Error::Fail {
            category: "authorization_invalid".to_string(),
            message: "authorization marked as invalid".to_string(),
        });
    }

    let (key, csr) = build_csr(&domains[0], &conf.domains, conf.use_rsa)?;

    limiter.acquire().await;
    order.finalize(csr.der()).await.map_err(|e| Error::Instant {
        category: "finalize".to_string(),
        source: e,
    })?;

    let chain_pem = loop {
        limiter.acquire().await;
        match order.certificate().await.map_err(|e| Error::Instant {
            category: "fetch_certificate".to_string(),
            source: e,
        })? {
            Some(chain_pem) => break chain_pem,
            None => tokio::time::sleep(Duration::from_secs(1)).await,
        }
    };

    info!(
        category = LOG_CATEGORY,
        secret = conf.full_name().to_string(),
        "certificate issued"
    );
    Ok(NewCertificate {
        chain_pem: chain_pem.into_bytes(),
        key_pem: key.serialize_pem().into_bytes(),
    })
}
