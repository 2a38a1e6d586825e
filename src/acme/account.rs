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

use super::{Error, RateLimiter, Result, LOG_CATEGORY};
use instant_acme::{Account, NewAccount};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct AccountInfo {
    directory_url: String,
    email: String,
}

/// Trailing slashes are trimmed so a URL sliding in and out of configs does
/// not register duplicate accounts.
fn memo_key(directory_url: &str, email: &str) -> AccountInfo {
    AccountInfo {
        directory_url: directory_url.trim_end_matches('/').to_string(),
        email: email.to_string(),
    }
}

/// Registers ACME accounts and memoizes them per `(directory URL, email)`
/// for the process lifetime, so changing either in the config picks up a new
/// account without a restart. The account key pair is generated by the
/// protocol library at registration and identifies this process to the CA
/// across all issuances.
pub struct AccountMaker {
    limiter: Arc<RateLimiter>,
    memo: tokio::sync::Mutex<HashMap<AccountInfo, Arc<Account>>>,
}

impl AccountMaker {
    pub fn new(limiter: Arc<RateLimiter>) -> Self {
        Self {
            limiter,
            memo: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Returns a registered account for the directory and contact email,
    /// creating one on first use. The memo is populated only on full
    /// success.
    pub async fn make(
        &self,
        directory_url: &str,
        email: &str,
    ) -> Result<Arc<Account>> {
        if directory_url.is_empty() {
            return Err(Error::Fail {
                category: "make_account".to_string(),
                message: "directory URL of the ACME API may not be blank"
                    .to_string(),
            });
        }
        let info = memo_key(directory_url, email);
        let mut memo = self.memo.lock().await;
        if let Some(account) = memo.get(&info) {
            return Ok(account.clone());
        }

        info!(
            category = LOG_CATEGORY,
            directory = info.directory_url,
            email,
            "registering acme account"
        );
        let contact = format!("mailto:{email}");
        self.limiter.acquire().await;
        let (account, _) = Account::create(
            &NewAccount {
                contact: &[contact.as_str()],
                terms_of_service_agreed: true,
                only_return_existing: false,
            },
            &info.directory_url,
            None,
        )
        .await
        .map_err(|e| Error::Instant {
            category: "create_account".to_string(),
            source: e,
        })?;
        let account = Arc::new(account);
        memo.insert(info, account.clone());
        Ok(account)
    }
}
