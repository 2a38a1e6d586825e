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

use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::{debug, info};

pub static WELL_KNOWN_PATH_PREFIX: &str = "/.well-known/acme-challenge/";

pub static LOG_CATEGORY: &str = "responder";

#[derive(Debug, Clone)]
struct ChallengeReply {
    body: Bytes,
    domain: String,
}

/// Holds the key authorization replies for the HTTP-01 challenges of the
/// reconciliation tick in flight. The CA fetches them through
/// `/.well-known/acme-challenge/<token>` while the order driver waits for the
/// authorizations to turn valid.
///
/// Add, reply lookup and reset may run concurrently; the map lock is never
/// held across I/O.
#[derive(Debug, Default)]
pub struct Responder {
    replies: Mutex<HashMap<String, ChallengeReply>>,
}

impl Responder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the key authorization for a challenge token. ACME tokens are
    /// random, so an existing entry for the same token is overwritten.
    pub fn add(&self, domain: &str, token: &str, key_authorization: &str) {
        info!(
            category = LOG_CATEGORY,
            domain, token, "add challenge authorization"
        );
        let reply = ChallengeReply {
            body: Bytes::from(key_authorization.to_string()),
            domain: domain.to_string(),
        };
        let mut replies = self.replies.lock().unwrap_or_else(|e| e.into_inner());
        replies.insert(token.to_string(), reply);
    }

    /// Drops every registered challenge. Called once at the start of each
    /// reconciliation tick, before any authorization of that tick begins.
    pub fn reset(&self) {
        let mut replies = self.replies.lock().unwrap_or_else(|e| e.into_inner());
        let count = replies.len();
        *replies = HashMap::new();
        if count > 0 {
            debug!(
                category = LOG_CATEGORY,
                cleared = count,
                "reset challenge authorizations"
            );
        }
    }

    /// Copies the reply body for a token out of the map. `None` means the CA
    /// asked for a token this process never registered (or one already
    /// cleared by reset); the HTTP layer answers 404 and the CA retries.
    pub fn reply_for(&self, token: &str) -> Option<Bytes> {
        let reply = {
            let replies =
                self.replies.lock().unwrap_or_else(|e| e.into_inner());
            replies.get(token).cloned()
        };
        match reply {
            Some(reply) => {
                info!(
                    category = LOG_CATEGORY,
                    domain = reply.domain,
                    token,
                    "serve challenge authorization"
                );
                Some(reply.body)
            },
            None => {
                info!(category = LOG_CATEGORY, token, "unknown token");
                None
            },
        }
    }
}
