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

use snafu::Snafu;

/// Category name for ACME-related logging
pub static LOG_CATEGORY: &str = "acme";

/// Errors that can occur while talking to the certificate authority
#[derive(Debug, Snafu)]
pub enum Error {
    /// Error from the instant-acme library
    #[snafu(display("ACME instant error: {source}, category: {category}"))]
    Instant {
        category: String,
        source: instant_acme::Error,
    },

    /// Error from key or CSR generation
    #[snafu(display(
        "Certificate generation error: {source}, category: {category}"
    ))]
    Rcgen {
        category: String,
        source: rcgen::Error,
    },

    /// Challenge not found during authorization
    #[snafu(display("ACME challenge not found: {message}"))]
    NotFound { message: String },

    /// General order failure
    #[snafu(display(
        "ACME operation failed: {message}, category: {category}"
    ))]
    Fail { category: String, message: String },
}

/// Convenience type alias for Results with our Error type
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// A freshly issued certificate ready to be stored: the PEM chain with the
/// leaf first, and the PEM-encoded private key generated for it.
#[derive(Debug, Clone)]
pub struct NewCertificate {
    pub chain_pem: Vec<u8>,
    pub key_pem: Vec<u8>,
}

mod account;
mod limiter;
mod order;

pub use account::AccountMaker;
pub use limiter::RateLimiter;
pub use order::issue_certificate;
