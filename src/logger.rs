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
use tracing::error;
use tracing_subscriber::filter::Directive;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Logger init fail, {message}"))]
    Init { message: String },
}

type Result<T, E = Error> = std::result::Result<T, E>;

pub fn new_env_filter(level: &str) -> EnvFilter {
    let mut initial_filter = EnvFilter::from_default_env();
    for item in level.split(',') {
        if item.is_empty() {
            continue;
        }
        match item.parse::<Directive>() {
            Ok(directive) => {
                initial_filter = initial_filter.add_directive(directive);
            },
            Err(e) => {
                error!(error = e.to_string(), "parse directive fail");
            },
        };
    }
    initial_filter
}

/// Installs the global subscriber. The level defaults to `info` and can be
/// extended through `RUST_LOG` or the `level` argument.
pub fn try_init(level: &str) -> Result<()> {
    let level = if level.is_empty() { "info" } else { level };
    tracing_subscriber::fmt()
        .with_env_filter(new_env_filter(level))
        .with_target(false)
        .try_init()
        .map_err(|e| Error::Init {
            message: e.to_string(),
        })
}
