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

use prometheus::{
    Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};
use snafu::Snafu;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Prometheus error {source}"))]
    Prometheus { source: prometheus::Error },
}

type Result<T, E = Error> = std::result::Result<T, E>;

/// The pipeline stages a reconciliation run passes through. Every stage has
/// an attempts/successes/errors counter triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    FetchSecret,
    FetchCert,
    StoreSecret,
    LoadConfig,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::FetchSecret => "fetch_secret",
            Stage::FetchCert => "fetch_cert",
            Stage::StoreSecret => "store_secret",
            Stage::LoadConfig => "load_config",
        }
    }
}

/// Counters and gauges recorded at every stage boundary of the reconciler.
///
/// Handed around as `Arc<Stats>` so each component records through the same
/// registry without a process-wide global.
pub struct Stats {
    registry: Registry,

    /// Stage executions started, labeled by stage.
    attempts: IntCounterVec,
    /// Stage executions finished without error, labeled by stage.
    successes: IntCounterVec,
    /// Stage executions failed, labeled by stage.
    errors: IntCounterVec,

    /// Completed reconciliation ticks.
    runs: IntCounter,
    /// Errors across all stages.
    error_total: IntCounter,

    /// Secrets created because no prior record existed.
    secret_creates: IntCounter,
    /// Secrets updated in place.
    secret_updates: IntCounter,

    /// Unix seconds of the most recent config load attempt.
    last_config_check: IntGauge,
    /// Unix seconds of the most recent accepted config snapshot.
    last_config_change: IntGauge,
}

fn new_stage_counter(name: &str, help: &str) -> Result<IntCounterVec> {
    IntCounterVec::new(Opts::new(name, help), &["stage"])
        .map_err(|e| Error::Prometheus { source: e })
}

impl Stats {
    pub fn new() -> Result<Stats> {
        let attempts = new_stage_counter(
            "kubecert_stage_attempts_total",
            "Stage executions started",
        )?;
        let successes = new_stage_counter(
            "kubecert_stage_successes_total",
            "Stage executions finished without error",
        )?;
        let errors = new_stage_counter(
            "kubecert_stage_errors_total",
            "Stage executions failed",
        )?;
        let runs = IntCounter::new(
            "kubecert_runs_total",
            "Completed reconciliation ticks",
        )
        .map_err(|e| Error::Prometheus { source: e })?;
        let error_total =
            IntCounter::new("kubecert_errors_total", "Errors of all stages")
                .map_err(|e| Error::Prometheus { source: e })?;
        let secret_creates = IntCounter::new(
            "kubecert_secret_creates_total",
            "Secrets created",
        )
        .map_err(|e| Error::Prometheus { source: e })?;
        let secret_updates = IntCounter::new(
            "kubecert_secret_updates_total",
            "Secrets updated",
        )
        .map_err(|e| Error::Prometheus { source: e })?;
        let last_config_check = IntGauge::new(
            "kubecert_last_config_check",
            "Unix seconds of the last config load attempt",
        )
        .map_err(|e| Error::Prometheus { source: e })?;
        let last_config_change = IntGauge::new(
            "kubecert_last_config_change",
            "Unix seconds of the last accepted config snapshot",
        )
        .map_err(|e| Error::Prometheus { source: e })?;

        let registry = Registry::new();
        registry
            .register(Box::new(attempts.clone()))
            .map_err(|e| Error::Prometheus { source: e })?;
        registry
            .register(Box::new(successes.clone()))
            .map_err(|e| Error::Prometheus { source: e })?;
        registry
            .register(Box::new(errors.clone()))
            .map_err(|e| Error::Prometheus { source: e })?;
        registry
            .register(Box::new(runs.clone()))
            .map_err(|e| Error::Prometheus { source: e })?;
        registry
            .register(Box::new(error_total.clone()))
            .map_err(|e| Error::Prometheus { source: e })?;
        registry
            .register(Box::new(secret_creates.clone()))
            .map_err(|e| Error::Prometheus { source: e })?;
        registry
            .register(Box::new(secret_updates.clone()))
            .map_err(|e| Error::Prometheus { source: e })?;
        registry
            .register(Box::new(last_config_check.clone()))
            .map_err(|e| Error::Prometheus { source: e })?;
        registry
            .register(Box::new(last_config_change.clone()))
            .map_err(|e| Error::Prometheus { source: e })?;

        Ok(Stats {
            registry,
            attempts,
            successes,
            errors,
            runs,
            error_total,
            secret_creates,
            secret_updates,
            last_config_check,
            last_config_change,
        })
    }

    pub fn attempt(&self, stage: Stage) {
        self.attempts.with_label_values(&[stage.as_str()]).inc();
    }

    pub fn success(&self, stage: Stage) {
        self.successes.with_label_values(&[stage.as_str()]).inc();
    }

    /// Records a stage failure on both the stage counter and the error total.
    /// The counters are plain atomics, so recording never blocks on a
    /// cancelled operation.
    pub fn error(&self, stage: Stage) {
        self.error_total.inc();
        self.errors.with_label_values(&[stage.as_str()]).inc();
    }

    pub fn run(&self) {
        self.runs.inc();
    }

    pub fn secret_created(&self) {
        self.secret_creates.inc();
    }

    pub fn secret_updated(&self) {
        self.secret_updates.inc();
    }

    pub fn config_checked(&self, unix_sec: i64) {
        self.last_config_check.set(unix_sec);
    }

    pub fn config_changed(&self, unix_sec: i64) {
        self.last_config_change.set(unix_sec);
    }

    /// Encodes the registry in the prometheus text format.
    pub fn encode(&self) -> Result<String> {
        let mut buf = vec![];
        let encoder = TextEncoder::new();
        encoder
            .encode(&self.registry.gather(), &mut buf)
            .map_err(|e| Error::Prometheus { source: e })?;
        Ok(String::from_utf8_lossy(&buf).to_string())
    }
}
