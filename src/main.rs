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

use crate::acme::{AccountMaker, RateLimiter};
use crate::config::ConfLoader;
use crate::metrics::Stats;
use crate::reconcile::Reconciler;
use crate::responder::Responder;
use crate::secret::{KubeClient, SecretAdapter};
use crate::server::AppState;
use clap::Parser;
use std::error::Error;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::Once;
use std::time::Duration;
use tracing::{error, info};

mod acme;
mod config;
mod logger;
mod metrics;
mod reconcile;
mod responder;
mod secret;
mod server;
mod service;
mod util;

// The CA applies a request-per-IP limit (nginx, across all accounts and
// clients), observed at roughly this rate.
const LE_RATE: f64 = 3.0;
const LE_BURST: usize = 3;

const BOOT_REGISTER_TIMEOUT: Duration = Duration::from_secs(120);

/// Keeps Kubernetes TLS secrets valid with certificates from an ACME CA.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the required JSON config file
    #[arg(long)]
    conf: String,
    /// Address to boot the HTTP server on
    #[arg(long, default_value = ":10080")]
    addr: String,
    /// Address to boot the HTTPS server on
    #[arg(long = "httpsAddr", default_value = ":10443")]
    https_addr: String,
    /// Max time to spend fetching and creating a certificate (but not time
    /// spent fetching and storing secrets)
    #[arg(
        long = "leTimeout",
        default_value = "30m",
        value_parser = humantime::parse_duration
    )]
    le_timeout: Duration,
}

// Initialize crypto provider once
static INIT: Once = Once::new();

fn ensure_crypto_provider() {
    INIT.call_once(|| {
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
    });
}

/// Go-style listen addresses such as `:10080` bind every interface.
fn listen_addr(value: &str) -> Result<SocketAddr, Box<dyn Error>> {
    let value = if value.starts_with(':') {
        format!("0.0.0.0{value}")
    } else {
        value.to_string()
    };
    let addr = value.parse::<SocketAddr>()?;
    Ok(addr)
}

async fn run(args: Args) -> Result<(), Box<dyn Error>> {
    ensure_crypto_provider();

    let stats = Arc::new(Stats::new()?);
    // a busted config file must fail the boot; later reload errors are
    // recorded and the previous snapshot stays in force
    let (loader, conf) = ConfLoader::new(&args.conf, stats.clone()).await?;

    let responder = Arc::new(Responder::new());
    let limiter = Arc::new(RateLimiter::new(LE_RATE, LE_BURST));
    let accounts = Arc::new(AccountMaker::new(limiter.clone()));

    // register the account eagerly so a bad email or directory URL is caught
    // at boot instead of on the first renewal
    tokio::time::timeout(
        BOOT_REGISTER_TIMEOUT,
        accounts.make(conf.directory_url(), &conf.email),
    )
    .await
    .map_err(|_| {
        format!(
            "deadline exceeded while making an account with {} using email {}",
            conf.directory_url(),
            conf.email
        )
    })??;

    let kube = Arc::new(KubeClient::new_in_cluster()?);
    let adapter = SecretAdapter::new(kube, stats.clone());
    let reconciler = Reconciler::new(
        adapter,
        accounts,
        limiter,
        responder.clone(),
        stats.clone(),
        args.le_timeout,
    );

    if !std::env::var("USE_PRINT_EXPORTER")
        .unwrap_or_default()
        .is_empty()
    {
        service::spawn_print_exporter(stats.clone());
    }

    let changes = service::spawn_config_watcher(loader.clone());
    tokio::spawn(service::run_scheduler(reconciler, conf.clone(), changes));

    let state = Arc::new(AppState {
        responder,
        loader,
        stats,
    });
    if !conf.tls_dir.is_empty() {
        let https_addr = listen_addr(&args.https_addr)?;
        let tls_dir = conf.tls_dir.clone();
        let state = state.clone();
        tokio::spawn(async move {
            if let Err(e) =
                server::serve_https(https_addr, &tls_dir, state).await
            {
                error!(error = e.to_string(), "unable to boot HTTPS server");
                std::process::exit(1);
            }
        });
    }

    info!(version = util::VERSION, sha = util::BUILD_SHA, "server is running");
    server::serve_http(listen_addr(&args.addr)?, state).await?;
    Ok(())
}

fn main() {
    let args = Args::parse();
    if let Err(e) = logger::try_init("") {
        println!("logger init fail, {e}");
    }
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = e.to_string(), "unable to create runtime");
            std::process::exit(1);
        },
    };
    if let Err(e) = runtime.block_on(run(args)) {
        error!(error = e.to_string(), "unrecoverable failure");
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_listen_addr() {
        assert_eq!(
            "0.0.0.0:10080",
            listen_addr(":10080").unwrap().to_string()
        );
        assert_eq!(
            "127.0.0.1:8080",
            listen_addr("127.0.0.1:8080").unwrap().to_string()
        );
        assert_eq!(true, listen_addr("not an addr").is_err());
    }

    #[test]
    fn test_default_args() {
        let args = Args::parse_from(["kubecert", "--conf", "/tmp/conf.json"]);
        assert_eq!("/tmp/conf.json", args.conf);
        assert_eq!(":10080", args.addr);
        assert_eq!(":10443", args.https_addr);
        assert_eq!(Duration::from_secs(30 * 60), args.le_timeout);
    }

    #[test]
    fn test_missing_conf_exits_with_usage() {
        let result = Args::try_parse_from(["kubecert"]);
        assert_eq!(true, result.is_err());
        // clap exits with code 2 on missing required arguments
        assert_eq!(
            2,
            result.err().unwrap().exit_code(),
        );
    }
}
