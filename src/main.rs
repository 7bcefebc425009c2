use dotenvy::dotenv;
use log::{error, info, warn};
use std::process;
use std::sync::Arc;
use std::time::{Duration, Instant};
use structopt::StructOpt;

use client_lb::config::load_health_check_config;
use client_lb::{FailureKind, HttpPing, LbConfig, LbParts, StaticServerList, ZoneAwareLoadBalancer};

#[derive(StructOpt, Debug)]
#[structopt(name = "client-lb")]
struct Args {
    #[structopt(short = "s", long = "service", help = "Logical service name")]
    service: Option<String>,

    #[structopt(short = "c", long = "conf", help = "Path to YAML configuration file")]
    conf: Option<String>,

    #[structopt(short = "i", long = "interval", default_value = "1000", help = "Milliseconds between simulated calls")]
    interval_ms: u64,

    #[structopt(short = "r", long = "rounds", help = "Stop after this many calls")]
    rounds: Option<u64>,
}

async fn probe(server: &client_lb::Server) -> Result<(), reqwest::Error> {
    reqwest::Client::new()
        .get(server.url("/"))
        .timeout(Duration::from_secs(2))
        .send()
        .await?
        .error_for_status()?;
    Ok(())
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    dotenv().ok();

    let args = Args::from_args();

    let mut config = match LbConfig::load(args.conf.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("❌ {}", e);
            process::exit(1);
        }
    };
    if let Some(service) = args.service {
        config.name = service;
    }

    let server_list = match StaticServerList::from_env() {
        Ok(list) => list,
        Err(e) => {
            error!("❌ {}", e);
            process::exit(1);
        }
    };
    let ping = match HttpPing::new(load_health_check_config()) {
        Ok(ping) => ping,
        Err(e) => {
            error!("❌ Cannot build health check client: {}", e);
            process::exit(1);
        }
    };

    let parts = LbParts::new(Arc::new(server_list)).with_ping(Arc::new(ping));
    let lb = match ZoneAwareLoadBalancer::new(config, parts) {
        Ok(lb) => Arc::new(lb),
        Err(e) => {
            error!("❌ {}", e);
            process::exit(1);
        }
    };

    if let Err(e) = lb.start().await {
        error!("❌ {}", e);
        process::exit(1);
    }

    info!("📋 Servers:");
    for server in lb.all_servers().iter() {
        info!("   - {} (zone: {})", server, server.zone_key());
    }

    let mut ticker = tokio::time::interval(Duration::from_millis(args.interval_ms.max(1)));
    let mut calls = 0u64;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("🛑 Ctrl-C received, shutting down");
                break;
            }
            _ = ticker.tick() => {}
        }

        match lb.choose_server_async(None).await {
            Some(server) => {
                lb.note_request_start(&server);
                let started = Instant::now();
                match probe(&server).await {
                    Ok(()) => {
                        lb.report_success(&server, started.elapsed());
                        info!("✅ {} answered in {:?}", server, started.elapsed());
                    }
                    Err(e) => {
                        let kind = if e.is_connect() || e.is_timeout() {
                            FailureKind::Connection
                        } else if e.status().map(|s| s.as_u16() == 503 || s.as_u16() == 429).unwrap_or(false) {
                            FailureKind::Throttled
                        } else {
                            FailureKind::Other
                        };
                        lb.report_failure(&server, kind, started.elapsed());
                        warn!("⚠️ {} failed: {}", server, e);
                    }
                }
            }
            None => warn!("⚠️ No server available"),
        }

        calls += 1;
        if args.rounds.map(|limit| calls >= limit).unwrap_or(false) {
            break;
        }
    }

    match serde_json::to_string_pretty(&lb.status()) {
        Ok(status) => info!("📊 Final status:\n{}", status),
        Err(e) => warn!("Failed to serialize status: {}", e),
    }
    lb.stop();
}
