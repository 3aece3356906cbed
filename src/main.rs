//! mixcluster: local mixnet test cluster entry point.
//!
//! Startup sequence:
//!   1. Load .env (if present)
//!   2. Parse flags and load settings
//!   3. Init logger at the configured level (bumped by `-v`)
//!   4. Synthesize the cluster and write its manifest
//!   5. Launch nodes, then authorities
//!   6. Provision mail users, then launch their proxies
//!   7. Run until Ctrl-C or a fatal tail failure, then shut down

use std::{
    fs,
    path::{Path, PathBuf},
    process,
};

use mixcluster::{
    ClusterError,
    config::{self, Settings},
    identity::UserKey,
    logger,
    orchestrator::{Orchestrator, ProcessLauncher},
    synth::{AuthorityMode, Cluster, ClusterBuilder, NodeKind},
    tail::LogSink,
};
use tracing::{error, info};

// ── CLI arg parsing ────────────────────────────────────────────────────────

struct Args {
    config: PathBuf,
    verbosity: u8,
    base_dir: Option<String>,
}

fn parse_args() -> Result<Args, String> {
    let mut config = PathBuf::from(config::DEFAULT_CONFIG_PATH);
    let mut verbosity = 0u8;
    let mut base_dir = None;
    let mut iter = std::env::args().skip(1);

    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--config" | "-c" => {
                config = iter.next().ok_or("--config needs a path")?.into();
            }
            "--base-dir" => {
                base_dir = Some(iter.next().ok_or("--base-dir needs a path")?);
            }
            "--help" | "-h" => {
                print_help();
                process::exit(0);
            }
            flag if flag.len() > 1 && flag.starts_with('-') && flag[1..].bytes().all(|b| b == b'v') => {
                verbosity = verbosity.saturating_add((flag.len() - 1) as u8);
            }
            other => return Err(format!("unexpected argument: {other}")),
        }
    }

    Ok(Args {
        config,
        verbosity,
        base_dir,
    })
}

fn print_help() {
    eprintln!("usage: mixcluster [-c <config>] [--base-dir <dir>] [-v...]");
    eprintln!();
    eprintln!("flags:");
    eprintln!("  --config, -c <path>   settings file (default: {})", config::DEFAULT_CONFIG_PATH);
    eprintln!("  --base-dir <dir>      cluster directory (default: a fresh temp dir)");
    eprintln!("  -v                    more verbose; repeat for more");
    eprintln!("  --help, -h            print this help");
}

// ── Entry point ────────────────────────────────────────────────────────────

fn main() {
    if let Err(e) = run() {
        eprintln!("error: {e}");
        process::exit(1);
    }
}

fn run() -> Result<(), ClusterError> {
    // .env is optional.
    let _ = dotenvy::dotenv();

    let args = parse_args().map_err(ClusterError::Settings)?;
    let mut settings = config::load(&args.config)?;
    if let Some(dir) = args.base_dir.as_deref() {
        settings.base_dir = Some(config::expand_home(dir));
    }

    let level = logger::bump_level(&settings.log_level, args.verbosity);
    logger::init(level, args.verbosity > 0)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(run_cluster(settings))
}

async fn run_cluster(settings: Settings) -> Result<(), ClusterError> {
    let base_dir = resolve_base_dir(settings.base_dir.as_deref())?;
    info!(base_dir = %base_dir.display(), base_port = settings.base_port, "synthesizing cluster");

    let sink = LogSink::open(&base_dir.join(&settings.log_file), settings.echo_stdout)?;
    let cluster = synthesize(&settings, &base_dir)?;
    let manifest = cluster.write_manifest()?;
    info!(manifest = %manifest.display(), ports = cluster.ports().len(), "cluster synthesized");

    let launcher = ProcessLauncher::new(settings.binaries.clone());
    let mut orchestrator = Orchestrator::new(launcher, sink, settings.tail);
    let fatal = orchestrator.fatal();

    if let Err(e) = start(&mut orchestrator, &cluster, &settings).await {
        error!("cluster startup failed: {e}");
        if let Err(shutdown_err) = orchestrator.shutdown().await {
            error!("shutdown after failed startup: {shutdown_err}");
        }
        return Err(e);
    }

    info!("cluster running; Ctrl-C to stop");
    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("interrupt received");
        }
        () = fatal.cancelled() => {
            error!("a process log became unobservable");
        }
    }

    orchestrator.shutdown().await
}

fn resolve_base_dir(configured: Option<&Path>) -> Result<PathBuf, ClusterError> {
    match configured {
        Some(dir) => {
            fs::create_dir_all(dir).map_err(|e| ClusterError::directory(dir, e))?;
            Ok(dir.to_path_buf())
        }
        None => {
            let dir = tempfile::Builder::new()
                .prefix("mixcluster-")
                .tempdir()
                .map_err(|e| ClusterError::directory(std::env::temp_dir(), e))?;
            // Left on disk for inspection after exit.
            Ok(dir.keep())
        }
    }
}

fn synthesize(settings: &Settings, base_dir: &Path) -> Result<Cluster, ClusterError> {
    let topology = &settings.topology;
    let mut builder = ClusterBuilder::new(base_dir, settings.base_port)?;

    if topology.voting {
        builder.synthesize_authority(AuthorityMode::Voting, topology.authorities)?;
    } else {
        builder.synthesize_authority(AuthorityMode::Single, 1)?;
    }
    for _ in 0..topology.providers {
        builder.synthesize_node(NodeKind::Provider)?;
    }
    for _ in 0..topology.mixes {
        builder.synthesize_node(NodeKind::Mix)?;
    }
    for user in &settings.users {
        let key = UserKey::generate()?;
        builder.synthesize_mail_proxy(&user.name, &user.provider, &key)?;
    }

    builder.finish()
}

async fn start(
    orchestrator: &mut Orchestrator,
    cluster: &Cluster,
    settings: &Settings,
) -> Result<(), ClusterError> {
    orchestrator.launch_all(cluster).await?;
    orchestrator
        .provision_mail_accounts(
            cluster,
            settings.provisioning.attempts,
            settings.provisioning.retry_interval,
        )
        .await?;
    orchestrator.launch_mail_proxies(cluster).await
}
