//! `mixcluster-provision`: add a mail user to a running provider.
//!
//! Speaks the provider's management protocol over its Unix socket:
//! `ADD_USER` followed by `SET_USER_IDENTITY` with the same key.
//!
//! # Usage
//!
//! ```text
//! mixcluster-provision [--socket <path> | --provider <dir>] <user> <public-key>
//!
//! Flags:
//!   --socket, -s <path>   management socket of the provider
//!   --provider, -p <dir>  provider data dir name, e.g. provider-0
//!   --help, -h            print this help
//! ```
//!
//! Socket path resolution order:
//!   1. `--socket <path>` flag
//!   2. `$MIXCLUSTER_BASE_DIR/<provider>/management_sock`
//!
//! The public key is the base64 form written into `cluster.json` and the
//! mail-proxy recipient tables.

use std::path::PathBuf;
use std::process;

use mixcluster::config::expand_home;
use mixcluster::documents::MANAGEMENT_SOCKET;
use mixcluster::identity::PublicKey;
use mixcluster::management::provision_user;

// ── CLI arg parsing ────────────────────────────────────────────────────────

struct Args {
    socket: Option<String>,
    provider: Option<String>,
    rest: Vec<String>,
}

fn parse_args() -> Args {
    let mut socket = None;
    let mut provider = None;
    let mut rest = Vec::new();
    let mut iter = std::env::args().skip(1);

    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--socket" | "-s" => {
                socket = iter.next();
            }
            "--provider" | "-p" => {
                provider = iter.next();
            }
            "--help" | "-h" => {
                print_help();
                process::exit(0);
            }
            "--" => {
                rest.extend(iter);
                break;
            }
            _ => rest.push(arg),
        }
    }

    Args {
        socket,
        provider,
        rest,
    }
}

fn print_help() {
    eprintln!("usage: mixcluster-provision [--socket <path> | --provider <dir>] <user> <public-key>");
    eprintln!();
    eprintln!("flags:");
    eprintln!("  --socket,   -s <path>   management socket of the provider");
    eprintln!("  --provider, -p <dir>    provider data dir name under $MIXCLUSTER_BASE_DIR");
    eprintln!("  --help,     -h          print this help");
    eprintln!();
    eprintln!("socket path resolution:");
    eprintln!("  1. --socket flag");
    eprintln!("  2. $MIXCLUSTER_BASE_DIR/<provider>/{MANAGEMENT_SOCKET}");
}

fn resolve_socket_path(socket: Option<String>, provider: Option<String>) -> Result<PathBuf, String> {
    if let Some(p) = socket {
        return Ok(expand_home(&p));
    }
    let provider = provider.ok_or("either --socket or --provider is required")?;
    let base_dir = std::env::var("MIXCLUSTER_BASE_DIR")
        .map_err(|_| "--provider needs $MIXCLUSTER_BASE_DIR to be set".to_string())?;
    Ok(expand_home(&base_dir).join(provider).join(MANAGEMENT_SOCKET))
}

// ── Entry point ────────────────────────────────────────────────────────────

fn main() {
    let _ = dotenvy::dotenv();
    let args = parse_args();

    let (user, key) = match args.rest.as_slice() {
        [user, key] => (user.clone(), key.clone()),
        _ => {
            eprintln!("error: expected <user> <public-key>");
            eprintln!("  run 'mixcluster-provision --help' for usage");
            process::exit(1);
        }
    };

    let key: PublicKey = match key.parse() {
        Ok(k) => k,
        Err(e) => {
            eprintln!("error: {e}");
            process::exit(1);
        }
    };

    let socket_path = match resolve_socket_path(args.socket, args.provider) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("error: {e}");
            process::exit(1);
        }
    };

    let rt = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("error: tokio runtime: {e}");
            process::exit(1);
        }
    };

    match rt.block_on(provision_user(&socket_path, &user, &key)) {
        Ok(()) => println!("ok  {user} provisioned via {}", socket_path.display()),
        Err(e) => {
            eprintln!("error: {e}");
            process::exit(1);
        }
    }
}
