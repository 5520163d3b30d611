//! munin-agent - autonomous IRC agent with a linked bot mesh and a
//! remote control plane.

mod config;
mod control;
mod error;
mod events;
mod gencert;
mod host;
mod irc;
mod keystore;
mod mesh;
mod protect;
mod script;
mod stats;
mod triggers;
mod users;

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{error, info};

use crate::config::{Config, LogFormat};
use crate::error::AgentError;
use crate::host::AgentHost;
use crate::keystore::Keystore;

const EXIT_OK: i32 = 0;
const EXIT_USAGE: i32 = 1;
const EXIT_RUNTIME: i32 = 2;

struct CliArgs {
    subcommand: Option<String>,
    positional: Vec<String>,
    config_path: Option<PathBuf>,
}

/// Manual parsing; the surface is four subcommands and one flag.
fn parse_args() -> Result<CliArgs, String> {
    let mut args = std::env::args().skip(1);
    let mut parsed = CliArgs {
        subcommand: None,
        positional: Vec::new(),
        config_path: None,
    };
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-c" | "--config" => {
                let path = args.next().ok_or_else(|| format!("missing path after {}", arg))?;
                parsed.config_path = Some(PathBuf::from(path));
            }
            "setup" | "gencert" | "encrypt" | "decrypt" if parsed.subcommand.is_none() => {
                parsed.subcommand = Some(arg);
            }
            other if parsed.subcommand.is_some() => {
                parsed.positional.push(other.to_string());
            }
            other => return Err(format!("unknown argument: {}", other)),
        }
    }
    Ok(parsed)
}

fn default_config_path() -> PathBuf {
    config::data_dir().join("config.json")
}

fn env_keystore() -> Option<Arc<Keystore>> {
    std::env::var("MUNIN_PASSPHRASE")
        .ok()
        .filter(|p| !p.is_empty())
        .map(|p| Arc::new(Keystore::unlock(&p)))
}

fn prompt(question: &str, default: &str) -> String {
    print!("{} [{}]: ", question, default);
    let _ = std::io::stdout().flush();
    let mut line = String::new();
    if std::io::stdin().read_line(&mut line).is_err() {
        return default.to_string();
    }
    let trimmed = line.trim();
    if trimmed.is_empty() {
        default.to_string()
    } else {
        trimmed.to_string()
    }
}

fn prompt_passphrase() -> Result<String, String> {
    if let Ok(pass) = std::env::var("MUNIN_PASSPHRASE") {
        if !pass.is_empty() {
            return Ok(pass);
        }
    }
    let pass = prompt("Keystore passphrase", "");
    if pass.is_empty() {
        return Err("a passphrase is required".to_string());
    }
    Ok(pass)
}

fn cmd_setup(config_path: &PathBuf) -> i32 {
    if config_path.exists() {
        eprintln!(
            "{} already exists; delete it first or pick another path with --config",
            config_path.display()
        );
        return EXIT_USAGE;
    }
    println!("Munin agent setup - press Enter to accept defaults.");
    let name = prompt("Agent name", "munin");
    let host = prompt("IRC server host", "irc.libera.chat");
    let port: u16 = prompt("Port", "6697").parse().unwrap_or(6697);
    let tls = prompt("Use TLS (yes/no)", "yes").to_ascii_lowercase().starts_with('y');
    let nickname = prompt("Nickname", &name);
    let channel = prompt("Channel to join", "#munin");

    let document = serde_json::json!({
        "agentId": uuid::Uuid::new_v4().to_string(),
        "name": name,
        "servers": [{
            "id": host.split('.').nth(1).unwrap_or("main"),
            "host": host,
            "port": port,
            "tls": tls,
            "nickname": nickname,
            "altNicknames": [format!("{}_", nickname)],
            "autoJoin": [{"channel": channel}],
        }],
        "controlServer": {"enabled": false},
        "botnet": {"enabled": false},
    });

    if let Some(parent) = config_path.parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            eprintln!("cannot create {}: {}", parent.display(), e);
            return EXIT_RUNTIME;
        }
    }
    match serde_json::to_vec_pretty(&document)
        .map_err(|e| e.to_string())
        .and_then(|raw| std::fs::write(config_path, raw).map_err(|e| e.to_string()))
    {
        Ok(()) => {
            println!("Wrote {}", config_path.display());
            EXIT_OK
        }
        Err(e) => {
            eprintln!("failed to write config: {}", e);
            EXIT_RUNTIME
        }
    }
}

fn cmd_gencert(positional: &[String]) -> i32 {
    let path = positional
        .first()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("munin-agent.pem"));
    let password = positional.get(1).map(String::as_str);
    match gencert::generate(&path, password) {
        Ok(()) => {
            println!("Wrote {}", path.display());
            EXIT_OK
        }
        Err(e) => {
            eprintln!("gencert failed: {}", e);
            EXIT_RUNTIME
        }
    }
}

fn cmd_crypt(positional: &[String], encrypt: bool) -> i32 {
    let Some(path) = positional.first().map(PathBuf::from) else {
        eprintln!("usage: munin-agent {} <path>", if encrypt { "encrypt" } else { "decrypt" });
        return EXIT_USAGE;
    };
    let passphrase = match prompt_passphrase() {
        Ok(p) => p,
        Err(e) => {
            eprintln!("{}", e);
            return EXIT_USAGE;
        }
    };
    let ks = Keystore::unlock(&passphrase);
    let raw = match std::fs::read(&path) {
        Ok(raw) => raw,
        Err(e) => {
            eprintln!("read {}: {}", path.display(), e);
            return EXIT_USAGE;
        }
    };
    let result = if encrypt {
        if keystore::is_sealed(&raw) {
            eprintln!("{} is already encrypted", path.display());
            return EXIT_USAGE;
        }
        ks.encrypt(&raw)
    } else {
        ks.decrypt(&raw)
    };
    match result.and_then(|out| {
        std::fs::write(&path, out).map_err(|e| AgentError::Config(e.to_string()))
    }) {
        Ok(()) => {
            println!(
                "{} {}",
                if encrypt { "Encrypted" } else { "Decrypted" },
                path.display()
            );
            EXIT_OK
        }
        Err(e) => {
            eprintln!("{}", e);
            EXIT_RUNTIME
        }
    }
}

async fn cmd_run(config_path: PathBuf) -> i32 {
    let keystore = env_keystore();
    let config = match Config::load(&config_path, keystore.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("ERROR: failed to load config from {}: {}", config_path.display(), e);
            return EXIT_USAGE;
        }
    };

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    match config.log_format {
        LogFormat::Json => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_target(true)
                .json()
                .init();
        }
        LogFormat::Pretty => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_target(true)
                .init();
        }
    }

    if let Err(errors) = config::validate(&config) {
        for err in &errors {
            error!(error = %err, "configuration validation failed");
        }
        return EXIT_USAGE;
    }

    info!(
        agent = %config.name,
        servers = config.servers.len(),
        "starting munin-agent"
    );

    let data_dir = config_path
        .parent()
        .map(PathBuf::from)
        .unwrap_or_else(config::data_dir);
    let agent = AgentHost {
        config,
        data_dir,
        keystore,
    };
    match agent.run().await {
        Ok(()) => EXIT_OK,
        Err(e) => {
            error!(error = %e, "agent host failed");
            EXIT_RUNTIME
        }
    }
}

#[tokio::main]
async fn main() {
    let args = match parse_args() {
        Ok(args) => args,
        Err(e) => {
            eprintln!("{}", e);
            eprintln!("usage: munin-agent [-c config.json] [setup|gencert|encrypt|decrypt] ...");
            std::process::exit(EXIT_USAGE);
        }
    };
    let config_path = args.config_path.clone().unwrap_or_else(default_config_path);

    let code = match args.subcommand.as_deref() {
        Some("setup") => cmd_setup(&config_path),
        Some("gencert") => cmd_gencert(&args.positional),
        Some("encrypt") => cmd_crypt(&args.positional, true),
        Some("decrypt") => cmd_crypt(&args.positional, false),
        Some(_) => unreachable!("parse_args only admits known subcommands"),
        None => cmd_run(config_path).await,
    };
    std::process::exit(code);
}
