// Use mimalloc as the global allocator for better performance
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use anyhow::{anyhow, Result};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use sockem::config::{self, CliArgs, Command, CryptAction, FileConfig};
use sockem::core::{crypt, Server};
use sockem::logger::{self, log};
use sockem::server_runner;

fn main() {
    let cli = CliArgs::parse_args();
    if let Err(e) = cli.validate() {
        eprintln!("Error: {:#}", e);
        std::process::exit(2);
    }

    logger::init_logger(&cli.log_mode);

    if let Some(Command::Crypt { action, text, key }) = &cli.command {
        match run_crypt(&cli, *action, text, key.as_deref()) {
            Ok(out) => println!("{}", out),
            Err(e) => {
                log::error!(error = %e, "Crypt failed");
                std::process::exit(1);
            }
        }
        return;
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(cli.worker_threads())
        .enable_all()
        .build();
    let runtime = match runtime {
        Ok(rt) => rt,
        Err(e) => {
            log::error!(error = %e, "Failed to build runtime");
            std::process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(run(cli)) {
        log::error!(error = %format!("{:#}", e), "Fatal error");
        std::process::exit(1);
    }
}

fn run_crypt(cli: &CliArgs, action: CryptAction, text: &str, key: Option<&str>) -> Result<String> {
    let key = match (key, &cli.config_file) {
        (Some(key), _) => key.to_string(),
        (None, Some(path)) => FileConfig::read(path)?
            .crypt
            .key
            .ok_or_else(|| anyhow!("{} has no [crypt] key", path.display()))?,
        (None, None) => return Err(anyhow!("Crypt needs --key or a config file")),
    };
    Ok(match action {
        CryptAction::Encrypt => crypt::encrypt(text.as_bytes(), &key)?,
        CryptAction::Decrypt => crypt::decrypt_to_string(text, &key)?,
    })
}

async fn run(cli: CliArgs) -> Result<()> {
    let path = cli
        .config_file
        .clone()
        .ok_or_else(|| anyhow!("Config file is required (--config-file)"))?;
    let config = config::Config::load(&path)?.with_cli_overrides(&cli);

    log::info!(
        config = %path.display(),
        workers = cli.worker_threads(),
        "Starting SOCKS5 server"
    );

    let listen_addr = config.listen_addr()?;
    let listener = server_runner::bind_listener(listen_addr, config.conn.tcp_backlog)?;
    let server = Arc::new(Server::from_config(&config));

    // Create cancellation token for graceful shutdown
    let cancel_token = CancellationToken::new();
    let cancel_token_clone = cancel_token.clone();

    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let (mut sigint, mut sigterm) =
                match (signal(SignalKind::interrupt()), signal(SignalKind::terminate())) {
                    (Ok(i), Ok(t)) => (i, t),
                    (Err(e), _) | (_, Err(e)) => {
                        log::warn!(error = %e, "Failed to install signal handlers");
                        return;
                    }
                };

            tokio::select! {
                _ = sigint.recv() => {
                    log::info!("SIGINT received, shutting down...");
                }
                _ = sigterm.recv() => {
                    log::info!("SIGTERM received, shutting down...");
                }
            }
        }

        #[cfg(not(unix))]
        {
            tokio::signal::ctrl_c().await.ok();
            log::info!("Shutdown signal received...");
        }

        cancel_token_clone.cancel();
    });

    server_runner::run_server(server, listener, cancel_token).await
}
