use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

mod builder;
mod cli;
mod config;
mod deploy;
mod docker;
mod image;
mod login;
mod server;
mod signals;
mod vars;

use cli::Command;
use config::BerthConfig;
use deploy::runner::Deployer;
use deploy::{DeployOptions, DeployReport};

#[tokio::main]
async fn main() -> ExitCode {
    dotenv::dotenv().ok();
    env_logger::init();

    match &cli::get_cli_args().command {
        Some(Command::Stop) => signals::send_stop(),
        Some(Command::Build { context, file, tag }) => {
            build(context, file.as_deref(), tag.as_deref()).await
        }
        Some(Command::Serve) | None => serve().await,
    }
}

async fn build(context: &Path, file: Option<&Path>, tag: Option<&str>) -> ExitCode {
    let config = match BerthConfig::try_init() {
        Ok(config) => config,
        Err(err) => {
            log::error!("Unable to read config: {err}");
            return ExitCode::FAILURE;
        }
    };

    let report = match builder::run(config.registry.as_ref(), context, file, tag).await {
        Ok(image) => DeployReport::success(image.to_string()),
        Err(err) => {
            log::error!("Build failed: {err}");
            DeployReport::failure(err.to_string())
        }
    };

    // The result contract is the subcommand's only stdout output.
    match serde_json::to_string(&report) {
        Ok(body) => println!("{body}"),
        Err(err) => log::error!("Unable to serialize build report: {err}"),
    }

    if report.exit_code == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

async fn serve() -> ExitCode {
    let config = match BerthConfig::try_init() {
        Ok(config) => config,
        Err(err) => {
            log::error!("Unable to read config: {err}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(err) = signals::write_pid_file() {
        log::error!("Unable to write pid file: {err}");
        return ExitCode::FAILURE;
    }

    let listen = cli::get_cli_args().listen.unwrap_or(config.listen);
    let deployer = Arc::new(Deployer::new(DeployOptions {
        lower_port: config.lower_port,
        source_port: config.source_port,
        base_url: config.base_url,
        success_patterns: config.success_patterns,
    }));

    let (shutdown_tx, mut shutdown_rx) = tokio::sync::mpsc::channel::<()>(1);
    signals::handle_shutdown(shutdown_tx);
    let _ = sd_notify::notify(true, &[sd_notify::NotifyState::Ready]);

    let result = server::serve(Arc::clone(&deployer), listen, async move {
        let _ = shutdown_rx.recv().await;
    })
    .await;

    if let Err(err) = &result {
        log::error!("Server error: {err}");
    }

    log::info!("Shutting down; removing deployed containers");
    deployer.shutdown().await;
    signals::remove_pid_file();

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(_) => ExitCode::FAILURE,
    }
}
