use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;

use std::process;
use std::sync::Arc;

use vpnbox_lib::controller::Controller;
use vpnbox_lib::sys::System;
use vpnbox_lib::{config, logging};

mod cli;
mod http;

async fn wait_for_shutdown() -> exitcode::ExitCode {
    let mut sigint = match signal(SignalKind::interrupt()) {
        Ok(sig) => sig,
        Err(e) => {
            tracing::error!(error = ?e, "error setting up SIGINT handler");
            return exitcode::IOERR;
        }
    };
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sig) => sig,
        Err(e) => {
            tracing::error!(error = ?e, "error setting up SIGTERM handler");
            return exitcode::IOERR;
        }
    };
    let mut sighup = match signal(SignalKind::hangup()) {
        Ok(sig) => sig,
        Err(e) => {
            tracing::error!(error = ?e, "error setting up SIGHUP handler");
            return exitcode::IOERR;
        }
    };

    loop {
        tokio::select! {
            _ = sigint.recv() => {
                tracing::info!("received SIGINT, shutting down");
                return exitcode::OK;
            }
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM, shutting down");
                return exitcode::OK;
            }
            _ = sighup.recv() => {
                tracing::info!("received SIGHUP");
            }
        }
    }
}

async fn run(args: cli::Cli) -> exitcode::ExitCode {
    let config = match config::read(&args.config_path).await {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = ?e, config_file = %args.config_path.display(), "error loading config");
            return exitcode::CONFIG;
        }
    };

    let listener = match tokio::net::TcpListener::bind(&config.listener).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(error = ?e, listener = %config.listener, "error binding listener");
            return exitcode::UNAVAILABLE;
        }
    };

    let sys = match System::real() {
        Ok(sys) => sys,
        Err(e) => {
            tracing::error!(error = ?e, "error connecting system backends");
            return exitcode::OSERR;
        }
    };

    let controller = match Controller::new(config.clone(), sys).await {
        Ok(controller) => controller,
        Err(e) => {
            tracing::error!(error = ?e, "failed to start network controller");
            return exitcode::OSERR;
        }
    };

    let http_shutdown = CancellationToken::new();
    let server = {
        let app = http::router(Arc::clone(&controller));
        let token = http_shutdown.clone();
        tokio::spawn(async move {
            let shutdown = async move { token.cancelled().await };
            if let Err(e) = axum::serve(listener, app).with_graceful_shutdown(shutdown).await {
                tracing::error!(error = ?e, "http server error");
            }
        })
    };
    tracing::info!(listener = %config.listener, "listening");

    let exit = match config.vpn_configs.first() {
        Some(first) => match controller.set_vpn(first).await {
            Ok(()) => wait_for_shutdown().await,
            Err(e) => {
                tracing::error!(error = ?e, name = %first.name, "failed to setup vpn");
                exitcode::UNAVAILABLE
            }
        },
        None => wait_for_shutdown().await,
    };

    // controller first, the status surface stays up until the box is torn
    // down
    if let Err(e) = controller.close().await {
        tracing::warn!(error = ?e, "error closing controller");
    }
    http_shutdown.cancel();
    if let Err(e) = server.await {
        tracing::warn!(error = ?e, "error joining http server");
    }

    exit
}

#[tokio::main]
async fn main() {
    let args = cli::parse();

    logging::init();
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        "starting {}",
        env!("CARGO_PKG_NAME")
    );

    let exit = run(args).await;

    if exit != exitcode::OK {
        tracing::warn!("abnormal exit");
    }

    process::exit(exit)
}
