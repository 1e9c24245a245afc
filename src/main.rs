use smtp_sinkhole::intake::relay::install_crypto_provider;
use smtp_sinkhole::{SinkConfig, SinkPipeline, SmtpServer};
use std::net::TcpListener;
use std::process;
use std::sync::Arc;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let mut args = std::env::args();
    let program = args.next().unwrap_or_else(|| "smtp-sinkhole".to_string());

    let config = match SinkConfig::from_args(args) {
        Ok(Some(config)) => config,
        Ok(None) => {
            println!("{}", SinkConfig::usage(&program));
            return;
        }
        Err(e) => {
            tracing::error!("{e}");
            eprintln!("{}", SinkConfig::usage(&program));
            process::exit(1);
        }
    };

    install_crypto_provider();

    let pipeline = match SinkPipeline::from_config(&config) {
        Ok(pipeline) => pipeline,
        Err(e) => {
            tracing::error!(error = %e, "Failed to set up relay");
            process::exit(1);
        }
    };

    tracing::info!(
        mail_dir = ?config.mail_dir,
        forward = config.forward,
        "Starting SMTP sinkhole"
    );

    let listener = match TcpListener::bind(config.listen_address()) {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(
                host = %config.listen_host,
                port = config.listen_port,
                error = %e,
                "Failed to bind listen address"
            );
            process::exit(1);
        }
    };

    let server = SmtpServer::new(&config.hostname, Arc::new(pipeline));
    let shutdown = server.shutdown_handle();
    let mut serve = tokio::task::spawn_blocking(move || server.start_with_listener(listener));

    tokio::select! {
        result = &mut serve => {
            // The accept loop only returns early on a setup failure
            match result {
                Ok(Ok(())) => return,
                Ok(Err(e)) => tracing::error!(error = %e, "Server stopped"),
                Err(e) => tracing::error!(error = %e, "Server thread failed"),
            }
            process::exit(1);
        }
        () = termination_signal() => {
            tracing::info!("Received shutdown signal, finishing in-flight messages");
        }
    }

    shutdown.shutdown();
    match serve.await {
        Ok(Ok(())) => tracing::info!("Shut down"),
        Ok(Err(e)) => tracing::error!(error = %e, "Server stopped with an error"),
        Err(e) => tracing::error!(error = %e, "Server thread failed"),
    }
}

#[cfg(unix)]
async fn termination_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut terminate) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => (),
                _ = terminate.recv() => (),
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "Cannot listen for SIGTERM");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn termination_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
