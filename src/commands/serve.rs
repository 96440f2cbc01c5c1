use crate::args::ServeArgs;
use anyhow::bail;
use ociswrapper::config::WrapperConfig;
use ociswrapper::http_server::{HttpServer, HttpServerConfig};
use ociswrapper::supervisor::{Supervisor, PARENT};
use tokio::sync::watch;
use tracing::{error, info, warn};

pub(crate) async fn cmd_serve(args: ServeArgs) -> anyhow::Result<()> {
    let config = WrapperConfig::resolve(args.layer(), args.config.as_deref())?;
    let supervisor = Supervisor::new(config.clone())?;

    if config.skip_ocis_run {
        info!("Skipping oCIS server startup");
    } else {
        supervisor.start(PARENT, Vec::new()).await?;
    }

    let server = HttpServer::new(
        HttpServerConfig {
            port: config.port,
            host: args.host.clone(),
        },
        supervisor.clone(),
    );

    let signals = shutdown_signal()?;
    let fatal = supervisor.fatal();
    server
        .run(async move {
            tokio::select! {
                _ = signals => {}
                _ = wait_fatal(fatal) => error!("Supervisor failed, shutting down control API"),
            }
        })
        .await?;

    info!("Stopping supervised processes...");
    if let Err(e) = supervisor.stop().await {
        warn!("{}", e);
    }

    let reason = supervisor.fatal().borrow().clone();
    if let Some(reason) = reason {
        bail!(reason);
    }

    Ok(())
}

async fn wait_fatal(mut fatal: watch::Receiver<Option<String>>) {
    if fatal.wait_for(Option::is_some).await.is_err() {
        std::future::pending::<()>().await;
    }
}

fn shutdown_signal() -> anyhow::Result<impl std::future::Future<Output = ()>> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    Ok(async move {
        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM"),
            _ = sigint.recv() => info!("Received SIGINT"),
        }
    })
}
