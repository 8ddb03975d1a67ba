pub mod auth_layer;
pub mod env;
pub mod error;
pub mod handlers;
pub mod respond;
pub mod router;
pub mod types;

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use axum_server::Handle;
pub use env::Env;
use tokio::task::JoinHandle;
use tracing::{error, info};

pub async fn run(env: Env) -> Result<JoinHandle<()>> {
    let addr: SocketAddr = env
        .config
        .webapi_listen_address
        .parse()
        .context("parsing webapi listen address")?;
    let handle = Handle::new();
    tokio::spawn({
        let handle = handle.clone();
        let cancel_token = env.cancel_token.clone();
        async move {
            cancel_token.cancelled().await;
            handle.graceful_shutdown(Some(Duration::from_secs(10)));
        }
    });
    info!("Server running @ http://{}", addr);
    Ok(tokio::spawn(async move {
        if axum_server::bind(addr)
            .handle(handle)
            .serve(router::new(env).into_make_service())
            .await
            .is_err()
        {
            error!("Panicked on join");
        }
        info!("Exited");
    }))
}
