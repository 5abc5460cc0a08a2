//! Accept loop, protocol dispatch, HTTP surrogate table, and periodic
//! tasks binding the transport-agnostic engine to real TCP sockets.

pub mod config;
pub mod dispatch;
pub mod periodic;
pub mod surrogate;
pub mod transport;

use std::sync::Arc;

use qio_core::Engine;
use tokio::net::TcpListener;

use config::ServerConfig;
use surrogate::SurrogateTable;

/// Registers the fixed `/qio/*` built-ins that every protocol driver
/// routes through (spec.md §4.9, §6). Application-level events are
/// registered by whatever embeds this crate; the core only owns the
/// ones named in the built-in event table.
pub fn register_builtins(_engine: &Arc<Engine>) {
    // ping, hostname, on/off, and callback/<id> are special-cased
    // directly in `Engine::route` rather than stored as trie entries,
    // since they need router-level state the `HandlerFn` slot doesn't
    // carry (see DESIGN.md). Nothing to register here today; kept as
    // the hook point for embedders adding their own `/qio/*`-adjacent
    // events without reaching into `Engine` directly.
}

/// Bind the configured listener(s) and run the accept loop plus both
/// periodic tasks until `shutdown` is notified. Returns once every
/// spawned task has finished.
pub async fn run(config: ServerConfig, shutdown: Arc<tokio::sync::Notify>) -> std::io::Result<()> {
    let config = Arc::new(config);
    let engine = Engine::new(config.engine.clone());
    let surrogates = Arc::new(SurrogateTable::new());
    register_builtins(&engine);

    let listener = TcpListener::bind(config.bind_address).await?;
    tracing::info!(addr = %config.bind_address, "qio-server listening");

    let flash_listener = match &config.flash_policy_address {
        Some(addr) => Some(TcpListener::bind(addr).await?),
        None => None,
    };
    if let Some(addr) = &config.flash_policy_address {
        tracing::info!(%addr, "flash policy listener bound");
    }

    let broadcast_task = periodic::spawn_broadcast_loop(Arc::clone(&engine), Arc::clone(&shutdown));
    let heartbeat_task = periodic::spawn_heartbeat_loop(
        Arc::clone(&engine),
        Arc::clone(&surrogates),
        std::time::Duration::from_secs(config.engine.periodic_interval_secs),
        config.client_timeout,
        Arc::clone(&shutdown),
    );

    let accept_task = {
        let engine = Arc::clone(&engine);
        let surrogates = Arc::clone(&surrogates);
        let config = Arc::clone(&config);
        let shutdown = Arc::clone(&shutdown);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => {
                        let Ok((stream, peer)) = accepted else { continue };
                        let engine = Arc::clone(&engine);
                        let surrogates = Arc::clone(&surrogates);
                        let config = Arc::clone(&config);
                        tokio::spawn(async move {
                            dispatch::handle_connection(engine, surrogates, config, stream, peer).await;
                        });
                    }
                    _ = shutdown.notified() => return,
                }
            }
        })
    };

    let flash_task = flash_listener.map(|listener| {
        let engine = Arc::clone(&engine);
        let surrogates = Arc::clone(&surrogates);
        let config = Arc::clone(&config);
        let shutdown = Arc::clone(&shutdown);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => {
                        let Ok((stream, peer)) = accepted else { continue };
                        let engine = Arc::clone(&engine);
                        let surrogates = Arc::clone(&surrogates);
                        let config = Arc::clone(&config);
                        tokio::spawn(async move {
                            dispatch::handle_connection(engine, surrogates, config, stream, peer).await;
                        });
                    }
                    _ = shutdown.notified() => return,
                }
            }
        })
    });

    let _ = accept_task.await;
    let _ = broadcast_task.await;
    let _ = heartbeat_task.await;
    if let Some(task) = flash_task {
        let _ = task.await;
    }

    // Close every remaining client so no socket is left dangling after
    // the process decides to exit (spec.md §6 exit policy).
    for client in engine.registry.snapshot() {
        if let Some(sock) = &client.socket {
            sock.close(qio_core::CloseReason::Exit).await;
        }
    }

    Ok(())
}
