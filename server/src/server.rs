//! Server assembly: listener reactor, worker fleet, dispatch wiring, and
//! graceful shutdown.

use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use listener::{DEFAULT_CALLBACK_ACCEPT_AT_ONCE, ServerSocket, ShutdownSocketSet};
use reactor::{LocalHandle, Reactor};
use socket2::SockAddr;

use crate::config::Config;
use crate::echo::EchoCallback;
use crate::metrics::MetricsObserver;
use crate::workers::{join_workers, spawn_workers};

const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Run the echo server until `shutdown` flips to true.
///
/// The calling thread becomes the listener's reactor thread.
pub fn run(config: &Config, shutdown: Arc<AtomicBool>) -> Result<(), Box<dyn std::error::Error>> {
    let shutdown_set = Arc::new(ShutdownSocketSet::new());
    let workers = spawn_workers(config.workers.threads)?;

    let reactor = Reactor::new()?;
    let socket = ServerSocket::new(reactor.local());
    socket.set_shutdown_socket_set(Arc::downgrade(&shutdown_set));
    socket.set_connection_event_callback(Some(Arc::new(MetricsObserver)));

    let listener_config = &config.listener;
    socket.set_max_accept_at_once(listener_config.max_accept_at_once);
    socket.set_max_messages_in_queue(listener_config.max_messages_in_queue);
    socket.set_queue_timeout(listener_config.queue_timeout());
    socket.set_accept_rate_adjust_speed(listener_config.accept_rate_adjust_speed);
    socket.set_reuse_port(listener_config.reuse_port);
    if let Some(qlen) = listener_config.tcp_fast_open_queue {
        socket.set_tcp_fast_open(qlen);
    }

    match listener_config.address {
        Some(address) => socket.bind(&SockAddr::from(address))?,
        None => socket.bind_port(listener_config.port)?,
    }
    socket.listen(listener_config.backlog)?;

    for addr in socket.local_addrs()? {
        tracing::info!("listening on {:?}", addr.as_socket());
    }

    let echo: Arc<EchoCallback> = Arc::new(EchoCallback);
    if workers.is_empty() {
        socket.add_accept_callback(echo, None, DEFAULT_CALLBACK_ACCEPT_AT_ONCE)?;
    } else {
        for worker in &workers {
            socket.add_accept_callback(
                echo.clone(),
                Some(worker.handle.clone()),
                DEFAULT_CALLBACK_ACCEPT_AT_ONCE,
            )?;
        }
    }
    socket.start_accepting()?;

    watch_shutdown(reactor.local(), socket.clone(), shutdown);
    reactor.run()?;

    socket.destroy();
    join_workers(workers);
    tracing::info!("shutdown complete");
    Ok(())
}

/// Poll the shutdown flag from the listener reactor; on shutdown, stop
/// accepting before the loop exits so no new connections slip in while
/// workers drain.
fn watch_shutdown(local: LocalHandle, socket: Rc<ServerSocket>, shutdown: Arc<AtomicBool>) {
    let next = local.clone();
    local.schedule_timer(SHUTDOWN_POLL_INTERVAL, move || {
        if shutdown.load(Ordering::Relaxed) {
            if let Err(e) = socket.stop_accepting(None) {
                tracing::warn!("error while stopping accepts: {e}");
            }
            next.handle().shutdown();
            return;
        }
        watch_shutdown(next, socket, shutdown);
    });
}
