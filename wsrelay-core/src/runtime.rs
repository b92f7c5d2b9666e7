//! The accept-and-flush loop.
//!
//! A [`Runtime`] owns the listening socket and the scheduler. Every tick it
//!
//! 1. accepts pending connections (waiting up to `accept_timeout` when tasks
//!    are queued, indefinitely when nothing else is runnable),
//! 2. admits each new client and queues its tasks,
//! 3. resumes every queued task once,
//! 4. sleeps for `tick`.
//!
//! All client and subscription work happens inside step 3, on the task that
//! called [`Runtime::run`].
//!
//! # Examples
//!
//! ```no_run
//! use std::sync::Arc;
//! use wsrelay_core::config::ServerConfig;
//! use wsrelay_core::handler::handler;
//! use wsrelay_core::router::HandlerRouter;
//! use wsrelay_core::runtime::Runtime;
//!
//! async fn ping() -> &'static str {
//!     "pong"
//! }
//!
//! # async fn run() -> wsrelay_core::Result<()> {
//! let router = HandlerRouter::new().route("ping", handler(ping));
//! let runtime = Runtime::bind(ServerConfig::default(), Arc::new(router)).await?;
//! runtime.run().await
//! # }
//! ```

use crate::channel::{self, Channel};
use crate::client::Client;
use crate::config::ServerConfig;
use crate::dispatch::RequestDispatcher;
use crate::error::{Error, Result};
use crate::messenger::Messenger;
use crate::registry::ClientRegistry;
use crate::scheduler::Scheduler;
use crate::session::{self, SessionContext, SessionSettings};
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tracing::{error, info, warn};

/// A bound server, ready to run.
pub struct Runtime {
    listener: TcpListener,
    local_addr: SocketAddr,
    config: ServerConfig,
    scheduler: Arc<Scheduler>,
    context: Arc<SessionContext>,
}

impl Runtime {
    /// Binds the listener, connects the broker and starts the built-in channels.
    pub async fn bind(config: ServerConfig, dispatcher: Arc<dyn RequestDispatcher>) -> Result<Self> {
        Self::bind_with_channels(config, dispatcher, channel::builtin()).await
    }

    /// Like [`bind`](Self::bind) with an explicit channel list.
    ///
    /// Fails with [`Error::Bind`] when the address is unavailable and with
    /// [`Error::BrokerConnect`] when a configured broker is unreachable.
    pub async fn bind_with_channels(
        config: ServerConfig,
        dispatcher: Arc<dyn RequestDispatcher>,
        channels: Vec<Arc<dyn Channel>>,
    ) -> Result<Self> {
        config.validate()?;

        let addr = config.bind_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| Error::bind(&addr, e))?;
        let local_addr = listener.local_addr().map_err(|e| Error::bind(&addr, e))?;

        let registry = Arc::new(ClientRegistry::new());
        let messenger = Arc::new(Messenger::connect(registry, &config).await?);
        let scheduler = Arc::new(Scheduler::new());
        messenger.start(channels, &scheduler);
        dispatcher.on_start(&messenger);

        let context = Arc::new(SessionContext {
            messenger,
            dispatcher,
            settings: SessionSettings {
                ping_timeout: config.ping_timeout(),
                read_poll: config.read_poll(),
                read_chunk: config.read_chunk,
            },
        });

        info!("relay bound to {}", local_addr);
        Ok(Self {
            listener,
            local_addr,
            config,
            scheduler,
            context,
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Shared messenger.
    pub fn messenger(&self) -> Arc<Messenger> {
        self.context.messenger.clone()
    }

    /// Client registry.
    pub fn registry(&self) -> Arc<ClientRegistry> {
        self.context.messenger.registry().clone()
    }

    /// Task scheduler.
    pub fn scheduler(&self) -> Arc<Scheduler> {
        self.scheduler.clone()
    }

    /// Runs until Ctrl-C or SIGTERM.
    pub async fn run(self) -> Result<()> {
        self.run_until(shutdown_signal()).await
    }

    /// Runs until `shutdown` completes.
    ///
    /// On return every queued task is dropped, which closes every client.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        info!("relay listening on {}", self.local_addr);

        loop {
            let wait = if self.scheduler.is_empty() {
                None
            } else {
                Some(self.config.accept_timeout())
            };

            let accepted = tokio::select! {
                biased;
                _ = &mut shutdown => break,
                accepted = accept_within(&self.listener, wait) => accepted,
            };

            if let Some(first) = accepted {
                self.admit(first);
                for _ in 1..self.config.max_accepts_per_tick {
                    match tokio::time::timeout(Duration::ZERO, self.listener.accept()).await {
                        Ok(next) => self.admit(next),
                        Err(_) => break,
                    }
                }
            }

            self.scheduler.flush();

            tokio::select! {
                biased;
                _ = &mut shutdown => break,
                _ = tokio::time::sleep(self.config.tick()) => {}
            }
        }

        info!(clients = self.registry().len(), "relay shutting down");
        Ok(())
    }

    fn admit(&self, accepted: io::Result<(TcpStream, SocketAddr)>) {
        match accepted {
            Ok((stream, peer_addr)) => {
                if let Err(e) = stream.set_nodelay(true) {
                    warn!(peer = %peer_addr, error = %e, "failed to set TCP_NODELAY");
                }
                let client = Client::new(stream, peer_addr, self.config.max_frame_size);
                info!(client = %client.id(), peer = %peer_addr, "connection accepted");
                session::admit(client, &self.context, &self.scheduler);
            }
            Err(e) => warn!(error = %e, "accept failed"),
        }
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("local_addr", &self.local_addr)
            .field("queued_tasks", &self.scheduler.len())
            .finish()
    }
}

async fn accept_within(
    listener: &TcpListener,
    wait: Option<Duration>,
) -> Option<io::Result<(TcpStream, SocketAddr)>> {
    match wait {
        None => Some(listener.accept().await),
        Some(wait) => tokio::time::timeout(wait, listener.accept()).await.ok(),
    }
}

/// Completes on Ctrl-C, or SIGTERM on Unix.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received ctrl-c"),
        _ = terminate => info!("received SIGTERM"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{Caller, Reply, Request};
    use async_trait::async_trait;

    struct Nothing;

    #[async_trait]
    impl RequestDispatcher for Nothing {
        async fn dispatch(&self, _request: Request, _caller: Caller) -> Result<Reply> {
            Ok(Reply::Empty)
        }
    }

    fn local_config() -> ServerConfig {
        ServerConfig::default().with_port(0).without_broker()
    }

    #[tokio::test]
    async fn test_bind_reports_address() {
        let runtime = Runtime::bind(local_config(), Arc::new(Nothing)).await.unwrap();
        assert_ne!(runtime.local_addr().port(), 0);
        assert!(runtime.registry().is_empty());
        assert!(runtime.scheduler().is_empty());
    }

    #[tokio::test]
    async fn test_bind_conflict_is_fatal() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = taken.local_addr().unwrap().port();

        let err = Runtime::bind(local_config().with_port(port), Arc::new(Nothing))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Bind { .. }));
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_unreachable_broker_is_fatal() {
        let free = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = free.local_addr().unwrap().port();
        drop(free);

        let config = ServerConfig::default()
            .with_port(0)
            .with_broker(crate::config::BrokerConfig::new("127.0.0.1", port));
        let err = Runtime::bind(config, Arc::new(Nothing)).await.unwrap_err();
        assert!(matches!(err, Error::BrokerConnect { .. }));
    }

    #[tokio::test]
    async fn test_accepts_until_shutdown() {
        let config = local_config().with_tick(Duration::from_millis(5));
        let runtime = Runtime::bind(config, Arc::new(Nothing)).await.unwrap();
        let addr = runtime.local_addr();
        let registry = runtime.registry();

        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let server = tokio::spawn(runtime.run_until(async {
            let _ = rx.await;
        }));

        let _a = TcpStream::connect(addr).await.unwrap();
        let _b = TcpStream::connect(addr).await.unwrap();
        for _ in 0..100 {
            if registry.len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(registry.len(), 2);

        tx.send(()).unwrap();
        server.await.unwrap().unwrap();
    }
}
