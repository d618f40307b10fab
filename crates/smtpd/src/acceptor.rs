//! The listening socket and the per-connection task that leases a
//! handler from the pool and drives it.
use crate::accounting::{ConnectionAccounting, ConnectionTicket};
use crate::config::{SmtpServerConfig, SocketType};
use crate::dispatcher::CommandDispatcher;
use crate::handler::{ConnectionContext, ConnectionHandler};
use crate::management::ServiceInfo;
use crate::metrics::{CONNECTIONS_ACCEPTED, CONNECTIONS_REFUSED};
use crate::pool::{HandlerPool, PoolPolicy};
use crate::session::{Session, SessionSettings};
use crate::watchdog::Watchdog;
use anyhow::Context;
use dns_resolver::Resolver;
use server_lifecycle::{Activity, LifeCycle, LifeCycleHandle};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

const SWEEP_INTERVAL: Duration = Duration::from_secs(30);
/// How long to wait for connections to clean up after they have
/// been forcibly cancelled
const FORCE_CLOSE_WAIT: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum ListenerError {
    #[error(
        "{service}: cannot listen on {address} port {port}: \
         the address is already exclusively in use by another application"
    )]
    AddressInUse {
        service: &'static str,
        address: IpAddr,
        port: u16,
    },
    #[error("{service}: cannot listen on {address} port {port}: permission denied ({detail})")]
    PermissionDenied {
        service: &'static str,
        address: IpAddr,
        port: u16,
        detail: &'static str,
    },
    #[error("{service}: cannot listen on {address} port {port}: {source}")]
    Bind {
        service: &'static str,
        address: IpAddr,
        port: u16,
        #[source]
        source: std::io::Error,
    },
}

impl ListenerError {
    fn from_io(addr: SocketAddr, err: std::io::Error) -> Self {
        let service = ServiceInfo::SERVICE_TYPE;
        let (address, port) = (addr.ip(), addr.port());
        match err.kind() {
            std::io::ErrorKind::AddrInUse => Self::AddressInUse {
                service,
                address,
                port,
            },
            std::io::ErrorKind::PermissionDenied => Self::PermissionDenied {
                service,
                address,
                port,
                detail: if port < 1024 {
                    "binding to a privileged port requires elevated privileges"
                } else {
                    "the operating system refused access to the address"
                },
            },
            _ => Self::Bind {
                service,
                address,
                port,
                source: err,
            },
        }
    }
}

fn bind(addr: SocketAddr, backlog: u32) -> Result<TcpListener, ListenerError> {
    let socket = match addr {
        SocketAddr::V4(_) => TcpSocket::new_v4(),
        SocketAddr::V6(_) => TcpSocket::new_v6(),
    }
    .map_err(|err| ListenerError::from_io(addr, err))?;
    socket
        .set_reuseaddr(true)
        .map_err(|err| ListenerError::from_io(addr, err))?;
    socket
        .bind(addr)
        .map_err(|err| ListenerError::from_io(addr, err))?;
    socket
        .listen(backlog)
        .map_err(|err| ListenerError::from_io(addr, err))
}

/// State shared between the accept loop and every connection task
struct Shared {
    config: SmtpServerConfig,
    settings: Arc<SessionSettings>,
    dispatcher: Arc<CommandDispatcher>,
    resolver: Arc<dyn Resolver>,
    tls: Option<TlsAcceptor>,
    pool: HandlerPool<ConnectionHandler>,
    accounting: ConnectionAccounting,
    life_cycle: LifeCycleHandle,
    local_addr: SocketAddr,
}

pub struct SmtpListener {
    config: SmtpServerConfig,
    dispatcher: Arc<CommandDispatcher>,
    resolver: Arc<dyn Resolver>,
}

impl SmtpListener {
    pub fn new(
        config: SmtpServerConfig,
        dispatcher: CommandDispatcher,
        resolver: Arc<dyn Resolver>,
    ) -> Self {
        Self {
            config,
            dispatcher: Arc::new(dispatcher),
            resolver,
        }
    }

    /// Bind the listening socket and start accepting connections.
    /// Failure to bind is reported as a `ListenerError`.
    pub async fn start(self) -> anyhow::Result<RunningListener> {
        let config = self.config;
        let settings = Arc::new(SessionSettings::from_config(&config));

        // Fail at startup rather than on the first connection
        server_runtime::get_named_pool(&config.thread_pool)
            .with_context(|| format!("preparing thread pool {}", config.thread_pool))?;

        let tls = match config.socket_type {
            SocketType::Plain => None,
            SocketType::Secure => {
                let tls_config = crate::tls::make_server_config(
                    &settings.hello_name,
                    config.tls_private_key.as_deref(),
                    config.tls_certificate.as_deref(),
                )
                .await
                .context("configuring TLS")?;
                Some(TlsAcceptor::from(tls_config))
            }
        };

        let address = SocketAddr::new(
            config
                .bind_address
                .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED)),
            config.port,
        );
        let listener = bind(address, config.backlog).inspect_err(|err| {
            tracing::error!("{err}");
        })?;
        let local_addr = listener
            .local_addr()
            .context("querying the listening address")?;

        tracing::info!(
            "{} listening on {local_addr} (backlog {}, connection limit {:?}, \
             per-source limit {:?}, hello name {}, socket type {:?}, thread pool {})",
            ServiceInfo::SERVICE_TYPE,
            config.backlog,
            config.connection_limit,
            config.connection_limit_per_source,
            settings.hello_name,
            config.socket_type,
            config.thread_pool,
        );

        let policy = match config.connection_limit {
            Some(capacity) => PoolPolicy::Bounded {
                capacity,
                acquire_timeout: config.handler_pool.acquire_timeout,
            },
            None => PoolPolicy::Unbounded {
                max_idle: config.handler_pool.max_idle,
                idle_timeout: config.handler_pool.idle_timeout,
            },
        };
        let pool = HandlerPool::new(policy, ConnectionHandler::default);
        let sweeper = match policy {
            PoolPolicy::Unbounded { .. } => Some(pool.spawn_sweeper(SWEEP_INTERVAL)),
            PoolPolicy::Bounded { .. } => None,
        };

        let life_cycle = LifeCycle::new(format!("{} on {local_addr}", ServiceInfo::SERVICE_TYPE));
        let root = CancellationToken::new();
        let shared = Arc::new(Shared {
            accounting: ConnectionAccounting::new(
                config.connection_limit,
                config.connection_limit_per_source,
            ),
            config,
            settings,
            dispatcher: self.dispatcher,
            resolver: self.resolver,
            tls,
            pool,
            life_cycle: life_cycle.handle(),
            local_addr,
        });

        let accept_task = tokio::spawn(accept_loop(listener, shared.clone(), root.clone()));

        Ok(RunningListener {
            local_addr,
            shared,
            life_cycle,
            root,
            accept_task: Some(accept_task),
            sweeper,
        })
    }
}

async fn accept_loop(
    listener: TcpListener,
    shared: Arc<Shared>,
    root: CancellationToken,
) -> anyhow::Result<()> {
    let mut shutdown = shared.life_cycle.subscribe();
    loop {
        let (socket, peer) = tokio::select! {
            _ = shutdown.shutting_down() => return Ok(()),
            _ = root.cancelled() => return Ok(()),
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(err) if is_connection_error(&err) => {
                    tracing::debug!("accept: {err:#}");
                    continue;
                }
                Err(err) => {
                    tracing::error!("accept failed on {}: {err:#}", shared.local_addr);
                    return Err(err).context("accepting connections");
                }
            },
        };

        let ticket = match shared.accounting.try_admit(peer.ip()) {
            Ok(ticket) => ticket,
            Err(refusal) => {
                tracing::debug!("refusing connection from {peer}: {refusal}");
                CONNECTIONS_REFUSED
                    .with_label_values(&[refusal.reason()])
                    .inc();
                continue;
            }
        };
        let Some(activity) = shared
            .life_cycle
            .activity(format!("connection from {peer}"))
        else {
            return Ok(());
        };
        CONNECTIONS_ACCEPTED.inc();

        let socket = match socket.into_std() {
            Ok(socket) => socket,
            Err(err) => {
                tracing::debug!("detaching connection from {peer}: {err:#}");
                continue;
            }
        };
        let token = root.child_token();
        let task = serve_connection(shared.clone(), socket, peer, token, ticket, activity);
        if let Err(err) = server_runtime::spawn_on(&shared.config.thread_pool, task) {
            tracing::error!(
                "failed to spawn connection task on pool {}: {err:#}",
                shared.config.thread_pool
            );
        }
    }
}

/// Errors that concern only the connection being accepted
fn is_connection_error(err: &std::io::Error) -> bool {
    use std::io::ErrorKind;
    matches!(
        err.kind(),
        ErrorKind::ConnectionAborted
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionRefused
            | ErrorKind::Interrupted
    )
}

async fn serve_connection(
    shared: Arc<Shared>,
    socket: std::net::TcpStream,
    peer: SocketAddr,
    token: CancellationToken,
    _ticket: ConnectionTicket,
    _activity: Activity,
) {
    let trusted = shared.config.is_authorized(peer.ip());
    let mut session = Session::new(
        peer,
        peer.ip().to_canonical().to_string(),
        shared.local_addr,
        trusted,
        shared.settings.clone(),
    );
    let span = tracing::debug_span!("connection", session = %session.id, peer = %peer);

    async move {
        tracing::debug!("accepted connection (trusted: {trusted})");

        let mut lease = match shared.pool.acquire().await {
            Ok(lease) => lease,
            Err(err) => {
                tracing::debug!("refusing connection: {err}");
                CONNECTIONS_REFUSED
                    .with_label_values(&["pool_exhausted"])
                    .inc();
                return;
            }
        };
        let watchdog = Watchdog::arm(token.clone(), shared.config.connection_timeout);

        if let Some(handler) = lease.get_mut() {
            match converse(&shared, socket, &mut session, handler, &token, &watchdog).await {
                Ok(()) if watchdog.has_expired() => {
                    tracing::debug!("connection closed by watchdog");
                }
                Ok(()) => tracing::debug!("connection closed"),
                Err(err) => tracing::debug!("connection ended with error: {err:#}"),
            }
        }

        watchdog.disarm();
        lease.release();
    }
    .instrument(span)
    .await
}

async fn converse(
    shared: &Shared,
    socket: std::net::TcpStream,
    session: &mut Session,
    handler: &mut ConnectionHandler,
    token: &CancellationToken,
    watchdog: &Watchdog,
) -> anyhow::Result<()> {
    let socket = TcpStream::from_std(socket).context("registering connection")?;
    if let Ok(local_addr) = socket.local_addr() {
        session.local_addr = local_addr;
    }

    if shared.config.resolve_remote_host {
        tokio::select! {
            _ = token.cancelled() => return Ok(()),
            names = shared.resolver.resolve_ptr(session.remote_ip()) => match names {
                Ok(names) => {
                    if let Some(name) = names.into_iter().next() {
                        session.remote_host = name;
                    }
                }
                Err(err) => tracing::debug!("reverse lookup: {err}"),
            }
        }
    }

    let ctx = ConnectionContext {
        dispatcher: &shared.dispatcher,
        token: token.clone(),
        shutdown: shared.life_cycle.subscribe(),
        watchdog,
    };

    match &shared.tls {
        Some(acceptor) => {
            let stream = tokio::select! {
                _ = token.cancelled() => return Ok(()),
                stream = acceptor.accept(socket) => stream.context("TLS handshake")?,
            };
            session.secure = true;
            handler.handle(stream, session, ctx).await
        }
        None => handler.handle(socket, session, ctx).await,
    }
}

/// A listener that is accepting connections. Dropping it stops the
/// accept loop and force-closes every connection; `shutdown` does
/// so gracefully.
pub struct RunningListener {
    local_addr: SocketAddr,
    shared: Arc<Shared>,
    life_cycle: LifeCycle,
    root: CancellationToken,
    accept_task: Option<JoinHandle<anyhow::Result<()>>>,
    sweeper: Option<JoinHandle<()>>,
}

impl RunningListener {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn active_connections(&self) -> usize {
        self.shared.accounting.active()
    }

    pub fn info(&self) -> ServiceInfo {
        let config = &self.shared.config;
        ServiceInfo {
            service_type: ServiceInfo::SERVICE_TYPE,
            port: self.local_addr.port(),
            bind_address: config.bind_address,
            socket_type: config.socket_type,
            enabled: config.enabled,
            hello_name: self.shared.settings.hello_name.clone(),
            connection_limit: config.connection_limit,
            connection_limit_per_source: config.connection_limit_per_source,
            active_connections: self.active_connections(),
        }
    }

    /// Resolves if the accept loop stops on its own, which only
    /// happens when accepting fails unrecoverably.
    pub async fn closed(&mut self) -> anyhow::Result<()> {
        let Some(task) = self.accept_task.as_mut() else {
            return Ok(());
        };
        let result = task.await;
        self.accept_task.take();
        result.context("accept loop panicked")?
    }

    /// Stop accepting, ask idle connections to close, then wait up
    /// to `grace` for the rest to finish before forcing them closed.
    /// Returns true if every connection finished within `grace`.
    pub async fn shutdown(mut self, grace: Duration) -> bool {
        tracing::info!(
            "{} on {}: shutting down",
            ServiceInfo::SERVICE_TYPE,
            self.local_addr
        );
        self.life_cycle.begin_shutdown();
        if let Some(task) = self.accept_task.take() {
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => tracing::error!("accept loop: {err:#}"),
                Err(err) => tracing::error!("accept loop: {err:#}"),
            }
        }

        let drained = self.life_cycle.wait_for_idle(grace).await;
        if !drained {
            tracing::info!(
                "forcing {} connections closed",
                self.shared.accounting.active()
            );
            self.root.cancel();
            if !self.life_cycle.wait_for_idle(FORCE_CLOSE_WAIT).await {
                tracing::error!("connections did not clean up after being cancelled");
            }
        }
        drained
    }
}

impl Drop for RunningListener {
    fn drop(&mut self) {
        self.root.cancel();
        if let Some(task) = self.accept_task.take() {
            task.abort();
        }
        if let Some(sweeper) = self.sweeper.take() {
            sweeper.abort();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use k9::assert_equal;

    #[tokio::test]
    async fn address_in_use() {
        let first = bind("127.0.0.1:0".parse().unwrap(), 5).unwrap();
        let addr = first.local_addr().unwrap();
        // The first socket is still listening
        let err = std::net::TcpListener::bind(addr)
            .map_err(|err| ListenerError::from_io(addr, err))
            .unwrap_err();
        assert!(
            matches!(err, ListenerError::AddressInUse { port, .. } if port == addr.port()),
            "{err:?}"
        );
        assert!(err
            .to_string()
            .contains("already exclusively in use by another application"));
    }

    #[test]
    fn permission_denied_mentions_privileged_ports() {
        let err = ListenerError::from_io(
            "0.0.0.0:25".parse().unwrap(),
            std::io::Error::from(std::io::ErrorKind::PermissionDenied),
        );
        assert_equal!(
            err.to_string(),
            "SMTP Service: cannot listen on 0.0.0.0 port 25: permission denied \
             (binding to a privileged port requires elevated privileges)"
        );

        let err = ListenerError::from_io(
            "0.0.0.0:2525".parse().unwrap(),
            std::io::Error::other("boom"),
        );
        assert!(matches!(err, ListenerError::Bind { port: 2525, .. }));
    }
}
