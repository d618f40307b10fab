use anyhow::Context;
use dns_resolver::{Resolver, TestResolver};
use rfc5321::{Response, ResponseBuilder, ResponseLine};
use smtpd::config::DaemonConfig;
use smtpd::RunningListener;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

const IO_TIMEOUT: Duration = Duration::from_secs(10);

/// Settings shared by every test; tests append their own sections
const BASE_CONFIG: &str = r#"
[smtp]
bind_address = "127.0.0.1"
hello_name = "mx.test"
resolve_remote_host = false
"#;

/// A listener running in-process on an ephemeral port
pub struct TestDaemon {
    pub listener: RunningListener,
}

impl TestDaemon {
    /// `extra` is appended to the `[smtp]` section, and may open
    /// further sections of its own
    pub async fn start(extra: &str) -> anyhow::Result<Self> {
        Self::start_with_resolver(extra, TestResolver::new()).await
    }

    pub async fn start_with_resolver(
        extra: &str,
        resolver: TestResolver,
    ) -> anyhow::Result<Self> {
        Self::start_on_port(extra, resolver, 0).await
    }

    pub async fn start_on_port(
        extra: &str,
        resolver: TestResolver,
        port: u16,
    ) -> anyhow::Result<Self> {
        let mut config = DaemonConfig::parse(&format!("{BASE_CONFIG}{extra}"))
            .context("parsing test config")?;
        config.smtp.port = port;
        let resolver: Arc<dyn Resolver> = Arc::new(resolver);
        let listener = smtpd::start_listener(&config, resolver).await?;
        Ok(Self { listener })
    }

    pub fn addr(&self) -> SocketAddr {
        self.listener.local_addr()
    }

    pub async fn client(&self) -> anyhow::Result<TestClient> {
        TestClient::connect(self.addr()).await
    }

    /// Connect and consume the banner, which must be positive
    pub async fn greeted_client(&self) -> anyhow::Result<TestClient> {
        let mut client = self.client().await?;
        let banner = client
            .read_response()
            .await?
            .ok_or_else(|| anyhow::anyhow!("connection closed before the banner"))?;
        anyhow::ensure!(banner.code == 220, "unexpected banner {banner}");
        Ok(client)
    }
}

/// Speaks the protocol one line at a time
pub struct TestClient {
    stream: BufReader<TcpStream>,
}

impl TestClient {
    pub async fn connect(addr: SocketAddr) -> anyhow::Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("connecting to {addr}"))?;
        Ok(Self {
            stream: BufReader::new(stream),
        })
    }

    /// Read one complete, possibly multi-line, reply.
    /// Returns None if the server closed the connection instead.
    pub async fn read_response(&mut self) -> anyhow::Result<Option<Response>> {
        let mut builder: Option<ResponseBuilder> = None;
        loop {
            let mut line = String::new();
            let n = tokio::time::timeout(IO_TIMEOUT, self.stream.read_line(&mut line))
                .await
                .context("timed out waiting for a reply")??;
            if n == 0 {
                anyhow::ensure!(builder.is_none(), "connection closed mid-reply");
                return Ok(None);
            }
            let parsed = ResponseLine::parse(&line)
                .ok_or_else(|| anyhow::anyhow!("malformed reply line {line:?}"))?;
            match builder.as_mut() {
                None => builder = Some(ResponseBuilder::new(&parsed)),
                Some(builder) => builder
                    .add_line(&parsed)
                    .map_err(|line| anyhow::anyhow!("inconsistent reply line {line}"))?,
            }
            if parsed.is_final {
                return Ok(builder.map(ResponseBuilder::build));
            }
        }
    }

    pub async fn send_line(&mut self, line: &str) -> anyhow::Result<()> {
        let stream = self.stream.get_mut();
        stream.write_all(line.as_bytes()).await?;
        stream.write_all(b"\r\n").await?;
        Ok(())
    }

    /// Send a command and read its reply
    pub async fn command(&mut self, line: &str) -> anyhow::Result<Response> {
        self.send_line(line).await?;
        self.read_response()
            .await?
            .ok_or_else(|| anyhow::anyhow!("connection closed in response to {line}"))
    }

    /// True if the server closes the connection without sending
    /// anything further
    pub async fn is_closed(&mut self) -> anyhow::Result<bool> {
        Ok(self.read_response().await?.is_none())
    }
}
