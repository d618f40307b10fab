//! Drives one connection: reads command lines, dispatches them and
//! writes the replies, receives message bodies after DATA, and stops
//! on QUIT, EOF, cancellation or listener shutdown.
use crate::dispatcher::{CommandDispatcher, NextAction};
use crate::pool::Recycle;
use crate::session::Session;
use crate::watchdog::Watchdog;
use anyhow::Context;
use rfc5321::{codes, dsn, Response};
use server_lifecycle::ShutdownSubscription;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;

/// Longest command line we accept, including the CRLF
pub const MAX_LINE_LENGTH: usize = 1000;
/// Body lines longer than this are read in pieces
const MAX_DATA_LINE_LENGTH: usize = 64 * 1024;
/// Buffers larger than this are released rather than reused
const RETAIN_CAPACITY: usize = 1024 * 1024;

/// Everything a connection needs beyond its socket and session
pub struct ConnectionContext<'a> {
    pub dispatcher: &'a CommandDispatcher,
    pub token: CancellationToken,
    pub shutdown: ShutdownSubscription,
    pub watchdog: &'a Watchdog,
}

enum Line {
    Complete,
    TooLong,
    Eof,
}

/// Reusable per-connection buffers
#[derive(Default)]
pub struct ConnectionHandler {
    line: Vec<u8>,
    data: Vec<u8>,
}

impl Recycle for ConnectionHandler {
    fn recycle(&mut self) {
        self.line.clear();
        self.data.clear();
        if self.data.capacity() > RETAIN_CAPACITY {
            self.data = Vec::new();
        }
    }
}

impl ConnectionHandler {
    /// Run the conversation until it ends or `ctx.token` is cancelled.
    /// Cancellation interrupts any pending read, write or hook, and
    /// the stream is dropped before this returns.
    pub async fn handle<S>(
        &mut self,
        stream: S,
        session: &mut Session,
        ctx: ConnectionContext<'_>,
    ) -> anyhow::Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let token = ctx.token.clone();
        tokio::select! {
            _ = token.cancelled() => {
                tracing::debug!("connection cancelled");
                Ok(())
            }
            result = self.converse(BufReader::new(stream), session, ctx) => result,
        }
    }

    async fn converse<S>(
        &mut self,
        mut stream: BufReader<S>,
        session: &mut Session,
        mut ctx: ConnectionContext<'_>,
    ) -> anyhow::Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let banner = ctx.dispatcher.on_connect(session).await;
        write_response(&mut stream, &banner).await?;
        if !banner.is_positive() {
            return Ok(());
        }
        ctx.watchdog.reset();

        loop {
            self.line.clear();
            let line = tokio::select! {
                _ = ctx.shutdown.shutting_down() => {
                    let response = Response::with_status(
                        codes::SERVICE_NOT_AVAILABLE,
                        dsn::SYSTEM_NOT_ACCEPTING,
                        format!(
                            "{} Service shutting down, closing transmission channel",
                            session.hello_name()
                        ),
                    );
                    if let Err(err) = write_response(&mut stream, &response).await {
                        tracing::debug!("sending shutdown notice: {err:#}");
                    }
                    return Ok(());
                }
                line = read_line(&mut stream, &mut self.line, MAX_LINE_LENGTH) => line?,
            };

            let outcome = match line {
                Line::Eof => {
                    tracing::debug!("peer closed the connection");
                    return Ok(());
                }
                Line::TooLong => {
                    discard_rest_of_line(&mut stream, &mut self.line).await?;
                    write_response(
                        &mut stream,
                        &Response::with_status(
                            codes::SYNTAX_ERROR_COMMAND_UNRECOGNIZED,
                            dsn::DELIVERY_SYNTAX,
                            "Line too long",
                        ),
                    )
                    .await?;
                    ctx.watchdog.reset();
                    continue;
                }
                Line::Complete => {
                    let text = String::from_utf8_lossy(&self.line);
                    let text = text.trim_end_matches(['\r', '\n']);
                    tracing::trace!("recv: {text}");
                    ctx.dispatcher.dispatch(session, text).await
                }
            };

            write_response(&mut stream, &outcome.response).await?;
            ctx.watchdog.reset();

            match outcome.action {
                NextAction::Continue => {}
                NextAction::Disconnect => return Ok(()),
                NextAction::ReceiveData => {
                    if !self.receive_data(&mut stream, session, ctx.watchdog).await? {
                        return Ok(());
                    }
                    let response = ctx.dispatcher.on_message(session, &self.data).await;
                    self.data.clear();
                    write_response(&mut stream, &response).await?;
                    ctx.watchdog.reset();
                }
            }
        }
    }

    /// Read a message body up to the terminating dot, undoing dot
    /// stuffing. Returns false if the connection ended first.
    /// At most max_message_size + 1 bytes are retained, which is
    /// enough for the size check that follows.
    async fn receive_data<S>(
        &mut self,
        stream: &mut BufReader<S>,
        session: &Session,
        watchdog: &Watchdog,
    ) -> anyhow::Result<bool>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let retain_limit = match session.settings.max_message_size {
            0 => usize::MAX,
            max => usize::try_from(max).unwrap_or(usize::MAX).saturating_add(1),
        };
        self.data.clear();
        // An over-long line arrives in pieces; only the first piece
        // may carry the terminator or a stuffed dot.
        let mut at_line_start = true;

        loop {
            self.line.clear();
            let line = read_line(stream, &mut self.line, MAX_DATA_LINE_LENGTH).await?;
            if matches!(line, Line::Eof) {
                tracing::debug!("peer closed the connection during DATA");
                return Ok(false);
            }
            watchdog.reset();

            if at_line_start && (self.line == b".\r\n" || self.line == b".\n") {
                return Ok(true);
            }
            let content = match self.line.first() {
                Some(b'.') if at_line_start => &self.line[1..],
                _ => &self.line[..],
            };
            let room = retain_limit.saturating_sub(self.data.len());
            self.data
                .extend_from_slice(&content[..content.len().min(room)]);
            at_line_start = matches!(line, Line::Complete);
        }
    }
}

async fn write_response<S>(stream: &mut BufReader<S>, response: &Response) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    tracing::trace!("send: {}", response.to_single_line());
    stream
        .write_all(response.to_wire().as_bytes())
        .await
        .context("writing response")?;
    stream.flush().await.context("flushing response")?;
    Ok(())
}

/// Read up to and including the next LF, accepting at most `limit`
/// bytes. A line that is not terminated within the limit is
/// reported as too long, with the remainder left unread.
async fn read_line<S>(
    stream: &mut BufReader<S>,
    buf: &mut Vec<u8>,
    limit: usize,
) -> anyhow::Result<Line>
where
    S: AsyncRead + Unpin,
{
    let n = (&mut *stream)
        .take(limit as u64)
        .read_until(b'\n', buf)
        .await
        .context("reading line")?;
    if n == 0 {
        return Ok(Line::Eof);
    }
    if buf.last() == Some(&b'\n') {
        Ok(Line::Complete)
    } else if n >= limit {
        Ok(Line::TooLong)
    } else {
        // EOF in the middle of a line
        Ok(Line::Eof)
    }
}

async fn discard_rest_of_line<S>(stream: &mut BufReader<S>, buf: &mut Vec<u8>) -> anyhow::Result<()>
where
    S: AsyncRead + Unpin,
{
    loop {
        buf.clear();
        let n = (&mut *stream)
            .take(MAX_LINE_LENGTH as u64)
            .read_until(b'\n', buf)
            .await
            .context("reading line")?;
        if n == 0 || buf.last() == Some(&b'\n') {
            buf.clear();
            return Ok(());
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::dispatcher::test::base_registry;
    use crate::dispatcher::ProtocolChain;
    use crate::session::test::make_session;
    use k9::assert_equal;
    use server_lifecycle::LifeCycle;
    use std::time::Duration;

    async fn converse(input: &str) -> String {
        let dispatcher = ProtocolChain::smtp().build(&base_registry(), &[]).unwrap();
        let mut session = make_session(false);
        let life_cycle = LifeCycle::new("test");
        let token = CancellationToken::new();
        let watchdog = Watchdog::arm(token.clone(), Duration::from_secs(60));

        let (client, server) = tokio::io::duplex(64 * 1024);
        let (mut client_read, mut client_write) = tokio::io::split(client);
        let mut handler = ConnectionHandler::default();

        let serve = handler.handle(
            server,
            &mut session,
            ConnectionContext {
                dispatcher: &dispatcher,
                token,
                shutdown: life_cycle.handle().subscribe(),
                watchdog: &watchdog,
            },
        );
        let send = async {
            client_write.write_all(input.as_bytes()).await.unwrap();
            client_write.shutdown().await.unwrap();
        };
        let receive = async {
            let mut output = String::new();
            client_read.read_to_string(&mut output).await.unwrap();
            output
        };
        let (served, (), output) = tokio::join!(serve, send, receive);
        served.unwrap();

        handler.recycle();
        assert!(handler.line.is_empty());
        output
    }

    #[tokio::test]
    async fn full_transaction() {
        let output = converse(
            "HELO client\r\n\
             MAIL FROM:<a@example.com>\r\n\
             RCPT TO:<b@example.com>\r\n\
             DATA\r\n\
             Subject: test\r\n\
             \r\n\
             ..leading dot\r\n\
             .\r\n\
             QUIT\r\n",
        )
        .await;
        assert_equal!(
            output,
            "220 mx.example.com SMTP Server ready\r\n\
             250 mx.example.com Hello client (client.example.net [192.0.2.1])\r\n\
             250 2.1.0 Sender <a@example.com> OK\r\n\
             250 2.1.5 Recipient <b@example.com> OK\r\n\
             354 Ok Send data ending with <CRLF>.<CRLF>\r\n\
             250 2.6.0 Message received\r\n\
             221 2.0.0 mx.example.com Service closing transmission channel\r\n"
        );
    }

    #[tokio::test]
    async fn long_line_and_eof() {
        let long = "X".repeat(2 * MAX_LINE_LENGTH);
        let output = converse(&format!("NOOP {long}\r\nNOOP\r\n")).await;
        assert_equal!(
            output,
            "220 mx.example.com SMTP Server ready\r\n\
             500 5.5.2 Line too long\r\n\
             250 2.0.0 OK\r\n"
        );
    }

    #[tokio::test]
    async fn shutdown_sends_421() {
        let dispatcher = ProtocolChain::smtp().build(&base_registry(), &[]).unwrap();
        let mut session = make_session(false);
        let mut life_cycle = LifeCycle::new("test");
        let token = CancellationToken::new();
        let watchdog = Watchdog::arm(token.clone(), Duration::from_secs(60));
        let (client, server) = tokio::io::duplex(4096);
        let shutdown = life_cycle.handle().subscribe();

        let serve = async {
            ConnectionHandler::default()
                .handle(
                    server,
                    &mut session,
                    ConnectionContext {
                        dispatcher: &dispatcher,
                        token,
                        shutdown,
                        watchdog: &watchdog,
                    },
                )
                .await
        };
        let client = async {
            let mut client = BufReader::new(client);
            let mut banner = String::new();
            client.read_line(&mut banner).await.unwrap();
            life_cycle.begin_shutdown();
            let mut rest = String::new();
            client.read_to_string(&mut rest).await.unwrap();
            (banner, rest)
        };
        let (served, (banner, rest)) = tokio::join!(serve, client);
        served.unwrap();
        assert_equal!(banner, "220 mx.example.com SMTP Server ready\r\n");
        assert_equal!(
            rest,
            "421 4.3.2 mx.example.com Service shutting down, closing transmission channel\r\n"
        );
        assert!(life_cycle.wait_for_idle(Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn long_body_line_stays_in_body() {
        let long = "x".repeat(MAX_DATA_LINE_LENGTH);
        let output = converse(&format!(
            "HELO client\r\n\
             MAIL FROM:<a@example.com>\r\n\
             RCPT TO:<b@example.com>\r\n\
             DATA\r\n\
             {long}.\r\n\
             RSET\r\n\
             {long}..not stuffed\r\n\
             .\r\n\
             QUIT\r\n"
        ))
        .await;
        assert_equal!(
            output,
            "220 mx.example.com SMTP Server ready\r\n\
             250 mx.example.com Hello client (client.example.net [192.0.2.1])\r\n\
             250 2.1.0 Sender <a@example.com> OK\r\n\
             250 2.1.5 Recipient <b@example.com> OK\r\n\
             354 Ok Send data ending with <CRLF>.<CRLF>\r\n\
             250 2.6.0 Message received\r\n\
             221 2.0.0 mx.example.com Service closing transmission channel\r\n"
        );
    }

    #[tokio::test]
    async fn body_keeps_pieces_of_long_lines() {
        let long = "x".repeat(MAX_DATA_LINE_LENGTH);
        let session = make_session(false);
        let watchdog = Watchdog::arm(CancellationToken::new(), Duration::from_secs(60));
        let (mut client, server) = tokio::io::duplex(256 * 1024);
        client
            .write_all(format!("{long}..tail\r\n..stuffed\r\n.\r\n").as_bytes())
            .await
            .unwrap();

        let mut stream = BufReader::new(server);
        let mut handler = ConnectionHandler::default();
        assert!(handler
            .receive_data(&mut stream, &session, &watchdog)
            .await
            .unwrap());
        assert_equal!(
            String::from_utf8(handler.data.clone()).unwrap(),
            format!("{long}..tail\r\n.stuffed\r\n")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_blocked_write() {
        let dispatcher = ProtocolChain::smtp().build(&base_registry(), &[]).unwrap();
        let mut session = make_session(false);
        let life_cycle = LifeCycle::new("test");
        let token = CancellationToken::new();
        let watchdog = Watchdog::arm(token.clone(), Duration::from_millis(200));

        // The client pipelines commands but never reads the replies,
        // so the handler ends up stuck writing
        let (client, server) = tokio::io::duplex(64);
        let (_client_read, mut client_write) = tokio::io::split(client);

        let mut handler = ConnectionHandler::default();
        let serve = tokio::time::timeout(
            Duration::from_secs(3),
            handler.handle(
                server,
                &mut session,
                ConnectionContext {
                    dispatcher: &dispatcher,
                    token: token.clone(),
                    shutdown: life_cycle.handle().subscribe(),
                    watchdog: &watchdog,
                },
            ),
        );
        let flood = async {
            // Fails with a broken pipe once the handler lets go
            let _ = client_write
                .write_all("NOOP\r\n".repeat(50).as_bytes())
                .await;
        };
        let (served, ()) = tokio::join!(serve, flood);

        served.expect("handler returned after cancellation").unwrap();
        assert!(token.is_cancelled());
        assert!(watchdog.has_expired());
    }
}
