#[cfg(test)]
mod daemon;

fn main() {
    println!("Run me via `cargo nextest run` or `cargo test`");
}

#[cfg(test)]
mod test {
    use super::daemon::*;
    use dns_resolver::TestResolver;
    use k9::assert_equal;
    use std::time::Duration;

    #[tokio::test]
    async fn end_to_end() -> anyhow::Result<()> {
        let daemon = TestDaemon::start("max_message_size = 1000\n").await?;
        let mut client = daemon.greeted_client().await?;

        let ehlo = client.command("EHLO client.test").await?;
        assert_equal!(ehlo.code, 250);
        let lines: Vec<&str> = ehlo.content.lines().collect();
        assert_equal!(
            lines,
            vec![
                "mx.test Hello client.test (127.0.0.1 [127.0.0.1])",
                "SIZE 1000",
                "PIPELINING",
                "ENHANCEDSTATUSCODES",
                "8BITMIME",
            ]
        );

        assert_equal!(
            client.command("MAIL FROM:<sender@example.com>").await?.to_single_line(),
            "250 2.1.0 Sender <sender@example.com> OK"
        );
        assert_equal!(
            client.command("RCPT TO:<rcpt@example.com>").await?.to_single_line(),
            "250 2.1.5 Recipient <rcpt@example.com> OK"
        );
        assert_equal!(client.command("DATA").await?.code, 354);
        client.send_line("Subject: hello").await?;
        client.send_line("").await?;
        client.send_line("..stuffed").await?;
        assert_equal!(
            client.command(".").await?.to_single_line(),
            "250 2.6.0 Message received"
        );

        // The transaction was reset by the completed message
        assert_equal!(client.command("DATA").await?.code, 503);

        // An oversized body is refused once the dot arrives
        client.command("MAIL FROM:<sender@example.com>").await?;
        client.command("RCPT TO:<rcpt@example.com>").await?;
        client.command("DATA").await?;
        for _ in 0..20 {
            client.send_line(&"x".repeat(70)).await?;
        }
        assert_equal!(client.command(".").await?.code, 552);

        assert_equal!(client.command("QUIT").await?.code, 221);
        assert!(client.is_closed().await?);
        Ok(())
    }

    #[tokio::test]
    async fn per_source_ceiling() -> anyhow::Result<()> {
        let daemon = TestDaemon::start("connection_limit_per_source = 2\n").await?;
        let mut first = daemon.greeted_client().await?;
        let _second = daemon.greeted_client().await?;

        let mut third = daemon.client().await?;
        assert!(third.is_closed().await?);

        // Closing one makes room for another
        first.command("QUIT").await?;
        drop(first);
        let mut admitted = false;
        for _ in 0..50 {
            let mut client = daemon.client().await?;
            if client.read_response().await?.is_some() {
                admitted = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(admitted);
        Ok(())
    }

    #[tokio::test]
    async fn unresolvable_helo_untrusted() -> anyhow::Result<()> {
        let daemon = TestDaemon::start(
            "authorized_networks = []\n\
             [hooks]\n\
             resolvable_helo = {}\n",
        )
        .await?;
        let mut client = daemon.greeted_client().await?;

        assert_equal!(client.command("HELO no-such-host.test").await?.code, 250);
        assert_equal!(client.command("MAIL FROM:<a@example.com>").await?.code, 250);
        assert_equal!(
            client.command("RCPT TO:<b@example.com>").await?.to_single_line(),
            "501 5.5.4 Provided EHLO/HELO no-such-host.test can not resolved."
        );
        Ok(())
    }

    #[tokio::test]
    async fn unresolvable_helo_trusted() -> anyhow::Result<()> {
        let daemon = TestDaemon::start_with_resolver(
            "[hooks]\nresolvable_helo = {}\n",
            TestResolver::new().with_ip("known.test", "127.0.0.1".parse()?),
        )
        .await?;
        let mut client = daemon.greeted_client().await?;

        assert_equal!(client.command("HELO no-such-host.test").await?.code, 250);
        assert_equal!(client.command("MAIL FROM:<a@example.com>").await?.code, 250);
        assert_equal!(client.command("RCPT TO:<b@example.com>").await?.code, 250);
        Ok(())
    }

    #[tokio::test]
    async fn idle_connection_is_closed() -> anyhow::Result<()> {
        let daemon = TestDaemon::start("connection_timeout = \"1s\"\n").await?;
        let mut client = daemon.greeted_client().await?;
        assert_equal!(client.command("NOOP").await?.code, 250);

        let start = std::time::Instant::now();
        assert!(client.is_closed().await?);
        assert!(start.elapsed() >= Duration::from_millis(500));
        Ok(())
    }

    #[tokio::test]
    async fn stalled_client_releases_its_slot() -> anyhow::Result<()> {
        let daemon = TestDaemon::start(
            "connection_timeout = \"1s\"\n\
             connection_limit = 1\n\
             connection_limit_per_source = 1\n",
        )
        .await?;
        let mut client = daemon.greeted_client().await?;

        // Pipeline commands and never read the replies; the watchdog
        // must close the connection whether it stalls writing or reading
        let flood = tokio::spawn(async move {
            let commands = "NOOP\r\n".repeat(100_000);
            client.send_line(commands.trim_end()).await
        });

        let mut admitted = false;
        for _ in 0..100 {
            if daemon.listener.active_connections() == 0 {
                let mut next = daemon.client().await?;
                if next.read_response().await?.is_some() {
                    admitted = true;
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        flood.abort();
        assert!(admitted);
        Ok(())
    }

    #[tokio::test]
    async fn shutdown_notifies_idle_clients() -> anyhow::Result<()> {
        let daemon = TestDaemon::start("").await?;
        let mut client = daemon.greeted_client().await?;
        client.command("HELO client.test").await?;
        let addr = daemon.addr();

        let info = daemon.listener.info();
        assert_equal!(info.active_connections, 1);
        assert_equal!(info.hello_name, "mx.test");
        assert_equal!(info.port, addr.port());

        let shutdown = tokio::spawn(daemon.listener.shutdown(Duration::from_secs(5)));
        let notice = client.read_response().await?.unwrap();
        assert_equal!(
            notice.to_single_line(),
            "421 4.3.2 mx.test Service shutting down, closing transmission channel"
        );
        assert!(client.is_closed().await?);
        assert!(shutdown.await?);

        // No longer accepting
        assert!(TestClient::connect(addr).await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn service_info_serializes() -> anyhow::Result<()> {
        let daemon = TestDaemon::start("connection_limit = 10\n").await?;
        let info = daemon.listener.info().to_json();
        assert_equal!(info["service_type"], "SMTP Service");
        assert_equal!(info["socket_type"], "plain");
        assert_equal!(info["bind_address"], "127.0.0.1");
        assert_equal!(info["connection_limit"], 10);
        assert_equal!(info["enabled"], true);
        Ok(())
    }

    #[tokio::test]
    async fn bind_conflict_is_diagnosed() -> anyhow::Result<()> {
        let daemon = TestDaemon::start("").await?;
        let port = daemon.addr().port();
        let err = TestDaemon::start_on_port("", TestResolver::new(), port)
            .await
            .err()
            .unwrap();
        let listener_error = err.downcast_ref::<smtpd::ListenerError>().unwrap();
        assert!(
            matches!(listener_error, smtpd::ListenerError::AddressInUse { .. }),
            "{listener_error:?}"
        );
        Ok(())
    }
}
