//! A minimal SMTP server loop driving a pluggable message handler.

use crate::error::Rejection;
use async_trait::async_trait;
use mailparse::MailAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

/// One SMTP transaction's state: sender, accepted recipients, raw message
/// bytes. Connection-local, reset after every DATA and on RSET, so nothing
/// leaks between transactions even though the handler itself is shared.
#[derive(Debug, Clone, Default)]
pub struct Envelope {
    pub mail_from: String,
    pub rcpt_to: Vec<String>,
    pub data: Vec<u8>,
}

/// Callbacks invoked by the server loop. A rejection is written back to the
/// client verbatim as `<code> <message>`; the connection stays open.
#[async_trait]
pub trait SmtpHandler: Send + Sync {
    /// Handles the MAIL FROM command.
    fn handle_mail(&self, address: &str) -> Result<(), Rejection>;

    /// Handles the RCPT TO command. On success returns the normalized
    /// address, which the server appends to the envelope.
    fn handle_rcpt(&self, address: &str) -> Result<String, Rejection>;

    /// Handles a completed DATA command.
    async fn handle_data(&self, envelope: &Envelope) -> Result<(), Rejection>;
}

/// Extracts the first email address found in an SMTP command or email header.
///
/// The address's own case is preserved; only the command verb is matched
/// case-insensitively. Return `None` if parsing fails.
pub fn extract_address(input: &str) -> Option<String> {
    let mut trimmed = strip_prefix_ignore_case(input, "mail from:");
    trimmed = strip_prefix_ignore_case(trimmed, "rcpt to:");

    let addr_end = trimmed.find('>').unwrap_or(trimmed.len().saturating_sub(1));
    trimmed = trimmed
        .split_at_checked(addr_end + 1)
        .map(|(address_raw, _)| address_raw)
        .unwrap_or(trimmed);

    mailparse::addrparse(trimmed)
        .ok()
        .and_then(|addr| match addr.first() {
            Some(MailAddr::Single(single)) => Some(single.addr.clone()),
            Some(MailAddr::Group(group)) => group.addrs.first().map(|single| single.addr.clone()),
            None => None,
        })
}

fn strip_prefix_ignore_case<'a>(input: &'a str, prefix: &str) -> &'a str {
    input
        .split_at_checked(prefix.len())
        .filter(|(head, _)| head.eq_ignore_ascii_case(prefix))
        .map(|(_, tail)| tail)
        .unwrap_or(input)
}

/// Binds `addr` and serves SMTP connections forever.
pub async fn run_smtp_server<H>(
    addr: &str,
    handler: Arc<H>,
    max_size: usize,
) -> Result<(), Box<dyn std::error::Error>>
where
    H: SmtpHandler + 'static,
{
    let listener = TcpListener::bind(addr).await?;
    log::info!("SMTP server listening on {addr}");
    serve(listener, handler, max_size).await
}

pub(crate) async fn serve<H>(
    listener: TcpListener,
    handler: Arc<H>,
    max_size: usize,
) -> Result<(), Box<dyn std::error::Error>>
where
    H: SmtpHandler + 'static,
{
    loop {
        let (socket, peer) = listener.accept().await?;
        log::debug!("SMTP connection from {peer}");
        let handler = handler.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(socket, handler, max_size).await {
                log::error!("Error handling connection: {}", e);
            }
        });
    }
}

/// Handles an individual SMTP connection.
async fn handle_connection<H>(
    socket: TcpStream,
    handler: Arc<H>,
    max_size: usize,
) -> Result<(), Box<dyn std::error::Error>>
where
    H: SmtpHandler,
{
    let (reader, mut writer) = socket.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    writer.write_all(b"220 mailhook SMTP\r\n").await?;

    let mut envelope = Envelope::default();

    'connection: loop {
        line.clear();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            break 'connection;
        }

        // Remove CRLF
        // Note: this will kill the connection if any line doesn't end with CRLF.
        // This is intentional as stray LF most likely means an attempt to exploit the server.
        let Some(cmd) = line.strip_suffix("\r\n") else {
            log::warn!("Malformed command without CRLF ending! Closing connection.");
            break 'connection;
        };

        log::debug!("Received: {}", cmd);

        if cmd.to_uppercase().starts_with("HELO") || cmd.to_uppercase().starts_with("EHLO") {
            writer.write_all(b"250 OK\r\n").await?;
        } else if cmd.to_uppercase().starts_with("MAIL FROM:") {
            if let Some(from) = extract_address(cmd) {
                match handler.handle_mail(&from) {
                    Ok(()) => {
                        envelope.mail_from = from;
                        writer.write_all(b"250 OK\r\n").await?;
                    }
                    Err(rejection) => {
                        writer
                            .write_all(format!("{}\r\n", rejection).as_bytes())
                            .await?;
                    }
                }
            } else {
                log::debug!("Invalid MAIL FROM command. Can't extract address.");
                writer
                    .write_all(b"500 Invalid address in MAIL FROM\r\n")
                    .await?;
            }
        } else if cmd.to_uppercase().starts_with("RCPT TO:") {
            if let Some(to) = extract_address(cmd) {
                // The handler decides the relaying policy; a rejection does
                // not abort the transaction, further RCPT commands may follow.
                match handler.handle_rcpt(&to) {
                    Ok(normalized) => {
                        envelope.rcpt_to.push(normalized);
                        writer.write_all(b"250 OK\r\n").await?;
                    }
                    Err(rejection) => {
                        writer
                            .write_all(format!("{}\r\n", rejection).as_bytes())
                            .await?;
                    }
                }
            } else {
                writer
                    .write_all(b"500 Invalid address in RCPT TO\r\n")
                    .await?;
            }
        } else if cmd.to_uppercase().starts_with("DATA") {
            if envelope.rcpt_to.is_empty() {
                writer.write_all(b"503 Bad sequence of commands\r\n").await?;
                continue 'connection;
            }
            writer
                .write_all(b"354 End data with <CR><LF>.<CR><LF>\r\n")
                .await?;
            let mut data = Vec::new();
            let mut data_line = String::new();
            'data_read: loop {
                data_line.clear();
                reader.read_line(&mut data_line).await?;

                if data_line == ".\r\n" {
                    break 'data_read;
                }

                if !data_line.ends_with("\r\n") {
                    log::warn!("Malformed DATA line without CRLF ending! Closing connection.");
                    break 'connection;
                }

                // Undo transparency dot-stuffing (RFC 5321, 4.5.2).
                let content = data_line.strip_prefix('.').unwrap_or(&data_line);
                data.extend_from_slice(content.as_bytes());

                if data.len() > max_size {
                    writer
                        .write_all(b"552 Message exceeds maximum size\r\n")
                        .await?;
                    break 'connection;
                }
            }

            envelope.data = data;

            match handler.handle_data(&envelope).await {
                Ok(()) => {
                    log::debug!("Sent: 250 OK");
                    writer.write_all(b"250 OK\r\n").await?;
                }
                Err(rejection) => {
                    log::debug!("Sent: {}", rejection);
                    writer
                        .write_all(format!("{}\r\n", rejection).as_bytes())
                        .await?;
                }
            }

            // Transaction boundary: the envelope is cleared whether DATA
            // succeeded or not.
            envelope = Envelope::default();
        } else if cmd.to_uppercase().starts_with("QUIT") {
            writer.write_all(b"221 OK\r\n").await?;
            break 'connection;
        } else if cmd.to_uppercase().starts_with("RSET") {
            envelope = Envelope::default();
            writer.write_all(b"250 OK\r\n").await?;
        } else if cmd.to_uppercase().starts_with("NOOP") {
            writer.write_all(b"250 OK\r\n").await?;
        } else {
            writer.write_all(b"500 Command not recognized\r\n").await?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::*;
    use std::sync::Mutex;
    use tokio::net::TcpStream;
    use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

    #[rstest]
    #[case("MAIL FROM:<t1@example.org>", Some("t1@example.org".to_string()))]
    #[case("MAIL FROM:<t2@example.org> SIZE=1024", Some("t2@example.org".to_string()))]
    #[case("MAIL FROM:<abc+alice@example.net> abc=def", Some("abc+alice@example.net".to_string()))]
    #[case("RCPT TO:<t3@example.org>", Some("t3@example.org".to_string()))]
    #[case("rcpt to:<t4@example.org>", Some("t4@example.org".to_string()))]
    #[case::case_preserved("MAIL FROM:<MixedCase@Ext.COM>", Some("MixedCase@Ext.COM".to_string()))]
    #[case::case_preserved_rcpt("RCPT TO:<USER@Example.ORG>", Some("USER@Example.ORG".to_string()))]
    #[case("Foo Bar <t5@example.org>", Some("t5@example.org".to_string()))]
    #[case("t6@example.org", Some("t6@example.org".to_string()))]
    fn test_extract_address(#[case] input: &str, #[case] expected: Option<String>) {
        let result = extract_address(input);
        assert_eq!(result, expected)
    }

    /// Accepts recipients at example.org, records envelopes seen by DATA.
    struct RecordingHandler {
        seen: Mutex<Vec<Envelope>>,
    }

    impl RecordingHandler {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl SmtpHandler for RecordingHandler {
        fn handle_mail(&self, _address: &str) -> Result<(), Rejection> {
            Ok(())
        }

        fn handle_rcpt(&self, address: &str) -> Result<String, Rejection> {
            let normalized = address.trim().to_lowercase();
            if normalized.ends_with("@example.org") {
                Ok(normalized)
            } else {
                Err(Rejection::relaying_denied())
            }
        }

        async fn handle_data(&self, envelope: &Envelope) -> Result<(), Rejection> {
            let Ok(mut seen) = self.seen.lock() else {
                return Err(Rejection::processing_error());
            };
            seen.push(envelope.clone());
            Ok(())
        }
    }

    async fn start_server(
        handler: Arc<RecordingHandler>,
    ) -> std::io::Result<std::net::SocketAddr> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        tokio::spawn(async move {
            let _ = serve(listener, handler, 1024 * 1024).await;
        });
        Ok(addr)
    }

    async fn connect(
        addr: std::net::SocketAddr,
    ) -> std::io::Result<(BufReader<OwnedReadHalf>, OwnedWriteHalf)> {
        let stream = TcpStream::connect(addr).await?;
        let (reader, writer) = stream.into_split();
        Ok((BufReader::new(reader), writer))
    }

    async fn roundtrip(
        reader: &mut BufReader<OwnedReadHalf>,
        writer: &mut OwnedWriteHalf,
        cmd: &str,
    ) -> std::io::Result<String> {
        writer.write_all(cmd.as_bytes()).await?;
        read_line(reader).await
    }

    async fn read_line(reader: &mut BufReader<OwnedReadHalf>) -> std::io::Result<String> {
        let mut response = String::new();
        reader.read_line(&mut response).await?;
        Ok(response)
    }

    #[tokio::test]
    async fn test_full_transaction() -> std::io::Result<()> {
        let handler = RecordingHandler::new();
        let addr = start_server(handler.clone()).await?;
        let (mut reader, mut writer) = connect(addr).await?;

        assert!(read_line(&mut reader).await?.starts_with("220"));
        assert!(
            roundtrip(&mut reader, &mut writer, "HELO client\r\n")
                .await?
                .starts_with("250")
        );
        assert!(
            roundtrip(&mut reader, &mut writer, "MAIL FROM:<alice@ext.com>\r\n")
                .await?
                .starts_with("250")
        );
        assert!(
            roundtrip(&mut reader, &mut writer, "RCPT TO:<USER@Example.ORG>\r\n")
                .await?
                .starts_with("250")
        );
        assert!(
            roundtrip(&mut reader, &mut writer, "DATA\r\n")
                .await?
                .starts_with("354")
        );
        let response = roundtrip(
            &mut reader,
            &mut writer,
            "Subject: Hi\r\n\r\nHello\r\n..dot-stuffed\r\n.\r\n",
        )
        .await?;
        assert!(response.starts_with("250"));
        assert!(
            roundtrip(&mut reader, &mut writer, "QUIT\r\n")
                .await?
                .starts_with("221")
        );

        let seen = handler.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        let envelope = seen.first().unwrap();
        assert_eq!(envelope.mail_from, "alice@ext.com");
        assert_eq!(envelope.rcpt_to, vec!["user@example.org".to_string()]);
        assert_eq!(envelope.data, b"Subject: Hi\r\n\r\nHello\r\n.dot-stuffed\r\n");
        Ok(())
    }

    #[tokio::test]
    async fn test_rejected_recipient_keeps_connection_open() -> std::io::Result<()> {
        let handler = RecordingHandler::new();
        let addr = start_server(handler.clone()).await?;
        let (mut reader, mut writer) = connect(addr).await?;

        read_line(&mut reader).await?;
        roundtrip(&mut reader, &mut writer, "MAIL FROM:<alice@ext.com>\r\n").await?;
        let response = roundtrip(&mut reader, &mut writer, "RCPT TO:<user@other.com>\r\n").await?;
        assert_eq!(response, "550 Relaying denied\r\n");

        // Transaction continues, a valid recipient is still accepted.
        assert!(
            roundtrip(&mut reader, &mut writer, "RCPT TO:<user@example.org>\r\n")
                .await?
                .starts_with("250")
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_data_requires_recipient() -> std::io::Result<()> {
        let handler = RecordingHandler::new();
        let addr = start_server(handler.clone()).await?;
        let (mut reader, mut writer) = connect(addr).await?;

        read_line(&mut reader).await?;
        roundtrip(&mut reader, &mut writer, "MAIL FROM:<alice@ext.com>\r\n").await?;
        let response = roundtrip(&mut reader, &mut writer, "DATA\r\n").await?;
        assert!(response.starts_with("503"));
        assert!(handler.seen.lock().unwrap().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_envelope_reset_between_transactions() -> std::io::Result<()> {
        let handler = RecordingHandler::new();
        let addr = start_server(handler.clone()).await?;
        let (mut reader, mut writer) = connect(addr).await?;

        read_line(&mut reader).await?;
        roundtrip(&mut reader, &mut writer, "MAIL FROM:<first@ext.com>\r\n").await?;
        roundtrip(&mut reader, &mut writer, "RCPT TO:<one@example.org>\r\n").await?;
        roundtrip(&mut reader, &mut writer, "DATA\r\n").await?;
        assert!(
            roundtrip(&mut reader, &mut writer, "Subject: One\r\n\r\nfirst\r\n.\r\n")
                .await?
                .starts_with("250")
        );

        // The completed transaction left nothing behind: DATA without a
        // fresh RCPT is out of sequence.
        let response = roundtrip(&mut reader, &mut writer, "DATA\r\n").await?;
        assert!(response.starts_with("503"));

        // A second transaction on the same connection carries only its own
        // sender, recipients and data.
        roundtrip(&mut reader, &mut writer, "MAIL FROM:<Second@Ext.COM>\r\n").await?;
        roundtrip(&mut reader, &mut writer, "RCPT TO:<two@example.org>\r\n").await?;
        roundtrip(&mut reader, &mut writer, "DATA\r\n").await?;
        assert!(
            roundtrip(&mut reader, &mut writer, "Subject: Two\r\n\r\nsecond\r\n.\r\n")
                .await?
                .starts_with("250")
        );

        let seen = handler.seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        let second = seen.get(1).unwrap();
        assert_eq!(second.mail_from, "Second@Ext.COM");
        assert_eq!(second.rcpt_to, vec!["two@example.org".to_string()]);
        assert_eq!(second.data, b"Subject: Two\r\n\r\nsecond\r\n");
        Ok(())
    }

    #[tokio::test]
    async fn test_rset_clears_envelope() -> std::io::Result<()> {
        let handler = RecordingHandler::new();
        let addr = start_server(handler.clone()).await?;
        let (mut reader, mut writer) = connect(addr).await?;

        read_line(&mut reader).await?;
        roundtrip(&mut reader, &mut writer, "MAIL FROM:<alice@ext.com>\r\n").await?;
        roundtrip(&mut reader, &mut writer, "RCPT TO:<user@example.org>\r\n").await?;
        roundtrip(&mut reader, &mut writer, "RSET\r\n").await?;

        // Recipient list was dropped by RSET, so DATA is out of sequence.
        let response = roundtrip(&mut reader, &mut writer, "DATA\r\n").await?;
        assert!(response.starts_with("503"));
        Ok(())
    }
}
