use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use serial_test::serial;
use smtp_server::{EmailServer, ServerConfig, StoreError};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_rustls::rustls::{self, pki_types::ServerName, RootCertStore};
use tokio_rustls::TlsConnector;

struct Client<S> {
    reader: BufReader<S>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Client<S> {
    fn new(stream: S) -> Self {
        Client {
            reader: BufReader::new(stream),
        }
    }

    async fn send(&mut self, line: &str) {
        let stream = self.reader.get_mut();
        stream.write_all(line.as_bytes()).await.unwrap();
        stream.write_all(b"\r\n").await.unwrap();
        stream.flush().await.unwrap();
    }

    async fn reply(&mut self) -> String {
        let mut lines = Vec::new();
        loop {
            let mut line = String::new();
            self.reader.read_line(&mut line).await.unwrap();
            let line = line.trim_end().to_string();
            let last = line.as_bytes().get(3) != Some(&b'-');
            lines.push(line);
            if last {
                return lines.join("\n");
            }
        }
    }

    async fn cmd(&mut self, line: &str) -> String {
        self.send(line).await;
        self.reply().await
    }

    async fn deliver(&mut self, from: &str, to: &str, body: &str) -> String {
        assert_eq!(self.cmd(&format!("MAIL FROM:<{from}>")).await, "250 2.1.0 OK");
        assert_eq!(self.cmd(&format!("RCPT TO:<{to}>")).await, "250 2.1.5 OK");
        assert!(self.cmd("DATA").await.starts_with("354"));
        self.send(body).await;
        self.send(".").await;
        self.reply().await
    }
}

async fn connect(port: u16) -> Client<TcpStream> {
    let stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let mut client = Client::new(stream);
    assert!(client.reply().await.starts_with("220 localhost"));
    client
}

fn ephemeral_config() -> ServerConfig {
    ServerConfig {
        port: 0,
        ..ServerConfig::default()
    }
}

#[tokio::test]
#[serial]
async fn captures_a_plain_message_on_the_default_port() {
    let mut server = EmailServer::new(ServerConfig::default());
    let port = server.start().await.unwrap();
    assert!(port >= 1025);

    let mut client = connect(port).await;
    client.cmd("EHLO client.test").await;
    let reply = client
        .deliver("a@x.com", "b@y.com", "From: a@x.com\r\nSubject: hi\r\n\r\nhello")
        .await;
    assert!(reply.starts_with("250"));
    assert_eq!(client.cmd("QUIT").await, "221 2.0.0 Bye");

    let messages = server.list_messages();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].subject, "hi");
    assert_eq!(messages[0].from, "a@x.com");
    assert_eq!(messages[0].plain_body.trim(), "hello");
    assert!(!messages[0].has_html);
    assert_eq!(server.get_config().connection_count, 1);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn concurrent_clients_are_all_captured() {
    let mut server = EmailServer::new(ephemeral_config());
    let port = server.start().await.unwrap();

    let sends = (0..2).map(|i| {
        tokio::spawn(async move {
            let mut client = connect(port).await;
            client.cmd("HELO client.test").await;
            let body = format!("Subject: message {i}\r\n\r\nbody {i}");
            let reply = client.deliver("a@x.com", "b@y.com", &body).await;
            client.cmd("QUIT").await;
            reply
        })
    });
    for send in sends.collect::<Vec<_>>() {
        assert!(send.await.unwrap().starts_with("250"));
    }

    let snapshot = server.get_config();
    assert_eq!(snapshot.connection_count, 2);
    assert!(snapshot.running);

    let messages = server.list_messages();
    assert_eq!(messages.len(), 2);
    assert!(messages[0].id > messages[1].id);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn message_accessors_follow_the_store() {
    let mut server = EmailServer::new(ephemeral_config());
    let port = server.start().await.unwrap();

    let mut client = connect(port).await;
    client.cmd("EHLO client.test").await;
    client.deliver("a@x.com", "b@y.com", "Subject: one\r\n\r\n1").await;
    client.deliver("a@x.com", "b@y.com", "Subject: two\r\n\r\n2").await;

    let newest = server.list_messages().remove(0);
    assert_eq!(newest.subject, "two");
    assert_eq!(server.get_message(newest.id).unwrap().subject, "two");

    assert!(server.delete_message(newest.id));
    assert!(!server.delete_message(newest.id));
    assert_eq!(server.get_message(newest.id).unwrap_err(), StoreError::NotFound(newest.id));

    server.clear_messages();
    assert!(server.list_messages().is_empty());
    assert_eq!(server.get_config().connection_count, 2);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn occupied_port_falls_back_to_the_next_one() {
    let blocker = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let taken = blocker.local_addr().unwrap().port();

    let mut server = EmailServer::new(ServerConfig {
        port: taken,
        ..ServerConfig::default()
    });
    let port = server.start().await.unwrap();
    assert_ne!(port, taken);

    let snapshot = server.get_config();
    assert_eq!(snapshot.requested_port, taken);
    assert_eq!(snapshot.config.port, port);

    server.stop().await.unwrap();
    server.stop().await.unwrap();
    assert!(!server.is_running());
}

#[tokio::test]
async fn snapshot_never_exposes_the_password() {
    let server = EmailServer::new(ServerConfig {
        username: "user".to_string(),
        password: "hunter2".to_string(),
        ..ephemeral_config()
    });

    let snapshot = server.get_config();
    assert!(snapshot.auth_enabled);
    assert!(!snapshot.running);

    let json = serde_json::to_string(&snapshot).unwrap();
    assert!(json.contains("\"username\":\"user\""));
    assert!(!json.contains("hunter2"));
}

#[tokio::test]
async fn mandatory_tls_with_authentication() {
    let certs = tempfile::tempdir().unwrap();
    let config = ServerConfig {
        username: "user".to_string(),
        password: "secret".to_string(),
        use_tls: true,
        cert_dir: certs.path().to_path_buf(),
        ..ephemeral_config()
    };
    let cert_path = config.cert_path();
    let mut server = EmailServer::new(config);
    let port = server.start().await.unwrap();
    assert!(cert_path.exists());
    assert!(certs.path().join("key.pem").exists());

    let mut client = connect(port).await;
    let ehlo = client.cmd("EHLO client.test").await;
    assert!(ehlo.contains("STARTTLS"));
    assert!(!ehlo.contains("AUTH"));

    let credentials = B64.encode(b"\0user\0secret");
    let refused = client.cmd(&format!("AUTH PLAIN {credentials}")).await;
    assert!(refused.starts_with("530"));
    assert_eq!(client.cmd("STARTTLS").await, "220 2.0.0 Ready to start TLS");

    let mut roots = RootCertStore::empty();
    for cert in smtp_server::tls::load_certs(&cert_path).unwrap() {
        roots.add(cert).unwrap();
    }
    let tls_config = rustls::ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .unwrap()
    .with_root_certificates(roots)
    .with_no_client_auth();
    let connector = TlsConnector::from(Arc::new(tls_config));
    let stream = connector
        .connect(ServerName::try_from("localhost").unwrap(), client.reader.into_inner())
        .await
        .unwrap();

    let mut client = Client::new(stream);
    let ehlo = client.cmd("EHLO client.test").await;
    assert!(ehlo.contains("AUTH PLAIN LOGIN"));
    assert!(!ehlo.contains("STARTTLS"));
    assert!(client.cmd("STARTTLS").await.starts_with("503"));
    assert_eq!(
        client.cmd(&format!("AUTH PLAIN {credentials}")).await,
        "235 2.7.0 Authentication successful"
    );
    let reply = client
        .deliver("a@x.com", "b@y.com", "Subject: secure\r\n\r\nover tls")
        .await;
    assert!(reply.starts_with("250"));
    client.cmd("QUIT").await;

    assert_eq!(server.list_messages()[0].subject, "secure");
    server.stop().await.unwrap();
}
