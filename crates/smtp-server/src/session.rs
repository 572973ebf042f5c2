use crate::auth::{Authenticator, Mechanism, ADVERTISED_MECHANISMS};
use crate::config::ServerConfig;
use crate::error::SessionError;
use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use mailbox::{parse_message, Envelope, MessageStore};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn, Instrument};

/// Longest command or AUTH response line read into memory, terminator included.
const MAX_COMMAND_LINE: usize = 4096;

/// What a server instance demands of its clients.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    /// Mail is refused until AUTH succeeds.
    pub auth_required: bool,
    /// Everything but greeting, NOOP, RSET and QUIT waits for STARTTLS.
    pub tls_required: bool,
}

/// Everything a session needs from the server that spawned it.
pub struct SessionContext {
    pub hostname: String,
    pub capabilities: Capabilities,
    pub authenticator: Authenticator,
    pub tls: Option<TlsAcceptor>,
    pub store: Arc<MessageStore>,
    pub idle_timeout: Duration,
    pub max_message_size: usize,
}

impl SessionContext {
    pub fn new(config: &ServerConfig, store: Arc<MessageStore>, tls: Option<TlsAcceptor>) -> Self {
        SessionContext {
            hostname: config.hostname.clone(),
            capabilities: Capabilities {
                auth_required: config.auth_required(),
                tls_required: config.use_tls,
            },
            authenticator: Authenticator::new(config.username.clone(), config.password.clone()),
            tls,
            store,
            idle_timeout: config.session_timeout,
            max_message_size: config.max_message_size,
        }
    }
}

/// Represents the state of an SMTP session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SmtpState {
    /// Initial state, waiting for HELO/EHLO.
    Greeting,
    /// Ready to receive commands after greeting.
    Ready,
    /// Received `MAIL FROM`, waiting for `RCPT TO`.
    HasSender(String),
    /// Received `RCPT TO`, waiting for `DATA` or more `RCPT TO`.
    HasRecipient(String, Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Command {
    Helo(String),
    Ehlo(String),
    MailFrom(String),
    RcptTo(String),
    Data,
    Rset,
    Noop,
    Quit,
    StartTls,
    Auth {
        mechanism: String,
        initial: Option<String>,
    },
    /// Known verb with unusable arguments.
    Invalid(&'static str),
    Unknown(String),
}

impl Command {
    fn parse(line: &str) -> Self {
        let line = line.trim();
        let (verb, args) = match line.split_once(' ') {
            Some((verb, args)) => (verb, args.trim()),
            None => (line, ""),
        };

        match verb.to_ascii_uppercase().as_str() {
            "HELO" if !args.is_empty() => Command::Helo(args.to_string()),
            "EHLO" if !args.is_empty() => Command::Ehlo(args.to_string()),
            "HELO" | "EHLO" => Command::Invalid("5.5.4 Syntax: EHLO hostname"),
            "MAIL" => match strip_prefix_ci(args, "FROM:") {
                Some(path) => Command::MailFrom(parse_email_from_command(path)),
                None => Command::Invalid("5.5.4 Syntax: MAIL FROM:<address>"),
            },
            "RCPT" => match strip_prefix_ci(args, "TO:").map(parse_email_from_command) {
                Some(to) if !to.is_empty() => Command::RcptTo(to),
                _ => Command::Invalid("5.5.4 Syntax: RCPT TO:<address>"),
            },
            "DATA" => Command::Data,
            "RSET" => Command::Rset,
            "NOOP" => Command::Noop,
            "QUIT" => Command::Quit,
            "STARTTLS" => Command::StartTls,
            "AUTH" => {
                let mut parts = args.split_whitespace();
                match parts.next() {
                    Some(mechanism) => Command::Auth {
                        mechanism: mechanism.to_string(),
                        initial: parts.next().map(str::to_string),
                    },
                    None => Command::Invalid("5.5.4 Syntax: AUTH mechanism"),
                }
            }
            _ => Command::Unknown(verb.to_string()),
        }
    }
}

/// How the command loop ended, or that it should keep going.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Continue,
    Close,
    StartTls,
}

enum AuthReply {
    Data(Vec<u8>),
    Cancelled,
    Malformed,
    Closed,
}

enum DataOutcome {
    Body(Vec<u8>),
    TooLarge,
}

/// One line read under a length cap.
enum Line {
    Complete(Vec<u8>),
    TooLong,
    Closed,
}

/// Per-connection protocol state. Dropped with the connection.
#[derive(Debug)]
pub struct Session {
    state: SmtpState,
    authenticated: bool,
    mechanism: Option<Mechanism>,
    tls_active: bool,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    pub fn new() -> Self {
        Session {
            state: SmtpState::Greeting,
            authenticated: false,
            mechanism: None,
            tls_active: false,
        }
    }

    pub fn state(&self) -> &SmtpState {
        &self.state
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    pub fn mechanism(&self) -> Option<Mechanism> {
        self.mechanism
    }

    pub fn is_tls(&self) -> bool {
        self.tls_active
    }

    /// After STARTTLS everything learned in plaintext is forgotten.
    fn upgraded(&mut self) {
        self.state = SmtpState::Greeting;
        self.authenticated = false;
        self.mechanism = None;
        self.tls_active = true;
    }

    fn must_start_tls(&self, ctx: &SessionContext) -> bool {
        ctx.capabilities.tls_required && !self.tls_active
    }

    /// Drives commands until the client quits, disconnects or asks for TLS.
    async fn run<S>(
        &mut self,
        reader: &mut BufReader<S>,
        ctx: &SessionContext,
    ) -> Result<Step, SessionError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        loop {
            let line = match read_bounded(reader, ctx.idle_timeout, MAX_COMMAND_LINE).await {
                Ok(Line::Complete(bytes)) => decode_line(&bytes),
                Ok(Line::TooLong) => {
                    warn!("Command line above {} bytes discarded", MAX_COMMAND_LINE);
                    write_line(reader, "500 5.5.2 Line too long").await?;
                    continue;
                }
                Ok(Line::Closed) => return Ok(Step::Close),
                Err(SessionError::Timeout) => {
                    let _ = write_line(reader, "421 4.4.2 Idle timeout, closing connection").await;
                    return Err(SessionError::Timeout);
                }
                Err(e) => return Err(e),
            };

            let command = Command::parse(&line);
            if matches!(command, Command::Auth { .. }) {
                debug!("<- AUTH ***");
            } else {
                debug!("<- {}", line);
            }

            match self.process_command(command, reader, ctx).await {
                Ok(Step::Continue) => {}
                Ok(step) => return Ok(step),
                Err(SessionError::Timeout) => {
                    let _ = write_line(reader, "421 4.4.2 Idle timeout, closing connection").await;
                    return Err(SessionError::Timeout);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Processes a single SMTP command based on the current state.
    async fn process_command<S>(
        &mut self,
        command: Command,
        reader: &mut BufReader<S>,
        ctx: &SessionContext,
    ) -> Result<Step, SessionError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        match command {
            Command::Quit => {
                write_line(reader, "221 2.0.0 Bye").await?;
                return Ok(Step::Close);
            }
            Command::Noop => write_line(reader, "250 2.0.0 OK").await?,
            Command::Invalid(reply) => write_line(reader, &format!("501 {reply}")).await?,
            Command::Unknown(verb) => {
                warn!("Unrecognized command: {}", verb);
                write_line(reader, "500 5.5.2 Command not recognized").await?;
            }
            Command::Helo(_) => {
                self.state = SmtpState::Ready;
                write_line(reader, &format!("250 {}", ctx.hostname)).await?;
            }
            Command::Ehlo(_) => {
                self.state = SmtpState::Ready;
                write_reply(reader, 250, &self.ehlo_keywords(ctx)).await?;
            }
            Command::Rset => {
                if self.state != SmtpState::Greeting {
                    self.state = SmtpState::Ready;
                }
                write_line(reader, "250 2.0.0 OK").await?;
            }
            Command::StartTls => return self.start_tls(reader, ctx).await,
            _ if self.must_start_tls(ctx) => {
                write_line(reader, "530 5.7.0 Must issue a STARTTLS command first").await?;
            }
            Command::Auth { mechanism, initial } => {
                return self.authenticate(&mechanism, initial, reader, ctx).await;
            }
            Command::MailFrom(from) => {
                if self.state == SmtpState::Ready {
                    self.state = SmtpState::HasSender(from);
                    write_line(reader, "250 2.1.0 OK").await?;
                } else {
                    handle_bad_sequence(reader, "MAIL").await?;
                }
            }
            Command::RcptTo(to) => {
                self.state = match std::mem::replace(&mut self.state, SmtpState::Greeting) {
                    SmtpState::HasSender(from) => {
                        write_line(reader, "250 2.1.5 OK").await?;
                        SmtpState::HasRecipient(from, vec![to])
                    }
                    SmtpState::HasRecipient(from, mut to_list) => {
                        to_list.push(to);
                        write_line(reader, "250 2.1.5 OK").await?;
                        SmtpState::HasRecipient(from, to_list)
                    }
                    other => {
                        handle_bad_sequence(reader, "RCPT").await?;
                        other
                    }
                };
            }
            Command::Data => return self.receive_data(reader, ctx).await,
        }
        Ok(Step::Continue)
    }

    fn ehlo_keywords(&self, ctx: &SessionContext) -> Vec<String> {
        let mut keywords = vec![
            ctx.hostname.clone(),
            format!("SIZE {}", ctx.max_message_size),
            "8BITMIME".to_string(),
        ];
        if ctx.tls.is_some() && !self.tls_active {
            keywords.push("STARTTLS".to_string());
        }
        if ctx.capabilities.auth_required && !self.must_start_tls(ctx) {
            keywords.push(format!("AUTH {ADVERTISED_MECHANISMS}"));
        }
        keywords
    }

    async fn start_tls<S>(
        &mut self,
        reader: &mut BufReader<S>,
        ctx: &SessionContext,
    ) -> Result<Step, SessionError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        if ctx.tls.is_none() {
            write_line(reader, "502 5.5.1 STARTTLS not available").await?;
        } else if self.tls_active {
            write_line(reader, "503 5.5.1 TLS already active").await?;
        } else if self.state == SmtpState::Greeting {
            handle_bad_sequence(reader, "STARTTLS").await?;
        } else {
            write_line(reader, "220 2.0.0 Ready to start TLS").await?;
            return Ok(Step::StartTls);
        }
        Ok(Step::Continue)
    }

    async fn authenticate<S>(
        &mut self,
        mechanism: &str,
        initial: Option<String>,
        reader: &mut BufReader<S>,
        ctx: &SessionContext,
    ) -> Result<Step, SessionError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        if self.state == SmtpState::Greeting {
            handle_bad_sequence(reader, "AUTH").await?;
            return Ok(Step::Continue);
        }
        if self.authenticated {
            write_line(reader, "503 5.5.1 Already authenticated").await?;
            return Ok(Step::Continue);
        }
        let Some(mechanism) = Mechanism::parse(mechanism) else {
            write_line(reader, "504 5.5.4 Unrecognized authentication type").await?;
            return Ok(Step::Continue);
        };

        let reply = match mechanism {
            Mechanism::Plain => challenge(reader, ctx, "", initial).await?,
            // "Username:" / "Password:"
            Mechanism::Login => match challenge(reader, ctx, "VXNlcm5hbWU6", initial).await? {
                AuthReply::Data(user) => match challenge(reader, ctx, "UGFzc3dvcmQ6", None).await? {
                    AuthReply::Data(pass) => AuthReply::Data([user, vec![0], pass].concat()),
                    other => other,
                },
                other => other,
            },
        };

        let payload = match reply {
            AuthReply::Data(payload) => payload,
            AuthReply::Closed => return Ok(Step::Close),
            AuthReply::Cancelled => {
                write_line(reader, "501 5.0.0 Authentication cancelled").await?;
                return Ok(Step::Continue);
            }
            AuthReply::Malformed => {
                write_line(reader, "501 5.5.2 Cannot decode response").await?;
                return Ok(Step::Continue);
            }
        };

        self.mechanism = Some(mechanism);
        let result = ctx.authenticator.validate(mechanism, &payload);
        if result.success {
            self.authenticated = true;
            info!("AUTH {} accepted", mechanism);
            write_line(reader, "235 2.7.0 Authentication successful").await?;
        } else {
            warn!("AUTH {} rejected", mechanism);
            write_line(reader, "535 5.7.8 Authentication credentials invalid").await?;
        }
        Ok(Step::Continue)
    }

    async fn receive_data<S>(
        &mut self,
        reader: &mut BufReader<S>,
        ctx: &SessionContext,
    ) -> Result<Step, SessionError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let SmtpState::HasRecipient(from, to_list) = &self.state else {
            handle_bad_sequence(reader, "DATA").await?;
            return Ok(Step::Continue);
        };
        if ctx.capabilities.auth_required && !self.authenticated {
            write_line(reader, "530 5.7.0 Authentication required").await?;
            return Ok(Step::Continue);
        }

        let envelope = Envelope {
            mail_from: from.clone(),
            rcpt_to: to_list.clone(),
        };
        write_line(reader, "354 End data with <CR><LF>.<CR><LF>").await?;
        let outcome = read_data(reader, ctx).await?;
        self.state = SmtpState::Ready;

        match outcome {
            DataOutcome::TooLarge => {
                warn!("Rejected message from {} above {} bytes", envelope.mail_from, ctx.max_message_size);
                write_line(reader, "552 5.3.4 Message size exceeds fixed maximum message size").await?;
            }
            DataOutcome::Body(raw) if raw.is_empty() => {
                write_line(reader, "554 5.6.0 Empty message rejected").await?;
            }
            DataOutcome::Body(raw) => {
                let message = ctx.store.insert(parse_message(&raw, envelope));
                info!("New email received from {}", message.from);
                write_line(reader, &format!("250 2.0.0 OK: message {} accepted", message.id)).await?;
            }
        }
        Ok(Step::Continue)
    }
}

/// Runs one client connection from greeting to close, upgrading to TLS on request.
#[instrument(name = "session", skip(stream, ctx))]
pub async fn handle_connection<S>(
    stream: S,
    peer: SocketAddr,
    ctx: Arc<SessionContext>,
) -> Result<(), SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut session = Session::new();
    let mut reader = BufReader::new(stream);
    write_line(&mut reader, &format!("220 {} ESMTP Service Ready", ctx.hostname)).await?;

    if session.run(&mut reader, &ctx).await? != Step::StartTls {
        return Ok(());
    }
    let Some(acceptor) = ctx.tls.clone() else {
        return Ok(());
    };

    let tls_stream = timeout(ctx.idle_timeout, acceptor.accept(reader.into_inner()))
        .await
        .map_err(|_| SessionError::Timeout)?
        .map_err(SessionError::Tls)?;
    debug!("TLS established with {}", peer);
    session.upgraded();

    let mut reader = BufReader::new(tls_stream);
    session.run(&mut reader, &ctx).await?;
    Ok(())
}

/// Accepts connections until `shutdown` fires, one task per client.
pub async fn serve(listener: TcpListener, ctx: Arc<SessionContext>, shutdown: CancellationToken) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let ctx = Arc::clone(&ctx);
                    tokio::spawn(async move {
                        debug!("Accepted connection from: {}", peer);
                        if let Err(e) = handle_connection(stream, peer, ctx).await {
                            error!("SMTP connection error from {}: {}", peer, e);
                        }
                        debug!("Closing connection from: {}", peer);
                    }.in_current_span());
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }
    info!("SMTP listener shutting down");
}

async fn challenge<S>(
    reader: &mut BufReader<S>,
    ctx: &SessionContext,
    prompt: &str,
    initial: Option<String>,
) -> Result<AuthReply, SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let line = match initial {
        Some(line) => line,
        None => {
            write_line(reader, &format!("334 {prompt}")).await?;
            match read_bounded(reader, ctx.idle_timeout, MAX_COMMAND_LINE).await? {
                Line::Complete(bytes) => decode_line(&bytes),
                Line::TooLong => return Ok(AuthReply::Malformed),
                Line::Closed => return Ok(AuthReply::Closed),
            }
        }
    };

    Ok(match line.trim() {
        "*" => AuthReply::Cancelled,
        "=" => AuthReply::Data(Vec::new()),
        encoded => B64
            .decode(encoded)
            .map(AuthReply::Data)
            .unwrap_or(AuthReply::Malformed),
    })
}

/// Collects the message up to the lone-dot line, dot-unstuffed and CRLF-joined.
async fn read_data<S>(
    reader: &mut BufReader<S>,
    ctx: &SessionContext,
) -> Result<DataOutcome, SessionError>
where
    S: AsyncRead + Unpin,
{
    // A single line longer than the whole size limit can never be accepted.
    let line_limit = ctx.max_message_size.saturating_add(2);
    let mut data = Vec::new();
    let mut first = true;
    let mut too_large = false;

    loop {
        let line = match read_bounded(reader, ctx.idle_timeout, line_limit).await? {
            Line::Complete(line) => line,
            Line::TooLong => {
                too_large = true;
                continue;
            }
            Line::Closed => return Err(SessionError::TransactionAborted),
        };

        let content = strip_line_ending(&line);
        if content == b"." {
            break;
        }
        let content = content.strip_prefix(b".").unwrap_or(content);

        if too_large || data.len() + content.len() + 2 > ctx.max_message_size {
            too_large = true;
            continue;
        }
        if !first {
            data.extend_from_slice(b"\r\n");
        }
        first = false;
        data.extend_from_slice(content);
    }

    Ok(if too_large {
        DataOutcome::TooLarge
    } else {
        DataOutcome::Body(data)
    })
}

/// Reads through the next `\n` without ever buffering more than `limit` bytes.
/// An over-long line is consumed to its end and reported as [`Line::TooLong`].
async fn read_bounded<S>(
    reader: &mut BufReader<S>,
    idle: Duration,
    limit: usize,
) -> Result<Line, SessionError>
where
    S: AsyncRead + Unpin,
{
    let mut line = Vec::new();
    let read = read_chunk(reader, idle, limit, &mut line).await?;
    if read == 0 {
        return Ok(Line::Closed); // Connection closed
    }
    if line.ends_with(b"\n") || read < limit {
        return Ok(Line::Complete(line));
    }

    loop {
        line.clear();
        let read = read_chunk(reader, idle, limit, &mut line).await?;
        if read == 0 || line.ends_with(b"\n") {
            return Ok(Line::TooLong);
        }
    }
}

async fn read_chunk<S>(
    reader: &mut BufReader<S>,
    idle: Duration,
    limit: usize,
    buf: &mut Vec<u8>,
) -> Result<usize, SessionError>
where
    S: AsyncRead + Unpin,
{
    let mut bounded = (&mut *reader).take(limit as u64);
    let read = timeout(idle, bounded.read_until(b'\n', buf))
        .await
        .map_err(|_| SessionError::Timeout)??;
    Ok(read)
}

fn decode_line(bytes: &[u8]) -> String {
    String::from_utf8_lossy(strip_line_ending(bytes)).into_owned()
}

fn strip_line_ending(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

fn strip_prefix_ci<'a>(value: &'a str, prefix: &str) -> Option<&'a str> {
    value
        .get(..prefix.len())
        .filter(|head| head.eq_ignore_ascii_case(prefix))
        .map(|_| value[prefix.len()..].trim())
}

/// `<a@b.c> SIZE=10` -> `a@b.c`; bare addresses are taken up to the first space.
fn parse_email_from_command(path: &str) -> String {
    if let (Some(start), Some(end)) = (path.find('<'), path.find('>')) {
        if start < end {
            return path[start + 1..end].trim().to_string();
        }
    }
    path.split_whitespace().next().unwrap_or_default().to_string()
}

async fn handle_bad_sequence<S>(reader: &mut BufReader<S>, verb: &str) -> Result<(), SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    warn!("Bad command sequence: {}", verb);
    write_line(reader, "503 5.5.1 Bad sequence of commands").await
}

/// Writes a (possibly multi-line) reply with `code`.
async fn write_reply<S>(reader: &mut BufReader<S>, code: u16, lines: &[String]) -> Result<(), SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let last = lines.len().saturating_sub(1);
    let reply = lines
        .iter()
        .enumerate()
        .map(|(i, line)| format!("{code}{}{line}", if i == last { ' ' } else { '-' }))
        .collect::<Vec<_>>()
        .join("\r\n");
    write_line(reader, &reply).await
}

/// Helper function to write a line back to the client.
async fn write_line<S>(reader: &mut BufReader<S>, s: &str) -> Result<(), SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    debug!("-> {}", s);
    reader.get_mut().write_all(s.as_bytes()).await?;
    reader.get_mut().write_all(b"\r\n").await?;
    reader.get_mut().flush().await?;
    Ok(())
}
