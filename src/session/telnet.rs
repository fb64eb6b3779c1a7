//! Telnet client transport (RFC 854/855).
//!
//! A [`TelnetConnection`] owns one TCP stream split into a writer task and a
//! reader task. The reader strips protocol frames, answers option
//! negotiation, decodes payload bytes as UTF-8 across read boundaries,
//! forwards the text to the caller's handler in arrival order and mirrors
//! it into an [`Inbox`] used for prompt matching.

use crate::config::TelnetLineEnding;
use crate::error::{ApiError, BridgeResult, ErrorCode};
use crate::session::utf8::Utf8Chunker;
use bytes::Bytes;
use regex::Regex;
use std::collections::HashSet;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{Notify, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant, sleep_until, timeout};

const IAC: u8 = 0xff;
const DONT: u8 = 0xfe;
const DO: u8 = 0xfd;
const WONT: u8 = 0xfc;
const WILL: u8 = 0xfb;
const SB: u8 = 0xfa;
const SE: u8 = 0xf0;

const OPT_BINARY: u8 = 0;
const OPT_ECHO: u8 = 1;
const OPT_SGA: u8 = 3;
const OPT_TTYPE: u8 = 24;
const OPT_NAWS: u8 = 31;

const TTYPE_IS: u8 = 0;
const TTYPE_SEND: u8 = 1;

const INBOX_LIMIT: usize = 64 * 1024;
const CLOSE_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct TelnetOptions {
    pub term: String,
    pub cols: u16,
    pub rows: u16,
    pub connect_timeout: Duration,
}

enum Outbound {
    Data(Bytes),
    Raw(Bytes),
    Close(oneshot::Sender<io::Result<()>>),
}

pub struct TelnetConnection {
    sender: mpsc::UnboundedSender<Outbound>,
    inbox: Arc<Inbox>,
    closed_tx: Arc<watch::Sender<bool>>,
    closed_rx: watch::Receiver<bool>,
    reader: JoinHandle<()>,
}

impl TelnetConnection {
    /// Opens the TCP stream within `options.connect_timeout` and starts the
    /// reader and writer tasks. `on_data` sees every decoded payload chunk.
    pub async fn open<F>(
        host: &str,
        port: u16,
        options: TelnetOptions,
        on_data: F,
    ) -> BridgeResult<Self>
    where
        F: Fn(&str) + Send + 'static,
    {
        let addr = format!("{}:{}", host, port);
        let stream = timeout(options.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| {
                ApiError::new(
                    ErrorCode::ConnectTimeout,
                    format!(
                        "Timed out after {}s connecting to {}:{}",
                        options.connect_timeout.as_secs(),
                        host,
                        port
                    ),
                )
            })?
            .map_err(|err| {
                ApiError::new(ErrorCode::ConnectFailed, format!("Cannot reach {}:{}", host, port))
                    .with_details(err.to_string())
            })?;
        let _ = stream.set_nodelay(true);

        let (reader, writer) = stream.into_split();
        let (tx, rx) = mpsc::unbounded_channel::<Outbound>();
        tokio::spawn(write_loop(writer, rx));

        let inbox = Arc::new(Inbox::default());
        let negotiator = Negotiator::new(options.term.clone(), options.cols, options.rows);
        let (closed_tx, closed_rx) = watch::channel(false);
        let closed_tx = Arc::new(closed_tx);

        let reader = tokio::spawn(read_loop(ReadLoop {
            reader,
            sender: tx.clone(),
            inbox: inbox.clone(),
            negotiator,
            closed_tx: closed_tx.clone(),
            on_data: Box::new(on_data),
        }));

        Ok(Self {
            sender: tx,
            inbox,
            closed_tx,
            closed_rx,
            reader,
        })
    }

    pub fn inbox(&self) -> &Arc<Inbox> {
        &self.inbox
    }

    /// Queues text for the peer, IAC-escaped and with `\n` rewritten to
    /// the requested line ending.
    pub fn send_text(&self, text: &str, line_ending: &TelnetLineEnding) -> BridgeResult<()> {
        let payload = apply_line_ending(text.as_bytes(), line_ending);
        self.sender
            .send(Outbound::Data(Bytes::from(payload)))
            .map_err(|_| {
                ApiError::new(ErrorCode::RemoteClosed, "Telnet connection is closed").into()
            })
    }

    /// Resolves once the peer closed the stream or [`close`](Self::close)
    /// ran.
    pub async fn closed(&self) {
        let mut rx = self.closed_rx.clone();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Shuts the write side down and stops the reader. The shutdown result
    /// is reported but the connection counts as closed either way.
    pub async fn close(&self) -> BridgeResult<()> {
        let (done_tx, done_rx) = oneshot::channel();
        let result = if self.sender.send(Outbound::Close(done_tx)).is_err() {
            Err(ApiError::new(ErrorCode::AlreadyClosed, "Telnet writer already stopped").into())
        } else {
            match timeout(CLOSE_GRACE, done_rx).await {
                Ok(Ok(Ok(()))) => Ok(()),
                Ok(Ok(Err(err))) => Err(ApiError::new(ErrorCode::IoError, "Telnet shutdown failed")
                    .with_details(err.to_string())
                    .into()),
                Ok(Err(_)) => {
                    Err(ApiError::new(ErrorCode::AlreadyClosed, "Telnet writer already stopped")
                        .into())
                }
                Err(_) => Err(ApiError::new(ErrorCode::IoError, "Telnet shutdown timed out").into()),
            }
        };
        self.reader.abort();
        self.inbox.mark_eof();
        self.closed_tx.send_replace(true);
        result
    }
}

impl Drop for TelnetConnection {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn write_loop(
    mut writer: tokio::net::tcp::OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
) {
    while let Some(item) = rx.recv().await {
        let frame = match item {
            Outbound::Close(done) => {
                let _ = done.send(writer.shutdown().await);
                break;
            }
            Outbound::Data(data) => Bytes::from(escape_iac(&data)),
            Outbound::Raw(data) => data,
        };
        if let Err(err) = writer.write_all(&frame).await {
            tracing::warn!(error = %err, "Telnet write failed");
            break;
        }
        let _ = writer.flush().await;
    }
}

struct ReadLoop {
    reader: tokio::net::tcp::OwnedReadHalf,
    sender: mpsc::UnboundedSender<Outbound>,
    inbox: Arc<Inbox>,
    negotiator: Negotiator,
    closed_tx: Arc<watch::Sender<bool>>,
    on_data: Box<dyn Fn(&str) + Send>,
}

async fn read_loop(mut ctx: ReadLoop) {
    let mut parser = TelnetParser::default();
    // One decoder per connection: a character may straddle reads or
    // negotiation frames.
    let mut decoder = Utf8Chunker::default();
    let mut buf = [0u8; 4096];
    loop {
        match ctx.reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                for frame in parser.feed(&buf[..n]) {
                    match frame {
                        Frame::Data(data) => {
                            let text = decoder.push(&data);
                            ctx.deliver(&text);
                        }
                        other => {
                            for reply in ctx.negotiator.respond(&other) {
                                let _ = ctx.sender.send(Outbound::Raw(Bytes::from(reply)));
                            }
                        }
                    }
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, "Telnet read failed");
                break;
            }
        }
    }
    let tail = decoder.finish();
    ctx.deliver(&tail);
    ctx.inbox.mark_eof();
    ctx.closed_tx.send_replace(true);
}

impl ReadLoop {
    fn deliver(&self, text: &str) {
        if !text.is_empty() {
            (self.on_data)(text);
            self.inbox.append(text);
        }
    }
}

/// Text received since the last consumed match, for prompt detection.
#[derive(Default)]
pub struct Inbox {
    text: Mutex<String>,
    notify: Notify,
    eof: AtomicBool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitOutcome {
    /// Index of the pattern that matched, plus the consumed text.
    Matched(usize, String),
    Eof,
    TimedOut,
}

impl Inbox {
    pub fn append(&self, text: &str) {
        {
            let mut buf = self.text.lock().expect("inbox mutex poisoned");
            buf.push_str(text);
            if buf.len() > INBOX_LIMIT {
                let mut cut = buf.len() - INBOX_LIMIT;
                while !buf.is_char_boundary(cut) {
                    cut += 1;
                }
                buf.drain(..cut);
            }
        }
        self.notify.notify_waiters();
    }

    pub fn clear(&self) {
        self.text.lock().expect("inbox mutex poisoned").clear();
    }

    pub fn mark_eof(&self) {
        self.eof.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_eof(&self) -> bool {
        self.eof.load(Ordering::SeqCst)
    }

    /// Waits until one of `patterns` matches the pending text. Text up to
    /// the end of the match is consumed so the same prompt is not seen
    /// twice. Earlier patterns win when several match.
    pub async fn wait_for(&self, patterns: &[&Regex], deadline: Instant) -> WaitOutcome {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut text = self.text.lock().expect("inbox mutex poisoned");
                for (index, pattern) in patterns.iter().enumerate() {
                    if let Some(found) = pattern.find(&text) {
                        let end = found.end();
                        let consumed: String = text.drain(..end).collect();
                        return WaitOutcome::Matched(index, consumed);
                    }
                }
            }
            if self.is_eof() {
                return WaitOutcome::Eof;
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = sleep_until(deadline) => return WaitOutcome::TimedOut,
            }
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Frame {
    Data(Vec<u8>),
    Negotiate { verb: u8, option: u8 },
    Subnegotiate { option: u8, payload: Vec<u8> },
}

#[derive(Debug, Default, Clone, Copy)]
enum ParseState {
    #[default]
    Text,
    CarriageReturn,
    Command,
    Option(u8),
    Sub,
    SubCommand,
}

/// Incremental splitter of a Telnet byte stream into data and protocol
/// frames. Frames keep stream order; state survives across `feed` calls.
#[derive(Default)]
struct TelnetParser {
    state: ParseState,
    pending: Vec<u8>,
    sub_option: Option<u8>,
    sub_payload: Vec<u8>,
}

impl TelnetParser {
    fn feed(&mut self, input: &[u8]) -> Vec<Frame> {
        let mut frames = Vec::new();
        for &byte in input {
            self.state = match self.state {
                ParseState::Text | ParseState::CarriageReturn => {
                    let after_cr = matches!(self.state, ParseState::CarriageReturn);
                    match byte {
                        IAC => ParseState::Command,
                        // CR NUL is a bare carriage return on the wire.
                        0 if after_cr => ParseState::Text,
                        b'\r' => {
                            self.pending.push(byte);
                            ParseState::CarriageReturn
                        }
                        _ => {
                            self.pending.push(byte);
                            ParseState::Text
                        }
                    }
                }
                ParseState::Command => match byte {
                    IAC => {
                        self.pending.push(IAC);
                        ParseState::Text
                    }
                    DO | DONT | WILL | WONT => ParseState::Option(byte),
                    SB => {
                        self.flush_data(&mut frames);
                        self.sub_option = None;
                        self.sub_payload.clear();
                        ParseState::Sub
                    }
                    _ => ParseState::Text,
                },
                ParseState::Option(verb) => {
                    self.flush_data(&mut frames);
                    frames.push(Frame::Negotiate { verb, option: byte });
                    ParseState::Text
                }
                ParseState::Sub => {
                    if byte == IAC {
                        ParseState::SubCommand
                    } else {
                        if self.sub_option.is_none() {
                            self.sub_option = Some(byte);
                        } else {
                            self.sub_payload.push(byte);
                        }
                        ParseState::Sub
                    }
                }
                ParseState::SubCommand => match byte {
                    SE => {
                        if let Some(option) = self.sub_option.take() {
                            frames.push(Frame::Subnegotiate {
                                option,
                                payload: std::mem::take(&mut self.sub_payload),
                            });
                        }
                        ParseState::Text
                    }
                    IAC => {
                        self.sub_payload.push(IAC);
                        ParseState::Sub
                    }
                    _ => ParseState::Sub,
                },
            };
        }
        self.flush_data(&mut frames);
        frames
    }

    fn flush_data(&mut self, frames: &mut Vec<Frame>) {
        if !self.pending.is_empty() {
            frames.push(Frame::Data(std::mem::take(&mut self.pending)));
        }
    }
}

/// Option state per RFC 1143 in its simple form: answer only requests
/// that change state, refuse anything outside the supported sets.
struct Negotiator {
    local: HashSet<u8>,
    remote: HashSet<u8>,
    term: String,
    cols: u16,
    rows: u16,
}

impl Negotiator {
    fn new(term: String, cols: u16, rows: u16) -> Self {
        Self {
            local: HashSet::new(),
            remote: HashSet::new(),
            term,
            cols,
            rows,
        }
    }

    fn respond(&mut self, frame: &Frame) -> Vec<Vec<u8>> {
        match *frame {
            Frame::Negotiate { verb, option } => self.negotiate(verb, option),
            Frame::Subnegotiate {
                option,
                ref payload,
            } if option == OPT_TTYPE && payload.first() == Some(&TTYPE_SEND) => {
                vec![self.terminal_type()]
            }
            _ => Vec::new(),
        }
    }

    fn negotiate(&mut self, verb: u8, option: u8) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        match verb {
            DO if supports_local(option) => {
                if self.local.insert(option) {
                    out.push(vec![IAC, WILL, option]);
                    if option == OPT_NAWS {
                        out.push(self.window_size());
                    }
                }
            }
            DO => out.push(vec![IAC, WONT, option]),
            DONT => {
                if self.local.remove(&option) {
                    out.push(vec![IAC, WONT, option]);
                }
            }
            WILL if supports_remote(option) => {
                if self.remote.insert(option) {
                    out.push(vec![IAC, DO, option]);
                }
            }
            WILL => out.push(vec![IAC, DONT, option]),
            WONT => {
                if self.remote.remove(&option) {
                    out.push(vec![IAC, DONT, option]);
                }
            }
            _ => {}
        }
        out
    }

    fn window_size(&self) -> Vec<u8> {
        let mut frame = vec![IAC, SB, OPT_NAWS];
        frame.extend(escape_iac(&self.cols.to_be_bytes()));
        frame.extend(escape_iac(&self.rows.to_be_bytes()));
        frame.extend([IAC, SE]);
        frame
    }

    fn terminal_type(&self) -> Vec<u8> {
        let mut frame = vec![IAC, SB, OPT_TTYPE, TTYPE_IS];
        frame.extend(escape_iac(self.term.as_bytes()));
        frame.extend([IAC, SE]);
        frame
    }
}

fn supports_local(option: u8) -> bool {
    matches!(option, OPT_BINARY | OPT_SGA | OPT_TTYPE | OPT_NAWS)
}

fn supports_remote(option: u8) -> bool {
    matches!(option, OPT_BINARY | OPT_ECHO | OPT_SGA)
}

fn escape_iac(bytes: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(bytes.len());
    for &b in bytes {
        out.push(b);
        if b == IAC {
            out.push(IAC);
        }
    }
    out
}

pub fn apply_line_ending(bytes: &[u8], mode: &TelnetLineEnding) -> Vec<u8> {
    match mode {
        TelnetLineEnding::PassThrough | TelnetLineEnding::Lf => bytes.to_vec(),
        TelnetLineEnding::Cr => bytes
            .iter()
            .map(|&b| if b == b'\n' { b'\r' } else { b })
            .collect(),
        TelnetLineEnding::Crlf => {
            let mut out = Vec::with_capacity(bytes.len() + 1);
            for &b in bytes {
                if b == b'\n' {
                    out.push(b'\r');
                }
                out.push(b);
            }
            out
        }
    }
}
