//! Fake remote shells for integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use client::config::ConnectionArgs;
use client::events::{EventSink, SessionEvent};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpListener;

pub const IAC: u8 = 255;

/// What the fake shell does with one received command line.
#[derive(Debug, Clone)]
pub enum Reply {
    /// Echo the command, print the output, then the prompt.
    Output(String),
    /// As `Output`, but only after a delay.
    Delayed(Duration, String),
    /// Echo the command and print partial output, never the prompt.
    Hang(String),
    /// Close the connection.
    Hangup,
}

type Script = dyn Fn(&str) -> Reply + Send + Sync;

/// A fake shell listening on 127.0.0.1.
pub struct FakeShell {
    pub port: u16,
    pub connections: Arc<AtomicUsize>,
    /// Every TELNET command triple the client sent, in order.
    pub negotiation: Arc<Mutex<Vec<[u8; 3]>>>,
    /// Every command line the client sent, in order.
    pub commands: Arc<Mutex<Vec<String>>>,
}

impl FakeShell {
    /// Start a shell that greets each connection with `greeting` and
    /// answers commands according to `script`, ending output with `prompt`.
    pub async fn start(
        greeting: &[u8],
        prompt: &str,
        script: impl Fn(&str) -> Reply + Send + Sync + 'static,
    ) -> Self {
        Self::start_staggered(&[(Duration::ZERO, greeting)], prompt, script).await
    }

    /// Like [`FakeShell::start`], but the greeting is written in parts,
    /// each after its delay.
    pub async fn start_staggered(
        greeting: &[(Duration, &[u8])],
        prompt: &str,
        script: impl Fn(&str) -> Reply + Send + Sync + 'static,
    ) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let shell = Self {
            port,
            connections: Arc::new(AtomicUsize::new(0)),
            negotiation: Arc::new(Mutex::new(Vec::new())),
            commands: Arc::new(Mutex::new(Vec::new())),
        };

        let script: Arc<Script> = Arc::new(script);
        let greeting: Vec<(Duration, Vec<u8>)> = greeting
            .iter()
            .map(|(delay, part)| (*delay, part.to_vec()))
            .collect();
        let prompt = prompt.to_string();
        let connections = Arc::clone(&shell.connections);
        let negotiation = Arc::clone(&shell.negotiation);
        let commands = Arc::clone(&shell.commands);

        tokio::spawn(async move {
            loop {
                let Ok((socket, _)) = listener.accept().await else {
                    return;
                };
                connections.fetch_add(1, Ordering::SeqCst);

                let script = Arc::clone(&script);
                let greeting = greeting.clone();
                let prompt = prompt.clone();
                let negotiation = Arc::clone(&negotiation);
                let commands = Arc::clone(&commands);

                tokio::spawn(async move {
                    let (read, mut write) = socket.into_split();
                    let mut reader = BufReader::new(read);

                    for (delay, part) in &greeting {
                        tokio::time::sleep(*delay).await;
                        if write.write_all(part).await.is_err() {
                            return;
                        }
                    }

                    while let Some(line) = read_line(&mut reader, &negotiation).await {
                        commands.lock().unwrap().push(line.clone());
                        let reply = match (*script)(&line) {
                            Reply::Output(output) => format!("{}\r\n{}\r\n{}", line, output, prompt),
                            Reply::Delayed(delay, output) => {
                                tokio::time::sleep(delay).await;
                                format!("{}\r\n{}\r\n{}", line, output, prompt)
                            }
                            Reply::Hang(partial) => format!("{}\r\n{}", line, partial),
                            Reply::Hangup => return,
                        };
                        if write.write_all(reply.as_bytes()).await.is_err() {
                            return;
                        }
                    }
                });
            }
        });

        shell
    }

    /// Connection arguments pointing at this shell.
    pub fn args(&self) -> ConnectionArgs {
        ConnectionArgs::new("127.0.0.1")
            .port(self.port as i64)
            .timeout_ms(1000)
            .negotiation_grace_ms(50)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub fn negotiation(&self) -> Vec<[u8; 3]> {
        self.negotiation.lock().unwrap().clone()
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }
}

/// Read one CR LF line, setting aside any IAC triples in front of it.
async fn read_line(
    reader: &mut BufReader<OwnedReadHalf>,
    negotiation: &Mutex<Vec<[u8; 3]>>,
) -> Option<String> {
    let mut line = Vec::new();
    loop {
        let byte = reader.read_u8().await.ok()?;
        if byte == IAC {
            let verb = reader.read_u8().await.ok()?;
            let option = reader.read_u8().await.ok()?;
            negotiation.lock().unwrap().push([IAC, verb, option]);
            continue;
        }
        line.push(byte);
        if line.ends_with(b"\r\n") {
            line.truncate(line.len() - 2);
            return Some(String::from_utf8_lossy(&line).into_owned());
        }
    }
}

/// Sink that keeps every event.
#[derive(Default)]
pub struct CollectingSink {
    events: Mutex<Vec<SessionEvent>>,
}

impl CollectingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<SessionEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.events().iter().map(SessionEvent::name).collect()
    }
}

impl EventSink for CollectingSink {
    fn emit(&self, event: &SessionEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}
