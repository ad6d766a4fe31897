use std::collections::{HashMap, VecDeque};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use std::future::Future;
use tokio::time::Sleep;

use super::port::{Link, Opener, PortCandidate};
use super::{ProtoError, Result};

enum Chunk {
    Data(Vec<u8>),
    Silence(Duration),
}

/// What the fake meter sends, in order. Once exhausted the meter stays silent.
#[derive(Default)]
pub(crate) struct Script {
    chunks: VecDeque<Chunk>,
}

impl Script {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// One line terminated by CR LF.
    pub(crate) fn line(mut self, line: &str) -> Self {
        self.chunks
            .push_back(Chunk::Data(format!("{}\r\n", line).into_bytes()));
        self
    }

    pub(crate) fn raw(mut self, bytes: &[u8]) -> Self {
        self.chunks.push_back(Chunk::Data(bytes.to_vec()));
        self
    }

    pub(crate) fn silence(mut self, duration: Duration) -> Self {
        self.chunks.push_back(Chunk::Silence(duration));
        self
    }

    pub(crate) fn append(mut self, mut other: Script) -> Self {
        self.chunks.append(&mut other.chunks);
        self
    }
}

/// Everything the host did to the fake meter, shared across reopens.
#[derive(Clone, Default)]
pub(crate) struct Wire {
    written: Arc<Mutex<Vec<u8>>>,
    opens: Arc<Mutex<Vec<String>>>,
    writes_at: Arc<Mutex<Vec<tokio::time::Instant>>>,
    clears: Arc<Mutex<usize>>,
    bauds: Arc<Mutex<Vec<u32>>>,
}

impl Wire {
    /// Lines written by the host.
    pub(crate) fn commands(&self) -> Vec<String> {
        let written = self.written.lock().unwrap();
        String::from_utf8_lossy(&written)
            .lines()
            .map(String::from)
            .collect()
    }

    pub(crate) fn opens(&self) -> Vec<String> {
        self.opens.lock().unwrap().clone()
    }

    pub(crate) fn writes_at(&self) -> Vec<tokio::time::Instant> {
        self.writes_at.lock().unwrap().clone()
    }

    pub(crate) fn clears(&self) -> usize {
        *self.clears.lock().unwrap()
    }

    /// Baudrates applied to open links.
    pub(crate) fn baud_changes(&self) -> Vec<u32> {
        self.bauds.lock().unwrap().clone()
    }
}

pub(crate) struct FakeLink {
    script: VecDeque<Chunk>,
    silence: Option<Pin<Box<Sleep>>>,
    wire: Wire,
}

impl FakeLink {
    pub(crate) fn new(script: Script, wire: Wire) -> Self {
        Self {
            script: script.chunks,
            silence: None,
            wire,
        }
    }
}

impl tokio::io::AsyncRead for FakeLink {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        loop {
            if let Some(sleep) = self.silence.as_mut() {
                if sleep.as_mut().poll(cx).is_pending() {
                    return Poll::Pending;
                }
                self.silence = None;
            }
            match self.script.pop_front() {
                Some(Chunk::Silence(duration)) => {
                    self.silence = Some(Box::pin(tokio::time::sleep(duration)));
                }
                Some(Chunk::Data(mut data)) => {
                    let n = data.len().min(buf.remaining());
                    buf.put_slice(&data[..n]);
                    if n < data.len() {
                        let rest = data.split_off(n);
                        self.script.push_front(Chunk::Data(rest));
                    }
                    return Poll::Ready(Ok(()));
                }
                // A silent meter, never EOF.
                None => return Poll::Pending,
            }
        }
    }
}

impl tokio::io::AsyncWrite for FakeLink {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::result::Result<usize, std::io::Error>> {
        self.wire.written.lock().unwrap().extend_from_slice(buf);
        self.wire
            .writes_at
            .lock()
            .unwrap()
            .push(tokio::time::Instant::now());
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
    ) -> Poll<std::result::Result<(), std::io::Error>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
    ) -> Poll<std::result::Result<(), std::io::Error>> {
        Poll::Ready(Ok(()))
    }
}

impl Link for FakeLink {
    fn clear_buffers(&mut self) -> std::io::Result<()> {
        *self.wire.clears.lock().unwrap() += 1;
        Ok(())
    }

    fn set_baud_rate(&mut self, baudrate: u32) -> std::io::Result<()> {
        self.wire.bauds.lock().unwrap().push(baudrate);
        Ok(())
    }
}

/// Hands out scripted links per port. A port without a queued script is busy.
#[derive(Default)]
pub(crate) struct FakeOpener {
    ports: Vec<PortCandidate>,
    scripts: HashMap<String, VecDeque<Script>>,
    wire: Wire,
}

impl FakeOpener {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Register a port; every script is consumed by one open.
    pub(crate) fn port(mut self, name: &str, scripts: Vec<Script>) -> Self {
        self.ports.push(PortCandidate {
            name: name.to_string(),
            priority: 2,
        });
        self.scripts
            .insert(name.to_string(), scripts.into_iter().collect());
        self
    }

    pub(crate) fn wire(&self) -> Wire {
        self.wire.clone()
    }
}

impl Opener for FakeOpener {
    fn ports(&self) -> Result<Vec<PortCandidate>> {
        Ok(self.ports.clone())
    }

    fn open(&mut self, port: &str, _baudrate: u32) -> Result<Box<dyn Link>> {
        self.wire.opens.lock().unwrap().push(port.to_string());
        match self.scripts.get_mut(port).and_then(|s| s.pop_front()) {
            Some(script) => Ok(Box::new(FakeLink::new(script, self.wire.clone()))),
            None => Err(ProtoError::PortBusy {
                port: port.to_string(),
                reason: "Device or resource busy".to_string(),
            }),
        }
    }
}
