use futures::{SinkExt, StreamExt};
use std::{io, time::Duration};
use tokio::time::Instant;
use tokio_util::codec::{Decoder, Framed};

use super::{
    codec::LineCodec,
    command::Command,
    port::{Link, Opener, PortSelector},
    response::{Ident, Response},
    ProtoError, Result,
};
use crate::config::Config;

type Stream = Framed<Box<dyn Link>, LineCodec>;

/// Line oriented connection to the meter with failure bookkeeping.
///
/// Consecutive failures reported through [`Transport::record_failure`] first
/// flush the buffers, then close and reopen the port. After a reopen no
/// command leaves the transport before the cool-off has passed.
pub struct Transport {
    opener: Box<dyn Opener>,
    config: Config,
    stream: Option<Stream>,
    port: Option<String>,
    baudrate: u32,
    failures: u32,
    last_activity: Option<Instant>,
    last_write: Option<Instant>,
    cool_off_until: Option<Instant>,
}

impl Transport {
    pub fn new(opener: Box<dyn Opener>, config: Config, baudrate: u32) -> Self {
        Self {
            opener,
            config,
            stream: None,
            port: None,
            baudrate,
            failures: 0,
            last_activity: None,
            last_write: None,
            cool_off_until: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    /// The port was lost by a failed reopen, not closed on request.
    pub fn is_lost(&self) -> bool {
        self.stream.is_none() && self.port.is_some()
    }

    pub fn port(&self) -> Option<&str> {
        self.port.as_deref()
    }

    pub fn baudrate(&self) -> u32 {
        self.baudrate
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn last_activity(&self) -> Option<Instant> {
        self.last_activity
    }

    pub fn is_cooling_off(&self) -> bool {
        self.cool_off_until
            .map(|until| Instant::now() < until)
            .unwrap_or(false)
    }

    pub fn opener(&self) -> &dyn Opener {
        self.opener.as_ref()
    }

    /// Open `selector` and verify that a 2831E answers.
    ///
    /// With [`PortSelector::Auto`] every candidate port is probed in turn and
    /// the first one answering the identity query is kept.
    pub async fn open(&mut self, selector: &PortSelector, baudrate: u32) -> Result<Ident> {
        self.close();
        self.baudrate = baudrate;

        let candidates: Vec<String> = match selector {
            PortSelector::Named(name) => vec![name.clone()],
            PortSelector::Auto => self.opener.ports()?.into_iter().map(|p| p.name).collect(),
        };
        log::debug!("transport: probing {:?} at {} baud", candidates, baudrate);

        let mut busy = None;
        for port in candidates {
            let link = match self.opener.open(&port, baudrate) {
                Ok(link) => link,
                Err(err) => {
                    log::debug!("transport: cannot open {}: {}", port, err);
                    busy.get_or_insert(err);
                    continue;
                }
            };
            self.attach(port.clone(), link);
            tokio::time::sleep(self.config.open_settle).await;

            match self.probe().await {
                Ok(ident) => {
                    log::info!(
                        "transport: {} answers on {} at {} baud",
                        ident.model,
                        port,
                        baudrate
                    );
                    return Ok(ident);
                }
                Err(err) => {
                    log::debug!("transport: no 2831E on {}: {}", port, err);
                    self.close();
                }
            }
        }
        Err(busy.unwrap_or(ProtoError::NoDeviceFound))
    }

    async fn probe(&mut self) -> Result<Ident> {
        for _ in 0..2 {
            if let Some(line) = self.query(Command::Id, self.config.read_timeout).await? {
                let ident = Ident::try_from(line.as_str())?;
                if ident.is_2831e() {
                    self.record_success();
                    return Ok(ident);
                }
                log::warn!("transport: unexpected identity {:?}", ident.raw);
                return Err(ProtoError::NoDeviceFound);
            }
        }
        Err(ProtoError::NotResponding)
    }

    fn attach(&mut self, port: String, link: Box<dyn Link>) {
        self.stream = Some(LineCodec::default().framed(link));
        self.port = Some(port);
        self.last_activity = Some(Instant::now());
    }

    /// Release the port. Closing a closed transport is a no-op.
    pub fn close(&mut self) {
        if self.stream.take().is_some() {
            log::info!(
                "transport: closed {}",
                self.port.as_deref().unwrap_or_default()
            );
        }
        self.port = None;
        self.failures = 0;
        self.cool_off_until = None;
    }

    /// Change the host side baudrate, now and for every later reopen.
    pub fn set_baud_rate(&mut self, baudrate: u32) -> Result<()> {
        self.baudrate = baudrate;
        if let Some(stream) = self.stream.as_mut() {
            stream.get_mut().set_baud_rate(baudrate)?;
            log::info!("transport: applied {} baud to open port", baudrate);
        }
        Ok(())
    }

    async fn wait_ready(&mut self) {
        if let Some(until) = self.cool_off_until.take() {
            if Instant::now() < until {
                log::debug!(
                    "transport: cooling off for {:?}",
                    until.saturating_duration_since(Instant::now())
                );
                tokio::time::sleep_until(until).await;
            }
        }
        if let Some(last) = self.last_write {
            tokio::time::sleep_until(last + self.config.command_gap).await;
        }
    }

    /// Send one command line. Waits for the throttle gap and a pending cool-off.
    pub async fn write_line(&mut self, command: Command) -> Result<()> {
        if self.stream.is_none() {
            return Err(ProtoError::NotConnected);
        }
        self.wait_ready().await;

        let write_timeout = self.config.write_timeout;
        let stream = self.stream.as_mut().ok_or(ProtoError::NotConnected)?;
        log::debug!("transport: -> {}", command);
        match tokio::time::timeout(write_timeout, stream.send(command)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return Err(ProtoError::WriteError(err)),
            Err(_) => {
                return Err(ProtoError::WriteError(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "write timed out",
                )))
            }
        }

        let now = Instant::now();
        self.last_write = Some(now);
        self.last_activity = Some(now);
        Ok(())
    }

    /// Wait up to `timeout` for the next non-empty line.
    pub async fn read_line(&mut self, timeout: Duration) -> Result<Response> {
        let stream = self.stream.as_mut().ok_or(ProtoError::NotConnected)?;
        match tokio::time::timeout(timeout, stream.next()).await {
            Err(_) => Err(ProtoError::ReadTimeout(timeout)),
            Ok(Some(Ok(response))) => {
                log::trace!("transport: <- {:?}", response);
                self.last_activity = Some(Instant::now());
                Ok(response)
            }
            Ok(Some(Err(err))) => Err(err.into()),
            Ok(None) => Err(ProtoError::Abort),
        }
    }

    /// Send `command` and return the first line that is not its echo, or
    /// `None` if nothing arrives within `timeout`.
    pub async fn query(&mut self, command: Command, timeout: Duration) -> Result<Option<String>> {
        self.write_line(command).await?;
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            match self.read_line(remaining).await {
                Ok(Response::Echo(echo)) => log::trace!("transport: skipping echo {:?}", echo),
                Ok(Response::Line(line)) => return Ok(Some(line)),
                Err(ProtoError::ReadTimeout(_)) => return Ok(None),
                Err(err) => return Err(err),
            }
        }
    }

    /// Flush host buffers and any partial line, keeping the port open.
    pub fn light_reset(&mut self) {
        if let Some(stream) = self.stream.as_mut() {
            stream.read_buffer_mut().clear();
            stream.write_buffer_mut().clear();
            if let Err(err) = stream.get_mut().clear_buffers() {
                log::warn!("transport: clearing buffers failed: {}", err);
            }
            log::debug!("transport: light reset");
        }
    }

    /// Close and reopen the port, then flush it and start the cool-off.
    pub fn heavy_reset(&mut self) -> Result<()> {
        let port = self.port.clone().ok_or(ProtoError::NotConnected)?;
        log::warn!(
            "transport: reopening {} after {} failures",
            port,
            self.failures
        );
        self.stream = None;
        self.cool_off_until = Some(Instant::now() + self.config.cool_off_for(self.failures));

        let link = self.opener.open(&port, self.baudrate)?;
        self.attach(port, link);
        self.light_reset();
        Ok(())
    }

    /// Count a failed exchange and escalate resets at the thresholds.
    pub fn record_failure(&mut self) {
        self.failures += 1;
        if self.failures >= self.config.heavy_reset_after {
            if let Err(err) = self.heavy_reset() {
                log::error!("transport: reopen failed: {}", err);
            }
            self.failures = 0;
        } else if self.failures >= self.config.light_reset_after {
            self.light_reset();
        }
    }

    pub fn record_success(&mut self) {
        self.failures = 0;
    }
}
