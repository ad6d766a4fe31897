use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

use crate::config::Config;
use crate::measurement::{
    Function, FunctionState, RangeSpec, Reading, TriggerSource, Validity, NPLC_CHOICES,
};
use crate::proto::{
    command::Command,
    port::{self, Opener, PortSelector, SerialOpener},
    response::{parse_value, Ident, Response},
    transport::Transport,
    ProtoError, Result,
};
use crate::{DEFAULT_BAUDRATE, SUPPORTED_BAUDRATES};

/// Driver for one BK Precision 2831E.
///
/// All operations take `&mut self`: the meter speaks strict request/response
/// over a single link, so calls must not overlap. Every call is bounded by the
/// timeouts in [`Config`].
pub struct Device {
    transport: Transport,
    config: Config,
    selector: Option<PortSelector>,
    ident: Option<Ident>,
    active: Option<Function>,
    states: HashMap<Function, FunctionState>,
    trigger: TriggerSource,
}

impl Default for Device {
    fn default() -> Self {
        Self::new()
    }
}

impl Device {
    /// Driver using the host's serial ports. Not connected yet.
    pub fn new() -> Self {
        Self::with_opener(Box::new(SerialOpener), Config::default())
    }

    pub fn with_opener(opener: Box<dyn Opener>, config: Config) -> Self {
        Self {
            transport: Transport::new(opener, config.clone(), DEFAULT_BAUDRATE),
            config,
            selector: None,
            ident: None,
            active: None,
            states: HashMap::new(),
            trigger: TriggerSource::default(),
        }
    }

    /// Ports to offer for [`Device::connect`], `Auto` first.
    pub fn available_ports(&self) -> Result<Vec<PortSelector>> {
        port::available_ports(self.transport.opener())
    }

    pub async fn connect(&mut self, selector: PortSelector, baudrate: u32) -> Result<Ident> {
        if !SUPPORTED_BAUDRATES.contains(&baudrate) {
            return Err(ProtoError::UnsupportedBaudRate(baudrate));
        }
        if self.transport.is_open()
            && self.selector.as_ref() == Some(&selector)
            && self.transport.baudrate() == baudrate
        {
            match self.identify().await {
                Ok(ident) => {
                    log::info!("dmm: already connected on {}", selector);
                    return Ok(ident);
                }
                Err(err) => log::warn!("dmm: connected meter stopped answering: {}", err),
            }
        }

        self.forget_state();
        let ident = self.transport.open(&selector, baudrate).await?;
        log::info!(
            "dmm: connected to {} on {} at {} baud",
            ident.raw,
            self.transport.port().unwrap_or_default(),
            baudrate
        );
        self.selector = Some(selector);
        self.ident = Some(ident.clone());
        Ok(ident)
    }

    /// Hand the meter back to the front panel and release the port.
    /// Disconnecting twice is a no-op.
    pub async fn disconnect(&mut self) {
        if self.transport.is_open() {
            if let Err(err) = self.transport.write_line(Command::Reset).await {
                log::warn!("dmm: reset before close failed: {}", err);
            }
        }
        self.transport.close();
        self.selector = None;
        self.ident = None;
        self.forget_state();
    }

    fn forget_state(&mut self) {
        self.active = None;
        self.states.clear();
        self.trigger = TriggerSource::default();
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_open()
    }

    /// True while the link recovers from a reopen. Pollers should back off.
    pub fn is_cooling_off(&self) -> bool {
        self.transport.is_cooling_off()
    }

    pub fn ident(&self) -> Option<&Ident> {
        self.ident.as_ref()
    }

    pub fn port(&self) -> Option<&str> {
        self.transport.port()
    }

    pub fn baudrate(&self) -> u32 {
        self.transport.baudrate()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn active_function(&self) -> Option<Function> {
        self.active
    }

    pub fn trigger_source(&self) -> TriggerSource {
        self.trigger
    }

    pub fn function_state(&self, function: Function) -> FunctionState {
        self.states.get(&function).copied().unwrap_or_default()
    }

    /// Host side only, the meter keeps its own setting.
    pub fn set_baud_rate(&mut self, baudrate: u32) -> Result<()> {
        if !SUPPORTED_BAUDRATES.contains(&baudrate) {
            return Err(ProtoError::UnsupportedBaudRate(baudrate));
        }
        self.transport.set_baud_rate(baudrate)
    }

    async fn ensure_connected(&mut self) -> Result<()> {
        if self.transport.is_lost() {
            log::info!("dmm: trying to recover lost port");
            if let Err(err) = self.transport.heavy_reset() {
                log::warn!("dmm: port still unavailable: {}", err);
            }
        }
        if self.transport.is_open() {
            Ok(())
        } else {
            Err(ProtoError::NotConnected)
        }
    }

    pub async fn identify(&mut self) -> Result<Ident> {
        self.ensure_connected().await?;
        for _ in 0..2 {
            match self
                .transport
                .query(Command::Id, self.config.read_timeout)
                .await
            {
                Ok(Some(line)) => {
                    let ident = Ident::try_from(line.as_str())?;
                    self.transport.record_success();
                    self.ident = Some(ident.clone());
                    return Ok(ident);
                }
                Ok(None) => log::debug!("dmm: no answer to *IDN?"),
                Err(ProtoError::NotConnected) => return Err(ProtoError::NotConnected),
                Err(err) => log::warn!("dmm: identity query failed: {}", err),
            }
        }
        self.transport.record_failure();
        Err(ProtoError::NotResponding)
    }

    /// Write `command`, retrying transport failures.
    async fn send(&mut self, command: Command) -> Result<()> {
        let attempts = self.config.fetch_attempts.max(1);
        for attempt in 1..=attempts {
            match self.transport.write_line(command.clone()).await {
                Ok(()) => return Ok(()),
                Err(ProtoError::NotConnected) => return Err(ProtoError::NotConnected),
                Err(err) => log::warn!(
                    "dmm: sending {} failed ({}/{}): {}",
                    command,
                    attempt,
                    attempts,
                    err
                ),
            }
            self.transport.record_failure();
            if attempt < attempts {
                tokio::time::sleep(self.config.retry_backoff * attempt).await;
            }
        }
        Err(ProtoError::NotResponding)
    }

    /// Send a configuration command and swallow its optional echo.
    async fn command(&mut self, command: Command) -> Result<()> {
        self.send(command).await?;
        match self.transport.read_line(self.config.echo_timeout).await {
            Ok(Response::Echo(_)) | Err(ProtoError::ReadTimeout(_)) => {}
            Ok(Response::Line(line)) => log::debug!("dmm: discarding {:?} after command", line),
            Err(err) => log::debug!("dmm: reading echo failed: {}", err),
        }
        Ok(())
    }

    /// Send `command` and recover one number from whatever comes back.
    ///
    /// Each attempt resends the query and reads lines until a value parses,
    /// the attempt window closes or too many lines were garbage. Echoes and
    /// fragments of the query are skipped by the codec. Failed attempts are
    /// reported to the transport, which flushes or reopens the port.
    async fn robust_fetch(&mut self, command: Command) -> Result<(f64, Validity)> {
        let attempts = self.config.fetch_attempts.max(1);
        for attempt in 1..=attempts {
            match self.fetch_attempt(&command).await {
                Ok(Some(value)) => {
                    self.transport.record_success();
                    return Ok(value);
                }
                Ok(None) => log::debug!(
                    "dmm: no value for {} ({}/{})",
                    command,
                    attempt,
                    attempts
                ),
                Err(ProtoError::NotConnected) => return Err(ProtoError::NotConnected),
                Err(err) => log::warn!("dmm: {} failed ({}/{}): {}", command, attempt, attempts, err),
            }
            self.transport.record_failure();
            if attempt < attempts {
                tokio::time::sleep(self.config.retry_backoff * attempt).await;
            }
        }
        log::error!("dmm: unable to fetch numeric value for {}", command);
        Err(ProtoError::UnreadableResponse)
    }

    async fn fetch_attempt(&mut self, command: &Command) -> Result<Option<(f64, Validity)>> {
        self.transport.write_line(command.clone()).await?;
        let deadline = Instant::now() + self.config.fetch_window;
        let mut lines = 0;
        while lines < self.config.max_lines {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match self
                .transport
                .read_line(self.config.line_timeout.min(remaining))
                .await
            {
                Ok(Response::Echo(echo)) => {
                    lines += 1;
                    log::trace!("dmm: skipping echo {:?}", echo);
                }
                Ok(Response::Line(line)) => {
                    lines += 1;
                    match parse_value(&line) {
                        Some(value) => return Ok(Some(value)),
                        None => log::debug!("dmm: discarding garbage {:?}", line),
                    }
                }
                Err(ProtoError::ReadTimeout(_)) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(None)
    }

    async fn select_function(&mut self, function: Function) -> Result<()> {
        if self.active != Some(function) {
            self.command(Command::SelectFunction(function)).await?;
            self.active = Some(function);
        }
        Ok(())
    }

    async fn pulse_trigger(&mut self) -> Result<()> {
        self.send(Command::Init).await?;
        self.send(Command::Trigger).await?;
        log::debug!("dmm: INIT + *TRG sent");
        Ok(())
    }

    /// Take one reading in `function`, switching the meter to it if needed.
    pub async fn read(&mut self, function: Function) -> Result<Reading> {
        self.ensure_connected().await?;
        self.select_function(function).await?;
        if self.trigger == TriggerSource::Bus {
            self.pulse_trigger().await?;
            tokio::time::sleep(self.config.trigger_settle).await;
        }
        let (value, validity) = self.robust_fetch(Command::Fetch).await?;
        Ok(Reading::new(value, function, validity))
    }

    pub async fn read_dc_voltage(&mut self) -> Result<Reading> {
        self.read(Function::DcVoltage).await
    }

    pub async fn read_dc_current(&mut self) -> Result<Reading> {
        self.read(Function::DcCurrent).await
    }

    pub async fn read_ac_voltage(&mut self) -> Result<Reading> {
        self.read(Function::AcVoltage).await
    }

    pub async fn read_ac_current(&mut self) -> Result<Reading> {
        self.read(Function::AcCurrent).await
    }

    pub async fn read_resistance(&mut self) -> Result<Reading> {
        self.read(Function::Resistance).await
    }

    pub async fn read_frequency(&mut self) -> Result<Reading> {
        self.read(Function::Frequency).await
    }

    pub async fn read_period(&mut self) -> Result<Reading> {
        self.read(Function::Period).await
    }

    pub async fn read_temperature(&mut self) -> Result<Reading> {
        self.read(Function::Temperature).await
    }

    pub async fn set_range(&mut self, function: Function, range: RangeSpec) -> Result<()> {
        let ranges = function.info().ranges;
        let unsupported = || ProtoError::UnsupportedRange {
            function,
            range: range.to_string(),
        };
        if ranges.is_empty() {
            return Err(unsupported());
        }
        let range = match range {
            RangeSpec::Auto => RangeSpec::Auto,
            RangeSpec::Value(v) => ranges
                .iter()
                .find(|r| (*r - v).abs() <= r.abs() * 1e-9)
                .map(|r| RangeSpec::Value(*r))
                .ok_or_else(unsupported)?,
        };

        self.ensure_connected().await?;
        self.command(Command::SetRange(function, range)).await?;
        self.states.entry(function).or_default().range = Some(range);
        Ok(())
    }

    pub async fn set_nplc(&mut self, function: Function, value: f64) -> Result<()> {
        if !function.supports_nplc() {
            return Err(ProtoError::UnsupportedForFunction {
                function,
                operation: "NPLC",
            });
        }
        if !NPLC_CHOICES.contains(&value) {
            return Err(ProtoError::InvalidNplc(value));
        }

        self.ensure_connected().await?;
        self.command(Command::SetNplc(function, value)).await?;
        self.states.entry(function).or_default().nplc = Some(value);
        Ok(())
    }

    fn reference_window(&self, function: Function) -> Result<(f64, f64)> {
        function
            .info()
            .reference
            .ok_or(ProtoError::UnsupportedForFunction {
                function,
                operation: "Reference",
            })
    }

    pub async fn enable_reference(&mut self, function: Function, enabled: bool) -> Result<()> {
        self.reference_window(function)?;

        self.ensure_connected().await?;
        self.command(Command::SetReferenceState(function, enabled))
            .await?;
        self.states.entry(function).or_default().reference.enabled = enabled;
        Ok(())
    }

    pub async fn set_reference(&mut self, function: Function, value: f64) -> Result<()> {
        let (min, max) = self.reference_window(function)?;
        if !(min..=max).contains(&value) {
            return Err(ProtoError::ReferenceOutOfRange {
                function,
                value,
                min,
                max,
            });
        }

        self.ensure_connected().await?;
        self.command(Command::SetReference(function, value)).await?;
        self.states.entry(function).or_default().reference.value = Some(value);
        Ok(())
    }

    /// Reference value the meter currently applies.
    pub async fn query_reference(&mut self, function: Function) -> Result<f64> {
        self.reference_window(function)?;

        self.ensure_connected().await?;
        let (value, _) = self.robust_fetch(Command::GetReference(function)).await?;
        self.states.entry(function).or_default().reference.value = Some(value);
        Ok(value)
    }

    /// Use a fresh reading as reference (REL on the front panel).
    ///
    /// If the reading fails the cached reference stays untouched and the
    /// read error is returned.
    pub async fn acquire_reference(&mut self, function: Function) -> Result<Reading> {
        self.reference_window(function)?;

        let reading = self.read(function).await?;
        self.set_reference(function, reading.value).await?;
        Ok(reading)
    }

    pub async fn set_trigger_source(&mut self, source: TriggerSource) -> Result<()> {
        self.ensure_connected().await?;
        self.command(Command::SetTriggerSource(source)).await?;
        self.trigger = source;
        log::debug!("dmm: trigger source set to {}", source);
        Ok(())
    }

    /// Ask the meter for its trigger source, falling back to the cached one.
    pub async fn query_trigger_source(&mut self) -> Result<TriggerSource> {
        self.ensure_connected().await?;
        match self
            .transport
            .query(Command::GetTriggerSource, self.config.read_timeout)
            .await
        {
            Ok(Some(line)) => match line.parse::<TriggerSource>() {
                Ok(source) => {
                    self.transport.record_success();
                    self.trigger = source;
                }
                Err(err) => log::warn!("dmm: {}", err),
            },
            Ok(None) => log::warn!("dmm: no answer to TRIG:SOUR?"),
            Err(ProtoError::NotConnected) => return Err(ProtoError::NotConnected),
            Err(err) => log::warn!("dmm: trigger source query failed: {}", err),
        }
        Ok(self.trigger)
    }

    /// Fire a BUS trigger. Only valid with [`TriggerSource::Bus`].
    pub async fn trigger_now(&mut self) -> Result<()> {
        if self.trigger != TriggerSource::Bus {
            return Err(ProtoError::TriggerModeMismatch(self.trigger));
        }
        self.ensure_connected().await?;
        self.pulse_trigger().await
    }

    /// Time a fetch may take at most, given the configuration.
    pub fn fetch_budget(&self) -> Duration {
        self.config.fetch_budget()
    }
}
