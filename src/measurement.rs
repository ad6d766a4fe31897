use std::{fmt, str::FromStr};

use chrono::{DateTime, Local, Utc};

/// Measurement functions of the 2831E front panel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Function {
    DcVoltage,
    DcCurrent,
    AcVoltage,
    AcCurrent,
    Resistance,
    Frequency,
    Period,
    Temperature,
}

/// Static description of a function: how the meter names it and what it supports.
#[derive(Debug)]
pub struct FunctionInfo {
    /// SCPI subsystem prefix, e.g. `VOLT:DC`.
    pub subsystem: &'static str,
    /// Token for `FUNC <token>`.
    pub token: &'static str,
    pub unit: &'static str,
    /// Concrete ranges. Empty if the function cannot be ranged.
    pub ranges: &'static [f64],
    pub nplc: bool,
    /// Valid window for the REL value, if REL is available.
    pub reference: Option<(f64, f64)>,
}

const DC_VOLTAGE: FunctionInfo = FunctionInfo {
    subsystem: "VOLT:DC",
    token: "volt:dc",
    unit: "V",
    ranges: &[0.2, 2.0, 20.0, 200.0, 1000.0],
    nplc: true,
    reference: Some((-19999.0, 19999.0)),
};

const DC_CURRENT: FunctionInfo = FunctionInfo {
    subsystem: "CURR:DC",
    token: "curr:dc",
    unit: "A",
    ranges: &[0.02, 0.2, 2.0, 10.0],
    nplc: true,
    reference: Some((-1999.0, 1999.0)),
};

const AC_VOLTAGE: FunctionInfo = FunctionInfo {
    subsystem: "VOLT:AC",
    token: "volt:ac",
    unit: "V",
    ranges: &[0.2, 2.0, 20.0, 200.0, 750.0],
    nplc: false,
    reference: None,
};

const AC_CURRENT: FunctionInfo = FunctionInfo {
    subsystem: "CURR:AC",
    token: "curr:ac",
    unit: "A",
    ranges: &[0.2, 2.0, 10.0],
    nplc: false,
    reference: None,
};

const RESISTANCE: FunctionInfo = FunctionInfo {
    subsystem: "RES",
    token: "res",
    unit: "Ω",
    ranges: &[200.0, 2e3, 20e3, 200e3, 2e6, 20e6],
    nplc: true,
    reference: Some((-19999.0, 19999.0)),
};

const FREQUENCY: FunctionInfo = FunctionInfo {
    subsystem: "FREQ",
    token: "freq",
    unit: "Hz",
    ranges: &[2e3, 2e4, 2e5, 2e6],
    nplc: false,
    reference: Some((0.0, f64::INFINITY)),
};

const PERIOD: FunctionInfo = FunctionInfo {
    subsystem: "PER",
    token: "per",
    unit: "s",
    ranges: &[],
    nplc: false,
    reference: Some((0.0, f64::INFINITY)),
};

const TEMPERATURE: FunctionInfo = FunctionInfo {
    subsystem: "TEMP",
    token: "temp",
    unit: "°C",
    ranges: &[],
    nplc: true,
    reference: None,
};

/// Integration times accepted by `<subsystem>:NPLC`.
pub const NPLC_CHOICES: [f64; 3] = [0.1, 1.0, 10.0];

impl Function {
    pub const ALL: [Function; 8] = [
        Function::DcVoltage,
        Function::DcCurrent,
        Function::AcVoltage,
        Function::AcCurrent,
        Function::Resistance,
        Function::Frequency,
        Function::Period,
        Function::Temperature,
    ];

    pub fn info(self) -> &'static FunctionInfo {
        match self {
            Function::DcVoltage => &DC_VOLTAGE,
            Function::DcCurrent => &DC_CURRENT,
            Function::AcVoltage => &AC_VOLTAGE,
            Function::AcCurrent => &AC_CURRENT,
            Function::Resistance => &RESISTANCE,
            Function::Frequency => &FREQUENCY,
            Function::Period => &PERIOD,
            Function::Temperature => &TEMPERATURE,
        }
    }

    pub fn supports_range(self) -> bool {
        !self.info().ranges.is_empty()
    }

    pub fn supports_nplc(self) -> bool {
        self.info().nplc
    }

    pub fn supports_reference(self) -> bool {
        self.info().reference.is_some()
    }
}

impl fmt::Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Function::DcVoltage => f.write_str("V DC"),
            Function::DcCurrent => f.write_str("A DC"),
            Function::AcVoltage => f.write_str("V AC"),
            Function::AcCurrent => f.write_str("A AC"),
            Function::Resistance => f.write_str("Ohms"),
            Function::Frequency => f.write_str("Frequency"),
            Function::Period => f.write_str("Period"),
            Function::Temperature => f.write_str("Temperature"),
        }
    }
}

impl FromStr for Function {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim().to_lowercase();
        let function = match name.as_str() {
            "dcv" | "vdc" | "volt:dc" => Function::DcVoltage,
            "dci" | "adc" | "curr:dc" => Function::DcCurrent,
            "acv" | "vac" | "volt:ac" => Function::AcVoltage,
            "aci" | "aac" | "curr:ac" => Function::AcCurrent,
            "res" | "ohm" | "ohms" => Function::Resistance,
            "freq" | "hz" => Function::Frequency,
            "per" | "period" => Function::Period,
            "temp" | "temperature" => Function::Temperature,
            _ => return Err(format!("Unknown function: {}", s)),
        };
        Ok(function)
    }
}

/// Range selection for [`crate::Device::set_range`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RangeSpec {
    Auto,
    Value(f64),
}

impl fmt::Display for RangeSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RangeSpec::Auto => f.write_str("AUTO"),
            RangeSpec::Value(v) => write!(f, "{}", v),
        }
    }
}

impl FromStr for RangeSpec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().eq_ignore_ascii_case("auto") {
            Ok(RangeSpec::Auto)
        } else {
            s.trim()
                .parse::<f64>()
                .map(RangeSpec::Value)
                .map_err(|_| format!("Invalid range: {}", s))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TriggerSource {
    #[default]
    Immediate,
    Bus,
    Manual,
}

impl TriggerSource {
    pub fn scpi(self) -> &'static str {
        match self {
            TriggerSource::Immediate => "IMM",
            TriggerSource::Bus => "BUS",
            TriggerSource::Manual => "MAN",
        }
    }
}

impl fmt::Display for TriggerSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.scpi())
    }
}

impl FromStr for TriggerSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim().to_uppercase();
        if name.starts_with("IMM") {
            Ok(TriggerSource::Immediate)
        } else if name.starts_with("BUS") {
            Ok(TriggerSource::Bus)
        } else if name.starts_with("MAN") || name.starts_with("EXT") {
            Ok(TriggerSource::Manual)
        } else {
            Err(format!("Unknown trigger source: {}", s))
        }
    }
}

/// REL state as last set through the driver.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Reference {
    pub enabled: bool,
    pub value: Option<f64>,
}

/// Cached per-function settings.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct FunctionState {
    pub range: Option<RangeSpec>,
    pub nplc: Option<f64>,
    pub reference: Reference,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Validity {
    /// The whole line was a number.
    Clean,
    /// The number was extracted from a noisy line.
    Recovered,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub value: f64,
    pub function: Function,
    pub validity: Validity,
    pub timestamp: DateTime<Utc>,
}

impl Reading {
    pub fn new(value: f64, function: Function, validity: Validity) -> Self {
        Self {
            value,
            function,
            validity,
            timestamp: Utc::now(),
        }
    }

    pub fn is_clean(&self) -> bool {
        self.validity == Validity::Clean
    }
}

impl fmt::Display for Reading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (scaled, multiplier) = engineering(self.value);
        write!(
            f,
            "{:.6} {}{}",
            scaled,
            unit_prefix(multiplier),
            self.function.info().unit
        )?;
        if self.validity == Validity::Recovered {
            f.write_str(" (recovered)")?;
        }
        Ok(())
    }
}

/// Split a value into mantissa and an exponent that is a multiple of three.
pub fn engineering(value: f64) -> (f64, i16) {
    if value == 0.0 || !value.is_finite() {
        return (value, 0);
    }
    let exp = (value.abs().log10() / 3.0).floor() as i16 * 3;
    let exp = exp.clamp(-12, 12);
    (value / 10f64.powi(exp as i32), exp)
}

pub fn unit_prefix(unit_multiplier: i16) -> &'static str {
    match unit_multiplier {
        -12 => "p",
        -9 => "n",
        -6 => "µ",
        -3 => "m",
        0 => "",
        3 => "k",
        6 => "M",
        9 => "G",
        12 => "T",
        _ => "?",
    }
}

pub fn pretty_ts(ts: &DateTime<Utc>) -> String {
    let local: DateTime<Local> = (*ts).into();
    local.format("%Y-%m-%d %H:%M:%S%.3f").to_string()
}
