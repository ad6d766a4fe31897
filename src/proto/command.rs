use std::fmt;

use crate::measurement::{Function, RangeSpec, TriggerSource};

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Id,
    Reset,
    // Measurement
    SelectFunction(Function),
    Fetch,
    // Configuration
    SetRange(Function, RangeSpec),
    SetNplc(Function, f64),
    // Reference
    SetReferenceState(Function, bool),
    SetReference(Function, f64),
    GetReference(Function),
    // Trigger
    SetTriggerSource(TriggerSource),
    GetTriggerSource,
    Init,
    Trigger,
}

impl Command {
    pub fn is_query(&self) -> bool {
        matches!(
            self,
            Command::Id | Command::Fetch | Command::GetReference(_) | Command::GetTriggerSource
        )
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Id => f.write_str("*IDN?"),
            Command::Reset => f.write_str("*RST"),
            Command::SelectFunction(func) => write!(f, "FUNC {}", func.info().token),
            Command::Fetch => f.write_str("FETCH?"),
            Command::SetRange(func, RangeSpec::Auto) => {
                write!(f, "{}:RANG:AUTO 1", func.info().subsystem)
            }
            Command::SetRange(func, RangeSpec::Value(v)) => {
                write!(f, "{}:RANG {}", func.info().subsystem, v)
            }
            Command::SetNplc(func, v) => write!(f, "{}:NPLC {}", func.info().subsystem, v),
            Command::SetReferenceState(func, on) => write!(
                f,
                "{}:REF:STAT {}",
                func.info().subsystem,
                if *on { "ON" } else { "OFF" }
            ),
            Command::SetReference(func, v) => write!(f, "{}:REF {}", func.info().subsystem, v),
            Command::GetReference(func) => write!(f, "{}:REF?", func.info().subsystem),
            Command::SetTriggerSource(src) => write!(f, "TRIG:SOUR {}", src.scpi()),
            Command::GetTriggerSource => f.write_str("TRIG:SOUR?"),
            Command::Init => f.write_str("INIT"),
            Command::Trigger => f.write_str("*TRG"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_text() {
        assert_eq!(
            Command::SelectFunction(Function::DcVoltage).to_string(),
            "FUNC volt:dc"
        );
        assert_eq!(
            Command::SetRange(Function::AcCurrent, RangeSpec::Auto).to_string(),
            "CURR:AC:RANG:AUTO 1"
        );
        assert_eq!(
            Command::SetRange(Function::Resistance, RangeSpec::Value(2e3)).to_string(),
            "RES:RANG 2000"
        );
        assert_eq!(
            Command::SetNplc(Function::DcCurrent, 0.1).to_string(),
            "CURR:DC:NPLC 0.1"
        );
        assert_eq!(
            Command::SetReferenceState(Function::Period, true).to_string(),
            "PER:REF:STAT ON"
        );
        assert_eq!(
            Command::SetReference(Function::DcVoltage, -1.5).to_string(),
            "VOLT:DC:REF -1.5"
        );
        assert_eq!(
            Command::SetTriggerSource(TriggerSource::Bus).to_string(),
            "TRIG:SOUR BUS"
        );
    }
}
