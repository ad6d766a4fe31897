#![deny(clippy::unwrap_used)]

use clap::{arg, command, value_parser};
use log::LevelFilter;
use std::io::ErrorKind;
use std::process::exit;
use std::str::FromStr;
use std::time::Duration;

use bk2831ctrl::measurement::pretty_ts;
use bk2831ctrl::{
    Device, Function, PortSelector, ProtoError, RangeSpec, Result, TriggerSource,
    DEFAULT_BAUDRATE, DEFAULT_TTY,
};

/// Argument of the `ref` subcommand.
#[derive(Debug, Clone, Copy, PartialEq)]
enum RefAction {
    Enable(bool),
    Acquire,
    Set(f64),
}

impl FromStr for RefAction {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "on" => Ok(RefAction::Enable(true)),
            "off" => Ok(RefAction::Enable(false)),
            "acquire" => Ok(RefAction::Acquire),
            value => value
                .parse::<f64>()
                .ok()
                .filter(|v| v.is_finite())
                .map(RefAction::Set)
                .ok_or_else(|| format!("Invalid value: {}", s)),
        }
    }
}

#[tokio::main]
async fn main() {
    let matches = command!() // requires `cargo` feature
        .arg(
            arg!(-p --device <PORT>)
            .help(format!(
                "Port of the meter, e.g. {}, or auto to probe all ports",
                DEFAULT_TTY
            ))
            .default_value("auto")
            .required(false)
            .value_parser(value_parser!(PortSelector)),
        )
        .arg(arg!(
            -d --debug ... "Turn debugging information on"
        ))
        .arg(
            arg!(
                -b --baudrate <BAUDRATE> "Baudrate"
            )
            .default_value(DEFAULT_BAUDRATE.to_string())
            .value_parser(value_parser!(u32)),
        )
        .subcommand(clap::Command::new("ports").about("List serial ports in probing order"))
        .subcommand(clap::Command::new("ident").about("Device identification"))
        .subcommand(
            clap::Command::new("read")
                .about("Take readings")
                .arg(
                    arg!(<function> "dcv, dci, acv, aci, res, freq, per or temp")
                        .value_parser(value_parser!(Function)),
                )
                .arg(
                    arg!(--range <RANGE> "Range value or auto")
                        .value_parser(value_parser!(RangeSpec)),
                )
                .arg(
                    arg!(--nplc <NPLC> "Integration time in power line cycles: 0.1, 1 or 10")
                        .value_parser(value_parser!(f64)),
                )
                .arg(
                    arg!(--count <N> "Number of readings, 0 reads until interrupted")
                        .default_value("1")
                        .value_parser(value_parser!(u32)),
                )
                .arg(
                    arg!(--interval <MS> "Pause between readings in milliseconds")
                        .default_value("1000")
                        .value_parser(value_parser!(u64)),
                ),
        )
        .subcommand(
            clap::Command::new("trigger-source")
                .about("Trigger source")
                .arg(
                    arg!([source] "Set trigger source")
                        .value_parser(value_parser!(TriggerSource)),
                ),
        )
        .subcommand(clap::Command::new("trigger").about("Send a BUS trigger"))
        .subcommand(
            clap::Command::new("ref")
                .about("Reference (REL) value")
                .arg(
                    arg!(<function> "dcv, dci, res, freq or per")
                        .value_parser(value_parser!(Function)),
                )
                .arg(
                    arg!([action] "on, off, acquire or a reference value")
                        .allow_negative_numbers(true)
                        .value_parser(value_parser!(RefAction)),
                ),
        )
        .subcommand_required(true)
        .get_matches();

    init_logging(matches.get_count("debug"));

    if let Err(e) = handle_args(&matches).await {
        let port = matches
            .get_one::<PortSelector>("device")
            .cloned()
            .unwrap_or(PortSelector::Auto);
        match e {
            ProtoError::Serial(err) => {
                if err.kind() == tokio_serial::ErrorKind::NoDevice
                    || matches!(err.kind(), tokio_serial::ErrorKind::Io(ErrorKind::NotFound))
                {
                    eprintln!("{}: File not found", port);
                } else {
                    eprintln!("I/O Error: {} [device: {}]", err, port);
                }
            }
            ProtoError::Io(err) => {
                if err.kind() == ErrorKind::NotFound {
                    eprintln!("{}: File not found", port);
                } else {
                    eprintln!("I/O Error: {} [device: {}]", err, port);
                }
            }
            ProtoError::NoDeviceFound => {
                eprintln!("No 2831E answered on {}. Check cable and baudrate.", port);
            }
            ProtoError::PortBusy { port, reason } => {
                eprintln!("{}: port cannot be opened ({})", port, reason);
            }
            ProtoError::UnreadableResponse | ProtoError::NotResponding => {
                eprintln!("Device does not answer reliably, aborting!");
            }
            e if e.is_configuration() => {
                eprintln!("Invalid request: {}", e);
            }
            e => {
                eprintln!("Failed to communicate with device: {}", e);
            }
        }
        exit(-1);
    }
}

fn init_logging(level: u8) {
    let filter = match level {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    env_logger::Builder::from_default_env()
        .format_timestamp_millis()
        .filter_level(filter)
        .parse_default_env()
        .init();
}

async fn handle_args(matches: &clap::ArgMatches) -> Result<()> {
    let baud_rate = matches
        .get_one::<u32>("baudrate")
        .copied()
        .unwrap_or(DEFAULT_BAUDRATE);
    let selector = matches
        .get_one::<PortSelector>("device")
        .cloned()
        .unwrap_or(PortSelector::Auto);

    let mut device = Device::new();

    if let Some(("ports", _args)) = matches.subcommand() {
        for port in device.available_ports()? {
            println!("{}", port);
        }
        return Ok(());
    }

    let ident = device.connect(selector, baud_rate).await?;
    eprintln!(
        "Connected to: {} on {}\n",
        ident.model,
        device.port().unwrap_or_default()
    );

    // The port is released on drop without *RST, so settings made here stay
    // active on the meter.
    match matches.subcommand() {
        // Device ID
        Some(("ident", _args)) => {
            println!("Model: {}", ident.model);
            println!(
                "Firmware: {}",
                ident.fields.get(1).map(String::as_str).unwrap_or("?")
            );
            println!(
                "Serial: {}",
                ident.fields.get(2).map(String::as_str).unwrap_or("?")
            );
        }
        // Readings
        Some(("read", args)) => {
            let function = *args
                .get_one::<Function>("function")
                .expect("Requires function parameter");
            if let Some(range) = args.get_one::<RangeSpec>("range") {
                device.set_range(function, *range).await?;
            }
            if let Some(nplc) = args.get_one::<f64>("nplc") {
                device.set_nplc(function, *nplc).await?;
            }
            let count = args.get_one::<u32>("count").copied().unwrap_or(1);
            let interval =
                Duration::from_millis(args.get_one::<u64>("interval").copied().unwrap_or(1000));

            let mut taken = 0;
            while count == 0 || taken < count {
                if taken > 0 {
                    tokio::time::sleep(interval).await;
                }
                while device.is_cooling_off() {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
                taken += 1;
                match device.read(function).await {
                    Ok(reading) => println!("{} {}", pretty_ts(&reading.timestamp), reading),
                    // Keep polling through a wedged link.
                    Err(ProtoError::UnreadableResponse) if count != 1 => {
                        eprintln!("No reading, retrying");
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        // Trigger source
        Some(("trigger-source", args)) => {
            if let Some(source) = args.get_one::<TriggerSource>("source") {
                device.set_trigger_source(*source).await?;
                println!("OK");
            } else {
                let source = device.query_trigger_source().await?;
                println!("Trigger source: {}", source);
            }
        }
        // BUS trigger
        Some(("trigger", _args)) => {
            device.query_trigger_source().await?;
            device.trigger_now().await?;
            println!("OK");
        }
        // Reference
        Some(("ref", args)) => {
            let function = *args
                .get_one::<Function>("function")
                .expect("Requires function parameter");
            match args.get_one::<RefAction>("action") {
                Some(RefAction::Enable(enabled)) => {
                    device.enable_reference(function, *enabled).await?;
                    println!("OK");
                }
                Some(RefAction::Acquire) => {
                    let reading = device.acquire_reference(function).await?;
                    println!("Reference: {}", reading);
                }
                Some(RefAction::Set(value)) => {
                    device.set_reference(function, *value).await?;
                    println!("OK");
                }
                None => {
                    let value = device.query_reference(function).await?;
                    println!("Reference: {} {}", value, function.info().unit);
                }
            }
        }
        _ => {
            eprintln!("Unknown command");
            exit(-1);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ref_action() {
        assert_eq!("ON".parse(), Ok(RefAction::Enable(true)));
        assert_eq!("off".parse(), Ok(RefAction::Enable(false)));
        assert_eq!("acquire".parse(), Ok(RefAction::Acquire));
        assert_eq!("-1.25".parse(), Ok(RefAction::Set(-1.25)));
        assert!("abc".parse::<RefAction>().is_err());
        assert!("inf".parse::<RefAction>().is_err());
    }

    #[test]
    fn test_invalid_ref_action_is_rejected_by_cli() {
        let cmd = clap::Command::new("bk2831ctrl").subcommand(
            clap::Command::new("ref")
                .arg(arg!(<function>).value_parser(value_parser!(Function)))
                .arg(arg!([action]).value_parser(value_parser!(RefAction))),
        );
        let err = cmd
            .try_get_matches_from(["bk2831ctrl", "ref", "dcv", "twelve"])
            .expect_err("twelve is not a reference value");
        assert_eq!(err.kind(), clap::error::ErrorKind::ValueValidation);
        assert_ne!(err.exit_code(), 0);
    }
}
