use bytes::BytesMut;
use std::{
    collections::VecDeque,
    fmt::{self, Write},
    io,
};
use tokio_util::codec::{Decoder, Encoder};

use super::response::{is_echo, Response};
use crate::proto::command::Command;

/// Lines longer than this without a terminator are line noise.
const MAX_LINE_LENGTH: usize = 256;

/// Commands whose echo is still recognized. The meter may echo a command
/// after the next one was already sent.
const ECHO_HISTORY: usize = 4;

/// Line framing for the 2831E.
///
/// Outgoing commands are terminated with `\n`. Incoming lines may end with
/// `\r`, `\n` or `\r\n`; bare terminators are skipped. Lines matching one
/// of the recently encoded commands are decoded as [`Response::Echo`].
#[derive(Default)]
pub struct LineCodec {
    last_cmds: VecDeque<String>,
}

impl LineCodec {
    fn classify(&self, line: String) -> Response {
        if self.last_cmds.iter().any(|cmd| is_echo(&line, cmd)) {
            Response::Echo(line)
        } else {
            Response::Line(line)
        }
    }
}

impl Decoder for LineCodec {
    type Item = Response;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let offset = src.iter().position(|b| *b == b'\n' || *b == b'\r');
            match offset {
                Some(n) => {
                    let raw = src.split_to(n + 1);
                    let line = String::from_utf8_lossy(&raw[..n]).to_string();
                    if line.trim().is_empty() {
                        continue;
                    }
                    return Ok(Some(self.classify(line)));
                }
                None => {
                    if src.len() > MAX_LINE_LENGTH {
                        log::warn!(
                            "codec: dropping {} bytes without line terminator",
                            src.len()
                        );
                        src.clear();
                    }
                    return Ok(None);
                }
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(response) => Ok(Some(response)),
            None => {
                let rest = src.split();
                let line = String::from_utf8_lossy(&rest).to_string();
                if line.trim().is_empty() {
                    Ok(None)
                } else {
                    Ok(Some(self.classify(line)))
                }
            }
        }
    }
}

fn write_fmt_guarded(dst: &mut BytesMut, args: fmt::Arguments<'_>) -> Result<(), io::Error> {
    dst.write_fmt(args)
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
}

impl Encoder<Command> for LineCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Command, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let text = item.to_string();
        write_fmt_guarded(dst, format_args!("{}\n", text))?;
        if self.last_cmds.len() == ECHO_HISTORY {
            self.last_cmds.pop_front();
        }
        self.last_cmds.push_back(text);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::measurement::{Function, RangeSpec};

    fn line(s: &str) -> Option<Response> {
        Some(Response::Line(s.to_string()))
    }

    #[test]
    fn test_decode_terminators() {
        let mut codec = LineCodec::default();
        let mut buf = BytesMut::from(&b"1.0\r\n2.0\n3.0\r"[..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), line("1.0"));
        assert_eq!(codec.decode(&mut buf).unwrap(), line("2.0"));
        assert_eq!(codec.decode(&mut buf).unwrap(), line("3.0"));
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn test_bare_terminators_are_skipped() {
        let mut codec = LineCodec::default();
        let mut buf = BytesMut::from(&b"\r\n\n\r  \r\n+5.0\n"[..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), line("+5.0"));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_partial_line_waits() {
        let mut codec = LineCodec::default();
        let mut buf = BytesMut::from(&b"+1.2"[..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        buf.extend_from_slice(b"5\r\n");
        assert_eq!(codec.decode(&mut buf).unwrap(), line("+1.25"));
    }

    #[test]
    fn test_oversized_garbage_dropped() {
        let mut codec = LineCodec::default();
        let mut buf = BytesMut::from(&vec![b'x'; MAX_LINE_LENGTH + 1][..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_echo_of_last_command() {
        let mut codec = LineCodec::default();
        let mut out = BytesMut::new();
        codec.encode(Command::Fetch, &mut out).unwrap();
        assert_eq!(&out[..], b"FETCH?\n");

        let mut buf = BytesMut::from(&b"fetch?\r\nFETC\r\n+1.0\r\n"[..]);
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(Response::Echo("fetch?".to_string()))
        );
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(Response::Echo("FETC".to_string()))
        );
        assert_eq!(codec.decode(&mut buf).unwrap(), line("+1.0"));
    }

    #[test]
    fn test_late_echo_of_earlier_command() {
        let mut codec = LineCodec::default();
        let mut out = BytesMut::new();
        codec
            .encode(
                Command::SetRange(Function::DcVoltage, RangeSpec::Value(20.0)),
                &mut out,
            )
            .unwrap();
        codec.encode(Command::Fetch, &mut out).unwrap();

        let mut buf = BytesMut::from(&b"VOLT:DC:RANG 20\r\n+5.0\r\n"[..]);
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(Response::Echo("VOLT:DC:RANG 20".to_string()))
        );
        assert_eq!(codec.decode(&mut buf).unwrap(), line("+5.0"));
    }

    #[test]
    fn test_echo_history_is_bounded() {
        let mut codec = LineCodec::default();
        let mut out = BytesMut::new();
        codec
            .encode(Command::SetNplc(Function::DcVoltage, 10.0), &mut out)
            .unwrap();
        for _ in 0..ECHO_HISTORY {
            codec.encode(Command::Fetch, &mut out).unwrap();
        }

        let mut buf = BytesMut::from(&b"VOLT:DC:NPLC 10\r\n"[..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), line("VOLT:DC:NPLC 10"));
    }

    #[test]
    fn test_decode_eof_flushes_rest() {
        let mut codec = LineCodec::default();
        let mut buf = BytesMut::from(&b"-2.5"[..]);
        assert_eq!(codec.decode_eof(&mut buf).unwrap(), line("-2.5"));
        assert_eq!(codec.decode_eof(&mut buf).unwrap(), None);
    }
}
