//! # Wire grammar of the nozzle controller.
//!
//! Records are newline-terminated ASCII of the form `verb(arg1,arg2,...)`,
//! whitespace-free, in both directions. Inbound verbs partition into seven
//! families; three of them (`rfid_match`, `rfid_alarm`, `nhb`) are always
//! unsolicited, the rest answer an outstanding request of the same family.
//!
//! ## Inbound grammars
//! ```text
//! rfid_get(<nozzle:4 digits>,<tag: '-' | 24 hex>,<battery:digits>)
//! meter_read(<liters: unsigned decimal>)
//! rfid_match(<nozzle>,<seq:digits>)
//! rfid_alarm(<nozzle>)
//! nhb(<nozzle>,<flag:digits>)
//! heartbeat(<status:digit>)        heartbeat(0) means healthy
//! hls_read(<value: decimal>,<denominator:digits>)
//! ```
//!
//! Malformed lines and unknown verbs are reported to the caller, which logs
//! and drops them; they are never fatal.

use rust_decimal::Decimal;
use thiserror::Error;

/// Verb family of an inbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
    Heartbeat,
    Nhb,
    RfidGet,
    RfidMatch,
    RfidAlarm,
    MeterRead,
    HlsRead,
}

impl Family {
    /// Stable lowercase name for logs and errors.
    pub fn as_str(&self) -> &'static str {
        match self {
            Family::Heartbeat => "heartbeat",
            Family::Nhb => "nhb",
            Family::RfidGet => "rfid_get",
            Family::RfidMatch => "rfid_match",
            Family::RfidAlarm => "rfid_alarm",
            Family::MeterRead => "meter_read",
            Family::HlsRead => "hls_read",
        }
    }

    fn from_verb(verb: &str) -> Option<Self> {
        match verb {
            "heartbeat" => Some(Family::Heartbeat),
            "nhb" => Some(Family::Nhb),
            "rfid_get" => Some(Family::RfidGet),
            "rfid_match" => Some(Family::RfidMatch),
            "rfid_alarm" => Some(Family::RfidAlarm),
            "meter_read" => Some(Family::MeterRead),
            "hls_read" => Some(Family::HlsRead),
            _ => None,
        }
    }

    /// True for verbs the nozzle emits spontaneously; these never resolve a
    /// pending request.
    pub fn always_unsolicited(&self) -> bool {
        matches!(self, Family::RfidMatch | Family::RfidAlarm | Family::Nhb)
    }
}

/// Why an inbound line was rejected.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum FrameError {
    /// Line did not match `verb(args)`.
    #[error("malformed frame: {0:?}")]
    Malformed(String),
    /// Syntactically valid, but the verb is not part of the protocol.
    #[error("unknown verb: {0:?}")]
    UnknownVerb(String),
}

/// A parsed inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Verb family.
    pub family: Family,
    /// Raw arguments, split on commas. Casing preserved as received.
    pub args: Vec<String>,
    /// The original line, for logging.
    pub raw: String,
}

/// The literal "no tag in field" marker.
pub const NO_TAG: &str = "-";

/// True iff `s` is a 24-character hex tag identifier.
pub fn is_valid_tag(s: &str) -> bool {
    s.len() == 24 && s.bytes().all(|b| b.is_ascii_hexdigit())
}

impl Frame {
    /// Parses one newline-stripped line.
    pub fn parse(line: &str) -> Result<Self, FrameError> {
        let open = line
            .find('(')
            .ok_or_else(|| FrameError::Malformed(line.to_string()))?;
        if !line.ends_with(')') || open == 0 {
            return Err(FrameError::Malformed(line.to_string()));
        }
        let verb = &line[..open];
        let body = &line[open + 1..line.len() - 1];
        if verb.chars().any(|c| !c.is_ascii_alphanumeric() && c != '_') {
            return Err(FrameError::Malformed(line.to_string()));
        }
        let family =
            Family::from_verb(verb).ok_or_else(|| FrameError::UnknownVerb(verb.to_string()))?;
        let args = if body.is_empty() {
            Vec::new()
        } else {
            body.split(',').map(str::to_string).collect()
        };
        Ok(Frame {
            family,
            args,
            raw: line.to_string(),
        })
    }

    /// `heartbeat(<status>)`: the status digit.
    pub fn heartbeat_status(&self) -> Option<u8> {
        if self.family != Family::Heartbeat {
            return None;
        }
        self.args.first()?.parse().ok()
    }

    /// `rfid_get(<nozzle>,<tag>,<battery>)`: `None` tag means "no tag in
    /// field". Tags that are neither `-` nor 24 hex are rejected.
    pub fn rfid_get_payload(&self) -> Option<RfidReading> {
        if self.family != Family::RfidGet || self.args.len() < 3 {
            return None;
        }
        let nozzle = self.args[0].clone();
        let tag = match self.args[1].as_str() {
            NO_TAG => None,
            t if is_valid_tag(t) => Some(t.to_string()),
            _ => return None,
        };
        Some(RfidReading {
            nozzle,
            tag,
            battery: self.args[2].clone(),
        })
    }

    /// `meter_read(<liters>)`: the reading. Negative values are rejected.
    pub fn meter_liters(&self) -> Option<Decimal> {
        if self.family != Family::MeterRead {
            return None;
        }
        let v: Decimal = self.args.first()?.parse().ok()?;
        if v.is_sign_negative() {
            return None;
        }
        Some(v)
    }

    /// `rfid_match(<nozzle>,<seq>)`: the nozzle id.
    pub fn rfid_match_nozzle(&self) -> Option<&str> {
        if self.family != Family::RfidMatch {
            return None;
        }
        self.args.first().map(String::as_str)
    }

    /// `rfid_alarm(<nozzle>)`: the nozzle id.
    pub fn rfid_alarm_nozzle(&self) -> Option<&str> {
        if self.family != Family::RfidAlarm {
            return None;
        }
        self.args.first().map(String::as_str)
    }

    /// `nhb(<nozzle>,<flag>)`: the nozzle id.
    pub fn nhb_nozzle(&self) -> Option<&str> {
        if self.family != Family::Nhb {
            return None;
        }
        self.args.first().map(String::as_str)
    }

    /// `hls_read(<value>,<denominator>)`: level reading and service scale.
    pub fn hls_payload(&self) -> Option<(Decimal, u32)> {
        if self.family != Family::HlsRead || self.args.len() < 2 {
            return None;
        }
        Some((self.args[0].parse().ok()?, self.args[1].parse().ok()?))
    }

    /// True if this frame originates from the nozzle with the given id.
    /// Refreshes the nozzle-heartbeat watch.
    pub fn from_nozzle(&self, nozzle_id: &str) -> bool {
        match self.family {
            Family::Nhb | Family::RfidMatch | Family::RfidAlarm | Family::RfidGet => {
                self.args.first().map(String::as_str) == Some(nozzle_id)
            }
            _ => false,
        }
    }
}

/// Payload of an `rfid_get` reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RfidReading {
    pub nozzle: String,
    /// `None` means the reader saw no tag.
    pub tag: Option<String>,
    pub battery: String,
}

/// Outbound commands to the nozzle controller.
///
/// `response_family()` distinguishes expect-response commands from
/// fire-and-forget ones; the port enforces single-writer per family.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Bind this board to the nozzle. Sent once on first entry into Idle.
    PairNozzle { nozzle: String },
    /// Board health probe; expects `heartbeat(<status>)`.
    Heartbeat,
    /// One-shot tag read; expects `rfid_get(...)`.
    RfidGet { nozzle: String },
    /// Continuous matching against a specific tag. Fire-and-forget.
    RfidGetCont { nozzle: String, tag: String },
    /// Stop a one-shot read and extinguish the reader LED.
    RfidGetStop { nozzle: String },
    /// Stop continuous matching.
    RfidStop { nozzle: String },
    /// Open (1) or close (0) the solenoid valve.
    SetSolenoid { open: bool },
    /// Zero the flow meter.
    MeterReset,
    /// Read the flow meter; expects `meter_read(<liters>)`.
    MeterRead,
    /// Read the liquid-level sensor on a socket; expects `hls_read(...)`.
    HlsRead { denominator: u32, socket: u8 },
    /// Control-board acknowledgement of an `nhb` beacon.
    Cbhb { nozzle: String },
    /// Diagnostic passthrough, written verbatim.
    Raw(String),
}

impl Command {
    /// Renders the outbound record (without the terminating newline).
    pub fn encode(&self) -> String {
        match self {
            Command::PairNozzle { nozzle } => format!("pair_nozzle({nozzle})"),
            Command::Heartbeat => "heartbeat()".to_string(),
            Command::RfidGet { nozzle } => format!("rfid_get({nozzle})"),
            Command::RfidGetCont { nozzle, tag } => format!("rfid_get_cont({nozzle},{tag})"),
            Command::RfidGetStop { nozzle } => format!("rfid_get_stop({nozzle})"),
            Command::RfidStop { nozzle } => format!("rfid_stop({nozzle})"),
            Command::SetSolenoid { open } => format!("set_solenoid({})", u8::from(*open)),
            Command::MeterReset => "meter_reset()".to_string(),
            Command::MeterRead => "meter_read()".to_string(),
            Command::HlsRead {
                denominator,
                socket,
            } => format!("hls_read({denominator},{socket})"),
            Command::Cbhb { nozzle } => format!("cbhb({nozzle})"),
            Command::Raw(line) => line.clone(),
        }
    }

    /// The family of the expected reply, or `None` for fire-and-forget.
    pub fn response_family(&self) -> Option<Family> {
        match self {
            Command::Heartbeat => Some(Family::Heartbeat),
            Command::RfidGet { .. } => Some(Family::RfidGet),
            Command::MeterRead => Some(Family::MeterRead),
            Command::HlsRead { .. } => Some(Family::HlsRead),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_rfid_get_with_tag() {
        let f = Frame::parse("rfid_get(0076,E200001D8914005717701BFC,2013)").unwrap();
        assert_eq!(f.family, Family::RfidGet);
        let p = f.rfid_get_payload().unwrap();
        assert_eq!(p.nozzle, "0076");
        assert_eq!(p.tag.as_deref(), Some("E200001D8914005717701BFC"));
        assert_eq!(p.battery, "2013");
    }

    #[test]
    fn empty_tag_marker_maps_to_none() {
        let f = Frame::parse("rfid_get(0076,-,2013)").unwrap();
        assert_eq!(f.rfid_get_payload().unwrap().tag, None);
    }

    #[test]
    fn bad_tag_is_rejected() {
        let f = Frame::parse("rfid_get(0076,NOTHEX,2013)").unwrap();
        assert_eq!(f.rfid_get_payload(), None);
    }

    #[test]
    fn parses_meter_read() {
        let f = Frame::parse("meter_read(12.3)").unwrap();
        assert_eq!(f.meter_liters(), Some("12.3".parse().unwrap()));
    }

    #[test]
    fn negative_meter_is_rejected() {
        let f = Frame::parse("meter_read(-1.0)").unwrap();
        assert_eq!(f.meter_liters(), None);
    }

    #[test]
    fn heartbeat_zero_is_healthy() {
        let f = Frame::parse("heartbeat(0)").unwrap();
        assert_eq!(f.heartbeat_status(), Some(0));
    }

    #[test]
    fn unknown_verb_is_flagged() {
        assert_eq!(
            Frame::parse("frobnicate(1)"),
            Err(FrameError::UnknownVerb("frobnicate".to_string()))
        );
    }

    #[test]
    fn malformed_lines_are_flagged() {
        assert!(matches!(Frame::parse("meter_read"), Err(FrameError::Malformed(_))));
        assert!(matches!(Frame::parse("meter_read(1.0"), Err(FrameError::Malformed(_))));
        assert!(matches!(Frame::parse("(1.0)"), Err(FrameError::Malformed(_))));
    }

    #[test]
    fn nozzle_origin_covers_the_four_families() {
        for line in [
            "nhb(0076,1)",
            "rfid_match(0076,1)",
            "rfid_alarm(0076)",
            "rfid_get(0076,-,2013)",
        ] {
            assert!(Frame::parse(line).unwrap().from_nozzle("0076"), "{line}");
            assert!(!Frame::parse(line).unwrap().from_nozzle("0031"), "{line}");
        }
        assert!(!Frame::parse("heartbeat(0)").unwrap().from_nozzle("0076"));
    }

    #[test]
    fn commands_encode_the_documented_shapes() {
        assert_eq!(
            Command::PairNozzle { nozzle: "0076".into() }.encode(),
            "pair_nozzle(0076)"
        );
        assert_eq!(Command::SetSolenoid { open: true }.encode(), "set_solenoid(1)");
        assert_eq!(Command::SetSolenoid { open: false }.encode(), "set_solenoid(0)");
        assert_eq!(
            Command::HlsRead { denominator: 500, socket: 3 }.encode(),
            "hls_read(500,3)"
        );
        assert_eq!(Command::MeterRead.encode(), "meter_read()");
    }

    #[test]
    fn response_families_partition_the_command_set() {
        assert_eq!(Command::Heartbeat.response_family(), Some(Family::Heartbeat));
        assert_eq!(Command::MeterRead.response_family(), Some(Family::MeterRead));
        assert_eq!(
            Command::RfidGet { nozzle: "0076".into() }.response_family(),
            Some(Family::RfidGet)
        );
        assert_eq!(Command::MeterReset.response_family(), None);
        assert_eq!(
            Command::RfidStop { nozzle: "0076".into() }.response_family(),
            None
        );
    }
}
