//! Decoding of the kernel's fixed-width `input_event` records.
//!
//! A non-blocking read on an evdev node returns whole records only, so a
//! buffer that is not exactly [`RECORD_SIZE`] bytes long is a framing bug in
//! the caller and trips an assertion instead of producing an error.
use std::{collections::HashMap, fmt, mem, ptr, sync::OnceLock};

use nix::libc::{suseconds_t, time_t};
use serde::Serialize;

/// Native layout of `struct input_event` on the targets we build for.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RawRecord {
    pub seconds: time_t,
    pub microseconds: suseconds_t,
    pub type_code: u16,
    pub code: u16,
    pub value: i32,
}

pub const RECORD_SIZE: usize = mem::size_of::<RawRecord>();

const KINDS: [(u16, &str); 14] = [
    (0x00, "SYN"),
    (0x01, "KEY"),
    (0x02, "REL"),
    (0x03, "ABS"),
    (0x04, "MSC"),
    (0x05, "SW"),
    (0x11, "LED"),
    (0x12, "SND"),
    (0x14, "REP"),
    (0x15, "FF"),
    (0x16, "PWR"),
    (0x17, "FF_STATUS"),
    (0x1f, "MAX"),
    (0x20, "CNT"),
];

fn kind_table() -> &'static HashMap<u16, &'static str> {
    static TABLE: OnceLock<HashMap<u16, &'static str>> = OnceLock::new();
    TABLE.get_or_init(|| KINDS.into_iter().collect())
}

/// Looks up the well-known name of an event type code.
pub fn kind_name(type_code: u16) -> Option<&'static str> {
    kind_table().get(&type_code).copied()
}

/// A decoded input record.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Event {
    /// `None` when the type code has no well-known name.
    pub kind: Option<&'static str>,
    pub type_code: u16,
    pub code: u16,
    pub value: i32,
    /// Seconds, with the microsecond part folded in as a fraction.
    pub timestamp: f64,
}

impl From<RawRecord> for Event {
    fn from(raw: RawRecord) -> Self {
        let mut timestamp = raw.microseconds as f64;
        timestamp /= 1.0e6;
        timestamp += raw.seconds as f64;

        Self {
            kind: kind_name(raw.type_code),
            type_code: raw.type_code,
            code: raw.code,
            value: raw.value,
            timestamp,
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.6} ", self.timestamp)?;
        match self.kind {
            Some(kind) => f.write_str(kind)?,
            None => write!(f, "type#{:#04x}", self.type_code)?,
        }
        write!(f, " code={} value={}", self.code, self.value)
    }
}

/// Decodes one record.
///
/// # Panics
///
/// If `buf` is not exactly [`RECORD_SIZE`] bytes.
pub fn decode(buf: &[u8]) -> Event {
    assert_eq!(
        buf.len(),
        RECORD_SIZE,
        "input record framing violated: got {} bytes",
        buf.len()
    );
    // SAFETY: the length is checked above and every bit pattern is a valid
    // RawRecord, which is plain integers without padding.
    let raw = unsafe { ptr::read_unaligned(buf.as_ptr() as *const RawRecord) };
    Event::from(raw)
}

/// Produces the native bytes the kernel would hand us for `raw`.
pub fn encode(raw: &RawRecord) -> [u8; RECORD_SIZE] {
    let mut buf = [0u8; RECORD_SIZE];
    // SAFETY: buf is exactly RECORD_SIZE bytes.
    unsafe { ptr::write_unaligned(buf.as_mut_ptr() as *mut RawRecord, *raw) };
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn decodes_key_press() {
        let raw = RawRecord {
            seconds: 1000,
            microseconds: 500_000,
            type_code: 1,
            code: 30,
            value: 1,
        };
        let ev = decode(&encode(&raw));

        assert_eq!(ev.kind, Some("KEY"));
        assert_eq!(ev.code, 30);
        assert_eq!(ev.value, 1);
        assert_eq!(ev.timestamp, 1000.5);
    }

    #[test]
    fn unknown_type_has_no_kind() {
        let raw = RawRecord {
            type_code: 0x13,
            value: -7,
            ..Default::default()
        };
        let ev = decode(&encode(&raw));

        assert_eq!(ev.kind, None);
        assert_eq!(ev.type_code, 0x13);
        assert_eq!(ev.value, -7);
        assert_eq!(ev.to_string(), "0.000000 type#0x13 code=0 value=-7");
    }

    #[test]
    fn kind_table_covers_sparse_codes() {
        assert_eq!(kind_name(0x00), Some("SYN"));
        assert_eq!(kind_name(0x17), Some("FF_STATUS"));
        assert_eq!(kind_name(0x1f), Some("MAX"));
        assert_eq!(kind_name(0x20), Some("CNT"));
        assert_eq!(kind_name(0x06), None);
    }

    #[test]
    #[should_panic(expected = "framing violated")]
    fn short_buffer_is_a_framing_bug() {
        decode(&[0u8; RECORD_SIZE - 1]);
    }

    proptest! {
        #[test]
        fn timestamp_folds_microseconds(sec in 0i64..4_000_000_000, usec in 0i64..1_000_000) {
            let raw = RawRecord {
                seconds: sec as time_t,
                microseconds: usec as suseconds_t,
                ..Default::default()
            };
            let ev = decode(&encode(&raw));
            let expected = sec as f64 + usec as f64 / 1.0e6;
            prop_assert!((ev.timestamp - expected).abs() < 1.0e-6);
            prop_assert!(ev.timestamp.floor() as i64 == sec);
        }
    }
}
