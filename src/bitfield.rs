//! BITFIELD programs.
//!
//! A program is an ordered list of [`BitfieldCommand`]s. [`compile`] folds it
//! left to right, threading the active overflow policy into each GET, SET and
//! INCRBY step, so the store never sees OVERFLOW directives and each compiled
//! step yields exactly one result entry.

use serde::{Deserialize, Serialize};

use crate::error::{KvError, Result};

/// Strings are capped at 512MB, so no bit beyond 2^32 is addressable.
const MAX_BITS: u64 = 1 << 32;

/// Integer encoding of a bitfield: `i1`..`i64` or `u1`..`u63`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Encoding {
    Signed(u8),
    Unsigned(u8),
}

impl Encoding {
    pub fn parse(s: &str) -> Result<Self> {
        let invalid = || {
            KvError::InvalidArgument(format!(
                "invalid bitfield type '{}': use something like i16 u8, note that u64 is not supported but i64 is",
                s
            ))
        };
        let mut chars = s.chars();
        let sign = chars.next().ok_or_else(invalid)?;
        let bits: u8 = chars.as_str().parse().map_err(|_| invalid())?;
        match sign {
            'i' | 'I' if (1..=64).contains(&bits) => Ok(Encoding::Signed(bits)),
            'u' | 'U' if (1..=63).contains(&bits) => Ok(Encoding::Unsigned(bits)),
            _ => Err(invalid()),
        }
    }

    pub fn bits(&self) -> u32 {
        match self {
            Encoding::Signed(b) | Encoding::Unsigned(b) => *b as u32,
        }
    }

    fn min(&self) -> i128 {
        match self {
            Encoding::Signed(b) => -(1i128 << (*b - 1)),
            Encoding::Unsigned(_) => 0,
        }
    }

    fn max(&self) -> i128 {
        match self {
            Encoding::Signed(b) => (1i128 << (*b - 1)) - 1,
            Encoding::Unsigned(b) => (1i128 << *b) - 1,
        }
    }

    /// Interpret the low `bits()` bits of `raw` under this encoding.
    fn decode(&self, raw: u64) -> i64 {
        match self {
            Encoding::Signed(64) => raw as i64,
            Encoding::Signed(b) => {
                let b = *b as u32;
                if raw & (1u64 << (b - 1)) != 0 {
                    (raw as i64) - (1i64 << b)
                } else {
                    raw as i64
                }
            }
            Encoding::Unsigned(_) => raw as i64,
        }
    }

    fn encode(&self, value: i64) -> u64 {
        match self.bits() {
            64 => value as u64,
            b => (value as u64) & ((1u64 << b) - 1),
        }
    }
}

/// Bit position of a field: absolute (`100`) or in multiples of the field width (`#2`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BitOffset {
    Bits(u64),
    Fields(u64),
}

impl BitOffset {
    pub fn parse(s: &str) -> Result<Self> {
        let invalid =
            || KvError::InvalidArgument(format!("bit offset is not an integer or out of range: '{}'", s));
        match s.strip_prefix('#') {
            Some(n) => n.parse().map(BitOffset::Fields).map_err(|_| invalid()),
            None => s.parse().map(BitOffset::Bits).map_err(|_| invalid()),
        }
    }

    fn resolve(&self, encoding: Encoding) -> Result<u64> {
        let offset = match self {
            BitOffset::Bits(n) => Some(*n),
            BitOffset::Fields(n) => n.checked_mul(encoding.bits() as u64),
        };
        match offset {
            Some(o) if addressable(o, encoding) => Ok(o),
            _ => Err(KvError::InvalidArgument(
                "bit offset is not an integer or out of range".to_string(),
            )),
        }
    }
}

impl From<u64> for BitOffset {
    fn from(n: u64) -> Self {
        BitOffset::Bits(n)
    }
}

/// Behavior of SET and INCRBY at the encoding's numeric boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Overflow {
    #[default]
    Wrap,
    Sat,
    Fail,
}

impl Overflow {
    pub fn parse(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "wrap" => Ok(Overflow::Wrap),
            "sat" | "saturate" => Ok(Overflow::Sat),
            "fail" => Ok(Overflow::Fail),
            other => Err(KvError::InvalidArgument(format!(
                "invalid OVERFLOW type '{}'",
                other
            ))),
        }
    }
}

/// One directive of a bitfield program.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitfieldCommand {
    Get {
        encoding: Encoding,
        offset: BitOffset,
    },
    Set {
        encoding: Encoding,
        offset: BitOffset,
        value: i64,
    },
    IncrBy {
        encoding: Encoding,
        offset: BitOffset,
        increment: i64,
    },
    Overflow(Overflow),
}

impl BitfieldCommand {
    pub fn get(encoding: &str, offset: impl Into<BitOffset>) -> Result<Self> {
        Ok(BitfieldCommand::Get {
            encoding: Encoding::parse(encoding)?,
            offset: offset.into(),
        })
    }

    pub fn set(encoding: &str, offset: impl Into<BitOffset>, value: i64) -> Result<Self> {
        Ok(BitfieldCommand::Set {
            encoding: Encoding::parse(encoding)?,
            offset: offset.into(),
            value,
        })
    }

    pub fn incr_by(encoding: &str, offset: impl Into<BitOffset>, increment: i64) -> Result<Self> {
        Ok(BitfieldCommand::IncrBy {
            encoding: Encoding::parse(encoding)?,
            offset: offset.into(),
            increment,
        })
    }

    pub fn overflow(mode: Overflow) -> Self {
        BitfieldCommand::Overflow(mode)
    }
}

/// Parse a program in its token form, e.g.
/// `["set", "i8", "0", "127", "overflow", "sat", "incrby", "i8", "0", "1"]`.
pub fn parse_program(args: &[&str]) -> Result<Vec<BitfieldCommand>> {
    let mut program = Vec::new();
    let mut rest = args;
    while let Some((name, tail)) = rest.split_first() {
        let take = |n: usize| -> Result<&[&str]> {
            if tail.len() < n {
                Err(KvError::InvalidArgument(format!(
                    "wrong number of arguments for bitfield '{}'",
                    name
                )))
            } else {
                Ok(&tail[..n])
            }
        };
        let int = |s: &str| {
            s.parse::<i64>().map_err(|_| {
                KvError::InvalidArgument(format!("value is not an integer or out of range: '{}'", s))
            })
        };
        let (command, used) = match name.to_ascii_lowercase().as_str() {
            "get" => {
                let a = take(2)?;
                let command = BitfieldCommand::Get {
                    encoding: Encoding::parse(a[0])?,
                    offset: BitOffset::parse(a[1])?,
                };
                (command, 2)
            }
            "set" => {
                let a = take(3)?;
                let command = BitfieldCommand::Set {
                    encoding: Encoding::parse(a[0])?,
                    offset: BitOffset::parse(a[1])?,
                    value: int(a[2])?,
                };
                (command, 3)
            }
            "incrby" => {
                let a = take(3)?;
                let command = BitfieldCommand::IncrBy {
                    encoding: Encoding::parse(a[0])?,
                    offset: BitOffset::parse(a[1])?,
                    increment: int(a[2])?,
                };
                (command, 3)
            }
            "overflow" => {
                let a = take(1)?;
                (BitfieldCommand::Overflow(Overflow::parse(a[0])?), 1)
            }
            other => {
                return Err(KvError::InvalidArgument(format!(
                    "unknown bitfield subcommand '{}'",
                    other
                )))
            }
        };
        program.push(command);
        rest = &tail[used..];
    }
    Ok(program)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BitAction {
    Get,
    Set(i64),
    IncrBy(i64),
}

/// A compiled step: one result entry, overflow policy already resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BitfieldOp {
    pub action: BitAction,
    pub encoding: Encoding,
    /// Absolute bit offset.
    pub offset: u64,
    pub overflow: Overflow,
}

/// Whether a field of `encoding` starting at bit `offset` fits in a string.
fn addressable(offset: u64, encoding: Encoding) -> bool {
    offset
        .checked_add(encoding.bits() as u64)
        .is_some_and(|end| end <= MAX_BITS)
}

/// Reject compiled steps that address bits past the string size limit.
pub(crate) fn check_bounds(ops: &[BitfieldOp]) -> Result<()> {
    match ops.iter().find(|op| !addressable(op.offset, op.encoding)) {
        Some(op) => Err(KvError::InvalidArgument(format!(
            "bit offset is not an integer or out of range: {}",
            op.offset
        ))),
        None => Ok(()),
    }
}

/// Fold a program into compiled steps. OVERFLOW directives produce no step.
pub fn compile(program: &[BitfieldCommand]) -> Result<Vec<BitfieldOp>> {
    let (_, ops) = program.iter().try_fold(
        (Overflow::default(), Vec::with_capacity(program.len())),
        |(overflow, mut ops), command| {
            let (action, encoding, offset) = match *command {
                BitfieldCommand::Overflow(mode) => return Ok((mode, ops)),
                BitfieldCommand::Get { encoding, offset } => (BitAction::Get, encoding, offset),
                BitfieldCommand::Set {
                    encoding,
                    offset,
                    value,
                } => (BitAction::Set(value), encoding, offset),
                BitfieldCommand::IncrBy {
                    encoding,
                    offset,
                    increment,
                } => (BitAction::IncrBy(increment), encoding, offset),
            };
            ops.push(BitfieldOp {
                action,
                encoding,
                offset: offset.resolve(encoding)?,
                overflow,
            });
            Ok::<_, KvError>((overflow, ops))
        },
    )?;
    Ok(ops)
}

/// Apply compiled steps to a string value in place.
///
/// Returns one entry per step (`None` for a FAIL overflow) and whether the
/// buffer was written to.
pub(crate) fn execute(buf: &mut Vec<u8>, ops: &[BitfieldOp]) -> (Vec<Option<i64>>, bool) {
    let mut results = Vec::with_capacity(ops.len());
    let mut written = false;
    for op in ops {
        let bits = op.encoding.bits();
        let current = op.encoding.decode(read_bits(buf, op.offset, bits));
        let result = match op.action {
            BitAction::Get => Some(current),
            BitAction::Set(value) => match fit(value as i128, op.encoding, op.overflow) {
                Some(fitted) => {
                    write_bits(buf, op.offset, bits, op.encoding.encode(fitted));
                    written = true;
                    Some(current)
                }
                None => None,
            },
            BitAction::IncrBy(delta) => {
                match fit(current as i128 + delta as i128, op.encoding, op.overflow) {
                    Some(next) => {
                        write_bits(buf, op.offset, bits, op.encoding.encode(next));
                        written = true;
                        Some(next)
                    }
                    None => None,
                }
            }
        };
        results.push(result);
    }
    (results, written)
}

/// Bring `value` into the encoding's range under `overflow`; `None` means FAIL.
fn fit(value: i128, encoding: Encoding, overflow: Overflow) -> Option<i64> {
    let (min, max) = (encoding.min(), encoding.max());
    if (min..=max).contains(&value) {
        return Some(value as i64);
    }
    match overflow {
        Overflow::Wrap => {
            let modulus = 1i128 << encoding.bits();
            let mut wrapped = value.rem_euclid(modulus);
            if wrapped > max {
                wrapped -= modulus;
            }
            Some(wrapped as i64)
        }
        Overflow::Sat => Some(value.clamp(min, max) as i64),
        Overflow::Fail => None,
    }
}

/// Bits are numbered from the most significant bit of the first byte.
fn read_bits(buf: &[u8], offset: u64, bits: u32) -> u64 {
    let mut value = 0u64;
    for i in 0..bits as u64 {
        let bit = offset + i;
        let byte = (bit / 8) as usize;
        let set = buf
            .get(byte)
            .map(|b| (b >> (7 - (bit % 8))) & 1)
            .unwrap_or(0);
        value = (value << 1) | set as u64;
    }
    value
}

fn write_bits(buf: &mut Vec<u8>, offset: u64, bits: u32, value: u64) {
    let needed = ((offset + bits as u64 + 7) / 8) as usize;
    if buf.len() < needed {
        buf.resize(needed, 0);
    }
    for i in 0..bits as u64 {
        let bit = offset + i;
        let byte = (bit / 8) as usize;
        let mask = 1u8 << (7 - (bit % 8));
        if (value >> (bits as u64 - 1 - i)) & 1 == 1 {
            buf[byte] |= mask;
        } else {
            buf[byte] &= !mask;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(program: &[BitfieldCommand]) -> Vec<Option<i64>> {
        let mut buf = Vec::new();
        execute(&mut buf, &compile(program).unwrap()).0
    }

    #[test]
    fn test_encoding_parse() {
        assert_eq!(Encoding::parse("i8").unwrap(), Encoding::Signed(8));
        assert_eq!(Encoding::parse("u63").unwrap(), Encoding::Unsigned(63));
        assert_eq!(Encoding::parse("i64").unwrap(), Encoding::Signed(64));
        assert!(Encoding::parse("u64").is_err());
        assert!(Encoding::parse("i0").is_err());
        assert!(Encoding::parse("x8").is_err());
        assert!(Encoding::parse("").is_err());
    }

    #[test]
    fn test_offset_parse_and_resolve() {
        assert_eq!(BitOffset::parse("100").unwrap(), BitOffset::Bits(100));
        assert_eq!(BitOffset::parse("#3").unwrap(), BitOffset::Fields(3));
        assert!(BitOffset::parse("-1").is_err());
        assert_eq!(
            BitOffset::Fields(3).resolve(Encoding::Unsigned(8)).unwrap(),
            24
        );
        assert!(BitOffset::Bits(MAX_BITS).resolve(Encoding::Unsigned(8)).is_err());
    }

    #[test]
    fn test_huge_offsets_are_rejected() {
        for command in [
            BitfieldCommand::get("i8", u64::MAX).unwrap(),
            BitfieldCommand::set("u8", u64::MAX - 3, 1).unwrap(),
            BitfieldCommand::incr_by("i64", BitOffset::Fields(u64::MAX / 8), 1).unwrap(),
        ] {
            assert!(matches!(
                compile(&[command]),
                Err(KvError::InvalidArgument(_))
            ));
        }

        let program = parse_program(&["set", "u8", "18446744073709551615", "1"]).unwrap();
        assert!(matches!(compile(&program), Err(KvError::InvalidArgument(_))));

        let last = BitfieldCommand::get("u8", MAX_BITS - 8).unwrap();
        assert!(compile(&[last]).is_ok());
    }

    #[test]
    fn test_check_bounds_guards_wire_steps() {
        let step = BitfieldOp {
            action: BitAction::Set(1),
            encoding: Encoding::Unsigned(8),
            offset: u64::MAX,
            overflow: Overflow::Wrap,
        };
        assert!(matches!(
            check_bounds(&[step]),
            Err(KvError::InvalidArgument(_))
        ));
        assert!(check_bounds(&[BitfieldOp { offset: 0, ..step }]).is_ok());
    }

    #[test]
    fn test_overflow_parse() {
        assert_eq!(Overflow::parse("WRAP").unwrap(), Overflow::Wrap);
        assert_eq!(Overflow::parse("sat").unwrap(), Overflow::Sat);
        assert_eq!(Overflow::parse("Fail").unwrap(), Overflow::Fail);
        assert!(matches!(
            Overflow::parse("clamp"),
            Err(KvError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_overflow_directives_produce_no_steps() {
        let program = parse_program(&[
            "overflow", "sat", "incrby", "u2", "0", "1", "overflow", "fail", "get", "u2", "0",
        ])
        .unwrap();
        assert_eq!(program.len(), 4);
        let ops = compile(&program).unwrap();
        assert_eq!(ops.len(), 2);
        assert_eq!(ops[0].overflow, Overflow::Sat);
        assert_eq!(ops[1].overflow, Overflow::Fail);
    }

    #[test]
    fn test_parse_program_errors() {
        assert!(matches!(
            parse_program(&["frobnicate", "i8", "0"]),
            Err(KvError::InvalidArgument(_))
        ));
        assert!(parse_program(&["set", "i8", "0"]).is_err());
        assert!(parse_program(&["overflow", "maybe"]).is_err());
        assert!(parse_program(&["incrby", "i8", "0", "x"]).is_err());
        assert!(parse_program(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_overflow_modes_sequence() {
        let program = vec![
            BitfieldCommand::set("i8", 0u64, 127).unwrap(),
            BitfieldCommand::overflow(Overflow::Wrap),
            BitfieldCommand::incr_by("i8", 0u64, 1).unwrap(),
            BitfieldCommand::set("i8", 0u64, 127).unwrap(),
            BitfieldCommand::overflow(Overflow::Sat),
            BitfieldCommand::incr_by("i8", 0u64, 1).unwrap(),
            BitfieldCommand::overflow(Overflow::Fail),
            BitfieldCommand::incr_by("i8", 0u64, 1).unwrap(),
        ];
        assert_eq!(
            run(&program),
            vec![Some(0), Some(-128), Some(-128), Some(127), None]
        );
    }

    #[test]
    fn test_fail_leaves_value_unchanged() {
        let mut buf = Vec::new();
        let program = vec![
            BitfieldCommand::set("u4", 0u64, 15).unwrap(),
            BitfieldCommand::overflow(Overflow::Fail),
            BitfieldCommand::incr_by("u4", 0u64, 1).unwrap(),
            BitfieldCommand::set("u4", 0u64, 16).unwrap(),
            BitfieldCommand::get("u4", 0u64).unwrap(),
        ];
        let (results, written) = execute(&mut buf, &compile(&program).unwrap());
        assert_eq!(results, vec![Some(0), None, None, Some(15)]);
        assert!(written);
        assert_eq!(buf, vec![0xF0]);
    }

    #[test]
    fn test_unsigned_wrap_and_sat() {
        let program = vec![
            BitfieldCommand::incr_by("u2", 0u64, 5).unwrap(),
            BitfieldCommand::overflow(Overflow::Sat),
            BitfieldCommand::incr_by("u2", 0u64, -10).unwrap(),
            BitfieldCommand::incr_by("u2", 0u64, 10).unwrap(),
        ];
        assert_eq!(run(&program), vec![Some(1), Some(0), Some(3)]);
    }

    #[test]
    fn test_get_does_not_extend() {
        let mut buf = vec![0xFF];
        let ops = compile(&[BitfieldCommand::get("u8", 100u64).unwrap()]).unwrap();
        let (results, written) = execute(&mut buf, &ops);
        assert_eq!(results, vec![Some(0)]);
        assert!(!written);
        assert_eq!(buf.len(), 1);
    }

    #[test]
    fn test_unaligned_read_write() {
        let mut buf = Vec::new();
        let ops = compile(&[
            BitfieldCommand::set("u8", 4u64, 0xAB).unwrap(),
            BitfieldCommand::get("u4", 4u64).unwrap(),
            BitfieldCommand::get("i8", 4u64).unwrap(),
        ])
        .unwrap();
        let (results, _) = execute(&mut buf, &ops);
        assert_eq!(buf, vec![0x0A, 0xB0]);
        assert_eq!(results, vec![Some(0), Some(0xA), Some(0xAB_u8 as i8 as i64)]);
    }

    #[test]
    fn test_i64_extremes() {
        let program = vec![
            BitfieldCommand::set("i64", 0u64, i64::MAX).unwrap(),
            BitfieldCommand::incr_by("i64", 0u64, 1).unwrap(),
            BitfieldCommand::overflow(Overflow::Sat),
            BitfieldCommand::incr_by("i64", 0u64, -1).unwrap(),
        ];
        assert_eq!(
            run(&program),
            vec![Some(0), Some(i64::MIN), Some(i64::MIN)]
        );
    }
}
