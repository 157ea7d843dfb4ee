use crate::errors::{Error, Result};
use nom::IResult;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A BUFR descriptor code: F (2 bits), X (6 bits), Y (8 bits).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fxy {
    pub f: u8,
    pub x: u8,
    pub y: u8,
}

/// What a descriptor's F value classifies it as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorKind {
    Element,
    Replication,
    Operator,
    SequenceRef,
}

impl Fxy {
    pub fn new(f: u8, x: u8, y: u8) -> Self {
        Fxy { f, x, y }
    }

    pub fn from_u16(code: u16) -> Self {
        Fxy {
            f: ((code >> 14) & 0x3) as u8,
            x: ((code >> 8) & 0x3F) as u8,
            y: (code & 0xFF) as u8,
        }
    }

    pub fn as_u16(&self) -> u16 {
        ((self.f as u16) << 14) | ((self.x as u16) << 8) | (self.y as u16)
    }

    pub fn kind(&self) -> DescriptorKind {
        match self.f & 0x3 {
            0 => DescriptorKind::Element,
            1 => DescriptorKind::Replication,
            2 => DescriptorKind::Operator,
            _ => DescriptorKind::SequenceRef,
        }
    }

    /// Local-range codes are the only ones eligible for local-table lookup.
    pub fn is_local(&self) -> bool {
        self.x >= 48 || self.y >= 192
    }

    pub fn is_class31(&self) -> bool {
        self.f == 0 && self.x == 31
    }
}

impl FromStr for Fxy {
    type Err = Error;

    /// Accepts the WMO CSV form "001001" and the dashed form "0-01-001".
    fn from_str(s: &str) -> Result<Self> {
        let digits: String = if s.contains('-') {
            let parts: Vec<&str> = s.split('-').collect();
            if parts.len() != 3 {
                return Err(Error::Malformed(format!("invalid FXY string: {}", s)));
            }
            format!("{:0>1}{:0>2}{:0>3}", parts[0], parts[1], parts[2])
        } else {
            s.to_string()
        };

        if digits.len() != 6 {
            return Err(Error::Malformed(format!("invalid FXY string length: {}", s)));
        }

        let parse = |range: &str| {
            range
                .parse::<u8>()
                .map_err(|_| Error::Malformed(format!("invalid FXY string: {}", s)))
        };

        Ok(Fxy {
            f: parse(&digits[0..1])? & 0x3,
            x: parse(&digits[1..3])?,
            y: parse(&digits[3..6])?,
        })
    }
}

impl fmt::Display for Fxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{:02}-{:03}", self.f, self.x, self.y)
    }
}

/// Parse the descriptor block of a data-description section: consecutive
/// 2-byte codes, F in the top 2 bits, X in the next 6, Y in the low byte.
pub(crate) fn parse_descriptor_block(input: &[u8]) -> Result<Vec<Fxy>> {
    parse_descriptor_block_inner(input)
        .map(|(_, v)| v)
        .map_err(|_| Error::Framing("can't parse descriptors from data-description section".into()))
}

type BitInput<'a> = (&'a [u8], usize);

fn parse_descriptor_block_inner(mut input: &[u8]) -> IResult<BitInput<'_>, Vec<Fxy>> {
    let mut results = Vec::with_capacity(input.len() / 2);
    while input.len() > 1 {
        let ((rest, _), fxy) = take_fxy((input, 0))?;
        results.push(fxy);
        input = rest;
    }
    Ok(((input, 0), results))
}

fn take_fxy(bit_input: BitInput) -> IResult<BitInput, Fxy> {
    use nom::bits::complete::take;
    let (bit_input, f): (_, u8) = take(2usize)(bit_input)?;
    let (bit_input, x): (_, u8) = take(6usize)(bit_input)?;
    let (bit_input, y): (_, u8) = take(8usize)(bit_input)?;
    Ok((bit_input, Fxy::new(f, x, y)))
}
