use crate::descriptor::{parse_descriptor_block, Fxy};
use crate::errors::{Error, Result};
use crate::layout::{
    compute_compressed, compute_uncompressed, CompressedLayout, UncompressedLayout,
};
use crate::reader::{read_compressed, read_uncompressed, Subset};
use crate::tables::{TableContext, TableLookup};
use crate::trace::Trace;
use crate::tree::DecodeTree;
use nom::bytes::complete::{tag, take};
use nom::number::complete::{be_u16, be_u24, be_u8};
use nom::IResult;
use serde::Serialize;
use std::cell::OnceCell;

pub const MAGIC: &[u8; 4] = b"BUFR";
pub const END_MARKER: &[u8; 4] = b"7777";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Section0 {
    pub total_length: u32,
    pub edition: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReferenceTime {
    pub year: u16,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
}

/// Identification section, unified across editions. Edition 3 packs the
/// centre and sub-centre into single octets and has no seconds field;
/// edition 4 widens both to two octets and adds a local subcategory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Section1 {
    pub length: u32,
    pub master_table: u8,
    pub center: u16,
    pub subcenter: u16,
    pub update_sequence: u8,
    pub has_optional_section: bool,
    pub data_category: u8,
    pub data_subcategory: u8,
    pub local_subcategory: Option<u8>,
    pub master_version: u8,
    pub local_version: u8,
    pub time: ReferenceTime,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Section3 {
    pub length: u32,
    pub n_subsets: u16,
    pub observed: bool,
    pub compressed: bool,
    pub descriptors: Vec<Fxy>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section4 {
    /// Declared length in octets, including the 4-byte section header.
    pub length: u32,
    pub data: Vec<u8>,
}

fn section0(input: &[u8]) -> IResult<&[u8], Section0> {
    let (input, _) = tag("BUFR")(input)?;
    let (input, total_length) = be_u24(input)?;
    let (input, edition) = be_u8(input)?;
    Ok((
        input,
        Section0 {
            total_length,
            edition,
        },
    ))
}

// Editions 2 and 3 share the 17-octet fixed layout.
fn section1_v3(input: &[u8]) -> IResult<&[u8], Section1> {
    const FIXED_LEN: u32 = 17;
    let (input, length) = be_u24(input)?;
    let (input, master_table) = be_u8(input)?;
    let (input, subcenter) = be_u8(input)?;
    let (input, center) = be_u8(input)?;
    let (input, update_sequence) = be_u8(input)?;
    let (input, flags) = be_u8(input)?;
    let (input, data_category) = be_u8(input)?;
    let (input, data_subcategory) = be_u8(input)?;
    let (input, master_version) = be_u8(input)?;
    let (input, local_version) = be_u8(input)?;
    let (input, year) = be_u8(input)?;
    let (input, month) = be_u8(input)?;
    let (input, day) = be_u8(input)?;
    let (input, hour) = be_u8(input)?;
    let (input, minute) = be_u8(input)?;
    let (input, _) = take(length.saturating_sub(FIXED_LEN))(input)?;
    let year = if (year as u16) < 100 {
        year as u16 + 2000
    } else {
        year as u16
    };
    Ok((
        input,
        Section1 {
            length,
            master_table,
            center: center as u16,
            subcenter: subcenter as u16,
            update_sequence,
            has_optional_section: flags & 0x80 != 0,
            data_category,
            data_subcategory,
            local_subcategory: None,
            master_version,
            local_version,
            time: ReferenceTime {
                year,
                month,
                day,
                hour,
                minute,
                second: 0,
            },
        },
    ))
}

fn section1_v4(input: &[u8]) -> IResult<&[u8], Section1> {
    const FIXED_LEN: u32 = 22;
    let (input, length) = be_u24(input)?;
    let (input, master_table) = be_u8(input)?;
    let (input, center) = be_u16(input)?;
    let (input, subcenter) = be_u16(input)?;
    let (input, update_sequence) = be_u8(input)?;
    let (input, flags) = be_u8(input)?;
    let (input, data_category) = be_u8(input)?;
    let (input, data_subcategory) = be_u8(input)?;
    let (input, local_subcategory) = be_u8(input)?;
    let (input, master_version) = be_u8(input)?;
    let (input, local_version) = be_u8(input)?;
    let (input, year) = be_u16(input)?;
    let (input, month) = be_u8(input)?;
    let (input, day) = be_u8(input)?;
    let (input, hour) = be_u8(input)?;
    let (input, minute) = be_u8(input)?;
    let (input, second) = be_u8(input)?;
    let (input, _) = take(length.saturating_sub(FIXED_LEN))(input)?;
    Ok((
        input,
        Section1 {
            length,
            master_table,
            center,
            subcenter,
            update_sequence,
            has_optional_section: flags & 0x80 != 0,
            data_category,
            data_subcategory,
            local_subcategory: Some(local_subcategory),
            master_version,
            local_version,
            time: ReferenceTime {
                year,
                month,
                day,
                hour,
                minute,
                second,
            },
        },
    ))
}

// Optional section 2 carries centre-local data; only its length matters.
fn section2(input: &[u8]) -> IResult<&[u8], ()> {
    let (input, length) = be_u24(input)?;
    let (input, _) = be_u8(input)?;
    let (input, _) = take(length.saturating_sub(4))(input)?;
    Ok((input, ()))
}

fn section3(input: &[u8]) -> IResult<&[u8], (Section3, &[u8])> {
    let (input, length) = be_u24(input)?;
    let (input, _) = be_u8(input)?; // reserved
    let (input, n_subsets) = be_u16(input)?;
    let (input, flags) = be_u8(input)?;
    let (input, raw_descriptors) = take(length.saturating_sub(7))(input)?;
    Ok((
        input,
        (
            Section3 {
                length,
                n_subsets,
                observed: flags & 0x80 != 0,
                compressed: flags & 0x40 != 0,
                descriptors: Vec::new(),
            },
            raw_descriptors,
        ),
    ))
}

fn section4(input: &[u8]) -> IResult<&[u8], Section4> {
    let (input, length) = be_u24(input)?;
    let (input, _) = be_u8(input)?; // reserved
    let (input, data) = take(length.saturating_sub(4))(input)?;
    Ok((
        input,
        Section4 {
            length,
            data: data.to_vec(),
        },
    ))
}

/// One parsed BUFR message. Section bytes are fully owned; the decode tree
/// and data layouts are built lazily on first use and cached.
#[derive(Debug)]
pub struct Message {
    pub section0: Section0,
    pub section1: Section1,
    pub section3: Section3,
    pub section4: Section4,
    /// Byte offset of the "BUFR" magic within the source stream.
    pub start_offset: u64,
    root: OnceCell<DecodeTree>,
    uncompressed: OnceCell<UncompressedLayout>,
    compressed: OnceCell<CompressedLayout>,
}

impl Message {
    /// Parse one message starting at `bytes[0]`. `start_offset` records
    /// where in the source stream the magic was found, for reporting.
    pub fn parse(bytes: &[u8], start_offset: u64) -> Result<Message> {
        let (rest, section0) = section0(bytes)?;
        if !matches!(section0.edition, 2..=4) {
            return Err(Error::UnsupportedEdition(section0.edition));
        }
        let total = section0.total_length as usize;
        if total < 8 {
            return Err(Error::Framing(format!("declared length {} too short", total)));
        }
        if total > bytes.len() {
            return Err(Error::Framing(format!(
                "declared length {} exceeds available {} bytes",
                total,
                bytes.len()
            )));
        }
        let rest = &rest[..total - 8];

        let (rest, section1) = match section0.edition {
            4 => section1_v4(rest)?,
            _ => section1_v3(rest)?,
        };
        let rest = if section1.has_optional_section {
            section2(rest)?.0
        } else {
            rest
        };
        let (rest, (mut section3, raw_descriptors)) = section3(rest)?;
        section3.descriptors = parse_descriptor_block(raw_descriptors)?;
        let (rest, mut section4) = section4(rest)?;

        // Some encoders declare Section 4 one octet long, leaving the end
        // marker to start inside the declared data. Tolerate that by
        // giving the trailing octet back.
        if !rest.starts_with(END_MARKER) {
            if section4.data.last() == Some(&b'7') && rest.starts_with(&END_MARKER[..3]) {
                section4.data.pop();
                section4.length -= 1;
            } else {
                return Err(Error::Framing("end marker 7777 not found".into()));
            }
        }

        Ok(Message {
            section0,
            section1,
            section3,
            section4,
            start_offset,
            root: OnceCell::new(),
            uncompressed: OnceCell::new(),
            compressed: OnceCell::new(),
        })
    }

    pub fn table_context(&self) -> TableContext {
        TableContext {
            edition: self.section0.edition,
            center: self.section1.center,
            subcenter: self.section1.subcenter,
            master_version: self.section1.master_version,
            local_version: self.section1.local_version,
        }
    }

    pub fn n_subsets(&self) -> u32 {
        self.section3.n_subsets as u32
    }

    /// The expanded decode tree, built once per message.
    pub fn root(&self, lookup: &TableLookup) -> &DecodeTree {
        self.root
            .get_or_init(|| DecodeTree::build(&self.section3.descriptors, lookup))
    }

    pub fn is_tables_complete(&self, lookup: &TableLookup) -> bool {
        !self.root(lookup).incomplete
    }

    pub fn uncompressed_layout(&self, lookup: &TableLookup) -> Result<&UncompressedLayout> {
        match self.uncompressed.get() {
            Some(layout) => Ok(layout),
            None => {
                let layout = compute_uncompressed(
                    self.root(lookup),
                    &self.section4.data,
                    self.n_subsets(),
                    None,
                )?;
                Ok(self.uncompressed.get_or_init(|| layout))
            }
        }
    }

    pub fn compressed_layout(&self, lookup: &TableLookup) -> Result<&CompressedLayout> {
        match self.compressed.get() {
            Some(layout) => Ok(layout),
            None => {
                let layout = compute_compressed(
                    self.root(lookup),
                    &self.section4.data,
                    self.n_subsets(),
                    None,
                )?;
                Ok(self.compressed.get_or_init(|| layout))
            }
        }
    }

    /// Data bits the message actually uses, as found by walking the layout.
    pub fn counted_bits(&self, lookup: &TableLookup) -> Result<u64> {
        if self.section3.compressed {
            Ok(self.compressed_layout(lookup)?.total_bits)
        } else {
            Ok(self.uncompressed_layout(lookup)?.total_bits)
        }
    }

    /// Octets Section 4 should occupy for the counted bits: the 4-byte
    /// header plus the data, padded to an even octet count.
    pub fn counted_data_bytes(&self, lookup: &TableLookup) -> Result<u32> {
        let bits = self.counted_bits(lookup)?;
        let mut bytes = (bits as u32).div_ceil(8) + 4;
        if bytes % 2 != 0 {
            bytes += 1;
        }
        Ok(bytes)
    }

    /// Whether the counted Section 4 size agrees with the declared one,
    /// within one octet. Always false when the tree is incomplete.
    pub fn is_bit_count_ok(&self, lookup: &TableLookup) -> Result<bool> {
        if self.root(lookup).incomplete {
            return Ok(false);
        }
        let counted = self.counted_data_bytes(lookup)? as i64;
        let declared = self.section4.length as i64;
        Ok((counted - declared).abs() <= 1)
    }

    /// Decode every subset of the message.
    pub fn decode(&self, lookup: &TableLookup) -> Result<Vec<Subset<'_>>> {
        if self.section3.compressed {
            let layout = self.compressed_layout(lookup)?;
            read_compressed(self.root(lookup), layout, &self.section4.data)
        } else {
            let layout = self.uncompressed_layout(lookup)?;
            read_uncompressed(self.root(lookup), layout, &self.section4.data)
        }
    }

    /// Like `decode`, but builds the tree and layout from scratch with
    /// every step reported into `trace`. The freshly built layout is not
    /// cached; the tree seeds the cache if it was still empty.
    pub fn decode_traced(
        &self,
        lookup: &TableLookup,
        trace: &mut Trace,
    ) -> Result<Vec<Subset<'_>>> {
        let tree = DecodeTree::build_traced(&self.section3.descriptors, lookup, Some(trace));
        let tree = self.root.get_or_init(|| tree);
        if self.section3.compressed {
            let layout =
                compute_compressed(tree, &self.section4.data, self.n_subsets(), Some(trace))?;
            read_compressed(tree, &layout, &self.section4.data)
        } else {
            let layout =
                compute_uncompressed(tree, &self.section4.data, self.n_subsets(), Some(trace))?;
            read_uncompressed(tree, &layout, &self.section4.data)
        }
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::build_message;
    use super::*;

    #[test]
    fn test_parse_sections() {
        let bytes = build_message(
            &[Fxy::new(0, 1, 1), Fxy::new(0, 1, 2)],
            &[0x06, 0x05, 0x00],
            1,
            false,
        );
        let msg = Message::parse(&bytes, 0).unwrap();
        assert_eq!(msg.section0.edition, 4);
        assert_eq!(msg.section0.total_length as usize, bytes.len());
        assert_eq!(msg.section1.center, 7);
        assert_eq!(msg.section1.master_version, 33);
        assert_eq!(msg.section1.time.year, 2024);
        assert_eq!(msg.section3.n_subsets, 1);
        assert!(msg.section3.observed);
        assert!(!msg.section3.compressed);
        assert_eq!(
            msg.section3.descriptors,
            vec![Fxy::new(0, 1, 1), Fxy::new(0, 1, 2)]
        );
        assert_eq!(msg.section4.data, vec![0x06, 0x05, 0x00]);
    }

    #[test]
    fn test_missing_end_marker_rejected() {
        let mut bytes = build_message(&[Fxy::new(0, 1, 1)], &[0x00], 1, false);
        let n = bytes.len();
        bytes[n - 1] = b'x';
        match Message::parse(&bytes, 0) {
            Err(Error::Framing(_)) => {}
            other => panic!("expected framing error, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_end_marker_one_byte_early() {
        // Declare section 4 one octet too long so the marker starts inside
        // the declared data.
        let bytes = build_message(&[Fxy::new(0, 1, 1)], &[0x00], 1, false);
        let mut shifted = bytes.clone();
        // grow declared s4 length and total length by one, dropping the
        // final marker byte to keep the slice the same size
        let s4_len_at = 8 + 22 + 7 + 2;
        let old_s4 = u32::from_be_bytes([0, shifted[s4_len_at], shifted[s4_len_at + 1], shifted[s4_len_at + 2]]);
        let new_s4 = (old_s4 + 1).to_be_bytes();
        shifted[s4_len_at..s4_len_at + 3].copy_from_slice(&new_s4[1..]);
        let msg = Message::parse(&shifted, 0);
        // data now swallows the first '7' and parse gives it back
        let msg = msg.unwrap();
        assert_eq!(msg.section4.data.len(), 1);
    }

    #[test]
    fn test_truncated_message_rejected() {
        let bytes = build_message(&[Fxy::new(0, 1, 1)], &[0x00], 1, false);
        match Message::parse(&bytes[..bytes.len() - 6], 0) {
            Err(Error::Framing(_)) => {}
            other => panic!("expected framing error, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_unsupported_edition() {
        let mut bytes = build_message(&[Fxy::new(0, 1, 1)], &[0x00], 1, false);
        bytes[7] = 1;
        assert!(matches!(
            Message::parse(&bytes, 0),
            Err(Error::UnsupportedEdition(1))
        ));
    }
}
