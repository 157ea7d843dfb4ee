use crate::bits::BitReader;
use crate::errors::Result;
use crate::trace::{self, Trace};
use crate::tree::{DecodeNode, DecodeTree, NodeKind};
use std::io::{Read, Seek};

/// Bit positions for one field of an uncompressed subset. Offsets are
/// relative to the start of the Section 4 payload.
#[derive(Debug, Clone)]
pub enum UncompressedNode {
    Leaf {
        offset: u64,
        width: u32,
    },
    Group {
        /// None for fixed replication, where the count is in the tree.
        count_offset: Option<u64>,
        count_width: u32,
        count: u32,
        /// Repetition groups store one instance that the reader replays
        /// `count` times.
        repetition: bool,
        instances: Vec<Vec<UncompressedNode>>,
    },
}

#[derive(Debug, Clone)]
pub struct SubsetLayout {
    pub start_bit: u64,
    pub fields: Vec<UncompressedNode>,
}

#[derive(Debug, Clone)]
pub struct UncompressedLayout {
    pub subsets: Vec<SubsetLayout>,
    pub total_bits: u64,
}

/// Walk the tree once per subset, reading only delayed-replication counts
/// from the data to find where every field sits.
pub fn compute_uncompressed(
    tree: &DecodeTree,
    data: &[u8],
    n_subsets: u32,
    mut trace: Option<&mut Trace>,
) -> Result<UncompressedLayout> {
    let mut reader = BitReader::from_slice(data);
    let mut pos = 0u64;
    let mut subsets = Vec::with_capacity(n_subsets as usize);
    for i in 0..n_subsets {
        let start_bit = pos;
        let fields = lay_out_fields(&tree.fields, &mut reader, &mut pos, &mut trace)?;
        trace::note(&mut trace, || {
            format!("subset {}: bits {}..{}", i, start_bit, pos)
        });
        subsets.push(SubsetLayout { start_bit, fields });
    }
    Ok(UncompressedLayout {
        subsets,
        total_bits: pos,
    })
}

fn lay_out_fields<R: Read + Seek>(
    nodes: &[DecodeNode],
    reader: &mut BitReader<R>,
    pos: &mut u64,
    trace: &mut Option<&mut Trace>,
) -> Result<Vec<UncompressedNode>> {
    let mut out = Vec::with_capacity(nodes.len());
    for node in nodes {
        match node.kind {
            NodeKind::Element | NodeKind::Char | NodeKind::Associated => {
                out.push(UncompressedNode::Leaf {
                    offset: *pos,
                    width: node.width,
                });
                *pos += node.width as u64;
            }
            NodeKind::Structure { replication } => {
                let mut instances = Vec::with_capacity(replication as usize);
                for _ in 0..replication {
                    instances.push(lay_out_fields(&node.children, reader, pos, trace)?);
                }
                out.push(UncompressedNode::Group {
                    count_offset: None,
                    count_width: 0,
                    count: replication,
                    repetition: false,
                    instances,
                });
            }
            NodeKind::Delayed {
                count_width,
                repetition,
            } => {
                let count_offset = *pos;
                reader.set_bit_offset(count_offset);
                let count = reader.read_bits(count_width)? as u32;
                *pos += count_width as u64;
                trace::note(trace, || {
                    format!("{}: delayed count {} at bit {}", node.code, count, count_offset)
                });
                let n_instances = if repetition { count.min(1) } else { count };
                let mut instances = Vec::with_capacity(n_instances as usize);
                for _ in 0..n_instances {
                    instances.push(lay_out_fields(&node.children, reader, pos, trace)?);
                }
                out.push(UncompressedNode::Group {
                    count_offset: Some(count_offset),
                    count_width,
                    count,
                    repetition,
                    instances,
                });
            }
            _ => {}
        }
    }
    Ok(out)
}

/// Bit positions for one field of a compressed message. A numeric field is
/// stored as a minimum at the table width, a 6-bit delta width, then one
/// delta per subset.
#[derive(Debug, Clone)]
pub enum CompressedNode {
    Leaf {
        min_offset: u64,
        min_width: u32,
        /// Per-subset increment width in bits. For character fields the
        /// stored 6-bit value counts bytes and this is already scaled by 8.
        delta_width: u32,
        /// The declared delta width exceeded the table width, which marks
        /// the whole field as unusable.
        over_wide: bool,
        is_char: bool,
    },
    Group {
        count: u32,
        count_offset: u64,
        count_width: u32,
        instances: Vec<Vec<CompressedNode>>,
    },
}

#[derive(Debug, Clone)]
pub struct CompressedLayout {
    pub fields: Vec<CompressedNode>,
    pub n_subsets: u32,
    pub total_bits: u64,
}

pub fn compute_compressed(
    tree: &DecodeTree,
    data: &[u8],
    n_subsets: u32,
    mut trace: Option<&mut Trace>,
) -> Result<CompressedLayout> {
    let mut reader = BitReader::from_slice(data);
    let mut pos = 0u64;
    let fields = lay_out_compressed(&tree.fields, &mut reader, &mut pos, n_subsets, &mut trace)?;
    Ok(CompressedLayout {
        fields,
        n_subsets,
        total_bits: pos,
    })
}

fn lay_out_compressed<R: Read + Seek>(
    nodes: &[DecodeNode],
    reader: &mut BitReader<R>,
    pos: &mut u64,
    n_subsets: u32,
    trace: &mut Option<&mut Trace>,
) -> Result<Vec<CompressedNode>> {
    let mut out = Vec::with_capacity(nodes.len());
    for node in nodes {
        match node.kind {
            NodeKind::Element | NodeKind::Associated => {
                let min_offset = *pos;
                reader.set_bit_offset(min_offset + node.width as u64);
                let dw = reader.read_bits(6)? as u32;
                let over_wide = dw > node.width;
                if over_wide {
                    trace::note(trace, || {
                        format!(
                            "{}: delta width {} exceeds field width {}",
                            node.code, dw, node.width
                        )
                    });
                }
                out.push(CompressedNode::Leaf {
                    min_offset,
                    min_width: node.width,
                    delta_width: dw,
                    over_wide,
                    is_char: false,
                });
                *pos += node.width as u64 + 6 + dw as u64 * n_subsets as u64;
            }
            NodeKind::Char => {
                let min_offset = *pos;
                reader.set_bit_offset(min_offset + node.width as u64);
                // For character fields the increment width counts bytes.
                let dw_bytes = reader.read_bits(6)? as u32;
                out.push(CompressedNode::Leaf {
                    min_offset,
                    min_width: node.width,
                    delta_width: dw_bytes * 8,
                    over_wide: false,
                    is_char: true,
                });
                *pos += node.width as u64 + 6 + (dw_bytes as u64 * 8) * n_subsets as u64;
            }
            NodeKind::Structure { replication } => {
                let mut instances = Vec::with_capacity(replication as usize);
                for _ in 0..replication {
                    instances.push(lay_out_compressed(
                        &node.children,
                        reader,
                        pos,
                        n_subsets,
                        trace,
                    )?);
                }
                out.push(CompressedNode::Group {
                    count: replication,
                    count_offset: 0,
                    count_width: 0,
                    instances,
                });
            }
            NodeKind::Delayed { count_width, .. } => {
                // The count is identical across subsets, so it is stored
                // once at the count width, followed by a 6-bit increment
                // width that is always zero and carries no data.
                let count_offset = *pos;
                reader.set_bit_offset(count_offset);
                let count = reader.read_bits(count_width)? as u32;
                *pos += count_width as u64 + 6;
                trace::note(trace, || {
                    format!("{}: delayed count {} at bit {}", node.code, count, count_offset)
                });
                let mut instances = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    instances.push(lay_out_compressed(
                        &node.children,
                        reader,
                        pos,
                        n_subsets,
                        trace,
                    )?);
                }
                out.push(CompressedNode::Group {
                    count,
                    count_offset,
                    count_width,
                    instances,
                });
            }
            _ => {}
        }
    }
    Ok(out)
}
