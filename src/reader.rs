use crate::bits::{missing_value, BitReader};
use crate::descriptor::Fxy;
use crate::errors::Result;
use crate::layout::{CompressedLayout, CompressedNode, UncompressedLayout, UncompressedNode};
use crate::tree::{DecodeNode, DecodeTree, NodeKind};
use serde::Serialize;
use std::io::{Read, Seek};

/// One decoded observation: the fields of a single subset in tree order.
#[derive(Debug, Clone, Serialize)]
pub struct Subset<'a> {
    pub fields: Vec<Field<'a>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Field<'a> {
    pub code: Fxy,
    pub name: &'a str,
    pub units: &'a str,
    pub value: Value<'a>,
}

/// A decoded value. Numbers keep the unscaled integer and the decimal scale
/// separate so no precision is lost before the caller asks for a float.
#[derive(Debug, Clone, Serialize)]
pub enum Value<'a> {
    Missing,
    Number { unscaled: i64, scale: i32 },
    Text(String),
    Sequence(Vec<Subset<'a>>),
}

impl Value<'_> {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number { unscaled, scale } => Some(if *scale >= 0 {
                *unscaled as f64 / 10f64.powi(*scale)
            } else {
                *unscaled as f64 * 10f64.powi(-scale)
            }),
            _ => None,
        }
    }

    pub fn is_missing(&self) -> bool {
        matches!(self, Value::Missing)
    }
}

/// Extract every subset of an uncompressed message using a precomputed
/// layout. Names and units borrow from the tree.
pub fn read_uncompressed<'a>(
    tree: &'a DecodeTree,
    layout: &UncompressedLayout,
    data: &[u8],
) -> Result<Vec<Subset<'a>>> {
    let mut reader = BitReader::from_slice(data);
    let mut subsets = Vec::with_capacity(layout.subsets.len());
    for subset in &layout.subsets {
        let fields = read_fields(&tree.fields, &subset.fields, &mut reader)?;
        subsets.push(Subset { fields });
    }
    Ok(subsets)
}

fn read_fields<'a, R: Read + Seek>(
    nodes: &'a [DecodeNode],
    lnodes: &[UncompressedNode],
    reader: &mut BitReader<R>,
) -> Result<Vec<Field<'a>>> {
    let mut out = Vec::with_capacity(nodes.len());
    for (node, lnode) in nodes.iter().zip(lnodes) {
        match (node.kind, lnode) {
            (NodeKind::Char, UncompressedNode::Leaf { offset, width }) => {
                reader.set_bit_offset(*offset);
                let bytes = reader.read_chars((*width / 8) as usize)?;
                out.push(field(node, Value::Text(decode_text(&bytes))));
            }
            (_, UncompressedNode::Leaf { offset, width }) => {
                reader.set_bit_offset(*offset);
                let raw = reader.read_bits(*width)?;
                out.push(field(node, numeric_value(node, raw, *width)));
            }
            (
                _,
                UncompressedNode::Group {
                    count,
                    repetition,
                    instances,
                    ..
                },
            ) => {
                let mut decoded = Vec::with_capacity(instances.len());
                for instance in instances {
                    decoded.push(Subset {
                        fields: read_fields(&node.children, instance, reader)?,
                    });
                }
                if *repetition {
                    // The body appears once in the stream and stands for
                    // `count` identical observations.
                    let template = decoded;
                    decoded = (0..*count)
                        .flat_map(|_| template.iter().cloned())
                        .collect();
                }
                out.push(field(node, Value::Sequence(decoded)));
            }
        }
    }
    Ok(out)
}

/// Extract every subset of a compressed message. Fields are reconstituted
/// per subset as minimum plus increment.
pub fn read_compressed<'a>(
    tree: &'a DecodeTree,
    layout: &CompressedLayout,
    data: &[u8],
) -> Result<Vec<Subset<'a>>> {
    let mut reader = BitReader::from_slice(data);
    let n = layout.n_subsets as usize;
    let columns = read_compressed_fields(&tree.fields, &layout.fields, &mut reader, n)?;
    Ok(columns.into_iter().map(|fields| Subset { fields }).collect())
}

// Returns one field vector per subset.
fn read_compressed_fields<'a, R: Read + Seek>(
    nodes: &'a [DecodeNode],
    lnodes: &[CompressedNode],
    reader: &mut BitReader<R>,
    n_subsets: usize,
) -> Result<Vec<Vec<Field<'a>>>> {
    let mut out: Vec<Vec<Field<'a>>> = (0..n_subsets).map(|_| Vec::new()).collect();
    for (node, lnode) in nodes.iter().zip(lnodes) {
        match lnode {
            CompressedNode::Leaf {
                min_offset,
                min_width,
                delta_width,
                over_wide,
                is_char,
            } => {
                if *is_char {
                    let texts = read_compressed_text(
                        reader,
                        *min_offset,
                        *min_width,
                        *delta_width,
                        n_subsets,
                    )?;
                    for (i, text) in texts.into_iter().enumerate() {
                        out[i].push(field(node, Value::Text(text)));
                    }
                } else if *over_wide {
                    // Declared increment width exceeds the field width, so
                    // nothing sensible can be reconstructed.
                    for column in out.iter_mut() {
                        column.push(field(node, Value::Missing));
                    }
                } else {
                    reader.set_bit_offset(*min_offset);
                    let min = reader.read_bits(*min_width)?;
                    for i in 0..n_subsets {
                        let value = if *delta_width == 0 {
                            numeric_value(node, min, *min_width)
                        } else {
                            reader.set_bit_offset(
                                min_offset
                                    + *min_width as u64
                                    + 6
                                    + i as u64 * *delta_width as u64,
                            );
                            let delta = reader.read_bits(*delta_width)?;
                            if delta == missing_value(*delta_width) && !node.is_class31() {
                                Value::Missing
                            } else {
                                numeric_value(node, min.saturating_add(delta), *min_width)
                            }
                        };
                        out[i].push(field(node, value));
                    }
                }
            }
            CompressedNode::Group { instances, .. } => {
                let mut per_instance = Vec::with_capacity(instances.len());
                for instance in instances {
                    per_instance.push(read_compressed_fields(
                        &node.children,
                        instance,
                        reader,
                        n_subsets,
                    )?);
                }
                for (i, column) in out.iter_mut().enumerate() {
                    let decoded = per_instance
                        .iter()
                        .map(|instance| Subset {
                            fields: instance[i].clone(),
                        })
                        .collect();
                    column.push(field(node, Value::Sequence(decoded)));
                }
            }
        }
    }
    Ok(out)
}

fn read_compressed_text<R: Read + Seek>(
    reader: &mut BitReader<R>,
    min_offset: u64,
    min_width: u32,
    delta_width: u32,
    n_subsets: usize,
) -> Result<Vec<String>> {
    reader.set_bit_offset(min_offset);
    let min_bytes = reader.read_chars((min_width / 8) as usize)?;
    let mut texts = Vec::with_capacity(n_subsets);
    for i in 0..n_subsets {
        if delta_width == 0 {
            texts.push(decode_text(&min_bytes));
            continue;
        }
        reader.set_bit_offset(min_offset + min_width as u64 + 6 + i as u64 * delta_width as u64);
        let nbytes = ((delta_width / 8) as usize).min((min_width / 8) as usize);
        let bytes = reader.read_chars((delta_width / 8) as usize)?;
        if bytes.iter().all(|&b| b == 0) {
            texts.push(decode_text(&min_bytes));
        } else {
            texts.push(decode_text(&bytes[..nbytes]));
        }
    }
    Ok(texts)
}

fn field<'a>(node: &'a DecodeNode, value: Value<'a>) -> Field<'a> {
    Field {
        code: node.code,
        name: &node.name,
        units: &node.units,
        value,
    }
}

fn numeric_value<'a>(node: &DecodeNode, raw: u64, width: u32) -> Value<'a> {
    if width > 0 && raw == missing_value(width) && !node.is_class31() {
        return Value::Missing;
    }
    // A raw value the reference can't absorb into an i64 has no faithful
    // representation, so it reads as missing rather than wrapping.
    match node.reference.checked_add_unsigned(raw) {
        Some(unscaled) => Value::Number {
            unscaled,
            scale: node.scale,
        },
        None => Value::Missing,
    }
}

/// Replace bytes outside printable ASCII with spaces, then decode as
/// Latin-1 so stray high bytes never poison the string.
fn decode_text(bytes: &[u8]) -> String {
    let cleaned: Vec<u8> = bytes
        .iter()
        .map(|&b| if (32..=126).contains(&b) { b } else { b' ' })
        .collect();
    let (text, _, _) = encoding_rs::WINDOWS_1252.decode(&cleaned);
    text.trim_end().to_string()
}
