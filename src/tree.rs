use crate::descriptor::{DescriptorKind, Fxy};
use crate::tables::TableLookup;
use crate::trace::{self, Trace};
use rustc_hash::FxHashSet;
use std::collections::VecDeque;

/// What a fully built tree node is. `Replication`, `Operator` and `Sequence`
/// only exist between builder passes and never appear in a finished tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// Numeric, code-table or flag-table element.
    Element,
    /// Character element (CCITT IA5 units or a 2-05 literal).
    Char,
    /// Fixed replication: children repeat `replication` times.
    Structure { replication: u32 },
    /// Delayed replication or repetition: the count lives in the data stream,
    /// `count_width` bits wide. Repetition counts are read once per structure
    /// rather than varying per observation.
    Delayed { count_width: u32, repetition: bool },
    /// Synthetic associated-field node inserted ahead of the element it
    /// annotates (2-04 operator).
    Associated,
    Replication,
    Operator,
    Sequence,
}

/// One node of the per-message decode tree, with table values already
/// adjusted by any operators in force at its position.
#[derive(Debug, Clone)]
pub struct DecodeNode {
    pub code: Fxy,
    pub name: String,
    pub units: String,
    pub scale: i32,
    pub reference: i64,
    pub width: u32,
    pub kind: NodeKind,
    pub children: Vec<DecodeNode>,
    bad: bool,
}

impl DecodeNode {
    fn bare(code: Fxy, kind: NodeKind) -> Self {
        DecodeNode {
            code,
            name: String::new(),
            units: String::new(),
            scale: 0,
            reference: 0,
            width: 0,
            kind,
            children: Vec::new(),
            bad: false,
        }
    }

    fn unresolved(code: Fxy, kind: NodeKind) -> Self {
        let mut node = DecodeNode::bare(code, kind);
        node.bad = true;
        node
    }

    pub fn is_class31(&self) -> bool {
        self.code.is_class31()
    }

    /// Code-table, flag-table and class-31 count elements keep their table
    /// width and scale regardless of active operators.
    fn immune_to_overrides(&self) -> bool {
        self.is_class31() || crate::tables::units_are_code_or_flag(&self.units)
    }
}

/// The expanded decode tree for one message. `incomplete` is set when a
/// descriptor could not be resolved and its subtree was dropped.
#[derive(Debug, Clone)]
pub struct DecodeTree {
    pub fields: Vec<DecodeNode>,
    pub incomplete: bool,
}

impl DecodeTree {
    pub fn build(codes: &[Fxy], lookup: &TableLookup) -> DecodeTree {
        DecodeTree::build_traced(codes, lookup, None)
    }

    pub fn build_traced(
        codes: &[Fxy],
        lookup: &TableLookup,
        trace: Option<&mut Trace>,
    ) -> DecodeTree {
        let mut builder = Builder {
            lookup,
            trace,
            incomplete: false,
        };
        let converted = builder.convert(codes);
        let replicated = builder.replicate(converted);
        let flattened = builder.flatten(replicated);
        let mut overrides = Overrides::default();
        let fields = builder.operate(flattened, &mut overrides);
        DecodeTree {
            fields,
            incomplete: builder.incomplete,
        }
    }

    /// Closed-form upper bound on the data bits one observation takes. For
    /// delayed replication only the count field is known before the data is
    /// read, so the authoritative count comes from the layout engines.
    pub fn total_bits(&self) -> u64 {
        fn sum(nodes: &[DecodeNode]) -> u64 {
            nodes
                .iter()
                .map(|node| match node.kind {
                    NodeKind::Element | NodeKind::Char | NodeKind::Associated => node.width as u64,
                    NodeKind::Structure { replication } => {
                        replication as u64 * sum(&node.children)
                    }
                    NodeKind::Delayed { count_width, .. } => count_width as u64,
                    _ => 0,
                })
                .sum()
        }
        sum(&self.fields)
    }
}

/// Table-C operator state threaded through the left-to-right operate pass.
#[derive(Debug, Clone, Copy, Default)]
struct Overrides {
    width_delta: Option<i32>,
    scale_delta: Option<i32>,
    reference_delta: Option<i64>,
    associated_width: Option<u32>,
    char_width: Option<u32>,
    next_width: Option<u32>,
    augment: Option<i32>,
}

struct Builder<'a, 't> {
    lookup: &'a TableLookup,
    trace: Option<&'t mut Trace>,
    incomplete: bool,
}

impl Builder<'_, '_> {
    fn note(&mut self, f: impl FnOnce() -> String) {
        trace::note(&mut self.trace, f);
    }

    fn miss(&mut self, code: Fxy, why: &str) -> DecodeNode {
        self.incomplete = true;
        self.note(|| format!("{}: {}", code, why));
        DecodeNode::unresolved(code, NodeKind::Element)
    }

    // Pass 1: resolve each code against the tables, expanding sequences
    // recursively. A visited set keyed by descriptor code guards against
    // cyclic Table D references.
    fn convert(&mut self, codes: &[Fxy]) -> Vec<DecodeNode> {
        let mut seen = FxHashSet::default();
        codes
            .iter()
            .map(|code| self.convert_one(*code, &mut seen))
            .collect()
    }

    fn convert_one(&mut self, code: Fxy, seen: &mut FxHashSet<Fxy>) -> DecodeNode {
        match code.kind() {
            DescriptorKind::Element => match self.lookup.element(code) {
                Some(def) => {
                    let kind = if def.is_char() {
                        NodeKind::Char
                    } else {
                        NodeKind::Element
                    };
                    DecodeNode {
                        code,
                        name: def.name.clone(),
                        units: def.units.clone(),
                        scale: def.scale,
                        reference: def.reference,
                        width: def.width,
                        kind,
                        children: Vec::new(),
                        bad: false,
                    }
                }
                None => self.miss(code, "not found in Table B"),
            },
            DescriptorKind::Replication => DecodeNode::bare(code, NodeKind::Replication),
            DescriptorKind::Operator => DecodeNode::bare(code, NodeKind::Operator),
            DescriptorKind::SequenceRef => {
                if !seen.insert(code) {
                    return self.miss(code, "cyclic Table D reference");
                }
                let node = match self.lookup.sequence(code) {
                    Some(def) => {
                        let expansion = def.expansion.clone();
                        let mut node = DecodeNode::bare(code, NodeKind::Sequence);
                        node.children = expansion
                            .iter()
                            .map(|sub| self.convert_one(*sub, seen))
                            .collect();
                        node
                    }
                    None => self.miss(code, "not found in Table D"),
                };
                seen.remove(&code);
                node
            }
        }
    }

    // Pass 2: fold F=1 replication operators into nesting. X following
    // descriptors become children; Y=0 consumes a class-31 count specifier
    // that fixes the count-field width.
    fn replicate(&mut self, nodes: Vec<DecodeNode>) -> Vec<DecodeNode> {
        let mut input: VecDeque<DecodeNode> = nodes.into();
        let mut out = Vec::with_capacity(input.len());

        while let Some(mut node) = input.pop_front() {
            if node.kind != NodeKind::Replication {
                if !node.children.is_empty() {
                    node.children = self.replicate(std::mem::take(&mut node.children));
                }
                out.push(node);
                continue;
            }

            let x = node.code.x as usize;
            let y = node.code.y as u32;

            let kind = if y == 0 {
                match input.pop_front() {
                    Some(spec) if spec.is_class31() => match spec.code.y {
                        0 => NodeKind::Delayed { count_width: 1, repetition: false },
                        1 => NodeKind::Delayed { count_width: 8, repetition: false },
                        2 => NodeKind::Delayed { count_width: 16, repetition: false },
                        11 => NodeKind::Delayed { count_width: 8, repetition: true },
                        12 => NodeKind::Delayed { count_width: 16, repetition: true },
                        other => {
                            self.note(|| {
                                format!(
                                    "{}: unrecognized replication count specifier 0-31-{:03}",
                                    node.code, other
                                )
                            });
                            self.incomplete = true;
                            for _ in 0..x {
                                input.pop_front();
                            }
                            continue;
                        }
                    },
                    _ => {
                        self.note(|| {
                            format!("{}: delayed replication without count specifier", node.code)
                        });
                        self.incomplete = true;
                        for _ in 0..x {
                            input.pop_front();
                        }
                        continue;
                    }
                }
            } else {
                NodeKind::Structure { replication: y }
            };

            let mut body = Vec::with_capacity(x);
            for _ in 0..x {
                match input.pop_front() {
                    Some(sub) => body.push(sub),
                    None => {
                        self.note(|| format!("{}: not enough descriptors to replicate", node.code));
                        self.incomplete = true;
                        break;
                    }
                }
            }

            node.kind = kind;
            node.children = self.replicate(body);
            out.push(node);
        }
        out
    }

    // Pass 3: inline sequence expansions and drop bad subtrees.
    fn flatten(&mut self, nodes: Vec<DecodeNode>) -> Vec<DecodeNode> {
        let mut out = Vec::with_capacity(nodes.len());
        for mut node in nodes {
            if node.bad {
                self.incomplete = true;
                continue;
            }
            node.children = self.flatten(std::mem::take(&mut node.children));
            if node.kind == NodeKind::Sequence {
                out.extend(node.children);
            } else {
                out.push(node);
            }
        }
        out
    }

    // Pass 4: consume F=2 operators, baking their effect into subsequent
    // element nodes. The accumulator travels in document order, so an
    // operator inside a structure stays in force after it.
    fn operate(&mut self, nodes: Vec<DecodeNode>, ov: &mut Overrides) -> Vec<DecodeNode> {
        let mut out = Vec::with_capacity(nodes.len());
        for mut node in nodes {
            match node.kind {
                NodeKind::Operator => self.apply_operator(&node, ov, &mut out),
                NodeKind::Element => {
                    self.apply_overrides(&mut node, ov);
                    self.push_with_associated(node, ov, &mut out);
                }
                NodeKind::Char => {
                    if let Some(width) = ov.next_width.take() {
                        node.width = width;
                    } else if let Some(nbytes) = ov.char_width {
                        node.width = nbytes * 8;
                    }
                    self.push_with_associated(node, ov, &mut out);
                }
                NodeKind::Structure { .. } | NodeKind::Delayed { .. } => {
                    node.children = self.operate(std::mem::take(&mut node.children), ov);
                    out.push(node);
                }
                _ => out.push(node),
            }
        }
        out
    }

    fn apply_overrides(&mut self, node: &mut DecodeNode, ov: &mut Overrides) {
        if let Some(width) = ov.next_width.take() {
            node.width = width;
            return;
        }
        if node.immune_to_overrides() {
            return;
        }
        if let Some(delta) = ov.width_delta {
            node.width = node.width.saturating_add_signed(delta);
        }
        if let Some(delta) = ov.scale_delta {
            node.scale += delta;
        }
        if let Some(delta) = ov.reference_delta {
            node.reference += delta;
        }
        if let Some(y) = ov.augment {
            // 2-07-Y adjusts all three parameters at once.
            node.scale += y;
            node.reference *= 10i64.pow(y as u32);
            node.width += (10 * y as u32 + 2) / 3;
        }
    }

    fn push_with_associated(&mut self, node: DecodeNode, ov: &Overrides, out: &mut Vec<DecodeNode>) {
        if let Some(width) = ov.associated_width {
            // Class-31 count fields never carry an associated field.
            if !node.is_class31() {
                let mut assoc = DecodeNode::bare(Fxy::new(2, 4, width as u8), NodeKind::Associated);
                assoc.name = format!("associated field for {}", node.code);
                assoc.width = width;
                out.push(assoc);
            }
        }
        out.push(node);
    }

    fn apply_operator(&mut self, node: &DecodeNode, ov: &mut Overrides, out: &mut Vec<DecodeNode>) {
        let y = node.code.y;
        match node.code.x {
            1 => ov.width_delta = (y != 0).then(|| y as i32 - 128),
            2 => ov.scale_delta = (y != 0).then(|| y as i32 - 128),
            3 => ov.reference_delta = (y != 255).then(|| y as i64 - 128),
            4 => ov.associated_width = (y != 0).then_some(y as u32),
            5 => {
                // Inline character literal of Y bytes.
                let mut lit = DecodeNode::bare(node.code, NodeKind::Char);
                lit.name = "character literal".into();
                lit.units = "CCITT IA5".into();
                lit.width = y as u32 * 8;
                out.push(lit);
            }
            6 => ov.next_width = Some(y as u32),
            7 => ov.augment = (y != 0).then_some(y as i32),
            8 => ov.char_width = (y != 0).then_some(y as u32),
            other => {
                self.note(|| format!("{}: operator class {} ignored", node.code, other));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tables::{ElementDef, SequenceDef, TableB, TableD};

    fn numeric(name: &str, width: u32) -> ElementDef {
        ElementDef {
            name: name.into(),
            units: "Numeric".into(),
            scale: 0,
            reference: 0,
            width,
        }
    }

    fn test_lookup() -> TableLookup {
        let mut b = TableB::new();
        b.insert(Fxy::new(0, 1, 1), numeric("block", 7));
        b.insert(Fxy::new(0, 1, 2), numeric("station", 10));
        b.insert(Fxy::new(0, 12, 1), numeric("temperature", 12));
        b.insert(
            Fxy::new(0, 31, 1),
            ElementDef {
                name: "delayed descriptor replication factor".into(),
                units: "Numeric".into(),
                scale: 0,
                reference: 0,
                width: 8,
            },
        );
        b.insert(
            Fxy::new(0, 2, 1),
            ElementDef {
                name: "station type".into(),
                units: "code table".into(),
                scale: 0,
                reference: 0,
                width: 2,
            },
        );
        let mut d = TableD::new();
        d.insert(
            Fxy::new(3, 1, 1),
            SequenceDef {
                expansion: vec![Fxy::new(0, 1, 1), Fxy::new(0, 1, 2)],
            },
        );
        // self-referential sequence for the cycle guard test
        d.insert(
            Fxy::new(3, 60, 1),
            SequenceDef {
                expansion: vec![Fxy::new(3, 60, 1)],
            },
        );
        TableLookup::wmo_only(b, d)
    }

    #[test]
    fn test_plain_elements() {
        let lookup = test_lookup();
        let tree = DecodeTree::build(&[Fxy::new(0, 1, 1), Fxy::new(0, 1, 2)], &lookup);
        assert!(!tree.incomplete);
        assert_eq!(tree.fields.len(), 2);
        assert_eq!(tree.fields[0].width, 7);
        assert_eq!(tree.fields[1].width, 10);
        assert_eq!(tree.total_bits(), 17);
    }

    #[test]
    fn test_sequence_inlined() {
        let lookup = test_lookup();
        let tree = DecodeTree::build(&[Fxy::new(3, 1, 1), Fxy::new(0, 12, 1)], &lookup);
        assert_eq!(tree.fields.len(), 3);
        assert_eq!(tree.fields[0].name, "block");
        assert_eq!(tree.fields[2].name, "temperature");
    }

    #[test]
    fn test_fixed_replication() {
        let lookup = test_lookup();
        // repeat the next 2 descriptors 3 times
        let tree = DecodeTree::build(
            &[Fxy::new(1, 2, 3), Fxy::new(0, 1, 1), Fxy::new(0, 1, 2)],
            &lookup,
        );
        assert_eq!(tree.fields.len(), 1);
        let group = &tree.fields[0];
        assert_eq!(group.kind, NodeKind::Structure { replication: 3 });
        assert_eq!(group.children.len(), 2);
        assert_eq!(tree.total_bits(), 3 * 17);
    }

    #[test]
    fn test_delayed_replication() {
        let lookup = test_lookup();
        let tree = DecodeTree::build(
            &[Fxy::new(1, 1, 0), Fxy::new(0, 31, 1), Fxy::new(0, 12, 1)],
            &lookup,
        );
        assert_eq!(tree.fields.len(), 1);
        let group = &tree.fields[0];
        assert_eq!(
            group.kind,
            NodeKind::Delayed {
                count_width: 8,
                repetition: false
            }
        );
        assert_eq!(group.children.len(), 1);
        // only the count field is knowable up front
        assert_eq!(tree.total_bits(), 8);
    }

    #[test]
    fn test_unrecognized_count_specifier_drops_field() {
        let lookup = test_lookup();
        // 0-01-01 stands in for the count specifier; it's not class 31
        let tree = DecodeTree::build(
            &[
                Fxy::new(1, 1, 0),
                Fxy::new(0, 1, 1),
                Fxy::new(0, 12, 1),
                Fxy::new(0, 1, 2),
            ],
            &lookup,
        );
        assert!(tree.incomplete);
        assert_eq!(tree.fields.len(), 1);
        assert_eq!(tree.fields[0].name, "station");
    }

    #[test]
    fn test_unknown_descriptor_marks_incomplete() {
        let lookup = test_lookup();
        let tree = DecodeTree::build(&[Fxy::new(0, 63, 63), Fxy::new(0, 1, 1)], &lookup);
        assert!(tree.incomplete);
        assert_eq!(tree.fields.len(), 1);
        assert_eq!(tree.fields[0].name, "block");
    }

    #[test]
    fn test_cyclic_sequence_guard() {
        let lookup = test_lookup();
        let tree = DecodeTree::build(&[Fxy::new(3, 60, 1), Fxy::new(0, 1, 1)], &lookup);
        assert!(tree.incomplete);
        assert_eq!(tree.fields.len(), 1);
    }

    #[test]
    fn test_width_and_scale_operators() {
        let lookup = test_lookup();
        let tree = DecodeTree::build(
            &[
                Fxy::new(2, 1, 130), // width += 2
                Fxy::new(2, 2, 129), // scale += 1
                Fxy::new(0, 12, 1),
                Fxy::new(2, 1, 0), // clear width
                Fxy::new(2, 2, 0), // clear scale
                Fxy::new(0, 12, 1),
            ],
            &lookup,
        );
        assert_eq!(tree.fields.len(), 2);
        assert_eq!(tree.fields[0].width, 14);
        assert_eq!(tree.fields[0].scale, 1);
        assert_eq!(tree.fields[1].width, 12);
        assert_eq!(tree.fields[1].scale, 0);
    }

    #[test]
    fn test_code_table_immune_to_operators() {
        let lookup = test_lookup();
        let tree = DecodeTree::build(
            &[Fxy::new(2, 1, 130), Fxy::new(0, 2, 1), Fxy::new(0, 12, 1)],
            &lookup,
        );
        assert_eq!(tree.fields[0].width, 2); // code table untouched
        assert_eq!(tree.fields[1].width, 14);
    }

    #[test]
    fn test_one_shot_width_override() {
        let lookup = test_lookup();
        let tree = DecodeTree::build(
            &[Fxy::new(2, 6, 20), Fxy::new(0, 12, 1), Fxy::new(0, 12, 1)],
            &lookup,
        );
        assert_eq!(tree.fields[0].width, 20);
        assert_eq!(tree.fields[1].width, 12);
    }

    #[test]
    fn test_character_literal_operator() {
        let lookup = test_lookup();
        let tree = DecodeTree::build(&[Fxy::new(2, 5, 8), Fxy::new(0, 1, 1)], &lookup);
        assert_eq!(tree.fields.len(), 2);
        assert_eq!(tree.fields[0].kind, NodeKind::Char);
        assert_eq!(tree.fields[0].width, 64);
    }

    #[test]
    fn test_associated_field_insertion() {
        let lookup = test_lookup();
        let tree = DecodeTree::build(
            &[
                Fxy::new(2, 4, 6),
                Fxy::new(0, 1, 1),
                Fxy::new(2, 4, 0),
                Fxy::new(0, 1, 2),
            ],
            &lookup,
        );
        assert_eq!(tree.fields.len(), 3);
        assert_eq!(tree.fields[0].kind, NodeKind::Associated);
        assert_eq!(tree.fields[0].width, 6);
        assert_eq!(tree.fields[1].name, "block");
        assert_eq!(tree.fields[2].name, "station");
    }

    #[test]
    fn test_associated_field_skips_class31() {
        let lookup = test_lookup();
        let tree = DecodeTree::build(
            &[
                Fxy::new(2, 4, 6),
                Fxy::new(1, 1, 0),
                Fxy::new(0, 31, 1),
                Fxy::new(0, 12, 1),
            ],
            &lookup,
        );
        // the delayed group holds one associated + one element child; the
        // count field itself gets no associated sibling
        assert_eq!(tree.fields.len(), 1);
        let group = &tree.fields[0];
        assert_eq!(group.children.len(), 2);
        assert_eq!(group.children[0].kind, NodeKind::Associated);
    }

    #[test]
    fn test_operator_survives_structure_boundary() {
        let lookup = test_lookup();
        let tree = DecodeTree::build(
            &[
                Fxy::new(1, 2, 2),
                Fxy::new(2, 1, 130),
                Fxy::new(0, 12, 1),
                Fxy::new(0, 12, 1),
            ],
            &lookup,
        );
        let group = &tree.fields[0];
        assert_eq!(group.children.len(), 1);
        assert_eq!(group.children[0].width, 14);
        assert_eq!(tree.fields[1].width, 14);
    }
}
