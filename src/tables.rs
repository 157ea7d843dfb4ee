use crate::descriptor::Fxy;
use crate::errors::Result;
use rustc_hash::FxHashMap;
use serde::Deserialize;
use std::io::Read;
use std::path::Path;
use std::str::FromStr;

/// One Table B entry: the static definition of a data element.
#[derive(Debug, Clone, PartialEq)]
pub struct ElementDef {
    pub name: String,
    pub units: String,
    pub scale: i32,
    pub reference: i64,
    pub width: u32,
}

impl ElementDef {
    pub fn is_char(&self) -> bool {
        matches!(self.units.as_str(), "CCITT IA5" | "CCITT_IA5")
    }

    pub fn is_code_or_flag(&self) -> bool {
        units_are_code_or_flag(&self.units)
    }
}

/// Case- and punctuation-tolerant check for code-table / flag-table units,
/// which show up as "Code table", "CODE TABLE" or "FLAG TABLE" depending on
/// the table vintage.
pub(crate) fn units_are_code_or_flag(units: &str) -> bool {
    let u = units.trim();
    u.eq_ignore_ascii_case("code table")
        || u.eq_ignore_ascii_case("code-table")
        || u.eq_ignore_ascii_case("flag table")
        || u.eq_ignore_ascii_case("flag-table")
}

/// One Table D entry: an ordered expansion into sub-descriptors.
#[derive(Debug, Clone, PartialEq)]
pub struct SequenceDef {
    pub expansion: Vec<Fxy>,
}

#[derive(Debug, Clone, Default)]
pub struct TableB {
    map: FxHashMap<Fxy, ElementDef>,
}

#[derive(Debug, Clone, Default)]
pub struct TableD {
    map: FxHashMap<Fxy, SequenceDef>,
}

impl TableB {
    pub fn new() -> Self {
        TableB::default()
    }

    pub fn insert(&mut self, code: Fxy, def: ElementDef) {
        self.map.insert(code, def);
    }

    pub fn get(&self, code: Fxy) -> Option<&ElementDef> {
        self.map.get(&code)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Load a WMO-style Table B CSV export.
    pub fn from_csv_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = std::fs::File::open(path)?;
        Self::from_csv_reader(file)
    }

    pub fn from_csv_reader<R: Read>(reader: R) -> Result<Self> {
        let mut rdr = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_reader(reader);

        let mut table = TableB::new();
        for record in rdr.deserialize() {
            let raw: RawElementRow = record?;
            let code = Fxy::from_str(&raw.fxy)?;
            table.insert(
                code,
                ElementDef {
                    name: raw.element_name,
                    units: raw.unit,
                    scale: raw.scale,
                    reference: raw.reference_value,
                    width: raw.data_width_bits,
                },
            );
        }
        Ok(table)
    }
}

impl TableD {
    pub fn new() -> Self {
        TableD::default()
    }

    pub fn insert(&mut self, code: Fxy, def: SequenceDef) {
        self.map.insert(code, def);
    }

    pub fn get(&self, code: Fxy) -> Option<&SequenceDef> {
        self.map.get(&code)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Load a WMO-style Table D CSV export. Rows carry one sub-descriptor
    /// each; consecutive rows with the same FXY1 form one sequence.
    pub fn from_csv_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = std::fs::File::open(path)?;
        Self::from_csv_reader(file)
    }

    pub fn from_csv_reader<R: Read>(reader: R) -> Result<Self> {
        let mut rdr = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_reader(reader);

        let mut table = TableD::new();
        let mut current: Option<(Fxy, Vec<Fxy>)> = None;
        for record in rdr.deserialize() {
            let raw: RawSequenceRow = record?;
            let parent = Fxy::from_str(&raw.fxy1)?;
            let child = Fxy::from_str(&raw.fxy2)?;
            match &mut current {
                Some((p, chain)) if *p == parent => chain.push(child),
                _ => {
                    if let Some((p, chain)) = current.take() {
                        table.insert(p, SequenceDef { expansion: chain });
                    }
                    current = Some((parent, vec![child]));
                }
            }
        }
        if let Some((p, chain)) = current.take() {
            table.insert(p, SequenceDef { expansion: chain });
        }
        Ok(table)
    }
}

#[derive(Debug, Deserialize)]
struct RawElementRow {
    #[serde(rename = "FXY")]
    fxy: String,
    #[serde(rename = "ElementName_en")]
    element_name: String,
    #[serde(rename = "BUFR_Unit")]
    unit: String,
    #[serde(rename = "BUFR_Scale")]
    scale: i32,
    #[serde(rename = "BUFR_ReferenceValue")]
    reference_value: i64,
    #[serde(rename = "BUFR_DataWidth_Bits")]
    data_width_bits: u32,
}

#[derive(Debug, Deserialize)]
struct RawSequenceRow {
    #[serde(rename = "FXY1")]
    fxy1: String,
    #[serde(rename = "FXY2")]
    fxy2: String,
}

/// Identification-section fields that select which concrete tables apply to a
/// message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableContext {
    pub edition: u8,
    pub center: u16,
    pub subcenter: u16,
    pub master_version: u8,
    pub local_version: u8,
}

/// How WMO and local tables are consulted. Selected once per message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolvePolicy {
    WmoOnly,
    WmoThenLocal,
    LocalOverridesWmo,
}

impl ResolvePolicy {
    /// A message with no local table version never consults local tables. A
    /// center publishing against master version 0 is using a pure-local
    /// catalog, where local definitions win.
    pub fn for_context(cx: &TableContext) -> Self {
        if cx.local_version == 0 {
            ResolvePolicy::WmoOnly
        } else if cx.master_version == 0 {
            ResolvePolicy::LocalOverridesWmo
        } else {
            ResolvePolicy::WmoThenLocal
        }
    }
}

/// Resolves descriptor codes against a fixed set of loaded tables. Misses are
/// `None`, never fatal; the tree builder marks the affected subtree bad and
/// keeps going.
#[derive(Debug, Clone)]
pub struct TableLookup {
    wmo_b: TableB,
    wmo_d: TableD,
    local_b: Option<TableB>,
    local_d: Option<TableD>,
    policy: ResolvePolicy,
}

impl TableLookup {
    pub fn new(
        wmo_b: TableB,
        wmo_d: TableD,
        local_b: Option<TableB>,
        local_d: Option<TableD>,
        policy: ResolvePolicy,
    ) -> Self {
        TableLookup {
            wmo_b,
            wmo_d,
            local_b,
            local_d,
            policy,
        }
    }

    /// WMO tables only, for synthetic and test catalogs.
    pub fn wmo_only(wmo_b: TableB, wmo_d: TableD) -> Self {
        TableLookup::new(wmo_b, wmo_d, None, None, ResolvePolicy::WmoOnly)
    }

    pub fn policy(&self) -> ResolvePolicy {
        self.policy
    }

    pub fn element(&self, code: Fxy) -> Option<&ElementDef> {
        let local = if code.is_local() {
            self.local_b.as_ref().and_then(|t| t.get(code))
        } else {
            None
        };
        match self.policy {
            ResolvePolicy::WmoOnly => self.wmo_b.get(code),
            ResolvePolicy::WmoThenLocal => self.wmo_b.get(code).or(local),
            ResolvePolicy::LocalOverridesWmo => local.or_else(|| self.wmo_b.get(code)),
        }
    }

    pub fn sequence(&self, code: Fxy) -> Option<&SequenceDef> {
        let local = if code.is_local() {
            self.local_d.as_ref().and_then(|t| t.get(code))
        } else {
            None
        };
        match self.policy {
            ResolvePolicy::WmoOnly => self.wmo_d.get(code),
            ResolvePolicy::WmoThenLocal => self.wmo_d.get(code).or(local),
            ResolvePolicy::LocalOverridesWmo => local.or_else(|| self.wmo_d.get(code)),
        }
    }
}

/// The catalog-loading collaborator seam: anything that can produce the
/// tables for a message's context. Implementations live outside this crate
/// (disk trees, XML archives, remote fetches); errors cross the seam as
/// `anyhow::Error`.
pub trait Catalog {
    fn tables(&self, cx: &TableContext) -> anyhow::Result<TableLookup>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn element(width: u32) -> ElementDef {
        ElementDef {
            name: "test".into(),
            units: "Numeric".into(),
            scale: 0,
            reference: 0,
            width,
        }
    }

    fn lookup_with_local(policy: ResolvePolicy) -> TableLookup {
        let mut wmo = TableB::new();
        wmo.insert(Fxy::new(0, 1, 1), element(7));
        wmo.insert(Fxy::new(0, 48, 1), element(8));
        let mut local = TableB::new();
        local.insert(Fxy::new(0, 48, 1), element(12));
        local.insert(Fxy::new(0, 1, 1), element(99));
        TableLookup::new(wmo, TableD::new(), Some(local), None, policy)
    }

    #[test]
    fn test_wmo_only_ignores_local() {
        let lookup = lookup_with_local(ResolvePolicy::WmoOnly);
        assert_eq!(lookup.element(Fxy::new(0, 48, 1)).unwrap().width, 8);
    }

    #[test]
    fn test_local_overrides_wmo() {
        let lookup = lookup_with_local(ResolvePolicy::LocalOverridesWmo);
        assert_eq!(lookup.element(Fxy::new(0, 48, 1)).unwrap().width, 12);
    }

    #[test]
    fn test_wmo_then_local_falls_back() {
        let mut wmo = TableB::new();
        wmo.insert(Fxy::new(0, 1, 1), element(7));
        let mut local = TableB::new();
        local.insert(Fxy::new(0, 50, 3), element(4));
        let lookup = TableLookup::new(
            wmo,
            TableD::new(),
            Some(local),
            None,
            ResolvePolicy::WmoThenLocal,
        );
        assert_eq!(lookup.element(Fxy::new(0, 50, 3)).unwrap().width, 4);
    }

    #[test]
    fn test_wmo_range_codes_never_use_local() {
        // 0-01-001 is outside the local range, so the local entry for it must
        // be invisible even under local-overrides-wmo.
        let lookup = lookup_with_local(ResolvePolicy::LocalOverridesWmo);
        assert_eq!(lookup.element(Fxy::new(0, 1, 1)).unwrap().width, 7);
    }

    #[test]
    fn test_policy_selection() {
        let mut cx = TableContext {
            edition: 4,
            center: 74,
            subcenter: 0,
            master_version: 24,
            local_version: 0,
        };
        assert_eq!(ResolvePolicy::for_context(&cx), ResolvePolicy::WmoOnly);
        cx.local_version = 1;
        assert_eq!(ResolvePolicy::for_context(&cx), ResolvePolicy::WmoThenLocal);
        cx.master_version = 0;
        assert_eq!(
            ResolvePolicy::for_context(&cx),
            ResolvePolicy::LocalOverridesWmo
        );
    }

    #[test]
    fn test_table_b_csv() {
        let csv = "\
ClassNo,ClassName_en,FXY,ElementName_en,BUFR_Unit,BUFR_Scale,BUFR_ReferenceValue,BUFR_DataWidth_Bits,Status
01,Identification,001001,WMO block number,Numeric,0,0,7,Operational
01,Identification,001002,WMO station number,Numeric,0,0,10,Operational
";
        let table = TableB::from_csv_reader(csv.as_bytes()).unwrap();
        assert_eq!(table.len(), 2);
        let block = table.get(Fxy::new(0, 1, 1)).unwrap();
        assert_eq!(block.width, 7);
        assert_eq!(block.name, "WMO block number");
    }

    #[test]
    fn test_table_d_csv_groups_rows() {
        let csv = "\
Category,FXY1,Title_en,FXY2,Status
01,301001,(WMO block and station),001001,Operational
01,301001,,001002,Operational
01,301011,(Date),004001,Operational
";
        let table = TableD::from_csv_reader(csv.as_bytes()).unwrap();
        assert_eq!(table.len(), 2);
        let seq = table.get(Fxy::new(3, 1, 1)).unwrap();
        assert_eq!(seq.expansion, vec![Fxy::new(0, 1, 1), Fxy::new(0, 1, 2)]);
    }
}
