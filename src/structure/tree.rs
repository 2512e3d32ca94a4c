//! The static structure tree: the non-dynamic skeleton of a program,
//! recovered ahead of time from debug info and described by `.hpcstruct`-
//! style structure files. Scope kinds (program, group, load module, file,
//! procedure, alien frame, loop, statement range) are collapsed into one
//! tagged sum type rather than a class per kind.

use std::path::{Path, PathBuf};

use anyhow::Context;
use quick_xml::events::Event;
use quick_xml::Reader;

use crate::structure::vma_interval::{VmaInterval, VmaIntervalSet};

/// Discriminates the eight static-structure scope kinds named by the
/// correlator's data model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeKind {
    Program,
    Group,
    LoadModule,
    File,
    Proc,
    Alien,
    Loop,
    Statement,
}

/// A single node of the static structure tree.
#[derive(Debug, Clone)]
pub struct StructureNode {
    pub kind: ScopeKind,
    /// Procedure or group name; `None` for scopes that don't carry one
    /// (loops, statements).
    pub name: Option<String>,
    pub file: Option<PathBuf>,
    pub beg_line: u32,
    pub end_line: u32,
    /// VMA ranges this scope's machine code occupies. Empty for scopes that
    /// are purely structural (program, group, file).
    pub vmas: VmaIntervalSet,
    /// Stable id assigned at structure-file parse time; round-tripped
    /// into the `structureId` attribute of written output.
    pub structure_id: u32,
    pub children: Vec<StructureNode>,
}

impl StructureNode {
    pub fn new(kind: ScopeKind, structure_id: u32) -> Self {
        StructureNode {
            kind,
            name: None,
            file: None,
            beg_line: 0,
            end_line: 0,
            vmas: VmaIntervalSet::new(),
            structure_id,
            children: Vec::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_file(mut self, file: impl Into<PathBuf>) -> Self {
        self.file = Some(file.into());
        self
    }

    pub fn with_lines(mut self, beg: u32, end: u32) -> Self {
        self.beg_line = beg;
        self.end_line = end;
        self
    }

    pub fn contains_line(&self, line: u32) -> bool {
        line >= self.beg_line && line <= self.end_line
    }

    /// Finds the innermost descendant scope (proc, alien, loop, or
    /// statement) whose VMA set contains `vma`, searching depth-first so
    /// that nested loops take priority over their enclosing procedure.
    pub fn find_by_vma(&self, vma: crate::core::vma::Vma) -> Option<&StructureNode> {
        if !self.vmas.is_empty() && !self.vmas.contains(vma) {
            return None;
        }
        for child in &self.children {
            if let Some(found) = child.find_by_vma(vma) {
                return Some(found);
            }
        }
        if matches!(
            self.kind,
            ScopeKind::Proc | ScopeKind::Alien | ScopeKind::Loop | ScopeKind::Statement
        ) && self.vmas.contains(vma)
        {
            Some(self)
        } else {
            None
        }
    }

    /// Innermost enclosing `Proc` scope of `vma`, or `None` if unmapped.
    pub fn find_proc_by_vma(&self, vma: crate::core::vma::Vma) -> Option<&StructureNode> {
        self.find_proc_by_vma_rec(vma, None)
    }

    fn find_proc_by_vma_rec<'a>(
        &'a self,
        vma: crate::core::vma::Vma,
        enclosing_proc: Option<&'a StructureNode>,
    ) -> Option<&'a StructureNode> {
        if !self.vmas.is_empty() && !self.vmas.contains(vma) {
            return None;
        }
        let enclosing_proc = if self.kind == ScopeKind::Proc {
            Some(self)
        } else {
            enclosing_proc
        };
        for child in &self.children {
            if let Some(found) = child.find_proc_by_vma_rec(vma, enclosing_proc) {
                return Some(found);
            }
        }
        if self.vmas.contains(vma) {
            enclosing_proc
        } else {
            None
        }
    }
}

/// One load module's worth of static structure, as parsed from a structure
/// file (`-S`).
#[derive(Debug, Clone)]
pub struct StructureTree {
    pub load_module_name: String,
    pub root: StructureNode,
}

impl StructureTree {
    pub fn find_by_vma(&self, vma: crate::core::vma::Vma) -> Option<&StructureNode> {
        self.root.find_by_vma(vma)
    }
}

/// Parses a `-S` structure file: `HPCToolkitStructure`-DTD XML with tags
/// `LM`/`F`/`P`/`A`/`L`/`S` mirroring the CCT's own `{PGM,G,PF,C,S,L,SR}`
/// surface one level up the pipeline. Returns one tree per `<LM>` element
/// found.
pub fn parse_structure_file(path: &Path) -> Result<Vec<StructureTree>, crate::error::CorrelatorError> {
    parse_structure_file_inner(path).map_err(|source| crate::error::CorrelatorError::StructureParse {
        path: path.to_path_buf(),
        source,
    })
}

fn parse_structure_file_inner(path: &Path) -> anyhow::Result<Vec<StructureTree>> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading structure file {}", path.display()))?;
    let mut reader = Reader::from_str(&text);
    reader.config_mut().trim_text(true);

    let mut trees = Vec::new();
    let mut stack: Vec<(String, StructureNode)> = Vec::new();
    let mut cur_lm_name: Option<String> = None;
    let mut buf = Vec::new();

    fn close_scope(stack: &mut Vec<(String, StructureNode)>, trees: &mut Vec<StructureTree>, cur_lm_name: &mut Option<String>) {
        if let Some((_, finished)) = stack.pop() {
            match stack.last_mut() {
                Some((_, parent)) => parent.children.push(finished),
                None => trees.push(StructureTree {
                    load_module_name: cur_lm_name.take().unwrap_or_default(),
                    root: finished,
                }),
            }
        }
    }

    loop {
        match reader.read_event_into(&mut buf).with_context(|| format!("parsing structure file {}", path.display()))? {
            Event::Eof => break,
            Event::Start(e) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).to_string();
                let attrs = read_attrs(&e)?;
                if name == "LM" {
                    cur_lm_name = attrs.get("n").cloned();
                    continue;
                }
                let Some(kind) = scope_kind_of(&name) else { continue };
                let node = node_from_attrs(kind, &attrs)?;
                stack.push((name, node));
            }
            Event::Empty(e) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).to_string();
                let attrs = read_attrs(&e)?;
                let Some(kind) = scope_kind_of(&name) else { continue };
                let node = node_from_attrs(kind, &attrs)?;
                stack.push((name, node));
                close_scope(&mut stack, &mut trees, &mut cur_lm_name);
            }
            Event::End(e) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).to_string();
                if name == "LM" {
                    continue;
                }
                if scope_kind_of(&name).is_none() {
                    continue;
                }
                close_scope(&mut stack, &mut trees, &mut cur_lm_name);
            }
            _ => {}
        }
        buf.clear();
    }

    Ok(trees)
}

fn scope_kind_of(tag: &str) -> Option<ScopeKind> {
    match tag {
        "PGM" => Some(ScopeKind::Program),
        "G" => Some(ScopeKind::Group),
        "F" => Some(ScopeKind::File),
        "P" => Some(ScopeKind::Proc),
        "A" => Some(ScopeKind::Alien),
        "L" => Some(ScopeKind::Loop),
        "S" => Some(ScopeKind::Statement),
        _ => None,
    }
}

fn read_attrs(e: &quick_xml::events::BytesStart) -> anyhow::Result<std::collections::HashMap<String, String>> {
    let mut out = std::collections::HashMap::new();
    for attr in e.attributes() {
        let attr = attr?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).to_string();
        let value = attr.unescape_value()?.to_string();
        out.insert(key, value);
    }
    Ok(out)
}

fn node_from_attrs(kind: ScopeKind, attrs: &std::collections::HashMap<String, String>) -> anyhow::Result<StructureNode> {
    let structure_id = attrs.get("s").and_then(|s| s.parse().ok()).unwrap_or(0);
    let mut node = StructureNode::new(kind, structure_id);
    if let Some(n) = attrs.get("n") {
        node.name = Some(n.clone());
    }
    if let Some(f) = attrs.get("f") {
        node.file = Some(PathBuf::from(f));
    }
    if let Some(l) = attrs.get("l") {
        let (beg, end) = parse_line_range(l);
        node.beg_line = beg;
        node.end_line = end;
    }
    if let Some(v) = attrs.get("v") {
        for range in v.split(',').filter(|s| !s.is_empty()) {
            if let Some((lo, hi)) = range.split_once('-') {
                let lo = parse_hex(lo)?;
                let hi = parse_hex(hi)?;
                if lo < hi {
                    node.vmas.insert(VmaInterval::new(lo, hi));
                }
            }
        }
    }
    Ok(node)
}

fn parse_line_range(s: &str) -> (u32, u32) {
    match s.split_once('-') {
        Some((b, e)) => (b.parse().unwrap_or(0), e.parse().unwrap_or(0)),
        None => {
            let n = s.parse().unwrap_or(0);
            (n, n)
        }
    }
}

fn parse_hex(s: &str) -> anyhow::Result<u64> {
    let s = s.trim().trim_start_matches("0x");
    u64::from_str_radix(s, 16).with_context(|| format!("invalid hex vma {s:?}"))
}
