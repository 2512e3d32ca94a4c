//! Experiment database XML writer: walks the CCT arena directly and
//! serializes it with `quick_xml::Writer`, one element per node, rather
//! than building an intermediate in-memory document first.

use std::io::Write;
use std::path::Path;

use quick_xml::events::{BytesEnd, BytesStart, Event};
use quick_xml::Writer as XmlWriter;

use crate::cct::iter::line_sorted_children;
use crate::cct::node::{Cct, CctNode, NodeId};
use crate::core::metric::MetricDescriptor;
use crate::error::WriterError;

const DTD_VERSION: &str = "1.0.2";

/// Serializes `cct` (rooted at `root`) as `<CSPROFILE>` XML: `{PGM, G, PF,
/// C, S, L, SR}` tags, file/line/load-module/procedure/ip/opIdx/lip/alien/
/// structure-id attributes, and `<M n v/>` records for non-zero metrics.
pub fn write_experiment<W: Write>(
    w: W,
    target_name: &str,
    metrics: &[MetricDescriptor],
    cct: &Cct,
    root: NodeId,
    path: &Path,
) -> Result<(), WriterError> {
    let mut writer = XmlWriter::new_with_indent(w, b' ', 2);

    write_decl(&mut writer, path)?;

    let mut csprofile = BytesStart::new("CSPROFILE");
    csprofile.push_attribute(("version", DTD_VERSION));
    start(&mut writer, csprofile, path)?;

    write_params(&mut writer, target_name, metrics, path)?;
    write_node(&mut writer, cct, root, path)?;

    end(&mut writer, "CSPROFILE", path)?;
    writer
        .inner()
        .flush()
        .map_err(|source| WriterError::Flush { path: path.to_path_buf(), source })?;
    Ok(())
}

fn write_decl<W: Write>(writer: &mut XmlWriter<W>, path: &Path) -> Result<(), WriterError> {
    writer
        .write_event(Event::Decl(quick_xml::events::BytesDecl::new("1.0", Some("UTF-8"), None)))
        .map_err(|source| WriterError::Xml { path: path.to_path_buf(), source })?;
    Ok(())
}

fn start<W: Write>(writer: &mut XmlWriter<W>, elem: BytesStart, path: &Path) -> Result<(), WriterError> {
    writer
        .write_event(Event::Start(elem))
        .map_err(|source| WriterError::Xml { path: path.to_path_buf(), source })
}

fn empty<W: Write>(writer: &mut XmlWriter<W>, elem: BytesStart, path: &Path) -> Result<(), WriterError> {
    writer
        .write_event(Event::Empty(elem))
        .map_err(|source| WriterError::Xml { path: path.to_path_buf(), source })
}

fn end<W: Write>(writer: &mut XmlWriter<W>, tag: &str, path: &Path) -> Result<(), WriterError> {
    writer
        .write_event(Event::End(BytesEnd::new(tag)))
        .map_err(|source| WriterError::Xml { path: path.to_path_buf(), source })
}

fn write_params<W: Write>(
    writer: &mut XmlWriter<W>,
    target_name: &str,
    metrics: &[MetricDescriptor],
    path: &Path,
) -> Result<(), WriterError> {
    start(writer, BytesStart::new("CSPROFILEPARAMS"), path)?;

    let mut target = BytesStart::new("TARGET");
    target.push_attribute(("name", target_name));
    empty(writer, target, path)?;

    for (i, m) in metrics.iter().enumerate() {
        let mut metric = BytesStart::new("METRIC");
        let id = i.to_string();
        let period = m.period.to_string();
        let flags = m.flags.to_string();
        metric.push_attribute(("shortName", id.as_str()));
        metric.push_attribute(("nativeName", m.name.as_str()));
        metric.push_attribute(("period", period.as_str()));
        metric.push_attribute(("flags", flags.as_str()));
        empty(writer, metric, path)?;
    }

    end(writer, "CSPROFILEPARAMS", path)
}

fn opt_attr(elem: &mut BytesStart, key: &str, value: &Option<String>) {
    if let Some(v) = value {
        elem.push_attribute((key, v.as_str()));
    }
}

fn write_node<W: Write>(writer: &mut XmlWriter<W>, cct: &Cct, id: NodeId, path: &Path) -> Result<(), WriterError> {
    let node = cct.node(id);
    let tag = node.type_name();
    let children = line_sorted_children(cct, id);

    let file_str;
    let proc_str;
    let line_str;
    let ip_str;
    let op_str;
    let lip_str;
    let sid_str;

    let mut elem = BytesStart::new(tag);
    match node {
        CctNode::Pgm { name, .. } => {
            elem.push_attribute(("n", name.as_str()));
        }
        CctNode::Group { name } => {
            elem.push_attribute(("n", name.as_str()));
        }
        CctNode::ProcedureFrame { file, proc, is_alien, line, .. } => {
            file_str = file.as_ref().map(|f| f.display().to_string());
            proc_str = proc.clone();
            line_str = Some(line.to_string());
            opt_attr(&mut elem, "f", &file_str);
            opt_attr(&mut elem, "n", &proc_str);
            opt_attr(&mut elem, "l", &line_str);
            if *is_alien {
                elem.push_attribute(("alien", "1"));
            }
        }
        CctNode::CallSite(d) | CctNode::Statement(d) => {
            file_str = d.file.as_ref().map(|f| f.display().to_string());
            proc_str = d.proc.clone();
            line_str = Some(d.line.to_string());
            ip_str = Some(format!("{:x}", d.ip));
            op_str = Some(d.op_index.to_string());
            lip_str = (d.lush_lip != 0).then(|| format!("{:x}", d.lush_lip));
            sid_str = d.structure_id.map(|s| s.to_string());
            opt_attr(&mut elem, "f", &file_str);
            opt_attr(&mut elem, "n", &proc_str);
            opt_attr(&mut elem, "l", &line_str);
            opt_attr(&mut elem, "ip", &ip_str);
            opt_attr(&mut elem, "opIdx", &op_str);
            opt_attr(&mut elem, "lip", &lip_str);
            opt_attr(&mut elem, "s", &sid_str);
            if d.incomplete {
                elem.push_attribute(("partial", "1"));
            }
        }
        CctNode::Loop { file, beg_line, end_line } => {
            file_str = file.as_ref().map(|f| f.display().to_string());
            line_str = Some(format!("{}-{}", beg_line, end_line));
            opt_attr(&mut elem, "f", &file_str);
            opt_attr(&mut elem, "l", &line_str);
        }
        CctNode::StmtRange { file, beg_line, end_line } => {
            file_str = file.as_ref().map(|f| f.display().to_string());
            line_str = Some(format!("{}-{}", beg_line, end_line));
            opt_attr(&mut elem, "f", &file_str);
            opt_attr(&mut elem, "l", &line_str);
        }
    }

    let metrics: Vec<(usize, f64)> = node
        .dyn_data()
        .map(|d| d.metrics.iter().enumerate().filter(|(_, v)| **v != 0.0).map(|(i, v)| (i, *v)).collect())
        .unwrap_or_default();

    if children.is_empty() && metrics.is_empty() {
        return empty(writer, elem, path);
    }

    start(writer, elem, path)?;
    for (i, v) in &metrics {
        let mut m = BytesStart::new("M");
        let n = i.to_string();
        let v = format_metric(*v);
        m.push_attribute(("n", n.as_str()));
        m.push_attribute(("v", v.as_str()));
        empty(writer, m, path)?;
    }
    for child in children {
        write_node(writer, cct, child, path)?;
    }
    end(writer, tag, path)
}

fn format_metric(v: f64) -> String {
    if v.fract() == 0.0 && v.abs() < 1e15 {
        format!("{}", v as i64)
    } else {
        format!("{}", v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cct::node::{AssocClass, DynNodeData};

    fn sample_cct() -> (Cct, NodeId) {
        let mut cct = Cct::new();
        let root = cct.alloc(CctNode::Pgm { name: "a.out".into(), frozen: true });
        cct.set_root(root);
        let pf = cct.alloc(CctNode::ProcedureFrame {
            file: Some("a.c".into()),
            proc: Some("main".into()),
            is_alien: false,
            line: 10,
            file_is_text: true,
        });
        cct.append_child(root, pf);
        let mut d = DynNodeData::new(0x1010, 0, AssocClass::Direct, 0, vec![1.0]);
        d.file = Some("a.c".into());
        d.proc = Some("main".into());
        d.line = 15;
        d.file_is_text = true;
        d.structure_id = Some(2);
        let s = cct.alloc(CctNode::Statement(d));
        cct.append_child(pf, s);
        (cct, root)
    }

    #[test]
    fn writes_well_formed_xml_with_metric_record() {
        let (cct, root) = sample_cct();
        let metrics = vec![MetricDescriptor::new("CYCLES", 0, 1_000_000)];
        let mut buf = Vec::new();
        write_experiment(&mut buf, "a.out", &metrics, &cct, root, Path::new("experiment.xml")).unwrap();
        let xml = String::from_utf8(buf).unwrap();

        assert!(xml.contains("<CSPROFILE version=\"1.0.2\">"));
        assert!(xml.contains("<TARGET name=\"a.out\"/>"));
        assert!(xml.contains("<PF f=\"a.c\" n=\"main\" l=\"10\""));
        assert!(xml.contains("<S "));
        assert!(xml.contains("<M n=\"0\" v=\"1\"/>"));
        assert!(xml.contains("</CSPROFILE>"));
    }

    #[test]
    fn zero_metrics_are_not_written() {
        let mut cct = Cct::new();
        let root = cct.alloc(CctNode::Pgm { name: "a.out".into(), frozen: true });
        cct.set_root(root);
        let d = DynNodeData::new(0x10, 0, AssocClass::Direct, 0, vec![0.0, 0.0]);
        let s = cct.alloc(CctNode::Statement(d));
        cct.append_child(root, s);

        let metrics = vec![MetricDescriptor::new("A", 0, 1), MetricDescriptor::new("B", 0, 1)];
        let mut buf = Vec::new();
        write_experiment(&mut buf, "a.out", &metrics, &cct, root, Path::new("e.xml")).unwrap();
        let xml = String::from_utf8(buf).unwrap();
        assert!(!xml.contains("<M "));
    }
}
