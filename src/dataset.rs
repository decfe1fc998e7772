//! Map dataset access: PBF input, element model, and the rewrite sink.
//!
//! The base dataset is loaded once per job in a single streamed pass (nodes,
//! then ways, then relations, as PBF files are ordered). Element order is
//! preserved end to end so the rewritten dataset is a deterministic function
//! of the input.

use std::collections::{BTreeMap, HashMap};
use std::io::{self, Write};
use std::path::Path;

use osmpbf::{Element, ElementReader};

use crate::error::{Error, Result};

/// A way plus its tag set. Geometry is not embedded; node refs are resolved
/// against the dataset's location index at tagging time.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RoadSegment {
    pub id: i64,
    pub tags: BTreeMap<String, String>,
    pub node_refs: Vec<i64>,
}

impl RoadSegment {
    /// Ways eligible for penalty classification: roads and ferry routes.
    pub fn is_road(&self) -> bool {
        self.tags.contains_key("highway")
            || self.tags.get("route").map(String::as_str) == Some("ferry")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DatasetNode {
    pub id: i64,
    pub lat: f64,
    pub lon: f64,
    pub tags: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberKind {
    Node,
    Way,
    Relation,
}

impl MemberKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MemberKind::Node => "node",
            MemberKind::Way => "way",
            MemberKind::Relation => "relation",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RelationMember {
    pub kind: MemberKind,
    pub id: i64,
    pub role: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DatasetRelation {
    pub id: i64,
    pub tags: BTreeMap<String, String>,
    pub members: Vec<RelationMember>,
}

/// In-memory dataset with a node-id → coordinate index.
#[derive(Debug, Default)]
pub struct MapDataset {
    pub nodes: Vec<DatasetNode>,
    pub ways: Vec<RoadSegment>,
    pub relations: Vec<DatasetRelation>,
    locations: HashMap<i64, (f64, f64)>,
}

impl MapDataset {
    pub fn new(
        nodes: Vec<DatasetNode>,
        ways: Vec<RoadSegment>,
        relations: Vec<DatasetRelation>,
    ) -> Self {
        let locations = nodes.iter().map(|n| (n.id, (n.lat, n.lon))).collect();
        MapDataset {
            nodes,
            ways,
            relations,
            locations,
        }
    }

    /// Read a full PBF file. A read failure here aborts the whole rebuild,
    /// so it carries tagging-stage failure semantics.
    pub fn from_pbf(path: &Path) -> Result<Self> {
        let reader = ElementReader::from_path(path).map_err(|e| {
            Error::stage("tagging", format!("failed to open {}: {e}", path.display()))
        })?;

        let mut nodes = Vec::new();
        let mut ways = Vec::new();
        let mut relations = Vec::new();

        reader
            .for_each(|element| match element {
                Element::Node(node) => {
                    nodes.push(DatasetNode {
                        id: node.id(),
                        lat: node.lat(),
                        lon: node.lon(),
                        tags: collect_tags(node.tags()),
                    });
                }
                Element::DenseNode(node) => {
                    nodes.push(DatasetNode {
                        id: node.id(),
                        lat: node.lat(),
                        lon: node.lon(),
                        tags: collect_tags(node.tags()),
                    });
                }
                Element::Way(way) => {
                    ways.push(RoadSegment {
                        id: way.id(),
                        tags: collect_tags(way.tags()),
                        node_refs: way.refs().collect(),
                    });
                }
                Element::Relation(relation) => {
                    let members = relation
                        .members()
                        .map(|member| RelationMember {
                            kind: match member.member_type {
                                osmpbf::RelMemberType::Node => MemberKind::Node,
                                osmpbf::RelMemberType::Way => MemberKind::Way,
                                osmpbf::RelMemberType::Relation => MemberKind::Relation,
                            },
                            id: member.member_id,
                            role: member.role().unwrap_or("").to_string(),
                        })
                        .collect();
                    relations.push(DatasetRelation {
                        id: relation.id(),
                        tags: collect_tags(relation.tags()),
                        members,
                    });
                }
            })
            .map_err(|e| {
                Error::stage("tagging", format!("failed to read {}: {e}", path.display()))
            })?;

        tracing::info!(
            nodes = nodes.len(),
            ways = ways.len(),
            relations = relations.len(),
            "loaded base dataset"
        );

        Ok(MapDataset::new(nodes, ways, relations))
    }

    pub fn node_location(&self, id: i64) -> Option<(f64, f64)> {
        self.locations.get(&id).copied()
    }
}

fn collect_tags<'a>(tags: impl Iterator<Item = (&'a str, &'a str)>) -> BTreeMap<String, String> {
    tags.map(|(k, v)| (k.to_string(), v.to_string())).collect()
}

/// Receives the rewritten dataset element by element, in input order.
pub trait DatasetSink {
    fn node(&mut self, node: &DatasetNode) -> io::Result<()>;
    fn way(&mut self, way: &RoadSegment) -> io::Result<()>;
    fn relation(&mut self, relation: &DatasetRelation) -> io::Result<()>;
    fn finish(&mut self) -> io::Result<()>;
}

/// Writes OSM XML, the tagged-dataset format handed to `osrm-extract`.
pub struct OsmXmlWriter<W: Write> {
    out: W,
    header_written: bool,
}

impl<W: Write> OsmXmlWriter<W> {
    pub fn new(out: W) -> Self {
        OsmXmlWriter {
            out,
            header_written: false,
        }
    }

    fn ensure_header(&mut self) -> io::Result<()> {
        if !self.header_written {
            writeln!(self.out, r#"<?xml version="1.0" encoding="UTF-8"?>"#)?;
            writeln!(self.out, r#"<osm version="0.6" generator="avoidzones">"#)?;
            self.header_written = true;
        }
        Ok(())
    }

    fn write_tags(&mut self, tags: &BTreeMap<String, String>, indent: &str) -> io::Result<()> {
        for (key, value) in tags {
            writeln!(
                self.out,
                r#"{indent}<tag k="{}" v="{}"/>"#,
                xml_escape(key),
                xml_escape(value)
            )?;
        }
        Ok(())
    }
}

impl<W: Write> DatasetSink for OsmXmlWriter<W> {
    fn node(&mut self, node: &DatasetNode) -> io::Result<()> {
        self.ensure_header()?;
        if node.tags.is_empty() {
            writeln!(
                self.out,
                r#"  <node id="{}" version="1" lat="{:.7}" lon="{:.7}"/>"#,
                node.id, node.lat, node.lon
            )?;
        } else {
            writeln!(
                self.out,
                r#"  <node id="{}" version="1" lat="{:.7}" lon="{:.7}">"#,
                node.id, node.lat, node.lon
            )?;
            self.write_tags(&node.tags, "    ")?;
            writeln!(self.out, "  </node>")?;
        }
        Ok(())
    }

    fn way(&mut self, way: &RoadSegment) -> io::Result<()> {
        self.ensure_header()?;
        writeln!(self.out, r#"  <way id="{}" version="1">"#, way.id)?;
        for node_ref in &way.node_refs {
            writeln!(self.out, r#"    <nd ref="{node_ref}"/>"#)?;
        }
        self.write_tags(&way.tags, "    ")?;
        writeln!(self.out, "  </way>")?;
        Ok(())
    }

    fn relation(&mut self, relation: &DatasetRelation) -> io::Result<()> {
        self.ensure_header()?;
        writeln!(self.out, r#"  <relation id="{}" version="1">"#, relation.id)?;
        for member in &relation.members {
            writeln!(
                self.out,
                r#"    <member type="{}" ref="{}" role="{}"/>"#,
                member.kind.as_str(),
                member.id,
                xml_escape(&member.role)
            )?;
        }
        self.write_tags(&relation.tags, "    ")?;
        writeln!(self.out, "  </relation>")?;
        Ok(())
    }

    fn finish(&mut self) -> io::Result<()> {
        self.ensure_header()?;
        writeln!(self.out, "</osm>")?;
        self.out.flush()
    }
}

fn xml_escape(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            _ => escaped.push(ch),
        }
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn road_predicate_accepts_highways_and_ferries() {
        let highway = RoadSegment {
            id: 1,
            tags: tags(&[("highway", "residential")]),
            node_refs: vec![1, 2],
        };
        let ferry = RoadSegment {
            id: 2,
            tags: tags(&[("route", "ferry")]),
            node_refs: vec![3, 4],
        };
        let building = RoadSegment {
            id: 3,
            tags: tags(&[("building", "yes")]),
            node_refs: vec![5, 6],
        };
        assert!(highway.is_road());
        assert!(ferry.is_road());
        assert!(!building.is_road());
    }

    #[test]
    fn xml_writer_escapes_tag_values() {
        let mut buf = Vec::new();
        {
            let mut writer = OsmXmlWriter::new(&mut buf);
            let way = RoadSegment {
                id: 7,
                tags: tags(&[("name", "Smith & \"Jones\" <Lane>")]),
                node_refs: vec![1, 2],
            };
            writer.way(&way).unwrap();
            writer.finish().unwrap();
        }
        let xml = String::from_utf8(buf).unwrap();
        assert!(xml.contains("Smith &amp; &quot;Jones&quot; &lt;Lane&gt;"));
        assert!(xml.ends_with("</osm>\n"));
    }

    #[test]
    fn xml_writer_emits_nodes_ways_relations() {
        let mut buf = Vec::new();
        {
            let mut writer = OsmXmlWriter::new(&mut buf);
            writer
                .node(&DatasetNode {
                    id: 1,
                    lat: 51.5,
                    lon: -0.1,
                    tags: BTreeMap::new(),
                })
                .unwrap();
            writer
                .way(&RoadSegment {
                    id: 2,
                    tags: tags(&[("highway", "primary")]),
                    node_refs: vec![1],
                })
                .unwrap();
            writer
                .relation(&DatasetRelation {
                    id: 3,
                    tags: tags(&[("type", "route")]),
                    members: vec![RelationMember {
                        kind: MemberKind::Way,
                        id: 2,
                        role: "outer".to_string(),
                    }],
                })
                .unwrap();
            writer.finish().unwrap();
        }
        let xml = String::from_utf8(buf).unwrap();
        assert!(xml.contains(r#"<node id="1" version="1" lat="51.5000000" lon="-0.1000000"/>"#));
        assert!(xml.contains(r#"<nd ref="1"/>"#));
        assert!(xml.contains(r#"<member type="way" ref="2" role="outer"/>"#));
    }

    #[test]
    fn node_location_index_resolves_ids() {
        let dataset = MapDataset::new(
            vec![DatasetNode {
                id: 42,
                lat: 1.0,
                lon: 2.0,
                tags: BTreeMap::new(),
            }],
            Vec::new(),
            Vec::new(),
        );
        assert_eq!(dataset.node_location(42), Some((1.0, 2.0)));
        assert_eq!(dataset.node_location(43), None);
    }
}
