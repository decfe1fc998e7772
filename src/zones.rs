//! Zone configurations: GeoJSON parsing, validation, and canonical hashing.
//!
//! A configuration is the set of avoid-zone polygons submitted by the caller.
//! Identity is structural: the canonical hash is invariant under feature
//! reordering, ring direction, and ring starting vertex, so semantically
//! identical submissions deduplicate to one stored version.

use std::collections::HashSet;

use geo::algorithm::orient::{Direction, Orient};
use geo::{Coord, LineString, MultiPolygon, Polygon};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// GeoJSON FeatureCollection as submitted by callers. Geometry coordinates
/// stay untyped until converted, since positions may carry an altitude.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FeatureCollection {
    #[serde(rename = "type")]
    pub kind: String,
    pub features: Vec<Feature>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Feature {
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub properties: Option<serde_json::Map<String, Value>>,
    #[serde(default)]
    pub geometry: Option<GeoJsonGeometry>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GeoJsonGeometry {
    #[serde(rename = "type")]
    pub kind: String,
    pub coordinates: Value,
}

/// One avoid zone: a (multi)polygon area plus the participation flags
/// controlling which classification rules it contributes to.
#[derive(Debug, Clone)]
pub struct ZonePolygon {
    pub area: MultiPolygon<f64>,
    /// Zone participates in the "segment fully inside" rule.
    pub penalize_inside: bool,
    /// Zone participates in the "segment touches or crosses" rule.
    pub penalize_crossing: bool,
}

#[derive(Debug, Clone)]
pub struct Configuration {
    pub zones: Vec<ZonePolygon>,
}

impl Configuration {
    pub fn from_geojson_str(text: &str) -> Result<Self> {
        let doc: FeatureCollection = serde_json::from_str(text)
            .map_err(|e| Error::Validation(format!("malformed GeoJSON: {e}")))?;
        Self::from_feature_collection(&doc)
    }

    pub fn from_feature_collection(doc: &FeatureCollection) -> Result<Self> {
        if doc.kind != "FeatureCollection" {
            return Err(Error::Validation(format!(
                "expected FeatureCollection, got '{}'",
                doc.kind
            )));
        }

        let mut zones = Vec::new();
        for feature in &doc.features {
            if let Some(zone) = parse_feature(feature)? {
                zones.push(zone);
            }
        }

        if zones.is_empty() {
            return Err(Error::Validation(
                "no (Multi)Polygon features in avoid-zones GeoJSON".to_string(),
            ));
        }

        Ok(Configuration { zones })
    }

    pub fn zone_count(&self) -> usize {
        self.zones.len()
    }

    /// Order-independent fingerprint of the zone set.
    ///
    /// Each zone is serialized into a normalized descriptor (7-decimal
    /// coordinates, OGC winding, rings rotated to their minimum vertex);
    /// descriptors are sorted bytewise, concatenated, and hashed.
    pub fn canonical_hash(&self) -> String {
        let mut descriptors: Vec<String> =
            self.zones.iter().map(zone_descriptor).collect();
        descriptors.sort();

        let mut hasher = Sha256::new();
        for descriptor in &descriptors {
            hasher.update(descriptor.as_bytes());
            hasher.update(b"\n");
        }
        hex::encode(hasher.finalize())
    }
}

/// Non-polygonal features are ignored; they carry no area to avoid.
fn parse_feature(feature: &Feature) -> Result<Option<ZonePolygon>> {
    let Some(geometry) = &feature.geometry else {
        return Ok(None);
    };

    let polygons = match geometry.kind.as_str() {
        "Polygon" => {
            let rings = rings_from_value(&geometry.coordinates)?;
            vec![polygon_from_rings(rings)?]
        }
        "MultiPolygon" => {
            let parts: Vec<Value> = serde_json::from_value(geometry.coordinates.clone())
                .map_err(|e| Error::Validation(format!("bad MultiPolygon coordinates: {e}")))?;
            let mut polygons = Vec::with_capacity(parts.len());
            for part in &parts {
                polygons.push(polygon_from_rings(rings_from_value(part)?)?);
            }
            polygons
        }
        _ => return Ok(None),
    };

    Ok(Some(ZonePolygon {
        area: MultiPolygon(polygons),
        penalize_inside: bool_property(feature, "penalize_inside"),
        penalize_crossing: bool_property(feature, "penalize_crossing"),
    }))
}

/// Participation flags default to true: a plain polygon behaves like the
/// classic avoid zone that penalizes both containment and crossing.
fn bool_property(feature: &Feature, key: &str) -> bool {
    feature
        .properties
        .as_ref()
        .and_then(|props| props.get(key))
        .and_then(Value::as_bool)
        .unwrap_or(true)
}

fn rings_from_value(value: &Value) -> Result<Vec<Vec<Coord<f64>>>> {
    let raw: Vec<Vec<Vec<f64>>> = serde_json::from_value(value.clone())
        .map_err(|e| Error::Validation(format!("bad polygon coordinates: {e}")))?;

    let mut rings = Vec::with_capacity(raw.len());
    for ring in &raw {
        let mut coords = Vec::with_capacity(ring.len());
        for position in ring {
            if position.len() < 2 {
                return Err(Error::Validation(
                    "position with fewer than 2 ordinates".to_string(),
                ));
            }
            coords.push(Coord {
                x: position[0],
                y: position[1],
            });
        }
        validate_ring(&coords)?;
        rings.push(coords);
    }

    if rings.is_empty() {
        return Err(Error::Validation("polygon without rings".to_string()));
    }
    Ok(rings)
}

/// A usable ring needs finite coordinates and at least 3 distinct vertices
/// (the closing duplicate does not count).
fn validate_ring(coords: &[Coord<f64>]) -> Result<()> {
    let mut distinct = HashSet::new();
    for coord in coords {
        if !coord.x.is_finite() || !coord.y.is_finite() {
            return Err(Error::Validation(
                "non-finite coordinate in polygon ring".to_string(),
            ));
        }
        distinct.insert((coord.x.to_bits(), coord.y.to_bits()));
    }
    if distinct.len() < 3 {
        return Err(Error::Validation(format!(
            "polygon ring with only {} distinct vertices",
            distinct.len()
        )));
    }
    Ok(())
}

fn polygon_from_rings(mut rings: Vec<Vec<Coord<f64>>>) -> Result<Polygon<f64>> {
    let exterior = LineString::from(rings.remove(0));
    let interiors = rings.into_iter().map(LineString::from).collect();
    Ok(Polygon::new(exterior, interiors))
}

fn zone_descriptor(zone: &ZonePolygon) -> String {
    let mut parts: Vec<String> = zone
        .area
        .0
        .iter()
        .map(|polygon| {
            // OGC winding (exterior CCW, interiors CW) makes the descriptor
            // invariant under ring reversal.
            let oriented = polygon.orient(Direction::Default);
            let exterior = canonical_ring(oriented.exterior());
            let mut interiors: Vec<String> =
                oriented.interiors().iter().map(canonical_ring).collect();
            interiors.sort();
            if interiors.is_empty() {
                exterior
            } else {
                format!("{exterior}|{}", interiors.join("|"))
            }
        })
        .collect();
    parts.sort();

    format!(
        "inside={};crossing={};{}",
        zone.penalize_inside as u8,
        zone.penalize_crossing as u8,
        parts.join("&")
    )
}

/// Fixed 7-decimal precision, closing duplicate dropped, rotated so the
/// lexicographically smallest vertex comes first.
fn canonical_ring(ring: &LineString<f64>) -> String {
    let mut points: Vec<String> = ring
        .coords()
        .map(|c| format!("{:.7},{:.7}", c.x, c.y))
        .collect();
    if points.len() > 1 && points.first() == points.last() {
        points.pop();
    }
    if let Some(min_idx) = points
        .iter()
        .enumerate()
        .min_by(|a, b| a.1.cmp(b.1))
        .map(|(i, _)| i)
    {
        points.rotate_left(min_idx);
    }
    points.join(" ")
}
