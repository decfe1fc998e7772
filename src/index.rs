//! Spatial index over zone polygons for one resolved configuration.
//!
//! An R-tree over zone bounding boxes narrows each segment to candidate
//! zones; the exact DE-9IM relation then decides containment vs crossing.
//! The index is immutable and built per rebuild job, so classification is a
//! pure function of (segment geometry, configuration).

use geo::algorithm::bounding_rect::BoundingRect;
use geo::algorithm::relate::Relate;
use geo::{LineString, Rect};
use rstar::{RTree, RTreeObject, AABB};

use crate::zones::{Configuration, ZonePolygon};

/// Penalty classification for one road segment. `Contained` strictly
/// dominates `Boundary`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Clear,
    Boundary,
    Contained,
}

struct ZoneEnvelope {
    zone: usize,
    aabb: AABB<[f64; 2]>,
}

impl RTreeObject for ZoneEnvelope {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        self.aabb
    }
}

pub struct ZoneIndex {
    zones: Vec<ZonePolygon>,
    tree: RTree<ZoneEnvelope>,
}

impl ZoneIndex {
    pub fn build(config: Configuration) -> Self {
        let mut envelopes = Vec::with_capacity(config.zones.len());
        for (zone, polygon) in config.zones.iter().enumerate() {
            if let Some(rect) = polygon.area.bounding_rect() {
                envelopes.push(ZoneEnvelope {
                    zone,
                    aabb: rect_to_aabb(&rect),
                });
            }
        }
        ZoneIndex {
            zones: config.zones,
            tree: RTree::bulk_load(envelopes),
        }
    }

    pub fn zone_count(&self) -> usize {
        self.zones.len()
    }

    /// Classify a segment polyline against every candidate zone.
    ///
    /// All candidates are evaluated; a containment match found late in
    /// candidate order must win over a boundary match found earlier, so
    /// breaking out of the loop on the first hit would make the result
    /// depend on R-tree iteration order.
    pub fn classify(&self, line: &LineString<f64>) -> Classification {
        let Some(rect) = line.bounding_rect() else {
            return Classification::Clear;
        };

        let mut any_contained = false;
        let mut any_boundary = false;
        for envelope in self.tree.locate_in_envelope_intersecting(&rect_to_aabb(&rect)) {
            let zone = &self.zones[envelope.zone];
            let relation = zone.area.relate(line);
            if zone.penalize_inside && relation.is_covers() {
                any_contained = true;
            }
            if zone.penalize_crossing && relation.is_intersects() {
                any_boundary = true;
            }
        }

        if any_contained {
            Classification::Contained
        } else if any_boundary {
            Classification::Boundary
        } else {
            Classification::Clear
        }
    }
}

fn rect_to_aabb(rect: &Rect<f64>) -> AABB<[f64; 2]> {
    AABB::from_corners([rect.min().x, rect.min().y], [rect.max().x, rect.max().y])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::zones::ZonePolygon;
    use geo::{polygon, Coord, MultiPolygon};

    fn square(min: f64, max: f64) -> MultiPolygon<f64> {
        MultiPolygon(vec![polygon![
            (x: min, y: min),
            (x: max, y: min),
            (x: max, y: max),
            (x: min, y: max),
            (x: min, y: min),
        ]])
    }

    fn zone(area: MultiPolygon<f64>, inside: bool, crossing: bool) -> ZonePolygon {
        ZonePolygon {
            area,
            penalize_inside: inside,
            penalize_crossing: crossing,
        }
    }

    fn index(zones: Vec<ZonePolygon>) -> ZoneIndex {
        ZoneIndex::build(Configuration { zones })
    }

    fn line(points: &[(f64, f64)]) -> LineString<f64> {
        LineString::from(
            points
                .iter()
                .map(|&(x, y)| Coord { x, y })
                .collect::<Vec<_>>(),
        )
    }

    #[test]
    fn segment_inside_zone_is_contained() {
        let idx = index(vec![zone(square(0.0, 10.0), true, true)]);
        let inside = line(&[(2.0, 2.0), (5.0, 5.0), (8.0, 8.0)]);
        assert_eq!(idx.classify(&inside), Classification::Contained);
    }

    #[test]
    fn segment_crossing_edge_is_boundary() {
        let idx = index(vec![zone(square(0.0, 10.0), true, true)]);
        let crossing = line(&[(5.0, 5.0), (15.0, 5.0)]);
        assert_eq!(idx.classify(&crossing), Classification::Boundary);
    }

    #[test]
    fn unrelated_segment_is_clear() {
        let idx = index(vec![zone(square(0.0, 10.0), true, true)]);
        let outside = line(&[(20.0, 20.0), (30.0, 30.0)]);
        assert_eq!(idx.classify(&outside), Classification::Clear);
    }

    #[test]
    fn bbox_overlap_without_geometric_relation_is_clear() {
        // A diagonal segment whose bounding box overlaps the zone's box but
        // whose geometry stays outside the polygon.
        let idx = index(vec![zone(square(0.0, 1.0), true, true)]);
        let near_miss = line(&[(0.9, 1.5), (1.5, 0.9)]);
        assert_eq!(idx.classify(&near_miss), Classification::Clear);
    }

    #[test]
    fn containment_dominates_boundary_across_zones() {
        // Contained in the first zone, touching the second: containment wins
        // regardless of candidate order.
        let idx = index(vec![
            zone(square(0.0, 10.0), true, true),
            zone(square(8.0, 20.0), true, true),
        ]);
        let segment = line(&[(1.0, 9.0), (9.0, 9.0)]);
        assert_eq!(idx.classify(&segment), Classification::Contained);

        let idx_swapped = index(vec![
            zone(square(8.0, 20.0), true, true),
            zone(square(0.0, 10.0), true, true),
        ]);
        assert_eq!(idx_swapped.classify(&segment), Classification::Contained);
    }

    #[test]
    fn containment_flag_disables_inside_rule() {
        // Crossing-only zone: a fully inside segment still intersects the
        // zone's area, so it downgrades to Boundary rather than Clear.
        let idx = index(vec![zone(square(0.0, 10.0), false, true)]);
        let inside = line(&[(2.0, 2.0), (8.0, 8.0)]);
        assert_eq!(idx.classify(&inside), Classification::Boundary);
    }

    #[test]
    fn crossing_flag_disables_boundary_rule() {
        let idx = index(vec![zone(square(0.0, 10.0), true, false)]);
        let crossing = line(&[(5.0, 5.0), (15.0, 5.0)]);
        assert_eq!(idx.classify(&crossing), Classification::Clear);
        let inside = line(&[(2.0, 2.0), (8.0, 8.0)]);
        assert_eq!(idx.classify(&inside), Classification::Contained);
    }

    #[test]
    fn segment_on_zone_edge_counts_as_covered() {
        // covers (not contains) so boundary-hugging segments count as inside.
        let idx = index(vec![zone(square(0.0, 10.0), true, true)]);
        let along_edge = line(&[(0.0, 2.0), (0.0, 8.0)]);
        assert_eq!(idx.classify(&along_edge), Classification::Contained);
    }
}
