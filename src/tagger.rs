//! Spatial tagger: classifies every road segment against the zone index and
//! rewrites the dataset with penalty tags.
//!
//! The emitted dataset preserves input order exactly. Classification is
//! parallelized across segments (the zone index is read-only), then results
//! are re-serialized in input order, so the output is byte-identical to a
//! sequential pass.

use geo::{Coord, LineString};
use rayon::prelude::*;

use crate::dataset::{DatasetSink, MapDataset, RoadSegment};
use crate::error::{Error, Result};
use crate::index::{Classification, ZoneIndex};

/// Penalty factor for segments fully inside a containment-eligible zone.
pub const INSIDE_FACTOR: f64 = 0.02;
/// Penalty factor for segments touching or crossing a boundary-eligible zone.
pub const CROSSING_FACTOR: f64 = 0.10;

/// Marker tag added to every penalized way.
pub const MARKER_TAG: &str = "avoid_zone";
/// Factor tag; the routing profile reads this to scale the way's speed.
pub const FACTOR_TAG: &str = "avoid_factor";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TagStats {
    pub ways: usize,
    pub roads: usize,
    pub contained: usize,
    pub boundary: usize,
    pub skipped_unresolved: usize,
    pub skipped_degenerate: usize,
}

impl TagStats {
    pub fn tagged(&self) -> usize {
        self.contained + self.boundary
    }
}

enum SegmentOutcome {
    NotRoad,
    Unresolved,
    Degenerate,
    Classified(Classification),
}

/// Rewrite the dataset through `sink`, adding penalty tags to road segments
/// that relate to a zone. Non-road elements and unclassifiable segments pass
/// through unchanged.
pub fn retag(
    dataset: &MapDataset,
    index: &ZoneIndex,
    sink: &mut dyn DatasetSink,
) -> Result<TagStats> {
    let outcomes: Vec<SegmentOutcome> = dataset
        .ways
        .par_iter()
        .map(|way| classify_segment(dataset, index, way))
        .collect();

    for node in &dataset.nodes {
        sink.node(node).map_err(sink_error)?;
    }

    let mut stats = TagStats::default();
    for (way, outcome) in dataset.ways.iter().zip(&outcomes) {
        stats.ways += 1;
        match outcome {
            SegmentOutcome::NotRoad => {
                sink.way(way).map_err(sink_error)?;
            }
            SegmentOutcome::Unresolved => {
                stats.roads += 1;
                stats.skipped_unresolved += 1;
                tracing::debug!(way = way.id, "skipping segment with unresolvable node");
                sink.way(way).map_err(sink_error)?;
            }
            SegmentOutcome::Degenerate => {
                stats.roads += 1;
                stats.skipped_degenerate += 1;
                tracing::debug!(way = way.id, "skipping degenerate segment geometry");
                sink.way(way).map_err(sink_error)?;
            }
            SegmentOutcome::Classified(classification) => {
                stats.roads += 1;
                match classification {
                    Classification::Clear => sink.way(way).map_err(sink_error)?,
                    Classification::Contained => {
                        stats.contained += 1;
                        sink.way(&penalized(way, INSIDE_FACTOR)).map_err(sink_error)?;
                    }
                    Classification::Boundary => {
                        stats.boundary += 1;
                        sink.way(&penalized(way, CROSSING_FACTOR))
                            .map_err(sink_error)?;
                    }
                }
            }
        }
    }

    for relation in &dataset.relations {
        sink.relation(relation).map_err(sink_error)?;
    }
    sink.finish().map_err(sink_error)?;

    tracing::info!(
        roads = stats.roads,
        contained = stats.contained,
        boundary = stats.boundary,
        skipped = stats.skipped_unresolved + stats.skipped_degenerate,
        zones = index.zone_count(),
        "tagging pass complete"
    );

    Ok(stats)
}

fn classify_segment(
    dataset: &MapDataset,
    index: &ZoneIndex,
    way: &RoadSegment,
) -> SegmentOutcome {
    if !way.is_road() {
        return SegmentOutcome::NotRoad;
    }

    let mut coords = Vec::with_capacity(way.node_refs.len());
    for node_ref in &way.node_refs {
        match dataset.node_location(*node_ref) {
            Some((lat, lon)) => coords.push(Coord { x: lon, y: lat }),
            None => return SegmentOutcome::Unresolved,
        }
    }

    let mut distinct = 0;
    let mut previous: Option<Coord<f64>> = None;
    for coord in &coords {
        if previous != Some(*coord) {
            distinct += 1;
        }
        previous = Some(*coord);
    }
    if distinct < 2 {
        return SegmentOutcome::Degenerate;
    }

    SegmentOutcome::Classified(index.classify(&LineString::from(coords)))
}

/// Original tags are preserved; only the marker and factor keys are
/// added or overwritten.
fn penalized(way: &RoadSegment, factor: f64) -> RoadSegment {
    let mut tagged = way.clone();
    tagged
        .tags
        .insert(MARKER_TAG.to_string(), "yes".to_string());
    tagged
        .tags
        .insert(FACTOR_TAG.to_string(), format!("{factor:.4}"));
    tagged
}

fn sink_error(e: std::io::Error) -> Error {
    Error::stage("tagging", format!("failed to write tagged dataset: {e}"))
}
