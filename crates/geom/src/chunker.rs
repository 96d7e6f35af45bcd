//! Striping grid and chunk enumeration.
//!
//! The sphere is cut into latitude stripes; each stripe is cut into chunks
//! whose count shrinks toward the poles so chunks stay roughly square. Chunk
//! ids are `stripe * 2 * stripes + chunk_in_stripe`, which keeps ids unique
//! and emission row-major (stripe ascending, then longitude ascending) for
//! reproducibility. The dispatcher is free to reorder.
//!
//! Sub-chunks form a `sub_stripes x sub_stripes` grid inside one chunk,
//! numbered row-major as well.

use serde::{Deserialize, Serialize};
use skyq_common::{ChunkId, SubChunkId};

use crate::region::{BoundingBox, Region};

/// One unit of per-chunk work emitted by the planner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkSpec {
    /// Chunk to scan.
    pub chunk_id: ChunkId,
    /// Sub-chunks to visit; empty means whole-chunk execution.
    pub sub_chunk_ids: Vec<SubChunkId>,
}

impl ChunkSpec {
    /// Whole-chunk work unit.
    pub fn whole(chunk_id: ChunkId) -> Self {
        Self {
            chunk_id,
            sub_chunk_ids: Vec::new(),
        }
    }
}

/// Maps spatial regions onto the stripe/chunk grid of one partitioning.
#[derive(Debug, Clone, Copy)]
pub struct Chunker {
    stripes: u32,
    sub_stripes: u32,
}

impl Chunker {
    /// Build a chunker for `stripes` latitude stripes with `sub_stripes`
    /// sub-divisions per chunk edge.
    pub fn new(stripes: u32, sub_stripes: u32) -> Self {
        Self {
            stripes: stripes.max(1),
            sub_stripes: sub_stripes.max(1),
        }
    }

    fn stripe_height(&self) -> f64 {
        180.0 / self.stripes as f64
    }

    /// Chunk count in one stripe; shrinks toward the poles.
    fn chunks_in_stripe(&self, stripe: u32) -> u32 {
        let h = self.stripe_height();
        let center_lat = -90.0 + (stripe as f64 + 0.5) * h;
        let n = (2.0 * self.stripes as f64 * center_lat.to_radians().cos()).floor();
        (n as u32).max(1)
    }

    fn chunk_id(&self, stripe: u32, chunk_in_stripe: u32) -> ChunkId {
        ChunkId(stripe * 2 * self.stripes + chunk_in_stripe)
    }

    /// Every chunk of the grid in emission order (full-scan path).
    pub fn all_chunks(&self) -> Vec<ChunkId> {
        let mut out = Vec::new();
        for stripe in 0..self.stripes {
            for c in 0..self.chunks_in_stripe(stripe) {
                out.push(self.chunk_id(stripe, c));
            }
        }
        out
    }

    /// Chunks whose bounds intersect `region`, in emission order.
    pub fn chunks_for(&self, region: &Region) -> Vec<ChunkId> {
        let bbox = region.bounding_box();
        let mut out = Vec::new();
        let h = self.stripe_height();
        for stripe in 0..self.stripes {
            let lat_lo = -90.0 + stripe as f64 * h;
            let lat_hi = lat_lo + h;
            if !bbox.overlaps_lat(lat_lo, lat_hi) {
                continue;
            }
            let n = self.chunks_in_stripe(stripe);
            let width = 360.0 / n as f64;
            for c in 0..n {
                let lon_lo = c as f64 * width;
                let lon_hi = lon_lo + width;
                if bbox.overlaps_lon(lon_lo, lon_hi) {
                    out.push(self.chunk_id(stripe, c));
                }
            }
        }
        out
    }

    /// Work units for `region`, optionally carrying intersecting sub-chunks.
    pub fn chunk_specs(&self, region: Option<&Region>, with_sub_chunks: bool) -> Vec<ChunkSpec> {
        let chunks = match region {
            Some(r) => self.chunks_for(r),
            None => self.all_chunks(),
        };
        chunks
            .into_iter()
            .map(|chunk_id| {
                if with_sub_chunks {
                    ChunkSpec {
                        chunk_id,
                        sub_chunk_ids: self.sub_chunks_for(chunk_id, region),
                    }
                } else {
                    ChunkSpec::whole(chunk_id)
                }
            })
            .collect()
    }

    /// Sub-chunks of `chunk_id` intersecting `region` (all of them when no
    /// region restricts the scan), numbered row-major in the sub grid.
    pub fn sub_chunks_for(&self, chunk_id: ChunkId, region: Option<&Region>) -> Vec<SubChunkId> {
        let Some(bounds) = self.chunk_bounds(chunk_id) else {
            return Vec::new();
        };
        let total = self.sub_stripes * self.sub_stripes;
        let Some(region) = region else {
            return (0..total).map(SubChunkId).collect();
        };
        let bbox = region.bounding_box();
        let dlat = (bounds.lat_max - bounds.lat_min) / self.sub_stripes as f64;
        let dlon = (bounds.lon_max - bounds.lon_min) / self.sub_stripes as f64;
        let mut out = Vec::new();
        for row in 0..self.sub_stripes {
            let lat_lo = bounds.lat_min + row as f64 * dlat;
            let lat_hi = lat_lo + dlat;
            if !bbox.overlaps_lat(lat_lo, lat_hi) {
                continue;
            }
            for col in 0..self.sub_stripes {
                let lon_lo = bounds.lon_min + col as f64 * dlon;
                let lon_hi = lon_lo + dlon;
                if bbox.overlaps_lon(lon_lo, lon_hi) {
                    out.push(SubChunkId(row * self.sub_stripes + col));
                }
            }
        }
        out
    }

    /// Geometric bounds of a chunk, or `None` for an id outside the grid.
    pub fn chunk_bounds(&self, chunk_id: ChunkId) -> Option<BoundingBox> {
        let stripe = chunk_id.0 / (2 * self.stripes);
        let chunk_in_stripe = chunk_id.0 % (2 * self.stripes);
        if stripe >= self.stripes || chunk_in_stripe >= self.chunks_in_stripe(stripe) {
            return None;
        }
        let h = self.stripe_height();
        let width = 360.0 / self.chunks_in_stripe(stripe) as f64;
        Some(BoundingBox {
            lon_min: chunk_in_stripe as f64 * width,
            lon_max: (chunk_in_stripe + 1) as f64 * width,
            lat_min: -90.0 + stripe as f64 * h,
            lat_max: -90.0 + (stripe + 1) as f64 * h,
        })
    }
}
