use std::collections::{BTreeSet, HashMap};

use log::debug;

use super::{IndexKind, IndexStats, SpatialIndex};
use crate::geometry::Envelope;

/// Default cell counts of a uniform grid.
const DEFAULT_GRID_WIDTH: usize = 100;
const DEFAULT_GRID_HEIGHT: usize = 100;

/// Uniform grid index. Cells own the ids of every feature whose
/// envelope intersects them; a single very large footprint is capped by
/// boundary sampling or a nine-cell pattern, with the id kept on an
/// overflow list so queries never miss it.
pub struct GridIndex {
    extent: Envelope,
    cell_width: f64,
    cell_height: f64,
    columns: usize,
    rows: usize,
    cells: HashMap<(usize, usize), Vec<i64>>,
    envelopes: HashMap<i64, Envelope>,
    oversized: Vec<i64>,
}

impl GridIndex {
    pub fn uniform(extent: Envelope) -> Self {
        Self::with_grid_shape(extent, DEFAULT_GRID_WIDTH, DEFAULT_GRID_HEIGHT)
    }

    pub fn with_grid_shape(extent: Envelope, grid_width: usize, grid_height: usize) -> Self {
        let columns = grid_width.max(1);
        let rows = grid_height.max(1);
        let cell_width = positive(extent.width() / columns as f64);
        let cell_height = positive(extent.height() / rows as f64);
        Self::from_cells(extent, cell_width, cell_height, columns, rows)
    }

    /// Cell size chosen so one very long geometry cannot explode the
    /// cell table: coarse buckets by layer extent, floored at 1.0, with
    /// a safety cell derived from the estimated largest geometry.
    pub fn adaptive(extent: Envelope, tolerance: f64) -> Self {
        let max_dim = extent.width().max(extent.height());
        let estimated_max_geometry_extent = max_dim * 0.05;
        let safe_cell = estimated_max_geometry_extent / 100.0;
        let base = if max_dim > 100_000.0 {
            max_dim / 100.0
        } else if max_dim > 10_000.0 {
            max_dim / 500.0
        } else if max_dim > 1_000.0 {
            (tolerance * 100.0).max(safe_cell)
        } else {
            (tolerance * 10.0).max(safe_cell)
        };
        let cell = base.max(1.0);
        let columns = ((extent.width() / cell).ceil() as usize).max(1);
        let rows = ((extent.height() / cell).ceil() as usize).max(1);
        debug!(
            "adaptive grid: extent {max_dim:.0}, cell {cell:.2}, {columns}x{rows} cells"
        );
        Self::from_cells(extent, cell, cell, columns, rows)
    }

    fn from_cells(
        extent: Envelope,
        cell_width: f64,
        cell_height: f64,
        columns: usize,
        rows: usize,
    ) -> Self {
        GridIndex {
            extent,
            cell_width,
            cell_height,
            columns,
            rows,
            cells: HashMap::new(),
            envelopes: HashMap::new(),
            oversized: Vec::new(),
        }
    }

    pub(crate) fn entry_map(&self) -> &HashMap<i64, Envelope> {
        &self.envelopes
    }

    pub fn cell_size(&self) -> (f64, f64) {
        (self.cell_width, self.cell_height)
    }

    /// Dynamic cap on the number of cells one insertion may touch.
    fn cell_threshold(&self) -> u64 {
        let cell = self.cell_width.min(self.cell_height);
        if cell >= 10.0 {
            500_000
        } else if cell >= 1.0 {
            250_000
        } else {
            100_000
        }
    }

    fn cell_of(&self, x: f64, y: f64) -> (usize, usize) {
        let column = ((x - self.extent.min_x()) / self.cell_width).floor() as i64;
        let row = ((y - self.extent.min_y()) / self.cell_height).floor() as i64;
        (
            column.clamp(0, self.columns as i64 - 1) as usize,
            row.clamp(0, self.rows as i64 - 1) as usize,
        )
    }

    fn cell_range(&self, envelope: &Envelope) -> (usize, usize, usize, usize) {
        let (c0, r0) = self.cell_of(envelope.min_x(), envelope.min_y());
        let (c1, r1) = self.cell_of(envelope.max_x(), envelope.max_y());
        (c0, r0, c1, r1)
    }

    /// Cell keys for one insertion, capped per the dynamic threshold.
    /// Returns the keys and whether the footprint was capped.
    fn insertion_cells(&self, envelope: &Envelope) -> (BTreeSet<(usize, usize)>, bool) {
        let (c0, r0, c1, r1) = self.cell_range(envelope);
        let span_x = (c1 - c0 + 1) as u64;
        let span_y = (r1 - r0 + 1) as u64;
        let footprint = span_x * span_y;
        let threshold = self.cell_threshold();
        let mut keys = BTreeSet::new();

        if footprint <= threshold {
            for column in c0..=c1 {
                for row in r0..=r1 {
                    let _new = keys.insert((column, row));
                }
            }
            return (keys, false);
        }

        let center = ((c0 + c1) / 2, (r0 + r1) / 2);
        if footprint <= threshold * 5 {
            // Boundary sampling: walk the four envelope edges at a
            // sqrt(threshold)-derived stride, plus the centre cell.
            let span_max = span_x.max(span_y) as f64;
            let stride = ((span_max / (threshold as f64).sqrt()).ceil() as usize).max(1);
            for column in (c0..=c1).step_by(stride).chain(std::iter::once(c1)) {
                let _top = keys.insert((column, r0));
                let _bottom = keys.insert((column, r1));
            }
            for row in (r0..=r1).step_by(stride).chain(std::iter::once(r1)) {
                let _left = keys.insert((c0, row));
                let _right = keys.insert((c1, row));
            }
            let _center = keys.insert(center);
        } else {
            // Nine representative cells in a 3x3 pattern around the
            // centre, spaced a quarter of the envelope dimension.
            let offset_x = ((span_x / 4) as usize).max(1);
            let offset_y = ((span_y / 4) as usize).max(1);
            for dx in [-1i64, 0, 1] {
                for dy in [-1i64, 0, 1] {
                    let column = (center.0 as i64 + dx * offset_x as i64)
                        .clamp(c0 as i64, c1 as i64) as usize;
                    let row = (center.1 as i64 + dy * offset_y as i64)
                        .clamp(r0 as i64, r1 as i64) as usize;
                    let _representative = keys.insert((column, row));
                }
            }
        }
        (keys, true)
    }
}

impl SpatialIndex for GridIndex {
    fn insert(&mut self, fid: i64, envelope: Envelope) {
        if envelope.is_empty() {
            return;
        }
        let _previous = self.envelopes.insert(fid, envelope);
        let (keys, capped) = self.insertion_cells(&envelope);
        if capped {
            debug!(
                "grid insert of feature {fid} capped to {} cells",
                keys.len()
            );
            self.oversized.push(fid);
        }
        for key in keys {
            self.cells.entry(key).or_default().push(fid);
        }
    }

    fn remove(&mut self, fid: i64) {
        let _removed = self.envelopes.remove(&fid);
        self.oversized.retain(|kept| *kept != fid);
    }

    fn query(&self, envelope: &Envelope) -> Vec<i64> {
        if envelope.is_empty() {
            return Vec::new();
        }
        let (c0, r0, c1, r1) = self.cell_range(envelope);
        let range_size = (c1 - c0 + 1) as u64 * (r1 - r0 + 1) as u64;
        let mut hits: Vec<i64> = Vec::new();
        if range_size <= self.cells.len() as u64 {
            for column in c0..=c1 {
                for row in r0..=r1 {
                    if let Some(cell) = self.cells.get(&(column, row)) {
                        hits.extend_from_slice(cell);
                    }
                }
            }
        } else {
            // Walking the occupied cells beats enumerating a huge range.
            for ((column, row), cell) in &self.cells {
                if (c0..=c1).contains(column) && (r0..=r1).contains(row) {
                    hits.extend_from_slice(cell);
                }
            }
        }
        hits.extend_from_slice(&self.oversized);
        hits.retain(|fid| {
            self.envelopes
                .get(fid)
                .is_some_and(|stored| stored.intersects(envelope))
        });
        hits.sort_unstable();
        hits.dedup();
        hits
    }

    fn count(&self) -> usize {
        self.envelopes.len()
    }

    fn clear(&mut self) {
        self.cells.clear();
        self.envelopes.clear();
        self.oversized.clear();
    }

    fn envelope_of(&self, fid: i64) -> Option<Envelope> {
        self.envelopes.get(&fid).copied()
    }

    fn stats(&self) -> IndexStats {
        IndexStats {
            kind: IndexKind::Grid,
            entries: self.envelopes.len(),
            nodes: self.cells.len(),
            depth: 1,
        }
    }
}

fn positive(value: f64) -> f64 {
    if value.is_finite() && value > 0.0 {
        value
    } else {
        1.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adaptive_cell_size_follows_extent_buckets() {
        let country = GridIndex::adaptive(Envelope::new(0.0, 0.0, 500_000.0, 400_000.0), 1e-3);
        assert!((country.cell_size().0 - 5_000.0).abs() < 1e-9);
        let city = GridIndex::adaptive(Envelope::new(0.0, 0.0, 50_000.0, 50_000.0), 1e-3);
        assert!((city.cell_size().0 - 100.0).abs() < 1e-9);
        let block = GridIndex::adaptive(Envelope::new(0.0, 0.0, 500.0, 500.0), 1e-3);
        // Floored at 1.0.
        assert!((block.cell_size().0 - 1.0).abs() < 1e-9);
    }

    #[test]
    fn giant_footprint_is_capped_but_still_found() {
        // Cells of 0.001 over a 1000-unit extent: a full-extent envelope
        // would cover 1e12 cells.
        let mut grid =
            GridIndex::from_cells(Envelope::new(0.0, 0.0, 1000.0, 1000.0), 0.001, 0.001, 1_000_000, 1_000_000);
        let giant = Envelope::new(0.0, 0.0, 1000.0, 1000.0);
        grid.insert(42, giant);
        assert!(grid.stats().nodes <= 9, "nine-cell pattern expected");
        let hits = grid.query(&giant);
        assert_eq!(hits, vec![42]);
        // A small probe far from any representative cell still finds it.
        let hits = grid.query(&Envelope::new(123.0, 456.0, 123.1, 456.1));
        assert_eq!(hits, vec![42]);
    }

    #[test]
    fn boundary_sampling_touches_every_edge() {
        // Cell 0.01 over 2000 units: threshold 100k; a 1500x1000 unit
        // envelope covers 150000x100000... too big; use a narrower one
        // whose footprint sits between the threshold and five times it.
        let mut grid =
            GridIndex::from_cells(Envelope::new(0.0, 0.0, 2000.0, 2000.0), 0.01, 0.01, 200_000, 200_000);
        let wide = Envelope::new(0.0, 0.0, 20.0, 1.0);
        // 2000 x 100 cells = 200_000: above 100k, below 500k.
        let (keys, capped) = grid.insertion_cells(&wide);
        assert!(capped);
        assert!(keys.len() as u64 <= grid.cell_threshold() * 5);
        let (c0, r0, c1, r1) = grid.cell_range(&wide);
        assert!(keys.iter().any(|(_, row)| *row == r0));
        assert!(keys.iter().any(|(_, row)| *row == r1));
        assert!(keys.iter().any(|(column, _)| *column == c0));
        assert!(keys.iter().any(|(column, _)| *column == c1));
        grid.insert(7, wide);
        assert_eq!(grid.query(&wide), vec![7]);
    }

    #[test]
    fn uniform_grid_resolves_small_probes() {
        let mut grid = GridIndex::uniform(Envelope::new(0.0, 0.0, 100.0, 100.0));
        grid.insert(1, Envelope::new(10.0, 10.0, 12.0, 12.0));
        grid.insert(2, Envelope::new(80.0, 80.0, 82.0, 82.0));
        assert_eq!(grid.query(&Envelope::new(11.0, 11.0, 11.5, 11.5)), vec![1]);
        assert_eq!(grid.query(&Envelope::new(0.0, 0.0, 100.0, 100.0)), vec![1, 2]);
        assert!(grid.query(&Envelope::new(40.0, 40.0, 50.0, 50.0)).is_empty());
    }
}
