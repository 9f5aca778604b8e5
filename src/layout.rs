//! Packed 3D grid layout.
//!
//! An N³ voxel grid is stored in a 2D texel address space by tiling its
//! Z-slices into a `slices_per_row` grid: slice `z` lands at tile
//! `(z % s, z / s)`, so the 2D extent is `N·s` by `N·ceil(N/s)`. Every
//! grid kernel addresses storage through this one mapping; the same
//! arithmetic exists here for the host and in [`PACKED_WGSL`] for
//! shaders.

use crate::error::CoreError;

/// Layout of one N³ grid packed into a 2D texel space.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PackedLayout {
    n: u32,
    slices_per_row: u32,
}

impl PackedLayout {
    /// Build a layout for an `n`³ grid with `slices_per_row` Z-slices per
    /// tile row. `slices_per_row` must lie in `[1, n]`.
    pub fn new(n: u32, slices_per_row: u32) -> Result<Self, CoreError> {
        if n == 0 {
            return Err(CoreError::InvalidConfig("grid size must be at least 1".into()));
        }
        if slices_per_row == 0 || slices_per_row > n {
            return Err(CoreError::InvalidConfig(format!(
                "slices_per_row {} must lie in [1, {}]",
                slices_per_row, n
            )));
        }
        Ok(Self { n, slices_per_row })
    }

    pub fn n(&self) -> u32 {
        self.n
    }

    pub fn slices_per_row(&self) -> u32 {
        self.slices_per_row
    }

    /// Rows of Z-slice tiles.
    pub fn slice_rows(&self) -> u32 {
        self.n.div_ceil(self.slices_per_row)
    }

    pub fn tex_width(&self) -> u32 {
        self.n * self.slices_per_row
    }

    pub fn tex_height(&self) -> u32 {
        self.n * self.slice_rows()
    }

    /// Number of voxels in the grid.
    pub fn voxel_count(&self) -> u32 {
        self.n * self.n * self.n
    }

    /// Number of texels in the 2D address space. Exceeds `voxel_count`
    /// when `slices_per_row` does not divide `n`; the excess texels are
    /// padding and stay zero.
    pub fn texel_count(&self) -> u32 {
        self.tex_width() * self.tex_height()
    }

    /// Map a voxel to its texel.
    pub fn voxel_to_texel(&self, v: [u32; 3]) -> [u32; 2] {
        debug_assert!(v[0] < self.n && v[1] < self.n && v[2] < self.n);
        let col = v[2] % self.slices_per_row;
        let row = v[2] / self.slices_per_row;
        [col * self.n + v[0], row * self.n + v[1]]
    }

    /// Map a texel back to its voxel. Returns `None` for padding texels
    /// (tiles beyond slice `n - 1`).
    pub fn texel_to_voxel(&self, t: [u32; 2]) -> Option<[u32; 3]> {
        debug_assert!(t[0] < self.tex_width() && t[1] < self.tex_height());
        let col = t[0] / self.n;
        let row = t[1] / self.n;
        let z = row * self.slices_per_row + col;
        if z >= self.n {
            return None;
        }
        Some([t[0] % self.n, t[1] % self.n, z])
    }

    /// Linear storage index of a voxel (row-major over the texel space).
    pub fn voxel_index(&self, v: [u32; 3]) -> u32 {
        let t = self.voxel_to_texel(v);
        t[1] * self.tex_width() + t[0]
    }

    /// The layout one octree level up: half the grid size, half the
    /// slices per row (floored to 1).
    pub fn parent(&self) -> Option<PackedLayout> {
        if self.n < 2 {
            return None;
        }
        Some(PackedLayout {
            n: self.n / 2,
            slices_per_row: (self.slices_per_row / 2).max(1),
        })
    }
}

/// The per-level layouts and storage offsets of an octree pyramid.
///
/// All levels of one moment attachment share a single buffer; level `i`
/// occupies `texel_count(i)` elements starting at `offsets[i]`. Level 0
/// is the finest grid, level `num_levels - 1` the 1³ root.
#[derive(Clone, Debug)]
pub struct LevelSet {
    layouts: Vec<PackedLayout>,
    offsets: Vec<u32>,
    total: u32,
}

/// Hard cap on pyramid depth; bounds the traversal's level table.
pub const MAX_LEVELS: u32 = 12;

impl LevelSet {
    /// Build the pyramid geometry for `num_levels` levels over a base
    /// grid of size `2^(num_levels - 1)`.
    pub fn new(num_levels: u32, slices_per_row: u32) -> Result<Self, CoreError> {
        if num_levels < 2 || num_levels > MAX_LEVELS {
            return Err(CoreError::InvalidConfig(format!(
                "num_levels {} must lie in [2, {}]",
                num_levels, MAX_LEVELS
            )));
        }
        let n0 = 1u32 << (num_levels - 1);
        let mut layouts = Vec::with_capacity(num_levels as usize);
        let mut offsets = Vec::with_capacity(num_levels as usize);
        let mut layout = PackedLayout::new(n0, slices_per_row)?;
        let mut total = 0u32;
        for _ in 0..num_levels {
            layouts.push(layout);
            offsets.push(total);
            total += layout.texel_count();
            layout = layout.parent().unwrap_or(layout);
        }
        Ok(Self { layouts, offsets, total })
    }

    pub fn num_levels(&self) -> u32 {
        self.layouts.len() as u32
    }

    pub fn layout(&self, level: u32) -> PackedLayout {
        self.layouts[level as usize]
    }

    pub fn offset(&self, level: u32) -> u32 {
        self.offsets[level as usize]
    }

    /// Total elements across all levels; the per-attachment buffer length.
    pub fn total_texels(&self) -> u32 {
        self.total
    }

    pub fn finest(&self) -> PackedLayout {
        self.layouts[0]
    }
}

/// WGSL transliteration of the packed-layout mapping. Spliced into every
/// grid kernel; must stay in lockstep with the host functions above.
pub const PACKED_WGSL: &str = r#"
fn voxel_to_texel(v: vec3<u32>, n: u32, s: u32) -> vec2<u32> {
    let col = v.z % s;
    let row = v.z / s;
    return vec2<u32>(col * n + v.x, row * n + v.y);
}

fn voxel_index(v: vec3<u32>, n: u32, s: u32) -> u32 {
    let t = voxel_to_texel(v, n, s);
    return t.y * (n * s) + t.x;
}

// Voxel ordinal (0..n^3) to coordinates; dispatch order, not texel order.
fn ordinal_to_voxel(i: u32, n: u32) -> vec3<u32> {
    return vec3<u32>(i % n, (i / n) % n, i / (n * n));
}
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_bad_geometry() {
        assert!(PackedLayout::new(0, 1).is_err());
        assert!(PackedLayout::new(8, 0).is_err());
        assert!(PackedLayout::new(8, 9).is_err());
        assert!(PackedLayout::new(8, 8).is_ok());
    }

    #[test]
    fn texel_extents_match_definition() {
        let l = PackedLayout::new(16, 4).unwrap();
        assert_eq!(l.tex_width(), 64);
        assert_eq!(l.tex_height(), 64);
        assert_eq!(l.texel_count(), l.voxel_count());

        // 3 slices per row over 8 slices leaves a padded tile row.
        let l = PackedLayout::new(8, 3).unwrap();
        assert_eq!(l.slice_rows(), 3);
        assert_eq!(l.tex_width(), 24);
        assert_eq!(l.tex_height(), 24);
        assert!(l.texel_count() > l.voxel_count());
    }

    #[test]
    fn voxel_texel_bijection() {
        for (n, s) in [(4u32, 1u32), (4, 2), (8, 3), (8, 8), (16, 4)] {
            let l = PackedLayout::new(n, s).unwrap();
            for z in 0..n {
                for y in 0..n {
                    for x in 0..n {
                        let t = l.voxel_to_texel([x, y, z]);
                        assert_eq!(l.texel_to_voxel(t), Some([x, y, z]), "n={} s={}", n, s);
                    }
                }
            }
        }
    }

    #[test]
    fn voxel_indices_are_unique() {
        let l = PackedLayout::new(8, 3).unwrap();
        let mut seen = std::collections::HashSet::new();
        for z in 0..8 {
            for y in 0..8 {
                for x in 0..8 {
                    let i = l.voxel_index([x, y, z]);
                    assert!(i < l.texel_count());
                    assert!(seen.insert(i));
                }
            }
        }
    }

    #[test]
    fn padding_texels_map_to_none() {
        let l = PackedLayout::new(8, 3).unwrap();
        // Tile (2, 2) would hold slice 8, which does not exist.
        assert_eq!(l.texel_to_voxel([2 * 8, 2 * 8]), None);
    }

    #[test]
    fn parent_halves_grid_and_slices() {
        let l = PackedLayout::new(16, 4).unwrap();
        let p = l.parent().unwrap();
        assert_eq!(p.n(), 8);
        assert_eq!(p.slices_per_row(), 2);
        let root = PackedLayout::new(1, 1).unwrap();
        assert!(root.parent().is_none());
    }

    #[test]
    fn level_set_offsets_are_cumulative() {
        let ls = LevelSet::new(5, 4).unwrap();
        assert_eq!(ls.num_levels(), 5);
        assert_eq!(ls.finest().n(), 16);
        assert_eq!(ls.layout(4).n(), 1);
        let mut expect = 0;
        for i in 0..5 {
            assert_eq!(ls.offset(i), expect);
            expect += ls.layout(i).texel_count();
        }
        assert_eq!(ls.total_texels(), expect);
    }

    #[test]
    fn level_set_rejects_out_of_range_depth() {
        assert!(LevelSet::new(1, 1).is_err());
        assert!(LevelSet::new(MAX_LEVELS + 1, 1).is_err());
    }
}
