//! Regions of interest: shapes, masks and statistics.
mod geometry;
mod stats;

pub use geometry::{rasterize, Mask, Point, Roi, RoiGeometry, RoiKind};
pub use stats::{median_of_sorted, roi_statistics, RoiStatistics, Summary};
