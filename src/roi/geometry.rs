//! ROI shapes and their rasterization into pixel masks.
//!
//! Coordinates are in pixel units with pixel `(x, y)` centred on
//! the point `(x, y)`. Every membership test below is evaluated at
//! pixel centres and every mask is clipped to the matrix.
use itertools::iproduct;
use ndarray::{Array2, ArrayView2};
use serde_derive::*;
use uuid::Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Point { x, y }
    }

    fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoiKind {
    Rectangle,
    Spot,
    Polygon,
}

impl RoiKind {
    /// Prefix of the names given to unnamed ROIs.
    pub fn name_prefix(&self) -> &'static str {
        match self {
            RoiKind::Rectangle => "ROI",
            RoiKind::Spot => "Spot",
            RoiKind::Polygon => "Polygon",
        }
    }
}

/// Shape of a region of interest.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RoiGeometry {
    /// Axis aligned rectangle spanned by two opposite corners, in
    /// any order. Both edges are inclusive.
    Rectangle { a: Point, b: Point },
    /// Disk; the boundary is inclusive.
    Spot { center: Point, radius: f64 },
    /// Closed polygon, possibly concave or self-intersecting,
    /// filled with the even-odd rule.
    Polygon { vertices: Vec<Point> },
}

impl RoiGeometry {
    pub fn kind(&self) -> RoiKind {
        match self {
            RoiGeometry::Rectangle { .. } => RoiKind::Rectangle,
            RoiGeometry::Spot { .. } => RoiKind::Spot,
            RoiGeometry::Polygon { .. } => RoiKind::Polygon,
        }
    }

    /// Smallest `(min, max)` corners enclosing the shape, `None`
    /// for shapes that can select no pixel.
    pub fn bounding_box(&self) -> Option<(Point, Point)> {
        match self {
            RoiGeometry::Rectangle { a, b } => {
                if !a.is_finite() || !b.is_finite() || a.x == b.x || a.y == b.y {
                    return None;
                }
                Some((
                    Point::new(a.x.min(b.x), a.y.min(b.y)),
                    Point::new(a.x.max(b.x), a.y.max(b.y)),
                ))
            }
            RoiGeometry::Spot { center, radius } => {
                if !center.is_finite() || !radius.is_finite() || *radius < 0. {
                    return None;
                }
                Some((
                    Point::new(center.x - radius, center.y - radius),
                    Point::new(center.x + radius, center.y + radius),
                ))
            }
            RoiGeometry::Polygon { vertices } => {
                let vertices = effective_vertices(vertices)?;
                let init = (vertices[0], vertices[0]);
                Some(vertices.iter().fold(init, |(lo, hi), p| {
                    (
                        Point::new(lo.x.min(p.x), lo.y.min(p.y)),
                        Point::new(hi.x.max(p.x), hi.y.max(p.y)),
                    )
                }))
            }
        }
    }

    /// Moves the shape by `(dx, dy)`.
    pub fn translate(&mut self, dx: f64, dy: f64) {
        let shift = |p: &mut Point| {
            p.x += dx;
            p.y += dy;
        };
        match self {
            RoiGeometry::Rectangle { a, b } => {
                shift(a);
                shift(b);
            }
            RoiGeometry::Spot { center, .. } => shift(center),
            RoiGeometry::Polygon { vertices } => vertices.iter_mut().for_each(shift),
        }
    }
}

/// Vertices with consecutive repeats (and a repeated closing
/// vertex) removed; `None` if fewer than three remain or any is
/// not finite.
fn effective_vertices(vertices: &[Point]) -> Option<Vec<Point>> {
    if vertices.iter().any(|p| !p.is_finite()) {
        return None;
    }
    let mut out: Vec<Point> = Vec::with_capacity(vertices.len());
    for p in vertices {
        if out.last() != Some(p) {
            out.push(*p);
        }
    }
    while out.len() > 1 && out.first() == out.last() {
        out.pop();
    }
    if out.len() < 3 {
        None
    } else {
        Some(out)
    }
}

// Even-odd crossing test along a ray towards +x.
fn polygon_contains(vertices: &[Point], px: f64, py: f64) -> bool {
    let mut inside = false;
    let mut j = vertices.len() - 1;
    for i in 0..vertices.len() {
        let (vi, vj) = (vertices[i], vertices[j]);
        if (vi.y > py) != (vj.y > py) && px < (vj.x - vi.x) * (py - vi.y) / (vj.y - vi.y) + vi.x {
            inside = !inside;
        }
        j = i;
    }
    inside
}

/// A region of interest as stored in a session.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Roi {
    pub id: Uuid,
    pub name: String,
    pub geometry: RoiGeometry,
    /// Emissivity used instead of the global one for this region.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub emissivity: Option<f64>,
    /// Presentation data owned by the UI (colour, label placement).
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub style: serde_json::Value,
}

impl Roi {
    pub fn new(name: impl Into<String>, geometry: RoiGeometry) -> Self {
        Roi {
            id: Uuid::new_v4(),
            name: name.into(),
            geometry,
            emissivity: None,
            style: serde_json::Value::Null,
        }
    }

    pub fn kind(&self) -> RoiKind {
        self.geometry.kind()
    }
}

/// Pixel membership of a ROI over a `width x height` matrix.
#[derive(Clone, Debug, PartialEq)]
pub struct Mask {
    members: Array2<bool>,
    count: usize,
}

impl Mask {
    pub fn empty(width: usize, height: usize) -> Self {
        Mask {
            members: Array2::from_elem((height, width), false),
            count: 0,
        }
    }

    /// Mask selecting every pixel.
    pub fn full(width: usize, height: usize) -> Self {
        Mask {
            members: Array2::from_elem((height, width), true),
            count: width * height,
        }
    }

    pub fn width(&self) -> usize {
        self.members.ncols()
    }

    pub fn height(&self) -> usize {
        self.members.nrows()
    }

    pub fn pixel_count(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn contains(&self, x: usize, y: usize) -> bool {
        self.members.get((y, x)).copied().unwrap_or(false)
    }

    /// Member pixels as `(x, y)`, row by row.
    pub fn pixels(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.members
            .indexed_iter()
            .filter(|(_, member)| **member)
            .map(|((row, col), _)| (col, row))
    }

    pub fn view(&self) -> ArrayView2<'_, bool> {
        self.members.view()
    }

    fn insert(&mut self, x: usize, y: usize) {
        let cell = &mut self.members[(y, x)];
        if !*cell {
            *cell = true;
            self.count += 1;
        }
    }
}

/// Clips the closed interval `[lo, hi]` to pixel indices `0..len`.
fn pixel_span(lo: f64, hi: f64, len: usize) -> Option<(usize, usize)> {
    if len == 0 {
        return None;
    }
    let first = lo.ceil().max(0.);
    let last = hi.floor().min((len - 1) as f64);
    if first > last {
        None
    } else {
        Some((first as usize, last as usize))
    }
}

/// Computes the pixels of a `width x height` matrix covered by
/// `geometry`. Degenerate shapes yield an empty mask.
pub fn rasterize(geometry: &RoiGeometry, width: usize, height: usize) -> Mask {
    let mut mask = Mask::empty(width, height);
    let (lo, hi) = match geometry.bounding_box() {
        Some(bbox) => bbox,
        None => return mask,
    };
    let (xs, ys) = match (pixel_span(lo.x, hi.x, width), pixel_span(lo.y, hi.y, height)) {
        (Some(xs), Some(ys)) => (xs, ys),
        _ => return mask,
    };
    let candidates = iproduct!(ys.0..=ys.1, xs.0..=xs.1);

    match geometry {
        RoiGeometry::Rectangle { .. } => {
            for (y, x) in candidates {
                mask.insert(x, y);
            }
        }
        RoiGeometry::Spot { center, radius } => {
            let r2 = radius * radius;
            for (y, x) in candidates {
                let dx = x as f64 - center.x;
                let dy = y as f64 - center.y;
                if dx * dx + dy * dy <= r2 {
                    mask.insert(x, y);
                }
            }
        }
        RoiGeometry::Polygon { vertices } => {
            // bounding_box succeeded, so there are at least three.
            let vertices = match effective_vertices(vertices) {
                Some(v) => v,
                None => return mask,
            };
            for (y, x) in candidates {
                if polygon_contains(&vertices, x as f64, y as f64) {
                    mask.insert(x, y);
                }
            }
        }
    }
    mask
}
