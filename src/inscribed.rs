//! Inscribed rectangle of the projected display area
//!
//! The projector's full frame lands on the wall as a convex quadrilateral
//! A (top-left), B (top-right), C (bottom-right), D (bottom-left), y down.
//! The corrected image is the largest rectangle with the projector's aspect
//! ratio, axis-aligned in the wall frame, that fits inside it.
//!
//! Every keystone shape reduces to one of four contact configurations once it
//! is mirrored horizontally and/or vertically. The solver classifies by the
//! signs of the top, left and bottom edge slopes, solves in the normalized
//! orientation and mirrors the result back.

use nalgebra::{Point2, Vector2};
use serde::{Deserialize, Serialize};

use crate::error::{KeystoneError, Result};

/// Which rectangle to prefer when the two vertical sides differ in length
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FitMode {
    /// Largest image, anchored on the longer vertical side
    #[default]
    Biggest,
    /// Least shrink of the projector frame, anchored on the shorter side
    Sharpest,
}

impl FitMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            FitMode::Biggest => "biggest",
            FitMode::Sharpest => "sharpest",
        }
    }
}

impl std::str::FromStr for FitMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "biggest" => Ok(FitMode::Biggest),
            "sharpest" => Ok(FitMode::Sharpest),
            other => Err(format!("unknown fit mode '{}' (expected biggest or sharpest)", other)),
        }
    }
}

/// Four ordered points: top-left, top-right, bottom-right, bottom-left
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Quadrilateral {
    corners: [Point2<f64>; 4],
}

impl Quadrilateral {
    pub fn new(corners: [Point2<f64>; 4]) -> Self {
        Self { corners }
    }

    /// Axis-aligned rectangle from its top-left corner and size (y down)
    pub fn rectangle(top_left: Point2<f64>, width: f64, height: f64) -> Self {
        Self::new([
            top_left,
            Point2::new(top_left.x + width, top_left.y),
            Point2::new(top_left.x + width, top_left.y + height),
            Point2::new(top_left.x, top_left.y + height),
        ])
    }

    pub fn corners(&self) -> &[Point2<f64>; 4] {
        &self.corners
    }

    pub fn a(&self) -> Point2<f64> {
        self.corners[0]
    }

    pub fn b(&self) -> Point2<f64> {
        self.corners[1]
    }

    pub fn c(&self) -> Point2<f64> {
        self.corners[2]
    }

    pub fn d(&self) -> Point2<f64> {
        self.corners[3]
    }

    /// Vertex average; strictly inside for a convex quadrilateral
    pub fn centroid(&self) -> Point2<f64> {
        Point2::from(self.corners.iter().fold(Vector2::zeros(), |acc, p| acc + p.coords) / 4.0)
    }

    /// Width and height of the bounding box
    pub fn extent(&self) -> (f64, f64) {
        let (min, max) = self.bounds();
        (max.x - min.x, max.y - min.y)
    }

    fn bounds(&self) -> (Point2<f64>, Point2<f64>) {
        let mut min = self.corners[0];
        let mut max = self.corners[0];
        for p in &self.corners[1..] {
            min.x = min.x.min(p.x);
            min.y = min.y.min(p.y);
            max.x = max.x.max(p.x);
            max.y = max.y.max(p.y);
        }
        (min, max)
    }

    /// Absolute tolerance scaled to the size of the figure
    fn tolerance(&self) -> f64 {
        let (w, h) = self.extent();
        1e-9 * w.max(h).max(1.0)
    }

    pub fn is_convex(&self) -> bool {
        let mut sign = 0.0;
        for i in 0..4 {
            let p0 = self.corners[i];
            let p1 = self.corners[(i + 1) % 4];
            let p2 = self.corners[(i + 2) % 4];
            let cross = (p1 - p0).perp(&(p2 - p1));
            if !cross.is_finite() || cross == 0.0 {
                return false;
            }
            if sign == 0.0 {
                sign = cross.signum();
            } else if cross.signum() != sign {
                return false;
            }
        }
        true
    }

    /// Edges as half-planes `n . p <= offset`, normals pointing outward
    fn half_planes(&self) -> [(Vector2<f64>, f64); 4] {
        let center = self.centroid();
        let mut planes = [(Vector2::zeros(), 0.0); 4];
        for (i, plane) in planes.iter_mut().enumerate() {
            let p0 = self.corners[i];
            let p1 = self.corners[(i + 1) % 4];
            let edge = p1 - p0;
            let mut n = Vector2::new(edge.y, -edge.x);
            if n.dot(&(center - p0)) > 0.0 {
                n = -n;
            }
            *plane = (n, n.dot(&p0.coords));
        }
        planes
    }

    /// Inside or on the boundary, within `tol` (convex only)
    pub fn contains(&self, p: &Point2<f64>, tol: f64) -> bool {
        self.half_planes()
            .iter()
            .all(|(n, offset)| n.dot(&p.coords) - offset <= tol * n.norm())
    }

    fn with_y_negated(&self) -> Self {
        Self::new(self.corners.map(|p| Point2::new(p.x, -p.y)))
    }

    /// Negate x and relabel so A stays top-left
    fn mirrored_x(&self) -> Self {
        let [a, b, c, d] = self.corners.map(|p| Point2::new(-p.x, p.y));
        Self::new([b, a, d, c])
    }

    /// Negate y and relabel so A stays top-left
    fn mirrored_y(&self) -> Self {
        let [a, b, c, d] = self.corners.map(|p| Point2::new(p.x, -p.y));
        Self::new([d, c, b, a])
    }
}

/// The four contact configurations of the inscribed rectangle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContactCase {
    /// Top-left at A, bottom-right on the bottom edge
    OppositeCorner,
    /// Top-left at A, height from the vertical through A
    LContact,
    /// Touches the left, bottom and top edges; solved from the left edge
    ThreePointLeft,
    /// Touches the top, left and bottom edges; solved from the top edge
    ThreePointTop,
}

/// Case plus the mirrors that normalized the quadrilateral into it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    pub case: ContactCase,
    pub mirror_x: bool,
    pub mirror_y: bool,
}

/// Solver output: the rectangle in the wall frame and how it was found
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct InscribedRectangle {
    pub rect: Quadrilateral,
    pub classification: Classification,
}

impl InscribedRectangle {
    pub fn width(&self) -> f64 {
        self.rect.b().x - self.rect.a().x
    }

    pub fn height(&self) -> f64 {
        self.rect.d().y - self.rect.a().y
    }
}

/// Vertical edges give an infinity signed by the rise, whatever the sign of
/// the zero run
fn slope(from: Point2<f64>, to: Point2<f64>) -> f64 {
    let run = to.x - from.x;
    if run == 0.0 {
        return f64::INFINITY.copysign(to.y - from.y);
    }
    (to.y - from.y) / run
}

/// Point on line `p1 p2` with the given x
fn point_on_line_at_x(p1: Point2<f64>, p2: Point2<f64>, x: f64) -> Point2<f64> {
    Point2::new(x, p1.y + (x - p1.x) * (p2.y - p1.y) / (p2.x - p1.x))
}

/// Point on line `p1 p2` with the given y
fn point_on_line_at_y(p1: Point2<f64>, p2: Point2<f64>, y: f64) -> Point2<f64> {
    Point2::new(p1.x + (y - p1.y) * (p2.x - p1.x) / (p2.y - p1.y), y)
}

/// Edge slopes `[top A->B, left D->A, bottom D->C]`, y up
fn edge_slopes(q: &Quadrilateral) -> [f64; 3] {
    [slope(q.a(), q.b()), slope(q.d(), q.a()), slope(q.d(), q.c())]
}

/// Sign pattern -> case. Zero slopes count as non-negative except where the
/// case's construction divides by that slope.
fn match_case(k: [f64; 3]) -> Option<ContactCase> {
    let [top, left, bottom] = k;
    if top >= 0.0 && left >= 0.0 && bottom >= 0.0 {
        Some(ContactCase::OppositeCorner)
    } else if top >= 0.0 && left >= 0.0 && bottom < 0.0 {
        Some(ContactCase::LContact)
    } else if top >= 0.0 && left < 0.0 && bottom > 0.0 {
        Some(ContactCase::ThreePointLeft)
    } else if top < 0.0 && left > 0.0 && bottom >= 0.0 {
        Some(ContactCase::ThreePointTop)
    } else {
        None
    }
}

/// Normalize `quad` (y down) into one of the four cases.
///
/// Returns the classification and the normalized figure (y up, mirrors
/// applied). At most two classification passes are made: as given and
/// mirrored vertically.
pub fn classify(quad: &Quadrilateral, mode: FitMode) -> Result<(Classification, Quadrilateral)> {
    if !quad.is_convex() {
        return Err(KeystoneError::NonConvexQuadrilateral);
    }

    let mut q = quad.with_y_negated();

    let right = (q.c() - q.b()).norm();
    let left = (q.d() - q.a()).norm();
    let mirror_x = match mode {
        FitMode::Biggest => right > left,
        FitMode::Sharpest => right < left,
    };
    if mirror_x {
        q = q.mirrored_x();
    }

    for mirror_y in [false, true] {
        if mirror_y {
            q = q.mirrored_y();
        }
        if let Some(case) = match_case(edge_slopes(&q)) {
            return Ok((
                Classification {
                    case,
                    mirror_x,
                    mirror_y,
                },
                q,
            ));
        }
    }

    Err(KeystoneError::UnclassifiedQuadrilateral)
}

/// Candidate rectangle `[tl, tr, br, bl]` (y up) plus the point where it
/// touches the quadrilateral
fn solve_case(case: ContactCase, q: &Quadrilateral, r: f64) -> ([Point2<f64>; 4], Point2<f64>) {
    let (a, b, c, d) = (q.a(), q.b(), q.c(), q.d());
    let [k0, k1, k2] = edge_slopes(q);

    match case {
        ContactCase::OppositeCorner => {
            // Diagonal from A with slope -1/r meets the bottom edge
            let k_bottom = slope(c, d);
            let k_diag = -1.0 / r;
            let b_bottom = d.y - k_bottom * d.x;
            let b_diag = a.y - k_diag * a.x;
            let x = (b_diag - b_bottom) / (k_bottom - k_diag);
            let y = (k_bottom * b_diag - k_diag * b_bottom) / (k_bottom - k_diag);
            (
                [a, Point2::new(x, a.y), Point2::new(x, y), Point2::new(a.x, y)],
                a,
            )
        }
        ContactCase::LContact => {
            let bl = point_on_line_at_x(d, c, a.x);
            let h = (a.y - bl.y).abs();
            let tr = Point2::new(a.x + r * h, a.y);
            ([a, tr, Point2::new(tr.x, bl.y), bl], a)
        }
        ContactCase::ThreePointLeft => {
            // Bottom-left corner (x, y) on the left edge; horizontal run to the
            // bottom edge is w, vertical run to the top edge is h, w = r * h
            let g = 1.0 / k2 - 1.0 / k1;
            let x = (r * (k1 - k0) * a.x - g * (a.y - d.y - k1 * a.x))
                / (g * k1 - r * (k0 - k1));
            let y = point_on_line_at_x(a, d, x).y;
            let w = g * (y - d.y);
            let h = (k0 - k1) * (x - a.x);
            let bl = Point2::new(x, y);
            (
                [
                    Point2::new(x, y + h),
                    Point2::new(x + w, y + h),
                    Point2::new(x + w, y),
                    bl,
                ],
                bl,
            )
        }
        ContactCase::ThreePointTop => {
            // Top-right corner (x, y) on the top edge; w = (x - A.x)(1 - k0/k1)
            // reaches the left edge, h = (k2 - k0)(xi - x) reaches the bottom
            // edge, where xi is where the top and bottom lines meet
            let xi = (k0 * a.x - k2 * d.x + d.y - a.y) / (k0 - k2);
            let alpha = 1.0 - k0 / k1;
            let beta = r * (k2 - k0);
            let x = (alpha * a.x + beta * xi) / (alpha + beta);
            let y = point_on_line_at_x(a, b, x).y;
            let w = x - point_on_line_at_y(a, d, y).x;
            let h = y - point_on_line_at_x(d, c, x).y;
            let tr = Point2::new(x, y);
            (
                [
                    Point2::new(x - w, y),
                    tr,
                    Point2::new(x, y - h),
                    Point2::new(x - w, y - h),
                ],
                tr,
            )
        }
    }
}

/// Largest `aspect`-ratio rectangle inside `quad` (wall frame, y down)
pub fn inscribe(quad: &Quadrilateral, aspect: f64, mode: FitMode) -> Result<InscribedRectangle> {
    if !(aspect.is_finite() && aspect > 0.0) {
        return Err(KeystoneError::InvalidCalibration(format!(
            "aspect ratio {} is not positive",
            aspect
        )));
    }

    let (classification, normalized) = classify(quad, mode)?;
    let (candidate, anchor) = solve_case(classification.case, &normalized, aspect);

    // Undo the mirrors, then return to y down
    let undo = |p: Point2<f64>| {
        let mut p = p;
        if classification.mirror_y {
            p.y = -p.y;
        }
        if classification.mirror_x {
            p.x = -p.x;
        }
        Point2::new(p.x, -p.y)
    };
    let candidate = candidate.map(undo);
    let anchor = undo(anchor);

    if !candidate.iter().chain([&anchor]).all(|p| p.x.is_finite() && p.y.is_finite()) {
        return Err(KeystoneError::UnclassifiedQuadrilateral);
    }

    let rect = fit_inside(quad, &candidate, anchor)?;
    tracing::debug!(
        "Inscribed rectangle ({:?}, mirror_x={}, mirror_y={}): {:?}",
        classification.case,
        classification.mirror_x,
        classification.mirror_y,
        rect.corners()
    );

    Ok(InscribedRectangle {
        rect,
        classification,
    })
}

/// Scale the candidate until every corner lies in `quad`. Uniform scaling
/// keeps the aspect ratio.
///
/// Two placements are tried: scaled about the contact point, and recentred
/// on the vertex centroid then scaled about it. The larger one wins. A case's
/// construction ignores one edge, and a candidate spilling over it would
/// otherwise shrink into the corner at its contact point.
fn fit_inside(
    quad: &Quadrilateral,
    candidate: &[Point2<f64>; 4],
    anchor: Point2<f64>,
) -> Result<Quadrilateral> {
    let tol = quad.tolerance();

    // Bounds relabel the corners top-left, top-right, bottom-right, bottom-left
    let (min, max) = Quadrilateral::new(*candidate).bounds();
    let (width, height) = (max.x - min.x, max.y - min.y);
    if !(width > 0.0 && height > 0.0) {
        return Err(KeystoneError::UnclassifiedQuadrilateral);
    }
    let scaled = |top_left: Point2<f64>, anchor: Point2<f64>| {
        let rect = Quadrilateral::rectangle(top_left, width, height);
        (max_scale(quad, &rect, anchor, tol), top_left, anchor)
    };

    let at_contact = quad.contains(&anchor, tol).then(|| scaled(min, anchor));

    let center = quad.centroid();
    let centred = scaled(
        min + (center - Point2::new(min.x + width / 2.0, min.y + height / 2.0)),
        center,
    );

    let (scale, top_left, anchor) = match at_contact {
        Some(contact) if contact.0 >= centred.0 => contact,
        _ => {
            tracing::debug!("Inscribed rectangle recentred, scale {:.4}", centred.0);
            centred
        }
    };

    if !(scale > MIN_SCALE) {
        return Err(KeystoneError::UnclassifiedQuadrilateral);
    }

    let top_left = anchor + (top_left - anchor) * scale;
    Ok(Quadrilateral::rectangle(top_left, width * scale, height * scale))
}

const MIN_SCALE: f64 = 1e-6;

/// Largest factor in (0, 1] keeping `rect`, scaled about `anchor`, inside
fn max_scale(quad: &Quadrilateral, rect: &Quadrilateral, anchor: Point2<f64>, tol: f64) -> f64 {
    let mut scale = 1.0f64;
    for (n, offset) in quad.half_planes() {
        let slack = (offset - n.dot(&anchor.coords)).max(0.0);
        let margin = tol * n.norm();
        for corner in rect.corners() {
            let reach = n.dot(&(corner - anchor));
            if reach > slack + margin {
                scale = scale.min(slack / reach);
            }
        }
    }
    scale
}
