//! Integer rectangles for display planes.
//!
//! A [`Rect`] is half-open: `min` is inclusive and `max` is exclusive, which
//! is the convention shared by window-system layer lists and display
//! controller registers. The operations here deliberately keep a few quirks
//! expected by overlay planning code:
//!
//!  - [`Rect::clip`] returns [`Rect::DEGENERATE`] (`(-1, -1)–(-1, -1)`) for
//!    disjoint inputs instead of an `Option`, so a clipped rectangle can be
//!    stored and compared like any other.
//!  - [`Rect::grow`] replaces an empty accumulator outright and otherwise
//!    takes the bounding box, even of an empty argument.
pub extern crate cgmath;

use cgmath::{Point2, Vector2};

mod rotation;

pub use self::rotation::*;

/// An axis-aligned rectangle with integer coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Rect {
    /// The minimum coordinate (inclusive).
    pub min: Point2<i32>,

    /// The maximum coordinate (exclusive).
    pub max: Point2<i32>,
}

impl Rect {
    /// The result of clipping two disjoint rectangles.
    pub const DEGENERATE: Self = Self {
        min: Point2 { x: -1, y: -1 },
        max: Point2 { x: -1, y: -1 },
    };

    #[inline]
    pub fn new(min: Point2<i32>, max: Point2<i32>) -> Self {
        Self { min, max }
    }

    /// Construct a `Rect` from left, top, right, and bottom edges.
    #[inline]
    pub fn ltrb(left: i32, top: i32, right: i32, bottom: i32) -> Self {
        Self::new(Point2::new(left, top), Point2::new(right, bottom))
    }

    /// Construct a `Rect` of the given size placed at the origin.
    #[inline]
    pub fn with_size(width: i32, height: i32) -> Self {
        Self::ltrb(0, 0, width, height)
    }

    #[inline]
    pub fn zero() -> Self {
        Self::with_size(0, 0)
    }

    #[inline]
    pub fn left(&self) -> i32 {
        self.min.x
    }
    #[inline]
    pub fn top(&self) -> i32 {
        self.min.y
    }
    #[inline]
    pub fn right(&self) -> i32 {
        self.max.x
    }
    #[inline]
    pub fn bottom(&self) -> i32 {
        self.max.y
    }

    #[inline]
    pub fn width(&self) -> i32 {
        self.max.x - self.min.x
    }
    #[inline]
    pub fn height(&self) -> i32 {
        self.max.y - self.min.y
    }

    #[inline]
    pub fn size(&self) -> Vector2<i32> {
        self.max - self.min
    }

    /// Return `true` if the rectangle covers no pixel.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.min.x >= self.max.x || self.min.y >= self.max.y
    }

    /// Return `true` if `self` and `other` share at least one pixel.
    #[inline]
    pub fn intersects(&self, other: &Self) -> bool {
        !(other.min.x >= self.max.x
            || other.max.x <= self.min.x
            || other.min.y >= self.max.y
            || other.max.y <= self.min.y)
    }

    /// Return `true` if every pixel of `other` is inside `self`.
    #[inline]
    pub fn contains(&self, other: &Self) -> bool {
        self.clip(other) == *other
    }

    #[inline]
    pub fn intersection(&self, other: &Self) -> Option<Self> {
        if self.intersects(other) {
            Some(self.clip(other))
        } else {
            None
        }
    }

    /// Compute the intersection, or [`Rect::DEGENERATE`] if the rectangles
    /// don't intersect.
    #[inline]
    pub fn clip(&self, other: &Self) -> Self {
        if !self.intersects(other) {
            return Self::DEGENERATE;
        }
        Self::ltrb(
            self.min.x.max(other.min.x),
            self.min.y.max(other.min.y),
            self.max.x.min(other.max.x),
            self.max.y.min(other.max.y),
        )
    }

    /// The bounding box of `self` and `other`.
    #[inline]
    pub fn union(&self, other: &Self) -> Self {
        Self::ltrb(
            self.min.x.min(other.min.x),
            self.min.y.min(other.min.y),
            self.max.x.max(other.max.x),
            self.max.y.max(other.max.y),
        )
    }

    /// Grow `self` to cover `other`. An empty `self` is replaced by `other`.
    #[inline]
    pub fn grow(&mut self, other: &Self) {
        if self.is_empty() {
            *self = *other;
        } else {
            *self = self.union(other);
        }
    }

    #[inline]
    pub fn translate(&self, displacement: Vector2<i32>) -> Self {
        Self::new(self.min + displacement, self.max + displacement)
    }
}

#[cfg(any(test, feature = "quickcheck"))]
mod arbitrary {
    use super::Rect;
    use quickcheck::{Arbitrary, Gen};

    impl Arbitrary for Rect {
        fn arbitrary<G: Gen>(g: &mut G) -> Self {
            let x = i32::from(i16::arbitrary(g)) % 2048;
            let y = i32::from(i16::arbitrary(g)) % 2048;
            let w = i32::from(u16::arbitrary(g)) % 1024;
            let h = i32::from(u16::arbitrary(g)) % 1024;
            Self::ltrb(x, y, x + w, y + h)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;

    #[test]
    fn clip_disjoint() {
        let a = Rect::ltrb(0, 0, 10, 10);
        let b = Rect::ltrb(10, 0, 20, 10);
        assert!(!a.intersects(&b));
        assert_eq!(a.clip(&b), Rect::DEGENERATE);
        assert_eq!(a.intersection(&b), None);
    }

    #[test]
    fn grow_from_empty() {
        let mut acc = Rect::zero();
        acc.grow(&Rect::ltrb(5, 6, 7, 8));
        assert_eq!(acc, Rect::ltrb(5, 6, 7, 8));
        acc.grow(&Rect::ltrb(0, 10, 1, 12));
        assert_eq!(acc, Rect::ltrb(0, 6, 7, 12));
    }

    #[quickcheck]
    fn intersection_is_commutative(a: Rect, b: Rect) -> bool {
        a.clip(&b) == b.clip(&a) && a.intersects(&b) == b.intersects(&a)
    }

    #[quickcheck]
    fn intersection_is_contained(a: Rect, b: Rect) -> bool {
        match a.intersection(&b) {
            Some(i) => !i.is_empty() && a.contains(&i) && b.contains(&i),
            None => true,
        }
    }

    #[quickcheck]
    fn grow_covers_both(a: Rect, b: Rect) -> bool {
        if a.is_empty() || b.is_empty() {
            return true;
        }
        let mut acc = a;
        acc.grow(&b);
        acc.contains(&a) && acc.contains(&b)
    }
}
