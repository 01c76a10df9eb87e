use super::Rect;

/// A clockwise rotation by a multiple of 90 degrees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Rotation {
    Identity,
    Deg90,
    Deg180,
    Deg270,
}

impl Rotation {
    /// Return `true` if the rotation exchanges the X and Y axes.
    #[inline]
    pub fn swaps_axes(self) -> bool {
        match self {
            Rotation::Deg90 | Rotation::Deg270 => true,
            Rotation::Identity | Rotation::Deg180 => false,
        }
    }
}

impl Default for Rotation {
    fn default() -> Self {
        Rotation::Identity
    }
}

impl Rect {
    /// Rotate `self` within a `width` × `height` space.
    ///
    /// For [`Rotation::Deg90`] and [`Rotation::Deg270`] the result lives in
    /// the transposed (`height` × `width`) space.
    pub fn rotate(&self, rotation: Rotation, width: i32, height: i32) -> Self {
        let (l, t, r, b) = (self.left(), self.top(), self.right(), self.bottom());
        match rotation {
            Rotation::Identity => *self,
            Rotation::Deg90 => Self::ltrb(height - b, l, height - t, r),
            Rotation::Deg180 => Self::ltrb(width - r, height - b, width - l, height - t),
            Rotation::Deg270 => Self::ltrb(t, width - r, b, width - l),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;

    #[test]
    fn rotate_90() {
        // 100x50 space, a rect in the top-left corner
        let r = Rect::ltrb(0, 0, 10, 20);
        assert_eq!(r.rotate(Rotation::Deg90, 100, 50), Rect::ltrb(30, 0, 50, 10));
    }

    #[test]
    fn rotate_180() {
        let r = Rect::ltrb(0, 0, 10, 20);
        assert_eq!(
            r.rotate(Rotation::Deg180, 100, 50),
            Rect::ltrb(90, 30, 100, 50)
        );
    }

    #[quickcheck]
    fn quarter_turns_cancel(r: Rect) -> bool {
        let (w, h) = (1920, 1080);
        r.rotate(Rotation::Deg90, w, h).rotate(Rotation::Deg270, h, w) == r
    }

    #[quickcheck]
    fn rotation_preserves_area(r: Rect) -> bool {
        let area = r.width() * r.height();
        [Rotation::Deg90, Rotation::Deg180, Rotation::Deg270]
            .iter()
            .all(|&rot| {
                let q = r.rotate(rot, 800, 600);
                q.width() * q.height() == area
            })
    }
}
