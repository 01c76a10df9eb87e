//! Scaling arithmetic for window configuration.
use hwcrect::Rect;

use crate::layer::Transform;

/// Scale factors closer to 1 than this are treated as 1:1.
const SCALE_EPSILON: f32 = 0.004;

/// Compute the horizontal and vertical scale factors from `src` (in surface
/// space) to `dst` (in display space).
pub fn get_scale(transform: Transform, src: &Rect, dst: &Rect) -> [f32; 2] {
    let (dst_w, dst_h) = if transform.swaps_axes() {
        (dst.height(), dst.width())
    } else {
        (dst.width(), dst.height())
    };

    [
        dst_w as f32 / src.width() as f32,
        dst_h as f32 / src.height() as f32,
    ]
}

pub fn need_scale(scale: [f32; 2]) -> bool {
    (scale[0] - 1.0).abs() > SCALE_EPSILON || (scale[1] - 1.0).abs() > SCALE_EPSILON
}

/// Clip `dst` to `clip` and cut the matching part off `src`.
///
/// Returns the clipped `(src, dst)`. The source is adjusted proportionally,
/// rounding half up, and is never left with a zero extent.
pub fn scale_window(clip: &Rect, transform: Transform, src: &Rect, dst: &Rect) -> (Rect, Rect) {
    let out_dst = Rect::ltrb(
        dst.left().max(0),
        dst.top().max(0),
        dst.right().min(clip.right()),
        dst.bottom().min(clip.bottom()),
    );

    let dw = src.width() as f32 / dst.width().max(1) as f32;
    let dh = src.height() as f32 / dst.height().max(1) as f32;

    let adjust = |edge: i32, delta: i32, d: f32| (edge as f32 + 0.5 + d * delta as f32) as i32;

    let (mut left, mut right) = if transform.contains(Transform::FLIP_H) {
        (
            adjust(src.left(), dst.right() - out_dst.right(), dw),
            adjust(src.right(), dst.left() - out_dst.left(), dw),
        )
    } else {
        (
            adjust(src.left(), out_dst.left() - dst.left(), dw),
            adjust(src.right(), out_dst.right() - dst.right(), dw),
        )
    };
    if left == right {
        if right < src.right() {
            right += 1;
        } else {
            left -= 1;
        }
    }

    let (mut top, mut bottom) = if transform.contains(Transform::FLIP_V) {
        (
            adjust(src.top(), dst.bottom() - out_dst.bottom(), dh),
            adjust(src.bottom(), dst.top() - out_dst.top(), dh),
        )
    } else {
        (
            adjust(src.top(), out_dst.top() - dst.top(), dh),
            adjust(src.bottom(), out_dst.bottom() - dst.bottom(), dh),
        )
    };
    if top == bottom {
        if bottom < src.bottom() {
            bottom += 1;
        } else {
            top -= 1;
        }
    }

    (Rect::ltrb(left, top, right, bottom), out_dst)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scale_with_rotation() {
        let src = Rect::with_size(100, 50);
        let dst = Rect::with_size(100, 200);
        assert_eq!(get_scale(Transform::ROT_90, &src, &dst), [2.0, 2.0]);
        assert_eq!(get_scale(Transform::empty(), &src, &dst), [1.0, 4.0]);
    }

    #[test]
    fn need_scale_tolerance() {
        assert!(!need_scale([1.0, 1.0]));
        assert!(!need_scale([1.003, 0.997]));
        assert!(need_scale([1.0, 1.01]));
        assert!(need_scale([0.5, 1.0]));
    }

    #[test]
    fn unclipped_is_identity() {
        let clip = Rect::with_size(800, 480);
        let src = Rect::ltrb(10, 20, 110, 70);
        let dst = Rect::ltrb(0, 0, 200, 100);
        assert_eq!(
            scale_window(&clip, Transform::empty(), &src, &dst),
            (src, dst)
        );
    }

    #[test]
    fn clip_right_edge() {
        let clip = Rect::with_size(800, 480);
        let src = Rect::with_size(100, 100);
        // Half of the window is off screen
        let dst = Rect::ltrb(700, 0, 900, 200);
        let (s, d) = scale_window(&clip, Transform::empty(), &src, &dst);
        assert_eq!(d, Rect::ltrb(700, 0, 800, 200));
        assert_eq!(s, Rect::ltrb(0, 0, 50, 100));

        // With a horizontal flip, the left half of the source is cut
        let (s, _) = scale_window(&clip, Transform::FLIP_H, &src, &dst);
        assert_eq!(s, Rect::ltrb(50, 0, 100, 100));
    }

    #[test]
    fn zero_size_guard() {
        let clip = Rect::with_size(800, 480);
        let src = Rect::with_size(2, 2);
        let dst = Rect::ltrb(-199, 0, 1, 200);
        let (s, d) = scale_window(&clip, Transform::empty(), &src, &dst);
        assert_eq!(d, Rect::ltrb(0, 0, 1, 200));
        assert!(s.width() > 0);
        assert!(s.height() > 0);
    }
}
