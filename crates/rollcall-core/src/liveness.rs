//! Eye-aspect-ratio liveness check.
//!
//! A photographed or printed face tends to be captured with flat, closed or
//! heavily distorted eye contours. The eye aspect ratio (EAR) over the six
//! contour points of each eye collapses towards zero in those cases:
//!
//! ```text
//! EAR = (|p2 - p6| + |p3 - p5|) / (2 * |p1 - p4|)
//! ```
//!
//! The verdict is advisory. Whether it gates registration or recognition is
//! decided by the caller's `enforce_liveness` setting.

use crate::types::FaceLandmarks;

/// EAR at or below this value is judged not live.
pub const EAR_THRESHOLD: f32 = 0.1;

/// Outcome of a liveness evaluation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LivenessVerdict {
    /// Mean EAR across both eyes.
    pub ear: f32,
    pub is_live: bool,
}

fn distance(a: (f32, f32), b: (f32, f32)) -> f32 {
    ((a.0 - b.0).powi(2) + (a.1 - b.1).powi(2)).sqrt()
}

/// EAR for one eye given its six contour points `p1..p6`.
///
/// A zero-width eye (p1 == p4) yields 0.0 rather than NaN.
pub fn eye_aspect_ratio(eye: &[(f32, f32); 6]) -> f32 {
    let vertical_a = distance(eye[1], eye[5]);
    let vertical_b = distance(eye[2], eye[4]);
    let horizontal = distance(eye[0], eye[3]);
    if horizontal <= f32::EPSILON {
        return 0.0;
    }
    (vertical_a + vertical_b) / (2.0 * horizontal)
}

/// Evaluate liveness against an explicit threshold.
///
/// Returns `None` when the landmark set does not carry both eye contours.
pub fn evaluate(landmarks: &FaceLandmarks, threshold: f32) -> Option<LivenessVerdict> {
    let left = landmarks.left_eye()?;
    let right = landmarks.right_eye()?;
    let ear = (eye_aspect_ratio(&left) + eye_aspect_ratio(&right)) / 2.0;
    Some(LivenessVerdict {
        ear,
        is_live: ear > threshold,
    })
}

/// `true` when the mean EAR exceeds [`EAR_THRESHOLD`].
///
/// Landmarks without eye contours are never judged live.
pub fn is_live(landmarks: &FaceLandmarks) -> bool {
    evaluate(landmarks, EAR_THRESHOLD).is_some_and(|v| v.is_live)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Eye centred at (cx, cy), `w` wide and `h` tall (iBUG contour order).
    fn eye(cx: f32, cy: f32, w: f32, h: f32) -> [(f32, f32); 6] {
        let hw = w / 2.0;
        let hh = h / 2.0;
        [
            (cx - hw, cy),
            (cx - hw / 3.0, cy - hh),
            (cx + hw / 3.0, cy - hh),
            (cx + hw, cy),
            (cx + hw / 3.0, cy + hh),
            (cx - hw / 3.0, cy + hh),
        ]
    }

    fn face_with_eyes(h: f32) -> FaceLandmarks {
        let mut points = vec![(0.0, 0.0); 68];
        points[36..42].copy_from_slice(&eye(30.0, 40.0, 20.0, h));
        points[42..48].copy_from_slice(&eye(70.0, 40.0, 20.0, h));
        FaceLandmarks::new(points)
    }

    #[test]
    fn test_ear_open_eye() {
        // Height 8 over width 20: EAR = (8 + 8) / 40 = 0.4
        let ear = eye_aspect_ratio(&eye(0.0, 0.0, 20.0, 8.0));
        assert!((ear - 0.4).abs() < 1e-5, "ear = {ear}");
        assert!(ear > EAR_THRESHOLD);
    }

    #[test]
    fn test_ear_flat_eye_approaches_zero() {
        let ear = eye_aspect_ratio(&eye(0.0, 0.0, 20.0, 0.01));
        assert!(ear < 1e-3, "ear = {ear}");
    }

    #[test]
    fn test_ear_degenerate_point_is_zero() {
        let collapsed = [(5.0, 5.0); 6];
        assert_eq!(eye_aspect_ratio(&collapsed), 0.0);
    }

    #[test]
    fn test_is_live_open_eyes() {
        assert!(is_live(&face_with_eyes(8.0)));
    }

    #[test]
    fn test_threshold_is_inclusive_for_rejection() {
        // Height 2 over width 20: EAR = 0.1 exactly → not live.
        let verdict = evaluate(&face_with_eyes(2.0), EAR_THRESHOLD).unwrap();
        assert!((verdict.ear - 0.1).abs() < 1e-5);
        assert!(!verdict.is_live);
        assert!(!is_live(&face_with_eyes(0.5)));
    }

    #[test]
    fn test_missing_eye_contours() {
        let five_point = FaceLandmarks::new(vec![(1.0, 1.0); 5]);
        assert!(evaluate(&five_point, EAR_THRESHOLD).is_none());
        assert!(!is_live(&five_point));
    }
}
