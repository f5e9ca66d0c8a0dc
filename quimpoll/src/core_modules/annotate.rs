// THEORY:
// Annotation makes the artifacts readable by a human: the full frame gets each
// person's skeleton, each gesture crop gets the hand landmarks the classifier
// found. Drawing is plain pixel work on `RgbImage` and clips silently at the
// image border, so keypoints outside the frame are harmless.

use crate::core_modules::gesture_aggregator::HandLandmark;
use crate::core_modules::keypoint_analyzer::{KeypointIndex, Person};
use image::{Rgb, RgbImage};

/// Keypoints below this confidence are not drawn.
pub const MIN_DRAW_CONFIDENCE: f32 = 0.5;

pub const KEYPOINT_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
pub const SKELETON_COLOR: Rgb<u8> = Rgb([255, 255, 0]);
pub const HAND_LANDMARK_COLOR: Rgb<u8> = Rgb([255, 0, 0]);
pub const HAND_CONNECTION_COLOR: Rgb<u8> = Rgb([255, 255, 255]);

/// (from, to) pairs of the COCO body skeleton.
pub const SKELETON_CONNECTIONS: [(KeypointIndex, KeypointIndex); 16] = [
    (KeypointIndex::LeftEar, KeypointIndex::LeftEye),
    (KeypointIndex::LeftEye, KeypointIndex::Nose),
    (KeypointIndex::Nose, KeypointIndex::RightEye),
    (KeypointIndex::RightEye, KeypointIndex::RightEar),
    (KeypointIndex::LeftShoulder, KeypointIndex::RightShoulder),
    (KeypointIndex::LeftShoulder, KeypointIndex::LeftElbow),
    (KeypointIndex::LeftElbow, KeypointIndex::LeftWrist),
    (KeypointIndex::RightShoulder, KeypointIndex::RightElbow),
    (KeypointIndex::RightElbow, KeypointIndex::RightWrist),
    (KeypointIndex::LeftShoulder, KeypointIndex::LeftHip),
    (KeypointIndex::RightShoulder, KeypointIndex::RightHip),
    (KeypointIndex::LeftHip, KeypointIndex::RightHip),
    (KeypointIndex::LeftHip, KeypointIndex::LeftKnee),
    (KeypointIndex::LeftKnee, KeypointIndex::LeftAnkle),
    (KeypointIndex::RightHip, KeypointIndex::RightKnee),
    (KeypointIndex::RightKnee, KeypointIndex::RightAnkle),
];

/// MediaPipe 21-landmark hand topology.
pub const HAND_CONNECTIONS: [(usize, usize); 21] = [
    (0, 1), (1, 2), (2, 3), (3, 4),
    (0, 5), (5, 6), (6, 7), (7, 8),
    (5, 9), (9, 10), (10, 11), (11, 12),
    (9, 13), (13, 14), (14, 15), (15, 16),
    (13, 17), (17, 18), (18, 19), (19, 20),
    (0, 17),
];

pub fn draw_pose(frame: &mut RgbImage, people: &[Person]) {
    for person in people {
        for (from, to) in SKELETON_CONNECTIONS {
            let (a, b) = (person.get(from), person.get(to));
            if a.confidence >= MIN_DRAW_CONFIDENCE && b.confidence >= MIN_DRAW_CONFIDENCE {
                draw_line(frame, (a.x, a.y), (b.x, b.y), SKELETON_COLOR);
            }
        }
        for kp in person.keypoints.iter().filter(|kp| kp.confidence >= MIN_DRAW_CONFIDENCE) {
            draw_dot(frame, (kp.x, kp.y), 2, KEYPOINT_COLOR);
        }
    }
}

/// Draws crop-normalized hand landmarks onto the crop they came from.
pub fn draw_hand_landmarks(crop: &mut RgbImage, landmarks: &[HandLandmark]) {
    let (w, h) = (crop.width() as f32, crop.height() as f32);
    let to_pixel = |lm: &HandLandmark| (lm.x * w, lm.y * h);

    for (from, to) in HAND_CONNECTIONS {
        if let (Some(a), Some(b)) = (landmarks.get(from), landmarks.get(to)) {
            draw_line(crop, to_pixel(a), to_pixel(b), HAND_CONNECTION_COLOR);
        }
    }
    for lm in landmarks {
        draw_dot(crop, to_pixel(lm), 1, HAND_LANDMARK_COLOR);
    }
}

fn put_clipped(image: &mut RgbImage, x: i64, y: i64, color: Rgb<u8>) {
    if x >= 0 && y >= 0 && (x as u64) < image.width() as u64 && (y as u64) < image.height() as u64 {
        image.put_pixel(x as u32, y as u32, color);
    }
}

fn draw_dot(image: &mut RgbImage, center: (f32, f32), radius: i64, color: Rgb<u8>) {
    if !center.0.is_finite() || !center.1.is_finite() {
        return;
    }
    let (cx, cy) = (center.0.round() as i64, center.1.round() as i64);
    for dy in -radius..=radius {
        for dx in -radius..=radius {
            put_clipped(image, cx + dx, cy + dy, color);
        }
    }
}

/// Bresenham line between two points.
fn draw_line(image: &mut RgbImage, from: (f32, f32), to: (f32, f32), color: Rgb<u8>) {
    if ![from.0, from.1, to.0, to.1].iter().all(|v| v.is_finite()) {
        return;
    }
    let (mut x0, mut y0) = (from.0.round() as i64, from.1.round() as i64);
    let (x1, y1) = (to.0.round() as i64, to.1.round() as i64);
    let dx = (x1 - x0).abs();
    let dy = -(y1 - y0).abs();
    let sx = if x0 < x1 { 1 } else { -1 };
    let sy = if y0 < y1 { 1 } else { -1 };
    let mut err = dx + dy;

    loop {
        put_clipped(image, x0, y0, color);
        if x0 == x1 && y0 == y1 {
            break;
        }
        let e2 = 2 * err;
        if e2 >= dy {
            err += dy;
            x0 += sx;
        }
        if e2 <= dx {
            err += dx;
            y0 += sy;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::keypoint_analyzer::Keypoint;

    #[test]
    fn line_covers_both_endpoints() {
        let mut image = RgbImage::new(10, 10);
        draw_line(&mut image, (1.0, 1.0), (8.0, 5.0), SKELETON_COLOR);
        assert_eq!(image.get_pixel(1, 1), &SKELETON_COLOR);
        assert_eq!(image.get_pixel(8, 5), &SKELETON_COLOR);
    }

    #[test]
    fn drawing_off_canvas_is_clipped() {
        let mut image = RgbImage::new(4, 4);
        draw_line(&mut image, (-50.0, -50.0), (50.0, 50.0), SKELETON_COLOR);
        draw_dot(&mut image, (100.0, 100.0), 3, KEYPOINT_COLOR);
        assert_eq!(image.get_pixel(2, 2), &SKELETON_COLOR);
    }

    #[test]
    fn low_confidence_keypoints_are_not_drawn() {
        let mut keypoints = [Keypoint::default(); KeypointIndex::COUNT];
        keypoints[KeypointIndex::Nose as usize] = Keypoint::new(5.0, 5.0, 0.1);
        keypoints[KeypointIndex::LeftWrist as usize] = Keypoint::new(15.0, 15.0, 0.9);
        let person = Person::new(0, keypoints);

        let mut image = RgbImage::new(20, 20);
        draw_pose(&mut image, &[person]);
        assert_eq!(image.get_pixel(5, 5), &Rgb([0, 0, 0]));
        assert_eq!(image.get_pixel(15, 15), &KEYPOINT_COLOR);
    }

    #[test]
    fn hand_landmarks_scale_to_the_crop() {
        let mut crop = RgbImage::new(40, 20);
        let center = HandLandmark {
            x: 0.5,
            y: 0.5,
            z: 0.0,
        };
        draw_hand_landmarks(&mut crop, &[center]);
        assert_eq!(crop.get_pixel(20, 10), &HAND_LANDMARK_COLOR);
    }
}
