// THEORY:
// The `KeypointAnalyzer` is the first stage of the gesture pipeline. It turns the
// raw output of an external pose model (17 landmarks per person) into the one
// decision the rest of the system cares about: "is this wrist raised high enough,
// and seen clearly enough, to be worth cropping?"
//
// Key architectural principles:
// 1.  **Face-Relative Scale**: The horizontal distance between the two ears is used
//     as a per-person ruler. It sizes the hand crop and relaxes the "raised" test
//     for people close to the camera. The value is signed (left ear x minus right
//     ear x) and the sign is kept as-is; only the crop stage takes its magnitude.
// 2.  **Shoulder Line**: A hand counts as raised when the wrist is above the mean
//     shoulder height plus half a face width (image y grows downward).
// 3.  **Stateless**: Nothing is remembered between people or frames. A `Person`'s
//     index is its position in the pose model's output and nothing more.

use serde::{Deserialize, Serialize};
use std::fmt;

/// COCO 17-keypoint indices as emitted by YOLO-pose style models.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(usize)]
pub enum KeypointIndex {
    Nose = 0,
    LeftEye = 1,
    RightEye = 2,
    LeftEar = 3,
    RightEar = 4,
    LeftShoulder = 5,
    RightShoulder = 6,
    LeftElbow = 7,
    RightElbow = 8,
    LeftWrist = 9,
    RightWrist = 10,
    LeftHip = 11,
    RightHip = 12,
    LeftKnee = 13,
    RightKnee = 14,
    LeftAnkle = 15,
    RightAnkle = 16,
}

impl KeypointIndex {
    pub const COUNT: usize = 17;
}

/// A single landmark in pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Keypoint {
    pub x: f32,
    pub y: f32,
    /// Detection confidence in [0, 1].
    pub confidence: f32,
}

impl Keypoint {
    pub fn new(x: f32, y: f32, confidence: f32) -> Self {
        Self { x, y, confidence }
    }
}

/// One detected person in one frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Person {
    /// Position in the pose provider's output for this frame. Not an identity.
    pub index: usize,
    pub keypoints: [Keypoint; KeypointIndex::COUNT],
}

impl Person {
    pub fn new(index: usize, keypoints: [Keypoint; KeypointIndex::COUNT]) -> Self {
        Self { index, keypoints }
    }

    pub fn get(&self, index: KeypointIndex) -> &Keypoint {
        &self.keypoints[index as usize]
    }

    /// Signed ear-to-ear distance used as the person's crop scale.
    pub fn face_width(&self) -> f32 {
        self.get(KeypointIndex::LeftEar).x - self.get(KeypointIndex::RightEar).x
    }

    pub fn shoulder_line_y(&self) -> f32 {
        (self.get(KeypointIndex::LeftShoulder).y + self.get(KeypointIndex::RightShoulder).y) / 2.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandSide {
    Left,
    Right,
}

impl HandSide {
    pub const BOTH: [HandSide; 2] = [HandSide::Left, HandSide::Right];

    /// Position of this hand in artifact names (`personI_gestureJ`).
    pub fn ordinal(self) -> usize {
        match self {
            HandSide::Left => 0,
            HandSide::Right => 1,
        }
    }

    pub fn wrist(self) -> KeypointIndex {
        match self {
            HandSide::Left => KeypointIndex::LeftWrist,
            HandSide::Right => KeypointIndex::RightWrist,
        }
    }
}

impl fmt::Display for HandSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandSide::Left => write!(f, "left"),
            HandSide::Right => write!(f, "right"),
        }
    }
}

/// The hand-raised verdict for one wrist of one person.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WristCandidate {
    pub side: HandSide,
    pub position: (f32, f32),
    pub confidence: f32,
    pub hand_raised: bool,
    /// The person's signed face width.
    pub scale: f32,
}

impl WristCandidate {
    /// Whether this wrist passes the confidence and raised-hand gate.
    pub fn is_candidate(&self, threshold: f32) -> bool {
        self.confidence > threshold && self.hand_raised
    }
}

/// Evaluates both wrists of a person, left first.
pub fn analyze_person(person: &Person) -> [WristCandidate; 2] {
    let face_width = person.face_width();
    let raise_line = person.shoulder_line_y() + face_width / 2.0;

    HandSide::BOTH.map(|side| {
        let wrist = person.get(side.wrist());
        WristCandidate {
            side,
            position: (wrist.x, wrist.y),
            confidence: wrist.confidence,
            hand_raised: wrist.y < raise_line,
            scale: face_width,
        }
    })
}
