//! Hand-landmark frames carried over the established data channel.
//!
//! Browsers send either `{"multiHandLandmarks": [...]}` or the bare array of
//! hands; both decode to the same [`LandmarkFrame`].

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DATA_CHANNEL_LABEL: &str = "handData";
pub const MAX_LANDMARKS_PER_HAND: usize = 21;
pub const DEFAULT_MAX_HANDS: usize = 2;
/// Landmark 8 in the hand model.
pub const INDEX_FINGER_TIP: usize = 8;

/// Delivery settings for the landmark channel: stale frames are worthless, so
/// nothing is reordered or retransmitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelOptions {
    pub ordered: bool,
    pub max_retransmits: Option<u16>,
}

pub const LANDMARK_CHANNEL: ChannelOptions = ChannelOptions {
    ordered: false,
    max_retransmits: Some(0),
};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Landmark {
    pub x: f32,
    pub y: f32,
    #[serde(default)]
    pub z: f32,
}

impl Landmark {
    fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LandmarkFrame {
    pub multi_hand_landmarks: Vec<Vec<Landmark>>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawFrame {
    Wrapped(LandmarkFrame),
    Bare(Vec<Vec<Landmark>>),
}

#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("invalid landmark frame: {0}")]
    Json(#[from] serde_json::Error),
    #[error("frame carries {found} hands, at most {max} allowed")]
    TooManyHands { found: usize, max: usize },
    #[error("hand {hand} carries {found} landmarks, at most {MAX_LANDMARKS_PER_HAND} allowed")]
    TooManyLandmarks { hand: usize, found: usize },
    #[error("hand {hand} landmark {index} is not a finite coordinate")]
    NonFinite { hand: usize, index: usize },
}

impl LandmarkFrame {
    pub fn decode(bytes: &[u8], max_hands: usize) -> Result<Self, PayloadError> {
        let frame = match serde_json::from_slice::<RawFrame>(bytes)? {
            RawFrame::Wrapped(frame) => frame,
            RawFrame::Bare(hands) => LandmarkFrame {
                multi_hand_landmarks: hands,
            },
        };
        frame.validate(max_hands)?;
        Ok(frame)
    }

    pub fn encode(&self) -> Result<Vec<u8>, PayloadError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn validate(&self, max_hands: usize) -> Result<(), PayloadError> {
        let hands = self.multi_hand_landmarks.len();
        if hands > max_hands {
            return Err(PayloadError::TooManyHands {
                found: hands,
                max: max_hands,
            });
        }
        for (hand, landmarks) in self.multi_hand_landmarks.iter().enumerate() {
            if landmarks.len() > MAX_LANDMARKS_PER_HAND {
                return Err(PayloadError::TooManyLandmarks {
                    hand,
                    found: landmarks.len(),
                });
            }
            if let Some(index) = landmarks.iter().position(|point| !point.is_finite()) {
                return Err(PayloadError::NonFinite { hand, index });
            }
        }
        Ok(())
    }

    pub fn hand_count(&self) -> usize {
        self.multi_hand_landmarks.len()
    }

    pub fn index_finger_tip(&self) -> Option<Landmark> {
        self.multi_hand_landmarks
            .first()
            .and_then(|hand| hand.get(INDEX_FINGER_TIP))
            .copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hand(points: usize) -> Vec<Landmark> {
        (0..points)
            .map(|i| Landmark {
                x: i as f32 / 100.0,
                y: 0.5,
                z: -0.01,
            })
            .collect()
    }

    #[test_timeout::timeout]
    fn wrapped_and_bare_frames_decode_alike() {
        let wrapped = br#"{"multiHandLandmarks":[[{"x":0.1,"y":0.2,"z":0.0}]]}"#;
        let bare = br#"[[{"x":0.1,"y":0.2,"z":0.0}]]"#;
        let a = LandmarkFrame::decode(wrapped, DEFAULT_MAX_HANDS).unwrap();
        let b = LandmarkFrame::decode(bare, DEFAULT_MAX_HANDS).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.hand_count(), 1);
    }

    #[test_timeout::timeout]
    fn limits_are_enforced() {
        let frame = LandmarkFrame {
            multi_hand_landmarks: vec![hand(21), hand(21), hand(21)],
        };
        assert!(matches!(
            frame.validate(DEFAULT_MAX_HANDS),
            Err(PayloadError::TooManyHands { found: 3, max: 2 })
        ));

        let frame = LandmarkFrame {
            multi_hand_landmarks: vec![hand(22)],
        };
        assert!(matches!(
            frame.validate(DEFAULT_MAX_HANDS),
            Err(PayloadError::TooManyLandmarks { hand: 0, found: 22 })
        ));
    }

    #[test_timeout::timeout]
    fn index_finger_tip_reads_first_hand() {
        let frame = LandmarkFrame {
            multi_hand_landmarks: vec![hand(21)],
        };
        let encoded = frame.encode().unwrap();
        let decoded = LandmarkFrame::decode(&encoded, 1).unwrap();
        assert_eq!(decoded.index_finger_tip().map(|p| p.x), Some(0.08));
        assert!(LandmarkFrame::default().index_finger_tip().is_none());
        assert!(!LANDMARK_CHANNEL.ordered);
    }
}
