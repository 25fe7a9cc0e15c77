use serde::{Deserialize, Serialize};

/// Label used for a face region that matched no known identity.
pub const UNKNOWN: &str = "Unknown";

/// Bounding box for a detected face, in frame pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl BoundingBox {
    pub fn right(&self) -> f32 {
        self.x + self.width
    }

    pub fn bottom(&self) -> f32 {
        self.y + self.height
    }
}

/// Face embedding vector (128-dimensional for dlib-style encoders).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    /// Embeddings that can be compared with each other: same non-zero length.
    pub fn is_comparable(&self, other: &Embedding) -> bool {
        !self.values.is_empty() && self.values.len() == other.values.len()
    }

    /// Compute Euclidean distance between two embeddings.
    ///
    /// Lower = more similar. Empty embeddings and embeddings of different
    /// length are infinitely far apart, so they never fall within a tolerance.
    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        if !self.is_comparable(other) {
            return f32::INFINITY;
        }
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }
}

/// One face region produced by the analyzer for a frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedFace {
    #[serde(rename = "box")]
    pub bbox: BoundingBox,
    pub embedding: Embedding,
}

/// A single enrolled embedding and the identity it belongs to.
#[derive(Debug, Clone, PartialEq)]
pub struct KnownFace {
    pub name: String,
    pub embedding: Embedding,
}

/// Ordered collection of enrolled (name, embedding) pairs.
///
/// Order is the store's order and determines vote tie-breaks, so it is
/// never re-sorted.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KnownFaceSet {
    faces: Vec<KnownFace>,
}

impl KnownFaceSet {
    pub fn new(faces: Vec<KnownFace>) -> Self {
        Self { faces }
    }

    pub fn iter(&self) -> impl Iterator<Item = &KnownFace> {
        self.faces.iter()
    }

    /// Number of enrolled embeddings.
    pub fn len(&self) -> usize {
        self.faces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.faces.is_empty()
    }

    /// Distinct identity names, in first-seen order.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = Vec::new();
        for face in &self.faces {
            if !names.contains(&face.name.as_str()) {
                names.push(&face.name);
            }
        }
        names
    }
}

impl FromIterator<(String, Embedding)> for KnownFaceSet {
    fn from_iter<I: IntoIterator<Item = (String, Embedding)>>(iter: I) -> Self {
        Self::new(
            iter.into_iter()
                .map(|(name, embedding)| KnownFace { name, embedding })
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_euclidean_distance_identical() {
        let a = Embedding::new(vec![0.1, 0.2, 0.3]);
        assert!(a.euclidean_distance(&a).abs() < 1e-6);
    }

    #[test]
    fn test_euclidean_distance_unit() {
        let a = Embedding::new(vec![0.0, 0.0]);
        let b = Embedding::new(vec![3.0, 4.0]);
        assert!((a.euclidean_distance(&b) - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_euclidean_distance_length_mismatch_is_infinite() {
        let a = Embedding::new(vec![0.0, 0.0]);
        let b = Embedding::new(vec![0.0, 0.0, 0.0]);
        assert_eq!(a.euclidean_distance(&b), f32::INFINITY);
        assert_eq!(b.euclidean_distance(&a), f32::INFINITY);
    }

    #[test]
    fn test_euclidean_distance_empty_is_infinite() {
        let empty = Embedding::new(Vec::new());
        assert_eq!(empty.euclidean_distance(&empty), f32::INFINITY);
        assert_eq!(empty.euclidean_distance(&Embedding::new(vec![1.0])), f32::INFINITY);
    }

    #[test]
    fn test_known_face_set_names_keep_first_seen_order() {
        let set: KnownFaceSet = [
            ("bob".to_string(), Embedding::new(vec![1.0])),
            ("alice".to_string(), Embedding::new(vec![2.0])),
            ("bob".to_string(), Embedding::new(vec![3.0])),
        ]
        .into_iter()
        .collect();

        assert_eq!(set.len(), 3);
        assert_eq!(set.names(), vec!["bob", "alice"]);
    }

    #[test]
    fn test_detected_face_wire_format() {
        let json = r#"{"box":{"x":1.0,"y":2.0,"width":3.0,"height":4.0},"embedding":[0.5,0.25]}"#;
        let face: DetectedFace = serde_json::from_str(json).unwrap();
        assert_eq!(face.bbox.right(), 4.0);
        assert_eq!(face.bbox.bottom(), 6.0);
        assert_eq!(face.embedding.values, vec![0.5, 0.25]);
    }
}
