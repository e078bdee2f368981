//! Similarity index: nearest-enrollment lookup over face embeddings.
//!
//! The [`SimilarityIndex`] trait is the seam between the match pipeline and
//! whatever holds the enrolled vectors (the SQL store, the in-memory
//! fallback, or an approximate index later). Every implementation answers
//! with the same typed [`Neighbor`] under the same [`DistanceMetric`].

use crate::types::{DistanceMetric, Embedding};
use std::sync::RwLock;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum IndexError {
    #[error("student {0} already has an enrolled face")]
    Conflict(i64),
    #[error("embedding dimension mismatch: index holds {expected}-dim vectors, got {got}")]
    DimensionMismatch { expected: usize, got: usize },
    #[error("index unavailable: {0}")]
    Unavailable(String),
}

/// Nearest enrolled embedding and its distance under the index metric.
#[derive(Debug, Clone, PartialEq)]
pub struct Neighbor {
    pub student_id: i64,
    pub distance: f32,
}

/// Read side of the enrollment set.
///
/// Implementations are exact today (linear scan, SQL scan); an approximate
/// nearest-neighbor index can slot in behind the same signature once the
/// enrollment count warrants it.
pub trait SimilarityIndex {
    /// Dimension every stored vector has.
    fn dimension(&self) -> usize;

    /// Metric this index measures distance with.
    fn metric(&self) -> DistanceMetric;

    /// The single closest enrollment, or `None` when nothing is enrolled.
    fn nearest(&self, probe: &Embedding) -> Result<Option<Neighbor>, IndexError>;
}

/// Exhaustive scan over (id, vector) pairs.
///
/// Shared by every exact implementation so the primary path and any
/// fallback measure with literally the same code. Ties keep the first
/// entry in iteration order.
pub fn scan_nearest<'a, I>(probe: &[f32], entries: I, metric: DistanceMetric) -> Option<Neighbor>
where
    I: IntoIterator<Item = (i64, &'a [f32])>,
{
    let mut best: Option<Neighbor> = None;
    for (student_id, values) in entries {
        let distance = metric.distance(probe, values);
        let closer = match &best {
            None => true,
            Some(b) => distance < b.distance,
        };
        if closer {
            best = Some(Neighbor { student_id, distance });
        }
    }
    best
}

/// In-memory enrollment index guarded by a read-write lock.
///
/// Writers take the lock only for the duration of the vector copy, never
/// across embedding extraction, so lookups stay readable while a
/// registration is in flight.
pub struct MemoryIndex {
    dimension: usize,
    metric: DistanceMetric,
    entries: RwLock<Vec<(i64, Vec<f32>)>>,
}

impl MemoryIndex {
    pub fn new(dimension: usize, metric: DistanceMetric) -> Self {
        Self {
            dimension,
            metric,
            entries: RwLock::new(Vec::new()),
        }
    }

    /// Insert an enrollment. Rejects duplicate student ids and vectors of
    /// the wrong dimension, leaving the index unchanged in both cases.
    pub fn insert(&self, student_id: i64, embedding: &Embedding) -> Result<(), IndexError> {
        if embedding.dimension() != self.dimension {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimension,
                got: embedding.dimension(),
            });
        }
        let mut entries = self
            .entries
            .write()
            .map_err(|_| IndexError::Unavailable("index lock poisoned".to_string()))?;
        if entries.iter().any(|(id, _)| *id == student_id) {
            return Err(IndexError::Conflict(student_id));
        }
        entries.push((student_id, embedding.values.clone()));
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SimilarityIndex for MemoryIndex {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn metric(&self) -> DistanceMetric {
        self.metric
    }

    fn nearest(&self, probe: &Embedding) -> Result<Option<Neighbor>, IndexError> {
        if probe.dimension() != self.dimension {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimension,
                got: probe.dimension(),
            });
        }
        let entries = self
            .entries
            .read()
            .map_err(|_| IndexError::Unavailable("index lock poisoned".to_string()))?;
        Ok(scan_nearest(
            &probe.values,
            entries.iter().map(|(id, v)| (*id, v.as_slice())),
            self.metric,
        ))
    }
}
