//! Immutable per-collection vector index snapshots.
//!
//! A snapshot is built once from the full live chunk set of a collection and
//! never mutated; rebuilds construct a fresh snapshot off to the side and the
//! owner swaps a pointer. Search is cosine similarity in `f32` (the precision
//! embedding models emit), with scores clamped to `[0, 1]`.
//!
//! Small snapshots are searched by exact scan. Above a cutoff the build step
//! adds a centroid-partitioned structure (inverted-file style): chunks are
//! assigned to `⌈√n⌉` centroids by a few deterministic Lloyd iterations, and
//! a query probes only the closest partitions. The number of probed
//! partitions depends on the snapshot alone, so for a fixed snapshot and
//! query the candidate set is fixed: raising the threshold can only shrink
//! the result list, and raising `k` can only extend it.

use thiserror::Error;

use crate::models::Chunk;

/// Entry count at or below which search scans every vector exactly.
const EXACT_SCAN_LIMIT: usize = 256;

/// Lloyd iteration cap for centroid refinement.
const MAX_KMEANS_ITERS: usize = 8;

/// Structural failure while building a snapshot. Fatal to that rebuild
/// attempt only; the previously active snapshot keeps serving.
#[derive(Debug, Error)]
pub enum IndexBuildError {
    #[error("embedding dimension mismatch for chunk {chunk_id}: expected {expected}, got {got}")]
    DimensionMismatch {
        chunk_id: String,
        expected: usize,
        got: usize,
    },
    #[error("snapshot requires a non-zero embedding dimension")]
    ZeroDimension,
}

/// A chunk paired with its embedding, ready for indexing.
#[derive(Debug, Clone)]
pub struct EmbeddedChunk {
    pub chunk: Chunk,
    pub vector: Vec<f32>,
}

/// An indexed chunk inside a snapshot.
#[derive(Debug, Clone)]
pub struct IndexEntry {
    pub chunk: Chunk,
    pub vector: Vec<f32>,
    norm: f32,
}

#[derive(Debug)]
struct Partition {
    centroid: Vec<f32>,
    centroid_norm: f32,
    members: Vec<usize>,
}

/// A scored match from [`IndexSnapshot::search`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoredEntry {
    /// Index into [`IndexSnapshot::entries`].
    pub entry: usize,
    /// Cosine similarity clamped to `[0, 1]`.
    pub score: f32,
}

/// An immutable, point-in-time vector index for one collection.
#[derive(Debug)]
pub struct IndexSnapshot {
    version: u64,
    dims: usize,
    entries: Vec<IndexEntry>,
    partitions: Vec<Partition>,
}

impl IndexSnapshot {
    /// An empty snapshot. Searching it returns no results, which is how a
    /// collection with no indexed documents answers queries.
    pub fn empty(version: u64, dims: usize) -> Self {
        Self {
            version,
            dims,
            entries: Vec::new(),
            partitions: Vec::new(),
        }
    }

    /// Build a snapshot over the given chunk embeddings.
    ///
    /// Pure function of its input set: the same chunks and vectors always
    /// produce an identical snapshot. Entries are ordered by chunk id so
    /// downstream tie-breaking is stable.
    pub fn build(
        version: u64,
        dims: usize,
        chunks: Vec<EmbeddedChunk>,
    ) -> Result<Self, IndexBuildError> {
        if dims == 0 {
            return Err(IndexBuildError::ZeroDimension);
        }

        let mut entries: Vec<IndexEntry> = Vec::with_capacity(chunks.len());
        for ec in chunks {
            if ec.vector.len() != dims {
                return Err(IndexBuildError::DimensionMismatch {
                    chunk_id: ec.chunk.id,
                    expected: dims,
                    got: ec.vector.len(),
                });
            }
            let norm = l2_norm(&ec.vector);
            entries.push(IndexEntry {
                chunk: ec.chunk,
                vector: ec.vector,
                norm,
            });
        }
        entries.sort_by(|a, b| a.chunk.id.cmp(&b.chunk.id));

        let partitions = if entries.len() > EXACT_SCAN_LIMIT {
            build_partitions(&entries, dims)
        } else {
            Vec::new()
        };

        Ok(Self {
            version,
            dims,
            entries,
            partitions,
        })
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn dims(&self) -> usize {
        self.dims
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All indexed entries, ordered by chunk id.
    pub fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }

    pub fn entry(&self, index: usize) -> &IndexEntry {
        &self.entries[index]
    }

    /// Ranked similarity search.
    ///
    /// Returns up to `k` entries whose clamped cosine similarity is at least
    /// `threshold`, strictly descending by score with ties broken by
    /// ascending chunk id. An empty result is not an error.
    pub fn search(&self, query: &[f32], k: usize, threshold: f32) -> Vec<ScoredEntry> {
        if self.entries.is_empty() || k == 0 || query.len() != self.dims {
            return Vec::new();
        }

        let query_norm = l2_norm(query);
        if query_norm == 0.0 {
            return Vec::new();
        }

        let mut hits: Vec<ScoredEntry> = Vec::new();
        let consider = |idx: usize, hits: &mut Vec<ScoredEntry>| {
            let entry = &self.entries[idx];
            let score = cosine_score(query, query_norm, &entry.vector, entry.norm);
            if score >= threshold {
                hits.push(ScoredEntry { entry: idx, score });
            }
        };

        if self.partitions.is_empty() {
            for idx in 0..self.entries.len() {
                consider(idx, &mut hits);
            }
        } else {
            for pidx in self.probe_order(query, query_norm) {
                for &idx in &self.partitions[pidx].members {
                    consider(idx, &mut hits);
                }
            }
        }

        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| self.entries[a.entry].chunk.id.cmp(&self.entries[b.entry].chunk.id))
        });
        hits.truncate(k);
        hits
    }

    /// The partitions to probe for a query, closest centroids first.
    ///
    /// Probes a fixed fraction of the partitions regardless of `k`, so the
    /// candidate set for a given snapshot and query never varies.
    fn probe_order(&self, query: &[f32], query_norm: f32) -> Vec<usize> {
        let mut ranked: Vec<(usize, f32)> = self
            .partitions
            .iter()
            .enumerate()
            .map(|(i, p)| (i, cosine_score(query, query_norm, &p.centroid, p.centroid_norm)))
            .collect();
        ranked.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        let nprobe = (self.partitions.len() + 3) / 4;
        ranked.truncate(nprobe.max(1));
        ranked.into_iter().map(|(i, _)| i).collect()
    }
}

/// Deterministic centroid partitioning: seed centroids evenly over the
/// id-ordered entries, then refine with bounded Lloyd iterations. Ties in
/// assignment go to the lower partition index.
fn build_partitions(entries: &[IndexEntry], dims: usize) -> Vec<Partition> {
    let n = entries.len();
    let k = (n as f64).sqrt().ceil() as usize;
    let k = k.clamp(1, n);

    let mut centroids: Vec<Vec<f32>> = (0..k)
        .map(|i| entries[i * n / k].vector.clone())
        .collect();
    let mut assignment: Vec<usize> = vec![0; n];

    for _ in 0..MAX_KMEANS_ITERS {
        let norms: Vec<f32> = centroids.iter().map(|c| l2_norm(c)).collect();
        let mut changed = false;

        for (i, entry) in entries.iter().enumerate() {
            let mut best = 0usize;
            let mut best_score = f32::NEG_INFINITY;
            for (c, centroid) in centroids.iter().enumerate() {
                let score = cosine_score(&entry.vector, entry.norm, centroid, norms[c]);
                if score > best_score {
                    best_score = score;
                    best = c;
                }
            }
            if assignment[i] != best {
                assignment[i] = best;
                changed = true;
            }
        }

        if !changed {
            break;
        }

        let mut sums: Vec<Vec<f32>> = vec![vec![0.0; dims]; k];
        let mut counts: Vec<usize> = vec![0; k];
        for (i, entry) in entries.iter().enumerate() {
            let c = assignment[i];
            for (s, v) in sums[c].iter_mut().zip(entry.vector.iter()) {
                *s += v;
            }
            counts[c] += 1;
        }
        for c in 0..k {
            if counts[c] > 0 {
                for s in sums[c].iter_mut() {
                    *s /= counts[c] as f32;
                }
                centroids[c] = std::mem::take(&mut sums[c]);
            }
            // Empty partitions keep their previous centroid.
        }
    }

    let mut partitions: Vec<Partition> = centroids
        .into_iter()
        .map(|centroid| {
            let centroid_norm = l2_norm(&centroid);
            Partition {
                centroid,
                centroid_norm,
                members: Vec::new(),
            }
        })
        .collect();
    for (i, &c) in assignment.iter().enumerate() {
        partitions[c].members.push(i);
    }
    partitions.retain(|p| !p.members.is_empty());
    partitions
}

fn l2_norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

/// Cosine similarity clamped to `[0, 1]`. Zero for degenerate vectors.
fn cosine_score(a: &[f32], a_norm: f32, b: &[f32], b_norm: f32) -> f32 {
    if a_norm < f32::EPSILON || b_norm < f32::EPSILON || a.len() != b.len() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    (dot / (a_norm * b_norm)).clamp(0.0, 1.0)
}
