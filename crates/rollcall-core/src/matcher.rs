//! Nearest-neighbour search of a query embedding against the gallery.
//!
//! [`ExactScan`] is the reference behaviour: a linear scan in gallery order
//! keeping a running minimum, so the first identity reaching the minimum wins a
//! tie. The gallery order is the store's insertion order; if the gallery is
//! mutated between loads, ties may resolve differently.
//!
//! [`IvfIndex`] trades exactness for fewer comparisons by scanning only the
//! closest inverted lists. Both sit behind [`GalleryIndex`] so callers keep the
//! same contract whichever is configured.

use crate::types::{Embedding, Identity, IdentityKey};

/// Default maximum Euclidean distance for a positive match.
pub const DEFAULT_MATCH_THRESHOLD: f32 = 1.3;

const KMEANS_ITERATIONS: usize = 8;

/// Result of matching a query embedding against a gallery.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    /// `None` means Unknown.
    pub identity: Option<IdentityKey>,
    /// Distance to the nearest candidate (`f32::INFINITY` for an empty gallery).
    pub distance: f32,
}

impl MatchResult {
    pub fn is_known(&self) -> bool {
        self.identity.is_some()
    }
}

/// A searchable snapshot of the gallery.
pub trait GalleryIndex: Send + Sync {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Nearest identity among the candidates this index scans, with its distance.
    fn nearest(&self, query: &Embedding) -> Option<(&Identity, f32)>;
}

/// Match `query` and apply the threshold: `distance > threshold` ⇒ Unknown.
pub fn match_query(index: &dyn GalleryIndex, query: &Embedding, threshold: f32) -> MatchResult {
    match index.nearest(query) {
        Some((identity, distance)) if distance <= threshold => MatchResult {
            identity: Some(identity.key()),
            distance,
        },
        Some((_, distance)) => MatchResult {
            identity: None,
            distance,
        },
        None => MatchResult {
            identity: None,
            distance: f32::INFINITY,
        },
    }
}

fn scan<'a>(
    gallery: &'a [Identity],
    candidates: impl Iterator<Item = usize>,
    query: &Embedding,
) -> Option<(&'a Identity, f32)> {
    let mut best: Option<(usize, f32)> = None;
    for i in candidates {
        let d = query.euclidean_distance(&gallery[i].embedding);
        // Strict comparison: the earliest index keeps a tie.
        if best.map_or(true, |(_, best_d)| d < best_d) {
            best = Some((i, d));
        }
    }
    best.map(|(i, d)| (&gallery[i], d))
}

/// Linear scan over every identity.
pub struct ExactScan {
    gallery: Vec<Identity>,
}

impl ExactScan {
    pub fn new(gallery: Vec<Identity>) -> Self {
        Self { gallery }
    }
}

impl GalleryIndex for ExactScan {
    fn len(&self) -> usize {
        self.gallery.len()
    }

    fn nearest(&self, query: &Embedding) -> Option<(&Identity, f32)> {
        scan(&self.gallery, 0..self.gallery.len(), query)
    }
}

/// Inverted-file index over a k-means coarse quantiser.
///
/// Centroids are seeded from evenly spaced gallery entries so the build is
/// deterministic for a given gallery order.
pub struct IvfIndex {
    gallery: Vec<Identity>,
    centroids: Vec<Vec<f32>>,
    lists: Vec<Vec<usize>>,
    scan_lists: usize,
}

fn squared_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| (x - y).powi(2)).sum()
}

fn nearest_centroid(centroids: &[Vec<f32>], v: &[f32]) -> usize {
    let mut best = 0;
    let mut best_d = f32::INFINITY;
    for (c, centroid) in centroids.iter().enumerate() {
        let d = squared_distance(centroid, v);
        if d < best_d {
            best_d = d;
            best = c;
        }
    }
    best
}

impl IvfIndex {
    pub fn build(gallery: Vec<Identity>, lists: usize, scan_lists: usize) -> Self {
        let n = gallery.len();
        let k = lists.max(1).min(n);
        let mut centroids: Vec<Vec<f32>> = (0..k)
            .map(|c| gallery[c * n / k].embedding.values.clone())
            .collect();

        let mut assignment = vec![0usize; n];
        for _ in 0..KMEANS_ITERATIONS {
            for (i, identity) in gallery.iter().enumerate() {
                assignment[i] = nearest_centroid(&centroids, &identity.embedding.values);
            }
            for (c, centroid) in centroids.iter_mut().enumerate() {
                let members: Vec<&Vec<f32>> = gallery
                    .iter()
                    .zip(assignment.iter())
                    .filter(|&(_, &a)| a == c)
                    .map(|(id, _)| &id.embedding.values)
                    .collect();
                // An empty cell keeps its previous centroid.
                if members.is_empty() {
                    continue;
                }
                for (d, value) in centroid.iter_mut().enumerate() {
                    *value = members.iter().map(|m| m.get(d).copied().unwrap_or(0.0)).sum::<f32>()
                        / members.len() as f32;
                }
            }
        }

        let mut inverted = vec![Vec::new(); k];
        for (i, identity) in gallery.iter().enumerate() {
            inverted[nearest_centroid(&centroids, &identity.embedding.values)].push(i);
        }

        tracing::debug!(identities = n, lists = k, scan_lists, "built IVF gallery index");

        Self {
            gallery,
            centroids,
            lists: inverted,
            scan_lists: scan_lists.max(1),
        }
    }
}

impl GalleryIndex for IvfIndex {
    fn len(&self) -> usize {
        self.gallery.len()
    }

    fn nearest(&self, query: &Embedding) -> Option<(&Identity, f32)> {
        let mut ranked: Vec<(usize, f32)> = self
            .centroids
            .iter()
            .enumerate()
            .map(|(c, centroid)| (c, squared_distance(centroid, &query.values)))
            .collect();
        ranked.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));

        let mut candidates: Vec<usize> = ranked
            .iter()
            .take(self.scan_lists)
            .flat_map(|(c, _)| self.lists[*c].iter().copied())
            .collect();
        // Scan in gallery order so ties resolve as in the exact scan.
        candidates.sort_unstable();
        scan(&self.gallery, candidates.into_iter(), query)
    }
}

/// Matching strategy selected by configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatcherKind {
    ExactScan,
    ApproximateIndex { lists: usize, scan_lists: usize },
}

impl MatcherKind {
    pub fn build(self, gallery: Vec<Identity>) -> Box<dyn GalleryIndex> {
        match self {
            MatcherKind::ExactScan => Box::new(ExactScan::new(gallery)),
            MatcherKind::ApproximateIndex { lists, scan_lists } => {
                Box::new(IvfIndex::build(gallery, lists, scan_lists))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn identity(name: &str, values: Vec<f32>) -> Identity {
        Identity {
            id: name.to_string(),
            name: name.to_string(),
            group: "g".to_string(),
            embedding: Embedding::new(values),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_exact_scan_finds_minimum_anywhere() {
        let gallery = vec![
            identity("decoy1", vec![0.0, 1.0, 0.0]),
            identity("decoy2", vec![0.0, 0.0, 1.0]),
            identity("match", vec![1.0, 0.0, 0.0]),
        ];
        let index = ExactScan::new(gallery);
        let query = Embedding::new(vec![0.9, 0.1, 0.0]);

        let result = match_query(&index, &query, DEFAULT_MATCH_THRESHOLD);
        assert_eq!(result.identity.unwrap().name, "match");
        assert!(result.distance < 0.2);
    }

    #[test]
    fn test_exact_scan_first_wins_tie() {
        let gallery = vec![
            identity("first", vec![1.0, 0.0]),
            identity("second", vec![-1.0, 0.0]),
        ];
        let index = ExactScan::new(gallery);
        let query = Embedding::new(vec![0.0, 0.0]);

        let result = match_query(&index, &query, DEFAULT_MATCH_THRESHOLD);
        assert_eq!(result.identity.unwrap().name, "first");
    }

    #[test]
    fn test_distance_above_threshold_is_unknown() {
        let index = ExactScan::new(vec![identity("far", vec![2.0, 0.0])]);
        let query = Embedding::new(vec![0.0, 0.0]);

        let result = match_query(&index, &query, DEFAULT_MATCH_THRESHOLD);
        assert!(!result.is_known());
        assert!((result.distance - 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_distance_at_threshold_is_known() {
        let index = ExactScan::new(vec![identity("edge", vec![1.25, 0.0])]);
        let query = Embedding::new(vec![0.0, 0.0]);
        assert!(match_query(&index, &query, 1.25).is_known());
    }

    #[test]
    fn test_empty_gallery_is_unknown() {
        let index = ExactScan::new(Vec::new());
        let result = match_query(&index, &Embedding::new(vec![1.0]), DEFAULT_MATCH_THRESHOLD);
        assert!(!result.is_known());
        assert!(result.distance.is_infinite());
    }

    #[test]
    fn test_ivf_agrees_with_exact_on_clustered_gallery() {
        let mut gallery = Vec::new();
        for i in 0..10 {
            let jitter = i as f32 * 0.01;
            gallery.push(identity(&format!("a{i}"), vec![1.0 + jitter, 0.0]));
            gallery.push(identity(&format!("b{i}"), vec![-1.0 - jitter, 0.0]));
        }
        let exact = ExactScan::new(gallery.clone());
        let ivf = IvfIndex::build(gallery, 2, 1);

        for query in [vec![1.04, 0.05], vec![-1.07, -0.02], vec![0.95, 0.0]] {
            let query = Embedding::new(query);
            let a = match_query(&exact, &query, DEFAULT_MATCH_THRESHOLD);
            let b = match_query(&ivf, &query, DEFAULT_MATCH_THRESHOLD);
            assert_eq!(a.identity, b.identity);
            assert!((a.distance - b.distance).abs() < 1e-6);
        }
    }

    #[test]
    fn test_ivf_lists_capped_by_gallery_size() {
        let gallery = vec![identity("only", vec![0.5, 0.5])];
        let ivf = IvfIndex::build(gallery, 16, 4);
        assert_eq!(ivf.lists.len(), 1);
        let result = match_query(&ivf, &Embedding::new(vec![0.5, 0.4]), DEFAULT_MATCH_THRESHOLD);
        assert_eq!(result.identity.unwrap().name, "only");
    }

    #[test]
    fn test_ivf_empty_gallery() {
        let ivf = MatcherKind::ApproximateIndex { lists: 4, scan_lists: 2 }.build(Vec::new());
        assert!(ivf.is_empty());
        assert!(ivf.nearest(&Embedding::new(vec![0.0])).is_none());
    }
}
