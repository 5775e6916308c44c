//! Purchase-size similarity clustering
//!
//! Single-pass greedy clustering over purchase amounts. Each cluster is
//! anchored at the amount that created it; a new amount joins the first
//! cluster (in creation order) whose anchor lies within the tolerance.
//! The anchor never moves, so the result depends only on the amount list.

use serde::{Deserialize, Serialize};

/// Outcome of clustering one aggregate's purchase amounts
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SimilarityResult {
    /// Dominant cluster reached the minimum size
    pub has_similar_sizes: bool,
    /// Members in the dominant cluster
    pub similar_count: usize,
    /// Largest deviation (percent) of a dominant-cluster member from its anchor
    pub size_tolerance_percent: f64,
    /// Anchor amount of the dominant cluster
    pub dominant_anchor_usd: f64,
    /// Total clusters formed
    pub cluster_count: usize,
}

#[derive(Debug)]
struct Cluster {
    anchor: f64,
    members: usize,
    max_deviation_pct: f64,
}

/// Relative distance of `amount` from `anchor`, in percent.
fn deviation_pct(anchor: f64, amount: f64) -> f64 {
    if anchor <= 0.0 {
        return if amount == anchor { 0.0 } else { f64::INFINITY };
    }
    (amount - anchor).abs() / anchor * 100.0
}

/// Cluster `amounts` and report the dominant cluster.
///
/// Ties on member count go to the cluster created first.
pub fn cluster_amounts(
    amounts: &[f64],
    tolerance_percent: f64,
    min_similar_purchases: usize,
) -> SimilarityResult {
    let mut clusters: Vec<Cluster> = Vec::new();

    for &amount in amounts {
        let joined = clusters.iter().enumerate().find_map(|(idx, cluster)| {
            let deviation = deviation_pct(cluster.anchor, amount);
            (deviation <= tolerance_percent).then_some((idx, deviation))
        });

        match joined {
            Some((idx, deviation)) => {
                let cluster = &mut clusters[idx];
                cluster.members += 1;
                cluster.max_deviation_pct = cluster.max_deviation_pct.max(deviation);
            }
            None => clusters.push(Cluster {
                anchor: amount,
                members: 1,
                max_deviation_pct: 0.0,
            }),
        }
    }

    // Ties keep the earlier cluster
    let dominant = clusters.iter().fold(None::<&Cluster>, |best, cluster| match best {
        Some(b) if b.members >= cluster.members => Some(b),
        _ => Some(cluster),
    });

    match dominant {
        Some(cluster) => SimilarityResult {
            has_similar_sizes: cluster.members >= min_similar_purchases,
            similar_count: cluster.members,
            size_tolerance_percent: cluster.max_deviation_pct,
            dominant_anchor_usd: cluster.anchor,
            cluster_count: clusters.len(),
        },
        None => SimilarityResult::default(),
    }
}
