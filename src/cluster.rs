//! Duplicate-story clustering over already-ingested articles.
//!
//! Two articles are linked when they satisfy the dedup predicate (normalized URL match or title
//! similarity at or above the threshold). Connected components of at least `min_size` members
//! are reported, largest first.
//!
//! Stored articles never share a normalized URL (the column is unique), so clusters built from
//! the store link by title only. The URL signal shows up for caller-supplied candidate sets,
//! such as a fetched batch checked before insertion.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::dedup::match_signals;
use crate::store::{ClusterCandidate, Store, StoreResult};

pub const MAX_HOURS: i64 = 168;
pub const MAX_CLUSTERS: usize = 100;
/// Upper bound on articles pulled into one clustering pass.
const SCAN_LIMIT: i64 = 1_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClusterQuery {
    pub hours: i64,
    pub min_size: usize,
    pub limit: usize,
}

impl Default for ClusterQuery {
    fn default() -> Self {
        Self {
            hours: 24,
            min_size: 2,
            limit: 20,
        }
    }
}

impl ClusterQuery {
    /// Clamp into the supported ranges: hours 1..=168, min_size 2..=10, limit 1..=100.
    pub fn sanitized(self) -> Self {
        Self {
            hours: self.hours.clamp(1, MAX_HOURS),
            min_size: self.min_size.clamp(2, 10),
            limit: self.limit.clamp(1, MAX_CLUSTERS),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ClusterSignal {
    Url,
    Title,
    Both,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClusterMember {
    pub id: i64,
    pub title: String,
    pub url: String,
    pub source: String,
    pub published_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoryCluster {
    pub representative_title: String,
    pub representative_id: i64,
    pub size: usize,
    pub signal: ClusterSignal,
    pub latest_published_at: Option<DateTime<Utc>>,
    pub members: Vec<ClusterMember>,
}

struct UnionFind {
    parent: Vec<usize>,
    rank: Vec<u8>,
}

impl UnionFind {
    fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
            rank: vec![0; n],
        }
    }

    fn find(&mut self, x: usize) -> usize {
        let mut root = x;
        while self.parent[root] != root {
            root = self.parent[root];
        }
        let mut cur = x;
        while self.parent[cur] != root {
            let next = self.parent[cur];
            self.parent[cur] = root;
            cur = next;
        }
        root
    }

    fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra == rb {
            return;
        }
        match self.rank[ra].cmp(&self.rank[rb]) {
            std::cmp::Ordering::Less => self.parent[ra] = rb,
            std::cmp::Ordering::Greater => self.parent[rb] = ra,
            std::cmp::Ordering::Equal => {
                self.parent[rb] = ra;
                self.rank[ra] += 1;
            }
        }
    }
}

/// Cluster an in-memory candidate set. Representative: earliest published member, undated
/// members last, ties by lowest id.
pub fn cluster_candidates(candidates: &[ClusterCandidate], min_size: usize) -> Vec<StoryCluster> {
    let n = candidates.len();
    let mut uf = UnionFind::new(n);
    let mut url_edge = vec![false; n];
    let mut title_edge = vec![false; n];

    for i in 0..n {
        for j in (i + 1)..n {
            let (a, b) = (&candidates[i], &candidates[j]);
            let s = match_signals(&a.url_normalized, &a.title, &b.url_normalized, &b.title);
            if !s.any() {
                continue;
            }
            uf.union(i, j);
            for k in [i, j] {
                url_edge[k] |= s.url;
                title_edge[k] |= s.title;
            }
        }
    }

    let mut groups: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for i in 0..n {
        let root = uf.find(i);
        groups.entry(root).or_default().push(i);
    }

    let mut clusters: Vec<StoryCluster> = groups
        .into_values()
        .filter(|idx| idx.len() >= min_size.max(2))
        .map(|idx| {
            let mut members: Vec<&ClusterCandidate> = idx.iter().map(|&i| &candidates[i]).collect();
            members.sort_by(|a, b| match (a.published_at, b.published_at) {
                (Some(x), Some(y)) => x.cmp(&y).then(a.id.cmp(&b.id)),
                (Some(_), None) => std::cmp::Ordering::Less,
                (None, Some(_)) => std::cmp::Ordering::Greater,
                (None, None) => a.id.cmp(&b.id),
            });
            let by_url = idx.iter().any(|&i| url_edge[i]);
            let by_title = idx.iter().any(|&i| title_edge[i]);
            let signal = match (by_url, by_title) {
                (true, true) => ClusterSignal::Both,
                (true, false) => ClusterSignal::Url,
                _ => ClusterSignal::Title,
            };
            let rep = members[0];
            StoryCluster {
                representative_title: rep.title.clone(),
                representative_id: rep.id,
                size: members.len(),
                signal,
                latest_published_at: members.iter().filter_map(|m| m.published_at).max(),
                members: members
                    .into_iter()
                    .map(|m| ClusterMember {
                        id: m.id,
                        title: m.title.clone(),
                        url: m.url.clone(),
                        source: m.source.clone(),
                        published_at: m.published_at,
                    })
                    .collect(),
            }
        })
        .collect();

    clusters.sort_by(|a, b| {
        b.size
            .cmp(&a.size)
            .then(b.latest_published_at.cmp(&a.latest_published_at))
            .then(a.representative_id.cmp(&b.representative_id))
    });
    clusters
}

/// Clusters among articles of the last `query.hours` hours.
pub async fn cluster_recent(store: &Store, query: ClusterQuery) -> StoreResult<Vec<StoryCluster>> {
    let q = query.sanitized();
    let since = Utc::now() - Duration::hours(q.hours);
    let candidates = store.cluster_candidates(since, SCAN_LIMIT).await?;
    let mut clusters = cluster_candidates(&candidates, q.min_size);
    clusters.truncate(q.limit);
    tracing::debug!(
        hours = q.hours,
        scanned = candidates.len(),
        clusters = clusters.len(),
        "clustered recent articles"
    );
    Ok(clusters)
}

/// Log the top clusters every `interval`.
pub fn spawn_report(store: Store, query: ClusterQuery, interval: std::time::Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match cluster_recent(&store, query).await {
                Ok(clusters) => {
                    for c in clusters.iter().take(5) {
                        tracing::info!(
                            size = c.size,
                            signal = ?c.signal,
                            representative = %c.representative_title,
                            "story cluster"
                        );
                    }
                }
                Err(e) => tracing::warn!(error = ?e, "clustering recent articles failed"),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dedup::normalize_url;
    use chrono::TimeZone;

    fn cand(id: i64, title: &str, url: &str, hour: Option<u32>) -> ClusterCandidate {
        ClusterCandidate {
            id,
            title: title.into(),
            url: url.into(),
            url_normalized: normalize_url(url),
            published_at: hour.map(|h| Utc.with_ymd_and_hms(2025, 3, 1, h, 0, 0).unwrap()),
            source: "Feed".into(),
        }
    }

    #[test]
    fn query_is_clamped() {
        let q = ClusterQuery {
            hours: 1_000,
            min_size: 50,
            limit: 0,
        }
        .sanitized();
        assert_eq!(q, ClusterQuery { hours: 168, min_size: 10, limit: 1 });
    }

    #[test]
    fn transitive_links_form_one_component() {
        let items = vec![
            cand(1, "SEC approves spot Ether ETF applications", "https://a.com/1", Some(9)),
            cand(2, "SEC approves spot Ether ETF application", "https://b.com/2", Some(8)),
            cand(3, "Totally different headline here", "https://b.com/2?utm_source=x", Some(10)),
            cand(4, "Solana outage halts block production", "https://c.com/4", Some(7)),
        ];
        let clusters = cluster_candidates(&items, 2);
        assert_eq!(clusters.len(), 1);
        let c = &clusters[0];
        assert_eq!(c.size, 3);
        assert_eq!(c.representative_id, 2);
        assert_eq!(c.signal, ClusterSignal::Both);
    }

    #[test]
    fn min_size_filters_and_ordering_is_by_size() {
        let items = vec![
            cand(1, "Bitcoin tops 100k for the first time", "https://a.com/1", Some(1)),
            cand(2, "Bitcoin tops 100k for the first time!", "https://b.com/1", Some(2)),
            cand(3, "Ethereum gas fees fall to multi-year low", "https://a.com/3", Some(3)),
            cand(4, "Ethereum gas fees fall to multi-year lows", "https://b.com/3", Some(4)),
            cand(5, "Ethereum gas fees fall to a multi-year low", "https://c.com/3", None),
        ];
        let clusters = cluster_candidates(&items, 2);
        assert_eq!(clusters.iter().map(|c| c.size).collect::<Vec<_>>(), vec![3, 2]);
        assert_eq!(clusters[0].signal, ClusterSignal::Title);
        assert_eq!(clusters[0].representative_id, 3);
        assert!(cluster_candidates(&items, 3).len() == 1);
    }
}
