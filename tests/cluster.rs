// tests/cluster.rs
use chrono::{Duration, Utc};

use cryptowire::cluster::{cluster_recent, ClusterQuery, ClusterSignal};
use cryptowire::dedup::normalize_url;
use cryptowire::store::{ArticleStatus, NewArticle, SourceKind, SourceSpec, Store};

/// `(title, url, hours ago)`; returns the stored ids in input order.
async fn store_articles(rows: &[(&str, &str, i64)]) -> (Store, Vec<i64>) {
    let store = Store::in_memory().await.unwrap();
    let source = store
        .upsert_source(&SourceSpec {
            name: "CoinDesk".into(),
            kind: SourceKind::Rss,
            url: "https://www.coindesk.com/arc/outboundfeeds/rss/".into(),
            enabled: true,
        })
        .await
        .unwrap();
    let mut ids = Vec::new();
    for (i, (title, url, hours_ago)) in rows.iter().enumerate() {
        let id = store
            .insert_article(&NewArticle {
                source_id: source.id,
                url: url.to_string(),
                url_normalized: normalize_url(url),
                title_original: title.to_string(),
                hash: format!("cluster-{i}"),
                published_at: Some(Utc::now() - Duration::hours(*hours_ago)),
                status: ArticleStatus::Pending,
                summary: None,
            })
            .await
            .unwrap()
            .unwrap();
        ids.push(id);
    }
    (store, ids)
}

#[tokio::test]
async fn stored_near_duplicates_cluster_by_title() {
    let (store, ids) = store_articles(&[
        ("Ethereum gas fees fall to multi-year low", "https://a.com/gas", 1),
        ("Ethereum gas fees fall to multi-year lows", "https://b.com/gas", 2),
        ("Ethereum gas fees fall to a multi-year low", "https://c.com/gas", 3),
        ("Bitcoin tops 100k for the first time", "https://a.com/btc", 4),
        ("Bitcoin tops 100k for the first time!", "https://b.com/btc", 5),
        ("Bitcoin tops 100k for the first time?", "https://c.com/btc", 30),
        ("Solana outage halts block production", "https://a.com/sol", 2),
    ])
    .await;

    let clusters = cluster_recent(&store, ClusterQuery::default()).await.unwrap();
    assert_eq!(clusters.iter().map(|c| c.size).collect::<Vec<_>>(), vec![3, 2]);

    let gas = &clusters[0];
    // Stored URLs are unique after normalization, so only titles link stored rows.
    assert_eq!(gas.signal, ClusterSignal::Title);
    assert_eq!(gas.representative_id, ids[2]);
    assert!(gas.members.iter().all(|m| m.source == "CoinDesk"));

    let btc: Vec<i64> = clusters[1].members.iter().map(|m| m.id).collect();
    assert_eq!(btc, vec![ids[4], ids[3]]);
}

#[tokio::test]
async fn window_and_limits_shape_the_result() {
    let (store, ids) = store_articles(&[
        ("Ethereum gas fees fall to multi-year low", "https://a.com/gas", 1),
        ("Ethereum gas fees fall to multi-year lows", "https://b.com/gas", 2),
        ("Ethereum gas fees fall to a multi-year low", "https://c.com/gas", 3),
        ("Bitcoin tops 100k for the first time", "https://a.com/btc", 4),
        ("Bitcoin tops 100k for the first time!", "https://b.com/btc", 5),
        ("Bitcoin tops 100k for the first time?", "https://c.com/btc", 30),
    ])
    .await;

    let wide = ClusterQuery {
        hours: 48,
        ..ClusterQuery::default()
    };
    let clusters = cluster_recent(&store, wide).await.unwrap();
    assert_eq!(clusters.len(), 2);
    // Equal sizes: the cluster with the newest member comes first.
    assert_eq!(clusters[0].representative_id, ids[2]);
    assert_eq!(clusters[1].representative_id, ids[5]);
    assert_eq!(clusters[1].size, 3);

    let top_one = ClusterQuery {
        hours: 48,
        limit: 1,
        ..ClusterQuery::default()
    };
    assert_eq!(cluster_recent(&store, top_one).await.unwrap().len(), 1);

    let strict = ClusterQuery {
        min_size: 4,
        ..ClusterQuery::default()
    };
    assert!(cluster_recent(&store, strict).await.unwrap().is_empty());

    assert!(cluster_recent(&Store::in_memory().await.unwrap(), ClusterQuery::default())
        .await
        .unwrap()
        .is_empty());
}
