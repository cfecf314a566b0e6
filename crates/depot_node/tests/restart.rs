mod common;

use std::sync::Arc;

use blob_depot::agent::{PutRequest, RangeRequest};
use bytes::Bytes;
use depot_node::MemBlobStore;

use common::{blob_id, node_config, start, within, USER_TABLET};

#[tokio::test]
async fn committed_blobs_survive_restart_under_a_new_generation() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemBlobStore::new());
    let config = node_config(dir.path());

    let node = start(config.clone(), &store).await;
    let agent = node.agent(0).unwrap().clone();
    within(agent.put(PutRequest::new(blob_id(1, 5), Bytes::from_static(b"first"))))
        .await
        .unwrap();
    node.shutdown().await;

    let node = start(config, &store).await;
    let stats = within(node.coordinator().debug_stats()).await.unwrap();
    assert_eq!(stats.generation, 2);
    assert_eq!(stats.committed_keys, 1);

    let agent = node.agent(0).unwrap().clone();
    within(agent.put(PutRequest::new(blob_id(2, 6), Bytes::from_static(b"second"))))
        .await
        .unwrap();
    let items = within(agent.range(RangeRequest::whole_tablet(USER_TABLET)))
        .await
        .unwrap();
    let values: Vec<_> = items.into_iter().map(|item| item.data).collect();
    assert_eq!(
        values,
        vec![Bytes::from_static(b"first"), Bytes::from_static(b"second")]
    );

    node.shutdown().await;
}
