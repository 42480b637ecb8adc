use std::time::Duration;

use observer::test_util::wait_until;

use crate::{Network, inbound, poll_until};

#[observer_macros::test]
async fn late_joiner_recovers_quorum_state(mut network: Network) {
    for node in &network.nodes {
        node.report(inbound("tx-6", 9)).await;
    }
    wait_until(Duration::from_secs(5), || network.tx_submissions().len() == 3)
        .await
        .unwrap();
    // Let every validator record the third attestation too.
    wait_until(Duration::from_secs(5), || {
        network.nodes.iter().all(|n| n.node.broadcaster().pending_len() == 0)
    })
    .await
    .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let key = network.random_key();
    let index = network.add_node(key).await;
    let joiner = network.node(index).node.engine().clone();
    poll_until(Duration::from_secs(5), || {
        let joiner = joiner.clone();
        async move {
            let states = joiner.attestation_states().await;
            states.observed_txs.len() == 1 && states.observed_txs[0].attestations == 3
        }
    })
    .await;

    network.shutdown().await;
}

#[observer_macros::test]
async fn nothing_to_recover_without_quorum(mut network: Network) {
    network.node(0).report(inbound("tx-7", 9)).await;
    wait_until(Duration::from_secs(5), || {
        network.nodes.iter().all(|n| n.node.engine().state_counts()[0] == 1)
    })
    .await
    .unwrap();

    let key = network.random_key();
    let index = network.add_node(key).await;
    // Past the sync delay.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(network.node(index).node.engine().state_counts(), [0; 4]);

    network.shutdown().await;
}
