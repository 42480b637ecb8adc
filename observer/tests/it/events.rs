use std::{collections::HashMap, time::Duration};

use observer::{bridge::ConsensusEvent, message::QuorumMessage, test_util::wait_until};

use crate::{Network, inbound, poll_until};

#[observer_macros::test]
async fn committed_transactions_leave_the_deck(network: Network) {
    wait_until(Duration::from_secs(5), || network.bridge.subscriptions() == 3)
        .await
        .unwrap();
    for node in &network.nodes {
        node.report(inbound("tx-5", 40)).await;
    }
    wait_until(Duration::from_secs(5), || network.tx_submissions().len() == 3)
        .await
        .unwrap();
    for node in &network.nodes {
        assert_eq!(node.deck_len().await, 1);
    }

    // The chain commits the observation with every validator's signature.
    let mut attestations = HashMap::new();
    let mut committed = None;
    for submission in network.tx_submissions() {
        let QuorumMessage::Tx(quorum) = submission else {
            unreachable!();
        };
        for attestation in quorum.attestations {
            attestations.insert(attestation.pub_key, attestation);
        }
        committed = Some(quorum.obs_tx);
    }
    assert_eq!(attestations.len(), 3);
    network.bridge.publish(ConsensusEvent::QuorumTxCommitted {
        obs_tx: committed.unwrap(),
        inbound: true,
        attestations: attestations.into_values().collect(),
    });

    let nodes = &network.nodes;
    poll_until(Duration::from_secs(5), || async move {
        let mut empty = true;
        for node in nodes {
            empty &= node.deck_len().await == 0;
        }
        empty
    })
    .await;

    network.shutdown().await;
}

#[observer_macros::test]
async fn lost_subscriptions_are_reopened(network: Network) {
    wait_until(Duration::from_secs(5), || network.bridge.subscriptions() == 3)
        .await
        .unwrap();

    network.bridge.drop_subscriptions();
    // The first retry waits a second.
    wait_until(Duration::from_secs(5), || network.bridge.subscriptions() == 6)
        .await
        .unwrap();

    network.shutdown().await;
}
