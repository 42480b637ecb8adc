use std::{collections::HashSet, time::Duration};

use observer::{
    item::{Coin, Solvency, TxId, VaultPubKey},
    message::QuorumMessage,
    test_util::wait_until,
};

use crate::{Network, btc, inbound};

#[observer_macros::test]
async fn inbound_transaction_is_submitted_once_per_validator(network: Network) {
    let tx_in = inbound("tx-1", 100);
    for node in &network.nodes {
        node.report(tx_in.clone()).await;
        // Reporting twice must not produce a second observation.
        node.report(tx_in.clone()).await;
    }

    wait_until(Duration::from_secs(5), || network.tx_submissions().len() == 3)
        .await
        .unwrap();
    // Give any duplicate submission a chance to show up.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let submissions = network.tx_submissions();
    assert_eq!(submissions.len(), 3);

    let validators: HashSet<_> = network
        .nodes
        .iter()
        .map(|n| n.secret_key.node_public_key())
        .collect();
    for submission in &submissions {
        let QuorumMessage::Tx(quorum) = submission else {
            unreachable!();
        };
        assert!(quorum.inbound);
        assert!(quorum.obs_tx.is_final());
        assert_eq!(quorum.obs_tx.tx.id.as_str(), "tx-1");
        assert_eq!(quorum.obs_tx.observed_pub_key, VaultPubKey::new(crate::VAULT));
        // Two of three is a supermajority.
        assert_eq!(quorum.attestations.len(), 2);
        assert!(quorum.attestations.iter().all(|a| validators.contains(&a.pub_key)));
    }

    for node in &network.nodes {
        let observed = node.client.observed_tx_ins();
        assert_eq!(observed.len(), 1);
        assert_eq!(observed[0].1, 100);
    }

    network.shutdown().await;
}

#[observer_macros::test]
async fn a_single_observer_is_not_enough(network: Network) {
    network.node(0).report(inbound("tx-2", 7)).await;

    wait_until(Duration::from_secs(5), || {
        network
            .nodes
            .iter()
            .all(|n| n.node.engine().state_counts()[0] == 1)
    })
    .await
    .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(network.tx_submissions().is_empty());

    // A second observer completes the supermajority everywhere, including at the node that saw nothing.
    network.node(1).report(inbound("tx-2", 7)).await;
    wait_until(Duration::from_secs(5), || network.tx_submissions().len() == 3)
        .await
        .unwrap();
    assert_eq!(network.node(2).client.observed_tx_ins(), vec![]);

    network.shutdown().await;
}

#[observer_macros::test]
async fn transactions_outside_our_vaults_are_dropped(network: Network) {
    let mut tx_in = inbound("tx-3", 12);
    let mut unrelated = tx_in.txs[0].clone();
    unrelated.tx_id = TxId::new("unrelated");
    unrelated.to = "bc1qsomeoneelse".to_owned();
    tx_in.txs.push(unrelated);
    for node in &network.nodes {
        node.report(tx_in.clone()).await;
    }

    wait_until(Duration::from_secs(5), || network.tx_submissions().len() == 3)
        .await
        .unwrap();
    for node in &network.nodes {
        // The attested item waits for its commit, the unrelated one is gone.
        assert_eq!(node.deck_len().await, 1);
        assert_eq!(node.node.engine().state_counts()[0], 1);
    }

    network.shutdown().await;
}

#[observer_macros::test]
async fn solvency_reports_reach_quorum(network: Network) {
    let solvency = Solvency {
        chain: btc(),
        height: 55,
        pub_key: VaultPubKey::new(crate::VAULT),
        coins: vec![Coin::new("BTC.BTC", 5_000_000)],
    };
    for node in &network.nodes {
        let queues = node.client.queues().unwrap();
        queues.solvencies.send(solvency.clone()).await.unwrap();
    }

    wait_until(Duration::from_secs(5), || {
        network
            .bridge
            .submissions()
            .iter()
            .filter(|m| matches!(m, QuorumMessage::Solvency(q) if q.solvency == solvency))
            .count()
            == 3
    })
    .await
    .unwrap();

    network.shutdown().await;
}

#[observer_macros::test]
async fn inactive_validators_cannot_contribute(mut network: Network) {
    let outsider = network.random_key();
    let index = network.add_node(outsider).await;
    network.node(index).report(inbound("tx-4", 3)).await;
    network.node(0).report(inbound("tx-4", 3)).await;

    wait_until(Duration::from_secs(5), || {
        network.node(1).node.engine().state_counts()[0] == 1
    })
    .await
    .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    // Only node 0's attestation counts, so nothing reaches quorum.
    assert!(network.tx_submissions().is_empty());
    assert_eq!(network.node(index).node.engine().state_counts()[0], 0);

    network.shutdown().await;
}
