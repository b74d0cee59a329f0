//! Header validation seen from the wire

mod common;

use common::*;
use spv_engine::network::NetworkMessage;
use spv_engine::*;

#[tokio::test]
async fn test_header_with_wrong_bits_disconnects_peer() {
    let params = NetworkParams::for_network(NetworkKind::MainNet);
    let checkpoint = params.last_checkpoint().unwrap().clone();
    let root = checkpoint.to_block(&HeaderHasher::double_sha256());

    // Height checkpoint + 1 is inside an interval: bits must repeat the previous block's
    let mut chain = ServedChain::new(*root.hash());
    let bad = chain.push_block(vec![unrelated_transaction(3)], &[false], MAX_TARGET_BITS);
    assert_ne!(bad.bits(), checkpoint.bits);

    let mut node = FakeNode::start(&params, chain).await;
    let kit = kit(loopback_config(NetworkKind::MainNet, node.port));
    kit.start().await.unwrap();

    node.expect(|m| matches!(m, NetworkMessage::GetHeaders(_))).await;
    node.expect_closed().await;

    assert_eq!(kit.last_block_info().map(|info| info.height), Some(checkpoint.height));
    assert_eq!(kit.last_block_info().map(|info| info.hash), Some(hash_to_hex(root.hash())));
    wait_for_state(&kit, SyncState::NotSynced).await;
    kit.stop().await;
}

#[tokio::test]
async fn test_valid_header_extends_relaxed_chain() {
    let params = NetworkParams::for_network(NetworkKind::RegTest);
    let root = params.last_checkpoint().unwrap().to_block(&HeaderHasher::double_sha256());
    let mut chain = ServedChain::new(*root.hash());
    chain.push_block(vec![unrelated_transaction(4)], &[false], REGTEST_MAX_TARGET_BITS);
    let tip = chain.push_block(vec![unrelated_transaction(5)], &[false], REGTEST_MAX_TARGET_BITS);

    let node = FakeNode::start(&params, chain).await;
    let kit = kit(loopback_config(NetworkKind::RegTest, node.port));
    kit.start().await.unwrap();
    wait_for_state(&kit, SyncState::Synced).await;

    assert_eq!(kit.last_block_info().map(|info| info.height), Some(2));
    assert_eq!(kit.last_block_info().map(|info| info.hash), Some(hash_to_hex(tip.hash())));
    assert_eq!(kit.balance(), 0);
    assert_eq!(kit.connected_peers(), 1);
    kit.stop().await;
}
