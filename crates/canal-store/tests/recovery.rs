//! Crash-recovery scenario: snapshot, further logged ticks, kill, reload,
//! replay. The recovered server must be bit-exact with the original.

use canal_core::tx::{AccountTx, EntityTx};
use canal_core::types::{EntityId, SignerId, TokenId};
use canal_crypto::Keypair;
use canal_entity::{EntityConfig, EntityInput};
use canal_server::{RoutedInput, Server};
use canal_store::NodeStore;

const USD: TokenId = 1;

fn temp_dir(name: &str) -> std::path::PathBuf {
    let dir = std::env::temp_dir().join(format!("canal_recovery_{name}_{}", std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    dir
}

fn signer_entity(seed: &[u8]) -> (Keypair, EntityId, SignerId) {
    let kp = Keypair::from_seed(seed);
    let signer = kp.signer_id;
    (kp, EntityId::from_signer(signer), signer)
}

fn build_server() -> Server {
    let (kp_a, alice, sa) = signer_entity(b"alice");
    let (kp_b, bob, sb) = signer_entity(b"bob");
    let mut server = Server::new();
    server.register_signer(kp_a);
    server.register_signer(kp_b);
    server.add_entity(alice, EntityConfig::single(sa), &[(USD, 1_000_000)]);
    server.add_entity(bob, EntityConfig::single(sb), &[(USD, 1_000_000)]);
    server
}

fn payment_input(from: (EntityId, SignerId), to: EntityId, txs: Vec<AccountTx>) -> RoutedInput {
    RoutedInput::new(
        &from.0,
        &from.1,
        EntityInput::AddTx(EntityTx::SubmitAccountTx { peer: to, txs }),
    )
}

/// Log each tick's inputs, run it, and return the inputs for reuse.
fn logged_tick(store: &mut NodeStore, server: &mut Server, now: i64, inputs: Vec<RoutedInput>) {
    store
        .log_tick(server.height + 1, now, &inputs)
        .expect("log tick");
    let remote = server.tick(now, inputs);
    assert!(remote.is_empty());
}

fn replica_blobs(server: &Server) -> Vec<(String, Vec<u8>)> {
    server
        .replicas
        .iter()
        .map(|(key, replica)| (key.clone(), bincode::serialize(replica).unwrap()))
        .collect()
}

#[test]
fn snapshot_plus_replay_reproduces_state_exactly() {
    let dir = temp_dir("replay");
    let (_, alice, sa) = signer_entity(b"alice");
    let (_, bob, _) = signer_entity(b"bob");

    let mut store = NodeStore::open(&dir).unwrap();
    let mut server = build_server();

    // Tick 1: open the channel; tick 2: pay. Snapshot between them.
    logged_tick(
        &mut store,
        &mut server,
        1_000,
        vec![payment_input(
            (alice, sa),
            bob,
            vec![AccountTx::OpenChannel {
                token_id: USD,
                left_credit_limit: 10_000,
                right_credit_limit: 10_000,
            }],
        )],
    );
    store.checkpoint(&server).unwrap();

    logged_tick(
        &mut store,
        &mut server,
        2_000,
        vec![payment_input(
            (alice, sa),
            bob,
            vec![AccountTx::DirectPayment {
                token_id: USD,
                amount: 100,
                from_left: alice < bob,
            }],
        )],
    );
    logged_tick(
        &mut store,
        &mut server,
        3_000,
        vec![payment_input(
            (alice, sa),
            bob,
            vec![AccountTx::DirectPayment {
                token_id: USD,
                amount: 250,
                from_left: alice < bob,
            }],
        )],
    );

    let expected = replica_blobs(&server);
    let expected_height = server.height;
    drop(server);
    drop(store);

    // "Crash": reopen everything from disk and replay past the snapshot.
    let store = NodeStore::open(&dir).unwrap();
    let recovered = store
        .recover(vec![Keypair::from_seed(b"alice"), Keypair::from_seed(b"bob")])
        .unwrap();

    assert_eq!(recovered.height, expected_height);
    assert_eq!(
        replica_blobs(&recovered),
        expected,
        "replayed state must be bit-exact"
    );
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn recovery_without_snapshot_replays_from_genesis() {
    let dir = temp_dir("genesis");
    let (_, alice, sa) = signer_entity(b"alice");
    let (_, bob, _) = signer_entity(b"bob");

    let mut store = NodeStore::open(&dir).unwrap();
    let mut server = build_server();
    logged_tick(
        &mut store,
        &mut server,
        1_000,
        vec![payment_input(
            (alice, sa),
            bob,
            vec![AccountTx::OpenChannel {
                token_id: USD,
                left_credit_limit: 500,
                right_credit_limit: 500,
            }],
        )],
    );

    let expected = replica_blobs(&server);
    drop(server);
    drop(store);

    let store = NodeStore::open(&dir).unwrap();
    let recovered = store
        .recover(vec![Keypair::from_seed(b"alice"), Keypair::from_seed(b"bob")])
        .unwrap();
    // Without a snapshot there are no replicas to rebuild from, so the
    // host seeds the fleet again before replay.
    assert_eq!(recovered.height, 0);
    assert!(recovered.replicas.is_empty());

    // With the fleet seeded the replay reproduces the state.
    let mut seeded = build_server();
    assert_eq!(store.replay_onto(&mut seeded).unwrap(), 1);
    assert_eq!(replica_blobs(&seeded), expected);
    let _ = std::fs::remove_dir_all(&dir);
}
