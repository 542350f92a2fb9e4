//! End-to-end ceremony tests: a real hub on an ephemeral port, driven by
//! real device clients over WebSockets.

use k256::ecdsa::signature::hazmat::PrehashVerifier;
use k256::ecdsa::VerifyingKey;
use k256::elliptic_curve::sec1::ToEncodedPoint;
use k256::elliptic_curve::PrimeField;
use k256::ProjectivePoint;
use sha3::{Digest, Keccak256};
use sigil_client::{Client, ClientError};
use sigil_core::{decimal_to_scalar, scalar_to_decimal, SERVER_ID};
use sigil_svc::auth::StaticAuth;
use sigil_svc::vault::{MemoryStore, Vault};
use sigil_svc::{router, AppState, ServiceConfig};
use std::sync::Arc;

async fn start_hub() -> (Client, String) {
    let auth = StaticAuth::new([("b", "u"), ("b2", "u2")]);
    let state = AppState::new(
        Vault::new(MemoryStore::new()),
        Arc::new(auth),
        ServiceConfig::default(),
    );
    let app = router(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind ephemeral port");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });

    let host = format!("http://{addr}");
    (Client::new(&host), host)
}

#[tokio::test(flavor = "multi_thread")]
async fn identify_resolves_the_mocked_user() {
    let (client, _) = start_hub().await;
    assert_eq!(client.identify("b").await.unwrap(), "u");
    assert!(matches!(
        client.identify("wrong").await,
        Err(ClientError::Unauthorized)
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn dkg_happy_path() {
    let (client, _) = start_hub().await;
    let (wallet, metadata) = client.dkg("b").await.unwrap();

    assert_ne!(wallet.pubkey.x, "0");
    assert_ne!(wallet.pubkey.y, "0");
    assert_eq!(wallet.bks.len(), 2);
    assert!(wallet.bks.contains_key(SERVER_ID));
    assert!(wallet.bks.contains_key(&wallet.peer_id));
    assert!(!wallet.share.is_empty());
    assert!(wallet.address.starts_with("0x"));
    assert_eq!(wallet.address.len(), 42);

    // the custody key is a 32-byte hex string
    assert_eq!(metadata.len(), 64);
    assert!(hex::decode(&metadata).is_ok());
}

#[tokio::test(flavor = "multi_thread")]
async fn duplicate_dkg_is_a_conflict() {
    let (client, _) = start_hub().await;
    client.dkg("b").await.unwrap();
    assert!(matches!(client.dkg("b").await, Err(ClientError::Conflict)));

    // a different user is free to create its own wallet
    client.dkg("b2").await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn sign_produces_a_verifiable_ethereum_signature() {
    let (client, _) = start_hub().await;
    let (wallet, metadata) = client.dkg("b").await.unwrap();

    let digest: [u8; 32] = Keccak256::digest(b"test").into();
    let signature = client.sign("b", &digest, &wallet, &metadata).await.unwrap();

    let bytes = signature.to_bytes();
    assert_eq!(bytes.len(), 65);
    assert!(signature.v == 0 || signature.v == 1);

    // standard ECDSA verification of (r, s) against the wallet key
    let point = wallet.pubkey.to_point().unwrap();
    let verifying_key = VerifyingKey::from_affine(point.to_affine()).unwrap();
    let sig = k256::ecdsa::Signature::from_slice(&bytes[..64]).unwrap();
    verifying_key.verify_prehash(&digest, &sig).unwrap();

    // canonical low-s
    assert!(sig.normalize_s().is_none(), "s must already be low");
}

#[tokio::test(flavor = "multi_thread")]
async fn sign_with_wrong_metadata_is_rejected() {
    let (client, _) = start_hub().await;
    let (wallet, _metadata) = client.dkg("b").await.unwrap();

    let digest: [u8; 32] = Keccak256::digest(b"test").into();
    let wrong = hex::encode([1u8; 32]);
    assert!(matches!(
        client.sign("b", &digest, &wallet, &wrong).await,
        Err(ClientError::Unauthorized)
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn add_share_enrolls_a_third_device() {
    let (client, _) = start_hub().await;
    let (existing_wallet, metadata) = client.dkg("b").await.unwrap();

    // The two device sessions run concurrently and meet at the hub; the
    // joining device must dial first, since it opens the rendezvous.
    let accept = async {
        tokio::time::sleep(std::time::Duration::from_millis(300)).await;
        client.accept_device("b", &existing_wallet, &metadata).await
    };
    let (new_result, accept_result) =
        tokio::join!(client.register_device("b", "integration-test-device"), accept);
    let (new_wallet, new_metadata) = new_result.unwrap();
    let refreshed_wallet = accept_result.unwrap();

    // metadata is constant per wallet
    assert_eq!(new_metadata, metadata);

    // all participants agree on the widened keyset
    let expected: Vec<&str> = {
        let mut ids = vec![
            SERVER_ID,
            existing_wallet.peer_id.as_str(),
            new_wallet.peer_id.as_str(),
        ];
        ids.sort();
        ids
    };
    for wallet in [&new_wallet, &refreshed_wallet] {
        let keys: Vec<&str> = wallet.bks.keys().map(String::as_str).collect();
        assert_eq!(keys, expected);
        assert_eq!(wallet.pubkey, existing_wallet.pubkey);
        assert_eq!(wallet.address, existing_wallet.address);
    }
    assert_eq!(new_wallet.bks, refreshed_wallet.bks);

    // the enrolled device can sign with the unchanged custody key
    let digest: [u8; 32] = Keccak256::digest(b"post-enrolment").into();
    let signature = client
        .sign("b", &digest, &new_wallet, &new_metadata)
        .await
        .unwrap();
    let point = new_wallet.pubkey.to_point().unwrap();
    let verifying_key = VerifyingKey::from_affine(point.to_affine()).unwrap();
    let sig = k256::ecdsa::Signature::from_slice(&signature.to_bytes()[..64]).unwrap();
    verifying_key.verify_prehash(&digest, &sig).unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn recovery_reconstructs_the_wallet_secret() {
    let (client, _) = start_hub().await;
    let (wallet, metadata) = client.dkg("b").await.unwrap();

    let private_key_hex = client.export("b", &wallet, &metadata).await.unwrap();
    let bytes: [u8; 32] = hex::decode(&private_key_hex)
        .expect("hex private key")
        .try_into()
        .expect("32 bytes");
    let private_key: k256::Scalar =
        Option::from(k256::Scalar::from_repr(bytes.into())).expect("canonical scalar");

    let derived = ProjectivePoint::GENERATOR * private_key;
    assert_eq!(
        derived.to_affine().to_encoded_point(false),
        wallet
            .pubkey
            .to_point()
            .unwrap()
            .to_affine()
            .to_encoded_point(false)
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn recovery_with_a_tampered_share_fails() {
    let (client, _) = start_hub().await;
    let (mut wallet, metadata) = client.dkg("b").await.unwrap();

    let share = decimal_to_scalar(&wallet.share).unwrap();
    wallet.share = scalar_to_decimal(&(share + k256::Scalar::ONE));

    assert!(matches!(
        client.export("b", &wallet, &metadata).await,
        Err(ClientError::BadRequest)
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn access_tokens_are_single_use() {
    let (client, host) = start_hub().await;
    let (wallet, metadata) = client.dkg("b").await.unwrap();

    let token = client.authorize("b", Some(&metadata)).await.unwrap();
    let http = reqwest::Client::new();
    let url = format!("{host}/recover?token={token}");
    let form = [
        ("share", wallet.share.as_str()),
        ("clientPeerID", wallet.peer_id.as_str()),
    ];

    let first = http.post(&url).form(&form).send().await.unwrap();
    assert_eq!(first.status().as_u16(), 200);

    // the consumed token no longer authorises anything
    let second = http.post(&url).form(&form).send().await.unwrap();
    assert_eq!(second.status().as_u16(), 401);
}
