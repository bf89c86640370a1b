//! End-to-end tests: listener, RPC client and plugin host over loopback TCP

use rand::RngCore;
use std::sync::Arc;
use std::time::Duration;
use tierio_common::{BackendKind, Error};
use tierio_plugin::{MemoryStore, PluginHost, PluginListener, RemoteBackend, RpcClient};
use tierio_storage::Backend;

async fn start_listener() -> (Arc<RpcClient>, String) {
    let client = Arc::new(RpcClient::new(Duration::from_secs(5), 1));
    let listener = PluginListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let plugin_listener = Arc::new(PluginListener::new(client.clone(), 1 << 20));
    tokio::spawn(plugin_listener.serve(listener));
    (client, addr)
}

#[tokio::test]
async fn test_remote_roundtrip() {
    let (client, addr) = start_listener().await;
    let host = PluginHost::new("mem", Arc::new(MemoryStore::new(64 * 1024)));
    let handle = host.connect(&addr).await.unwrap();
    client
        .wait_registered("mem", Duration::from_secs(5))
        .await
        .unwrap();

    let backend = RemoteBackend::new("mem", client.clone());
    assert!(backend.is_ready());
    assert_eq!(backend.kind(), BackendKind::Remote);
    assert_eq!(backend.size_bytes().await.unwrap(), 64 * 1024);

    let mut payload = vec![0u8; 4096];
    rand::thread_rng().fill_bytes(&mut payload);
    backend.write(8192, &payload).await.unwrap();
    assert_eq!(&backend.read(8192, 4096).await.unwrap()[..], &payload[..]);

    // out-of-range requests fail on the plugin and come back as errors
    assert!(matches!(
        backend.read(64 * 1024, 1).await,
        Err(Error::Storage(_))
    ));

    handle.stop().await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), async {
        while client.is_registered("mem") {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert!(!backend.is_ready());
    assert!(matches!(
        backend.read(0, 1).await,
        Err(Error::BackendUnreachable(_))
    ));
    assert_eq!(client.pending_count(), 0);
}

#[tokio::test]
async fn test_reconnect_replaces_registration() {
    let (client, addr) = start_listener().await;

    let first = PluginHost::new("store", Arc::new(MemoryStore::new(4096)))
        .connect(&addr)
        .await
        .unwrap();
    client
        .wait_registered("store", Duration::from_secs(5))
        .await
        .unwrap();

    let second_store = Arc::new(MemoryStore::new(8192));
    let _second = PluginHost::new("store", second_store)
        .connect(&addr)
        .await
        .unwrap();

    // the newer connection serves the name once its REGISTER is processed
    let backend = RemoteBackend::new("store", client.clone());
    tokio::time::timeout(Duration::from_secs(5), async {
        while backend.size_bytes().await.unwrap() != 8192 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    // the old connection going away leaves the new registration alone
    first.stop().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(client.is_registered("store"));
}
