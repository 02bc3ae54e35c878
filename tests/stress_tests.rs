use std::collections::HashSet;
use std::sync::Arc;

use bytes::Bytes;
use protorpc::callsets::test_rpc;
use protorpc::codec::encode_fields;
use protorpc::sequence::SequenceGenerator;
use protorpc::{
    CallOptions, CallsetDef, CallsetHandle, Client, ClientConfig, Connection, FieldType,
    OperationSpec, Record, ReplyFrame, RequestFrame, Result, RpcError, Server, ServerConfig,
    Value,
};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Duration};
use tokio_test::{assert_err, assert_ok};

struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// A client wired to a raw peer connection the test drives by hand.
async fn duplex_client() -> Result<(Arc<Client>, CallsetHandle, Connection)> {
    let (local, remote) = tokio::io::duplex(64 * 1024);
    let client = Client::new(Connection::from_stream(local, "duplex"), None);
    let handle = client.register(test_rpc::definition(), 1).await?;
    Ok((
        Arc::new(client),
        handle,
        Connection::from_stream(remote, "peer"),
    ))
}

fn add_args(a: i32, b: i32) -> Record {
    Record::new().with("a", a).with("b", b)
}

fn sum_reply(sequence: u32, sum: i32) -> Result<ReplyFrame> {
    let spec = test_rpc::definition()
        .find(test_rpc::ADD)
        .cloned()
        .ok_or_else(|| RpcError::schema("add is missing"))?;
    let payload = encode_fields(&spec.name, &spec.reply, &Record::new().with("sum", sum))?;
    Ok(ReplyFrame::success(sequence, payload))
}

#[tokio::test]
async fn test_concurrent_calls_over_one_connection() -> Result<()> {
    let mut server = Server::new(ServerConfig::default());
    let addr = server.bind("127.0.0.1:0").await?;
    test_rpc::install(&server).await?;
    server.serve().await?;

    let config = ClientConfig {
        address: Some(addr.to_string()),
        call_timeout_ms: Some(10_000),
        ..ClientConfig::default()
    };
    let client = Arc::new(Client::connect(&config).await?);
    let handle = client.register(test_rpc::definition(), 1).await?;

    let mut tasks = Vec::new();
    for i in 0..100i32 {
        let client = Arc::clone(&client);
        let handle = handle.clone();
        tasks.push(tokio::spawn(async move {
            let reply = client
                .invoke(&handle, test_rpc::ADD, add_args(i, i * 1000))
                .await?;
            Ok::<_, RpcError>((i, reply.into_result()?))
        }));
    }

    for task in tasks {
        let (i, result) = task.await.unwrap()?;
        assert_eq!(result.get("sum"), Some(&Value::Int32(i * 1001)));
    }
    assert_eq!(client.pending_calls(), 0);

    client.close().await;
    server.shutdown().await
}

#[tokio::test]
async fn test_replies_out_of_order() -> Result<()> {
    let (client, handle, peer) = duplex_client().await?;

    let calls: Vec<_> = (0..10i32)
        .map(|i| {
            let client = Arc::clone(&client);
            let handle = handle.clone();
            tokio::spawn(async move {
                client
                    .invoke(&handle, test_rpc::ADD, add_args(i, 0))
                    .await
                    .and_then(|reply| reply.into_result())
            })
        })
        .collect();

    let mut requests = Vec::new();
    for _ in 0..10 {
        requests.push(peer.receive::<RequestFrame>().await?);
    }
    // Answer newest first, echoing back the `a` argument as the sum.
    for request in requests.into_iter().rev() {
        let spec = handle.operation(test_rpc::ADD)?;
        let args = protorpc::codec::decode_fields(&spec.args, request.payload)?;
        let a = args.get("a").and_then(Value::as_i64).unwrap_or_default() as i32;
        peer.send(&sum_reply(request.sequence, a)?).await?;
    }

    for (i, call) in calls.into_iter().enumerate() {
        let result = call.await.unwrap()?;
        assert_eq!(result.get("sum"), Some(&Value::Int32(i as i32)));
    }
    Ok(())
}

#[tokio::test]
async fn test_close_fails_every_pending_call() -> Result<()> {
    let (client, handle, peer) = duplex_client().await?;

    let calls: Vec<_> = (0..20i32)
        .map(|i| {
            let client = Arc::clone(&client);
            let handle = handle.clone();
            tokio::spawn(async move { client.invoke(&handle, test_rpc::ADD, add_args(i, i)).await })
        })
        .collect();

    // Wait until every request is on the wire, so all 20 are pending.
    for _ in 0..20 {
        peer.receive::<RequestFrame>().await?;
    }
    assert_eq!(client.pending_calls(), 20);

    client.close().await;
    for call in calls {
        let result = call.await.unwrap();
        assert!(matches!(result, Err(RpcError::ConnectionClosed)));
    }
    assert_eq!(client.pending_calls(), 0);
    Ok(())
}

#[tokio::test]
async fn test_peer_hangup_fails_pending_calls() -> Result<()> {
    let (client, handle, peer) = duplex_client().await?;

    let call = {
        let client = Arc::clone(&client);
        let handle = handle.clone();
        tokio::spawn(async move { client.invoke(&handle, test_rpc::ADD, add_args(1, 2)).await })
    };
    peer.receive::<RequestFrame>().await?;
    peer.close().await;
    drop(peer);

    let result = call.await.unwrap();
    assert!(matches!(result, Err(RpcError::ConnectionClosed)));

    // Later calls fail immediately instead of hanging.
    let result = timeout(
        Duration::from_secs(5),
        client.invoke(&handle, test_rpc::ADD, add_args(1, 2)),
    )
    .await
    .unwrap();
    assert!(matches!(result, Err(RpcError::ConnectionClosed)));
    assert!(client.is_closed());
    Ok(())
}

#[tokio::test]
async fn test_timeout_leaves_connection_open() -> Result<()> {
    let (client, handle, peer) = duplex_client().await?;

    let result = client
        .invoke_with(
            &handle,
            test_rpc::ADD,
            add_args(1, 2),
            CallOptions::default().with_timeout(Duration::from_millis(50)),
        )
        .await;
    assert!(matches!(result, Err(RpcError::Timeout(_))));
    assert!(result.unwrap_err().is_retryable());
    assert_eq!(client.pending_calls(), 0);
    assert!(!client.is_closed());

    // The stale request is still readable; answer the next call only.
    let stale = peer.receive::<RequestFrame>().await?;
    let responder = AbortOnDrop(tokio::spawn(async move {
        let request = peer.receive::<RequestFrame>().await?;
        peer.send(&sum_reply(stale.sequence, -1)?).await?;
        peer.send(&sum_reply(request.sequence, 7)?).await?;
        Ok::<_, RpcError>(peer)
    }));

    let reply = client.invoke(&handle, test_rpc::ADD, add_args(3, 4)).await?;
    assert_eq!(reply.into_result()?.get("sum"), Some(&Value::Int32(7)));
    drop(responder);
    Ok(())
}

#[tokio::test]
async fn test_unknown_sequence_is_dropped() -> Result<()> {
    let (client, handle, peer) = duplex_client().await?;

    let _responder = AbortOnDrop(tokio::spawn(async move {
        let request = peer.receive::<RequestFrame>().await?;
        peer.send(&sum_reply(request.sequence.wrapping_add(1000), 1)?)
            .await?;
        peer.send(&ReplyFrame::success(0xdead_beef, Bytes::new()))
            .await?;
        peer.send(&sum_reply(request.sequence, 2)?).await?;
        Ok::<_, RpcError>(peer)
    }));

    let reply = client.invoke(&handle, test_rpc::ADD, add_args(1, 1)).await?;
    assert_eq!(reply.into_result()?.get("sum"), Some(&Value::Int32(2)));
    assert!(!client.is_closed());
    Ok(())
}

#[tokio::test]
async fn test_dropped_call_releases_pending_entry() -> Result<()> {
    let (client, handle, peer) = duplex_client().await?;

    let call = {
        let client = Arc::clone(&client);
        let handle = handle.clone();
        tokio::spawn(async move { client.invoke(&handle, test_rpc::ADD, add_args(1, 2)).await })
    };
    let request = peer.receive::<RequestFrame>().await?;
    assert_eq!(client.pending_calls(), 1);

    call.abort();
    assert_err!(call.await);
    assert_eq!(client.pending_calls(), 0);

    // A reply for the abandoned call is harmless.
    assert_ok!(peer.send(&sum_reply(request.sequence, 3)?).await);
    sleep(Duration::from_millis(50)).await;
    assert!(!client.is_closed());
    Ok(())
}

#[tokio::test]
async fn test_argument_errors_send_nothing() -> Result<()> {
    let (client, handle, peer) = duplex_client().await?;

    let result = client
        .invoke(&handle, test_rpc::ADD, Record::new().with("a", 1i32))
        .await;
    assert!(matches!(result, Err(RpcError::ArgumentType { .. })));

    let result = client
        .invoke(
            &handle,
            test_rpc::SET_STRUCT,
            Record::new().with("var_uint32_array", vec![1u32; 9]),
        )
        .await;
    assert!(matches!(result, Err(RpcError::ArgumentType { .. })));

    let received = timeout(Duration::from_millis(100), peer.receive::<RequestFrame>()).await;
    assert!(received.is_err(), "no request should reach the peer");
    assert_eq!(client.pending_calls(), 0);
    Ok(())
}

#[tokio::test]
async fn test_no_reply_does_not_register_waiter() -> Result<()> {
    let (client, handle, peer) = duplex_client().await?;

    for _ in 0..10 {
        let reply = client
            .invoke_with(
                &handle,
                test_rpc::SET_STRUCT,
                test_rpc::demo_struct(),
                CallOptions::no_reply(),
            )
            .await?;
        assert!(matches!(reply, protorpc::Reply::NoReply));
    }
    assert_eq!(client.pending_calls(), 0);

    let mut sequences = HashSet::new();
    for _ in 0..10 {
        let request = peer.receive::<RequestFrame>().await?;
        assert_eq!(request.callset_id, test_rpc::ID);
        assert!(sequences.insert(request.sequence));
    }
    Ok(())
}

fn bulk_callset() -> CallsetDef {
    CallsetDef::new("BulkCallset", 21)
        .operation(OperationSpec::new("put", 1).arg("data", FieldType::bytes()))
        .operation(OperationSpec::new("ping", 2))
}

#[tokio::test]
async fn test_cancelled_write_closes_connection() -> Result<()> {
    // A small pipe the peer never drains, so a large frame stalls part way out.
    let (local, remote) = tokio::io::duplex(64);
    let client = Client::new(Connection::from_stream(local, "duplex"), None);
    let _peer = Connection::from_stream(remote, "peer");
    let bulk = client.register(bulk_callset(), 1).await?;

    let result = timeout(
        Duration::from_millis(50),
        client.invoke(
            &bulk,
            "put",
            Record::new().with("data", Bytes::from(vec![0xabu8; 4096])),
        ),
    )
    .await;
    assert!(result.is_err(), "the write should still be stalled");
    assert!(client.is_closed());
    assert_eq!(client.pending_calls(), 0);

    // Nothing may follow the partial frame on the stream.
    let result = client
        .invoke_with(&bulk, "ping", Record::new(), CallOptions::no_reply())
        .await;
    assert!(matches!(result, Err(RpcError::ConnectionClosed)));
    let result = client.invoke(&bulk, "ping", Record::new()).await;
    assert!(matches!(result, Err(RpcError::ConnectionClosed)));

    client.close().await;
    Ok(())
}

#[tokio::test]
async fn test_write_error_fails_pending_calls() -> Result<()> {
    let (client, handle, peer) = duplex_client().await?;

    let waiting = {
        let client = Arc::clone(&client);
        let handle = handle.clone();
        tokio::spawn(async move { client.invoke(&handle, test_rpc::ADD, add_args(1, 2)).await })
    };
    peer.receive::<RequestFrame>().await?;
    drop(peer);

    // Either the write fails or the hangup is seen first; both close the client.
    let result = client.invoke(&handle, test_rpc::ADD, add_args(3, 4)).await;
    assert!(matches!(
        result,
        Err(RpcError::Io(_)) | Err(RpcError::ConnectionClosed)
    ));

    let result = timeout(Duration::from_secs(5), waiting).await;
    assert!(matches!(result, Ok(Ok(Err(RpcError::ConnectionClosed)))));
    assert!(client.is_closed());
    assert_eq!(client.pending_calls(), 0);
    Ok(())
}

#[tokio::test]
async fn test_sequence_numbers_unique_across_threads() {
    let generator = Arc::new(SequenceGenerator::new());
    let mut handles = vec![];

    for _ in 0..8 {
        let generator = Arc::clone(&generator);
        handles.push(tokio::spawn(async move {
            (0..1000).map(|_| generator.next()).collect::<Vec<_>>()
        }));
    }

    let mut all = HashSet::new();
    for handle in handles {
        for sequence in handle.await.unwrap() {
            assert!(all.insert(sequence), "duplicate sequence {}", sequence);
        }
    }
    assert_eq!(all.len(), 8000);
}
