use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::Result;
use lspcall::{
    CANCEL_REQUEST_METHOD, ErrorCode, Launcher, MethodKind, MethodRegistry, NO_PARAMS,
    RequestContext, ServiceEndpoint, Session, SessionError, SessionOptions, bail_public,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt, BufReader, duplex, split},
    sync::oneshot,
    time::{sleep, timeout},
};

#[derive(Debug, Serialize, Deserialize)]
struct HelloRequest {
    name: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct HelloResponse {
    message: String,
}

#[derive(Default)]
struct Server {
    shown: Mutex<Vec<String>>,
    dropped: Mutex<Option<oneshot::Sender<()>>>,
}

fn server_registry() -> MethodRegistry<Server> {
    MethodRegistry::builder()
        .request("hello", |_: Arc<Server>, r: HelloRequest, _| async move {
            Ok(HelloResponse {
                message: format!("Hello, {}!", r.name),
            })
        })
        .request("sum", |_: Arc<Server>, (a, b): (i64, i64), _| async move {
            Ok(a + b)
        })
        .request(
            "greet_back",
            |_: Arc<Server>, (): (), cx: RequestContext| async move {
                let name: String = cx.session().request("name", NO_PARAMS).await?;
                cx.session()
                    .notification("window/showMessage", Some(&format!("hi {name}")))?;
                Ok(name)
            },
        )
        .request("slow", |s: Arc<Server>, (): (), _| async move {
            let _guard = s.dropped.lock().unwrap().take();
            sleep(Duration::from_secs(3600)).await;
            Ok(())
        })
        .request("checked", |_: Arc<Server>, n: i64, cx: RequestContext| async move {
            cx.check_cancelled()?;
            if n < 0 {
                bail_public!(ErrorCode::INVALID_PARAMS, "negative: {n}");
            }
            Ok(n)
        })
        .segment("window")
        .notification("showMessage", |s: &Server, text: String| {
            s.shown.lock().unwrap().push(text);
            Ok(())
        })
        .build()
}

#[derive(Default)]
struct Client {
    shown: Mutex<Vec<String>>,
}

fn client_registry() -> MethodRegistry<Client> {
    MethodRegistry::builder()
        .request("name", |_: Arc<Client>, (): (), _| async move {
            Ok("Alice".to_string())
        })
        .notification("window/showMessage", |c: &Client, text: String| {
            c.shown.lock().unwrap().push(text);
            Ok(())
        })
        .build()
}

fn channel() -> (Session, Session, Arc<ServiceEndpoint<Client>>) {
    let client_local = Arc::new(ServiceEndpoint::new(Client::default(), client_registry()));
    let (client, server) = Session::new_channel(
        client_local.clone(),
        ServiceEndpoint::new(Server::default(), server_registry()),
        &SessionOptions::default(),
    );
    (client, server, client_local)
}

#[tokio::test]
async fn server_wait() -> Result<()> {
    let (client, server) = Session::new_channel((), (), &SessionOptions::default());
    drop(client);
    server.wait().await?;
    Ok(())
}

#[tokio::test]
async fn client_to_server_request() -> Result<()> {
    let (client, server, _) = channel();
    let response: HelloResponse = client
        .request(
            "hello",
            Some(&HelloRequest {
                name: "Alice".to_string(),
            }),
        )
        .await?;
    assert_eq!(response.message, "Hello, Alice!");
    drop(client);
    server.wait().await?;
    Ok(())
}

#[tokio::test]
async fn concurrent_requests() -> Result<()> {
    let (client, _server, _) = channel();
    let (a, b, c) = tokio::join!(
        client.request::<i64>("sum", Some(&(1, 2))),
        client.request::<i64>("sum", Some(&(3, 4))),
        client.request::<i64>("sum", Some(&(5, 6))),
    );
    assert_eq!((a?, b?, c?), (3, 7, 11));
    Ok(())
}

#[tokio::test]
async fn server_calls_back_into_client() -> Result<()> {
    let (client, _server, client_local) = channel();
    let name: String = client.request("greet_back", NO_PARAMS).await?;
    assert_eq!(name, "Alice");
    // the notification is written before the response
    assert_eq!(*client_local.service().shown.lock().unwrap(), ["hi Alice"]);
    Ok(())
}

#[tokio::test]
async fn unknown_method() -> Result<()> {
    let (client, _server, _) = channel();
    let e = client.request::<Value>("nope", NO_PARAMS).await.unwrap_err();
    assert_eq!(e.error_object().unwrap().code, ErrorCode::METHOD_NOT_FOUND);
    Ok(())
}

#[tokio::test]
async fn public_handler_error() -> Result<()> {
    let (client, _server, _) = channel();
    let e = client.request::<i64>("checked", Some(&-1)).await.unwrap_err();
    let eo = e.error_object().unwrap();
    assert_eq!(eo.code, ErrorCode::INVALID_PARAMS);
    assert_eq!(eo.message, "negative: -1");
    Ok(())
}

#[tokio::test]
async fn cancel_request_stops_remote_handler() -> Result<()> {
    let (dropped_tx, dropped_rx) = oneshot::channel();
    let server = Server {
        dropped: Mutex::new(Some(dropped_tx)),
        ..Server::default()
    };
    let (client, _server) = Session::new_channel(
        (),
        ServiceEndpoint::new(server, server_registry()),
        &SessionOptions::default(),
    );
    let call = client.remote().call("slow", NO_PARAMS)?;
    sleep(Duration::from_millis(50)).await;
    call.cancel();
    assert!(matches!(call.await, Err(SessionError::Cancelled)));
    timeout(Duration::from_secs(5), dropped_rx).await?.unwrap_err();

    // the session keeps working
    let n: i64 = client.request("sum", Some(&(1, 1))).await?;
    assert_eq!(n, 2);
    Ok(())
}

#[tokio::test]
async fn notification_to_server() -> Result<()> {
    let server_local = Arc::new(ServiceEndpoint::new(Server::default(), server_registry()));
    let (client, _server) =
        Session::new_channel((), server_local.clone(), &SessionOptions::default());
    client.notification("window/showMessage", Some(&"one"))?;
    client.notification("window/showMessage", Some(&"two"))?;
    // a request round trip orders after both notifications
    let _: i64 = client.request("sum", Some(&(0, 0))).await?;
    assert_eq!(*server_local.service().shown.lock().unwrap(), ["one", "two"]);
    Ok(())
}

#[tokio::test]
async fn shutdown_fails_pending_requests() -> Result<()> {
    let (client, _server) = Session::new_channel(
        (),
        ServiceEndpoint::new(Server::default(), server_registry()),
        &SessionOptions::default(),
    );
    let call = client.remote().call("slow", NO_PARAMS)?;
    let remote = client.remote();
    client.shutdown().await?;
    assert!(matches!(call.await, Err(SessionError::Shutdown)));
    assert!(matches!(
        remote.notification("window/showMessage", Some(&"late")),
        Err(SessionError::Shutdown)
    ));
    Ok(())
}

#[tokio::test]
async fn remote_interface_is_checked() -> Result<()> {
    let (d0, d1) = duplex(1024);
    let (r0, w0) = split(d0);
    let (r1, w1) = split(d1);
    let interface = server_registry().interface().clone();
    let client = Launcher::new(())
        .remote_interface(interface)
        .launch(BufReader::new(r0), w0);
    let _server = Session::new(
        ServiceEndpoint::new(Server::default(), server_registry()),
        BufReader::new(r1),
        w1,
        &SessionOptions::default(),
    );

    let e = client.request::<Value>("nope", NO_PARAMS).await.unwrap_err();
    assert!(matches!(e, SessionError::UnknownMethod(ref m) if m == "nope"));

    let e = client.notification("sum", NO_PARAMS).unwrap_err();
    assert!(matches!(
        e,
        SessionError::MethodKindMismatch {
            expected: MethodKind::Request,
            actual: MethodKind::Notification,
            ..
        }
    ));

    let n: i64 = client.request("sum", Some(&(2, 3))).await?;
    assert_eq!(n, 5);
    Ok(())
}

#[tokio::test]
async fn raw_stream_bytes() -> Result<()> {
    let (d0, d1) = duplex(1024);
    let (r0, w0) = split(d0);
    let (mut r1, mut w1) = split(d1);
    let _server = Session::new(
        ServiceEndpoint::new(Server::default(), server_registry()),
        BufReader::new(r0),
        w0,
        &SessionOptions::default(),
    );

    let body = r#"{"jsonrpc":"2.0","id":"1","method":"sum","params":[2,3]}"#;
    w1.write_all(format!("Content-Length: {}\r\n\r\n{body}", body.len()).as_bytes())
        .await?;

    let expected_body = r#"{"jsonrpc":"2.0","id":"1","result":5}"#;
    let expected = format!(
        "Content-Length: {}\r\n\r\n{expected_body}",
        expected_body.len()
    );
    let mut buf = vec![0; expected.len()];
    r1.read_exact(&mut buf).await?;
    assert_eq!(String::from_utf8(buf)?, expected);
    Ok(())
}

#[tokio::test]
async fn malformed_frames_are_skipped() -> Result<()> {
    let (d0, d1) = duplex(1024);
    let (r0, w0) = split(d0);
    let (r1, mut w1) = split(d1);
    let errors = Arc::new(Mutex::new(Vec::new()));
    let errors_ = errors.clone();
    let _server = Launcher::new(ServiceEndpoint::new(Server::default(), server_registry()))
        .error_listener(move |e| errors_.lock().unwrap().push(e.to_string()))
        .launch(BufReader::new(r0), w0);

    w1.write_all(b"Content-Length: abc\r\n\r\n").await?;
    let bad = r#"{"jsonrpc":"2.0","id":9,"method":"sum","result":1}"#;
    w1.write_all(format!("Content-Length: {}\r\n\r\n{bad}", bad.len()).as_bytes())
        .await?;
    w1.write_all(b"Content-Length: 5\r\n\r\n{oops").await?;
    let client = Session::new((), BufReader::new(r1), w1, &SessionOptions::default());

    let n: i64 = client.request("sum", Some(&(20, 22))).await?;
    assert_eq!(n, 42);
    assert_eq!(errors.lock().unwrap().len(), 3);
    Ok(())
}

#[tokio::test]
async fn peer_cancel_of_finished_request_is_reported() -> Result<()> {
    let errors = Arc::new(Mutex::new(Vec::new()));
    let errors_ = errors.clone();
    let (d0, d1) = duplex(1024);
    let (r0, w0) = split(d0);
    let (r1, w1) = split(d1);
    let _server = Launcher::new(())
        .error_listener(move |e| errors_.lock().unwrap().push(e.to_string()))
        .launch(BufReader::new(r0), w0);
    let client = Session::new((), BufReader::new(r1), w1, &SessionOptions::default());

    client.notification(CANCEL_REQUEST_METHOD, Some(&serde_json::json!({"id": 42})))?;
    let _ = client.request::<Value>("ping", NO_PARAMS).await;
    assert_eq!(
        *errors.lock().unwrap(),
        ["unmatched cancel notification for request id 42"]
    );
    Ok(())
}

#[tokio::test]
async fn oversized_frame_is_skipped() -> Result<()> {
    let (d0, d1) = duplex(1024);
    let (r0, w0) = split(d0);
    let (mut r1, mut w1) = split(d1);
    let errors = Arc::new(Mutex::new(Vec::new()));
    let errors_ = errors.clone();
    let options = SessionOptions {
        max_content_length: Some(64),
        ..SessionOptions::default()
    };
    let _server = Launcher::new(ServiceEndpoint::new(Server::default(), server_registry()))
        .options(&options)
        .error_listener(move |e| errors_.lock().unwrap().push(e.to_string()))
        .launch(BufReader::new(r0), w0);

    let body = r#"{"jsonrpc":"2.0","id":"1","method":"sum","params":[2,3]}"#;
    w1.write_all(b"Content-Length: 18446744073709551615\r\n\r\n").await?;
    w1.write_all(format!("Content-Length: {}\r\n\r\n{body}", body.len()).as_bytes())
        .await?;

    let expected_body = r#"{"jsonrpc":"2.0","id":"1","result":5}"#;
    let expected = format!(
        "Content-Length: {}\r\n\r\n{expected_body}",
        expected_body.len()
    );
    let mut buf = vec![0; expected.len()];
    r1.read_exact(&mut buf).await?;
    assert_eq!(String::from_utf8(buf)?, expected);
    assert_eq!(
        *errors.lock().unwrap(),
        ["Content-Length 18446744073709551615 exceeds the limit of 64 bytes"]
    );
    Ok(())
}
