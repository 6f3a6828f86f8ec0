use lspcall::{ErrorCode, Launcher, ProtocolError, Result, Session, SessionOptions};
use tokio::io::{AsyncWriteExt, BufReader, duplex, split};

#[tokio::main]
async fn main() -> Result<()> {
    let (d0, d1) = duplex(1024);
    let (r0, w0) = split(d0);
    let (r1, mut w1) = split(d1);
    let server = Launcher::new(())
        .error_listener(|e: &ProtocolError| eprintln!("server: {e}"))
        .launch(BufReader::new(r0), w0);

    // not a frame, then a frame whose body is not JSON
    w1.write_all(b"aaa\n\r\n").await?;
    w1.write_all(b"Content-Length: 3\r\n\r\naaa").await?;
    w1.flush().await?;

    let client = Session::new((), BufReader::new(r1), w1, &SessionOptions::default());
    let e = client
        .request::<()>("hello", lspcall::NO_PARAMS)
        .await
        .unwrap_err();
    assert_eq!(e.error_object().map(|e| e.code), Some(ErrorCode::METHOD_NOT_FOUND));
    println!("{e}");

    client.shutdown().await?;
    server.wait().await?;
    Ok(())
}
