use std::{sync::Arc, time::Duration};

use lspcall::{
    MethodRegistry, NO_PARAMS, RequestContext, Result, ServiceEndpoint, Session, SessionError,
    SessionOptions,
};
use tokio::time::sleep;

struct Editor;
struct Server;

#[tokio::main]
async fn main() -> Result<()> {
    let editor = MethodRegistry::builder()
        .request("workspace/configuration", |_: Arc<Editor>, (): (), _| async move {
            Ok(serde_json::json!({ "tabSize": 4 }))
        })
        .notification("window/logMessage", |_: &Editor, text: String| {
            println!("server: {text}");
            Ok(())
        })
        .build();
    let server = MethodRegistry::builder()
        .request(
            "format",
            |_: Arc<Server>, text: String, cx: RequestContext| async move {
                let config: serde_json::Value = cx
                    .session()
                    .request("workspace/configuration", NO_PARAMS)
                    .await?;
                let width = config["tabSize"].as_u64().unwrap_or(2) as usize;
                cx.session()
                    .notification("window/logMessage", Some(&format!("indent {width}")))?;
                Ok(format!("{}{text}", " ".repeat(width)))
            },
        )
        .request("index", |_: Arc<Server>, (): (), cx: RequestContext| async move {
            for _ in 0..100 {
                cx.check_cancelled()?;
                sleep(Duration::from_millis(100)).await;
            }
            Ok(())
        })
        .build();

    let (client, server) = Session::new_channel(
        ServiceEndpoint::new(Editor, editor),
        ServiceEndpoint::new(Server, server),
        &SessionOptions::default(),
    );

    let formatted: String = client.request("format", Some(&"fn main() {}")).await?;
    println!("{formatted:?}");

    let index = client.remote().call("index", NO_PARAMS)?;
    sleep(Duration::from_millis(250)).await;
    index.cancel();
    match index.await {
        Err(SessionError::Cancelled) => println!("index cancelled"),
        r => println!("index finished: {r:?}"),
    }

    client.shutdown().await?;
    server.wait().await?;
    Ok(())
}
