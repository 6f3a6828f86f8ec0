use std::sync::Arc;

use serde::{Deserialize, Serialize};

use lspcall::{MethodRegistry, Result, ServiceEndpoint, Session, SessionOptions};

#[derive(Debug, Serialize, Deserialize)]
struct HelloRequest {
    name: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct HelloResponse {
    message: String,
}

struct HelloService;

impl HelloService {
    fn hello(&self, r: HelloRequest) -> HelloResponse {
        HelloResponse {
            message: format!("Hello, {}!", r.name),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let registry = MethodRegistry::builder()
        .request("hello", |s: Arc<HelloService>, r: HelloRequest, _| async move {
            Ok(s.hello(r))
        })
        .build();
    let local = ServiceEndpoint::new(HelloService, registry);
    Ok(Session::from_stdio(local, &SessionOptions::default())
        .wait()
        .await?)
}
