use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use trawl_core::proxy::ProxyEndpoint;

/// Minimal forward proxy on localhost that answers every request with
/// `status_line` and a body of `ok`.
pub async fn fake_proxy(status_line: &'static str) -> ProxyEndpoint {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                let _ = socket.read(&mut buf).await;
                let response = format!(
                    "HTTP/1.1 {status_line}\r\ncontent-length: 2\r\nconnection: close\r\n\r\nok"
                );
                let _ = socket.write_all(response.as_bytes()).await;
            });
        }
    });
    ProxyEndpoint::parse(&format!("http://{addr}")).unwrap()
}

/// An endpoint on a localhost port nothing listens on.
pub async fn dead_proxy() -> ProxyEndpoint {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    ProxyEndpoint::parse(&addr.to_string()).unwrap()
}
