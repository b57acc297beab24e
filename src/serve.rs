//! TCP byte-stream server: every connected client becomes one consumer on
//! the bridge. Clients attached to a run that ends are disconnected and
//! have to reconnect, which lands them on the new run.

use std::time::Duration;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::bridge::ConsumerSink;
use crate::pipeline::PipelineManager;

pub async fn start_stream_server(
    manager: PipelineManager,
    bind: &str,
    port: u16,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let addr = format!("{}:{}", bind, port);
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| anyhow::anyhow!("bind stream server {}: {}", addr, e))?;
    log::info!("stream server listening on {}", addr);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((socket, peer)) => {
                    let _ = socket.set_nodelay(true);
                    let bridge = manager.bridge();
                    tokio::spawn(async move {
                        let name = format!("client {}", peer);
                        let sink: ConsumerSink = Box::new(socket);
                        match bridge.attach_consumer(&name, sink).await {
                            // Hold the connection until the feeder finishes
                            // (run over or client gone).
                            Ok(handle) => handle.joined().await,
                            Err(e) => log::warn!("rejecting {}: {:#}", peer, e),
                        }
                    });
                }
                Err(e) => {
                    log::warn!("accept failed: {}", e);
                    tokio::time::sleep(Duration::from_millis(200)).await;
                }
            },
        }
    }
    log::info!("stream server stopped");
    Ok(())
}
