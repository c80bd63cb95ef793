use std::future::Future;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{MissedTickBehavior, interval, timeout};

use tracing::{debug, error, info, warn};

use ember_drivers::bus::{I2cAccess, SpiAccess};

use crate::error::{Error, ErrorKind, Result};
use crate::http::{MAX_HEAD_LEN, Request};
use crate::node::Node;
use crate::socket::SocketWriter;

// Time allowed to a client to send its request head.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

/// Runs a node until `shutdown` completes.
///
/// Scheduler passes and requests are served one after the other on the
/// current task, so a slow client delays the next pass by at most the
/// request and write timeouts.
///
/// # Errors
///
/// Fails when the listener can no longer accept connections.
pub async fn serve<H, F>(mut node: Node<H>, listener: TcpListener, shutdown: F) -> Result<()>
where
    H: I2cAccess + SpiAccess,
    F: Future<Output = ()>,
{
    let mut ticker = interval(Duration::from_millis(node.config().tick_interval_ms.max(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let write_timeout = Duration::from_millis(node.config().write_timeout_ms.max(1));

    info!("Node listening on {}", listener.local_addr()?);

    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            () = &mut shutdown => break,
            _ = ticker.tick() => {
                let _ = node.tick();
            }
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!("Connection not accepted: {e}");
                        continue;
                    }
                };
                if let Err(e) = handle(&mut node, stream, write_timeout).await {
                    warn!("Request from {peer} failed: {e}");
                }
            }
        }
    }

    node.shutdown();
    info!("Node stopped");

    Ok(())
}

async fn handle<H>(
    node: &mut Node<H>,
    mut stream: TcpStream,
    write_timeout: Duration,
) -> Result<()>
where
    H: I2cAccess + SpiAccess,
{
    let request = match timeout(REQUEST_TIMEOUT, read_request(&mut stream)).await? {
        Err(e) if e.kind() != ErrorKind::BadRequest => return Err(e),
        request => request,
    };
    let writer = SocketWriter::new(stream.into_std()?, write_timeout)?;

    let outcome = match request {
        Ok(request) => node.respond(&request, writer),
        Err(e) => {
            debug!("Malformed request: {e}");
            node.reject(writer)
        }
    };
    debug!(?outcome, "Connection closed");

    Ok(())
}

async fn read_request(stream: &mut TcpStream) -> Result<Request> {
    let mut received = Vec::with_capacity(512);
    let mut buf = [0u8; 512];

    loop {
        let read = stream.read(&mut buf).await?;
        if read == 0 {
            return Err(Error::new(
                ErrorKind::Io,
                "connection closed before the end of the request head",
            ));
        }
        received.extend_from_slice(&buf[..read]);

        if let Some(request) = Request::parse(&received)? {
            return Ok(request);
        }
        if received.len() > MAX_HEAD_LEN {
            return Err(Error::new(ErrorKind::BadRequest, "request head too long"));
        }
    }
}

#[cfg(test)]
mod tests {
    use ember::config::{DriverId, Settings, TaskConfig};

    use std::net::SocketAddr;
    use std::time::Duration;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::time::sleep;

    use crate::node::{Node, NodeConfig};
    use crate::sim::HostBoard;

    use super::serve;

    async fn request(address: SocketAddr, head: &[u8]) -> String {
        let mut stream = TcpStream::connect(address).await.unwrap();
        stream.write_all(head).await.unwrap();

        let mut response = String::new();
        let _ = stream.read_to_string(&mut response).await.unwrap();
        response
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_serve() {
        let mut settings = Settings::default();
        settings
            .set_task(TaskConfig::new(0, DriverId(105), "Climate"))
            .unwrap();
        let config = NodeConfig::new().tick_interval(5);
        let node = Node::new(HostBoard::new(), settings, config).unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();

        let server = serve(node, listener, sleep(Duration::from_millis(300)));
        let client = async move {
            // Leave a few passes to the scheduler.
            sleep(Duration::from_millis(100)).await;

            let json = request(address, b"GET /json HTTP/1.1\r\nHost: node\r\n\r\n").await;
            let garbage = request(address, b"HELLO\r\n\r\n").await;
            (json, garbage)
        };

        let (result, (json, garbage)) = tokio::join!(server, client);
        result.unwrap();

        assert!(json.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(json.contains("Transfer-Encoding: chunked"));
        assert!(json.contains(r#""name":"Climate""#));
        assert!(json.contains(r#""Temperature":"#));
        assert!(json.ends_with("0\r\n\r\n"));

        assert!(garbage.starts_with("HTTP/1.1 400 Bad Request\r\n"));
    }
}
