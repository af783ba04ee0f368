use std::time::Duration;

use snafu::Snafu;
use tokio::{
    net::TcpStream,
    time::{sleep_until, timeout_at, Instant},
};

#[derive(Snafu, Debug)]
pub enum Error {
    #[snafu(display("{address} did not accept connections within {timeout:?} ({attempts} attempts)"))]
    EndpointUnreachable {
        address: String,
        timeout: Duration,
        attempts: u32,
    },
}

/// Dials `address` until a TCP connection succeeds, pausing `retry_interval` between attempts.
///
/// Every attempt and every pause ends at the deadline, so this never takes much longer than
/// `timeout`.
pub async fn wait_for_endpoint(
    address: &str,
    timeout: Duration,
    retry_interval: Duration,
) -> Result<(), Error> {
    let deadline = Instant::now() + timeout;
    let mut attempts = 0;

    loop {
        attempts += 1;
        match timeout_at(deadline, TcpStream::connect(address)).await {
            Ok(Ok(_)) => {
                tracing::debug!(address, attempts, "endpoint is reachable");
                return Ok(());
            }
            Ok(Err(error)) => {
                tracing::debug!(address, attempts, %error, "endpoint not reachable yet");
            }
            Err(_) => break,
        }

        let next_attempt = Instant::now() + retry_interval;
        if next_attempt >= deadline {
            sleep_until(deadline).await;
            break;
        }
        sleep_until(next_attempt).await;
    }

    EndpointUnreachableSnafu {
        address,
        timeout,
        attempts,
    }
    .fail()
}

#[cfg(test)]
mod tests {
    use tokio::net::TcpListener;

    use super::*;

    #[tokio::test]
    async fn test_listening_endpoint_is_reachable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();

        wait_for_endpoint(&address, Duration::from_secs(5), Duration::from_millis(10))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_closed_endpoint_times_out_after_retrying() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);

        let started = std::time::Instant::now();
        let err = wait_for_endpoint(
            &address,
            Duration::from_millis(300),
            Duration::from_millis(50),
        )
        .await
        .unwrap_err();

        let Error::EndpointUnreachable { attempts, .. } = err;
        assert!(attempts > 1, "only {attempts} attempts");
        assert!(started.elapsed() >= Duration::from_millis(300));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_endpoint_coming_up_late_is_found() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        drop(listener);

        let late_listener = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let listener = TcpListener::bind(address).await.unwrap();
            // keep accepting until the test ends
            loop {
                let _ = listener.accept().await;
            }
        });

        wait_for_endpoint(
            &address.to_string(),
            Duration::from_secs(5),
            Duration::from_millis(20),
        )
        .await
        .unwrap();
        late_listener.abort();
    }
}
