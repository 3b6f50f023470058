//! Small helpers shared across the core.

use futures::StreamExt;
use reqwest::Response;

/// Reads at most `n` bytes of valid UTF-8 from a response body, so error
/// detail strings stay bounded regardless of how large the receiver's
/// response turns out to be.
pub async fn first_n_bytes_of_response(response: Response, n: usize) -> String {
    let mut body = response.bytes_stream();
    let mut buffer = String::with_capacity(n);

    while let Some(chunk) = body.next().await {
        if buffer.len() >= n {
            break;
        }
        let Ok(chunk) = chunk else { break };
        let Ok(chunk_str) = std::str::from_utf8(&chunk) else { break };
        match chunk_str.get(0..std::cmp::min(n - buffer.len(), chunk_str.len())) {
            Some(partial) => buffer.push_str(partial),
            None => break,
        }
    }

    buffer
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn truncates_to_requested_length() {
        let server = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::method("GET"))
            .respond_with(wiremock::ResponseTemplate::new(200).set_body_string("0123456789"))
            .mount(&server)
            .await;

        let response = reqwest::get(server.uri()).await.unwrap();
        let truncated = first_n_bytes_of_response(response, 4).await;
        assert_eq!(truncated, "0123");
    }
}
