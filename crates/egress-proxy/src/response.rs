//! Responses the proxy generates itself.

/// Body of every blacklist rejection.
pub const BLOCKED_BODY: &str = "Access Denied!\r\nThe requested host is blocked by the proxy.\r\n";

/// `200 Connection Established` for a tunnel.
pub fn connection_established(proxy_agent: &str) -> Vec<u8> {
    format!("HTTP/1.1 200 Connection Established\r\nProxy-agent: {proxy_agent}\r\n\r\n").into_bytes()
}

/// 403 for a blocked CONNECT. Tunnel-style: headers only.
pub fn blocked_tunnel(proxy_agent: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 403 Forbidden\r\nProxy-agent: {proxy_agent}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
    )
    .into_bytes()
}

/// 403 for a blocked plain request, with a short text body.
pub fn blocked_plain() -> Vec<u8> {
    text_response("403 Forbidden", BLOCKED_BODY)
}

pub fn bad_request() -> Vec<u8> {
    text_response("400 Bad Request", "Malformed request line.\r\n")
}

pub fn bad_gateway() -> Vec<u8> {
    text_response("502 Bad Gateway", "The upstream server closed the connection.\r\n")
}

pub fn service_unavailable() -> Vec<u8> {
    text_response("503 Service Unavailable", "Could not connect to the upstream server.\r\n")
}

pub fn gateway_timeout() -> Vec<u8> {
    text_response("504 Gateway Timeout", "Timed out connecting to the upstream server.\r\n")
}

fn text_response(status: &str, body: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 {status}\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    )
    .into_bytes()
}
