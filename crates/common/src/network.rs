// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SSH Chain Contributors

// Network utility functions

use std::net::IpAddr;

/// Default interface for any listening socket opened by a forward
pub const DEFAULT_BIND_ADDRESS: &str = "127.0.0.1";

/// Protocol default SSH port, omitted from composed endpoints
pub const DEFAULT_SSH_PORT: u16 = 22;

/// True for `localhost`, `127.0.0.0/8` and `::1`, bracketed or not
///
/// Anything unparseable counts as non-loopback.
pub fn is_loopback_address(host: &str) -> bool {
    if host.eq_ignore_ascii_case("localhost") {
        return true;
    }
    unbracket_host(host)
        .parse::<IpAddr>()
        .map(|ip| ip.is_loopback())
        .unwrap_or(false)
}

/// Wrap a bare IPv6 literal in brackets so a `:port` suffix stays unambiguous
pub fn bracket_host(host: &str) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]", host)
    } else {
        host.to_string()
    }
}

/// Strip brackets from an IPv6 literal (for socket APIs)
pub fn unbracket_host(host: &str) -> &str {
    host.strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host)
}

/// `host:port`, bracketing IPv6 literals
pub fn format_host_port(host: &str, port: u16) -> String {
    format!("{}:{}", bracket_host(host), port)
}
