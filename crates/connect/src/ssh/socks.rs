// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SSH Chain Contributors

// Minimal SOCKS5 server side: no authentication, CONNECT only

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const VERSION: u8 = 0x05;
const AUTH_NONE: u8 = 0x00;
const AUTH_UNACCEPTABLE: u8 = 0xFF;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

pub(crate) const REP_SUCCESS: u8 = 0x00;
pub(crate) const REP_HOST_UNREACHABLE: u8 = 0x04;
const REP_CMD_NOT_SUPPORTED: u8 = 0x07;
const REP_ADDR_NOT_SUPPORTED: u8 = 0x08;

fn protocol_error(message: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message.into())
}

/// Run the greeting and request phases; returns the requested destination
///
/// The caller must answer with [`reply`] once it knows whether the
/// destination is reachable.
pub(crate) async fn accept<S>(stream: &mut S) -> io::Result<(String, u16)>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut head = [0u8; 2];
    stream.read_exact(&mut head).await?;
    if head[0] != VERSION {
        return Err(protocol_error(format!("unsupported SOCKS version {}", head[0])));
    }
    let mut methods = vec![0u8; head[1] as usize];
    stream.read_exact(&mut methods).await?;
    if !methods.contains(&AUTH_NONE) {
        stream.write_all(&[VERSION, AUTH_UNACCEPTABLE]).await?;
        return Err(protocol_error("client offers no acceptable auth method"));
    }
    stream.write_all(&[VERSION, AUTH_NONE]).await?;

    let mut request = [0u8; 4];
    stream.read_exact(&mut request).await?;
    if request[0] != VERSION {
        return Err(protocol_error("bad request version"));
    }
    if request[1] != CMD_CONNECT {
        reply(stream, REP_CMD_NOT_SUPPORTED).await?;
        return Err(protocol_error(format!("unsupported SOCKS command {}", request[1])));
    }

    let host = match request[3] {
        ATYP_IPV4 => {
            let mut octets = [0u8; 4];
            stream.read_exact(&mut octets).await?;
            Ipv4Addr::from(octets).to_string()
        }
        ATYP_DOMAIN => {
            let len = stream.read_u8().await?;
            let mut name = vec![0u8; len as usize];
            stream.read_exact(&mut name).await?;
            String::from_utf8(name).map_err(|_| protocol_error("domain is not UTF-8"))?
        }
        ATYP_IPV6 => {
            let mut octets = [0u8; 16];
            stream.read_exact(&mut octets).await?;
            Ipv6Addr::from(octets).to_string()
        }
        other => {
            reply(stream, REP_ADDR_NOT_SUPPORTED).await?;
            return Err(protocol_error(format!("unsupported address type {}", other)));
        }
    };
    let port = stream.read_u16().await?;

    Ok((host, port))
}

/// Send a reply with an unspecified bound address
pub(crate) async fn reply<S>(stream: &mut S, code: u8) -> io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    stream
        .write_all(&[VERSION, code, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0])
        .await?;
    stream.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_domain_connect() {
        let (mut client, mut server) = duplex(256);
        let client_task = tokio::spawn(async move {
            client.write_all(&[5, 1, 0]).await.unwrap();
            let mut choice = [0u8; 2];
            client.read_exact(&mut choice).await.unwrap();
            assert_eq!(choice, [5, 0]);

            let mut request = vec![5, 1, 0, ATYP_DOMAIN, 11];
            request.extend_from_slice(b"db.internal");
            request.extend_from_slice(&5432u16.to_be_bytes());
            client.write_all(&request).await.unwrap();

            let mut answer = [0u8; 10];
            client.read_exact(&mut answer).await.unwrap();
            answer[1]
        });

        let target = accept(&mut server).await.unwrap();
        assert_eq!(target, ("db.internal".to_string(), 5432));
        reply(&mut server, REP_SUCCESS).await.unwrap();
        assert_eq!(client_task.await.unwrap(), REP_SUCCESS);
    }

    #[tokio::test]
    async fn test_ipv6_connect() {
        let (mut client, mut server) = duplex(256);
        let client_task = tokio::spawn(async move {
            client.write_all(&[5, 1, 0]).await.unwrap();
            let mut choice = [0u8; 2];
            client.read_exact(&mut choice).await.unwrap();

            let mut request = vec![5, 1, 0, ATYP_IPV6];
            request.extend_from_slice(&Ipv6Addr::LOCALHOST.octets());
            request.extend_from_slice(&22u16.to_be_bytes());
            client.write_all(&request).await.unwrap();
        });

        let target = accept(&mut server).await.unwrap();
        assert_eq!(target, ("::1".to_string(), 22));
        client_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_rejects_auth_required_clients() {
        let (mut client, mut server) = duplex(64);
        // Offers username/password only
        client.write_all(&[5, 1, 2]).await.unwrap();
        assert!(accept(&mut server).await.is_err());

        let mut choice = [0u8; 2];
        client.read_exact(&mut choice).await.unwrap();
        assert_eq!(choice, [5, AUTH_UNACCEPTABLE]);
    }

    #[tokio::test]
    async fn test_rejects_bind_command() {
        let (mut client, mut server) = duplex(64);
        client.write_all(&[5, 1, 0]).await.unwrap();
        client.write_all(&[5, 2, 0, ATYP_IPV4]).await.unwrap();
        assert!(accept(&mut server).await.is_err());

        let mut answer = [0u8; 12];
        client.read_exact(&mut answer).await.unwrap();
        assert_eq!(&answer[..2], &[5, 0]);
        assert_eq!(answer[3], REP_CMD_NOT_SUPPORTED);
    }
}
