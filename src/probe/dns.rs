//! DNS resolvers: a raw UDP stub resolver and the system resolver.

use super::{ProbeError, ProbeFuture, Resolver};
use crate::dns::AddressFamily;

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use tokio::net::UdpSocket;

const TYPE_A: u16 = 1;
const TYPE_AAAA: u16 = 28;
const CLASS_IN: u16 = 1;

fn query_type(family: AddressFamily) -> u16 {
    match family {
        AddressFamily::V4 => TYPE_A,
        AddressFamily::V6 => TYPE_AAAA,
    }
}

/// Sends A/AAAA queries straight to one nameserver over UDP.
pub struct UdpResolver {
    nameserver: SocketAddr,
}

impl UdpResolver {
    pub fn new(nameserver: SocketAddr) -> Self {
        Self { nameserver }
    }
}

impl Resolver for UdpResolver {
    fn resolve(
        &self,
        hostname: &str,
        family: AddressFamily,
        timeout: Duration,
    ) -> ProbeFuture<Vec<IpAddr>> {
        let nameserver = self.nameserver;
        let hostname = hostname.to_string();
        Box::pin(async move { run_dns_query(nameserver, &hostname, family, timeout).await })
    }
}

/// Resolve `hostname` against `nameserver` for one address family.
pub async fn run_dns_query(
    nameserver: SocketAddr,
    hostname: &str,
    family: AddressFamily,
    timeout: Duration,
) -> Result<Vec<IpAddr>, ProbeError> {
    let qtype = query_type(family);
    let (tx_id, packet) = build_dns_query(hostname, qtype)?;

    let bind: SocketAddr = if nameserver.is_ipv4() {
        ([0, 0, 0, 0], 0).into()
    } else {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    };
    let socket = UdpSocket::bind(bind)
        .await
        .map_err(|e| ProbeError::Network(format!("failed to bind socket: {}", e)))?;

    socket
        .connect(nameserver)
        .await
        .map_err(|e| ProbeError::Network(format!("failed to connect: {}", e)))?;

    socket
        .send(&packet)
        .await
        .map_err(|e| ProbeError::Network(format!("failed to send: {}", e)))?;

    let mut response = [0u8; 1232];
    let n = tokio::time::timeout(timeout, socket.recv(&mut response))
        .await
        .map_err(|_| ProbeError::Timeout(timeout))?
        .map_err(|e| ProbeError::Network(format!("failed to recv: {}", e)))?;

    parse_dns_response(&response[..n], tx_id, qtype)
}

/// Build a DNS query packet for `hostname` with a random transaction id.
pub fn build_dns_query(hostname: &str, qtype: u16) -> Result<(u16, Vec<u8>), ProbeError> {
    let tx_id: u16 = rand::random();
    let flags: u16 = 0x0100; // Standard query, recursion desired

    // Header (12 bytes)
    let mut packet = Vec::with_capacity(32 + hostname.len());
    packet.extend_from_slice(&tx_id.to_be_bytes());
    packet.extend_from_slice(&flags.to_be_bytes());
    packet.extend_from_slice(&1u16.to_be_bytes()); // QDCOUNT
    packet.extend_from_slice(&[0; 6]); // ANCOUNT, NSCOUNT, ARCOUNT

    // Domain name encoding: length-prefixed labels
    for label in hostname.trim_end_matches('.').split('.') {
        if label.is_empty() || label.len() > 63 {
            return Err(ProbeError::Config(format!("invalid hostname: {}", hostname)));
        }
        packet.push(label.len() as u8);
        packet.extend_from_slice(label.as_bytes());
    }
    packet.push(0); // Null terminator

    packet.extend_from_slice(&qtype.to_be_bytes());
    packet.extend_from_slice(&CLASS_IN.to_be_bytes());

    Ok((tx_id, packet))
}

fn read_u16(buf: &[u8], pos: usize) -> Result<u16, ProbeError> {
    buf.get(pos..pos + 2)
        .map(|b| u16::from_be_bytes([b[0], b[1]]))
        .ok_or_else(|| ProbeError::Protocol("truncated response".to_string()))
}

/// Skip an encoded name, returning the offset just past it.
fn skip_name(buf: &[u8], mut pos: usize) -> Result<usize, ProbeError> {
    loop {
        let len = *buf
            .get(pos)
            .ok_or_else(|| ProbeError::Protocol("truncated name".to_string()))?;
        match len {
            0 => return Ok(pos + 1),
            // Compression pointer ends the name
            l if l & 0xC0 == 0xC0 => return Ok(pos + 2),
            l => pos += 1 + l as usize,
        }
    }
}

/// Extract the addresses of type `qtype` from a response.
pub fn parse_dns_response(buf: &[u8], tx_id: u16, qtype: u16) -> Result<Vec<IpAddr>, ProbeError> {
    if buf.len() < 12 {
        return Err(ProbeError::Protocol(format!("response too short: {} bytes", buf.len())));
    }

    let resp_tx_id = read_u16(buf, 0)?;
    if resp_tx_id != tx_id {
        return Err(ProbeError::Protocol(format!(
            "transaction ID mismatch: got {}, expected {}",
            resp_tx_id, tx_id
        )));
    }

    // Check RCODE (lower 4 bits of byte 3)
    let rcode = buf[3] & 0x0F;
    if rcode != 0 {
        return Err(ProbeError::Protocol(format!("DNS error RCODE: {}", rcode)));
    }

    let qd_count = read_u16(buf, 4)?;
    let an_count = read_u16(buf, 6)?;

    let mut pos = 12;
    for _ in 0..qd_count {
        pos = skip_name(buf, pos)? + 4;
    }

    let mut addresses = Vec::new();
    for _ in 0..an_count {
        pos = skip_name(buf, pos)?;
        let rtype = read_u16(buf, pos)?;
        let rdlength = read_u16(buf, pos + 8)? as usize;
        let rdata = buf
            .get(pos + 10..pos + 10 + rdlength)
            .ok_or_else(|| ProbeError::Protocol("truncated record".to_string()))?;
        pos += 10 + rdlength;

        if rtype != qtype {
            // CNAME chains and the like
            continue;
        }
        match (rtype, rdata.len()) {
            (TYPE_A, 4) => addresses.push(IpAddr::V4(Ipv4Addr::new(
                rdata[0], rdata[1], rdata[2], rdata[3],
            ))),
            (TYPE_AAAA, 16) => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(rdata);
                addresses.push(IpAddr::V6(Ipv6Addr::from(octets)));
            }
            _ => {}
        }
    }

    Ok(addresses)
}

/// Resolves through the operating system.
pub struct SystemResolver;

impl Resolver for SystemResolver {
    fn resolve(
        &self,
        hostname: &str,
        family: AddressFamily,
        _timeout: Duration,
    ) -> ProbeFuture<Vec<IpAddr>> {
        let hostname = hostname.to_string();
        Box::pin(async move {
            let addrs = tokio::net::lookup_host((hostname.as_str(), 0))
                .await
                .map_err(|e| ProbeError::Network(format!("DNS resolution failed: {}", e)))?;
            Ok(addrs
                .map(|sa| sa.ip())
                .filter(|ip| AddressFamily::of(ip) == family)
                .collect())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn answer(packet: &mut Vec<u8>, rtype: u16, rdata: &[u8]) {
        packet.extend_from_slice(&[0xC0, 0x0C]); // pointer to question name
        packet.extend_from_slice(&rtype.to_be_bytes());
        packet.extend_from_slice(&CLASS_IN.to_be_bytes());
        packet.extend_from_slice(&300u32.to_be_bytes());
        packet.extend_from_slice(&(rdata.len() as u16).to_be_bytes());
        packet.extend_from_slice(rdata);
    }

    fn response_for(query: &[u8], answers: &[(u16, &[u8])]) -> Vec<u8> {
        let mut packet = query.to_vec();
        packet[2] = 0x81;
        packet[3] = 0x80;
        packet[6..8].copy_from_slice(&(answers.len() as u16).to_be_bytes());
        for (rtype, rdata) in answers {
            answer(&mut packet, *rtype, rdata);
        }
        packet
    }

    #[test]
    fn test_build_dns_query() {
        let (tx_id, packet) = build_dns_query("svc.example.com", TYPE_A).unwrap();
        assert_eq!(u16::from_be_bytes([packet[0], packet[1]]), tx_id);
        // 12 (header) + 17 (name) + 4 (type/class)
        assert_eq!(packet.len(), 33);
        assert_eq!(&packet[12..16], &[3, b's', b'v', b'c']);

        assert!(build_dns_query("bad..name", TYPE_A).is_err());
    }

    #[test]
    fn test_parse_answers_with_cname() {
        let (tx_id, query) = build_dns_query("svc.example.com", TYPE_A).unwrap();
        let cname = [3, b'w', b'w', b'w', 0xC0, 0x0C];
        let response = response_for(&query, &[(5, &cname), (TYPE_A, &[10, 0, 0, 7])]);

        let addresses = parse_dns_response(&response, tx_id, TYPE_A).unwrap();
        assert_eq!(addresses, vec!["10.0.0.7".parse::<IpAddr>().unwrap()]);
    }

    #[test]
    fn test_parse_aaaa() {
        let (tx_id, query) = build_dns_query("svc.example.com", TYPE_AAAA).unwrap();
        let v6: Ipv6Addr = "2001:db8::1".parse().unwrap();
        let response = response_for(&query, &[(TYPE_AAAA, &v6.octets())]);

        let addresses = parse_dns_response(&response, tx_id, TYPE_AAAA).unwrap();
        assert_eq!(addresses, vec![IpAddr::V6(v6)]);
    }

    #[test]
    fn test_parse_errors() {
        let (tx_id, query) = build_dns_query("svc.example.com", TYPE_A).unwrap();
        assert!(parse_dns_response(&query[..8], tx_id, TYPE_A).is_err());
        assert!(parse_dns_response(&query, tx_id.wrapping_add(1), TYPE_A).is_err());

        let mut nxdomain = response_for(&query, &[]);
        nxdomain[3] = 0x83;
        assert!(matches!(
            parse_dns_response(&nxdomain, tx_id, TYPE_A),
            Err(ProbeError::Protocol(_))
        ));

        let mut truncated = response_for(&query, &[(TYPE_A, &[10, 0, 0, 7])]);
        truncated.truncate(truncated.len() - 2);
        assert!(parse_dns_response(&truncated, tx_id, TYPE_A).is_err());
    }

    #[tokio::test]
    async fn test_udp_resolver_round_trip() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let nameserver = server.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            if let Ok((n, peer)) = server.recv_from(&mut buf).await {
                let response = response_for(&buf[..n], &[(TYPE_A, &[192, 0, 2, 1])]);
                let _ = server.send_to(&response, peer).await;
            }
        });

        let resolver = UdpResolver::new(nameserver);
        let addresses = resolver
            .resolve("svc.example.com", AddressFamily::V4, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(addresses, vec!["192.0.2.1".parse::<IpAddr>().unwrap()]);
    }
}
