//! Upstream DNS clients

use super::{check_record_type, Answer, RecordType};
use crate::error::DnsError;
use async_trait::async_trait;
use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::{Name, RData};
use std::net::{IpAddr, SocketAddr};
use tokio::net::UdpSocket;
use tracing::{debug, trace};

/// Maximum DNS message size over UDP with EDNS disabled
const MAX_UDP_MESSAGE_SIZE: usize = 512;

/// Receive buffer; large enough for servers that ignore the 512-byte limit
const UDP_RECV_BUFFER_SIZE: usize = 4096;

/// A DNS server the resolver can ask
///
/// Implementations perform a single query attempt; retries, fallback and
/// deadlines are the resolver's job.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Upstream: Send + Sync {
    /// Resolve `domain` (canonical form, no trailing dot) for `rtype`
    ///
    /// NXDOMAIN is an answer, not an error.
    async fn query(&self, domain: &str, rtype: RecordType) -> Result<Answer, DnsError>;

    /// Human-readable identity for logs and errors
    fn name(&self) -> String;
}

/// Plain DNS over UDP
#[derive(Debug, Clone)]
pub struct UdpUpstream {
    server: SocketAddr,
}

impl UdpUpstream {
    /// Create a client for `server`
    pub fn new(server: SocketAddr) -> Self {
        Self { server }
    }

    /// Server address
    pub fn server(&self) -> SocketAddr {
        self.server
    }

    fn build_query(domain: &str, rtype: RecordType, id: u16) -> Result<Vec<u8>, DnsError> {
        let name = Name::from_ascii(format!("{domain}."))
            .map_err(|_| DnsError::InvalidName(domain.to_string()))?;

        let mut message = Message::new();
        message
            .set_id(id)
            .set_message_type(MessageType::Query)
            .set_op_code(OpCode::Query)
            .set_recursion_desired(true)
            .add_query(Query::query(name, rtype));

        let bytes = message
            .to_vec()
            .map_err(|e| DnsError::InvalidName(format!("{domain}: {e}")))?;
        if bytes.len() > MAX_UDP_MESSAGE_SIZE {
            return Err(DnsError::InvalidName(domain.to_string()));
        }
        Ok(bytes)
    }

    fn parse_response(&self, response: &Message, rtype: RecordType) -> Result<Answer, DnsError> {
        if response.message_type() != MessageType::Response {
            return Err(DnsError::malformed(self.server, "not a response"));
        }
        // A partial answer set must not be cached; another upstream may fit
        if response.truncated() {
            return Err(DnsError::malformed(self.server, "truncated response"));
        }

        match response.response_code() {
            ResponseCode::NoError => {}
            ResponseCode::NXDomain => {
                let ttl = response
                    .name_servers()
                    .iter()
                    .map(hickory_proto::rr::Record::ttl)
                    .min()
                    .unwrap_or(0);
                return Ok(Answer::nxdomain(ttl));
            }
            code => {
                return Err(DnsError::ServerFailure {
                    upstream: self.server.to_string(),
                    code: code.to_string(),
                })
            }
        }

        let mut addrs = Vec::new();
        let mut ttl: Option<u32> = None;
        for record in response.answers() {
            let addr = match record.data() {
                Some(RData::A(a)) if rtype == RecordType::A => IpAddr::V4(a.0),
                Some(RData::AAAA(aaaa)) if rtype == RecordType::AAAA => IpAddr::V6(aaaa.0),
                // CNAME chain links and unrelated records
                _ => continue,
            };
            addrs.push(addr);
            ttl = Some(ttl.map_or(record.ttl(), |t| t.min(record.ttl())));
        }

        Ok(Answer::positive(addrs, ttl.unwrap_or(0)))
    }
}

#[async_trait]
impl Upstream for UdpUpstream {
    async fn query(&self, domain: &str, rtype: RecordType) -> Result<Answer, DnsError> {
        check_record_type(rtype)?;
        let id: u16 = rand::random();
        let query = Self::build_query(domain, rtype, id)?;

        let bind: SocketAddr = if self.server.is_ipv4() {
            SocketAddr::from(([0, 0, 0, 0], 0))
        } else {
            SocketAddr::from(([0u16; 8], 0))
        };
        let socket = UdpSocket::bind(bind)
            .await
            .map_err(|e| DnsError::transport(self.server, e))?;
        socket
            .connect(self.server)
            .await
            .map_err(|e| DnsError::transport(self.server, e))?;
        socket
            .send(&query)
            .await
            .map_err(|e| DnsError::transport(self.server, e))?;
        trace!(upstream = %self.server, domain, %rtype, id, "DNS query sent");

        let mut buf = vec![0u8; UDP_RECV_BUFFER_SIZE];
        loop {
            let len = socket
                .recv(&mut buf)
                .await
                .map_err(|e| DnsError::transport(self.server, e))?;

            let response = Message::from_vec(&buf[..len])
                .map_err(|e| DnsError::malformed(self.server, e.to_string()))?;
            if response.id() != id {
                // Stale or spoofed datagram; keep waiting for ours
                debug!(upstream = %self.server, expected = id, got = response.id(), "Ignoring DNS response with wrong id");
                continue;
            }
            return self.parse_response(&response, rtype);
        }
    }

    fn name(&self) -> String {
        format!("udp://{}", self.server)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::rr::rdata::{A, AAAA};
    use hickory_proto::rr::Record;
    use std::net::{Ipv4Addr, Ipv6Addr};

    fn upstream() -> UdpUpstream {
        UdpUpstream::new("127.0.0.1:53".parse().unwrap())
    }

    fn response(code: ResponseCode) -> Message {
        let mut msg = Message::new();
        msg.set_id(7)
            .set_message_type(MessageType::Response)
            .set_response_code(code);
        msg
    }

    fn name() -> Name {
        Name::from_ascii("example.com.").unwrap()
    }

    #[test]
    fn test_build_query_roundtrips() {
        let bytes = UdpUpstream::build_query("example.com", RecordType::A, 0x1234).unwrap();
        let msg = Message::from_vec(&bytes).unwrap();
        assert_eq!(msg.id(), 0x1234);
        assert!(msg.recursion_desired());
        assert_eq!(msg.queries()[0].query_type(), RecordType::A);
        assert_eq!(msg.queries()[0].name(), &name());
    }

    #[test]
    fn test_parse_a_records_min_ttl() {
        let mut msg = response(ResponseCode::NoError);
        msg.add_answer(Record::from_rdata(name(), 300, RData::A(A(Ipv4Addr::new(1, 2, 3, 4)))));
        msg.add_answer(Record::from_rdata(name(), 60, RData::A(A(Ipv4Addr::new(5, 6, 7, 8)))));

        let answer = upstream().parse_response(&msg, RecordType::A).unwrap();
        assert_eq!(answer.addrs.len(), 2);
        assert_eq!(answer.ttl_secs, 60);
    }

    #[test]
    fn test_parse_ignores_other_types() {
        let mut msg = response(ResponseCode::NoError);
        msg.add_answer(Record::from_rdata(
            name(),
            300,
            RData::AAAA(AAAA(Ipv6Addr::LOCALHOST)),
        ));

        let answer = upstream().parse_response(&msg, RecordType::A).unwrap();
        assert!(answer.addrs.is_empty());
        assert_eq!(answer.kind, crate::dns::AnswerKind::NoData);
    }

    #[test]
    fn test_parse_nxdomain() {
        let answer = upstream()
            .parse_response(&response(ResponseCode::NXDomain), RecordType::A)
            .unwrap();
        assert_eq!(answer.kind, crate::dns::AnswerKind::NxDomain);
    }

    #[test]
    fn test_parse_servfail() {
        let err = upstream()
            .parse_response(&response(ResponseCode::ServFail), RecordType::A)
            .unwrap_err();
        assert!(matches!(err, DnsError::ServerFailure { .. }));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_parse_truncated_is_retryable() {
        let mut msg = response(ResponseCode::NoError);
        msg.set_truncated(true);
        msg.add_answer(Record::from_rdata(name(), 300, RData::A(A(Ipv4Addr::new(1, 2, 3, 4)))));

        let err = upstream().parse_response(&msg, RecordType::A).unwrap_err();
        assert!(matches!(err, DnsError::Malformed { .. }));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_query_rejects_truncated_reply() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 512];
            let (len, client) = server.recv_from(&mut buf).await.unwrap();
            let request = Message::from_vec(&buf[..len]).unwrap();
            let mut reply = response(ResponseCode::NoError);
            reply.set_id(request.id()).set_truncated(true);
            server.send_to(&reply.to_vec().unwrap(), client).await.unwrap();
        });

        let err = UdpUpstream::new(addr)
            .query("example.com", RecordType::A)
            .await
            .unwrap_err();
        assert!(matches!(err, DnsError::Malformed { ref reason, .. } if reason.contains("truncated")));
    }

    #[test]
    fn test_invalid_name() {
        let long_label = format!("{}.test", "a".repeat(64));
        assert!(UdpUpstream::build_query(&long_label, RecordType::A, 1).is_err());
    }
}
