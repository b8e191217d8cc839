//! UDP DNS frontend for LAN clients
//!
//! Every question goes through the [`Resolver`], so clients share its
//! cache, coalescing and ad-block vetoes. Vetoed names answer NXDOMAIN.

use super::{AnswerKind, Lookup, RecordType, Resolver};
use crate::error::DnsError;
use crate::stats::Stats;
use hickory_proto::op::{Message, MessageType, OpCode, ResponseCode};
use hickory_proto::rr::rdata::{A, AAAA};
use hickory_proto::rr::{RData, Record};
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

/// Largest datagram accepted from a client
const MAX_QUERY_SIZE: usize = 4096;

/// Fixed DNS header length
const HEADER_LEN: usize = 12;

/// Serves A/AAAA questions over UDP
pub struct DnsServer {
    socket: Arc<UdpSocket>,
    resolver: Arc<Resolver>,
    stats: Arc<Stats>,
    budget: Duration,
    local_addr: SocketAddr,
}

impl DnsServer {
    /// Bind to `addr`; each query is answered within `budget`
    pub async fn bind(
        addr: SocketAddr,
        resolver: Arc<Resolver>,
        stats: Arc<Stats>,
        budget: Duration,
    ) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        let local_addr = socket.local_addr()?;
        info!(addr = %local_addr, "DNS server bound");
        Ok(Self {
            socket: Arc::new(socket),
            resolver,
            stats,
            budget,
            local_addr,
        })
    }

    /// Address actually bound (port 0 resolved)
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Answer queries until `shutdown` turns true or its sender is dropped
    ///
    /// Each query runs on its own task, so one slow upstream does not hold
    /// up other clients.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> io::Result<()> {
        let mut buf = vec![0u8; MAX_QUERY_SIZE];
        loop {
            let (len, client) = tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok(received) => received,
                    Err(e) => {
                        // ICMP port unreachable from an earlier reply surfaces here
                        debug!(error = %e, "DNS receive failed");
                        continue;
                    }
                },
            };

            let query = buf[..len].to_vec();
            let socket = Arc::clone(&self.socket);
            let resolver = Arc::clone(&self.resolver);
            let stats = Arc::clone(&self.stats);
            let budget = self.budget;
            tokio::spawn(async move {
                let Some(reply) = answer_query(&resolver, &stats, &query, budget).await else {
                    return;
                };
                if let Err(e) = socket.send_to(&reply, client).await {
                    debug!(%client, error = %e, "DNS reply not sent");
                }
            });
        }
        info!(addr = %self.local_addr, "DNS server stopped");
        Ok(())
    }
}

impl std::fmt::Debug for DnsServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DnsServer")
            .field("local_addr", &self.local_addr)
            .field("budget", &self.budget)
            .finish()
    }
}

/// Build the wire reply for one raw query; `None` if it is not worth one
pub async fn answer_query(
    resolver: &Resolver,
    stats: &Stats,
    query: &[u8],
    budget: Duration,
) -> Option<Vec<u8>> {
    if query.len() < HEADER_LEN {
        return None;
    }
    Stats::incr(&stats.dns_queries);

    let request = match Message::from_vec(query) {
        Ok(request) => request,
        Err(e) => {
            debug!(error = %e, "Malformed DNS query");
            let id = u16::from_be_bytes([query[0], query[1]]);
            let mut reply = Message::new();
            reply
                .set_id(id)
                .set_message_type(MessageType::Response)
                .set_response_code(ResponseCode::FormErr);
            return encode(&reply);
        }
    };
    if request.message_type() != MessageType::Query {
        return None;
    }

    let mut reply = response_to(&request);
    if request.op_code() != OpCode::Query {
        reply.set_response_code(ResponseCode::NotImp);
        return encode(&reply);
    }
    let [question] = request.queries() else {
        reply.set_response_code(ResponseCode::FormErr);
        return encode(&reply);
    };

    let rtype = question.query_type();
    let name = question.name().to_ascii();
    let deadline = Instant::now() + budget;
    match resolver.resolve(&name, rtype, deadline).await {
        Ok(lookup) => {
            trace!(domain = %name, %rtype, kind = ?lookup.answer.kind, "DNS query answered");
            fill(&mut reply, question.name(), rtype, &lookup);
        }
        Err(e) => {
            let code = response_code(&e);
            if code == ResponseCode::ServFail {
                warn!(domain = %name, error = %e, "DNS query failed");
            }
            reply.set_response_code(code);
        }
    }
    encode(&reply)
}

fn response_to(request: &Message) -> Message {
    let mut reply = Message::new();
    reply
        .set_id(request.id())
        .set_message_type(MessageType::Response)
        .set_op_code(request.op_code())
        .set_recursion_desired(request.recursion_desired())
        .set_recursion_available(true);
    for query in request.queries() {
        reply.add_query(query.clone());
    }
    reply
}

fn fill(reply: &mut Message, name: &hickory_proto::rr::Name, rtype: RecordType, lookup: &Lookup) {
    match lookup.answer.kind {
        AnswerKind::Positive | AnswerKind::NoData => {
            reply.set_response_code(ResponseCode::NoError);
            for addr in &lookup.answer.addrs {
                let rdata = match (addr, rtype) {
                    (IpAddr::V4(v4), RecordType::A) => RData::A(A(*v4)),
                    (IpAddr::V6(v6), RecordType::AAAA) => RData::AAAA(AAAA(*v6)),
                    _ => continue,
                };
                reply.add_answer(Record::from_rdata(name.clone(), lookup.answer.ttl_secs, rdata));
            }
        }
        AnswerKind::NxDomain | AnswerKind::Blocked => {
            reply.set_response_code(ResponseCode::NXDomain);
        }
    }
}

fn response_code(error: &DnsError) -> ResponseCode {
    match error {
        DnsError::InvalidName(_) => ResponseCode::FormErr,
        DnsError::UnsupportedRecordType(_) => ResponseCode::NotImp,
        _ => ResponseCode::ServFail,
    }
}

fn encode(reply: &Message) -> Option<Vec<u8>> {
    match reply.to_vec() {
        Ok(bytes) => Some(bytes),
        Err(e) => {
            warn!(error = %e, "Failed to encode DNS reply");
            None
        }
    }
}
