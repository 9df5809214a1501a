//! Plain UDP+TCP DNS listener serving the embedded resolver.

use super::resolver::EnhancedMode;
use super::{DnsContext, Resolver};
use crate::{Error, Result};
use hickory_proto::op::{Message, MessageType, OpCode, ResponseCode};
use hickory_proto::rr::rdata::{A, AAAA};
use hickory_proto::rr::{RData, Record, RecordType};
use std::net::IpAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, UdpSocket};
use tracing::{debug, info, warn};

/// Short TTL for synthetic answers so clients re-ask quickly
const FAKE_TTL: u32 = 1;

pub struct DnsServer {
    resolver: Arc<Resolver>,
    listen: String,
}

impl DnsServer {
    pub fn new(resolver: Arc<Resolver>, listen: impl Into<String>) -> Self {
        DnsServer {
            resolver,
            listen: listen.into(),
        }
    }

    /// Bind and serve until the task is dropped.
    pub async fn run(&self) -> Result<()> {
        let udp = Arc::new(
            UdpSocket::bind(&self.listen)
                .await
                .map_err(|e| Error::connection(format!("dns bind {}: {}", self.listen, e)))?,
        );
        let tcp = TcpListener::bind(&self.listen)
            .await
            .map_err(|e| Error::connection(format!("dns bind {}: {}", self.listen, e)))?;
        info!("DNS listening on {} (udp+tcp)", self.listen);

        let udp_resolver = self.resolver.clone();
        let udp_task = tokio::spawn(async move {
            let mut buf = [0u8; 4096];
            loop {
                let (n, peer) = match udp.recv_from(&mut buf).await {
                    Ok(v) => v,
                    Err(e) => {
                        warn!("dns udp recv: {}", e);
                        continue;
                    }
                };
                let wire = buf[..n].to_vec();
                let socket = udp.clone();
                let resolver = udp_resolver.clone();
                tokio::spawn(async move {
                    if let Some(reply) = handle_wire(&resolver, &wire).await {
                        let _ = socket.send_to(&reply, peer).await;
                    }
                });
            }
        });

        let tcp_resolver = self.resolver.clone();
        let tcp_task = tokio::spawn(async move {
            loop {
                let (mut stream, _) = match tcp.accept().await {
                    Ok(v) => v,
                    Err(e) => {
                        warn!("dns tcp accept: {}", e);
                        continue;
                    }
                };
                let resolver = tcp_resolver.clone();
                tokio::spawn(async move {
                    let mut len_buf = [0u8; 2];
                    while stream.read_exact(&mut len_buf).await.is_ok() {
                        let len = u16::from_be_bytes(len_buf) as usize;
                        let mut wire = vec![0u8; len];
                        if stream.read_exact(&mut wire).await.is_err() {
                            break;
                        }
                        let Some(reply) = handle_wire(&resolver, &wire).await else {
                            break;
                        };
                        let mut framed = Vec::with_capacity(reply.len() + 2);
                        framed.extend_from_slice(&(reply.len() as u16).to_be_bytes());
                        framed.extend_from_slice(&reply);
                        if stream.write_all(&framed).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });

        let _ = tokio::try_join!(udp_task, tcp_task);
        Ok(())
    }
}

async fn handle_wire(resolver: &Resolver, wire: &[u8]) -> Option<Vec<u8>> {
    let msg = match Message::from_vec(wire) {
        Ok(msg) => msg,
        Err(e) => {
            debug!("dns parse: {}", e);
            return None;
        }
    };
    let reply = serve_query(resolver, &msg).await;
    reply.to_vec().ok()
}

/// Answer a client query: hosts table, then fake-IP synthesis, then the
/// upstream exchange.
pub async fn serve_query(resolver: &Resolver, msg: &Message) -> Message {
    let Some(query) = msg.queries().first().cloned() else {
        return error_reply(msg, ResponseCode::FormErr);
    };
    let qname = query.name().to_utf8();
    let host = qname.trim_end_matches('.').to_string();
    let qtype = query.query_type();

    // Hosts table takes precedence over every mode
    if let Some(ip) = resolver.host_entry(&host) {
        match (qtype, ip) {
            (RecordType::A, IpAddr::V4(v4)) => {
                return answer_reply(msg, &query, RData::A(A(v4)), FAKE_TTL)
            }
            (RecordType::AAAA, IpAddr::V6(v6)) => {
                return answer_reply(msg, &query, RData::AAAA(AAAA(v6)), FAKE_TTL)
            }
            (RecordType::A | RecordType::AAAA, _) => return empty_reply(msg, &query),
            _ => {}
        }
    }

    // Fake-IP synthesis for unfiltered hosts
    if resolver.enhanced_mode() == EnhancedMode::FakeIp {
        if let Some(pool) = resolver.fakeip_pool() {
            if !host.is_empty() && !pool.should_skip(&host) {
                match qtype {
                    RecordType::A => {
                        let ip = pool.lookup_ip(&host);
                        return answer_reply(msg, &query, RData::A(A(ip)), FAKE_TTL);
                    }
                    // The pool is IPv4; synthetic hosts answer AAAA empty so
                    // clients settle on the A record
                    RecordType::AAAA => return empty_reply(msg, &query),
                    _ => {}
                }
            }
        }
    }

    match resolver.exchange(msg, &DnsContext::default()).await {
        Ok(reply) => reply,
        Err(Error::DnsNotFound(_)) => error_reply(msg, ResponseCode::NXDomain),
        Err(e) => {
            debug!("dns exchange failed for {}: {}", host, e);
            error_reply(msg, ResponseCode::ServFail)
        }
    }
}

fn reply_base(msg: &Message) -> Message {
    let mut reply = Message::new();
    reply
        .set_id(msg.id())
        .set_message_type(MessageType::Response)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(msg.recursion_desired())
        .set_recursion_available(true);
    reply
}

fn answer_reply(
    msg: &Message,
    query: &hickory_proto::op::Query,
    rdata: RData,
    ttl: u32,
) -> Message {
    let mut reply = reply_base(msg);
    reply.add_query(query.clone());
    reply.add_answer(Record::from_rdata(query.name().clone(), ttl, rdata));
    reply
}

fn empty_reply(msg: &Message, query: &hickory_proto::op::Query) -> Message {
    let mut reply = reply_base(msg);
    reply.add_query(query.clone());
    reply
}

fn error_reply(msg: &Message, code: ResponseCode) -> Message {
    let mut reply = reply_base(msg);
    for query in msg.queries() {
        reply.add_query(query.clone());
    }
    reply.set_response_code(code);
    reply
}
