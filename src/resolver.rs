//! DNS query resolution logic.
//!
//! Handles the per-query pipeline:
//! 1. Parse (malformed queries get a FORMERR reply and are not counted)
//! 2. Filter against the blocklist
//! 3. Synthesize the sinkhole answer or relay the upstream's answers
//! 4. Record the hit
//!
//! Transports handle the actual I/O, resolver handles decisions.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, warn};

use crate::dns::{AnswerSection, DnsHeader, DnsQuery, DnsResponse, ParseError};
use crate::filter::{Blocklist, filter_query};
use crate::hits::Telemetry;
use crate::stats::Stats;
use crate::upstream::Upstream;

/// TTL of synthesized sinkhole records unless configured otherwise.
pub const DEFAULT_SINKHOLE_TTL: u32 = 3600;

/// Action to take for a DNS query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryAction {
    /// Query is blocked, answer locally with this address.
    Blocked { domain: String, addr: Ipv4Addr },
    /// Query should be forwarded to upstream.
    Forward { domain: String },
}

/// Outcome of one query.
#[derive(Debug, Clone)]
pub struct QueryClassification {
    pub domain: String,
    pub blocked: bool,
    /// Answers sent back to the client.
    pub answers: AnswerSection,
    /// Forwarded, but the upstream gave no usable reply.
    pub upstream_failed: bool,
}

/// What the transport should send back.
#[derive(Debug, Clone)]
pub enum Resolution {
    /// The query was classified and answered.
    Answered {
        response: Vec<u8>,
        classification: QueryClassification,
    },
    /// The query was refused before classification.
    Rejected { response: Vec<u8>, reason: ParseError },
}

impl Resolution {
    pub fn response(&self) -> &[u8] {
        match self {
            Resolution::Answered { response, .. } | Resolution::Rejected { response, .. } => {
                response
            }
        }
    }
}

/// Resolver handles DNS query processing decisions.
///
/// Contains all shared logic between transports: filtering, forwarding and
/// hit accounting. Transports call this and write back what it returns.
pub struct Resolver {
    blocklist: Blocklist,
    upstream: Upstream,
    telemetry: Arc<Telemetry>,
    stats: Arc<Stats>,
    sinkhole_ttl: u32,
}

impl Resolver {
    pub fn new(
        blocklist: Blocklist,
        upstream: Upstream,
        telemetry: Arc<Telemetry>,
        stats: Arc<Stats>,
    ) -> Self {
        Self {
            blocklist,
            upstream,
            telemetry,
            stats,
            sinkhole_ttl: DEFAULT_SINKHOLE_TTL,
        }
    }

    pub fn with_sinkhole_ttl(mut self, ttl: u32) -> Self {
        self.sinkhole_ttl = ttl;
        self
    }

    /// Decide what to do with a parsed query.
    pub fn process_query(&self, query: &DnsQuery) -> QueryAction {
        let domain = query.domain.clone();

        match filter_query(&self.blocklist, query) {
            Some(addr) => QueryAction::Blocked { domain, addr },
            None => QueryAction::Forward { domain },
        }
    }

    /// Run the full pipeline for one raw query.
    ///
    /// Returns `None` for datagrams too short to carry a header, which leaves
    /// nothing to reply to, and for inbound responses (QR set), which are
    /// never answered. Every other input yields exactly one
    /// reply, and upstream failures are answered with an empty answer
    /// section rather than an error.
    pub async fn resolve(&self, packet: &[u8]) -> Option<Resolution> {
        let start = Instant::now();

        let query = match DnsQuery::parse(packet) {
            Ok(query) => query,
            Err(ParseError::TooShort) => return None,
            // Answering a response invites a loop with whoever sent it.
            Err(ParseError::NotAQuery) => {
                debug!(len = packet.len(), "dropping inbound response");
                self.stats.record_malformed();
                return None;
            }
            Err(reason) => {
                let header = DnsHeader::parse(packet).ok()?;
                debug!(id = header.id, %reason, "rejecting malformed query");
                self.stats.record_malformed();

                return Some(Resolution::Rejected {
                    response: DnsResponse::format_error(&header).to_bytes(),
                    reason,
                });
            }
        };

        let action = self.process_query(&query);
        let (domain, blocked) = match &action {
            QueryAction::Blocked { domain, .. } => (domain.clone(), true),
            QueryAction::Forward { domain } => (domain.clone(), false),
        };
        self.telemetry.record(&domain, blocked);

        let mut upstream_failed = false;
        let response = match action {
            QueryAction::Blocked { addr, .. } => {
                self.stats.record_blocked(start.elapsed());
                DnsResponse::sinkhole(&query, addr, self.sinkhole_ttl)
            }
            QueryAction::Forward { .. } => match self.upstream.forward(&query, packet).await {
                Ok(reply) => {
                    self.stats.record_forwarded(start.elapsed());
                    DnsResponse::relayed(&query, reply)
                }
                Err(e) => {
                    warn!(
                        domain = %domain,
                        upstream = %self.upstream.addr(),
                        error = %e,
                        "upstream failed, answering without records"
                    );
                    self.stats.record_upstream_failure(start.elapsed());
                    upstream_failed = true;
                    DnsResponse::unanswered(&query)
                }
            },
        };

        Some(Resolution::Answered {
            response: response.to_bytes(),
            classification: QueryClassification {
                domain,
                blocked,
                answers: response.answers,
                upstream_failed,
            },
        })
    }

    /// Returns the number of domains in the blocklist.
    pub fn blocked_count(&self) -> usize {
        self.blocklist.len()
    }

    pub fn upstream(&self) -> &Upstream {
        &self.upstream
    }

    pub fn telemetry(&self) -> &Arc<Telemetry> {
        &self.telemetry
    }

    pub fn stats(&self) -> &Arc<Stats> {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::tests::{build_query, build_upstream_reply};
    use crate::dns::{RCODE_FORMERR, RCODE_NOERROR, RCODE_REFUSED, TYPE_A, answer_records};
    use crate::upstream::tests::spawn_upstream;
    use std::net::SocketAddr;
    use std::time::Duration;

    fn resolver(entries: &[(&str, Ipv4Addr)], upstream: SocketAddr, timeout: Duration) -> Resolver {
        Resolver::new(
            Blocklist::from_map(entries.iter().copied()),
            Upstream::new(upstream, timeout),
            Arc::new(Telemetry::new()),
            Arc::new(Stats::new()),
        )
    }

    async fn silent_upstream() -> SocketAddr {
        spawn_upstream(|_| Vec::new()).await
    }

    #[tokio::test]
    async fn process_query_classifies() {
        let resolver = resolver(
            &[("malware.example.", Ipv4Addr::new(10, 0, 0, 1))],
            silent_upstream().await,
            Duration::from_millis(50),
        );
        let blocked = DnsQuery::parse(&build_query(1, "malware.example", TYPE_A)).unwrap();
        let allowed = DnsQuery::parse(&build_query(2, "example.com", TYPE_A)).unwrap();

        assert_eq!(
            resolver.process_query(&blocked),
            QueryAction::Blocked {
                domain: "malware.example.".to_string(),
                addr: Ipv4Addr::new(10, 0, 0, 1),
            }
        );
        assert_eq!(
            resolver.process_query(&allowed),
            QueryAction::Forward {
                domain: "example.com.".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn blocked_query_gets_sinkhole_answer() {
        let resolver = resolver(
            &[("malware.example.", Ipv4Addr::new(10, 0, 0, 1))],
            silent_upstream().await,
            Duration::from_millis(50),
        )
        .with_sinkhole_ttl(3600);
        let packet = build_query(0x0A0A, "malware.example", TYPE_A);

        let resolution = resolver.resolve(&packet).await.unwrap();
        let records = answer_records(resolution.response()).unwrap();
        let header = DnsHeader::parse(resolution.response()).unwrap();

        assert_eq!(header.id, 0x0A0A);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].ipv4(), Some(Ipv4Addr::new(10, 0, 0, 1)));
        assert_eq!(records[0].ttl, 3600);

        let telemetry = resolver.telemetry();
        assert_eq!(telemetry.hits.get("malware.example."), 1);
        assert!(telemetry.blocked.contains("malware.example."));
        assert_eq!(telemetry.blocked.len(), 1);

        let Resolution::Answered { classification, .. } = resolution else {
            panic!("blocked query was rejected");
        };
        assert!(classification.blocked);
        assert_eq!(classification.answers.len(), 1);
    }

    #[tokio::test]
    async fn repeated_blocked_queries_flag_once() {
        let resolver = resolver(
            &[("malware.example.", Ipv4Addr::new(10, 0, 0, 1))],
            silent_upstream().await,
            Duration::from_millis(50),
        );
        let packet = build_query(1, "malware.example", TYPE_A);

        for _ in 0..3 {
            resolver.resolve(&packet).await.unwrap();
        }

        assert_eq!(resolver.telemetry().hits.get("malware.example."), 3);
        assert_eq!(resolver.telemetry().blocked.len(), 1);
    }

    #[tokio::test]
    async fn upstream_timeout_yields_empty_answer() {
        let resolver = resolver(&[], silent_upstream().await, Duration::from_millis(50));
        let packet = build_query(0x7777, "example.com", TYPE_A);

        let resolution = resolver.resolve(&packet).await.unwrap();
        let header = DnsHeader::parse(resolution.response()).unwrap();

        assert_eq!(header.id, 0x7777);
        assert_eq!(header.rcode(), RCODE_NOERROR);
        assert_eq!(header.qdcount, 1);
        assert_eq!(header.ancount, 0);
        assert_eq!(resolver.telemetry().hits.get("example.com."), 1);
        assert!(!resolver.telemetry().blocked.contains("example.com."));

        let Resolution::Answered { classification, .. } = resolution else {
            panic!("forwarded query was rejected");
        };
        assert!(!classification.blocked);
        assert!(classification.upstream_failed);
        assert!(classification.answers.is_empty());
    }

    #[tokio::test]
    async fn forwarded_query_relays_upstream_answers() {
        let upstream = spawn_upstream(|q| vec![build_upstream_reply(q, RCODE_NOERROR)]).await;
        let resolver = resolver(
            &[("malware.example.", Ipv4Addr::new(10, 0, 0, 1))],
            upstream,
            Duration::from_secs(2),
        );
        let packet = build_query(0x1111, "example.com", TYPE_A);

        let resolution = resolver.resolve(&packet).await.unwrap();
        let records = answer_records(resolution.response()).unwrap();

        assert_eq!(records.len(), 2);
        assert_eq!(records[1].ipv4(), Some(Ipv4Addr::new(93, 184, 216, 34)));
        assert_eq!(resolver.telemetry().hits.get("example.com."), 1);
        assert!(resolver.telemetry().blocked.is_empty());
    }

    #[tokio::test]
    async fn truncated_upstream_reply_keeps_tc() {
        let upstream = spawn_upstream(|q| {
            let mut reply = q.to_vec();
            reply[2] = 0x83; // QR, TC, RD
            reply[3] = 0x80;
            vec![reply]
        })
        .await;
        let resolver = resolver(&[], upstream, Duration::from_secs(2));
        let packet = build_query(0x2C2C, "big.example", TYPE_A);

        let resolution = resolver.resolve(&packet).await.unwrap();
        let header = DnsHeader::parse(resolution.response()).unwrap();

        assert_eq!(header.id, 0x2C2C);
        assert!(header.is_truncated());
        assert_eq!(header.ancount, 0);
    }

    #[tokio::test]
    async fn header_only_refusal_is_relayed() {
        let upstream = spawn_upstream(|q| {
            let mut reply = q[..12].to_vec();
            reply[2] = 0x81;
            reply[3] = 0x80 | RCODE_REFUSED;
            reply[5] = 0; // QDCOUNT
            vec![reply]
        })
        .await;
        let resolver = resolver(&[], upstream, Duration::from_secs(2));
        let packet = build_query(0x0505, "example.com", TYPE_A);

        let resolution = resolver.resolve(&packet).await.unwrap();
        let header = DnsHeader::parse(resolution.response()).unwrap();

        assert_eq!(header.rcode(), RCODE_REFUSED);
        assert_eq!(header.qdcount, 1);
        assert_eq!(header.ancount, 0);
        assert_eq!(resolver.telemetry().hits.get("example.com."), 1);

        let Resolution::Answered { classification, .. } = resolution else {
            panic!("forwarded query was rejected");
        };
        assert!(!classification.upstream_failed);
    }

    #[tokio::test]
    async fn inbound_response_is_dropped_uncounted() {
        let resolver = resolver(&[], silent_upstream().await, Duration::from_millis(50));
        let query = build_query(0x0D0D, "example.com", TYPE_A);
        let response = build_upstream_reply(&query, RCODE_NOERROR);

        assert!(resolver.resolve(&response).await.is_none());
        assert!(resolver.telemetry().hits.is_empty());
        assert_eq!(resolver.stats().snapshot_and_reset().malformed, 1);
    }

    #[tokio::test]
    async fn zero_question_query_is_rejected_uncounted() {
        let resolver = resolver(&[], silent_upstream().await, Duration::from_millis(50));
        let mut packet = build_query(0x0B0B, "example.com", TYPE_A);
        packet[5] = 0;

        let resolution = resolver.resolve(&packet).await.unwrap();
        let header = DnsHeader::parse(resolution.response()).unwrap();

        assert!(matches!(
            resolution,
            Resolution::Rejected {
                reason: ParseError::NoQuestion,
                ..
            }
        ));
        assert_eq!(header.id, 0x0B0B);
        assert_eq!(header.rcode(), RCODE_FORMERR);
        assert!(resolver.telemetry().hits.is_empty());
        assert_eq!(resolver.stats().snapshot_and_reset().malformed, 1);
    }

    #[tokio::test]
    async fn runt_datagram_is_dropped() {
        let resolver = resolver(&[], silent_upstream().await, Duration::from_millis(50));

        assert!(resolver.resolve(&[0x12, 0x34, 0x01]).await.is_none());
        assert!(resolver.telemetry().hits.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_queries_rank_by_volume() {
        let resolver = Arc::new(resolver(
            &[("malware.example.", Ipv4Addr::new(10, 0, 0, 1))],
            spawn_upstream(|q| vec![build_upstream_reply(q, RCODE_NOERROR)]).await,
            Duration::from_secs(2),
        ));

        let mut tasks = Vec::new();
        for (domain, count) in [("malware.example", 50), ("example.com", 30), ("example.org", 20)] {
            for i in 0..count {
                let resolver = resolver.clone();
                let packet = build_query(i, domain, TYPE_A);
                tasks.push(tokio::spawn(async move { resolver.resolve(&packet).await }));
            }
        }
        for task in tasks {
            assert!(task.await.unwrap().is_some());
        }

        let ranked = resolver.telemetry().ranked_snapshot();
        let order: Vec<_> = ranked.iter().map(|r| (r.domain.as_str(), r.hits, r.flagged)).collect();

        assert_eq!(
            order,
            vec![
                ("malware.example.", 50, true),
                ("example.com.", 30, false),
                ("example.org.", 20, false),
            ]
        );
    }
}
