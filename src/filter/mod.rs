//! DNS query filtering module.
//!
//! Decides whether a query is answered locally from the blocklist or
//! forwarded to the upstream resolver.

mod blocklist;

use std::net::Ipv4Addr;

pub use blocklist::Blocklist;

use crate::dns::DnsQuery;

/// Return the sinkhole address for a query, or `None` if it should be
/// forwarded to upstream.
///
/// Only the question name takes part in the match; the record type is
/// ignored and a blocked name always receives an A record.
pub fn filter_query(blocklist: &Blocklist, query: &DnsQuery) -> Option<Ipv4Addr> {
    blocklist.lookup(&query.domain)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::tests::build_query;

    #[test]
    fn filter_matches_any_record_type() {
        let blocklist = Blocklist::from_map([("malware.example", Ipv4Addr::new(10, 0, 0, 1))]);
        let aaaa = DnsQuery::parse(&build_query(1, "malware.example", 28)).unwrap();

        assert_eq!(
            filter_query(&blocklist, &aaaa),
            Some(Ipv4Addr::new(10, 0, 0, 1))
        );
    }

    #[test]
    fn filter_passes_unlisted_domains() {
        let blocklist = Blocklist::from_map([("malware.example", Ipv4Addr::new(10, 0, 0, 1))]);
        let query = DnsQuery::parse(&build_query(1, "example.com", 1)).unwrap();

        assert_eq!(filter_query(&blocklist, &query), None);
    }
}
