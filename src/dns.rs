//! DNS message parsing and construction.
//!
//! Only the parts of the wire format the sinkhole needs are handled: the
//! header, the first question of a query, and the answer section of an
//! upstream reply. Upstream answers are never re-encoded, their bytes are
//! carried into our reply as they arrived.

use std::net::Ipv4Addr;

use thiserror::Error;

pub const HEADER_LEN: usize = 12;

const MAX_LABEL_LEN: usize = 63;
const MAX_NAME_LEN: usize = 255;
const MAX_POINTER_HOPS: usize = 16;

pub const TYPE_A: u16 = 1;
pub const CLASS_IN: u16 = 1;

pub const RCODE_NOERROR: u8 = 0;
pub const RCODE_FORMERR: u8 = 1;
pub const RCODE_NXDOMAIN: u8 = 3;
pub const RCODE_REFUSED: u8 = 5;

const FLAG_QR: u16 = 0x8000;
const FLAG_TC: u16 = 0x0200;
const FLAG_RA: u16 = 0x0080;
/// Opcode, RD and CD are echoed back from the query.
const ECHOED_FLAGS: u16 = 0x7800 | 0x0100 | 0x0010;
const RCODE_MASK: u16 = 0x000F;

/// Why a message could not be used.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    #[error("message shorter than a DNS header")]
    TooShort,
    #[error("message carries no question")]
    NoQuestion,
    #[error("malformed domain name")]
    BadName,
    #[error("message truncated")]
    Truncated,
    #[error("message is not a response")]
    NotAResponse,
    #[error("message is a response, not a query")]
    NotAQuery,
    #[error("reply question count differs from the query")]
    QuestionMismatch,
}

/// The fixed 12-byte DNS header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DnsHeader {
    pub id: u16,
    pub flags: u16,
    pub qdcount: u16,
    pub ancount: u16,
    pub nscount: u16,
    pub arcount: u16,
}

impl DnsHeader {
    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        if data.len() < HEADER_LEN {
            return Err(ParseError::TooShort);
        }

        let word = |i: usize| u16::from_be_bytes([data[i], data[i + 1]]);

        Ok(Self {
            id: word(0),
            flags: word(2),
            qdcount: word(4),
            ancount: word(6),
            nscount: word(8),
            arcount: word(10),
        })
    }

    pub fn is_response(&self) -> bool {
        self.flags & FLAG_QR != 0
    }

    pub fn is_truncated(&self) -> bool {
        self.flags & FLAG_TC != 0
    }

    pub fn rcode(&self) -> u8 {
        (self.flags & RCODE_MASK) as u8
    }

    /// Flags for a reply to a message carrying this header.
    pub fn reply_flags(&self, rcode: u8) -> u16 {
        FLAG_QR | FLAG_RA | (self.flags & ECHOED_FLAGS) | (u16::from(rcode) & RCODE_MASK)
    }
}

/// A parsed DNS query (first question only).
#[derive(Debug, Clone)]
pub struct DnsQuery {
    pub header: DnsHeader,
    /// Queried name, trailing-dot terminated, case as received.
    pub domain: String,
    pub qtype: u16,
    pub qclass: u16,
    /// Raw question entry (QNAME, QTYPE, QCLASS) exactly as received.
    pub question: Vec<u8>,
}

impl DnsQuery {
    /// Parse a DNS query from raw bytes.
    ///
    /// Compression pointers are rejected in the question: a query has
    /// nothing earlier in the message they could legitimately point to.
    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        let header = DnsHeader::parse(data)?;
        if header.is_response() {
            return Err(ParseError::NotAQuery);
        }
        if header.qdcount == 0 {
            return Err(ParseError::NoQuestion);
        }

        let mut pos = HEADER_LEN;
        let mut domain = String::new();

        loop {
            let label_len = *data.get(pos).ok_or(ParseError::Truncated)? as usize;
            pos += 1;
            if label_len == 0 {
                break;
            }
            if label_len > MAX_LABEL_LEN {
                return Err(ParseError::BadName);
            }
            let label = data
                .get(pos..pos + label_len)
                .ok_or(ParseError::Truncated)?;
            let label = std::str::from_utf8(label).map_err(|_| ParseError::BadName)?;
            domain.push_str(label);
            domain.push('.');
            pos += label_len;

            if domain.len() > MAX_NAME_LEN {
                return Err(ParseError::BadName);
            }
        }

        if domain.is_empty() {
            domain.push('.');
        }

        let fixed = data.get(pos..pos + 4).ok_or(ParseError::Truncated)?;
        let qtype = u16::from_be_bytes([fixed[0], fixed[1]]);
        let qclass = u16::from_be_bytes([fixed[2], fixed[3]]);

        Ok(Self {
            header,
            domain,
            qtype,
            qclass,
            question: data[HEADER_LEN..pos + 4].to_vec(),
        })
    }

    pub fn id(&self) -> u16 {
        self.header.id
    }
}

/// Answer records in wire format, ready to follow a question section that
/// starts at offset 12.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AnswerSection {
    count: u16,
    bytes: Vec<u8>,
}

impl AnswerSection {
    pub fn empty() -> Self {
        Self::default()
    }

    /// A single A/IN record for the question name pointing at `addr`.
    pub fn sinkhole(addr: Ipv4Addr, ttl: u32) -> Self {
        let mut bytes = Vec::with_capacity(16);
        bytes.extend_from_slice(&[0xC0, 0x0C]); // Pointer to offset 12
        bytes.extend_from_slice(&TYPE_A.to_be_bytes());
        bytes.extend_from_slice(&CLASS_IN.to_be_bytes());
        bytes.extend_from_slice(&ttl.to_be_bytes());
        bytes.extend_from_slice(&4u16.to_be_bytes());
        bytes.extend_from_slice(&addr.octets());

        Self { count: 1, bytes }
    }

    pub fn len(&self) -> usize {
        self.count as usize
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

/// The parts of an upstream reply that get relayed to the client.
#[derive(Debug, Clone)]
pub struct UpstreamReply {
    pub rcode: u8,
    /// TC was set: the answers are incomplete.
    pub truncated: bool,
    /// Question entry as echoed by the upstream; `None` for header-only
    /// error replies.
    pub question: Option<Vec<u8>>,
    pub answers: AnswerSection,
}

impl UpstreamReply {
    /// Cut the question and answer sections out of an upstream response.
    ///
    /// Authority and additional sections are dropped. Name compression in
    /// the answers only ever points backwards, so truncating after the
    /// answer section keeps every pointer valid.
    pub fn parse(response: &[u8]) -> Result<Self, ParseError> {
        let header = DnsHeader::parse(response)?;
        if !header.is_response() {
            return Err(ParseError::NotAResponse);
        }
        if header.qdcount == 0 && header.ancount == 0 {
            return Ok(Self {
                rcode: header.rcode(),
                truncated: header.is_truncated(),
                question: None,
                answers: AnswerSection::empty(),
            });
        }
        if header.qdcount != 1 {
            return Err(ParseError::QuestionMismatch);
        }

        let mut pos = skip_name(response, HEADER_LEN)? + 4;
        if pos > response.len() {
            return Err(ParseError::Truncated);
        }
        let question = response[HEADER_LEN..pos].to_vec();
        let answers_start = pos;

        for _ in 0..header.ancount {
            pos = skip_name(response, pos)?;
            let fixed = response.get(pos..pos + 10).ok_or(ParseError::Truncated)?;
            let rdlength = u16::from_be_bytes([fixed[8], fixed[9]]) as usize;
            pos += 10 + rdlength;
            if pos > response.len() {
                return Err(ParseError::Truncated);
            }
        }

        Ok(Self {
            rcode: header.rcode(),
            truncated: header.is_truncated(),
            question: Some(question),
            answers: AnswerSection {
                count: header.ancount,
                bytes: response[answers_start..pos].to_vec(),
            },
        })
    }
}

/// A DNS response.
#[derive(Debug, Clone)]
pub struct DnsResponse {
    pub id: u16,
    pub flags: u16,
    /// Raw question entry; `None` for header-only error replies.
    pub question: Option<Vec<u8>>,
    pub answers: AnswerSection,
}

impl DnsResponse {
    /// Answer a query locally with `addr`.
    pub fn sinkhole(query: &DnsQuery, addr: Ipv4Addr, ttl: u32) -> Self {
        Self {
            id: query.id(),
            flags: query.header.reply_flags(RCODE_NOERROR),
            question: Some(query.question.clone()),
            answers: AnswerSection::sinkhole(addr, ttl),
        }
    }

    /// Relay an upstream reply under the query's id and question.
    pub fn relayed(query: &DnsQuery, reply: UpstreamReply) -> Self {
        // Relayed answers may point into the upstream's copy of the question,
        // so ours can only stand in for it when the layout is identical.
        let question = match reply.question {
            Some(question) if question.len() != query.question.len() => question,
            _ => query.question.clone(),
        };

        let mut flags = query.header.reply_flags(reply.rcode);
        if reply.truncated {
            flags |= FLAG_TC;
        }

        Self {
            id: query.id(),
            flags,
            question: Some(question),
            answers: reply.answers,
        }
    }

    /// A well-formed reply without answers, for when the upstream failed.
    pub fn unanswered(query: &DnsQuery) -> Self {
        Self {
            id: query.id(),
            flags: query.header.reply_flags(RCODE_NOERROR),
            question: Some(query.question.clone()),
            answers: AnswerSection::empty(),
        }
    }

    /// Header-only FORMERR reply for a query we refuse to look at.
    pub fn format_error(header: &DnsHeader) -> Self {
        Self {
            id: header.id,
            flags: header.reply_flags(RCODE_FORMERR),
            question: None,
            answers: AnswerSection::empty(),
        }
    }

    /// Encode the response to wire format bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let question_len = self.question.as_ref().map_or(0, Vec::len);
        let mut data = Vec::with_capacity(HEADER_LEN + question_len + self.answers.bytes.len());

        let qdcount: u16 = if self.question.is_some() { 1 } else { 0 };

        // Header
        data.extend_from_slice(&self.id.to_be_bytes());
        data.extend_from_slice(&self.flags.to_be_bytes());
        data.extend_from_slice(&qdcount.to_be_bytes());
        data.extend_from_slice(&self.answers.count.to_be_bytes());
        data.extend_from_slice(&[0x00, 0x00]); // NSCOUNT
        data.extend_from_slice(&[0x00, 0x00]); // ARCOUNT

        if let Some(question) = &self.question {
            data.extend_from_slice(question);
        }
        data.extend_from_slice(&self.answers.bytes);

        data
    }
}

/// A decoded resource record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsRecord {
    pub name: String,
    pub rtype: u16,
    pub class: u16,
    pub ttl: u32,
    pub rdata: Vec<u8>,
}

impl DnsRecord {
    /// The address carried by an A record.
    pub fn ipv4(&self) -> Option<Ipv4Addr> {
        if self.rtype != TYPE_A {
            return None;
        }
        let octets: [u8; 4] = self.rdata.as_slice().try_into().ok()?;
        Some(Ipv4Addr::from(octets))
    }
}

/// Decode the answer records of a complete message, expanding owner names.
pub fn answer_records(message: &[u8]) -> Result<Vec<DnsRecord>, ParseError> {
    let header = DnsHeader::parse(message)?;
    let mut pos = HEADER_LEN;

    for _ in 0..header.qdcount {
        pos = skip_name(message, pos)? + 4;
    }

    let mut records = Vec::with_capacity(header.ancount as usize);
    for _ in 0..header.ancount {
        let (name, next) = read_name(message, pos)?;
        pos = next;
        let fixed = message.get(pos..pos + 10).ok_or(ParseError::Truncated)?;
        let rtype = u16::from_be_bytes([fixed[0], fixed[1]]);
        let class = u16::from_be_bytes([fixed[2], fixed[3]]);
        let ttl = u32::from_be_bytes([fixed[4], fixed[5], fixed[6], fixed[7]]);
        let rdlength = u16::from_be_bytes([fixed[8], fixed[9]]) as usize;
        pos += 10;
        let rdata = message
            .get(pos..pos + rdlength)
            .ok_or(ParseError::Truncated)?
            .to_vec();
        pos += rdlength;

        records.push(DnsRecord {
            name,
            rtype,
            class,
            ttl,
            rdata,
        });
    }

    Ok(records)
}

/// Return the offset just past the name starting at `pos`.
fn skip_name(data: &[u8], mut pos: usize) -> Result<usize, ParseError> {
    loop {
        let b = *data.get(pos).ok_or(ParseError::Truncated)?;
        if b == 0 {
            return Ok(pos + 1);
        }
        if b & 0xC0 == 0xC0 {
            if pos + 1 >= data.len() {
                return Err(ParseError::Truncated);
            }
            return Ok(pos + 2);
        }
        if b & 0xC0 != 0 {
            return Err(ParseError::BadName);
        }
        pos += 1 + b as usize;
    }
}

/// Read a possibly compressed name, returning it and the offset past it.
fn read_name(data: &[u8], start: usize) -> Result<(String, usize), ParseError> {
    let mut name = String::new();
    let mut pos = start;
    let mut end = None;
    let mut hops = 0;

    loop {
        let b = *data.get(pos).ok_or(ParseError::Truncated)?;
        if b == 0 {
            pos += 1;
            break;
        }
        if b & 0xC0 == 0xC0 {
            let low = *data.get(pos + 1).ok_or(ParseError::Truncated)?;
            end.get_or_insert(pos + 2);
            hops += 1;
            if hops > MAX_POINTER_HOPS {
                return Err(ParseError::BadName);
            }
            pos = (usize::from(b & 0x3F) << 8) | usize::from(low);
            continue;
        }
        if b & 0xC0 != 0 {
            return Err(ParseError::BadName);
        }
        let len = b as usize;
        let label = data
            .get(pos + 1..pos + 1 + len)
            .ok_or(ParseError::Truncated)?;
        name.push_str(&String::from_utf8_lossy(label));
        name.push('.');
        pos += 1 + len;
    }

    if name.is_empty() {
        name.push('.');
    }

    Ok((name, end.unwrap_or(pos)))
}
