//! DNS messages: header, question, resource records.
//!
//! Parsing tolerates compression pointers in names (answers from public
//! resolvers use them); names we produce are written uncompressed except
//! for the answer owner name, which points back at the question.

use super::{DnsError, Result};
use bytes::{Buf, BufMut, BytesMut};
use std::io::Cursor;

/// Query/response bit.
pub const FLAG_QR: u16 = 0x8000;
/// Authoritative answer.
pub const FLAG_AA: u16 = 0x0400;
/// Truncated response.
pub const FLAG_TC: u16 = 0x0200;
/// Recursion desired.
pub const FLAG_RD: u16 = 0x0100;
/// Recursion available.
pub const FLAG_RA: u16 = 0x0080;

pub const RCODE_NOERROR: u16 = 0;
pub const RCODE_REFUSED: u16 = 5;

/// Compression pointer to the question name at offset 12.
const QUESTION_NAME_POINTER: [u8; 2] = [0xc0, 0x0c];

/// Message header (12 bytes).
#[derive(Debug, Clone, Default)]
pub struct Header {
    pub id: u16,
    pub flags: u16,
    pub qdcount: u16,
    pub ancount: u16,
    pub nscount: u16,
    pub arcount: u16,
}

impl Header {
    pub fn new_query(id: u16) -> Header {
        Header {
            id,
            flags: FLAG_RD,
            qdcount: 1,
            ..Header::default()
        }
    }

    pub fn new_response(id: u16, rcode: u16, ancount: u16) -> Header {
        Header {
            id,
            flags: FLAG_QR | FLAG_AA | rcode,
            qdcount: 1,
            ancount,
            ..Header::default()
        }
    }

    pub fn parse(buf: &mut Cursor<&[u8]>) -> Result<Header> {
        if buf.remaining() < 12 {
            return Err(DnsError::InvalidMessage("header too short".into()));
        }
        Ok(Header {
            id: buf.get_u16(),
            flags: buf.get_u16(),
            qdcount: buf.get_u16(),
            ancount: buf.get_u16(),
            nscount: buf.get_u16(),
            arcount: buf.get_u16(),
        })
    }

    pub fn write(&self, buf: &mut BytesMut) {
        buf.put_u16(self.id);
        buf.put_u16(self.flags);
        buf.put_u16(self.qdcount);
        buf.put_u16(self.ancount);
        buf.put_u16(self.nscount);
        buf.put_u16(self.arcount);
    }

    pub fn is_response(&self) -> bool {
        self.flags & FLAG_QR != 0
    }

    pub fn is_truncated(&self) -> bool {
        self.flags & FLAG_TC != 0
    }

    pub fn rcode(&self) -> u16 {
        self.flags & 0x000f
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum QType {
    A = 1,
    Cname = 5,
    Txt = 16,
}

impl QType {
    pub fn from_u16(v: u16) -> Result<QType> {
        match v {
            1 => Ok(QType::A),
            5 => Ok(QType::Cname),
            16 => Ok(QType::Txt),
            other => Err(DnsError::UnsupportedType(other)),
        }
    }
}

pub const CLASS_IN: u16 = 1;

#[derive(Debug, Clone)]
pub struct Question {
    pub qname: String,
    pub qtype: u16,
    pub qclass: u16,
}

impl Question {
    pub fn new(qname: &str, qtype: QType) -> Question {
        Question {
            qname: qname.to_string(),
            qtype: qtype as u16,
            qclass: CLASS_IN,
        }
    }

    pub fn parse(full: &[u8], buf: &mut Cursor<&[u8]>) -> Result<Question> {
        let qname = read_name(full, buf)?;
        if buf.remaining() < 4 {
            return Err(DnsError::InvalidMessage("question too short".into()));
        }
        Ok(Question {
            qname,
            qtype: buf.get_u16(),
            qclass: buf.get_u16(),
        })
    }

    pub fn write(&self, buf: &mut BytesMut) -> Result<()> {
        write_name(&self.qname, buf)?;
        buf.put_u16(self.qtype);
        buf.put_u16(self.qclass);
        Ok(())
    }
}

/// One resource record.
#[derive(Debug, Clone)]
pub struct Record {
    pub rtype: u16,
    pub rclass: u16,
    pub ttl: u32,
    pub rdata: Vec<u8>,
}

impl Record {
    /// TXT record from pre-split character-strings.
    pub fn new_txt(strings: &[Vec<u8>]) -> Record {
        let mut rdata = Vec::new();
        for s in strings {
            rdata.push(s.len() as u8);
            rdata.extend_from_slice(s);
        }
        Record {
            rtype: QType::Txt as u16,
            rclass: CLASS_IN,
            ttl: 0,
            rdata,
        }
    }

    /// CNAME record pointing at `target`.
    pub fn new_cname(target: &str) -> Result<Record> {
        let mut rdata = BytesMut::new();
        write_name(target, &mut rdata)?;
        Ok(Record {
            rtype: QType::Cname as u16,
            rclass: CLASS_IN,
            ttl: 0,
            rdata: rdata.to_vec(),
        })
    }

    pub fn parse(full: &[u8], buf: &mut Cursor<&[u8]>) -> Result<Record> {
        let _owner = read_name(full, buf)?;
        if buf.remaining() < 10 {
            return Err(DnsError::InvalidMessage("record too short".into()));
        }
        let rtype = buf.get_u16();
        let rclass = buf.get_u16();
        let ttl = buf.get_u32();
        let rdlen = buf.get_u16() as usize;
        if buf.remaining() < rdlen {
            return Err(DnsError::InvalidMessage("truncated record data".into()));
        }
        let mut rdata = vec![0u8; rdlen];
        buf.copy_to_slice(&mut rdata);
        Ok(Record {
            rtype,
            rclass,
            ttl,
            rdata,
        })
    }

    pub fn write(&self, buf: &mut BytesMut) {
        buf.put_slice(&QUESTION_NAME_POINTER);
        buf.put_u16(self.rtype);
        buf.put_u16(self.rclass);
        buf.put_u32(self.ttl);
        buf.put_u16(self.rdata.len() as u16);
        buf.put_slice(&self.rdata);
    }

    /// Character-strings of a TXT record, length prefixes removed.
    pub fn txt_strings(&self) -> Result<Vec<Vec<u8>>> {
        if self.rtype != QType::Txt as u16 {
            return Err(DnsError::UnsupportedType(self.rtype));
        }
        let mut strings = Vec::new();
        let mut cursor = Cursor::new(&self.rdata[..]);
        while cursor.has_remaining() {
            let len = cursor.get_u8() as usize;
            if cursor.remaining() < len {
                return Err(DnsError::InvalidMessage("truncated TXT data".into()));
            }
            let mut chunk = vec![0u8; len];
            cursor.copy_to_slice(&mut chunk);
            strings.push(chunk);
        }
        Ok(strings)
    }

    /// Target name of a CNAME record. `full` is the enclosing message for
    /// pointer resolution.
    pub fn cname_target(&self, full: &[u8]) -> Result<String> {
        if self.rtype != QType::Cname as u16 {
            return Err(DnsError::UnsupportedType(self.rtype));
        }
        let mut cursor = Cursor::new(&self.rdata[..]);
        read_name_raw(full, &mut cursor)
    }
}

/// A complete query or response.
#[derive(Debug)]
pub struct Message {
    pub header: Header,
    pub questions: Vec<Question>,
    pub answers: Vec<Record>,
}

impl Message {
    pub fn new_query(id: u16, qname: &str, qtype: QType) -> Message {
        Message {
            header: Header::new_query(id),
            questions: vec![Question::new(qname, qtype)],
            answers: Vec::new(),
        }
    }

    /// Response answering `query` with one record.
    pub fn answer_to(query: &Message, record: Record) -> Message {
        let mut header = Header::new_response(query.header.id, RCODE_NOERROR, 1);
        header.flags |= query.header.flags & FLAG_RD;
        Message {
            header,
            questions: query.questions.clone(),
            answers: vec![record],
        }
    }

    /// Empty response with the given RCODE.
    pub fn refusal(query: &Message, rcode: u16) -> Message {
        let mut header = Header::new_response(query.header.id, rcode, 0);
        header.flags |= query.header.flags & FLAG_RD;
        header.qdcount = query.questions.len() as u16;
        Message {
            header,
            questions: query.questions.clone(),
            answers: Vec::new(),
        }
    }

    pub fn parse(data: &[u8]) -> Result<Message> {
        let mut cursor = Cursor::new(data);
        let header = Header::parse(&mut cursor)?;
        let mut questions = Vec::new();
        for _ in 0..header.qdcount {
            questions.push(Question::parse(data, &mut cursor)?);
        }
        let mut answers = Vec::new();
        for _ in 0..header.ancount {
            answers.push(Record::parse(data, &mut cursor)?);
        }
        Ok(Message {
            header,
            questions,
            answers,
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = BytesMut::with_capacity(512);
        self.header.write(&mut buf);
        for q in &self.questions {
            q.write(&mut buf)?;
        }
        for a in &self.answers {
            a.write(&mut buf);
        }
        Ok(buf.to_vec())
    }

    pub fn question_name(&self) -> Result<&str> {
        self.questions
            .first()
            .map(|q| q.qname.as_str())
            .ok_or_else(|| DnsError::InvalidMessage("no question".into()))
    }
}

fn read_name(full: &[u8], buf: &mut Cursor<&[u8]>) -> Result<String> {
    read_name_raw(full, buf)
}

/// Reads a possibly-compressed name. Plain labels come from `buf`; once a
/// pointer is seen the walk continues inside `full`.
fn read_name_raw(full: &[u8], buf: &mut Cursor<&[u8]>) -> Result<String> {
    let mut labels: Vec<String> = Vec::new();
    let mut jumps = 0usize;
    // After the first pointer the cursor no longer advances; chase within `full`.
    let mut pointer_pos: Option<usize> = None;

    loop {
        let len = match pointer_pos {
            None => {
                if !buf.has_remaining() {
                    return Err(DnsError::InvalidMessage("truncated name".into()));
                }
                buf.get_u8()
            }
            Some(ref mut pos) => {
                let b = *full
                    .get(*pos)
                    .ok_or_else(|| DnsError::InvalidMessage("pointer out of range".into()))?;
                *pos += 1;
                b
            }
        };

        if len == 0 {
            break;
        }

        if len & 0xc0 == 0xc0 {
            jumps += 1;
            if jumps > 8 {
                return Err(DnsError::InvalidMessage("pointer loop".into()));
            }
            let second = match pointer_pos {
                None => {
                    if !buf.has_remaining() {
                        return Err(DnsError::InvalidMessage("truncated pointer".into()));
                    }
                    buf.get_u8()
                }
                Some(ref mut pos) => {
                    let b = *full
                        .get(*pos)
                        .ok_or_else(|| DnsError::InvalidMessage("pointer out of range".into()))?;
                    *pos += 1;
                    b
                }
            };
            let offset = (((len & 0x3f) as usize) << 8) | second as usize;
            pointer_pos = Some(offset);
            continue;
        }

        let label_len = len as usize;
        let mut label = vec![0u8; label_len];
        match pointer_pos {
            None => {
                if buf.remaining() < label_len {
                    return Err(DnsError::InvalidMessage("truncated label".into()));
                }
                buf.copy_to_slice(&mut label);
            }
            Some(ref mut pos) => {
                let end = *pos + label_len;
                let slice = full
                    .get(*pos..end)
                    .ok_or_else(|| DnsError::InvalidMessage("truncated label".into()))?;
                label.copy_from_slice(slice);
                *pos = end;
            }
        }
        labels.push(
            String::from_utf8(label)
                .map_err(|_| DnsError::InvalidMessage("non-ASCII label".into()))?,
        );
        if labels.len() > 127 {
            return Err(DnsError::InvalidMessage("too many labels".into()));
        }
    }
    Ok(labels.join("."))
}

fn write_name(name: &str, buf: &mut BytesMut) -> Result<()> {
    for label in name.trim_end_matches('.').split('.') {
        let bytes = label.as_bytes();
        if bytes.is_empty() || bytes.len() > 63 {
            return Err(DnsError::InvalidMessage(format!(
                "bad label length {} in {name}",
                bytes.len()
            )));
        }
        buf.put_u8(bytes.len() as u8);
        buf.put_slice(bytes);
    }
    buf.put_u8(0);
    Ok(())
}

/// Length-prefixed framing used when DNS rides over a TCP stream.
pub fn frame_tcp(msg: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(msg.len() + 2);
    out.extend_from_slice(&(msg.len() as u16).to_be_bytes());
    out.extend_from_slice(msg);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_round_trip() {
        let msg = Message::new_query(0x1234, "abc.def.t.example.com", QType::Txt);
        let bytes = msg.to_bytes().unwrap();
        assert_eq!(&bytes[0..2], &[0x12, 0x34]);

        let parsed = Message::parse(&bytes).unwrap();
        assert!(!parsed.header.is_response());
        assert_eq!(parsed.question_name().unwrap(), "abc.def.t.example.com");
        assert_eq!(parsed.questions[0].qtype, QType::Txt as u16);
    }

    #[test]
    fn txt_answer_round_trip() {
        let query = Message::new_query(7, "x.t.example.com", QType::Txt);
        let strings = vec![b"hello ".to_vec(), b"world".to_vec()];
        let reply = Message::answer_to(&query, Record::new_txt(&strings));
        let bytes = reply.to_bytes().unwrap();

        let parsed = Message::parse(&bytes).unwrap();
        assert!(parsed.header.is_response());
        assert_eq!(parsed.header.ancount, 1);
        assert_eq!(parsed.answers[0].txt_strings().unwrap(), strings);
    }

    #[test]
    fn cname_answer_round_trip() {
        let query = Message::new_query(9, "y.t.example.com", QType::Cname);
        let target = "abcd.efgh.nonce.t.example.com";
        let reply = Message::answer_to(&query, Record::new_cname(target).unwrap());
        let bytes = reply.to_bytes().unwrap();

        let parsed = Message::parse(&bytes).unwrap();
        assert_eq!(parsed.answers[0].cname_target(&bytes).unwrap(), target);
    }

    #[test]
    fn refusal_carries_rcode() {
        let query = Message::new_query(5, "other.example.org", QType::A);
        let reply = Message::refusal(&query, RCODE_REFUSED);
        let parsed = Message::parse(&reply.to_bytes().unwrap()).unwrap();
        assert_eq!(parsed.header.rcode(), RCODE_REFUSED);
        assert_eq!(parsed.header.ancount, 0);
    }

    #[test]
    fn compressed_owner_name_is_tolerated() {
        // Answer owner names we emit are pointers to offset 12.
        let query = Message::new_query(3, "p.q.t.example.com", QType::Txt);
        let reply = Message::answer_to(&query, Record::new_txt(&[b"z".to_vec()]));
        let bytes = reply.to_bytes().unwrap();
        let parsed = Message::parse(&bytes).unwrap();
        assert_eq!(parsed.question_name().unwrap(), "p.q.t.example.com");
        assert_eq!(parsed.answers.len(), 1);
    }

    #[test]
    fn tcp_framing() {
        let framed = frame_tcp(&[1, 2, 3]);
        assert_eq!(framed, vec![0, 3, 1, 2, 3]);
    }

    #[test]
    fn oversized_label_rejected() {
        let long = "a".repeat(64);
        let mut buf = BytesMut::new();
        assert!(write_name(&long, &mut buf).is_err());
    }
}
