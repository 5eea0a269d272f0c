//! PROXY protocol (v1/v2) codec.
//!
//! Detects a HAProxy PROXY header at the front of a client stream without
//! consuming anything when none is present, parses both the text (v1) and
//! binary (v2) forms, and builds synthetic v2 headers for direct clients.
//! The exact byte span consumed for a detected header is kept in
//! [`ProxyHeader::raw`] so it can be passed through to the backend verbatim.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::BytesMut;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};

/// PROXY protocol v2 12-byte signature.
pub const PROXY_V2_SIGNATURE: [u8; 12] = [
    0x0D, 0x0A, 0x0D, 0x0A, 0x00, 0x0D, 0x0A, 0x51, 0x55, 0x49, 0x54, 0x0A,
];

/// ASCII prefix of a PROXY protocol v1 line.
const PROXY_V1_PREFIX: &[u8] = b"PROXY ";

/// Version 2, PROXY command (high nibble = version, low nibble = command).
const VERSION_COMMAND_PROXY: u8 = 0x21;

/// Version 2, LOCAL command.
const VERSION_COMMAND_LOCAL: u8 = 0x20;

/// Address family high nibbles.
const AF_INET: u8 = 0x10;
const AF_INET6: u8 = 0x20;

/// Transport protocol low nibble: STREAM (TCP).
const TRANSPORT_STREAM: u8 = 0x01;

/// v1 lines are at most ~108 bytes on the wire; allow some slack before
/// declaring the line unterminated.
const MAX_V1_LINE: usize = 256;

#[derive(Debug, Error)]
pub enum ProxyProtocolError {
    #[error("i/o while reading PROXY header: {0}")]
    Io(#[from] io::Error),

    #[error("malformed PROXY v1 header: {0}")]
    Malformed(String),

    #[error("unsupported PROXY v2 version {0}")]
    VersionMismatch(u8),
}

/// A parsed PROXY protocol header.
///
/// Addresses are absent when the upstream signalled `UNKNOWN` (v1) or a
/// LOCAL/unspec descriptor (v2), and when a v1 IP literal does not parse.
/// Ports default to 0 in the same situations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyHeader {
    pub version: u8,
    pub src_addr: Option<IpAddr>,
    pub dst_addr: Option<IpAddr>,
    pub src_port: u16,
    pub dst_port: u16,
    /// The complete raw header bytes, exactly as consumed from the stream.
    pub raw: Vec<u8>,
}

impl ProxyHeader {
    /// Source endpoint for diagnostics, when the header carried one.
    pub fn source(&self) -> Option<SocketAddr> {
        self.src_addr.map(|ip| SocketAddr::new(ip, self.src_port))
    }
}

/// Buffered reader with non-consuming peek over any [`AsyncRead`].
///
/// Bytes pulled in by [`peek`](Self::peek) stay in an internal buffer and
/// are yielded first by subsequent reads, so detection never loses data.
pub struct PeekReader<R> {
    inner: R,
    buf: BytesMut,
}

impl<R: AsyncRead + Unpin> PeekReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(512),
        }
    }

    /// Fill the internal buffer until `n` bytes are available, then return
    /// the buffered prefix. The slice is shorter than `n` only when the
    /// stream ended first.
    pub async fn peek(&mut self, n: usize) -> io::Result<&[u8]> {
        while self.buf.len() < n {
            if self.inner.read_buf(&mut self.buf).await? == 0 {
                break;
            }
        }
        Ok(&self.buf[..self.buf.len().min(n)])
    }

    /// Consume bytes up to and including the first `delim`. Returns `None`
    /// when the stream ends or `max` bytes pass without the delimiter;
    /// nothing is consumed in that case.
    async fn read_until_inclusive(&mut self, delim: u8, max: usize) -> io::Result<Option<Vec<u8>>> {
        let mut scanned = 0;
        loop {
            if let Some(pos) = self.buf[scanned..].iter().position(|&b| b == delim) {
                let end = scanned + pos + 1;
                return Ok(Some(self.buf.split_to(end).to_vec()));
            }
            scanned = self.buf.len();
            if scanned >= max {
                return Ok(None);
            }
            if self.inner.read_buf(&mut self.buf).await? == 0 {
                return Ok(None);
            }
        }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for PeekReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let me = self.get_mut();
        if !me.buf.is_empty() {
            let n = me.buf.len().min(out.remaining());
            out.put_slice(&me.buf.split_to(n));
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut me.inner).poll_read(cx, out)
    }
}

/// Peek at the stream and, if it starts with a PROXY v1 or v2 header,
/// consume and parse it. Returns `None` without consuming a single byte
/// when no header is present, including when the stream closes or errors
/// before even 6 bytes arrive (subsequent i/o surfaces the real failure).
pub async fn detect<R: AsyncRead + Unpin>(
    reader: &mut PeekReader<R>,
) -> Result<Option<ProxyHeader>, ProxyProtocolError> {
    // A connection that dies during the peek simply has no header; any
    // bytes that did arrive stay buffered for whoever reads next.
    let peeked = match reader.peek(16).await {
        Ok(peeked) => peeked.to_vec(),
        Err(_) => return Ok(None),
    };

    if peeked.len() >= 16 && peeked[..12] == PROXY_V2_SIGNATURE {
        return parse_v2(reader).await.map(Some);
    }
    if peeked.len() >= 6 && &peeked[..6] == PROXY_V1_PREFIX {
        return parse_v1(reader).await.map(Some);
    }

    Ok(None)
}

/// Parse a v1 line: `PROXY TCP4 <src> <dst> <srcport> <dstport>\r\n`
/// or `PROXY UNKNOWN\r\n`.
async fn parse_v1<R: AsyncRead + Unpin>(
    reader: &mut PeekReader<R>,
) -> Result<ProxyHeader, ProxyProtocolError> {
    let line = reader
        .read_until_inclusive(b'\n', MAX_V1_LINE)
        .await?
        .ok_or_else(|| ProxyProtocolError::Malformed("unterminated header line".into()))?;

    if line.len() < 2 || line[line.len() - 2] != b'\r' {
        return Err(ProxyProtocolError::Malformed(
            "header line does not end with CRLF".into(),
        ));
    }

    let text = String::from_utf8_lossy(&line[..line.len() - 2]).into_owned();
    let parts: Vec<&str> = text.split(' ').collect();

    let mut header = ProxyHeader {
        version: 1,
        src_addr: None,
        dst_addr: None,
        src_port: 0,
        dst_port: 0,
        raw: line,
    };

    if parts.len() == 2 && parts[1] == "UNKNOWN" {
        return Ok(header);
    }

    if parts.len() != 6 || parts[0] != "PROXY" || !matches!(parts[1], "TCP4" | "TCP6") {
        return Err(ProxyProtocolError::Malformed(format!(
            "unexpected field layout: {text:?}"
        )));
    }

    // Bad IP literals leave the address absent; bad port fields fall
    // back to 0. Some gateways send sloppy v1 lines.
    header.src_addr = parts[2].parse().ok();
    header.dst_addr = parts[3].parse().ok();
    header.src_port = parts[4].parse().unwrap_or(0);
    header.dst_port = parts[5].parse().unwrap_or(0);

    Ok(header)
}

/// Parse a v2 binary header: 16 fixed bytes then a length-prefixed
/// address block. TLVs inside the block are not interpreted but stay in
/// `raw` for verbatim passthrough.
async fn parse_v2<R: AsyncRead + Unpin>(
    reader: &mut PeekReader<R>,
) -> Result<ProxyHeader, ProxyProtocolError> {
    let mut fixed = [0u8; 16];
    reader.read_exact(&mut fixed).await?;

    let version = fixed[12] >> 4;
    if version != 2 {
        return Err(ProxyProtocolError::VersionMismatch(version));
    }
    // Low nibble of byte 12 is the command (LOCAL or PROXY); both are
    // accepted, the command only decides whether addresses mean anything.
    let family = fixed[13] >> 4;
    let addr_len = u16::from_be_bytes([fixed[14], fixed[15]]) as usize;

    let mut block = vec![0u8; addr_len];
    reader.read_exact(&mut block).await?;

    let mut header = ProxyHeader {
        version: 2,
        src_addr: None,
        dst_addr: None,
        src_port: 0,
        dst_port: 0,
        raw: Vec::with_capacity(16 + addr_len),
    };
    header.raw.extend_from_slice(&fixed);
    header.raw.extend_from_slice(&block);

    match family {
        0x1 if addr_len >= 12 => {
            let mut src = [0u8; 4];
            let mut dst = [0u8; 4];
            src.copy_from_slice(&block[0..4]);
            dst.copy_from_slice(&block[4..8]);
            header.src_addr = Some(IpAddr::from(src));
            header.dst_addr = Some(IpAddr::from(dst));
            header.src_port = u16::from_be_bytes([block[8], block[9]]);
            header.dst_port = u16::from_be_bytes([block[10], block[11]]);
        }
        0x2 if addr_len >= 36 => {
            let mut src = [0u8; 16];
            let mut dst = [0u8; 16];
            src.copy_from_slice(&block[0..16]);
            dst.copy_from_slice(&block[16..32]);
            header.src_addr = Some(IpAddr::from(src));
            header.dst_addr = Some(IpAddr::from(dst));
            header.src_port = u16::from_be_bytes([block[32], block[33]]);
            header.dst_port = u16::from_be_bytes([block[34], block[35]]);
        }
        // Unspec or unsupported family: valid header, no addresses.
        _ => {}
    }

    Ok(header)
}

/// Build a synthetic v2 header for a direct client, from the client's
/// remote address and the listener's local address.
///
/// Both-IPv4 pairs produce the 28-byte AF_INET form; anything involving
/// IPv6 (including mixed pairs) produces the 52-byte AF_INET6 form with
/// canonical 16-byte mapped addresses.
pub fn build_v2(src: SocketAddr, dst: SocketAddr) -> Vec<u8> {
    match (src.ip(), dst.ip()) {
        (IpAddr::V4(src_ip), IpAddr::V4(dst_ip)) => {
            let mut buf = Vec::with_capacity(28);
            buf.extend_from_slice(&PROXY_V2_SIGNATURE);
            buf.push(VERSION_COMMAND_PROXY);
            buf.push(AF_INET | TRANSPORT_STREAM);
            buf.extend_from_slice(&12u16.to_be_bytes());
            buf.extend_from_slice(&src_ip.octets());
            buf.extend_from_slice(&dst_ip.octets());
            buf.extend_from_slice(&src.port().to_be_bytes());
            buf.extend_from_slice(&dst.port().to_be_bytes());
            buf
        }
        (src_ip, dst_ip) => {
            let src_v6 = match src_ip {
                IpAddr::V4(v4) => v4.to_ipv6_mapped(),
                IpAddr::V6(v6) => v6,
            };
            let dst_v6 = match dst_ip {
                IpAddr::V4(v4) => v4.to_ipv6_mapped(),
                IpAddr::V6(v6) => v6,
            };
            let mut buf = Vec::with_capacity(52);
            buf.extend_from_slice(&PROXY_V2_SIGNATURE);
            buf.push(VERSION_COMMAND_PROXY);
            buf.push(AF_INET6 | TRANSPORT_STREAM);
            buf.extend_from_slice(&36u16.to_be_bytes());
            buf.extend_from_slice(&src_v6.octets());
            buf.extend_from_slice(&dst_v6.octets());
            buf.extend_from_slice(&src.port().to_be_bytes());
            buf.extend_from_slice(&dst.port().to_be_bytes());
            buf
        }
    }
}

/// 16-byte LOCAL header for when the connection's endpoints cannot be
/// read; carries no address information.
pub fn build_v2_local() -> Vec<u8> {
    let mut buf = Vec::with_capacity(16);
    buf.extend_from_slice(&PROXY_V2_SIGNATURE);
    buf.push(VERSION_COMMAND_LOCAL);
    buf.push(0x00);
    buf.extend_from_slice(&0u16.to_be_bytes());
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn detect_bytes(data: &[u8]) -> (Result<Option<ProxyHeader>, ProxyProtocolError>, Vec<u8>) {
        let mut reader = PeekReader::new(data);
        let result = detect(&mut reader).await;
        let mut rest = Vec::new();
        reader.read_to_end(&mut rest).await.unwrap();
        (result, rest)
    }

    fn v2_ipv4_header(src: [u8; 4], dst: [u8; 4], src_port: u16, dst_port: u16) -> Vec<u8> {
        let mut h = Vec::new();
        h.extend_from_slice(&PROXY_V2_SIGNATURE);
        h.push(0x21);
        h.push(0x11);
        h.extend_from_slice(&12u16.to_be_bytes());
        h.extend_from_slice(&src);
        h.extend_from_slice(&dst);
        h.extend_from_slice(&src_port.to_be_bytes());
        h.extend_from_slice(&dst_port.to_be_bytes());
        h
    }

    #[tokio::test]
    async fn detects_v2_and_preserves_payload() {
        let header = v2_ipv4_header([192, 168, 1, 100], [10, 0, 0, 1], 12345, 25565);
        let mut data = header.clone();
        data.extend_from_slice(b"MINECRAFT_HANDSHAKE_DATA_HERE");

        let (result, rest) = detect_bytes(&data).await;
        let parsed = result.unwrap().expect("v2 header expected");

        assert_eq!(parsed.version, 2);
        assert_eq!(parsed.src_addr, Some("192.168.1.100".parse().unwrap()));
        assert_eq!(parsed.dst_addr, Some("10.0.0.1".parse().unwrap()));
        assert_eq!(parsed.src_port, 12345);
        assert_eq!(parsed.dst_port, 25565);
        assert_eq!(parsed.raw, header);
        assert_eq!(rest, b"MINECRAFT_HANDSHAKE_DATA_HERE");
    }

    #[tokio::test]
    async fn detects_v1_and_preserves_payload() {
        let line = b"PROXY TCP4 192.168.1.50 10.0.0.1 54321 25565\r\n";
        let mut data = line.to_vec();
        data.extend_from_slice(b"MINECRAFT_DATA");

        let (result, rest) = detect_bytes(&data).await;
        let parsed = result.unwrap().expect("v1 header expected");

        assert_eq!(parsed.version, 1);
        assert_eq!(parsed.src_addr, Some("192.168.1.50".parse().unwrap()));
        assert_eq!(parsed.src_port, 54321);
        assert_eq!(parsed.dst_port, 25565);
        assert_eq!(parsed.raw, line.to_vec());
        assert_eq!(rest, b"MINECRAFT_DATA");
    }

    #[tokio::test]
    async fn non_header_stream_is_left_untouched() {
        // Start of a real Minecraft handshake for "localhost".
        let data = [
            0x10, 0x00, 0xFD, 0x05, 0x09, 0x6C, 0x6F, 0x63, 0x61, 0x6C, 0x68, 0x6F, 0x73, 0x74,
            0x63, 0xDD, 0x02,
        ];

        let (result, rest) = detect_bytes(&data).await;
        assert!(result.unwrap().is_none());
        assert_eq!(rest, data);
    }

    #[tokio::test]
    async fn short_stream_is_no_header() {
        let (result, rest) = detect_bytes(&[0x01, 0x02, 0x03]).await;
        assert!(result.unwrap().is_none());
        assert_eq!(rest, [0x01, 0x02, 0x03]);
    }

    /// Reader whose first poll fails with a real (non-EOF) i/o error.
    struct FailingReader;

    impl AsyncRead for FailingReader {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _out: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Poll::Ready(Err(io::Error::new(
                io::ErrorKind::ConnectionReset,
                "connection reset by peer",
            )))
        }
    }

    #[tokio::test]
    async fn peek_error_before_any_data_is_no_header() {
        let mut reader = PeekReader::new(FailingReader);
        assert!(detect(&mut reader).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn peek_error_after_a_few_bytes_is_no_header() {
        let mut reader = PeekReader::new((&b"PROX"[..]).chain(FailingReader));
        assert!(detect(&mut reader).await.unwrap().is_none());

        // The bytes that made it across are still there for the splice.
        let mut buf = [0u8; 4];
        reader.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"PROX");
    }

    #[tokio::test]
    async fn v1_unknown_has_no_addresses() {
        let (result, rest) = detect_bytes(b"PROXY UNKNOWN\r\nrest").await;
        let parsed = result.unwrap().unwrap();
        assert_eq!(parsed.version, 1);
        assert!(parsed.src_addr.is_none());
        assert!(parsed.dst_addr.is_none());
        assert_eq!(parsed.raw, b"PROXY UNKNOWN\r\n");
        assert_eq!(rest, b"rest");
    }

    #[tokio::test]
    async fn v1_without_crlf_is_malformed() {
        let (result, _) = detect_bytes(b"PROXY UNKNOWN\n").await;
        assert!(matches!(result, Err(ProxyProtocolError::Malformed(_))));
    }

    #[tokio::test]
    async fn v1_wrong_field_count_is_malformed() {
        let (result, _) = detect_bytes(b"PROXY TCP4 1.2.3.4 10.0.0.1 11111\r\n").await;
        assert!(matches!(result, Err(ProxyProtocolError::Malformed(_))));
    }

    #[tokio::test]
    async fn v1_unterminated_line_is_malformed() {
        let mut data = b"PROXY TCP4 ".to_vec();
        data.extend_from_slice(&vec![b'x'; MAX_V1_LINE]);
        let mut reader = PeekReader::new(&data[..]);
        assert!(matches!(
            detect(&mut reader).await,
            Err(ProxyProtocolError::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn v1_bad_port_defaults_to_zero() {
        let (result, _) = detect_bytes(b"PROXY TCP4 1.2.3.4 10.0.0.1 junk 25565\r\n").await;
        let parsed = result.unwrap().unwrap();
        assert_eq!(parsed.src_port, 0);
        assert_eq!(parsed.dst_port, 25565);
    }

    #[tokio::test]
    async fn v1_bad_ip_yields_absent_address() {
        let (result, _) = detect_bytes(b"PROXY TCP4 not-an-ip 10.0.0.1 11111 25565\r\n").await;
        let parsed = result.unwrap().unwrap();
        assert!(parsed.src_addr.is_none());
        assert_eq!(parsed.dst_addr, Some("10.0.0.1".parse().unwrap()));
        assert_eq!(parsed.src_port, 11111);
    }

    #[tokio::test]
    async fn v2_wrong_version_nibble_is_rejected() {
        let mut header = v2_ipv4_header([1, 2, 3, 4], [5, 6, 7, 8], 1, 2);
        header[12] = 0x31;
        let mut reader = PeekReader::new(&header[..]);
        assert!(matches!(
            detect(&mut reader).await,
            Err(ProxyProtocolError::VersionMismatch(3))
        ));
    }

    #[tokio::test]
    async fn v2_local_unspec_is_accepted_without_addresses() {
        let mut data = build_v2_local();
        data.extend_from_slice(b"after");

        let (result, rest) = detect_bytes(&data).await;
        let parsed = result.unwrap().unwrap();
        assert_eq!(parsed.version, 2);
        assert!(parsed.src_addr.is_none());
        assert_eq!(parsed.raw.len(), 16);
        assert_eq!(rest, b"after");
    }

    #[tokio::test]
    async fn v2_tlv_bytes_stay_in_raw() {
        let mut header = Vec::new();
        header.extend_from_slice(&PROXY_V2_SIGNATURE);
        header.push(0x21);
        header.push(0x11);
        // 12 bytes of addresses plus 5 bytes of TLV data.
        header.extend_from_slice(&17u16.to_be_bytes());
        header.extend_from_slice(&[192, 0, 2, 7]);
        header.extend_from_slice(&[10, 0, 0, 1]);
        header.extend_from_slice(&40000u16.to_be_bytes());
        header.extend_from_slice(&25565u16.to_be_bytes());
        header.extend_from_slice(&[0x04, 0x00, 0x02, 0xAA, 0xBB]);
        let mut data = header.clone();
        data.extend_from_slice(b"payload");

        let (result, rest) = detect_bytes(&data).await;
        let parsed = result.unwrap().unwrap();
        assert_eq!(parsed.src_addr, Some("192.0.2.7".parse().unwrap()));
        assert_eq!(parsed.src_port, 40000);
        assert_eq!(parsed.raw, header);
        assert_eq!(rest, b"payload");
    }

    #[tokio::test]
    async fn built_v4_header_round_trips() {
        let src: SocketAddr = "203.0.113.50:49152".parse().unwrap();
        let dst: SocketAddr = "10.0.0.1:25565".parse().unwrap();
        let header = build_v2(src, dst);
        assert_eq!(header.len(), 28);
        assert_eq!(header[12], 0x21);

        let (result, rest) = detect_bytes(&header).await;
        let parsed = result.unwrap().unwrap();
        assert_eq!(parsed.source(), Some(src));
        assert_eq!(parsed.dst_addr, Some(dst.ip()));
        assert_eq!(parsed.dst_port, dst.port());
        assert_eq!(parsed.raw, header);
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn built_v6_header_round_trips() {
        let src: SocketAddr = "[2001:db8::1]:49152".parse().unwrap();
        let dst: SocketAddr = "[2001:db8::2]:25565".parse().unwrap();
        let header = build_v2(src, dst);
        assert_eq!(header.len(), 52);

        let (result, _) = detect_bytes(&header).await;
        let parsed = result.unwrap().unwrap();
        assert_eq!(parsed.source(), Some(src));
    }

    #[tokio::test]
    async fn mixed_family_pair_is_emitted_as_ipv6() {
        let src: SocketAddr = "198.51.100.9:1000".parse().unwrap();
        let dst: SocketAddr = "[2001:db8::2]:25565".parse().unwrap();
        let header = build_v2(src, dst);
        assert_eq!(header.len(), 52);
        assert_eq!(header[13], 0x21);

        let (result, _) = detect_bytes(&header).await;
        let parsed = result.unwrap().unwrap();
        assert_eq!(
            parsed.src_addr,
            Some("::ffff:198.51.100.9".parse().unwrap())
        );
        assert_eq!(parsed.src_port, 1000);
        assert_eq!(parsed.dst_addr, Some(dst.ip()));
    }

    #[tokio::test]
    async fn raw_bytes_re_detect_structurally_equal() {
        let line = b"PROXY TCP6 2001:db8::1 2001:db8::2 1024 25565\r\n";
        let (first, _) = detect_bytes(line).await;
        let first = first.unwrap().unwrap();

        let (second, _) = detect_bytes(&first.raw).await;
        let second = second.unwrap().unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn peek_is_repeatable_and_non_consuming() {
        let data = b"PROXY UNKNOWN\r\n";
        let mut reader = PeekReader::new(&data[..]);
        assert_eq!(reader.peek(16).await.unwrap(), &data[..15]);
        assert_eq!(reader.peek(6).await.unwrap(), b"PROXY ");
        let mut rest = Vec::new();
        reader.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, data);
    }
}
