//! Wire protocol: authentication message layouts, vector batch framing
//! and the result encoding.
//!
//! ```text
//! client -> server   "user" salt[16] hash[56] ...     (compact, >= 76 bytes)
//!                    login[8] salt[16] hash[56]       (standard, == 80 bytes)
//! server -> client   "OK" | "ERR"
//! client -> server   u32 N, N x { u32 M, M x u16 }    (little-endian)
//! server -> client   u32 N, N x u16                   (little-endian)
//! ```

use crate::calc::saturating_sum;
use bytes::{Buf, BufMut, BytesMut};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, info};

/// Sent after a successful authentication
pub const AUTH_OK: &[u8] = b"OK";

/// Sent for any authentication or format failure
pub const AUTH_ERR: &[u8] = b"ERR";

/// Largest authentication message accepted in one exchange
pub const MAX_AUTH_MESSAGE: usize = 255;

/// Silence after a partial auth message that ends the message
pub const AUTH_IDLE_GAP: Duration = Duration::from_millis(250);

/// Prefix that selects the compact layout
pub const COMPACT_PREFIX: &[u8] = b"user";

/// Minimum length of a compact authentication message
pub const COMPACT_AUTH_LEN: usize = 76;

/// Exact length of a standard authentication message
pub const STANDARD_AUTH_LEN: usize = 80;

pub const SALT_LEN: usize = 16;
pub const HASH_LEN: usize = 56;

/// Maximum number of vectors in one batch
pub const MAX_VECTORS: u32 = 1000;

/// Maximum number of elements in one vector
pub const MAX_VECTOR_LEN: u32 = 1_000_000;

/// Protocol errors. Every one of them ends the connection.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Unsupported auth message format, length: {len}")]
    UnsupportedFormat { len: usize },
    #[error("Connection closed while reading {0}")]
    Truncated(&'static str),
    #[error("Too many vectors: {0}")]
    BatchTooLarge(u32),
    #[error("Vector {index} size is zero")]
    EmptyVector { index: u32 },
    #[error("Vector {index} size too large: {len}")]
    VectorTooLarge { index: u32, len: u32 },
    #[error("Deadline elapsed while {0}")]
    Timeout(&'static str),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Which authentication layout a message matched
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthLayout {
    /// `"user"` + salt + hash, trailing bytes ignored
    Compact,
    /// 8-byte login + salt + hash
    Standard,
}

/// Parsed authentication message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthRequest {
    pub layout: AuthLayout,
    pub login: Vec<u8>,
    pub salt: [u8; SALT_LEN],
    pub claimed_hash: Vec<u8>,
}

impl AuthRequest {
    fn new(layout: AuthLayout, login: &[u8], salt: &[u8], claimed_hash: &[u8]) -> Self {
        let mut salt_buf = [0u8; SALT_LEN];
        salt_buf.copy_from_slice(salt);
        Self {
            layout,
            login: login.to_vec(),
            salt: salt_buf,
            claimed_hash: claimed_hash.to_vec(),
        }
    }

    /// Login for log output
    pub fn login_lossy(&self) -> String {
        String::from_utf8_lossy(&self.login).into_owned()
    }
}

/// Classify an authentication message into the layouts it can be read
/// as, in the order they must be tried.
///
/// Compact comes first. An 80-byte message that starts with `user` also
/// matches the standard layout (a login padded to 8 bytes), so it yields
/// both readings: compact, then standard. Any other message yields at
/// most one.
pub fn parse_auth(message: &[u8]) -> Result<Vec<AuthRequest>, ProtocolError> {
    let mut candidates = Vec::with_capacity(2);

    if message.len() >= COMPACT_AUTH_LEN && message.starts_with(COMPACT_PREFIX) {
        let salt_end = COMPACT_PREFIX.len() + SALT_LEN;
        candidates.push(AuthRequest::new(
            AuthLayout::Compact,
            COMPACT_PREFIX,
            &message[COMPACT_PREFIX.len()..salt_end],
            &message[salt_end..salt_end + HASH_LEN],
        ));
    }

    if message.len() == STANDARD_AUTH_LEN {
        candidates.push(AuthRequest::new(
            AuthLayout::Standard,
            &message[..8],
            &message[8..24],
            &message[24..80],
        ));
    }

    if candidates.is_empty() {
        return Err(ProtocolError::UnsupportedFormat {
            len: message.len(),
        });
    }
    Ok(candidates)
}

/// Whether the buffered bytes can already be classified without waiting
/// for more input.
pub fn auth_message_complete(buffer: &[u8]) -> bool {
    (buffer.len() >= COMPACT_AUTH_LEN && buffer.starts_with(COMPACT_PREFIX))
        || buffer.len() >= STANDARD_AUTH_LEN
}

/// Read one authentication message.
///
/// Partial reads are accumulated until the buffer matches a layout, the
/// peer stops sending, or `deadline` elapses. Once some bytes have arrived,
/// a gap of [`AUTH_IDLE_GAP`] without more input also ends the message.
/// Whatever arrived by then is returned for classification. An empty
/// result is an error.
pub async fn read_auth_message<R>(
    reader: &mut R,
    deadline: Duration,
) -> Result<BytesMut, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut buffer = BytesMut::with_capacity(MAX_AUTH_MESSAGE);
    let deadline = Instant::now() + deadline;

    while !auth_message_complete(&buffer) {
        let remaining = (MAX_AUTH_MESSAGE - buffer.len()) as u64;
        let mut limited = (&mut *reader).take(remaining);
        let wait_until = if buffer.is_empty() {
            deadline
        } else {
            deadline.min(Instant::now() + AUTH_IDLE_GAP)
        };

        match timeout_at(wait_until, limited.read_buf(&mut buffer)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(_)) => {}
            Ok(Err(e)) => return Err(e.into()),
            Err(_) if buffer.is_empty() => {
                return Err(ProtocolError::Timeout("waiting for auth message"))
            }
            Err(_) => break,
        }
    }

    if buffer.is_empty() {
        return Err(ProtocolError::Truncated("auth message"));
    }
    Ok(buffer)
}

async fn read_exact_within<R>(
    reader: &mut R,
    buf: &mut [u8],
    deadline: Duration,
    what: &'static str,
) -> Result<(), ProtocolError>
where
    R: AsyncRead + Unpin,
{
    match timeout(deadline, reader.read_exact(buf)).await {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            Err(ProtocolError::Truncated(what))
        }
        Ok(Err(e)) => Err(e.into()),
        Err(_) => Err(ProtocolError::Timeout(what)),
    }
}

async fn read_u32_le<R>(
    reader: &mut R,
    deadline: Duration,
    what: &'static str,
) -> Result<u32, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut raw = [0u8; 4];
    read_exact_within(reader, &mut raw, deadline, what).await?;
    Ok(u32::from_le_bytes(raw))
}

/// Read a vector batch and sum each vector as it arrives.
///
/// Any error discards the sums computed so far; the batch is all or nothing.
pub async fn read_batch<R>(
    reader: &mut R,
    deadline: Duration,
) -> Result<Vec<u16>, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let count = read_u32_le(reader, deadline, "vector count").await?;
    info!(count, "Processing vectors");
    if count > MAX_VECTORS {
        return Err(ProtocolError::BatchTooLarge(count));
    }

    let mut sums = Vec::with_capacity(count as usize);
    let mut raw = BytesMut::new();

    for index in 1..=count {
        let len = read_u32_le(reader, deadline, "vector size").await?;
        if len == 0 {
            return Err(ProtocolError::EmptyVector { index });
        }
        if len > MAX_VECTOR_LEN {
            return Err(ProtocolError::VectorTooLarge { index, len });
        }

        raw.clear();
        raw.resize(len as usize * 2, 0);
        read_exact_within(reader, &mut raw, deadline, "vector data").await?;

        let mut cursor = &raw[..];
        let vector: Vec<u16> = (0..len).map(|_| cursor.get_u16_le()).collect();
        let sum = saturating_sum(&vector);
        debug!(index, len, sum, "Vector summed");
        sums.push(sum);
    }

    Ok(sums)
}

/// Encode a result batch: count followed by one sum per vector.
pub fn encode_results(sums: &[u16]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(4 + sums.len() * 2);
    buf.put_u32_le(sums.len() as u32);
    for &sum in sums {
        buf.put_u16_le(sum);
    }
    buf
}

/// Write `data` and flush, bounded by `deadline`.
pub async fn write_within<W>(
    writer: &mut W,
    data: &[u8],
    deadline: Duration,
) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    let write = async {
        writer.write_all(data).await?;
        writer.flush().await
    };
    match timeout(deadline, write).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(ProtocolError::Timeout("writing response")),
    }
}

/// Write the encoded result batch.
pub async fn write_results<W>(
    writer: &mut W,
    sums: &[u16],
    deadline: Duration,
) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    write_within(writer, &encode_results(sums), deadline).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::io::Builder;

    const DEADLINE: Duration = Duration::from_secs(5);

    fn standard_message(login: &[u8; 8]) -> Vec<u8> {
        let mut msg = login.to_vec();
        msg.extend_from_slice(b"0123456789abcdef");
        msg.extend_from_slice(&[b'A'; HASH_LEN]);
        msg
    }

    fn frame(vectors: &[&[u16]]) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u32_le(vectors.len() as u32);
        for vector in vectors {
            buf.put_u32_le(vector.len() as u32);
            for &v in *vector {
                buf.put_u16_le(v);
            }
        }
        buf.to_vec()
    }

    #[test]
    fn test_parse_standard_layout() {
        let msg = standard_message(b"admin   ");
        let candidates = parse_auth(&msg).unwrap();
        assert_eq!(candidates.len(), 1);

        let request = &candidates[0];
        assert_eq!(request.layout, AuthLayout::Standard);
        assert_eq!(request.login, b"admin   ");
        assert_eq!(&request.salt, b"0123456789abcdef");
        assert_eq!(request.claimed_hash, vec![b'A'; HASH_LEN]);
    }

    #[test]
    fn test_parse_compact_layout() {
        let mut msg = b"user".to_vec();
        msg.extend_from_slice(b"fedcba9876543210");
        msg.extend_from_slice(&[b'b'; HASH_LEN]);
        let candidates = parse_auth(&msg).unwrap();
        assert_eq!(candidates.len(), 1);

        let request = &candidates[0];
        assert_eq!(request.layout, AuthLayout::Compact);
        assert_eq!(request.login, b"user");
        assert_eq!(&request.salt, b"fedcba9876543210");
        assert_eq!(request.claimed_hash, vec![b'b'; HASH_LEN]);
    }

    #[test]
    fn test_compact_ignores_trailing_bytes() {
        let mut msg = b"user".to_vec();
        msg.extend_from_slice(&[7u8; SALT_LEN]);
        msg.extend_from_slice(&[b'c'; HASH_LEN]);
        msg.extend_from_slice(b"trailing junk");
        let candidates = parse_auth(&msg).unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].layout, AuthLayout::Compact);
        assert_eq!(candidates[0].claimed_hash, vec![b'c'; HASH_LEN]);
    }

    #[test]
    fn test_padded_user_login_reads_both_layouts() {
        // 80 bytes starting with "user": compact first, then standard.
        let msg = standard_message(b"user    ");
        let candidates = parse_auth(&msg).unwrap();
        assert_eq!(candidates.len(), 2);

        assert_eq!(candidates[0].layout, AuthLayout::Compact);
        assert_eq!(candidates[0].login, b"user");
        assert_eq!(&candidates[0].salt, b"    0123456789ab");

        assert_eq!(candidates[1].layout, AuthLayout::Standard);
        assert_eq!(candidates[1].login, b"user    ");
        assert_eq!(&candidates[1].salt, b"0123456789abcdef");
        assert_eq!(candidates[1].claimed_hash, vec![b'A'; HASH_LEN]);
    }

    #[test]
    fn test_unsupported_formats() {
        for len in [0, 10, 75, 79, 81, 200] {
            let msg = vec![b'x'; len];
            assert!(matches!(
                parse_auth(&msg),
                Err(ProtocolError::UnsupportedFormat { len: l }) if l == len
            ));
        }

        let mut short_user = b"user".to_vec();
        short_user.resize(75, b'0');
        assert!(parse_auth(&short_user).is_err());
    }

    #[test]
    fn test_auth_message_complete() {
        assert!(!auth_message_complete(b"user"));
        assert!(auth_message_complete(&[b'u'; 80]));
        assert!(!auth_message_complete(&[b'u'; 79]));

        let mut compact = b"user".to_vec();
        compact.resize(76, b'0');
        assert!(auth_message_complete(&compact));
    }

    #[test]
    fn test_encode_results() {
        let encoded = encode_results(&[15, 65535]);
        assert_eq!(&encoded[..], &[2, 0, 0, 0, 15, 0, 0xff, 0xff]);
        assert_eq!(&encode_results(&[])[..], &[0, 0, 0, 0]);
    }

    #[tokio::test]
    async fn test_read_auth_message_partial_reads() {
        let msg = standard_message(b"user    ");
        let mut mock = Builder::new()
            .read(&msg[..30])
            .read(&msg[30..60])
            .read(&msg[60..])
            .build();

        let buffer = read_auth_message(&mut mock, DEADLINE).await.unwrap();
        assert_eq!(&buffer[..], &msg[..]);
    }

    #[tokio::test]
    async fn test_read_auth_message_stops_at_compact() {
        let mut msg = b"user".to_vec();
        msg.resize(COMPACT_AUTH_LEN, b'1');
        let mut mock = Builder::new().read(&msg).build();

        let buffer = read_auth_message(&mut mock, DEADLINE).await.unwrap();
        assert_eq!(buffer.len(), COMPACT_AUTH_LEN);
    }

    #[tokio::test]
    async fn test_read_auth_message_ends_after_idle_gap() {
        let (mut client, mut server) = tokio::io::duplex(512);
        client.write_all(b"hello").await.unwrap();

        // The client keeps the stream open; the long deadline must not apply.
        let started = std::time::Instant::now();
        let buffer = read_auth_message(&mut server, Duration::from_secs(30))
            .await
            .unwrap();
        assert_eq!(&buffer[..], b"hello");
        assert!(started.elapsed() < Duration::from_secs(5));
        drop(client);
    }

    #[tokio::test]
    async fn test_read_auth_message_joins_prompt_fragments() {
        let msg = standard_message(b"user    ");
        let (mut client, mut server) = tokio::io::duplex(512);
        let fragments = msg.clone();
        let writer = tokio::spawn(async move {
            for chunk in fragments.chunks(20) {
                client.write_all(chunk).await.unwrap();
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            client
        });

        let buffer = read_auth_message(&mut server, DEADLINE).await.unwrap();
        assert_eq!(&buffer[..], &msg[..]);
        drop(writer.await.unwrap());
    }

    #[tokio::test]
    async fn test_read_auth_message_short_then_eof() {
        let mut mock = Builder::new().read(b"hello").build();
        let buffer = read_auth_message(&mut mock, DEADLINE).await.unwrap();
        assert_eq!(&buffer[..], b"hello");
        assert!(parse_auth(&buffer).is_err());
    }

    #[tokio::test]
    async fn test_read_auth_message_empty() {
        let mut mock = Builder::new().build();
        let result = read_auth_message(&mut mock, DEADLINE).await;
        assert!(matches!(result, Err(ProtocolError::Truncated(_))));
    }

    #[tokio::test]
    async fn test_read_auth_message_capped() {
        let data = vec![b'z'; 400];
        let mut mock = Builder::new().read(&data[..MAX_AUTH_MESSAGE]).build();
        let buffer = read_auth_message(&mut mock, DEADLINE).await.unwrap();
        assert_eq!(buffer.len(), MAX_AUTH_MESSAGE);
    }

    #[tokio::test]
    async fn test_read_batch() {
        let data = frame(&[&[1, 2, 3, 4, 5], &[65535, 1]]);
        let mut mock = Builder::new().read(&data[..7]).read(&data[7..]).build();
        let sums = read_batch(&mut mock, DEADLINE).await.unwrap();
        assert_eq!(sums, vec![15, 65535]);
    }

    #[tokio::test]
    async fn test_read_empty_batch() {
        let data = frame(&[]);
        let mut mock = Builder::new().read(&data).build();
        assert!(read_batch(&mut mock, DEADLINE).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_batch_too_large() {
        let mut mock = Builder::new().read(&1001u32.to_le_bytes()).build();
        let result = read_batch(&mut mock, DEADLINE).await;
        assert!(matches!(result, Err(ProtocolError::BatchTooLarge(1001))));
    }

    #[tokio::test]
    async fn test_batch_at_limit_accepted() {
        let one: &[u16] = &[1];
        let vectors = vec![one; MAX_VECTORS as usize];
        let data = frame(&vectors);
        let mut mock = Builder::new().read(&data).build();

        let sums = read_batch(&mut mock, DEADLINE).await.unwrap();
        assert_eq!(sums.len(), 1000);
        assert!(sums.iter().all(|&sum| sum == 1));
    }

    #[tokio::test]
    async fn test_vector_at_limit_accepted() {
        let vector = vec![1u16; MAX_VECTOR_LEN as usize];
        let data = frame(&[&vector]);
        let mut mock = Builder::new().read(&data).build();

        let sums = read_batch(&mut mock, DEADLINE).await.unwrap();
        assert_eq!(sums, vec![u16::MAX]);
    }

    #[tokio::test]
    async fn test_empty_vector_discards_batch() {
        let mut data = frame(&[&[1, 2]]);
        data[..4].copy_from_slice(&2u32.to_le_bytes());
        data.extend_from_slice(&0u32.to_le_bytes());
        let mut mock = Builder::new().read(&data).build();

        let result = read_batch(&mut mock, DEADLINE).await;
        assert!(matches!(result, Err(ProtocolError::EmptyVector { index: 2 })));
    }

    #[tokio::test]
    async fn test_vector_too_large() {
        let mut data = 1u32.to_le_bytes().to_vec();
        data.extend_from_slice(&1_000_001u32.to_le_bytes());
        let mut mock = Builder::new().read(&data).build();

        let result = read_batch(&mut mock, DEADLINE).await;
        assert!(matches!(
            result,
            Err(ProtocolError::VectorTooLarge { index: 1, len: 1_000_001 })
        ));
    }

    #[tokio::test]
    async fn test_truncated_vector_data() {
        let data = frame(&[&[1, 2, 3]]);
        let mut mock = Builder::new().read(&data[..data.len() - 1]).build();
        let result = read_batch(&mut mock, DEADLINE).await;
        assert!(matches!(result, Err(ProtocolError::Truncated("vector data"))));
    }

    #[tokio::test]
    async fn test_truncated_count() {
        let mut mock = Builder::new().read(&[1, 0]).build();
        let result = read_batch(&mut mock, DEADLINE).await;
        assert!(matches!(result, Err(ProtocolError::Truncated("vector count"))));
    }

    #[tokio::test]
    async fn test_write_results() {
        let mut mock = Builder::new().write(&[1, 0, 0, 0, 42, 0]).build();
        write_results(&mut mock, &[42], DEADLINE).await.unwrap();
    }
}
