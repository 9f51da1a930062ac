//! RESP request parsing
//!
//! Requests arrive in two shapes: the bulk-array form (`*<argc>\r\n` followed
//! by `argc` bulk strings) and the inline form (one line, split on
//! whitespace). One peeked byte picks the path. Malformed frames surface as
//! [`ProtocolError`]s and are connection-fatal; only a clean EOF between
//! frames reads as `None`.

use crate::error::ProtocolError;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

/// Upper bound on a single protocol line (inline command or length header).
const MAX_LINE_LEN: usize = 64 * 1024;
/// Upper bound on one bulk argument.
const MAX_BULK_LEN: usize = 512 * 1024 * 1024;
/// Upper bound on the number of arguments in one request.
const MAX_ARRAY_LEN: usize = 1024 * 1024;

/// Read one command, either form. `Ok(None)` means the peer closed the
/// connection at a frame boundary.
pub async fn read_command<R>(r: &mut R) -> Result<Option<Vec<Vec<u8>>>, ProtocolError>
where
    R: AsyncBufRead + Unpin,
{
    let first = {
        let buf = r.fill_buf().await.map_err(|_| ProtocolError::UnexpectedEof)?;
        match buf.first() {
            None => return Ok(None),
            Some(&b) => b,
        }
    };

    if first != b'*' {
        return read_inline_command(r).await.map(Some);
    }

    let argc = read_array_header(r).await?;
    let mut argv = Vec::with_capacity(argc);
    for _ in 0..argc {
        argv.push(read_bulk_string(r).await?);
    }
    Ok(Some(argv))
}

/// One line, fields split on ASCII whitespace.
async fn read_inline_command<R>(r: &mut R) -> Result<Vec<Vec<u8>>, ProtocolError>
where
    R: AsyncBufRead + Unpin,
{
    let line = read_line(r).await?;
    Ok(line
        .split(|b| b.is_ascii_whitespace())
        .filter(|field| !field.is_empty())
        .map(|field| field.to_vec())
        .collect())
}

/// `*<argc>\r\n`
async fn read_array_header<R>(r: &mut R) -> Result<usize, ProtocolError>
where
    R: AsyncBufRead + Unpin,
{
    let line = read_line(r).await?;
    if line.first() != Some(&b'*') {
        return Err(ProtocolError::InvalidMultibulk);
    }
    let argc = parse_len(&line[1..]).ok_or(ProtocolError::InvalidMultibulk)?;
    if argc > MAX_ARRAY_LEN {
        return Err(ProtocolError::InvalidMultibulk);
    }
    Ok(argc)
}

/// `$<len>\r\n<data>\r\n`
async fn read_bulk_string<R>(r: &mut R) -> Result<Vec<u8>, ProtocolError>
where
    R: AsyncBufRead + Unpin,
{
    let line = read_line(r).await?;
    if line.first() != Some(&b'$') {
        return Err(ProtocolError::InvalidBulkLength);
    }
    let len = parse_len(&line[1..]).ok_or(ProtocolError::InvalidBulkLength)?;
    if len > MAX_BULK_LEN {
        return Err(ProtocolError::InvalidBulkLength);
    }

    let mut data = vec![0u8; len + 2];
    r.read_exact(&mut data)
        .await
        .map_err(|_| ProtocolError::UnexpectedEof)?;
    if &data[len..] != b"\r\n" {
        return Err(ProtocolError::MissingCrlf);
    }
    data.truncate(len);
    Ok(data)
}

/// One `\n`-terminated line with the trailing `\r\n` (or `\n`) stripped.
async fn read_line<R>(r: &mut R) -> Result<Vec<u8>, ProtocolError>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    let n = r
        .take((MAX_LINE_LEN + 2) as u64)
        .read_until(b'\n', &mut line)
        .await
        .map_err(|_| ProtocolError::UnexpectedEof)?;
    if n == 0 || line.last() != Some(&b'\n') {
        if line.len() > MAX_LINE_LEN {
            return Err(ProtocolError::LineTooLong);
        }
        return Err(ProtocolError::UnexpectedEof);
    }
    line.pop();
    if line.last() == Some(&b'\r') {
        line.pop();
    }
    Ok(line)
}

fn parse_len(digits: &[u8]) -> Option<usize> {
    if digits.is_empty() {
        return None;
    }
    std::str::from_utf8(digits)
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tokio::io::BufReader;

    async fn parse(input: &[u8]) -> Result<Option<Vec<Vec<u8>>>, ProtocolError> {
        let mut reader = BufReader::new(Cursor::new(input.to_vec()));
        read_command(&mut reader).await
    }

    #[tokio::test]
    async fn test_bulk_array_form() {
        let cmd = parse(b"*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$1\r\nv\r\n")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(cmd, vec![b"SET".to_vec(), b"k".to_vec(), b"v".to_vec()]);
    }

    #[tokio::test]
    async fn test_inline_form() {
        let cmd = parse(b"PING\r\n").await.unwrap().unwrap();
        assert_eq!(cmd, vec![b"PING".to_vec()]);

        let cmd = parse(b"  SET   k    v  \r\n").await.unwrap().unwrap();
        assert_eq!(cmd, vec![b"SET".to_vec(), b"k".to_vec(), b"v".to_vec()]);
    }

    #[tokio::test]
    async fn test_empty_inline_line() {
        let cmd = parse(b"\r\n").await.unwrap().unwrap();
        assert!(cmd.is_empty());
    }

    #[tokio::test]
    async fn test_binary_safe_bulk() {
        let cmd = parse(b"*2\r\n$4\r\nECHO\r\n$3\r\na\x00b\r\n")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(cmd[1], b"a\x00b".to_vec());
    }

    #[tokio::test]
    async fn test_eof_at_boundary() {
        assert_eq!(parse(b"").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_eof_mid_frame() {
        assert_eq!(
            parse(b"*2\r\n$3\r\nGET\r\n").await,
            Err(ProtocolError::UnexpectedEof)
        );
    }

    #[tokio::test]
    async fn test_bad_bulk_header() {
        assert_eq!(
            parse(b"*1\r\n%3\r\nGET\r\n").await,
            Err(ProtocolError::InvalidBulkLength)
        );
        assert_eq!(
            parse(b"*1\r\n$abc\r\n").await,
            Err(ProtocolError::InvalidBulkLength)
        );
    }

    #[tokio::test]
    async fn test_missing_crlf_after_bulk() {
        assert_eq!(
            parse(b"*1\r\n$3\r\nGETxx").await,
            Err(ProtocolError::MissingCrlf)
        );
    }

    #[tokio::test]
    async fn test_pipelined_commands() {
        let input = b"*1\r\n$4\r\nPING\r\n*1\r\n$4\r\nPING\r\n";
        let mut reader = BufReader::new(Cursor::new(input.to_vec()));
        assert_eq!(
            read_command(&mut reader).await.unwrap().unwrap(),
            vec![b"PING".to_vec()]
        );
        assert_eq!(
            read_command(&mut reader).await.unwrap().unwrap(),
            vec![b"PING".to_vec()]
        );
        assert_eq!(read_command(&mut reader).await.unwrap(), None);
    }
}
