//! Schema 4 exchanges.
//!
//! ```text
//! canFormat: -> 1 | path | ff ff ff ff
//!            <- answer (1 = formattable) | ff ff ff ff
//! format:    -> 2 | path | content | ff ff ff ff
//!            <- 0                 | ff ff ff ff   (no change)
//!               1 | formatted     | ff ff ff ff
//!               2 | error message | ff ff ff ff
//! ```
//!
//! Strings go through the chunked transfer in both directions.

use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::ServiceError;
use crate::models::FormatResult;
use crate::transport::WireStream;

const CHECK_COMMAND: u32 = 1;
const FORMAT_COMMAND: u32 = 2;

const RESPONSE_NO_CHANGE: u32 = 0;
const RESPONSE_FORMATTED: u32 = 1;
const RESPONSE_ERROR: u32 = 2;

/// Ask whether the daemon can format `path`.
pub async fn can_format<R, W>(stream: &mut WireStream<R, W>, path: &str) -> Result<bool, ServiceError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    stream.writer.write_int(CHECK_COMMAND).await?;
    stream.write_string_chunked(path).await?;
    stream.writer.write_success().await?;

    let answer = stream.reader.read_int().await?;
    stream.reader.read_and_assert_success().await?;
    Ok(answer == 1)
}

/// Format the whole file.
pub async fn format<R, W>(
    stream: &mut WireStream<R, W>,
    path: &str,
    content: &str,
) -> Result<FormatResult, ServiceError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    stream.writer.write_int(FORMAT_COMMAND).await?;
    stream.write_string_chunked(path).await?;
    stream.write_string_chunked(content).await?;
    stream.writer.write_success().await?;

    let result = match stream.reader.read_int().await? {
        RESPONSE_NO_CHANGE => FormatResult::unchanged(),
        RESPONSE_FORMATTED => FormatResult::formatted(stream.read_string_chunked().await?),
        RESPONSE_ERROR => FormatResult::failed(stream.read_string_chunked().await?),
        other => {
            return Err(ServiceError::ProtocolViolation(format!(
                "Unknown format response code {}",
                other
            )))
        }
    };
    stream.reader.read_and_assert_success().await?;
    Ok(result)
}
