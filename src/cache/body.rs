//! Bounded response buffering shared by the cache and the token stage.

use axum::body::Body;
use bytes::{Bytes, BytesMut};
use futures::{StreamExt, stream};
use http_body_util::BodyExt;

/// A body read up to a byte limit.
pub enum BufferedBody {
    /// The whole body fit within the limit.
    Complete(Bytes),
    /// The limit was exceeded. Replays the bytes already read, then the unread rest.
    Overflow(Body),
}

/// Read `body` into memory unless it grows past `limit` bytes.
///
/// Trailers are dropped.
pub async fn buffer_body(mut body: Body, limit: usize) -> Result<BufferedBody, axum::Error> {
    let mut buffer = BytesMut::new();
    while let Some(frame) = body.frame().await {
        let Ok(data) = frame?.into_data() else {
            continue;
        };
        buffer.extend_from_slice(&data);
        if buffer.len() > limit {
            let prefix = buffer.freeze();
            let replay = stream::once(async move { Ok::<_, axum::Error>(prefix) })
                .chain(body.into_data_stream());
            return Ok(BufferedBody::Overflow(Body::from_stream(replay)));
        }
    }
    Ok(BufferedBody::Complete(buffer.freeze()))
}

#[cfg(test)]
mod tests {
    use std::io;

    use super::*;

    fn chunked(chunks: &[&'static str]) -> Body {
        let chunks: Vec<Result<Bytes, io::Error>> = chunks
            .iter()
            .map(|chunk| Ok(Bytes::from_static(chunk.as_bytes())))
            .collect();
        Body::from_stream(stream::iter(chunks))
    }

    #[tokio::test]
    async fn small_bodies_are_buffered_whole() {
        let buffered = buffer_body(chunked(&["<p>", "hi", "</p>"]), 16)
            .await
            .expect("buffer");
        match buffered {
            BufferedBody::Complete(bytes) => assert_eq!(bytes, Bytes::from_static(b"<p>hi</p>")),
            BufferedBody::Overflow(_) => panic!("body fits the limit"),
        }
    }

    #[tokio::test]
    async fn overflowing_bodies_replay_every_byte() {
        let buffered = buffer_body(chunked(&["abcd", "efgh", "ijkl"]), 6)
            .await
            .expect("buffer");
        let BufferedBody::Overflow(body) = buffered else {
            panic!("body exceeds the limit");
        };
        let bytes = axum::body::to_bytes(body, usize::MAX).await.expect("replay");
        assert_eq!(bytes, Bytes::from_static(b"abcdefghijkl"));
    }

    #[tokio::test]
    async fn stream_errors_are_reported() {
        let chunks: Vec<Result<Bytes, io::Error>> = vec![
            Ok(Bytes::from_static(b"<p>")),
            Err(io::Error::other("connection reset")),
        ];
        let result = buffer_body(Body::from_stream(stream::iter(chunks)), 1024).await;
        assert!(result.is_err());
    }
}
