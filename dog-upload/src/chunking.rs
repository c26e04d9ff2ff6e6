use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;

use crate::{backend::BoxStream, ByteStream, Chunk, ChunkDescriptor, UploadCtx, UploadError, UploadResult};

/// Stream of chunks produced by [`ChunkSplitter::split`]
pub type ChunkStream = BoxStream<UploadResult<Chunk>>;

/// Regroups an input byte stream into chunks of at most `max_chunk_bytes`
pub struct ChunkSplitter;

impl ChunkSplitter {
    /// Split `source` into chunks.
    ///
    /// Every chunk except possibly the last holds exactly `max_chunk_bytes`.
    /// An empty source yields no chunks. Cancellation is checked before each
    /// chunk is started; a started chunk is either completed or the stream
    /// ends with an error, so a partially filled chunk is never yielded
    /// except at end of input.
    pub fn split(ctx: &UploadCtx, source: ByteStream, max_chunk_bytes: usize) -> ChunkStream {
        let ctx = ctx.clone();
        let max_chunk_bytes = max_chunk_bytes.max(1);

        Box::pin(async_stream::stream! {
            let mut source = source;
            let mut carry = Bytes::new();
            let mut sequence_number = 0u64;
            let mut exhausted = false;

            loop {
                if carry.is_empty() && exhausted {
                    return;
                }
                if ctx.is_cancelled() {
                    yield Err(UploadError::Cancelled);
                    return;
                }

                let mut buffer = BytesMut::with_capacity(max_chunk_bytes.min(carry.len().max(8 * 1024)));
                let take = carry.len().min(max_chunk_bytes);
                buffer.extend_from_slice(&carry.split_to(take));

                while buffer.len() < max_chunk_bytes && !exhausted {
                    match source.next().await {
                        Some(Ok(mut bytes)) => {
                            let room = max_chunk_bytes - buffer.len();
                            if bytes.len() > room {
                                carry = bytes.split_off(room);
                            }
                            buffer.extend_from_slice(&bytes);
                        }
                        Some(Err(e)) => {
                            yield Err(UploadError::from(e));
                            return;
                        }
                        None => exhausted = true,
                    }
                }

                if buffer.is_empty() {
                    return;
                }

                let data = buffer.freeze();
                yield Ok(Chunk {
                    descriptor: ChunkDescriptor {
                        sequence_number,
                        byte_length: data.len(),
                    },
                    data,
                });
                sequence_number += 1;
            }
        })
    }

    /// Pass chunks through until their total would exceed `max_total_bytes`.
    ///
    /// The chunk that crosses the limit is replaced by an `InvalidState`
    /// error and the stream ends there.
    pub fn limit(chunks: ChunkStream, max_total_bytes: u64) -> ChunkStream {
        Box::pin(async_stream::stream! {
            let mut chunks = chunks;
            let mut total = 0u64;

            while let Some(chunk) = chunks.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        yield Err(e);
                        return;
                    }
                };

                total += chunk.len() as u64;
                if total > max_total_bytes {
                    yield Err(UploadError::invalid_state(format!(
                        "Upload would exceed its declared length by {} bytes",
                        total - max_total_bytes
                    )));
                    return;
                }
                yield Ok(chunk);
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;
    use proptest::prelude::*;

    fn source_from(parts: Vec<Vec<u8>>) -> ByteStream {
        Box::pin(stream::iter(parts.into_iter().map(|p| Ok::<_, std::io::Error>(Bytes::from(p)))))
    }

    async fn collect(stream: ChunkStream) -> Vec<UploadResult<Chunk>> {
        stream.collect().await
    }

    #[tokio::test]
    async fn ten_bytes_by_four() {
        let ctx = UploadCtx::new();
        let chunks = collect(ChunkSplitter::split(&ctx, source_from(vec![(0..10).collect()]), 4)).await;

        let sizes: Vec<usize> = chunks.iter().map(|c| c.as_ref().unwrap().len()).collect();
        assert_eq!(sizes, vec![4, 4, 2]);
        let sequence: Vec<u64> = chunks
            .iter()
            .map(|c| c.as_ref().unwrap().descriptor.sequence_number)
            .collect();
        assert_eq!(sequence, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn empty_source_yields_nothing() {
        let ctx = UploadCtx::new();
        let chunks = collect(ChunkSplitter::split(&ctx, source_from(vec![]), 4)).await;
        assert!(chunks.is_empty());

        let chunks = collect(ChunkSplitter::split(&ctx, source_from(vec![vec![], vec![]]), 4)).await;
        assert!(chunks.is_empty());
    }

    #[tokio::test]
    async fn cancellation_stops_between_chunks() {
        let ctx = UploadCtx::new();
        let mut chunks = ChunkSplitter::split(&ctx, source_from(vec![vec![1; 12]]), 4);

        assert_eq!(chunks.next().await.unwrap().unwrap().len(), 4);
        ctx.cancel.cancel();
        assert!(chunks.next().await.unwrap().unwrap_err().is_cancelled());
        assert!(chunks.next().await.is_none());
    }

    #[tokio::test]
    async fn source_error_aborts_without_partial_chunk() {
        let ctx = UploadCtx::new();
        let source: ByteStream = Box::pin(stream::iter(vec![
            Ok(Bytes::from_static(b"abcd")),
            Ok(Bytes::from_static(b"ef")),
            Err(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "client went away")),
        ]));

        let chunks = collect(ChunkSplitter::split(&ctx, source, 4)).await;
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].as_ref().unwrap().data, Bytes::from_static(b"abcd"));
        assert!(matches!(chunks[1], Err(UploadError::Io { .. })));
    }

    #[tokio::test]
    async fn limit_stops_at_the_crossing_chunk() {
        let ctx = UploadCtx::new();
        let chunks = ChunkSplitter::split(&ctx, source_from(vec![vec![7; 10]]), 4);
        let chunks = collect(ChunkSplitter::limit(chunks, 6)).await;

        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].as_ref().unwrap().len(), 4);
        assert!(matches!(chunks[1], Err(UploadError::InvalidState { .. })));

        let exact = ChunkSplitter::split(&ctx, source_from(vec![vec![7; 8]]), 4);
        let exact = collect(ChunkSplitter::limit(exact, 8)).await;
        assert!(exact.iter().all(|c| c.is_ok()));
    }

    proptest! {
        #[test]
        fn chunks_reproduce_input(
            parts in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 0..64), 0..16),
            max in 1usize..40,
        ) {
            let input: Vec<u8> = parts.iter().flatten().copied().collect();
            let chunks = tokio_test::block_on(async {
                collect(ChunkSplitter::split(&UploadCtx::new(), source_from(parts), max)).await
            });

            let chunks: Vec<Chunk> = chunks.into_iter().map(|c| c.unwrap()).collect();
            prop_assert_eq!(chunks.len(), input.len().div_ceil(max));
            if let Some((last, full)) = chunks.split_last() {
                prop_assert!(full.iter().all(|c| c.len() == max));
                prop_assert!(last.len() >= 1 && last.len() <= max);
            }
            let joined: Vec<u8> = chunks.iter().flat_map(|c| c.data.iter().copied()).collect();
            prop_assert_eq!(joined, input);
        }
    }
}
